//! A negotiated, allocated and exported capture stream.
//!
//! `CaptureStream` owns the device handle together with the pool built on it,
//! so the device can only close after the pool has been torn down.

use std::os::fd::BorrowedFd;

use dmacam_core::errors::StreamError;
use dmacam_core::{BufferIndex, BufferState, CaptureConfig, DmacamError, FormatDescriptor};
use tracing::{debug, info, warn};

use crate::device::{DeviceHandle, DequeuedBuffer, VideoDevice};
use crate::negotiate::negotiate_format;
use crate::pool::BufferPool;

pub struct CaptureStream<D: VideoDevice> {
    pool: BufferPool,
    format: FormatDescriptor,
    handle: DeviceHandle<D>,
    released: bool,
}

impl<D: VideoDevice> CaptureStream<D> {
    /// Negotiate the configured format, allocate the pool and export every
    /// buffer. Streaming is not started.
    ///
    /// On failure everything acquired so far, including `handle`, is released.
    pub fn prepare(handle: DeviceHandle<D>, config: &CaptureConfig) -> Result<Self, DmacamError> {
        let format = negotiate_format(&handle, config.resolution, config.pixel_format.v4l2_fourcc())?;
        let pool = BufferPool::allocate(&handle, config.buffer_count)?;

        // From here on Drop frees the driver buffers on any failure.
        let mut stream = Self { pool, format, handle, released: false };
        stream.pool.check_capacity(stream.format.required_buffer_len())?;
        stream.pool.export_all(&stream.handle)?;

        info!(
            "Capture stream ready: {} {} × {} buffer(s)",
            stream.format.encoding,
            stream.format.granted.resolution(),
            stream.pool.len()
        );
        Ok(stream)
    }

    /// Enqueue every buffer and turn streaming on.
    pub fn start(&mut self) -> Result<(), StreamError> {
        if let Some(buf) = self.pool.buffers().iter().find(|b| !b.is_exported()) {
            return Err(StreamError::NotExported { index: buf.index });
        }
        self.pool.enqueue_all(&self.handle)?;
        self.pool.start_streaming(&self.handle)
    }

    pub fn stop(&mut self) -> Result<(), StreamError> {
        self.pool.stop_streaming(&self.handle)
    }

    pub fn is_streaming(&self) -> bool {
        self.pool.is_streaming()
    }

    /// Non-blocking: `Ok(None)` when no filled buffer is ready.
    pub fn reclaim(&mut self) -> Result<Option<DequeuedBuffer>, StreamError> {
        let done = self.pool.dequeue(&self.handle)?;
        if let Some(buf) = &done {
            if buf.is_corrupt() {
                warn!("Buffer {} (seq {}) flagged corrupt by driver", buf.index, buf.sequence);
            }
        }
        Ok(done)
    }

    /// Return a consumed buffer to the driver's fill queue.
    pub fn resubmit(&mut self, index: BufferIndex) -> Result<(), StreamError> {
        self.pool.queue(&self.handle, index)
    }

    pub fn handle(&self, index: BufferIndex) -> Result<BorrowedFd<'_>, StreamError> {
        let buf = self.pool.get(index).ok_or(StreamError::UnknownBuffer { index })?;
        buf.handle().ok_or(StreamError::NotExported { index })
    }

    pub fn state(&self, index: BufferIndex) -> Option<BufferState> {
        self.pool.state(index)
    }

    /// Buffers the driver currently owns.
    pub fn queued_count(&self) -> usize {
        self.pool.count_in(BufferState::Queued)
    }

    pub fn format(&self) -> &FormatDescriptor {
        &self.format
    }

    pub fn buffer_count(&self) -> usize {
        self.pool.len()
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn device(&self) -> &DeviceHandle<D> {
        &self.handle
    }

    /// Stop streaming and free the pool. The device stays open until drop.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.pool.release(&self.handle);
        debug!("Capture stream released");
    }
}

impl<D: VideoDevice> Drop for CaptureStream<D> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Call, ScriptedDevice};
    use dmacam_core::errors::{AllocationError, ExportError, FormatError};
    use dmacam_core::{FourCc, PixelEncoding, Resolution};

    fn config() -> CaptureConfig {
        CaptureConfig { buffer_count: 2, ..CaptureConfig::default() }
    }

    #[test]
    fn prepare_exports_every_buffer_without_streaming() {
        let dev = ScriptedDevice::new();
        let script = dev.script();
        let stream = CaptureStream::prepare(DeviceHandle::new(dev).unwrap(), &config()).unwrap();

        assert_eq!(stream.buffer_count(), 2);
        assert!(stream.handle(BufferIndex(0)).is_ok());
        assert!(stream.handle(BufferIndex(1)).is_ok());
        assert!(!stream.is_streaming());
        assert_eq!(script.lock().unwrap().count(|c| *c == Call::StreamOn), 0);
    }

    #[test]
    fn mismatch_closes_device_without_allocating() {
        let dev = ScriptedDevice::new();
        let script = dev.script();
        script.lock().unwrap().substitute_fourcc = Some(FourCc::new(b"YUYV"));

        let err = CaptureStream::prepare(DeviceHandle::new(dev).unwrap(), &config())
            .err()
            .expect("mismatch");
        assert!(matches!(err, DmacamError::Format(FormatError::Mismatch { .. })));

        let s = script.lock().unwrap();
        assert!(s.closed);
        assert_eq!(s.count(|c| matches!(c, Call::RequestBuffers(_))), 0);
    }

    #[test]
    fn export_failure_frees_buffers_and_closes_device() {
        let dev = ScriptedDevice::new();
        let script = dev.script();
        script.lock().unwrap().export_errno = Some(libc::ENOTTY);

        let err = CaptureStream::prepare(DeviceHandle::new(dev).unwrap(), &config())
            .err()
            .expect("export failure");
        assert!(matches!(err, DmacamError::Export(ExportError::Export { .. })));

        let s = script.lock().unwrap();
        assert!(s.closed);
        assert_eq!(s.count(|c| *c == Call::StreamOn), 0);
        assert_eq!(s.calls.last(), Some(&Call::Close));
        assert!(s.calls.contains(&Call::RequestBuffers(0)));
    }

    #[test]
    fn short_nv12_buffer_is_rejected_before_export() {
        let dev = ScriptedDevice::new();
        let script = dev.script();
        {
            let mut s = script.lock().unwrap();
            s.grant_resolution = Some(Resolution::new(640, 480));
            // Room for the luma plane only.
            s.buffer_length = Some(640 * 480);
        }
        let config = CaptureConfig { pixel_format: PixelEncoding::Nv12, ..config() };

        let err = CaptureStream::prepare(DeviceHandle::new(dev).unwrap(), &config)
            .err()
            .expect("short buffer");
        match err {
            DmacamError::Allocation(AllocationError::BufferTooSmall { length, required, .. }) => {
                assert_eq!(length, 640 * 480);
                assert_eq!(required, 640 * 720);
            }
            other => panic!("expected BufferTooSmall, got {other:?}"),
        }

        let s = script.lock().unwrap();
        assert_eq!(s.count(|c| matches!(c, Call::Export(_))), 0);
        assert!(s.calls.contains(&Call::RequestBuffers(0)));
        assert!(s.closed);
    }

    #[test]
    fn full_nv12_buffer_is_accepted() {
        let dev = ScriptedDevice::new();
        dev.script().lock().unwrap().grant_resolution = Some(Resolution::new(640, 480));
        let config = CaptureConfig { pixel_format: PixelEncoding::Nv12, ..config() };
        let stream = CaptureStream::prepare(DeviceHandle::new(dev).unwrap(), &config).unwrap();
        assert_eq!(stream.format().required_buffer_len(), 640 * 720);
    }

    #[test]
    fn start_enqueues_then_streams() {
        let dev = ScriptedDevice::new();
        let script = dev.script();
        let mut stream = CaptureStream::prepare(DeviceHandle::new(dev).unwrap(), &config()).unwrap();
        stream.start().unwrap();

        assert!(stream.is_streaming());
        assert_eq!(stream.state(BufferIndex(0)), Some(BufferState::Queued));
        assert_eq!(stream.state(BufferIndex(1)), Some(BufferState::Queued));

        let calls = script.lock().unwrap().calls.clone();
        let last_queue = calls.iter().rposition(|c| matches!(c, Call::Queue(_))).unwrap();
        let stream_on = calls.iter().position(|c| *c == Call::StreamOn).unwrap();
        assert!(last_queue < stream_on);
    }

    #[test]
    fn drop_tears_down_in_order() {
        let dev = ScriptedDevice::streaming();
        let script = dev.script();
        {
            let mut stream =
                CaptureStream::prepare(DeviceHandle::new(dev).unwrap(), &config()).unwrap();
            stream.start().unwrap();
            let done = stream.reclaim().unwrap().expect("auto-filled frame");
            stream.resubmit(done.index).unwrap();
        }
        let calls = script.lock().unwrap().calls.clone();
        let off = calls.iter().position(|c| *c == Call::StreamOff).unwrap();
        let free = calls.iter().position(|c| *c == Call::RequestBuffers(0)).unwrap();
        let close = calls.iter().position(|c| *c == Call::Close).unwrap();
        assert!(off < free && free < close);
    }

    #[test]
    fn corrupt_buffer_is_still_returned() {
        let dev = ScriptedDevice::streaming();
        dev.script().lock().unwrap().corrupt_frames = 1;
        let mut stream = CaptureStream::prepare(DeviceHandle::new(dev).unwrap(), &config()).unwrap();
        stream.start().unwrap();

        let done = stream.reclaim().unwrap().expect("frame");
        assert!(done.is_corrupt());
        assert_eq!(stream.state(done.index), Some(BufferState::Dequeued));
    }
}
