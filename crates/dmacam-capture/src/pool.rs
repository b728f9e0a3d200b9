//! Fixed pool of driver-allocated MMAP buffers, each exported as a dmabuf.
//!
//! ```text
//!             queue()            driver fills          dequeue()
//!  Unqueued ───────────► Queued ─────────────► (ready) ──────────► Dequeued
//!                          ▲                                          │
//!                          └──────────────── queue() ─────────────────┘
//! ```
//!
//! `stop_streaming` returns every buffer to `Unqueued`, as `VIDIOC_STREAMOFF`
//! does in the kernel.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use dmacam_core::errors::{AllocationError, ExportError, StreamError};
use dmacam_core::{BufferIndex, BufferState};
use tracing::{debug, info, warn};

use crate::device::{DeviceHandle, DequeuedBuffer, RequestBuffersError, VideoDevice};

/// One slot of the pool.
#[derive(Debug)]
pub struct CaptureBuffer {
    pub index: BufferIndex,
    pub state: BufferState,
    /// Buffer size in bytes as reported by `VIDIOC_QUERYBUF`.
    pub length: u32,
    pub offset: u32,
    /// Read-only dmabuf. Valid only while the device handle is open.
    handle: Option<OwnedFd>,
}

impl CaptureBuffer {
    pub fn handle(&self) -> Option<BorrowedFd<'_>> {
        self.handle.as_ref().map(|fd| fd.as_fd())
    }

    pub fn is_exported(&self) -> bool {
        self.handle.is_some()
    }
}

#[derive(Debug)]
pub struct BufferPool {
    buffers: Vec<CaptureBuffer>,
    streaming: bool,
    /// The driver holds buffers for this pool until `VIDIOC_REQBUFS(0)`.
    allocated: bool,
}

fn classify(count: u32, err: RequestBuffersError) -> AllocationError {
    if err.source.raw_os_error() == Some(libc::EINVAL) {
        AllocationError::StreamingUnsupported { source: err.source }
    } else {
        AllocationError::Request { count, source: err.source }
    }
}

impl BufferPool {
    /// Request `count` buffers. If the driver refuses the exact count but
    /// writes back a count it would accept, retry once with that count.
    pub fn allocate<D: VideoDevice>(
        handle: &DeviceHandle<D>,
        count: u32,
    ) -> Result<Self, AllocationError> {
        if count == 0 {
            return Err(AllocationError::NoBuffers { requested: 0 });
        }
        let device = handle.device();

        let granted = match device.request_buffers(count) {
            Ok(n) => n,
            Err(RequestBuffersError { suggested: Some(n), source }) => {
                warn!("VIDIOC_REQBUFS({count}) rejected ({source}); retrying with {n}");
                device.request_buffers(n).map_err(|e| classify(n, e))?
            }
            Err(e) => return Err(classify(count, e)),
        };

        if granted == 0 {
            return Err(AllocationError::NoBuffers { requested: count });
        }
        if granted != count {
            info!("Driver adjusted buffer count {count} → {granted}");
        }

        let mut pool = Self {
            buffers: Vec::with_capacity(granted as usize),
            streaming: false,
            allocated: true,
        };
        for i in 0..granted {
            let index = BufferIndex(i);
            let info = match device.query_buffer(index) {
                Ok(info) => info,
                Err(source) => {
                    pool.release(handle);
                    return Err(AllocationError::Query { index, source });
                }
            };
            debug!("Buffer {}: length={} offset=0x{:x}", index, info.length, info.offset);
            pool.buffers.push(CaptureBuffer {
                index,
                state: BufferState::Unqueued,
                length: info.length,
                offset: info.offset,
                handle: None,
            });
        }

        info!("V4L2 buffer count: {}", granted);
        Ok(pool)
    }

    /// Fail if any buffer is shorter than `required` bytes.
    pub fn check_capacity(&self, required: u64) -> Result<(), AllocationError> {
        match self.buffers.iter().find(|b| u64::from(b.length) < required) {
            Some(buf) => Err(AllocationError::BufferTooSmall {
                index: buf.index,
                length: buf.length,
                required,
            }),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn buffers(&self) -> &[CaptureBuffer] {
        &self.buffers
    }

    pub fn get(&self, index: BufferIndex) -> Option<&CaptureBuffer> {
        self.buffers.get(index.as_usize())
    }

    pub fn state(&self, index: BufferIndex) -> Option<BufferState> {
        self.get(index).map(|b| b.state)
    }

    /// Number of buffers currently in `state`.
    pub fn count_in(&self, state: BufferState) -> usize {
        self.buffers.iter().filter(|b| b.state == state).count()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    // MARK: - Export

    /// Export one buffer. Exporting an already exported buffer returns the
    /// existing handle.
    pub fn export<D: VideoDevice>(
        &mut self,
        handle: &DeviceHandle<D>,
        index: BufferIndex,
    ) -> Result<BorrowedFd<'_>, ExportError> {
        let buf = self
            .buffers
            .get_mut(index.as_usize())
            .ok_or(ExportError::UnknownBuffer { index })?;

        if buf.handle.is_none() {
            let fd = handle
                .device()
                .export_buffer(index)
                .map_err(|source| ExportError::Export { index, source })?;
            info!("Buffer {} exported as dmabuf", index);
            buf.handle = Some(fd);
        }
        buf.handle().ok_or(ExportError::UnknownBuffer { index })
    }

    pub fn export_all<D: VideoDevice>(&mut self, handle: &DeviceHandle<D>) -> Result<(), ExportError> {
        for i in 0..self.buffers.len() {
            self.export(handle, BufferIndex(i as u32))?;
        }
        Ok(())
    }

    pub fn handle(&self, index: BufferIndex) -> Option<BorrowedFd<'_>> {
        self.get(index).and_then(|b| b.handle())
    }

    // MARK: - Queueing

    /// Hand a buffer to the driver's fill queue (`Unqueued | Dequeued → Queued`).
    pub fn queue<D: VideoDevice>(
        &mut self,
        handle: &DeviceHandle<D>,
        index: BufferIndex,
    ) -> Result<(), StreamError> {
        let buf = self
            .buffers
            .get_mut(index.as_usize())
            .ok_or(StreamError::UnknownBuffer { index })?;

        if buf.state == BufferState::Queued {
            return Err(StreamError::InvalidTransition {
                index,
                from: BufferState::Queued,
                to: BufferState::Queued,
            });
        }
        handle
            .device()
            .queue_buffer(index)
            .map_err(|source| StreamError::Queue { index, source })?;
        buf.state = BufferState::Queued;
        Ok(())
    }

    /// Queue every buffer that has never been handed to the driver.
    pub fn enqueue_all<D: VideoDevice>(&mut self, handle: &DeviceHandle<D>) -> Result<(), StreamError> {
        let pending: Vec<BufferIndex> = self
            .buffers
            .iter()
            .filter(|b| b.state == BufferState::Unqueued)
            .map(|b| b.index)
            .collect();
        for index in pending {
            self.queue(handle, index)?;
        }
        Ok(())
    }

    /// Take the next filled buffer, or `None` if the driver has none ready.
    pub fn dequeue<D: VideoDevice>(
        &mut self,
        handle: &DeviceHandle<D>,
    ) -> Result<Option<DequeuedBuffer>, StreamError> {
        if !self.streaming {
            return Err(StreamError::NotStreaming);
        }
        let Some(done) = handle
            .device()
            .dequeue_buffer()
            .map_err(|source| StreamError::Dequeue { source })?
        else {
            return Ok(None);
        };

        let index = done.index;
        let buf = self
            .buffers
            .get_mut(index.as_usize())
            .ok_or(StreamError::UnknownBuffer { index })?;
        if buf.state != BufferState::Queued {
            return Err(StreamError::InvalidTransition {
                index,
                from: buf.state,
                to: BufferState::Dequeued,
            });
        }
        buf.state = BufferState::Dequeued;
        Ok(Some(done))
    }

    // MARK: - Streaming

    /// `VIDIOC_STREAMON`. No-op if already streaming.
    pub fn start_streaming<D: VideoDevice>(&mut self, handle: &DeviceHandle<D>) -> Result<(), StreamError> {
        if self.streaming {
            return Ok(());
        }
        handle
            .device()
            .stream_on()
            .map_err(|source| StreamError::StreamOn { source })?;
        self.streaming = true;
        info!("Camera streaming turned ON");
        Ok(())
    }

    /// `VIDIOC_STREAMOFF`. No-op if not streaming.
    pub fn stop_streaming<D: VideoDevice>(&mut self, handle: &DeviceHandle<D>) -> Result<(), StreamError> {
        if !self.streaming {
            return Ok(());
        }
        // The flag drops even on failure: a second STREAMOFF would not help.
        self.streaming = false;
        handle
            .device()
            .stream_off()
            .map_err(|source| StreamError::StreamOff { source })?;
        for buf in &mut self.buffers {
            buf.state = BufferState::Unqueued;
        }
        info!("Camera streaming turned OFF");
        Ok(())
    }

    /// Stop streaming, close every exported handle and free the driver's
    /// buffers. Failures are logged; teardown continues regardless.
    pub fn release<D: VideoDevice>(&mut self, handle: &DeviceHandle<D>) {
        if let Err(e) = self.stop_streaming(handle) {
            warn!("Teardown: {e}");
        }
        for buf in &mut self.buffers {
            buf.handle = None;
        }
        if self.allocated {
            self.allocated = false;
            match handle.device().request_buffers(0) {
                Ok(_) => debug!("Released {} driver buffers", self.buffers.len()),
                Err(e) => warn!("Teardown: VIDIOC_REQBUFS(0) failed: {}", e.source),
            }
        }
        self.buffers.clear();
    }
}
