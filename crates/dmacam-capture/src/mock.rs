//! In-memory [`VideoDevice`] for tests.
//!
//! Behaves like a vb2-backed capture driver closely enough for the pool and
//! capture-loop state machines: buffers move through a driver-side FIFO, a
//! queued buffer is only handed back once a frame is "captured", and
//! `VIDIOC_STREAMOFF` drops everything the driver held.

use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dmacam_core::{BufferIndex, FieldOrder, FourCc, FrameFormat, PixelEncoding, Resolution};

use crate::device::{BufferInfo, Capabilities, DequeuedBuffer, RequestBuffersError, VideoDevice};
use crate::sys;

/// Every device call in the order it was made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    QueryCap,
    SetFormat(FourCc),
    GetFormat,
    RequestBuffers(u32),
    QueryBuffer(u32),
    Export(u32),
    Queue(u32),
    /// `None` when nothing was ready.
    Dequeue(Option<u32>),
    StreamOn,
    StreamOff,
    Close,
}

#[derive(Debug)]
pub struct DeviceScript {
    pub caps: u32,
    pub card: String,

    /// Encoding the driver swaps in regardless of the request.
    pub substitute_fourcc: Option<FourCc>,
    /// Resolution the driver grants regardless of the request.
    pub grant_resolution: Option<Resolution>,
    pub stride_override: Option<u32>,
    pub set_format_errno: Option<i32>,
    pub current: FrameFormat,

    /// Failures returned by successive `VIDIOC_REQBUFS` calls, front first,
    /// each with the count the driver writes back.
    pub reqbufs_failures: VecDeque<(i32, Option<u32>)>,
    /// Count granted instead of the requested one.
    pub reqbufs_grant: Option<u32>,
    /// `(index, errno)`: `VIDIOC_QUERYBUF` fails from this slot on.
    pub query_errno: Option<(u32, i32)>,
    /// Length reported by `VIDIOC_QUERYBUF` instead of `sizeimage`.
    pub buffer_length: Option<u32>,
    pub export_errno: Option<i32>,
    pub dequeue_errno: Option<i32>,
    pub stream_on_errno: Option<i32>,

    pub allocated: u32,
    /// Buffers owned by the driver, in fill order.
    pub driver_queue: VecDeque<u32>,
    /// Frames the "sensor" will still produce. Ignored when `auto_fill` is set.
    pub ready_frames: u64,
    /// Every queued buffer is immediately filled.
    pub auto_fill: bool,
    /// Upcoming frames to flag with `V4L2_BUF_FLAG_ERROR`.
    pub corrupt_frames: u64,
    pub sequence: u32,
    pub streaming: bool,

    pub calls: Vec<Call>,
    pub closed: bool,
}

impl Default for DeviceScript {
    fn default() -> Self {
        Self {
            caps: sys::V4L2_CAP_VIDEO_CAPTURE | sys::V4L2_CAP_STREAMING,
            card: "Scripted Camera".to_string(),
            substitute_fourcc: None,
            grant_resolution: None,
            stride_override: None,
            set_format_errno: None,
            current: FrameFormat::request(Resolution::new(640, 480), PixelEncoding::Yuyv),
            reqbufs_failures: VecDeque::new(),
            reqbufs_grant: None,
            query_errno: None,
            buffer_length: None,
            export_errno: None,
            dequeue_errno: None,
            stream_on_errno: None,
            allocated: 0,
            driver_queue: VecDeque::new(),
            ready_frames: 0,
            auto_fill: false,
            corrupt_frames: 0,
            sequence: 0,
            streaming: false,
            calls: Vec::new(),
            closed: false,
        }
    }
}

impl DeviceScript {
    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.iter().filter(|&c| pred(c)).count()
    }
}

/// Scripted capture device. Clone the script handle before moving the
/// device into a [`crate::DeviceHandle`] to inspect it afterwards.
#[derive(Debug, Default)]
pub struct ScriptedDevice {
    script: Arc<Mutex<DeviceScript>>,
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

impl ScriptedDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// A device that fills every queued buffer straight away.
    pub fn streaming() -> Self {
        let dev = Self::new();
        dev.lock().auto_fill = true;
        dev
    }

    pub fn script(&self) -> Arc<Mutex<DeviceScript>> {
        Arc::clone(&self.script)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DeviceScript> {
        // A panicking test thread may poison the lock; the script stays usable.
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for ScriptedDevice {
    fn drop(&mut self) {
        let mut s = self.lock();
        s.closed = true;
        s.calls.push(Call::Close);
    }
}

impl VideoDevice for ScriptedDevice {
    fn query_capabilities(&self) -> io::Result<Capabilities> {
        let mut s = self.lock();
        s.calls.push(Call::QueryCap);
        Ok(Capabilities {
            driver: "scripted".to_string(),
            card: s.card.clone(),
            bus_info: "platform:mock".to_string(),
            caps: s.caps,
        })
    }

    fn set_format(&self, request: &FrameFormat) -> io::Result<FrameFormat> {
        let mut s = self.lock();
        s.calls.push(Call::SetFormat(request.fourcc));
        if let Some(code) = s.set_format_errno {
            return Err(errno(code));
        }

        let fourcc = s.substitute_fourcc.unwrap_or(request.fourcc);
        let res = s.grant_resolution.unwrap_or_else(|| request.resolution());
        let encoding = PixelEncoding::from_v4l2(fourcc);
        let bpp = encoding.map(|e| e.bytes_per_pixel()).unwrap_or(4);
        let stride = s.stride_override.unwrap_or(res.width.saturating_mul(bpp));
        let mut size = stride.saturating_mul(res.height);
        if encoding == Some(PixelEncoding::Nv12) {
            size = size.saturating_add(size / 2);
        }

        s.current = FrameFormat {
            width: res.width,
            height: res.height,
            fourcc,
            bytes_per_line: stride,
            size_image: size,
            field: FieldOrder::Progressive,
        };
        Ok(s.current)
    }

    fn get_format(&self) -> io::Result<FrameFormat> {
        let mut s = self.lock();
        s.calls.push(Call::GetFormat);
        Ok(s.current)
    }

    fn request_buffers(&self, count: u32) -> Result<u32, RequestBuffersError> {
        let mut s = self.lock();
        s.calls.push(Call::RequestBuffers(count));
        if let Some((code, suggested)) = s.reqbufs_failures.pop_front() {
            return Err(RequestBuffersError { source: errno(code), suggested });
        }
        if count == 0 {
            s.allocated = 0;
            s.driver_queue.clear();
            return Ok(0);
        }
        let granted = s.reqbufs_grant.unwrap_or(count);
        s.allocated = granted;
        Ok(granted)
    }

    fn query_buffer(&self, index: BufferIndex) -> io::Result<BufferInfo> {
        let mut s = self.lock();
        s.calls.push(Call::QueryBuffer(index.0));
        if let Some((from, code)) = s.query_errno {
            if index.0 >= from {
                return Err(errno(code));
            }
        }
        if index.0 >= s.allocated {
            return Err(errno(libc::EINVAL));
        }
        let length = s.buffer_length.unwrap_or(s.current.size_image);
        let page_aligned = length.saturating_add(4095) & !4095;
        Ok(BufferInfo { index, length, offset: index.0.saturating_mul(page_aligned) })
    }

    fn export_buffer(&self, index: BufferIndex) -> io::Result<OwnedFd> {
        let mut s = self.lock();
        s.calls.push(Call::Export(index.0));
        if let Some(code) = s.export_errno {
            return Err(errno(code));
        }
        if index.0 >= s.allocated {
            return Err(errno(libc::EINVAL));
        }
        Ok(OwnedFd::from(File::open("/dev/null")?))
    }

    fn queue_buffer(&self, index: BufferIndex) -> io::Result<()> {
        let mut s = self.lock();
        s.calls.push(Call::Queue(index.0));
        if index.0 >= s.allocated || s.driver_queue.contains(&index.0) {
            return Err(errno(libc::EINVAL));
        }
        s.driver_queue.push_back(index.0);
        Ok(())
    }

    fn dequeue_buffer(&self) -> io::Result<Option<DequeuedBuffer>> {
        let mut s = self.lock();
        if let Some(code) = s.dequeue_errno {
            s.calls.push(Call::Dequeue(None));
            return Err(errno(code));
        }
        if !s.streaming {
            s.calls.push(Call::Dequeue(None));
            return Err(errno(libc::EINVAL));
        }

        let ready = s.auto_fill || s.ready_frames > 0;
        let Some(index) = ready.then(|| s.driver_queue.pop_front()).flatten() else {
            s.calls.push(Call::Dequeue(None));
            return Ok(None);
        };
        if !s.auto_fill {
            s.ready_frames -= 1;
        }
        let mut flags = 0;
        if s.corrupt_frames > 0 {
            s.corrupt_frames -= 1;
            flags |= sys::V4L2_BUF_FLAG_ERROR;
        }
        s.sequence = s.sequence.wrapping_add(1);
        s.calls.push(Call::Dequeue(Some(index)));

        Ok(Some(DequeuedBuffer {
            index: BufferIndex(index),
            bytes_used: s.current.size_image,
            sequence: s.sequence,
            flags,
            timestamp: Duration::from_millis(u64::from(s.sequence) * 33),
        }))
    }

    fn stream_on(&self) -> io::Result<()> {
        let mut s = self.lock();
        s.calls.push(Call::StreamOn);
        if let Some(code) = s.stream_on_errno {
            return Err(errno(code));
        }
        if s.allocated == 0 {
            return Err(errno(libc::EINVAL));
        }
        s.streaming = true;
        Ok(())
    }

    fn stream_off(&self) -> io::Result<()> {
        let mut s = self.lock();
        s.calls.push(Call::StreamOff);
        s.streaming = false;
        s.driver_queue.clear();
        Ok(())
    }
}
