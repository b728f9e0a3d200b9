//! Capture device access: the ioctl-level [`VideoDevice`] seam, its V4L2
//! implementation, and the capability-checked [`DeviceHandle`].

use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::raw::c_int;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use dmacam_core::errors::DeviceError;
use dmacam_core::{BufferIndex, FieldOrder, FourCc, FrameFormat};
use nix::errno::Errno;
use tracing::{debug, info};

use crate::sys;

// ── Device-level data ─────────────────────────────────────────────────────────

/// Result of `VIDIOC_QUERYCAP`, reduced to what setup needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    /// Effective capability bits: `device_caps` when the driver reports them,
    /// otherwise the physical device's `capabilities`.
    pub caps: u32,
}

impl Capabilities {
    pub fn supports_capture(&self) -> bool {
        self.caps & sys::V4L2_CAP_VIDEO_CAPTURE != 0
    }

    pub fn supports_streaming(&self) -> bool {
        self.caps & sys::V4L2_CAP_STREAMING != 0
    }
}

/// Result of `VIDIOC_QUERYBUF` for one MMAP slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub index: BufferIndex,
    pub length: u32,
    pub offset: u32,
}

/// A filled buffer handed back by `VIDIOC_DQBUF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: BufferIndex,
    pub bytes_used: u32,
    pub sequence: u32,
    pub flags: u32,
    pub timestamp: Duration,
}

impl DequeuedBuffer {
    /// The driver flagged the contents as possibly corrupt.
    pub fn is_corrupt(&self) -> bool {
        self.flags & sys::V4L2_BUF_FLAG_ERROR != 0
    }
}

/// `VIDIOC_REQBUFS` failure, with the count the driver wrote back if it
/// differs from the one asked for.
#[derive(Debug)]
pub struct RequestBuffersError {
    pub source: io::Error,
    pub suggested: Option<u32>,
}

// ── VideoDevice ───────────────────────────────────────────────────────────────

/// The capture-device operations used by negotiation, the buffer pool and the
/// capture loop. One method per ioctl; errno is preserved in `io::Error`.
///
/// Implementations must be non-blocking: `dequeue_buffer` returns `Ok(None)`
/// when no filled buffer is ready.
pub trait VideoDevice {
    fn query_capabilities(&self) -> io::Result<Capabilities>;

    /// `VIDIOC_S_FMT`. Returns the format as adjusted by the driver.
    fn set_format(&self, request: &FrameFormat) -> io::Result<FrameFormat>;

    /// `VIDIOC_G_FMT`.
    fn get_format(&self) -> io::Result<FrameFormat>;

    /// `VIDIOC_REQBUFS` with MMAP memory. Returns the granted count.
    fn request_buffers(&self, count: u32) -> Result<u32, RequestBuffersError>;

    fn query_buffer(&self, index: BufferIndex) -> io::Result<BufferInfo>;

    /// `VIDIOC_EXPBUF`, read-only. The returned fd is owned by the caller.
    fn export_buffer(&self, index: BufferIndex) -> io::Result<OwnedFd>;

    fn queue_buffer(&self, index: BufferIndex) -> io::Result<()>;

    fn dequeue_buffer(&self) -> io::Result<Option<DequeuedBuffer>>;

    fn stream_on(&self) -> io::Result<()>;

    fn stream_off(&self) -> io::Result<()>;
}

// ── V4l2Device ────────────────────────────────────────────────────────────────

/// A V4L2 character device opened `O_RDWR | O_NONBLOCK`. Closed on drop.
#[derive(Debug)]
pub struct V4l2Device {
    fd: OwnedFd,
    path: PathBuf,
}

impl V4l2Device {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DeviceError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(&path)
            .map_err(|source| DeviceError::Open { path: path.clone(), source })?;

        let meta = file
            .metadata()
            .map_err(|source| DeviceError::Open { path: path.clone(), source })?;
        if !meta.file_type().is_char_device() {
            return Err(DeviceError::NotCharacterDevice { path });
        }

        let fd = OwnedFd::from(file);
        info!("Camera device opened: {} with fd: {}", path.display(), fd.as_raw_fd());
        Ok(Self { fd, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn raw(&self) -> c_int {
        self.fd.as_raw_fd()
    }
}

/// Run an ioctl, retrying on `EINTR`.
fn xioctl<F>(mut call: F) -> io::Result<()>
where
    F: FnMut() -> nix::Result<c_int>,
{
    loop {
        match call() {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

fn to_pix(format: &FrameFormat) -> sys::v4l2_pix_format {
    sys::v4l2_pix_format {
        width: format.width,
        height: format.height,
        pixelformat: format.fourcc.to_u32(),
        field: format.field.to_raw(),
        bytesperline: format.bytes_per_line,
        sizeimage: format.size_image,
        ..Default::default()
    }
}

fn from_pix(pix: &sys::v4l2_pix_format) -> FrameFormat {
    FrameFormat {
        width: pix.width,
        height: pix.height,
        fourcc: FourCc::from_u32(pix.pixelformat),
        bytes_per_line: pix.bytesperline,
        size_image: pix.sizeimage,
        field: FieldOrder::from_raw(pix.field),
    }
}

impl VideoDevice for V4l2Device {
    fn query_capabilities(&self) -> io::Result<Capabilities> {
        let mut cap = sys::v4l2_capability::zeroed();
        let fd = self.raw();
        // SAFETY: `cap` is a live, correctly sized v4l2_capability.
        xioctl(|| unsafe { sys::vidioc_querycap(fd, &mut cap) })?;

        let caps = if cap.capabilities & sys::V4L2_CAP_DEVICE_CAPS != 0 {
            cap.device_caps
        } else {
            cap.capabilities
        };
        Ok(Capabilities {
            driver: sys::c_str_field(&cap.driver),
            card: sys::c_str_field(&cap.card),
            bus_info: sys::c_str_field(&cap.bus_info),
            caps,
        })
    }

    fn set_format(&self, request: &FrameFormat) -> io::Result<FrameFormat> {
        let mut fmt = sys::v4l2_format::capture(to_pix(request));
        let fd = self.raw();
        // SAFETY: `fmt` is a live v4l2_format of capture type.
        xioctl(|| unsafe { sys::vidioc_s_fmt(fd, &mut fmt) })?;
        Ok(from_pix(&fmt.pix()))
    }

    fn get_format(&self) -> io::Result<FrameFormat> {
        let mut fmt = sys::v4l2_format::capture(sys::v4l2_pix_format::default());
        let fd = self.raw();
        // SAFETY: as above.
        xioctl(|| unsafe { sys::vidioc_g_fmt(fd, &mut fmt) })?;
        Ok(from_pix(&fmt.pix()))
    }

    fn request_buffers(&self, count: u32) -> Result<u32, RequestBuffersError> {
        let mut req = sys::v4l2_requestbuffers {
            count,
            type_: sys::V4L2_BUF_TYPE_VIDEO_CAPTURE,
            memory: sys::V4L2_MEMORY_MMAP,
            ..Default::default()
        };
        let fd = self.raw();
        // SAFETY: `req` is a live v4l2_requestbuffers.
        match xioctl(|| unsafe { sys::vidioc_reqbufs(fd, &mut req) }) {
            Ok(()) => Ok(req.count),
            Err(source) => {
                let suggested = (req.count != 0 && req.count != count).then_some(req.count);
                Err(RequestBuffersError { source, suggested })
            }
        }
    }

    fn query_buffer(&self, index: BufferIndex) -> io::Result<BufferInfo> {
        let mut buf = sys::v4l2_buffer::mmap_capture(index.0);
        let fd = self.raw();
        // SAFETY: `buf` is a live v4l2_buffer with type and memory set.
        xioctl(|| unsafe { sys::vidioc_querybuf(fd, &mut buf) })?;
        Ok(BufferInfo { index, length: buf.length, offset: buf.mem_offset() })
    }

    fn export_buffer(&self, index: BufferIndex) -> io::Result<OwnedFd> {
        let mut exp = sys::v4l2_exportbuffer {
            type_: sys::V4L2_BUF_TYPE_VIDEO_CAPTURE,
            index: index.0,
            flags: (libc::O_RDONLY | libc::O_CLOEXEC) as u32,
            ..Default::default()
        };
        let fd = self.raw();
        // SAFETY: `exp` is a live v4l2_exportbuffer.
        xioctl(|| unsafe { sys::vidioc_expbuf(fd, &mut exp) })?;
        debug!("Exported buffer {} as dmabuf fd {}", index, exp.fd);
        // SAFETY: on success the kernel installed a new fd that nothing else owns.
        Ok(unsafe { OwnedFd::from_raw_fd(exp.fd) })
    }

    fn queue_buffer(&self, index: BufferIndex) -> io::Result<()> {
        let mut buf = sys::v4l2_buffer::mmap_capture(index.0);
        let fd = self.raw();
        // SAFETY: `buf` is a live v4l2_buffer with type and memory set.
        xioctl(|| unsafe { sys::vidioc_qbuf(fd, &mut buf) })
    }

    fn dequeue_buffer(&self) -> io::Result<Option<DequeuedBuffer>> {
        let mut buf = sys::v4l2_buffer::mmap_capture(0);
        let fd = self.raw();
        // SAFETY: `buf` is a live v4l2_buffer with type and memory set.
        match xioctl(|| unsafe { sys::vidioc_dqbuf(fd, &mut buf) }) {
            Ok(()) => Ok(Some(DequeuedBuffer {
                index: BufferIndex(buf.index),
                bytes_used: buf.bytesused,
                sequence: buf.sequence,
                flags: buf.flags,
                timestamp: Duration::new(
                    buf.timestamp.tv_sec.max(0) as u64,
                    (buf.timestamp.tv_usec.max(0) as u32).saturating_mul(1000),
                ),
            })),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn stream_on(&self) -> io::Result<()> {
        let ty = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE as c_int;
        let fd = self.raw();
        // SAFETY: `ty` outlives the call.
        xioctl(|| unsafe { sys::vidioc_streamon(fd, &ty) })
    }

    fn stream_off(&self) -> io::Result<()> {
        let ty = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE as c_int;
        let fd = self.raw();
        // SAFETY: `ty` outlives the call.
        xioctl(|| unsafe { sys::vidioc_streamoff(fd, &ty) })
    }
}

// ── DeviceHandle ──────────────────────────────────────────────────────────────

/// An open capture device that has passed the capability check.
///
/// Owns the device connection; the connection closes when the handle drops.
/// Buffer pools and capture streams borrow it, so it always outlives them.
#[derive(Debug)]
pub struct DeviceHandle<D: VideoDevice> {
    device: D,
    caps: Capabilities,
}

impl DeviceHandle<V4l2Device> {
    /// Open `path` non-blocking and verify capture + streaming support.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DeviceError> {
        Self::new(V4l2Device::open(path)?)
    }
}

impl<D: VideoDevice> DeviceHandle<D> {
    /// Verify that `device` reports video capture and streaming I/O.
    pub fn new(device: D) -> Result<Self, DeviceError> {
        let caps = device
            .query_capabilities()
            .map_err(|source| DeviceError::Query { source })?;

        info!(
            "Device '{}' driver={} bus={} caps=0x{:08x}",
            caps.card, caps.driver, caps.bus_info, caps.caps
        );

        if !caps.supports_capture() {
            return Err(DeviceError::Unsupported { card: caps.card, missing: "video capture" });
        }
        if !caps.supports_streaming() {
            return Err(DeviceError::Unsupported { card: caps.card, missing: "streaming I/O" });
        }
        Ok(Self { device, caps })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedDevice;

    #[test]
    fn handle_accepts_capture_streaming_device() {
        let dev = ScriptedDevice::new();
        let handle = DeviceHandle::new(dev).expect("capable device");
        assert!(handle.capabilities().supports_capture());
        assert!(handle.capabilities().supports_streaming());
    }

    #[test]
    fn handle_rejects_device_without_capture() {
        let dev = ScriptedDevice::new();
        dev.script().lock().unwrap().caps = sys::V4L2_CAP_STREAMING;
        let err = DeviceHandle::new(dev).unwrap_err();
        assert!(matches!(err, DeviceError::Unsupported { missing: "video capture", .. }));
    }

    #[test]
    fn handle_rejects_device_without_streaming() {
        let dev = ScriptedDevice::new();
        dev.script().lock().unwrap().caps = sys::V4L2_CAP_VIDEO_CAPTURE;
        let script = dev.script();
        let err = DeviceHandle::new(dev).unwrap_err();
        assert!(matches!(err, DeviceError::Unsupported { missing: "streaming I/O", .. }));
        assert!(script.lock().unwrap().closed, "rejected device must be closed");
    }

    #[test]
    fn open_missing_path_is_open_error() {
        let err = V4l2Device::open("/nonexistent/video99").unwrap_err();
        assert!(matches!(err, DeviceError::Open { .. }));
    }

    #[test]
    fn open_regular_file_is_not_a_character_device() {
        let path = std::env::temp_dir().join(format!("dmacam-not-a-device-{}", std::process::id()));
        std::fs::write(&path, b"").unwrap();
        let err = V4l2Device::open(&path).unwrap_err();
        let _ = std::fs::remove_file(&path);
        assert!(matches!(err, DeviceError::NotCharacterDevice { .. }));
    }

    #[test]
    fn corrupt_flag_is_detected() {
        let buf = DequeuedBuffer {
            index: BufferIndex(0),
            bytes_used: 0,
            sequence: 1,
            flags: sys::V4L2_BUF_FLAG_ERROR,
            timestamp: Duration::ZERO,
        };
        assert!(buf.is_corrupt());
    }
}
