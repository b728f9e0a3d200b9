//! dmacam-capture: the capture side of the zero-copy path.
//!
//! Opens a V4L2 device, negotiates a pixel format the GPU importer
//! understands, allocates a pool of MMAP buffers and exports each one as a
//! read-only dmabuf.

pub mod device;
pub mod negotiate;
pub mod pool;
pub mod stream;
pub mod sys;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use device::{BufferInfo, Capabilities, DequeuedBuffer, DeviceHandle, V4l2Device, VideoDevice};
pub use negotiate::negotiate_format;
pub use pool::{BufferPool, CaptureBuffer};
pub use stream::CaptureStream;
