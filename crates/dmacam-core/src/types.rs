use std::num::NonZeroU32;

use serde::{Deserialize, Serialize};

use crate::errors::FormatError;

// MARK: - Resolution

/// Frame dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const HD: Self = Self { width: 1280, height: 720 };
    pub const FHD: Self = Self { width: 1920, height: 1080 };

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn total_pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}×{}", self.width, self.height)
    }
}

// MARK: - FourCc

/// Four-character code, stored in memory order (`b"RX24"` is `'R' 'X' '2' '4'`).
///
/// V4L2 and DRM both pack the code little-endian into a `u32`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    pub const fn from_u32(raw: u32) -> Self {
        Self(raw.to_le_bytes())
    }

    pub const fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }
}

impl std::fmt::Display for FourCc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.0 {
            let c = if b.is_ascii_graphic() || b == b' ' { b as char } else { '?' };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for FourCc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FourCc({self} / 0x{:08x})", self.to_u32())
    }
}

// MARK: - PixelEncoding

/// Pixel encodings the image importer knows how to describe to the GPU.
///
/// For the packed RGB formats the V4L2 and DRM codes coincide because both
/// name the same little-endian byte layout:
///
/// | Encoding | V4L2 | DRM | Memory order |
/// |----------|------|-----|--------------|
/// | `Bgrx32` | `RX24` | `RX24` (RGBX8888) | X B G R |
/// | `Xbgr32` | `XR24` | `XR24` (XRGB8888) | B G R X |
/// | `Yuyv`   | `YUYV` | `YUYV` | Y U Y V |
/// | `Nv12`   | `NV12` | `NV12` | Y plane, then interleaved UV |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelEncoding {
    Bgrx32,
    Xbgr32,
    Yuyv,
    Nv12,
}

impl PixelEncoding {
    pub const ALL: [Self; 4] = [Self::Bgrx32, Self::Xbgr32, Self::Yuyv, Self::Nv12];

    /// Code handed to `VIDIOC_S_FMT`.
    pub const fn v4l2_fourcc(self) -> FourCc {
        match self {
            Self::Bgrx32 => FourCc::new(b"RX24"),
            Self::Xbgr32 => FourCc::new(b"XR24"),
            Self::Yuyv => FourCc::new(b"YUYV"),
            Self::Nv12 => FourCc::new(b"NV12"),
        }
    }

    /// Code handed to `eglCreateImageKHR` as `EGL_LINUX_DRM_FOURCC_EXT`.
    pub const fn drm_fourcc(self) -> FourCc {
        match self {
            Self::Bgrx32 => FourCc::new(b"RX24"),
            Self::Xbgr32 => FourCc::new(b"XR24"),
            Self::Yuyv => FourCc::new(b"YUYV"),
            Self::Nv12 => FourCc::new(b"NV12"),
        }
    }

    pub fn from_v4l2(code: FourCc) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.v4l2_fourcc() == code)
    }

    /// Bytes per pixel of the first plane; the lower bound for a valid stride.
    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::Bgrx32 | Self::Xbgr32 => 4,
            Self::Yuyv => 2,
            Self::Nv12 => 1,
        }
    }

    /// Plane offsets and pitches inside a single capture buffer, or `None`
    /// when an offset does not fit in 32 bits.
    pub fn planes(self, bytes_per_line: u32, height: u32) -> Option<Vec<PlaneLayout>> {
        let first = PlaneLayout { offset: 0, pitch: bytes_per_line };
        match self {
            Self::Nv12 => {
                let chroma = bytes_per_line.checked_mul(height)?;
                Some(vec![first, PlaneLayout { offset: chroma, pitch: bytes_per_line }])
            }
            _ => Some(vec![first]),
        }
    }

    /// Bytes a buffer must hold for every plane: NV12 adds a half-height
    /// chroma plane after the luma plane.
    pub fn min_buffer_len(self, bytes_per_line: u32, height: u32) -> u64 {
        let rows = match self {
            Self::Nv12 => u64::from(height) + u64::from(height).div_ceil(2),
            _ => u64::from(height),
        };
        u64::from(bytes_per_line) * rows
    }
}

impl Default for PixelEncoding {
    fn default() -> Self {
        Self::Bgrx32
    }
}

impl std::fmt::Display for PixelEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bgrx32 => write!(f, "BGRX32"),
            Self::Xbgr32 => write!(f, "XBGR32"),
            Self::Yuyv => write!(f, "YUYV"),
            Self::Nv12 => write!(f, "NV12"),
        }
    }
}

// MARK: - FieldOrder

/// Interlacing of the delivered frames (`enum v4l2_field`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOrder {
    Any,
    Progressive,
    Top,
    Bottom,
    Interlaced,
    Other(u32),
}

impl FieldOrder {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Any,
            1 => Self::Progressive,
            2 => Self::Top,
            3 => Self::Bottom,
            4 => Self::Interlaced,
            other => Self::Other(other),
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            Self::Any => 0,
            Self::Progressive => 1,
            Self::Top => 2,
            Self::Bottom => 3,
            Self::Interlaced => 4,
            Self::Other(raw) => raw,
        }
    }

    pub fn is_progressive(self) -> bool {
        matches!(self, Self::Progressive)
    }
}

// MARK: - FrameFormat

/// One side of a format negotiation, as exchanged with the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCc,
    /// Scanline stride in bytes. Zero in a request means "driver decides".
    pub bytes_per_line: u32,
    pub size_image: u32,
    pub field: FieldOrder,
}

impl FrameFormat {
    /// A request for a progressive frame; stride and size are left to the driver.
    pub fn request(resolution: Resolution, encoding: PixelEncoding) -> Self {
        Self {
            width: resolution.width,
            height: resolution.height,
            fourcc: encoding.v4l2_fourcc(),
            bytes_per_line: 0,
            size_image: 0,
            field: FieldOrder::Progressive,
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

// MARK: - FormatDescriptor

/// Requested and granted format. Only `granted` is used downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatDescriptor {
    pub requested: FrameFormat,
    pub granted: FrameFormat,
    /// Encoding of `granted`, guaranteed equal to the requested one.
    pub encoding: PixelEncoding,
}

impl FormatDescriptor {
    pub fn resolution_adjusted(&self) -> bool {
        self.requested.resolution() != self.granted.resolution()
    }

    /// Metadata the GPU importer needs alongside a buffer handle.
    pub fn image_layout(&self) -> Result<ImageLayout, FormatError> {
        let planes = self
            .encoding
            .planes(self.granted.bytes_per_line, self.granted.height)
            .ok_or_else(|| FormatError::Degenerate {
                reason: format!(
                    "plane offsets for stride {} × {} rows overflow 32 bits",
                    self.granted.bytes_per_line, self.granted.height
                ),
            })?;
        Ok(ImageLayout {
            width: self.granted.width,
            height: self.granted.height,
            drm_fourcc: self.encoding.drm_fourcc(),
            planes,
        })
    }

    /// Smallest buffer length that holds every plane of the granted format.
    pub fn required_buffer_len(&self) -> u64 {
        self.encoding.min_buffer_len(self.granted.bytes_per_line, self.granted.height)
    }
}

// MARK: - Buffers

/// Stable identity of a slot in the capture buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferIndex(pub u32);

impl BufferIndex {
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for BufferIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Ownership state of one capture buffer, as tracked by the pool.
///
/// `Unqueued → Queued → (driver fills) → Dequeued → Queued → …`. The driver's
/// internal "filled, waiting" state is only observable as a successful dequeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Allocated but never handed to the driver.
    Unqueued,
    /// Owned by the driver: being filled or waiting to be dequeued.
    Queued,
    /// Owned by the consumer until resubmitted.
    Dequeued,
}

impl std::fmt::Display for BufferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unqueued => write!(f, "unqueued"),
            Self::Queued => write!(f, "queued"),
            Self::Dequeued => write!(f, "dequeued"),
        }
    }
}

// MARK: - Image import

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub offset: u32,
    pub pitch: u32,
}

/// Everything besides the memory handle that an image import needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLayout {
    pub width: u32,
    pub height: u32,
    pub drm_fourcc: FourCc,
    pub planes: Vec<PlaneLayout>,
}

/// A texture unit currently backed by the imported image of `buffer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundTexture {
    pub texture: NonZeroU32,
    pub buffer: BufferIndex,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_packs_little_endian() {
        let bgrx = PixelEncoding::Bgrx32.v4l2_fourcc();
        // v4l2_fourcc('R','X','2','4')
        assert_eq!(bgrx.to_u32(), 0x3432_5852);
        assert_eq!(FourCc::from_u32(0x3432_5852), bgrx);
        assert_eq!(bgrx.to_string(), "RX24");
    }

    #[test]
    fn fourcc_display_masks_unprintable_bytes() {
        assert_eq!(FourCc([b'A', 0, b'2', 0xff]).to_string(), "A?2?");
    }

    #[test]
    fn encoding_lookup_by_v4l2_code() {
        for enc in PixelEncoding::ALL {
            assert_eq!(PixelEncoding::from_v4l2(enc.v4l2_fourcc()), Some(enc));
        }
        assert_eq!(PixelEncoding::from_v4l2(FourCc::new(b"MJPG")), None);
    }

    #[test]
    fn nv12_has_chroma_plane_after_luma() {
        let planes = PixelEncoding::Nv12.planes(1280, 720).unwrap();
        assert_eq!(planes.len(), 2);
        assert_eq!(planes[1].offset, 1280 * 720);
        assert_eq!(planes[1].pitch, 1280);
    }

    #[test]
    fn layout_uses_granted_values() {
        let requested = FrameFormat::request(Resolution::HD, PixelEncoding::Bgrx32);
        let granted = FrameFormat {
            width: 640,
            height: 480,
            bytes_per_line: 2560,
            size_image: 2560 * 480,
            ..requested
        };
        let desc = FormatDescriptor { requested, granted, encoding: PixelEncoding::Bgrx32 };
        assert!(desc.resolution_adjusted());

        let layout = desc.image_layout().unwrap();
        assert_eq!((layout.width, layout.height), (640, 480));
        assert_eq!(layout.planes, vec![PlaneLayout { offset: 0, pitch: 2560 }]);
        assert_eq!(layout.drm_fourcc, FourCc::new(b"RX24"));
    }

    #[test]
    fn oversized_nv12_grant_has_no_layout() {
        assert_eq!(PixelEncoding::Nv12.planes(70_000, 70_000), None);
        assert!(PixelEncoding::Yuyv.planes(70_000, 70_000).is_some());

        let requested = FrameFormat::request(Resolution::new(70_000, 70_000), PixelEncoding::Nv12);
        let granted = FrameFormat { bytes_per_line: 70_000, ..requested };
        let desc = FormatDescriptor { requested, granted, encoding: PixelEncoding::Nv12 };
        assert!(matches!(desc.image_layout(), Err(FormatError::Degenerate { .. })));
    }

    #[test]
    fn nv12_needs_room_for_half_height_chroma() {
        assert_eq!(PixelEncoding::Nv12.min_buffer_len(640, 480), 640 * 720);
        assert_eq!(PixelEncoding::Nv12.min_buffer_len(640, 3), 640 * 5);
        assert_eq!(PixelEncoding::Bgrx32.min_buffer_len(2560, 480), 2560 * 480);
        assert_eq!(PixelEncoding::Yuyv.min_buffer_len(u32::MAX, u32::MAX), u64::from(u32::MAX).pow(2));
    }

    #[test]
    fn field_order_raw_values() {
        assert_eq!(FieldOrder::from_raw(1), FieldOrder::Progressive);
        assert_eq!(FieldOrder::from_raw(9), FieldOrder::Other(9));
        assert_eq!(FieldOrder::Interlaced.to_raw(), 4);
    }
}
