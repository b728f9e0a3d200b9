//! Pixel format negotiation.
//!
//! The driver may silently substitute both resolution and encoding. A changed
//! resolution is tolerated because everything downstream reads the granted
//! values; a changed encoding is fatal because the importer maps encodings to
//! DRM fourccs through a fixed table.

use dmacam_core::errors::FormatError;
use dmacam_core::{FormatDescriptor, FourCc, FrameFormat, PixelEncoding, Resolution};
use tracing::{info, warn};

use crate::device::{DeviceHandle, VideoDevice};

/// Ask for `resolution` in `fourcc`, then re-read what the driver granted.
///
/// Mutates driver-side format state.
pub fn negotiate_format<D: VideoDevice>(
    handle: &DeviceHandle<D>,
    resolution: Resolution,
    fourcc: FourCc,
) -> Result<FormatDescriptor, FormatError> {
    let encoding = PixelEncoding::from_v4l2(fourcc).ok_or(FormatError::Unsupported { fourcc })?;
    let requested = FrameFormat::request(resolution, encoding);
    let device = handle.device();

    let adjusted = device
        .set_format(&requested)
        .map_err(|source| FormatError::Set { source })?;
    let granted = device.get_format().map_err(|source| FormatError::Get { source })?;

    if adjusted != granted {
        warn!(
            "VIDIOC_S_FMT reply ({} {}x{}) differs from VIDIOC_G_FMT ({} {}x{}); using G_FMT",
            adjusted.fourcc, adjusted.width, adjusted.height,
            granted.fourcc, granted.width, granted.height
        );
    }

    if granted.fourcc != requested.fourcc {
        return Err(FormatError::Mismatch { requested: requested.fourcc, granted: granted.fourcc });
    }

    check_granted(&granted, encoding)?;
    let descriptor = FormatDescriptor { requested, granted, encoding };
    descriptor.image_layout()?;

    if granted.resolution() != requested.resolution() {
        warn!(
            "Driver is sending image at {} instead of {}",
            granted.resolution(),
            requested.resolution()
        );
    }
    if !granted.field.is_progressive() {
        warn!("Driver granted field order {:?}; frames may be interlaced", granted.field);
    }

    info!(
        "Device accepted fourcc {} ({}) at {} stride={} size={}",
        granted.fourcc,
        encoding,
        granted.resolution(),
        granted.bytes_per_line,
        granted.size_image
    );

    Ok(descriptor)
}

fn check_granted(granted: &FrameFormat, encoding: PixelEncoding) -> Result<(), FormatError> {
    if granted.width == 0 || granted.height == 0 {
        return Err(FormatError::Degenerate {
            reason: format!("zero-sized frame {}x{}", granted.width, granted.height),
        });
    }
    let min_stride = granted.width.saturating_mul(encoding.bytes_per_pixel());
    if granted.bytes_per_line < min_stride {
        return Err(FormatError::Degenerate {
            reason: format!(
                "stride {} below {} bytes needed for {} px of {}",
                granted.bytes_per_line, min_stride, granted.width, encoding
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Call, ScriptedDevice};

    fn handle() -> DeviceHandle<ScriptedDevice> {
        DeviceHandle::new(ScriptedDevice::new()).unwrap()
    }

    #[test]
    fn exact_grant_succeeds() {
        let h = handle();
        let desc = negotiate_format(&h, Resolution::HD, PixelEncoding::Bgrx32.v4l2_fourcc()).unwrap();
        assert_eq!(desc.encoding, PixelEncoding::Bgrx32);
        assert_eq!(desc.granted.resolution(), Resolution::HD);
        assert_eq!(desc.granted.bytes_per_line, 1280 * 4);
        assert!(!desc.resolution_adjusted());
    }

    #[test]
    fn substituted_encoding_is_mismatch() {
        let h = handle();
        h.device().script().lock().unwrap().substitute_fourcc = Some(FourCc::new(b"YUYV"));
        let err = negotiate_format(&h, Resolution::HD, PixelEncoding::Bgrx32.v4l2_fourcc()).unwrap_err();
        match err {
            FormatError::Mismatch { requested, granted } => {
                assert_eq!(requested, FourCc::new(b"RX24"));
                assert_eq!(granted, FourCc::new(b"YUYV"));
            }
            other => panic!("expected Mismatch, got {other:?}"),
        }
    }

    #[test]
    fn adjusted_resolution_is_only_a_warning() {
        let h = handle();
        h.device().script().lock().unwrap().grant_resolution = Some(Resolution::new(640, 480));
        let desc = negotiate_format(&h, Resolution::HD, PixelEncoding::Bgrx32.v4l2_fourcc()).unwrap();
        assert!(desc.resolution_adjusted());
        let layout = desc.image_layout().unwrap();
        assert_eq!(layout.width, 640);
        assert_eq!(layout.planes[0].pitch, 640 * 4);
    }

    #[test]
    fn unknown_encoding_never_reaches_driver() {
        let h = handle();
        let err = negotiate_format(&h, Resolution::HD, FourCc::new(b"MJPG")).unwrap_err();
        assert!(matches!(err, FormatError::Unsupported { .. }));
        let calls = h.device().script().lock().unwrap().calls.clone();
        assert!(!calls.iter().any(|c| matches!(c, Call::SetFormat(_))));
    }

    #[test]
    fn short_stride_is_degenerate() {
        let h = handle();
        h.device().script().lock().unwrap().stride_override = Some(100);
        let err = negotiate_format(&h, Resolution::HD, PixelEncoding::Bgrx32.v4l2_fourcc()).unwrap_err();
        assert!(matches!(err, FormatError::Degenerate { .. }));
    }

    #[test]
    fn nv12_grant_past_32_bit_offsets_is_degenerate() {
        let h = handle();
        h.device().script().lock().unwrap().grant_resolution = Some(Resolution::new(70_000, 70_000));
        let err = negotiate_format(&h, Resolution::HD, PixelEncoding::Nv12.v4l2_fourcc()).unwrap_err();
        assert!(matches!(err, FormatError::Degenerate { .. }), "{err:?}");
    }

    #[test]
    fn set_format_failure_is_reported() {
        let h = handle();
        h.device().script().lock().unwrap().set_format_errno = Some(libc::EBUSY);
        let err = negotiate_format(&h, Resolution::HD, PixelEncoding::Bgrx32.v4l2_fourcc()).unwrap_err();
        assert!(matches!(err, FormatError::Set { .. }));
    }
}
