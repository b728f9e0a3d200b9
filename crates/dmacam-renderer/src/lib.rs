//! dmacam-renderer: GPU side of the zero-copy path.
//!
//! [`ImageImporter`] wraps an exported capture buffer as a GPU image and binds
//! it to a texture; [`FrameRenderer`] draws that texture. Both seams are
//! implemented for EGL/GL ([`EglImporter`], [`ExternalQuad`]) and, behind the
//! `mock` feature, by a recording double.

use std::os::fd::BorrowedFd;

use dmacam_core::errors::{ImportError, RenderError};
use dmacam_core::{BoundTexture, BufferIndex, ImageLayout};

pub mod egl;
pub mod quad;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use egl::{EglImage, EglImporter};
pub use quad::ExternalQuad;

// MARK: - ImageImporter

/// Turns exported buffer handles into sampleable GPU images.
///
/// An image aliases the buffer's memory; it does not own the buffer and must
/// not outlive the exported handle it was built from.
pub trait ImageImporter {
    type Image;

    /// Wrap `handle` as a GPU image. Rejection is not retryable: it means the
    /// driver does not accept this encoding/handle combination.
    fn import_image(
        &mut self,
        handle: BorrowedFd<'_>,
        layout: &ImageLayout,
    ) -> Result<Self::Image, ImportError>;

    /// Point the external texture at `image`. Must be reasserted every time the
    /// texture should show new contents of `buffer`.
    fn bind_as_texture(
        &mut self,
        image: &Self::Image,
        buffer: BufferIndex,
    ) -> Result<BoundTexture, ImportError>;

    fn release_image(&mut self, image: Self::Image);
}

// MARK: - FrameRenderer

/// Draws the bound texture and, on request, fences the draw.
pub trait FrameRenderer {
    type Fence;

    fn draw(&mut self, texture: &BoundTexture) -> Result<(), RenderError>;

    /// Fence after every command issued so far.
    fn insert_fence(&mut self) -> Result<Self::Fence, RenderError>;

    /// Non-blocking poll.
    fn fence_signaled(&mut self, fence: &Self::Fence) -> bool;

    fn release_fence(&mut self, fence: Self::Fence);
}
