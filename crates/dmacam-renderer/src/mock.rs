//! Recording GPU double implementing both [`ImageImporter`] and
//! [`FrameRenderer`].

use std::num::NonZeroU32;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard};

use dmacam_core::errors::{ImportError, RenderError};
use dmacam_core::{BoundTexture, BufferIndex, ImageLayout};

use crate::{FrameRenderer, ImageImporter};

/// Texture name every bind reports; one external texture is shared by all slots.
pub const MOCK_TEXTURE: NonZeroU32 = match NonZeroU32::new(1) {
    Some(t) => t,
    None => unreachable!(),
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuCall {
    Import { image: u32, fd: RawFd },
    Bind { image: u32, buffer: BufferIndex },
    Release { image: u32 },
    Draw { buffer: BufferIndex },
    InsertFence { fence: u32 },
    PollFence { fence: u32, signaled: bool },
    ReleaseFence { fence: u32 },
}

#[derive(Debug, Default)]
pub struct GpuLog {
    pub calls: Vec<GpuCall>,
    /// Reject every import with `CreateImage`.
    pub fail_import: bool,
    /// Fail the bind of this buffer with a GL error.
    pub fail_bind: Option<BufferIndex>,
    /// Number of polls that report a fresh fence as still pending.
    pub fence_latency: u32,
    pub live_images: usize,
    pending: Vec<(u32, u32)>,
    next_id: u32,
}

impl GpuLog {
    pub fn draws(&self) -> Vec<BufferIndex> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                GpuCall::Draw { buffer } => Some(*buffer),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&GpuCall) -> bool) -> usize {
        self.calls.iter().filter(|&c| pred(c)).count()
    }

    fn next(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct MockImage {
    pub id: u32,
    pub layout: ImageLayout,
}

#[derive(Debug, PartialEq, Eq)]
pub struct MockFence(pub u32);

#[derive(Debug, Default, Clone)]
pub struct RecordingGpu {
    log: Arc<Mutex<GpuLog>>,
}

impl RecordingGpu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> Arc<Mutex<GpuLog>> {
        Arc::clone(&self.log)
    }

    fn lock(&self) -> MutexGuard<'_, GpuLog> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ImageImporter for RecordingGpu {
    type Image = MockImage;

    fn import_image(&mut self, handle: BorrowedFd<'_>, layout: &ImageLayout) -> Result<MockImage, ImportError> {
        let mut log = self.lock();
        if log.fail_import {
            return Err(ImportError::CreateImage {
                fourcc: layout.drm_fourcc,
                width: layout.width,
                height: layout.height,
                reason: "EGL_BAD_MATCH".to_string(),
            });
        }
        let id = log.next();
        log.live_images += 1;
        log.calls.push(GpuCall::Import { image: id, fd: handle.as_raw_fd() });
        Ok(MockImage { id, layout: layout.clone() })
    }

    fn bind_as_texture(&mut self, image: &MockImage, buffer: BufferIndex) -> Result<BoundTexture, ImportError> {
        let mut log = self.lock();
        if log.fail_bind == Some(buffer) {
            return Err(ImportError::Bind { index: buffer, code: 0x0502 });
        }
        log.calls.push(GpuCall::Bind { image: image.id, buffer });
        Ok(BoundTexture { texture: MOCK_TEXTURE, buffer })
    }

    fn release_image(&mut self, image: MockImage) {
        let mut log = self.lock();
        log.live_images = log.live_images.saturating_sub(1);
        log.calls.push(GpuCall::Release { image: image.id });
    }
}

impl FrameRenderer for RecordingGpu {
    type Fence = MockFence;

    fn draw(&mut self, texture: &BoundTexture) -> Result<(), RenderError> {
        self.lock().calls.push(GpuCall::Draw { buffer: texture.buffer });
        Ok(())
    }

    fn insert_fence(&mut self) -> Result<MockFence, RenderError> {
        let mut log = self.lock();
        let id = log.next();
        let latency = log.fence_latency;
        log.pending.push((id, latency));
        log.calls.push(GpuCall::InsertFence { fence: id });
        Ok(MockFence(id))
    }

    fn fence_signaled(&mut self, fence: &MockFence) -> bool {
        let mut log = self.lock();
        let signaled = match log.pending.iter_mut().find(|(id, _)| *id == fence.0) {
            Some((_, 0)) | None => true,
            Some((_, left)) => {
                *left -= 1;
                false
            }
        };
        log.calls.push(GpuCall::PollFence { fence: fence.0, signaled });
        signaled
    }

    fn release_fence(&mut self, fence: MockFence) {
        let mut log = self.lock();
        log.pending.retain(|(id, _)| *id != fence.0);
        log.calls.push(GpuCall::ReleaseFence { fence: fence.0 });
    }
}
