//! The explicit context object tying one capture stream to one GPU importer.
//!
//! A `Session` owns the stream (and through it the device), the importer, one
//! imported image per buffer slot and the currently bound texture. Dropping it
//! tears everything down in dependency order:
//!
//! 1. stop streaming
//! 2. release imported images, then the importer and its texture
//! 3. drop exported handles and free the driver buffers
//! 4. close the device

use dmacam_capture::{CaptureStream, DequeuedBuffer, VideoDevice};
use dmacam_core::errors::StreamError;
use dmacam_core::{BoundTexture, BufferIndex, DmacamError, FormatDescriptor, RefreshPolicy};
use dmacam_renderer::ImageImporter;
use tracing::{debug, info, warn};

pub struct Session<D: VideoDevice, I: ImageImporter> {
    // Field order is drop order: the importer goes before the stream.
    importer: I,
    images: Vec<Option<I::Image>>,
    texture: Option<BoundTexture>,
    refresh: RefreshPolicy,
    stream: CaptureStream<D>,
    closed: bool,
}

impl<D: VideoDevice, I: ImageImporter> Session<D, I> {
    /// Import every exported buffer, bind slot 0 and start streaming.
    pub fn start(
        stream: CaptureStream<D>,
        importer: I,
        refresh: RefreshPolicy,
    ) -> Result<Self, DmacamError> {
        let count = stream.buffer_count();
        let mut session = Self {
            importer,
            images: Vec::with_capacity(count),
            texture: None,
            refresh,
            stream,
            closed: false,
        };

        let layout = session.stream.format().image_layout()?;
        for i in 0..count {
            let index = BufferIndex(i as u32);
            let handle = session.stream.handle(index)?;
            let image = session.importer.import_image(handle, &layout)?;
            session.images.push(Some(image));
        }
        info!("Imported {} buffer(s) as {} {}x{}", count, layout.drm_fourcc, layout.width, layout.height);

        session.texture = Some(session.bind(BufferIndex(0))?);
        session.stream.start()?;
        Ok(session)
    }

    /// Non-blocking reclaim of the next filled buffer.
    pub fn reclaim(&mut self) -> Result<Option<DequeuedBuffer>, StreamError> {
        self.stream.reclaim()
    }

    /// Make the texture show the current contents of `index`.
    pub fn refresh_binding(&mut self, index: BufferIndex) -> Result<BoundTexture, DmacamError> {
        if self.refresh == RefreshPolicy::Reimport {
            self.reimport(index)?;
        }
        let bound = self.bind(index)?;
        self.texture = Some(bound);
        Ok(bound)
    }

    /// Return `index` to the driver's fill queue.
    pub fn release(&mut self, index: BufferIndex) -> Result<(), StreamError> {
        self.stream.resubmit(index)
    }

    pub fn texture(&self) -> Option<&BoundTexture> {
        self.texture.as_ref()
    }

    pub fn format(&self) -> &FormatDescriptor {
        self.stream.format()
    }

    pub fn stream(&self) -> &CaptureStream<D> {
        &self.stream
    }

    pub fn refresh_policy(&self) -> RefreshPolicy {
        self.refresh
    }

    fn bind(&mut self, index: BufferIndex) -> Result<BoundTexture, DmacamError> {
        let image = self
            .images
            .get(index.as_usize())
            .and_then(Option::as_ref)
            .ok_or(StreamError::UnknownBuffer { index })?;
        Ok(self.importer.bind_as_texture(image, index)?)
    }

    fn reimport(&mut self, index: BufferIndex) -> Result<(), DmacamError> {
        let slot = self
            .images
            .get_mut(index.as_usize())
            .ok_or(StreamError::UnknownBuffer { index })?;
        if let Some(old) = slot.take() {
            self.importer.release_image(old);
        }
        let layout = self.stream.format().image_layout()?;
        let handle = self.stream.handle(index)?;
        let image = self.importer.import_image(handle, &layout)?;
        self.images[index.as_usize()] = Some(image);
        Ok(())
    }

    /// Stop streaming and release every imported image. Idempotent; the
    /// remaining teardown happens on drop.
    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.stream.stop() {
            warn!("Teardown: {e}");
        }
        self.texture = None;
        let mut released = 0;
        for image in self.images.drain(..).flatten() {
            self.importer.release_image(image);
            released += 1;
        }
        debug!("Released {} imported image(s)", released);
    }
}

impl<D: VideoDevice, I: ImageImporter> Drop for Session<D, I> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
