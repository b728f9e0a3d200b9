//! EGL dmabuf import (`EGL_EXT_image_dma_buf_import`) onto a
//! `GL_TEXTURE_EXTERNAL_OES` texture.
//!
//! libEGL is loaded at runtime. The importer attaches to whatever EGL display
//! is current on the calling thread, so it must be created and used on the
//! thread that owns the GL context.

use std::ffi::c_void;
use std::num::NonZeroU32;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::ptr;
use std::sync::Arc;

use dmacam_core::errors::ImportError;
use dmacam_core::{BoundTexture, BufferIndex, ImageLayout};
use glow::HasContext;
use khronos_egl as egl;
use tracing::{debug, info, warn};

use crate::ImageImporter;

pub const GL_TEXTURE_EXTERNAL_OES: u32 = 0x8D65;

const EGL_NONE: i32 = 0x3038;
const EGL_WIDTH: i32 = 0x3057;
const EGL_HEIGHT: i32 = 0x3056;
const EGL_LINUX_DMA_BUF_EXT: u32 = 0x3270;
const EGL_LINUX_DRM_FOURCC_EXT: i32 = 0x3271;

/// `(fd, offset, pitch)` attribute names for planes 0..=2.
const PLANE_ATTRIBS: [(i32, i32, i32); 3] = [
    (0x3272, 0x3273, 0x3274),
    (0x3275, 0x3276, 0x3277),
    (0x3278, 0x3279, 0x327A),
];

const REQUIRED_EXTENSIONS: [&str; 2] = ["EGL_KHR_image_base", "EGL_EXT_image_dma_buf_import"];

type EglImageKhr = *mut c_void;

type CreateImageKhrFn = unsafe extern "system" fn(
    dpy: egl::EGLDisplay,
    ctx: egl::EGLContext,
    target: u32,
    buffer: egl::EGLClientBuffer,
    attrib_list: *const i32,
) -> EglImageKhr;

type DestroyImageKhrFn = unsafe extern "system" fn(dpy: egl::EGLDisplay, image: EglImageKhr) -> u32;

type ImageTargetTexture2dOesFn = unsafe extern "system" fn(target: u32, image: EglImageKhr);

/// Attribute list for `eglCreateImageKHR(EGL_LINUX_DMA_BUF_EXT)`. All planes
/// live in the one exported buffer.
pub fn dma_buf_attributes(fd: i32, layout: &ImageLayout) -> Result<Vec<i32>, ImportError> {
    let attr = |name: &str, value: u32| {
        i32::try_from(value).map_err(|_| ImportError::CreateImage {
            fourcc: layout.drm_fourcc,
            width: layout.width,
            height: layout.height,
            reason: format!("{name} {value} does not fit an EGL attribute"),
        })
    };

    let mut attribs = vec![
        EGL_WIDTH,
        attr("width", layout.width)?,
        EGL_HEIGHT,
        attr("height", layout.height)?,
        EGL_LINUX_DRM_FOURCC_EXT,
        // Bit pattern, not a quantity.
        layout.drm_fourcc.to_u32() as i32,
    ];
    for (plane, (fd_attr, offset_attr, pitch_attr)) in layout.planes.iter().zip(PLANE_ATTRIBS) {
        attribs.extend_from_slice(&[
            fd_attr,
            fd,
            offset_attr,
            attr("plane offset", plane.offset)?,
            pitch_attr,
            attr("plane pitch", plane.pitch)?,
        ]);
    }
    attribs.push(EGL_NONE);
    Ok(attribs)
}

/// An EGL image aliasing one capture buffer.
#[derive(Debug)]
pub struct EglImage {
    raw: EglImageKhr,
    layout: ImageLayout,
}

impl EglImage {
    pub fn layout(&self) -> &ImageLayout {
        &self.layout
    }
}

pub struct EglImporter {
    gl: Arc<glow::Context>,
    egl: egl::DynamicInstance<egl::EGL1_4>,
    display: egl::Display,
    create_image: CreateImageKhrFn,
    destroy_image: DestroyImageKhrFn,
    image_target_texture: ImageTargetTexture2dOesFn,
    texture: glow::NativeTexture,
    live_images: usize,
}

// SAFETY: the EGL display and image handles are only dereferenced by EGL/GL
// calls, and the owner confines every call to the thread holding the context.
unsafe impl Send for EglImporter {}

fn lookup<T>(instance: &egl::DynamicInstance<egl::EGL1_4>, name: &'static str) -> Result<T, ImportError> {
    let f = instance.get_proc_address(name).ok_or(ImportError::MissingEntryPoint(name))?;
    // SAFETY: `T` is the documented signature of `name`; both are plain fn pointers.
    Ok(unsafe { std::mem::transmute_copy::<extern "system" fn(), T>(&f) })
}

impl EglImporter {
    /// Attach to the current EGL display and allocate the external texture.
    pub fn new(gl: Arc<glow::Context>) -> Result<Self, ImportError> {
        // SAFETY: loading the system libEGL runs only its initialisers.
        let lib = unsafe { libloading::Library::new("libEGL.so.1") }
            .map_err(|e| ImportError::EglUnavailable(e.to_string()))?;
        // SAFETY: `lib` is a libEGL; symbols are resolved with their EGL 1.4 types.
        let instance = unsafe { egl::DynamicInstance::<egl::EGL1_4>::load_required_from(lib) }
            .map_err(|e| ImportError::EglUnavailable(format!("{e:?}")))?;

        let display = instance.get_current_display().ok_or(ImportError::NoDisplay)?;
        let extensions = instance
            .query_string(Some(display), egl::EXTENSIONS)
            .map_err(|_| ImportError::NoDisplay)?
            .to_string_lossy()
            .into_owned();
        for ext in REQUIRED_EXTENSIONS {
            if !extensions.split_whitespace().any(|e| e == ext) {
                return Err(ImportError::MissingExtension(ext));
            }
        }

        let create_image: CreateImageKhrFn = lookup(&instance, "eglCreateImageKHR")?;
        let destroy_image: DestroyImageKhrFn = lookup(&instance, "eglDestroyImageKHR")?;
        let image_target_texture: ImageTargetTexture2dOesFn =
            lookup(&instance, "glEGLImageTargetTexture2DOES")?;

        // SAFETY: the GL context is current on this thread.
        let texture = unsafe {
            let texture = gl.create_texture().map_err(ImportError::Texture)?;
            gl.bind_texture(GL_TEXTURE_EXTERNAL_OES, Some(texture));
            gl.tex_parameter_i32(GL_TEXTURE_EXTERNAL_OES, glow::TEXTURE_MIN_FILTER, glow::LINEAR as i32);
            gl.tex_parameter_i32(GL_TEXTURE_EXTERNAL_OES, glow::TEXTURE_MAG_FILTER, glow::LINEAR as i32);
            gl.tex_parameter_i32(GL_TEXTURE_EXTERNAL_OES, glow::TEXTURE_WRAP_S, glow::CLAMP_TO_EDGE as i32);
            gl.tex_parameter_i32(GL_TEXTURE_EXTERNAL_OES, glow::TEXTURE_WRAP_T, glow::CLAMP_TO_EDGE as i32);
            gl.bind_texture(GL_TEXTURE_EXTERNAL_OES, None);
            texture
        };

        info!("EGL dmabuf import ready (external texture {})", texture.0);
        Ok(Self {
            gl,
            egl: instance,
            display,
            create_image,
            destroy_image,
            image_target_texture,
            texture,
            live_images: 0,
        })
    }

    pub fn texture(&self) -> NonZeroU32 {
        self.texture.0
    }

    fn egl_error(&self) -> String {
        match self.egl.get_error() {
            Some(e) => e.to_string(),
            None => "no EGL error recorded".to_string(),
        }
    }
}

impl ImageImporter for EglImporter {
    type Image = EglImage;

    fn import_image(
        &mut self,
        handle: BorrowedFd<'_>,
        layout: &ImageLayout,
    ) -> Result<EglImage, ImportError> {
        let attribs = dma_buf_attributes(handle.as_raw_fd(), layout)?;
        // SAFETY: `attribs` is EGL_NONE-terminated and outlives the call; EGL
        // dups the fd, so `handle` only needs to be valid for the call.
        let raw = unsafe {
            (self.create_image)(
                self.display.as_ptr(),
                ptr::null_mut(),
                EGL_LINUX_DMA_BUF_EXT,
                ptr::null_mut(),
                attribs.as_ptr(),
            )
        };
        if raw.is_null() {
            return Err(ImportError::CreateImage {
                fourcc: layout.drm_fourcc,
                width: layout.width,
                height: layout.height,
                reason: self.egl_error(),
            });
        }
        self.live_images += 1;
        debug!(
            "Imported dmabuf fd {} as EGL image {:?} ({} {}x{})",
            handle.as_raw_fd(),
            raw,
            layout.drm_fourcc,
            layout.width,
            layout.height
        );
        Ok(EglImage { raw, layout: layout.clone() })
    }

    fn bind_as_texture(&mut self, image: &EglImage, buffer: BufferIndex) -> Result<BoundTexture, ImportError> {
        // SAFETY: the context is current; `image.raw` is a live EGL image.
        let code = unsafe {
            self.gl.bind_texture(GL_TEXTURE_EXTERNAL_OES, Some(self.texture));
            (self.image_target_texture)(GL_TEXTURE_EXTERNAL_OES, image.raw);
            self.gl.get_error()
        };
        if code != glow::NO_ERROR {
            return Err(ImportError::Bind { index: buffer, code });
        }
        Ok(BoundTexture { texture: self.texture.0, buffer })
    }

    fn release_image(&mut self, image: EglImage) {
        // SAFETY: `image.raw` came from this display and is destroyed once.
        let ok = unsafe { (self.destroy_image)(self.display.as_ptr(), image.raw) };
        if ok == 0 {
            warn!("eglDestroyImageKHR failed: {}", self.egl_error());
        }
        self.live_images = self.live_images.saturating_sub(1);
    }
}

impl Drop for EglImporter {
    fn drop(&mut self) {
        if self.live_images > 0 {
            warn!("{} EGL image(s) still alive at importer drop", self.live_images);
        }
        // SAFETY: the texture was created on this context and is no longer bound.
        unsafe { self.gl.delete_texture(self.texture) };
        debug!("External texture deleted");
    }
}
