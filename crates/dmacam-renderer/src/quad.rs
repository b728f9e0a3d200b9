//! Full-viewport quad sampling the external texture.
//!
//! No vertex buffers: the four strip corners come from `gl_VertexID`. An empty
//! VAO is still bound because core profiles refuse to draw without one.

use std::sync::Arc;

use dmacam_core::errors::RenderError;
use dmacam_core::BoundTexture;
use glow::HasContext;
use tracing::{debug, trace};

use crate::egl::GL_TEXTURE_EXTERNAL_OES;
use crate::FrameRenderer;

const VERTEX_BODY: &str = r#"
out vec2 v_uv;
const vec2 CORNERS[4] = vec2[4](
    vec2(-1.0, -1.0), vec2(1.0, -1.0), vec2(-1.0, 1.0), vec2(1.0, 1.0)
);
void main() {
    vec2 p = CORNERS[gl_VertexID];
    // Row 0 of the captured image is the top scanline.
    v_uv = vec2(p.x * 0.5 + 0.5, 0.5 - p.y * 0.5);
    gl_Position = vec4(p, 0.0, 1.0);
}
"#;

const FRAGMENT_BODY: &str = r#"
uniform samplerExternalOES u_frame;
in vec2 v_uv;
out vec4 out_color;
void main() {
    out_color = vec4(texture(u_frame, v_uv).rgb, 1.0);
}
"#;

/// Shader headers for the context flavour eframe gave us.
fn headers(embedded: bool) -> (&'static str, &'static str) {
    if embedded {
        (
            "#version 300 es\n",
            "#version 300 es\n#extension GL_OES_EGL_image_external_essl3 : require\nprecision mediump float;\n",
        )
    } else {
        ("#version 140\n", "#version 140\n#extension GL_OES_EGL_image_external : require\n")
    }
}

pub struct ExternalQuad {
    gl: Arc<glow::Context>,
    program: glow::Program,
    vertex_array: glow::VertexArray,
    draws: u64,
}

// SAFETY: GL object names are plain integers; every call is made on the thread
// that owns the context.
unsafe impl Send for ExternalQuad {}

impl ExternalQuad {
    pub fn new(gl: Arc<glow::Context>) -> Result<Self, RenderError> {
        let (vs_header, fs_header) = headers(gl.version().is_embedded);

        // SAFETY: the GL context is current on this thread.
        unsafe {
            let program = gl.create_program().map_err(RenderError::Resource)?;
            let sources = [
                (glow::VERTEX_SHADER, format!("{vs_header}{VERTEX_BODY}")),
                (glow::FRAGMENT_SHADER, format!("{fs_header}{FRAGMENT_BODY}")),
            ];

            let mut shaders = Vec::with_capacity(sources.len());
            for (kind, source) in &sources {
                let shader = gl.create_shader(*kind).map_err(RenderError::Resource)?;
                gl.shader_source(shader, source);
                gl.compile_shader(shader);
                if !gl.get_shader_compile_status(shader) {
                    let log = gl.get_shader_info_log(shader);
                    gl.delete_shader(shader);
                    for s in shaders {
                        gl.delete_shader(s);
                    }
                    gl.delete_program(program);
                    return Err(RenderError::Shader(log));
                }
                gl.attach_shader(program, shader);
                shaders.push(shader);
            }

            gl.link_program(program);
            let linked = gl.get_program_link_status(program);
            for shader in shaders {
                gl.detach_shader(program, shader);
                gl.delete_shader(shader);
            }
            if !linked {
                let log = gl.get_program_info_log(program);
                gl.delete_program(program);
                return Err(RenderError::Link(log));
            }

            let vertex_array = match gl.create_vertex_array() {
                Ok(vao) => vao,
                Err(e) => {
                    gl.delete_program(program);
                    return Err(RenderError::Resource(e));
                }
            };

            gl.use_program(Some(program));
            if let Some(loc) = gl.get_uniform_location(program, "u_frame") {
                gl.uniform_1_i32(Some(&loc), 0);
            }
            gl.use_program(None);

            debug!("External quad program linked");
            Ok(Self { gl, program, vertex_array, draws: 0 })
        }
    }

    pub fn draws(&self) -> u64 {
        self.draws
    }
}

impl FrameRenderer for ExternalQuad {
    type Fence = glow::Fence;

    fn draw(&mut self, texture: &BoundTexture) -> Result<(), RenderError> {
        let gl = &self.gl;
        // SAFETY: the context is current; all names were created on it.
        unsafe {
            gl.use_program(Some(self.program));
            gl.active_texture(glow::TEXTURE0);
            gl.bind_texture(GL_TEXTURE_EXTERNAL_OES, Some(glow::NativeTexture(texture.texture)));
            gl.bind_vertex_array(Some(self.vertex_array));
            gl.draw_arrays(glow::TRIANGLE_STRIP, 0, 4);
            gl.bind_vertex_array(None);
            gl.bind_texture(GL_TEXTURE_EXTERNAL_OES, None);
            gl.use_program(None);
        }
        self.draws += 1;
        trace!("Drew buffer {}", texture.buffer);
        Ok(())
    }

    fn insert_fence(&mut self) -> Result<glow::Fence, RenderError> {
        // SAFETY: the context is current.
        unsafe { self.gl.fence_sync(glow::SYNC_GPU_COMMANDS_COMPLETE, 0) }.map_err(RenderError::Fence)
    }

    fn fence_signaled(&mut self, fence: &glow::Fence) -> bool {
        // SAFETY: `fence` is a live sync object on this context; zero timeout.
        let status = unsafe { self.gl.client_wait_sync(*fence, 0, 0) };
        status == glow::ALREADY_SIGNALED || status == glow::CONDITION_SATISFIED
    }

    fn release_fence(&mut self, fence: glow::Fence) {
        // SAFETY: each fence is deleted once.
        unsafe { self.gl.delete_sync(fence) };
    }
}

impl Drop for ExternalQuad {
    fn drop(&mut self) {
        // SAFETY: names were created on this context.
        unsafe {
            self.gl.delete_vertex_array(self.vertex_array);
            self.gl.delete_program(self.program);
        }
    }
}
