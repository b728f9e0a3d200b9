use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use dmacam_capture::{CaptureStream, V4l2Device};
use dmacam_core::{CaptureConfig, Resolution};
use dmacam_pipeline::{CaptureLoop, Session};
use dmacam_renderer::{EglImporter, ExternalQuad};
use eframe::egui_glow;
use tracing::{error, info};

type CameraSession = Session<V4l2Device, EglImporter>;

// ── Frame driver ──────────────────────────────────────────────────────────────

/// Everything touched on the GL thread: the session, the renderer and the loop.
struct Pipeline {
    session: CameraSession,
    renderer: ExternalQuad,
    capture_loop: CaptureLoop<glow::Fence>,
}

struct FrameDriver {
    pipeline: Option<Pipeline>,
    rendered: u64,
    max_frames: Option<u64>,
    done: bool,
    failure: Arc<Mutex<Option<String>>>,
}

// SAFETY: the EGL images and GL fences inside `Pipeline` are only used from the
// paint callback and `on_exit`, both of which eframe runs on the thread that
// owns the GL context.
unsafe impl Send for FrameDriver {}

impl FrameDriver {
    /// One loop iteration. Runs inside the paint callback, so the GL context is
    /// current and the viewport is the callback rect.
    fn render_frame(&mut self) {
        let Some(p) = self.pipeline.as_mut() else {
            return;
        };
        match p.capture_loop.step(&mut p.session, &mut p.renderer) {
            Ok(_) => {
                self.rendered += 1;
                if self.max_frames.is_some_and(|max| self.rendered >= max) {
                    info!("Rendered {} frames; closing", self.rendered);
                    self.done = true;
                }
            }
            Err(e) => {
                error!("Capture loop failed: {e}");
                if let Ok(mut slot) = self.failure.lock() {
                    *slot = Some(e.to_string());
                }
                self.done = true;
                self.teardown();
            }
        }
    }

    /// Whether the window should close. An external shutdown request ends
    /// the run like `maxFrames` does.
    fn should_close(&mut self, shutdown: &AtomicBool) -> bool {
        if !self.done && shutdown.load(Ordering::SeqCst) {
            info!("Shutdown signal received after {} frames; closing", self.rendered);
            self.done = true;
        }
        self.done
    }

    fn teardown(&mut self) {
        if let Some(mut p) = self.pipeline.take() {
            p.capture_loop.finish(&mut p.renderer);
            // Session first: its images must go before the renderer's program.
            drop(p.session);
            drop(p.renderer);
        }
    }
}

fn lock(driver: &Mutex<FrameDriver>) -> MutexGuard<'_, FrameDriver> {
    driver.lock().unwrap_or_else(|e| e.into_inner())
}

// ── App ───────────────────────────────────────────────────────────────────────

pub struct ViewerApp {
    driver: Arc<Mutex<FrameDriver>>,
    resolution: Resolution,
    shutdown: &'static AtomicBool,
}

impl ViewerApp {
    pub fn new(
        cc: &eframe::CreationContext<'_>,
        stream: CaptureStream<V4l2Device>,
        config: &CaptureConfig,
        failure: Arc<Mutex<Option<String>>>,
        shutdown: &'static AtomicBool,
    ) -> Result<Self> {
        let gl = cc
            .gl
            .clone()
            .ok_or_else(|| anyhow!("eframe did not provide a glow context"))?;

        let resolution = stream.format().granted.resolution();
        let importer = EglImporter::new(Arc::clone(&gl))?;
        let renderer = ExternalQuad::new(gl)?;
        let session = Session::start(stream, importer, config.refresh)?;
        info!("Streaming {} with {:?} sync", resolution, config.sync);

        let driver = FrameDriver {
            pipeline: Some(Pipeline {
                session,
                renderer,
                capture_loop: CaptureLoop::new(config.sync),
            }),
            rendered: 0,
            max_frames: config.max_frames,
            done: false,
            failure,
        };

        Ok(Self { driver: Arc::new(Mutex::new(driver)), resolution, shutdown })
    }

    /// Largest rect of the frame's aspect ratio that fits in `available`.
    fn fitted(&self, available: egui::Rect) -> egui::Rect {
        let aspect = self.resolution.width as f32 / self.resolution.height.max(1) as f32;
        let mut size = available.size();
        if size.x / size.y.max(1.0) > aspect {
            size.x = size.y * aspect;
        } else {
            size.y = size.x / aspect;
        }
        egui::Rect::from_center_size(available.center(), size)
    }
}

impl eframe::App for ViewerApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        if lock(&self.driver).should_close(self.shutdown) {
            ctx.send_viewport_cmd(egui::ViewportCommand::Close);
            return;
        }

        egui::CentralPanel::default()
            .frame(egui::Frame::none().fill(egui::Color32::BLACK))
            .show(ctx, |ui| {
                let rect = self.fitted(ui.max_rect());
                let driver = Arc::clone(&self.driver);
                let callback = egui::PaintCallback {
                    rect,
                    callback: Arc::new(egui_glow::CallbackFn::new(move |_info, _painter| {
                        lock(&driver).render_frame();
                    })),
                };
                ui.painter().add(callback);
            });

        // Vsync paces the loop; reclaim itself never blocks.
        ctx.request_repaint();
    }

    fn on_exit(&mut self, _gl: Option<&glow::Context>) {
        let mut driver = lock(&self.driver);
        driver.teardown();
        info!("Viewer closed after {} frames", driver.rendered);
    }
}
