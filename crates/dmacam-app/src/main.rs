mod signals;
mod viewer;

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use dmacam_capture::{CaptureStream, DeviceHandle};
use dmacam_core::CaptureConfig;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use viewer::ViewerApp;

fn main() -> Result<()> {
    // RUST_LOG=debug for per-step detail, trace for per-frame.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();

    info!("dmacam v{}", env!("CARGO_PKG_VERSION"));

    match run() {
        Ok(()) => {
            info!("dmacam exited cleanly.");
            Ok(())
        }
        Err(e) => {
            error!("Fatal error: {:#}", e);
            Err(e)
        }
    }
}

fn run() -> Result<()> {
    let config = CaptureConfig::load().context("Loading configuration")?;
    info!(
        "Config: device={} resolution={} format={} buffers={} refresh={:?} sync={:?}",
        config.device.display(),
        config.resolution,
        config.pixel_format,
        config.buffer_count,
        config.refresh,
        config.sync
    );

    let shutdown = signals::install().context("Installing SIGINT/SIGTERM handlers")?;

    // Device-side setup happens before any window exists so its failures exit
    // without ever opening one.
    let handle = DeviceHandle::open(&config.device)
        .with_context(|| format!("Opening capture device {}", config.device.display()))?;
    let stream = CaptureStream::prepare(handle, &config).context("Preparing capture stream")?;

    let granted = stream.format().granted;
    let title = format!(
        "dmacam: {} {} from {}",
        stream.format().encoding,
        granted.resolution(),
        config.device.display()
    );

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_title(&title)
            .with_inner_size([granted.width as f32, granted.height as f32])
            .with_resizable(true),
        renderer: eframe::Renderer::Glow,
        vsync: true,
        ..Default::default()
    };

    let failure: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let failure_app = Arc::clone(&failure);

    eframe::run_native(
        "dmacam",
        options,
        Box::new(move |cc| -> Result<Box<dyn eframe::App>, Box<dyn std::error::Error + Send + Sync>> {
            let app = ViewerApp::new(cc, stream, &config, failure_app, shutdown)
                .context("Starting GPU import")?;
            Ok(Box::new(app))
        }),
    )
    .map_err(|e| anyhow!("Window host failed: {e}"))?;

    let recorded = failure.lock().map_err(|_| anyhow!("failure slot poisoned"))?.take();
    if let Some(reason) = recorded {
        bail!("Capture loop stopped: {reason}");
    }
    Ok(())
}
