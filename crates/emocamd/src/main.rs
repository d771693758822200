use anyhow::{Context, Result};
use emocam_core::overlay::{ImageSurface, OverlayStyle};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::Config;
use dbus_interface::DetectorService;
use engine::{spawn_engine, LoopSettings, OnnxCameraBackend};

const BUS_NAME: &str = "org.emocam.Detector1";
const OBJECT_PATH: &str = "/org/emocam/Detector1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "emocamd starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        camera = %config.camera_device,
        model_dir = %config.model_dir.display(),
        still_image = ?config.still_image,
        fps = config.target_fps,
        "configuration loaded"
    );

    let font = match &config.font_path {
        Some(path) => Some(ImageSurface::load_font(path).context("failed to load overlay font")?),
        None => {
            tracing::info!("no overlay font configured; labels omitted from saved overlays");
            None
        }
    };

    let engine = spawn_engine(
        OnnxCameraBackend::from_config(&config),
        LoopSettings::from_config(&config),
    );
    let mut state_rx = engine.subscribe_state();
    let mut last_status = String::new();

    let service = DetectorService {
        engine: engine.clone(),
        font,
        style: OverlayStyle::default(),
    };

    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on the session bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "emocamd ready");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = state_rx.borrow_and_update().status_message();
                if status != last_status {
                    tracing::info!(%status, "pipeline status");
                    last_status = status;
                }
            }
        }
    }

    tracing::info!("emocamd shutting down");
    tokio::task::spawn_blocking(move || engine.shutdown()).await?;

    Ok(())
}
