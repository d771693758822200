use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use emocam_core::dataset::Dataset;
use emocam_core::overlay::{self, ImageSurface, OverlayStyle};
use emocam_core::{BufferTracker, Emotion, OnnxEmotionClassifier, RegionPreprocessor, ScrfdLocalizer};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod offline;

#[zbus::proxy(
    interface = "org.emocam.Detector1",
    default_service = "org.emocam.Detector1",
    default_path = "/org/emocam/Detector1"
)]
trait Detector {
    fn status(&self) -> zbus::Result<String>;
    fn detections(&self) -> zbus::Result<String>;
    fn save_overlay(&self, path: &str) -> zbus::Result<bool>;
}

#[derive(Parser)]
#[command(name = "emocam", about = "emocam facial emotion recognition CLI")]
struct Cli {
    /// Directory containing the ONNX models
    #[arg(long, global = true, default_value_os_t = emocam_core::default_model_dir())]
    model_dir: PathBuf,

    /// Face localizer model, relative to the model directory
    #[arg(long, global = true, default_value = "det_500m.onnx")]
    localizer_model: PathBuf,

    /// Emotion classifier model, relative to the model directory
    #[arg(long, global = true, default_value = "emotion_fer.onnx")]
    classifier_model: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect faces and classify emotions in an image file
    Detect {
        image: PathBuf,
        /// Write the image with the overlay composited on top
        #[arg(long)]
        annotate: Option<PathBuf>,
        /// Draw per-emotion probability bars beside each face
        #[arg(long)]
        bars: bool,
        /// Font for overlay labels
        #[arg(long)]
        font: Option<PathBuf>,
        /// Pixels added to each axis of a localized face box
        #[arg(long, default_value_t = 20.0)]
        padding: f32,
    },
    /// List V4L2 capture devices
    Devices,
    /// Show daemon status
    Status,
    /// Follow the daemon's detections
    Watch {
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,
    },
    /// Ask the daemon to save its current overlay as a PNG
    Snapshot { path: PathBuf },
    /// Measure classifier accuracy on a labeled dataset split
    Evaluate {
        csv: PathBuf,
        #[arg(long, default_value = "PublicTest")]
        split: String,
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Detect {
            image,
            annotate,
            bars,
            font,
            padding,
        } => {
            let localizer = cli.model_dir.join(&cli.localizer_model);
            let classifier = cli.model_dir.join(&cli.classifier_model);
            let overlay_request = annotate.map(|out| (out, bars, font));
            detect(&localizer, &classifier, &image, overlay_request, padding)?
        }
        Commands::Devices => {
            let devices = emocam_hw::Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for dev in devices {
                println!("{}\t{} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
        Commands::Status => {
            let proxy = connect().await?;
            let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Watch { interval_ms } => watch(Duration::from_millis(interval_ms)).await?,
        Commands::Snapshot { path } => {
            let path = if path.is_absolute() {
                path
            } else {
                std::env::current_dir()?.join(path)
            };
            let proxy = connect().await?;
            proxy.save_overlay(&path.to_string_lossy()).await?;
            println!("Overlay written to {}", path.display());
        }
        Commands::Evaluate { csv, split, limit } => {
            let model = cli.model_dir.join(&cli.classifier_model);
            evaluate(&model, &csv, &split, limit)?
        }
    }

    Ok(())
}

async fn connect() -> Result<DetectorProxy<'static>> {
    let conn = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus")?;
    DetectorProxy::new(&conn)
        .await
        .context("emocamd is not running")
}

/// Annotated output path, probability bars, label font.
type OverlayRequest = (PathBuf, bool, Option<PathBuf>);

fn detect(
    localizer_model: &Path,
    classifier_model: &Path,
    image_path: &Path,
    overlay_request: Option<OverlayRequest>,
    padding: f32,
) -> Result<()> {
    let image = image::open(image_path)
        .with_context(|| format!("failed to open {}", image_path.display()))?
        .to_rgb8();

    let mut localizer = ScrfdLocalizer::load(localizer_model)?;
    let mut classifier = OnnxEmotionClassifier::load(classifier_model)?;
    let preprocessor = RegionPreprocessor::new(BufferTracker::new());

    let detections =
        offline::detect_image(&image, &mut localizer, &mut classifier, &preprocessor, padding)?;
    println!("{}", serde_json::to_string_pretty(&detections)?);

    if let Some((out, bars, font)) = overlay_request {
        let font = font.as_deref().map(ImageSurface::load_font).transpose()?;
        let style = OverlayStyle {
            probability_bars: bars,
            ..OverlayStyle::default()
        };
        let layer = overlay::render_to_image(
            detections.width,
            detections.height,
            &detections.results,
            &style,
            font.as_ref(),
        );
        let mut base = image::DynamicImage::ImageRgb8(image).to_rgba8();
        image::imageops::overlay(&mut base, &layer, 0, 0);
        base.save(&out)
            .with_context(|| format!("failed to write {}", out.display()))?;
        eprintln!("Annotated image written to {}", out.display());
    }

    Ok(())
}

async fn watch(interval: Duration) -> Result<()> {
    let proxy = connect().await?;
    let mut ticker = tokio::time::interval(interval);
    let mut last_sequence = None;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = ticker.tick() => {}
        }

        let detections: serde_json::Value = serde_json::from_str(&proxy.detections().await?)?;
        let sequence = detections["sequence"].as_u64();
        if sequence == last_sequence {
            continue;
        }
        last_sequence = sequence;

        let labels: Vec<String> = detections["results"]
            .as_array()
            .map(|results| {
                results
                    .iter()
                    .map(|r| {
                        let emotion = r["dominant"][0].as_str().unwrap_or("?");
                        let p = r["dominant"][1].as_f64().unwrap_or(0.0);
                        format!("{emotion} ({:.1}%)", p * 100.0)
                    })
                    .collect()
            })
            .unwrap_or_default();

        println!(
            "#{:<6} {} face(s) {}",
            sequence.unwrap_or(0),
            labels.len(),
            labels.join(", ")
        );
    }
}

fn evaluate(classifier_model: &Path, csv: &Path, split: &str, limit: Option<usize>) -> Result<()> {
    let dataset = Dataset::load(csv, split)?;
    if dataset.is_empty() {
        anyhow::bail!("no usable {split} rows in {}", csv.display());
    }

    let mut classifier = OnnxEmotionClassifier::load(classifier_model)?;
    let tracker = BufferTracker::new();
    let tally = offline::evaluate(&dataset, &mut classifier, &tracker, limit);

    println!(
        "{split}: {} samples, accuracy {:.2}% ({} skipped rows, {} failed)",
        tally.evaluated(),
        tally.accuracy() * 100.0,
        dataset.skipped,
        tally.failed
    );
    for emotion in Emotion::ALL {
        match tally.class_accuracy(emotion) {
            Some(acc) => println!(
                "  {:<8} {:>6.2}%  ({}/{})",
                emotion.label(),
                acc * 100.0,
                tally.correct[emotion.index()],
                tally.total[emotion.index()]
            ),
            None => println!("  {:<8}      -  (0 samples)", emotion.label()),
        }
    }

    tracing::debug!(
        live = tracker.live(),
        peak = tracker.peak(),
        allocated = tracker.total_allocated(),
        "buffer accounting"
    );
    Ok(())
}
