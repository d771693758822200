use crate::config::Config;
use emocam_core::classifier::ClassifierError;
use emocam_core::localizer::LocalizerError;
use emocam_core::{
    classify_regions, BufferTracker, EmotionClassifier, FaceLocalizer, FrameDetections,
    OnnxEmotionClassifier, RegionPreprocessor, ScrfdLocalizer,
};
use emocam_hw::{Camera, CameraError, FrameSource, StillImageSource};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("face localizer: {0}")]
    Localizer(#[from] LocalizerError),
    #[error("emotion classifier: {0}")]
    Classifier(#[from] ClassifierError),
    #[error("{0}")]
    Camera(#[from] CameraError),
}

impl EngineError {
    /// User-facing status line for a setup failure.
    pub fn status_message(&self) -> String {
        match self {
            Self::Camera(e) => format!("Camera error: {e}"),
            other => format!("Error: {other}"),
        }
    }
}

/// Lifecycle of the detection loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    Uninitialized,
    ModelsLoading,
    CameraSetup,
    Ready,
    DetectingFrame,
    /// Setup failed; holds the status line. No retry.
    Failed(String),
    Stopped,
}

impl PipelineState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::ModelsLoading => "models_loading",
            Self::CameraSetup => "camera_setup",
            Self::Ready => "ready",
            Self::DetectingFrame => "detecting_frame",
            Self::Failed(_) => "failed",
            Self::Stopped => "stopped",
        }
    }

    /// Status line shown to the user.
    pub fn status_message(&self) -> String {
        match self {
            Self::Uninitialized => "Initializing...".to_string(),
            Self::ModelsLoading => "Loading models...".to_string(),
            Self::CameraSetup => "Models loaded. Setting up webcam...".to_string(),
            Self::Ready | Self::DetectingFrame => "Ready".to_string(),
            Self::Failed(message) => message.clone(),
            Self::Stopped => "Stopped".to_string(),
        }
    }
}

/// Model loading and frame source boundaries of the pipeline.
///
/// Everything is constructed on the engine thread, so the produced
/// resources need not be `Send`.
pub trait PipelineBackend: Send + 'static {
    type Localizer: FaceLocalizer;
    type Classifier: EmotionClassifier;
    type Source: FrameSource;

    fn load_localizer(&mut self) -> Result<Self::Localizer, EngineError>;
    fn load_classifier(&mut self) -> Result<Self::Classifier, EngineError>;
    fn open_source(&mut self) -> Result<Self::Source, EngineError>;
}

/// ONNX models plus a V4L2 camera (or a still image when configured).
pub struct OnnxCameraBackend {
    localizer_path: PathBuf,
    classifier_path: PathBuf,
    camera_device: String,
    still_image: Option<PathBuf>,
    frame_width: u32,
    frame_height: u32,
}

impl OnnxCameraBackend {
    pub fn from_config(config: &Config) -> Self {
        Self {
            localizer_path: config.localizer_model_path(),
            classifier_path: config.classifier_model_path(),
            camera_device: config.camera_device.clone(),
            still_image: config.still_image.clone(),
            frame_width: config.frame_width,
            frame_height: config.frame_height,
        }
    }
}

impl PipelineBackend for OnnxCameraBackend {
    type Localizer = ScrfdLocalizer;
    type Classifier = OnnxEmotionClassifier;
    type Source = Box<dyn FrameSource>;

    fn load_localizer(&mut self) -> Result<ScrfdLocalizer, EngineError> {
        let localizer = ScrfdLocalizer::load(&self.localizer_path)?;
        tracing::info!(path = %self.localizer_path.display(), "face localizer loaded");
        Ok(localizer)
    }

    fn load_classifier(&mut self) -> Result<OnnxEmotionClassifier, EngineError> {
        let classifier = OnnxEmotionClassifier::load(&self.classifier_path)?;
        tracing::info!(path = %self.classifier_path.display(), "emotion classifier loaded");
        Ok(classifier)
    }

    fn open_source(&mut self) -> Result<Box<dyn FrameSource>, EngineError> {
        if let Some(path) = &self.still_image {
            return Ok(Box::new(StillImageSource::open(path)?));
        }

        let camera = Camera::open(&self.camera_device, self.frame_width, self.frame_height)?;
        tracing::info!(
            device = %self.camera_device,
            width = camera.width,
            height = camera.height,
            fourcc = ?camera.fourcc,
            "camera opened"
        );
        Ok(Box::new(camera))
    }
}

/// Loop timing and region geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopSettings {
    pub target_fps: f32,
    pub region_padding: f32,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            target_fps: 30.0,
            region_padding: 20.0,
        }
    }
}

impl LoopSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            target_fps: config.target_fps,
            region_padding: config.region_padding,
        }
    }

    /// Time budget of one cycle. Falls back to the default rate when
    /// `target_fps` cannot be turned into a duration.
    pub fn frame_interval(&self) -> Duration {
        let fallback = Duration::from_secs(1) / 30;
        if self.target_fps > 0.0 {
            Duration::try_from_secs_f32(1.0 / self.target_fps).unwrap_or(fallback)
        } else {
            fallback
        }
    }
}

/// Running counters for the detection loop.
#[derive(Debug, Default)]
pub struct EngineStats {
    cycles: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    regions_skipped: AtomicU64,
    regions_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Cycles that published detections.
    pub cycles: u64,
    /// Cycles with no frame available.
    pub skipped: u64,
    /// Cycles abandoned on a capture, localizer, or panic failure.
    pub failed: u64,
    /// Regions that were off-frame or undetectable.
    pub regions_skipped: u64,
    /// Regions whose classification failed.
    pub regions_failed: u64,
}

impl EngineStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            regions_skipped: self.regions_skipped.load(Ordering::Relaxed),
            regions_failed: self.regions_failed.load(Ordering::Relaxed),
        }
    }
}

/// What one detection cycle produced.
#[derive(Debug)]
pub enum CycleOutcome {
    Published(FrameDetections),
    Skipped,
    Failed,
}

/// Loaded models and frame source, owned by the engine thread.
pub struct Pipeline<L, C, S> {
    localizer: L,
    classifier: C,
    source: S,
    preprocessor: RegionPreprocessor,
    padding: f32,
    sequence: u64,
    stats: Arc<EngineStats>,
}

impl<L, C, S> Pipeline<L, C, S>
where
    L: FaceLocalizer,
    C: EmotionClassifier,
    S: FrameSource,
{
    pub fn new(
        localizer: L,
        classifier: C,
        source: S,
        tracker: BufferTracker,
        padding: f32,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            localizer,
            classifier,
            source,
            preprocessor: RegionPreprocessor::new(tracker),
            padding,
            sequence: 0,
            stats,
        }
    }

    /// Run one detect → preprocess → classify pass.
    ///
    /// Errors and panics abandon only this cycle.
    pub fn run_cycle(&mut self) -> CycleOutcome {
        match panic::catch_unwind(AssertUnwindSafe(|| self.detect_frame())) {
            Ok(Ok(Some(detections))) => {
                EngineStats::bump(&self.stats.cycles);
                CycleOutcome::Published(detections)
            }
            Ok(Ok(None)) => {
                EngineStats::bump(&self.stats.skipped);
                CycleOutcome::Skipped
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "detection cycle failed");
                EngineStats::bump(&self.stats.failed);
                CycleOutcome::Failed
            }
            Err(payload) => {
                tracing::warn!(panic = %panic_message(payload.as_ref()), "detection cycle panicked");
                EngineStats::bump(&self.stats.failed);
                CycleOutcome::Failed
            }
        }
    }

    fn detect_frame(&mut self) -> Result<Option<FrameDetections>, EngineError> {
        if !self.source.is_ready() {
            tracing::trace!("frame source not ready");
            return Ok(None);
        }
        let Some(frame) = self.source.capture()? else {
            return Ok(None);
        };

        let faces = self.localizer.locate(&frame.data, frame.width, frame.height)?;
        let classified = classify_regions(
            &frame.data,
            frame.width,
            frame.height,
            &faces,
            self.padding,
            &self.preprocessor,
            &mut self.classifier,
        );
        EngineStats::add(&self.stats.regions_skipped, classified.skipped);
        EngineStats::add(&self.stats.regions_failed, classified.failed);

        self.sequence += 1;
        Ok(Some(FrameDetections {
            sequence: self.sequence,
            width: frame.width,
            height: frame.height,
            results: classified.results,
        }))
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct Shared {
    state_tx: watch::Sender<PipelineState>,
    detections_tx: watch::Sender<Arc<FrameDetections>>,
    stop: AtomicBool,
    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
    /// Set once the engine thread is done with the pipeline.
    exited: Mutex<bool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<EngineStats>,
    tracker: BufferTracker,
}

impl Shared {
    fn new(stop_tx: mpsc::Sender<()>) -> Self {
        let (state_tx, _) = watch::channel(PipelineState::Uninitialized);
        let (detections_tx, _) = watch::channel(Arc::new(FrameDetections::default()));
        Self {
            state_tx,
            detections_tx,
            stop: AtomicBool::new(false),
            stop_tx: Mutex::new(Some(stop_tx)),
            exited: Mutex::new(false),
            thread: Mutex::new(None),
            stats: Arc::new(EngineStats::default()),
            tracker: BufferTracker::new(),
        }
    }

    /// Record that the engine thread has finished. Pairs with
    /// [`EngineHandle::stop`] under the `exited` lock so a stop racing
    /// the thread's exit still ends in `Stopped`.
    fn mark_exited(&self) {
        let mut exited = lock(&self.exited);
        *exited = true;
        if self.stop_requested() {
            self.set_state(PipelineState::Stopped);
        }
    }

    fn set_state(&self, state: PipelineState) {
        let previous = self.state_tx.send_replace(state.clone());
        let steady = matches!(
            (&previous, &state),
            (PipelineState::Ready, PipelineState::DetectingFrame)
                | (PipelineState::DetectingFrame, PipelineState::Ready)
        );
        if previous != state && !steady {
            tracing::info!(state = state.name(), status = %state.status_message(), "engine state changed");
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn fail(&self, error: &EngineError) {
        tracing::error!(error = %error, "pipeline setup failed");
        self.set_state(PipelineState::Failed(error.status_message()));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<Shared>,
}

impl EngineHandle {
    pub fn state(&self) -> PipelineState {
        self.shared.state_tx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.shared.state_tx.subscribe()
    }

    pub fn subscribe_detections(&self) -> watch::Receiver<Arc<FrameDetections>> {
        self.shared.detections_tx.subscribe()
    }

    /// Most recently published detections.
    pub fn latest(&self) -> Arc<FrameDetections> {
        Arc::clone(&self.shared.detections_tx.borrow())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Transient buffers currently alive. Zero between cycles.
    pub fn live_buffers(&self) -> usize {
        self.shared.tracker.live()
    }

    /// Request teardown. Safe from any state and more than once; wakes a
    /// pending reschedule so no further cycle starts.
    pub fn stop(&self) {
        if !self.shared.stop.swap(true, Ordering::AcqRel) {
            tracing::info!("engine stop requested");
        }
        if let Some(tx) = lock(&self.shared.stop_tx).take() {
            let _ = tx.send(());
        }
        if *lock(&self.shared.exited) {
            self.shared.set_state(PipelineState::Stopped);
        }
    }

    /// Stop and wait for the engine thread to release its resources.
    pub fn shutdown(&self) {
        self.stop();
        let thread = lock(&self.shared.thread).take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                tracing::warn!("engine thread panicked during teardown");
            }
        }
        self.shared.set_state(PipelineState::Stopped);
    }
}

/// Spawn the detection loop on a dedicated OS thread.
///
/// The thread loads both models, opens the frame source, then runs one
/// cycle per frame interval until stopped. A cycle that overruns its
/// interval is followed immediately by the next; missed ticks are not
/// made up.
pub fn spawn_engine<B: PipelineBackend>(backend: B, settings: LoopSettings) -> EngineHandle {
    let (stop_tx, stop_rx) = mpsc::channel();
    let shared = Arc::new(Shared::new(stop_tx));

    let thread_shared = Arc::clone(&shared);
    let thread = std::thread::Builder::new()
        .name("emocam-engine".into())
        .spawn(move || run_engine(backend, settings, &thread_shared, &stop_rx))
        .expect("failed to spawn engine thread");
    *lock(&shared.thread) = Some(thread);

    EngineHandle { shared }
}

fn run_engine<B: PipelineBackend>(
    mut backend: B,
    settings: LoopSettings,
    shared: &Shared,
    stop_rx: &mpsc::Receiver<()>,
) {
    tracing::info!(
        fps = settings.target_fps,
        padding = settings.region_padding,
        "engine thread started"
    );

    let Some(mut pipeline) = setup(&mut backend, settings, shared) else {
        shared.mark_exited();
        tracing::info!("engine thread exiting before detection loop");
        return;
    };

    shared.set_state(PipelineState::Ready);
    let interval = settings.frame_interval();

    while !shared.stop_requested() {
        let started = Instant::now();
        shared.set_state(PipelineState::DetectingFrame);
        let outcome = pipeline.run_cycle();

        if shared.stop_requested() {
            break;
        }
        if let CycleOutcome::Published(detections) = outcome {
            shared.detections_tx.send_replace(Arc::new(detections));
        }
        shared.set_state(PipelineState::Ready);

        let wait = interval.saturating_sub(started.elapsed());
        match stop_rx.recv_timeout(wait) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    drop(pipeline);
    shared.set_state(PipelineState::Stopped);
    shared.mark_exited();
    tracing::info!(stats = ?shared.stats.snapshot(), "engine thread exiting");
}

/// Load both models and open the source, honoring stop requests between stages.
fn setup<B: PipelineBackend>(
    backend: &mut B,
    settings: LoopSettings,
    shared: &Shared,
) -> Option<Pipeline<B::Localizer, B::Classifier, B::Source>> {
    shared.set_state(PipelineState::ModelsLoading);

    let localizer = backend.load_localizer().map_err(|e| shared.fail(&e)).ok()?;
    if shared.stop_requested() {
        return None;
    }
    let classifier = backend.load_classifier().map_err(|e| shared.fail(&e)).ok()?;
    if shared.stop_requested() {
        return None;
    }

    shared.set_state(PipelineState::CameraSetup);
    let source = backend.open_source().map_err(|e| shared.fail(&e)).ok()?;
    if shared.stop_requested() {
        return None;
    }

    let (width, height) = source.dimensions();
    tracing::info!(width, height, "frame source ready");

    Some(Pipeline::new(
        localizer,
        classifier,
        source,
        shared.tracker.clone(),
        settings.region_padding,
        Arc::clone(&shared.stats),
    ))
}
