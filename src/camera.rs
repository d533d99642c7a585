use crate::{
    api::{CameraMetrics, CameraStatus, CameraSummary, DetectionResult},
    image::Image,
    pipeline::Recognition,
    source::{CameraSource, FrameSource},
    worker::{RecognitionInput, RecognitionRequest, RecognizerHandle, SubmitError},
};
use chrono::Utc;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const FRAME_WAIT: Duration = Duration::from_millis(100);
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub frame_queue_size: usize,
    pub detection_interval: Duration,
    pub error_backoff: Duration,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            frame_queue_size: 10,
            detection_interval: Duration::from_millis(200),
            error_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CameraError {
    AlreadyRunning(String),
    NotFound(String),
    StartFailed { id: String, reason: String },
}

impl fmt::Display for CameraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraError::AlreadyRunning(id) => write!(f, "Camera {id} is already running"),
            CameraError::NotFound(id) => write!(f, "Camera {id} not found"),
            CameraError::StartFailed { id, reason } => {
                write!(f, "Failed to start camera {id}: {reason}")
            }
        }
    }
}

impl std::error::Error for CameraError {}

/// State of one running camera, shared by its threads and the HTTP handlers.
pub struct Camera {
    id: String,
    source: CameraSource,
    status: RwLock<CameraStatus>,
    latest_frame: RwLock<Option<Arc<Image>>>,
    frame_sequence: AtomicU64,
    metrics: RwLock<Option<CameraMetrics>>,
    detections: RwLock<Option<DetectionResult>>,
    cancel: CancellationToken,
}

impl fmt::Debug for Camera {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Camera")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("status", &self.status())
            .field("frame_sequence", &self.frame_sequence())
            .finish()
    }
}

impl Camera {
    fn new(id: String, source: CameraSource) -> Self {
        Self {
            id,
            source,
            status: RwLock::new(CameraStatus::Initializing),
            latest_frame: RwLock::new(None),
            frame_sequence: AtomicU64::new(0),
            metrics: RwLock::new(None),
            detections: RwLock::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> &CameraSource {
        &self.source
    }

    pub fn status(&self) -> CameraStatus {
        *self.status.read()
    }

    pub fn latest_frame(&self) -> Option<Arc<Image>> {
        self.latest_frame.read().clone()
    }

    /// Bumped for every captured frame.
    pub fn frame_sequence(&self) -> u64 {
        self.frame_sequence.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> Option<CameraMetrics> {
        self.metrics.read().clone()
    }

    pub fn detections(&self) -> Option<DetectionResult> {
        self.detections.read().clone()
    }

    pub fn fps(&self) -> f32 {
        self.metrics.read().as_ref().map_or(0.0, |metrics| metrics.fps)
    }

    /// Cancelled once the camera is stopped.
    pub fn stopped(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn set_status(&self, status: CameraStatus) -> CameraStatus {
        std::mem::replace(&mut *self.status.write(), status)
    }

    fn record_frame(&self, frame: Arc<Image>, fps: f32, queue_size: usize) {
        *self.latest_frame.write() = Some(frame);
        self.frame_sequence.fetch_add(1, Ordering::AcqRel);

        let previous = self.set_status(CameraStatus::Running);
        if previous == CameraStatus::Error {
            info!(camera_id = %self.id, "Camera recovered");
        }

        let mut metrics = self.metrics.write();
        let detection_time = metrics.as_ref().and_then(|m| m.detection_time);
        *metrics = Some(CameraMetrics {
            timestamp: unix_now(),
            fps: round_fps(fps),
            queue_size,
            status: CameraStatus::Running,
            detection_time,
        });
    }

    fn record_error(&self, queue_size: usize) {
        self.set_status(CameraStatus::Error);
        let mut metrics = self.metrics.write();
        match metrics.as_mut() {
            Some(metrics) => {
                metrics.status = CameraStatus::Error;
                metrics.queue_size = queue_size;
            }
            None => {
                *metrics = Some(CameraMetrics {
                    timestamp: unix_now(),
                    fps: 0.0,
                    queue_size,
                    status: CameraStatus::Error,
                    detection_time: None,
                })
            }
        }
    }

    fn record_detection(&self, recognition: Recognition, detection_time: Duration) {
        let detection_time = round_millis(detection_time);
        *self.detections.write() = Some(DetectionResult {
            timestamp: unix_now(),
            plates: recognition.plates,
            detection_time,
        });
        if let Some(metrics) = self.metrics.write().as_mut() {
            metrics.detection_time = Some(detection_time);
        }
    }
}

fn unix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

fn round_fps(fps: f32) -> f32 {
    (fps * 100.0).round() / 100.0
}

fn round_millis(duration: Duration) -> f64 {
    (duration.as_secs_f64() * 1000.0).round() / 1000.0
}

/// Sleeps up to `duration`, returns true if the token fired meanwhile.
fn wait_or_cancelled(cancel: &CancellationToken, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

struct CameraEntry {
    camera: Arc<Camera>,
    capture_thread: JoinHandle<()>,
    detection_thread: JoinHandle<()>,
}

/// Releases a reserved id when `start` returns or unwinds.
struct StartingGuard<'a> {
    starting: &'a Mutex<HashSet<String>>,
    id: &'a str,
}

impl Drop for StartingGuard<'_> {
    fn drop(&mut self) {
        self.starting.lock().remove(self.id);
    }
}

/// Registry of running cameras keyed by id.
pub struct CameraManager {
    cameras: Mutex<HashMap<String, CameraEntry>>,
    starting: Mutex<HashSet<String>>,
    recognizer: RecognizerHandle,
    settings: CameraSettings,
}

impl CameraManager {
    pub fn new(recognizer: RecognizerHandle, settings: CameraSettings) -> Self {
        Self {
            cameras: Mutex::new(HashMap::new()),
            starting: Mutex::new(HashSet::new()),
            recognizer,
            settings,
        }
    }

    /// Opens `source` and starts the capture and detection threads.
    ///
    /// Blocks until the source is open, call it from a blocking context.
    pub fn start(&self, id: &str, source: CameraSource) -> Result<Arc<Camera>, CameraError> {
        {
            let cameras = self.cameras.lock();
            let mut starting = self.starting.lock();
            if cameras.contains_key(id) || starting.contains(id) {
                return Err(CameraError::AlreadyRunning(id.to_string()));
            }
            starting.insert(id.to_string());
        }
        let _starting = StartingGuard {
            starting: &self.starting,
            id,
        };

        let entry = self.spawn_camera(id, source).map_err(|err| {
            error!(camera_id = %id, error = %err, "Failed to start camera");
            CameraError::StartFailed {
                id: id.to_string(),
                reason: format!("{err:#}"),
            }
        })?;
        let camera = entry.camera.clone();
        self.cameras.lock().insert(id.to_string(), entry);
        info!(camera_id = %id, source = %camera.source(), "Camera started");
        Ok(camera)
    }

    fn spawn_camera(&self, id: &str, source: CameraSource) -> anyhow::Result<CameraEntry> {
        let frame_source = source.build()?;
        let camera = Arc::new(Camera::new(id.to_string(), source));
        let (frame_sender, frame_receiver) =
            crossbeam::channel::bounded(self.settings.frame_queue_size.max(1));
        let (open_sender, open_receiver) = crossbeam::channel::bounded(1);

        let capture_thread = {
            let camera = camera.clone();
            let error_backoff = self.settings.error_backoff;
            std::thread::Builder::new()
                .name(format!("capture-{id}"))
                .spawn(move || {
                    run_capture(camera, frame_source, frame_sender, open_sender, error_backoff)
                })?
        };

        match open_receiver.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = capture_thread.join();
                return Err(err);
            }
            Err(_) => {
                let _ = capture_thread.join();
                anyhow::bail!("Capture thread exited before opening the source");
            }
        }
        camera.set_status(CameraStatus::Running);

        let detection_thread = {
            let detect_camera = camera.clone();
            let recognizer = self.recognizer.clone();
            let settings = self.settings.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("detect-{id}"))
                .spawn(move || run_detection(detect_camera, frame_receiver, recognizer, settings));
            match spawned {
                Ok(handle) => handle,
                Err(err) => {
                    camera.cancel.cancel();
                    join_thread(capture_thread, id, "capture");
                    return Err(err.into());
                }
            }
        };

        Ok(CameraEntry {
            camera,
            capture_thread,
            detection_thread,
        })
    }

    /// Stops both threads and forgets the camera.
    pub fn stop(&self, id: &str) -> Result<(), CameraError> {
        let entry = self
            .cameras
            .lock()
            .remove(id)
            .ok_or_else(|| CameraError::NotFound(id.to_string()))?;

        entry.camera.cancel.cancel();
        join_thread(entry.detection_thread, id, "detection");
        join_thread(entry.capture_thread, id, "capture");
        entry.camera.set_status(CameraStatus::Stopped);
        info!(camera_id = %id, "Camera stopped");
        Ok(())
    }

    pub fn stop_all(&self) {
        let ids: Vec<String> = self.cameras.lock().keys().cloned().collect();
        for id in ids {
            if let Err(err) = self.stop(&id) {
                warn!(camera_id = %id, error = %err, "Failed to stop camera");
            }
        }
    }

    /// Starts configured cameras, failures are logged and skipped.
    pub fn start_all(&self, cameras: Vec<(String, CameraSource)>) -> usize {
        let mut started = 0;
        for (id, source) in cameras {
            match self.start(&id, source) {
                Ok(_) => started += 1,
                Err(err) => warn!(camera_id = %id, error = %err, "Configured camera did not start"),
            }
        }
        started
    }

    pub fn camera(&self, id: &str) -> Result<Arc<Camera>, CameraError> {
        self.cameras
            .lock()
            .get(id)
            .map(|entry| entry.camera.clone())
            .ok_or_else(|| CameraError::NotFound(id.to_string()))
    }

    pub fn list(&self) -> Vec<CameraSummary> {
        let mut cameras: Vec<CameraSummary> = self
            .cameras
            .lock()
            .values()
            .map(|entry| CameraSummary {
                id: entry.camera.id.clone(),
                status: entry.camera.status(),
                fps: entry.camera.fps(),
            })
            .collect();
        cameras.sort_by(|a, b| a.id.cmp(&b.id));
        cameras
    }

    pub fn statuses(&self) -> BTreeMap<String, CameraStatus> {
        self.cameras
            .lock()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.camera.status()))
            .collect()
    }

    pub fn all_metrics(&self) -> BTreeMap<String, CameraMetrics> {
        self.cameras
            .lock()
            .iter()
            .filter_map(|(id, entry)| entry.camera.metrics().map(|m| (id.clone(), m)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.cameras.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for CameraManager {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn join_thread(handle: JoinHandle<()>, id: &str, role: &str) {
    let deadline = Instant::now() + JOIN_TIMEOUT;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!(camera_id = %id, role, "Thread did not stop in time, detaching it");
            return;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    if handle.join().is_err() {
        error!(camera_id = %id, role, "Camera thread panicked");
    }
}

fn run_capture(
    camera: Arc<Camera>,
    mut source: Box<dyn FrameSource>,
    frames: Sender<Arc<Image>>,
    opened: Sender<anyhow::Result<()>>,
    error_backoff: Duration,
) {
    let open_result = source.open();
    let open_failed = open_result.is_err();
    if opened.send(open_result).is_err() || open_failed {
        return;
    }
    drop(opened);

    let mut last_frame_at: Option<Instant> = None;
    while !camera.cancel.is_cancelled() {
        match source.next_frame() {
            Ok(image) => {
                let now = Instant::now();
                let fps = match last_frame_at {
                    Some(previous) => {
                        let dt = now.duration_since(previous).as_secs_f32();
                        if dt > 0.0 { 1.0 / dt } else { 0.0 }
                    }
                    None => 0.0,
                };
                last_frame_at = Some(now);

                let frame = Arc::new(image);
                match frames.try_send(frame.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        trace!(camera_id = %camera.id, "Frame queue full, dropping frame")
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        debug!(camera_id = %camera.id, "Detection thread is gone")
                    }
                }
                camera.record_frame(frame, fps, frames.len());
            }
            Err(err) => {
                error!(camera_id = %camera.id, error = %err, "Failed to read frame");
                camera.record_error(frames.len());
                if wait_or_cancelled(&camera.cancel, error_backoff) {
                    break;
                }
            }
        }
    }
    debug!(camera_id = %camera.id, "Capture thread finished");
}

fn run_detection(
    camera: Arc<Camera>,
    frames: Receiver<Arc<Image>>,
    recognizer: RecognizerHandle,
    settings: CameraSettings,
) {
    let mut last_detection_at: Option<Instant> = None;
    while !camera.cancel.is_cancelled() {
        if let Some(last) = last_detection_at {
            let elapsed = last.elapsed();
            if elapsed < settings.detection_interval {
                wait_or_cancelled(&camera.cancel, settings.detection_interval - elapsed);
                continue;
            }
        }

        let frame = match frames.recv_timeout(FRAME_WAIT) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        // Older queued frames are stale by now
        let frame = frames.try_iter().last().unwrap_or(frame);

        let detection_start_time = Instant::now();
        last_detection_at = Some(detection_start_time);
        match detect(&recognizer, frame) {
            Ok(recognition) => {
                let detection_time = detection_start_time.elapsed();
                debug!(
                    camera_id = %camera.id,
                    plates = recognition.plates.len(),
                    ?detection_time,
                    "Frame processed"
                );
                camera.record_detection(recognition, detection_time);
            }
            Err(err) => match err.downcast_ref::<SubmitError>() {
                Some(SubmitError::NotReady | SubmitError::QueueFull) => {
                    debug!(camera_id = %camera.id, reason = %err, "Skipping detection");
                }
                _ => {
                    error!(camera_id = %camera.id, error = %err, "Detection failed");
                    if wait_or_cancelled(&camera.cancel, settings.error_backoff) {
                        break;
                    }
                }
            },
        }
    }
    debug!(camera_id = %camera.id, "Detection thread finished");
}

fn detect(recognizer: &RecognizerHandle, frame: Arc<Image>) -> anyhow::Result<Recognition> {
    let receiver = recognizer.submit(RecognitionRequest {
        input: RecognitionInput::Frame(frame),
        fallback_full_image: false,
    })?;
    let response = receiver.blocking_recv()?;
    Ok(response.result?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::PlateRead,
        detector::ExecutionProvider,
        image::encode_jpeg,
        pipeline::Recognize,
    };

    struct OnePlate;

    impl Recognize for OnePlate {
        fn recognize(&mut self, _image: &Image, _fallback: bool) -> anyhow::Result<Recognition> {
            Ok(Recognition {
                plates: vec![PlateRead {
                    license_plate: "51F-12345".into(),
                    confidence: 0.87,
                    bbox: [1, 2, 3, 4],
                }],
                ..Default::default()
            })
        }

        fn model_name(&self) -> String {
            "one-plate".into()
        }

        fn execution_provider(&self) -> ExecutionProvider {
            ExecutionProvider::CPU
        }
    }

    fn settings() -> CameraSettings {
        CameraSettings {
            frame_queue_size: 4,
            detection_interval: Duration::from_millis(20),
            error_backoff: Duration::from_millis(20),
        }
    }

    fn frames_dir(count: usize) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let image = Image::from_rgb(32, 24, vec![120; 32 * 24 * 3]).unwrap();
        let jpeg = encode_jpeg(&image, 90).unwrap();
        for i in 0..count {
            std::fs::write(dir.path().join(format!("frame_{i:03}.jpg")), &jpeg).unwrap();
        }
        dir
    }

    fn directory_source(dir: &tempfile::TempDir, loop_frames: bool) -> CameraSource {
        CameraSource::Directory {
            path: dir.path().to_path_buf(),
            fps: 50.0,
            loop_frames,
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn camera_captures_and_detects() {
        let dir = frames_dir(3);
        let recognizer = RecognizerHandle::spawn(Box::new(OnePlate), None, None);
        let manager = CameraManager::new(recognizer, settings());

        let camera = manager.start("gate", directory_source(&dir, true)).unwrap();
        assert_eq!(camera.status(), CameraStatus::Running);
        assert!(wait_until(|| camera.latest_frame().is_some()));
        assert!(wait_until(|| camera.detections().is_some()));

        let detections = camera.detections().unwrap();
        assert_eq!(detections.plates[0].license_plate, "51F-12345");
        assert!(wait_until(|| camera
            .metrics()
            .is_some_and(|m| m.detection_time.is_some())));

        let listed = manager.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "gate");
        assert!(manager.all_metrics().contains_key("gate"));

        manager.stop("gate").unwrap();
        assert_eq!(camera.status(), CameraStatus::Stopped);
        assert!(camera.stopped().is_cancelled());
        assert!(manager.is_empty());
    }

    #[test]
    fn duplicate_start_is_rejected() {
        let dir = frames_dir(2);
        let manager = CameraManager::new(RecognizerHandle::default(), settings());
        manager.start("gate", directory_source(&dir, true)).unwrap();
        let err = manager
            .start("gate", directory_source(&dir, true))
            .unwrap_err();
        assert_eq!(err, CameraError::AlreadyRunning("gate".into()));
    }

    #[test]
    fn failing_source_is_not_registered() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CameraManager::new(RecognizerHandle::default(), settings());
        let err = manager
            .start("empty", directory_source(&dir, true))
            .unwrap_err();
        assert!(matches!(err, CameraError::StartFailed { .. }));
        assert!(manager.camera("empty").is_err());
        assert!(manager.statuses().is_empty());
    }

    #[test]
    fn stopped_camera_can_be_started_again() {
        let dir = frames_dir(2);
        let manager = CameraManager::new(RecognizerHandle::default(), settings());
        manager.start("gate", directory_source(&dir, true)).unwrap();
        manager.stop("gate").unwrap();
        assert_eq!(
            manager.stop("gate").unwrap_err(),
            CameraError::NotFound("gate".into())
        );
        manager.start("gate", directory_source(&dir, true)).unwrap();
        assert_eq!(manager.statuses()["gate"], CameraStatus::Running);
    }

    #[test]
    fn exhausted_source_reports_error() {
        let dir = frames_dir(1);
        let manager = CameraManager::new(RecognizerHandle::default(), settings());
        let camera = manager.start("once", directory_source(&dir, false)).unwrap();
        assert!(wait_until(|| camera.status() == CameraStatus::Error));
        assert!(camera.latest_frame().is_some());
        assert_eq!(camera.metrics().unwrap().status, CameraStatus::Error);
    }

    #[test]
    fn start_all_skips_broken_cameras() {
        let dir = frames_dir(2);
        let missing = tempfile::tempdir().unwrap();
        let manager = CameraManager::new(RecognizerHandle::default(), settings());
        let started = manager.start_all(vec![
            ("ok".into(), directory_source(&dir, true)),
            ("broken".into(), directory_source(&missing, true)),
        ]);
        assert_eq!(started, 1);
        assert_eq!(manager.len(), 1);
    }

    /// Names of the frames handed to the recognizer, in order.
    #[derive(Clone, Default)]
    struct Recorder {
        frames: Arc<Mutex<Vec<Option<String>>>>,
    }

    impl Recorder {
        fn count(&self) -> usize {
            self.frames.lock().len()
        }

        fn names(&self) -> Vec<Option<String>> {
            self.frames.lock().clone()
        }
    }

    struct RecordingRecognizer {
        recorder: Recorder,
    }

    impl Recognize for RecordingRecognizer {
        fn recognize(&mut self, image: &Image, _fallback: bool) -> anyhow::Result<Recognition> {
            self.recorder.frames.lock().push(image.name.clone());
            Ok(Recognition::default())
        }

        fn model_name(&self) -> String {
            "recording".into()
        }

        fn execution_provider(&self) -> ExecutionProvider {
            ExecutionProvider::CPU
        }
    }

    fn recording(recorder: &Recorder) -> RecognizerHandle {
        let recognizer = RecordingRecognizer {
            recorder: recorder.clone(),
        };
        RecognizerHandle::spawn(Box::new(recognizer), None, None)
    }

    fn named_frame(name: &str) -> Arc<Image> {
        let mut frame = Image::from_rgb(8, 8, vec![0; 8 * 8 * 3]).unwrap();
        frame.name = Some(name.to_string());
        Arc::new(frame)
    }

    #[test]
    fn detections_are_rate_limited_to_the_interval() {
        let dir = frames_dir(3);
        let recorder = Recorder::default();
        let manager = CameraManager::new(
            recording(&recorder),
            CameraSettings {
                frame_queue_size: 4,
                detection_interval: Duration::from_millis(300),
                error_backoff: Duration::from_millis(20),
            },
        );
        manager.start("gate", directory_source(&dir, true)).unwrap();

        assert!(wait_until(|| recorder.count() >= 1));
        std::thread::sleep(Duration::from_millis(1000));
        let count = recorder.count();
        manager.stop("gate").unwrap();

        // Frames arrive every 20 ms, detections at most every 300 ms
        assert!((3..=5).contains(&count), "{count} detections in one second");
    }

    #[test]
    fn detection_uses_the_newest_queued_frame() {
        let recorder = Recorder::default();
        let camera = Arc::new(Camera::new(
            "lane".into(),
            CameraSource::Directory {
                path: "/unused".into(),
                fps: 10.0,
                loop_frames: true,
            },
        ));
        let (sender, receiver) = crossbeam::channel::bounded(4);
        for i in 0..4 {
            sender.send(named_frame(&format!("frame_{i}.jpg"))).unwrap();
        }

        let detection = {
            let camera = camera.clone();
            let recognizer = recording(&recorder);
            std::thread::spawn(move || run_detection(camera, receiver, recognizer, settings()))
        };
        assert!(wait_until(|| camera.detections().is_some()));
        camera.cancel.cancel();
        detection.join().unwrap();

        assert_eq!(recorder.names(), vec![Some("frame_3.jpg".to_string())]);
        assert!(sender.is_empty());
    }

    #[test]
    fn full_frame_queue_drops_new_frames_without_blocking() {
        let dir = frames_dir(6);
        let source = CameraSource::Directory {
            path: dir.path().to_path_buf(),
            fps: 200.0,
            loop_frames: false,
        };
        let camera = Arc::new(Camera::new("dock".into(), source.clone()));
        let (frames, queued) = crossbeam::channel::bounded(2);
        let (opened, open_result) = crossbeam::channel::bounded(1);

        let capture = {
            let camera = camera.clone();
            let frame_source = source.build().unwrap();
            std::thread::spawn(move || {
                run_capture(camera, frame_source, frames, opened, Duration::from_millis(20))
            })
        };
        open_result.recv().unwrap().unwrap();
        // Nothing consumes the queue, the capture loop still reaches the end
        assert!(wait_until(|| camera.status() == CameraStatus::Error));
        camera.cancel.cancel();
        capture.join().unwrap();

        assert_eq!(camera.frame_sequence(), 6);
        assert_eq!(
            camera.latest_frame().unwrap().name.as_deref(),
            Some("frame_005.jpg")
        );
        let kept: Vec<Option<String>> = queued.try_iter().map(|frame| frame.name.clone()).collect();
        assert_eq!(
            kept,
            vec![Some("frame_000.jpg".to_string()), Some("frame_001.jpg".to_string())]
        );
    }

    #[test]
    fn out_of_range_fps_does_not_reserve_the_id() {
        let dir = frames_dir(2);
        let manager = CameraManager::new(RecognizerHandle::default(), settings());
        let too_slow = CameraSource::Directory {
            path: dir.path().to_path_buf(),
            fps: 1e-20,
            loop_frames: true,
        };
        let err = manager.start("gate", too_slow).unwrap_err();
        assert!(matches!(err, CameraError::StartFailed { .. }));

        manager.start("gate", directory_source(&dir, true)).unwrap();
        assert_eq!(manager.statuses()["gate"], CameraStatus::Running);
    }

    #[test]
    fn starting_guard_releases_the_id_on_unwind() {
        let starting = Mutex::new(HashSet::from(["gate".to_string()]));
        let unwound = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _starting = StartingGuard {
                starting: &starting,
                id: "gate",
            };
            panic!("source blew up");
        }));
        assert!(unwound.is_err());
        assert!(starting.lock().is_empty());
    }

    #[test]
    fn fps_is_rounded_to_two_decimals() {
        assert_eq!(round_fps(1.0 / 0.03), 33.33);
        assert_eq!(round_fps(0.0), 0.0);
    }

    #[test]
    fn rounding_keeps_three_decimals() {
        assert_eq!(round_millis(Duration::from_micros(123_456)), 0.123);
        assert_eq!(round_millis(Duration::from_micros(1_999_600)), 2.0);
    }
}
