use crate::{
    detector::ExecutionProvider,
    image::{Image, Overlay, create_random_jpeg_name, decode_image, save_annotated_jpeg},
    pipeline::{Recognition, Recognize},
};
use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::{
    fmt,
    path::PathBuf,
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

pub const DEFAULT_WORKER_QUEUE_SIZE: usize = 16;

pub enum RecognitionInput {
    /// Encoded upload, decoded on the worker thread.
    Encoded { name: Option<String>, data: Bytes },
    /// Frame already decoded by a camera.
    Frame(Arc<Image>),
}

pub struct RecognitionRequest {
    pub input: RecognitionInput,
    /// Read the whole image when no plate box is found.
    pub fallback_full_image: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionError {
    Decode(String),
    Pipeline(String),
}

impl fmt::Display for RecognitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecognitionError::Decode(_) => write!(f, "Could not read image"),
            RecognitionError::Pipeline(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for RecognitionError {}

#[derive(Debug)]
pub struct RecognitionResponse {
    pub result: Result<Recognition, RecognitionError>,
    /// Decode and recognition time on the worker.
    pub process_time: Duration,
    /// Time spent waiting in the queue.
    pub queue_time: Duration,
}

pub type RecognitionJob = (
    RecognitionRequest,
    oneshot::Sender<RecognitionResponse>,
    Instant,
);

pub struct RecognitionWorker {
    receiver: Receiver<RecognitionJob>,
    recognizer: Box<dyn Recognize>,
    save_image_path: Option<PathBuf>,
    overlay: Overlay,
    image: Image,
}

impl RecognitionWorker {
    pub fn new(
        recognizer: Box<dyn Recognize>,
        worker_queue_size: Option<usize>,
        save_image_path: Option<PathBuf>,
    ) -> (Sender<RecognitionJob>, Self) {
        let worker_queue_size = worker_queue_size.unwrap_or(DEFAULT_WORKER_QUEUE_SIZE).max(1);
        info!(worker_queue_size, "Creating recognition worker");
        let (sender, receiver) = crossbeam::channel::bounded(worker_queue_size);
        let overlay = if save_image_path.is_some() {
            Overlay::load(None)
        } else {
            Overlay::without_text()
        };
        let worker = Self {
            receiver,
            recognizer,
            save_image_path,
            overlay,
            image: Image::default(),
        };
        (sender, worker)
    }

    pub fn info(&self) -> RecognizerInfo {
        RecognizerInfo {
            model_name: self.recognizer.model_name(),
            execution_provider: self.recognizer.execution_provider(),
        }
    }

    pub fn spawn_worker_thread(mut self) -> JoinHandle<()> {
        std::thread::spawn(move || {
            self.run();
            info!("Recognition worker stopped");
        })
    }

    /// Serves requests until every sender is dropped.
    pub fn run(&mut self) {
        while let Ok((request, response_sender, queued_at)) = self.receiver.recv() {
            let queue_time = queued_at.elapsed();
            let process_start_time = Instant::now();
            let result = self.process(request);
            let response = RecognitionResponse {
                result,
                process_time: process_start_time.elapsed(),
                queue_time,
            };
            debug!(?response, "Recognition finished");
            if response_sender.send(response).is_err() {
                warn!("Requester went away before the recognition finished");
            }
        }
    }

    fn process(&mut self, request: RecognitionRequest) -> Result<Recognition, RecognitionError> {
        let RecognitionRequest {
            input,
            fallback_full_image,
        } = request;

        let recognition = match input {
            RecognitionInput::Encoded { name, data } => {
                let name = match name {
                    Some(name) if !name.is_empty() && name != "image.jpg" => name,
                    _ => create_random_jpeg_name(),
                };
                decode_image(Some(name), data, &mut self.image)
                    .map_err(|err| RecognitionError::Decode(err.to_string()))?;
                let recognition = self
                    .recognizer
                    .recognize(&self.image, fallback_full_image)
                    .map_err(|err| RecognitionError::Pipeline(err.to_string()))?;
                if let Some(save_image_path) = self.save_image_path.as_ref()
                    && let Err(err) = save_annotated_jpeg(
                        &self.image,
                        &recognition.plates,
                        &self.overlay,
                        save_image_path,
                    )
                {
                    warn!(?err, "Failed to save annotated image");
                }
                recognition
            }
            RecognitionInput::Frame(frame) => self
                .recognizer
                .recognize(&frame, fallback_full_image)
                .map_err(|err| RecognitionError::Pipeline(err.to_string()))?,
        };
        Ok(recognition)
    }
}

#[derive(Debug, Clone)]
pub struct RecognizerInfo {
    pub model_name: String,
    pub execution_provider: ExecutionProvider,
}

pub enum InitResult {
    Success {
        sender: Sender<RecognitionJob>,
        info: RecognizerInfo,
        worker_thread_handle: JoinHandle<()>,
    },
    Failed(String),
}

/// Builds the recognizer on a background thread, the result arrives on the
/// returned receiver once the models are loaded.
pub fn spawn_recognizer_initialization<F>(
    build_recognizer: F,
    worker_queue_size: Option<usize>,
    save_image_path: Option<PathBuf>,
) -> oneshot::Receiver<InitResult>
where
    F: FnOnce() -> anyhow::Result<Box<dyn Recognize>> + Send + 'static,
{
    let (init_sender, init_receiver) = oneshot::channel();

    std::thread::spawn(move || {
        info!("Loading recognition models...");
        let result = match build_recognizer() {
            Ok(recognizer) => {
                let (sender, worker) =
                    RecognitionWorker::new(recognizer, worker_queue_size, save_image_path);
                let info = worker.info();
                info!(
                    model_name = %info.model_name,
                    execution_provider = %info.execution_provider,
                    "Recognizer initialized, starting worker thread"
                );
                InitResult::Success {
                    sender,
                    info,
                    worker_thread_handle: worker.spawn_worker_thread(),
                }
            }
            Err(e) => {
                error!(error = %e, "Recognizer initialization failed");
                InitResult::Failed(e.to_string())
            }
        };
        if init_sender.send(result).is_err() {
            error!("Failed to hand the recognizer over, server is gone");
        }
    });

    init_receiver
}

enum RecognizerState {
    NotReady,
    Ready {
        sender: Sender<RecognitionJob>,
        info: RecognizerInfo,
    },
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitError {
    NotReady,
    Failed(String),
    QueueFull,
    Disconnected,
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::NotReady => {
                write!(f, "Server not ready yet, recognizer is still initializing")
            }
            SubmitError::Failed(msg) => write!(f, "Recognizer initialization failed: {msg}"),
            SubmitError::QueueFull => write!(f, "Worker queue is full"),
            SubmitError::Disconnected => write!(f, "Recognition worker stopped"),
        }
    }
}

impl std::error::Error for SubmitError {}

/// Shared access to the worker for HTTP handlers and camera threads.
#[derive(Clone)]
pub struct RecognizerHandle {
    state: Arc<RwLock<RecognizerState>>,
    worker_thread_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Default for RecognizerHandle {
    fn default() -> Self {
        Self {
            state: Arc::new(RwLock::new(RecognizerState::NotReady)),
            worker_thread_handle: Arc::new(Mutex::new(None)),
        }
    }
}

impl RecognizerHandle {
    /// A handle that serves requests right away.
    pub fn ready(
        sender: Sender<RecognitionJob>,
        info: RecognizerInfo,
        worker_thread_handle: Option<JoinHandle<()>>,
    ) -> Self {
        let handle = Self::default();
        handle.set_ready(sender, info, worker_thread_handle);
        handle
    }

    /// Starts `recognizer` on its own worker thread.
    pub fn spawn(
        recognizer: Box<dyn Recognize>,
        worker_queue_size: Option<usize>,
        save_image_path: Option<PathBuf>,
    ) -> Self {
        let (sender, worker) = RecognitionWorker::new(recognizer, worker_queue_size, save_image_path);
        let info = worker.info();
        Self::ready(sender, info, Some(worker.spawn_worker_thread()))
    }

    fn set_ready(
        &self,
        sender: Sender<RecognitionJob>,
        info: RecognizerInfo,
        worker_thread_handle: Option<JoinHandle<()>>,
    ) {
        *self.state.write() = RecognizerState::Ready { sender, info };
        *self.worker_thread_handle.lock() = worker_thread_handle;
    }

    /// Waits for the initialization result and switches the handle over.
    pub async fn attach(&self, init_receiver: oneshot::Receiver<InitResult>) {
        match init_receiver.await {
            Ok(InitResult::Success {
                sender,
                info,
                worker_thread_handle,
            }) => {
                info!(
                    model_name = %info.model_name,
                    execution_provider = %info.execution_provider,
                    "Recognizer ready - server can now handle requests"
                );
                self.set_ready(sender, info, Some(worker_thread_handle));
            }
            Ok(InitResult::Failed(error)) => {
                error!(error = %error, "Recognizer initialization failed");
                *self.state.write() = RecognizerState::Failed(error);
            }
            Err(_) => {
                error!("Recognizer initialization channel was dropped");
                *self.state.write() =
                    RecognizerState::Failed("Initialization channel dropped".to_string());
            }
        }
    }

    pub fn info(&self) -> Option<RecognizerInfo> {
        match &*self.state.read() {
            RecognizerState::Ready { info, .. } => Some(info.clone()),
            _ => None,
        }
    }

    /// "ready", "initializing" or "failed: ...".
    pub fn status(&self) -> String {
        match &*self.state.read() {
            RecognizerState::NotReady => "initializing".to_string(),
            RecognizerState::Ready { .. } => "ready".to_string(),
            RecognizerState::Failed(msg) => format!("failed: {msg}"),
        }
    }

    /// Queues a request without blocking.
    pub fn submit(
        &self,
        request: RecognitionRequest,
    ) -> Result<oneshot::Receiver<RecognitionResponse>, SubmitError> {
        let state = self.state.read();
        let sender = match &*state {
            RecognizerState::NotReady => return Err(SubmitError::NotReady),
            RecognizerState::Failed(msg) => return Err(SubmitError::Failed(msg.clone())),
            RecognizerState::Ready { sender, .. } => sender,
        };

        let (response_sender, receiver) = oneshot::channel();
        match sender.try_send((request, response_sender, Instant::now())) {
            Ok(()) => Ok(receiver),
            Err(TrySendError::Full(_)) => Err(SubmitError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(SubmitError::Disconnected),
        }
    }

    /// Drops the request sender and hands back the worker thread to join.
    pub fn shutdown(&self) -> Option<JoinHandle<()>> {
        *self.state.write() = RecognizerState::Failed("Shutting down".to_string());
        self.worker_thread_handle.lock().take()
    }
}
