use crate::{
    LogLevel,
    api::{
        CameraListResponse, ErrorResponse, HealthResponse, MessageResponse, RecognizeResponse,
        StartCameraRequest, StatsResponse,
    },
    camera::{Camera, CameraError, CameraManager, CameraSettings},
    cli::{CameraConfig, Cli},
    image::{Overlay, encode_jpeg},
    worker::{
        InitResult, RecognitionError, RecognitionInput, RecognitionRequest, RecognizerHandle,
        SubmitError,
    },
};
use axum::{
    Json, Router,
    body::{self, Body},
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{
        HeaderValue, Method, Request, StatusCode,
        header::{ACCESS_CONTROL_ALLOW_ORIGIN, AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::{BufMut, Bytes, BytesMut};
use futures::StreamExt;
use mime::IMAGE_JPEG;
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{sync::Mutex, time::timeout};
use tokio_stream::wrappers::IntervalStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{debug, error, info, warn};

const MEGABYTE: usize = 1024 * 1024;
const MJPEG_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";
const MJPEG_PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
const SERVED_FRAME_QUALITY: u8 = 95;

/// Service result: the recognition worker thread to join, if it was running.
pub type ServiceResult = anyhow::Result<Option<std::thread::JoinHandle<()>>>;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub request_timeout: Duration,
    pub max_upload_size: usize,
    pub cors_origins: Vec<String>,
    pub stream_interval: Duration,
    pub jpeg_quality: u8,
    pub font_path: Option<PathBuf>,
    pub camera_settings: CameraSettings,
    pub log_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_cli(&Cli::default())
    }
}

impl ServerConfig {
    pub fn from_cli(args: &Cli) -> Self {
        Self {
            port: args.port,
            request_timeout: Duration::from_secs(args.request_timeout),
            max_upload_size: args.max_upload_size_mb * MEGABYTE,
            cors_origins: args.cors_origins.clone(),
            stream_interval: Duration::from_millis(args.stream_interval_ms.max(1)),
            jpeg_quality: args.jpeg_quality,
            font_path: args.font_path.clone(),
            camera_settings: args.camera_settings(),
            log_path: args.log_path.clone(),
        }
    }
}

pub struct ServerState {
    recognizer: RecognizerHandle,
    cameras: Arc<CameraManager>,
    metrics: Mutex<Metrics>,
    overlay: Arc<Overlay>,
    config: ServerConfig,
    shutdown: CancellationToken,
}

impl ServerState {
    pub fn new(
        config: ServerConfig,
        recognizer: RecognizerHandle,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let overlay = Arc::new(Overlay::load(config.font_path.as_deref()));
        Self::with_overlay(config, recognizer, overlay, shutdown)
    }

    pub fn with_overlay(
        config: ServerConfig,
        recognizer: RecognizerHandle,
        overlay: Arc<Overlay>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let cameras = Arc::new(CameraManager::new(
            recognizer.clone(),
            config.camera_settings.clone(),
        ));
        Arc::new(Self {
            recognizer,
            cameras,
            metrics: Mutex::new(Metrics::new(config.log_path.clone())),
            overlay,
            config,
            shutdown,
        })
    }

    pub fn cameras(&self) -> &Arc<CameraManager> {
        &self.cameras
    }

    pub fn recognizer(&self) -> &RecognizerHandle {
        &self.recognizer
    }
}

pub async fn run_server(
    config: ServerConfig,
    recognizer: RecognizerHandle,
    recognizer_init_receiver: Option<tokio::sync::oneshot::Receiver<InitResult>>,
    configured_cameras: Vec<CameraConfig>,
    cancellation_token: CancellationToken,
) -> ServiceResult {
    let port = config.port;
    let server_state = ServerState::new(config, recognizer.clone(), cancellation_token.clone());

    if let Some(init_receiver) = recognizer_init_receiver {
        let recognizer = recognizer.clone();
        tokio::spawn(async move { recognizer.attach(init_receiver).await });
    }

    if !configured_cameras.is_empty() {
        let cameras = server_state.cameras.clone();
        tokio::task::spawn_blocking(move || {
            let requested = configured_cameras.len();
            let started = cameras.start_all(
                configured_cameras
                    .into_iter()
                    .map(|camera| (camera.id, camera.source))
                    .collect(),
            );
            info!(started, requested, "Configured cameras started");
        });
    }

    let platewatch = build_router(server_state.clone());

    let addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port);
    info!("Starting server, listening on {}", addr);
    info!("Health check, http://127.0.0.1:{}/health", port);
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            error!(
                "Looks like {port} is already in use by another application, please turn off the other application or pick another port with --port"
            );
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };

    axum::serve(listener, platewatch.into_make_service())
        .with_graceful_shutdown(cancellation_token.clone().cancelled_owned())
        .await?;

    info!("Server stopped, stopping cameras");
    let cameras = server_state.cameras.clone();
    tokio::task::spawn_blocking(move || cameras.stop_all()).await?;
    Ok(recognizer.shutdown())
}

pub fn build_router(server_state: Arc<ServerState>) -> Router {
    let cors = cors_layer(&server_state.config.cors_origins);
    let max_upload_size = server_state.config.max_upload_size;

    Router::new()
        .route("/health", get(health_handler))
        .route("/recognize", post(recognize_handler))
        .route("/cameras", get(list_cameras_handler))
        .route("/cameras/{id}/start", post(start_camera_handler))
        .route("/cameras/{id}/stop", post(stop_camera_handler))
        .route("/cameras/{id}/stream", get(stream_handler))
        .route("/cameras/{id}/detections", get(detections_handler))
        .route("/cameras/{id}/metrics", get(camera_metrics_handler))
        .route("/cameras/{id}/frame", get(frame_handler))
        .route("/cameras/{id}/raw-frame", get(raw_frame_handler))
        .route("/metrics", get(all_metrics_handler))
        .route("/stats", get(stats_handler))
        .route("/config/loglevel", post(config_loglevel_handler))
        .fallback(fallback_handler)
        .with_state(server_state)
        .layer(DefaultBodyLimit::max(max_upload_size))
        .layer(cors)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|origin| origin == "*") {
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(origin, "Ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
}

async fn health_handler(State(server_state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        message: "License plate recognition service is running".to_string(),
        recognizer: server_state.recognizer.status(),
        cameras: server_state.cameras.statuses(),
    })
}

async fn recognize_handler(
    State(server_state): State<Arc<ServerState>>,
    mut multipart: Multipart, // Note multipart needs to be last
) -> Result<Json<RecognizeResponse>, RecognizeError> {
    let request_start_time = Instant::now();
    let mut upload = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| RecognizeError::bad_request(format!("Invalid multipart body: {e}")))?
    {
        if field.name() != Some("image") {
            continue;
        }
        let file_name = field.file_name().map(|name| name.to_string());
        if file_name.as_deref() == Some("") {
            return Err(RecognizeError::bad_request("No image selected"));
        }
        let data = field
            .bytes()
            .await
            .map_err(|e| RecognizeError::bad_request(format!("Failed to read image: {e}")))?;
        upload = Some((file_name, data));
    }

    let Some((name, data)) = upload else {
        return Err(RecognizeError::bad_request("No image provided"));
    };
    if data.is_empty() {
        return Err(RecognizeError::bad_request("Could not read image"));
    }

    let request = RecognitionRequest {
        input: RecognitionInput::Encoded { name, data },
        fallback_full_image: true,
    };
    let receiver = match server_state.recognizer.submit(request) {
        Ok(receiver) => receiver,
        Err(err) => {
            let status = match err {
                SubmitError::NotReady | SubmitError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
                SubmitError::Failed(_) | SubmitError::Disconnected => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            };
            if err == SubmitError::QueueFull {
                warn!("Worker queue is full server is overloaded, rejecting request");
                update_dropped_requests(&server_state).await;
            }
            return Err(RecognizeError::new(status, err.to_string()));
        }
    };

    let response = match timeout(server_state.config.request_timeout, receiver).await {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => {
            warn!("Failed to receive recognition response: {:?}", err);
            update_dropped_requests(&server_state).await;
            return Err(RecognizeError::internal("Recognition worker stopped"));
        }
        Err(_) => {
            warn!("Timeout while waiting for recognition response");
            update_dropped_requests(&server_state).await;
            return Err(RecognizeError::internal("Operation timed out"));
        }
    };

    let recognition = match response.result {
        Ok(recognition) => recognition,
        Err(err @ RecognitionError::Decode(_)) => {
            debug!(?err, "Upload could not be decoded");
            return Err(RecognizeError::bad_request(err.to_string()));
        }
        Err(err @ RecognitionError::Pipeline(_)) => {
            error!(%err, "Recognition failed");
            return Err(RecognizeError::internal(err.to_string()));
        }
    };

    let recognize_response = RecognizeResponse {
        success: true,
        license_plate: Some(recognition.best_plate()),
        plates: recognition.plates,
        error: None,
        inference_ms: recognition.inference_time.as_millis() as i32,
        process_ms: response.process_time.as_millis() as i32,
        analysis_round_trip_ms: request_start_time.elapsed().as_millis() as i32,
    };
    server_state
        .metrics
        .lock()
        .await
        .update_metrics(&recognize_response);

    Ok(Json(recognize_response))
}

async fn list_cameras_handler(
    State(server_state): State<Arc<ServerState>>,
) -> Json<CameraListResponse> {
    Json(CameraListResponse {
        cameras: server_state.cameras.list(),
    })
}

async fn start_camera_handler(
    State(server_state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    request: Option<Json<StartCameraRequest>>,
) -> Result<Json<MessageResponse>, ApiError> {
    let request = request.map(|Json(request)| request).unwrap_or_default();
    let Some(source) = request.source else {
        if request.camera_index.is_some() {
            return Err(ApiError::bad_request(
                "Local capture devices are not supported, provide an mjpeg, snapshot or directory source",
            ));
        }
        return Err(ApiError::bad_request("No camera source provided"));
    };

    let cameras = server_state.cameras.clone();
    let camera_id = id.clone();
    tokio::task::spawn_blocking(move || cameras.start(&camera_id, source))
        .await
        .map_err(|e| ApiError::internal(format!("Camera start task failed: {e}")))??;

    Ok(Json(MessageResponse {
        message: format!("Camera {id} started successfully"),
    }))
}

async fn stop_camera_handler(
    State(server_state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    let cameras = server_state.cameras.clone();
    let camera_id = id.clone();
    tokio::task::spawn_blocking(move || cameras.stop(&camera_id))
        .await
        .map_err(|e| ApiError::internal(format!("Camera stop task failed: {e}")))??;

    Ok(Json(MessageResponse {
        message: format!("Camera {id} stopped successfully"),
    }))
}

struct StreamCache {
    frame_sequence: u64,
    jpeg: Option<Bytes>,
}

async fn stream_handler(
    State(server_state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let camera = server_state.cameras.camera(&id)?;
    info!(camera_id = %id, "MJPEG stream client connected");

    let camera_stopped = camera.stopped();
    let server_shutdown = server_state.shutdown.clone();
    let stream_ended = async move {
        tokio::select! {
            _ = camera_stopped.cancelled() => {},
            _ = server_shutdown.cancelled() => {},
        }
    };

    let overlay = server_state.overlay.clone();
    let quality = server_state.config.jpeg_quality;
    let cache = Arc::new(parking_lot::Mutex::new(StreamCache {
        frame_sequence: 0,
        jpeg: None,
    }));

    let ticks = IntervalStream::new(tokio::time::interval(server_state.config.stream_interval));
    let parts = ticks
        .take_until(stream_ended)
        .then(move |_| {
            let camera = camera.clone();
            let overlay = overlay.clone();
            let cache = cache.clone();
            async move { next_stream_jpeg(camera, overlay, cache, quality).await }
        })
        .filter_map(|jpeg| async move { jpeg.map(|jpeg| Ok::<_, std::io::Error>(mjpeg_part(&jpeg))) });

    Ok((
        [
            (CONTENT_TYPE, MJPEG_CONTENT_TYPE),
            (CACHE_CONTROL, "no-store, no-cache, must-revalidate"),
        ],
        Body::from_stream(parts),
    )
        .into_response())
}

/// Annotated JPEG of the latest frame, cached until a new frame arrives.
async fn next_stream_jpeg(
    camera: Arc<Camera>,
    overlay: Arc<Overlay>,
    cache: Arc<parking_lot::Mutex<StreamCache>>,
    quality: u8,
) -> Option<Bytes> {
    let frame_sequence = camera.frame_sequence();
    {
        let cache = cache.lock();
        if cache.frame_sequence == frame_sequence && cache.jpeg.is_some() {
            return cache.jpeg.clone();
        }
    }

    let encoded = tokio::task::spawn_blocking(move || annotated_jpeg(&camera, &overlay, quality))
        .await
        .ok()?;
    match encoded {
        Ok(Some(jpeg)) => {
            let mut cache = cache.lock();
            cache.frame_sequence = frame_sequence;
            cache.jpeg = Some(jpeg.clone());
            Some(jpeg)
        }
        Ok(None) => None,
        Err(err) => {
            warn!(?err, "Failed to encode stream frame");
            None
        }
    }
}

fn mjpeg_part(jpeg: &Bytes) -> Bytes {
    let mut part = BytesMut::with_capacity(MJPEG_PART_HEADER.len() + jpeg.len() + 2);
    part.put_slice(MJPEG_PART_HEADER);
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

/// Latest frame with plate boxes and FPS drawn, `None` before the first frame.
fn annotated_jpeg(camera: &Camera, overlay: &Overlay, quality: u8) -> anyhow::Result<Option<Bytes>> {
    let Some(frame) = camera.latest_frame() else {
        return Ok(None);
    };
    let plates = camera
        .detections()
        .map(|detections| detections.plates)
        .unwrap_or_default();
    let annotated = overlay.annotate(&frame, &plates, Some(camera.fps()))?;
    Ok(Some(encode_jpeg(&annotated, quality)?))
}

async fn detections_handler(
    State(server_state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let detections = server_state.cameras.camera(&id)?.detections();
    let value = match detections {
        Some(detections) => serde_json::to_value(detections)
            .map_err(|e| ApiError::internal(e.to_string()))?,
        None => serde_json::json!({ "plates": [] }),
    };
    Ok(Json(value))
}

async fn camera_metrics_handler(
    State(server_state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let metrics = server_state
        .cameras
        .camera(&id)?
        .metrics()
        .ok_or_else(|| ApiError::not_found("No metrics available"))?;
    Ok(Json(metrics).into_response())
}

async fn frame_handler(
    State(server_state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    serve_frame(server_state, id, true).await
}

async fn raw_frame_handler(
    State(server_state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    serve_frame(server_state, id, false).await
}

async fn serve_frame(
    server_state: Arc<ServerState>,
    id: String,
    annotate: bool,
) -> Result<Response, ApiError> {
    let camera = server_state.cameras.camera(&id)?;
    let overlay = server_state.overlay.clone();

    let jpeg = tokio::task::spawn_blocking(move || {
        if annotate {
            annotated_jpeg(&camera, &overlay, SERVED_FRAME_QUALITY)
        } else {
            camera
                .latest_frame()
                .map(|frame| encode_jpeg(&frame, SERVED_FRAME_QUALITY))
                .transpose()
        }
    })
    .await
    .map_err(|e| ApiError::internal(e.to_string()))?
    .map_err(|e| ApiError::internal(format!("Failed to encode frame: {e}")))?
    .ok_or_else(|| ApiError::not_found("No frame available"))?;

    let content_type = IMAGE_JPEG.to_string();
    Ok((
        [
            (CONTENT_TYPE, content_type.as_str()),
            (ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (CACHE_CONTROL, "no-store, no-cache, must-revalidate"),
        ],
        jpeg,
    )
        .into_response())
}

async fn all_metrics_handler(
    State(server_state): State<Arc<ServerState>>,
) -> Json<BTreeMap<String, crate::api::CameraMetrics>> {
    Json(server_state.cameras.all_metrics())
}

async fn stats_handler(State(server_state): State<Arc<ServerState>>) -> Json<StatsResponse> {
    let mut stats = server_state.metrics.lock().await.stats();
    if let Some(info) = server_state.recognizer.info() {
        stats.model_name = info.model_name;
        stats.execution_provider = info.execution_provider.to_string();
    }
    stats.cameras = server_state.cameras.len();
    Json(stats)
}

#[derive(Debug, Deserialize)]
struct LogLevelRequest {
    log_level: LogLevel,
}

async fn config_loglevel_handler(Json(payload): Json<LogLevelRequest>) -> impl IntoResponse {
    match crate::update_log_level(payload.log_level) {
        Ok(()) => {
            info!(?payload.log_level, "Log level updated successfully via API");
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "success": true,
                    "message": format!("Log level updated to {:?}", payload.log_level),
                    "new_level": format!("{:?}", payload.log_level)
                })),
            )
                .into_response()
        }
        Err(e) => {
            error!("Failed to update log level: {}", e);
            ApiError::internal(format!("Failed to update log level: {e}")).into_response()
        }
    }
}

async fn fallback_handler(req: Request<Body>) -> impl IntoResponse {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let body_bytes = body::to_bytes(req.into_body(), MEGABYTE)
        .await
        .unwrap_or_else(|_| body::Bytes::new());
    debug!(
        "Unimplemented endpoint called: Method: {}, URI: {}, Body: {} bytes",
        method,
        uri,
        body_bytes.len()
    );
    ApiError::not_found("Endpoint not implemented")
}

#[derive(Debug, Clone)]
pub struct Metrics {
    version: String,
    log_path: String,
    start_time: Instant,
    number_of_requests: u64,
    dropped_requests: u64,
    total_inference_ms: u128,
    min_inference_ms: i32,
    max_inference_ms: i32,
    total_processing_ms: u128,
    min_processing_ms: i32,
    max_processing_ms: i32,
    total_analysis_round_trip_ms: u128,
    min_analysis_round_trip_ms: i32,
    max_analysis_round_trip_ms: i32,
}

impl Metrics {
    pub fn new(log_path: Option<PathBuf>) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            log_path: log_path
                .unwrap_or_else(|| PathBuf::from("stdout"))
                .to_string_lossy()
                .to_string(),
            start_time: Instant::now(),
            number_of_requests: 0,
            dropped_requests: 0,
            total_inference_ms: 0,
            min_inference_ms: i32::MAX,
            max_inference_ms: i32::MIN,
            total_processing_ms: 0,
            min_processing_ms: i32::MAX,
            max_processing_ms: i32::MIN,
            total_analysis_round_trip_ms: 0,
            min_analysis_round_trip_ms: i32::MAX,
            max_analysis_round_trip_ms: i32::MIN,
        }
    }

    fn uptime(&self) -> String {
        let elapsed = self.start_time.elapsed();
        let days = elapsed.as_secs() / 86400;
        let hours = (elapsed.as_secs() % 86400) / 3600;
        let minutes = (elapsed.as_secs() % 3600) / 60;
        format!("{days} days, {hours} hours and {minutes} minutes")
    }

    fn update_metrics(&mut self, response: &RecognizeResponse) {
        self.number_of_requests = self.number_of_requests.wrapping_add(1);
        self.total_inference_ms = self
            .total_inference_ms
            .wrapping_add(response.inference_ms as u128);
        self.min_inference_ms = self.min_inference_ms.min(response.inference_ms);
        self.max_inference_ms = self.max_inference_ms.max(response.inference_ms);
        self.total_processing_ms = self
            .total_processing_ms
            .wrapping_add(response.process_ms as u128);
        self.min_processing_ms = self.min_processing_ms.min(response.process_ms);
        self.max_processing_ms = self.max_processing_ms.max(response.process_ms);
        self.total_analysis_round_trip_ms = self
            .total_analysis_round_trip_ms
            .wrapping_add(response.analysis_round_trip_ms as u128);
        self.min_analysis_round_trip_ms = self
            .min_analysis_round_trip_ms
            .min(response.analysis_round_trip_ms);
        self.max_analysis_round_trip_ms = self
            .max_analysis_round_trip_ms
            .max(response.analysis_round_trip_ms);
    }

    fn update_dropped_requests(&mut self) {
        self.dropped_requests = self.dropped_requests.wrapping_add(1);
    }

    fn avg_ms(&self, total_ms: u128) -> i32 {
        if self.number_of_requests == 0 {
            0
        } else {
            (total_ms as f64 / self.number_of_requests as f64).round() as i32
        }
    }

    /// Min and max read as 0 until the first request.
    fn bounds(&self, min: i32, max: i32) -> (i32, i32) {
        if self.number_of_requests == 0 {
            (0, 0)
        } else {
            (min, max)
        }
    }

    pub fn stats(&self) -> StatsResponse {
        let (min_inference_ms, max_inference_ms) =
            self.bounds(self.min_inference_ms, self.max_inference_ms);
        let (min_processing_ms, max_processing_ms) =
            self.bounds(self.min_processing_ms, self.max_processing_ms);
        let (min_analysis_round_trip_ms, max_analysis_round_trip_ms) = self.bounds(
            self.min_analysis_round_trip_ms,
            self.max_analysis_round_trip_ms,
        );
        StatsResponse {
            version: self.version.clone(),
            uptime: self.uptime(),
            model_name: "Initializing...".to_string(),
            execution_provider: "Initializing...".to_string(),
            log_path: self.log_path.clone(),
            cameras: 0,
            number_of_requests: self.number_of_requests,
            dropped_requests: self.dropped_requests,
            avg_inference_ms: self.avg_ms(self.total_inference_ms),
            min_inference_ms,
            max_inference_ms,
            avg_processing_ms: self.avg_ms(self.total_processing_ms),
            min_processing_ms,
            max_processing_ms,
            avg_analysis_round_trip_ms: self.avg_ms(self.total_analysis_round_trip_ms),
            min_analysis_round_trip_ms,
            max_analysis_round_trip_ms,
        }
    }
}

async fn update_dropped_requests(server_state: &ServerState) {
    warn!(
        "If you see this message spamming you should reduce the number of requests or upgrade your service to be faster."
    );
    server_state.metrics.lock().await.update_dropped_requests();
}

/// `{"success": false, "error": "..."}` for `/recognize`.
pub struct RecognizeError {
    status: StatusCode,
    message: String,
}

impl RecognizeError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for RecognizeError {
    fn into_response(self) -> Response {
        (self.status, Json(RecognizeResponse::failure(self.message))).into_response()
    }
}

/// `{"error": "..."}` with an explicit status for every other route.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<CameraError> for ApiError {
    fn from(err: CameraError) -> Self {
        let status = match err {
            CameraError::AlreadyRunning(_) => StatusCode::BAD_REQUEST,
            CameraError::NotFound(_) => StatusCode::NOT_FOUND,
            CameraError::StartFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(inference_ms: i32, process_ms: i32, round_trip_ms: i32) -> RecognizeResponse {
        RecognizeResponse {
            success: true,
            inference_ms,
            process_ms,
            analysis_round_trip_ms: round_trip_ms,
            ..Default::default()
        }
    }

    #[test]
    fn stats_start_at_zero() {
        let stats = Metrics::new(None).stats();
        assert_eq!(stats.number_of_requests, 0);
        assert_eq!((stats.min_inference_ms, stats.max_inference_ms), (0, 0));
        assert_eq!(stats.log_path, "stdout");
    }

    #[test]
    fn stats_track_min_avg_max() {
        let mut metrics = Metrics::new(None);
        metrics.update_metrics(&response(10, 20, 30));
        metrics.update_metrics(&response(30, 40, 50));
        metrics.update_dropped_requests();

        let stats = metrics.stats();
        assert_eq!(stats.number_of_requests, 2);
        assert_eq!(stats.dropped_requests, 1);
        assert_eq!(
            (stats.min_inference_ms, stats.avg_inference_ms, stats.max_inference_ms),
            (10, 20, 30)
        );
        assert_eq!(stats.avg_analysis_round_trip_ms, 40);
    }

    #[test]
    fn mjpeg_part_is_framed() {
        let part = mjpeg_part(&Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]));
        assert!(part.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"));
        assert!(part.ends_with(&[0xFF, 0xD9, b'\r', b'\n']));
    }

    #[test]
    fn camera_errors_map_to_status_codes() {
        let conflict = ApiError::from(CameraError::AlreadyRunning("gate".into()));
        assert_eq!(conflict.status, StatusCode::BAD_REQUEST);
        let missing = ApiError::from(CameraError::NotFound("gate".into()));
        assert_eq!(missing.status, StatusCode::NOT_FOUND);
        let failed = ApiError::from(CameraError::StartFailed {
            id: "gate".into(),
            reason: "connection refused".into(),
        });
        assert_eq!(failed.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            failed.message,
            "Failed to start camera gate: connection refused"
        );
    }
}
