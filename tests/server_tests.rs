use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header::CONTENT_TYPE},
};
use futures::StreamExt;
use platewatch::{
    api::PlateRead,
    detector::ExecutionProvider,
    image::{Image, Overlay, encode_jpeg},
    pipeline::{Recognition, Recognize},
    server::{ServerConfig, ServerState, build_router},
    worker::RecognizerHandle,
};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tower::util::ServiceExt;

const BOUNDARY: &str = "platewatch-test-boundary";

struct FakeRecognizer;

impl Recognize for FakeRecognizer {
    fn recognize(&mut self, _image: &Image, _fallback: bool) -> anyhow::Result<Recognition> {
        Ok(Recognition {
            plates: vec![
                PlateRead {
                    license_plate: "30A-99999".into(),
                    confidence: 0.95,
                    bbox: [5, 5, 20, 10],
                },
                PlateRead {
                    license_plate: "51F-12345".into(),
                    confidence: 0.91,
                    bbox: [40, 10, 30, 12],
                },
            ],
            full_image_text: None,
            inference_time: Duration::from_millis(3),
        })
    }

    fn model_name(&self) -> String {
        "fake".into()
    }

    fn execution_provider(&self) -> ExecutionProvider {
        ExecutionProvider::CPU
    }
}

fn server(recognizer: RecognizerHandle) -> (Arc<ServerState>, Router) {
    let state = ServerState::with_overlay(
        ServerConfig::default(),
        recognizer,
        Arc::new(Overlay::without_text()),
        CancellationToken::new(),
    );
    let router = build_router(state.clone());
    (state, router)
}

fn ready_server() -> (Arc<ServerState>, Router) {
    server(RecognizerHandle::spawn(Box::new(FakeRecognizer), None, None))
}

fn test_jpeg() -> Vec<u8> {
    let image = Image::from_rgb(64, 48, vec![110; 64 * 48 * 3]).unwrap();
    encode_jpeg(&image, 90).unwrap().to_vec()
}

fn multipart_request(field: &str, file_name: &str, data: &[u8]) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\nContent-Type: image/jpeg\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri("/recognize")
        .header(
            CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

fn json_request(method: &str, uri: &str, json: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(json.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn frames_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let jpeg = test_jpeg();
    for i in 0..3 {
        std::fs::write(dir.path().join(format!("frame_{i}.jpg")), &jpeg).unwrap();
    }
    dir
}

fn directory_source(dir: &tempfile::TempDir) -> serde_json::Value {
    serde_json::json!({
        "source": {
            "type": "directory",
            "path": dir.path(),
            "fps": 30.0
        }
    })
}

async fn wait_for_frame(router: &Router, id: &str) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        let response = router
            .clone()
            .oneshot(get(&format!("/cameras/{id}/raw-frame")))
            .await
            .unwrap();
        if response.status() == StatusCode::OK {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn health_reports_recognizer_state() {
    let (_state, router) = server(RecognizerHandle::default());
    let response = router.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["recognizer"], "initializing");
    assert_eq!(body["cameras"], serde_json::json!({}));
}

#[tokio::test]
async fn recognize_reports_the_last_plate_read() {
    let (_state, router) = ready_server();
    let response = router
        .clone()
        .oneshot(multipart_request("image", "car.jpg", &test_jpeg()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["licensePlate"], "51F-12345");
    assert_eq!(body["plates"].as_array().unwrap().len(), 2);
    assert_eq!(body["plates"][1]["bbox"], serde_json::json!([40, 10, 30, 12]));

    let stats = json_body(router.oneshot(get("/stats")).await.unwrap()).await;
    assert_eq!(stats["number_of_requests"], 1);
    assert_eq!(stats["model_name"], "fake");
}

#[tokio::test]
async fn recognize_rejects_bad_uploads() {
    let (_state, router) = ready_server();

    let missing = router
        .clone()
        .oneshot(multipart_request("photo", "car.jpg", &test_jpeg()))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(missing).await["error"], "No image provided");

    let unnamed = router
        .clone()
        .oneshot(multipart_request("image", "", &test_jpeg()))
        .await
        .unwrap();
    assert_eq!(unnamed.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(unnamed).await["error"], "No image selected");

    let garbage = router
        .oneshot(multipart_request("image", "car.jpg", b"not an image"))
        .await
        .unwrap();
    assert_eq!(garbage.status(), StatusCode::BAD_REQUEST);
    let body = json_body(garbage).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Could not read image");
}

#[tokio::test]
async fn recognize_while_initializing_is_unavailable() {
    let (_state, router) = server(RecognizerHandle::default());
    let response = router
        .oneshot(multipart_request("image", "car.jpg", &test_jpeg()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(response).await;
    assert!(body["error"].as_str().unwrap().contains("initializing"));
}

#[tokio::test]
async fn camera_lifecycle_over_http() {
    let dir = frames_dir();
    let (state, router) = ready_server();

    let started = router
        .clone()
        .oneshot(json_request("POST", "/cameras/gate/start", directory_source(&dir)))
        .await
        .unwrap();
    assert_eq!(started.status(), StatusCode::OK);
    assert_eq!(
        json_body(started).await["message"],
        "Camera gate started successfully"
    );

    let duplicate = router
        .clone()
        .oneshot(json_request("POST", "/cameras/gate/start", directory_source(&dir)))
        .await
        .unwrap();
    assert_eq!(duplicate.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        json_body(duplicate).await["error"],
        "Camera gate is already running"
    );

    assert!(wait_for_frame(&router, "gate").await);

    let frame = router
        .clone()
        .oneshot(get("/cameras/gate/frame"))
        .await
        .unwrap();
    assert_eq!(frame.status(), StatusCode::OK);
    assert_eq!(frame.headers()[CONTENT_TYPE], "image/jpeg");
    assert_eq!(frame.headers()["access-control-allow-origin"], "*");
    let jpeg = to_bytes(frame.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

    let metrics = json_body(
        router
            .clone()
            .oneshot(get("/cameras/gate/metrics"))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(metrics["status"], "RUNNING");

    let listed = json_body(router.clone().oneshot(get("/cameras")).await.unwrap()).await;
    assert_eq!(listed["cameras"][0]["id"], "gate");

    let stopped = router
        .clone()
        .oneshot(json_request("POST", "/cameras/gate/stop", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(stopped.status(), StatusCode::OK);
    assert!(state.cameras().is_empty());

    let again = router
        .oneshot(json_request("POST", "/cameras/gate/stop", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(again.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(again).await["error"], "Camera gate not found");
}

#[tokio::test]
async fn start_requires_a_supported_source() {
    let (_state, router) = ready_server();

    let local = router
        .clone()
        .oneshot(json_request(
            "POST",
            "/cameras/usb/start",
            serde_json::json!({ "camera_index": 0 }),
        ))
        .await
        .unwrap();
    assert_eq!(local.status(), StatusCode::BAD_REQUEST);

    let empty = router
        .oneshot(json_request("POST", "/cameras/usb/start", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(empty).await["error"], "No camera source provided");
}

#[tokio::test]
async fn unknown_camera_routes_are_not_found() {
    let (_state, router) = ready_server();

    for route in ["stream", "detections", "metrics", "frame", "raw-frame"] {
        let response = router
            .clone()
            .oneshot(get(&format!("/cameras/nope/{route}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{route}");
        assert_eq!(
            json_body(response).await["error"],
            "Camera nope not found",
            "{route}"
        );
    }

    let unknown = router.oneshot(get("/v1/nothing")).await.unwrap();
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(unknown).await["error"], "Endpoint not implemented");
}

#[tokio::test]
async fn known_camera_without_detections_reports_no_plates() {
    // The recognizer never becomes ready, so frames arrive but are not detected
    let (state, router) = server(RecognizerHandle::default());
    let dir = frames_dir();
    let started = router
        .clone()
        .oneshot(json_request("POST", "/cameras/idle/start", directory_source(&dir)))
        .await
        .unwrap();
    assert_eq!(started.status(), StatusCode::OK);
    assert!(wait_for_frame(&router, "idle").await);

    let detections = router
        .clone()
        .oneshot(get("/cameras/idle/detections"))
        .await
        .unwrap();
    assert_eq!(detections.status(), StatusCode::OK);
    assert_eq!(
        json_body(detections).await,
        serde_json::json!({ "plates": [] })
    );

    let metrics = router
        .oneshot(get("/cameras/idle/metrics"))
        .await
        .unwrap();
    assert_eq!(metrics.status(), StatusCode::OK);
    assert!(json_body(metrics).await.get("detection_time").is_none());
    state.cameras().stop("idle").unwrap();
}

#[tokio::test]
async fn stream_sends_mjpeg_parts() {
    let dir = frames_dir();
    let (state, router) = ready_server();

    let started = router
        .clone()
        .oneshot(json_request("POST", "/cameras/lane/start", directory_source(&dir)))
        .await
        .unwrap();
    assert_eq!(started.status(), StatusCode::OK);
    assert!(wait_for_frame(&router, "lane").await);

    let response = router
        .oneshot(get("/cameras/lane/stream"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[CONTENT_TYPE],
        "multipart/x-mixed-replace; boundary=frame"
    );

    let mut chunks = response.into_body().into_data_stream();
    let first = tokio::time::timeout(Duration::from_secs(5), chunks.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(first.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8"));
    assert!(first.ends_with(b"\r\n"));

    state.cameras().stop("lane").unwrap();
    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        while chunks.next().await.is_some() {}
    })
    .await;
    assert!(ended.is_ok());
}
