use crate::source::CameraSource;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt::Debug};

/// A single box produced by one of the YOLO stages, in original image coordinates.
#[derive(Serialize, Deserialize, Clone, PartialEq)]
pub struct Detection {
    pub x_max: usize,
    pub x_min: usize,
    pub y_max: usize,
    pub y_min: usize,
    pub confidence: f32,
    pub label: String,
}

impl Detection {
    pub fn width(&self) -> usize {
        self.x_max.saturating_sub(self.x_min)
    }

    pub fn height(&self) -> usize {
        self.y_max.saturating_sub(self.y_min)
    }

    pub fn center(&self) -> (f32, f32) {
        (
            (self.x_min + self.x_max) as f32 / 2.0,
            (self.y_min + self.y_max) as f32 / 2.0,
        )
    }
}

impl Debug for Detection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Detection")
            .field("label", &self.label)
            .field("confidence", &self.confidence)
            .field("x_min", &self.x_min)
            .field("y_min", &self.y_min)
            .finish()
    }
}

/// A plate that was both located and read.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PlateRead {
    pub license_plate: String,
    pub confidence: f32,
    /// `[x, y, width, height]` in pixels.
    pub bbox: [i32; 4],
}

impl PlateRead {
    pub fn from_detection(license_plate: String, detection: &Detection) -> Self {
        Self {
            license_plate,
            confidence: detection.confidence,
            bbox: [
                detection.x_min as i32,
                detection.y_min as i32,
                detection.width() as i32,
                detection.height() as i32,
            ],
        }
    }
}

#[derive(Serialize, Deserialize, Default, Debug)]
#[serde(rename_all = "camelCase", default)]
pub struct RecognizeResponse {
    /// True if the image was processed.
    pub success: bool,
    /// Best plate string, "Unknown" when nothing could be read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_plate: Option<String>,
    /// Every plate read in the image.
    pub plates: Vec<PlateRead>,
    /// A description of the error if success was false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    // The time (ms) spent in the two model stages.
    pub inference_ms: i32,
    // The time (ms) to process the image, decoding included.
    pub process_ms: i32,
    // The time (ms) from request arrival to response.
    pub analysis_round_trip_ms: i32,
}

impl RecognizeResponse {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CameraStatus {
    Initializing,
    Running,
    Error,
    Stopped,
}

impl std::fmt::Display for CameraStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CameraStatus::Initializing => write!(f, "INITIALIZING"),
            CameraStatus::Running => write!(f, "RUNNING"),
            CameraStatus::Error => write!(f, "ERROR"),
            CameraStatus::Stopped => write!(f, "STOPPED"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CameraMetrics {
    /// Unix time in seconds of the last captured frame.
    pub timestamp: f64,
    pub fps: f32,
    pub queue_size: usize,
    pub status: CameraStatus,
    /// Seconds spent on the last detection, absent until the first one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detection_time: Option<f64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct DetectionResult {
    /// Unix time in seconds when the detection finished.
    pub timestamp: f64,
    pub plates: Vec<PlateRead>,
    /// Seconds, rounded to milliseconds.
    pub detection_time: f64,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct HealthResponse {
    pub status: String,
    pub message: String,
    pub recognizer: String,
    pub cameras: BTreeMap<String, CameraStatus>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CameraSummary {
    pub id: String,
    pub status: CameraStatus,
    pub fps: f32,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct CameraListResponse {
    pub cameras: Vec<CameraSummary>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct StartCameraRequest {
    pub source: Option<CameraSource>,
    /// Local capture device index, accepted only to give a clear error.
    pub camera_index: Option<i32>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub error: String,
}

/// Service counters for `/recognize`, timings in milliseconds.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct StatsResponse {
    pub version: String,
    pub uptime: String,
    pub model_name: String,
    pub execution_provider: String,
    pub log_path: String,
    pub cameras: usize,
    pub number_of_requests: u64,
    pub dropped_requests: u64,
    pub avg_inference_ms: i32,
    pub min_inference_ms: i32,
    pub max_inference_ms: i32,
    pub avg_processing_ms: i32,
    pub min_processing_ms: i32,
    pub max_processing_ms: i32,
    pub avg_analysis_round_trip_ms: i32,
    pub min_analysis_round_trip_ms: i32,
    pub max_analysis_round_trip_ms: i32,
}
