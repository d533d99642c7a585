use crate::{
    LogLevel,
    camera::CameraSettings,
    detector::OnnxConfig,
    pipeline::RecognizerConfig,
    source::CameraSource,
};
use anyhow::Context;
use clap::{CommandFactory, FromArgMatches, Parser, parser::ValueSource};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::info;

/// A camera started at boot, only settable through the config file.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CameraConfig {
    pub id: String,
    pub source: CameraSource,
}

#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(
    version = env!("CARGO_PKG_VERSION"),
    about = "License plate recognition for uploads and live camera streams",
    rename_all = "snake_case"
)]
#[serde(default)]
pub struct Cli {
    /// The port on which the server will listen for HTTP requests.
    #[arg(long, default_value_t = 4050)]
    pub port: u16,
    /// Path to the plate localization ONNX model.
    #[arg(long, default_value = "model/LP_detector.onnx")]
    pub detector_model: PathBuf,
    /// Path to the character recognition ONNX model.
    #[arg(long, default_value = "model/LP_ocr.onnx")]
    pub ocr_model: PathBuf,
    /// Character classes yaml file with a NAMES list, the bundled list is used if not given
    #[arg(long)]
    pub ocr_classes: Option<PathBuf>,
    /// Minimum objectness for a plate box
    #[arg(long, default_value_t = 0.5)]
    pub plate_confidence: f32,
    /// Minimum objectness for a character box
    #[arg(long, default_value_t = 0.60)]
    pub character_confidence: f32,
    /// IoU above which overlapping boxes of the same class are suppressed
    #[arg(long, default_value_t = 0.5)]
    pub iou_threshold: f32,
    /// Force using CPU for inference
    #[arg(long, default_value_t = false)]
    pub force_cpu: bool,
    /// GPU Index, best effort to select the correct one if multiple GPUs exist.
    #[arg(long, default_value_t = 0)]
    pub gpu_index: i32,
    /// Intra thread parallelism max is cpu cores - 1
    #[arg(long, default_value_t = 192)]
    pub intra_threads: usize,
    /// Inter thread parallelism max is cpu cores - 1
    #[arg(long, default_value_t = 192)]
    pub inter_threads: usize,
    /// Requests queued for the recognizer before new ones are rejected
    #[arg(long)]
    pub worker_queue_size: Option<usize>,
    /// Seconds to wait for a recognition before giving up
    #[arg(long, default_value_t = 30)]
    pub request_timeout: u64,
    /// Largest accepted upload in megabytes
    #[arg(long, default_value_t = 30)]
    pub max_upload_size_mb: usize,
    /// Origins allowed by CORS, separated by ','
    #[arg(long, value_delimiter = ',', default_value = "http://localhost:3000")]
    pub cors_origins: Vec<String>,
    /// TTF font for overlay text, well known system fonts are tried if not given
    #[arg(long)]
    pub font_path: Option<PathBuf>,
    /// Frames buffered between capture and detection per camera
    #[arg(long, default_value_t = 10)]
    pub frame_queue_size: usize,
    /// Minimum time between two detections on one camera
    #[arg(long, default_value_t = 200)]
    pub detection_interval_ms: u64,
    /// Time between two frames of an MJPEG stream response
    #[arg(long, default_value_t = 30)]
    pub stream_interval_ms: u64,
    /// JPEG quality of streamed and served frames
    #[arg(long, default_value_t = 95, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub jpeg_quality: u8,
    /// Sets the level of logging
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,
    /// If log_path is set, then stdout logging will be disabled and it will log to file
    #[arg(long)]
    pub log_path: Option<PathBuf>,
    /// Optional path to save annotated uploads
    #[arg(long)]
    pub save_image_path: Option<PathBuf>,
    /// JSON config file, explicit command line flags take precedence over it
    #[arg(long)]
    #[serde(skip)]
    pub config: Option<PathBuf>,
    /// Print the effective configuration as JSON and exit
    #[arg(long, default_value_t = false)]
    #[serde(skip)]
    pub print_config: bool,
    /// Cameras started at boot
    #[arg(skip)]
    pub cameras: Vec<CameraConfig>,
}

impl Default for Cli {
    fn default() -> Self {
        Cli::parse_from(["platewatch"])
    }
}

impl Cli {
    /// Parses the command line and layers it over `--config` if given.
    pub fn from_config_and_args() -> anyhow::Result<Self> {
        let matches = Cli::command().get_matches();
        let args = Cli::from_arg_matches(&matches)?;
        let Some(config_path) = args.config.clone() else {
            return Ok(args);
        };

        let file_config = Cli::load_config(&config_path)?;
        let mut merged = file_config.merge_args(&args, |id| {
            matches.value_source(id) == Some(ValueSource::CommandLine)
        })?;
        merged.config = Some(config_path);
        merged.print_config = args.print_config;
        Ok(merged)
    }

    /// Copies the fields of `args` for which `explicit` is true onto `self`.
    fn merge_args(&self, args: &Cli, explicit: impl Fn(&str) -> bool) -> anyhow::Result<Cli> {
        let mut merged = serde_json::to_value(self)?;
        let overrides = serde_json::to_value(args)?;
        if let (Some(merged), Some(overrides)) = (merged.as_object_mut(), overrides.as_object()) {
            for (key, value) in overrides {
                if key != "cameras" && explicit(key) {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(serde_json::from_value(merged)?)
    }

    pub fn load_config(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = serde_json::from_str(&data)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    pub fn save_config(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        info!(config = %path.display(), "Configuration saved");
        Ok(())
    }

    pub fn log_config(&self) {
        info!("Configuration:");
        info!("  port: {}", self.port);
        info!("  detector_model: {}", self.detector_model.display());
        info!("  ocr_model: {}", self.ocr_model.display());
        info!(
            "  ocr_classes: {}",
            self.ocr_classes
                .as_ref()
                .map_or("bundled".to_string(), |p| p.display().to_string())
        );
        info!(
            "  confidence: plate {} character {} iou {}",
            self.plate_confidence, self.character_confidence, self.iou_threshold
        );
        info!(
            "  inference: force_cpu {} gpu_index {} intra {} inter {}",
            self.force_cpu, self.gpu_index, self.intra_threads, self.inter_threads
        );
        info!("  worker_queue_size: {:?}", self.worker_queue_size);
        info!("  request_timeout: {}s", self.request_timeout);
        info!("  cors_origins: {}", self.cors_origins.join(", "));
        info!(
            "  cameras: frame_queue_size {} detection_interval {}ms stream_interval {}ms",
            self.frame_queue_size, self.detection_interval_ms, self.stream_interval_ms
        );
        for camera in self.cameras.iter() {
            info!("  camera {}: {}", camera.id, camera.source);
        }
    }

    pub fn recognizer_config(&self) -> RecognizerConfig {
        let onnx_config = |model: &PathBuf| OnnxConfig {
            intra_threads: self.intra_threads,
            inter_threads: self.inter_threads,
            gpu_index: self.gpu_index,
            force_cpu: self.force_cpu,
            model: model.clone(),
        };
        RecognizerConfig {
            plate_onnx_config: onnx_config(&self.detector_model),
            ocr_onnx_config: onnx_config(&self.ocr_model),
            ocr_classes: self.ocr_classes.clone(),
            plate_confidence: self.plate_confidence,
            character_confidence: self.character_confidence,
            iou_threshold: self.iou_threshold,
        }
    }

    pub fn camera_settings(&self) -> CameraSettings {
        CameraSettings {
            frame_queue_size: self.frame_queue_size,
            detection_interval: Duration::from_millis(self.detection_interval_ms),
            ..Default::default()
        }
    }
}
