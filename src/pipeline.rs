use crate::{
    api::PlateRead,
    detector::{ExecutionProvider, OnnxConfig, YoloSession},
    image::{Image, crop},
    plate::{DESKEW_VARIANTS, deskew, read_plate},
};
use serde::Deserialize;
use std::{
    path::PathBuf,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

pub static LP_OCR_CLASSES_STR: &str = include_str!("../assets/lp_ocr_classes.yaml");
pub const PLATE_CLASS: &str = "license_plate";
pub const UNKNOWN_PLATE: &str = "Unknown";

#[allow(non_snake_case)]
#[derive(Debug, Deserialize)]
struct PlateClasses {
    NAMES: Vec<String>,
}

/// Character classes from `yaml_file`, or the bundled list.
pub fn get_ocr_classes(yaml_file: Option<PathBuf>) -> anyhow::Result<Vec<String>> {
    let yaml_data = match yaml_file {
        Some(yaml_file) => std::fs::read_to_string(yaml_file)?,
        None => LP_OCR_CLASSES_STR.to_string(),
    };
    Ok(serde_yaml::from_str::<PlateClasses>(yaml_data.as_str())?.NAMES)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recognition {
    pub plates: Vec<PlateRead>,
    /// Set when no plate was located and the whole image was read instead.
    pub full_image_text: Option<String>,
    pub inference_time: Duration,
}

impl Recognition {
    /// Last plate read in detector order, then the full image read, then "Unknown".
    pub fn best_plate(&self) -> String {
        self.plates
            .last()
            .map(|plate| plate.license_plate.clone())
            .or_else(|| self.full_image_text.clone())
            .unwrap_or_else(|| UNKNOWN_PLATE.to_string())
    }
}

/// Seam between the worker and the models, tests plug in fakes here.
pub trait Recognize: Send {
    fn recognize(&mut self, image: &Image, fallback_full_image: bool)
    -> anyhow::Result<Recognition>;

    fn model_name(&self) -> String;

    fn execution_provider(&self) -> ExecutionProvider;
}

#[derive(Debug, Clone)]
pub struct RecognizerConfig {
    pub plate_onnx_config: OnnxConfig,
    pub ocr_onnx_config: OnnxConfig,
    pub ocr_classes: Option<PathBuf>,
    pub plate_confidence: f32,
    pub character_confidence: f32,
    pub iou_threshold: f32,
}

/// Plate localizer followed by the character reader.
pub struct PlateRecognizer {
    plate_detector: YoloSession,
    character_detector: YoloSession,
    plate_confidence: f32,
    character_confidence: f32,
}

impl PlateRecognizer {
    pub fn new(config: RecognizerConfig) -> anyhow::Result<Self> {
        let plate_detector = YoloSession::new(
            &config.plate_onnx_config,
            vec![PLATE_CLASS.to_string()],
            config.iou_threshold,
        )?;
        let character_detector = YoloSession::new(
            &config.ocr_onnx_config,
            get_ocr_classes(config.ocr_classes)?,
            config.iou_threshold,
        )?;

        let mut recognizer = Self {
            plate_detector,
            character_detector,
            plate_confidence: config.plate_confidence,
            character_confidence: config.character_confidence,
        };

        info!("Warming up the recognizer");
        let warm_up_image = Image::from_rgb(640, 640, vec![0; 640 * 640 * 3])?;
        let warm_up_start_time = Instant::now();
        recognizer.recognize(&warm_up_image, true)?;
        info!(warm_up_time = ?warm_up_start_time.elapsed(), "Recognizer ready");

        Ok(recognizer)
    }

    /// Reads one crop trying every deskew variant until one yields a plate.
    fn read_crop(&mut self, crop_image: &Image, inference_time: &mut Duration) -> Option<String> {
        for (change_contrast, center_threshold) in DESKEW_VARIANTS {
            let deskewed = match deskew(crop_image, change_contrast, center_threshold) {
                Ok(deskewed) => deskewed,
                Err(err) => {
                    warn!(?err, "Failed to deskew plate crop");
                    continue;
                }
            };
            match self.read_characters(&deskewed, inference_time) {
                Ok(Some(license_plate)) => return Some(license_plate),
                Ok(None) => {}
                Err(err) => warn!(?err, "Failed to read characters"),
            }
        }
        None
    }

    fn read_characters(
        &mut self,
        image: &Image,
        inference_time: &mut Duration,
    ) -> anyhow::Result<Option<String>> {
        let characters = self
            .character_detector
            .detect(image, self.character_confidence)?;
        *inference_time += characters.inference_time;
        Ok(read_plate(&characters.detections))
    }
}

impl Recognize for PlateRecognizer {
    fn recognize(
        &mut self,
        image: &Image,
        fallback_full_image: bool,
    ) -> anyhow::Result<Recognition> {
        let plates = self.plate_detector.detect(image, self.plate_confidence)?;
        let mut inference_time = plates.inference_time;
        debug!(?plates, "Plate detection finished");

        let mut recognition = Recognition::default();
        if plates.detections.is_empty() {
            if fallback_full_image {
                recognition.full_image_text = self.read_characters(image, &mut inference_time)?;
            }
            recognition.inference_time = inference_time;
            return Ok(recognition);
        }

        for plate in plates.detections.iter() {
            let [x, y, w, h] = PlateRead::from_detection(String::new(), plate).bbox;
            let crop_image = match crop(image, x, y, w, h) {
                Ok(crop_image) => crop_image,
                Err(err) => {
                    debug!(?err, "Skipping plate outside the image");
                    continue;
                }
            };
            if let Some(license_plate) = self.read_crop(&crop_image, &mut inference_time) {
                recognition
                    .plates
                    .push(PlateRead::from_detection(license_plate, plate));
            }
        }

        recognition.inference_time = inference_time;
        Ok(recognition)
    }

    fn model_name(&self) -> String {
        format!(
            "{} + {}",
            self.plate_detector.model_name(),
            self.character_detector.model_name()
        )
    }

    fn execution_provider(&self) -> ExecutionProvider {
        self.plate_detector.execution_provider()
    }
}
