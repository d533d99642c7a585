use crate::{
    api::Detection,
    direct_ml_available,
    image::{Image, Resizer},
};
use anyhow::{anyhow, bail};
use ndarray::{Array, ArrayView2, Axis, Ix2, s};
use ort::{
    execution_providers::ExecutionProviderDispatch,
    session::{Session, SessionOutputs},
    value::Tensor,
};
use smallvec::SmallVec;
use std::{
    fmt::Debug,
    path::PathBuf,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

const YOLO_INPUT_SIZE: usize = 640;

#[derive(Debug, Clone)]
pub struct OnnxConfig {
    pub intra_threads: usize,
    pub inter_threads: usize,
    pub gpu_index: i32,
    pub force_cpu: bool,
    pub model: PathBuf,
}

pub struct YoloDetections {
    pub detections: SmallVec<[Detection; 10]>,
    pub resize_image_time: Duration,
    pub inference_time: Duration,
    pub post_processing_time: Duration,
}

impl Debug for YoloDetections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YoloDetections")
            .field("# detections", &self.detections.len())
            .field("resize_image_time", &self.resize_image_time)
            .field("inference_time", &self.inference_time)
            .field("post_processing_time", &self.post_processing_time)
            .finish()
    }
}

/// One YOLOv5 model exported to ONNX with a `[1, 3, 640, 640]` `images` input.
pub struct YoloSession {
    session: Session,
    resizer: Resizer,
    resized_image: Image,
    input: Array<f32, ndarray::Dim<[usize; 4]>>,
    classes: Vec<String>,
    iou_threshold: f32,
    model_name: String,
    execution_provider: ExecutionProvider,
}

impl YoloSession {
    pub fn new(
        onnx_config: &OnnxConfig,
        classes: Vec<String>,
        iou_threshold: f32,
    ) -> anyhow::Result<Self> {
        if classes.is_empty() {
            bail!("Model {:?} needs at least one class", onnx_config.model);
        }
        let (execution_provider, model_name, session) = initialize_onnx(onnx_config)?;
        Ok(Self {
            session,
            resizer: Resizer::new(YOLO_INPUT_SIZE, YOLO_INPUT_SIZE),
            resized_image: Image::default(),
            input: Array::zeros((1, 3, YOLO_INPUT_SIZE, YOLO_INPUT_SIZE)),
            classes,
            iou_threshold,
            model_name,
            execution_provider,
        })
    }

    pub fn detect(
        &mut self,
        image: &Image,
        confidence_threshold: f32,
    ) -> anyhow::Result<YoloDetections> {
        if image.is_empty() {
            bail!("Cannot run {} on an empty image", self.model_name);
        }
        let (target_width, target_height) = self.resizer.target_size();
        let resize_factor_x = image.width as f32 / target_width as f32;
        let resize_factor_y = image.height as f32 / target_height as f32;

        let resize_image_start_time = Instant::now();
        self.resizer.resize_image(image, &mut self.resized_image)?;
        for (index, chunk) in self.resized_image.pixels.chunks_exact(3).enumerate() {
            let y = index / target_width;
            let x = index % target_width;
            self.input[[0, 0, y, x]] = chunk[0] as f32 / 255.0;
            self.input[[0, 1, y, x]] = chunk[1] as f32 / 255.0;
            self.input[[0, 2, y, x]] = chunk[2] as f32 / 255.0;
        }
        let resize_image_time = resize_image_start_time.elapsed();

        let input = Tensor::from_array(self.input.clone())?;
        let inference_start_time = Instant::now();
        let outputs: SessionOutputs = self.session.run(ort::inputs!["images" => input])?;
        let inference_time = inference_start_time.elapsed();
        debug!(model = %self.model_name, ?inference_time, "Inference time");

        let post_processing_start_time = Instant::now();
        let output = outputs[0].try_extract_array::<f32>()?;
        let output = output
            .index_axis(Axis(0), 0)
            .into_dimensionality::<Ix2>()
            .map_err(|e| anyhow!("Unexpected output shape from {}: {e}", self.model_name))?;

        let detections = yolo5_post_process(
            output,
            confidence_threshold,
            resize_factor_x,
            resize_factor_y,
            &self.classes,
        )?;
        let detections = non_maximum_suppression(detections, self.iou_threshold);
        let post_processing_time = post_processing_start_time.elapsed();

        for (i, detection) in detections.iter().enumerate() {
            debug!("{} detection - {}: {:?}", self.model_name, i + 1, detection);
        }

        Ok(YoloDetections {
            detections,
            resize_image_time,
            inference_time,
            post_processing_time,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn execution_provider(&self) -> ExecutionProvider {
        self.execution_provider
    }
}

/// Rows are `[cx, cy, w, h, objectness, class scores...]` in 640x640 input space.
pub fn yolo5_post_process(
    output: ArrayView2<f32>,
    confidence_threshold: f32,
    resize_factor_x: f32,
    resize_factor_y: f32,
    classes: &[String],
) -> anyhow::Result<SmallVec<[Detection; 10]>> {
    if output.shape()[1] != 5 + classes.len() {
        bail!(
            "Unexpected yolo output shape, expected {} columns, got {}. This probably means that the classes file does not match the model.",
            5 + classes.len(),
            output.shape()[1]
        );
    }

    let mut detections = SmallVec::<[Detection; 10]>::new();
    for row in output.outer_iter() {
        if row[4] <= confidence_threshold {
            continue;
        }
        let class_idx = row
            .slice(s![5..])
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(idx, _)| idx)
            .unwrap_or(0);

        let x_center = row[0] * resize_factor_x;
        let y_center = row[1] * resize_factor_y;
        let width = row[2] * resize_factor_x;
        let height = row[3] * resize_factor_y;
        detections.push(Detection {
            x_min: (x_center - width / 2.0).max(0.0) as usize,
            y_min: (y_center - height / 2.0).max(0.0) as usize,
            x_max: (x_center + width / 2.0).max(0.0) as usize,
            y_max: (y_center + height / 2.0).max(0.0) as usize,
            confidence: row[4],
            label: classes[class_idx].clone(),
        });
    }
    Ok(detections)
}

/// Greedy per-label suppression, highest confidence first.
pub fn non_maximum_suppression(
    mut detections: SmallVec<[Detection; 10]>,
    iou_threshold: f32,
) -> SmallVec<[Detection; 10]> {
    let mut filtered = SmallVec::new();

    detections.sort_by(|a, b| {
        a.label
            .cmp(&b.label)
            .then(b.confidence.total_cmp(&a.confidence))
    });

    let mut current_label = None;
    let mut kept: SmallVec<[Detection; 10]> = SmallVec::new();

    for detection in detections.iter() {
        if Some(&detection.label) != current_label {
            filtered.extend(kept.drain(..));
            current_label = Some(&detection.label);
        }
        let overlaps = kept
            .iter()
            .any(|kept_detection| calculate_iou(detection, kept_detection) >= iou_threshold);
        if !overlaps {
            kept.push(detection.clone());
        }
    }
    filtered.extend(kept);
    filtered
}

pub fn calculate_iou(a: &Detection, b: &Detection) -> f32 {
    let x_min = a.x_min.max(b.x_min) as f32;
    let y_min = a.y_min.max(b.y_min) as f32;
    let x_max = a.x_max.min(b.x_max) as f32;
    let y_max = a.y_max.min(b.y_max) as f32;
    let intersection = (x_max - x_min).max(0.0) * (y_max - y_min).max(0.0);
    let area_a = a.width() as f32 * a.height() as f32;
    let area_b = b.width() as f32 * b.height() as f32;
    let union = area_a + area_b - intersection;

    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

fn initialize_onnx(
    onnx_config: &OnnxConfig,
) -> anyhow::Result<(ExecutionProvider, String, Session)> {
    #[cfg_attr(not(windows), allow(unused_mut))]
    let mut providers: Vec<ExecutionProviderDispatch> = Vec::new();
    let mut execution_provider = ExecutionProvider::CPU;
    let max_threads = num_cpus::get_physical().saturating_sub(1).max(1);

    let (num_intra_threads, num_inter_threads) = if onnx_config.force_cpu {
        let num_intra_threads = onnx_config.intra_threads.min(max_threads);
        let num_inter_threads = onnx_config.inter_threads.min(max_threads);
        info!(
            "Forcing CPU for inference with {} intra and {} inter threads",
            num_intra_threads, num_inter_threads
        );
        (num_intra_threads, num_inter_threads)
    } else if direct_ml_available() {
        info!(
            gpu_index = onnx_config.gpu_index,
            "DirectML available, using DirectML for inference"
        );
        #[cfg(windows)]
        providers.push(
            ort::execution_providers::DirectMLExecutionProvider::default()
                .with_device_id(onnx_config.gpu_index)
                .build()
                .error_on_failure(),
        );
        execution_provider = ExecutionProvider::DirectML(onnx_config.gpu_index as usize);
        (1, 1) // For GPU we just hardcode to 1 thread
    } else {
        let num_intra_threads = onnx_config.intra_threads.min(max_threads);
        let num_inter_threads = onnx_config.inter_threads.min(max_threads);
        warn!(
            "GPU not available, falling back to CPU for inference with {} intra and {} inter threads",
            num_intra_threads, num_inter_threads
        );
        (num_intra_threads, num_inter_threads)
    };

    let model_name = onnx_config
        .model
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("Invalid model path {:?}", onnx_config.model))?
        .to_string();
    let Ok(model_bytes) = std::fs::read(&onnx_config.model) else {
        bail!(
            "Failed to read model file {:?}, ensure it exists or pass another path",
            onnx_config.model
        );
    };

    info!(
        "Initializing {} with inference running on {}",
        model_name, execution_provider,
    );

    let session = Session::builder()?
        .with_execution_providers(providers)?
        .with_intra_threads(num_intra_threads)?
        .with_inter_threads(num_inter_threads)?
        .commit_from_memory(model_bytes.as_slice())?;

    Ok((execution_provider, model_name, session))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionProvider {
    CPU,
    DirectML(usize),
}

impl std::fmt::Display for ExecutionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionProvider::CPU => write!(f, "CPU"),
            ExecutionProvider::DirectML(index) => write!(f, "DirectML(GPU {index})"),
        }
    }
}
