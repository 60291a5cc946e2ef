use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::info;

/// COCO class id of "person".
pub const PERSON_CLASS_ID: u32 = 0;
/// Default object confidence threshold.
pub const OBJ_THRESH: f32 = 0.25;
/// Default NMS IoU threshold.
pub const NMS_THRESH: f32 = 0.45;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Pixel coordinates `[left, top, right, bottom]`.
    pub bbox: [f32; 4],
    pub score: f32,
    #[serde(rename = "class")]
    pub class_name: String,
    #[serde(rename = "classId")]
    pub class_id: u32,
}

impl Detection {
    pub fn is_person(&self) -> bool {
        self.class_id == PERSON_CLASS_ID
    }
}

/// Object detector over RGB frames. Inference engines (native, accelerator
/// or fallback) live outside this crate and are plugged in through
/// [`DetectorFactory`].
pub trait Detector: Send {
    fn detect(&mut self, frame: &RgbImage) -> anyhow::Result<Vec<Detection>>;
}

/// Model backend selected by the artifact's file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelPlatform {
    TorchScript,
    Rknn,
    Onnx,
}

impl ModelPlatform {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str())? {
            "pt" | "torchscript" => Some(Self::TorchScript),
            "rknn" => Some(Self::Rknn),
            "onnx" => Some(Self::Onnx),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectorSpec {
    pub model_path: PathBuf,
    pub platform: ModelPlatform,
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
}

type DetectorLoader = dyn Fn(&DetectorSpec) -> anyhow::Result<Box<dyn Detector>> + Send + Sync;

/// Builds detectors for a validated model artifact. The factory fails fast
/// on a missing file or an unsupported format before the backend is even
/// consulted.
#[derive(Clone)]
pub struct DetectorFactory(Arc<DetectorLoader>);

impl DetectorFactory {
    pub fn new(
        loader: impl Fn(&DetectorSpec) -> anyhow::Result<Box<dyn Detector>> + Send + Sync + 'static,
    ) -> Self {
        Self(Arc::new(loader))
    }

    /// Placeholder for deployments without an inference engine; loading
    /// always fails, which leaves the detection monitor idle.
    pub fn unavailable() -> Self {
        Self::new(|spec| {
            anyhow::bail!(
                "No inference backend available for {:?} model {:?}",
                spec.platform,
                spec.model_path
            )
        })
    }

    pub fn load(
        &self,
        model_path: &Path,
        confidence_threshold: f32,
    ) -> anyhow::Result<Box<dyn Detector>> {
        if !model_path.exists() {
            anyhow::bail!("Model not found: {model_path:?}");
        }
        let platform = ModelPlatform::from_path(model_path)
            .ok_or_else(|| anyhow::anyhow!("Unsupported model format: {model_path:?}"))?;
        info!("Loading {platform:?} model from {model_path:?}");
        (self.0)(&DetectorSpec {
            model_path: model_path.to_owned(),
            platform,
            confidence_threshold,
            nms_threshold: NMS_THRESH,
        })
    }
}

const BOX_COLOR: Rgb<u8> = Rgb([255, 32, 32]);

/// Copies the frame and draws a rectangle outline per detection.
pub fn annotate(frame: &RgbImage, detections: &[Detection]) -> RgbImage {
    let mut annotated = frame.clone();
    let (width, height) = annotated.dimensions();
    if width == 0 || height == 0 {
        return annotated;
    }

    for detection in detections {
        let clamp_x = |v: f32| (v.max(0.0) as u32).min(width - 1);
        let clamp_y = |v: f32| (v.max(0.0) as u32).min(height - 1);
        let (left, top) = (clamp_x(detection.bbox[0]), clamp_y(detection.bbox[1]));
        let (right, bottom) = (clamp_x(detection.bbox[2]), clamp_y(detection.bbox[3]));

        for x in left..=right {
            annotated.put_pixel(x, top, BOX_COLOR);
            annotated.put_pixel(x, bottom, BOX_COLOR);
        }
        for y in top..=bottom {
            annotated.put_pixel(left, y, BOX_COLOR);
            annotated.put_pixel(right, y, BOX_COLOR);
        }
    }
    annotated
}
