/// 多路检测系统 (Detection Stage)
///
/// 订阅所有摄像头的帧通道, 每个周期对有新帧的摄像头各做一次检测
/// - crop:  缩放/裁剪/标注
/// - stage: 多路复用主循环
/// - yolo:  ONNX检测器 (feature `onnx`)
pub mod crop;
pub mod stage;
pub mod yolo;

use anyhow::Result;
use image::RgbImage;

use crate::config::DetectionConfig;

pub use stage::{CameraInput, CycleOutput, DetectionStage};
pub use yolo::{load_detector, non_max_suppression};

// ========== 数据结构 ==========

/// 检测框 (Detection bounding box), 像素坐标
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub class_id: u32,
}

impl BBox {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn iou(&self, other: &BBox) -> f32 {
        let w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = w * h;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// 推理参数
#[derive(Clone, Debug, PartialEq)]
pub struct InferenceParams {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
    /// 空 = 不过滤类别
    pub target_classes: Vec<u32>,
    pub half_precision: bool,
    pub device: String,
}

impl InferenceParams {
    pub fn accepts_class(&self, class_id: u32) -> bool {
        self.target_classes.is_empty() || self.target_classes.contains(&class_id)
    }
}

impl From<&DetectionConfig> for InferenceParams {
    fn from(config: &DetectionConfig) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            iou_threshold: config.iou_threshold,
            max_detections: config.max_detections,
            target_classes: config.target_classes.clone(),
            half_precision: config.half_precision,
            device: config.device.clone(),
        }
    }
}

/// 检测器接口 (外部模型)
pub trait Detector: Send {
    /// 检测框坐标相对于传入的 `image`
    fn detect(&mut self, image: &RgbImage, params: &InferenceParams) -> Result<Vec<BBox>>;

    /// 标注可视化 (默认画框)
    fn annotate(&self, image: &RgbImage, boxes: &[BBox]) -> RgbImage {
        crop::draw_boxes(image, boxes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x1: f32, y1: f32, x2: f32, y2: f32) -> BBox {
        BBox {
            x1,
            y1,
            x2,
            y2,
            confidence: 0.9,
            class_id: 0,
        }
    }

    #[test]
    fn test_iou() {
        let a = bbox(0.0, 0.0, 10.0, 10.0);
        let b = bbox(5.0, 0.0, 15.0, 10.0);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(a.iou(&bbox(20.0, 20.0, 30.0, 30.0)), 0.0);
    }

    #[test]
    fn test_empty_target_classes_accepts_all() {
        let mut params = InferenceParams {
            confidence_threshold: 0.25,
            iou_threshold: 0.45,
            max_detections: 10,
            target_classes: vec![],
            half_precision: false,
            device: "cpu".into(),
        };
        assert!(params.accepts_class(7));
        params.target_classes = vec![0];
        assert!(!params.accepts_class(7));
        assert!(params.accepts_class(0));
    }
}
