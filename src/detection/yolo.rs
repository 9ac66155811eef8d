// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// YOLOv8 检测器
// 包含: letterbox预处理、输出解码、NMS、ONNX推理 (feature `onnx`)

use anyhow::{ensure, Result};
use image::RgbImage;
use ndarray::{Array4, ArrayView2, Axis};

use super::{BBox, Detector, InferenceParams};
use crate::config::DetectionConfig;
use crate::imaging::resize_rgb;

/// letterbox填充灰度
const PAD_VALUE: f32 = 144.0 / 255.0;

/// 按置信度降序做NMS, 原地保留幸存的框
pub fn non_max_suppression(xs: &mut Vec<BBox>, iou_threshold: f32) {
    xs.sort_by(|b1, b2| b2.confidence.total_cmp(&b1.confidence));

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            let iou = xs[prev_index].iou(&xs[index]);
            if iou > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}

/// 等比缩放到 `size`×`size` 的左上角, 其余填充; 返回 NCHW 张量和缩放比
pub fn letterbox(image: &RgbImage, size: u32) -> Result<(Array4<f32>, f32)> {
    let (w0, h0) = image.dimensions();
    ensure!(w0 > 0 && h0 > 0, "空图像");

    let ratio = (size as f32 / w0 as f32).min(size as f32 / h0 as f32);
    let w_new = ((w0 as f32 * ratio).round() as u32).clamp(1, size);
    let h_new = ((h0 as f32 * ratio).round() as u32).clamp(1, size);
    let resized = resize_rgb(image, w_new, h_new)?;

    let s = size as usize;
    let mut ys = Array4::from_elem((1, 3, s, s), PAD_VALUE);
    for (x, y, rgb) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        let [r, g, b] = rgb.0;
        ys[[0, 0, y, x]] = r as f32 / 255.0;
        ys[[0, 1, y, x]] = g as f32 / 255.0;
        ys[[0, 2, y, x]] = b as f32 / 255.0;
    }
    Ok((ys, ratio))
}

/// 解码单张图的输出 `[4 + nc, anchors]` (cx, cy, w, h, 各类别分数)
///
/// 坐标除以 letterbox 缩放比后截断到原图范围, 再做NMS并截取前 `max_detections` 个
pub fn decode_predictions(
    preds: ArrayView2<f32>,
    ratio: f32,
    original: (u32, u32),
    params: &InferenceParams,
) -> Vec<BBox> {
    const CXYWH_OFFSET: usize = 4;
    let (w0, h0) = (original.0 as f32, original.1 as f32);
    if preds.nrows() <= CXYWH_OFFSET || ratio <= 0.0 {
        return Vec::new();
    }

    let mut data = Vec::new();
    for pred in preds.axis_iter(Axis(1)) {
        let Some((id, confidence)) = pred
            .iter()
            .skip(CXYWH_OFFSET)
            .copied()
            .enumerate()
            .reduce(|max, x| if x.1 > max.1 { x } else { max })
        else {
            continue;
        };

        if confidence < params.confidence_threshold || !params.accepts_class(id as u32) {
            continue;
        }

        let cx = pred[0] / ratio;
        let cy = pred[1] / ratio;
        let w = pred[2] / ratio;
        let h = pred[3] / ratio;
        data.push(BBox {
            x1: (cx - w / 2.).clamp(0.0, w0),
            y1: (cy - h / 2.).clamp(0.0, h0),
            x2: (cx + w / 2.).clamp(0.0, w0),
            y2: (cy + h / 2.).clamp(0.0, h0),
            confidence,
            class_id: id as u32,
        });
    }

    non_max_suppression(&mut data, params.iou_threshold);
    data.truncate(params.max_detections);
    data
}

/// 按配置加载检测模型
pub fn load_detector(config: &DetectionConfig) -> Result<Box<dyn Detector>> {
    #[cfg(feature = "onnx")]
    {
        Ok(Box::new(onnx::OnnxDetector::new(config)?))
    }
    #[cfg(not(feature = "onnx"))]
    {
        anyhow::bail!(
            "检测模型 {} 需要 onnx 特性 (cargo build --features onnx)",
            config.model_path.display()
        )
    }
}

#[cfg(feature = "onnx")]
pub use onnx::OnnxDetector;

#[cfg(feature = "onnx")]
mod onnx {
    use anyhow::{Context, Result};
    use image::RgbImage;
    use ndarray::{Axis, Ix3};
    use ort::execution_providers::CUDAExecutionProvider;
    use ort::session::builder::GraphOptimizationLevel;
    use ort::session::Session;
    use ort::value::Tensor;
    use tracing::{info, warn};

    use super::{decode_predictions, letterbox};
    use crate::config::DetectionConfig;
    use crate::detection::{BBox, Detector, InferenceParams};

    /// YOLOv8 ONNX 检测器
    pub struct OnnxDetector {
        session: Session,
        input_name: String,
        input_size: u32,
    }

    impl OnnxDetector {
        pub fn new(config: &DetectionConfig) -> Result<Self> {
            let mut builder =
                Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
            if config.device.starts_with("cuda") {
                builder = builder
                    .with_execution_providers([CUDAExecutionProvider::default().build()])?;
            }
            if config.half_precision {
                warn!("⚠️ 输入张量固定为FP32, 忽略 half_precision");
            }
            let session = builder
                .commit_from_file(&config.model_path)
                .with_context(|| format!("加载检测模型失败: {}", config.model_path.display()))?;
            let input_name = session
                .inputs
                .first()
                .map(|i| i.name.clone())
                .context("模型没有输入")?;

            info!(
                "✅ 检测模型已加载: {} (输入 {} {}x{}, 设备 {})",
                config.model_path.display(),
                input_name,
                config.input_size,
                config.input_size,
                config.device
            );
            Ok(Self {
                session,
                input_name,
                input_size: config.input_size,
            })
        }
    }

    impl Detector for OnnxDetector {
        fn detect(&mut self, image: &RgbImage, params: &InferenceParams) -> Result<Vec<BBox>> {
            let (input, ratio) = letterbox(image, self.input_size)?;
            let tensor = Tensor::from_array(input)?;
            let outputs = self
                .session
                .run(ort::inputs![self.input_name.as_str() => tensor])
                .context("检测推理失败")?;
            let preds = outputs[0]
                .try_extract_array::<f32>()
                .context("读取检测输出失败")?
                .into_dimensionality::<Ix3>()
                .context("检测输出维度不是 [1, 4+nc, anchors]")?;

            Ok(decode_predictions(
                preds.index_axis(Axis(0), 0),
                ratio,
                image.dimensions(),
                params,
            ))
        }
    }
}
