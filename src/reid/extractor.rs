//! 外观特征提取 (外部ReID模型)

use anyhow::{ensure, Result};
use image::RgbImage;
use ndarray::Array4;

use super::embedding::Embedding;
use crate::config::ResolverConfig;
use crate::imaging::resize_rgb;

/// ReID模型输入尺寸 (宽, 高)
pub const REID_INPUT: (u32, u32) = (128, 256);

/// ImageNet 归一化参数
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// 特征提取器接口: 每张裁剪图对应一个归一化特征向量, 顺序一致
pub trait EmbeddingExtractor: Send {
    fn extract(&mut self, crops: &[RgbImage]) -> Result<Vec<Embedding>>;
}

/// 裁剪图批量缩放 + 归一化为 NCHW 张量
pub fn preprocess(crops: &[RgbImage], size: (u32, u32)) -> Result<Array4<f32>> {
    let (w, h) = size;
    let mut ys = Array4::<f32>::zeros((crops.len(), 3, h as usize, w as usize));
    for (idx, crop) in crops.iter().enumerate() {
        ensure!(crop.width() > 0 && crop.height() > 0, "第 {} 张裁剪图为空", idx);
        let resized = resize_rgb(crop, w, h)?;
        for (x, y, rgb) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for c in 0..3 {
                ys[[idx, c, y, x]] = (rgb.0[c] as f32 / 255.0 - MEAN[c]) / STD[c];
            }
        }
    }
    Ok(ys)
}

/// 按配置加载特征提取模型
pub fn load_extractor(config: &ResolverConfig) -> Result<Box<dyn EmbeddingExtractor>> {
    #[cfg(feature = "onnx")]
    {
        Ok(Box::new(onnx::OnnxExtractor::new(config)?))
    }
    #[cfg(not(feature = "onnx"))]
    {
        anyhow::bail!(
            "特征模型 {} 需要 onnx 特性 (cargo build --features onnx)",
            config.model_path.display()
        )
    }
}

#[cfg(feature = "onnx")]
pub use onnx::OnnxExtractor;

#[cfg(feature = "onnx")]
mod onnx {
    use anyhow::{ensure, Context, Result};
    use image::RgbImage;
    use ndarray::{Axis, Ix2};
    use ort::execution_providers::CUDAExecutionProvider;
    use ort::session::builder::GraphOptimizationLevel;
    use ort::session::Session;
    use ort::value::Tensor;
    use tracing::info;

    use super::{preprocess, EmbeddingExtractor, REID_INPUT};
    use crate::config::ResolverConfig;
    use crate::reid::embedding::Embedding;

    /// OSNet 等 ReID 模型, 输出 `[N, D]`
    pub struct OnnxExtractor {
        session: Session,
        input_name: String,
    }

    impl OnnxExtractor {
        pub fn new(config: &ResolverConfig) -> Result<Self> {
            let mut builder =
                Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
            if config.device.starts_with("cuda") {
                builder = builder
                    .with_execution_providers([CUDAExecutionProvider::default().build()])?;
            }
            let session = builder
                .commit_from_file(&config.model_path)
                .with_context(|| format!("加载特征模型失败: {}", config.model_path.display()))?;
            let input_name = session
                .inputs
                .first()
                .map(|i| i.name.clone())
                .context("模型没有输入")?;
            info!(
                "✅ 特征模型已加载: {} (设备 {})",
                config.model_path.display(),
                config.device
            );
            Ok(Self {
                session,
                input_name,
            })
        }
    }

    impl EmbeddingExtractor for OnnxExtractor {
        fn extract(&mut self, crops: &[RgbImage]) -> Result<Vec<Embedding>> {
            if crops.is_empty() {
                return Ok(Vec::new());
            }
            let tensor = Tensor::from_array(preprocess(crops, REID_INPUT)?)?;
            let outputs = self
                .session
                .run(ort::inputs![self.input_name.as_str() => tensor])
                .context("特征推理失败")?;
            let feats = outputs[0]
                .try_extract_array::<f32>()
                .context("读取特征输出失败")?
                .into_dimensionality::<Ix2>()
                .context("特征输出维度不是 [N, D]")?;
            ensure!(
                feats.nrows() == crops.len(),
                "特征数量 {} 与裁剪图数量 {} 不符",
                feats.nrows(),
                crops.len()
            );

            feats
                .axis_iter(Axis(0))
                .map(|row| Embedding::from_raw(row.to_vec()).map_err(Into::into))
                .collect()
        }
    }
}
