//! 流水线配置 (Pipeline configuration)
//!
//! 三个阶段共用一份YAML文件, 每个进程只读取自己关心的部分:
//!
//! ```yaml
//! cameras:
//!   - id: lobby
//!     url: rtsp://10.0.0.21/stream1
//!     output_fps: 15
//!     segment_seconds: 60
//!     output_resolution: [1280, 720]
//!     publish_addr: 127.0.0.1:5550
//! detection:
//!   model_path: models/yolov8n.onnx
//!   scale_factor: 2.0
//! resolver:
//!   model_path: models/osnet_x0_25.onnx
//!   dataset_dir: db
//!   known_threshold: 0.7
//!   unknown_threshold: 0.3
//!   no_update_threshold: 0.9
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryConfig;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("至少需要配置一路摄像头")]
    NoCameras,
    #[error("摄像头ID重复: {0}")]
    DuplicateCamera(String),
    #[error("摄像头 {camera}: {field} 必须大于0")]
    NotPositive { camera: String, field: &'static str },
    #[error("摄像头 {camera}: {field} = {value} 超出范围 {min}..={max}")]
    CameraOutOfRange {
        camera: String,
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("{field} = {value} 超出范围 {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: f32,
        min: f32,
        max: f32,
    },
    #[error("未找到摄像头: {0}")]
    UnknownCamera(String),
}

/// 单路摄像头 (CameraFeed), 配置后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraFeed {
    pub id: String,
    /// 视频源地址 (RTSP/文件/图片目录)
    pub url: String,
    /// 录像帧率
    #[serde(default = "default_output_fps")]
    pub output_fps: f64,
    /// 每个录像分段的时长 (秒)
    #[serde(default = "default_segment_seconds")]
    pub segment_seconds: f64,
    /// 录像输出分辨率 (宽, 高)
    #[serde(default = "default_output_resolution")]
    pub output_resolution: (u32, u32),
    #[serde(default = "default_true")]
    pub recording_enabled: bool,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// 快照发布频率 (Hz)
    #[serde(default = "default_publish_hz")]
    pub publish_hz: f64,
    /// 帧通道发布地址
    pub publish_addr: String,
}

impl CameraFeed {
    /// 每个分段包含的录像帧数 N = output_fps × segment_seconds (至少1帧)
    pub fn frames_per_segment(&self) -> u64 {
        ((self.output_fps * self.segment_seconds).round() as u64).max(1)
    }
}

/// 检测阶段配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionConfig {
    pub model_path: PathBuf,
    /// 推理前缩放: 原始分辨率 / scale_factor (大于1为缩小)
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f32,
    #[serde(default = "default_confidence")]
    pub confidence_threshold: f32,
    #[serde(default = "default_iou")]
    pub iou_threshold: f32,
    #[serde(default = "default_max_detections")]
    pub max_detections: usize,
    /// 模型输入边长 (letterbox 正方形)
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    /// 只保留这些类别 (空 = 全部类别), 默认只保留 person
    #[serde(default = "default_target_classes")]
    pub target_classes: Vec<u32>,
    #[serde(default)]
    pub half_precision: bool,
    #[serde(default = "default_device")]
    pub device: String,
    /// 标注帧通道发布地址
    pub annotated_addr: String,
    /// 裁剪图通道发布地址
    pub crops_addr: String,
}

/// 身份解析配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolverConfig {
    pub model_path: PathBuf,
    #[serde(default = "default_device")]
    pub device: String,
    /// 图库根目录
    pub dataset_dir: PathBuf,
    pub known_threshold: f32,
    pub unknown_threshold: f32,
    pub no_update_threshold: f32,
    /// 跨摄像头关联强度阈值 (不配置则只要求标签一致)
    #[serde(default)]
    pub stream_threshold: Option<f32>,
    #[serde(default = "default_image_ext")]
    pub image_ext: String,
    /// 裁剪图通道地址 (检测阶段的 crops_addr)
    pub crops_addr: String,
    /// 轨迹通道发布地址
    pub tracks_addr: String,
}

/// 传输层参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// 每个订阅者的队列深度, 满时丢弃最旧的消息
    pub queue_depth: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self { queue_depth: 4 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub cameras: Vec<CameraFeed>,
    pub detection: DetectionConfig,
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl PipelineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("读取配置失败: {}", path.display()))?;
        let config = Self::from_yaml(&raw)
            .with_context(|| format!("配置无效: {}", path.display()))?;
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: PipelineConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.cameras.is_empty() {
            return Err(ConfigError::NoCameras);
        }

        let mut seen = HashSet::new();
        for cam in &self.cameras {
            if !seen.insert(cam.id.as_str()) {
                return Err(ConfigError::DuplicateCamera(cam.id.clone()));
            }
            let (w, h) = cam.output_resolution;
            let bounded = [
                ("output_fps", cam.output_fps, MIN_RATE_HZ, MAX_RATE_HZ),
                ("segment_seconds", cam.segment_seconds, 1.0, 86_400.0),
                ("publish_hz", cam.publish_hz, MIN_RATE_HZ, MAX_RATE_HZ),
                ("output_resolution", f64::from(w.min(h)), 1.0, MAX_RESOLUTION),
                ("output_resolution", f64::from(w.max(h)), 1.0, MAX_RESOLUTION),
            ];
            for (field, value, min, max) in bounded {
                if !(value > 0.0) {
                    return Err(ConfigError::NotPositive {
                        camera: cam.id.clone(),
                        field,
                    });
                }
                if !value.is_finite() || value < min || value > max {
                    return Err(ConfigError::CameraOutOfRange {
                        camera: cam.id.clone(),
                        field,
                        value,
                        min,
                        max,
                    });
                }
            }
        }

        check_range("detection.scale_factor", self.detection.scale_factor, 0.1, 64.0)?;
        check_range("detection.confidence_threshold", self.detection.confidence_threshold, 0.0, 1.0)?;
        check_range("detection.iou_threshold", self.detection.iou_threshold, 0.0, 1.0)?;
        if self.detection.input_size == 0 {
            return Err(ConfigError::OutOfRange {
                field: "detection.input_size",
                value: 0.0,
                min: 1.0,
                max: f32::MAX,
            });
        }

        let r = &self.resolver;
        check_range("resolver.known_threshold", r.known_threshold, -1.0, 1.0)?;
        check_range("resolver.unknown_threshold", r.unknown_threshold, -1.0, 1.0)?;
        // 大于1等价于 "总是更新"
        check_range("resolver.no_update_threshold", r.no_update_threshold, -1.0, 2.0)?;
        if let Some(t) = r.stream_threshold {
            check_range("resolver.stream_threshold", t, -1.0, 1.0)?;
        }
        Ok(())
    }

    pub fn camera(&self, id: &str) -> std::result::Result<&CameraFeed, ConfigError> {
        self.cameras
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| ConfigError::UnknownCamera(id.to_string()))
    }
}

// 帧率类参数的上下限 (Hz)
const MIN_RATE_HZ: f64 = 0.01;
const MAX_RATE_HZ: f64 = 240.0;
const MAX_RESOLUTION: f64 = 16_384.0;

fn check_range(field: &'static str, value: f32, min: f32, max: f32) -> std::result::Result<(), ConfigError> {
    if value.is_finite() && value >= min && value <= max {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        })
    }
}

// ========== serde 默认值 ==========

fn default_output_fps() -> f64 {
    15.0
}

fn default_segment_seconds() -> f64 {
    60.0
}

fn default_output_resolution() -> (u32, u32) {
    (1280, 720)
}

fn default_true() -> bool {
    true
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("recordings")
}

fn default_publish_hz() -> f64 {
    1.0
}

fn default_scale_factor() -> f32 {
    1.0
}

fn default_confidence() -> f32 {
    0.25
}

fn default_iou() -> f32 {
    0.45
}

fn default_max_detections() -> usize {
    100
}

fn default_input_size() -> u32 {
    640
}

fn default_target_classes() -> Vec<u32> {
    vec![0]
}

fn default_device() -> String {
    "cpu".to_string()
}

fn default_image_ext() -> String {
    "jpg".to_string()
}
