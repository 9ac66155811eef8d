//! 通道消息定义 (Wire message schemas)
//!
//! 每个通道一种消息类型, 发送时统一装进带版本号的 [`Envelope`], 以CBOR编码:
//!
//! ```text
//! 采集发布 ──FrameMessage──▶ 多路检测 ──DetectionBatch──▶ 显示层
//!                                    └──CropBatch──────▶ 身份解析 ──TrackMessage──▶ 显示层
//! ```

use std::collections::BTreeMap;

use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 消息格式版本, 不兼容的改动必须递增
pub const SCHEMA_VERSION: u16 = 1;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("消息编码失败: {0}")]
    Encode(String),
    #[error("消息解码失败: {0}")]
    Decode(String),
    #[error("不支持的消息版本 {found} (当前 {expected})")]
    UnsupportedVersion { found: u16, expected: u16 },
    #[error("图像数据不完整: {width}x{height}x{channels} 需要 {expected} 字节, 实际 {actual}")]
    MalformedImage {
        width: u32,
        height: u32,
        channels: u8,
        expected: usize,
        actual: usize,
    },
}

// ========== 图像 ==========

/// 行优先的RGB8像素数组
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    #[serde(with = "pixel_bytes")]
    pub data: Vec<u8>,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("channels", &self.channels)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl Image {
    pub fn from_rgb(image: &RgbImage) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
            channels: 3,
            data: image.as_raw().clone(),
        }
    }

    /// 校验尺寸后转换为 `RgbImage`
    pub fn to_rgb(&self) -> Result<RgbImage, MessageError> {
        let expected = self.width as usize * self.height as usize * 3;
        let malformed = || MessageError::MalformedImage {
            width: self.width,
            height: self.height,
            channels: self.channels,
            expected,
            actual: self.data.len(),
        };
        if self.channels != 3 || self.data.len() != expected {
            return Err(malformed());
        }
        RgbImage::from_raw(self.width, self.height, self.data.clone()).ok_or_else(malformed)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

// ========== 各通道消息 ==========

/// 采集发布 → 多路检测: 一个发布节拍的快照 (原始分辨率)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMessage {
    pub camera_id: String,
    pub image: Image,
    /// 采集时间 (UNIX秒), 同一路摄像头内单调递增
    pub timestamp: f64,
}

/// 单路标注帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotatedFrame {
    pub image: Image,
    pub timestamp: f64,
}

/// 多路检测 → 显示层: 本周期有新帧的摄像头的标注图
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionBatch {
    pub frames: BTreeMap<String, AnnotatedFrame>,
}

/// 单路裁剪结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraCrops {
    pub images: Vec<Image>,
    pub timestamp: f64,
}

/// 多路检测 → 身份解析: 本周期有新帧的摄像头的检测框裁剪图
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CropBatch {
    pub crops: BTreeMap<String, CameraCrops>,
}

impl DetectionBatch {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl CropBatch {
    pub fn is_empty(&self) -> bool {
        self.crops.is_empty()
    }
}

/// 同一身份在同一周期内出现在两路摄像头
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoOccurrence {
    pub camera_a: String,
    pub camera_b: String,
    pub label: String,
    /// 两路中该身份特征的最大余弦相似度
    pub strength: Option<f32>,
}

/// 身份解析 → 显示层: 每路摄像头本周期的身份标签
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackMessage {
    pub tracks: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub co_occurrences: Vec<CoOccurrence>,
    pub timestamp: f64,
}

// ========== 信封 ==========

/// 带类型标签的消息体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Frame(FrameMessage),
    Detections(DetectionBatch),
    Crops(CropBatch),
    Tracks(TrackMessage),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Frame(_) => FrameMessage::KIND,
            Payload::Detections(_) => DetectionBatch::KIND,
            Payload::Crops(_) => CropBatch::KIND,
            Payload::Tracks(_) => TrackMessage::KIND,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u16,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(payload: Payload) -> Self {
        Self {
            version: SCHEMA_VERSION,
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| MessageError::Encode(e.to_string()))?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let envelope: Envelope =
            ciborium::from_reader(bytes).map_err(|e| MessageError::Decode(e.to_string()))?;
        if envelope.version != SCHEMA_VERSION {
            return Err(MessageError::UnsupportedVersion {
                found: envelope.version,
                expected: SCHEMA_VERSION,
            });
        }
        Ok(envelope)
    }
}

/// 可在某个通道上传输的消息类型
pub trait WireMessage: Sized + Send + 'static {
    const KIND: &'static str;

    fn into_payload(self) -> Payload;

    /// 类型不符时返回 `None`
    fn from_payload(payload: Payload) -> Option<Self>;
}

macro_rules! wire_message {
    ($ty:ty, $variant:ident, $kind:literal) => {
        impl WireMessage for $ty {
            const KIND: &'static str = $kind;

            fn into_payload(self) -> Payload {
                Payload::$variant(self)
            }

            fn from_payload(payload: Payload) -> Option<Self> {
                match payload {
                    Payload::$variant(m) => Some(m),
                    _ => None,
                }
            }
        }
    };
}

wire_message!(FrameMessage, Frame, "frame");
wire_message!(DetectionBatch, Detections, "detections");
wire_message!(CropBatch, Crops, "crops");
wire_message!(TrackMessage, Tracks, "tracks");

/// 像素数据按CBOR字节串编码 (而不是逐字节的整数数组)
mod pixel_bytes {
    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        deserializer.deserialize_byte_buf(PixelVisitor)
    }

    struct PixelVisitor;

    impl<'de> Visitor<'de> for PixelVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("pixel bytes")
        }

        fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Vec<u8>, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Vec<u8>, E> {
            Ok(v)
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Vec<u8>, A::Error> {
            let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(b) = seq.next_element::<u8>()? {
                out.push(b);
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn sample_image() -> RgbImage {
        RgbImage::from_fn(4, 3, |x, y| Rgb([x as u8 * 10, y as u8 * 20, 7]))
    }

    #[test]
    fn test_image_to_rgb_preserves_pixels() {
        let img = sample_image();
        let wire = Image::from_rgb(&img);
        assert_eq!(wire.data.len(), 4 * 3 * 3);
        assert_eq!(wire.to_rgb().unwrap(), img);
    }

    #[test]
    fn test_truncated_image_rejected() {
        let mut wire = Image::from_rgb(&sample_image());
        wire.data.pop();
        assert!(matches!(
            wire.to_rgb(),
            Err(MessageError::MalformedImage { expected: 36, actual: 35, .. })
        ));
    }

    #[test]
    fn test_envelope_carries_crop_batch() {
        let mut batch = CropBatch::default();
        batch.crops.insert(
            "lobby".into(),
            CameraCrops {
                images: vec![Image::from_rgb(&sample_image())],
                timestamp: 1700000000.25,
            },
        );

        let bytes = Envelope::new(batch.clone().into_payload()).encode().unwrap();
        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded.payload.kind(), "crops");
        assert_eq!(CropBatch::from_payload(decoded.payload), Some(batch));
    }

    #[test]
    fn test_wrong_channel_payload_is_ignored() {
        let tracks = TrackMessage::default();
        assert!(FrameMessage::from_payload(tracks.into_payload()).is_none());
    }

    #[test]
    fn test_future_version_rejected() {
        let mut envelope = Envelope::new(TrackMessage::default().into_payload());
        envelope.version = SCHEMA_VERSION + 1;
        let bytes = envelope.encode().unwrap();
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(MessageError::UnsupportedVersion { .. })
        ));
    }
}
