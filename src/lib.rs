// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
#![allow(clippy::type_complexity)]
pub mod capture; // 采集发布 (Frame Publisher)
pub mod config; // 流水线配置
pub mod detection; // 多路检测 (Detection Stage)
pub mod imaging; // 图像缩放
pub mod logging; // 日志初始化
pub mod messages; // 通道消息定义
pub mod reid; // 身份解析 + 图库 + 跨摄像头关联
pub mod retry; // 退避重试与健康状态
pub mod transport; // 发布/订阅传输

pub use crate::config::{CameraFeed, DetectionConfig, PipelineConfig, ResolverConfig};
pub use crate::messages::{
    CoOccurrence, CropBatch, DetectionBatch, Envelope, FrameMessage, Image, TrackMessage,
    WireMessage,
};
pub use crate::reid::{Category, Embedding, Gallery, IdentityResolver, LiveTrackSet};

/// 当前本地时间字符串, 精确到微秒
///
/// 用作样本文件名 (同一周期内多次落盘不会重名)
pub fn gen_time_string(delimiter: &str) -> String {
    let fmt = format!(
        "%Y{}%m{}%d{}%H{}%M{}%S{}%6f",
        delimiter, delimiter, delimiter, delimiter, delimiter, delimiter
    );
    chrono::Local::now().format(&fmt).to_string()
}

/// 当前UNIX时间 (秒, 浮点)
pub fn unix_seconds() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_string_has_microseconds() {
        let s = gen_time_string("_");
        let parts: Vec<&str> = s.split('_').collect();
        assert_eq!(parts.len(), 7);
        assert_eq!(parts[6].len(), 6);
    }

    #[test]
    fn test_unix_seconds_is_recent() {
        // 2020-01-01 之后
        assert!(unix_seconds() > 1_577_836_800.0);
    }
}
