/// 采集发布系统 (Frame Publisher)
///
/// 一路视频源 → 两个节奏独立的输出:
/// - 录像分段 (output_fps, 缩放到输出分辨率)
/// - 快照发布 (publish_hz, 原始分辨率 + 单调递增时间戳)
pub mod publisher;
pub mod segment;
pub mod source;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Local};
use image::RgbImage;

pub use publisher::{FramePublisher, PublisherState, SessionStats};
pub use segment::{segment_path, MjpegSegment, MjpegSegmentFactory};
pub use source::{open_source, ImageDirSource};

#[cfg(feature = "ffmpeg")]
pub use source::FfmpegSource;

// ========== 外部协作者接口 ==========

/// 视频源: 打开 → 逐帧读取 → 关闭
///
/// `read` 返回 `Ok(None)` 表示流正常结束 (文件/目录回放完毕).
pub trait VideoSource: Send {
    fn open(&mut self) -> Result<()>;
    fn read(&mut self) -> Result<Option<RgbImage>>;
    fn close(&mut self);
}

/// 一个正在写入的录像分段
pub trait SegmentSink {
    fn write(&mut self, frame: &RgbImage) -> Result<()>;
    /// 落盘并返回分段文件路径
    fn finish(self: Box<Self>) -> Result<PathBuf>;
}

pub trait SegmentFactory {
    fn create(&mut self, camera_id: &str, started: DateTime<Local>) -> Result<Box<dyn SegmentSink>>;
}

/// 时钟 (测试中可替换为手动时钟)
pub trait Clock {
    /// 单调时间, 只用于节奏控制
    fn monotonic(&self) -> Duration;
    /// 墙上时间 (UNIX秒), 用作采集时间戳
    fn unix_seconds(&self) -> f64;
    fn local_time(&self) -> DateTime<Local> {
        Local::now()
    }
}

pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }

    fn unix_seconds(&self) -> f64 {
        crate::unix_seconds()
    }
}

// ========== 节奏与时间戳 ==========

const MAX_PERIOD: Duration = Duration::from_secs(86_400);

/// 固定频率节拍器
///
/// 第一次调用立即触发; 之后每个周期最多触发一次. 落后超过一个周期时
/// 从当前时刻重新对齐, 不补发.
#[derive(Debug, Clone)]
pub struct Cadence {
    period: Duration,
    next_due: Option<Duration>,
}

impl Cadence {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next_due: None,
        }
    }

    /// 频率非法 (0, 负数, 非有限值或极小) 时周期按一天计
    pub fn from_hz(hz: f64) -> Self {
        let period = Duration::try_from_secs_f64(1.0 / hz)
            .unwrap_or(MAX_PERIOD)
            .min(MAX_PERIOD);
        Self::new(period)
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn due(&mut self, now: Duration) -> bool {
        match self.next_due {
            None => {
                self.next_due = Some(now + self.period);
                true
            }
            Some(next) if now >= next => {
                let mut next = next + self.period;
                if next <= now {
                    next = now + self.period;
                }
                self.next_due = Some(next);
                true
            }
            Some(_) => false,
        }
    }
}

/// 保证发布时间戳严格递增 (墙上时钟回拨时也一样)
#[derive(Debug, Clone, Default)]
pub struct MonotonicStamp {
    last: Option<f64>,
}

impl MonotonicStamp {
    /// 最小递增步长 (1微秒)
    pub const EPSILON: f64 = 1e-6;

    pub fn next(&mut self, candidate: f64) -> f64 {
        let stamp = match self.last {
            Some(last) if candidate <= last => last + Self::EPSILON,
            _ => candidate,
        };
        self.last = Some(stamp);
        stamp
    }
}
