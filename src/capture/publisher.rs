//! 单路摄像头的采集/录像/发布主循环
//!
//! 状态机: Connecting → Streaming → (读帧失败 / 流结束) → Reconnecting → Connecting ...

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use image::RgbImage;
use tracing::{debug, info, warn};

use super::{Cadence, Clock, MonotonicStamp, SegmentFactory, SegmentSink, VideoSource};
use crate::config::CameraFeed;
use crate::imaging::resize_rgb;
use crate::messages::{FrameMessage, Image};
use crate::retry::{RetryConfig, RetryPolicy};
use crate::transport::Outbox;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    Connecting,
    Streaming,
    Reconnecting,
}

/// 一次连接会话的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_read: u64,
    pub published: u64,
    pub recorded: u64,
    /// 本次会话完成落盘的分段数
    pub segments: u64,
}

struct ActiveSegment {
    sink: Box<dyn SegmentSink>,
    frames: u64,
}

pub struct FramePublisher {
    feed: CameraFeed,
    source: Box<dyn VideoSource>,
    segments: Box<dyn SegmentFactory>,
    outbox: Box<dyn Outbox<FrameMessage>>,
    clock: Box<dyn Clock>,
    retry: RetryConfig,
    state: PublisherState,
    stamp: MonotonicStamp,
}

impl FramePublisher {
    pub fn new(
        feed: CameraFeed,
        source: Box<dyn VideoSource>,
        segments: Box<dyn SegmentFactory>,
        outbox: Box<dyn Outbox<FrameMessage>>,
        clock: Box<dyn Clock>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            feed,
            source,
            segments,
            outbox,
            clock,
            retry,
            state: PublisherState::Connecting,
            stamp: MonotonicStamp::default(),
        }
    }

    pub fn state(&self) -> PublisherState {
        self.state
    }

    pub fn feed(&self) -> &CameraFeed {
        &self.feed
    }

    /// 打开视频源并持续读帧, 直到读帧失败或流结束
    ///
    /// 返回前总会落盘当前分段并关闭视频源. 流正常结束返回 `Ok`, 读帧失败返回 `Err`.
    pub fn run_session(&mut self) -> Result<SessionStats> {
        self.state = PublisherState::Connecting;
        self.source
            .open()
            .with_context(|| format!("摄像头 {} 打开视频源失败", self.feed.id))?;
        self.state = PublisherState::Streaming;
        info!("✅ 摄像头 {} 已连接", self.feed.id);

        let mut publish_tick = Cadence::from_hz(self.feed.publish_hz);
        let mut record_tick = Cadence::from_hz(self.feed.output_fps);
        let mut segment: Option<ActiveSegment> = None;
        let mut stats = SessionStats::default();

        let outcome = loop {
            let frame = match self.source.read() {
                Ok(Some(frame)) => frame,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };
            stats.frames_read += 1;
            let now = self.clock.monotonic();

            if self.feed.recording_enabled && record_tick.due(now) {
                self.record(&frame, &mut segment, &mut stats);
            }
            if publish_tick.due(now) {
                self.publish(frame, &mut stats);
            }
        };

        if let Some(active) = segment.take() {
            self.finalize(active, &mut stats);
        }
        self.source.close();
        self.state = PublisherState::Reconnecting;

        outcome
            .map(|()| stats)
            .with_context(|| format!("摄像头 {} 读帧失败", self.feed.id))
    }

    /// 永久运行: 会话结束后按退避策略重连
    pub fn run(&mut self) -> ! {
        let mut policy = RetryPolicy::new(format!("camera:{}", self.feed.id), &self.retry);
        let steady = Duration::from_millis(self.retry.initial_ms);

        loop {
            let delay = match self.run_session() {
                Ok(stats) if stats.frames_read > 0 => {
                    policy.record_success();
                    info!(
                        "📹 摄像头 {} 流结束: 读 {} 帧 | 发布 {} | 录像 {} 帧 / {} 段",
                        self.feed.id, stats.frames_read, stats.published, stats.recorded, stats.segments
                    );
                    steady
                }
                Ok(_) => {
                    warn!("⚠️ 摄像头 {} 没有读到任何帧", self.feed.id);
                    policy.record_failure()
                }
                Err(e) => {
                    warn!("⚠️ {:#}", e);
                    policy.record_failure()
                }
            };
            info!("🔄 摄像头 {} {:?} 后重连", self.feed.id, delay);
            thread::sleep(delay);
        }
    }

    fn publish(&mut self, frame: RgbImage, stats: &mut SessionStats) {
        let timestamp = self.stamp.next(self.clock.unix_seconds());
        let message = FrameMessage {
            camera_id: self.feed.id.clone(),
            image: Image::from_rgb(&frame),
            timestamp,
        };
        match self.outbox.send(message) {
            Ok(()) => stats.published += 1,
            Err(e) => warn!("⚠️ 摄像头 {} 发布失败: {}", self.feed.id, e),
        }
    }

    /// 录像: 缩放到输出分辨率后写入当前分段, 满 N 帧滚动
    ///
    /// 任何录像错误只记录日志并丢弃当前分段, 不影响发布.
    fn record(&mut self, frame: &RgbImage, segment: &mut Option<ActiveSegment>, stats: &mut SessionStats) {
        if segment.is_none() {
            match self.segments.create(&self.feed.id, self.clock.local_time()) {
                Ok(sink) => *segment = Some(ActiveSegment { sink, frames: 0 }),
                Err(e) => {
                    warn!("⚠️ 摄像头 {} 创建录像分段失败: {:#}", self.feed.id, e);
                    return;
                }
            }
        }
        let Some(active) = segment.as_mut() else {
            return;
        };

        let (w, h) = self.feed.output_resolution;
        let written = resize_rgb(frame, w, h).and_then(|resized| active.sink.write(&resized));
        if let Err(e) = written {
            warn!("⚠️ 摄像头 {} 录像写入失败, 丢弃当前分段: {:#}", self.feed.id, e);
            *segment = None;
            return;
        }
        active.frames += 1;
        stats.recorded += 1;

        if active.frames >= self.feed.frames_per_segment() {
            if let Some(done) = segment.take() {
                self.finalize(done, stats);
            }
        }
    }

    fn finalize(&self, active: ActiveSegment, stats: &mut SessionStats) {
        let frames = active.frames;
        match active.sink.finish() {
            Ok(path) => {
                stats.segments += 1;
                debug!("💾 摄像头 {} 分段完成: {} ({} 帧)", self.feed.id, path.display(), frames);
            }
            Err(e) => warn!("⚠️ 摄像头 {} 分段落盘失败: {:#}", self.feed.id, e),
        }
    }
}
