//! 多路检测主循环
//!
//! 一个周期:
//! 1. 在所有摄像头通道上阻塞等待, 直到至少一路有数据 (唯一的挂起点)
//! 2. 取空每个有数据的通道
//! 3. 每路只处理时间戳比上次更新的最新一帧: 缩放 → 检测 → 映射回原图 → 裁剪
//! 4. 发布一个标注帧批次和一个裁剪批次, 只包含本周期有新帧的摄像头

use std::collections::{BTreeMap, HashMap};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use crossbeam_channel::{Receiver, Select, TryRecvError};
use image::RgbImage;
use tracing::{debug, info, warn};

use super::crop::{crop_regions, downscale, rescale};
use super::{Detector, InferenceParams};
use crate::messages::{
    AnnotatedFrame, CameraCrops, CropBatch, DetectionBatch, FrameMessage, Image,
};
use crate::retry::{Health, KeyedBackoff, RetryConfig, RetryPolicy};
use crate::transport::Outbox;

/// 一路摄像头的输入通道
pub struct CameraInput {
    pub camera_id: String,
    pub rx: Receiver<FrameMessage>,
}

impl CameraInput {
    pub fn new(camera_id: impl Into<String>, rx: Receiver<FrameMessage>) -> Self {
        Self {
            camera_id: camera_id.into(),
            rx,
        }
    }
}

/// 一个检测周期的输出
#[derive(Debug, Default)]
pub struct CycleOutput {
    pub detections: DetectionBatch,
    pub crops: CropBatch,
    /// 时间戳不新于上次而被跳过的帧数
    pub stale: usize,
    /// 本周期检测失败的摄像头
    pub failed: Vec<String>,
    /// 仍在退避期内而跳过的摄像头
    pub paused: Vec<String>,
}

impl CycleOutput {
    pub fn is_empty(&self) -> bool {
        self.detections.is_empty() && self.crops.is_empty()
    }
}

pub struct DetectionStage {
    detector: Box<dyn Detector>,
    params: InferenceParams,
    scale_factor: f32,
    inputs: Vec<CameraInput>,
    last_seen: HashMap<String, f64>,
    model_health: KeyedBackoff,

    // 统计
    cycles: u64,
    frames: u64,
    last_report: Instant,
}

impl DetectionStage {
    pub fn new(
        detector: Box<dyn Detector>,
        params: InferenceParams,
        scale_factor: f32,
        inputs: Vec<CameraInput>,
    ) -> Self {
        Self {
            detector,
            params,
            scale_factor,
            inputs,
            last_seen: HashMap::new(),
            model_health: KeyedBackoff::new("detector", &RetryConfig::default()),
            cycles: 0,
            frames: 0,
            last_report: Instant::now(),
        }
    }

    /// 模型失败后的退避参数 (按摄像头独立计算)
    pub fn with_retry(mut self, retry: &RetryConfig) -> Self {
        self.model_health = KeyedBackoff::new("detector", retry);
        self
    }

    /// 某路摄像头的检测健康状态
    pub fn camera_health(&self, camera_id: &str) -> Health {
        self.model_health.health(camera_id)
    }

    /// 最近处理过的帧时间戳
    pub fn last_seen(&self, camera_id: &str) -> Option<f64> {
        self.last_seen.get(camera_id).copied()
    }

    /// 等待任意一路有数据后取空所有就绪通道
    ///
    /// `timeout` 为 `None` 时无限等待; 超时返回空列表. 所有通道都关闭时报错.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<FrameMessage>> {
        if self.inputs.is_empty() {
            bail!("所有输入通道已关闭");
        }

        {
            let mut sel = Select::new();
            for input in &self.inputs {
                sel.recv(&input.rx);
            }
            let ready = match timeout {
                Some(t) => sel.ready_timeout(t).ok(),
                None => Some(sel.ready()),
            };
            if ready.is_none() {
                return Ok(Vec::new());
            }
        }

        let mut frames = Vec::new();
        let mut closed = Vec::new();
        for (idx, input) in self.inputs.iter().enumerate() {
            loop {
                match input.rx.try_recv() {
                    Ok(frame) => frames.push(frame),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        closed.push(idx);
                        break;
                    }
                }
            }
        }
        for idx in closed.into_iter().rev() {
            let input = self.inputs.remove(idx);
            warn!("⚠️ [{}] 输入通道已关闭", input.camera_id);
        }
        Ok(frames)
    }

    /// 处理一批帧: 每路摄像头最多一帧
    pub fn process(&mut self, frames: Vec<FrameMessage>) -> CycleOutput {
        let mut out = CycleOutput::default();

        // 同一周期内同一路有多帧时只取最新的
        let mut newest: BTreeMap<String, FrameMessage> = BTreeMap::new();
        for frame in frames {
            match newest.get(&frame.camera_id) {
                Some(kept) if kept.timestamp >= frame.timestamp => out.stale += 1,
                Some(_) => {
                    out.stale += 1;
                    newest.insert(frame.camera_id.clone(), frame);
                }
                None => {
                    newest.insert(frame.camera_id.clone(), frame);
                }
            }
        }

        let now = Instant::now();
        for (camera_id, frame) in newest {
            if self.model_health.is_paused(&camera_id, now) {
                debug!("[{}] 检测退避中, 跳过 {:.3}", camera_id, frame.timestamp);
                out.paused.push(camera_id);
                continue;
            }
            if let Some(&seen) = self.last_seen.get(&camera_id) {
                if frame.timestamp <= seen {
                    debug!("[{}] 跳过旧帧 {:.3} <= {:.3}", camera_id, frame.timestamp, seen);
                    out.stale += 1;
                    continue;
                }
            }
            self.last_seen.insert(camera_id.clone(), frame.timestamp);
            self.frames += 1;

            match self.detect_one(&frame) {
                Ok((annotated, crops)) => {
                    self.model_health.record_success(&camera_id);
                    debug!("🔍 [{}] 检测到 {} 个目标", camera_id, crops.len());
                    out.detections.frames.insert(
                        camera_id.clone(),
                        AnnotatedFrame {
                            image: Image::from_rgb(&annotated),
                            timestamp: frame.timestamp,
                        },
                    );
                    out.crops.crops.insert(
                        camera_id,
                        CameraCrops {
                            images: crops.iter().map(Image::from_rgb).collect(),
                            timestamp: frame.timestamp,
                        },
                    );
                }
                Err(e) => {
                    let delay = self.model_health.record_failure(&camera_id, now);
                    warn!("⚠️ [{}] 检测失败, {:?} 内跳过该路: {:#}", camera_id, delay, e);
                    out.failed.push(camera_id);
                }
            }
        }

        self.cycles += 1;
        out
    }

    fn detect_one(&mut self, frame: &FrameMessage) -> Result<(RgbImage, Vec<RgbImage>)> {
        let original = frame.image.to_rgb()?;
        let small = downscale(&original, self.scale_factor)?;
        let mut boxes = self.detector.detect(&small, &self.params)?;

        let sx = original.width() as f32 / small.width() as f32;
        let sy = original.height() as f32 / small.height() as f32;
        rescale(&mut boxes, sx, sy);

        let annotated = self.detector.annotate(&original, &boxes);
        let crops = crop_regions(&original, &boxes);
        Ok((annotated, crops))
    }

    /// 一个完整周期; 超时且无数据时返回 `None`
    pub fn run_cycle(&mut self, timeout: Option<Duration>) -> Result<Option<CycleOutput>> {
        let frames = self.poll(timeout)?;
        if frames.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.process(frames)))
    }

    /// 主循环, 直到所有输入通道关闭
    pub fn run(
        &mut self,
        annotated: &dyn Outbox<DetectionBatch>,
        crops: &dyn Outbox<CropBatch>,
        retry: &RetryConfig,
    ) -> Result<()> {
        info!("🔍 检测阶段启动: {} 路输入", self.inputs.len());
        let mut policy = RetryPolicy::new("detection", retry);

        loop {
            let Some(out) = self.run_cycle(None)? else {
                continue;
            };
            if out.is_empty() {
                continue;
            }

            let sent = annotated
                .send(out.detections)
                .and_then(|_| crops.send(out.crops));
            match sent {
                Ok(()) => policy.record_success(),
                Err(e) => {
                    let delay = policy.record_failure();
                    warn!("⚠️ 发布检测结果失败: {}, {:?} 后继续", e, delay);
                    thread::sleep(delay);
                }
            }

            if self.last_report.elapsed() >= Duration::from_secs(10) {
                let secs = self.last_report.elapsed().as_secs_f64();
                info!(
                    "📊 检测统计: {} 周期 | {} 帧 | {:.1} 帧/秒 | 模型 {:?}",
                    self.cycles,
                    self.frames,
                    self.frames as f64 / secs,
                    self.model_health.worst()
                );
                self.cycles = 0;
                self.frames = 0;
                self.last_report = Instant::now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BBox;
    use crossbeam_channel::{bounded, unbounded, Sender};
    use image::Rgb;

    /// 在推理图上固定返回一个框; 摄像头 "broken" 的帧 (宽度13) 报错
    struct FakeDetector;

    impl Detector for FakeDetector {
        fn detect(&mut self, image: &RgbImage, _params: &InferenceParams) -> Result<Vec<BBox>> {
            if image.width() == 13 {
                bail!("模型推理失败");
            }
            Ok(vec![
                BBox {
                    x1: 5.0,
                    y1: 5.0,
                    x2: 15.0,
                    y2: 25.0,
                    confidence: 0.9,
                    class_id: 0,
                },
                // 退化框
                BBox {
                    x1: 30.0,
                    y1: 5.0,
                    x2: 30.0,
                    y2: 25.0,
                    confidence: 0.9,
                    class_id: 0,
                },
            ])
        }
    }

    fn params() -> InferenceParams {
        InferenceParams {
            confidence_threshold: 0.25,
            iou_threshold: 0.45,
            max_detections: 100,
            target_classes: vec![0],
            half_precision: false,
            device: "cpu".into(),
        }
    }

    fn frame(camera: &str, width: u32, height: u32, ts: f64) -> FrameMessage {
        FrameMessage {
            camera_id: camera.into(),
            image: Image::from_rgb(&RgbImage::from_pixel(width, height, Rgb([9, 9, 9]))),
            timestamp: ts,
        }
    }

    fn stage_with(scale: f32, cameras: &[&str]) -> (DetectionStage, Vec<Sender<FrameMessage>>) {
        let mut inputs = Vec::new();
        let mut senders = Vec::new();
        for cam in cameras {
            let (tx, rx) = unbounded();
            inputs.push(CameraInput::new(*cam, rx));
            senders.push(tx);
        }
        (DetectionStage::new(Box::new(FakeDetector), params(), scale, inputs), senders)
    }

    #[test]
    fn test_boxes_rescaled_to_original_resolution() {
        let (mut stage, senders) = stage_with(2.0, &["lobby"]);
        senders[0].send(frame("lobby", 80, 60, 1.0)).unwrap();

        let out = stage.run_cycle(Some(Duration::from_secs(1))).unwrap().unwrap();
        let crops = &out.crops.crops["lobby"];
        // 推理图上 10x20 的框在原图上是 20x40, 退化框被丢弃
        assert_eq!(crops.images.len(), 1);
        assert_eq!((crops.images[0].width, crops.images[0].height), (20, 40));
        assert_eq!(crops.timestamp, 1.0);
        assert_eq!(out.detections.frames["lobby"].image.width, 80);
    }

    #[test]
    fn test_only_cameras_with_fresh_data_are_included() {
        let (mut stage, senders) = stage_with(1.0, &["lobby", "hall"]);
        senders[1].send(frame("hall", 40, 40, 5.0)).unwrap();

        let out = stage.run_cycle(Some(Duration::from_secs(1))).unwrap().unwrap();
        assert_eq!(out.crops.crops.keys().collect::<Vec<_>>(), vec!["hall"]);
        assert_eq!(out.detections.frames.keys().collect::<Vec<_>>(), vec!["hall"]);
    }

    #[test]
    fn test_stale_and_duplicate_frames_processed_once() {
        let (mut stage, senders) = stage_with(1.0, &["lobby"]);
        senders[0].send(frame("lobby", 40, 40, 2.0)).unwrap();
        senders[0].send(frame("lobby", 40, 40, 3.0)).unwrap();
        let out = stage.run_cycle(Some(Duration::from_secs(1))).unwrap().unwrap();
        assert_eq!(out.stale, 1);
        assert_eq!(out.crops.crops["lobby"].timestamp, 3.0);
        assert_eq!(stage.last_seen("lobby"), Some(3.0));

        // 重发同一时间戳: 不再处理
        senders[0].send(frame("lobby", 40, 40, 3.0)).unwrap();
        let out = stage.run_cycle(Some(Duration::from_secs(1))).unwrap().unwrap();
        assert!(out.is_empty());
        assert_eq!(out.stale, 1);
    }

    #[test]
    fn test_detector_failure_skips_only_that_camera() {
        let (mut stage, senders) = stage_with(1.0, &["broken", "hall"]);
        senders[0].send(frame("broken", 13, 40, 1.0)).unwrap();
        senders[1].send(frame("hall", 40, 40, 1.0)).unwrap();

        let out = stage.run_cycle(Some(Duration::from_secs(1))).unwrap().unwrap();
        assert_eq!(out.failed, vec!["broken".to_string()]);
        assert!(out.crops.crops.contains_key("hall"));
        assert!(!out.crops.crops.contains_key("broken"));
    }

    fn fast_retry(initial_ms: u64) -> RetryConfig {
        RetryConfig {
            initial_ms,
            max_ms: initial_ms,
            multiplier: 2.0,
            failing_after: 3,
        }
    }

    #[test]
    fn test_failed_camera_backs_off_without_stalling_others() {
        let (stage, senders) = stage_with(1.0, &["broken", "hall"]);
        let mut stage = stage.with_retry(&fast_retry(60_000));

        senders[0].send(frame("broken", 13, 40, 1.0)).unwrap();
        let out = stage.run_cycle(Some(Duration::from_secs(1))).unwrap().unwrap();
        assert_eq!(out.failed, vec!["broken".to_string()]);
        assert_eq!(stage.camera_health("broken"), Health::Degraded);

        // 退避期内即使帧正常也不处理, 另一路不受影响
        senders[0].send(frame("broken", 40, 40, 2.0)).unwrap();
        senders[1].send(frame("hall", 40, 40, 2.0)).unwrap();
        let out = stage.run_cycle(Some(Duration::from_secs(1))).unwrap().unwrap();
        assert_eq!(out.paused, vec!["broken".to_string()]);
        assert!(out.crops.crops.contains_key("hall"));
        assert!(!out.crops.crops.contains_key("broken"));
        assert_eq!(stage.last_seen("broken"), Some(1.0));
        assert_eq!(stage.camera_health("hall"), Health::Healthy);
    }

    #[test]
    fn test_persistent_detector_failure_reaches_failing() {
        let (stage, senders) = stage_with(1.0, &["broken"]);
        let mut stage = stage.with_retry(&fast_retry(1));

        for ts in 1..=3 {
            thread::sleep(Duration::from_millis(5));
            senders[0].send(frame("broken", 13, 40, ts as f64)).unwrap();
            let out = stage.run_cycle(Some(Duration::from_secs(1))).unwrap().unwrap();
            assert_eq!(out.failed, vec!["broken".to_string()]);
        }
        assert_eq!(stage.camera_health("broken"), Health::Failing);

        // 模型恢复后健康状态复位
        thread::sleep(Duration::from_millis(5));
        senders[0].send(frame("broken", 40, 40, 4.0)).unwrap();
        let out = stage.run_cycle(Some(Duration::from_secs(1))).unwrap().unwrap();
        assert!(out.failed.is_empty());
        assert_eq!(stage.camera_health("broken"), Health::Healthy);
    }

    #[test]
    fn test_poll_times_out_without_data() {
        let (mut stage, _senders) = stage_with(1.0, &["lobby"]);
        let frames = stage.poll(Some(Duration::from_millis(20))).unwrap();
        assert!(frames.is_empty());
    }

    #[test]
    fn test_closed_inputs_end_the_stage() {
        let (tx, rx) = bounded(1);
        let inputs = vec![CameraInput::new("lobby", rx)];
        let mut stage = DetectionStage::new(Box::new(FakeDetector), params(), 1.0, inputs);
        drop(tx);

        assert!(stage.poll(None).unwrap().is_empty());
        assert!(stage.poll(None).is_err());
    }

    #[test]
    fn test_run_publishes_batches() {
        let (mut stage, senders) = stage_with(1.0, &["lobby"]);
        let (det_tx, det_rx) = unbounded::<DetectionBatch>();
        let (crop_tx, crop_rx) = unbounded::<CropBatch>();

        senders[0].send(frame("lobby", 40, 40, 1.0)).unwrap();
        drop(senders);

        // 输入关闭后 run 返回错误
        assert!(stage.run(&det_tx, &crop_tx, &RetryConfig::default()).is_err());
        assert_eq!(det_rx.try_iter().count(), 1);
        let batch = crop_rx.try_recv().unwrap();
        assert_eq!(batch.crops["lobby"].images.len(), 1);
    }
}
