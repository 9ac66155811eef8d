//! 身份解析主循环

use std::collections::btree_map::Entry;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{info, warn};

use super::extractor::EmbeddingExtractor;
use super::resolver::{CycleReport, IdentityResolver};
use crate::messages::{CropBatch, TrackMessage};
use crate::retry::{RetryConfig, RetryPolicy};
use crate::transport::Outbox;

/// 合并积压的多个裁剪批次, 每路摄像头只保留时间戳最新的一份
pub fn merge_batches(batches: Vec<CropBatch>) -> CropBatch {
    let mut merged = CropBatch::default();
    for batch in batches {
        for (camera_id, crops) in batch.crops {
            match merged.crops.entry(camera_id) {
                Entry::Vacant(slot) => {
                    slot.insert(crops);
                }
                Entry::Occupied(mut slot) => {
                    if crops.timestamp >= slot.get().timestamp {
                        slot.insert(crops);
                    }
                }
            }
        }
    }
    merged
}

/// 周期结果 → 轨迹消息
pub fn track_message(batch: &CropBatch, report: &CycleReport) -> TrackMessage {
    let timestamp = batch
        .crops
        .values()
        .map(|c| c.timestamp)
        .reduce(f64::max)
        .unwrap_or(0.0);
    TrackMessage {
        tracks: report
            .tracks
            .iter()
            .map(|(cam, labels)| (cam.clone(), labels.iter().cloned().collect()))
            .collect(),
        co_occurrences: report.co_occurrences.clone(),
        timestamp,
    }
}

pub struct ResolverStage {
    resolver: IdentityResolver,
    extractor: Box<dyn EmbeddingExtractor>,
    input: Receiver<CropBatch>,
}

impl ResolverStage {
    pub fn new(
        resolver: IdentityResolver,
        extractor: Box<dyn EmbeddingExtractor>,
        input: Receiver<CropBatch>,
    ) -> Self {
        Self {
            resolver,
            extractor,
            input,
        }
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    /// 阻塞等待下一个批次并合并已积压的批次; 超时返回 `None`, 通道关闭时报错
    pub fn next_cycle(&mut self, timeout: Option<Duration>) -> Result<Option<CropBatch>> {
        let first = match timeout {
            Some(t) => match self.input.recv_timeout(t) {
                Ok(b) => b,
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => bail!("裁剪图通道已关闭"),
            },
            None => match self.input.recv() {
                Ok(b) => b,
                Err(_) => bail!("裁剪图通道已关闭"),
            },
        };

        let mut batches = vec![first];
        batches.extend(self.input.try_iter());
        Ok(Some(merge_batches(batches)))
    }

    /// 解析一个批次
    pub fn process(&mut self, batch: &CropBatch) -> (TrackMessage, CycleReport) {
        let report = self.resolver.resolve_cycle(batch, self.extractor.as_mut());
        (track_message(batch, &report), report)
    }

    /// 主循环, 直到输入通道关闭
    pub fn run(&mut self, tracks: &dyn Outbox<TrackMessage>, retry: &RetryConfig) -> Result<()> {
        let gallery = self.resolver.gallery();
        info!(
            "🧬 身份解析启动: 已知 {} / 未知 {}",
            gallery.known_count(),
            gallery.unknown_count()
        );
        let mut policy = RetryPolicy::new("resolver", retry);
        let mut last_report = Instant::now();
        let mut cycles = 0u64;

        loop {
            let Some(batch) = self.next_cycle(None)? else {
                continue;
            };
            let (message, report) = self.process(&batch);
            cycles += 1;

            for co in &report.co_occurrences {
                info!(
                    "🔗 {} 同时出现在 {} 和 {} (强度 {:?})",
                    co.label, co.camera_a, co.camera_b, co.strength
                );
            }

            match tracks.send(message) {
                Ok(()) => policy.record_success(),
                Err(e) => {
                    let delay = policy.record_failure();
                    warn!("⚠️ 发布轨迹失败: {}, {:?} 后继续", e, delay);
                    thread::sleep(delay);
                }
            }

            if last_report.elapsed() >= Duration::from_secs(10) {
                let gallery = self.resolver.gallery();
                info!(
                    "📊 解析统计: {} 周期 | 已知 {} / 未知 {}",
                    cycles,
                    gallery.known_count(),
                    gallery.unknown_count()
                );
                cycles = 0;
                last_report = Instant::now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{CameraCrops, Image};
    use crate::reid::embedding::Embedding;
    use crate::reid::gallery::Gallery;
    use crate::reid::resolver::Thresholds;
    use crossbeam_channel::unbounded;
    use image::{Rgb, RgbImage};

    struct ConstExtractor;

    impl EmbeddingExtractor for ConstExtractor {
        fn extract(&mut self, crops: &[RgbImage]) -> Result<Vec<Embedding>> {
            crops
                .iter()
                .map(|_| -> Result<Embedding> { Ok(Embedding::from_raw(vec![1.0, 0.0])?) })
                .collect()
        }
    }

    fn crops(n: usize, ts: f64) -> CameraCrops {
        CameraCrops {
            images: (0..n)
                .map(|_| Image::from_rgb(&RgbImage::from_pixel(4, 4, Rgb([5, 5, 5]))))
                .collect(),
            timestamp: ts,
        }
    }

    fn batch(entries: Vec<(&str, CameraCrops)>) -> CropBatch {
        CropBatch {
            crops: entries.into_iter().map(|(c, v)| (c.to_string(), v)).collect(),
        }
    }

    #[test]
    fn test_merge_keeps_newest_per_camera() {
        let merged = merge_batches(vec![
            batch(vec![("lobby", crops(1, 2.0)), ("hall", crops(1, 1.0))]),
            batch(vec![("lobby", crops(3, 3.0))]),
            batch(vec![("hall", crops(2, 0.5))]),
        ]);
        assert_eq!(merged.crops["lobby"].images.len(), 3);
        assert_eq!(merged.crops["hall"].timestamp, 1.0);
    }

    #[test]
    fn test_stage_cycle_publishes_tracks() {
        let tmp = tempfile::tempdir().unwrap();
        let resolver = IdentityResolver::new(
            Gallery::load(tmp.path(), "jpg").unwrap(),
            Thresholds {
                known: 0.7,
                unknown: 0.5,
                no_update: 0.9,
            },
            None,
        );
        let (tx, rx) = unbounded();
        let mut stage = ResolverStage::new(resolver, Box::new(ConstExtractor), rx);

        tx.send(batch(vec![("lobby", crops(1, 4.0))])).unwrap();
        tx.send(batch(vec![("hall", crops(2, 5.0))])).unwrap();
        drop(tx);

        let (out_tx, out_rx) = unbounded();
        assert!(stage.run(&out_tx, &RetryConfig::default()).is_err());

        let msg = out_rx.try_recv().unwrap();
        assert_eq!(msg.tracks["lobby"], vec!["unknown1".to_string()]);
        assert_eq!(msg.tracks["hall"], vec!["unknown1".to_string()]);
        assert_eq!(msg.timestamp, 5.0);
        assert_eq!(msg.co_occurrences.len(), 1);
        assert!(out_rx.try_recv().is_err());
        assert_eq!(stage.resolver().gallery().unknown_count(), 1);
    }

    #[test]
    fn test_next_cycle_timeout() {
        let (_tx, rx) = unbounded::<CropBatch>();
        let tmp = tempfile::tempdir().unwrap();
        let resolver = IdentityResolver::new(
            Gallery::load(tmp.path(), "jpg").unwrap(),
            Thresholds {
                known: 0.7,
                unknown: 0.5,
                no_update: 0.9,
            },
            None,
        );
        let mut stage = ResolverStage::new(resolver, Box::new(ConstExtractor), rx);
        assert!(stage
            .next_cycle(Some(Duration::from_millis(10)))
            .unwrap()
            .is_none());
    }
}
