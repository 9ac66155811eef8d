//! 身份解析 (Identity Resolver)
//!
//! 每张裁剪图严格按顺序判定:
//! 1. 与全部已知身份比较, 最大相似度 `> known` 则判为该已知身份
//! 2. 否则与全部未知身份比较, 最大相似度 `>= unknown` 则判为该未知身份
//! 3. 否则新建 `unknown<k+1>` 并以本样本为种子
//!
//! 样本只在胜出相似度 `< no_update` 时落盘并加入该身份, 近似重复的画面直接丢弃.
//! 新建身份时胜出相似度取两类中见到的最大值, 同一规则决定种子是否落盘

use std::time::Instant;

use image::RgbImage;
use tracing::{debug, warn};

use super::correlator::{correlate, Observation};
use super::embedding::Embedding;
use super::extractor::EmbeddingExtractor;
use super::gallery::{Category, Gallery, GalleryError, SampleFiles};
use super::LiveTrackSet;
use crate::config::ResolverConfig;
use crate::messages::{CoOccurrence, CropBatch};
use crate::retry::{Health, KeyedBackoff, RetryConfig};

/// 判定阈值
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub known: f32,
    pub unknown: f32,
    pub no_update: f32,
}

impl From<&ResolverConfig> for Thresholds {
    fn from(config: &ResolverConfig) -> Self {
        Self {
            known: config.known_threshold,
            unknown: config.unknown_threshold,
            no_update: config.no_update_threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// 匹配到已有身份
    Matched,
    /// 新建未知身份
    Minted,
}

/// 一张裁剪图的解析结果
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub label: String,
    pub category: Category,
    /// 胜出相似度; 新建身份时为两类中见到的最大相似度 (图库为空时为0)
    pub score: f32,
    pub outcome: Outcome,
    /// 本次落盘的样本 (未更新图库时为 `None`)
    pub stored: Option<SampleFiles>,
}

/// 一个解析周期的结果
#[derive(Debug, Default)]
pub struct CycleReport {
    pub tracks: LiveTrackSet,
    pub resolutions: Vec<(String, Resolution)>,
    pub co_occurrences: Vec<CoOccurrence>,
    /// 无法解码或无法解析而跳过的裁剪图
    pub skipped: usize,
    /// 特征提取仍在退避期内而跳过的摄像头
    pub paused: Vec<String>,
}

pub struct IdentityResolver {
    gallery: Gallery,
    thresholds: Thresholds,
    stream_threshold: Option<f32>,
    extractor_health: KeyedBackoff,
}

impl IdentityResolver {
    pub fn new(gallery: Gallery, thresholds: Thresholds, stream_threshold: Option<f32>) -> Self {
        Self {
            gallery,
            thresholds,
            stream_threshold,
            extractor_health: KeyedBackoff::new("extractor", &RetryConfig::default()),
        }
    }

    /// 特征提取失败后的退避参数 (按摄像头独立计算)
    pub fn with_retry(mut self, retry: &RetryConfig) -> Self {
        self.extractor_health = KeyedBackoff::new("extractor", retry);
        self
    }

    pub fn extractor_health(&self, camera_id: &str) -> Health {
        self.extractor_health.health(camera_id)
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// 解析一张裁剪图; 落盘失败时返回错误, 图库内存状态不变
    pub fn resolve(&mut self, embedding: &Embedding, crop: &RgbImage) -> Result<Resolution, GalleryError> {
        let t = self.thresholds;

        let best_known = self.gallery.best_match(Category::Known, embedding)?;
        if let Some(m) = best_known.as_ref().filter(|m| m.score > t.known) {
            return self.accept(Category::Known, m.label.clone(), m.score, embedding, crop);
        }

        let best_unknown = self.gallery.best_match(Category::Unknown, embedding)?;
        if let Some(m) = best_unknown.as_ref().filter(|m| m.score >= t.unknown) {
            return self.accept(Category::Unknown, m.label.clone(), m.score, embedding, crop);
        }

        let score = [best_known, best_unknown]
            .into_iter()
            .flatten()
            .map(|m| m.score)
            .reduce(f32::max)
            .unwrap_or(0.0);
        // 新身份的种子同样遵守 no_update: 与图库过于相似时只留在内存
        let (label, stored) = if score < t.no_update {
            let (label, files) = self.gallery.create_unknown(embedding, crop)?;
            (label, Some(files))
        } else {
            (self.gallery.seed_unknown(embedding)?, None)
        };
        Ok(Resolution {
            label,
            category: Category::Unknown,
            score,
            outcome: Outcome::Minted,
            stored,
        })
    }

    fn accept(
        &mut self,
        category: Category,
        label: String,
        score: f32,
        embedding: &Embedding,
        crop: &RgbImage,
    ) -> Result<Resolution, GalleryError> {
        let stored = if score < self.thresholds.no_update {
            Some(self.gallery.append_sample(category, &label, embedding, crop)?)
        } else {
            None
        };
        Ok(Resolution {
            label,
            category,
            score,
            outcome: Outcome::Matched,
            stored,
        })
    }

    /// 解析一个周期的全部裁剪图并做跨摄像头关联
    ///
    /// 本周期有数据的摄像头都会出现在结果里 (可能是空集合). 某路特征提取失败
    /// 只跳过该路, 并在退避期内暂停该路的提取.
    pub fn resolve_cycle(
        &mut self,
        batch: &CropBatch,
        extractor: &mut dyn EmbeddingExtractor,
    ) -> CycleReport {
        let mut report = CycleReport::default();
        let mut observations = Vec::new();
        let now = Instant::now();

        for (camera_id, crops) in &batch.crops {
            report.tracks.entry(camera_id.clone()).or_default();
            if self.extractor_health.is_paused(camera_id, now) {
                debug!("[{}] 特征提取退避中, 跳过 {} 张", camera_id, crops.images.len());
                report.paused.push(camera_id.clone());
                continue;
            }

            let mut images = Vec::with_capacity(crops.images.len());
            for img in &crops.images {
                match img.to_rgb() {
                    Ok(rgb) if rgb.width() > 0 && rgb.height() > 0 => images.push(rgb),
                    Ok(_) => report.skipped += 1,
                    Err(e) => {
                        warn!("⚠️ [{}] 跳过无效裁剪图: {}", camera_id, e);
                        report.skipped += 1;
                    }
                }
            }
            if images.is_empty() {
                continue;
            }

            let embeddings = match extractor.extract(&images) {
                Ok(e) if e.len() == images.len() => {
                    self.extractor_health.record_success(camera_id);
                    e
                }
                Ok(e) => {
                    let delay = self.extractor_health.record_failure(camera_id, now);
                    warn!(
                        "⚠️ [{}] 特征数量 {} 与裁剪图数量 {} 不符, {:?} 内跳过该路",
                        camera_id,
                        e.len(),
                        images.len(),
                        delay
                    );
                    report.skipped += images.len();
                    continue;
                }
                Err(e) => {
                    let delay = self.extractor_health.record_failure(camera_id, now);
                    warn!("⚠️ [{}] 特征提取失败, {:?} 内跳过该路: {:#}", camera_id, delay, e);
                    report.skipped += images.len();
                    continue;
                }
            };

            for (crop, embedding) in images.iter().zip(embeddings) {
                match self.resolve(&embedding, crop) {
                    Ok(resolution) => {
                        debug!(
                            "🧬 [{}] {} ({}, {:.3})",
                            camera_id, resolution.label, resolution.category, resolution.score
                        );
                        report
                            .tracks
                            .entry(camera_id.clone())
                            .or_default()
                            .insert(resolution.label.clone());
                        observations.push(Observation {
                            camera_id: camera_id.clone(),
                            label: resolution.label.clone(),
                            embedding,
                        });
                        report.resolutions.push((camera_id.clone(), resolution));
                    }
                    Err(e) => {
                        warn!("⚠️ [{}] 身份解析失败, 跳过该样本: {}", camera_id, e);
                        report.skipped += 1;
                    }
                }
            }
        }

        report.co_occurrences = correlate(&observations, self.stream_threshold);
        report
    }
}
