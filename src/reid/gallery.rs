//! 身份图库 (Gallery)
//!
//! 磁盘布局:
//!
//! ```text
//! <base>/known/<label>/<stamp>.jpg
//! <base>/known/<label>/<stamp>.json     # 特征向量 (JSON数组)
//! <base>/unknown/<label>/...
//! ```
//!
//! 启动时整体载入, 之后只由身份解析追加, 从不删除或合并; 标签不会跨类别移动

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::embedding::{Embedding, EmbeddingError, EmbeddingMatrix};

#[derive(Debug, Error)]
pub enum GalleryError {
    #[error("图库IO错误 {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("保存样本图像失败 {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("特征文件格式错误 {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error("标签 {label} 已属于 {category} 类别")]
    LabelTaken { label: String, category: Category },
    #[error("图库中没有标签 {0}")]
    NoSuchLabel(String),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> GalleryError + '_ {
    move |source| GalleryError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// 身份类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// 人工录入
    Known,
    /// 自动生成
    Unknown,
}

impl Category {
    pub fn dir_name(self) -> &'static str {
        match self {
            Category::Known => "known",
            Category::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// 一个身份簇: 标签 + 只增不减的特征集合
#[derive(Debug, Clone)]
pub struct IdentityCluster {
    pub label: String,
    pub category: Category,
    pub embeddings: EmbeddingMatrix,
    pub dir: PathBuf,
}

/// 最佳匹配
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub label: String,
    pub score: f32,
}

/// 一次落盘的样本
#[derive(Debug, Clone, PartialEq)]
pub struct SampleFiles {
    pub image: PathBuf,
    pub embedding: PathBuf,
}

pub struct Gallery {
    base: PathBuf,
    image_ext: String,
    known: BTreeMap<String, IdentityCluster>,
    unknown: BTreeMap<String, IdentityCluster>,
    /// 磁盘上出现过的目录名 (包括没有有效特征的), 新标签不得与之重名
    reserved: BTreeSet<String>,
    dim: Option<usize>,
}

impl Gallery {
    /// 空图库 (不扫描磁盘)
    pub fn new(base: impl Into<PathBuf>, image_ext: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            image_ext: image_ext.into(),
            known: BTreeMap::new(),
            unknown: BTreeMap::new(),
            reserved: BTreeSet::new(),
            dim: None,
        }
    }

    /// 扫描 `<base>/known` 与 `<base>/unknown` 载入全部身份
    pub fn load(base: impl Into<PathBuf>, image_ext: impl Into<String>) -> Result<Self, GalleryError> {
        let mut gallery = Self::new(base, image_ext);
        for category in [Category::Known, Category::Unknown] {
            let root = gallery.category_dir(category);
            fs::create_dir_all(&root).map_err(io_err(&root))?;
            gallery.load_category(category, &root)?;
        }
        info!(
            "🧬 图库已载入 {}: 已知 {} 个, 未知 {} 个",
            gallery.base.display(),
            gallery.known.len(),
            gallery.unknown.len()
        );
        Ok(gallery)
    }

    fn load_category(&mut self, category: Category, root: &Path) -> Result<(), GalleryError> {
        let mut dirs: Vec<PathBuf> = fs::read_dir(root)
            .map_err(io_err(root))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();

        for dir in dirs {
            let Some(label) = dir.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                warn!("⚠️ 跳过非UTF-8目录: {}", dir.display());
                continue;
            };
            self.reserved.insert(label.clone());

            if category == Category::Unknown && self.known.contains_key(&label) {
                warn!("⚠️ 标签 {} 同时存在于 known 和 unknown, 以 known 为准", label);
                continue;
            }

            let embeddings = self.load_embeddings(&dir)?;
            if embeddings.is_empty() {
                debug!("[{}] {} 没有可用特征, 跳过", category, label);
                continue;
            }
            let matrix = EmbeddingMatrix::from_embeddings(&embeddings)?;
            self.dim.get_or_insert(matrix.dim());
            self.clusters_mut(category).insert(
                label.clone(),
                IdentityCluster {
                    label,
                    category,
                    embeddings: matrix,
                    dir,
                },
            );
        }
        Ok(())
    }

    fn load_embeddings(&self, dir: &Path) -> Result<Vec<Embedding>, GalleryError> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(io_err(dir))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();

        let mut out: Vec<Embedding> = Vec::with_capacity(files.len());
        for file in files {
            let raw = fs::read(&file).map_err(io_err(&file))?;
            let embedding: Embedding = match serde_json::from_slice(&raw) {
                Ok(e) => e,
                Err(e) => {
                    warn!("⚠️ 忽略损坏的特征文件 {}: {}", file.display(), e);
                    continue;
                }
            };
            let expected = self.dim.or_else(|| out.first().map(Embedding::dim));
            if let Some(expected) = expected {
                if embedding.dim() != expected {
                    warn!(
                        "⚠️ 忽略维度不符的特征文件 {}: {} != {}",
                        file.display(),
                        embedding.dim(),
                        expected
                    );
                    continue;
                }
            }
            out.push(embedding);
        }
        Ok(out)
    }

    // ========== 查询 ==========

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    pub fn dim(&self) -> Option<usize> {
        self.dim
    }

    pub fn known_count(&self) -> usize {
        self.known.len()
    }

    pub fn unknown_count(&self) -> usize {
        self.unknown.len()
    }

    pub fn cluster(&self, label: &str) -> Option<&IdentityCluster> {
        self.known.get(label).or_else(|| self.unknown.get(label))
    }

    pub fn labels(&self, category: Category) -> impl Iterator<Item = &str> {
        self.clusters(category).keys().map(String::as_str)
    }

    /// 标签是否已被占用 (任一类别, 或磁盘上已有同名目录)
    pub fn contains(&self, label: &str) -> bool {
        self.known.contains_key(label) || self.unknown.contains_key(label) || self.reserved.contains(label)
    }

    /// 某一类别中与 `query` 最相似的身份; 相似度相同时取标签字典序靠前者
    pub fn best_match(&self, category: Category, query: &Embedding) -> Result<Option<Match>, GalleryError> {
        let mut best: Option<Match> = None;
        for (label, cluster) in self.clusters(category) {
            let Some(score) = cluster.embeddings.max_similarity(query)? else {
                continue;
            };
            if best.as_ref().map_or(true, |b| score > b.score) {
                best = Some(Match {
                    label: label.clone(),
                    score,
                });
            }
        }
        Ok(best)
    }

    /// 下一个自动标签: `unknown<未知簇数量+1>`, 已占用则继续递增
    pub fn next_unknown_label(&self) -> String {
        let mut k = self.unknown.len() + 1;
        loop {
            let label = format!("unknown{}", k);
            if !self.contains(&label) {
                return label;
            }
            k += 1;
        }
    }

    // ========== 修改 ==========

    /// 以一个样本新建未知身份并落盘, 返回新标签
    pub fn create_unknown(
        &mut self,
        embedding: &Embedding,
        crop: &RgbImage,
    ) -> Result<(String, SampleFiles), GalleryError> {
        self.check_dim(embedding)?;
        let label = self.next_unknown_label();
        let dir = self.category_dir(Category::Unknown).join(&label);
        let files = self.persist(&dir, embedding, crop)?;
        self.insert_unknown(label.clone(), dir, embedding)?;
        Ok((label, files))
    }

    /// 新建未知身份, 种子特征只留在内存中 (不写文件)
    ///
    /// 标签立即保留, 之后的 [`Gallery::append_sample`] 会在需要时创建目录.
    pub fn seed_unknown(&mut self, embedding: &Embedding) -> Result<String, GalleryError> {
        self.check_dim(embedding)?;
        let label = self.next_unknown_label();
        let dir = self.category_dir(Category::Unknown).join(&label);
        self.insert_unknown(label.clone(), dir, embedding)?;
        Ok(label)
    }

    fn insert_unknown(&mut self, label: String, dir: PathBuf, embedding: &Embedding) -> Result<(), GalleryError> {
        let mut matrix = EmbeddingMatrix::new(embedding.dim());
        matrix.push(embedding)?;
        self.dim.get_or_insert(embedding.dim());
        self.reserved.insert(label.clone());
        info!("🆕 新建身份 {}", label);
        self.unknown.insert(
            label.clone(),
            IdentityCluster {
                label,
                category: Category::Unknown,
                embeddings: matrix,
                dir,
            },
        );
        Ok(())
    }

    /// 向已有身份追加一个样本: 先落盘, 成功后才加入内存
    pub fn append_sample(
        &mut self,
        category: Category,
        label: &str,
        embedding: &Embedding,
        crop: &RgbImage,
    ) -> Result<SampleFiles, GalleryError> {
        self.check_dim(embedding)?;
        let dir = self
            .clusters(category)
            .get(label)
            .map(|c| c.dir.clone())
            .ok_or_else(|| GalleryError::NoSuchLabel(label.to_string()))?;
        let files = self.persist(&dir, embedding, crop)?;

        if let Some(cluster) = self.clusters_mut(category).get_mut(label) {
            cluster.embeddings.push(embedding)?;
        }
        debug!("[{}] {} 追加样本 {}", category, label, files.image.display());
        Ok(files)
    }

    /// 录入已知身份 (人工标注), 同名已知身份则追加样本
    pub fn enroll_known(
        &mut self,
        label: &str,
        samples: &[(Embedding, RgbImage)],
    ) -> Result<usize, GalleryError> {
        if self.unknown.contains_key(label) {
            return Err(GalleryError::LabelTaken {
                label: label.to_string(),
                category: Category::Unknown,
            });
        }
        for (embedding, crop) in samples {
            self.check_dim(embedding)?;
            if self.known.contains_key(label) {
                self.append_sample(Category::Known, label, embedding, crop)?;
                continue;
            }

            let dir = self.category_dir(Category::Known).join(label);
            self.persist(&dir, embedding, crop)?;
            let mut matrix = EmbeddingMatrix::new(embedding.dim());
            matrix.push(embedding)?;
            self.dim.get_or_insert(embedding.dim());
            self.reserved.insert(label.to_string());
            self.known.insert(
                label.to_string(),
                IdentityCluster {
                    label: label.to_string(),
                    category: Category::Known,
                    embeddings: matrix,
                    dir,
                },
            );
        }
        info!("✅ 已知身份 {} 录入 {} 个样本", label, samples.len());
        Ok(samples.len())
    }

    // ========== 内部 ==========

    fn category_dir(&self, category: Category) -> PathBuf {
        self.base.join(category.dir_name())
    }

    fn clusters(&self, category: Category) -> &BTreeMap<String, IdentityCluster> {
        match category {
            Category::Known => &self.known,
            Category::Unknown => &self.unknown,
        }
    }

    fn clusters_mut(&mut self, category: Category) -> &mut BTreeMap<String, IdentityCluster> {
        match category {
            Category::Known => &mut self.known,
            Category::Unknown => &mut self.unknown,
        }
    }

    fn check_dim(&self, embedding: &Embedding) -> Result<(), EmbeddingError> {
        match self.dim {
            Some(expected) if expected != embedding.dim() => Err(EmbeddingError::DimensionMismatch {
                expected,
                found: embedding.dim(),
            }),
            _ => Ok(()),
        }
    }

    /// 写 `<stamp>.<ext>` 与 `<stamp>.json`; 时间戳精确到微秒, 仍重名时追加序号
    fn persist(&self, dir: &Path, embedding: &Embedding, crop: &RgbImage) -> Result<SampleFiles, GalleryError> {
        fs::create_dir_all(dir).map_err(io_err(dir))?;

        let stamp = crate::gen_time_string("_");
        let mut stem = stamp.clone();
        let mut n = 1;
        while dir.join(format!("{}.json", stem)).exists() || dir.join(format!("{}.{}", stem, self.image_ext)).exists() {
            stem = format!("{}-{}", stamp, n);
            n += 1;
        }

        let image = dir.join(format!("{}.{}", stem, self.image_ext));
        let json = dir.join(format!("{}.json", stem));

        crop.save(&image).map_err(|source| GalleryError::Image {
            path: image.clone(),
            source,
        })?;
        let body = serde_json::to_vec(embedding).map_err(|source| GalleryError::Json {
            path: json.clone(),
            source,
        })?;
        if let Err(e) = fs::write(&json, body) {
            let _ = fs::remove_file(&image);
            return Err(io_err(&json)(e));
        }

        Ok(SampleFiles {
            image,
            embedding: json,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn emb(v: &[f32]) -> Embedding {
        Embedding::from_raw(v.to_vec()).unwrap()
    }

    fn crop() -> RgbImage {
        RgbImage::from_pixel(8, 16, Rgb([40, 80, 120]))
    }

    fn write_embedding(dir: &Path, name: &str, v: &[f32]) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(name), serde_json::to_vec(v).unwrap()).unwrap();
    }

    #[test]
    fn test_load_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path();
        write_embedding(&base.join("known/alice"), "a.json", &[2.0, 0.0]);
        write_embedding(&base.join("known/alice"), "b.json", &[0.0, 3.0]);
        write_embedding(&base.join("unknown/unknown1"), "a.json", &[1.0, 1.0]);
        // 没有特征的目录: 不成簇, 但名字被占用
        fs::create_dir_all(base.join("unknown/unknown2")).unwrap();
        // 损坏文件被忽略
        fs::write(base.join("known/alice/c.json"), b"not json").unwrap();

        let g = Gallery::load(base, "jpg").unwrap();
        assert_eq!(g.known_count(), 1);
        assert_eq!(g.unknown_count(), 1);
        assert_eq!(g.cluster("alice").unwrap().embeddings.len(), 2);
        assert_eq!(g.dim(), Some(2));
        assert!(g.contains("unknown2"));
        assert_eq!(g.next_unknown_label(), "unknown3");
    }

    #[test]
    fn test_loaded_embeddings_are_unit_norm() {
        let tmp = tempfile::tempdir().unwrap();
        write_embedding(&tmp.path().join("known/bob"), "x.json", &[3.0, 4.0, 12.0]);
        let g = Gallery::load(tmp.path(), "jpg").unwrap();
        let row = g.cluster("bob").unwrap().embeddings.row(0).unwrap();
        assert!((row.norm() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_known_wins_over_unknown_duplicate() {
        let tmp = tempfile::tempdir().unwrap();
        write_embedding(&tmp.path().join("known/carol"), "a.json", &[1.0, 0.0]);
        write_embedding(&tmp.path().join("unknown/carol"), "a.json", &[0.0, 1.0]);
        let g = Gallery::load(tmp.path(), "jpg").unwrap();
        assert_eq!(g.cluster("carol").unwrap().category, Category::Known);
        assert_eq!(g.unknown_count(), 0);
    }

    #[test]
    fn test_best_match_per_category() {
        let tmp = tempfile::tempdir().unwrap();
        write_embedding(&tmp.path().join("known/alice"), "a.json", &[1.0, 0.0]);
        write_embedding(&tmp.path().join("known/bob"), "a.json", &[0.0, 1.0]);
        let g = Gallery::load(tmp.path(), "jpg").unwrap();

        let m = g.best_match(Category::Known, &emb(&[0.1, 1.0])).unwrap().unwrap();
        assert_eq!(m.label, "bob");
        assert!(g.best_match(Category::Unknown, &emb(&[0.1, 1.0])).unwrap().is_none());
        assert!(g.best_match(Category::Known, &emb(&[1.0, 0.0, 0.0])).is_err());
    }

    #[test]
    fn test_create_unknown_persists_seed() {
        let tmp = tempfile::tempdir().unwrap();
        let mut g = Gallery::load(tmp.path(), "jpg").unwrap();

        let (label, files) = g.create_unknown(&emb(&[1.0, 0.0]), &crop()).unwrap();
        assert_eq!(label, "unknown1");
        assert!(files.image.exists());
        assert!(files.embedding.exists());
        assert_eq!(files.image.parent().unwrap(), tmp.path().join("unknown/unknown1"));

        let (label2, _) = g.create_unknown(&emb(&[0.0, 1.0]), &crop()).unwrap();
        assert_eq!(label2, "unknown2");

        // 重新载入后内容一致
        let reloaded = Gallery::load(tmp.path(), "jpg").unwrap();
        assert_eq!(reloaded.unknown_count(), 2);
        assert_eq!(reloaded.cluster("unknown1").unwrap().embeddings.len(), 1);
    }

    #[test]
    fn test_seed_unknown_stays_in_memory() {
        let tmp = tempfile::tempdir().unwrap();
        let mut g = Gallery::load(tmp.path(), "jpg").unwrap();

        let label = g.seed_unknown(&emb(&[1.0, 0.0])).unwrap();
        assert_eq!(label, "unknown1");
        assert!(!tmp.path().join("unknown/unknown1").exists());
        let m = g.best_match(Category::Unknown, &emb(&[1.0, 0.0])).unwrap().unwrap();
        assert_eq!(m.label, "unknown1");
        assert_eq!(g.next_unknown_label(), "unknown2");

        // 追加样本时才创建目录
        g.append_sample(Category::Unknown, &label, &emb(&[1.0, 0.2]), &crop()).unwrap();
        assert_eq!(g.cluster(&label).unwrap().embeddings.len(), 2);
        let reloaded = Gallery::load(tmp.path(), "jpg").unwrap();
        assert_eq!(reloaded.cluster(&label).unwrap().embeddings.len(), 1);
    }

    #[test]
    fn test_next_label_skips_taken_names() {
        let tmp = tempfile::tempdir().unwrap();
        // 已知身份恰好叫 unknown1
        write_embedding(&tmp.path().join("known/unknown1"), "a.json", &[1.0, 0.0]);
        let g = Gallery::load(tmp.path(), "jpg").unwrap();
        assert_eq!(g.next_unknown_label(), "unknown2");
    }

    #[test]
    fn test_append_sample_same_cycle_no_collision() {
        let tmp = tempfile::tempdir().unwrap();
        let mut g = Gallery::load(tmp.path(), "png").unwrap();
        let (label, _) = g.create_unknown(&emb(&[1.0, 0.0]), &crop()).unwrap();

        let a = g.append_sample(Category::Unknown, &label, &emb(&[1.0, 0.1]), &crop()).unwrap();
        let b = g.append_sample(Category::Unknown, &label, &emb(&[1.0, 0.2]), &crop()).unwrap();
        assert_ne!(a.embedding, b.embedding);
        assert_eq!(g.cluster(&label).unwrap().embeddings.len(), 3);

        let jsons = fs::read_dir(tmp.path().join("unknown").join(&label))
            .unwrap()
            .filter(|e| e.as_ref().unwrap().path().extension().unwrap() == "json")
            .count();
        assert_eq!(jsons, 3);
    }

    #[test]
    fn test_append_to_missing_label_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let mut g = Gallery::load(tmp.path(), "jpg").unwrap();
        assert!(matches!(
            g.append_sample(Category::Known, "nobody", &emb(&[1.0]), &crop()),
            Err(GalleryError::NoSuchLabel(_))
        ));
    }

    #[test]
    fn test_enroll_known() {
        let tmp = tempfile::tempdir().unwrap();
        let mut g = Gallery::load(tmp.path(), "jpg").unwrap();
        let samples = vec![(emb(&[1.0, 0.0]), crop()), (emb(&[0.9, 0.1]), crop())];
        assert_eq!(g.enroll_known("dave", &samples).unwrap(), 2);
        assert_eq!(g.cluster("dave").unwrap().embeddings.len(), 2);
        assert_eq!(g.cluster("dave").unwrap().category, Category::Known);

        let (unk, _) = g.create_unknown(&emb(&[0.0, 1.0]), &crop()).unwrap();
        assert!(matches!(
            g.enroll_known(&unk, &samples),
            Err(GalleryError::LabelTaken { .. })
        ));
    }
}
