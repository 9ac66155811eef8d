/// 身份解析系统 (Identity Resolution)
///
/// - embedding:  归一化特征向量
/// - gallery:    已知/未知身份图库 (唯一的长期状态)
/// - extractor:  外部特征模型
/// - resolver:   匹配/新建/更新规则
/// - correlator: 跨摄像头关联
/// - stage:      订阅裁剪图 → 解析 → 发布轨迹
pub mod correlator;
pub mod embedding;
pub mod extractor;
pub mod gallery;
pub mod resolver;
pub mod stage;

use std::collections::{BTreeMap, BTreeSet};

pub use correlator::{correlate, Observation};
pub use embedding::{Embedding, EmbeddingError, EmbeddingMatrix};
pub use extractor::{load_extractor, EmbeddingExtractor};
pub use gallery::{Category, Gallery, GalleryError, IdentityCluster, Match};
pub use resolver::{CycleReport, IdentityResolver, Outcome, Resolution, Thresholds};
pub use stage::{merge_batches, ResolverStage};

/// 摄像头 → 本周期出现的身份标签 (只含本周期, 不累积)
pub type LiveTrackSet = BTreeMap<String, BTreeSet<String>>;
