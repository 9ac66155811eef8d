//! 外观特征向量

use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum EmbeddingError {
    #[error("特征向量为空")]
    Empty,
    #[error("特征向量含有非有限值")]
    NonFinite,
    #[error("特征向量范数为0, 无法归一化")]
    ZeroNorm,
    #[error("特征维度不一致: 期望 {expected}, 实际 {found}")]
    DimensionMismatch { expected: usize, found: usize },
}

/// L2归一化的特征向量, 构造后 ‖e‖₂ = 1
///
/// 落盘为JSON数组, 读入时重新归一化
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Embedding(Array1<f32>);

impl Embedding {
    pub fn from_raw(values: Vec<f32>) -> Result<Self, EmbeddingError> {
        if values.is_empty() {
            return Err(EmbeddingError::Empty);
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(EmbeddingError::NonFinite);
        }
        let v = Array1::from(values);
        let norm = v.dot(&v).sqrt();
        if norm == 0.0 || !norm.is_finite() {
            return Err(EmbeddingError::ZeroNorm);
        }
        Ok(Self(v / norm))
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }

    pub fn as_array(&self) -> &Array1<f32> {
        &self.0
    }

    pub fn norm(&self) -> f32 {
        self.0.dot(&self.0).sqrt()
    }

    /// 余弦相似度 (两个单位向量的点积), 范围 [-1, 1]
    pub fn cosine(&self, other: &Embedding) -> Result<f32, EmbeddingError> {
        if self.dim() != other.dim() {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dim(),
                found: other.dim(),
            });
        }
        Ok(self.0.dot(&other.0))
    }
}

impl TryFrom<Vec<f32>> for Embedding {
    type Error = EmbeddingError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Embedding::from_raw(values)
    }
}

impl From<Embedding> for Vec<f32> {
    fn from(e: Embedding) -> Self {
        e.0.to_vec()
    }
}

/// 同一身份的全部特征, 按行堆叠, 一次矩阵乘法算出与查询向量的全部相似度
#[derive(Clone, Debug)]
pub struct EmbeddingMatrix {
    rows: Array2<f32>,
}

impl EmbeddingMatrix {
    pub fn new(dim: usize) -> Self {
        Self {
            rows: Array2::zeros((0, dim)),
        }
    }

    pub fn from_embeddings(embeddings: &[Embedding]) -> Result<Self, EmbeddingError> {
        let dim = embeddings.first().map(Embedding::dim).ok_or(EmbeddingError::Empty)?;
        let mut m = Self::new(dim);
        for e in embeddings {
            m.push(e)?;
        }
        Ok(m)
    }

    pub fn dim(&self) -> usize {
        self.rows.ncols()
    }

    pub fn len(&self) -> usize {
        self.rows.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&mut self, embedding: &Embedding) -> Result<(), EmbeddingError> {
        self.check_dim(embedding)?;
        self.rows
            .push_row(embedding.as_array().view())
            .map_err(|_| EmbeddingError::DimensionMismatch {
                expected: self.dim(),
                found: embedding.dim(),
            })
    }

    /// 与每一行的相似度
    pub fn similarities(&self, query: &Embedding) -> Result<Array1<f32>, EmbeddingError> {
        self.check_dim(query)?;
        Ok(self.rows.dot(query.as_array()))
    }

    /// 最大相似度; 空矩阵返回 `None`
    pub fn max_similarity(&self, query: &Embedding) -> Result<Option<f32>, EmbeddingError> {
        let sims = self.similarities(query)?;
        Ok(sims.iter().copied().reduce(f32::max))
    }

    pub fn row(&self, index: usize) -> Option<Embedding> {
        (index < self.len()).then(|| Embedding(self.rows.index_axis(Axis(0), index).to_owned()))
    }

    fn check_dim(&self, e: &Embedding) -> Result<(), EmbeddingError> {
        if e.dim() != self.dim() {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dim(),
                found: e.dim(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_raw_normalizes() {
        let e = Embedding::from_raw(vec![3.0, 4.0]).unwrap();
        assert!((e.norm() - 1.0).abs() < 1e-6);
        assert!((e.as_array()[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_vectors_rejected() {
        assert_eq!(Embedding::from_raw(vec![]), Err(EmbeddingError::Empty));
        assert_eq!(Embedding::from_raw(vec![0.0, 0.0]), Err(EmbeddingError::ZeroNorm));
        assert_eq!(
            Embedding::from_raw(vec![1.0, f32::NAN]),
            Err(EmbeddingError::NonFinite)
        );
    }

    #[test]
    fn test_cosine_of_orthogonal_and_identical() {
        let a = Embedding::from_raw(vec![1.0, 0.0]).unwrap();
        let b = Embedding::from_raw(vec![0.0, 2.0]).unwrap();
        assert_eq!(a.cosine(&b).unwrap(), 0.0);
        assert!((a.cosine(&a).unwrap() - 1.0).abs() < 1e-6);
        let c = Embedding::from_raw(vec![1.0, 0.0, 0.0]).unwrap();
        assert!(a.cosine(&c).is_err());
    }

    #[test]
    fn test_json_reload_renormalizes() {
        let e: Embedding = serde_json::from_str("[0.0, 5.0]").unwrap();
        assert_eq!(e.as_array().to_vec(), vec![0.0, 1.0]);
        assert!(serde_json::from_str::<Embedding>("[0.0, 0.0]").is_err());
        assert_eq!(serde_json::to_string(&e).unwrap(), "[0.0,1.0]");
    }

    #[test]
    fn test_matrix_max_similarity() {
        let mut m = EmbeddingMatrix::new(2);
        assert_eq!(m.max_similarity(&Embedding::from_raw(vec![1.0, 0.0]).unwrap()).unwrap(), None);

        m.push(&Embedding::from_raw(vec![1.0, 0.0]).unwrap()).unwrap();
        m.push(&Embedding::from_raw(vec![0.0, 1.0]).unwrap()).unwrap();
        assert_eq!(m.len(), 2);

        let q = Embedding::from_raw(vec![0.0, 1.0]).unwrap();
        assert_eq!(m.max_similarity(&q).unwrap(), Some(1.0));
        assert!(m.push(&Embedding::from_raw(vec![1.0, 0.0, 0.0]).unwrap()).is_err());
        assert_eq!(m.row(1), Some(q));
    }
}
