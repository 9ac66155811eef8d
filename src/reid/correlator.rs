//! 跨摄像头关联: 同一周期内同一身份出现在两路摄像头

use std::collections::BTreeMap;

use super::embedding::Embedding;
use crate::messages::CoOccurrence;

/// 一次已解析的观测
#[derive(Debug, Clone)]
pub struct Observation {
    pub camera_id: String,
    pub label: String,
    pub embedding: Embedding,
}

/// 对每对摄像头 (a < b) 的共同标签产生一条关联
///
/// 强度取两路中该标签特征的最大余弦相似度. 配置了 `stream_threshold`
/// 时只保留强度严格大于阈值的关联.
pub fn correlate(observations: &[Observation], stream_threshold: Option<f32>) -> Vec<CoOccurrence> {
    let mut by_camera: BTreeMap<&str, BTreeMap<&str, Vec<&Embedding>>> = BTreeMap::new();
    for obs in observations {
        by_camera
            .entry(obs.camera_id.as_str())
            .or_default()
            .entry(obs.label.as_str())
            .or_default()
            .push(&obs.embedding);
    }

    let cameras: Vec<(&str, &BTreeMap<&str, Vec<&Embedding>>)> =
        by_camera.iter().map(|(c, l)| (*c, l)).collect();

    let mut out = Vec::new();
    for (i, (cam_a, labels_a)) in cameras.iter().enumerate() {
        for (cam_b, labels_b) in &cameras[i + 1..] {
            for (label, embs_a) in labels_a.iter() {
                let Some(embs_b) = labels_b.get(label) else {
                    continue;
                };
                let strength = max_cosine(embs_a, embs_b);
                if let Some(t) = stream_threshold {
                    if !strength.is_some_and(|s| s > t) {
                        continue;
                    }
                }
                out.push(CoOccurrence {
                    camera_a: cam_a.to_string(),
                    camera_b: cam_b.to_string(),
                    label: label.to_string(),
                    strength,
                });
            }
        }
    }
    out
}

fn max_cosine(a: &[&Embedding], b: &[&Embedding]) -> Option<f32> {
    a.iter()
        .flat_map(|x| b.iter().filter_map(move |y| x.cosine(y).ok()))
        .reduce(f32::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(camera: &str, label: &str, v: &[f32]) -> Observation {
        Observation {
            camera_id: camera.into(),
            label: label.into(),
            embedding: Embedding::from_raw(v.to_vec()).unwrap(),
        }
    }

    #[test]
    fn test_same_label_on_two_cameras() {
        let observations = vec![
            obs("lobby", "alice", &[1.0, 0.0]),
            obs("hall", "alice", &[1.0, 0.0]),
            obs("garage", "bob", &[0.0, 1.0]),
        ];
        let co = correlate(&observations, None);
        assert_eq!(co.len(), 1);
        assert_eq!(co[0].camera_a, "hall");
        assert_eq!(co[0].camera_b, "lobby");
        assert_eq!(co[0].label, "alice");
        assert!((co[0].strength.unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_strength_is_best_pair() {
        let observations = vec![
            obs("a", "alice", &[1.0, 0.0]),
            obs("a", "alice", &[0.0, 1.0]),
            obs("b", "alice", &[0.6, 0.8]),
        ];
        let co = correlate(&observations, None);
        assert!((co[0].strength.unwrap() - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_stream_threshold_filters_weak_pairs() {
        let observations = vec![
            obs("a", "alice", &[1.0, 0.0]),
            obs("b", "alice", &[0.6, 0.8]),
        ];
        assert_eq!(correlate(&observations, Some(0.5)).len(), 1);
        assert!(correlate(&observations, Some(0.7)).is_empty());
    }

    #[test]
    fn test_single_camera_has_no_pairs() {
        let observations = vec![obs("a", "alice", &[1.0, 0.0]), obs("a", "alice", &[1.0, 0.0])];
        assert!(correlate(&observations, None).is_empty());
    }
}
