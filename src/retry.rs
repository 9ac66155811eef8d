//! 退避重试与健康状态 (Retry policy + health signal)
//!
//! 每个阶段的外层循环在捕获异常后调用 [`RetryPolicy::record_failure`] 取得
//! 下一次重试前的等待时间. 等待时间指数增长并有上限; 连续失败次数超过
//! `failing_after` 后健康状态变为 [`Health::Failing`], 用于区分瞬时故障与
//! 持续损坏的外部依赖 (模型/视频源).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// 重试参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 首次重试等待 (毫秒)
    pub initial_ms: u64,
    /// 等待上限 (毫秒)
    pub max_ms: u64,
    /// 每次失败的增长倍数
    pub multiplier: f64,
    /// 连续失败多少次后判定为持续故障
    pub failing_after: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_ms: 1000,
            max_ms: 30_000,
            multiplier: 2.0,
            failing_after: 5,
        }
    }
}

/// 健康状态 (按严重程度排序)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Health {
    /// 最近一次操作成功
    Healthy,
    /// 有失败, 但尚未达到持续故障阈值
    Degraded,
    /// 连续失败, 很可能是永久性故障
    Failing,
}

/// 有界指数退避 + 连续失败计数
pub struct RetryPolicy {
    name: String,
    backoff: ExponentialBackoff,
    max_delay: Duration,
    failing_after: u32,
    consecutive_failures: u32,
}

impl RetryPolicy {
    pub fn new(name: impl Into<String>, config: &RetryConfig) -> Self {
        let initial = Duration::from_millis(config.initial_ms.max(1));
        let max_delay = Duration::from_millis(config.max_ms.max(config.initial_ms.max(1)));
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(initial)
            .with_max_interval(max_delay)
            .with_multiplier(config.multiplier.max(1.0))
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build();

        Self {
            name: name.into(),
            backoff,
            max_delay,
            failing_after: config.failing_after.max(1),
            consecutive_failures: 0,
        }
    }

    /// 记录一次失败, 返回重试前应等待的时间
    pub fn record_failure(&mut self) -> Duration {
        let before = self.health();
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if before != Health::Failing && self.health() == Health::Failing {
            error!(
                "❌ [{}] 连续失败 {} 次, 判定为持续故障 (仍将继续重试)",
                self.name, self.consecutive_failures
            );
        }

        self.backoff
            .next_backoff()
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// 记录一次成功, 重置退避与健康状态
    pub fn record_success(&mut self) {
        if self.consecutive_failures >= self.failing_after {
            info!("✅ [{}] 已从持续故障中恢复", self.name);
        }
        self.consecutive_failures = 0;
        self.backoff.reset();
    }

    pub fn health(&self) -> Health {
        match self.consecutive_failures {
            0 => Health::Healthy,
            n if n < self.failing_after => Health::Degraded,
            _ => Health::Failing,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

struct KeyedEntry {
    policy: RetryPolicy,
    resume_at: Option<Instant>,
}

/// 按摄像头分别退避: 某一路模型连续失败时只暂停这一路, 其他摄像头照常处理
pub struct KeyedBackoff {
    name: String,
    config: RetryConfig,
    entries: HashMap<String, KeyedEntry>,
}

impl KeyedBackoff {
    pub fn new(name: impl Into<String>, config: &RetryConfig) -> Self {
        Self {
            name: name.into(),
            config: config.clone(),
            entries: HashMap::new(),
        }
    }

    /// 该路是否仍在退避期内
    pub fn is_paused(&self, key: &str, now: Instant) -> bool {
        self.entries
            .get(key)
            .and_then(|e| e.resume_at)
            .is_some_and(|at| now < at)
    }

    /// 记录一次失败, 该路暂停到 `now + 返回的等待时间`
    pub fn record_failure(&mut self, key: &str, now: Instant) -> Duration {
        let entry = self.entries.entry(key.to_string()).or_insert_with(|| KeyedEntry {
            policy: RetryPolicy::new(format!("{}:{}", self.name, key), &self.config),
            resume_at: None,
        });
        let delay = entry.policy.record_failure();
        entry.resume_at = Some(now + delay);
        delay
    }

    pub fn record_success(&mut self, key: &str) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.policy.record_success();
            entry.resume_at = None;
        }
    }

    /// 从未失败过的键视为健康
    pub fn health(&self, key: &str) -> Health {
        self.entries
            .get(key)
            .map(|e| e.policy.health())
            .unwrap_or(Health::Healthy)
    }

    /// 所有键中最差的健康状态
    pub fn worst(&self) -> Health {
        self.entries
            .values()
            .map(|e| e.policy.health())
            .max()
            .unwrap_or(Health::Healthy)
    }
}
