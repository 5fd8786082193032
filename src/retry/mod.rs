//! 重试退避模块
//!
//! 注册维护器和发现监听器在后端出错后都“永远重试”，这里只决定每次等待多久。

pub mod exponential;
pub mod fixed;

pub use exponential::ExponentialBackoff;
pub use fixed::FixedBackoff;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// 默认重试间隔（5 秒）
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// 退避策略 trait
pub trait Backoff: Send + Sync {
    /// 第 `attempt` 次连续失败后的等待时间（从 0 开始计数）
    fn delay(&self, attempt: usize) -> Duration;
}

/// 共享的退避策略
pub type BackoffPolicy = Arc<dyn Backoff>;

/// 根据配置构造退避策略
///
/// 配置了上限时使用带上限的指数退避，否则使用固定间隔
pub fn policy_from(interval: Duration, max_interval: Option<Duration>) -> BackoffPolicy {
    match max_interval {
        Some(max) if max > interval => Arc::new(ExponentialBackoff::new(interval, max)),
        _ => Arc::new(FixedBackoff::new(interval)),
    }
}

/// 睡眠指定时长，或在取消时提前返回
///
/// 返回 `true` 表示睡眠完整结束，`false` 表示已被取消
pub async fn sleep_or_cancel(token: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// 连续失败计数器
///
/// 成功一次就清零，保证恢复后的下一次失败重新从最短间隔开始
pub struct RetryState {
    policy: BackoffPolicy,
    attempt: usize,
}

impl RetryState {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// 当前连续失败次数
    pub fn attempts(&self) -> usize {
        self.attempt
    }

    /// 清零
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// 下一次失败后要等待的时间
    pub fn next_delay(&self) -> Duration {
        self.policy.delay(self.attempt)
    }

    /// 记录一次失败并等待退避时间；被取消时返回 `false`
    pub async fn backoff(&mut self, token: &CancellationToken) -> bool {
        let delay = self.policy.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        sleep_or_cancel(token, delay).await
    }
}
