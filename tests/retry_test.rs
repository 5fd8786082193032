//! 重试退避测试

use flare_service_registry::retry::{self, Backoff, RetryState, sleep_or_cancel};
use flare_service_registry::{ExponentialBackoff, FixedBackoff};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// 测试：固定间隔
#[test]
fn test_fixed_backoff() {
    let backoff = FixedBackoff::default();
    assert_eq!(backoff.delay(0), Duration::from_secs(5));
    assert_eq!(backoff.delay(7), Duration::from_secs(5));
}

/// 测试：指数退避及上限
#[test]
fn test_exponential_backoff_is_capped() {
    let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1));
    assert_eq!(backoff.delay(0), Duration::from_millis(100));
    assert_eq!(backoff.delay(1), Duration::from_millis(200));
    assert_eq!(backoff.delay(3), Duration::from_millis(800));
    assert_eq!(backoff.delay(4), Duration::from_secs(1));
    assert_eq!(backoff.delay(usize::MAX), Duration::from_secs(1));
}

/// 测试：按配置选择策略
#[test]
fn test_policy_from() {
    let fixed = retry::policy_from(Duration::from_millis(50), None);
    assert_eq!(fixed.delay(5), Duration::from_millis(50));

    let capped = retry::policy_from(Duration::from_millis(50), Some(Duration::from_millis(300)));
    assert_eq!(capped.delay(1), Duration::from_millis(100));
    assert_eq!(capped.delay(10), Duration::from_millis(300));

    // 上限不大于基础间隔时退化为固定间隔
    let degenerate = retry::policy_from(Duration::from_millis(50), Some(Duration::from_millis(10)));
    assert_eq!(degenerate.delay(3), Duration::from_millis(50));
}

/// 测试：取消会打断退避等待
#[tokio::test]
async fn test_sleep_is_interrupted_by_cancel() {
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let completed = sleep_or_cancel(&token, Duration::from_secs(30)).await;

    assert!(!completed);
    assert!(started.elapsed() < Duration::from_secs(5));
}

/// 测试：未取消时睡眠完整结束
#[tokio::test]
async fn test_sleep_completes() {
    let token = CancellationToken::new();
    assert!(sleep_or_cancel(&token, Duration::from_millis(5)).await);
}

/// 测试：连续失败计数与清零
#[tokio::test]
async fn test_retry_state_counts_attempts() {
    let token = CancellationToken::new();
    let mut state = RetryState::new(Arc::new(FixedBackoff::new(Duration::from_millis(1))));

    assert!(state.backoff(&token).await);
    assert!(state.backoff(&token).await);
    assert_eq!(state.attempts(), 2);

    state.reset();
    assert_eq!(state.attempts(), 0);

    token.cancel();
    assert!(!state.backoff(&token).await);
}

/// 测试：下一次等待时间随失败次数增长，清零后恢复
#[tokio::test]
async fn test_retry_state_next_delay() {
    let token = CancellationToken::new();
    let mut state = RetryState::new(Arc::new(ExponentialBackoff::new(
        Duration::from_millis(1),
        Duration::from_millis(4),
    )));
    assert_eq!(state.next_delay(), Duration::from_millis(1));

    assert!(state.backoff(&token).await);
    assert_eq!(state.next_delay(), Duration::from_millis(2));

    state.reset();
    assert_eq!(state.next_delay(), Duration::from_millis(1));
}
