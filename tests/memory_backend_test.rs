//! 内存后端测试

use flare_service_registry::discovery::backend::{KeyEvent, Notification, WatchStream};
use flare_service_registry::{BackendError, CoordinationBackend, MemoryBackend, WatchMode};
use std::time::Duration;
use tokio::time::timeout;

const PREFIX: &str = "/crm/service/endpoint/user";

fn path(key: &str) -> String {
    format!("{PREFIX}/{key}")
}

/// 测试：创建、列举、删除存活标记
#[tokio::test]
async fn test_publish_list_withdraw() {
    let backend = MemoryBackend::new();

    let presence = backend.publish(&path("a"), b"one").await.expect("publish");
    backend.publish(&path("b"), b"two").await.expect("publish");
    backend.put_raw("/crm/service/endpoint/other/x", "elsewhere");
    // 共享前缀但不是子节点
    backend.put_raw("/crm/service/endpoint/user-admin/y", "sibling");

    let members = backend.list(PREFIX).await.expect("list");
    assert_eq!(members.len(), 2);
    assert_eq!(members.get(&path("a")).map(Vec::as_slice), Some(&b"one"[..]));

    backend.withdraw(&presence).await.expect("withdraw");
    assert!(!backend.contains(&path("a")));
    assert_eq!(backend.lease_count(), 1);

    // 重复删除是安全的
    backend.withdraw(&presence).await.expect("withdraw twice");
}

/// 测试：前缀不存在时列举为空
#[tokio::test]
async fn test_list_missing_prefix() {
    let backend = MemoryBackend::new();
    assert!(backend.list(PREFIX).await.expect("list").is_empty());
}

/// 测试：未续期的租约过期
#[tokio::test]
async fn test_lease_expires_without_renewal() {
    let backend = MemoryBackend::new().with_ttl(Duration::from_millis(50));
    backend.publish(&path("a"), b"one").await.expect("publish");

    tokio::time::sleep(Duration::from_millis(120)).await;

    assert!(backend.list(PREFIX).await.expect("list").is_empty());
    assert_eq!(backend.lease_count(), 0);
}

/// 测试：sustain 续期并在标记被删除时返回
#[tokio::test]
async fn test_sustain_renews_and_detects_loss() {
    let backend = MemoryBackend::new().with_ttl(Duration::from_millis(90));
    let presence = backend.publish(&path("a"), b"one").await.expect("publish");

    let sustaining = {
        let backend = backend.clone();
        let presence = presence.clone();
        tokio::spawn(async move { backend.sustain(&presence).await })
    };

    // 超过 TTL 后仍然存在
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(backend.contains(&path("a")));

    assert!(backend.delete(&path("a")));
    let result = timeout(Duration::from_secs(5), sustaining)
        .await
        .expect("sustain did not notice deletion")
        .expect("join");
    assert_eq!(result, Ok(()));
}

/// 测试：续期失败返回错误
#[tokio::test]
async fn test_sustain_reports_renewal_failure() {
    let backend = MemoryBackend::new().with_ttl(Duration::from_millis(60));
    let presence = backend.publish(&path("a"), b"one").await.expect("publish");
    backend.fail_next_renewals(1);

    let result = timeout(Duration::from_secs(5), backend.sustain(&presence))
        .await
        .expect("timed out");
    assert!(matches!(result, Err(BackendError::Unavailable(_))));
}

/// 测试：增量 watch 上报 put/delete 事件
#[tokio::test]
async fn test_incremental_watch() {
    let backend = MemoryBackend::new();
    let mut watch = backend.watch(PREFIX).await.expect("watch");

    backend.put_raw("/crm/service/endpoint/other/x", "ignored");
    let presence = backend.publish(&path("a"), b"one").await.expect("publish");

    let next = timeout(Duration::from_secs(5), watch.next()).await.expect("timed out");
    assert_eq!(
        next,
        Ok(Some(Notification::Events(vec![KeyEvent::Put {
            key: path("a"),
            value: b"one".to_vec(),
        }])))
    );

    backend.withdraw(&presence).await.expect("withdraw");
    let next = timeout(Duration::from_secs(5), watch.next()).await.expect("timed out");
    assert_eq!(
        next,
        Ok(Some(Notification::Events(vec![KeyEvent::Delete { key: path("a") }])))
    );
}

/// 测试：一次性“子节点变化” watch
#[tokio::test]
async fn test_children_changed_watch_is_one_shot() {
    let backend = MemoryBackend::new().with_watch_mode(WatchMode::ChildrenChanged);
    let mut watch = backend.watch(PREFIX).await.expect("watch");

    backend.put_raw(&path("a"), "one");
    backend.put_raw(&path("b"), "two");

    let next = timeout(Duration::from_secs(5), watch.next()).await.expect("timed out");
    assert_eq!(next, Ok(Some(Notification::ChildrenChanged)));
    assert_eq!(watch.next().await, Ok(None));
}

/// 测试：故障注入
#[tokio::test]
async fn test_injected_failures() {
    let backend = MemoryBackend::new();
    backend.fail_next_publishes(1);
    backend.fail_next_lists(1);
    backend.fail_next_watches(1);

    assert!(backend.publish(&path("a"), b"one").await.is_err());
    assert!(backend.publish(&path("a"), b"one").await.is_ok());
    assert!(backend.list(PREFIX).await.is_err());
    assert!(backend.list(PREFIX).await.is_ok());
    assert!(backend.watch(PREFIX).await.is_err());
    assert!(backend.watch(PREFIX).await.is_ok());
}

/// 测试：认证失效直到重新认证
#[tokio::test]
async fn test_reauthentication() {
    let backend = MemoryBackend::new();
    backend.require_reauth();

    let err = backend.list(PREFIX).await.unwrap_err();
    assert!(err.needs_reauth());

    backend.reauthenticate().await.expect("reauth");
    assert_eq!(backend.reauth_count(), 1);
    assert!(backend.list(PREFIX).await.is_ok());
}

/// 测试：关闭后所有操作返回 Closed
#[tokio::test]
async fn test_closed_backend() {
    let backend = MemoryBackend::new();
    let mut watch = backend.watch(PREFIX).await.expect("watch");
    backend.close().await;

    assert!(backend.is_closed());
    assert_eq!(watch.next().await, Ok(None));
    assert_eq!(backend.list(PREFIX).await.unwrap_err(), BackendError::Closed);
    assert!(backend.publish(&path("a"), b"one").await.unwrap_err().is_terminal());
}

/// 测试：没有任何操作时过期租约也会被回收并通知 watch
#[tokio::test]
async fn test_expired_lease_notifies_watch() {
    let backend = MemoryBackend::new().with_ttl(Duration::from_millis(50));
    let mut watch = backend.watch(PREFIX).await.expect("watch");
    backend.publish(&path("a"), b"one").await.expect("publish");

    let next = timeout(Duration::from_secs(5), watch.next()).await.expect("timed out");
    assert_eq!(
        next,
        Ok(Some(Notification::Events(vec![KeyEvent::Put {
            key: path("a"),
            value: b"one".to_vec(),
        }])))
    );

    let next = timeout(Duration::from_secs(5), watch.next())
        .await
        .expect("expiry was not reported");
    assert_eq!(
        next,
        Ok(Some(Notification::Events(vec![KeyEvent::Delete { key: path("a") }])))
    );
    assert_eq!(backend.lease_count(), 0);
}

/// 测试：重新认证失败的次数可以注入
#[tokio::test]
async fn test_injected_reauth_failures() {
    let backend = MemoryBackend::new();
    backend.require_reauth();
    backend.fail_next_reauths(2);

    for _ in 0..2 {
        let err = backend.reauthenticate().await.unwrap_err();
        assert!(err.needs_reauth());
        assert!(backend.list(PREFIX).await.unwrap_err().needs_reauth());
    }
    assert_eq!(backend.reauth_count(), 0);

    backend.reauthenticate().await.expect("reauth");
    assert_eq!(backend.reauth_count(), 1);
    assert!(backend.list(PREFIX).await.is_ok());
}

/// 测试：list_and_watch 的 watch 只包含列表之后的变化
#[tokio::test]
async fn test_list_and_watch_starts_after_listing() {
    let backend = MemoryBackend::new();
    backend.put_raw(&path("a"), "one");

    let (members, mut watch) = backend.list_and_watch(PREFIX).await.expect("list and watch");
    assert_eq!(members.len(), 1);

    backend.put_raw(&path("b"), "two");
    let next = timeout(Duration::from_secs(5), watch.next()).await.expect("timed out");
    assert_eq!(
        next,
        Ok(Some(Notification::Events(vec![KeyEvent::Put {
            key: path("b"),
            value: b"two".to_vec(),
        }])))
    );
}

/// 测试：list_and_watch 同样受故障注入影响
#[tokio::test]
async fn test_list_and_watch_failures() {
    let backend = MemoryBackend::new();
    backend.fail_next_watches(1);
    backend.fail_next_lists(1);

    assert!(backend.list_and_watch(PREFIX).await.is_err());
    assert!(backend.list_and_watch(PREFIX).await.is_err());
    assert!(backend.list_and_watch(PREFIX).await.is_ok());
}
