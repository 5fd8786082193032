//! etcd 后端集成测试
//!
//! 这些测试需要运行中的 etcd 服务器实例。
//! 默认情况下，测试会被忽略，需要使用 `cargo test --test etcd_backend_test -- --ignored` 运行。
//!
//! 启动 etcd 服务器：
//! ```bash
//! docker run -d --name etcd-test -p 2379:2379 -p 2380:2380 \
//!   quay.io/coreos/etcd:v3.5.9 \
//!   etcd --advertise-client-urls=http://127.0.0.1:2379 \
//!        --listen-client-urls=http://0.0.0.0:2379
//! ```
#![cfg(feature = "etcd")]

use flare_service_registry::config::BackendKind;
use flare_service_registry::{
    CoordinationBackend, EtcdBackend, RegistrationState, RegistryConfig, ServiceRecord,
    ServiceRegistry,
};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

/// etcd 服务器地址
/// 可以通过环境变量 ETCD_ENDPOINTS 覆盖，默认为 http://127.0.0.1:2379
fn etcd_endpoints() -> Vec<String> {
    std::env::var("ETCD_ENDPOINTS")
        .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_else(|_| vec!["http://127.0.0.1:2379".to_string()])
}

/// 每个测试使用独立命名空间，避免互相干扰
fn create_test_config() -> RegistryConfig {
    let mut config = RegistryConfig::new(
        BackendKind::Etcd,
        etcd_endpoints(),
        format!("flare-test-{}", uuid::Uuid::new_v4()),
    );
    config.ttl = 5;
    config.retry_interval_ms = 200;
    config
}

/// 测试：服务注册
#[tokio::test]
#[ignore]
async fn test_etcd_register() {
    let config = create_test_config();
    let backend = EtcdBackend::connect(&config)
        .await
        .expect("Failed to create etcd backend");
    let registry = ServiceRegistry::new(config.namespace.clone(), std::sync::Arc::new(backend))
        .with_options(config.registry_options());
    let token = CancellationToken::new();

    let registration = registry
        .register(&token, "user", ServiceRecord::new("127.0.0.1", 8080))
        .await
        .expect("Failed to register service");
    let registered = timeout(
        Duration::from_secs(10),
        registration.wait_for(RegistrationState::Registered),
    )
    .await
    .expect("Timed out waiting for registration");
    assert!(registered);

    let members = registry
        .backend()
        .list(&registry.service_path("user"))
        .await
        .expect("Failed to list services");
    assert!(members.contains_key(registration.path()));

    // 清理
    registration.shutdown().await;
    let members = registry
        .backend()
        .list(&registry.service_path("user"))
        .await
        .expect("Failed to list services");
    assert!(members.is_empty(), "Service instance still exists after unregistration");
    registry.close().await;
}

/// 测试：注册 + 发现
#[tokio::test]
#[ignore]
async fn test_etcd_register_and_discover() {
    let config = create_test_config();
    let registry = ServiceRegistry::connect(&config)
        .await
        .expect("Failed to connect registry");
    let token = CancellationToken::new();

    let view = registry.view(&token, "user").await.expect("Failed to discover");
    assert!(view.is_empty());

    let record = ServiceRecord::new("127.0.0.1", 8080).with_scheme("https");
    let registration = registry
        .register(&token, "user", record)
        .await
        .expect("Failed to register service");

    let found = timeout(
        Duration::from_secs(10),
        view.wait_until(|v| v.len() == 1),
    )
    .await
    .expect("Timed out waiting for discovery");
    assert!(found);
    assert_eq!(view.next_address().as_deref(), Some("https://127.0.0.1:8080"));

    registration.shutdown().await;
    let removed = timeout(Duration::from_secs(10), view.wait_until(|v| v.is_empty()))
        .await
        .expect("Timed out waiting for removal");
    assert!(removed);

    token.cancel();
    registry.close().await;
}

/// 测试：租约续期
#[tokio::test]
#[ignore]
async fn test_etcd_keep_alive() {
    let config = create_test_config();
    let registry = ServiceRegistry::connect(&config)
        .await
        .expect("Failed to connect registry");
    let token = CancellationToken::new();

    let registration = registry
        .register(&token, "user", ServiceRecord::new("127.0.0.1", 8080))
        .await
        .expect("Failed to register service");
    timeout(
        Duration::from_secs(10),
        registration.wait_for(RegistrationState::Registered),
    )
    .await
    .expect("Timed out waiting for registration");

    // 超过 TTL 后仍然存在（续期成功）
    sleep(Duration::from_secs(config.ttl + 2)).await;
    let members = registry
        .backend()
        .list(&registry.service_path("user"))
        .await
        .expect("Failed to list services");
    assert!(
        members.contains_key(registration.path()),
        "Service instance not found after keep-alive"
    );

    token.cancel();
    registration.stopped().await;
    registry.close().await;
}

/// 测试：list_and_watch 的 watch 不会重放列表之前的写入
#[tokio::test]
#[ignore]
async fn test_etcd_list_and_watch_starts_after_listing() {
    use flare_service_registry::discovery::backend::{KeyEvent, Notification, WatchStream};

    let config = create_test_config();
    let backend = EtcdBackend::connect(&config)
        .await
        .expect("Failed to create etcd backend");
    let prefix = format!("/{}/service/endpoint/user", config.namespace);

    let first = backend
        .publish(&format!("{prefix}/a"), b"one")
        .await
        .expect("Failed to publish");
    let (members, mut watch) = backend
        .list_and_watch(&prefix)
        .await
        .expect("Failed to list and watch");
    assert_eq!(members.len(), 1);

    let second_path = format!("{prefix}/b");
    let second = backend
        .publish(&second_path, b"two")
        .await
        .expect("Failed to publish");

    let next = timeout(Duration::from_secs(10), watch.next())
        .await
        .expect("Timed out waiting for watch event")
        .expect("watch failed");
    match next {
        Some(Notification::Events(events)) => {
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].key(), second_path);
            assert!(matches!(events[0], KeyEvent::Put { .. }));
        }
        other => panic!("unexpected notification: {other:?}"),
    }

    backend.withdraw(&first).await.expect("Failed to withdraw");
    backend.withdraw(&second).await.expect("Failed to withdraw");
    backend.close().await;
}
