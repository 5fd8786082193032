//! Flare Service Registry
//!
//! 服务注册与发现：实例通过可过期的注册（etcd 租约 / ZooKeeper 临时节点）宣告存活，
//! 消费方通过 watch 获得完整成员快照，并在本地轮询选择实例。
//!
//! ```no_run
//! use flare_service_registry::{BackendKind, RegistryConfig, ServiceRecord, ServiceRegistry};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> flare_service_registry::Result<()> {
//! let config = RegistryConfig::new(
//!     BackendKind::Etcd,
//!     vec!["http://127.0.0.1:2379".to_string()],
//!     "crm",
//! );
//! let registry = ServiceRegistry::connect(&config).await?;
//! let token = CancellationToken::new();
//!
//! let record = ServiceRecord::new("127.0.0.1", 8080).with_scheme("https");
//! registry.register(&token, "user", record).await?;
//!
//! let view = registry.view(&token, "user").await?;
//! if let Some(address) = view.next_address() {
//!     println!("calling {address}");
//! }
//!
//! token.cancel();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod registry;
pub mod retry;
pub mod telemetry;

// Re-exports
pub use config::{BackendKind, RegistryConfig};
pub use discovery::backend::{MemoryBackend, WatchMode};
#[cfg(feature = "etcd")]
pub use discovery::backend::EtcdBackend;
#[cfg(feature = "zookeeper")]
pub use discovery::backend::ZookeeperBackend;
pub use discovery::{
    CoordinationBackend, DiscoveryFactory, MembershipSnapshot, ServiceRecord, ServiceView,
    Subscription,
};
pub use error::{BackendError, RegistryError, Result};
pub use registry::{
    InstanceKey, Registration, RegistrationState, RegistryOptions, ServiceRegistry,
};
pub use retry::{Backoff, BackoffPolicy, ExponentialBackoff, FixedBackoff};
