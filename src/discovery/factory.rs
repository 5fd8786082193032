//! 服务发现工厂
//!
//! 根据配置创建协调存储后端和注册中心门面

use std::sync::Arc;
use tracing::info;

use crate::config::{BackendKind, RegistryConfig};
use crate::discovery::backend::{CoordinationBackend, MemoryBackend};
use crate::error::Result;
use crate::registry::ServiceRegistry;

/// 服务发现工厂
pub struct DiscoveryFactory;

impl DiscoveryFactory {
    /// 从配置创建协调存储后端
    pub async fn create_backend(config: &RegistryConfig) -> Result<Arc<dyn CoordinationBackend>> {
        config.validate()?;
        let backend = match config.backend {
            BackendKind::Etcd => create_etcd(config).await?,
            BackendKind::Zookeeper => create_zookeeper(config).await?,
            BackendKind::Memory => {
                Arc::new(MemoryBackend::new().with_ttl(config.ttl())) as Arc<dyn CoordinationBackend>
            }
        };
        info!(
            backend = %config.backend,
            endpoints = ?config.endpoints,
            namespace = %config.namespace,
            "✅ Coordination backend created"
        );
        Ok(backend)
    }

    /// 从配置创建注册中心门面
    pub async fn create_registry(config: &RegistryConfig) -> Result<ServiceRegistry> {
        let backend = Self::create_backend(config).await?;
        Ok(ServiceRegistry::new(config.namespace.clone(), backend)
            .with_options(config.registry_options()))
    }
}

#[cfg(feature = "etcd")]
async fn create_etcd(config: &RegistryConfig) -> Result<Arc<dyn CoordinationBackend>> {
    let backend = crate::discovery::backend::EtcdBackend::connect(config).await?;
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "etcd"))]
async fn create_etcd(_config: &RegistryConfig) -> Result<Arc<dyn CoordinationBackend>> {
    Err(crate::error::RegistryError::UnsupportedBackend(
        "etcd (enable the `etcd` feature)".to_string(),
    ))
}

#[cfg(feature = "zookeeper")]
async fn create_zookeeper(config: &RegistryConfig) -> Result<Arc<dyn CoordinationBackend>> {
    let backend = crate::discovery::backend::ZookeeperBackend::connect(config).await?;
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "zookeeper"))]
async fn create_zookeeper(_config: &RegistryConfig) -> Result<Arc<dyn CoordinationBackend>> {
    Err(crate::error::RegistryError::UnsupportedBackend(
        "zookeeper (enable the `zookeeper` feature)".to_string(),
    ))
}
