//! 服务注册中心门面
//!
//! 调用方只与 [`ServiceRegistry`] 交互：
//! - `register` 启动注册维护器，立即返回，不等待注册在后端可见；
//! - `discover` 启动发现监听器，返回快照订阅；
//! - `view` 在订阅之上构建轮询选择的 [`ServiceView`]。
//!
//! 每个注册/订阅由一个 `CancellationToken` 控制生命周期，取消即注销/停止。

pub mod maintainer;
pub mod path;

pub use maintainer::{Registration, RegistrationState};
pub use path::{InstanceKey, instance_path, service_path};

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RegistryConfig;
use crate::discovery::backend::CoordinationBackend;
use crate::discovery::factory::DiscoveryFactory;
use crate::discovery::instance::ServiceRecord;
use crate::discovery::view::ServiceView;
use crate::discovery::watcher::{Subscription, Watcher};
use crate::error::Result;
use crate::retry::{self, BackoffPolicy};
use maintainer::Maintainer;

/// 门面层选项
#[derive(Clone)]
pub struct RegistryOptions {
    /// 后端出错后的退避策略
    pub backoff: BackoffPolicy,
    /// 实例在注册路径中的 key
    pub instance_key: InstanceKey,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            backoff: retry::policy_from(retry::DEFAULT_RETRY_INTERVAL, None),
            instance_key: InstanceKey::default(),
        }
    }
}

impl std::fmt::Debug for RegistryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryOptions")
            .field("instance_key", &self.instance_key)
            .finish_non_exhaustive()
    }
}

/// 服务注册中心
///
/// `Clone` 共享同一个后端连接
#[derive(Clone)]
pub struct ServiceRegistry {
    backend: Arc<dyn CoordinationBackend>,
    namespace: String,
    options: RegistryOptions,
}

impl ServiceRegistry {
    /// 使用已有后端创建注册中心
    pub fn new(namespace: impl Into<String>, backend: Arc<dyn CoordinationBackend>) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
            options: RegistryOptions::default(),
        }
    }

    /// 设置选项
    pub fn with_options(mut self, options: RegistryOptions) -> Self {
        self.options = options;
        self
    }

    /// 按配置连接后端并创建注册中心
    pub async fn connect(config: &RegistryConfig) -> Result<Self> {
        DiscoveryFactory::create_registry(config).await
    }

    /// 命名空间
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// 底层后端
    pub fn backend(&self) -> &Arc<dyn CoordinationBackend> {
        &self.backend
    }

    /// 服务路径（监听前缀），纯字符串拼接
    pub fn service_path(&self, service_id: &str) -> String {
        service_path(&self.namespace, service_id)
    }

    /// 实例的注册路径
    pub fn instance_path(&self, service_id: &str, record: &ServiceRecord) -> String {
        instance_path(
            &self.namespace,
            service_id,
            &self.options.instance_key.key_for(record),
        )
    }

    /// 注册服务实例
    ///
    /// 只返回序列化错误；注册在后台维护，`token` 取消时删除注册
    pub async fn register(
        &self,
        token: &CancellationToken,
        service_id: &str,
        record: ServiceRecord,
    ) -> Result<Registration> {
        let path = self.instance_path(service_id, &record);
        let payload = record.encode()?;
        info!(
            service_id = %service_id,
            path = %path,
            address = %record.address(),
            "Registering service instance"
        );
        Ok(Maintainer::spawn(
            self.backend.clone(),
            path,
            payload,
            self.options.backoff.clone(),
            token,
        ))
    }

    /// 订阅 `path` 下的成员快照
    ///
    /// 首次拉取在当前调用中完成，遇到不可重试的错误（路径非法、后端已关闭）直接返回
    pub async fn discover(&self, token: &CancellationToken, path: &str) -> Result<Subscription> {
        debug!(path = %path, "Starting discovery");
        let subscription = Watcher::start(
            self.backend.clone(),
            path.to_string(),
            self.options.backoff.clone(),
            token,
        )
        .await?;
        Ok(subscription)
    }

    /// 订阅服务并构建轮询视图
    pub async fn view(&self, token: &CancellationToken, service_id: &str) -> Result<ServiceView> {
        let subscription = self.discover(token, &self.service_path(service_id)).await?;
        Ok(ServiceView::spawn(subscription))
    }

    /// 关闭后端连接
    ///
    /// 之后仍在运行的注册和订阅会结束
    pub async fn close(&self) {
        self.backend.close().await;
        info!(namespace = %self.namespace, backend = %self.backend.kind(), "🛑 Service registry closed");
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("backend", &self.backend.kind())
            .field("namespace", &self.namespace)
            .field("options", &self.options)
            .finish()
    }
}
