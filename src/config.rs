//! 服务注册发现配置
//!
//! 支持从 TOML 文件加载，并可用环境变量覆盖：
//! `REGISTRY_BACKEND`、`REGISTRY_ENDPOINTS`（逗号分隔）、`REGISTRY_NAMESPACE`、
//! `REGISTRY_TTL_SECONDS`、`REGISTRY_USERNAME`、`REGISTRY_PASSWORD`

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{RegistryError, Result};
use crate::registry::path::InstanceKey;
use crate::registry::RegistryOptions;
use crate::retry::{self, BackoffPolicy};

/// 后端类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Etcd,
    #[serde(alias = "zk")]
    Zookeeper,
    Memory,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Etcd => "etcd",
            BackendKind::Zookeeper => "zookeeper",
            BackendKind::Memory => "memory",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "etcd" => Ok(BackendKind::Etcd),
            "zookeeper" | "zk" => Ok(BackendKind::Zookeeper),
            "memory" | "mem" => Ok(BackendKind::Memory),
            _ => Err(format!("Unknown backend type: {}", s)),
        }
    }
}

/// 服务注册发现配置
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RegistryConfig {
    /// 后端类型：etcd, zookeeper, memory
    #[serde(default)]
    pub backend: BackendKind,

    /// 后端地址列表
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// 命名空间（通常是系统 ID）
    pub namespace: String,

    /// 租约 TTL（秒）
    #[serde(default = "default_ttl")]
    pub ttl: u64,

    /// 用户名（etcd 用户 / ZooKeeper digest）
    #[serde(default)]
    pub username: Option<String>,

    /// 密码
    #[serde(default)]
    pub password: Option<String>,

    /// 后端出错后的重试间隔（毫秒）
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// 配置后启用指数退避，重试间隔不超过该值（毫秒）
    #[serde(default)]
    pub max_retry_interval_ms: Option<u64>,

    /// 单次后端操作超时（毫秒）
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// 实例在注册路径中的 key
    #[serde(default)]
    pub instance_key: InstanceKey,
}

fn default_ttl() -> u64 {
    10
}

fn default_retry_interval_ms() -> u64 {
    5_000
}

fn default_operation_timeout_ms() -> u64 {
    5_000
}

impl RegistryConfig {
    /// 创建配置，其余字段使用默认值
    pub fn new(backend: BackendKind, endpoints: Vec<String>, namespace: impl Into<String>) -> Self {
        Self {
            backend,
            endpoints,
            namespace: namespace.into(),
            ttl: default_ttl(),
            username: None,
            password: None,
            retry_interval_ms: default_retry_interval_ms(),
            max_retry_interval_ms: None,
            operation_timeout_ms: default_operation_timeout_ms(),
            instance_key: InstanceKey::default(),
        }
    }

    /// 从 TOML 文件加载
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| RegistryError::config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// 从 TOML 字符串解析
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| RegistryError::config(e.to_string()))
    }

    /// 用进程环境变量覆盖
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// 用 `lookup` 提供的变量覆盖
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(backend) = lookup("REGISTRY_BACKEND") {
            self.backend = backend.parse().map_err(RegistryError::Config)?;
        }
        if let Some(endpoints) = lookup("REGISTRY_ENDPOINTS") {
            self.endpoints = endpoints
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(namespace) = lookup("REGISTRY_NAMESPACE") {
            self.namespace = namespace;
        }
        if let Some(ttl) = lookup("REGISTRY_TTL_SECONDS") {
            self.ttl = ttl
                .trim()
                .parse()
                .map_err(|_| RegistryError::config(format!("invalid REGISTRY_TTL_SECONDS: {ttl}")))?;
        }
        if let Some(username) = lookup("REGISTRY_USERNAME") {
            self.username = Some(username);
        }
        if let Some(password) = lookup("REGISTRY_PASSWORD") {
            self.password = Some(password);
        }
        Ok(self)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim_matches('/').is_empty() {
            return Err(RegistryError::config("namespace must not be empty"));
        }
        if self.ttl == 0 {
            return Err(RegistryError::config("ttl must be at least 1 second"));
        }
        if i64::try_from(self.ttl).is_err() {
            return Err(RegistryError::config(format!("ttl {} is out of range", self.ttl)));
        }
        if self.backend != BackendKind::Memory && self.endpoints.is_empty() {
            return Err(RegistryError::config(format!(
                "{} backend requires at least one endpoint",
                self.backend
            )));
        }
        Ok(())
    }

    /// 用户名和密码都配置时返回凭证
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) if !user.is_empty() => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// 构造退避策略
    pub fn backoff_policy(&self) -> BackoffPolicy {
        retry::policy_from(
            self.retry_interval(),
            self.max_retry_interval_ms.map(Duration::from_millis),
        )
    }

    /// 门面层选项
    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            backoff: self.backoff_policy(),
            instance_key: self.instance_key,
        }
    }
}
