//! 服务注册发现错误处理模块
//!
//! 区分两类错误：
//! - [`BackendError`]: 协调存储（etcd / ZooKeeper / 内存）上报的错误，决定重试策略
//! - [`RegistryError`]: 门面层（`ServiceRegistry`）返回给调用方的错误

pub mod backend;
pub mod conversions;

pub use backend::{BackendError, BackendResult};

use thiserror::Error;

/// 服务注册发现统一错误类型
#[derive(Error, Debug)]
pub enum RegistryError {
    /// 服务记录序列化/反序列化失败（编程错误，不重试）
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 协调存储错误
    #[error("后端错误: {0}")]
    Backend(#[from] BackendError),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 后端类型未编译进当前构建（对应 feature 未启用）
    #[error("不支持的后端: {0}")]
    UnsupportedBackend(String),
}

impl RegistryError {
    /// 创建配置错误
    pub fn config(msg: impl Into<String>) -> Self {
        RegistryError::Config(msg.into())
    }

    /// 判断是否为可重试的错误
    pub fn is_retryable(&self) -> bool {
        match self {
            RegistryError::Backend(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, RegistryError>;
