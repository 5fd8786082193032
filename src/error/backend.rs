//! 协调存储错误分类

use thiserror::Error;

/// 协调存储上报的错误
///
/// 维护器（Maintainer）和监听器（Watcher）只根据分类决定下一步：
/// 瞬时错误退避重试，认证错误先重新认证，会话过期先重建会话。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// 网络抖动、暂时不可用
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// 单次操作超时
    #[error("backend operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// 认证失败或凭证过期
    #[error("backend rejected credentials: {0}")]
    Unauthorized(String),

    /// 会话已失效（ZooKeeper 会话过期，etcd 租约丢失）
    #[error("backend session expired: {0}")]
    SessionExpired(String),

    /// 目标节点不存在
    #[error("node not found: {0}")]
    NotFound(String),

    /// 目标节点已存在
    #[error("node already exists: {0}")]
    NodeExists(String),

    /// 路径不合法
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// 客户端已关闭
    #[error("backend closed")]
    Closed,

    /// 其他错误
    #[error("backend error: {0}")]
    Other(String),
}

impl BackendError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        BackendError::Unavailable(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        BackendError::Unauthorized(msg.into())
    }

    pub fn session_expired(msg: impl Into<String>) -> Self {
        BackendError::SessionExpired(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        BackendError::Other(msg.into())
    }

    /// 是否属于可直接退避重试的错误
    ///
    /// 认证和会话错误也会重试，但需要先执行 `reauthenticate`。
    pub fn is_transient(&self) -> bool {
        !matches!(self, BackendError::InvalidPath(_) | BackendError::Closed)
    }

    /// 后端已被显式关闭，重试没有意义
    pub fn is_terminal(&self) -> bool {
        matches!(self, BackendError::Closed)
    }

    /// 是否需要重新认证（或重建会话）后再重试
    pub fn needs_reauth(&self) -> bool {
        matches!(
            self,
            BackendError::Unauthorized(_) | BackendError::SessionExpired(_)
        )
    }
}

/// 后端操作结果类型
pub type BackendResult<T> = std::result::Result<T, BackendError>;
