//! 协调存储后端抽象和实现
//!
//! 注册维护器和发现监听器只依赖 [`CoordinationBackend`]，租约、临时节点、会话等
//! 后端特有机制全部封装在各自实现中：
//! - **etcd**: 租约 + key-value，watch 上报逐个 key 的 put/delete 事件（增量）
//! - **ZooKeeper**: 临时节点，watch 只上报“子节点变化”且为一次性（非增量）
//! - **memory**: 进程内实现，语义与上面两者一致，并支持故障注入

#[cfg(feature = "etcd")]
pub mod etcd;
pub mod memory;
#[cfg(feature = "zookeeper")]
pub mod zookeeper;

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::config::BackendKind;
use crate::error::BackendResult;

#[cfg(feature = "etcd")]
pub use etcd::EtcdBackend;
pub use memory::{MemoryBackend, WatchMode};
#[cfg(feature = "zookeeper")]
pub use zookeeper::ZookeeperBackend;

/// 前缀下的成员：完整路径 -> 原始记录
pub type Members = BTreeMap<String, Vec<u8>>;

/// 存活标记（presence artifact）句柄
///
/// 由 `publish` 创建，只归创建它的注册维护器所有
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presence {
    /// 注册路径
    pub path: String,
    /// 租约 ID（etcd / memory），临时节点后端为 None
    pub lease_id: Option<i64>,
}

impl Presence {
    /// 依附于会话的存活标记（ZooKeeper 临时节点）
    pub fn ephemeral(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            lease_id: None,
        }
    }

    /// 依附于租约的存活标记
    pub fn leased(path: impl Into<String>, lease_id: i64) -> Self {
        Self {
            path: path.into(),
            lease_id: Some(lease_id),
        }
    }
}

/// 单个 key 的变化事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyEvent {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl KeyEvent {
    pub fn key(&self) -> &str {
        match self {
            KeyEvent::Put { key, .. } | KeyEvent::Delete { key } => key,
        }
    }
}

/// watch 通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// 增量事件，可直接应用到本地成员表
    Events(Vec<KeyEvent>),
    /// 只知道“有变化”，需要重新拉取完整列表
    ChildrenChanged,
}

/// 已安装的 watch
#[async_trait]
pub trait WatchStream: Send {
    /// 等待下一条通知
    ///
    /// 返回 `Ok(None)` 表示 watch 已失效（一次性 watch 已触发或服务端关闭了流），
    /// 调用方需要重新安装
    async fn next(&mut self) -> BackendResult<Option<Notification>>;
}

/// 协调存储后端 trait
///
/// 注意：由于需要动态分发（dyn），使用 async-trait
#[async_trait]
pub trait CoordinationBackend: Send + Sync {
    /// 后端类型
    fn kind(&self) -> BackendKind;

    /// 在 `path` 创建存活标记并写入 `payload`
    ///
    /// - **etcd**: 申请租约，带租约写入 key
    /// - **ZooKeeper**: 补齐父节点后创建临时节点（本会话残留的同路径节点会被替换，
    ///   其他会话持有时返回 `NodeExists`）
    async fn publish(&self, path: &str, payload: &[u8]) -> BackendResult<Presence>;

    /// 保持存活标记
    ///
    /// 一直运行直到检测到标记丢失（租约过期、节点被删除、会话失效）时返回 `Ok(())`，
    /// 续期失败时返回错误。调用方通过 drop 该 future 停止续期。
    async fn sustain(&self, presence: &Presence) -> BackendResult<()>;

    /// 主动删除存活标记
    async fn withdraw(&self, presence: &Presence) -> BackendResult<()>;

    /// 列出 `prefix` 下的全部成员
    ///
    /// 前缀不存在时返回空集合
    async fn list(&self, prefix: &str) -> BackendResult<Members>;

    /// 在 `prefix` 上安装 watch
    async fn watch(&self, prefix: &str) -> BackendResult<Box<dyn WatchStream>>;

    /// 先安装 watch 再列出成员
    ///
    /// 返回的 watch 只包含列表之后的变化。增量后端应当覆盖默认实现，
    /// 把 watch 的起点固定在列表的版本之后
    async fn list_and_watch(
        &self,
        prefix: &str,
    ) -> BackendResult<(Members, Box<dyn WatchStream>)> {
        let stream = self.watch(prefix).await?;
        let members = self.list(prefix).await?;
        Ok((members, stream))
    }

    /// 重新认证（或重建会话）
    async fn reauthenticate(&self) -> BackendResult<()> {
        Ok(())
    }

    /// 释放连接和会话
    async fn close(&self) {}
}

/// 前缀下直接子路径的公共前缀（带结尾 `/`）
pub(crate) fn child_prefix(prefix: &str) -> String {
    format!("{}/", prefix.trim_end_matches('/'))
}
