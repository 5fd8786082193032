//! 服务发现模块
//!
//! - [`instance`]: 服务实例记录及其编码
//! - [`snapshot`]: 成员快照
//! - [`backend`]: 协调存储后端（etcd、ZooKeeper、内存）
//! - [`watcher`]: 把后端 watch 转换为快照流
//! - [`view`]: 消费快照并轮询选择实例
//! - [`factory`]: 按配置创建后端

pub mod backend;
pub mod factory;
pub mod instance;
pub mod snapshot;
pub mod view;
pub mod watcher;

pub use backend::{CoordinationBackend, KeyEvent, Members, Notification, Presence, WatchStream};
pub use factory::DiscoveryFactory;
pub use instance::ServiceRecord;
pub use snapshot::MembershipSnapshot;
pub use view::ServiceView;
pub use watcher::Subscription;
