//! 注册路径
//!
//! 服务前缀：`/{namespace}/service/endpoint/{serviceId}`
//! 实例路径：`/{namespace}/service/endpoint/{serviceId}/{instanceKey}`

use serde::{Deserialize, Serialize};

use crate::discovery::instance::ServiceRecord;

/// 服务根路径
pub const ROOT_PATH: &str = "service/endpoint";

/// 实例在注册路径中的 key
///
/// 只用 IP 时，同一主机上不同端口的两个实例会写到同一路径，后注册的覆盖先注册的。
/// 同机多实例部署应使用 `IpPort` 或 `InstanceId`。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstanceKey {
    /// `192.168.2.1`
    #[default]
    Ip,
    /// `192.168.2.1:8080`
    IpPort,
    /// 实例 ID
    InstanceId,
}

impl InstanceKey {
    /// 计算记录的 key
    pub fn key_for(&self, record: &ServiceRecord) -> String {
        match self {
            InstanceKey::Ip => record.ip.clone(),
            InstanceKey::IpPort => format!("{}:{}", record.ip, record.port),
            InstanceKey::InstanceId => record.instance_id.clone(),
        }
    }
}

/// 服务路径，监听和列举都使用这个前缀
pub fn service_path(namespace: &str, service_id: &str) -> String {
    format!("/{}/{}/{}", namespace.trim_matches('/'), ROOT_PATH, service_id)
}

/// 单个实例的注册路径
pub fn instance_path(namespace: &str, service_id: &str, key: &str) -> String {
    format!("{}/{}", service_path(namespace, service_id), key)
}
