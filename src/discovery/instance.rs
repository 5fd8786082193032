//! 服务实例记录定义

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use crate::error::Result;

/// 服务实例记录
///
/// 描述一个正在运行的实例，序列化后原样交给协调存储，后端不解析其内容。
/// 记录只有在其注册路径存活时才有意义。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ServiceRecord {
    /// 实例 IP
    pub ip: String,

    /// 实例端口（兼容旧部署中以字符串写入的端口）
    #[serde(deserialize_with = "deserialize_port")]
    pub port: u16,

    /// 协议，比如 https
    #[serde(alias = "schema")]
    pub scheme: String,

    /// 实例 ID（不透明）
    #[serde(rename = "instanceId", alias = "uuid", default)]
    pub instance_id: String,
}

impl ServiceRecord {
    /// 创建新的服务记录（默认 http 协议，随机实例 ID）
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            scheme: "http".to_string(),
            instance_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// 设置协议
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// 设置实例 ID
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    /// 服务地址：`scheme://ip:port`
    pub fn address(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.ip, self.port)
    }

    /// 编码为写入后端的字节
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// 从后端字节解码
    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

impl fmt::Display for ServiceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.address(), self.instance_id)
    }
}

fn deserialize_port<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid port: {text:?}"))),
    }
}
