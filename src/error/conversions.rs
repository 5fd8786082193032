//! 错误类型转换实现
//!
//! 把各后端客户端库的错误映射到 [`BackendError`] 分类

use super::BackendError;

impl From<tokio::time::error::Elapsed> for BackendError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        BackendError::Unavailable("operation deadline elapsed".to_string())
    }
}

#[cfg(feature = "etcd")]
impl From<etcd_client::Error> for BackendError {
    fn from(err: etcd_client::Error) -> Self {
        match err {
            etcd_client::Error::GRpcStatus(status) => {
                let message = status.message().to_string();
                match status.code() {
                    tonic::Code::Unauthenticated | tonic::Code::PermissionDenied => {
                        BackendError::Unauthorized(message)
                    }
                    // 租约已被回收或过期
                    tonic::Code::NotFound if message.contains("lease") => {
                        BackendError::SessionExpired(message)
                    }
                    tonic::Code::InvalidArgument if message.contains("auth token") => {
                        BackendError::Unauthorized(message)
                    }
                    tonic::Code::InvalidArgument => BackendError::InvalidPath(message),
                    _ => BackendError::Unavailable(message),
                }
            }
            etcd_client::Error::InvalidArgs(msg) => BackendError::InvalidPath(msg),
            other => BackendError::Unavailable(other.to_string()),
        }
    }
}

#[cfg(feature = "zookeeper")]
impl From<zookeeper_client::Error> for BackendError {
    fn from(err: zookeeper_client::Error) -> Self {
        use zookeeper_client::Error;

        match err {
            Error::NoAuth | Error::AuthFailed => BackendError::Unauthorized(err.to_string()),
            Error::SessionExpired => BackendError::SessionExpired(err.to_string()),
            Error::NodeExists => BackendError::NodeExists(err.to_string()),
            Error::NoNode => BackendError::NotFound(err.to_string()),
            Error::BadArguments(msg) => BackendError::InvalidPath(msg.to_string()),
            Error::ClientClosed => BackendError::SessionExpired(err.to_string()),
            other => BackendError::Unavailable(other.to_string()),
        }
    }
}
