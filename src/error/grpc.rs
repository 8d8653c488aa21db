//! gRPC 错误转换
//!
//! 让调用方可以直接用 `?` 把连接池错误转换为 `tonic::Status`。

use tonic::{Code, Status};

use super::GrpcExtError;
use crate::registry::RegistryError;

impl From<GrpcExtError> for Status {
    fn from(err: GrpcExtError) -> Self {
        let message = err.to_string();
        match err {
            GrpcExtError::NoAvailableEndpoint { .. } => Status::unavailable(message),
            GrpcExtError::FetchTimeout { .. } => Status::resource_exhausted(message),
            GrpcExtError::UnknownService(_) => Status::not_found(message),
            GrpcExtError::Connect { .. } => Status::unavailable(message),
            GrpcExtError::Registry(RegistryError::Transport(_)) => Status::unavailable(message),
            GrpcExtError::Config(_) => Status::failed_precondition(message),
            GrpcExtError::Registration(_)
            | GrpcExtError::RegistrarStopped
            | GrpcExtError::Registry(_) => Status::internal(message),
        }
    }
}

/// 判断 gRPC 状态码是否值得换一个节点重试
pub fn is_retryable_status(status: &Status) -> bool {
    matches!(
        status.code(),
        Code::Unavailable | Code::DeadlineExceeded | Code::ResourceExhausted
    )
}
