//! 中继错误类型
//!
//! 所有上传/下载路径的错误最终都归入 [`RelayError`]，并在 HTTP 层映射为状态码。

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// 下载端看到的统一提示，不区分“从未存在”和“已被使用”
pub const INVALID_CODE_MESSAGE: &str = "Invalid invite code";

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// 请求本身不合法（缺少文件字段、表单损坏等）
    #[error("{0}")]
    Validation(String),

    #[error("File exceeds the maximum size of {limit} bytes")]
    PayloadTooLarge { limit: u64 },

    /// 未知、过期或已被领取的邀请码
    #[error("Invalid invite code")]
    NotFound,

    /// 对端不可达或传输中断
    #[error("Transfer failed: {0}")]
    TransferFailure(String),

    #[error("No free invite code available")]
    ExhaustedKeyspace,

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::Validation(_) | RelayError::NotFound => StatusCode::BAD_REQUEST,
            RelayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            RelayError::TransferFailure(_) | RelayError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            RelayError::ExhaustedKeyspace => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<std::convert::Infallible> for RelayError {
    fn from(never: std::convert::Infallible) -> Self {
        match never {}
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}
