//! 管理服务器错误定义

use thiserror::Error;

/// 管理服务器错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VimError {
    #[error("HTTP 错误: {0}")]
    HttpError(String),

    #[error("认证错误: {0}")]
    AuthError(String),

    #[error("API 错误 [{0}]: {1}")]
    ApiError(u16, String),

    #[error("解析错误: {0}")]
    ParseError(String),

    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("资源不存在: {0}")]
    NotFound(String),

    #[error("服务器拒绝操作: {0}")]
    Fault(String),

    #[error("非法的数据存储路径: {0}")]
    InvalidPath(String),
}

/// 管理服务器结果类型
pub type Result<T> = std::result::Result<T, VimError>;
