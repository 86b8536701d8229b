//! 错误处理模块
//!
//! 该模块提供 Sentinel 共享工具的统一错误类型，覆盖镜像引用解析、
//! 云配置解析以及序列化失败等场景。

use thiserror::Error;

/// Sentinel 共享错误类型
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 镜像引用错误
    #[error("{0}")]
    Image(String),

    /// 校验错误
    #[error("校验错误: {0}")]
    Validation(String),

    /// JSON 错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// 创建配置错误
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// 创建镜像引用错误
    pub fn image(msg: impl Into<String>) -> Self {
        Self::Image(msg.into())
    }

    /// 创建校验错误
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

/// Sentinel 共享结果类型别名
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_error_keeps_message_verbatim() {
        let err = Error::image("ImageSet did not contain image tigera/sasha");
        assert_eq!(err.to_string(), "ImageSet did not contain image tigera/sasha");
    }

    #[test]
    fn test_config_error_display() {
        let err = Error::config("'tenantId' is not set");
        assert_eq!(err.to_string(), "配置错误: 'tenantId' is not set");
    }
}
