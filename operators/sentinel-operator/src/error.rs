//! Operator 错误类型
//!
//! `NotFound` 与其余错误分开：协调器把依赖对象缺失视为“等待”状态，
//! 其余错误则交给控制器的重试策略处理。

use thiserror::Error;

/// Operator 统一错误类型
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API 错误
    #[error("Kubernetes API 错误: {0}")]
    Kube(#[from] kube::Error),

    /// 对象不存在
    #[error("{kind} \"{name}\" not found")]
    NotFound { kind: String, name: String },

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 校验错误
    #[error("{0}")]
    Validation(String),

    /// 镜像解析错误
    #[error("{0}")]
    Image(String),

    /// 证书错误
    #[error("证书错误: {0}")]
    Certificate(String),

    /// 渲染错误
    #[error("渲染错误: {0}")]
    Render(String),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 共享工具错误
    #[error(transparent)]
    Common(#[from] sentinel_common::Error),

    /// 集群访问错误（非 kube 客户端产生）
    #[error("集群访问错误: {0}")]
    Api(String),
}

impl Error {
    /// 创建对象不存在错误
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// 创建配置错误
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// 创建校验错误
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// 创建证书错误
    pub fn certificate(msg: impl Into<String>) -> Self {
        Self::Certificate(msg.into())
    }

    /// 创建渲染错误
    pub fn render(msg: impl Into<String>) -> Self {
        Self::Render(msg.into())
    }

    /// 创建集群访问错误
    pub fn api(msg: impl Into<String>) -> Self {
        Self::Api(msg.into())
    }

    /// 是否为“对象不存在”
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube(kube::Error::Api(response)) => response.code == 404,
            _ => false,
        }
    }
}

/// Operator 结果类型别名
pub type Result<T> = std::result::Result<T, Error>;
