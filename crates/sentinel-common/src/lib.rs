//! Sentinel Common - 跨模块共享工具与数据结构
//!
//! 该模块提供 Sentinel Operator 使用的纯逻辑工具：组件镜像目录与镜像引用解析、
//! 云配置解析、注解哈希以及统一的错误处理机制。这里不依赖 Kubernetes 客户端。

pub mod cloud_config;
pub mod error;
pub mod hash;
pub mod images;

/// 重新导出常用类型，方便使用
pub use cloud_config::CloudConfig;
pub use error::Error;
pub use error::Result;
pub use images::{ComponentImage, ImageDigests};
