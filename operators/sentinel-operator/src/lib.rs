//! Sentinel Operator - Kubernetes Operator 管理 Sentinel 安全附加组件
//!
//! 该 Operator 负责部署与维护运行时安全、镜像保障、聚合 API Server、
//! 外部日志存储与 Manager 等组件，并通过 `TigeraStatus` 报告各组件的状态。

pub mod certificates;
pub mod client;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod event_handler;
pub mod render;
pub mod status;

use kube::Client;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::OperatorOptions;
use crate::error::Result;

/// Operator 主结构体
pub struct SentinelOperator {
    /// Kubernetes 客户端
    client: Client,
    /// 控制器
    controller: Arc<RwLock<controller::Controller>>,
}

impl SentinelOperator {
    /// 创建新的 Operator 实例
    pub async fn new(options: OperatorOptions) -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::with_client(client, options))
    }

    /// 使用已有客户端创建 Operator
    pub fn with_client(client: Client, options: OperatorOptions) -> Self {
        info!(
            "Operator 命名空间 {}，集群域名 {}",
            options.operator_namespace, options.cluster_domain
        );
        let controller = Arc::new(RwLock::new(controller::Controller::new(
            client.clone(),
            options,
        )));

        Self { client, controller }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// 启动 Operator
    pub async fn start(&self) -> Result<()> {
        self.controller.write().await.start().await
    }

    /// 停止 Operator
    pub async fn stop(&self) -> Result<()> {
        self.controller.write().await.stop().await
    }

    pub async fn is_running(&self) -> bool {
        self.controller.read().await.is_running().await
    }
}
