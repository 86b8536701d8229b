//! APIServer 协调器
//!
//! 聚合 API Server 提供 `projectcalico.org/v3` 资源（包括 LicenseKey），
//! 因此它不等待 License API 就绪。

use async_trait::async_trait;
use kube::runtime::controller::Action;
use std::sync::Arc;
use tracing::info;

use super::utils::{self, ComponentHandler};
use super::watches::{common_targets, WatchTarget};
use super::{imageset, mark_ready, or_degrade, Context, Reconciler};
use crate::crd::APIServer;
use crate::error::Result;
use crate::render::api_server::{ApiServerComponent, ApiServerConfig};
use crate::status::StatusManager;

pub const NAME: &str = "apiserver";

pub struct ApiServerReconciler {
    context: Arc<Context>,
    status: Arc<dyn StatusManager>,
}

impl ApiServerReconciler {
    pub fn new(context: Arc<Context>, status: Arc<dyn StatusManager>) -> Self {
        Self { context, status }
    }
}

#[async_trait]
impl Reconciler for ApiServerReconciler {
    type Resource = APIServer;

    fn name(&self) -> &'static str {
        NAME
    }

    fn watches(&self) -> Vec<WatchTarget> {
        common_targets()
    }

    async fn reconcile(&self) -> Result<Action> {
        let client = self.context.client.as_ref();
        let status = self.status.as_ref();

        let api_server = or_degrade(
            status,
            "Error querying for APIServer",
            utils::get_feature::<APIServer>(client).await,
        )
        .await?;
        let Some(api_server) = api_server else {
            info!("APIServer 不存在");
            status.on_cr_not_found().await;
            return Ok(Action::await_change());
        };
        status.on_cr_found().await;

        let Some(installation) = utils::get_enterprise_installation(client, status).await? else {
            return Ok(Action::await_change());
        };
        let installation = installation.effective_spec();

        let pull_secrets = or_degrade(
            status,
            "Error retrieving pull secrets",
            utils::get_pull_secrets(client, &installation, &self.context.options.operator_namespace)
                .await,
        )
        .await?;

        let mut component = ApiServerComponent::new(ApiServerConfig {
            pull_secrets,
            installation,
        });
        or_degrade(
            status,
            "Error with images from ImageSet",
            imageset::apply_image_set(client, &mut [&mut component]).await,
        )
        .await?;

        or_degrade(
            status,
            "Error creating / updating resource",
            ComponentHandler::new(client, status)
                .with_owner(&api_server)
                .create_or_update_or_delete(&component)
                .await,
        )
        .await?;

        mark_ready(client, status, &api_server).await
    }
}
