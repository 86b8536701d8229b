//! RuntimeSecurity 协调器

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::runtime::controller::Action;
use std::sync::Arc;
use tracing::info;

use super::utils::{self, ComponentHandler};
use super::watches::{common_targets, named_in, WatchTarget};
use super::{
    certificate_manager, imageset, mark_ready, or_degrade, require, require_present, Context,
    Reconciler,
};
use crate::certificates::CA_SECRET_NAME;
use crate::crd::RuntimeSecurity;
use crate::error::Result;
use crate::render::elasticsearch::{CLUSTER_CONFIG_CONFIG_MAP_NAME, PUBLIC_CERT_SECRET};
use crate::render::runtime_security::{
    RuntimeSecurityComponent, RuntimeSecurityConfig, SASHA_ES_USER_SECRET,
};
use crate::render::OsType;
use crate::status::StatusManager;

pub const NAME: &str = "runtimesecurity";

pub struct RuntimeSecurityReconciler {
    context: Arc<Context>,
    status: Arc<dyn StatusManager>,
}

impl RuntimeSecurityReconciler {
    pub fn new(context: Arc<Context>, status: Arc<dyn StatusManager>) -> Self {
        Self { context, status }
    }
}

#[async_trait]
impl Reconciler for RuntimeSecurityReconciler {
    type Resource = RuntimeSecurity;

    fn name(&self) -> &'static str {
        NAME
    }

    fn watches(&self) -> Vec<WatchTarget> {
        let namespace = &self.context.options.operator_namespace;
        let mut targets = common_targets();
        targets.extend(named_in::<Secret>(
            namespace,
            &[SASHA_ES_USER_SECRET, PUBLIC_CERT_SECRET, CA_SECRET_NAME],
        ));
        targets.extend(named_in::<ConfigMap>(namespace, &[CLUSTER_CONFIG_CONFIG_MAP_NAME]));
        targets
    }

    async fn reconcile(&self) -> Result<Action> {
        let client = self.context.client.as_ref();
        let status = self.status.as_ref();
        let namespace = self.context.options.operator_namespace.as_str();

        let runtime_security = or_degrade(
            status,
            "Error querying for RuntimeSecurity",
            utils::get_feature::<RuntimeSecurity>(client).await,
        )
        .await?;
        let Some(runtime_security) = runtime_security else {
            info!("RuntimeSecurity 不存在");
            status.on_cr_not_found().await;
            return Ok(Action::await_change());
        };
        status.on_cr_found().await;

        let Some(installation) = utils::get_enterprise_installation(client, status).await? else {
            return Ok(Action::await_change());
        };
        if !utils::check_license_ready(&self.context.license_ready, status).await {
            return Ok(Action::await_change());
        }
        let installation = installation.effective_spec();

        let pull_secrets = or_degrade(
            status,
            "Error retrieving pull secrets",
            utils::get_pull_secrets(client, &installation, namespace).await,
        )
        .await?;

        let Some(es_cluster_config) = require(
            status,
            utils::get_elasticsearch_cluster_config(client, namespace).await,
            "Elasticsearch cluster configuration is not available, waiting for it to become available",
            "Failed to get the elasticsearch cluster configuration",
        )
        .await?
        else {
            return Ok(Action::await_change());
        };

        let Some(sasha_es_secrets) = require(
            status,
            utils::get_elasticsearch_secrets(client, &[SASHA_ES_USER_SECRET], namespace).await,
            "Elasticsearch secrets are not available yet, waiting until they become available",
            "Failed to get Elasticsearch credentials",
        )
        .await?
        else {
            return Ok(Action::await_change());
        };

        let Some(certificate_manager) = certificate_manager(&self.context, status).await? else {
            return Ok(Action::await_change());
        };
        let Some(gateway_certificate) = require_present(
            status,
            certificate_manager
                .get_certificate(client, PUBLIC_CERT_SECRET, namespace)
                .await,
            "Elasticsearch gateway certificate are not available yet, waiting until they become available",
            &format!("Failed to retrieve / validate {}", PUBLIC_CERT_SECRET),
        )
        .await?
        else {
            return Ok(Action::await_change());
        };
        let trusted_bundle = certificate_manager.create_trusted_bundle(&[&gateway_certificate]);

        let mut component = RuntimeSecurityComponent::new(RuntimeSecurityConfig {
            pull_secrets,
            installation,
            os_type: OsType::Linux,
            sasha_es_secrets,
            es_cluster_config,
            cluster_domain: self.context.options.cluster_domain.clone(),
            trusted_bundle,
            spec: runtime_security.spec.clone(),
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
                .with_owner(&runtime_security)
                .create_or_update_or_delete(&component)
                .await,
        )
        .await?;

        mark_ready(client, status, &runtime_security).await
    }
}
