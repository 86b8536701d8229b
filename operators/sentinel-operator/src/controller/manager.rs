//! Manager 协调器
//!
//! 启用镜像保障时，Manager 需要镜像保障 API 的证书与配置；使用外部
//! Elasticsearch 时还需要云配置中的租户 ID；云端 RBAC API 证书存在时
//! 一并启用 RBAC API 代理。

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::runtime::controller::Action;
use sentinel_common::cloud_config::CLOUD_CONFIG_CONFIG_MAP_NAME;
use std::sync::Arc;
use tracing::{debug, info};

use super::utils::{self, ComponentHandler};
use super::watches::{common_targets, named_in, WatchTarget};
use super::{
    certificate_manager, imageset, mark_ready, or_degrade, require, require_present, Context,
    Reconciler,
};
use crate::certificates::CA_SECRET_NAME;
use crate::client;
use crate::crd::{ImageAssurance, Manager, DEFAULT_INSTANCE_NAME};
use crate::certificates::TLS_CERT_KEY;
use crate::error::{Error, Result};
use crate::render::image_assurance::{API_CERT_SECRET_NAME, CONFIG_CONFIG_MAP_NAME};
use crate::render::manager::{
    CloudRbacResources, ImageAssuranceResources, ManagerCloudResources, ManagerComponent,
    ManagerConfig, CLOUD_RBAC_TLS_SECRET_NAME, MANAGER_TLS_SECRET_NAME,
};
use crate::status::StatusManager;

pub const NAME: &str = "manager";

pub struct ManagerReconciler {
    context: Arc<Context>,
    status: Arc<dyn StatusManager>,
}

impl ManagerReconciler {
    pub fn new(context: Arc<Context>, status: Arc<dyn StatusManager>) -> Self {
        Self { context, status }
    }

    /// 读取镜像保障相关资源
    ///
    /// 外层 `None` 表示仍在等待依赖；内层 `None` 表示未启用镜像保障。
    async fn image_assurance_resources(
        &self,
    ) -> Result<Option<Option<ImageAssuranceResources>>> {
        let client = self.context.client.as_ref();
        let status = self.status.as_ref();
        let namespace = self.context.options.operator_namespace.as_str();

        let image_assurance = or_degrade(
            status,
            "failed to check for Image Assurance existence",
            utils::get_feature::<ImageAssurance>(client).await,
        )
        .await?;
        if image_assurance.is_none() {
            debug!("未启用镜像保障");
            return Ok(Some(None));
        }

        let Some(tls_secret) = require(
            status,
            client::get::<Secret>(client, Some(namespace), API_CERT_SECRET_NAME).await,
            &format!("waiting for secret '{}' to become available", API_CERT_SECRET_NAME),
            &format!("Failed to retrieve secret {}", API_CERT_SECRET_NAME),
        )
        .await?
        else {
            return Ok(None);
        };

        let Some(config_map) = require(
            status,
            client::get::<ConfigMap>(client, Some(namespace), CONFIG_CONFIG_MAP_NAME).await,
            &format!("waiting for configmap '{}' to become available", CONFIG_CONFIG_MAP_NAME),
            &format!("failed to retrieve configmap: {}", CONFIG_CONFIG_MAP_NAME),
        )
        .await?
        else {
            return Ok(None);
        };

        Ok(Some(Some(ImageAssuranceResources {
            tls_secret,
            config_map,
        })))
    }

    /// 读取云端 RBAC API 证书，不存在时不启用该功能
    async fn cloud_rbac_resources(&self) -> Result<Option<CloudRbacResources>> {
        let client = self.context.client.as_ref();
        let status = self.status.as_ref();
        let namespace = self.context.options.operator_namespace.as_str();

        let secret = or_degrade(
            status,
            &format!("Failed to retrieve secret {}", CLOUD_RBAC_TLS_SECRET_NAME),
            client::get_opt::<Secret>(client, Some(namespace), CLOUD_RBAC_TLS_SECRET_NAME).await,
        )
        .await?;
        let Some(secret) = secret else {
            debug!("未启用云端 RBAC API");
            return Ok(None);
        };

        let has_certificate = secret
            .data
            .as_ref()
            .and_then(|data| data.get(TLS_CERT_KEY))
            .map_or(false, |cert| !cert.0.is_empty());
        if !has_certificate {
            let err = Error::certificate(format!(
                "secret {} does not contain {}",
                CLOUD_RBAC_TLS_SECRET_NAME, TLS_CERT_KEY
            ));
            status
                .set_degraded(
                    &format!("Invalid secret {}", CLOUD_RBAC_TLS_SECRET_NAME),
                    &err.to_string(),
                )
                .await;
            return Err(err);
        }

        Ok(Some(CloudRbacResources::new(secret)))
    }
}

#[async_trait]
impl Reconciler for ManagerReconciler {
    type Resource = Manager;

    fn name(&self) -> &'static str {
        NAME
    }

    fn watches(&self) -> Vec<WatchTarget> {
        let namespace = &self.context.options.operator_namespace;
        let mut targets = common_targets();
        targets.extend(named_in::<Secret>(
            namespace,
            &[
                MANAGER_TLS_SECRET_NAME,
                API_CERT_SECRET_NAME,
                CA_SECRET_NAME,
                CLOUD_RBAC_TLS_SECRET_NAME,
            ],
        ));
        targets.extend(named_in::<ConfigMap>(
            namespace,
            &[CONFIG_CONFIG_MAP_NAME, CLOUD_CONFIG_CONFIG_MAP_NAME],
        ));
        targets.push(WatchTarget::named::<ImageAssurance>(None, DEFAULT_INSTANCE_NAME));
        targets
    }

    async fn reconcile(&self) -> Result<Action> {
        let client = self.context.client.as_ref();
        let status = self.status.as_ref();
        let options = &self.context.options;
        let namespace = options.operator_namespace.as_str();

        let manager = or_degrade(
            status,
            "Error querying for Manager",
            utils::get_feature::<Manager>(client).await,
        )
        .await?;
        let Some(manager) = manager else {
            info!("Manager 不存在");
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

        let Some(certificate_manager) = certificate_manager(&self.context, status).await? else {
            return Ok(Action::await_change());
        };
        let Some(tls_key_pair) = require_present(
            status,
            certificate_manager
                .get_certificate(client, MANAGER_TLS_SECRET_NAME, namespace)
                .await,
            &format!("Waiting for secret '{}' to become available", MANAGER_TLS_SECRET_NAME),
            &format!("Failed to retrieve secret {}", MANAGER_TLS_SECRET_NAME),
        )
        .await?
        else {
            return Ok(Action::await_change());
        };

        let Some(image_assurance) = self.image_assurance_resources().await? else {
            return Ok(Action::await_change());
        };

        let cloud_rbac = self.cloud_rbac_resources().await?;

        let mut cloud = ManagerCloudResources {
            tenant_id: None,
            image_assurance,
            cloud_rbac,
        };
        if options.elastic_external {
            let Some(cloud_config) = require(
                status,
                utils::get_cloud_config(client, namespace).await,
                "Failed to retrieve External Elasticsearch config map",
                "Unable to read cloud config map",
            )
            .await?
            else {
                return Ok(Action::await_change());
            };
            cloud.tenant_id = Some(cloud_config.tenant_id);
        }

        let mut component = ManagerComponent::new(ManagerConfig {
            pull_secrets,
            installation,
            cluster_domain: options.cluster_domain.clone(),
            tls_key_pair,
            trusted_bundle: certificate_manager.create_trusted_bundle(&[]),
            cloud,
            extra_env: options.manager_extra_env_map(),
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
                .with_owner(&manager)
                .create_or_update_or_delete(&component)
                .await,
        )
        .await?;

        mark_ready(client, status, &manager).await
    }
}
