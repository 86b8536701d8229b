//! LogStorage 协调器（外部 Elasticsearch 模式）

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::runtime::controller::Action;
use sentinel_common::cloud_config::CLOUD_CONFIG_CONFIG_MAP_NAME;
use std::sync::Arc;
use tracing::info;

use super::utils::{self, ComponentHandler};
use super::watches::{common_targets, named_in, WatchTarget};
use super::{imageset, mark_ready, or_degrade, require, Context, Reconciler};
use crate::client;
use crate::crd::LogStorage;
use crate::error::Result;
use crate::render::log_storage::{
    ExternalLogStorageComponent, LogStorageConfig, EXTERNAL_CERTS_SECRET,
};
use crate::status::StatusManager;

pub const NAME: &str = "logstorage";

pub struct LogStorageReconciler {
    context: Arc<Context>,
    status: Arc<dyn StatusManager>,
}

impl LogStorageReconciler {
    pub fn new(context: Arc<Context>, status: Arc<dyn StatusManager>) -> Self {
        Self { context, status }
    }
}

#[async_trait]
impl Reconciler for LogStorageReconciler {
    type Resource = LogStorage;

    fn name(&self) -> &'static str {
        NAME
    }

    fn watches(&self) -> Vec<WatchTarget> {
        let namespace = &self.context.options.operator_namespace;
        let mut targets = common_targets();
        targets.extend(named_in::<ConfigMap>(namespace, &[CLOUD_CONFIG_CONFIG_MAP_NAME]));
        targets.extend(named_in::<Secret>(namespace, &[EXTERNAL_CERTS_SECRET]));
        targets
    }

    async fn reconcile(&self) -> Result<Action> {
        let client = self.context.client.as_ref();
        let status = self.status.as_ref();
        let namespace = self.context.options.operator_namespace.as_str();

        let log_storage = or_degrade(
            status,
            "Error querying for LogStorage",
            utils::get_feature::<LogStorage>(client).await,
        )
        .await?;
        let Some(log_storage) = log_storage else {
            info!("LogStorage 不存在");
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

        let Some(cloud_config) = require(
            status,
            utils::get_cloud_config(client, namespace).await,
            "Failed to retrieve Elasticsearch Gateway config map",
            "Unable to read cloud config map",
        )
        .await?
        else {
            return Ok(Action::await_change());
        };

        let external_certs_secret = if cloud_config.enable_mtls {
            let Some(secret) = require(
                status,
                client::get::<Secret>(client, Some(namespace), EXTERNAL_CERTS_SECRET).await,
                &format!("Waiting for secret '{}' to become available", EXTERNAL_CERTS_SECRET),
                &format!("Failed to retrieve secret {}", EXTERNAL_CERTS_SECRET),
            )
            .await?
            else {
                return Ok(Action::await_change());
            };
            Some(secret)
        } else {
            None
        };

        let mut component = ExternalLogStorageComponent::new(LogStorageConfig {
            installation: installation.effective_spec(),
            cloud_config,
            operator_namespace: namespace.to_string(),
            external_certs_secret,
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
                .with_owner(&log_storage)
                .create_or_update_or_delete(&component)
                .await,
        )
        .await?;

        mark_ready(client, status, &log_storage).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::FakeClient;
    use crate::controller::tests::{context, OPERATOR_NAMESPACE};
    use crate::controller::utils::tests::enterprise_installation;
    use crate::crd::{LogStorageSpec, DEFAULT_INSTANCE_NAME};
    use crate::render::elasticsearch::{
        ClusterConfig, CLUSTER_CONFIG_CONFIG_MAP_NAME, ELASTICSEARCH_NAMESPACE,
        GATEWAY_SERVICE_NAME,
    };
    use crate::status::StatusTracker;
    use k8s_openapi::api::core::v1::Service;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use sentinel_common::CloudConfig;
    use std::collections::BTreeMap;

    fn cluster() -> FakeClient {
        let client = FakeClient::new();
        client.insert(&LogStorage::new(DEFAULT_INSTANCE_NAME, LogStorageSpec::default()));
        client.insert(&enterprise_installation());
        client
    }

    fn insert_cloud_config(client: &FakeClient, data: BTreeMap<String, String>) {
        client.insert(&ConfigMap {
            metadata: ObjectMeta {
                name: Some(CLOUD_CONFIG_CONFIG_MAP_NAME.to_string()),
                namespace: Some(OPERATOR_NAMESPACE.to_string()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        });
    }

    fn cloud_config(enable_mtls: bool) -> CloudConfig {
        CloudConfig::new(
            "tenant1",
            "Tenant One",
            "es.tenant1.example.com",
            "kb.tenant1.example.com",
            enable_mtls,
        )
    }

    async fn reconcile(client: &FakeClient) -> (Result<Action>, Option<(String, String)>) {
        let tracker = StatusTracker::new(NAME);
        let reconciler = LogStorageReconciler::new(context(client), Arc::new(tracker.clone()));
        let result = reconciler.reconcile().await;
        (result, tracker.degraded().await)
    }

    #[tokio::test]
    async fn test_missing_cloud_config_is_waiting() {
        let client = cluster();
        let (result, degraded) = reconcile(&client).await;
        assert_eq!(result.unwrap(), Action::await_change());
        assert_eq!(
            degraded.unwrap().0,
            "Failed to retrieve Elasticsearch Gateway config map"
        );
    }

    #[tokio::test]
    async fn test_invalid_cloud_config_is_an_error() {
        let client = cluster();
        let mut data = cloud_config(false).to_data();
        data.remove("tenantId");
        insert_cloud_config(&client, data);

        let (result, degraded) = reconcile(&client).await;
        assert!(result.is_err());
        assert_eq!(degraded.unwrap().0, "Unable to read cloud config map");
    }

    #[tokio::test]
    async fn test_mtls_waits_for_client_certificates() {
        let client = cluster();
        insert_cloud_config(&client, cloud_config(true).to_data());

        let (result, degraded) = reconcile(&client).await;
        assert_eq!(result.unwrap(), Action::await_change());
        assert_eq!(
            degraded.unwrap().0,
            "Waiting for secret 'tigera-secure-external-es-certs' to become available"
        );
        assert_eq!(client.mutations(), 0);

        client.insert(&Secret {
            metadata: ObjectMeta {
                name: Some(EXTERNAL_CERTS_SECRET.to_string()),
                namespace: Some(OPERATOR_NAMESPACE.to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                "client.crt".to_string(),
                ByteString(b"cert".to_vec()),
            )])),
            ..Default::default()
        });
        let (result, _) = reconcile(&client).await;
        assert_eq!(result.unwrap(), Action::await_change());
        assert!(client.contains::<Secret>(Some(ELASTICSEARCH_NAMESPACE), EXTERNAL_CERTS_SECRET));
    }

    #[tokio::test]
    async fn test_reconcile_writes_cluster_config() {
        let client = cluster();
        insert_cloud_config(&client, cloud_config(false).to_data());

        let (result, degraded) = reconcile(&client).await;
        assert_eq!(result.unwrap(), Action::await_change());
        assert!(degraded.is_none());

        let service: Service = client
            .object(Some(ELASTICSEARCH_NAMESPACE), GATEWAY_SERVICE_NAME)
            .unwrap();
        assert_eq!(
            service.spec.unwrap().external_name.as_deref(),
            Some("es.tenant1.example.com")
        );

        let cm: ConfigMap = client
            .object(Some(OPERATOR_NAMESPACE), CLUSTER_CONFIG_CONFIG_MAP_NAME)
            .unwrap();
        let cluster_config = ClusterConfig::from_config_map(&cm).unwrap();
        assert_eq!(cluster_config.cluster_name(), "tenant1.cluster");

        let log_storage: LogStorage = client.object(None, DEFAULT_INSTANCE_NAME).unwrap();
        assert!(log_storage.status.unwrap().is_ready());
    }
}
