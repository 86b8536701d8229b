//! ImageAssurance 协调器
//!
//! 除了常规依赖，这里还要处理数据库迁移：迁移 Job 完成前只部署迁移相关对象，
//! 镜像升级后旧的 Job 与工作负载会被删除重建。

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, ServiceAccount};
use kube::runtime::controller::Action;
use std::sync::Arc;
use tracing::{info, warn};

use super::utils::{self, ComponentHandler};
use super::watches::{common_targets, named_in, WatchTarget};
use super::{
    certificate_manager, imageset, mark_ready, or_degrade, require, require_present, Context,
    Reconciler, REQUEUE_WAITING,
};
use crate::certificates::CA_SECRET_NAME;
use crate::client::{self, ClusterClient};
use crate::crd::{Authentication, ImageAssurance, DEFAULT_INSTANCE_NAME};
use crate::error::{Error, Result};
use crate::render::image_assurance::{
    ImageAssuranceComponent, ImageAssuranceConfig, API_CERT_SECRET_NAME, CONFIG_CONFIG_MAP_NAME,
    DB_MIGRATOR_NAME, IMAGE_ASSURANCE_NAMESPACE, MANAGER_CERT_SECRET_NAME,
    PG_ADMIN_USER_SECRET_NAME, PG_CERT_SECRET_NAME, PG_USER_SECRET_NAME, SCANNER_API_ACCESS_NAME,
    SCANNER_API_TOKEN_KEY,
};
use crate::render::certificate_management::CertificateManagementComponent;
use crate::render::{Component, OsType};
use crate::status::StatusManager;

pub const NAME: &str = "imageassurance";

/// 读取扫描器访问 ServiceAccount 的令牌
///
/// ServiceAccount、其第一个 Secret 或令牌字段任一缺失都返回 `None`。
async fn get_scanner_api_token(
    client: &dyn ClusterClient,
    namespace: &str,
) -> Result<Option<Vec<u8>>> {
    let Some(service_account) =
        client::get_opt::<ServiceAccount>(client, Some(namespace), SCANNER_API_ACCESS_NAME).await?
    else {
        return Ok(None);
    };

    let Some(secret_name) = service_account
        .secrets
        .unwrap_or_default()
        .into_iter()
        .next()
        .and_then(|reference| reference.name)
    else {
        return Ok(None);
    };

    let Some(secret) = client::get_opt::<Secret>(client, Some(namespace), &secret_name).await?
    else {
        return Ok(None);
    };

    Ok(secret
        .data
        .and_then(|mut data| data.remove(SCANNER_API_TOKEN_KEY))
        .map(|token| token.0))
}

pub struct ImageAssuranceReconciler {
    context: Arc<Context>,
    status: Arc<dyn StatusManager>,
}

impl ImageAssuranceReconciler {
    pub fn new(context: Arc<Context>, status: Arc<dyn StatusManager>) -> Self {
        Self { context, status }
    }

    async fn require_secret(&self, name: &str) -> Result<Option<Secret>> {
        let namespace = self.context.options.operator_namespace.as_str();
        require(
            self.status.as_ref(),
            client::get::<Secret>(self.context.client.as_ref(), Some(namespace), name).await,
            &format!("Waiting for secret '{}' to become available", name),
            &format!("Error retrieving secret {}", name),
        )
        .await
    }
}

#[async_trait]
impl Reconciler for ImageAssuranceReconciler {
    type Resource = ImageAssurance;

    fn name(&self) -> &'static str {
        NAME
    }

    fn watches(&self) -> Vec<WatchTarget> {
        let namespace = &self.context.options.operator_namespace;
        let mut targets = common_targets();
        targets.extend(named_in::<ConfigMap>(namespace, &[CONFIG_CONFIG_MAP_NAME]));
        targets.extend(named_in::<Secret>(
            namespace,
            &[
                PG_CERT_SECRET_NAME,
                PG_USER_SECRET_NAME,
                PG_ADMIN_USER_SECRET_NAME,
                API_CERT_SECRET_NAME,
                MANAGER_CERT_SECRET_NAME,
                CA_SECRET_NAME,
            ],
        ));
        targets.extend(named_in::<ServiceAccount>(namespace, &[SCANNER_API_ACCESS_NAME]));
        targets.extend(named_in::<Job>(IMAGE_ASSURANCE_NAMESPACE, &[DB_MIGRATOR_NAME]));
        targets.push(WatchTarget::named::<Authentication>(None, DEFAULT_INSTANCE_NAME));
        targets
    }

    async fn reconcile(&self) -> Result<Action> {
        let client = self.context.client.as_ref();
        let status = self.status.as_ref();
        let namespace = self.context.options.operator_namespace.as_str();

        let image_assurance = or_degrade(
            status,
            "Error querying for ImageAssurance",
            utils::get_feature::<ImageAssurance>(client).await,
        )
        .await?;
        let Some(image_assurance) = image_assurance else {
            info!("ImageAssurance 不存在");
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
            "Error retrieving image pull secrets",
            utils::get_pull_secrets(client, &installation, namespace).await,
        )
        .await?;

        let Some(config_map) = require(
            status,
            client::get::<ConfigMap>(client, Some(namespace), CONFIG_CONFIG_MAP_NAME).await,
            &format!("{} ConfigMap not found", CONFIG_CONFIG_MAP_NAME),
            "Error retrieving image assurance configuration",
        )
        .await?
        else {
            return Ok(Action::await_change());
        };

        let Some(pg_cert_secret) = self.require_secret(PG_CERT_SECRET_NAME).await? else {
            return Ok(Action::await_change());
        };
        let Some(pg_user_secret) = self.require_secret(PG_USER_SECRET_NAME).await? else {
            return Ok(Action::await_change());
        };
        let Some(pg_admin_user_secret) = self.require_secret(PG_ADMIN_USER_SECRET_NAME).await?
        else {
            return Ok(Action::await_change());
        };

        let Some(certificate_manager) = certificate_manager(&self.context, status).await? else {
            return Ok(Action::await_change());
        };
        let Some(internal_manager_secret) = require_present(
            status,
            certificate_manager
                .get_certificate(client, MANAGER_CERT_SECRET_NAME, namespace)
                .await,
            "Waiting for internal manager tls certificate to be available",
            "Error retrieving internal manager tls secret",
        )
        .await?
        else {
            return Ok(Action::await_change());
        };
        let Some(tls_secret) = require_present(
            status,
            certificate_manager
                .get_certificate(client, API_CERT_SECRET_NAME, namespace)
                .await,
            &format!("Waiting for secret '{}' to become available", API_CERT_SECRET_NAME),
            "Error in ensuring TLS certificate for image-assurance api",
        )
        .await?
        else {
            return Ok(Action::await_change());
        };

        let Some(scanner_api_token) = require_present(
            status,
            get_scanner_api_token(client, namespace).await,
            "Waiting for scanner api access service account secret to be available",
            "Error in retrieving scanner API access token",
        )
        .await?
        else {
            return Ok(Action::await_change());
        };

        let authentication = or_degrade(
            status,
            "Error querying Authentication",
            utils::get_authentication(client).await,
        )
        .await?;
        if let Some(authentication) = authentication.filter(|auth| !auth.is_ready()) {
            status
                .set_degraded(
                    "Authentication is not ready",
                    &format!("authenticationCR status: {}", authentication.state()),
                )
                .await;
            return Ok(Action::await_change());
        }

        let migrator_job = or_degrade(
            status,
            "Error retrieving migrator job",
            client::get_opt::<Job>(client, Some(IMAGE_ASSURANCE_NAMESPACE), DB_MIGRATOR_NAME).await,
        )
        .await?;

        let api_proxy_url = image_assurance.spec.api_proxy_url.trim().to_string();
        if api_proxy_url.is_empty() {
            let reason = "APIProxyURL cannot be nil or empty";
            status.set_degraded(reason, "").await;
            return Err(Error::validation(reason));
        }

        let trusted_bundle = certificate_manager.create_trusted_bundle(&[&internal_manager_secret]);
        let mut certificate_management =
            CertificateManagementComponent::new(IMAGE_ASSURANCE_NAMESPACE, trusted_bundle.clone());
        let mut component = ImageAssuranceComponent::new(ImageAssuranceConfig {
            pull_secrets,
            installation,
            os_type: OsType::Linux,
            pg_cert_secret,
            pg_user_secret,
            pg_admin_user_secret,
            config_map,
            tls_secret,
            internal_manager_secret,
            trusted_bundle,
            scanner_api_token,
            api_proxy_url,
            migrator_job,
        });
        or_degrade(
            status,
            "Error with images from ImageSet",
            imageset::apply_image_set(client, &mut [&mut component, &mut certificate_management])
                .await,
        )
        .await?;

        let handler = ComponentHandler::new(client, status).with_owner(&image_assurance);
        let components: [&dyn Component; 2] = [&component, &certificate_management];
        for rendered in components {
            or_degrade(
                status,
                "Error creating / updating resource",
                handler.create_or_update_or_delete(rendered).await,
            )
            .await?;
        }

        if let Some(message) = component.migration_state().waiting_message() {
            warn!("{}", message);
            status.set_degraded(message, "").await;
            return Ok(Action::requeue(REQUEUE_WAITING));
        }

        mark_ready(client, status, &image_assurance).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificates::tests::tls_secret;
    use crate::certificates::{TRUSTED_BUNDLE_KEY, TRUSTED_BUNDLE_NAME};
    use crate::client::fake::FakeClient;
    use crate::controller::tests::{context, insert_ca, OPERATOR_NAMESPACE};
    use crate::controller::utils::tests::enterprise_installation;
    use crate::crd::{AuthenticationSpec, FeatureStatus, ImageAssuranceSpec};
    use crate::render::image_assurance::{API_NAME, SCANNER_NAME};
    use crate::status::{MockStatusManager, StatusTracker};
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::batch::v1::{JobSpec, JobStatus};
    use k8s_openapi::api::core::v1::{Container, ObjectReference, PodSpec, PodTemplateSpec};
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use mockall::predicate::eq;
    use rstest::rstest;
    use std::collections::BTreeMap;

    const MIGRATOR_IMAGE: &str = "quay.io/tigera/image-assurance-db-migrator:v1.7.2";
    const TOKEN_SECRET: &str = "tigera-image-assurance-scanner-api-access-token-abcde";

    fn meta(name: &str, namespace: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }
    }

    fn secret(name: &str, keys: &[&str]) -> Secret {
        Secret {
            metadata: meta(name, OPERATOR_NAMESPACE),
            data: Some(
                keys.iter()
                    .map(|k| (k.to_string(), ByteString(k.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn cluster(api_proxy_url: &str) -> FakeClient {
        let client = FakeClient::new();
        client.insert(&ImageAssurance::new(
            DEFAULT_INSTANCE_NAME,
            ImageAssuranceSpec {
                api_proxy_url: api_proxy_url.to_string(),
            },
        ));
        client.insert(&enterprise_installation());
        client
    }

    fn add_prerequisites(client: &FakeClient) {
        client.insert(&ConfigMap {
            metadata: meta(CONFIG_CONFIG_MAP_NAME, OPERATOR_NAMESPACE),
            data: Some(BTreeMap::from([
                ("host".to_string(), "some.domain.io".to_string()),
                ("name".to_string(), "my-database".to_string()),
                ("port".to_string(), "1234".to_string()),
                ("dbOrgID".to_string(), "tenant123".to_string()),
                ("dbOrgName".to_string(), "tenantName".to_string()),
            ])),
            ..Default::default()
        });
        client.insert(&secret(
            PG_CERT_SECRET_NAME,
            &["server-ca", "client-cert", "client-key"],
        ));
        client.insert(&secret(PG_USER_SECRET_NAME, &["username", "password"]));
        client.insert(&secret(PG_ADMIN_USER_SECRET_NAME, &["username", "password"]));
        insert_ca(client);
        client.insert(&tls_secret(MANAGER_CERT_SECRET_NAME, OPERATOR_NAMESPACE));
        client.insert(&tls_secret(API_CERT_SECRET_NAME, OPERATOR_NAMESPACE));
        client.insert(&ServiceAccount {
            metadata: meta(SCANNER_API_ACCESS_NAME, OPERATOR_NAMESPACE),
            secrets: Some(vec![ObjectReference {
                name: Some(TOKEN_SECRET.to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        });
        client.insert(&secret(TOKEN_SECRET, &[SCANNER_API_TOKEN_KEY]));
    }

    fn migrator_job(image: &str, status: Option<JobStatus>) -> Job {
        Job {
            metadata: meta(DB_MIGRATOR_NAME, IMAGE_ASSURANCE_NAMESPACE),
            spec: Some(JobSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: DB_MIGRATOR_NAME.to_string(),
                            image: Some(image.to_string()),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            status,
        }
    }

    async fn reconcile(client: &FakeClient) -> (Result<Action>, Option<(String, String)>) {
        let tracker = StatusTracker::new(NAME);
        let reconciler = ImageAssuranceReconciler::new(context(client), Arc::new(tracker.clone()));
        let result = reconciler.reconcile().await;
        (result, tracker.degraded().await)
    }

    #[tokio::test]
    async fn test_cr_not_found() {
        let client = FakeClient::new();
        let mut status = MockStatusManager::new();
        status.expect_on_cr_not_found().times(1).return_const(());

        let reconciler = ImageAssuranceReconciler::new(context(&client), Arc::new(status));
        assert_eq!(reconciler.reconcile().await.unwrap(), Action::await_change());
    }

    #[tokio::test]
    async fn test_missing_config_map() {
        let client = cluster("https://tigera.io/api");
        let mut status = MockStatusManager::new();
        status.expect_on_cr_found().return_const(());
        status
            .expect_set_degraded()
            .withf(|reason, detail| {
                reason == "tigera-image-assurance-config ConfigMap not found"
                    && detail.contains("not found")
            })
            .times(1)
            .return_const(());

        let reconciler = ImageAssuranceReconciler::new(context(&client), Arc::new(status));
        assert_eq!(reconciler.reconcile().await.unwrap(), Action::await_change());
    }

    #[rstest]
    #[case(PG_USER_SECRET_NAME, "Waiting for secret 'tigera-image-assurance-postgres-user' to become available")]
    #[case(MANAGER_CERT_SECRET_NAME, "Waiting for internal manager tls certificate to be available")]
    #[case(API_CERT_SECRET_NAME, "Waiting for secret 'tigera-image-assurance-api-cert' to become available")]
    #[case(TOKEN_SECRET, "Waiting for scanner api access service account secret to be available")]
    #[tokio::test]
    async fn test_missing_secret_is_waiting(#[case] missing: &str, #[case] expected: &str) {
        let client = cluster("https://tigera.io/api");
        add_prerequisites(&client);
        client.remove::<Secret>(Some(OPERATOR_NAMESPACE), missing);

        let (result, degraded) = reconcile(&client).await;
        assert_eq!(result.unwrap(), Action::await_change());
        assert_eq!(degraded.unwrap().0, expected);
        assert_eq!(client.mutations(), 0);
    }

    #[tokio::test]
    async fn test_authentication_not_ready() {
        let client = cluster("https://tigera.io/api");
        add_prerequisites(&client);
        let mut authentication = Authentication::new(DEFAULT_INSTANCE_NAME, AuthenticationSpec::default());
        authentication.status = Some(FeatureStatus {
            state: Some("Pending".to_string()),
            ..Default::default()
        });
        client.insert(&authentication);

        let (result, degraded) = reconcile(&client).await;
        assert_eq!(result.unwrap(), Action::await_change());
        assert_eq!(
            degraded.unwrap(),
            (
                "Authentication is not ready".to_string(),
                "authenticationCR status: Pending".to_string()
            )
        );
    }

    #[tokio::test]
    async fn test_empty_api_proxy_url_is_rejected() {
        let client = cluster("  ");
        add_prerequisites(&client);

        let (result, degraded) = reconcile(&client).await;
        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(degraded.unwrap().0, "APIProxyURL cannot be nil or empty");
        assert_eq!(client.mutations(), 0);
    }

    #[tokio::test]
    async fn test_waits_for_migration() {
        let client = cluster("https://tigera.io/api");
        add_prerequisites(&client);

        let (result, degraded) = reconcile(&client).await;
        assert_eq!(result.unwrap(), Action::requeue(REQUEUE_WAITING));
        assert_eq!(degraded.unwrap().0, "Waiting for migrator job to be created");
        assert!(client.contains::<Job>(Some(IMAGE_ASSURANCE_NAMESPACE), DB_MIGRATOR_NAME));
        assert!(!client.contains::<Deployment>(Some(IMAGE_ASSURANCE_NAMESPACE), API_NAME));
    }

    #[tokio::test]
    async fn test_outdated_migrator_is_recreated() {
        let client = cluster("https://tigera.io/api");
        add_prerequisites(&client);
        client.insert(&migrator_job(
            "quay.io/tigera/image-assurance-db-migrator:v1.6.0",
            None,
        ));
        for name in [API_NAME, SCANNER_NAME] {
            client.insert(&Deployment {
                metadata: meta(name, IMAGE_ASSURANCE_NAMESPACE),
                ..Default::default()
            });
        }

        let (result, degraded) = reconcile(&client).await;
        assert_eq!(result.unwrap(), Action::requeue(REQUEUE_WAITING));
        assert_eq!(degraded.unwrap().0, "Waiting for migrator job to be recreated");
        assert!(!client.contains::<Job>(Some(IMAGE_ASSURANCE_NAMESPACE), DB_MIGRATOR_NAME));
        assert!(!client.contains::<Deployment>(Some(IMAGE_ASSURANCE_NAMESPACE), API_NAME));
        assert!(!client.contains::<Deployment>(Some(IMAGE_ASSURANCE_NAMESPACE), SCANNER_NAME));

        // 下一轮重新创建迁移 Job
        let (_, degraded) = reconcile(&client).await;
        assert_eq!(degraded.unwrap().0, "Waiting for migrator job to be created");
        assert!(client.contains::<Job>(Some(IMAGE_ASSURANCE_NAMESPACE), DB_MIGRATOR_NAME));
    }

    #[tokio::test]
    async fn test_completed_migration_deploys_api() {
        let client = cluster("https://tigera.io/api");
        add_prerequisites(&client);
        client.insert(&migrator_job(
            MIGRATOR_IMAGE,
            Some(JobStatus {
                succeeded: Some(1),
                ..Default::default()
            }),
        ));

        let (result, degraded) = reconcile(&client).await;
        assert_eq!(result.unwrap(), Action::requeue(REQUEUE_WAITING));
        assert!(degraded.is_none());
        assert!(client.contains::<Deployment>(Some(IMAGE_ASSURANCE_NAMESPACE), API_NAME));
        assert!(client.contains::<Deployment>(Some(IMAGE_ASSURANCE_NAMESPACE), SCANNER_NAME));

        // API 挂载的信任包与其同在镜像保障命名空间
        let bundle: ConfigMap = client
            .object(Some(IMAGE_ASSURANCE_NAMESPACE), TRUSTED_BUNDLE_NAME)
            .unwrap();
        let data = bundle.data.unwrap();
        let pem = &data[TRUSTED_BUNDLE_KEY];
        assert!(pem.contains("# certificate name: tigera-ca-private"));
        assert!(pem.contains("# certificate name: internal-manager-tls"));

        let api: Deployment = client
            .object(Some(IMAGE_ASSURANCE_NAMESPACE), API_NAME)
            .unwrap();
        let volumes = api.spec.unwrap().template.spec.unwrap().volumes.unwrap();
        assert!(volumes.iter().any(|v| {
            v.config_map.as_ref().and_then(|c| c.name.as_deref()) == Some(TRUSTED_BUNDLE_NAME)
        }));
    }

    #[tokio::test]
    async fn test_query_error_is_returned() {
        let client = cluster("https://tigera.io/api");
        add_prerequisites(&client);
        client.fail_gets_for("ServiceAccount", "connection reset");

        let mut status = MockStatusManager::new();
        status.expect_on_cr_found().return_const(());
        status
            .expect_set_degraded()
            .with(
                eq("Error in retrieving scanner API access token"),
                eq("集群访问错误: connection reset"),
            )
            .times(1)
            .return_const(());

        let reconciler = ImageAssuranceReconciler::new(context(&client), Arc::new(status));
        assert!(reconciler.reconcile().await.is_err());
    }
}
