//! Manager 组件（Web 控制台 + voltron 隧道代理）
//!
//! 云版本在基础部署之上增加托管集群相关的环境变量；镜像保障或云端 RBAC API
//! 启用时，voltron 还需要信任对应服务的证书并被允许访问它。

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMap, Container, EnvVar, KeyToPath, PodSpec, PodTemplateSpec, Secret,
    SeccompProfile, SecretVolumeSource, SecurityContext, Service, ServiceAccount, ServicePort,
    ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use sentinel_common::hash::annotation_hash;
use sentinel_common::images::{get_reference, COMPONENT_MANAGER, COMPONENT_VOLTRON};
use sentinel_common::ImageDigests;
use std::collections::BTreeMap;

use super::image_assurance::{
    scanner_cli_download_url, API_CERT_SECRET_NAME, API_NAME as IMAGE_ASSURANCE_API_NAME,
    API_PORT as IMAGE_ASSURANCE_API_PORT, API_PROXY_NAME as IMAGE_ASSURANCE_API_PROXY_NAME,
    CONFIG_CONFIG_MAP_NAME as IMAGE_ASSURANCE_CONFIG_MAP_NAME, CONFIG_KEY_ORG_ID,
    IMAGE_ASSURANCE_NAMESPACE, SCANNER_CLI_TOKEN_SECRET_NAME,
};
use super::network_policy::{
    create_entity_rule, create_service_selector_entity_rule, kubernetes_app_selector,
    HIGH_PRECEDENCE_ORDER, TIGERA_COMPONENT_POLICY_PREFIX, TIGERA_COMPONENT_TIER, TCP_PROTOCOL,
};
use super::{
    app_labels, config_map_env, copy_config_maps, copy_secrets, create_namespace, env,
    pull_secret_refs, Component, OsType, PodSecurityStandard, RenderedObjects,
};
use crate::certificates::{
    KeyPair, TrustedBundle, HASH_ANNOTATION_PREFIX, TLS_CERT_KEY, TLS_KEY_KEY,
};
use crate::crd::{EntityRule, InstallationSpec, NetworkPolicy, NetworkPolicySpec, Rule};
use crate::error::{Error, Result};

pub const MANAGER_NAMESPACE: &str = "tigera-manager";
pub const MANAGER_NAME: &str = "tigera-manager";
pub const VOLTRON_NAME: &str = "tigera-voltron";

/// Manager 对外提供服务的 TLS 证书
pub const MANAGER_TLS_SECRET_NAME: &str = "manager-tls";

pub const MANAGER_PORT: i32 = 9443;

pub const IMAGE_ASSURANCE_POLICY_NAME: &str = "image-assurance-access";
pub const CLOUD_RBAC_POLICY_NAME: &str = "cloud-rbac-api";

/// 云端 RBAC API 的 TLS 证书，存在于 Operator 命名空间即启用该功能
pub const CLOUD_RBAC_TLS_SECRET_NAME: &str = "calico-cloud-rbac-tls";
pub const CLOUD_RBAC_NAMESPACE: &str = "calico-cloud-rbac";
pub const CLOUD_RBAC_SERVICE_NAME: &str = "cc-rbac-api";
pub const CLOUD_RBAC_API_PORT: u16 = 8443;

const MANAGER_TLS_VOLUME: &str = "manager-tls";
const MANAGER_TLS_PATH: &str = "/certs/https";

const IMAGE_ASSURANCE_CA_PATH: &str = "/certs/bast";
const IMAGE_ASSURANCE_API_URL: &str = "/bast/v1";

const CLOUD_RBAC_CA_PATH: &str = "/certs/cloud-rbac";

/// 兼容旧配置：这两个键不是变量名，需要翻译
const LEGACY_PORTAL_API_URL_KEY: &str = "portalAPIURL";
const LEGACY_AUTH0_ORG_ID_KEY: &str = "auth0OrgID";

/// 镜像保障启用时 Manager 需要的资源
#[derive(Clone, Debug)]
pub struct ImageAssuranceResources {
    /// 镜像保障 API 证书，只复制其中的 `tls.crt`
    pub tls_secret: Secret,
    pub config_map: ConfigMap,
}

/// 云端 RBAC API 相关资源
#[derive(Clone, Debug)]
pub struct CloudRbacResources {
    pub namespace: String,
    pub service_name: String,
    /// 只复制其中的 `tls.crt`
    pub tls_secret: Secret,
}

impl CloudRbacResources {
    pub fn new(tls_secret: Secret) -> Self {
        Self {
            namespace: CLOUD_RBAC_NAMESPACE.to_string(),
            service_name: CLOUD_RBAC_SERVICE_NAME.to_string(),
            tls_secret,
        }
    }

    fn endpoint(&self, cluster_domain: &str) -> String {
        format!(
            "https://{}.{}.svc.{}:{}",
            self.service_name, self.namespace, cluster_domain, CLOUD_RBAC_API_PORT
        )
    }
}

/// 云版本附加资源
#[derive(Clone, Debug, Default)]
pub struct ManagerCloudResources {
    /// 外部 Elasticsearch 的租户 ID
    pub tenant_id: Option<String>,
    pub image_assurance: Option<ImageAssuranceResources>,
    pub cloud_rbac: Option<CloudRbacResources>,
}

/// Manager 渲染配置
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    pub pull_secrets: Vec<Secret>,
    pub installation: InstallationSpec,
    pub cluster_domain: String,
    pub tls_key_pair: KeyPair,
    pub trusted_bundle: TrustedBundle,
    pub cloud: ManagerCloudResources,
    /// 已按变量名排序的额外环境变量
    pub extra_env: BTreeMap<String, String>,
}

pub struct ManagerComponent {
    config: ManagerConfig,
    manager_image: String,
    voltron_image: String,
}

impl ManagerComponent {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            manager_image: String::new(),
            voltron_image: String::new(),
        }
    }

    fn metadata(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(MANAGER_NAMESPACE.to_string()),
            ..Default::default()
        }
    }

    fn service_account() -> ServiceAccount {
        ServiceAccount {
            metadata: Self::metadata(MANAGER_NAME),
            ..Default::default()
        }
    }

    fn service() -> Service {
        Service {
            metadata: Self::metadata(MANAGER_NAME),
            spec: Some(ServiceSpec {
                selector: Some(app_labels(MANAGER_NAME)),
                ports: Some(vec![ServicePort {
                    port: MANAGER_PORT,
                    protocol: Some("TCP".to_string()),
                    target_port: Some(IntOrString::Int(MANAGER_PORT)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// 云版本的 Manager 环境变量，额外变量排在最后且按名称排序
    fn cloud_envs(&self) -> Vec<EnvVar> {
        let mut envs = vec![
            env("ENABLE_MANAGED_CLUSTERS_ONLY", "true"),
            env("LICENSE_EDITION", "cloudEdition"),
        ];

        if self.config.cloud.image_assurance.is_some() {
            envs.extend([
                env("ENABLE_IMAGE_ASSURANCE_SUPPORT", "true"),
                env("CNX_IMAGE_ASSURANCE_API_URL", IMAGE_ASSURANCE_API_URL),
                config_map_env(
                    "CNX_IMAGE_ASSURANCE_ORGANIZATION_ID",
                    IMAGE_ASSURANCE_CONFIG_MAP_NAME,
                    CONFIG_KEY_ORG_ID,
                ),
                env(
                    "IMAGE_ASSURANCE_SCANNER_CLI_TOKEN_SECRET_NAME",
                    SCANNER_CLI_TOKEN_SECRET_NAME,
                ),
                env(
                    "IMAGE_ASSURANCE_SCANNER_CLI_DOWNLOAD_URL",
                    scanner_cli_download_url(),
                ),
            ]);
        }

        for (key, value) in &self.config.extra_env {
            match key.as_str() {
                LEGACY_PORTAL_API_URL_KEY => envs.extend([
                    env("CNX_PORTAL_URL", value.clone()),
                    env("ENABLE_PORTAL_SUPPORT", "true"),
                ]),
                LEGACY_AUTH0_ORG_ID_KEY => envs.push(env("CNX_AUTH0_ORG_ID", value.clone())),
                _ => envs.push(env(key, value.clone())),
            }
        }

        envs
    }

    fn manager_container(&self) -> Container {
        let mut envs = vec![
            env("CNX_WEB_AUTHENTICATION_TYPE", "Token"),
            env("CNX_POLICY_RECOMMENDATION_SUPPORT", "true"),
        ];
        envs.extend(self.cloud_envs());

        Container {
            name: MANAGER_NAME.to_string(),
            image: Some(self.manager_image.clone()),
            env: Some(envs),
            security_context: Some(restricted_security_context()),
            ..Default::default()
        }
    }

    fn voltron_container(&self) -> Container {
        let bundle = &self.config.trusted_bundle;
        let mut envs = vec![
            env("VOLTRON_PORT", MANAGER_PORT.to_string()),
            env(
                "VOLTRON_QUERYSERVER_ENDPOINT",
                format!("https://tigera-api.tigera-system.svc.{}:8080", self.config.cluster_domain),
            ),
            env("VOLTRON_QUERYSERVER_CA_BUNDLE_PATH", TrustedBundle::bundle_path()),
            env("VOLTRON_HTTPS_CERT", format!("{}/{}", MANAGER_TLS_PATH, TLS_CERT_KEY)),
            env("VOLTRON_HTTPS_KEY", format!("{}/{}", MANAGER_TLS_PATH, TLS_KEY_KEY)),
        ];
        if let Some(tenant_id) = &self.config.cloud.tenant_id {
            envs.push(env("VOLTRON_TENANT_ID", tenant_id.clone()));
        }

        let mut mounts = vec![
            bundle.volume_mount(),
            VolumeMount {
                name: MANAGER_TLS_VOLUME.to_string(),
                mount_path: MANAGER_TLS_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ];

        if self.config.cloud.image_assurance.is_some() {
            envs.extend([
                env("VOLTRON_ENABLE_IMAGE_ASSURANCE", "true"),
                env(
                    "VOLTRON_IMAGE_ASSURANCE_CA_BUNDLE_PATH",
                    format!("{}/{}", IMAGE_ASSURANCE_CA_PATH, TLS_CERT_KEY),
                ),
                env(
                    "VOLTRON_IMAGE_ASSURANCE_ENDPOINT",
                    format!(
                        "https://{}.{}.svc.{}:{}",
                        IMAGE_ASSURANCE_API_NAME,
                        IMAGE_ASSURANCE_NAMESPACE,
                        self.config.cluster_domain,
                        IMAGE_ASSURANCE_API_PORT
                    ),
                ),
            ]);
            mounts.push(VolumeMount {
                name: API_CERT_SECRET_NAME.to_string(),
                mount_path: IMAGE_ASSURANCE_CA_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            });
        }

        if let Some(rbac) = &self.config.cloud.cloud_rbac {
            envs.extend([
                env("VOLTRON_ENABLE_CALICO_CLOUD_RBAC_API", "true"),
                env(
                    "VOLTRON_CALICO_CLOUD_RBAC_API_CA_BUNDLE_PATH",
                    format!("{}/{}", CLOUD_RBAC_CA_PATH, TLS_CERT_KEY),
                ),
                env(
                    "VOLTRON_CALICO_CLOUD_RBAC_API_ENDPOINT",
                    rbac.endpoint(&self.config.cluster_domain),
                ),
            ]);
            mounts.push(VolumeMount {
                name: CLOUD_RBAC_TLS_SECRET_NAME.to_string(),
                mount_path: CLOUD_RBAC_CA_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            });
        }

        Container {
            name: VOLTRON_NAME.to_string(),
            image: Some(self.voltron_image.clone()),
            env: Some(envs),
            volume_mounts: Some(mounts),
            security_context: Some(restricted_security_context()),
            ..Default::default()
        }
    }

    fn deployment(&self) -> Result<Deployment> {
        let installation = &self.config.installation;
        let labels = app_labels(MANAGER_NAME);

        let mut annotations = self.config.trusted_bundle.hash_annotations();
        annotations.insert(
            format!("{}/{}", HASH_ANNOTATION_PREFIX, MANAGER_TLS_SECRET_NAME),
            self.config.tls_key_pair.hash(),
        );

        let mut volumes = vec![
            self.config.trusted_bundle.volume(),
            Volume {
                name: MANAGER_TLS_VOLUME.to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(MANAGER_TLS_SECRET_NAME.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ];

        if let Some(resources) = &self.config.cloud.image_assurance {
            annotations.insert(
                format!("{}/image-assurance-tls", HASH_ANNOTATION_PREFIX),
                annotation_hash(&resources.tls_secret.data)?,
            );
            volumes.push(Volume {
                name: API_CERT_SECRET_NAME.to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(API_CERT_SECRET_NAME.to_string()),
                    items: Some(vec![KeyToPath {
                        key: TLS_CERT_KEY.to_string(),
                        path: TLS_CERT_KEY.to_string(),
                        mode: None,
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }

        if let Some(rbac) = &self.config.cloud.cloud_rbac {
            annotations.insert(
                format!("{}/{}", HASH_ANNOTATION_PREFIX, CLOUD_RBAC_TLS_SECRET_NAME),
                annotation_hash(&rbac.tls_secret.data)?,
            );
            volumes.push(Volume {
                name: CLOUD_RBAC_TLS_SECRET_NAME.to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(CLOUD_RBAC_TLS_SECRET_NAME.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }

        Ok(Deployment {
            metadata: ObjectMeta {
                labels: Some(labels.clone()),
                ..Self::metadata(MANAGER_NAME)
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        name: Some(MANAGER_NAME.to_string()),
                        namespace: Some(MANAGER_NAMESPACE.to_string()),
                        labels: Some(labels),
                        annotations: Some(annotations),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        node_selector: (!installation.control_plane_node_selector.is_empty())
                            .then(|| installation.control_plane_node_selector.clone()),
                        tolerations: (!installation.control_plane_tolerations.is_empty())
                            .then(|| installation.control_plane_tolerations.clone()),
                        image_pull_secrets: pull_secret_refs(&self.config.pull_secrets),
                        service_account_name: Some(MANAGER_NAME.to_string()),
                        containers: vec![self.manager_container(), self.voltron_container()],
                        volumes: Some(volumes),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    /// 只复制证书部分，私钥不离开所属命名空间
    fn certificate_secret(name: &str, source: &Secret) -> Secret {
        let certificate = source
            .data
            .as_ref()
            .and_then(|data| data.get(TLS_CERT_KEY))
            .cloned()
            .unwrap_or_else(|| ByteString(Vec::new()));

        Secret {
            metadata: Self::metadata(name),
            data: Some(BTreeMap::from([(TLS_CERT_KEY.to_string(), certificate)])),
            ..Default::default()
        }
    }

    /// 允许 Manager 访问某个目标的出站策略
    fn egress_policy(name: &str, destination: EntityRule) -> NetworkPolicy {
        let mut policy = NetworkPolicy::new(
            &format!("{}{}", TIGERA_COMPONENT_POLICY_PREFIX, name),
            NetworkPolicySpec {
                order: Some(HIGH_PRECEDENCE_ORDER),
                tier: Some(TIGERA_COMPONENT_TIER.to_string()),
                selector: kubernetes_app_selector(MANAGER_NAME),
                types: vec!["Egress".to_string()],
                ingress: Vec::new(),
                egress: vec![Rule {
                    action: "Allow".to_string(),
                    protocol: Some(TCP_PROTOCOL.to_string()),
                    source: None,
                    destination: Some(destination),
                }],
            },
        );
        policy.metadata.namespace = Some(MANAGER_NAMESPACE.to_string());
        policy
    }
}

fn restricted_security_context() -> SecurityContext {
    SecurityContext {
        allow_privilege_escalation: Some(false),
        run_as_non_root: Some(true),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            add: None,
        }),
        seccomp_profile: Some(SeccompProfile {
            type_: "RuntimeDefault".to_string(),
            localhost_profile: None,
        }),
        ..Default::default()
    }
}

impl Component for ManagerComponent {
    fn resolve_images(&mut self, digests: Option<&ImageDigests>) -> Result<()> {
        let installation = &self.config.installation;
        let resolve = |component| {
            get_reference(
                component,
                installation.registry(),
                installation.image_path(),
                installation.image_prefix(),
                digests,
            )
        };

        let mut errors = Vec::new();
        match resolve(&COMPONENT_MANAGER) {
            Ok(image) => self.manager_image = image,
            Err(e) => errors.push(e.to_string()),
        }
        match resolve(&COMPONENT_VOLTRON) {
            Ok(image) => self.voltron_image = image,
            Err(e) => errors.push(e.to_string()),
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Image(errors.join(",")))
        }
    }

    fn objects(&self) -> Result<RenderedObjects> {
        let mut rendered = RenderedObjects::default();

        rendered.push(&create_namespace(
            MANAGER_NAMESPACE,
            self.config.installation.is_openshift(),
            PodSecurityStandard::Restricted,
        ))?;
        rendered.push_all(&copy_secrets(MANAGER_NAMESPACE, &self.config.pull_secrets))?;
        rendered.push(&self.config.trusted_bundle.config_map(MANAGER_NAMESPACE))?;
        rendered.push(&KeyPair {
            name: MANAGER_TLS_SECRET_NAME.to_string(),
            ..self.config.tls_key_pair.clone()
        }
        .secret(MANAGER_NAMESPACE))?;
        rendered.push(&Self::service_account())?;
        rendered.push(&Self::service())?;
        rendered.push(&self.deployment()?)?;

        if let Some(resources) = &self.config.cloud.image_assurance {
            rendered.push(&Self::certificate_secret(API_CERT_SECRET_NAME, &resources.tls_secret))?;
            rendered.push_all(&copy_config_maps(
                MANAGER_NAMESPACE,
                std::slice::from_ref(&resources.config_map),
            ))?;
            rendered.push(&Self::egress_policy(
                IMAGE_ASSURANCE_POLICY_NAME,
                create_entity_rule(
                    IMAGE_ASSURANCE_NAMESPACE,
                    IMAGE_ASSURANCE_API_PROXY_NAME,
                    IMAGE_ASSURANCE_API_PORT,
                ),
            ))?;
        }

        if let Some(rbac) = &self.config.cloud.cloud_rbac {
            rendered.push(&Self::certificate_secret(CLOUD_RBAC_TLS_SECRET_NAME, &rbac.tls_secret))?;
            rendered.push(&Self::egress_policy(
                CLOUD_RBAC_POLICY_NAME,
                create_service_selector_entity_rule(&rbac.namespace, &rbac.service_name),
            ))?;
        }

        Ok(rendered)
    }

    fn supported_os_type(&self) -> OsType {
        OsType::Linux
    }
}
