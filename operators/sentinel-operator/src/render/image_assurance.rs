//! 镜像保障组件
//!
//! 组件分两阶段部署：先运行数据库迁移 Job，迁移完成后才部署 API、扫描器与 CAW。
//! 迁移 Job 的镜像变化时，旧的 Job 与依赖它的 Deployment 会先被删除，
//! 下一轮协调再按新镜像重新创建。

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, EnvVar, PodSpec, PodTemplateSpec, Secret, SecretVolumeSource,
    SecurityContext, Service, ServicePort, ServiceSpec, ServiceAccount, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use sentinel_common::images::{
    get_reference, COMPONENT_IMAGE_ASSURANCE_API, COMPONENT_IMAGE_ASSURANCE_CAW,
    COMPONENT_IMAGE_ASSURANCE_DB_MIGRATOR, COMPONENT_IMAGE_ASSURANCE_SCANNER,
};
use sentinel_common::ImageDigests;
use std::collections::BTreeMap;

use super::{
    app_labels, config_map_env, copy_config_maps, copy_secrets, create_namespace, env,
    pull_secret_refs, secret_env, Component, OsType, PodSecurityStandard, RenderedObjects,
};
use crate::certificates::{KeyPair, TrustedBundle, HASH_ANNOTATION_PREFIX};
use crate::crd::InstallationSpec;
use crate::error::{Error, Result};

pub const IMAGE_ASSURANCE_NAMESPACE: &str = "tigera-image-assurance";

pub const PG_CERT_SECRET_NAME: &str = "tigera-image-assurance-postgres-cert";
pub const PG_USER_SECRET_NAME: &str = "tigera-image-assurance-postgres-user";
pub const PG_ADMIN_USER_SECRET_NAME: &str = "tigera-image-assurance-postgres-admin-user";

/// 镜像保障配置 ConfigMap，键为 host、name、port、dbOrgID、dbOrgName
pub const CONFIG_CONFIG_MAP_NAME: &str = "tigera-image-assurance-config";

pub const API_CERT_SECRET_NAME: &str = "tigera-image-assurance-api-cert";
pub const MANAGER_CERT_SECRET_NAME: &str = "internal-manager-tls";

/// 扫描器访问 API 的 ServiceAccount（位于 Operator 命名空间）
pub const SCANNER_API_ACCESS_NAME: &str = "tigera-image-assurance-scanner-api-access";
pub const SCANNER_API_TOKEN_KEY: &str = "token";

pub const DB_MIGRATOR_NAME: &str = "tigera-image-assurance-db-migrator";
pub const API_NAME: &str = "tigera-image-assurance-api";
pub const SCANNER_NAME: &str = "tigera-image-assurance-scanner";
pub const CAW_NAME: &str = "tigera-image-assurance-caw";

pub const API_PORT: u16 = 5557;

/// Manager 通过该代理访问镜像保障 API
pub const API_PROXY_NAME: &str = "tigera-image-assurance-api-proxy";

/// 扫描器 CLI 使用的访问令牌 Secret
pub const SCANNER_CLI_TOKEN_SECRET_NAME: &str = "tigera-image-assurance-scanner-cli-token";

const SCANNER_CLI_DOWNLOAD_BASE_URL: &str = "https://installer.calicocloud.io/tigera-scanner";

pub const CONFIG_KEY_HOST: &str = "host";
pub const CONFIG_KEY_NAME: &str = "name";
pub const CONFIG_KEY_PORT: &str = "port";
pub const CONFIG_KEY_ORG_ID: &str = "dbOrgID";
pub const CONFIG_KEY_ORG_NAME: &str = "dbOrgName";

/// 与扫描器镜像同版本的 CLI 下载地址
pub fn scanner_cli_download_url() -> String {
    format!(
        "{}/{}/image-assurance-scanner-cli-linux-amd64",
        SCANNER_CLI_DOWNLOAD_BASE_URL, COMPONENT_IMAGE_ASSURANCE_SCANNER.version
    )
}

const DB_CERTS_VOLUME: &str = "tigera-image-assurance-postgres-cert";
const DB_CERTS_PATH: &str = "/certs/db/";
const API_CERTS_VOLUME: &str = "tigera-image-assurance-api-cert";
const API_CERTS_PATH: &str = "/certs/https/";
const MANAGER_CERTS_VOLUME: &str = "internal-manager-tls";
const MANAGER_CERTS_PATH: &str = "/manager-tls/";

const LOG_LEVEL: &str = "INFO";
const SCANNER_RETRIES: &str = "3";

/// 数据库迁移状态，由已存在的迁移 Job 推断
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrationState {
    NotStarted,
    Running,
    Failed,
    /// 已存在的 Job 使用的不是当前镜像
    Outdated,
    Complete,
}

impl MigrationState {
    /// 根据集群中已有的迁移 Job 与期望镜像推断状态
    pub fn from_job(job: Option<&Job>, expected_image: &str) -> Self {
        let Some(job) = job else {
            return MigrationState::NotStarted;
        };

        let image = job
            .spec
            .as_ref()
            .and_then(|spec| spec.template.spec.as_ref())
            .and_then(|pod| pod.containers.first())
            .and_then(|container| container.image.as_deref());
        if image != Some(expected_image) {
            return MigrationState::Outdated;
        }

        let Some(status) = job.status.as_ref() else {
            return MigrationState::Running;
        };
        if status.succeeded.unwrap_or(0) > 0 {
            return MigrationState::Complete;
        }

        let failed_condition = status.conditions.iter().flatten().any(|condition| {
            condition.type_ == "Failed" && condition.status == "True"
        });
        if failed_condition || (status.failed.unwrap_or(0) > 0 && status.active.unwrap_or(0) == 0)
        {
            return MigrationState::Failed;
        }

        MigrationState::Running
    }

    /// 迁移未完成时的降级原因
    pub fn waiting_message(&self) -> Option<&'static str> {
        match self {
            MigrationState::NotStarted => Some("Waiting for migrator job to be created"),
            MigrationState::Running => Some("Waiting for migrator job to finish running"),
            MigrationState::Failed => Some("Migrator job failed"),
            MigrationState::Outdated => Some("Waiting for migrator job to be recreated"),
            MigrationState::Complete => None,
        }
    }
}

/// 镜像保障渲染配置
#[derive(Clone, Debug)]
pub struct ImageAssuranceConfig {
    pub pull_secrets: Vec<Secret>,
    pub installation: InstallationSpec,
    pub os_type: OsType,
    pub pg_cert_secret: Secret,
    pub pg_user_secret: Secret,
    pub pg_admin_user_secret: Secret,
    pub config_map: ConfigMap,
    pub tls_secret: KeyPair,
    pub internal_manager_secret: KeyPair,
    /// CA 与 Manager 内部证书，信任包 ConfigMap 由证书管理组件写入
    pub trusted_bundle: TrustedBundle,
    pub scanner_api_token: Vec<u8>,
    pub api_proxy_url: String,
    /// 集群中已有的迁移 Job
    pub migrator_job: Option<Job>,
}

pub struct ImageAssuranceComponent {
    config: ImageAssuranceConfig,
    api_image: String,
    scanner_image: String,
    migrator_image: String,
    caw_image: String,
}

impl ImageAssuranceComponent {
    pub fn new(config: ImageAssuranceConfig) -> Self {
        Self {
            config,
            api_image: String::new(),
            scanner_image: String::new(),
            migrator_image: String::new(),
            caw_image: String::new(),
        }
    }

    /// 当前迁移状态，需在 `resolve_images` 之后调用
    pub fn migration_state(&self) -> MigrationState {
        MigrationState::from_job(self.config.migrator_job.as_ref(), &self.migrator_image)
    }

    fn metadata(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(IMAGE_ASSURANCE_NAMESPACE.to_string()),
            ..Default::default()
        }
    }

    fn service_account(name: &str) -> ServiceAccount {
        ServiceAccount {
            metadata: Self::metadata(name),
            ..Default::default()
        }
    }

    fn role(name: &str, rules: Vec<PolicyRule>) -> Role {
        Role {
            metadata: Self::metadata(name),
            rules: Some(rules),
        }
    }

    fn role_binding(name: &str) -> RoleBinding {
        RoleBinding {
            metadata: Self::metadata(name),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "Role".to_string(),
                name: name.to_string(),
            },
            subjects: Some(vec![service_account_subject(name)]),
        }
    }

    fn api_cluster_role() -> ClusterRole {
        ClusterRole {
            metadata: ObjectMeta {
                name: Some(API_NAME.to_string()),
                ..Default::default()
            },
            rules: Some(vec![
                policy_rule("authentication.k8s.io", &["tokenreviews"], &["create"]),
                policy_rule("authorization.k8s.io", &["subjectaccessreviews"], &["create"]),
            ]),
            ..Default::default()
        }
    }

    fn api_cluster_role_binding() -> ClusterRoleBinding {
        ClusterRoleBinding {
            metadata: ObjectMeta {
                name: Some(API_NAME.to_string()),
                ..Default::default()
            },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "ClusterRole".to_string(),
                name: API_NAME.to_string(),
            },
            subjects: Some(vec![service_account_subject(API_NAME)]),
        }
    }

    fn api_service() -> Service {
        Service {
            metadata: Self::metadata(API_NAME),
            spec: Some(ServiceSpec {
                selector: Some(app_labels(API_NAME)),
                ports: Some(vec![ServicePort {
                    name: Some("https".to_string()),
                    port: i32::from(API_PORT),
                    target_port: Some(IntOrString::Int(i32::from(API_PORT))),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn scanner_api_token_secret(&self) -> Secret {
        Secret {
            metadata: Self::metadata(SCANNER_API_ACCESS_NAME),
            data: Some(BTreeMap::from([(
                SCANNER_API_TOKEN_KEY.to_string(),
                ByteString(self.config.scanner_api_token.clone()),
            )])),
            ..Default::default()
        }
    }

    /// 数据库 TLS 相关环境变量
    fn db_ssl_envs() -> Vec<EnvVar> {
        vec![
            env("IMAGE_ASSURANCE_DB_SSL_ROOT_CERT", format!("{}server-ca", DB_CERTS_PATH)),
            env("IMAGE_ASSURANCE_DB_SSL_CERT", format!("{}client-cert", DB_CERTS_PATH)),
            env("IMAGE_ASSURANCE_DB_SSL_KEY", format!("{}client-key", DB_CERTS_PATH)),
        ]
    }

    /// 数据库地址与租户用户凭据
    fn db_connection_envs() -> Vec<EnvVar> {
        vec![
            config_map_env("IMAGE_ASSURANCE_DB_HOST_ADDR", CONFIG_CONFIG_MAP_NAME, CONFIG_KEY_HOST),
            config_map_env("IMAGE_ASSURANCE_DB_PORT", CONFIG_CONFIG_MAP_NAME, CONFIG_KEY_PORT),
            config_map_env("IMAGE_ASSURANCE_DB_NAME", CONFIG_CONFIG_MAP_NAME, CONFIG_KEY_NAME),
            secret_env("IMAGE_ASSURANCE_DB_USER_NAME", PG_USER_SECRET_NAME, "username"),
            secret_env("IMAGE_ASSURANCE_DB_PASSWORD", PG_USER_SECRET_NAME, "password"),
            config_map_env(
                "IMAGE_ASSURANCE_ORGANIZATION_ID",
                CONFIG_CONFIG_MAP_NAME,
                CONFIG_KEY_ORG_ID,
            ),
        ]
    }

    fn migrator_container(&self) -> Container {
        let mut envs = Self::db_ssl_envs();
        envs.extend([
            env("IMAGE_ASSURANCE_LOGLEVEL", LOG_LEVEL),
            config_map_env("IMAGE_ASSURANCE_DB_HOST_ADDR", CONFIG_CONFIG_MAP_NAME, CONFIG_KEY_HOST),
            config_map_env("IMAGE_ASSURANCE_DB_PORT", CONFIG_CONFIG_MAP_NAME, CONFIG_KEY_PORT),
            config_map_env("IMAGE_ASSURANCE_DB_NAME", CONFIG_CONFIG_MAP_NAME, CONFIG_KEY_NAME),
            secret_env("IMAGE_ASSURANCE_DB_USER_NAME", PG_ADMIN_USER_SECRET_NAME, "username"),
            secret_env("IMAGE_ASSURANCE_DB_PASSWORD", PG_ADMIN_USER_SECRET_NAME, "password"),
            config_map_env(
                "IMAGE_ASSURANCE_ORGANIZATION_ID",
                CONFIG_CONFIG_MAP_NAME,
                CONFIG_KEY_ORG_ID,
            ),
            config_map_env(
                "IMAGE_ASSURANCE_ORGANIZATION_NAME",
                CONFIG_CONFIG_MAP_NAME,
                CONFIG_KEY_ORG_NAME,
            ),
            secret_env("IMAGE_ASSURANCE_TENANT_USER_NAME", PG_USER_SECRET_NAME, "username"),
            secret_env("IMAGE_ASSURANCE_TENANT_PASSWORD", PG_USER_SECRET_NAME, "password"),
        ]);

        Container {
            name: DB_MIGRATOR_NAME.to_string(),
            image: Some(self.migrator_image.clone()),
            env: Some(envs),
            volume_mounts: Some(vec![db_certs_mount()]),
            ..Default::default()
        }
    }

    fn migrator_job(&self) -> Job {
        let labels = app_labels(DB_MIGRATOR_NAME);
        Job {
            metadata: ObjectMeta {
                labels: Some(labels.clone()),
                ..Self::metadata(DB_MIGRATOR_NAME)
            },
            spec: Some(JobSpec {
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        name: Some(DB_MIGRATOR_NAME.to_string()),
                        namespace: Some(IMAGE_ASSURANCE_NAMESPACE.to_string()),
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        restart_policy: Some("OnFailure".to_string()),
                        ..self.pod_spec(
                            DB_MIGRATOR_NAME,
                            vec![self.migrator_container()],
                            vec![db_certs_volume()],
                        )
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn api_container(&self) -> Container {
        let mut envs = vec![
            env("IMAGE_ASSURANCE_HTTPS_CERT", format!("{}tls.crt", API_CERTS_PATH)),
            env("IMAGE_ASSURANCE_HTTPS_KEY", format!("{}tls.key", API_CERTS_PATH)),
        ];
        envs.extend(Self::db_ssl_envs());
        envs.extend([
            env("IMAGE_ASSURANCE_PORT", API_PORT.to_string()),
            env("IMAGE_ASSURANCE_LOGLEVEL", LOG_LEVEL),
        ]);
        envs.extend(Self::db_connection_envs());

        Container {
            name: API_NAME.to_string(),
            image: Some(self.api_image.clone()),
            env: Some(envs),
            security_context: Some(SecurityContext {
                privileged: Some(true),
                ..Default::default()
            }),
            volume_mounts: Some(vec![
                read_only_mount(API_CERTS_VOLUME, API_CERTS_PATH),
                db_certs_mount(),
                read_only_mount(MANAGER_CERTS_VOLUME, MANAGER_CERTS_PATH),
                self.config.trusted_bundle.volume_mount(),
            ]),
            ..Default::default()
        }
    }

    fn api_deployment(&self) -> Deployment {
        let mut annotations = self.config.trusted_bundle.hash_annotations();
        annotations.extend([
            (
                format!("{}/{}", HASH_ANNOTATION_PREFIX, API_CERT_SECRET_NAME),
                self.config.tls_secret.hash(),
            ),
            (
                format!("{}/{}", HASH_ANNOTATION_PREFIX, MANAGER_CERT_SECRET_NAME),
                self.config.internal_manager_secret.hash(),
            ),
        ]);

        self.deployment(
            API_NAME,
            annotations,
            vec![self.api_container()],
            vec![
                secret_volume(API_CERTS_VOLUME, API_CERT_SECRET_NAME),
                db_certs_volume(),
                secret_volume(MANAGER_CERTS_VOLUME, MANAGER_CERT_SECRET_NAME),
                self.config.trusted_bundle.volume(),
            ],
        )
    }

    fn scanner_container(&self) -> Container {
        let mut envs = vec![env("IMAGE_ASSURANCE_LOGLEVEL", LOG_LEVEL)];
        envs.extend(Self::db_ssl_envs());
        envs.push(env("IMAGE_ASSURANCE_SCANNER_RETRIES", SCANNER_RETRIES));
        envs.extend(Self::db_connection_envs());

        Container {
            name: SCANNER_NAME.to_string(),
            image: Some(self.scanner_image.clone()),
            env: Some(envs),
            volume_mounts: Some(vec![db_certs_mount()]),
            ..Default::default()
        }
    }

    fn caw_container(&self) -> Container {
        Container {
            name: CAW_NAME.to_string(),
            image: Some(self.caw_image.clone()),
            env: Some(vec![
                env("IMAGE_ASSURANCE_LOGLEVEL", LOG_LEVEL),
                env("IMAGE_ASSURANCE_API_PROXY_URL", self.config.api_proxy_url.clone()),
                secret_env(
                    "IMAGE_ASSURANCE_API_TOKEN",
                    SCANNER_API_ACCESS_NAME,
                    SCANNER_API_TOKEN_KEY,
                ),
                config_map_env(
                    "IMAGE_ASSURANCE_ORGANIZATION_ID",
                    CONFIG_CONFIG_MAP_NAME,
                    CONFIG_KEY_ORG_ID,
                ),
            ]),
            ..Default::default()
        }
    }

    fn pod_spec(&self, service_account: &str, containers: Vec<Container>, volumes: Vec<Volume>) -> PodSpec {
        let installation = &self.config.installation;
        PodSpec {
            node_selector: (!installation.control_plane_node_selector.is_empty())
                .then(|| installation.control_plane_node_selector.clone()),
            tolerations: (!installation.control_plane_tolerations.is_empty())
                .then(|| installation.control_plane_tolerations.clone()),
            image_pull_secrets: pull_secret_refs(&self.config.pull_secrets),
            service_account_name: Some(service_account.to_string()),
            volumes: (!volumes.is_empty()).then_some(volumes),
            containers,
            ..Default::default()
        }
    }

    fn deployment(
        &self,
        name: &str,
        annotations: BTreeMap<String, String>,
        containers: Vec<Container>,
        volumes: Vec<Volume>,
    ) -> Deployment {
        let labels = app_labels(name);
        Deployment {
            metadata: ObjectMeta {
                labels: Some(labels.clone()),
                ..Self::metadata(name)
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        name: Some(name.to_string()),
                        namespace: Some(IMAGE_ASSURANCE_NAMESPACE.to_string()),
                        labels: Some(labels),
                        annotations: (!annotations.is_empty()).then_some(annotations),
                        ..Default::default()
                    }),
                    spec: Some(self.pod_spec(name, containers, volumes)),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// 每个阶段都需要的基础对象
    fn base_objects(&self, rendered: &mut RenderedObjects) -> Result<()> {
        rendered.push(&create_namespace(
            IMAGE_ASSURANCE_NAMESPACE,
            self.config.installation.is_openshift(),
            PodSecurityStandard::Privileged,
        ))?;
        rendered.push_all(&copy_secrets(IMAGE_ASSURANCE_NAMESPACE, &self.config.pull_secrets))?;
        rendered.push_all(&copy_secrets(
            IMAGE_ASSURANCE_NAMESPACE,
            &[
                self.config.pg_cert_secret.clone(),
                self.config.pg_user_secret.clone(),
                self.config.pg_admin_user_secret.clone(),
            ],
        ))?;
        rendered.push_all(&copy_config_maps(
            IMAGE_ASSURANCE_NAMESPACE,
            &[self.config.config_map.clone()],
        ))
    }

    fn migrator_objects(&self, rendered: &mut RenderedObjects) -> Result<()> {
        rendered.push(&Self::service_account(DB_MIGRATOR_NAME))?;
        rendered.push(&Self::role(
            DB_MIGRATOR_NAME,
            vec![policy_rule("", &["configmaps", "secrets"], &["get"])],
        ))?;
        rendered.push(&Self::role_binding(DB_MIGRATOR_NAME))?;
        rendered.push(&self.migrator_job())
    }

    fn api_objects(&self, rendered: &mut RenderedObjects) -> Result<()> {
        rendered.push(&self.config.tls_secret.secret(IMAGE_ASSURANCE_NAMESPACE))?;
        rendered.push(&self.config.internal_manager_secret.secret(IMAGE_ASSURANCE_NAMESPACE))?;
        rendered.push(&self.scanner_api_token_secret())?;

        rendered.push(&Self::service_account(API_NAME))?;
        rendered.push(&Self::role(
            API_NAME,
            vec![policy_rule("", &["configmaps", "secrets"], &["get", "list", "watch"])],
        ))?;
        rendered.push(&Self::role_binding(API_NAME))?;
        rendered.push(&Self::api_cluster_role())?;
        rendered.push(&Self::api_cluster_role_binding())?;
        rendered.push(&Self::api_service())?;
        rendered.push(&self.api_deployment())?;

        rendered.push(&Self::service_account(SCANNER_NAME))?;
        rendered.push(&Self::role(
            SCANNER_NAME,
            vec![policy_rule("", &["configmaps"], &["get"])],
        ))?;
        rendered.push(&Self::role_binding(SCANNER_NAME))?;
        rendered.push(&self.deployment(
            SCANNER_NAME,
            BTreeMap::new(),
            vec![self.scanner_container()],
            vec![db_certs_volume()],
        ))?;

        rendered.push(&Self::service_account(CAW_NAME))?;
        rendered.push(&Self::role(
            CAW_NAME,
            vec![policy_rule("", &["pods"], &["get", "list", "watch"])],
        ))?;
        rendered.push(&Self::role_binding(CAW_NAME))?;
        rendered.push(&self.deployment(
            CAW_NAME,
            BTreeMap::new(),
            vec![self.caw_container()],
            Vec::new(),
        ))
    }

    /// 迁移 Job 过期时删除它以及依赖旧数据库结构的工作负载
    fn outdated_objects(&self, rendered: &mut RenderedObjects) -> Result<()> {
        rendered.remove(&Job {
            metadata: Self::metadata(DB_MIGRATOR_NAME),
            ..Default::default()
        })?;
        for name in [API_NAME, SCANNER_NAME, CAW_NAME] {
            rendered.remove(&Deployment {
                metadata: Self::metadata(name),
                ..Default::default()
            })?;
        }
        Ok(())
    }
}

fn service_account_subject(name: &str) -> Subject {
    Subject {
        kind: "ServiceAccount".to_string(),
        name: name.to_string(),
        namespace: Some(IMAGE_ASSURANCE_NAMESPACE.to_string()),
        ..Default::default()
    }
}

fn policy_rule(group: &str, resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![group.to_string()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

fn secret_volume(name: &str, secret: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn db_certs_volume() -> Volume {
    secret_volume(DB_CERTS_VOLUME, PG_CERT_SECRET_NAME)
}

fn read_only_mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: Some(true),
        ..Default::default()
    }
}

fn db_certs_mount() -> VolumeMount {
    read_only_mount(DB_CERTS_VOLUME, DB_CERTS_PATH)
}

impl Component for ImageAssuranceComponent {
    fn resolve_images(&mut self, digests: Option<&ImageDigests>) -> Result<()> {
        if self.config.os_type != self.supported_os_type() {
            return Err(Error::Image(
                "image assurance is supported only on linux".to_string(),
            ));
        }

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
        for (component, slot) in [
            (&COMPONENT_IMAGE_ASSURANCE_API, &mut self.api_image),
            (&COMPONENT_IMAGE_ASSURANCE_SCANNER, &mut self.scanner_image),
            (&COMPONENT_IMAGE_ASSURANCE_DB_MIGRATOR, &mut self.migrator_image),
            (&COMPONENT_IMAGE_ASSURANCE_CAW, &mut self.caw_image),
        ] {
            match resolve(component) {
                Ok(image) => *slot = image,
                Err(e) => errors.push(e.to_string()),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Image(errors.join(",")))
        }
    }

    fn objects(&self) -> Result<RenderedObjects> {
        let mut rendered = RenderedObjects::default();
        self.base_objects(&mut rendered)?;

        match self.migration_state() {
            MigrationState::Outdated => self.outdated_objects(&mut rendered)?,
            MigrationState::NotStarted | MigrationState::Running | MigrationState::Failed => {
                self.migrator_objects(&mut rendered)?
            }
            MigrationState::Complete => {
                self.migrator_objects(&mut rendered)?;
                self.api_objects(&mut rendered)?;
            }
        }

        Ok(rendered)
    }

    fn supported_os_type(&self) -> OsType {
        OsType::Linux
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificates::tests::tls_secret;
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};

    fn secret(name: &str, keys: &[&str]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("tigera-operator".to_string()),
                ..Default::default()
            },
            data: Some(
                keys.iter()
                    .map(|k| (k.to_string(), ByteString(k.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn config(migrator_job: Option<Job>) -> ImageAssuranceConfig {
        let internal_manager_secret =
            KeyPair::from_secret(&tls_secret(MANAGER_CERT_SECRET_NAME, "tigera-operator")).unwrap();
        let mut trusted_bundle = TrustedBundle::new(
            &KeyPair::from_secret(&tls_secret("tigera-ca-private", "tigera-operator")).unwrap(),
        );
        trusted_bundle.add(&internal_manager_secret);

        ImageAssuranceConfig {
            pull_secrets: Vec::new(),
            installation: InstallationSpec::default(),
            os_type: OsType::Linux,
            pg_cert_secret: secret(PG_CERT_SECRET_NAME, &["server-ca", "client-cert", "client-key"]),
            pg_user_secret: secret(PG_USER_SECRET_NAME, &["username", "password"]),
            pg_admin_user_secret: secret(PG_ADMIN_USER_SECRET_NAME, &["username", "password"]),
            config_map: ConfigMap {
                metadata: ObjectMeta {
                    name: Some(CONFIG_CONFIG_MAP_NAME.to_string()),
                    namespace: Some("tigera-operator".to_string()),
                    ..Default::default()
                },
                data: Some(BTreeMap::from([
                    ("host".to_string(), "some.domain.io".to_string()),
                    ("name".to_string(), "my-database".to_string()),
                    ("port".to_string(), "1234".to_string()),
                    ("dbOrgID".to_string(), "tenant123".to_string()),
                    ("dbOrgName".to_string(), "tenantName".to_string()),
                ])),
                ..Default::default()
            },
            tls_secret: KeyPair::from_secret(&tls_secret(API_CERT_SECRET_NAME, "tigera-operator"))
                .unwrap(),
            internal_manager_secret,
            trusted_bundle,
            scanner_api_token: b"token".to_vec(),
            api_proxy_url: "https://tigera.io/api".to_string(),
            migrator_job,
        }
    }

    fn job(image: &str, status: Option<JobStatus>) -> Job {
        Job {
            metadata: ObjectMeta {
                name: Some(DB_MIGRATOR_NAME.to_string()),
                namespace: Some(IMAGE_ASSURANCE_NAMESPACE.to_string()),
                ..Default::default()
            },
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

    const MIGRATOR_IMAGE: &str = "quay.io/tigera/image-assurance-db-migrator:v1.7.2";

    fn succeeded() -> Option<JobStatus> {
        Some(JobStatus {
            succeeded: Some(1),
            ..Default::default()
        })
    }

    fn render(config: ImageAssuranceConfig) -> (MigrationState, RenderedObjects) {
        let mut component = ImageAssuranceComponent::new(config);
        component.resolve_images(None).unwrap();
        (component.migration_state(), component.objects().unwrap())
    }

    fn kinds_and_names(objects: &[super::super::Object]) -> Vec<(String, String)> {
        objects
            .iter()
            .map(|o| (o.kind().to_string(), o.name()))
            .collect()
    }

    #[test]
    fn test_migration_state() {
        assert_eq!(MigrationState::from_job(None, MIGRATOR_IMAGE), MigrationState::NotStarted);
        assert_eq!(
            MigrationState::from_job(Some(&job(MIGRATOR_IMAGE, None)), MIGRATOR_IMAGE),
            MigrationState::Running
        );
        assert_eq!(
            MigrationState::from_job(Some(&job(MIGRATOR_IMAGE, succeeded())), MIGRATOR_IMAGE),
            MigrationState::Complete
        );
        assert_eq!(
            MigrationState::from_job(Some(&job("old:v1", succeeded())), MIGRATOR_IMAGE),
            MigrationState::Outdated
        );

        let failed = JobStatus {
            conditions: Some(vec![JobCondition {
                type_: "Failed".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        };
        assert_eq!(
            MigrationState::from_job(Some(&job(MIGRATOR_IMAGE, Some(failed))), MIGRATOR_IMAGE),
            MigrationState::Failed
        );
        let retrying = JobStatus {
            failed: Some(1),
            active: Some(1),
            ..Default::default()
        };
        assert_eq!(
            MigrationState::from_job(Some(&job(MIGRATOR_IMAGE, Some(retrying))), MIGRATOR_IMAGE),
            MigrationState::Running
        );
    }

    #[test]
    fn test_render_before_migration() {
        let (state, rendered) = render(config(None));
        assert_eq!(state, MigrationState::NotStarted);
        assert_eq!(
            kinds_and_names(&rendered.create),
            vec![
                ("Namespace".to_string(), IMAGE_ASSURANCE_NAMESPACE.to_string()),
                ("Secret".to_string(), PG_CERT_SECRET_NAME.to_string()),
                ("Secret".to_string(), PG_USER_SECRET_NAME.to_string()),
                ("Secret".to_string(), PG_ADMIN_USER_SECRET_NAME.to_string()),
                ("ConfigMap".to_string(), CONFIG_CONFIG_MAP_NAME.to_string()),
                ("ServiceAccount".to_string(), DB_MIGRATOR_NAME.to_string()),
                ("Role".to_string(), DB_MIGRATOR_NAME.to_string()),
                ("RoleBinding".to_string(), DB_MIGRATOR_NAME.to_string()),
                ("Job".to_string(), DB_MIGRATOR_NAME.to_string()),
            ]
        );
        assert!(rendered.delete.is_empty());
    }

    #[test]
    fn test_render_after_migration() {
        let (state, rendered) = render(config(Some(job(MIGRATOR_IMAGE, succeeded()))));
        assert_eq!(state, MigrationState::Complete);

        let created = kinds_and_names(&rendered.create);
        assert_eq!(created.len(), 27);
        assert_eq!(created[9], ("Secret".to_string(), API_CERT_SECRET_NAME.to_string()));
        assert_eq!(created[10], ("Secret".to_string(), MANAGER_CERT_SECRET_NAME.to_string()));
        assert_eq!(created[11], ("Secret".to_string(), SCANNER_API_ACCESS_NAME.to_string()));
        assert_eq!(created[18], ("Deployment".to_string(), API_NAME.to_string()));
        assert_eq!(created[22], ("Deployment".to_string(), SCANNER_NAME.to_string()));
        assert_eq!(created[26], ("Deployment".to_string(), CAW_NAME.to_string()));

        let api: Deployment = rendered.create[18].typed().unwrap();
        let pod = api.spec.unwrap().template.spec.unwrap();
        let container = &pod.containers[0];
        assert_eq!(
            container.image.as_deref(),
            Some("quay.io/tigera/image-assurance-api:v1.7.2")
        );
        assert_eq!(
            container.security_context.as_ref().unwrap().privileged,
            Some(true)
        );
        let mounts: Vec<_> = container
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .map(|m| m.mount_path.as_str())
            .collect();
        assert_eq!(
            mounts,
            vec!["/certs/https/", "/certs/db/", "/manager-tls/", "/etc/pki/tls/certs/"]
        );
        assert!(pod
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .any(|v| v.config_map.as_ref().and_then(|c| c.name.as_deref()) == Some("tigera-ca-bundle")));
        let envs = container.env.as_ref().unwrap();
        assert_eq!(envs[0].name, "IMAGE_ASSURANCE_HTTPS_CERT");
        let user = envs
            .iter()
            .find(|e| e.name == "IMAGE_ASSURANCE_DB_USER_NAME")
            .unwrap();
        let selector = user.value_from.as_ref().unwrap().secret_key_ref.as_ref().unwrap();
        assert_eq!(selector.name.as_deref(), Some(PG_USER_SECRET_NAME));
    }

    #[test]
    fn test_migrator_uses_admin_credentials() {
        let (_, rendered) = render(config(None));
        let job: Job = rendered.create[8].typed().unwrap();
        let pod = job.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("OnFailure"));
        let envs = pod.containers[0].env.clone().unwrap();
        let admin = envs
            .iter()
            .find(|e| e.name == "IMAGE_ASSURANCE_DB_USER_NAME")
            .unwrap();
        let selector = admin.value_from.as_ref().unwrap().secret_key_ref.as_ref().unwrap();
        assert_eq!(selector.name.as_deref(), Some(PG_ADMIN_USER_SECRET_NAME));
        assert!(envs.iter().any(|e| e.name == "IMAGE_ASSURANCE_TENANT_PASSWORD"));
    }

    #[test]
    fn test_render_outdated_migration_deletes_dependents() {
        let (state, rendered) = render(config(Some(job("quay.io/tigera/old:v1", succeeded()))));
        assert_eq!(state, MigrationState::Outdated);
        assert_eq!(rendered.create.len(), 5);
        assert_eq!(
            kinds_and_names(&rendered.delete),
            vec![
                ("Job".to_string(), DB_MIGRATOR_NAME.to_string()),
                ("Deployment".to_string(), API_NAME.to_string()),
                ("Deployment".to_string(), SCANNER_NAME.to_string()),
                ("Deployment".to_string(), CAW_NAME.to_string()),
            ]
        );
    }

    #[test]
    fn test_render_is_deterministic() {
        let job = Some(job(MIGRATOR_IMAGE, succeeded()));
        assert_eq!(render(config(job.clone())).1, render(config(job)).1);
    }
}
