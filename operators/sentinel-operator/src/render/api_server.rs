//! API Server 组件
//!
//! 以聚合 API 的方式提供 `projectcalico.org/v3`，同时运行查询服务。

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, HTTPGetAction, HostPathVolumeSource, KeyToPath,
    PodSpec, PodTemplateSpec, Probe, Secret, Service, ServiceAccount, ServicePort, ServiceSpec,
    Toleration, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, RoleBinding, RoleRef, Subject,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::{
    APIService, APIServiceSpec, ServiceReference,
};
use kube::api::ObjectMeta;
use sentinel_common::images::{get_reference, COMPONENT_API_SERVER, COMPONENT_QUERY_SERVER};
use sentinel_common::ImageDigests;
use std::collections::BTreeMap;

use super::{
    copy_secrets, create_namespace, env, pull_secret_refs, Component, OsType,
    PodSecurityStandard, RenderedObjects,
};
use crate::crd::InstallationSpec;
use crate::error::{Error, Result};

pub const API_SERVER_NAMESPACE: &str = "tigera-system";
pub const API_SERVER_NAME: &str = "tigera-apiserver";
pub const QUERY_SERVER_NAME: &str = "tigera-queryserver";
pub const API_SERVICE_NAME: &str = "tigera-api";
pub const AUDIT_POLICY_CONFIG_MAP_NAME: &str = "tigera-audit-policy";

const API_SERVICE_GROUP: &str = "projectcalico.org";
const API_SERVICE_VERSION: &str = "v3";

const API_SERVER_PORT: i32 = 5443;
const QUERY_SERVER_PORT: i32 = 8080;

const AUDIT_LOGS_VOLUME: &str = "tigera-audit-logs";
const AUDIT_LOGS_PATH: &str = "/var/log/calico/audit";
const AUDIT_POLICY_VOLUME: &str = "tigera-audit-policy";
const AUDIT_POLICY_PATH: &str = "/etc/tigera/audit";

const PASSTHROUGH_NAME: &str = "tigera-tiered-policy-passthrough";
const DELEGATE_AUTH_NAME: &str = "tigera-apiserver-delegate-auth";
const AUTH_READER_NAME: &str = "tigera-auth-reader";

const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

/// 默认审计策略：记录 Calico 策略资源变更的请求与响应
const AUDIT_POLICY: &str = r#"apiVersion: audit.k8s.io/v1
kind: Policy
rules:
- level: RequestResponse
  omitStages:
  - RequestReceived
  verbs:
  - create
  - patch
  - update
  - delete
  resources:
  - group: projectcalico.org
    resources:
    - globalnetworkpolicies
    - networkpolicies
    - stagedglobalnetworkpolicies
    - stagednetworkpolicies
    - stagedkubernetesnetworkpolicies
    - globalnetworksets
    - networksets
    - tiers
    - hostendpoints
- level: None
"#;

/// API Server 渲染配置
#[derive(Clone, Debug)]
pub struct ApiServerConfig {
    pub pull_secrets: Vec<Secret>,
    pub installation: InstallationSpec,
}

pub struct ApiServerComponent {
    config: ApiServerConfig,
    api_server_image: String,
    query_server_image: String,
}

impl ApiServerComponent {
    pub fn new(config: ApiServerConfig) -> Self {
        Self {
            config,
            api_server_image: String::new(),
            query_server_image: String::new(),
        }
    }

    fn labels() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("apiserver".to_string(), "true".to_string()),
            ("k8s-app".to_string(), API_SERVER_NAME.to_string()),
        ])
    }

    fn metadata(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(API_SERVER_NAMESPACE.to_string()),
            ..Default::default()
        }
    }

    fn audit_policy_config_map() -> ConfigMap {
        ConfigMap {
            metadata: Self::metadata(AUDIT_POLICY_CONFIG_MAP_NAME),
            data: Some(BTreeMap::from([(
                "config".to_string(),
                AUDIT_POLICY.to_string(),
            )])),
            ..Default::default()
        }
    }

    fn service_account() -> ServiceAccount {
        ServiceAccount {
            metadata: Self::metadata(API_SERVER_NAME),
            ..Default::default()
        }
    }

    fn api_service() -> APIService {
        APIService {
            metadata: ObjectMeta {
                name: Some(format!("{}.{}", API_SERVICE_VERSION, API_SERVICE_GROUP)),
                ..Default::default()
            },
            spec: Some(APIServiceSpec {
                group: Some(API_SERVICE_GROUP.to_string()),
                version: Some(API_SERVICE_VERSION.to_string()),
                group_priority_minimum: 200,
                version_priority: 200,
                insecure_skip_tls_verify: Some(true),
                service: Some(ServiceReference {
                    name: Some(API_SERVICE_NAME.to_string()),
                    namespace: Some(API_SERVER_NAMESPACE.to_string()),
                    port: None,
                }),
                ca_bundle: None,
            }),
            ..Default::default()
        }
    }

    fn service() -> Service {
        let port = |name: &str, port: i32, target: i32| ServicePort {
            name: Some(name.to_string()),
            port,
            protocol: Some("TCP".to_string()),
            target_port: Some(IntOrString::Int(target)),
            ..Default::default()
        };

        Service {
            metadata: Self::metadata(API_SERVICE_NAME),
            spec: Some(ServiceSpec {
                ports: Some(vec![
                    port("apiserver", 443, API_SERVER_PORT),
                    port("queryserver", QUERY_SERVER_PORT, QUERY_SERVER_PORT),
                ]),
                selector: Some(BTreeMap::from([(
                    "apiserver".to_string(),
                    "true".to_string(),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn service_account_subject() -> Subject {
        Subject {
            kind: "ServiceAccount".to_string(),
            name: API_SERVER_NAME.to_string(),
            namespace: Some(API_SERVER_NAMESPACE.to_string()),
            ..Default::default()
        }
    }

    /// 分层策略的访问控制由 API Server 自行完成，这里对所有用户放行
    fn passthrough_cluster_role() -> ClusterRole {
        ClusterRole {
            metadata: ObjectMeta {
                name: Some(PASSTHROUGH_NAME.to_string()),
                ..Default::default()
            },
            rules: Some(vec![PolicyRule {
                api_groups: Some(vec![API_SERVICE_GROUP.to_string()]),
                resources: Some(vec![
                    "networkpolicies".to_string(),
                    "globalnetworkpolicies".to_string(),
                ]),
                verbs: vec!["*".to_string()],
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    fn passthrough_cluster_role_binding() -> ClusterRoleBinding {
        let group = |name: &str| Subject {
            api_group: Some(RBAC_GROUP.to_string()),
            kind: "Group".to_string(),
            name: name.to_string(),
            namespace: None,
        };

        ClusterRoleBinding {
            metadata: ObjectMeta {
                name: Some(PASSTHROUGH_NAME.to_string()),
                ..Default::default()
            },
            role_ref: RoleRef {
                api_group: RBAC_GROUP.to_string(),
                kind: "ClusterRole".to_string(),
                name: PASSTHROUGH_NAME.to_string(),
            },
            subjects: Some(vec![
                group("system:authenticated"),
                group("system:unauthenticated"),
            ]),
        }
    }

    fn delegate_auth_cluster_role_binding() -> ClusterRoleBinding {
        ClusterRoleBinding {
            metadata: ObjectMeta {
                name: Some(DELEGATE_AUTH_NAME.to_string()),
                ..Default::default()
            },
            role_ref: RoleRef {
                api_group: RBAC_GROUP.to_string(),
                kind: "ClusterRole".to_string(),
                name: "system:auth-delegator".to_string(),
            },
            subjects: Some(vec![Self::service_account_subject()]),
        }
    }

    /// 读取 kube-system 中的扩展 API Server 认证配置
    fn auth_reader_role_binding() -> RoleBinding {
        RoleBinding {
            metadata: ObjectMeta {
                name: Some(AUTH_READER_NAME.to_string()),
                namespace: Some("kube-system".to_string()),
                ..Default::default()
            },
            role_ref: RoleRef {
                api_group: RBAC_GROUP.to_string(),
                kind: "Role".to_string(),
                name: "extension-apiserver-authentication-reader".to_string(),
            },
            subjects: Some(vec![Self::service_account_subject()]),
        }
    }

    fn version_probe(port: i32) -> Probe {
        Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/version".to_string()),
                port: IntOrString::Int(port),
                scheme: Some("HTTPS".to_string()),
                ..Default::default()
            }),
            initial_delay_seconds: Some(90),
            period_seconds: Some(10),
            ..Default::default()
        }
    }

    fn api_server_container(&self) -> Container {
        Container {
            name: API_SERVER_NAME.to_string(),
            image: Some(self.api_server_image.clone()),
            args: Some(vec![
                format!("--secure-port={}", API_SERVER_PORT),
                format!("--audit-policy-file={}/policy.conf", AUDIT_POLICY_PATH),
                format!("--audit-log-path={}/tsee-audit.log", AUDIT_LOGS_PATH),
            ]),
            env: Some(vec![env("DATASTORE_TYPE", "kubernetes")]),
            volume_mounts: Some(vec![
                VolumeMount {
                    name: AUDIT_LOGS_VOLUME.to_string(),
                    mount_path: AUDIT_LOGS_PATH.to_string(),
                    ..Default::default()
                },
                VolumeMount {
                    name: AUDIT_POLICY_VOLUME.to_string(),
                    mount_path: AUDIT_POLICY_PATH.to_string(),
                    ..Default::default()
                },
            ]),
            liveness_probe: Some(Self::version_probe(API_SERVER_PORT)),
            ..Default::default()
        }
    }

    fn query_server_container(&self) -> Container {
        Container {
            name: QUERY_SERVER_NAME.to_string(),
            image: Some(self.query_server_image.clone()),
            env: Some(vec![
                env("LOGLEVEL", "info"),
                env("DATASTORE_TYPE", "kubernetes"),
            ]),
            liveness_probe: Some(Self::version_probe(QUERY_SERVER_PORT)),
            ..Default::default()
        }
    }

    fn deployment(&self) -> Deployment {
        let installation = &self.config.installation;
        let labels = Self::labels();

        let mut tolerations = vec![Toleration {
            key: Some("node-role.kubernetes.io/master".to_string()),
            effect: Some("NoSchedule".to_string()),
            ..Default::default()
        }];
        tolerations.extend(installation.control_plane_tolerations.iter().cloned());

        Deployment {
            metadata: ObjectMeta {
                labels: Some(labels.clone()),
                ..Self::metadata(API_SERVER_NAME)
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                strategy: Some(DeploymentStrategy {
                    type_: Some("Recreate".to_string()),
                    rolling_update: None,
                }),
                selector: LabelSelector {
                    match_labels: Some(BTreeMap::from([(
                        "apiserver".to_string(),
                        "true".to_string(),
                    )])),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        name: Some(API_SERVER_NAME.to_string()),
                        namespace: Some(API_SERVER_NAMESPACE.to_string()),
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        node_selector: (!installation.control_plane_node_selector.is_empty())
                            .then(|| installation.control_plane_node_selector.clone()),
                        tolerations: Some(tolerations),
                        image_pull_secrets: pull_secret_refs(&self.config.pull_secrets),
                        service_account_name: Some(API_SERVER_NAME.to_string()),
                        containers: vec![
                            self.api_server_container(),
                            self.query_server_container(),
                        ],
                        volumes: Some(vec![
                            Volume {
                                name: AUDIT_LOGS_VOLUME.to_string(),
                                host_path: Some(HostPathVolumeSource {
                                    path: AUDIT_LOGS_PATH.to_string(),
                                    type_: Some("DirectoryOrCreate".to_string()),
                                }),
                                ..Default::default()
                            },
                            Volume {
                                name: AUDIT_POLICY_VOLUME.to_string(),
                                config_map: Some(ConfigMapVolumeSource {
                                    name: Some(AUDIT_POLICY_CONFIG_MAP_NAME.to_string()),
                                    items: Some(vec![KeyToPath {
                                        key: "config".to_string(),
                                        path: "policy.conf".to_string(),
                                        mode: None,
                                    }]),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

impl Component for ApiServerComponent {
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
        match resolve(&COMPONENT_API_SERVER) {
            Ok(image) => self.api_server_image = image,
            Err(e) => errors.push(e.to_string()),
        }
        match resolve(&COMPONENT_QUERY_SERVER) {
            Ok(image) => self.query_server_image = image,
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
            API_SERVER_NAMESPACE,
            self.config.installation.is_openshift(),
            PodSecurityStandard::Privileged,
        ))?;
        rendered.push_all(&copy_secrets(API_SERVER_NAMESPACE, &self.config.pull_secrets))?;
        rendered.push(&Self::audit_policy_config_map())?;
        rendered.push(&Self::service_account())?;
        rendered.push(&Self::api_service())?;
        rendered.push(&Self::service())?;
        rendered.push(&Self::passthrough_cluster_role())?;
        rendered.push(&Self::passthrough_cluster_role_binding())?;
        rendered.push(&Self::delegate_auth_cluster_role_binding())?;
        rendered.push(&Self::auth_reader_role_binding())?;
        rendered.push(&self.deployment())?;

        Ok(rendered)
    }

    fn supported_os_type(&self) -> OsType {
        OsType::Linux
    }
}
