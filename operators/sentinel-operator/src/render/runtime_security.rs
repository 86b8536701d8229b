//! 运行时安全组件（sasha + threat-id）

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, ExecAction, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, Secret, SecretVolumeSource, ServiceAccount, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;
use sentinel_common::images::{get_reference, COMPONENT_SASHA, COMPONENT_THREAT_ID};
use sentinel_common::ImageDigests;
use std::collections::BTreeMap;

use super::elasticsearch::{self, ClusterConfig};
use super::{
    app_labels, copy_secrets, create_namespace, env, pull_secret_refs, Component, OsType,
    PodSecurityStandard, RenderedObjects,
};
use crate::certificates::TrustedBundle;
use crate::crd::features::{ContainerResources, RuntimeSecuritySpec};
use crate::crd::InstallationSpec;
use crate::error::{Error, Result};

pub const RUNTIME_SECURITY_NAMESPACE: &str = "tigera-runtime-security";

/// sasha 访问 Elasticsearch 的凭据
pub const SASHA_ES_USER_SECRET: &str = "tigera-ee-sasha-elasticsearch-access";

pub const SASHA_NAME: &str = "sasha";
pub const THREAT_ID_NAME: &str = "threat-id";

const LEGACY_SASHA_SERVICE_ACCOUNT: &str = "tigera-sasha";

const CLIENT_CREDENTIALS_SECRET: &str = "tigera-calico-cloud-client-credentials";
const CLIENT_CREDENTIALS_VOLUME: &str = "cc-client-credentials";
const CLIENT_CREDENTIALS_PATH: &str = "/var/run/calico-cloud/api";
const CLIENT_CREDENTIALS_FILE: &str = "/var/run/calico-cloud/api/clientCredentials.yaml";

const HISTORY_VOLUME: &str = "history";
const HISTORY_SIZE_LIMIT: &str = "100Mi";
const HISTORY_MOUNT_PATH: &str = "/history";
const HISTORY_RETENTION: &str = "6h";

/// 运行时安全渲染配置
#[derive(Clone, Debug)]
pub struct RuntimeSecurityConfig {
    pub pull_secrets: Vec<Secret>,
    pub installation: InstallationSpec,
    pub os_type: OsType,
    pub sasha_es_secrets: Vec<Secret>,
    pub es_cluster_config: ClusterConfig,
    pub cluster_domain: String,
    pub trusted_bundle: TrustedBundle,
    pub spec: RuntimeSecuritySpec,
}

pub struct RuntimeSecurityComponent {
    config: RuntimeSecurityConfig,
    sasha_image: String,
    threat_id_image: String,
}

impl RuntimeSecurityComponent {
    pub fn new(config: RuntimeSecurityConfig) -> Self {
        Self {
            config,
            sasha_image: String::new(),
            threat_id_image: String::new(),
        }
    }

    fn sasha_service_account(&self) -> ServiceAccount {
        ServiceAccount {
            metadata: ObjectMeta {
                name: Some(SASHA_NAME.to_string()),
                namespace: Some(RUNTIME_SECURITY_NAMESPACE.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn sasha_container(&self) -> Container {
        let bundle = &self.config.trusted_bundle;
        let container = Container {
            name: SASHA_NAME.to_string(),
            image: Some(self.sasha_image.clone()),
            env: Some(vec![
                env("SASHA_SECRETLOCATION", CLIENT_CREDENTIALS_FILE),
                env("SASHA_HISTORYDIR", HISTORY_MOUNT_PATH),
                env("SASHA_HISTORYRETENTION", HISTORY_RETENTION),
            ]),
            resources: Some(resources(
                self.config.spec.sasha.as_ref(),
                ("2", "1Gi"),
                ("100m", "100Mi"),
            )),
            volume_mounts: Some(vec![
                bundle.volume_mount(),
                VolumeMount {
                    name: CLIENT_CREDENTIALS_VOLUME.to_string(),
                    mount_path: CLIENT_CREDENTIALS_PATH.to_string(),
                    ..Default::default()
                },
                history_mount(),
            ]),
            ..Default::default()
        };

        elasticsearch::container_decorate(
            container,
            self.config.es_cluster_config.cluster_name(),
            SASHA_ES_USER_SECRET,
            &self.config.cluster_domain,
        )
    }

    fn threat_id_container(&self) -> Container {
        // threat-id 的 gRPC 健康检查同时用于存活与就绪探针
        let health_check = Probe {
            exec: Some(ExecAction {
                command: Some(vec![
                    "bin/grpc_health_probe-linux-amd64".to_string(),
                    "-addr".to_string(),
                    "127.0.0.1:50051".to_string(),
                ]),
            }),
            period_seconds: Some(2),
            failure_threshold: Some(6),
            ..Default::default()
        };

        Container {
            name: THREAT_ID_NAME.to_string(),
            image: Some(self.threat_id_image.clone()),
            resources: Some(resources(
                self.config.spec.threat_id.as_ref(),
                ("1", "1Gi"),
                ("100m", "100Mi"),
            )),
            liveness_probe: Some(health_check.clone()),
            readiness_probe: Some(health_check),
            volume_mounts: Some(vec![history_mount()]),
            ..Default::default()
        }
    }

    fn sasha_deployment(&self) -> Result<Deployment> {
        let installation = &self.config.installation;
        let labels = app_labels(SASHA_NAME);

        let mut template = PodTemplateSpec {
            metadata: Some(ObjectMeta {
                name: Some(SASHA_NAME.to_string()),
                namespace: Some(RUNTIME_SECURITY_NAMESPACE.to_string()),
                labels: Some(labels.clone()),
                annotations: Some(self.config.trusted_bundle.hash_annotations()),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                node_selector: (!installation.control_plane_node_selector.is_empty())
                    .then(|| installation.control_plane_node_selector.clone()),
                tolerations: (!installation.control_plane_tolerations.is_empty())
                    .then(|| installation.control_plane_tolerations.clone()),
                volumes: Some(vec![
                    Volume {
                        name: CLIENT_CREDENTIALS_VOLUME.to_string(),
                        secret: Some(SecretVolumeSource {
                            secret_name: Some(CLIENT_CREDENTIALS_SECRET.to_string()),
                            optional: Some(false),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    Volume {
                        name: HISTORY_VOLUME.to_string(),
                        empty_dir: Some(EmptyDirVolumeSource {
                            size_limit: Some(Quantity(HISTORY_SIZE_LIMIT.to_string())),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    self.config.trusted_bundle.volume(),
                ]),
                containers: vec![self.sasha_container(), self.threat_id_container()],
                image_pull_secrets: pull_secret_refs(&self.config.pull_secrets),
                service_account_name: Some(SASHA_NAME.to_string()),
                ..Default::default()
            }),
        };
        elasticsearch::decorate_annotations(
            &mut template,
            &self.config.es_cluster_config,
            &self.config.sasha_es_secrets,
        )?;

        Ok(Deployment {
            metadata: ObjectMeta {
                name: Some(SASHA_NAME.to_string()),
                namespace: Some(RUNTIME_SECURITY_NAMESPACE.to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(labels),
                    ..Default::default()
                },
                template,
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn legacy_cron_job(&self) -> CronJob {
        CronJob {
            metadata: ObjectMeta {
                name: Some(SASHA_NAME.to_string()),
                namespace: Some(RUNTIME_SECURITY_NAMESPACE.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn legacy_service_account(&self) -> ServiceAccount {
        ServiceAccount {
            metadata: ObjectMeta {
                name: Some(LEGACY_SASHA_SERVICE_ACCOUNT.to_string()),
                namespace: Some(RUNTIME_SECURITY_NAMESPACE.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

fn history_mount() -> VolumeMount {
    VolumeMount {
        name: HISTORY_VOLUME.to_string(),
        mount_path: HISTORY_MOUNT_PATH.to_string(),
        ..Default::default()
    }
}

/// 用户未配置时使用默认的资源限制与请求
fn resources(
    configured: Option<&ContainerResources>,
    limits: (&str, &str),
    requests: (&str, &str),
) -> ResourceRequirements {
    if let Some(resources) = configured.and_then(|c| c.resources.clone()) {
        return resources;
    }

    let quantities = |(cpu, memory): (&str, &str)| {
        BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ])
    };

    ResourceRequirements {
        limits: Some(quantities(limits)),
        requests: Some(quantities(requests)),
        ..Default::default()
    }
}

impl Component for RuntimeSecurityComponent {
    fn resolve_images(&mut self, digests: Option<&ImageDigests>) -> Result<()> {
        if self.config.os_type != self.supported_os_type() {
            return Err(Error::Image("sasha is supported only on linux".to_string()));
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
        match resolve(&COMPONENT_SASHA) {
            Ok(image) => self.sasha_image = image,
            Err(e) => errors.push(e.to_string()),
        }
        match resolve(&COMPONENT_THREAT_ID) {
            Ok(image) => self.threat_id_image = image,
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
            RUNTIME_SECURITY_NAMESPACE,
            self.config.installation.is_openshift(),
            PodSecurityStandard::Privileged,
        ))?;
        rendered.push_all(&copy_secrets(RUNTIME_SECURITY_NAMESPACE, &self.config.pull_secrets))?;
        rendered.push(&self.config.trusted_bundle.config_map(RUNTIME_SECURITY_NAMESPACE))?;

        if !self.config.sasha_es_secrets.is_empty() {
            rendered.push_all(&copy_secrets(
                RUNTIME_SECURITY_NAMESPACE,
                &self.config.sasha_es_secrets,
            ))?;
            rendered.push(&self.sasha_service_account())?;
            rendered.push(&self.sasha_deployment()?)?;
        }

        rendered.remove(&self.legacy_cron_job())?;
        rendered.remove(&self.legacy_service_account())?;

        Ok(rendered)
    }

    fn supported_os_type(&self) -> OsType {
        OsType::Linux
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificates::KeyPair;

    fn secret(name: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("tigera-operator".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn config(with_es_secrets: bool) -> RuntimeSecurityConfig {
        let ca = KeyPair {
            name: "tigera-ca-private".to_string(),
            namespace: "tigera-operator".to_string(),
            certificate: b"ca".to_vec(),
            key: b"key".to_vec(),
        };
        RuntimeSecurityConfig {
            pull_secrets: vec![secret("tigera-pull-secret")],
            installation: InstallationSpec::default(),
            os_type: OsType::Linux,
            sasha_es_secrets: if with_es_secrets {
                vec![secret(SASHA_ES_USER_SECRET)]
            } else {
                Vec::new()
            },
            es_cluster_config: ClusterConfig::new("cluster", 1, 5, 5),
            cluster_domain: "cluster.local".to_string(),
            trusted_bundle: TrustedBundle::new(&ca),
            spec: RuntimeSecuritySpec::default(),
        }
    }

    fn render(config: RuntimeSecurityConfig) -> RenderedObjects {
        let mut component = RuntimeSecurityComponent::new(config);
        component.resolve_images(None).unwrap();
        component.objects().unwrap()
    }

    #[test]
    fn test_render_without_es_secrets() {
        let rendered = render(config(false));
        let created: Vec<_> = rendered.create.iter().map(|o| (o.kind().to_string(), o.name())).collect();
        assert_eq!(
            created,
            vec![
                ("Namespace".to_string(), "tigera-runtime-security".to_string()),
                ("Secret".to_string(), "tigera-pull-secret".to_string()),
                ("ConfigMap".to_string(), "tigera-ca-bundle".to_string()),
            ]
        );

        assert_eq!(rendered.delete.len(), 2);
        assert!(rendered.delete[0].is("CronJob", "sasha"));
        assert!(rendered.delete[1].is("ServiceAccount", "tigera-sasha"));
    }

    #[test]
    fn test_render_sasha_deployment() {
        let rendered = render(config(true));
        assert_eq!(rendered.create.len(), 6);

        let deployment: Deployment = rendered
            .create
            .iter()
            .find(|o| o.is("Deployment", "sasha"))
            .unwrap()
            .typed()
            .unwrap();
        let pod = deployment.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.service_account_name.as_deref(), Some("sasha"));
        assert_eq!(pod.containers.len(), 2);

        let sasha = &pod.containers[0];
        assert_eq!(sasha.image.as_deref(), Some("quay.io/tigera/sasha:v0.9.1"));
        let envs = sasha.env.as_ref().unwrap();
        assert_eq!(envs[0].name, "SASHA_SECRETLOCATION");
        assert!(envs.iter().any(|e| e.name == "ELASTIC_INDEX_SUFFIX"
            && e.value.as_deref() == Some("cluster")));
        let limits = sasha.resources.as_ref().unwrap().limits.as_ref().unwrap();
        assert_eq!(limits["cpu"], Quantity("2".to_string()));

        let threat_id = &pod.containers[1];
        assert_eq!(threat_id.image.as_deref(), Some("quay.io/tigera/threat-id:v0.9.1"));
        let liveness = threat_id.liveness_probe.as_ref().unwrap();
        assert_eq!(liveness.period_seconds, Some(2));
        assert_eq!(liveness.failure_threshold, Some(6));

        let volumes = pod.volumes.unwrap();
        let history = volumes.iter().find(|v| v.name == "history").unwrap();
        assert_eq!(
            history.empty_dir.as_ref().unwrap().size_limit,
            Some(Quantity("100Mi".to_string()))
        );
    }

    #[test]
    fn test_render_is_deterministic() {
        assert_eq!(render(config(true)), render(config(true)));
    }

    #[test]
    fn test_resolve_images_with_missing_digest() {
        let mut component = RuntimeSecurityComponent::new(config(true));
        let digests = ImageDigests::from([("tigera/sasha".to_string(), "sha256:abc".to_string())]);
        let err = component.resolve_images(Some(&digests)).unwrap_err();
        assert_eq!(err.to_string(), "ImageSet did not contain image tigera/threat-id");
    }
}
