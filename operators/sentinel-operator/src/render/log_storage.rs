//! 外部日志存储
//!
//! 托管模式下 Elasticsearch 与 Kibana 运行在集群之外。这里只创建指向外部域名的
//! ExternalName 服务，并写出集群内组件读取的集群配置。

use k8s_openapi::api::core::v1::{Secret, Service, ServiceSpec};
use kube::api::ObjectMeta;
use sentinel_common::{CloudConfig, ImageDigests};

use super::elasticsearch::{
    ClusterConfig, ELASTICSEARCH_NAMESPACE, GATEWAY_SERVICE_NAME,
};
use super::{copy_secrets, create_namespace, Component, OsType, PodSecurityStandard, RenderedObjects};
use crate::crd::InstallationSpec;
use crate::error::Result;

pub const KIBANA_SERVICE_NAME: &str = "tigera-secure-kb-http";

/// 访问外部 Elasticsearch 的客户端证书（位于 Operator 命名空间）
pub const EXTERNAL_CERTS_SECRET: &str = "tigera-secure-external-es-certs";

/// 外部集群的副本与分片数由托管方管理
const EXTERNAL_REPLICAS: u32 = 0;
const EXTERNAL_SHARDS: u32 = 1;
const EXTERNAL_FLOW_SHARDS: u32 = 1;

/// 外部日志存储渲染配置
#[derive(Clone, Debug)]
pub struct LogStorageConfig {
    pub installation: InstallationSpec,
    pub cloud_config: CloudConfig,
    pub operator_namespace: String,
    /// 启用 mTLS 时的客户端证书
    pub external_certs_secret: Option<Secret>,
}

pub struct ExternalLogStorageComponent {
    config: LogStorageConfig,
}

impl ExternalLogStorageComponent {
    pub fn new(config: LogStorageConfig) -> Self {
        Self { config }
    }

    /// 外部集群的集群配置，集群名由租户 ID 派生
    pub fn cluster_config(cloud_config: &CloudConfig) -> ClusterConfig {
        ClusterConfig::new(
            format!("{}.cluster", cloud_config.tenant_id),
            EXTERNAL_REPLICAS,
            EXTERNAL_SHARDS,
            EXTERNAL_FLOW_SHARDS,
        )
    }

    fn external_service(name: &str, external_name: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ELASTICSEARCH_NAMESPACE.to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("ExternalName".to_string()),
                external_name: Some(external_name.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

impl Component for ExternalLogStorageComponent {
    fn resolve_images(&mut self, _digests: Option<&ImageDigests>) -> Result<()> {
        Ok(())
    }

    fn objects(&self) -> Result<RenderedObjects> {
        let cloud = &self.config.cloud_config;
        let mut rendered = RenderedObjects::default();

        rendered.push(&create_namespace(
            ELASTICSEARCH_NAMESPACE,
            self.config.installation.is_openshift(),
            PodSecurityStandard::Privileged,
        ))?;
        rendered.push(&Self::external_service(
            GATEWAY_SERVICE_NAME,
            &cloud.external_es_domain,
        ))?;
        rendered.push(&Self::external_service(
            KIBANA_SERVICE_NAME,
            &cloud.external_kibana_domain,
        ))?;
        rendered.push(&Self::cluster_config(cloud).config_map(&self.config.operator_namespace))?;

        if cloud.enable_mtls {
            if let Some(secret) = &self.config.external_certs_secret {
                rendered.push_all(&copy_secrets(
                    ELASTICSEARCH_NAMESPACE,
                    std::slice::from_ref(secret),
                ))?;
            }
        }

        Ok(rendered)
    }

    fn supported_os_type(&self) -> OsType {
        OsType::Any
    }
}
