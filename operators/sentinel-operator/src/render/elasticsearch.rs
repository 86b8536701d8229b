//! Elasticsearch 接入配置
//!
//! 访问日志存储的工作负载都需要同一组 `ELASTIC_*` 环境变量和配置哈希注解。

use k8s_openapi::api::core::v1::{ConfigMap, Container, PodTemplateSpec, Secret};
use kube::api::ObjectMeta;
use sentinel_common::hash::annotation_hash;
use std::collections::BTreeMap;

use super::{env, secret_env};
use crate::certificates::{TrustedBundle, HASH_ANNOTATION_PREFIX};
use crate::error::{Error, Result};

/// Elasticsearch 集群配置 ConfigMap 名称
pub const CLUSTER_CONFIG_CONFIG_MAP_NAME: &str = "tigera-secure-elasticsearch";

/// Elasticsearch 网关的公开证书
pub const PUBLIC_CERT_SECRET: &str = "tigera-secure-es-http-certs-public";

pub const ELASTICSEARCH_NAMESPACE: &str = "tigera-elasticsearch";
pub const GATEWAY_SERVICE_NAME: &str = "tigera-secure-es-gateway-http";
pub const ELASTICSEARCH_PORT: u16 = 9200;

/// Elasticsearch 集群配置
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterConfig {
    cluster_name: String,
    replicas: u32,
    shards: u32,
    flow_shards: u32,
}

impl ClusterConfig {
    pub fn new(cluster_name: impl Into<String>, replicas: u32, shards: u32, flow_shards: u32) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            replicas,
            shards,
            flow_shards,
        }
    }

    /// 从 ConfigMap 解析，缺少字段或数量不是整数时报错
    pub fn from_config_map(cm: &ConfigMap) -> Result<Self> {
        let data = cm.data.clone().unwrap_or_default();
        let field = |key: &str| {
            data.get(key)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| {
                    Error::config(format!(
                        "'{}' is not set in {}",
                        key, CLUSTER_CONFIG_CONFIG_MAP_NAME
                    ))
                })
        };
        let number = |key: &str| -> Result<u32> {
            let value = field(key)?;
            value.parse().map_err(|_| {
                Error::config(format!(
                    "'{}' in {} must be a number, got {}",
                    key, CLUSTER_CONFIG_CONFIG_MAP_NAME, value
                ))
            })
        };

        Ok(Self {
            cluster_name: field("clusterName")?.clone(),
            replicas: number("replicas")?,
            shards: number("shards")?,
            flow_shards: number("flowShards")?,
        })
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn data(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("clusterName".to_string(), self.cluster_name.clone()),
            ("replicas".to_string(), self.replicas.to_string()),
            ("shards".to_string(), self.shards.to_string()),
            ("flowShards".to_string(), self.flow_shards.to_string()),
        ])
    }

    pub fn config_map(&self, namespace: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(CLUSTER_CONFIG_CONFIG_MAP_NAME.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(self.data()),
            ..Default::default()
        }
    }
}

/// 网关服务地址
pub fn gateway_host(cluster_domain: &str) -> String {
    format!(
        "{}.{}.svc.{}",
        GATEWAY_SERVICE_NAME, ELASTICSEARCH_NAMESPACE, cluster_domain
    )
}

/// 为容器追加访问 Elasticsearch 所需的环境变量
pub fn container_decorate(
    mut container: Container,
    cluster_name: &str,
    user_secret: &str,
    cluster_domain: &str,
) -> Container {
    let envs = container.env.get_or_insert_with(Vec::new);
    envs.extend([
        env("ELASTIC_HOST", gateway_host(cluster_domain)),
        env("ELASTIC_PORT", ELASTICSEARCH_PORT.to_string()),
        env("ELASTIC_SCHEME", "https"),
        env("ELASTIC_INDEX_SUFFIX", cluster_name),
        env("ELASTIC_CA", TrustedBundle::bundle_path()),
        secret_env("ELASTIC_USER", user_secret, "username"),
        secret_env("ELASTIC_PASSWORD", user_secret, "password"),
    ]);
    container
}

/// 为 Pod 模板追加集群配置与凭据的哈希注解
pub fn decorate_annotations(
    template: &mut PodTemplateSpec,
    config: &ClusterConfig,
    secrets: &[Secret],
) -> Result<()> {
    let secrets_data: BTreeMap<String, _> = secrets
        .iter()
        .map(|s| (s.metadata.name.clone().unwrap_or_default(), s.data.clone()))
        .collect();

    let metadata = template.metadata.get_or_insert_with(ObjectMeta::default);
    let annotations = metadata.annotations.get_or_insert_with(BTreeMap::new);
    annotations.insert(
        format!("{}/elasticsearch-configmap", HASH_ANNOTATION_PREFIX),
        annotation_hash(&config.data())?,
    );
    annotations.insert(
        format!("{}/elasticsearch-secrets", HASH_ANNOTATION_PREFIX),
        annotation_hash(&secrets_data)?,
    );

    Ok(())
}
