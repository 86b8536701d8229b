//! 协调器公共工具
//!
//! 包括 License 就绪信号、组件写入器以及各协调器共用的对象查询。

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;
use sentinel_common::cloud_config::CLOUD_CONFIG_CONFIG_MAP_NAME;
use sentinel_common::CloudConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::client::{self, ClusterClient};
use crate::crd::{
    Authentication, Installation, InstallationSpec, ProductVariant, DEFAULT_INSTANCE_NAME,
    INSTALLATION_NAME,
};
use crate::error::{Error, Result};
use crate::render::elasticsearch::{ClusterConfig, CLUSTER_CONFIG_CONFIG_MAP_NAME};
use crate::render::Component;
use crate::status::{StatusManager, Workload};

/// 跨线程共享的一次性就绪信号
#[derive(Clone, Debug, Default)]
pub struct ReadyFlag {
    ready: Arc<AtomicBool>,
}

impl ReadyFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

/// 将渲染结果写入集群
///
/// 创建列表中的对象带上指向组件 CR 的 owner reference 后逐个应用，
/// 删除列表中的对象逐个删除；其中的工作负载同步登记到状态跟踪器。
pub struct ComponentHandler<'a> {
    client: &'a dyn ClusterClient,
    status: &'a dyn StatusManager,
    owner: Option<OwnerReference>,
}

impl<'a> ComponentHandler<'a> {
    pub fn new(client: &'a dyn ClusterClient, status: &'a dyn StatusManager) -> Self {
        Self {
            client,
            status,
            owner: None,
        }
    }

    /// 以组件 CR 作为所有创建对象的 owner
    pub fn with_owner<K>(mut self, owner: &K) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        self.owner = owner.controller_owner_ref(&());
        self
    }

    pub async fn create_or_update_or_delete(&self, component: &dyn Component) -> Result<()> {
        let rendered = component.objects()?;

        let mut tracked = Vec::new();
        for object in &rendered.create {
            let mut dynamic = object.dynamic().clone();
            if let Some(owner) = &self.owner {
                let refs = dynamic.metadata.owner_references.get_or_insert_with(Vec::new);
                if !refs.iter().any(|r| r.uid == owner.uid) {
                    refs.push(owner.clone());
                }
            }

            self.client.apply(object.resource(), &dynamic).await?;
            debug!("已应用 {}", object);

            let namespace = object.namespace().unwrap_or_default();
            if let Some(workload) = Workload::from_kind(object.kind(), &namespace, &object.name()) {
                tracked.push(workload);
            }
        }

        let mut untracked = Vec::new();
        for object in &rendered.delete {
            let namespace = object.namespace();
            self.client
                .delete(object.resource(), namespace.as_deref(), &object.name())
                .await?;
            debug!("已删除 {}", object);

            if let Some(workload) = Workload::from_kind(
                object.kind(),
                namespace.as_deref().unwrap_or_default(),
                &object.name(),
            ) {
                untracked.push(workload);
            }
        }

        self.status.track(tracked).await;
        self.status.untrack(untracked).await;

        Ok(())
    }
}

/// 读取单例组件 CR
pub async fn get_feature<K>(client: &dyn ClusterClient) -> Result<Option<K>>
where
    K: Resource<DynamicType = ()> + serde::de::DeserializeOwned,
{
    client::get_opt::<K>(client, None, DEFAULT_INSTANCE_NAME).await
}

/// 读取 Installation 并确认产品变体为企业版
///
/// 不满足时设置降级并返回 `None`；读取失败时设置降级并返回错误。
pub async fn get_enterprise_installation(
    client: &dyn ClusterClient,
    status: &dyn StatusManager,
) -> Result<Option<Installation>> {
    let installation = match client::get_opt::<Installation>(client, None, INSTALLATION_NAME).await
    {
        Ok(Some(installation)) => installation,
        Ok(None) => {
            status
                .set_degraded(
                    "Installation not found",
                    &Error::not_found("Installation", INSTALLATION_NAME).to_string(),
                )
                .await;
            return Ok(None);
        }
        Err(e) => {
            status
                .set_degraded("Error querying installation", &e.to_string())
                .await;
            return Err(e);
        }
    };

    if installation.variant() != Some(ProductVariant::TigeraSecureEnterprise) {
        status
            .set_degraded(
                &format!(
                    "Waiting for network to be {}",
                    ProductVariant::TigeraSecureEnterprise
                ),
                "",
            )
            .await;
        return Ok(None);
    }

    Ok(Some(installation))
}

/// License API 未就绪时设置降级并返回 `false`
pub async fn check_license_ready(flag: &ReadyFlag, status: &dyn StatusManager) -> bool {
    if flag.is_ready() {
        return true;
    }
    info!("LicenseKey API 尚未就绪");
    status
        .set_degraded("Waiting for LicenseKeyAPI to be ready", "")
        .await;
    false
}

/// 读取 Installation 引用的镜像拉取 Secret（位于 Operator 命名空间）
pub async fn get_pull_secrets(
    client: &dyn ClusterClient,
    installation: &InstallationSpec,
    namespace: &str,
) -> Result<Vec<Secret>> {
    let mut secrets = Vec::with_capacity(installation.image_pull_secrets.len());
    for reference in &installation.image_pull_secrets {
        let name = reference.name.as_deref().unwrap_or_default();
        secrets.push(client::get::<Secret>(client, Some(namespace), name).await?);
    }
    Ok(secrets)
}

/// 读取 Elasticsearch 集群配置，ConfigMap 不存在时返回 `NotFound`
pub async fn get_elasticsearch_cluster_config(
    client: &dyn ClusterClient,
    namespace: &str,
) -> Result<ClusterConfig> {
    let cm = client::get::<ConfigMap>(client, Some(namespace), CLUSTER_CONFIG_CONFIG_MAP_NAME)
        .await?;
    ClusterConfig::from_config_map(&cm)
}

/// 读取一组 Elasticsearch 用户凭据，任意一个不存在时返回 `NotFound`
pub async fn get_elasticsearch_secrets(
    client: &dyn ClusterClient,
    names: &[&str],
    namespace: &str,
) -> Result<Vec<Secret>> {
    let mut secrets = Vec::with_capacity(names.len());
    for name in names {
        secrets.push(client::get::<Secret>(client, Some(namespace), name).await?);
    }
    Ok(secrets)
}

/// 读取云配置，ConfigMap 不存在时返回 `NotFound`，内容不完整时返回配置错误
pub async fn get_cloud_config(client: &dyn ClusterClient, namespace: &str) -> Result<CloudConfig> {
    let cm = client::get::<ConfigMap>(client, Some(namespace), CLOUD_CONFIG_CONFIG_MAP_NAME).await?;
    Ok(CloudConfig::from_data(&cm.data.unwrap_or_default())?)
}

/// 读取 Authentication，不存在时返回 `None`
pub async fn get_authentication(client: &dyn ClusterClient) -> Result<Option<Authentication>> {
    get_feature::<Authentication>(client).await
}
