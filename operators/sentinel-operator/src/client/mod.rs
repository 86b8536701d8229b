//! 集群访问模块
//!
//! 协调器通过 `ClusterClient` 读写集群对象。生产实现基于 kube 的
//! `Api<DynamicObject>` 与服务端应用（server-side apply），测试使用内存实现。

#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::core::ApiResource;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};

/// 服务端应用使用的字段管理者名称
pub const FIELD_MANAGER: &str = "sentinel-operator";

/// 集群客户端抽象
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// 读取对象，不存在时返回 `None`
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    /// 创建或更新对象
    async fn apply(&self, resource: &ApiResource, object: &DynamicObject) -> Result<()>;

    /// 删除对象，对象不存在时视为成功
    async fn delete(&self, resource: &ApiResource, namespace: Option<&str>, name: &str)
        -> Result<()>;

    /// 合并更新对象的 status 子资源
    async fn patch_status(
        &self,
        resource: &ApiResource,
        name: &str,
        status: serde_json::Value,
    ) -> Result<()>;

    /// 资源类型是否已在 API Server 注册
    async fn api_available(&self, resource: &ApiResource) -> Result<bool>;
}

/// 基于 kube 客户端的实现
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        Ok(self.api(resource, namespace).get_opt(name).await?)
    }

    async fn apply(&self, resource: &ApiResource, object: &DynamicObject) -> Result<()> {
        let name = object.name_any();
        let api = self.api(resource, object.namespace().as_deref());
        let params = PatchParams::apply(FIELD_MANAGER).force();

        api.patch(&name, &params, &Patch::Apply(object)).await?;
        debug!("已应用 {} {}", resource.kind, name);

        Ok(())
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<()> {
        match self
            .api(resource, namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => {
                debug!("已删除 {} {}", resource.kind, name);
                Ok(())
            }
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_status(
        &self,
        resource: &ApiResource,
        name: &str,
        status: serde_json::Value,
    ) -> Result<()> {
        let patch = serde_json::json!({ "status": status });
        self.api(resource, None)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        Ok(())
    }

    async fn api_available(&self, resource: &ApiResource) -> Result<bool> {
        match self
            .api(resource, None)
            .list(&ListParams::default().limit(1))
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// 类型 `K` 对应的 `ApiResource`
pub fn api_resource<K>() -> ApiResource
where
    K: Resource<DynamicType = ()>,
{
    ApiResource::erase::<K>(&())
}

/// 将类型化对象转换为 `DynamicObject`
pub fn to_dynamic<K>(object: &K) -> Result<DynamicObject>
where
    K: Resource<DynamicType = ()> + Serialize,
{
    let mut dynamic: DynamicObject = serde_json::from_value(serde_json::to_value(object)?)?;
    if dynamic.types.is_none() {
        dynamic.types = Some(kube::core::TypeMeta {
            api_version: K::api_version(&()).to_string(),
            kind: K::kind(&()).to_string(),
        });
    }
    Ok(dynamic)
}

/// 将 `DynamicObject` 解析为类型化对象
pub fn from_dynamic<K>(object: DynamicObject) -> Result<K>
where
    K: DeserializeOwned,
{
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

/// 读取类型化对象，不存在时返回 `None`
pub async fn get_opt<K>(
    client: &dyn ClusterClient,
    namespace: Option<&str>,
    name: &str,
) -> Result<Option<K>>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    match client.get(&api_resource::<K>(), namespace, name).await? {
        Some(object) => Ok(Some(from_dynamic(object)?)),
        None => Ok(None),
    }
}

/// 读取类型化对象，不存在时返回 `Error::NotFound`
pub async fn get<K>(client: &dyn ClusterClient, namespace: Option<&str>, name: &str) -> Result<K>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    get_opt(client, namespace, name)
        .await?
        .ok_or_else(|| Error::not_found(K::kind(&()), name))
}

/// 创建或更新类型化对象
pub async fn apply<K>(client: &dyn ClusterClient, object: &K) -> Result<()>
where
    K: Resource<DynamicType = ()> + Serialize,
{
    client
        .apply(&api_resource::<K>(), &to_dynamic(object)?)
        .await
}
