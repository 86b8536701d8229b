//! 渲染模块
//!
//! 渲染器是纯函数：同样的配置总是按同样的顺序产出同样的对象，不做任何 I/O。
//! 每个附加组件实现一个 `Component`，协调器负责把结果写入集群。

pub mod api_server;
pub mod certificate_management;
pub mod elasticsearch;
pub mod image_assurance;
pub mod log_storage;
pub mod manager;
pub mod network_policy;
pub mod runtime_security;

use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapKeySelector, EnvVar, EnvVarSource, LocalObjectReference, Namespace,
    Secret, SecretKeySelector,
};
use kube::api::{DynamicObject, ObjectMeta};
use kube::core::ApiResource;
use kube::{Resource, ResourceExt};
use sentinel_common::ImageDigests;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::client::{api_resource, from_dynamic, to_dynamic};
use crate::error::Result;

/// 组件支持的节点操作系统
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OsType {
    Linux,
    Any,
}

/// Pod 安全标准级别
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodSecurityStandard {
    Privileged,
    Restricted,
}

impl PodSecurityStandard {
    fn as_str(&self) -> &'static str {
        match self {
            PodSecurityStandard::Privileged => "privileged",
            PodSecurityStandard::Restricted => "restricted",
        }
    }
}

/// 渲染出的集群对象
#[derive(Clone, Debug)]
pub struct Object {
    resource: ApiResource,
    object: DynamicObject,
}

impl Object {
    pub fn from_resource<K>(object: &K) -> Result<Self>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        Ok(Self {
            resource: api_resource::<K>(),
            object: to_dynamic(object)?,
        })
    }

    pub fn resource(&self) -> &ApiResource {
        &self.resource
    }

    pub fn dynamic(&self) -> &DynamicObject {
        &self.object
    }

    pub fn kind(&self) -> &str {
        &self.resource.kind
    }

    pub fn name(&self) -> String {
        self.object.name_any()
    }

    pub fn namespace(&self) -> Option<String> {
        self.object.namespace()
    }

    /// 是否为指定种类与名称的对象
    pub fn is(&self, kind: &str, name: &str) -> bool {
        self.kind() == kind && self.name() == name
    }

    /// 解析为类型化对象
    pub fn typed<K: DeserializeOwned>(&self) -> Result<K> {
        from_dynamic(self.object.clone())
    }
}

/// 按资源类型与序列化内容比较
impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        self.resource.group == other.resource.group
            && self.resource.version == other.resource.version
            && self.resource.kind == other.resource.kind
            && serde_json::to_value(&self.object).ok() == serde_json::to_value(&other.object).ok()
    }
}

impl std::fmt::Display for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.namespace() {
            Some(ns) => write!(f, "{} {}/{}", self.kind(), ns, self.name()),
            None => write!(f, "{} {}", self.kind(), self.name()),
        }
    }
}

/// 渲染结果：需要创建/更新的对象与需要删除的对象
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RenderedObjects {
    pub create: Vec<Object>,
    pub delete: Vec<Object>,
}

impl RenderedObjects {
    pub fn push<K>(&mut self, object: &K) -> Result<()>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        self.create.push(Object::from_resource(object)?);
        Ok(())
    }

    pub fn push_all<K>(&mut self, objects: &[K]) -> Result<()>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        for object in objects {
            self.push(object)?;
        }
        Ok(())
    }

    pub fn remove<K>(&mut self, object: &K) -> Result<()>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        self.delete.push(Object::from_resource(object)?);
        Ok(())
    }
}

/// 可渲染组件
pub trait Component: Send + Sync {
    /// 根据 Installation 与可选的 ImageSet 摘要解析镜像
    fn resolve_images(&mut self, digests: Option<&ImageDigests>) -> Result<()>;

    /// 计算需要创建和删除的对象
    fn objects(&self) -> Result<RenderedObjects>;

    fn supported_os_type(&self) -> OsType;
}

/// 创建命名空间
pub fn create_namespace(name: &str, openshift: bool, pss: PodSecurityStandard) -> Namespace {
    let mut annotations = BTreeMap::new();
    if openshift {
        annotations.insert("openshift.io/node-selector".to_string(), String::new());
    }

    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([
                ("name".to_string(), name.to_string()),
                (
                    "pod-security.kubernetes.io/enforce".to_string(),
                    pss.as_str().to_string(),
                ),
                (
                    "pod-security.kubernetes.io/enforce-version".to_string(),
                    "latest".to_string(),
                ),
            ])),
            annotations: (!annotations.is_empty()).then_some(annotations),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// 将 Secret 复制到目标命名空间，只保留名称、类型与数据
pub fn copy_secrets(namespace: &str, secrets: &[Secret]) -> Vec<Secret> {
    secrets
        .iter()
        .map(|secret| Secret {
            metadata: ObjectMeta {
                name: secret.metadata.name.clone(),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            type_: secret.type_.clone(),
            data: secret.data.clone(),
            ..Default::default()
        })
        .collect()
}

/// 将 ConfigMap 复制到目标命名空间
pub fn copy_config_maps(namespace: &str, config_maps: &[ConfigMap]) -> Vec<ConfigMap> {
    config_maps
        .iter()
        .map(|cm| ConfigMap {
            metadata: ObjectMeta {
                name: cm.metadata.name.clone(),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: cm.data.clone(),
            ..Default::default()
        })
        .collect()
}

/// 镜像拉取 Secret 引用
pub fn pull_secret_refs(secrets: &[Secret]) -> Option<Vec<LocalObjectReference>> {
    if secrets.is_empty() {
        return None;
    }
    Some(
        secrets
            .iter()
            .map(|secret| LocalObjectReference {
                name: secret.metadata.name.clone(),
            })
            .collect(),
    )
}

pub fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        value_from: None,
    }
}

/// 取自 Secret 的环境变量
pub fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: Some(secret.to_string()),
                key: key.to_string(),
                optional: None,
            }),
            ..Default::default()
        }),
    }
}

/// 取自 ConfigMap 的环境变量
pub fn config_map_env(name: &str, config_map: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            config_map_key_ref: Some(ConfigMapKeySelector {
                name: Some(config_map.to_string()),
                key: key.to_string(),
                optional: None,
            }),
            ..Default::default()
        }),
    }
}

/// `k8s-app` 标签
pub fn app_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("k8s-app".to_string(), name.to_string())])
}
