//! 内存集群客户端，仅用于测试
//!
//! 行为约定：
//! - `apply` 覆盖对象内容但保留已有的 status（与服务端应用一致）；
//! - 只有内容真正变化的写操作才计入变更次数；
//! - 可以为指定种类注入读取错误，或将某个资源类型标记为未注册。

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::core::ApiResource;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use super::{api_resource, from_dynamic, to_dynamic, ClusterClient};
use crate::error::{Error, Result};

/// 对象键：(API 组, 种类, 命名空间, 名称)
type Key = (String, String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, DynamicObject>,
    mutations: usize,
    get_errors: BTreeMap<String, String>,
    unavailable: BTreeSet<String>,
}

/// 内存集群客户端
#[derive(Clone, Default)]
pub struct FakeClient {
    state: Arc<Mutex<State>>,
}

fn key(resource: &ApiResource, namespace: Option<&str>, name: &str) -> Key {
    (
        resource.group.clone(),
        resource.kind.clone(),
        namespace.unwrap_or_default().to_string(),
        name.to_string(),
    )
}

/// 去掉 status 后用于比较的内容
fn content(object: &DynamicObject) -> serde_json::Value {
    let mut value = serde_json::to_value(object).unwrap_or_default();
    if let Some(map) = value.as_object_mut() {
        map.remove("status");
    }
    value
}

impl FakeClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入类型化对象（包括 status），不计入变更次数
    pub fn insert<K>(&self, object: &K)
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let dynamic = to_dynamic(object).expect("对象无法序列化");
        let key = key(
            &api_resource::<K>(),
            dynamic.metadata.namespace.as_deref(),
            &dynamic.name_any(),
        );
        self.state.lock().unwrap().objects.insert(key, dynamic);
    }

    /// 删除对象，不计入变更次数
    pub fn remove<K>(&self, namespace: Option<&str>, name: &str)
    where
        K: Resource<DynamicType = ()>,
    {
        self.state
            .lock()
            .unwrap()
            .objects
            .remove(&key(&api_resource::<K>(), namespace, name));
    }

    /// 读取类型化对象
    pub fn object<K>(&self, namespace: Option<&str>, name: &str) -> Option<K>
    where
        K: Resource<DynamicType = ()> + serde::de::DeserializeOwned,
    {
        let object = self
            .state
            .lock()
            .unwrap()
            .objects
            .get(&key(&api_resource::<K>(), namespace, name))
            .cloned()?;
        Some(from_dynamic(object).expect("对象无法解析"))
    }

    pub fn contains<K>(&self, namespace: Option<&str>, name: &str) -> bool
    where
        K: Resource<DynamicType = ()>,
    {
        self.state
            .lock()
            .unwrap()
            .objects
            .contains_key(&key(&api_resource::<K>(), namespace, name))
    }

    /// 已发生的变更次数
    pub fn mutations(&self) -> usize {
        self.state.lock().unwrap().mutations
    }

    /// 让指定种类的读取返回错误
    pub fn fail_gets_for(&self, kind: &str, message: &str) {
        self.state
            .lock()
            .unwrap()
            .get_errors
            .insert(kind.to_string(), message.to_string());
    }

    /// 将指定种类标记为未注册
    pub fn set_api_unavailable(&self, kind: &str, unavailable: bool) {
        let mut state = self.state.lock().unwrap();
        if unavailable {
            state.unavailable.insert(kind.to_string());
        } else {
            state.unavailable.remove(kind);
        }
    }
}

#[async_trait]
impl ClusterClient for FakeClient {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        let state = self.state.lock().unwrap();
        if let Some(message) = state.get_errors.get(&resource.kind) {
            return Err(Error::api(message.clone()));
        }
        Ok(state.objects.get(&key(resource, namespace, name)).cloned())
    }

    async fn apply(&self, resource: &ApiResource, object: &DynamicObject) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let key = key(resource, object.metadata.namespace.as_deref(), &object.name_any());

        let mut object = object.clone();
        let changed = match state.objects.get(&key) {
            Some(existing) => {
                if object.data.get("status").is_none() {
                    if let Some(status) = existing.data.get("status") {
                        object.data["status"] = status.clone();
                    }
                }
                content(existing) != content(&object)
            }
            None => true,
        };

        if changed {
            state.mutations += 1;
        }
        state.objects.insert(key, object);

        Ok(())
    }

    async fn delete(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.objects.remove(&key(resource, namespace, name)).is_some() {
            state.mutations += 1;
        }
        Ok(())
    }

    async fn patch_status(
        &self,
        resource: &ApiResource,
        name: &str,
        status: serde_json::Value,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let key = key(resource, None, name);
        let object = state
            .objects
            .get_mut(&key)
            .ok_or_else(|| Error::not_found(resource.kind.clone(), name))?;

        let current = object.data.get("status").cloned().unwrap_or_default();
        let mut merged = current.clone();
        merge(&mut merged, &status);

        if merged != current {
            object.data["status"] = merged;
            state.mutations += 1;
        }
        Ok(())
    }

    async fn api_available(&self, resource: &ApiResource) -> Result<bool> {
        Ok(!self.state.lock().unwrap().unavailable.contains(&resource.kind))
    }
}

/// JSON merge patch（RFC 7386）
fn merge(target: &mut serde_json::Value, patch: &serde_json::Value) {
    match (target.as_object_mut(), patch.as_object()) {
        (Some(target), Some(patch)) => {
            for (k, v) in patch {
                if v.is_null() {
                    target.remove(k);
                } else {
                    merge(target.entry(k.clone()).or_insert(serde_json::Value::Null), v);
                }
            }
        }
        _ => *target = patch.clone(),
    }
}
