//! 监视目标
//!
//! 每个协调器除了监视自身的 CR，还监视它读取的依赖对象。依赖对象的任何变化
//! 都映射为对单例 CR 的一次协调。

use kube::api::{Api, DynamicObject};
use kube::core::ApiResource;
use kube::runtime::watcher;
use kube::{Client, Resource};
use sentinel_common::images::enterprise_image_set_name;

use crate::client::api_resource;
use crate::crd::{ImageSet, Installation, INSTALLATION_NAME};

/// 一个被监视的具名对象
#[derive(Clone, Debug, PartialEq)]
pub struct WatchTarget {
    pub resource: ApiResource,
    pub namespace: Option<String>,
    pub name: String,
}

impl WatchTarget {
    /// 监视指定名称的对象
    pub fn named<K>(namespace: Option<&str>, name: &str) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self {
            resource: api_resource::<K>(),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }

    pub fn api(&self, client: Client) -> Api<DynamicObject> {
        match &self.namespace {
            Some(ns) => Api::namespaced_with(client, ns, &self.resource),
            None => Api::all_with(client, &self.resource),
        }
    }

    pub fn watcher_config(&self) -> watcher::Config {
        watcher::Config::default().fields(&format!("metadata.name={}", self.name))
    }
}

impl std::fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.resource.kind)?;
        if let Some(ns) = &self.namespace {
            write!(f, " {}/", ns)?;
        } else {
            write!(f, " ")?;
        }
        write!(f, "{}", self.name)
    }
}

/// 所有协调器共同的依赖：Installation 与 ImageSet
pub fn common_targets() -> Vec<WatchTarget> {
    vec![
        WatchTarget::named::<Installation>(None, INSTALLATION_NAME),
        WatchTarget::named::<ImageSet>(None, &enterprise_image_set_name()),
    ]
}

/// 同一命名空间下一组同类对象
pub fn named_in<K>(namespace: &str, names: &[&str]) -> Vec<WatchTarget>
where
    K: Resource<DynamicType = ()>,
{
    names
        .iter()
        .map(|name| WatchTarget::named::<K>(Some(namespace), name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Secret;

    #[test]
    fn test_named_target_uses_field_selector() {
        let target = WatchTarget::named::<Secret>(Some("tigera-operator"), "manager-tls");
        assert_eq!(
            target.watcher_config().field_selector.as_deref(),
            Some("metadata.name=manager-tls")
        );
        assert_eq!(target.to_string(), "Secret tigera-operator/manager-tls");

        let cluster_scoped = WatchTarget::named::<Installation>(None, INSTALLATION_NAME);
        assert_eq!(cluster_scoped.to_string(), "Installation default");
    }

    #[test]
    fn test_common_targets() {
        let targets = common_targets();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].resource.kind, "Installation");
        assert_eq!(targets[1].name, "enterprise-v3.16.0");
    }
}
