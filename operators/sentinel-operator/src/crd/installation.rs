//! Installation 资源
//!
//! 集群级单例 `default`，描述基础网络产品的变体、镜像仓库与镜像覆盖配置。
//! Operator 只读取它，不会修改。

use k8s_openapi::api::core::v1::{LocalObjectReference, Toleration};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Installation 单例名称
pub const INSTALLATION_NAME: &str = "default";

/// 产品变体
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ProductVariant {
    Calico,
    TigeraSecureEnterprise,
}

impl std::fmt::Display for ProductVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProductVariant::Calico => write!(f, "Calico"),
            ProductVariant::TigeraSecureEnterprise => write!(f, "TigeraSecureEnterprise"),
        }
    }
}

/// Installation 规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "operator.tigera.io", version = "v1", kind = "Installation")]
#[kube(status = "InstallationStatus")]
#[kube(printcolumn = r#"{"name":"变体", "type":"string", "jsonPath":".status.variant"}"#)]
#[serde(rename_all = "camelCase")]
pub struct InstallationSpec {
    /// 期望的产品变体
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<ProductVariant>,

    /// 镜像仓库，末尾的 `/` 可省略
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,

    /// 镜像路径，替换默认的 `tigera`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,

    /// 镜像名前缀
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_prefix: Option<String>,

    /// 镜像拉取 Secret（位于 Operator 命名空间）
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<LocalObjectReference>,

    /// Kubernetes 发行版提供方
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_provider: Option<String>,

    /// 控制平面组件的节点选择器
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub control_plane_node_selector: BTreeMap<String, String>,

    /// 控制平面组件的容忍度
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub control_plane_tolerations: Vec<Toleration>,
}

/// Installation 状态
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstallationStatus {
    /// 当前生效的产品变体
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<ProductVariant>,

    /// 基础网络控制器计算出的完整规范
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computed: Option<InstallationSpec>,
}

impl InstallationSpec {
    pub fn registry(&self) -> &str {
        self.registry.as_deref().unwrap_or_default()
    }

    pub fn image_path(&self) -> &str {
        self.image_path.as_deref().unwrap_or_default()
    }

    pub fn image_prefix(&self) -> &str {
        self.image_prefix.as_deref().unwrap_or_default()
    }

    pub fn is_openshift(&self) -> bool {
        self.kubernetes_provider.as_deref() == Some("OpenShift")
    }

    /// 用 `overlay` 中非空的字段覆盖当前规范
    fn overlay(mut self, overlay: &InstallationSpec) -> Self {
        if overlay.variant.is_some() {
            self.variant = overlay.variant;
        }
        if overlay.registry.as_deref().is_some_and(|s| !s.is_empty()) {
            self.registry = overlay.registry.clone();
        }
        if overlay.image_path.as_deref().is_some_and(|s| !s.is_empty()) {
            self.image_path = overlay.image_path.clone();
        }
        if overlay.image_prefix.as_deref().is_some_and(|s| !s.is_empty()) {
            self.image_prefix = overlay.image_prefix.clone();
        }
        if !overlay.image_pull_secrets.is_empty() {
            self.image_pull_secrets = overlay.image_pull_secrets.clone();
        }
        if overlay.kubernetes_provider.is_some() {
            self.kubernetes_provider = overlay.kubernetes_provider.clone();
        }
        if !overlay.control_plane_node_selector.is_empty() {
            self.control_plane_node_selector = overlay.control_plane_node_selector.clone();
        }
        if !overlay.control_plane_tolerations.is_empty() {
            self.control_plane_tolerations = overlay.control_plane_tolerations.clone();
        }
        self
    }
}

impl Installation {
    /// 当前生效的产品变体
    pub fn variant(&self) -> Option<ProductVariant> {
        self.status.as_ref().and_then(|status| status.variant)
    }

    /// 生效的规范：`status.computed` 之上叠加 `spec` 中用户显式设置的字段
    pub fn effective_spec(&self) -> InstallationSpec {
        let computed = self
            .status
            .as_ref()
            .and_then(|status| status.computed.clone())
            .unwrap_or_default();
        computed.overlay(&self.spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_spec_prefers_user_intent() {
        let mut installation = Installation::new(
            INSTALLATION_NAME,
            InstallationSpec {
                registry: Some("my.registry/".to_string()),
                ..Default::default()
            },
        );
        installation.status = Some(InstallationStatus {
            variant: Some(ProductVariant::TigeraSecureEnterprise),
            computed: Some(InstallationSpec {
                registry: Some("quay.io/".to_string()),
                image_path: Some("mirror".to_string()),
                ..Default::default()
            }),
        });

        let spec = installation.effective_spec();
        assert_eq!(spec.registry(), "my.registry/");
        assert_eq!(spec.image_path(), "mirror");
        assert_eq!(spec.image_prefix(), "");
        assert_eq!(installation.variant(), Some(ProductVariant::TigeraSecureEnterprise));
    }

    #[test]
    fn test_variant_comes_from_status() {
        let installation = Installation::new(
            INSTALLATION_NAME,
            InstallationSpec {
                variant: Some(ProductVariant::TigeraSecureEnterprise),
                ..Default::default()
            },
        );
        assert_eq!(installation.variant(), None);
    }
}
