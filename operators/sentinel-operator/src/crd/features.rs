//! 附加组件的自定义资源
//!
//! 每种附加组件对应一个集群级单例资源，名称固定为 `tigera-secure`。
//! 协调器只写入它们的 status 子资源。

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ResourceRequirements;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// 附加组件单例名称
pub const DEFAULT_INSTANCE_NAME: &str = "tigera-secure";

/// 组件就绪时写入的状态值
pub const STATE_READY: &str = "Ready";

/// 附加组件的通用状态
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FeatureStatus {
    /// 状态：Ready 或为空
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    /// 上次更新时间
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl FeatureStatus {
    pub fn ready() -> Self {
        Self {
            state: Some(STATE_READY.to_string()),
            last_updated: Some(Utc::now()),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state.as_deref() == Some(STATE_READY)
    }
}

/// 单个容器的资源配置
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerResources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

/// 运行时安全规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "operator.tigera.io", version = "v1", kind = "RuntimeSecurity")]
#[kube(status = "FeatureStatus")]
#[kube(printcolumn = r#"{"name":"状态", "type":"string", "jsonPath":".status.state"}"#)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSecuritySpec {
    /// sasha 容器配置
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sasha: Option<ContainerResources>,

    /// threat-id 容器配置
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threat_id: Option<ContainerResources>,
}

/// 镜像保障规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "operator.tigera.io", version = "v1", kind = "ImageAssurance")]
#[kube(status = "FeatureStatus")]
#[kube(printcolumn = r#"{"name":"状态", "type":"string", "jsonPath":".status.state"}"#)]
#[serde(rename_all = "camelCase")]
pub struct ImageAssuranceSpec {
    /// 镜像保障 API 代理地址
    #[serde(default, rename = "apiProxyURL")]
    pub api_proxy_url: String,
}

/// API Server 规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "operator.tigera.io", version = "v1", kind = "APIServer")]
#[kube(status = "FeatureStatus")]
#[kube(printcolumn = r#"{"name":"状态", "type":"string", "jsonPath":".status.state"}"#)]
pub struct APIServerSpec {}

/// 日志存储规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "operator.tigera.io", version = "v1", kind = "LogStorage")]
#[kube(status = "FeatureStatus")]
#[kube(printcolumn = r#"{"name":"状态", "type":"string", "jsonPath":".status.state"}"#)]
#[serde(rename_all = "camelCase")]
pub struct LogStorageSpec {
    /// 日志保留天数
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_days: Option<u32>,
}

/// Manager 规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "operator.tigera.io", version = "v1", kind = "Manager")]
#[kube(status = "FeatureStatus")]
#[kube(printcolumn = r#"{"name":"状态", "type":"string", "jsonPath":".status.state"}"#)]
pub struct ManagerSpec {}

/// OIDC 配置
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationOIDC {
    #[serde(rename = "issuerURL")]
    pub issuer_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_claim: Option<String>,
}

/// 认证规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "operator.tigera.io", version = "v1", kind = "Authentication")]
#[kube(status = "FeatureStatus")]
#[kube(printcolumn = r#"{"name":"状态", "type":"string", "jsonPath":".status.state"}"#)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationSpec {
    /// Manager 对外访问域名
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager_domain: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oidc: Option<AuthenticationOIDC>,
}

impl Authentication {
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().is_some_and(FeatureStatus::is_ready)
    }

    /// 认证状态，未设置时为空字符串
    pub fn state(&self) -> &str {
        self.status
            .as_ref()
            .and_then(|status| status.state.as_deref())
            .unwrap_or_default()
    }
}
