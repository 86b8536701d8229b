//! TigeraStatus 资源
//!
//! 每个组件一个集群级对象，汇总该组件的 Available / Progressing / Degraded 条件。

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const CONDITION_AVAILABLE: &str = "Available";
pub const CONDITION_PROGRESSING: &str = "Progressing";
pub const CONDITION_DEGRADED: &str = "Degraded";

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "operator.tigera.io", version = "v1", kind = "TigeraStatus")]
#[kube(status = "TigeraStatusStatus")]
#[kube(printcolumn = r#"{"name":"可用", "type":"string", "jsonPath":".status.conditions[?(@.type=='Available')].status"}"#)]
#[kube(printcolumn = r#"{"name":"降级", "type":"string", "jsonPath":".status.conditions[?(@.type=='Degraded')].status"}"#)]
pub struct TigeraStatusSpec {}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct TigeraStatusStatus {
    #[serde(default)]
    pub conditions: Vec<TigeraStatusCondition>,
}

/// 状态条件
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TigeraStatusCondition {
    #[serde(rename = "type")]
    pub type_: String,
    /// "True" 或 "False"
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl TigeraStatusStatus {
    pub fn condition(&self, type_: &str) -> Option<&TigeraStatusCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}
