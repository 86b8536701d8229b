//! 组件状态跟踪模块
//!
//! 每个协调器持有一个 `StatusManager`，用于记录降级原因与工作负载就绪情况，
//! 并将汇总结果发布为与组件同名的 `TigeraStatus` 对象。

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::client::{self, api_resource, ClusterClient};
use crate::crd::tigera_status::{
    TigeraStatus, TigeraStatusCondition, TigeraStatusSpec, TigeraStatusStatus,
    CONDITION_AVAILABLE, CONDITION_DEGRADED, CONDITION_PROGRESSING,
};
use crate::error::Result;

/// 工作负载类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WorkloadKind {
    Deployment,
    DaemonSet,
    StatefulSet,
    CronJob,
    Job,
}

/// 被跟踪的工作负载
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Workload {
    pub kind: WorkloadKind,
    pub namespace: String,
    pub name: String,
}

impl Workload {
    pub fn new(kind: WorkloadKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// 按对象种类识别工作负载，非工作负载返回 `None`
    pub fn from_kind(kind: &str, namespace: &str, name: &str) -> Option<Self> {
        let kind = match kind {
            "Deployment" => WorkloadKind::Deployment,
            "DaemonSet" => WorkloadKind::DaemonSet,
            "StatefulSet" => WorkloadKind::StatefulSet,
            "CronJob" => WorkloadKind::CronJob,
            "Job" => WorkloadKind::Job,
            _ => return None,
        };
        Some(Self::new(kind, namespace, name))
    }
}

impl std::fmt::Display for Workload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// 组件状态管理接口
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusManager: Send + Sync {
    /// 找到了组件 CR
    async fn on_cr_found(&self);

    /// 组件 CR 不存在，清除全部状态
    async fn on_cr_not_found(&self);

    /// 设置降级原因，后写入者覆盖先写入者
    async fn set_degraded(&self, reason: &str, detail: &str);

    async fn clear_degraded(&self);

    /// 开始跟踪工作负载
    async fn track(&self, workloads: Vec<Workload>);

    /// 停止跟踪工作负载
    async fn untrack(&self, workloads: Vec<Workload>);

    /// 所有被跟踪的工作负载是否都已就绪
    async fn is_available(&self) -> bool;
}

#[derive(Default, Debug)]
struct TrackerState {
    cr_found: bool,
    degraded: Option<(String, String)>,
    workloads: BTreeMap<Workload, bool>,
}

/// `StatusManager` 的生产实现
#[derive(Clone)]
pub struct StatusTracker {
    component: String,
    state: Arc<RwLock<TrackerState>>,
}

impl StatusTracker {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            state: Arc::new(RwLock::new(TrackerState::default())),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    /// 当前降级原因与详情
    pub async fn degraded(&self) -> Option<(String, String)> {
        self.state.read().await.degraded.clone()
    }

    /// 刷新所有被跟踪工作负载的就绪状态
    pub async fn refresh(&self, client: &dyn ClusterClient) -> Result<()> {
        let workloads: Vec<Workload> = self.state.read().await.workloads.keys().cloned().collect();

        let mut observed = Vec::with_capacity(workloads.len());
        for workload in workloads {
            let ready = workload_ready(client, &workload).await?;
            if !ready {
                debug!("{} 尚未就绪", workload);
            }
            observed.push((workload, ready));
        }

        let mut state = self.state.write().await;
        for (workload, ready) in observed {
            // 刷新期间被取消跟踪的工作负载不再写回
            if let Some(entry) = state.workloads.get_mut(&workload) {
                *entry = ready;
            }
        }

        Ok(())
    }

    /// 计算当前的状态条件
    async fn conditions(&self) -> Option<(bool, bool, Option<(String, String)>)> {
        let state = self.state.read().await;
        if !state.cr_found {
            return None;
        }
        let all_ready = state.workloads.values().all(|ready| *ready);
        Some((all_ready, state.degraded.is_none(), state.degraded.clone()))
    }

    /// 将当前状态发布到 `TigeraStatus`
    pub async fn publish(&self, client: &dyn ClusterClient) -> Result<()> {
        let Some((all_ready, healthy, degraded)) = self.conditions().await else {
            return client
                .delete(&api_resource::<TigeraStatus>(), None, &self.component)
                .await;
        };

        let previous = client::get_opt::<TigeraStatus>(client, None, &self.component)
            .await?
            .and_then(|status| status.status)
            .unwrap_or_default();

        let (reason, message) = degraded.unwrap_or_default();
        let conditions = vec![
            condition(&previous, CONDITION_AVAILABLE, healthy && all_ready, "", ""),
            condition(&previous, CONDITION_PROGRESSING, healthy && !all_ready, "", ""),
            condition(&previous, CONDITION_DEGRADED, !healthy, &reason, &message),
        ];

        // 主资源只承载元数据，条件必须写入 status 子资源
        client::apply(client, &TigeraStatus::new(&self.component, TigeraStatusSpec {})).await?;
        client
            .patch_status(
                &api_resource::<TigeraStatus>(),
                &self.component,
                serde_json::to_value(TigeraStatusStatus { conditions })?,
            )
            .await
    }

    /// 定期刷新并发布状态，直到任务被取消
    pub async fn run(self, client: Arc<dyn ClusterClient>, interval: Duration) {
        info!("启动 {} 状态跟踪", self.component);
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.refresh(client.as_ref()).await {
                warn!("刷新 {} 工作负载状态失败: {}", self.component, e);
                continue;
            }
            if let Err(e) = self.publish(client.as_ref()).await {
                warn!("发布 {} 状态失败: {}", self.component, e);
            }
        }
    }
}

/// 构造条件，状态未翻转时沿用原有的转换时间
fn condition(
    previous: &TigeraStatusStatus,
    type_: &str,
    active: bool,
    reason: &str,
    message: &str,
) -> TigeraStatusCondition {
    let status = if active { "True" } else { "False" };
    let last_transition_time = previous
        .condition(type_)
        .filter(|c| c.status == status)
        .map(|c| c.last_transition_time)
        .unwrap_or_else(Utc::now);

    TigeraStatusCondition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time,
    }
}

async fn workload_ready(client: &dyn ClusterClient, workload: &Workload) -> Result<bool> {
    let ns = Some(workload.namespace.as_str());
    let name = workload.name.as_str();

    let ready = match workload.kind {
        WorkloadKind::Deployment => client::get_opt::<Deployment>(client, ns, name)
            .await?
            .map(|d| {
                let desired = d.spec.and_then(|s| s.replicas).unwrap_or(1);
                let ready = d.status.and_then(|s| s.ready_replicas).unwrap_or(0);
                ready >= desired
            }),
        WorkloadKind::StatefulSet => client::get_opt::<StatefulSet>(client, ns, name)
            .await?
            .map(|s| {
                let desired = s.spec.and_then(|s| s.replicas).unwrap_or(1);
                let ready = s.status.and_then(|s| s.ready_replicas).unwrap_or(0);
                ready >= desired
            }),
        WorkloadKind::DaemonSet => client::get_opt::<DaemonSet>(client, ns, name)
            .await?
            .and_then(|d| d.status)
            .map(|s| s.number_available.unwrap_or(0) >= s.desired_number_scheduled),
        WorkloadKind::Job => client::get_opt::<Job>(client, ns, name)
            .await?
            .map(|j| j.status.and_then(|s| s.succeeded).unwrap_or(0) > 0),
        WorkloadKind::CronJob => client::get_opt::<CronJob>(client, ns, name)
            .await?
            .map(|_| true),
    };

    Ok(ready.unwrap_or(false))
}

#[async_trait]
impl StatusManager for StatusTracker {
    async fn on_cr_found(&self) {
        self.state.write().await.cr_found = true;
    }

    async fn on_cr_not_found(&self) {
        let mut state = self.state.write().await;
        *state = TrackerState::default();
        debug!("{} CR 不存在，已清除状态", self.component);
    }

    async fn set_degraded(&self, reason: &str, detail: &str) {
        warn!("{} 降级: {} {}", self.component, reason, detail);
        self.state.write().await.degraded = Some((reason.to_string(), detail.to_string()));
    }

    async fn clear_degraded(&self) {
        self.state.write().await.degraded = None;
    }

    async fn track(&self, workloads: Vec<Workload>) {
        let mut state = self.state.write().await;
        for workload in workloads {
            state.workloads.entry(workload).or_insert(false);
        }
    }

    async fn untrack(&self, workloads: Vec<Workload>) {
        let mut state = self.state.write().await;
        for workload in &workloads {
            state.workloads.remove(workload);
        }
    }

    async fn is_available(&self) -> bool {
        self.state.read().await.workloads.values().all(|ready| *ready)
    }
}
