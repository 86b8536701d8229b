//! 控制器模块
//!
//! 该模块为每种附加组件 CR 启动一个 kube-runtime 控制器。所有组件 CR 都是名为
//! `tigera-secure` 的集群级单例，依赖对象的变化一律映射为对该单例的一次协调；
//! License API 就绪时，所有控制器会被统一触发一次完整协调。

pub mod api_server;
pub mod image_assurance;
pub mod imageset;
pub mod log_storage;
pub mod manager;
pub mod runtime_security;
pub mod utils;
pub mod watches;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller as KubeController, Error as ControllerError};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::certificates::CertificateManager;
use crate::client::{api_resource, ClusterClient, KubeClusterClient};
use crate::config::OperatorOptions;
use crate::crd::{
    APIServer, FeatureStatus, ImageAssurance, LogStorage, Manager, RuntimeSecurity,
    DEFAULT_INSTANCE_NAME,
};
use crate::error::{Error, Result};
use crate::event_handler::LicenseWatcher;
use crate::status::{StatusManager, StatusTracker};

pub use utils::{ComponentHandler, ReadyFlag};
pub use watches::WatchTarget;

/// 前置条件满足但工作负载尚未就绪时的重新协调间隔
pub const REQUEUE_WAITING: Duration = Duration::from_secs(30);

/// 协调出错后的重试间隔
pub const REQUEUE_ON_ERROR: Duration = Duration::from_secs(60);

/// 协调器共享上下文
#[derive(Clone)]
pub struct Context {
    /// 集群客户端
    pub client: Arc<dyn ClusterClient>,
    /// 运行参数
    pub options: OperatorOptions,
    /// License API 就绪信号
    pub license_ready: ReadyFlag,
}

impl Context {
    pub fn new(client: Arc<dyn ClusterClient>, options: OperatorOptions, license_ready: ReadyFlag) -> Self {
        Self {
            client,
            options,
            license_ready,
        }
    }
}

/// 带 `FeatureStatus` 的组件 CR
pub trait Feature:
    Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static
{
    fn feature_status(&self) -> Option<&FeatureStatus>;
}

macro_rules! impl_feature {
    ($($kind:ty),*) => {
        $(
            impl Feature for $kind {
                fn feature_status(&self) -> Option<&FeatureStatus> {
                    self.status.as_ref()
                }
            }
        )*
    };
}

impl_feature!(RuntimeSecurity, ImageAssurance, APIServer, LogStorage, Manager);

/// 组件协调器
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// 协调器负责的组件 CR
    type Resource: Feature;

    /// 组件名称，同时也是 TigeraStatus 对象的名称
    fn name(&self) -> &'static str;

    /// 除组件 CR 之外需要监视的对象
    fn watches(&self) -> Vec<WatchTarget>;

    async fn reconcile(&self) -> Result<Action>;
}

/// 失败时设置降级并原样返回错误
pub(crate) async fn or_degrade<T>(
    status: &dyn StatusManager,
    reason: &str,
    result: Result<T>,
) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(e) => {
            warn!("{}: {}", reason, e);
            status.set_degraded(reason, &e.to_string()).await;
            Err(e)
        }
    }
}

/// 读取依赖对象
///
/// 对象不存在时以 `waiting` 降级并返回 `None`；其他错误以 `failure` 降级并返回错误。
pub(crate) async fn require<T>(
    status: &dyn StatusManager,
    result: Result<T>,
    waiting: &str,
    failure: &str,
) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => {
            info!("{}", waiting);
            status.set_degraded(waiting, &e.to_string()).await;
            Ok(None)
        }
        Err(e) => or_degrade(status, failure, Err(e)).await,
    }
}

/// 与 `require` 相同，用于以 `None` 表示缺失的查询
pub(crate) async fn require_present<T>(
    status: &dyn StatusManager,
    result: Result<Option<T>>,
    waiting: &str,
    failure: &str,
) -> Result<Option<T>> {
    match or_degrade(status, failure, result).await? {
        Some(value) => Ok(Some(value)),
        None => {
            info!("{}", waiting);
            status.set_degraded(waiting, "").await;
            Ok(None)
        }
    }
}

/// 读取 CA，CA 尚未签发时返回 `None`
pub(crate) async fn certificate_manager(
    context: &Context,
    status: &dyn StatusManager,
) -> Result<Option<CertificateManager>> {
    require(
        status,
        CertificateManager::create(context.client.as_ref(), &context.options.operator_namespace)
            .await,
        "Waiting for the Tigera CA to become available",
        "Unable to create the Tigera CA",
    )
    .await
}

/// 协调的最后一步
///
/// 清除降级；工作负载尚未全部就绪时 30 秒后重新协调，否则把 CR 标记为 Ready。
pub(crate) async fn mark_ready<K: Feature>(
    client: &dyn ClusterClient,
    status: &dyn StatusManager,
    resource: &K,
) -> Result<Action> {
    status.clear_degraded().await;

    if !status.is_available().await {
        debug!("{} 的工作负载尚未就绪", K::kind(&()));
        return Ok(Action::requeue(REQUEUE_WAITING));
    }

    if !resource.feature_status().is_some_and(FeatureStatus::is_ready) {
        client
            .patch_status(
                &api_resource::<K>(),
                &resource.name_any(),
                serde_json::to_value(FeatureStatus::ready())?,
            )
            .await?;
        info!("{} 已就绪", K::kind(&()));
    }

    Ok(Action::await_change())
}

async fn reconcile<R: Reconciler>(_object: Arc<R::Resource>, reconciler: Arc<R>) -> Result<Action> {
    debug!("开始协调 {}", reconciler.name());
    reconciler.reconcile().await
}

fn error_policy<R: Reconciler>(
    _object: Arc<R::Resource>,
    error: &Error,
    reconciler: Arc<R>,
) -> Action {
    warn!("{} 协调失败: {}", reconciler.name(), error);
    Action::requeue(REQUEUE_ON_ERROR)
}

/// 运行单个组件的控制器，直到收到退出信号
async fn run_controller<R: Reconciler>(
    client: Client,
    reconciler: Arc<R>,
    trigger: mpsc::UnboundedReceiver<()>,
) {
    let name = reconciler.name();
    let mut controller = KubeController::new(
        Api::<R::Resource>::all(client.clone()),
        watcher::Config::default(),
    );

    for target in reconciler.watches() {
        debug!("{} 监视 {}", name, target);
        controller = controller.watches_with(
            target.api(client.clone()),
            target.resource.clone(),
            target.watcher_config(),
            |_| Some(ObjectRef::<R::Resource>::new(DEFAULT_INSTANCE_NAME)),
        );
    }

    info!("启动 {} 控制器", name);
    controller
        .reconcile_all_on(trigger)
        .shutdown_on_signal()
        .run(reconcile::<R>, error_policy::<R>, reconciler.clone())
        .for_each(|result| {
            let reconciler = reconciler.clone();
            async move {
                match result {
                    Ok((object, action)) => debug!("{} 协调完成: {:?}", object.name, action),
                    // 组件 CR 已被删除，仍需协调一次以清理状态
                    Err(ControllerError::ObjectNotFound(object)) => {
                        debug!("{} 不存在", object.name);
                        if let Err(e) = reconciler.reconcile().await {
                            warn!("{} 清理失败: {}", reconciler.name(), e);
                        }
                    }
                    Err(e) => warn!("{} 控制器错误: {}", reconciler.name(), e),
                }
            }
        })
        .await;
    info!("{} 控制器已停止", name);
}

/// 控制器结构体
pub struct Controller {
    /// Kubernetes 客户端
    client: Client,
    /// 协调器共享上下文
    context: Arc<Context>,
    /// 每个控制器的全量协调触发器
    triggers: Vec<mpsc::UnboundedSender<()>>,
    /// License 监视器
    event_handler: Option<LicenseWatcher>,
    /// 控制器与状态跟踪任务
    handles: Vec<JoinHandle<()>>,
    /// 控制器是否正在运行
    running: Arc<RwLock<bool>>,
}

impl Controller {
    /// 创建新的控制器
    pub fn new(client: Client, options: OperatorOptions) -> Self {
        let cluster: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::new(client.clone()));
        let context = Arc::new(Context::new(cluster, options, ReadyFlag::new()));

        Self {
            client,
            context,
            triggers: Vec::new(),
            event_handler: None,
            handles: Vec::new(),
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// 启动所有控制器
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut running = self.running.write().await;
            if *running {
                return Ok(());
            }
            *running = true;
        }

        let context = self.context.clone();
        let status = self.tracker(runtime_security::NAME);
        self.spawn(runtime_security::RuntimeSecurityReconciler::new(context.clone(), status));
        let status = self.tracker(image_assurance::NAME);
        self.spawn(image_assurance::ImageAssuranceReconciler::new(context.clone(), status));
        let status = self.tracker(api_server::NAME);
        self.spawn(api_server::ApiServerReconciler::new(context.clone(), status));
        let status = self.tracker(manager::NAME);
        self.spawn(manager::ManagerReconciler::new(context.clone(), status));

        if context.options.elastic_external {
            let status = self.tracker(log_storage::NAME);
            self.spawn(log_storage::LogStorageReconciler::new(context.clone(), status));
        } else {
            info!("未启用外部 Elasticsearch，跳过 LogStorage 控制器");
        }

        let mut event_handler = LicenseWatcher::new(
            context.client.clone(),
            context.license_ready.clone(),
            self.triggers.clone(),
            context.options.license_interval(),
        );
        event_handler.start(self.client.clone()).await?;
        self.event_handler = Some(event_handler);

        info!("Sentinel Operator 控制器已启动");

        Ok(())
    }

    /// 停止所有控制器
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut running = self.running.write().await;
            if !*running {
                return Ok(());
            }
            *running = false;
        }

        if let Some(event_handler) = self.event_handler.take() {
            event_handler.stop().await?;
        }
        self.triggers.clear();
        for handle in self.handles.drain(..) {
            handle.abort();
        }

        info!("Sentinel Operator 控制器已停止");

        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// 创建状态跟踪器并启动其发布任务
    fn tracker(&mut self, component: &str) -> Arc<dyn StatusManager> {
        let tracker = StatusTracker::new(component);
        self.handles.push(tokio::spawn(tracker.clone().run(
            self.context.client.clone(),
            self.context.options.status_interval(),
        )));
        Arc::new(tracker)
    }

    fn spawn<R: Reconciler>(&mut self, reconciler: R) {
        let (tx, rx) = mpsc::unbounded();
        self.triggers.push(tx);
        self.handles.push(tokio::spawn(run_controller(
            self.client.clone(),
            Arc::new(reconciler),
            rx,
        )));
    }
}
