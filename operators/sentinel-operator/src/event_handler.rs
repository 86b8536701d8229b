//! License 事件处理模块
//!
//! LicenseKey API 由 APIServer 组件提供。该模块定期探测 API 是否已注册，
//! 注册完成后标记 License 就绪并触发所有控制器做一次完整协调；之后监听
//! LicenseKey 的变化，每次变化同样触发完整协调。

use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use kube::api::Api;
use kube::client::Client;
use kube::runtime::{watcher, WatchStreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{api_resource, ClusterClient};
use crate::controller::ReadyFlag;
use crate::crd::LicenseKey;
use crate::error::Result;

/// 探测 License API 并广播触发信号
#[derive(Clone)]
struct LicenseGate {
    client: Arc<dyn ClusterClient>,
    ready: ReadyFlag,
    triggers: Vec<mpsc::UnboundedSender<()>>,
}

impl LicenseGate {
    async fn check_once(&self) -> Result<bool> {
        if self.ready.is_ready() {
            return Ok(true);
        }
        if !self.client.api_available(&api_resource::<LicenseKey>()).await? {
            debug!("LicenseKey API 尚未注册");
            return Ok(false);
        }

        info!("LicenseKey API 已就绪");
        self.ready.mark_ready();
        self.trigger_all();
        Ok(true)
    }

    fn trigger_all(&self) {
        for trigger in &self.triggers {
            if trigger.unbounded_send(()).is_err() {
                debug!("控制器已停止，忽略触发");
            }
        }
    }

    /// 轮询直到 License API 就绪或监视器停止，返回是否就绪
    async fn wait_until_ready(&self, interval: Duration, running: &RwLock<bool>) -> bool {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if !*running.read().await {
                return false;
            }
            match self.check_once().await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => warn!("检查 LicenseKey API 失败: {}", e),
            }
        }
    }
}

/// 监听出错后按指数退避再重新连接
fn with_backoff<S, T>(events: S) -> BoxStream<'static, watcher::Result<T>>
where
    S: Stream<Item = watcher::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    events.default_backoff().boxed()
}

/// License 监视器
pub struct LicenseWatcher {
    gate: LicenseGate,
    /// 探测间隔
    interval: Duration,
    /// 是否正在运行
    running: Arc<RwLock<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl LicenseWatcher {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        ready: ReadyFlag,
        triggers: Vec<mpsc::UnboundedSender<()>>,
        interval: Duration,
    ) -> Self {
        Self {
            gate: LicenseGate {
                client,
                ready,
                triggers,
            },
            interval,
            running: Arc::new(RwLock::new(false)),
            handle: None,
        }
    }

    /// 启动监视任务
    pub async fn start(&mut self, client: Client) -> Result<()> {
        {
            let mut running = self.running.write().await;
            if *running {
                return Ok(());
            }
            *running = true;
        }

        let gate = self.gate.clone();
        let interval = self.interval;
        let running = self.running.clone();

        self.handle = Some(tokio::spawn(async move {
            info!("等待 LicenseKey API 就绪");
            if !gate.wait_until_ready(interval, &running).await {
                return;
            }

            let api: Api<LicenseKey> = Api::all(client);
            let mut events = with_backoff(watcher(api, watcher::Config::default()));
            info!("启动 LicenseKey 监听器");

            while let Some(event) = events.next().await {
                if !*running.read().await {
                    break;
                }
                match event {
                    Ok(_) => {
                        debug!("LicenseKey 发生变化");
                        gate.trigger_all();
                    }
                    Err(e) => warn!("LicenseKey 监听错误: {}", e),
                }
            }
            info!("LicenseKey 监听器已停止");
        }));

        Ok(())
    }

    /// 停止监视任务
    pub async fn stop(&self) -> Result<()> {
        {
            let mut running = self.running.write().await;
            *running = false;
        }
        if let Some(handle) = &self.handle {
            handle.abort();
        }

        Ok(())
    }

    /// 探测一次 License API
    pub async fn check_once(&self) -> Result<bool> {
        self.gate.check_once().await
    }

    /// 触发所有控制器做一次完整协调
    pub fn trigger_all(&self) {
        self.gate.trigger_all();
    }
}
