use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, sync::broadcast};
use tracing::{error, info, warn};
use uuid::Uuid;
use zimfarm_api::create_app;
use zimfarm_config::AppConfig;
use zimfarm_dispatcher::SchedulerService;
use zimfarm_domain::Backend;
use zimfarm_infrastructure::{connect_store, DockerCli, LoggingIpChangeListener, WebhookNotifier};
use zimfarm_worker::{
    ExecutorOutcome, ExecutorSettings, FleetManager, FleetSettings, HttpBackend, TaskExecutor,
};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 调度服务 + HTTP API
    Dispatcher,
    /// 本机的 Worker Fleet Manager
    Worker,
    /// 执行单个任务，由Fleet Manager在容器中启动
    TaskExecutor(Uuid),
    /// 调度服务和Worker运行在同一进程
    All,
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    mode: AppMode,
}

impl Application {
    pub fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        match mode {
            AppMode::Dispatcher if !config.dispatcher.enabled => {
                return Err(anyhow::anyhow!("Dispatcher模式被禁用，请检查配置"));
            }
            AppMode::All if !config.dispatcher.enabled && !config.worker.enabled => {
                return Err(anyhow::anyhow!("Dispatcher和Worker均被禁用，请检查配置"));
            }
            _ => {}
        }
        info!("初始化应用程序，模式: {:?}", mode);
        Ok(Self { config, mode })
    }

    pub fn mode(&self) -> AppMode {
        self.mode
    }

    /// 运行应用程序，直到收到关闭信号或任务执行结束
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动应用程序，模式: {:?}", self.mode);

        match self.mode {
            AppMode::Dispatcher => {
                let service = self.build_service().await?;
                self.run_dispatcher(service, shutdown_rx).await
            }
            AppMode::Worker => self.run_worker(shutdown_rx).await,
            AppMode::TaskExecutor(task_id) => self.run_task_executor(task_id, shutdown_rx).await,
            AppMode::All => self.run_all_components(shutdown_rx).await,
        }
    }

    async fn build_service(&self) -> Result<Arc<SchedulerService>> {
        info!("连接任务存储: {}", self.config.database.url);
        let store = connect_store(&self.config.database)
            .await
            .context("连接任务存储失败")?;
        let notifier =
            WebhookNotifier::new(&self.config.notifications).context("创建通知器失败")?;

        Ok(Arc::new(SchedulerService::from_config(
            &self.config.dispatcher,
            store,
            Arc::new(notifier),
            Arc::new(LoggingIpChangeListener),
        )))
    }

    /// 运行调度服务的HTTP接口
    async fn run_dispatcher(
        &self,
        service: Arc<SchedulerService>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        let bind_address = &self.config.dispatcher.bind_address;
        let listener = TcpListener::bind(bind_address)
            .await
            .with_context(|| format!("绑定地址失败: {bind_address}"))?;
        info!("API服务器启动在 http://{}", bind_address);

        let app = create_app(service);
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("API服务器收到关闭信号");
        })
        .await
        .context("API服务器运行失败")?;

        info!("API服务器已停止");
        Ok(())
    }

    fn http_backends(&self) -> Result<Vec<Arc<dyn Backend>>> {
        self.config
            .worker
            .backends
            .iter()
            .map(|url| {
                HttpBackend::from_config(url, &self.config.worker)
                    .map(|backend| Arc::new(backend) as Arc<dyn Backend>)
                    .with_context(|| format!("创建调度后端客户端失败: {url}"))
            })
            .collect()
    }

    async fn run_worker(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!(
            worker = %self.config.worker.name,
            backends = ?self.config.worker.backends,
            "启动Worker"
        );

        let manager = FleetManager::new(
            FleetSettings::from_config(&self.config),
            self.http_backends()?,
            Arc::new(DockerCli::default()),
        )
        .context("创建Fleet Manager失败")?;
        manager.run(shutdown_rx).await.context("Worker运行失败")?;

        info!("Worker已停止");
        Ok(())
    }

    async fn run_task_executor(
        &self,
        task_id: Uuid,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        let backend = self
            .http_backends()?
            .into_iter()
            .next()
            .context("执行器需要一个调度后端")?;
        info!(%task_id, backend = backend.name(), "启动任务执行器");

        let executor = TaskExecutor::new(
            task_id,
            backend,
            Arc::new(DockerCli::default()),
            ExecutorSettings::from_config(&self.config.worker, &self.config.executor),
        );
        let outcome = executor
            .run(shutdown_rx)
            .await
            .with_context(|| format!("任务 {task_id} 执行失败"))?;

        match outcome {
            ExecutorOutcome::Succeeded => info!(%task_id, "任务执行成功"),
            ExecutorOutcome::Failed => warn!(%task_id, "任务执行失败"),
            ExecutorOutcome::Canceled => info!(%task_id, "任务已取消"),
        }
        Ok(())
    }

    /// 同一进程内运行调度服务和Worker；Worker仍通过配置的地址访问调度服务，
    /// 以便容器内的执行器使用同一地址
    async fn run_all_components(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动所有组件");

        let dispatcher = async {
            if !self.config.dispatcher.enabled {
                return Ok(());
            }
            let service = self.build_service().await?;
            self.run_dispatcher(service, shutdown_rx.resubscribe()).await
        };
        let worker = async {
            if !self.config.worker.enabled {
                return Ok(());
            }
            self.run_worker(shutdown_rx.resubscribe()).await
        };

        let (dispatcher_result, worker_result) = tokio::join!(dispatcher, worker);
        if let Err(ref e) = dispatcher_result {
            error!("Dispatcher运行失败: {e:#}");
        }
        if let Err(ref e) = worker_result {
            error!("Worker运行失败: {e:#}");
        }

        info!("所有组件已停止");
        dispatcher_result.and(worker_result)
    }
}
