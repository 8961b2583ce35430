use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;
use zimfarm::app::{AppMode, Application};
use zimfarm::shutdown::{wait_for_shutdown_signal, ShutdownManager};
use zimfarm_config::{AppConfig, ObservabilityConfig};

fn cli() -> Command {
    Command::new("zimfarm")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Zimfarm 容器化任务调度系统")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，未指定时按默认位置查找")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .global(true),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty"])
                .global(true),
        )
        .subcommand(Command::new("dispatcher").about("运行调度服务和HTTP接口"))
        .subcommand(Command::new("worker").about("运行本机的Worker"))
        .subcommand(
            Command::new("task-executor")
                .about("执行单个任务")
                .arg(
                    Arg::new("task-id")
                        .long("task-id")
                        .value_name("UUID")
                        .help("要执行的任务ID")
                        .value_parser(clap::value_parser!(Uuid))
                        .required(true),
                ),
        )
        .subcommand(Command::new("all").about("在同一进程中运行调度服务和Worker"))
}

fn parse_app_mode(matches: &ArgMatches) -> Result<AppMode> {
    match matches.subcommand() {
        Some(("dispatcher", _)) => Ok(AppMode::Dispatcher),
        Some(("worker", _)) => Ok(AppMode::Worker),
        Some(("task-executor", sub)) => {
            let task_id = sub
                .get_one::<Uuid>("task-id")
                .copied()
                .context("缺少 --task-id")?;
            Ok(AppMode::TaskExecutor(task_id))
        }
        Some(("all", _)) => Ok(AppMode::All),
        Some((other, _)) => Err(anyhow::anyhow!("不支持的运行模式: {other}")),
        None => Err(anyhow::anyhow!("缺少运行模式")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    let config_path = matches.get_one::<String>("config").map(String::as_str);

    let mut config =
        AppConfig::load(config_path).context("加载配置失败")?;
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.observability.log_format = format.clone();
    }

    init_logging(&config.observability)?;

    let mode = parse_app_mode(&matches)?;
    info!("启动Zimfarm，运行模式: {:?}", mode);
    if let Some(path) = config_path {
        info!("配置文件: {path}");
    }

    // 执行器容器与Worker在同一主机上，不重复绑定指标端口
    if !matches!(mode, AppMode::TaskExecutor(_)) {
        init_metrics(&config.observability)?;
    }

    // 执行器走完取消流程，且要早于管理器的 docker stop 宽限期结束
    let grace = Duration::from_secs(
        config.executor.cancel_budget_seconds() + config.worker.stop_grace_seconds / 2,
    );
    let app = Application::new(config, mode)?;
    let shutdown_manager = ShutdownManager::new();

    let mut app_handle = {
        let shutdown_rx = shutdown_manager.subscribe();
        tokio::spawn(async move { app.run(shutdown_rx).await })
    };

    tokio::select! {
        result = &mut app_handle => {
            // 执行器完成任务后自行退出
            return match result {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("应用任务异常退出: {e}")),
            };
        }
        _ = wait_for_shutdown_signal() => {
            info!("收到关闭信号，开始优雅关闭...");
        }
    }

    shutdown_manager.shutdown();

    match tokio::time::timeout(grace, app_handle).await {
        Ok(Ok(Ok(()))) => info!("应用已优雅关闭"),
        Ok(Ok(Err(e))) => error!("应用关闭时发生错误: {e:#}"),
        Ok(Err(e)) => error!("应用任务异常退出: {e}"),
        Err(_) => warn!("应用关闭超时，强制退出"),
    }

    info!("Zimfarm已退出");
    Ok(())
}

/// 初始化日志系统，`RUST_LOG` 优先于配置
fn init_logging(config: &ObservabilityConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match config.log_format.as_str() {
        "json" => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        "pretty" => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
        other => {
            return Err(anyhow::anyhow!("不支持的日志格式: {other}"));
        }
    }

    Ok(())
}

/// 启用时安装Prometheus导出器
fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    if !config.metrics_enabled {
        return Ok(());
    }

    let address: SocketAddr = config
        .metrics_bind_address
        .parse()
        .with_context(|| format!("无效的指标监听地址: {}", config.metrics_bind_address))?;
    PrometheusBuilder::new()
        .with_http_listener(address)
        .install()
        .context("安装Prometheus导出器失败")?;

    info!("Prometheus指标导出在 http://{}/metrics", address);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_modes() {
        let id = Uuid::new_v4();
        let matches = cli()
            .try_get_matches_from([
                "zimfarm",
                "--config",
                "/tmp/executor.toml",
                "task-executor",
                "--task-id",
                &id.to_string(),
            ])
            .unwrap();
        assert_eq!(parse_app_mode(&matches).unwrap(), AppMode::TaskExecutor(id));
        assert_eq!(
            matches.get_one::<String>("config").map(String::as_str),
            Some("/tmp/executor.toml")
        );

        let matches = cli()
            .try_get_matches_from(["zimfarm", "worker", "--log-format", "json"])
            .unwrap();
        assert_eq!(parse_app_mode(&matches).unwrap(), AppMode::Worker);
        assert_eq!(
            matches.get_one::<String>("log-format").map(String::as_str),
            Some("json")
        );

        assert!(cli().try_get_matches_from(["zimfarm", "task-executor"]).is_err());
        assert!(cli().try_get_matches_from(["zimfarm"]).is_err());
    }
}
