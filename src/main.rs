use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use fleet_core::{init_logging, AppConfig};
use fleet_scheduler::app::FleetApplication;
use fleet_scheduler::shutdown::ShutdownManager;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("fleet-scheduler")
        .version("1.0.0")
        .about("设备集群远程指令调度系统")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，缺省时按默认路径查找")
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
        .subcommand_required(true)
        .subcommand(Command::new("run").about("持续运行到期任务扫描，直到收到关闭信号"))
        .subcommand(Command::new("scan").about("执行一次到期任务扫描后退出"))
        .subcommand(Command::new("config").about("校验并打印生效的配置"))
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let config = AppConfig::load(config_path).with_context(|| match config_path {
        Some(path) => format!("加载配置文件失败: {path}"),
        None => "加载配置失败".to_string(),
    })?;

    match matches.subcommand() {
        Some(("config", _)) => {
            println!("{}", config.to_toml()?);
            Ok(())
        }
        Some(("scan", _)) => {
            init_cli_logging(&matches, &config)?;
            let app = FleetApplication::new(config).await?;
            let summary = app.scan_once().await?;
            info!(
                examined = summary.examined,
                dispatched = summary.dispatched(),
                errors = summary.errors,
                "单次扫描完成"
            );
            Ok(())
        }
        Some(("run", _)) => {
            init_cli_logging(&matches, &config)?;
            run(config).await
        }
        _ => Err(anyhow::anyhow!("未知的子命令")),
    }
}

fn init_cli_logging(matches: &ArgMatches, config: &AppConfig) -> Result<()> {
    let log_level = matches
        .get_one::<String>("log-level")
        .unwrap_or(&config.observability.log_level);
    let log_format = matches
        .get_one::<String>("log-format")
        .unwrap_or(&config.observability.log_format);
    init_logging(log_level, log_format)
}

async fn run(config: AppConfig) -> Result<()> {
    info!("启动设备集群调度服务");

    let app = Arc::new(FleetApplication::new(config).await?);
    let shutdown_manager = ShutdownManager::new();

    let app_handle = {
        let app = Arc::clone(&app);
        let shutdown_rx = shutdown_manager.subscribe();
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!("服务运行失败: {e}");
            }
        })
    };

    wait_for_shutdown_signal().await?;
    info!("收到关闭信号，开始优雅关闭...");
    shutdown_manager.shutdown();

    match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
        Ok(Ok(())) => info!("服务已优雅关闭"),
        Ok(Err(e)) => error!("服务关闭时发生错误: {e}"),
        Err(_) => warn!("服务关闭超时，强制退出"),
    }

    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("安装SIGTERM信号处理器失败")?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result.context("安装Ctrl+C信号处理器失败")?;
                info!("收到Ctrl+C信号");
            }
            _ = terminate.recv() => {
                info!("收到SIGTERM信号");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.context("安装Ctrl+C信号处理器失败")?;
        info!("收到Ctrl+C信号");
    }

    Ok(())
}
