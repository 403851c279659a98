use std::sync::Arc;

use anyhow::Context;
use backup_engine::{AppConfig, BackupEngine, BackupMode};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// 默认配置文件路径
const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    // 日志级别需要先读取配置，配置加载期间的日志在订阅器安装后补记
    let loaded = AppConfig::load_from_file(&config_path).await;
    let level = loaded
        .as_ref()
        .map(|c| c.log.level.clone())
        .unwrap_or_else(|_| "info".to_string());

    // 初始化日志系统（RUST_LOG 优先）
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .init();

    info!("Backup Engine v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let config = match loaded {
        Ok(config) => {
            info!("配置文件加载成功: {}", config_path);
            config
        }
        Err(_) => AppConfig::load_or_default(&config_path).await,
    };

    let engine = Arc::new(
        BackupEngine::from_config(&config.engine).context("Failed to create backup engine")?,
    );
    info!("备份引擎初始化完成，共 {} 个任务", config.tasks.len());

    for task in &config.tasks {
        match task.mode {
            BackupMode::Incremental => {
                if let Err(e) = engine.start(task).await {
                    error!("任务 {} 启动失败: {}", task.display_name(), e);
                }
            }
            BackupMode::Full => match engine.spawn_full_scan(task) {
                Ok(handle) => {
                    let name = task.display_name();
                    tokio::spawn(async move {
                        match handle.await {
                            Ok(Ok(report)) => info!("任务 {} 全量扫描完成: {}", name, report.summary()),
                            Ok(Err(e)) => warn!("任务 {} 全量扫描结束: {}", name, e),
                            Err(e) => error!("任务 {} 全量扫描异常退出: {}", name, e),
                        }
                    });
                }
                Err(e) => error!("任务 {} 全量扫描启动失败: {}", task.display_name(), e),
            },
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("收到退出信号");

    engine.shutdown().await;

    Ok(())
}
