// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

use crate::autobackup::BackupTask;
use crate::uploader::QueueSettings;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 引擎配置
    #[serde(default)]
    pub engine: EngineConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
    /// 备份任务列表
    #[serde(default)]
    pub tasks: Vec<BackupTask>,
}

/// 引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 去重日志根目录（每个任务一个子目录）
    pub cache_dir: PathBuf,
    /// 任务状态数据库
    pub status_db: PathBuf,
    /// 上传队列容量
    pub queue_capacity: usize,
    /// 写入完成检测轮询间隔（毫秒）
    pub completion_poll_interval_ms: u64,
    /// 写入完成检测最长等待时间（秒）
    pub completion_max_wait_secs: u64,
    /// 凭据密钥（Base64，32 字节），为空时凭据按明文处理
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("data/journal"),
            status_db: PathBuf::from("data/status.db"),
            queue_capacity: 1000,
            completion_poll_interval_ms: 1000,
            completion_max_wait_secs: 30 * 60,
            secret_key: None,
        }
    }
}

impl EngineConfig {
    /// 上传队列参数
    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            capacity: self.queue_capacity.max(1),
            poll_interval: Duration::from_millis(self.completion_poll_interval_ms.max(1)),
            max_wait: Duration::from_secs(self.completion_max_wait_secs),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// 默认日志级别（RUST_LOG 优先）
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 尝试保存默认配置
                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {}", e);
                }

                default_config
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autobackup::BackupMode;
    use tempfile::{tempdir, NamedTempFile};

    #[tokio::test]
    async fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.engine.queue_capacity, 1000);
        assert_eq!(config.log.level, "info");
        assert!(config.tasks.is_empty());

        let settings = config.engine.queue_settings();
        assert_eq!(settings.poll_interval, Duration::from_secs(1));
        assert_eq!(settings.max_wait, Duration::from_secs(1800));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();

        let mut config = AppConfig::default();
        config.engine.queue_capacity = 16;
        config.engine.secret_key = Some("a2V5".to_string());
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.engine.queue_capacity, 16);
        assert_eq!(loaded.engine.secret_key.as_deref(), Some("a2V5"));
    }

    #[tokio::test]
    async fn test_parse_tasks() {
        let content = r#"
            [engine]
            cache_dir = "/var/lib/backup/journal"
            completion_poll_interval_ms = 200

            [[tasks]]
            id = 1
            source_path = "/data/in"
            dest_path = "/backup"
            ignore_pattern = "\\.cache/"
            storage_engine = "s3"
            storage_config = '{"bucket":"b","region":"us-east-1"}'
            wait_for_completion = true
            ignore_wait_pattern = "\\.json$"

            [[tasks]]
            id = 2
            source_path = "/data/photos"
            dest_path = "/photos"
            storage_engine = "mock"
            mode = "full"
        "#;
        let config: AppConfig = toml::from_str(content).unwrap();

        assert_eq!(config.engine.cache_dir, PathBuf::from("/var/lib/backup/journal"));
        assert_eq!(config.engine.queue_capacity, 1000);
        assert_eq!(
            config.engine.queue_settings().poll_interval,
            Duration::from_millis(200)
        );
        assert_eq!(config.log.level, "info");

        assert_eq!(config.tasks.len(), 2);
        let first = &config.tasks[0];
        assert_eq!(first.ignore_pattern.as_deref(), Some(r"\.cache/"));
        assert!(first.wait_for_completion);
        assert_eq!(first.mode, BackupMode::Incremental);

        let second = &config.tasks[1];
        assert_eq!(second.mode, BackupMode::Full);
        assert!(second.storage_config.is_empty());
        assert!(!second.wait_for_completion);
    }

    #[tokio::test]
    async fn test_load_or_default_writes_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config/app.toml");
        let path = path.to_str().unwrap();

        let config = AppConfig::load_or_default(path).await;
        assert_eq!(config.engine.queue_capacity, 1000);
        assert!(std::path::Path::new(path).exists());

        let reloaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(reloaded.engine.cache_dir, config.engine.cache_dir);
    }
}
