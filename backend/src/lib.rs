// Backup Engine Rust Library
// 持续文件备份引擎核心库

// 自动备份模块（任务、去重日志、监听、全量扫描）
pub mod autobackup;

// 配置管理模块
pub mod config;

// 凭据加密模块
pub mod encryption;

// 远端存储模块
pub mod storage;

// 上传队列模块
pub mod uploader;

// 导出常用类型
pub use autobackup::{BackupEngine, BackupError, BackupMode, BackupTask, ScanState, TaskStatus};
pub use config::AppConfig;
pub use storage::{StorageBackend, StorageEngine, StorageRegistry};
pub use uploader::{QueueSettings, UploadQueue};
