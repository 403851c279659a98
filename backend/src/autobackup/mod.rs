//! 自动备份模块
//!
//! 把本地文件夹持续备份到远端存储，支持：
//! - 文件系统监听（增量模式，事件驱动上传和删除）
//! - 全量扫描（同一任务单实例，可取消）
//! - 去重日志（内容指纹未变化的文件不重复上传）
//! - 写入完成检测（等待文件大小稳定后再上传）
//! - SQLite 持久化（去重日志、扫描结果）

pub mod config;
pub mod error;
pub mod filter;
pub mod manager;
pub mod persistence;
pub mod record;
pub mod scanner;
pub mod scheduler;
pub mod watcher;

pub use config::*;
pub use error::{classify_error, BackupError, ErrorCategory, Result};
pub use filter::PathFilter;
pub use manager::{BackupEngine, EngineSettings};
pub use persistence::{BackupPersistenceManager, TaskScanResult, TaskStatusStore};
pub use record::{Journal, JournalEntry, JournalPool};
pub use scanner::{FullScanWalker, ScanReport};
pub use scheduler::{ScanController, ScanControllerStatus, ScanState};
pub use watcher::{FileChangeEvent, FileChangeType, Notifier, NotifierFactory};
