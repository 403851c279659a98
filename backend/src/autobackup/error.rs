//! 备份错误处理模块
//!
//! 提供统一的错误分类：配置错误、并发保护错误、临时 I/O 错误、取消

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 备份引擎统一结果类型
pub type Result<T> = std::result::Result<T, BackupError>;

/// 备份错误
#[derive(Debug, Error)]
pub enum BackupError {
    /// 不支持的存储引擎
    #[error("不支持的存储引擎: {0}")]
    UnsupportedEngine(String),

    /// 存储引擎配置为空
    #[error("存储引擎 {0} 的配置为空")]
    EmptyConfig(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    InvalidConfig(String),

    /// 正则表达式无效
    #[error("无效的正则表达式 {pattern}: {message}")]
    InvalidPattern { pattern: String, message: String },

    /// 同一任务已在运行
    #[error("任务 {0} 正在运行，请稍候 (running, please wait)")]
    AlreadyRunning(u64),

    /// 文件系统错误
    #[error("文件系统错误: {0}")]
    Io(#[from] std::io::Error),

    /// 远端存储错误
    #[error("存储错误: {0}")]
    Storage(String),

    /// 去重日志错误
    #[error("去重日志错误: {0}")]
    Journal(String),

    /// 外部写入方长时间未完成
    #[error("等待文件写入完成超时: {0}")]
    StalledWriter(String),

    /// 任务取消
    #[error("任务已取消")]
    Cancelled,
}

impl BackupError {
    /// 获取错误分类
    pub fn category(&self) -> ErrorCategory {
        classify_error(self)
    }

    /// 是否为取消信号
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BackupError::Cancelled)
    }

    pub(crate) fn invalid_pattern(pattern: &str, err: regex::Error) -> Self {
        BackupError::InvalidPattern {
            pattern: pattern.to_string(),
            message: err.to_string(),
        }
    }
}

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// 配置错误，直接返回给调用方
    Configuration,
    /// 并发保护（已在运行），不重试
    Concurrency,
    /// 临时错误，记录日志并跳过当前文件
    Transient,
    /// 主动取消，视为正常停止
    Cancelled,
}

/// 错误分类函数
pub fn classify_error(error: &BackupError) -> ErrorCategory {
    match error {
        BackupError::UnsupportedEngine(_)
        | BackupError::EmptyConfig(_)
        | BackupError::InvalidConfig(_)
        | BackupError::InvalidPattern { .. } => ErrorCategory::Configuration,
        BackupError::AlreadyRunning(_) => ErrorCategory::Concurrency,
        BackupError::Io(_)
        | BackupError::Storage(_)
        | BackupError::Journal(_)
        | BackupError::StalledWriter(_) => ErrorCategory::Transient,
        BackupError::Cancelled => ErrorCategory::Cancelled,
    }
}

impl From<rusqlite::Error> for BackupError {
    fn from(err: rusqlite::Error) -> Self {
        BackupError::Journal(err.to_string())
    }
}

impl From<opendal::Error> for BackupError {
    fn from(err: opendal::Error) -> Self {
        BackupError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(err: serde_json::Error) -> Self {
        BackupError::InvalidConfig(err.to_string())
    }
}

impl From<tokio::task::JoinError> for BackupError {
    fn from(err: tokio::task::JoinError) -> Self {
        BackupError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            err.to_string(),
        ))
    }
}
