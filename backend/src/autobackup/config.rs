//! 备份任务配置数据结构

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// 备份任务配置
///
/// 由外部管理层创建和编辑，引擎运行期间只读。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupTask {
    /// 任务唯一标识（数字 ID，也是去重日志目录名）
    pub id: u64,
    /// 任务名称（用户可识别）
    #[serde(default)]
    pub name: String,
    /// 本地源路径
    pub source_path: PathBuf,
    /// 远端目标根路径
    pub dest_path: String,
    /// 忽略规则（正则表达式，匹配的路径不备份）
    #[serde(default)]
    pub ignore_pattern: Option<String>,
    /// 存储引擎名称（s3 / ftp / smb / webdav / mock）
    pub storage_engine: String,
    /// 存储引擎配置（JSON，敏感字段为加密后的密文）
    #[serde(default)]
    pub storage_config: String,
    /// 上传前是否等待文件写入完成
    #[serde(default)]
    pub wait_for_completion: bool,
    /// 免等待规则（匹配的路径不做写入完成检测）
    #[serde(default)]
    pub ignore_wait_pattern: Option<String>,
    /// 运行模式
    #[serde(default)]
    pub mode: BackupMode,
}

impl BackupTask {
    /// 用于日志的任务描述
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("#{}", self.id)
        } else {
            format!("#{} ({})", self.id, self.name)
        }
    }

    /// 本地路径映射为远端对象路径：目标根路径 + 相对于源根目录的路径
    ///
    /// 路径不在源根目录之下时返回 None。
    pub fn dest_path_for(&self, local: &Path) -> Option<String> {
        let relative = local.strip_prefix(&self.source_path).ok()?;
        let mut dest = self.dest_path.trim_end_matches('/').to_string();
        for component in relative.components() {
            if let Component::Normal(name) = component {
                dest.push('/');
                dest.push_str(&name.to_string_lossy());
            }
        }
        if dest.is_empty() {
            dest.push('/');
        }
        Some(dest)
    }
}

/// 备份模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackupMode {
    /// 增量模式：文件系统监听驱动
    #[default]
    Incremental,
    /// 全量模式：完整目录扫描
    Full,
}

/// 任务状态（写回配置层）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// 空闲（完成或已取消）
    Idle,
    /// 失败
    Failure,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Failure => "failure",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(TaskStatus::Idle),
            "failure" => Some(TaskStatus::Failure),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
