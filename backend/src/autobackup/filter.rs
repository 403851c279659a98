//! 路径过滤服务
//!
//! 监听事件和全量扫描共用同一套规则：
//! - 跳过编辑器临时文件（`.swp` / `.tmp`）
//! - 跳过隐藏目录（以 `.` 开头的目录及其子树）
//! - 跳过匹配任务忽略规则的路径

use regex::Regex;
use std::path::{Component, Path, PathBuf};

use super::config::BackupTask;
use super::error::{BackupError, Result};

/// 临时文件后缀
const TEMP_SUFFIXES: &[&str] = &[".swp", ".tmp"];

/// 路径过滤器
#[derive(Debug, Clone)]
pub struct PathFilter {
    /// 源根目录（隐藏目录判断只看根目录以下的部分）
    root: PathBuf,
    /// 忽略规则
    ignore: Option<Regex>,
}

impl PathFilter {
    pub fn new(root: impl Into<PathBuf>, ignore_pattern: Option<&str>) -> Result<Self> {
        let ignore = compile_optional(ignore_pattern)?;
        Ok(Self {
            root: root.into(),
            ignore,
        })
    }

    /// 从任务配置创建
    pub fn from_task(task: &BackupTask) -> Result<Self> {
        Self::new(task.source_path.clone(), task.ignore_pattern.as_deref())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 检查已删除（或已改名）的路径是否应该同步删除远端
    ///
    /// 路径已不存在，无法知道原来是文件还是目录；任一形态会被备份就接受。
    pub fn accepts_removed(&self, path: &Path) -> bool {
        self.accepts_entry(path, false) || self.accepts_entry(path, true)
    }

    /// 检查路径是否应该被处理（调用方已知道条目类型）
    pub fn accepts_entry(&self, path: &Path, is_dir: bool) -> bool {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        let components: Vec<&str> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(name) => name.to_str(),
                _ => None,
            })
            .collect();

        if let Some((last, parents)) = components.split_last() {
            // 祖先目录中有隐藏目录
            if parents.iter().any(|name| name.starts_with('.')) {
                return false;
            }

            if is_dir {
                if last.starts_with('.') {
                    return false;
                }
            } else if TEMP_SUFFIXES.iter().any(|suffix| last.ends_with(suffix)) {
                return false;
            }
        }

        if let Some(ref ignore) = self.ignore {
            if ignore.is_match(&path.to_string_lossy()) {
                return false;
            }
        }

        true
    }
}

/// 编译可选的正则表达式，空字符串视为未配置
pub fn compile_optional(pattern: Option<&str>) -> Result<Option<Regex>> {
    match pattern.map(str::trim) {
        None | Some("") => Ok(None),
        Some(p) => Regex::new(p)
            .map(Some)
            .map_err(|e| BackupError::invalid_pattern(p, e)),
    }
}
