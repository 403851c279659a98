//! 文件夹扫描模块
//!
//! 负责:
//! - 递归枚举本地文件夹（新建目录事件时使用）
//! - 应用任务的路径过滤规则，被过滤的目录整棵子树跳过
//! - 计算相对于源根目录的路径（用于构建远端路径）

use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::autobackup::filter::PathFilter;

/// 文件扫描结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    /// 本地文件绝对路径
    pub local_path: PathBuf,
    /// 相对于源根目录的路径
    pub relative_path: PathBuf,
    /// 文件大小（字节）
    pub size: u64,
}

/// 文件夹扫描器
///
/// 不跟随符号链接，链接本身按非常规文件跳过。
pub struct FolderScanner {
    filter: PathFilter,
}

impl FolderScanner {
    pub fn new(filter: PathFilter) -> Self {
        Self { filter }
    }

    /// 递归扫描文件夹
    ///
    /// # 参数
    /// - `dir`: 要扫描的文件夹，必须位于过滤器的源根目录之下
    ///
    /// # 返回
    /// - 通过过滤的所有文件，按相对路径排序
    pub fn scan<P: AsRef<Path>>(&self, dir: P) -> Result<Vec<ScannedFile>> {
        let dir = dir.as_ref();

        if !dir.exists() {
            anyhow::bail!("扫描路径不存在: {}", dir.display());
        }

        if !dir.is_dir() {
            anyhow::bail!("扫描路径不是文件夹: {}", dir.display());
        }

        debug!("开始扫描文件夹: {}", dir.display());

        let mut files = Vec::new();
        let mut pending_dirs = VecDeque::new();
        pending_dirs.push_back(dir.to_path_buf());

        while let Some(current) = pending_dirs.pop_front() {
            self.scan_directory(&current, &mut pending_dirs, &mut files)?;
        }

        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        info!(
            "文件夹扫描完成: {}，{} 个文件，总大小 {}",
            dir.display(),
            files.len(),
            format_bytes(files.iter().map(|f| f.size).sum())
        );

        Ok(files)
    }

    /// 扫描单个目录，子目录加入队列，文件加入结果
    fn scan_directory(
        &self,
        dir: &Path,
        pending_dirs: &mut VecDeque<PathBuf>,
        files: &mut Vec<ScannedFile>,
    ) -> Result<()> {
        let entries =
            std::fs::read_dir(dir).with_context(|| format!("读取目录失败: {}", dir.display()))?;

        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("读取目录条目失败: {}, error={}", dir.display(), e);
                    continue;
                }
            };
            let path = entry.path();

            let metadata = match std::fs::symlink_metadata(&path) {
                Ok(m) => m,
                Err(e) => {
                    warn!("读取文件元数据失败: {}, error={}", path.display(), e);
                    continue;
                }
            };

            if !self.filter.accepts_entry(&path, metadata.is_dir()) {
                debug!("路径被过滤: {}", path.display());
                continue;
            }

            if metadata.is_dir() {
                pending_dirs.push_back(path);
            } else if metadata.is_file() {
                let relative_path = path
                    .strip_prefix(self.filter.root())
                    .with_context(|| {
                        format!(
                            "计算相对路径失败: {} (root: {})",
                            path.display(),
                            self.filter.root().display()
                        )
                    })?
                    .to_path_buf();

                files.push(ScannedFile {
                    local_path: path,
                    relative_path,
                    size: metadata.len(),
                });
            } else {
                debug!("跳过非常规文件: {}", path.display());
            }
        }

        Ok(())
    }
}

/// 格式化字节大小
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// 创建测试目录结构:
    /// root/
    /// ├── file1.txt
    /// ├── edit.txt.swp
    /// ├── .git/config
    /// ├── subdir1/file3.txt
    /// ├── subdir1/app.log
    /// └── subdir2/subdir3/file5.txt
    fn create_test_folder() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        fs::write(root.join("file1.txt"), "content1").unwrap();
        fs::write(root.join("edit.txt.swp"), "swap").unwrap();

        fs::create_dir(root.join(".git")).unwrap();
        fs::write(root.join(".git/config"), "[core]").unwrap();

        fs::create_dir(root.join("subdir1")).unwrap();
        fs::write(root.join("subdir1/file3.txt"), "content3").unwrap();
        fs::write(root.join("subdir1/app.log"), "log").unwrap();

        fs::create_dir_all(root.join("subdir2/subdir3")).unwrap();
        fs::write(root.join("subdir2/subdir3/file5.txt"), "content5").unwrap();

        temp_dir
    }

    fn relative_paths(files: &[ScannedFile]) -> Vec<String> {
        files
            .iter()
            .map(|f| f.relative_path.to_string_lossy().replace('\\', "/"))
            .collect()
    }

    #[test]
    fn test_scan_applies_filter() {
        let temp_dir = create_test_folder();
        let filter = PathFilter::new(temp_dir.path(), Some(r"\.log$")).unwrap();
        let scanner = FolderScanner::new(filter);

        let files = scanner.scan(temp_dir.path()).unwrap();

        assert_eq!(
            relative_paths(&files),
            vec!["file1.txt", "subdir1/file3.txt", "subdir2/subdir3/file5.txt"]
        );
    }

    #[test]
    fn test_scan_subdirectory_keeps_root_relative_paths() {
        let temp_dir = create_test_folder();
        let filter = PathFilter::new(temp_dir.path(), None).unwrap();
        let scanner = FolderScanner::new(filter);

        let files = scanner.scan(temp_dir.path().join("subdir2")).unwrap();

        assert_eq!(relative_paths(&files), vec!["subdir2/subdir3/file5.txt"]);
        assert_eq!(files[0].size, 8);
        assert_eq!(files[0].local_path, temp_dir.path().join("subdir2/subdir3/file5.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn test_scan_skips_symlinks() {
        let temp_dir = create_test_folder();
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("secret.txt"), "outside").unwrap();
        std::os::unix::fs::symlink(outside.path(), temp_dir.path().join("linked_dir")).unwrap();
        std::os::unix::fs::symlink(
            temp_dir.path().join("file1.txt"),
            temp_dir.path().join("file1_link.txt"),
        )
        .unwrap();

        let filter = PathFilter::new(temp_dir.path(), Some(r"\.log$")).unwrap();
        let files = FolderScanner::new(filter).scan(temp_dir.path()).unwrap();

        assert_eq!(
            relative_paths(&files),
            vec!["file1.txt", "subdir1/file3.txt", "subdir2/subdir3/file5.txt"]
        );
    }

    #[test]
    fn test_scan_nonexistent_folder() {
        let filter = PathFilter::new("/nonexistent", None).unwrap();
        let result = FolderScanner::new(filter).scan("/nonexistent/path");

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("扫描路径不存在"));
    }

    #[test]
    fn test_scan_file_not_folder() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("test.txt");
        fs::write(&file_path, "content").unwrap();

        let filter = PathFilter::new(temp_dir.path(), None).unwrap();
        let result = FolderScanner::new(filter).scan(&file_path);

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("扫描路径不是文件夹"));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1536 * 1024 * 1024), "1.50 GB");
    }
}
