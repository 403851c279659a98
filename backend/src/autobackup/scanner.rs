//! 全量扫描
//!
//! 递归遍历源目录，逐个文件计算指纹并与去重日志比较，变化的文件同步上传。
//! 全量扫描不经过上传队列，串行上传以限制对远端的并发压力。
//! 每访问一个目录或文件都会检查取消令牌。

use chrono::Utc;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::BackupTask;
use super::error::{BackupError, Result};
use super::filter::PathFilter;
use super::record::{fingerprint_file, journal_key, HashingReader, Journal, JournalEntry};
use crate::storage::StorageBackend;
use crate::uploader::format_bytes;

/// 全量扫描统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// 访问的文件数（通过过滤）
    pub scanned_files: u64,
    pub uploaded: u64,
    /// 指纹未变化
    pub skipped: u64,
    /// 被过滤的文件和目录
    pub filtered: u64,
    pub failed: u64,
    pub bytes_uploaded: u64,
}

impl ScanReport {
    /// 结果描述（写回配置层）
    pub fn summary(&self) -> String {
        format!(
            "扫描 {} 个文件，上传 {} 个（{}），跳过 {} 个，失败 {} 个",
            self.scanned_files,
            self.uploaded,
            format_bytes(self.bytes_uploaded),
            self.skipped,
            self.failed
        )
    }
}

/// 单个文件的处理结果
enum FileOutcome {
    Uploaded(u64),
    Unchanged,
}

/// 全量扫描器
pub struct FullScanWalker {
    task: BackupTask,
    filter: PathFilter,
    backend: Arc<dyn StorageBackend>,
    journal: Arc<Journal>,
    cancel_token: CancellationToken,
}

impl FullScanWalker {
    pub fn new(
        task: &BackupTask,
        backend: Arc<dyn StorageBackend>,
        journal: Arc<Journal>,
        cancel_token: CancellationToken,
    ) -> Result<Self> {
        Ok(Self {
            task: task.clone(),
            filter: PathFilter::from_task(task)?,
            backend,
            journal,
            cancel_token,
        })
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel_token.is_cancelled() {
            Err(BackupError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// 执行扫描
    ///
    /// 单个文件的 I/O 或上传失败只计数并继续；取消返回 [`BackupError::Cancelled`]。
    pub async fn walk(&self) -> Result<ScanReport> {
        let root = self.task.source_path.clone();
        let meta = tokio::fs::metadata(&root).await?;
        if !meta.is_dir() {
            return Err(BackupError::InvalidConfig(format!(
                "源路径不是目录: {}",
                root.display()
            )));
        }

        info!("任务 {} 开始全量扫描: {:?}", self.task.id, root);
        let mut report = ScanReport::default();
        let mut pending_dirs: VecDeque<PathBuf> = VecDeque::new();
        pending_dirs.push_back(root.clone());

        while let Some(dir) = pending_dirs.pop_front() {
            self.check_cancelled()?;

            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if dir == root => return Err(e.into()),
                Err(e) => {
                    warn!("任务 {} 读取目录失败: {:?}, error={}", self.task.id, dir, e);
                    report.failed += 1;
                    continue;
                }
            };

            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("任务 {} 读取目录条目失败: {:?}, error={}", self.task.id, dir, e);
                        report.failed += 1;
                        break;
                    }
                };
                self.check_cancelled()?;

                let path = entry.path();
                let file_type = match entry.file_type().await {
                    Ok(t) => t,
                    Err(e) => {
                        warn!("任务 {} 读取文件类型失败: {:?}, error={}", self.task.id, path, e);
                        report.failed += 1;
                        continue;
                    }
                };

                if file_type.is_dir() {
                    if self.filter.accepts_entry(&path, true) {
                        pending_dirs.push_back(path);
                    } else {
                        debug!("任务 {} 跳过目录子树: {:?}", self.task.id, path);
                        report.filtered += 1;
                    }
                    continue;
                }

                if !file_type.is_file() {
                    debug!("任务 {} 跳过非常规文件: {:?}", self.task.id, path);
                    continue;
                }

                if !self.filter.accepts_entry(&path, false) {
                    report.filtered += 1;
                    continue;
                }

                report.scanned_files += 1;
                match self.process_file(&path).await {
                    Ok(FileOutcome::Uploaded(size)) => {
                        report.uploaded += 1;
                        report.bytes_uploaded += size;
                    }
                    Ok(FileOutcome::Unchanged) => report.skipped += 1,
                    Err(BackupError::Cancelled) => return Err(BackupError::Cancelled),
                    Err(e) => {
                        warn!("任务 {} 处理文件失败，跳过: {:?}, error={}", self.task.id, path, e);
                        report.failed += 1;
                    }
                }
            }
        }

        info!("任务 {} 全量扫描完成: {}", self.task.id, report.summary());
        Ok(report)
    }

    async fn process_file(&self, path: &Path) -> Result<FileOutcome> {
        let key = journal_key(path);
        let fingerprint = fingerprint_file(path).await?;

        if let Some(entry) = self.journal.get(&key)? {
            if entry.fingerprint == fingerprint {
                debug!("任务 {} 文件未变化: {:?}", self.task.id, path);
                return Ok(FileOutcome::Unchanged);
            }
        }

        let dest_path = self
            .task
            .dest_path_for(path)
            .ok_or_else(|| BackupError::InvalidConfig(format!("路径不在源目录下: {}", path.display())))?;

        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let started_at = Utc::now().timestamp_millis();

        let (reader, hash) = HashingReader::new(file.take(size));
        tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => return Err(BackupError::Cancelled),
            result = self.backend.put(Box::new(reader), &dest_path, size) => result?,
        }

        if hash.bytes() != size {
            return Err(BackupError::Storage(format!(
                "上传 {} 字节数不一致: 期望 {}，实际 {}",
                dest_path,
                size,
                hash.bytes()
            )));
        }
        // 记录实际上传内容的指纹
        let uploaded = hash.finish();
        if uploaded != fingerprint {
            debug!("任务 {} 文件在上传期间被修改: {:?}", self.task.id, path);
        }

        let metadata = tokio::fs::metadata(path).await?;
        self.journal
            .put(&key, &JournalEntry::completed(uploaded, started_at, &metadata, size))?;

        debug!("任务 {} 上传完成: {:?} -> {} ({} 字节)", self.task.id, path, dest_path, size);
        Ok(FileOutcome::Uploaded(size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autobackup::config::BackupMode;
    use crate::autobackup::record::{calculate_full_md5, JournalPool};
    use crate::storage::MockBackend;
    use tempfile::{tempdir, TempDir};

    fn task(source: &Path, ignore: Option<&str>) -> BackupTask {
        BackupTask {
            id: 11,
            name: String::new(),
            source_path: source.to_path_buf(),
            dest_path: "/backup".to_string(),
            ignore_pattern: ignore.map(str::to_string),
            storage_engine: "mock".to_string(),
            storage_config: String::new(),
            wait_for_completion: false,
            ignore_wait_pattern: None,
            mode: BackupMode::Full,
        }
    }

    fn populate() -> TempDir {
        let dir = tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("a.txt"), b"alpha").unwrap();
        std::fs::create_dir_all(root.join("docs/deep")).unwrap();
        std::fs::write(root.join("docs/b.txt"), b"beta").unwrap();
        std::fs::write(root.join("docs/deep/c.txt"), b"gamma").unwrap();
        std::fs::write(root.join("docs/edit.swp"), b"swap").unwrap();
        std::fs::create_dir(root.join(".cache")).unwrap();
        std::fs::write(root.join(".cache/blob"), b"cached").unwrap();
        std::fs::create_dir(root.join("node_modules")).unwrap();
        std::fs::write(root.join("node_modules/x.js"), b"js").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_unchanged_files_are_not_uploaded_twice() {
        let source = populate();
        let cache = tempdir().unwrap();
        let journal = JournalPool::new(cache.path()).open(11).unwrap();
        let backend = Arc::new(MockBackend::new());
        let t = task(source.path(), Some("node_modules"));

        let walker =
            FullScanWalker::new(&t, backend.clone(), journal.clone(), CancellationToken::new()).unwrap();
        let first = walker.walk().await.unwrap();
        assert_eq!(first.uploaded, 3);
        assert_eq!(first.filtered, 3);
        assert_eq!(first.failed, 0);

        let mut paths: Vec<String> = backend.puts().into_iter().map(|c| c.path).collect();
        paths.sort();
        assert_eq!(
            paths,
            vec!["/backup/a.txt", "/backup/docs/b.txt", "/backup/docs/deep/c.txt"]
        );

        let second = walker.walk().await.unwrap();
        assert_eq!(second.uploaded, 0);
        assert_eq!(second.skipped, 3);
        assert_eq!(backend.puts().len(), 3);
    }

    #[tokio::test]
    async fn test_changed_fingerprint_is_uploaded_and_recorded() {
        let source = tempdir().unwrap();
        let file = source.path().join("a.txt");
        std::fs::write(&file, b"new content").unwrap();

        let cache = tempdir().unwrap();
        let journal = JournalPool::new(cache.path()).open(11).unwrap();
        journal
            .put(
                &journal_key(&file),
                &JournalEntry {
                    fingerprint: "H1".to_string(),
                    started_at: 0,
                    finished_at: 0,
                    modified_at: 0,
                    size: 3,
                },
            )
            .unwrap();

        let backend = Arc::new(MockBackend::new());
        let walker = FullScanWalker::new(
            &task(source.path(), None),
            backend.clone(),
            journal.clone(),
            CancellationToken::new(),
        )
        .unwrap();
        let report = walker.walk().await.unwrap();

        assert_eq!(report.uploaded, 1);
        assert_eq!(backend.puts()[0].path, "/backup/a.txt");
        let h2 = calculate_full_md5(&file).unwrap();
        let entry = journal.get(&journal_key(&file)).unwrap().unwrap();
        assert_eq!(entry.fingerprint, h2);
        assert_eq!(entry.size, 11);
    }

    #[tokio::test]
    async fn test_file_growing_during_upload_is_rescanned() {
        let source = tempdir().unwrap();
        let file = source.path().join("log.bin");
        std::fs::write(&file, vec![b'a'; 4096]).unwrap();

        let hook_path = file.clone();
        let once = std::sync::atomic::AtomicBool::new(false);
        let backend = Arc::new(MockBackend::new().with_put_hook(move |_| {
            if !once.swap(true, std::sync::atomic::Ordering::AcqRel) {
                let mut f = std::fs::OpenOptions::new().append(true).open(&hook_path).unwrap();
                std::io::Write::write_all(&mut f, &[b'b'; 1024]).unwrap();
            }
        }));

        let cache = tempdir().unwrap();
        let journal = JournalPool::new(cache.path()).open(11).unwrap();
        let walker = FullScanWalker::new(
            &task(source.path(), None),
            backend.clone(),
            journal.clone(),
            CancellationToken::new(),
        )
        .unwrap();

        let first = walker.walk().await.unwrap();
        assert_eq!(first.uploaded, 1);
        assert_eq!(backend.object("/backup/log.bin").unwrap().len(), 4096);
        let entry = journal.get(&journal_key(&file)).unwrap().unwrap();
        assert_eq!(entry.fingerprint, format!("{:x}", md5::compute(vec![b'a'; 4096])));

        // 日志里是已上传内容的指纹，下一次扫描会补传追加的数据
        let second = walker.walk().await.unwrap();
        assert_eq!(second.uploaded, 1);
        assert_eq!(backend.object("/backup/log.bin").unwrap().len(), 5120);
        let entry = journal.get(&journal_key(&file)).unwrap().unwrap();
        assert_eq!(entry.fingerprint, calculate_full_md5(&file).unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_walk_aborts() {
        let source = populate();
        let cache = tempdir().unwrap();
        let journal = JournalPool::new(cache.path()).open(11).unwrap();
        let backend = Arc::new(MockBackend::new());
        let token = CancellationToken::new();
        token.cancel();

        let walker =
            FullScanWalker::new(&task(source.path(), None), backend.clone(), journal, token).unwrap();
        let err = walker.walk().await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(backend.puts().is_empty());
    }

    #[tokio::test]
    async fn test_upload_failure_is_counted_not_fatal() {
        let source = populate();
        let cache = tempdir().unwrap();
        let journal = JournalPool::new(cache.path()).open(11).unwrap();
        let backend = Arc::new(MockBackend::from_config(r#"{"fail_put":true}"#).unwrap());

        let walker = FullScanWalker::new(
            &task(source.path(), None),
            backend,
            journal.clone(),
            CancellationToken::new(),
        )
        .unwrap();
        let report = walker.walk().await.unwrap();

        assert_eq!(report.uploaded, 0);
        assert_eq!(report.failed, 4);
        assert!(journal.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_missing_source_is_error() {
        let cache = tempdir().unwrap();
        let journal = JournalPool::new(cache.path()).open(11).unwrap();
        let walker = FullScanWalker::new(
            &task(Path::new("/nonexistent/source"), None),
            Arc::new(MockBackend::new()),
            journal,
            CancellationToken::new(),
        )
        .unwrap();
        assert!(matches!(walker.walk().await, Err(BackupError::Io(_))));
    }

    #[test]
    fn test_invalid_ignore_pattern() {
        let cache = tempdir().unwrap();
        let journal = JournalPool::new(cache.path()).open(11).unwrap();
        let result = FullScanWalker::new(
            &task(Path::new("/data/in"), Some("[")),
            Arc::new(MockBackend::new()),
            journal,
            CancellationToken::new(),
        );
        assert!(matches!(result, Err(BackupError::InvalidPattern { .. })));
    }
}
