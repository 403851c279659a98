//! 异步上传队列
//!
//! 有界 FIFO 队列 + 单个后台 worker：
//! - 生产者（变更事件适配器）通过 `enqueue` 投递任务，队列满时等待（背压）
//! - worker 严格按到达顺序处理，上传前可等待外部写入完成
//! - 失败只记录日志并丢弃，不在本层重试（下一次变更事件或全量扫描会重新发现差异）

use chrono::Utc;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::autobackup::error::{BackupError, Result};
use crate::autobackup::record::{
    fingerprint_file, journal_key, HashingReader, Journal, JournalEntry,
};
use crate::storage::StorageBackend;

/// 上传任务
#[derive(Clone)]
pub struct UploadJob {
    pub task_id: u64,
    pub backend: Arc<dyn StorageBackend>,
    pub journal: Arc<Journal>,
    /// 远端对象路径
    pub dest_path: String,
    /// 本地源文件路径
    pub source_path: PathBuf,
    /// 上传前是否等待写入完成
    pub wait_for_completion: bool,
}

/// 远端删除任务
#[derive(Clone)]
pub struct RemoveJob {
    pub task_id: u64,
    pub backend: Arc<dyn StorageBackend>,
    pub journal: Arc<Journal>,
    pub dest_path: String,
    pub source_path: PathBuf,
}

/// 队列任务
#[derive(Clone)]
pub enum QueueJob {
    Upload(UploadJob),
    Remove(RemoveJob),
}

impl QueueJob {
    pub fn task_id(&self) -> u64 {
        match self {
            QueueJob::Upload(job) => job.task_id,
            QueueJob::Remove(job) => job.task_id,
        }
    }

    pub fn dest_path(&self) -> &str {
        match self {
            QueueJob::Upload(job) => &job.dest_path,
            QueueJob::Remove(job) => &job.dest_path,
        }
    }
}

impl std::fmt::Debug for QueueJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueJob::Upload(job) => f
                .debug_struct("Upload")
                .field("task_id", &job.task_id)
                .field("source_path", &job.source_path)
                .field("dest_path", &job.dest_path)
                .field("wait_for_completion", &job.wait_for_completion)
                .finish(),
            QueueJob::Remove(job) => f
                .debug_struct("Remove")
                .field("task_id", &job.task_id)
                .field("source_path", &job.source_path)
                .field("dest_path", &job.dest_path)
                .finish(),
        }
    }
}

/// 队列参数
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// 队列容量
    pub capacity: usize,
    /// 写入完成检测的轮询间隔
    pub poll_interval: Duration,
    /// 写入完成检测的最长等待时间
    pub max_wait: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: 1000,
            poll_interval: Duration::from_secs(1),
            max_wait: Duration::from_secs(30 * 60),
        }
    }
}

/// 队列统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub uploaded: u64,
    /// 指纹未变化而跳过
    pub skipped: u64,
    pub failed: u64,
    pub removed: u64,
    pub bytes_uploaded: u64,
}

impl QueueStats {
    /// 已处理的任务总数
    pub fn processed(&self) -> u64 {
        self.uploaded + self.skipped + self.failed + self.removed
    }
}

#[derive(Debug, Default)]
struct QueueCounters {
    uploaded: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    removed: AtomicU64,
    bytes_uploaded: AtomicU64,
}

impl QueueCounters {
    fn snapshot(&self) -> QueueStats {
        QueueStats {
            uploaded: self.uploaded.load(Ordering::Acquire),
            skipped: self.skipped.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
            removed: self.removed.load(Ordering::Acquire),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Acquire),
        }
    }
}

/// 上传结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadOutcome {
    Uploaded(u64),
    Unchanged,
}

/// 上传队列
///
/// 由引擎在启动时构造并持有，`start` 只会启动一个 worker，`shutdown` 可重复调用。
pub struct UploadQueue {
    settings: QueueSettings,
    tx: mpsc::Sender<QueueJob>,
    rx: Mutex<Option<mpsc::Receiver<QueueJob>>>,
    cancel_token: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<QueueCounters>,
}

impl UploadQueue {
    pub fn new(settings: QueueSettings, cancel_token: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(settings.capacity.max(1));
        Self {
            settings,
            tx,
            rx: Mutex::new(Some(rx)),
            cancel_token,
            worker: Mutex::new(None),
            counters: Arc::new(QueueCounters::default()),
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// 启动 worker；已启动过则返回 false
    pub fn start(&self) -> bool {
        let rx = match self.rx.lock().take() {
            Some(rx) => rx,
            None => {
                debug!("上传队列 worker 已启动，忽略重复启动");
                return false;
            }
        };

        let worker = UploadWorker {
            settings: self.settings.clone(),
            cancel_token: self.cancel_token.clone(),
            counters: self.counters.clone(),
        };
        let handle = tokio::spawn(worker.run(rx));
        *self.worker.lock() = Some(handle);
        info!("上传队列 worker 已启动，容量 {}", self.settings.capacity);
        true
    }

    /// 投递任务，队列满时等待
    pub async fn enqueue(&self, job: QueueJob) -> Result<()> {
        if self.cancel_token.is_cancelled() {
            return Err(BackupError::Cancelled);
        }
        self.tx.send(job).await.map_err(|_| BackupError::Cancelled)
    }

    /// 停止 worker 并等待其退出
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("上传队列 worker 异常退出: {}", e);
            }
            info!("上传队列 worker 已停止");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub fn stats(&self) -> QueueStats {
        self.counters.snapshot()
    }

    /// 当前排队中的任务数
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

struct UploadWorker {
    settings: QueueSettings,
    cancel_token: CancellationToken,
    counters: Arc<QueueCounters>,
}

impl UploadWorker {
    async fn run(self, mut rx: mpsc::Receiver<QueueJob>) {
        loop {
            let job = tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            match job {
                QueueJob::Upload(job) => self.handle_upload(job).await,
                QueueJob::Remove(job) => self.handle_remove(job).await,
            }
        }
        debug!("上传队列 worker 退出循环");
    }

    async fn handle_upload(&self, job: UploadJob) {
        match self.upload(&job).await {
            Ok(UploadOutcome::Uploaded(size)) => {
                self.counters.uploaded.fetch_add(1, Ordering::AcqRel);
                self.counters.bytes_uploaded.fetch_add(size, Ordering::AcqRel);
                info!(
                    "任务 {} 上传完成: {:?} -> {} ({} 字节)",
                    job.task_id, job.source_path, job.dest_path, size
                );
            }
            Ok(UploadOutcome::Unchanged) => {
                self.counters.skipped.fetch_add(1, Ordering::AcqRel);
                debug!("任务 {} 文件未变化，跳过: {:?}", job.task_id, job.source_path);
            }
            Err(BackupError::Cancelled) => {
                debug!("任务 {} 上传被取消: {:?}", job.task_id, job.source_path);
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::AcqRel);
                warn!(
                    "任务 {} 上传失败，丢弃: {:?} -> {}, error={}",
                    job.task_id, job.source_path, job.dest_path, e
                );
            }
        }
    }

    async fn upload(&self, job: &UploadJob) -> Result<UploadOutcome> {
        let file = tokio::fs::File::open(&job.source_path).await?;

        let size = if job.wait_for_completion {
            wait_for_stable_size(
                &job.source_path,
                self.settings.poll_interval,
                self.settings.max_wait,
                &self.cancel_token,
            )
            .await?
        } else {
            file.metadata().await?.len()
        };

        let key = journal_key(&job.source_path);
        let fingerprint = fingerprint_file(&job.source_path).await?;
        if let Some(entry) = job.journal.get(&key)? {
            if entry.fingerprint == fingerprint {
                return Ok(UploadOutcome::Unchanged);
            }
        }

        // 日志记录实际上传内容的指纹，上传期间文件继续写入时下次事件会重新上传
        let (reader, hash) = HashingReader::new(file.take(size));
        let started_at = Utc::now().timestamp_millis();
        tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => return Err(BackupError::Cancelled),
            result = job.backend.put(Box::new(reader), &job.dest_path, size) => result?,
        }

        let sent = hash.bytes();
        if sent != size {
            return Err(BackupError::Storage(format!(
                "上传 {} 字节数不一致: 期望 {}，实际 {}",
                job.dest_path, size, sent
            )));
        }
        let uploaded = hash.finish();
        if uploaded != fingerprint {
            debug!("任务 {} 文件在上传期间被修改: {:?}", job.task_id, job.source_path);
        }

        let metadata = tokio::fs::metadata(&job.source_path).await?;
        job.journal
            .put(&key, &JournalEntry::completed(uploaded, started_at, &metadata, size))?;

        Ok(UploadOutcome::Uploaded(size))
    }

    async fn handle_remove(&self, job: RemoveJob) {
        // 删除时本地路径已不存在，无法判断原来是文件还是目录，两种都删
        if let Err(e) = job.backend.remove_dir(&job.dest_path).await {
            warn!("任务 {} 删除远端目录失败: {}, error={}", job.task_id, job.dest_path, e);
        }
        if let Err(e) = job.backend.remove(&job.dest_path).await {
            warn!("任务 {} 删除远端文件失败: {}, error={}", job.task_id, job.dest_path, e);
        }

        match job.journal.delete_tree(&journal_key(&job.source_path)) {
            Ok(n) => debug!("任务 {} 清理 {} 条去重记录: {:?}", job.task_id, n, job.source_path),
            Err(e) => warn!("任务 {} 清理去重记录失败: {:?}, error={}", job.task_id, job.source_path, e),
        }

        self.counters.removed.fetch_add(1, Ordering::AcqRel);
        info!("任务 {} 已删除远端对象: {}", job.task_id, job.dest_path);
    }
}

/// 等待文件写入完成
///
/// 按固定间隔轮询文件大小，连续两次相同且非零视为写入完成，返回最终大小。
/// 超过 `max_wait` 仍未稳定返回 [`BackupError::StalledWriter`]。
pub async fn wait_for_stable_size(
    path: &Path,
    poll_interval: Duration,
    max_wait: Duration,
    cancel_token: &CancellationToken,
) -> Result<u64> {
    let started = Instant::now();
    let mut last = tokio::fs::metadata(path).await?.len();

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => return Err(BackupError::Cancelled),
            _ = tokio::time::sleep(poll_interval) => {}
        }

        let current = tokio::fs::metadata(path).await?.len();
        if current == last && current > 0 {
            return Ok(current);
        }
        debug!("文件仍在写入: {:?} ({} -> {} 字节)", path, last, current);
        last = current;

        if started.elapsed() >= max_wait {
            return Err(BackupError::StalledWriter(path.to_string_lossy().into_owned()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autobackup::record::{calculate_full_md5, JournalPool};
    use crate::storage::{MockBackend, MockOp};
    use std::io::Write;
    use tempfile::tempdir;

    fn fast_settings() -> QueueSettings {
        QueueSettings {
            capacity: 16,
            poll_interval: Duration::from_millis(100),
            max_wait: Duration::from_secs(10),
        }
    }

    async fn wait_processed(queue: &UploadQueue, n: u64) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while queue.stats().processed() < n {
            assert!(Instant::now() < deadline, "队列处理超时: {:?}", queue.stats());
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn upload_job(
        backend: &Arc<MockBackend>,
        journal: &Arc<Journal>,
        source: &Path,
        dest: &str,
        wait: bool,
    ) -> QueueJob {
        QueueJob::Upload(UploadJob {
            task_id: 1,
            backend: backend.clone(),
            journal: journal.clone(),
            dest_path: dest.to_string(),
            source_path: source.to_path_buf(),
            wait_for_completion: wait,
        })
    }

    #[tokio::test]
    async fn test_upload_and_dedup() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("a.txt");
        std::fs::write(&source, b"hello").unwrap();

        let pool = JournalPool::new(dir.path().join("journal"));
        let journal = pool.open(1).unwrap();
        let backend = Arc::new(MockBackend::new());

        let queue = UploadQueue::new(fast_settings(), CancellationToken::new());
        assert!(queue.start());
        assert!(!queue.start());

        queue.enqueue(upload_job(&backend, &journal, &source, "/backup/a.txt", false)).await.unwrap();
        queue.enqueue(upload_job(&backend, &journal, &source, "/backup/a.txt", false)).await.unwrap();
        wait_processed(&queue, 2).await;

        let stats = queue.stats();
        assert_eq!(stats.uploaded, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.bytes_uploaded, 5);
        assert_eq!(backend.puts().len(), 1);

        let entry = journal.get(&journal_key(&source)).unwrap().unwrap();
        assert_eq!(entry.fingerprint, "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(entry.size, 5);

        queue.shutdown().await;
        queue.shutdown().await;
        assert!(queue.is_shutdown());
    }

    #[tokio::test]
    async fn test_missing_file_is_dropped() {
        let dir = tempdir().unwrap();
        let pool = JournalPool::new(dir.path().join("journal"));
        let journal = pool.open(1).unwrap();
        let backend = Arc::new(MockBackend::new());

        let queue = UploadQueue::new(fast_settings(), CancellationToken::new());
        queue.start();
        queue
            .enqueue(upload_job(&backend, &journal, &dir.path().join("gone.txt"), "/b/gone.txt", false))
            .await
            .unwrap();
        wait_processed(&queue, 1).await;

        assert_eq!(queue.stats().failed, 1);
        assert!(backend.puts().is_empty());
        assert!(journal.is_empty().unwrap());
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_job_clears_remote_and_journal() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("docs/a.txt");
        std::fs::create_dir_all(source.parent().unwrap()).unwrap();
        std::fs::write(&source, b"abc").unwrap();

        let pool = JournalPool::new(dir.path().join("journal"));
        let journal = pool.open(1).unwrap();
        let backend = Arc::new(MockBackend::new());

        let queue = UploadQueue::new(fast_settings(), CancellationToken::new());
        queue.start();
        queue.enqueue(upload_job(&backend, &journal, &source, "/b/docs/a.txt", false)).await.unwrap();
        queue
            .enqueue(QueueJob::Remove(RemoveJob {
                task_id: 1,
                backend: backend.clone(),
                journal: journal.clone(),
                dest_path: "/b/docs".to_string(),
                source_path: dir.path().join("docs"),
            }))
            .await
            .unwrap();
        wait_processed(&queue, 2).await;

        assert_eq!(backend.count(MockOp::RemoveDir), 1);
        assert_eq!(backend.count(MockOp::Remove), 1);
        assert!(backend.object("/b/docs/a.txt").is_none());
        assert!(journal.is_empty().unwrap());
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_wait_for_growing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("growing.bin");
        std::fs::write(&path, b"x").unwrap();

        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            for _ in 0..10 {
                tokio::time::sleep(Duration::from_millis(25)).await;
                let mut f = std::fs::OpenOptions::new().append(true).open(&writer_path).unwrap();
                f.write_all(&[b'y'; 100]).unwrap();
            }
        });

        let size = wait_for_stable_size(
            &path,
            Duration::from_millis(100),
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        writer.await.unwrap();

        assert_eq!(size, 1 + 10 * 100);
    }

    #[tokio::test]
    async fn test_wait_gives_up_on_stalled_writer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        std::fs::write(&path, b"").unwrap();

        let err = wait_for_stable_size(
            &path,
            Duration::from_millis(20),
            Duration::from_millis(100),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BackupError::StalledWriter(_)));
    }

    #[tokio::test]
    async fn test_wait_is_cancellable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"a").unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let err = wait_for_stable_size(&path, Duration::from_secs(5), Duration::from_secs(10), &token)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown() {
        let dir = tempdir().unwrap();
        let pool = JournalPool::new(dir.path());
        let journal = pool.open(1).unwrap();
        let backend = Arc::new(MockBackend::new());

        let queue = UploadQueue::new(fast_settings(), CancellationToken::new());
        queue.start();
        queue.shutdown().await;

        let err = queue
            .enqueue(upload_job(&backend, &journal, &dir.path().join("a"), "/a", false))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_journal_records_uploaded_bytes_when_file_grows() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("video.bin");
        let original = vec![b'a'; 256 * 1024];
        std::fs::write(&source, &original).unwrap();

        // 第一次上传开始时追加数据，模拟上传期间仍在写入
        let appended = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let hook_path = source.clone();
        let hook_flag = appended.clone();
        let backend = Arc::new(MockBackend::new().with_put_hook(move |_| {
            if !hook_flag.swap(true, Ordering::AcqRel) {
                let mut f = std::fs::OpenOptions::new().append(true).open(&hook_path).unwrap();
                f.write_all(&[b'b'; 64 * 1024]).unwrap();
            }
        }));

        let pool = JournalPool::new(dir.path().join("journal"));
        let journal = pool.open(1).unwrap();
        let queue = UploadQueue::new(fast_settings(), CancellationToken::new());
        queue.start();

        queue.enqueue(upload_job(&backend, &journal, &source, "/b/video.bin", false)).await.unwrap();
        wait_processed(&queue, 1).await;

        assert_eq!(backend.object("/b/video.bin").unwrap(), original);
        let entry = journal.get(&journal_key(&source)).unwrap().unwrap();
        assert_eq!(entry.fingerprint, format!("{:x}", md5::compute(&original)));
        assert_ne!(entry.fingerprint, calculate_full_md5(&source).unwrap());

        // 下一次事件发现内容不一致，重新上传完整文件
        queue.enqueue(upload_job(&backend, &journal, &source, "/b/video.bin", false)).await.unwrap();
        wait_processed(&queue, 2).await;

        assert_eq!(queue.stats().uploaded, 2);
        assert_eq!(backend.object("/b/video.bin").unwrap().len(), (256 + 64) * 1024);
        let entry = journal.get(&journal_key(&source)).unwrap().unwrap();
        assert_eq!(entry.fingerprint, calculate_full_md5(&source).unwrap());
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_inflight_upload() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("a.txt");
        std::fs::write(&source, b"hello").unwrap();

        let started = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = started.clone();
        let backend = Arc::new(
            MockBackend::new()
                .with_put_delay(Duration::from_secs(30))
                .with_put_hook(move |_| flag.store(true, Ordering::Release)),
        );

        let pool = JournalPool::new(dir.path().join("journal"));
        let journal = pool.open(1).unwrap();
        let queue = UploadQueue::new(fast_settings(), CancellationToken::new());
        queue.start();
        queue.enqueue(upload_job(&backend, &journal, &source, "/b/a.txt", false)).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while !started.load(Ordering::Acquire) {
            assert!(Instant::now() < deadline, "上传未开始");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let begin = Instant::now();
        queue.shutdown().await;
        assert!(begin.elapsed() < Duration::from_secs(5));
        assert_eq!(queue.stats().uploaded, 0);
        assert_eq!(queue.stats().failed, 0);
        assert!(journal.is_empty().unwrap());
    }
}
