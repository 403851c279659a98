//! 变更事件适配器
//!
//! 把监听器投递的创建/修改/删除/重命名事件转换为上传队列任务：
//! - 创建：目录则递归枚举并逐个投递上传，文件直接投递
//! - 修改：重新 stat，目录忽略，文件投递上传
//! - 删除 / 重命名：同时删除远端的目录形态和文件形态对象
//!
//! 所有路径先经过任务的过滤规则。

use regex::Regex;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::file_watcher::{FileChangeEvent, FileChangeType};
use crate::autobackup::config::BackupTask;
use crate::autobackup::error::Result;
use crate::autobackup::filter::{compile_optional, PathFilter};
use crate::autobackup::record::Journal;
use crate::storage::StorageBackend;
use crate::uploader::{FolderScanner, QueueJob, RemoveJob, UploadJob, UploadQueue};

/// 单个任务的变更事件适配器
pub struct ChangeEventAdapter {
    task: BackupTask,
    filter: PathFilter,
    ignore_wait: Option<Regex>,
    backend: Arc<dyn StorageBackend>,
    journal: Arc<Journal>,
    queue: Arc<UploadQueue>,
}

impl ChangeEventAdapter {
    /// 创建适配器，忽略规则无效时返回配置错误
    pub fn new(
        task: &BackupTask,
        backend: Arc<dyn StorageBackend>,
        journal: Arc<Journal>,
        queue: Arc<UploadQueue>,
    ) -> Result<Self> {
        Ok(Self {
            task: task.clone(),
            filter: PathFilter::from_task(task)?,
            ignore_wait: compile_optional(task.ignore_wait_pattern.as_deref())?,
            backend,
            journal,
            queue,
        })
    }

    pub fn task_id(&self) -> u64 {
        self.task.id
    }

    /// 远端对象路径
    pub fn dest_path_for(&self, path: &Path) -> Option<String> {
        self.task.dest_path_for(path)
    }

    /// 该路径上传前是否需要等待写入完成
    fn should_wait(&self, path: &Path) -> bool {
        if !self.task.wait_for_completion {
            return false;
        }
        match self.ignore_wait {
            Some(ref re) => !re.is_match(&path.to_string_lossy()),
            None => true,
        }
    }

    /// 处理一个事件，返回投递的任务数
    pub async fn handle_event(&self, event: FileChangeEvent) -> usize {
        match event.kind {
            FileChangeType::Created => self.on_create(&event.path).await,
            FileChangeType::Modified => self.on_modify(&event.path).await,
            FileChangeType::Removed => self.on_delete(&event.path).await,
            FileChangeType::Renamed => self.on_rename(&event.path).await,
        }
    }

    /// 创建事件
    pub async fn on_create(&self, path: &Path) -> usize {
        let metadata = match tokio::fs::symlink_metadata(path).await {
            Ok(m) => m,
            Err(e) => {
                debug!("任务 {} 创建事件路径已不存在: {:?}, error={}", self.task.id, path, e);
                return 0;
            }
        };

        if !self.filter.accepts_entry(path, metadata.is_dir()) {
            debug!("任务 {} 路径被过滤: {:?}", self.task.id, path);
            return 0;
        }

        if !metadata.is_dir() {
            return self.enqueue_upload(path).await as usize;
        }

        let scanner = FolderScanner::new(self.filter.clone());
        let dir = path.to_path_buf();
        let files = match tokio::task::spawn_blocking(move || scanner.scan(&dir)).await {
            Ok(Ok(files)) => files,
            Ok(Err(e)) => {
                warn!("任务 {} 枚举新建目录失败: {:?}, error={}", self.task.id, path, e);
                return 0;
            }
            Err(e) => {
                warn!("任务 {} 枚举新建目录异常: {:?}, error={}", self.task.id, path, e);
                return 0;
            }
        };

        let mut enqueued = 0;
        for file in files {
            if self.enqueue_upload(&file.local_path).await {
                enqueued += 1;
            }
        }
        info!("任务 {} 新建目录 {:?}: 投递 {} 个上传任务", self.task.id, path, enqueued);
        enqueued
    }

    /// 修改事件
    pub async fn on_modify(&self, path: &Path) -> usize {
        let metadata = match tokio::fs::symlink_metadata(path).await {
            Ok(m) => m,
            Err(e) => {
                debug!("任务 {} 修改事件路径已不存在: {:?}, error={}", self.task.id, path, e);
                return 0;
            }
        };

        // 目录的修改事件没有意义
        if metadata.is_dir() {
            return 0;
        }

        if !self.filter.accepts_entry(path, false) {
            debug!("任务 {} 路径被过滤: {:?}", self.task.id, path);
            return 0;
        }

        self.enqueue_upload(path).await as usize
    }

    /// 删除事件
    pub async fn on_delete(&self, path: &Path) -> usize {
        self.enqueue_remove(path).await as usize
    }

    /// 重命名事件（旧路径）
    pub async fn on_rename(&self, path: &Path) -> usize {
        self.enqueue_remove(path).await as usize
    }

    async fn enqueue_upload(&self, path: &Path) -> bool {
        let Some(dest_path) = self.dest_path_for(path) else {
            warn!("任务 {} 路径不在源目录下: {:?}", self.task.id, path);
            return false;
        };

        let job = QueueJob::Upload(UploadJob {
            task_id: self.task.id,
            backend: self.backend.clone(),
            journal: self.journal.clone(),
            dest_path,
            source_path: path.to_path_buf(),
            wait_for_completion: self.should_wait(path),
        });
        self.enqueue(job).await
    }

    async fn enqueue_remove(&self, path: &Path) -> bool {
        if !self.filter.accepts_removed(path) {
            debug!("任务 {} 路径被过滤: {:?}", self.task.id, path);
            return false;
        }
        let Some(dest_path) = self.dest_path_for(path) else {
            warn!("任务 {} 路径不在源目录下: {:?}", self.task.id, path);
            return false;
        };

        let job = QueueJob::Remove(RemoveJob {
            task_id: self.task.id,
            backend: self.backend.clone(),
            journal: self.journal.clone(),
            dest_path,
            source_path: path.to_path_buf(),
        });
        self.enqueue(job).await
    }

    async fn enqueue(&self, job: QueueJob) -> bool {
        debug!("任务 {} 投递队列: {:?}", self.task.id, job);
        match self.queue.enqueue(job).await {
            Ok(()) => true,
            Err(e) => {
                warn!("任务 {} 投递上传队列失败: {}", self.task.id, e);
                false
            }
        }
    }

    /// 事件循环：直到取消或事件通道关闭
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<FileChangeEvent>,
        cancel_token: CancellationToken,
    ) {
        info!("任务 {} 变更事件适配器已启动", self.task.id);
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            // 队列满时投递会等待，停止请求需要能打断
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                _ = self.handle_event(event) => {}
            }
        }
        info!("任务 {} 变更事件适配器已停止", self.task.id);
    }
}
