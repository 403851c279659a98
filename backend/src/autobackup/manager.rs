//! 备份引擎
//!
//! 任务生命周期的协调器：
//! - 增量模式：`start` 连接存储后端、打开去重日志、挂接文件监听，登记到运行表；`stop` 反向释放
//! - 全量模式：`run_full_scan` / `spawn_full_scan` 由每任务的扫描控制器保证单实例，不进入运行表
//! - `delete`：停止后清除去重日志
//!
//! 运行表中存在某任务即表示其增量监听处于活动状态，同一任务最多登记一次。

use dashmap::DashMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{BackupTask, TaskStatus};
use super::error::{BackupError, Result};
use super::filter::{compile_optional, PathFilter};
use super::persistence::{BackupPersistenceManager, TaskStatusStore};
use super::record::JournalPool;
use super::scanner::{FullScanWalker, ScanReport};
use super::scheduler::{ScanController, ScanControllerStatus, ScanRun, ScanState};
use super::watcher::{notify_factory, ChangeEventAdapter, Notifier, NotifierFactory};
use crate::config::EngineConfig;
use crate::encryption::{EncryptionService, PlainSecretCodec, SecretCodec};
use crate::storage::{StorageBackend, StorageRegistry};
use crate::uploader::{QueueSettings, QueueStats, UploadQueue};

/// 引擎参数
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// 去重日志根目录，每个任务一个子目录
    pub cache_dir: PathBuf,
    pub queue: QueueSettings,
}

/// 运行表中的条目
enum RunSlot {
    /// 已占用任务 ID，正在连接存储后端（值为本次启动的序号）
    Starting(u64),
    Running(RunningTask),
}

/// 活动中的增量任务
struct RunningTask {
    notifier: Box<dyn Notifier>,
    backend: Arc<dyn StorageBackend>,
    /// 适配器事件循环的取消令牌
    cancel_token: CancellationToken,
    adapter_handle: JoinHandle<()>,
}

/// 备份引擎
pub struct BackupEngine {
    registry: StorageRegistry,
    codec: Arc<dyn SecretCodec>,
    notifier_factory: NotifierFactory,
    journals: Arc<JournalPool>,
    queue: Arc<UploadQueue>,
    status_store: Arc<dyn TaskStatusStore>,
    /// 运行表（增量模式）
    running: Mutex<HashMap<u64, RunSlot>>,
    /// 启动序号，区分同一任务 ID 的先后两次启动
    start_seq: AtomicU64,
    /// 全量扫描控制器（每任务一个）
    scan_controllers: DashMap<u64, Arc<ScanController>>,
    shutdown_token: CancellationToken,
}

impl BackupEngine {
    /// 创建引擎并启动上传队列 worker（需要在 tokio 运行时内调用）
    pub fn new(settings: EngineSettings, status_store: Arc<dyn TaskStatusStore>) -> Self {
        let shutdown_token = CancellationToken::new();
        let queue = Arc::new(UploadQueue::new(settings.queue, shutdown_token.child_token()));
        queue.start();

        info!("备份引擎已创建，去重日志目录: {:?}", settings.cache_dir);

        Self {
            registry: StorageRegistry::with_defaults(),
            codec: Arc::new(PlainSecretCodec),
            notifier_factory: notify_factory(),
            journals: Arc::new(JournalPool::new(settings.cache_dir)),
            queue,
            status_store,
            running: Mutex::new(HashMap::new()),
            start_seq: AtomicU64::new(0),
            scan_controllers: DashMap::new(),
            shutdown_token,
        }
    }

    /// 按配置文件创建引擎：状态库、队列参数和凭据解码器
    pub fn from_config(config: &EngineConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        let status_store = BackupPersistenceManager::new(&config.status_db)
            .with_context(|| format!("打开状态数据库失败: {:?}", config.status_db))?;
        let codec: Arc<dyn SecretCodec> = match config.secret_key.as_deref() {
            Some(key) if !key.trim().is_empty() => Arc::new(
                EncryptionService::from_base64_key(key).context("加载凭据密钥失败")?,
            ),
            _ => Arc::new(PlainSecretCodec),
        };

        let settings = EngineSettings {
            cache_dir: config.cache_dir.clone(),
            queue: config.queue_settings(),
        };
        Ok(Self::new(settings, Arc::new(status_store)).with_codec(codec))
    }

    /// 替换存储引擎注册表
    pub fn with_registry(mut self, registry: StorageRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// 替换凭据解码器
    pub fn with_codec(mut self, codec: Arc<dyn SecretCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// 替换文件监听器工厂
    pub fn with_notifier_factory(mut self, factory: NotifierFactory) -> Self {
        self.notifier_factory = factory;
        self
    }

    pub fn journals(&self) -> &Arc<JournalPool> {
        &self.journals
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// 校验任务配置并创建（未连接的）存储后端
    ///
    /// 配置错误在这里同步返回，不会进入运行状态。
    fn prepare_backend(&self, task: &BackupTask) -> Result<Arc<dyn StorageBackend>> {
        PathFilter::from_task(task)?;
        compile_optional(task.ignore_wait_pattern.as_deref())?;
        self.registry
            .build(&task.storage_engine, &task.storage_config, self.codec.as_ref())
    }

    // ==================== 增量模式 ====================

    /// 启动增量监听
    ///
    /// 先在运行表中占用任务 ID，再在锁外连接存储后端，连接期间不阻塞其他任务的操作。
    /// 连接期间被 `stop` 撤销占用时，释放已建立的资源并返回 [`BackupError::Cancelled`]。
    pub async fn start(&self, task: &BackupTask) -> Result<()> {
        let backend = self.prepare_backend(task)?;
        let seq = self.start_seq.fetch_add(1, Ordering::Relaxed);
        {
            let mut running = self.running.lock().await;
            if running.contains_key(&task.id) {
                return Err(BackupError::AlreadyRunning(task.id));
            }
            running.insert(task.id, RunSlot::Starting(seq));
        }

        let attached = match backend.connect().await {
            Ok(()) => self.attach(task, backend.clone()),
            Err(e) => Err(e),
        };

        let mut running = self.running.lock().await;
        let reserved = matches!(running.get(&task.id), Some(RunSlot::Starting(s)) if *s == seq);
        match attached {
            Ok(run) if reserved => {
                running.insert(task.id, RunSlot::Running(run));
                info!("任务 {} 增量监听已启动: {:?} -> {}", task.display_name(), task.source_path, task.dest_path);
                Ok(())
            }
            Ok(run) => {
                drop(running);
                info!("任务 {} 启动期间被停止", task.id);
                self.release(task.id, run).await;
                Err(BackupError::Cancelled)
            }
            Err(e) => {
                if reserved {
                    running.remove(&task.id);
                }
                drop(running);
                if let Err(close_err) = backend.close().await {
                    warn!("任务 {} 关闭存储后端失败: {}", task.id, close_err);
                }
                Err(e)
            }
        }
    }

    /// 打开去重日志、创建适配器并挂接监听器
    fn attach(&self, task: &BackupTask, backend: Arc<dyn StorageBackend>) -> Result<RunningTask> {
        let journal = self.journals.open(task.id)?;
        let adapter = Arc::new(ChangeEventAdapter::new(
            task,
            backend.clone(),
            journal,
            self.queue.clone(),
        )?);

        let (tx, rx) = mpsc::unbounded_channel();
        let mut notifier = (self.notifier_factory)(tx)?;
        notifier.add_dir(&task.source_path)?;
        notifier.watch()?;

        let cancel_token = self.shutdown_token.child_token();
        let adapter_handle = tokio::spawn(adapter.run(rx, cancel_token.clone()));

        Ok(RunningTask {
            notifier,
            backend,
            cancel_token,
            adapter_handle,
        })
    }

    /// 停止增量监听；任务未运行时为空操作
    ///
    /// 任务仍在启动中时撤销占用，由 `start` 负责释放已建立的资源。
    pub async fn stop(&self, task_id: u64) -> Result<()> {
        let removed = self.running.lock().await.remove(&task_id);
        match removed {
            Some(RunSlot::Running(run)) => {
                self.release(task_id, run).await;
                info!("任务 {} 增量监听已停止", task_id);
            }
            Some(RunSlot::Starting(_)) => {
                debug!("任务 {} 正在启动，已撤销", task_id);
            }
            None => {
                debug!("任务 {} 未在运行，忽略停止请求", task_id);
            }
        }
        Ok(())
    }

    /// 关闭监听、等待适配器退出并释放后端和日志
    async fn release(&self, task_id: u64, mut run: RunningTask) {
        if let Err(e) = run.notifier.close() {
            warn!("任务 {} 关闭文件监听失败: {}", task_id, e);
        }
        run.cancel_token.cancel();
        if let Err(e) = run.adapter_handle.await {
            warn!("任务 {} 事件适配器异常退出: {}", task_id, e);
        }
        if let Err(e) = run.backend.close().await {
            warn!("任务 {} 关闭存储后端失败: {}", task_id, e);
        }

        // 全量扫描仍在使用时保留日志句柄
        if !self.is_scanning(task_id) {
            self.journals.close(task_id);
        }
    }

    /// 删除任务：停止运行并清除去重日志
    pub async fn delete(&self, task_id: u64) -> Result<()> {
        self.stop(task_id).await?;

        if let Some(controller) = self.scan_controller_if_exists(task_id) {
            controller.cancel();
            controller.wait_idle().await;
        }
        self.scan_controllers.remove(&task_id);

        self.journals.remove(task_id)?;
        if let Err(e) = self.status_store.delete_scan_result(task_id) {
            warn!("任务 {} 删除状态记录失败: {}", task_id, e);
        }

        info!("任务 {} 已删除", task_id);
        Ok(())
    }

    /// 增量监听是否活动
    pub async fn is_running(&self, task_id: u64) -> bool {
        matches!(self.running.lock().await.get(&task_id), Some(RunSlot::Running(_)))
    }

    /// 所有活动中的增量任务
    pub async fn running_tasks(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .running
            .lock()
            .await
            .iter()
            .filter(|(_, slot)| matches!(slot, RunSlot::Running(_)))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    // ==================== 全量模式 ====================

    fn scan_controller(&self, task_id: u64) -> Arc<ScanController> {
        self.scan_controllers
            .entry(task_id)
            .or_insert_with(|| {
                Arc::new(ScanController::new(task_id, self.shutdown_token.child_token()))
            })
            .clone()
    }

    fn scan_controller_if_exists(&self, task_id: u64) -> Option<Arc<ScanController>> {
        self.scan_controllers.get(&task_id).map(|c| c.clone())
    }

    fn is_scanning(&self, task_id: u64) -> bool {
        self.scan_controller_if_exists(task_id)
            .map_or(false, |c| c.is_running())
    }

    /// 执行一次全量扫描（在当前任务中等待完成）
    pub async fn run_full_scan(&self, task: &BackupTask) -> Result<ScanReport> {
        let backend = self.prepare_backend(task)?;
        let run = self.scan_controller(task.id).try_begin()?;
        self.execute_scan(task, backend, run).await
    }

    /// 在后台启动全量扫描
    ///
    /// 配置错误和 "running, please wait" 同步返回。
    pub fn spawn_full_scan(
        self: &Arc<Self>,
        task: &BackupTask,
    ) -> Result<JoinHandle<Result<ScanReport>>> {
        let backend = self.prepare_backend(task)?;
        let run = self.scan_controller(task.id).try_begin()?;

        let engine = self.clone();
        let task = task.clone();
        Ok(tokio::spawn(async move { engine.execute_scan(&task, backend, run).await }))
    }

    /// 停止全量扫描，返回是否有正在执行的扫描
    pub fn stop_full_scan(&self, task_id: u64) -> bool {
        self.scan_controller_if_exists(task_id)
            .map_or(false, |c| c.cancel())
    }

    /// 最近一次全量扫描的状态
    pub fn scan_state(&self, task_id: u64) -> ScanState {
        self.scan_controller_if_exists(task_id)
            .map_or(ScanState::Idle, |c| c.state())
    }

    pub fn scan_status(&self, task_id: u64) -> Option<ScanControllerStatus> {
        self.scan_controller_if_exists(task_id).map(|c| c.status())
    }

    async fn execute_scan(
        &self,
        task: &BackupTask,
        backend: Arc<dyn StorageBackend>,
        run: ScanRun,
    ) -> Result<ScanReport> {
        let result = self.scan_with_backend(task, backend.clone(), run.token().clone()).await;

        if let Err(e) = backend.close().await {
            warn!("任务 {} 关闭存储后端失败: {}", task.id, e);
        }

        let (state, status, message) = match &result {
            Ok(report) => (
                ScanState::Completed,
                TaskStatus::Idle,
                format!("备份完成: {}", report.summary()),
            ),
            Err(e) if e.is_cancelled() => {
                info!("任务 {} 全量扫描已取消", task.id);
                (ScanState::Cancelled, TaskStatus::Idle, "备份已取消".to_string())
            }
            Err(e) => {
                error!("任务 {} 全量扫描失败: {}", task.id, e);
                (ScanState::Failed, TaskStatus::Failure, format!("备份失败: {}", e))
            }
        };

        if let Err(e) = self.status_store.save_scan_result(task.id, status, &message) {
            warn!("任务 {} 保存扫描结果失败: {}", task.id, e);
        }
        run.finish(state);

        result
    }

    async fn scan_with_backend(
        &self,
        task: &BackupTask,
        backend: Arc<dyn StorageBackend>,
        cancel_token: CancellationToken,
    ) -> Result<ScanReport> {
        backend.connect().await?;
        let journal = self.journals.open(task.id)?;
        let walker = FullScanWalker::new(task, backend, journal, cancel_token)?;
        walker.walk().await
    }

    // ==================== 关闭 ====================

    /// 停止所有任务、等待扫描结束并关闭上传队列
    pub async fn shutdown(&self) {
        info!("备份引擎正在关闭...");
        self.shutdown_token.cancel();

        let ids: Vec<u64> = self.running.lock().await.keys().copied().collect();
        for task_id in ids {
            if let Err(e) = self.stop(task_id).await {
                warn!("任务 {} 停止失败: {}", task_id, e);
            }
        }

        let controllers: Vec<Arc<ScanController>> =
            self.scan_controllers.iter().map(|c| c.value().clone()).collect();
        for controller in controllers {
            controller.wait_idle().await;
        }

        self.queue.shutdown().await;
        self.journals.close_all();
        info!("备份引擎已关闭");
    }
}
