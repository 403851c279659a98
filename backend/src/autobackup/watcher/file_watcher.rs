//! 文件系统监听服务
//!
//! [`Notifier`] 是监听原语的抽象：`add_dir` 注册目录，`watch` 开始投递事件，`close` 停止。
//! 事件统一转换为 [`FileChangeEvent`] 通过无界通道发给变更事件适配器。
//!
//! - [`NotifyWatcher`]：基于 notify crate 的跨平台实现
//! - [`ManualNotifier`]：由外部直接投递事件（嵌入方自带监听源或测试）

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::autobackup::error::{BackupError, Result};

/// 文件变更事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChangeEvent {
    /// 变更的路径
    pub path: PathBuf,
    /// 事件类型
    pub kind: FileChangeType,
}

impl FileChangeEvent {
    pub fn new(path: impl Into<PathBuf>, kind: FileChangeType) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// 文件变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChangeType {
    /// 创建
    Created,
    /// 修改
    Modified,
    /// 删除
    Removed,
    /// 重命名（旧路径）
    Renamed,
}

/// 监听原语
pub trait Notifier: Send {
    /// 注册监听目录（递归）
    fn add_dir(&mut self, path: &Path) -> Result<()>;

    /// 开始投递事件，只调用一次
    fn watch(&mut self) -> Result<()>;

    /// 停止监听并释放资源
    fn close(&mut self) -> Result<()>;
}

/// 监听器工厂：为每个启动的任务创建一个监听器
pub type NotifierFactory =
    Arc<dyn Fn(mpsc::UnboundedSender<FileChangeEvent>) -> Result<Box<dyn Notifier>> + Send + Sync>;

/// 默认工厂：notify 监听器
pub fn notify_factory() -> NotifierFactory {
    Arc::new(|tx| Ok(Box::new(NotifyWatcher::new(tx)?) as Box<dyn Notifier>))
}

impl From<notify::Error> for BackupError {
    fn from(err: notify::Error) -> Self {
        match err.kind {
            notify::ErrorKind::Io(io) => BackupError::Io(io),
            _ => BackupError::Io(std::io::Error::new(std::io::ErrorKind::Other, err.to_string())),
        }
    }
}

/// 基于 notify 的文件监听器
pub struct NotifyWatcher {
    /// 内部 watcher（Option 用于 close）
    watcher: Option<RecommendedWatcher>,
    /// 注册的目录
    dirs: Vec<PathBuf>,
    /// 是否已开始监听
    watching: bool,
}

impl NotifyWatcher {
    pub fn new(event_tx: mpsc::UnboundedSender<FileChangeEvent>) -> Result<Self> {
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for change in Self::process_event(&event) {
                    if let Err(e) = event_tx.send(change) {
                        tracing::warn!("发送文件变更事件失败（适配器已停止）: {}", e);
                        break;
                    }
                }
            }
            Err(e) => {
                tracing::error!("文件监听错误: {}", e);
            }
        })?;

        Ok(Self {
            watcher: Some(watcher),
            dirs: Vec::new(),
            watching: false,
        })
    }

    /// notify 事件转换为变更事件
    ///
    /// 重命名拆成两半：旧路径按删除处理（Renamed），新路径按创建处理（Created）。
    fn process_event(event: &Event) -> Vec<FileChangeEvent> {
        let single = |kind: FileChangeType| -> Vec<FileChangeEvent> {
            event
                .paths
                .iter()
                .map(|p| FileChangeEvent::new(p.clone(), kind))
                .collect()
        };

        match &event.kind {
            EventKind::Create(_) => single(FileChangeType::Created),
            EventKind::Modify(ModifyKind::Name(mode)) => match mode {
                RenameMode::From => single(FileChangeType::Renamed),
                RenameMode::To => single(FileChangeType::Created),
                RenameMode::Both => {
                    let mut changes = Vec::with_capacity(2);
                    if let Some(from) = event.paths.first() {
                        changes.push(FileChangeEvent::new(from.clone(), FileChangeType::Renamed));
                    }
                    if let Some(to) = event.paths.get(1) {
                        changes.push(FileChangeEvent::new(to.clone(), FileChangeType::Created));
                    }
                    changes
                }
                // 平台未区分重命名方向时，以路径是否存在判断
                _ => event
                    .paths
                    .iter()
                    .map(|p| {
                        let kind = if p.exists() {
                            FileChangeType::Created
                        } else {
                            FileChangeType::Renamed
                        };
                        FileChangeEvent::new(p.clone(), kind)
                    })
                    .collect(),
            },
            EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
            EventKind::Modify(_) => single(FileChangeType::Modified),
            EventKind::Remove(_) => single(FileChangeType::Removed),
            _ => Vec::new(),
        }
    }

    pub fn is_watching(&self) -> bool {
        self.watching && self.watcher.is_some()
    }
}

impl Notifier for NotifyWatcher {
    fn add_dir(&mut self, path: &Path) -> Result<()> {
        if !path.is_dir() {
            return Err(BackupError::InvalidConfig(format!(
                "监听路径不是目录: {}",
                path.display()
            )));
        }
        self.dirs.push(path.to_path_buf());
        Ok(())
    }

    fn watch(&mut self) -> Result<()> {
        let watcher = self
            .watcher
            .as_mut()
            .ok_or_else(|| BackupError::InvalidConfig("监听器已关闭".to_string()))?;
        for dir in &self.dirs {
            watcher.watch(dir, RecursiveMode::Recursive)?;
            tracing::info!("开始监听目录: {:?}", dir);
        }
        self.watching = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut watcher) = self.watcher.take() {
            for dir in &self.dirs {
                if let Err(e) = watcher.unwatch(dir) {
                    tracing::debug!("取消监听 {:?} 失败: {}", dir, e);
                }
            }
            tracing::info!("文件监听已停止: {:?}", self.dirs);
        }
        self.watching = false;
        Ok(())
    }
}

impl Drop for NotifyWatcher {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// 手动投递事件的监听器
///
/// `handle()` 返回的句柄在 `watch` 之后才会转发事件，`close` 之后丢弃事件。
pub struct ManualNotifier {
    state: Arc<ManualState>,
}

#[derive(Default)]
struct ManualState {
    dirs: Mutex<Vec<PathBuf>>,
    tx: Mutex<Option<mpsc::UnboundedSender<FileChangeEvent>>>,
    pending: Mutex<Option<mpsc::UnboundedSender<FileChangeEvent>>>,
    closed: std::sync::atomic::AtomicBool,
}

/// [`ManualNotifier`] 的投递句柄
#[derive(Clone)]
pub struct ManualHandle {
    state: Arc<ManualState>,
}

impl ManualNotifier {
    pub fn new(event_tx: mpsc::UnboundedSender<FileChangeEvent>) -> Self {
        let state = ManualState::default();
        *state.pending.lock() = Some(event_tx);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn handle(&self) -> ManualHandle {
        ManualHandle {
            state: self.state.clone(),
        }
    }
}

impl Notifier for ManualNotifier {
    fn add_dir(&mut self, path: &Path) -> Result<()> {
        self.state.dirs.lock().push(path.to_path_buf());
        Ok(())
    }

    fn watch(&mut self) -> Result<()> {
        let tx = self.state.pending.lock().take();
        *self.state.tx.lock() = tx;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.state.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        self.state.tx.lock().take();
        Ok(())
    }
}

impl ManualHandle {
    /// 投递事件，返回是否被转发
    pub fn emit(&self, path: impl Into<PathBuf>, kind: FileChangeType) -> bool {
        match self.state.tx.lock().as_ref() {
            Some(tx) => tx.send(FileChangeEvent::new(path, kind)).is_ok(),
            None => false,
        }
    }

    /// 已注册的监听目录
    pub fn dirs(&self) -> Vec<PathBuf> {
        self.state.dirs.lock().clone()
    }

    pub fn is_watching(&self) -> bool {
        self.state.tx.lock().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(std::sync::atomic::Ordering::SeqCst)
    }
}
