//! 文件监听模块

pub mod adapter;
pub mod file_watcher;

pub use adapter::ChangeEventAdapter;
pub use file_watcher::{
    notify_factory, FileChangeEvent, FileChangeType, ManualHandle, ManualNotifier, Notifier,
    NotifierFactory, NotifyWatcher,
};
