// 上传模块

pub mod folder;
pub mod queue;

pub use folder::{format_bytes, FolderScanner, ScannedFile};
pub use queue::{
    wait_for_stable_size, QueueJob, QueueSettings, QueueStats, RemoveJob, UploadJob, UploadQueue,
};
