//! 远端存储模块
//!
//! 所有后端实现统一的 [`StorageBackend`] 接口：
//! `connect` / `put` / `remove_dir` / `remove` / `close`。
//! 后端自行负责 `put` 时幂等地创建父目录，调用方不需要预先建目录。

pub mod mock_backend;
pub mod opendal_backend;
pub mod registry;
pub mod smb_backend;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::autobackup::error::Result;

pub use mock_backend::{MockBackend, MockCall, MockOp};
pub use opendal_backend::OpendalBackend;
pub use registry::{FieldKind, FormField, StorageEngine, StorageRegistry};
pub use smb_backend::SmbBackend;

/// 上传数据源
pub type PutReader = Box<dyn AsyncRead + Send + Unpin>;

/// 远端存储后端
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// 后端名称（用于日志）
    fn name(&self) -> &str;

    /// 建立连接 / 会话
    async fn connect(&self) -> Result<()>;

    /// 上传 `size` 字节到 `dest_path`
    async fn put(&self, reader: PutReader, dest_path: &str, size: u64) -> Result<()>;

    /// 删除远端目录（递归）
    async fn remove_dir(&self, dest_path: &str) -> Result<()>;

    /// 删除远端文件
    async fn remove(&self, dest_path: &str) -> Result<()>;

    /// 释放连接资源
    async fn close(&self) -> Result<()>;
}

/// 将远端路径的父目录以 `/` 结尾返回，根目录返回 None
pub(crate) fn parent_dir(dest_path: &str) -> Option<String> {
    let trimmed = dest_path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    let parent = &trimmed[..idx];
    if parent.is_empty() {
        None
    } else {
        Some(format!("{}/", parent))
    }
}
