//! SMB 存储后端
//!
//! 通过系统已挂载的共享目录写入，远端路径相对于挂载点（可附加 `root` 子目录）。

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::{PutReader, StorageBackend};
use crate::autobackup::error::{BackupError, Result};

#[derive(Debug, Clone, Deserialize)]
struct SmbConfig {
    mount_point: PathBuf,
    #[serde(default)]
    root: Option<String>,
}

/// SMB 后端
#[derive(Debug)]
pub struct SmbBackend {
    /// 共享挂载点，必须已由系统挂载
    mount_point: PathBuf,
    /// 挂载点 + root 子目录
    base: PathBuf,
}

impl SmbBackend {
    pub fn from_config(config: &str) -> Result<Self> {
        let cfg: SmbConfig = serde_json::from_str(config)?;
        if cfg.mount_point.as_os_str().is_empty() {
            return Err(BackupError::InvalidConfig("SMB 挂载路径不能为空".to_string()));
        }

        let mut base = cfg.mount_point.clone();
        if let Some(root) = cfg.root.as_deref().map(|r| r.trim_matches('/')) {
            if !root.is_empty() {
                base = base.join(root);
            }
        }
        Ok(Self {
            mount_point: cfg.mount_point,
            base,
        })
    }

    /// 远端路径映射为挂载目录下的本地路径
    fn resolve(&self, dest_path: &str) -> Result<PathBuf> {
        let relative = dest_path.trim_start_matches('/');
        if relative.split('/').any(|part| part == "..") {
            return Err(BackupError::Storage(format!("非法的远端路径: {}", dest_path)));
        }
        Ok(self.base.join(relative))
    }

    pub fn base(&self) -> &Path {
        &self.base
    }
}

#[async_trait]
impl StorageBackend for SmbBackend {
    fn name(&self) -> &str {
        "smb"
    }

    async fn connect(&self) -> Result<()> {
        // 挂载点不存在说明共享未挂载，不能退化为写本地磁盘
        match fs::metadata(&self.mount_point).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(BackupError::Storage(format!(
                    "SMB 挂载路径不是目录: {:?}",
                    self.mount_point
                )))
            }
            Err(e) => {
                return Err(BackupError::Storage(format!(
                    "SMB 共享不可用: {:?}, error={}",
                    self.mount_point, e
                )))
            }
        }

        fs::create_dir_all(&self.base).await?;
        info!("SMB 共享目录可用: {:?}", self.base);
        Ok(())
    }

    async fn put(&self, mut reader: PutReader, dest_path: &str, size: u64) -> Result<()> {
        let target = self.resolve(dest_path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::File::create(&target).await?;
        let written = tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;

        if written != size {
            return Err(BackupError::Storage(format!(
                "上传 {} 字节数不一致: 期望 {}，实际 {}",
                dest_path, size, written
            )));
        }
        debug!("smb 上传完成: {:?} ({} 字节)", target, written);
        Ok(())
    }

    async fn remove_dir(&self, dest_path: &str) -> Result<()> {
        let target = self.resolve(dest_path)?;
        match fs::remove_dir_all(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, dest_path: &str) -> Result<()> {
        let target = self.resolve(dest_path)?;
        match fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn backend_at(dir: &Path) -> SmbBackend {
        let json = serde_json::json!({ "mount_point": dir, "root": "/nas/" }).to_string();
        SmbBackend::from_config(&json).unwrap()
    }

    #[tokio::test]
    async fn test_put_creates_parents() {
        let dir = tempdir().unwrap();
        let backend = backend_at(dir.path());
        backend.connect().await.unwrap();

        let reader: PutReader = Box::new(&b"hello"[..]);
        backend.put(reader, "/backup/a/b.txt", 5).await.unwrap();

        let content = std::fs::read(dir.path().join("nas/backup/a/b.txt")).unwrap();
        assert_eq!(content, b"hello");
    }

    #[tokio::test]
    async fn test_remove_and_remove_dir() {
        let dir = tempdir().unwrap();
        let backend = backend_at(dir.path());
        backend.connect().await.unwrap();

        backend.put(Box::new(&b"x"[..]), "/backup/d/x.txt", 1).await.unwrap();
        backend.remove("/backup/d/x.txt").await.unwrap();
        assert!(!backend.base().join("backup/d/x.txt").exists());

        backend.remove_dir("/backup/d").await.unwrap();
        assert!(!backend.base().join("backup/d").exists());

        // 不存在的路径不报错
        backend.remove("/backup/none.txt").await.unwrap();
        backend.remove_dir("/backup/none").await.unwrap();
    }

    #[tokio::test]
    async fn test_size_mismatch() {
        let dir = tempdir().unwrap();
        let backend = backend_at(dir.path());
        let err = backend.put(Box::new(&b"abc"[..]), "/a.txt", 10).await.unwrap_err();
        assert!(matches!(err, BackupError::Storage(_)));
    }

    #[tokio::test]
    async fn test_connect_requires_mounted_share() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nas_share_not_mounted");
        let json = serde_json::json!({ "mount_point": missing, "root": "backup" }).to_string();
        let backend = SmbBackend::from_config(&json).unwrap();

        let err = backend.connect().await.unwrap_err();
        assert!(matches!(err, BackupError::Storage(_)));
        assert!(!missing.exists());

        // 挂载点是普通文件
        let file = dir.path().join("plain");
        std::fs::write(&file, b"x").unwrap();
        let json = serde_json::json!({ "mount_point": file }).to_string();
        assert!(SmbBackend::from_config(&json).unwrap().connect().await.is_err());
    }

    #[tokio::test]
    async fn test_connect_creates_root_under_mount() {
        let dir = tempdir().unwrap();
        let backend = backend_at(dir.path());
        backend.connect().await.unwrap();
        assert!(dir.path().join("nas").is_dir());
    }

    #[test]
    fn test_rejects_parent_traversal() {
        let dir = tempdir().unwrap();
        let backend = backend_at(dir.path());
        assert!(backend.resolve("/../etc/passwd").is_err());
    }
}
