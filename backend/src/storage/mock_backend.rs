//! 内存存储后端
//!
//! 记录每一次调用并保存上传内容，供测试断言使用。

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;

use super::{PutReader, StorageBackend};
use crate::autobackup::error::{BackupError, Result};

/// 调用类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOp {
    Connect,
    Put,
    RemoveDir,
    Remove,
    Close,
}

/// 一次调用记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub op: MockOp,
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Default, Deserialize)]
struct MockConfig {
    #[serde(default)]
    fail_put: bool,
    #[serde(default)]
    put_delay_ms: u64,
}

/// 上传开始时的回调，参数为远端路径
#[derive(Clone)]
pub struct PutHook(Arc<dyn Fn(&str) + Send + Sync>);

impl std::fmt::Debug for PutHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PutHook")
    }
}

/// 内存后端
#[derive(Debug, Default)]
pub struct MockBackend {
    fail_put: bool,
    put_delay: Duration,
    connect_delay: Duration,
    put_hook: Option<PutHook>,
    calls: Mutex<Vec<MockCall>>,
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// 空配置视为默认配置
    pub fn from_config(config: &str) -> Result<Self> {
        let cfg: MockConfig = if config.trim().is_empty() {
            MockConfig::default()
        } else {
            serde_json::from_str(config)?
        };
        Ok(Self {
            fail_put: cfg.fail_put,
            put_delay: Duration::from_millis(cfg.put_delay_ms),
            ..Self::default()
        })
    }

    /// 每次上传前等待一段时间
    pub fn with_put_delay(mut self, delay: Duration) -> Self {
        self.put_delay = delay;
        self
    }

    /// 每次连接前等待一段时间
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// 每次上传开始（读取数据之前）调用回调
    pub fn with_put_hook(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.put_hook = Some(PutHook(Arc::new(hook)));
        self
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    /// 所有上传调用
    pub fn puts(&self) -> Vec<MockCall> {
        self.filter(MockOp::Put)
    }

    /// 所有删除调用（文件与目录）
    pub fn removes(&self) -> Vec<MockCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c.op, MockOp::Remove | MockOp::RemoveDir))
            .cloned()
            .collect()
    }

    pub fn count(&self, op: MockOp) -> usize {
        self.calls.lock().iter().filter(|c| c.op == op).count()
    }

    /// 已上传对象内容
    pub fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(path).cloned()
    }

    fn filter(&self, op: MockOp) -> Vec<MockCall> {
        self.calls.lock().iter().filter(|c| c.op == op).cloned().collect()
    }

    fn record(&self, op: MockOp, path: &str, size: u64) {
        self.calls.lock().push(MockCall {
            op,
            path: path.to_string(),
            size,
        });
    }
}

#[async_trait]
impl StorageBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(&self) -> Result<()> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        self.record(MockOp::Connect, "", 0);
        Ok(())
    }

    async fn put(&self, mut reader: PutReader, dest_path: &str, size: u64) -> Result<()> {
        if let Some(PutHook(hook)) = &self.put_hook {
            hook(dest_path);
        }
        if !self.put_delay.is_zero() {
            tokio::time::sleep(self.put_delay).await;
        }
        if self.fail_put {
            return Err(BackupError::Storage(format!("模拟上传失败: {}", dest_path)));
        }

        let mut data = Vec::with_capacity(size as usize);
        reader.read_to_end(&mut data).await?;
        self.record(MockOp::Put, dest_path, data.len() as u64);
        self.objects.lock().insert(dest_path.to_string(), data);
        Ok(())
    }

    async fn remove_dir(&self, dest_path: &str) -> Result<()> {
        self.record(MockOp::RemoveDir, dest_path, 0);
        let prefix = format!("{}/", dest_path.trim_end_matches('/'));
        self.objects.lock().retain(|k, _| !k.starts_with(&prefix));
        Ok(())
    }

    async fn remove(&self, dest_path: &str) -> Result<()> {
        self.record(MockOp::Remove, dest_path, 0);
        self.objects.lock().remove(dest_path);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.record(MockOp::Close, "", 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_put() {
        let backend = MockBackend::new();
        backend.put(Box::new(&b"hello"[..]), "/backup/test.txt", 5).await.unwrap();

        let puts = backend.puts();
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].path, "/backup/test.txt");
        assert_eq!(puts[0].size, 5);
        assert_eq!(backend.object("/backup/test.txt").unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_remove_dir_drops_children() {
        let backend = MockBackend::new();
        backend.put(Box::new(&b"a"[..]), "/b/d/a.txt", 1).await.unwrap();
        backend.put(Box::new(&b"c"[..]), "/b/dd/c.txt", 1).await.unwrap();
        backend.remove_dir("/b/d").await.unwrap();

        assert!(backend.object("/b/d/a.txt").is_none());
        assert!(backend.object("/b/dd/c.txt").is_some());
        assert_eq!(backend.removes().len(), 1);
    }

    #[tokio::test]
    async fn test_fail_put() {
        let backend = MockBackend::from_config(r#"{"fail_put":true}"#).unwrap();
        let err = backend.put(Box::new(&b"a"[..]), "/a", 1).await.unwrap_err();
        assert!(matches!(err, BackupError::Storage(_)));
        assert_eq!(backend.count(MockOp::Put), 0);
    }
}
