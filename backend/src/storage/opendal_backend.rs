//! 基于 OpenDAL 的远端存储后端（S3 / FTP / WebDAV）
//!
//! 构造时只解析并解密配置，`connect` 时才创建 Operator 并做一次连通性检查。

use async_trait::async_trait;
use opendal::{services, Operator};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use super::{parent_dir, PutReader, StorageBackend};
use crate::autobackup::error::{BackupError, Result};
use crate::encryption::SecretCodec;

/// 单次写入的分块大小
const CHUNK_SIZE: usize = 4 * 1024 * 1024; // 4MB

/// S3 配置
#[derive(Debug, Clone, Deserialize)]
struct S3Config {
    bucket: String,
    region: String,
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    root: Option<String>,
    #[serde(default)]
    access_key_id: Option<String>,
    /// 密文
    #[serde(default)]
    secret_access_key: Option<String>,
}

/// FTP 配置
#[derive(Debug, Clone, Deserialize)]
struct FtpConfig {
    endpoint: String,
    #[serde(default)]
    user: Option<String>,
    /// 密文
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    root: Option<String>,
}

/// WebDAV 配置
#[derive(Debug, Clone, Deserialize)]
struct WebdavConfig {
    endpoint: String,
    #[serde(default)]
    username: Option<String>,
    /// 密文
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    root: Option<String>,
}

/// 已解密的服务配置
#[derive(Clone)]
enum ServiceConfig {
    S3(S3Config),
    Ftp(FtpConfig),
    Webdav(WebdavConfig),
}

impl ServiceConfig {
    fn build_operator(&self) -> Result<Operator> {
        let op = match self {
            ServiceConfig::S3(cfg) => {
                let mut builder = services::S3::default()
                    .bucket(&cfg.bucket)
                    .region(&cfg.region)
                    .root(cfg.root.as_deref().unwrap_or("/"));
                if let Some(ref ep) = cfg.endpoint {
                    builder = builder.endpoint(ep);
                }
                if let Some(ref key_id) = cfg.access_key_id {
                    builder = builder.access_key_id(key_id);
                }
                if let Some(ref secret) = cfg.secret_access_key {
                    builder = builder.secret_access_key(secret);
                }
                Operator::new(builder)?.finish()
            }
            ServiceConfig::Ftp(cfg) => {
                let mut builder = services::Ftp::default()
                    .endpoint(&cfg.endpoint)
                    .root(cfg.root.as_deref().unwrap_or("/"));
                if let Some(ref user) = cfg.user {
                    builder = builder.user(user);
                }
                if let Some(ref password) = cfg.password {
                    builder = builder.password(password);
                }
                Operator::new(builder)?.finish()
            }
            ServiceConfig::Webdav(cfg) => {
                let mut builder = services::Webdav::default()
                    .endpoint(&cfg.endpoint)
                    .root(cfg.root.as_deref().unwrap_or("/"));
                if let Some(ref username) = cfg.username {
                    builder = builder.username(username);
                }
                if let Some(ref password) = cfg.password {
                    builder = builder.password(password);
                }
                Operator::new(builder)?.finish()
            }
        };
        Ok(op)
    }
}

/// 解密可选的敏感字段
fn decode_secret(codec: &dyn SecretCodec, value: Option<String>) -> Result<Option<String>> {
    match value {
        Some(v) if !v.is_empty() => Ok(Some(codec.decode(&v)?)),
        _ => Ok(None),
    }
}

/// OpenDAL 存储后端
pub struct OpendalBackend {
    name: &'static str,
    config: ServiceConfig,
    op: RwLock<Option<Operator>>,
}

impl std::fmt::Debug for OpendalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpendalBackend")
            .field("name", &self.name)
            .field("connected", &self.op.read().is_some())
            .finish()
    }
}

impl OpendalBackend {
    fn with_config(name: &'static str, config: ServiceConfig) -> Self {
        Self {
            name,
            config,
            op: RwLock::new(None),
        }
    }

    /// S3 兼容对象存储
    pub fn s3_from_config(config: &str, codec: &dyn SecretCodec) -> Result<Self> {
        let mut cfg: S3Config = serde_json::from_str(config)?;
        if cfg.bucket.trim().is_empty() {
            return Err(BackupError::InvalidConfig("S3 存储桶不能为空".to_string()));
        }
        cfg.secret_access_key = decode_secret(codec, cfg.secret_access_key.take())?;
        Ok(Self::with_config("s3", ServiceConfig::S3(cfg)))
    }

    /// FTP
    pub fn ftp_from_config(config: &str, codec: &dyn SecretCodec) -> Result<Self> {
        let mut cfg: FtpConfig = serde_json::from_str(config)?;
        if cfg.endpoint.trim().is_empty() {
            return Err(BackupError::InvalidConfig("FTP 服务地址不能为空".to_string()));
        }
        cfg.password = decode_secret(codec, cfg.password.take())?;
        Ok(Self::with_config("ftp", ServiceConfig::Ftp(cfg)))
    }

    /// WebDAV
    pub fn webdav_from_config(config: &str, codec: &dyn SecretCodec) -> Result<Self> {
        let mut cfg: WebdavConfig = serde_json::from_str(config)?;
        if cfg.endpoint.trim().is_empty() {
            return Err(BackupError::InvalidConfig("WebDAV 服务地址不能为空".to_string()));
        }
        cfg.password = decode_secret(codec, cfg.password.take())?;
        Ok(Self::with_config("webdav", ServiceConfig::Webdav(cfg)))
    }

    fn operator(&self) -> Result<Operator> {
        self.op
            .read()
            .clone()
            .ok_or_else(|| BackupError::Storage(format!("{} 后端尚未连接", self.name)))
    }
}

#[async_trait]
impl StorageBackend for OpendalBackend {
    fn name(&self) -> &str {
        self.name
    }

    async fn connect(&self) -> Result<()> {
        let op = self.config.build_operator()?;
        op.check().await?;
        info!("{} 后端连接成功", self.name);
        *self.op.write() = Some(op);
        Ok(())
    }

    async fn put(&self, mut reader: PutReader, dest_path: &str, size: u64) -> Result<()> {
        let op = self.operator()?;

        if op.info().full_capability().create_dir {
            if let Some(parent) = parent_dir(dest_path) {
                op.create_dir(&parent).await?;
            }
        }

        let mut writer = op.writer(dest_path).await?;
        let mut written: u64 = 0;
        let mut buffer = vec![0u8; CHUNK_SIZE];

        loop {
            let n = reader.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            writer.write(buffer[..n].to_vec()).await?;
            written += n as u64;
        }

        if written != size {
            if let Err(e) = writer.abort().await {
                warn!("放弃写入 {} 失败: {}", dest_path, e);
            }
            return Err(BackupError::Storage(format!(
                "上传 {} 字节数不一致: 期望 {}，实际 {}",
                dest_path, size, written
            )));
        }

        writer.close().await?;
        debug!("{} 上传完成: {} ({} 字节)", self.name, dest_path, written);
        Ok(())
    }

    async fn remove_dir(&self, dest_path: &str) -> Result<()> {
        let op = self.operator()?;
        let dir = format!("{}/", dest_path.trim_end_matches('/'));
        op.remove_all(&dir).await?;
        Ok(())
    }

    async fn remove(&self, dest_path: &str) -> Result<()> {
        let op = self.operator()?;
        op.delete(dest_path).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.op.write().take().is_some() {
            debug!("{} 后端连接已释放", self.name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::{EncryptionService, PlainSecretCodec};

    #[test]
    fn test_s3_config_decrypts_secret() {
        let service =
            EncryptionService::from_base64_key(&EncryptionService::generate_master_key_base64())
                .unwrap();
        let secret = service.encode("top-secret").unwrap();
        let json = format!(
            r#"{{"bucket":"b","region":"us-east-1","access_key_id":"ak","secret_access_key":"{}"}}"#,
            secret
        );

        let backend = OpendalBackend::s3_from_config(&json, &service).unwrap();
        match backend.config {
            ServiceConfig::S3(ref cfg) => {
                assert_eq!(cfg.secret_access_key.as_deref(), Some("top-secret"));
            }
            _ => panic!("expected s3 config"),
        }
        assert_eq!(backend.name(), "s3");
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let err = OpendalBackend::ftp_from_config("not json", &PlainSecretCodec).unwrap_err();
        assert!(matches!(err, BackupError::InvalidConfig(_)));
    }

    #[test]
    fn test_missing_endpoint_is_config_error() {
        let err =
            OpendalBackend::webdav_from_config(r#"{"endpoint":" "}"#, &PlainSecretCodec).unwrap_err();
        assert!(matches!(err, BackupError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_put_before_connect_fails() {
        let backend =
            OpendalBackend::ftp_from_config(r#"{"endpoint":"ftp://127.0.0.1:21"}"#, &PlainSecretCodec)
                .unwrap();
        let reader: PutReader = Box::new(&b"abc"[..]);
        let err = backend.put(reader, "/backup/a.txt", 3).await.unwrap_err();
        assert!(matches!(err, BackupError::Storage(_)));
        assert!(backend.close().await.is_ok());
    }
}
