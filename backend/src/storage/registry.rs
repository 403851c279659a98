//! 存储引擎注册表
//!
//! 引擎名称解析为显式枚举，每个变体对应一个构造函数。
//! 构造函数接收任务的原始配置（JSON，敏感字段为密文），自行解密后创建后端实例。

use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use super::mock_backend::MockBackend;
use super::opendal_backend::OpendalBackend;
use super::smb_backend::SmbBackend;
use super::StorageBackend;
use crate::autobackup::error::{BackupError, Result};
use crate::encryption::SecretCodec;

/// 存储引擎类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageEngine {
    /// 对象存储（S3 兼容）
    S3,
    /// FTP
    Ftp,
    /// SMB（系统挂载的共享目录）
    Smb,
    /// WebDAV
    Webdav,
    /// 测试用内存后端
    Mock,
}

impl StorageEngine {
    pub const ALL: [StorageEngine; 5] = [
        StorageEngine::S3,
        StorageEngine::Ftp,
        StorageEngine::Smb,
        StorageEngine::Webdav,
        StorageEngine::Mock,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageEngine::S3 => "s3",
            StorageEngine::Ftp => "ftp",
            StorageEngine::Smb => "smb",
            StorageEngine::Webdav => "webdav",
            StorageEngine::Mock => "mock",
        }
    }

    /// 配置表单字段（仅供管理界面渲染，引擎不解析）
    pub fn form_fields(&self) -> Vec<FormField> {
        match self {
            StorageEngine::S3 => vec![
                FormField::text("bucket", "存储桶", true),
                FormField::text("region", "区域", true),
                FormField::text("endpoint", "服务地址", false),
                FormField::text("root", "根目录", false),
                FormField::text("access_key_id", "Access Key", true),
                FormField::secret("secret_access_key", "Secret Key"),
            ],
            StorageEngine::Ftp => vec![
                FormField::text("endpoint", "服务地址 (ftp://host:21)", true),
                FormField::text("user", "用户名", false),
                FormField::secret("password", "密码"),
                FormField::text("root", "根目录", false),
            ],
            StorageEngine::Smb => vec![
                FormField::text("mount_point", "共享挂载路径", true),
                FormField::text("root", "根目录", false),
            ],
            StorageEngine::Webdav => vec![
                FormField::text("endpoint", "服务地址", true),
                FormField::text("username", "用户名", false),
                FormField::secret("password", "密码"),
                FormField::text("root", "根目录", false),
            ],
            StorageEngine::Mock => vec![FormField {
                name: "fail_put",
                label: "模拟上传失败",
                kind: FieldKind::Bool,
                required: false,
            }],
        }
    }
}

impl FromStr for StorageEngine {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "s3" | "oss" | "object" => Ok(StorageEngine::S3),
            "ftp" => Ok(StorageEngine::Ftp),
            "smb" => Ok(StorageEngine::Smb),
            "webdav" => Ok(StorageEngine::Webdav),
            "mock" => Ok(StorageEngine::Mock),
            _ => Err(BackupError::UnsupportedEngine(s.to_string())),
        }
    }
}

impl std::fmt::Display for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 表单字段类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    /// 敏感字段，保存时加密
    Secret,
    Bool,
}

/// 配置表单字段
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormField {
    pub name: &'static str,
    pub label: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

impl FormField {
    fn text(name: &'static str, label: &'static str, required: bool) -> Self {
        Self {
            name,
            label,
            kind: FieldKind::Text,
            required,
        }
    }

    fn secret(name: &'static str, label: &'static str) -> Self {
        Self {
            name,
            label,
            kind: FieldKind::Secret,
            required: false,
        }
    }
}

/// 后端构造函数
pub type BackendConstructor =
    Arc<dyn Fn(&str, &dyn SecretCodec) -> Result<Arc<dyn StorageBackend>> + Send + Sync>;

/// 存储引擎注册表
#[derive(Clone)]
pub struct StorageRegistry {
    constructors: HashMap<StorageEngine, BackendConstructor>,
}

impl std::fmt::Debug for StorageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut engines: Vec<&str> = self.constructors.keys().map(|e| e.as_str()).collect();
        engines.sort_unstable();
        f.debug_struct("StorageRegistry").field("engines", &engines).finish()
    }
}

impl StorageRegistry {
    /// 空注册表
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// 注册所有内置后端
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(StorageEngine::S3, |config, codec| {
            Ok(Arc::new(OpendalBackend::s3_from_config(config, codec)?) as Arc<dyn StorageBackend>)
        });
        registry.register(StorageEngine::Ftp, |config, codec| {
            Ok(Arc::new(OpendalBackend::ftp_from_config(config, codec)?) as Arc<dyn StorageBackend>)
        });
        registry.register(StorageEngine::Webdav, |config, codec| {
            Ok(Arc::new(OpendalBackend::webdav_from_config(config, codec)?) as Arc<dyn StorageBackend>)
        });
        registry.register(StorageEngine::Smb, |config, _codec| {
            Ok(Arc::new(SmbBackend::from_config(config)?) as Arc<dyn StorageBackend>)
        });
        registry.register(StorageEngine::Mock, |config, _codec| {
            Ok(Arc::new(MockBackend::from_config(config)?) as Arc<dyn StorageBackend>)
        });
        registry
    }

    /// 注册（或替换）某个引擎的构造函数
    pub fn register<F>(&mut self, engine: StorageEngine, constructor: F)
    where
        F: Fn(&str, &dyn SecretCodec) -> Result<Arc<dyn StorageBackend>> + Send + Sync + 'static,
    {
        self.constructors.insert(engine, Arc::new(constructor));
    }

    /// 是否已注册
    pub fn supports(&self, engine: StorageEngine) -> bool {
        self.constructors.contains_key(&engine)
    }

    /// 按引擎名称创建后端实例（未连接）
    pub fn build(
        &self,
        engine_name: &str,
        config: &str,
        codec: &dyn SecretCodec,
    ) -> Result<Arc<dyn StorageBackend>> {
        let engine = StorageEngine::from_str(engine_name)?;
        let constructor = self
            .constructors
            .get(&engine)
            .ok_or_else(|| BackupError::UnsupportedEngine(engine_name.to_string()))?;

        // mock 允许空配置，其余引擎必须提供配置
        if config.trim().is_empty() && engine != StorageEngine::Mock {
            return Err(BackupError::EmptyConfig(engine.to_string()));
        }

        constructor(config, codec)
    }
}

impl Default for StorageRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
