//! 去重日志（按任务隔离）
//!
//! 每个任务一个 SQLite 数据库：`<cache_dir>/<task_id>/journal.db`
//! - 以文件绝对路径为主键的有序 KV 表（WITHOUT ROWID）
//! - 仅在上传成功后写入；记录不存在或指纹不一致即需要重新上传
//! - 连接池按任务 ID 保证同一任务最多一个打开的句柄

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::Metadata;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use crate::autobackup::error::{BackupError, Result};

/// 记录编码版本
const JOURNAL_VERSION: i64 = 1;

/// 数据库文件名
const JOURNAL_FILE_NAME: &str = "journal.db";

/// 去重记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// 内容指纹（完整文件 MD5）
    pub fingerprint: String,
    /// 上传开始时间（毫秒时间戳）
    pub started_at: i64,
    /// 上传结束时间（毫秒时间戳）
    pub finished_at: i64,
    /// 源文件修改时间（毫秒时间戳）
    pub modified_at: i64,
    /// 文件大小（字节）
    pub size: u64,
}

impl JournalEntry {
    /// 由一次成功的上传构造记录
    pub fn completed(fingerprint: String, started_at: i64, metadata: &Metadata, size: u64) -> Self {
        Self {
            fingerprint,
            started_at,
            finished_at: Utc::now().timestamp_millis(),
            modified_at: modified_millis(metadata),
            size,
        }
    }
}

/// 单个任务的去重日志
pub struct Journal {
    task_id: u64,
    db_path: PathBuf,
    conn: Mutex<Option<Connection>>,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("task_id", &self.task_id)
            .field("db_path", &self.db_path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Journal {
    /// 打开（或创建）任务的去重日志
    fn open(task_id: u64, dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join(JOURNAL_FILE_NAME);

        let conn = Connection::open(&db_path)?;

        // WAL 模式保证进程崩溃后已提交的记录不丢失
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        conn.execute(
            "-- ============================================
            -- 表: journal (去重记录表)
            -- 描述: 文件路径 -> 指纹 + 时间元数据
            -- ============================================
            CREATE TABLE IF NOT EXISTS journal (
                path TEXT PRIMARY KEY,                  -- 源文件绝对路径
                version INTEGER NOT NULL,               -- 记录编码版本
                fingerprint TEXT NOT NULL,              -- 内容指纹 (MD5)
                started_at INTEGER NOT NULL,            -- 上传开始时间 (毫秒)
                finished_at INTEGER NOT NULL,           -- 上传结束时间 (毫秒)
                modified_at INTEGER NOT NULL,           -- 源文件修改时间 (毫秒)
                size INTEGER NOT NULL                   -- 文件大小 (字节)
            ) WITHOUT ROWID",
            [],
        )?;

        Ok(Self {
            task_id,
            db_path,
            conn: Mutex::new(Some(conn)),
        })
    }

    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let guard = self.conn.lock();
        let conn = guard
            .as_ref()
            .ok_or_else(|| BackupError::Journal(format!("任务 {} 的去重日志已关闭", self.task_id)))?;
        Ok(f(conn)?)
    }

    /// 查询记录
    pub fn get(&self, path: &str) -> Result<Option<JournalEntry>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT version, fingerprint, started_at, finished_at, modified_at, size
                 FROM journal WHERE path = ?1",
                params![path],
                |row| {
                    let version: i64 = row.get(0)?;
                    Ok((
                        version,
                        JournalEntry {
                            fingerprint: row.get(1)?,
                            started_at: row.get(2)?,
                            finished_at: row.get(3)?,
                            modified_at: row.get(4)?,
                            size: row.get::<_, i64>(5)? as u64,
                        },
                    ))
                },
            )
            .optional()
        })
        .map(|found| {
            found.and_then(|(version, entry)| {
                // 未知版本的记录视为不存在，下次会重新上传
                (version == JOURNAL_VERSION).then_some(entry)
            })
        })
    }

    /// 写入记录（覆盖旧值）
    pub fn put(&self, path: &str, entry: &JournalEntry) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO journal
                 (path, version, fingerprint, started_at, finished_at, modified_at, size)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    path,
                    JOURNAL_VERSION,
                    entry.fingerprint,
                    entry.started_at,
                    entry.finished_at,
                    entry.modified_at,
                    entry.size as i64,
                ],
            )
        })?;
        Ok(())
    }

    /// 删除路径本身及其下所有记录
    pub fn delete_tree(&self, path: &str) -> Result<usize> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM journal
                 WHERE path = ?1 OR substr(path, 1, length(?2)) = ?2",
                params![path, prefix],
            )
        })
    }

    /// 记录数量
    pub fn len(&self) -> Result<usize> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM journal", [], |row| row.get::<_, i64>(0))
        })
        .map(|n| n as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// 关闭连接，之后的读写都会返回错误
    pub fn close(&self) {
        if let Some(conn) = self.conn.lock().take() {
            if let Err((_, e)) = conn.close() {
                tracing::warn!("关闭任务 {} 的去重日志失败: {}", self.task_id, e);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.conn.lock().is_none()
    }
}

/// 去重日志池
///
/// 读写锁保护打开/关闭过程，多个监听器、扫描器并发查询时不会重复打开同一任务的日志。
pub struct JournalPool {
    root: PathBuf,
    handles: RwLock<HashMap<u64, Arc<Journal>>>,
}

impl JournalPool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// 任务的日志目录（以数字任务 ID 命名）
    pub fn journal_dir(&self, task_id: u64) -> PathBuf {
        self.root.join(task_id.to_string())
    }

    /// 打开任务日志（已打开则复用）
    pub fn open(&self, task_id: u64) -> Result<Arc<Journal>> {
        if let Some(journal) = self.handles.read().get(&task_id) {
            return Ok(journal.clone());
        }

        let mut handles = self.handles.write();
        // 双重检查：等待写锁期间可能已被其他线程打开
        if let Some(journal) = handles.get(&task_id) {
            return Ok(journal.clone());
        }

        let journal = Arc::new(Journal::open(task_id, &self.journal_dir(task_id))?);
        tracing::debug!("打开任务 {} 的去重日志: {:?}", task_id, journal.db_path());
        handles.insert(task_id, journal.clone());
        Ok(journal)
    }

    /// 获取已打开的日志
    pub fn get(&self, task_id: u64) -> Option<Arc<Journal>> {
        self.handles.read().get(&task_id).cloned()
    }

    /// 关闭任务日志（不删除数据），返回是否存在打开的句柄
    pub fn close(&self, task_id: u64) -> bool {
        let removed = self.handles.write().remove(&task_id);
        match removed {
            Some(journal) => {
                journal.close();
                tracing::debug!("关闭任务 {} 的去重日志", task_id);
                true
            }
            None => false,
        }
    }

    /// 关闭并删除任务日志；日志不存在不视为错误
    pub fn remove(&self, task_id: u64) -> Result<()> {
        let mut handles = self.handles.write();
        if let Some(journal) = handles.remove(&task_id) {
            journal.close();
        }

        let dir = self.journal_dir(task_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                tracing::info!("已删除任务 {} 的去重日志: {:?}", task_id, dir);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// 关闭所有打开的日志
    pub fn close_all(&self) {
        let handles: Vec<Arc<Journal>> = self.handles.write().drain().map(|(_, j)| j).collect();
        for journal in handles {
            journal.close();
        }
    }

    /// 当前打开的日志数量
    pub fn open_count(&self) -> usize {
        self.handles.read().len()
    }
}

// ==================== 工具函数 ====================

/// 计算完整文件 MD5
pub fn calculate_full_md5(path: &Path) -> std::io::Result<String> {
    const BUFFER_SIZE: usize = 1024 * 1024; // 1MB

    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, file);
    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        context.consume(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", context.compute()))
}

/// 在阻塞线程池中计算文件指纹
pub async fn fingerprint_file(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    let md5 = tokio::task::spawn_blocking(move || calculate_full_md5(&path)).await??;
    Ok(md5)
}

/// 文件修改时间（毫秒时间戳），无法获取时为 0
pub fn modified_millis(metadata: &Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// 日志键：源文件绝对路径
pub fn journal_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
