//! 备份任务状态持久化模块
//!
//! 全量扫描结束后把 `(status, result)` 写回配置层。
//! [`TaskStatusStore`] 是与配置层的接口，[`BackupPersistenceManager`] 为 SQLite 实现。

use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;

use super::config::TaskStatus;

/// 任务最近一次扫描结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskScanResult {
    pub task_id: u64,
    pub status: TaskStatus,
    /// 结果描述
    pub result: String,
    pub updated_at: DateTime<Utc>,
}

/// 任务状态存储
pub trait TaskStatusStore: Send + Sync {
    /// 保存扫描结果（覆盖）
    fn save_scan_result(&self, task_id: u64, status: TaskStatus, result: &str) -> Result<()>;

    /// 读取扫描结果
    fn load_scan_result(&self, task_id: u64) -> Result<Option<TaskScanResult>>;

    /// 删除任务的扫描结果
    fn delete_scan_result(&self, task_id: u64) -> Result<()>;
}

/// 备份任务状态持久化管理器
pub struct BackupPersistenceManager {
    /// SQLite 连接
    conn: Mutex<Connection>,
}

impl BackupPersistenceManager {
    /// 创建新的持久化管理器
    pub fn new(db_path: &Path) -> Result<Self> {
        // 确保父目录存在
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        let manager = Self {
            conn: Mutex::new(conn),
        };

        manager.init_tables()?;

        Ok(manager)
    }

    /// 内存数据库（测试和无持久化场景）
    pub fn in_memory() -> Result<Self> {
        let manager = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        manager.init_tables()?;
        Ok(manager)
    }

    /// 初始化数据库表
    fn init_tables(&self) -> Result<()> {
        let conn = self.conn.lock().map_err(|e| anyhow!("获取数据库锁失败: {}", e))?;

        conn.execute(
            r#"
            -- ============================================
            -- 表: task_status (任务状态表)
            -- 描述: 每个备份任务最近一次全量扫描的结果
            -- ============================================
            CREATE TABLE IF NOT EXISTS task_status (
                task_id INTEGER PRIMARY KEY,            -- 任务 ID
                status TEXT NOT NULL,                   -- idle / failure
                result TEXT NOT NULL,                   -- 结果描述
                updated_at INTEGER NOT NULL             -- 更新时间 (毫秒)
            )
            "#,
            [],
        )?;

        Ok(())
    }
}

impl TaskStatusStore for BackupPersistenceManager {
    fn save_scan_result(&self, task_id: u64, status: TaskStatus, result: &str) -> Result<()> {
        let conn = self.conn.lock().map_err(|e| anyhow!("获取数据库锁失败: {}", e))?;

        conn.execute(
            r#"
            INSERT INTO task_status (task_id, status, result, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(task_id) DO UPDATE SET
                status = excluded.status,
                result = excluded.result,
                updated_at = excluded.updated_at
            "#,
            params![
                task_id as i64,
                status.as_str(),
                result,
                Utc::now().timestamp_millis()
            ],
        )?;

        tracing::debug!("保存任务 {} 状态: {} ({})", task_id, status, result);
        Ok(())
    }

    fn load_scan_result(&self, task_id: u64) -> Result<Option<TaskScanResult>> {
        let conn = self.conn.lock().map_err(|e| anyhow!("获取数据库锁失败: {}", e))?;

        let row = conn
            .query_row(
                "SELECT status, result, updated_at FROM task_status WHERE task_id = ?1",
                params![task_id as i64],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((status, result, updated_at)) = row else {
            return Ok(None);
        };

        let status = TaskStatus::parse(&status).ok_or_else(|| anyhow!("未知的任务状态: {}", status))?;
        let updated_at = Utc
            .timestamp_millis_opt(updated_at)
            .single()
            .ok_or_else(|| anyhow!("无效的更新时间: {}", updated_at))?;

        Ok(Some(TaskScanResult {
            task_id,
            status,
            result,
            updated_at,
        }))
    }

    fn delete_scan_result(&self, task_id: u64) -> Result<()> {
        let conn = self.conn.lock().map_err(|e| anyhow!("获取数据库锁失败: {}", e))?;
        conn.execute("DELETE FROM task_status WHERE task_id = ?1", params![task_id as i64])?;
        Ok(())
    }
}
