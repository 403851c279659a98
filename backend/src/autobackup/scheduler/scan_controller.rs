//! 全量扫描控制器
//!
//! 同一任务同一时间只允许一个全量扫描：
//! - `try_begin` 用 CAS 抢占运行标记，失败返回 "running, please wait"，不排队重试
//! - 每次运行持有独立的取消令牌（引擎关闭令牌的子令牌），`cancel` 只影响本任务
//! - [`ScanRun`] 守卫在任何退出路径上复位运行标记并记录终态
//!
//! 状态机：Idle → Running → (Completed | Cancelled | Failed)

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::autobackup::error::{BackupError, Result};

/// 全量扫描状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    /// 从未运行
    Idle,
    Running,
    Completed,
    /// 被主动停止
    Cancelled,
    Failed,
}

impl ScanState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanState::Completed | ScanState::Cancelled | ScanState::Failed)
    }
}

impl std::fmt::Display for ScanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanState::Idle => write!(f, "idle"),
            ScanState::Running => write!(f, "running"),
            ScanState::Completed => write!(f, "completed"),
            ScanState::Cancelled => write!(f, "cancelled"),
            ScanState::Failed => write!(f, "failed"),
        }
    }
}

/// 控制器状态（用于外部查询）
#[derive(Debug, Clone, Serialize)]
pub struct ScanControllerStatus {
    pub task_id: u64,
    pub state: ScanState,
    pub is_running: bool,
    /// 执行次数
    pub execution_count: u64,
    pub last_finished_at: Option<DateTime<Utc>>,
}

/// 单任务的全量扫描控制器
pub struct ScanController {
    task_id: u64,
    /// 是否正在执行
    running: AtomicBool,
    /// 引擎级取消令牌
    parent_token: CancellationToken,
    /// 当前运行的取消令牌
    run_token: RwLock<Option<CancellationToken>>,
    state: RwLock<ScanState>,
    execution_count: AtomicU64,
    last_finished_at: RwLock<Option<DateTime<Utc>>>,
    /// 运行结束通知
    idle: Notify,
}

impl ScanController {
    pub fn new(task_id: u64, parent_token: CancellationToken) -> Self {
        Self {
            task_id,
            running: AtomicBool::new(false),
            parent_token,
            run_token: RwLock::new(None),
            state: RwLock::new(ScanState::Idle),
            execution_count: AtomicU64::new(0),
            last_finished_at: RwLock::new(None),
            idle: Notify::new(),
        }
    }

    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    /// 抢占运行标记
    pub fn try_begin(self: &Arc<Self>) -> Result<ScanRun> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("任务 {} 全量扫描正在执行，拒绝新的扫描", self.task_id);
            return Err(BackupError::AlreadyRunning(self.task_id));
        }

        let token = self.parent_token.child_token();
        *self.run_token.write() = Some(token.clone());
        *self.state.write() = ScanState::Running;
        self.execution_count.fetch_add(1, Ordering::Relaxed);

        Ok(ScanRun {
            controller: self.clone(),
            token,
            finished: false,
        })
    }

    /// 请求停止当前扫描，返回是否有正在执行的扫描
    pub fn cancel(&self) -> bool {
        match self.run_token.read().as_ref() {
            Some(token) => {
                tracing::info!("任务 {} 请求停止全量扫描", self.task_id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 等待当前扫描结束（未在运行时立即返回）
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_running() {
                return;
            }
            notified.await;
        }
    }

    pub fn state(&self) -> ScanState {
        *self.state.read()
    }

    pub fn status(&self) -> ScanControllerStatus {
        ScanControllerStatus {
            task_id: self.task_id,
            state: self.state(),
            is_running: self.is_running(),
            execution_count: self.execution_count.load(Ordering::Relaxed),
            last_finished_at: *self.last_finished_at.read(),
        }
    }

    fn release(&self, state: ScanState) {
        *self.state.write() = state;
        *self.last_finished_at.write() = Some(Utc::now());
        self.run_token.write().take();
        self.running.store(false, Ordering::Release);
        self.idle.notify_waiters();
    }
}

/// 一次全量扫描的运行守卫
///
/// 未调用 `finish` 就被丢弃时（panic、任务被 abort），按令牌状态记为 Cancelled 或 Failed。
pub struct ScanRun {
    controller: Arc<ScanController>,
    token: CancellationToken,
    finished: bool,
}

impl ScanRun {
    pub fn task_id(&self) -> u64 {
        self.controller.task_id
    }

    /// 本次运行的取消令牌
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 记录终态并释放运行标记
    pub fn finish(mut self, state: ScanState) {
        self.finished = true;
        self.controller.release(state);
    }
}

impl Drop for ScanRun {
    fn drop(&mut self) {
        if !self.finished {
            let state = if self.token.is_cancelled() {
                ScanState::Cancelled
            } else {
                ScanState::Failed
            };
            tracing::warn!("任务 {} 全量扫描异常退出，记为 {}", self.controller.task_id, state);
            self.controller.release(state);
        }
    }
}
