//! 绑定状态机
//!
//! 绑定的生命周期状态是一个显式的枚举，转换只能通过本模块的方法完成：
//!
//! ```text
//! Active ──begin_modify──> Modifying ──end_modify──> Active
//!    │                        │ (begin_shutdown 置 shutdown_requested)
//!    │                        └──end_modify──> ShuttingDown
//!    ├──begin_shutdown──> ShuttingDown ──finish_shutdown──> ReadOnly
//!    └──(delete: Modifying)──finish_delete──> Deleted
//! ```
//!
//! 失效/降级是与生命周期正交的健康标志，单独以原子位存放。
//! 状态锁只保护短临界区，从不跨越 I/O 等待。

use core::time::Duration;
use std::sync::atomic::{AtomicU8, Ordering};

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex};

use crate::error::{Error, ErrorKind, Result};

/// 绑定生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    /// 正常服务
    Active,
    /// 编辑或删除进行中
    Modifying {
        /// 编辑期间收到了关机请求
        shutdown_requested: bool,
    },
    /// 关机处理中
    ShuttingDown,
    /// 关机完成，只读
    ReadOnly,
    /// 已删除
    Deleted,
}

bitflags! {
    /// 绑定状态标志（汇总视图）
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StatusFlags: u32 {
        /// 关机处理中
        const SHUTDOWN_IN_PROGRESS = 0x01;
        /// 编辑进行中
        const MODIFY_IN_PROGRESS   = 0x02;
        /// 已删除
        const DELETED              = 0x04;
        /// 缓存设备失效
        const FAILED               = 0x08;
        /// 缓存降级
        const DEGRADED             = 0x10;
        /// 只读
        const READ_ONLY            = 0x20;
    }
}

/// 关机请求的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStart {
    /// 已进入关机处理
    Started,
    /// 编辑进行中，需等它结束
    WaitForModify,
    /// 无需处理（已只读、已删除或已在关机）
    Skip,
}

/// 生命周期状态与健康标志
pub struct Lifecycle {
    state: Mutex<BindingState>,
    health: AtomicU8,
}

const HEALTH_FAILED: u8 = 0x01;
const HEALTH_DEGRADED: u8 = 0x02;

impl Lifecycle {
    /// 初始为 `Active`，健康
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BindingState::Active),
            health: AtomicU8::new(0),
        }
    }

    /// 当前状态
    pub fn state(&self) -> BindingState {
        *self.state.lock()
    }

    /// 进入编辑
    ///
    /// 编辑或关机已在进行时返回 `Busy`，已删除返回 `NotFound`。
    pub fn begin_modify(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            BindingState::Active => {
                *state = BindingState::Modifying {
                    shutdown_requested: false,
                };
                Ok(())
            }
            BindingState::Deleted => Err(Error::new(ErrorKind::NotFound, "cache deleted")),
            _ => Err(Error::new(
                ErrorKind::Busy,
                "modify or shutdown already in progress",
            )),
        }
    }

    /// 结束编辑；编辑期间收到关机请求时转入关机处理
    pub fn end_modify(&self) {
        let mut state = self.state.lock();
        if let BindingState::Modifying { shutdown_requested } = *state {
            *state = if shutdown_requested {
                BindingState::ShuttingDown
            } else {
                BindingState::Active
            };
        }
    }

    /// 删除完成
    pub fn finish_delete(&self) {
        *self.state.lock() = BindingState::Deleted;
    }

    /// 请求关机
    pub fn begin_shutdown(&self) -> ShutdownStart {
        let mut state = self.state.lock();
        match *state {
            BindingState::Active => {
                *state = BindingState::ShuttingDown;
                ShutdownStart::Started
            }
            BindingState::Modifying { .. } => {
                *state = BindingState::Modifying {
                    shutdown_requested: true,
                };
                ShutdownStart::WaitForModify
            }
            _ => ShutdownStart::Skip,
        }
    }

    /// 关机完成
    pub fn finish_shutdown(&self) {
        let mut state = self.state.lock();
        if *state == BindingState::ShuttingDown {
            *state = BindingState::ReadOnly;
        }
    }

    /// 是否已请求关机
    pub fn shutdown_requested(&self) -> bool {
        matches!(
            *self.state.lock(),
            BindingState::ShuttingDown
                | BindingState::Modifying {
                    shutdown_requested: true
                }
        )
    }

    /// 标记缓存设备失效
    pub fn mark_failed(&self) {
        self.health.fetch_or(HEALTH_FAILED, Ordering::AcqRel);
    }

    /// 标记缓存降级
    pub fn mark_degraded(&self) {
        self.health.fetch_or(HEALTH_DEGRADED, Ordering::AcqRel);
    }

    /// 缓存设备是否已失效
    pub fn is_failed(&self) -> bool {
        self.health.load(Ordering::Acquire) & HEALTH_FAILED != 0
    }

    /// 缓存是否降级
    pub fn is_degraded(&self) -> bool {
        self.health.load(Ordering::Acquire) & HEALTH_DEGRADED != 0
    }

    /// 汇总标志
    pub fn flags(&self) -> StatusFlags {
        let mut flags = match self.state() {
            BindingState::Active => StatusFlags::empty(),
            BindingState::Modifying { shutdown_requested } => {
                let mut f = StatusFlags::MODIFY_IN_PROGRESS;
                f.set(StatusFlags::SHUTDOWN_IN_PROGRESS, shutdown_requested);
                f
            }
            BindingState::ShuttingDown => StatusFlags::SHUTDOWN_IN_PROGRESS,
            BindingState::ReadOnly => StatusFlags::READ_ONLY,
            BindingState::Deleted => StatusFlags::DELETED,
        };
        flags.set(StatusFlags::FAILED, self.is_failed());
        flags.set(StatusFlags::DEGRADED, self.is_degraded());
        flags
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// I/O 闸门
///
/// 关闭时，新到达的 I/O 在闸门外等待（不丢弃），重新打开后继续路由。
pub struct IoGate {
    condvar: Condvar,
    open: Mutex<bool>,
}

impl Default for IoGate {
    fn default() -> Self {
        Self {
            condvar: Condvar::new(),
            open: Mutex::new(true),
        }
    }
}

impl IoGate {
    /// 打开闸门并唤醒等待者
    pub fn open(&self) {
        let mut open = self.open.lock();
        if !*open {
            *open = true;
            self.condvar.notify_all();
        }
    }

    /// 关闭闸门
    pub fn close(&self) {
        *self.open.lock() = false;
    }

    /// 闸门是否打开
    pub fn is_open(&self) -> bool {
        *self.open.lock()
    }

    /// 等待闸门打开
    pub fn await_open(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.condvar.wait(&mut open);
        }
    }

    /// 返回 `true` 表示已打开，`false` 表示超时
    pub fn await_open_for_timeout(&self, timeout: Duration) -> bool {
        let mut open = self.open.lock();
        if !*open {
            !self.condvar.wait_for(&mut open, timeout).timed_out()
        } else {
            true
        }
    }
}
