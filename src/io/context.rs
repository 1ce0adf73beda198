//! I/O 完成跟踪
//!
//! 一次逻辑 I/O 拆成的所有物理传输共享一个 [`IoContext`]。
//! 计数从 1 开始（派发方持有的额外引用），每发出一个传输加一，每个传输完成减一；
//! 减到 0 的那一次触发唯一的完成信号。错误规则：第一个记录的错误胜出。

use core::time::Duration;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// 异步完成通知
pub type Notify = Box<dyn FnOnce(Result<()>) + Send>;

/// 同步等待事件
#[derive(Default)]
pub struct Event {
    condvar: Condvar,
    done: Mutex<bool>,
}

impl Event {
    /// 置位并唤醒所有等待者
    pub fn set(&self) {
        let mut done = self.done.lock();
        if !*done {
            *done = true;
            self.condvar.notify_all();
        }
    }

    /// 是否已置位
    pub fn is_set(&self) -> bool {
        *self.done.lock()
    }

    /// 阻塞直到置位
    pub fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.condvar.wait(&mut done);
        }
    }
}

enum Completion {
    Wait(Arc<Event>),
    Callback { notify: Notify, permit: PoolPermit },
}

/// 完成跟踪器
pub struct IoContext {
    count: AtomicUsize,
    error: OnceLock<Error>,
    completion: Mutex<Option<Completion>>,
}

impl IoContext {
    /// 同步模式：完成时置位 `event`
    pub fn with_event(event: Arc<Event>) -> Arc<Self> {
        Arc::new(Self {
            count: AtomicUsize::new(1),
            error: OnceLock::new(),
            completion: Mutex::new(Some(Completion::Wait(event))),
        })
    }

    /// 异步模式：完成时先归还 `permit`，再调用 `notify`
    pub fn with_callback(notify: Notify, permit: PoolPermit) -> Arc<Self> {
        Arc::new(Self {
            count: AtomicUsize::new(1),
            error: OnceLock::new(),
            completion: Mutex::new(Some(Completion::Callback { notify, permit })),
        })
    }

    /// 登记一个即将发出的传输
    pub fn inc(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    /// 当前计数
    pub fn pending(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// 第一个记录的错误
    pub fn error(&self) -> Option<Error> {
        self.error.get().cloned()
    }

    /// 一个传输完成
    pub fn dec(&self, result: Result<()>) {
        if let Err(err) = result {
            // 只保留第一个错误
            let _ = self.error.set(err);
        }
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.fire();
        }
    }

    fn fire(&self) {
        let completion = self.completion.lock().take();
        let result = match self.error() {
            Some(err) => Err(err),
            None => Ok(()),
        };
        match completion {
            Some(Completion::Wait(event)) => event.set(),
            Some(Completion::Callback { notify, permit }) => {
                drop(permit);
                notify(result);
            }
            None => {}
        }
    }

    /// 提交中途失败：等待已发出的传输全部完成，丢弃完成信号而不触发
    pub fn abandon(&self, poll: Duration) {
        while self.count.load(Ordering::Acquire) != 1 {
            std::thread::sleep(poll);
        }
        drop(self.completion.lock().take());
    }
}

struct PoolInner {
    available: AtomicUsize,
}

/// 异步完成跟踪器池
///
/// 池的大小限制同时在途的异步逻辑 I/O 数，耗尽时派发以 `OutOfMemory` 失败。
#[derive(Clone)]
pub struct IoContextPool {
    inner: Arc<PoolInner>,
}

impl IoContextPool {
    /// 创建容量为 `size` 的池
    pub fn new(size: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                available: AtomicUsize::new(size),
            }),
        }
    }

    /// 取一个许可
    pub fn acquire(&self) -> Result<PoolPermit> {
        self.inner
            .available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map_err(|_| Error::out_of_memory("io context pool exhausted"))?;
        Ok(PoolPermit {
            inner: Arc::clone(&self.inner),
        })
    }

    /// 剩余许可数
    pub fn available(&self) -> usize {
        self.inner.available.load(Ordering::Acquire)
    }
}

/// 池许可，丢弃时归还
pub struct PoolPermit {
    inner: Arc<PoolInner>,
}

impl core::fmt::Debug for PoolPermit {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PoolPermit")
            .field("available", &self.inner.available.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        self.inner.available.fetch_add(1, Ordering::AcqRel);
    }
}
