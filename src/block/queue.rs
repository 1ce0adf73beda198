//! 请求队列与 I/O 入口点
//!
//! 每个磁盘的请求队列持有一个"活动入口点"。应用提交的所有 I/O 都先读取
//! 当前入口点再调用它；拦截层通过替换入口点来接管整块磁盘的 I/O。
//! 入口点的读取是原子的（读锁内克隆 `Arc`），但读取之后入口点随时可能被换掉，
//! 调用方必须把过期读取当作可重试的情况处理。

use std::sync::Arc;

use parking_lot::RwLock;

use super::Bio;

/// I/O 入口点接口
///
/// 驱动实现此 trait 以接收 bio；拦截层也实现它以接管磁盘。
pub trait MakeRequest: Send + Sync {
    /// 处理一个 bio（取得所有权，负责最终完成它）
    fn make_request(&self, bio: Bio);

    /// 是否为拦截入口点
    fn is_interceptor(&self) -> bool {
        false
    }
}

/// 入口点句柄
#[derive(Clone)]
pub struct EntryPoint(Arc<dyn MakeRequest>);

impl EntryPoint {
    /// 包装一个入口点实现
    pub fn new(handler: Arc<dyn MakeRequest>) -> Self {
        Self(handler)
    }

    /// 调用入口点
    pub fn make_request(&self, bio: Bio) {
        self.0.make_request(bio);
    }

    /// 是否为拦截入口点
    pub fn is_interceptor(&self) -> bool {
        self.0.is_interceptor()
    }

    /// 是否指向同一个实现
    pub fn same_as(&self, other: &EntryPoint) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl core::fmt::Debug for EntryPoint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("EntryPoint")
            .field(&if self.is_interceptor() { "interceptor" } else { "driver" })
            .finish()
    }
}

/// 磁盘请求队列
pub struct RequestQueue {
    entry: RwLock<EntryPoint>,
}

impl RequestQueue {
    /// 以驱动入口点创建队列
    pub fn new(driver: EntryPoint) -> Self {
        Self {
            entry: RwLock::new(driver),
        }
    }

    /// 读取当前入口点
    pub fn entry(&self) -> EntryPoint {
        self.entry.read().clone()
    }

    /// 替换入口点，返回旧入口点
    pub fn swap_entry(&self, entry: EntryPoint) -> EntryPoint {
        core::mem::replace(&mut *self.entry.write(), entry)
    }

    /// 当前入口点是否为拦截入口点
    pub fn is_intercepted(&self) -> bool {
        self.entry.read().is_interceptor()
    }

    /// 通过当前入口点提交 bio
    pub fn submit(&self, bio: Bio) {
        let entry = self.entry();
        entry.make_request(bio);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BioOp;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize, bool);

    impl MakeRequest for Counter {
        fn make_request(&self, bio: Bio) {
            self.0.fetch_add(1, Ordering::SeqCst);
            bio.complete(Ok(()));
        }

        fn is_interceptor(&self) -> bool {
            self.1
        }
    }

    #[test]
    fn test_swap_entry() {
        let driver = Arc::new(Counter(AtomicUsize::new(0), false));
        let hook = Arc::new(Counter(AtomicUsize::new(0), true));
        let queue = RequestQueue::new(EntryPoint::new(driver.clone()));
        assert!(!queue.is_intercepted());

        queue.submit(Bio::new(BioOp::Read, 0));
        let old = queue.swap_entry(EntryPoint::new(hook.clone()));
        assert!(!old.is_interceptor());
        assert!(queue.is_intercepted());
        queue.submit(Bio::new(BioOp::Read, 0));

        assert_eq!(driver.0.load(Ordering::SeqCst), 1);
        assert_eq!(hook.0.load(Ordering::SeqCst), 1);

        let restored = queue.swap_entry(old.clone());
        assert!(restored.is_interceptor());
        assert!(queue.entry().same_as(&old));
    }
}
