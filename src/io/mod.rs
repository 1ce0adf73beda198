//! I/O 派发
//!
//! - [`Dispatcher`]：把逻辑 I/O 拆成物理传输，同步或异步完成
//! - 非对齐适配：读-改-写处理块内的头尾
//! - 屏障刷新与零长度 bio 处理
//! - 页分配辅助

mod barrier;
mod context;
mod dispatch;
mod pages;
mod unaligned;

pub use barrier::{issue_empty_barrier_flush, process_zero_size_bio};
pub use context::{Event, IoContext, IoContextPool, Notify, PoolPermit};
pub use dispatch::{Dispatcher, IoMemory, IoRegion, IoRequest};
pub use pages::{alloc_pages, alloc_wb_pages, alloc_wb_segments, SharedPage};

pub(crate) use dispatch::SegmentCursor;
