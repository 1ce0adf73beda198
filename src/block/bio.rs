//! 块 I/O 请求
//!
//! `Bio` 是拦截层流转的唯一 I/O 单元：一个操作、一个起始扇区、
//! 一组内存段以及一个完成回调。完成回调恰好触发一次：
//! [`Bio::complete`] 消费 bio，未完成就被丢弃的 bio 以 I/O 错误完成。

use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;

use super::Disk;
use crate::consts::{to_sectors, SECTOR_SIZE};
use crate::error::{Error, ErrorKind, Result};

/// 完成回调
pub type EndIo = Box<dyn FnOnce(Result<()>) + Send>;

/// 共享数据页
///
/// 同一页可以被多个 [`Segment`] 以不同的偏移引用，页的生命周期由 `Arc` 管理，
/// 最后一个视图释放时页才释放。
pub struct Page {
    len: usize,
    data: Mutex<Box<[u8]>>,
}

impl Page {
    /// 分配一个全零页
    ///
    /// 分配失败返回 `OutOfMemory`，不会 panic。
    pub fn zeroed(len: usize) -> Result<Arc<Self>> {
        let mut buf: Vec<u8> = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|_| Error::out_of_memory("page allocation failed"))?;
        buf.resize(len, 0);
        Ok(Arc::new(Self {
            len,
            data: Mutex::new(buf.into_boxed_slice()),
        }))
    }

    /// 用已有数据创建页
    pub fn from_vec(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            len: data.len(),
            data: Mutex::new(data.into_boxed_slice()),
        })
    }

    /// 页长度（字节）
    pub fn len(&self) -> usize {
        self.len
    }

    /// 页是否为空
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 只读访问页数据
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.data.lock())
    }

    /// 可写访问页数据
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.data.lock())
    }
}

impl core::fmt::Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Page").field("len", &self.len).finish()
    }
}

/// 内存段：页中的一段 `[offset, offset + len)`
#[derive(Clone)]
pub struct Segment {
    page: Arc<Page>,
    offset: usize,
    len: usize,
}

impl Segment {
    /// 创建内存段
    pub fn new(page: Arc<Page>, offset: usize, len: usize) -> Result<Self> {
        if offset.checked_add(len).map_or(true, |end| end > page.len()) {
            return Err(Error::new(ErrorKind::InvalidInput, "segment exceeds page bounds"));
        }
        Ok(Self { page, offset, len })
    }

    /// 覆盖整页的内存段
    pub fn whole(page: Arc<Page>) -> Self {
        let len = page.len();
        Self { page, offset: 0, len }
    }

    /// 所属页
    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }

    /// 页内偏移
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// 段长度（字节）
    pub fn len(&self) -> usize {
        self.len
    }

    /// 段是否为空
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 取段内 `[start, start + len)` 的子视图
    pub fn slice(&self, start: usize, len: usize) -> Segment {
        debug_assert!(start + len <= self.len);
        Segment {
            page: Arc::clone(&self.page),
            offset: self.offset + start,
            len,
        }
    }

    /// 把段内容复制到 `dst`（长度必须相等）
    pub fn copy_to(&self, dst: &mut [u8]) {
        self.page
            .with_data(|data| dst.copy_from_slice(&data[self.offset..self.offset + self.len]));
    }

    /// 用 `src` 覆盖段内容（长度必须相等）
    pub fn copy_from(&self, src: &[u8]) {
        self.page
            .with_data_mut(|data| data[self.offset..self.offset + self.len].copy_from_slice(src));
    }
}

impl core::fmt::Debug for Segment {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Segment")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// I/O 操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BioOp {
    /// 读
    Read,
    /// 写
    Write,
    /// 刷新（通常为零长度）
    Flush,
    /// 丢弃
    Discard,
}

impl BioOp {
    /// 是否为写方向的操作
    pub fn is_write(self) -> bool {
        !matches!(self, BioOp::Read)
    }
}

bitflags! {
    /// I/O 请求标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BioFlags: u8 {
        /// 同步请求
        const SYNC     = 0x01;
        /// 强制写入介质
        const FUA      = 0x02;
        /// 先刷新再执行
        const PREFLUSH = 0x04;
        /// 元数据 I/O
        const META     = 0x08;
    }
}

/// 块 I/O 请求
pub struct Bio {
    op: BioOp,
    flags: BioFlags,
    sector: u64,
    segments: Vec<Segment>,
    disk: Option<Arc<Disk>>,
    end_io: Option<EndIo>,
}

impl Bio {
    /// 创建请求（无内存段、无完成回调）
    pub fn new(op: BioOp, sector: u64) -> Self {
        Self {
            op,
            flags: BioFlags::empty(),
            sector,
            segments: Vec::new(),
            disk: None,
            end_io: None,
        }
    }

    /// 设置标志
    pub fn with_flags(mut self, flags: BioFlags) -> Self {
        self.flags = flags;
        self
    }

    /// 设置内存段
    pub fn with_segments(mut self, segments: Vec<Segment>) -> Self {
        self.segments = segments;
        self
    }

    /// 设置完成回调
    pub fn on_complete(mut self, f: impl FnOnce(Result<()>) + Send + 'static) -> Self {
        self.end_io = Some(Box::new(f));
        self
    }

    /// 追加一个内存段
    pub fn push_segment(&mut self, segment: Segment) {
        self.segments.push(segment);
    }

    /// 操作类型
    pub fn op(&self) -> BioOp {
        self.op
    }

    /// 请求标志
    pub fn flags(&self) -> BioFlags {
        self.flags
    }

    /// 起始扇区
    pub fn sector(&self) -> u64 {
        self.sector
    }

    /// 修改起始扇区（分区重映射、缓存相对地址）
    pub fn set_sector(&mut self, sector: u64) {
        self.sector = sector;
    }

    /// 内存段
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// 请求字节数
    pub fn size(&self) -> usize {
        self.segments.iter().map(Segment::len).sum()
    }

    /// 请求扇区数
    pub fn nr_sectors(&self) -> u64 {
        to_sectors(self.size())
    }

    /// 请求大小是否为整扇区
    pub fn is_sector_multiple(&self) -> bool {
        self.size() % SECTOR_SIZE == 0
    }

    /// 目标磁盘
    pub fn disk(&self) -> Option<&Arc<Disk>> {
        self.disk.as_ref()
    }

    /// 设置目标磁盘
    pub fn set_disk(&mut self, disk: Arc<Disk>) {
        self.disk = Some(disk);
    }

    /// 把 `guard` 挂到完成路径上：原回调执行完之后才释放 `guard`
    pub fn attach<G: Send + 'static>(&mut self, guard: G) {
        let inner = self.end_io.take();
        self.end_io = Some(Box::new(move |result| {
            if let Some(f) = inner {
                f(result);
            }
            drop(guard);
        }));
    }

    /// 完成请求
    pub fn complete(mut self, result: Result<()>) {
        if let Some(f) = self.end_io.take() {
            f(result);
        }
    }
}

impl Drop for Bio {
    fn drop(&mut self) {
        if let Some(f) = self.end_io.take() {
            log::warn!(
                "[BIO] {:?} at sector {} dropped before completion",
                self.op,
                self.sector
            );
            f(Err(Error::new(ErrorKind::Io, "bio dropped before completion")));
        }
    }
}

impl core::fmt::Debug for Bio {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Bio")
            .field("op", &self.op)
            .field("flags", &self.flags)
            .field("sector", &self.sector)
            .field("size", &self.size())
            .field("disk", &self.disk.as_ref().map(|d| d.name()))
            .field("end_io", &self.end_io.as_ref().map(|_| "<callback>"))
            .finish()
    }
}
