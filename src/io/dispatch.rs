//! I/O 派发引擎
//!
//! 把一次逻辑 I/O（设备、起始扇区、扇区数）拆成若干物理传输：
//! 每个传输的内存段数不超过设备的 `max_segments`，长度按逻辑块对齐；
//! 非对齐的头尾交给 [`super::unaligned`]。所有传输共享一个 [`IoContext`]。
//!
//! # 完成模式
//!
//! - 同步（`notify == None`）：阻塞到计数归零，返回第一个错误
//! - 异步（`notify == Some`）：从池中取跟踪器后立即返回，最后一次完成时调用 `notify`
//!
//! 中途提交失败时先等待已发出的传输全部完成，再把错误返回给调用方，
//! 此时不会调用 `notify`。

use core::time::Duration;
use std::sync::Arc;

use super::context::{Event, IoContext, IoContextPool, Notify};
use super::unaligned::submit_unaligned;
use crate::block::{Bio, BioFlags, BioOp, BlockDev, Disk, EntryPoint, Page, Segment};
use crate::cache::CacheBinding;
use crate::consts::{to_bytes, to_sectors};
use crate::error::{Error, ErrorKind, Result};

/// I/O 区域（扇区相对 `dev`）
#[derive(Debug, Clone, Copy)]
pub struct IoRegion<'a> {
    /// 目标设备
    pub dev: &'a BlockDev,
    /// 起始扇区
    pub sector: u64,
    /// 扇区数
    pub count: u64,
}

/// 内存描述
pub enum IoMemory {
    /// 分散内存段，可能不按块对齐
    Segments(Vec<Segment>),
    /// 整页
    Pages(Vec<Arc<Page>>),
}

impl IoMemory {
    fn len(&self) -> usize {
        match self {
            IoMemory::Segments(segs) => segs.iter().map(Segment::len).sum(),
            IoMemory::Pages(pages) => pages.iter().map(|p| p.len()).sum(),
        }
    }
}

/// I/O 请求描述
pub struct IoRequest {
    /// 数据内存
    pub mem: IoMemory,
    /// 异步完成通知；`None` 表示同步
    pub notify: Option<Notify>,
    /// 经源设备保存的原始入口点发出（绕过拦截），扇区按绑定起点换算
    pub hddio: bool,
}

impl IoRequest {
    /// 同步请求
    pub fn sync(mem: IoMemory) -> Self {
        Self {
            mem,
            notify: None,
            hddio: false,
        }
    }

    /// 异步请求
    pub fn with_notify(mem: IoMemory, notify: impl FnOnce(Result<()>) + Send + 'static) -> Self {
        Self {
            mem,
            notify: Some(Box::new(notify)),
            hddio: false,
        }
    }

    /// 改为经原始入口点发出
    pub fn hdd(mut self) -> Self {
        self.hddio = true;
        self
    }
}

/// 物理传输的提交目标
///
/// bio 扇区为整盘绝对地址。带入口点时直接调用该入口点（绕过拦截），
/// 否则经磁盘当前入口点提交。
#[derive(Clone)]
pub(crate) struct Target {
    disk: Arc<Disk>,
    entry: Option<EntryPoint>,
}

impl Target {
    pub(crate) fn live(disk: &Arc<Disk>) -> Self {
        Self {
            disk: Arc::clone(disk),
            entry: None,
        }
    }

    pub(crate) fn original(disk: &Arc<Disk>, entry: EntryPoint) -> Self {
        Self {
            disk: Arc::clone(disk),
            entry: Some(entry),
        }
    }

    pub(crate) fn submit(&self, mut bio: Bio) {
        match &self.entry {
            Some(entry) => {
                bio.set_disk(Arc::clone(&self.disk));
                entry.make_request(bio);
            }
            None => self.disk.submit_bio(bio),
        }
    }
}

/// 调用方内存段游标
///
/// 记录当前段内已消耗的字节数，保证跨多次（对齐或非对齐）子传输时
/// 段边界既不重复也不遗漏。
pub(crate) struct SegmentCursor<'a> {
    segments: &'a [Segment],
    index: usize,
    consumed: usize,
}

impl<'a> SegmentCursor<'a> {
    pub(crate) fn new(segments: &'a [Segment]) -> Self {
        Self {
            segments,
            index: 0,
            consumed: 0,
        }
    }

    /// 剩余字节数
    pub(crate) fn remaining_bytes(&self) -> usize {
        self.segments[self.index.min(self.segments.len())..]
            .iter()
            .map(Segment::len)
            .sum::<usize>()
            - self.consumed
    }

    /// 接下来最多 `max_segments` 个段可提供的字节数
    pub(crate) fn peek_bytes(&self, max_segments: usize) -> usize {
        self.segments
            .iter()
            .skip(self.index)
            .take(max_segments)
            .map(Segment::len)
            .sum::<usize>()
            .saturating_sub(self.consumed)
    }

    /// 取出 `bytes` 字节对应的段视图并前移
    pub(crate) fn take(&mut self, bytes: usize) -> Result<Vec<Segment>> {
        let mut views = Vec::new();
        let mut need = bytes;
        while need > 0 {
            let seg = self
                .segments
                .get(self.index)
                .ok_or(Error::new(ErrorKind::InvalidInput, "memory shorter than I/O region"))?;
            let n = (seg.len() - self.consumed).min(need);
            if n > 0 {
                views.push(seg.slice(self.consumed, n));
            }
            self.consumed += n;
            need -= n;
            if self.consumed == seg.len() {
                self.index += 1;
                self.consumed = 0;
            }
        }
        Ok(views)
    }
}

/// I/O 派发引擎
pub struct Dispatcher {
    pool: IoContextPool,
    submit_error_poll: Duration,
}

impl Dispatcher {
    /// # 参数
    ///
    /// * `pool_size` - 异步完成跟踪器池大小
    /// * `submit_error_poll` - 提交失败后等待已发出传输的轮询间隔
    pub fn new(pool_size: usize, submit_error_poll: Duration) -> Self {
        Self {
            pool: IoContextPool::new(pool_size),
            submit_error_poll,
        }
    }

    /// 异步跟踪器池
    pub fn pool(&self) -> &IoContextPool {
        &self.pool
    }

    /// 派发一次逻辑 I/O
    ///
    /// # 参数
    ///
    /// * `binding` - 所属绑定（`hddio` 时必须提供）
    /// * `region` - 目标区域
    /// * `op` - 读或写
    /// * `flags` - 请求标志（同步模式自动加 `SYNC`）
    /// * `req` - 内存、完成模式
    pub fn do_io(
        &self,
        binding: Option<&CacheBinding>,
        region: IoRegion<'_>,
        op: BioOp,
        flags: BioFlags,
        req: IoRequest,
    ) -> Result<()> {
        if !matches!(op, BioOp::Read | BioOp::Write) {
            return Err(Error::new(ErrorKind::Unsupported, "dispatch supports read and write only"));
        }
        let end = region.sector.checked_add(region.count);
        if end.map_or(true, |end| end > region.dev.nr_sects()) {
            log::error!(
                "[DISPATCH] {}: region {}+{} beyond device end",
                region.dev.name(),
                region.sector,
                region.count
            );
            return Err(Error::new(ErrorKind::InvalidInput, "I/O region beyond device end"));
        }
        if req.mem.len() < to_bytes(region.count) {
            return Err(Error::new(ErrorKind::InvalidInput, "memory shorter than I/O region"));
        }
        let target = self.target(binding, region.dev, req.hddio)?;

        match req.notify {
            None => {
                let event = Arc::new(Event::default());
                let io = IoContext::with_event(Arc::clone(&event));
                let flags = flags | BioFlags::SYNC;
                if let Err(err) = self.dispatch(&io, &target, binding, region, op, flags, &req.mem) {
                    io.abandon(self.submit_error_poll);
                    return Err(err);
                }
                io.dec(Ok(()));
                event.wait();
                match io.error() {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            }
            Some(notify) => {
                let permit = self.pool.acquire().map_err(|err| {
                    log::error!("[DISPATCH] failed to allocate io context");
                    err
                })?;
                let io = IoContext::with_callback(notify, permit);
                if let Err(err) = self.dispatch(&io, &target, binding, region, op, flags, &req.mem) {
                    io.abandon(self.submit_error_poll);
                    return Err(err);
                }
                io.dec(Ok(()));
                Ok(())
            }
        }
    }

    fn target(&self, binding: Option<&CacheBinding>, dev: &BlockDev, hddio: bool) -> Result<Target> {
        if !hddio {
            return Ok(Target::live(dev.disk()));
        }
        let binding = binding.ok_or(Error::new(
            ErrorKind::InvalidInput,
            "source device I/O requires a binding",
        ))?;
        let entry = binding
            .original()
            .ok_or(Error::new(ErrorKind::InvalidState, "binding is not active"))?;
        Ok(Target::original(dev.disk(), entry))
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &self,
        io: &Arc<IoContext>,
        target: &Target,
        binding: Option<&CacheBinding>,
        region: IoRegion<'_>,
        op: BioOp,
        flags: BioFlags,
        mem: &IoMemory,
    ) -> Result<()> {
        match mem {
            IoMemory::Segments(segs) => {
                dispatch_segments(io, target, binding, region, op, flags, segs)
            }
            IoMemory::Pages(pages) => dispatch_pages(io, target, region, op, flags, pages),
        }
    }
}

fn dispatch_segments(
    io: &Arc<IoContext>,
    target: &Target,
    binding: Option<&CacheBinding>,
    region: IoRegion<'_>,
    op: BioOp,
    flags: BioFlags,
    segments: &[Segment],
) -> Result<()> {
    let geometry = *region.dev.disk().geometry();
    let block_bytes = geometry.logical_block_size as usize;
    let base = region.dev.start_sect() + region.sector;
    let mut cursor = SegmentCursor::new(segments);
    let mut done = 0u64;

    while done < region.count {
        let remaining = region.count - done;
        let sector = base + done;
        let available = cursor
            .peek_bytes(geometry.max_segments)
            .min(to_bytes(remaining));
        let aligned = available - available % block_bytes;

        if !geometry.is_aligned(sector) || remaining < geometry.block_sectors() || aligned == 0 {
            if let Some(binding) = binding {
                binding.count_unaligned_io();
            }
            done += submit_unaligned(io, target, op, sector, remaining, block_bytes, &mut cursor)?;
            continue;
        }

        let segs = cursor.take(aligned)?;
        log::trace!(
            "[DISPATCH] {:?} sector {} len {} ({} segments)",
            op,
            sector,
            aligned,
            segs.len()
        );
        io.inc();
        let ctx = Arc::clone(io);
        target.submit(
            Bio::new(op, sector)
                .with_flags(flags)
                .with_segments(segs)
                .on_complete(move |r| ctx.dec(r)),
        );
        done += to_sectors(aligned);
    }
    Ok(())
}

fn dispatch_pages(
    io: &Arc<IoContext>,
    target: &Target,
    region: IoRegion<'_>,
    op: BioOp,
    flags: BioFlags,
    pages: &[Arc<Page>],
) -> Result<()> {
    let max_segments = region.dev.disk().geometry().max_segments;
    let mut sector = region.dev.start_sect() + region.sector;
    let mut remaining = to_bytes(region.count);
    let mut pages = pages.iter();

    while remaining > 0 {
        let mut segs = Vec::new();
        let mut bytes = 0;
        while remaining > 0 && segs.len() < max_segments {
            let page = pages
                .next()
                .ok_or(Error::new(ErrorKind::InvalidInput, "memory shorter than I/O region"))?;
            let len = page.len().min(remaining);
            segs.push(Segment::new(Arc::clone(page), 0, len)?);
            bytes += len;
            remaining -= len;
        }

        io.inc();
        let ctx = Arc::clone(io);
        target.submit(
            Bio::new(op, sector)
                .with_flags(flags)
                .with_segments(segs)
                .on_complete(move |r| ctx.dec(r)),
        );
        sector += to_sectors(bytes);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{DiskGeometry, DiskId, OpenMode, Partition};
    use crate::testing::MemDisk;
    use parking_lot::Mutex;

    /// 4K 逻辑块、每个传输最多 2 段的磁盘；分区 1 起于扇区 16
    fn setup(max_segments: usize) -> (Arc<MemDisk>, BlockDev, BlockDev) {
        let mem = MemDisk::new(256);
        let disk = Disk::new(
            DiskId::new(8, 48),
            "sdd",
            DiskGeometry {
                logical_block_size: 4096,
                capacity: 256,
                max_segments,
            },
            vec![Partition { index: 1, start_sect: 16, nr_sects: 128 }],
            mem.clone(),
        )
        .unwrap();
        let manager = crate::block::DeviceManager::new();
        manager.register(disk).unwrap();
        let whole = manager.open("sdd", OpenMode::READ | OpenMode::WRITE, "t").unwrap();
        let part = manager.open("sdd1", OpenMode::READ | OpenMode::WRITE, "t").unwrap();
        (mem, whole, part)
    }

    fn buffer(len: usize, fill: u8) -> (Arc<Page>, Vec<Segment>) {
        let page = Page::from_vec(vec![fill; len]);
        (page.clone(), vec![Segment::whole(page)])
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(4, Duration::from_millis(1))
    }

    #[test]
    fn test_aligned_write_splits_by_max_segments() {
        let (mem, whole, _) = setup(2);
        let segs: Vec<Segment> = (0..4).map(|_| Segment::whole(Page::from_vec(vec![7; 4096]))).collect();
        let region = IoRegion { dev: &whole, sector: 8, count: 32 };
        dispatcher()
            .do_io(None, region, BioOp::Write, BioFlags::empty(), IoRequest::sync(IoMemory::Segments(segs)))
            .unwrap();

        let writes = mem.bios_of(BioOp::Write);
        assert_eq!(writes, vec![(8, 8192), (24, 8192)]);
        mem.with_storage(|s| {
            assert!(s[8 * 512..40 * 512].iter().all(|b| *b == 7));
            assert_eq!(s[40 * 512], 0);
        });
    }

    #[test]
    fn test_unaligned_round_trip_preserves_neighbours() {
        let (mem, _, part) = setup(8);
        mem.with_storage_mut(|s| s.iter_mut().for_each(|b| *b = 0xEE));

        // 分区内扇区 3 起写 3 个扇区：落在整盘块 [16, 24) 的中间
        let (_, segs) = buffer(3 * 512, 0x5A);
        let region = IoRegion { dev: &part, sector: 3, count: 3 };
        dispatcher()
            .do_io(None, region, BioOp::Write, BioFlags::empty(), IoRequest::sync(IoMemory::Segments(segs)))
            .unwrap();

        let (page, segs) = buffer(3 * 512, 0);
        dispatcher()
            .do_io(None, region, BioOp::Read, BioFlags::empty(), IoRequest::sync(IoMemory::Segments(segs)))
            .unwrap();
        page.with_data(|d| assert!(d.iter().all(|b| *b == 0x5A)));

        mem.with_storage(|s| {
            assert!(s[16 * 512..19 * 512].iter().all(|b| *b == 0xEE));
            assert!(s[19 * 512..22 * 512].iter().all(|b| *b == 0x5A));
            assert!(s[22 * 512..24 * 512].iter().all(|b| *b == 0xEE));
        });
        // 读-改-写：一次整块读，一次整块写
        assert_eq!(mem.bios_of(BioOp::Write), vec![(16, 4096)]);
    }

    #[test]
    fn test_unaligned_head_and_tail_with_split_segments() {
        let (mem, whole, _) = setup(8);
        // 扇区 4..20：头部 4 扇区非对齐，中间一整块，尾部 4 扇区非对齐
        // 内存分成 3 段，段边界与块边界错开
        let a = Page::from_vec(vec![1; 1536]);
        let b = Page::from_vec(vec![2; 4096]);
        let c = Page::from_vec(vec![3; 2560]);
        let segs = vec![Segment::whole(a), Segment::whole(b), Segment::whole(c)];
        let region = IoRegion { dev: &whole, sector: 4, count: 16 };
        dispatcher()
            .do_io(None, region, BioOp::Write, BioFlags::empty(), IoRequest::sync(IoMemory::Segments(segs)))
            .unwrap();

        mem.with_storage(|s| {
            let data = &s[4 * 512..20 * 512];
            assert!(data[..1536].iter().all(|x| *x == 1));
            assert!(data[1536..1536 + 4096].iter().all(|x| *x == 2));
            assert!(data[1536 + 4096..].iter().all(|x| *x == 3));
        });
        let writes = mem.bios_of(BioOp::Write);
        assert_eq!(writes, vec![(0, 4096), (8, 4096), (16, 4096)]);
    }

    #[test]
    fn test_async_completion_with_first_error() {
        let (mem, whole, _) = setup(1);
        mem.fail_sector(8);
        mem.fail_sector(16);
        let segs: Vec<Segment> = (0..3).map(|_| Segment::whole(Page::from_vec(vec![1; 4096]))).collect();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let d = dispatcher();
        d.do_io(
            None,
            IoRegion { dev: &whole, sector: 0, count: 24 },
            BioOp::Write,
            BioFlags::empty(),
            IoRequest::with_notify(IoMemory::Segments(segs), move |r| s.lock().push(r)),
        )
        .unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].as_ref().unwrap_err().kind(), ErrorKind::Io);
        assert_eq!(d.pool().available(), 4);
        assert_eq!(mem.bios_of(BioOp::Write).len(), 3);
    }

    #[test]
    fn test_deferred_completion_waits() {
        let (mem, whole, _) = setup(1);
        mem.set_deferred(true);
        let (_, segs) = buffer(2 * 4096, 9);
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        let d = dispatcher();
        d.do_io(
            None,
            IoRegion { dev: &whole, sector: 0, count: 16 },
            BioOp::Write,
            BioFlags::empty(),
            IoRequest::with_notify(IoMemory::Segments(segs), move |r| *s.lock() = Some(r)),
        )
        .unwrap();
        assert!(seen.lock().is_none());
        assert_eq!(d.pool().available(), 3);

        mem.complete_pending();
        assert!(seen.lock().take().unwrap().is_ok());
        assert_eq!(d.pool().available(), 4);
    }

    #[test]
    fn test_pool_exhaustion_issues_nothing() {
        let (mem, whole, _) = setup(1);
        mem.set_deferred(true);
        let d = Dispatcher::new(1, Duration::from_millis(1));
        let region = IoRegion { dev: &whole, sector: 0, count: 8 };
        let (_, segs) = buffer(4096, 0);
        d.do_io(None, region, BioOp::Read, BioFlags::empty(), IoRequest::with_notify(IoMemory::Segments(segs), |_| {}))
            .unwrap();
        let (_, segs) = buffer(4096, 0);
        let err = d
            .do_io(None, region, BioOp::Read, BioFlags::empty(), IoRequest::with_notify(IoMemory::Segments(segs), |_| {}))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);
        assert_eq!(mem.bio_count(), 1);
        mem.complete_pending();
    }

    #[test]
    fn test_pages_memory() {
        let (mem, _, part) = setup(2);
        let pages: Vec<Arc<Page>> = (0..3).map(|i| Page::from_vec(vec![i as u8 + 1; 4096])).collect();
        dispatcher()
            .do_io(
                None,
                IoRegion { dev: &part, sector: 0, count: 24 },
                BioOp::Write,
                BioFlags::empty(),
                IoRequest::sync(IoMemory::Pages(pages)),
            )
            .unwrap();
        assert_eq!(mem.bios_of(BioOp::Write), vec![(16, 8192), (32, 4096)]);
        mem.with_storage(|s| assert_eq!(s[32 * 512], 3));
    }

    #[test]
    fn test_rejects_bad_regions() {
        let (_, _, part) = setup(2);
        let (_, segs) = buffer(4096, 0);
        let d = dispatcher();
        let err = d
            .do_io(
                None,
                IoRegion { dev: &part, sector: 124, count: 8 },
                BioOp::Read,
                BioFlags::empty(),
                IoRequest::sync(IoMemory::Segments(segs)),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let (_, segs) = buffer(4096, 0);
        let err = d
            .do_io(
                None,
                IoRegion { dev: &part, sector: u64::MAX - 2, count: 8 },
                BioOp::Read,
                BioFlags::empty(),
                IoRequest::sync(IoMemory::Segments(segs)),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let (_, segs) = buffer(512, 0);
        let err = d
            .do_io(
                None,
                IoRegion { dev: &part, sector: 0, count: 8 },
                BioOp::Read,
                BioFlags::empty(),
                IoRequest::sync(IoMemory::Segments(segs)),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let (_, segs) = buffer(4096, 0);
        let err = d
            .do_io(
                None,
                IoRegion { dev: &part, sector: 0, count: 8 },
                BioOp::Read,
                BioFlags::empty(),
                IoRequest::sync(IoMemory::Segments(segs)).hdd(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_cursor_tracks_partial_segments() {
        let segs = vec![
            Segment::whole(Page::from_vec(vec![0; 1000])),
            Segment::whole(Page::from_vec(vec![0; 24])),
        ];
        let mut cursor = SegmentCursor::new(&segs);
        let first = cursor.take(600).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(cursor.remaining_bytes(), 424);
        assert_eq!(cursor.peek_bytes(1), 400);
        let second = cursor.take(424).unwrap();
        assert_eq!(second.iter().map(|s| (s.offset(), s.len())).collect::<Vec<_>>(), vec![(600, 400), (0, 24)]);
        assert_eq!(cursor.remaining_bytes(), 0);
        assert!(cursor.take(1).is_err());
    }
}
