//! 非对齐 I/O 适配
//!
//! 起点或终点不在逻辑块边界上（或剩余长度不足一个逻辑块）的部分走"读-改-写"：
//! 先把整块读进临时页，完成后与调用方内存段互相拷贝；写操作再把整块写回。
//! 每个非对齐子 I/O 只在完成跟踪器上占一个计数。

use std::sync::Arc;

use super::context::IoContext;
use super::dispatch::{SegmentCursor, Target};
use crate::block::{Bio, BioFlags, BioOp, Page, Segment};
use crate::consts::{to_bytes, to_sectors, SECTOR_SIZE};
use crate::error::Result;

/// 一个非对齐子 I/O 的临时状态
struct UnalignedTransfer {
    scratch: Arc<Page>,
    /// 调用方数据在临时页中的偏移
    offset: usize,
    /// 调用方内存段中与本块重叠的部分
    views: Vec<Segment>,
    op: BioOp,
}

impl UnalignedTransfer {
    fn copy(&self) {
        self.scratch.with_data_mut(|data| {
            let mut pos = self.offset;
            for view in &self.views {
                let window = &mut data[pos..pos + view.len()];
                match self.op {
                    BioOp::Read => view.copy_from(window),
                    _ => view.copy_to(window),
                }
                pos += view.len();
            }
        });
    }

    fn on_read_done(self, result: Result<()>, sector: u64, io: Arc<IoContext>, target: Target) {
        if let Err(err) = result {
            log::error!("[UNALIGNED] read of block at sector {} failed: {}", sector, err);
            io.dec(Err(err));
            return;
        }

        self.copy();
        if self.op == BioOp::Read {
            io.dec(Ok(()));
            return;
        }

        let scratch = Segment::whole(Arc::clone(&self.scratch));
        let write = Bio::new(BioOp::Write, sector)
            .with_flags(BioFlags::SYNC)
            .with_segments(vec![scratch])
            .on_complete(move |r| {
                // 临时页随 self 在此释放
                drop(self);
                io.dec(r);
            });
        target.submit(write);
    }
}

/// 发出一个非对齐子 I/O
///
/// # 参数
///
/// * `sector` - 起始扇区（整盘绝对地址）
/// * `remaining` - 本次逻辑 I/O 剩余扇区数
/// * `block_bytes` - 设备逻辑块大小
/// * `cursor` - 调用方内存段游标，按消耗的字节前移
///
/// # 返回
///
/// 本次处理掉的扇区数
pub(super) fn submit_unaligned(
    io: &Arc<IoContext>,
    target: &Target,
    op: BioOp,
    sector: u64,
    remaining: u64,
    block_bytes: usize,
    cursor: &mut SegmentCursor<'_>,
) -> Result<u64> {
    let block_sectors = (block_bytes / SECTOR_SIZE) as u64;
    let block_start = sector - sector % block_sectors;
    let offset = to_bytes(sector - block_start);
    let len = (block_bytes - offset).min(to_bytes(remaining));

    let scratch = Page::zeroed(block_bytes).map_err(|err| {
        log::error!("[UNALIGNED] unable to allocate scratch page");
        err
    })?;
    let views = cursor.take(len)?;

    log::debug!(
        "[UNALIGNED] {:?} sector {} len {} via block {}",
        op,
        sector,
        len,
        block_start
    );

    let transfer = UnalignedTransfer {
        scratch: Arc::clone(&scratch),
        offset,
        views,
        op,
    };

    io.inc();
    let ctx = Arc::clone(io);
    let next = target.clone();
    let read = Bio::new(BioOp::Read, block_start)
        .with_flags(BioFlags::SYNC)
        .with_segments(vec![Segment::whole(scratch)])
        .on_complete(move |r| transfer.on_read_done(r, block_start, ctx, next));
    target.submit(read);

    Ok(to_sectors(len))
}
