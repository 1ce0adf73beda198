//! 重叠 bio 拆分
//!
//! 跨越绑定边界的 bio 按扇区拆成子 bio，每个子 bio 重新走拦截路由：
//! 落在绑定内的进缓存，其余直通。所有子 bio 完成后以第一个错误
//! （没有错误则成功）完成原 bio。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use super::registry::RegistryInner;
use crate::block::Bio;
use crate::consts::SECTOR_SIZE;
use crate::error::{Error, ErrorKind, Result};
use crate::io::SegmentCursor;

/// 子 bio 的共享完成状态
struct BioContainer {
    holders: AtomicUsize,
    error: OnceLock<Error>,
    orig: Mutex<Option<Bio>>,
}

impl BioContainer {
    fn new(orig: Bio, holders: usize) -> Self {
        Self {
            holders: AtomicUsize::new(holders),
            error: OnceLock::new(),
            orig: Mutex::new(Some(orig)),
        }
    }

    fn put(&self, result: Result<()>) {
        if let Err(err) = result {
            let _ = self.error.set(err);
        }
        if self.holders.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(orig) = self.orig.lock().take() {
                let result = match self.error.get() {
                    Some(err) => Err(err.clone()),
                    None => Ok(()),
                };
                orig.complete(result);
            }
        }
    }
}

/// 把 `bio` 拆成单扇区子 bio 并逐个重新路由
pub(crate) fn overlap_split(inner: &Arc<RegistryInner>, bio: Bio) {
    if !bio.is_sector_multiple() {
        log::error!("[SPLIT] {:?}: size is not a whole number of sectors", bio);
        bio.complete(Err(Error::new(ErrorKind::InvalidInput, "partial-sector I/O")));
        return;
    }
    let Some(disk) = bio.disk().cloned() else {
        bio.complete(Err(Error::new(ErrorKind::InvalidInput, "bio has no target disk")));
        return;
    };

    let (op, flags, first) = (bio.op(), bio.flags(), bio.sector());
    let count = bio.nr_sectors() as usize;

    let mut subs: Vec<Bio> = Vec::new();
    if subs.try_reserve_exact(count).is_err() {
        log::error!("[SPLIT] cannot allocate {} sub-requests", count);
        bio.complete(Err(Error::out_of_memory("overlap split")));
        return;
    }
    let pieces: Result<Vec<_>> = {
        let mut cursor = SegmentCursor::new(bio.segments());
        (0..count).map(|_| cursor.take(SECTOR_SIZE)).collect()
    };
    let pieces = match pieces {
        Ok(pieces) => pieces,
        Err(err) => {
            bio.complete(Err(err));
            return;
        }
    };

    log::debug!(
        "[SPLIT] {:?} at sector {} split into {} sectors",
        op,
        first,
        count
    );

    // 提交期间额外持有一份，防止原 bio 提前完成
    let container = Arc::new(BioContainer::new(bio, count + 1));
    for (i, segs) in pieces.into_iter().enumerate() {
        let c = Arc::clone(&container);
        let mut sub = Bio::new(op, first + i as u64)
            .with_flags(flags)
            .with_segments(segs)
            .on_complete(move |result| c.put(result));
        sub.set_disk(Arc::clone(&disk));
        subs.push(sub);
    }
    for sub in subs {
        inner.submit(sub);
    }
    container.put(Ok(()));
}
