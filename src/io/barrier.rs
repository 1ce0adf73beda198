//! 空屏障刷新

use crate::block::{Bio, BioFlags, BioOp, BlockDev, EntryPoint};
use crate::cache::CacheBinding;
use crate::error::{Error, ErrorKind};

/// 向 `dev` 发出零长度的屏障请求
///
/// 给出 `entry` 时经该入口点（源设备保存的原始入口点）发出，否则经设备当前入口点。
/// `orig` 若存在，以屏障请求的结果完成它。
pub fn issue_empty_barrier_flush(
    dev: &BlockDev,
    orig: Option<Bio>,
    entry: Option<&EntryPoint>,
    op: BioOp,
    flags: BioFlags,
) {
    let name = dev.name().to_string();
    let mut bio = Bio::new(op, dev.start_sect())
        .with_flags(flags)
        .on_complete(move |result| match orig {
            Some(orig) => orig.complete(result),
            None => {
                if let Err(err) = result {
                    log::error!("[TTC] {}: empty barrier failed: {}", name, err);
                }
            }
        });

    match entry {
        Some(entry) => {
            bio.set_disk(dev.disk().clone());
            entry.make_request(bio);
        }
        None => dev.disk().submit_bio(bio),
    }
}

/// 处理落在绑定范围内的零长度 bio
///
/// 先刷新缓存设备（不等待），再经原始入口点刷新源设备，后者的结果完成调用方的 bio。
pub fn process_zero_size_bio(binding: &CacheBinding, bio: Bio) {
    debug_assert_eq!(bio.size(), 0);
    let (op, flags) = (bio.op(), bio.flags());

    issue_empty_barrier_flush(binding.cache(), None, None, op, flags);

    match binding.original() {
        Some(entry) => issue_empty_barrier_flush(binding.source(), Some(bio), Some(&entry), op, flags),
        None => bio.complete(Err(Error::new(ErrorKind::InvalidState, "binding is not active"))),
    }
}
