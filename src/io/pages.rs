//! 页分配辅助
//!
//! 任何一次分配失败都会释放已分配的页并返回 `OutOfMemory`。

use std::sync::Arc;

use crate::block::{Page, Segment};
use crate::consts::{to_bytes, BLKSIZE_2K, BLKSIZE_4K, BLKSIZE_8K, MD_MAX_NR_PAGES, PAGE_SIZE};
use crate::error::{Error, ErrorKind, Result};

/// 两个内存段共享的一页
///
/// 2K 块大小下一页容纳两个块：前半段偏移 0，后半段偏移 `PAGE_SIZE - 2048`。
/// 页只有一个拥有者（`Arc`），两个视图随最后一个引用一起释放。
pub struct SharedPage {
    page: Arc<Page>,
}

impl SharedPage {
    /// 分配一页
    pub fn new() -> Result<Self> {
        Ok(Self {
            page: Page::zeroed(PAGE_SIZE)?,
        })
    }

    /// 两个 2K 视图
    pub fn views(&self) -> (Segment, Segment) {
        let half = to_bytes(u64::from(BLKSIZE_2K));
        let whole = Segment::whole(Arc::clone(&self.page));
        (whole.slice(0, half), whole.slice(PAGE_SIZE - half, half))
    }
}

/// 分配整页内存段，页数上限为 `MD_MAX_NR_PAGES`
///
/// 与原始块层一致，只要能分配到至少一页就返回已分配的部分。
pub fn alloc_pages(max_pages: usize) -> Result<Vec<Segment>> {
    let nr_pages = max_pages.min(MD_MAX_NR_PAGES);
    let mut pages = Vec::new();
    pages
        .try_reserve_exact(nr_pages)
        .map_err(|_| Error::out_of_memory("page vector allocation failed"))?;

    for _ in 0..nr_pages {
        match Page::zeroed(PAGE_SIZE) {
            Ok(page) => pages.push(Segment::whole(page)),
            Err(_) => {
                log::error!("[PAGES] allocation stopped after {} pages", pages.len());
                break;
            }
        }
    }

    if pages.is_empty() && nr_pages > 0 {
        return Err(Error::out_of_memory("single page allocation failed"));
    }
    Ok(pages)
}

/// 分配 `max` 个整页（回写路径）
pub fn alloc_wb_pages(max: usize) -> Result<Vec<Arc<Page>>> {
    let mut pages = Vec::new();
    pages
        .try_reserve_exact(max)
        .map_err(|_| Error::out_of_memory("page vector allocation failed"))?;
    for _ in 0..max {
        // 失败时 pages 连同已分配的页一起释放
        pages.push(Page::zeroed(PAGE_SIZE)?);
    }
    Ok(pages)
}

/// 为 `max` 个缓存块分配回写内存段
///
/// * 2K 块：每两个段共享一页（[`SharedPage`]）
/// * 4K / 8K 块：每段一整页
pub fn alloc_wb_segments(max: usize, block_size: u32) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    segments
        .try_reserve_exact(max)
        .map_err(|_| Error::out_of_memory("segment vector allocation failed"))?;

    match block_size {
        BLKSIZE_2K => {
            while segments.len() < max {
                let (first, second) = SharedPage::new()?.views();
                segments.push(first);
                if segments.len() < max {
                    segments.push(second);
                }
            }
        }
        BLKSIZE_4K | BLKSIZE_8K => {
            for _ in 0..max {
                segments.push(Segment::whole(Page::zeroed(PAGE_SIZE)?));
            }
        }
        _ => return Err(Error::new(ErrorKind::InvalidInput, "unsupported cache block size")),
    }
    Ok(segments)
}
