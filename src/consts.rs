//! 常量定义
//!
//! 扇区/页几何、分片散列以及派发上限。

//=============================================================================
// 几何常量
//=============================================================================

/// 扇区位移（512 字节扇区）
pub const SECTOR_SHIFT: u32 = 9;

/// 扇区大小（字节）
pub const SECTOR_SIZE: usize = 1 << SECTOR_SHIFT;

/// 页大小（字节）
pub const PAGE_SIZE: usize = 4096;

/// 每页扇区数
pub const SECTORS_PER_PAGE: u64 = (PAGE_SIZE >> SECTOR_SHIFT) as u64;

/// 2 KiB 缓存块（扇区数）
pub const BLKSIZE_2K: u32 = 4;

/// 4 KiB 缓存块（扇区数）
pub const BLKSIZE_4K: u32 = 8;

/// 8 KiB 缓存块（扇区数）
pub const BLKSIZE_8K: u32 = 16;

//=============================================================================
// 注册表与派发
//=============================================================================

/// 默认注册表分片数
pub const DEFAULT_SHARD_COUNT: usize = 1024;

/// 分片散列乘数
pub const SHARD_HASH_MAGIC: u64 = 19;

/// 单次同步元数据 I/O 最多分配的页数
pub const MD_MAX_NR_PAGES: usize = 256;

/// 默认异步完成跟踪器池大小
pub const DEFAULT_IO_CONTEXT_POOL: usize = 1024;

/// 脏块排空默认重试次数
pub const FINISH_DIRTY_RETRY_COUNT: u32 = 3;

/// 直通路径读到过期入口点时重新查找的上限（闸门前的等待不计）
pub const ROUTE_RETRY_LIMIT: usize = 64;

/// 字节数转扇区数
#[inline]
pub const fn to_sectors(bytes: usize) -> u64 {
    (bytes >> SECTOR_SHIFT) as u64
}

/// 扇区数转字节数
#[inline]
pub const fn to_bytes(sectors: u64) -> usize {
    (sectors as usize) << SECTOR_SHIFT
}
