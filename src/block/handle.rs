//! 设备句柄管理
//!
//! [`DeviceManager`] 按路径打开磁盘或分区，得到 [`BlockDev`] 句柄。
//! 以 `EXCL` 模式打开时在磁盘上登记持有者，句柄丢弃时自动释放（RAII）。

use std::collections::BTreeMap;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::RwLock;

use super::{Bio, Disk, Partition};
use crate::error::{Error, ErrorKind, Result};

bitflags! {
    /// 打开模式
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenMode: u8 {
        /// 读
        const READ  = 0x01;
        /// 写
        const WRITE = 0x02;
        /// 独占
        const EXCL  = 0x04;
    }
}

/// 已打开的块设备句柄（整盘或分区）
///
/// # 示例
///
/// ```rust,ignore
/// let bdev = manager.open("/dev/sdb1", OpenMode::READ | OpenMode::WRITE | OpenMode::EXCL, "ttc")?;
/// assert_eq!(bdev.start_sect(), 2048);
/// // bdev 丢弃时释放独占登记
/// ```
pub struct BlockDev {
    disk: Arc<Disk>,
    partition: Option<Partition>,
    name: String,
    mode: OpenMode,
    holder: Option<String>,
}

impl BlockDev {
    /// 所属整盘
    pub fn disk(&self) -> &Arc<Disk> {
        &self.disk
    }

    /// 分区（整盘句柄为 `None`）
    pub fn partition(&self) -> Option<&Partition> {
        self.partition.as_ref()
    }

    /// 是否为整盘句柄
    pub fn is_whole_disk(&self) -> bool {
        self.partition.is_none()
    }

    /// 设备名（如 `sdb` 或 `sdb1`）
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 打开模式
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// 在整盘上的起始扇区
    pub fn start_sect(&self) -> u64 {
        self.partition.map_or(0, |p| p.start_sect)
    }

    /// 扇区数
    pub fn nr_sects(&self) -> u64 {
        self.partition
            .map_or(self.disk.geometry().capacity, |p| p.nr_sects)
    }

    /// 在整盘上的最后一个扇区（含）
    pub fn end_sect(&self) -> u64 {
        self.start_sect() + self.nr_sects() - 1
    }

    /// 逻辑块大小（字节）
    pub fn logical_block_size(&self) -> u32 {
        self.disk.geometry().logical_block_size
    }

    /// 设备大小（字节）
    pub fn size_bytes(&self) -> u64 {
        self.nr_sects() << crate::consts::SECTOR_SHIFT
    }

    /// 是否与另一个句柄指向同一设备（同盘同分区）
    pub fn same_device(&self, other: &BlockDev) -> bool {
        self.disk.id() == other.disk.id()
            && self.partition.map(|p| p.index) == other.partition.map(|p| p.index)
    }

    /// 提交 bio（扇区相对本设备）
    ///
    /// 分区句柄会把扇区重映射为整盘绝对地址，然后经整盘当前入口点提交。
    /// 越界请求以 `InvalidInput` 完成。
    pub fn submit_bio(&self, mut bio: Bio) {
        let end = bio.sector().checked_add(bio.nr_sectors());
        if end.map_or(true, |end| end > self.nr_sects()) {
            log::error!(
                "[DEVICE] {}: I/O beyond device end (sector {}, {} sectors)",
                self.name,
                bio.sector(),
                bio.nr_sectors()
            );
            bio.complete(Err(Error::new(ErrorKind::InvalidInput, "I/O beyond device end")));
            return;
        }
        bio.set_sector(bio.sector() + self.start_sect());
        self.disk.submit_bio(bio);
    }
}

impl Drop for BlockDev {
    fn drop(&mut self) {
        if let Some(holder) = self.holder.take() {
            self.disk
                .release(self.partition.map(|p| p.index), &holder);
        }
    }
}

impl core::fmt::Debug for BlockDev {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BlockDev")
            .field("name", &self.name)
            .field("start_sect", &self.start_sect())
            .field("nr_sects", &self.nr_sects())
            .field("mode", &self.mode)
            .finish()
    }
}

/// 设备名空间：按名字登记磁盘并打开句柄
#[derive(Default)]
pub struct DeviceManager {
    disks: RwLock<BTreeMap<String, Arc<Disk>>>,
}

impl DeviceManager {
    /// 创建空的设备名空间
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记磁盘
    pub fn register(&self, disk: Arc<Disk>) -> Result<()> {
        let mut disks = self.disks.write();
        if disks.contains_key(disk.name()) {
            return Err(Error::new(ErrorKind::AlreadyExists, "disk name already registered"));
        }
        log::info!("[DEVICE] registered disk {} ({})", disk.name(), disk.id());
        disks.insert(disk.name().to_string(), disk);
        Ok(())
    }

    /// 注销磁盘
    pub fn unregister(&self, name: &str) -> Option<Arc<Disk>> {
        self.disks.write().remove(name)
    }

    /// 按路径打开设备
    ///
    /// # 参数
    ///
    /// * `path` - `sdb`、`/dev/sdb`（整盘）或 `sdb2`（分区 2）
    /// * `mode` - 打开模式；含 `EXCL` 时登记独占持有
    /// * `holder` - 持有者名
    pub fn open(&self, path: &str, mode: OpenMode, holder: &str) -> Result<BlockDev> {
        let name = path.strip_prefix("/dev/").unwrap_or(path);
        if name.is_empty() {
            return Err(Error::new(ErrorKind::InvalidInput, "empty device path"));
        }

        let (disk, partition) = self.resolve(name).ok_or_else(|| {
            log::error!("[DEVICE] {}: no such device", path);
            Error::new(ErrorKind::InvalidInput, "no such device")
        })?;

        let holder = if mode.contains(OpenMode::EXCL) {
            disk.claim(partition.map(|p| p.index), holder)?;
            Some(holder.to_string())
        } else {
            None
        };

        Ok(BlockDev {
            disk,
            partition,
            name: name.to_string(),
            mode,
            holder,
        })
    }

    fn resolve(&self, name: &str) -> Option<(Arc<Disk>, Option<Partition>)> {
        let disks = self.disks.read();
        if let Some(disk) = disks.get(name) {
            return Some((Arc::clone(disk), None));
        }
        disks.iter().find_map(|(disk_name, disk)| {
            let index: u8 = name.strip_prefix(disk_name.as_str())?.parse().ok()?;
            let part = *disk.partition(index)?;
            Some((Arc::clone(disk), Some(part)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BioOp, DiskGeometry, DiskId, Page, Segment};
    use crate::testing::MemDisk;

    fn manager() -> (DeviceManager, Arc<MemDisk>) {
        let mem = MemDisk::new(4096);
        let disk = Disk::new(
            DiskId::new(8, 16),
            "sdb",
            DiskGeometry {
                logical_block_size: 512,
                capacity: 4096,
                max_segments: 8,
            },
            vec![
                Partition { index: 1, start_sect: 64, nr_sects: 1000 },
                Partition { index: 2, start_sect: 2048, nr_sects: 1000 },
            ],
            mem.clone(),
        )
        .unwrap();
        let manager = DeviceManager::new();
        manager.register(disk).unwrap();
        (manager, mem)
    }

    #[test]
    fn test_open_paths() {
        let (manager, _) = manager();
        let whole = manager.open("/dev/sdb", OpenMode::READ, "t").unwrap();
        assert!(whole.is_whole_disk());
        assert_eq!(whole.end_sect(), 4095);

        let part = manager.open("sdb2", OpenMode::READ, "t").unwrap();
        assert_eq!(part.start_sect(), 2048);
        assert_eq!(part.end_sect(), 3047);
        assert_eq!(part.name(), "sdb2");

        assert_eq!(
            manager.open("sdb3", OpenMode::READ, "t").unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(
            manager.open("/dev/", OpenMode::READ, "t").unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
    }

    #[test]
    fn test_exclusive_open_released_on_drop() {
        let (manager, _) = manager();
        let mode = OpenMode::READ | OpenMode::WRITE | OpenMode::EXCL;
        let first = manager.open("sdb1", mode, "cache-a").unwrap();
        assert_eq!(
            manager.open("sdb1", mode, "cache-b").unwrap_err().kind(),
            ErrorKind::Busy
        );
        drop(first);
        assert!(manager.open("sdb1", mode, "cache-b").is_ok());
    }

    #[test]
    fn test_partition_submit_remaps() {
        let (manager, mem) = manager();
        let part = manager.open("sdb1", OpenMode::WRITE, "t").unwrap();
        let page = Page::from_vec(vec![0xAB; 512]);
        part.submit_bio(Bio::new(BioOp::Write, 3).with_segments(vec![Segment::whole(page)]));
        mem.with_storage(|s| {
            assert_eq!(s[(64 + 3) * 512], 0xAB);
            assert_eq!(s[(64 + 2) * 512], 0);
        });
    }

    #[test]
    fn test_submit_beyond_end_fails() {
        let (manager, _) = manager();
        let part = manager.open("sdb1", OpenMode::WRITE, "t").unwrap();
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let s = seen.clone();
        let page = Page::from_vec(vec![0; 1024]);
        part.submit_bio(
            Bio::new(BioOp::Write, 999)
                .with_segments(vec![Segment::whole(page)])
                .on_complete(move |r| *s.lock() = Some(r)),
        );
        let result = seen.lock().take().unwrap();
        assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_submit_overflowing_sector_fails() {
        let (manager, mem) = manager();
        let part = manager.open("sdb1", OpenMode::READ, "t").unwrap();
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let s = seen.clone();
        let page = Page::from_vec(vec![0; 1024]);
        part.submit_bio(
            Bio::new(BioOp::Read, u64::MAX)
                .with_segments(vec![Segment::whole(page)])
                .on_complete(move |r| *s.lock() = Some(r)),
        );
        let result = seen.lock().take().unwrap();
        assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidInput);
        assert!(mem.bios_of(BioOp::Read).is_empty());
    }
}
