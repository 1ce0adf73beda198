//! 磁盘模型
//!
//! [`Disk`] 代表一整块物理磁盘：几何信息、分区表、请求队列，以及独占打开的持有者登记。
//! 分区不是独立对象，而是磁盘上的一段扇区范围；打开分区得到的句柄见 [`super::BlockDev`]。

use std::sync::Arc;

use parking_lot::Mutex;

use super::{Bio, EntryPoint, MakeRequest, RequestQueue};
use crate::consts::SECTOR_SIZE;
use crate::error::{Error, ErrorKind, Result};

/// 磁盘标识（主/次设备号）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DiskId {
    /// 主设备号
    pub major: u32,
    /// 次设备号
    pub minor: u32,
}

impl DiskId {
    /// 创建磁盘标识
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl core::fmt::Display for DiskId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// 磁盘几何
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskGeometry {
    /// 逻辑块大小（字节，512 的倍数）
    pub logical_block_size: u32,
    /// 容量（扇区）
    pub capacity: u64,
    /// 单个传输描述符最多容纳的内存段数
    pub max_segments: usize,
}

impl DiskGeometry {
    /// 每个逻辑块包含的扇区数
    pub fn block_sectors(&self) -> u64 {
        (self.logical_block_size as usize / SECTOR_SIZE) as u64
    }

    /// 扇区是否按逻辑块对齐
    pub fn is_aligned(&self, sector: u64) -> bool {
        sector % self.block_sectors() == 0
    }

    /// 向下对齐到逻辑块边界
    pub fn align_down(&self, sector: u64) -> u64 {
        sector - sector % self.block_sectors()
    }
}

/// 分区：磁盘上的一段扇区范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    /// 分区编号（从 1 开始）
    pub index: u8,
    /// 起始扇区
    pub start_sect: u64,
    /// 扇区数
    pub nr_sects: u64,
}

impl Partition {
    /// 最后一个扇区（含）
    pub fn end_sect(&self) -> u64 {
        self.start_sect + self.nr_sects - 1
    }
}

/// 独占持有记录
#[derive(Debug, Clone)]
struct Claim {
    partition: Option<u8>,
    holder: String,
}

/// 整块磁盘
pub struct Disk {
    id: DiskId,
    name: String,
    geometry: DiskGeometry,
    partitions: Vec<Partition>,
    queue: RequestQueue,
    claims: Mutex<Vec<Claim>>,
}

impl Disk {
    /// 创建磁盘
    ///
    /// # 参数
    ///
    /// * `id` - 磁盘标识
    /// * `name` - 设备名（如 `sdb`）
    /// * `geometry` - 几何信息
    /// * `partitions` - 分区表（范围不得越界或互相重叠）
    /// * `driver` - 驱动入口点
    pub fn new(
        id: DiskId,
        name: &str,
        geometry: DiskGeometry,
        partitions: Vec<Partition>,
        driver: Arc<dyn MakeRequest>,
    ) -> Result<Arc<Self>> {
        let lbs = geometry.logical_block_size as usize;
        if lbs == 0 || lbs % SECTOR_SIZE != 0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "logical block size must be a multiple of the sector size",
            ));
        }
        if geometry.max_segments == 0 || geometry.capacity == 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "empty disk geometry"));
        }

        let mut sorted = partitions.clone();
        sorted.sort_by_key(|p| p.start_sect);
        for (i, part) in sorted.iter().enumerate() {
            if part.nr_sects == 0 || part.index == 0 || part.end_sect() >= geometry.capacity {
                return Err(Error::new(ErrorKind::InvalidInput, "partition out of disk range"));
            }
            if let Some(next) = sorted.get(i + 1) {
                if next.start_sect <= part.end_sect() {
                    return Err(Error::new(ErrorKind::InvalidInput, "overlapping partitions"));
                }
            }
            if sorted.iter().filter(|p| p.index == part.index).count() > 1 {
                return Err(Error::new(ErrorKind::InvalidInput, "duplicate partition index"));
            }
        }

        Ok(Arc::new(Self {
            id,
            name: name.to_string(),
            geometry,
            partitions,
            queue: RequestQueue::new(EntryPoint::new(driver)),
            claims: Mutex::new(Vec::new()),
        }))
    }

    /// 磁盘标识
    pub fn id(&self) -> DiskId {
        self.id
    }

    /// 设备名
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 几何信息
    pub fn geometry(&self) -> &DiskGeometry {
        &self.geometry
    }

    /// 分区表
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// 按编号查找分区
    pub fn partition(&self, index: u8) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.index == index)
    }

    /// 请求队列
    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    /// 通过当前入口点提交 bio（扇区为磁盘绝对地址）
    pub fn submit_bio(self: &Arc<Self>, mut bio: Bio) {
        bio.set_disk(Arc::clone(self));
        self.queue.submit(bio);
    }

    /// 独占登记
    ///
    /// 整盘持有与任何分区持有互斥；同一分区只能有一个持有者。
    pub(super) fn claim(&self, partition: Option<u8>, holder: &str) -> Result<()> {
        let mut claims = self.claims.lock();
        let conflict = claims.iter().any(|c| {
            partition.is_none() || c.partition.is_none() || c.partition == partition
        });
        if conflict {
            log::error!(
                "[DEVICE] {} (partition {:?}) already claimed, holder {} rejected",
                self.name,
                partition,
                holder
            );
            return Err(Error::new(ErrorKind::Busy, "device is exclusively held"));
        }
        claims.push(Claim {
            partition,
            holder: holder.to_string(),
        });
        Ok(())
    }

    /// 释放独占登记
    pub(super) fn release(&self, partition: Option<u8>, holder: &str) {
        let mut claims = self.claims.lock();
        if let Some(pos) = claims
            .iter()
            .position(|c| c.partition == partition && c.holder == holder)
        {
            claims.swap_remove(pos);
        }
    }

    /// 当前独占持有数
    pub fn claim_count(&self) -> usize {
        self.claims.lock().len()
    }
}

impl core::fmt::Debug for Disk {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Disk")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("geometry", &self.geometry)
            .field("partitions", &self.partitions.len())
            .field("intercepted", &self.queue.is_intercepted())
            .finish()
    }
}
