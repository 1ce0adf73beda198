//! 路由决策
//!
//! 每个进入拦截入口点的 bio 都在分片读锁下分类：
//!
//! 1. 同一整盘上存在整盘绑定：归该绑定
//! 2. 完全落在某个分区绑定范围内：归该绑定
//! 3. 与某个绑定范围相交但不被包含：重叠，需要拆分
//! 4. 其余：直通原始入口点
//!
//! 零长度 bio 的"范围"只是它的起始扇区：起始扇区在绑定范围内即归该绑定，永不判为重叠。

use std::sync::Arc;

use super::registry::{Registry, RegistryInner};
use crate::block::{DiskId, EntryPoint};
use crate::cache::{CacheBinding, InflightGuard};

/// 路由结果
#[derive(Debug, Clone)]
pub enum Route {
    /// 交给该绑定的缓存引擎
    Cache(Arc<CacheBinding>),
    /// 跨越绑定边界，拆分后逐扇区重新路由
    Split,
    /// 直通；`None` 表示同一整盘上没有绑定，使用设备当前入口点
    Passthrough(Option<EntryPoint>),
}

/// 在一个分片的绑定列表上分类
pub(crate) fn classify(
    bindings: &[Arc<CacheBinding>],
    disk: DiskId,
    sector: u64,
    nr_sectors: u64,
) -> Route {
    let last = sector.saturating_add(nr_sectors.max(1) - 1);
    let mut original = None;

    for binding in bindings.iter().filter(|b| b.disk_id() == disk) {
        if binding.is_whole_disk() {
            return Route::Cache(Arc::clone(binding));
        }
        if original.is_none() {
            original = binding.original();
        }
        if binding.contains(sector, last) {
            return Route::Cache(Arc::clone(binding));
        }
        if nr_sectors > 0 && binding.intersects(sector, last) {
            log::debug!(
                "[ROUTE] overlapping I/O on {} at sector {}, {} sectors",
                binding.name(),
                sector,
                nr_sectors
            );
            return Route::Split;
        }
    }
    Route::Passthrough(original)
}

/// 拦截路径上的决策：缓存路径在读锁内登记在途计数
pub(crate) enum Decision {
    Cache(InflightGuard),
    /// 绑定的 I/O 闸门关闭，等待后重新路由
    Gated(Arc<CacheBinding>),
    Split,
    Passthrough(Option<EntryPoint>),
}

impl RegistryInner {
    pub(crate) fn decide(&self, disk: DiskId, sector: u64, nr_sectors: u64) -> Decision {
        let bindings = self.shard_of(disk).bindings.read();
        match classify(&bindings, disk, sector, nr_sectors) {
            Route::Cache(binding) => {
                if binding.gate().is_open() {
                    Decision::Cache(binding.enter_io())
                } else {
                    Decision::Gated(binding)
                }
            }
            Route::Split => Decision::Split,
            Route::Passthrough(original) => Decision::Passthrough(original),
        }
    }
}

impl Registry {
    /// 对整盘 `disk` 上 `[sector, sector + nr_sectors)` 的 I/O 做路由分类
    pub fn route(&self, disk: DiskId, sector: u64, nr_sectors: u64) -> Route {
        let shard = self.inner.shard_of(disk);
        let bindings = shard.bindings.read();
        classify(&bindings, disk, sector, nr_sectors)
    }
}
