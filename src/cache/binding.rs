//! 缓存绑定
//!
//! [`CacheBinding`] 把一个缓存实例挂接到源设备（整盘或分区）上。
//! 绑定由注册表分片独占持有；缓存引擎、清理器和派发引擎只在 I/O 在途期间
//! 借用它，并通过在途计数（[`InflightGuard`]）保证绑定在 I/O 完成前不被释放。

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::policy::PolicyHandle;
use super::state::{IoGate, Lifecycle, StatusFlags};
use crate::block::{BlockDev, DiskId, EntryPoint};
use crate::consts::{BLKSIZE_2K, BLKSIZE_4K, BLKSIZE_8K};
use crate::error::{Error, ErrorKind, Result};

/// 缓存模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CacheMode {
    /// 回写
    WriteBack = 1,
    /// 只读缓存
    ReadOnly = 2,
    /// 直写
    WriteThrough = 3,
}

impl CacheMode {
    /// 从数值标识转换
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Self::WriteBack),
            2 => Some(Self::ReadOnly),
            3 => Some(Self::WriteThrough),
            _ => None,
        }
    }

    /// 数值标识
    pub fn id(self) -> u8 {
        self as u8
    }
}

/// 替换策略标识
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PolicyId {
    /// 先进先出
    Fifo = 1,
    /// 最近最少使用
    Lru = 2,
    /// 随机替换
    Random = 3,
}

impl PolicyId {
    /// 从数值标识转换
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Self::Fifo),
            2 => Some(Self::Lru),
            3 => Some(Self::Random),
            _ => None,
        }
    }

    /// 数值标识
    pub fn id(self) -> u8 {
        self as u8
    }
}

/// 元数据持久化模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Persistence {
    /// 重新加载已有元数据
    Reload = 1,
    /// 新建
    Create = 2,
    /// 强制新建（覆盖已有元数据）
    ForceCreate = 3,
}

impl Persistence {
    /// 持久化方式的数值编码
    pub fn id(self) -> u8 {
        self as u8
    }
}

/// 绑定范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceScope {
    /// 整盘
    WholeDisk,
    /// 单个分区
    Partition,
}

/// 绑定配置
///
/// # 示例
///
/// ```rust,ignore
/// let config = BindingConfig {
///     mode: CacheMode::WriteBack,
///     ..BindingConfig::new("fast")
/// };
/// ```
#[derive(Debug, Clone)]
pub struct BindingConfig {
    /// 缓存名
    pub name: String,
    /// 缓存模式
    pub mode: CacheMode,
    /// 替换策略
    pub policy: PolicyId,
    /// 元数据持久化模式
    pub persistence: Persistence,
    /// 缓存块大小（扇区）
    pub block_size: u32,
    /// 组相联度
    pub assoc: u32,
    /// 删除时跳过脏块排空
    pub fast_remove: bool,
    /// 定时清理间隔（分钟，0 表示关闭）
    pub time_based_clean_interval: u32,
    /// 冷启动：重启前排空脏块
    pub cold_boot: bool,
}

impl BindingConfig {
    /// 以默认参数创建配置
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            mode: CacheMode::WriteThrough,
            policy: PolicyId::Lru,
            persistence: Persistence::Create,
            block_size: BLKSIZE_4K,
            assoc: 256,
            fast_remove: false,
            time_based_clean_interval: 0,
            cold_boot: false,
        }
    }
}

/// 缓存绑定
pub struct CacheBinding {
    name: String,
    source: BlockDev,
    cache: BlockDev,
    scope: DeviceScope,
    start_sect: u64,
    end_sect: u64,
    original: RwLock<Option<EntryPoint>>,

    mode: AtomicU8,
    policy_id: AtomicU8,
    policy: Mutex<Option<PolicyHandle>>,
    persistence: Persistence,
    block_size: u32,
    assoc: u32,

    inflight: AtomicU64,
    dirty: AtomicU64,
    unaligned_ios: AtomicU64,

    fast_remove: AtomicBool,
    clean_interval: AtomicU32,
    cold_boot: AtomicBool,
    read_only: AtomicBool,

    lifecycle: Lifecycle,
    gate: IoGate,
}

impl CacheBinding {
    /// 创建绑定
    ///
    /// # 参数
    ///
    /// * `config` - 绑定配置
    /// * `source` - 源设备句柄（整盘或分区）
    /// * `cache` - 缓存设备句柄
    pub fn new(config: BindingConfig, source: BlockDev, cache: BlockDev) -> Result<Self> {
        if config.name.is_empty() {
            return Err(Error::new(ErrorKind::InvalidInput, "empty cache name"));
        }
        if !matches!(config.block_size, BLKSIZE_2K | BLKSIZE_4K | BLKSIZE_8K) {
            return Err(Error::new(ErrorKind::InvalidInput, "unsupported cache block size"));
        }
        if config.assoc == 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "associativity must be non-zero"));
        }

        let scope = if source.is_whole_disk() {
            DeviceScope::WholeDisk
        } else {
            DeviceScope::Partition
        };

        Ok(Self {
            name: config.name,
            scope,
            start_sect: source.start_sect(),
            end_sect: source.end_sect(),
            source,
            cache,
            original: RwLock::new(None),
            mode: AtomicU8::new(config.mode.id()),
            policy_id: AtomicU8::new(config.policy.id()),
            policy: Mutex::new(None),
            persistence: config.persistence,
            block_size: config.block_size,
            assoc: config.assoc,
            inflight: AtomicU64::new(0),
            dirty: AtomicU64::new(0),
            unaligned_ios: AtomicU64::new(0),
            fast_remove: AtomicBool::new(config.fast_remove),
            clean_interval: AtomicU32::new(config.time_based_clean_interval),
            cold_boot: AtomicBool::new(config.cold_boot),
            read_only: AtomicBool::new(false),
            lifecycle: Lifecycle::new(),
            gate: IoGate::default(),
        })
    }

    /// 缓存名
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 源设备
    pub fn source(&self) -> &BlockDev {
        &self.source
    }

    /// 缓存设备
    pub fn cache(&self) -> &BlockDev {
        &self.cache
    }

    /// 源设备所在整盘
    pub fn disk_id(&self) -> DiskId {
        self.source.disk().id()
    }

    /// 绑定覆盖的范围（整盘或分区）
    pub fn scope(&self) -> DeviceScope {
        self.scope
    }

    /// 是否为整盘绑定
    pub fn is_whole_disk(&self) -> bool {
        self.scope == DeviceScope::WholeDisk
    }

    /// 起始扇区（整盘绝对地址）
    pub fn start_sect(&self) -> u64 {
        self.start_sect
    }

    /// 最后一个扇区（含，整盘绝对地址）
    pub fn end_sect(&self) -> u64 {
        self.end_sect
    }

    /// `[first, last]` 是否完全落在本绑定范围内
    pub fn contains(&self, first: u64, last: u64) -> bool {
        first >= self.start_sect && last <= self.end_sect
    }

    /// `[first, last]` 是否与本绑定范围相交
    pub fn intersects(&self, first: u64, last: u64) -> bool {
        first <= self.end_sect && last >= self.start_sect
    }

    /// 保存的原始入口点
    pub fn original(&self) -> Option<EntryPoint> {
        self.original.read().clone()
    }

    pub(crate) fn set_original(&self, entry: Option<EntryPoint>) {
        *self.original.write() = entry;
    }

    /// 当前缓存模式
    pub fn mode(&self) -> CacheMode {
        CacheMode::from_id(self.mode.load(Ordering::Acquire)).unwrap_or(CacheMode::WriteThrough)
    }

    pub(crate) fn set_mode(&self, mode: CacheMode) {
        self.mode.store(mode.id(), Ordering::Release);
    }

    /// 当前替换策略
    pub fn policy_id(&self) -> PolicyId {
        PolicyId::from_id(self.policy_id.load(Ordering::Acquire)).unwrap_or(PolicyId::Lru)
    }

    pub(crate) fn set_policy_id(&self, policy: PolicyId) {
        self.policy_id.store(policy.id(), Ordering::Release);
    }

    /// 当前替换策略实例
    pub fn policy(&self) -> &Mutex<Option<PolicyHandle>> {
        &self.policy
    }

    /// 创建时的持久化方式
    pub fn persistence(&self) -> Persistence {
        self.persistence
    }

    /// 缓存块大小（扇区）
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// 组相联度
    pub fn assoc(&self) -> u32 {
        self.assoc
    }

    /// 缓存块总数
    pub fn nr_blocks(&self) -> u64 {
        self.cache.nr_sects() / u64::from(self.block_size)
    }

    /// 组数
    pub fn nr_sets(&self) -> u64 {
        (self.nr_blocks() / u64::from(self.assoc)).max(1)
    }

    /// 进入一次在途 I/O
    pub fn enter_io(self: &Arc<Self>) -> InflightGuard {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        InflightGuard(Arc::clone(self))
    }

    /// 在途 I/O 数
    pub fn inflight(&self) -> u64 {
        self.inflight.load(Ordering::Acquire)
    }

    /// 脏块数
    pub fn dirty_blocks(&self) -> u64 {
        self.dirty.load(Ordering::Acquire)
    }

    /// 设置脏块数
    pub fn set_dirty_blocks(&self, n: u64) {
        self.dirty.store(n, Ordering::Release);
    }

    /// 增加脏块数
    pub fn add_dirty_blocks(&self, n: u64) {
        self.dirty.fetch_add(n, Ordering::AcqRel);
    }

    /// 减少脏块数（不会低于 0）
    pub fn clear_dirty_blocks(&self, n: u64) {
        let _ = self
            .dirty
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| Some(d.saturating_sub(n)));
    }

    /// 非对齐子 I/O 计数
    pub fn unaligned_ios(&self) -> u64 {
        self.unaligned_ios.load(Ordering::Relaxed)
    }

    pub(crate) fn count_unaligned_io(&self) {
        self.unaligned_ios.fetch_add(1, Ordering::Relaxed);
    }

    /// 是否跳过脏块排空直接移除
    pub fn fast_remove(&self) -> bool {
        self.fast_remove.load(Ordering::Acquire)
    }

    /// 设置快速移除开关
    pub fn set_fast_remove(&self, on: bool) {
        self.fast_remove.store(on, Ordering::Release);
    }

    /// 定时清理间隔（分钟）
    pub fn clean_interval(&self) -> u32 {
        self.clean_interval.load(Ordering::Acquire)
    }

    /// 设置定时清理间隔（分钟，0 表示关闭）
    pub fn set_clean_interval(&self, minutes: u32) {
        self.clean_interval.store(minutes, Ordering::Release);
    }

    /// 关机时是否清空脏块（冷启动）
    pub fn cold_boot(&self) -> bool {
        self.cold_boot.load(Ordering::Acquire)
    }

    /// 设置冷启动开关
    pub fn set_cold_boot(&self, on: bool) {
        self.cold_boot.store(on, Ordering::Release);
    }

    /// 缓存是否已转为只读（关机处理后）
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub(crate) fn set_read_only(&self) {
        self.read_only.store(true, Ordering::Release);
    }

    /// 生命周期状态
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// I/O 闸门
    pub fn gate(&self) -> &IoGate {
        &self.gate
    }

    /// 汇总标志
    pub fn flags(&self) -> StatusFlags {
        let mut flags = self.lifecycle.flags();
        flags.set(StatusFlags::READ_ONLY, flags.contains(StatusFlags::READ_ONLY) || self.is_read_only());
        flags
    }
}

impl core::fmt::Debug for CacheBinding {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CacheBinding")
            .field("name", &self.name)
            .field("source", &self.source.name())
            .field("cache", &self.cache.name())
            .field("scope", &self.scope)
            .field("range", &(self.start_sect..=self.end_sect))
            .field("mode", &self.mode())
            .field("inflight", &self.inflight())
            .field("dirty", &self.dirty_blocks())
            .finish()
    }
}

/// 在途 I/O 计数守卫，丢弃时计数减一
pub struct InflightGuard(Arc<CacheBinding>);

impl InflightGuard {
    /// 守卫登记的绑定
    pub fn binding(&self) -> &Arc<CacheBinding> {
        &self.0
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.0.inflight.fetch_sub(1, Ordering::AcqRel);
    }
}
