//! 绑定注册表
//!
//! 固定数量的分片，每个分片一把读写锁加一个绑定列表。
//! 分片键是源设备所在整盘的设备号，同一整盘上的绑定总在同一分片中。

use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex, RwLock};

use super::intercept::Interceptor;
use crate::block::{DiskId, EntryPoint};
use crate::cache::{CacheBinding, Collaborators};
use crate::config::TtcConfig;
use crate::consts::SHARD_HASH_MAGIC;
use crate::error::{Error, ErrorKind, Result};
use crate::io::Dispatcher;

/// 注册表分片
pub(crate) struct Shard {
    pub(crate) bindings: RwLock<Vec<Arc<CacheBinding>>>,
}

/// 重启处理进度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RebootState {
    Idle,
    InProgress,
    Done,
}

pub(crate) struct RegistryInner {
    pub(crate) shards: Box<[Shard]>,
    pub(crate) config: TtcConfig,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) collab: Collaborators,
    pub(crate) interceptor: EntryPoint,
    /// 串行化激活，名字唯一性检查与插入之间不留窗口
    pub(crate) activating: Mutex<()>,
    pub(crate) reboot: Mutex<RebootState>,
    pub(crate) reboot_done: Condvar,
}

impl RegistryInner {
    pub(crate) fn shard_of(&self, disk: DiskId) -> &Shard {
        let key = u64::from(disk.major) * SHARD_HASH_MAGIC + u64::from(disk.minor);
        &self.shards[(key % self.shards.len() as u64) as usize]
    }

    /// 所有分片中绑定的快照
    pub(crate) fn snapshot(&self) -> Vec<Arc<CacheBinding>> {
        self.shards
            .iter()
            .flat_map(|shard| shard.bindings.read().clone())
            .collect()
    }

    pub(crate) fn lookup_by_name(&self, name: &str) -> Option<Arc<CacheBinding>> {
        self.shards.iter().find_map(|shard| {
            shard
                .bindings
                .read()
                .iter()
                .find(|b| b.name() == name)
                .cloned()
        })
    }
}

/// 新绑定是否与 `existing` 中同一整盘上的绑定冲突
///
/// 冲突：任一方为整盘、同一分区、或扇区范围相交。
pub(crate) fn conflicts(existing: &[Arc<CacheBinding>], new: &CacheBinding) -> bool {
    existing
        .iter()
        .filter(|b| b.disk_id() == new.disk_id())
        .any(|b| {
            b.is_whole_disk()
                || new.is_whole_disk()
                || b.source().same_device(new.source())
                || b.intersects(new.start_sect(), new.end_sect())
        })
}

/// 拦截层注册表
///
/// 进程内构造一次，显式传给需要它的组件；丢弃时强制停用所有剩余绑定，
/// 恢复各磁盘的原始入口点。
///
/// # 示例
///
/// ```rust,ignore
/// let registry = Registry::new(TtcConfig::default(), collaborators)?;
/// let binding = CacheBinding::new(BindingConfig::new("fast"), source, cache)?;
/// registry.activate(binding)?;
/// registry.edit("fast", Some(CacheMode::WriteBack), None)?;
/// registry.delete("fast", false)?;
/// ```
pub struct Registry {
    pub(crate) inner: Arc<RegistryInner>,
}

impl Registry {
    /// 创建注册表
    pub fn new(config: TtcConfig, collab: Collaborators) -> Result<Self> {
        config.validate()?;
        let dispatcher = Arc::new(Dispatcher::new(
            config.io_context_pool_size,
            config.submit_error_poll,
        ));
        let inner = Arc::new_cyclic(|weak: &Weak<RegistryInner>| {
            let shards = (0..config.shard_count)
                .map(|_| Shard {
                    bindings: RwLock::new(Vec::new()),
                })
                .collect();
            RegistryInner {
                shards,
                config,
                dispatcher,
                collab,
                interceptor: EntryPoint::new(Arc::new(Interceptor::new(weak.clone()))),
                activating: Mutex::new(()),
                reboot: Mutex::new(RebootState::Idle),
                reboot_done: Condvar::new(),
            }
        });
        log::info!("[TTC] registry initialised with {} shards", inner.shards.len());
        Ok(Self { inner })
    }

    /// 配置
    pub fn config(&self) -> &TtcConfig {
        &self.inner.config
    }

    /// I/O 派发引擎
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    /// 拦截入口点
    pub fn interceptor(&self) -> &EntryPoint {
        &self.inner.interceptor
    }

    /// 按名字查找绑定（扫描所有分片）
    pub fn lookup_by_name(&self, name: &str) -> Option<Arc<CacheBinding>> {
        self.inner.lookup_by_name(name)
    }

    /// 创建前检查
    ///
    /// - 源设备与缓存设备在同一整盘上：`InvalidInput`
    /// - 同名缓存已存在：`AlreadyExists`
    /// - 与已有绑定冲突：`AlreadyCached`
    pub fn preliminary_checks(&self, binding: &CacheBinding) -> Result<()> {
        if binding.source().disk().id() == binding.cache().disk().id() {
            log::error!(
                "[TTC] {}: source and cache belong to the same device",
                binding.name()
            );
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "source and cache on the same device",
            ));
        }
        if self.lookup_by_name(binding.name()).is_some() {
            log::error!("[TTC] {}: cache already exists", binding.name());
            return Err(Error::new(ErrorKind::AlreadyExists, "cache name already exists"));
        }
        let shard = self.inner.shard_of(binding.disk_id());
        if conflicts(&shard.bindings.read(), binding) {
            log::error!("[TTC] {}: device is already cached", binding.name());
            return Err(Error::new(ErrorKind::AlreadyCached, "device already cached"));
        }
        Ok(())
    }

    /// 强制停用所有绑定
    pub fn teardown(&self) {
        for binding in self.inner.snapshot() {
            if let Err(err) = self.deactivate(&binding, true) {
                log::warn!("[TTC] {}: teardown deactivate failed: {}", binding.name(), err);
            }
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.teardown();
    }
}
