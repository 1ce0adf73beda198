//! 生命周期控制
//!
//! 激活、停用、编辑（模式/策略切换）、删除与重启处理。
//!
//! 分片写锁只用来交换路由状态（绑定列表、入口点、I/O 闸门），
//! 等待在途 I/O 归零一律在释放写锁后以"休眠后复查"的方式轮询。

use core::time::Duration;
use std::sync::Arc;
use std::thread;

use super::registry::{conflicts, RebootState, Registry};
use crate::block::{BioFlags, BioOp};
use crate::cache::{BindingState, CacheBinding, CacheMode, PolicyId, ShutdownStart};
use crate::error::{Error, ErrorKind, Result};
use crate::io::issue_empty_barrier_flush;

/// 编辑或关机期间关闭绑定的 I/O 闸门，丢弃时重新打开
struct GateGuard<'a> {
    binding: &'a CacheBinding,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.binding.gate().open();
        log::debug!("[LIFECYCLE] {}: application I/O resumed", self.binding.name());
    }
}

impl Registry {
    /// 激活绑定
    ///
    /// 同一整盘上的第一个绑定会保存设备当前入口点并装上拦截入口点，
    /// 后续绑定复用兄弟绑定保存的原始入口点。失败时注册表保持原样。
    pub fn activate(&self, binding: CacheBinding) -> Result<Arc<CacheBinding>> {
        let activating = self.inner.activating.lock();
        self.preliminary_checks(&binding)?;
        let collab = &self.inner.collab;

        {
            let mut slot = binding.policy().lock();
            if slot.is_none() {
                *slot = Some(collab.policy.init(&binding, binding.policy_id())?);
            }
        }
        if binding.mode() == CacheMode::WriteBack {
            collab.engine.allocate_wb_resources(&binding)?;
        }

        let binding = Arc::new(binding);
        let original = {
            let mut bindings = self.inner.shard_of(binding.disk_id()).bindings.write();
            if conflicts(&bindings, &binding) {
                drop(bindings);
                log::error!("[TTC] {}: device is already cached", binding.name());
                if binding.mode() == CacheMode::WriteBack {
                    collab.engine.free_wb_resources(&binding);
                }
                return Err(Error::new(ErrorKind::AlreadyCached, "device already cached"));
            }

            let sibling = bindings
                .iter()
                .filter(|b| b.disk_id() == binding.disk_id())
                .find_map(|b| b.original());
            let original = match sibling {
                Some(entry) => entry,
                None => binding
                    .source()
                    .disk()
                    .queue()
                    .swap_entry(self.inner.interceptor.clone()),
            };
            binding.set_original(Some(original.clone()));
            bindings.push(Arc::clone(&binding));
            original
        };
        drop(activating);

        thread::sleep(self.inner.config.settle_delay);
        issue_empty_barrier_flush(
            binding.source(),
            None,
            Some(&original),
            BioOp::Flush,
            BioFlags::PREFLUSH | BioFlags::SYNC,
        );

        log::info!(
            "[TTC] {}: caching {} on {} ({:?}, {:?})",
            binding.name(),
            binding.source().name(),
            binding.cache().name(),
            binding.mode(),
            binding.policy_id()
        );
        Ok(binding)
    }

    /// 停用绑定
    ///
    /// 非强制停用回写绑定时先排空脏块。整盘绑定或同盘最后一个绑定
    /// 被移除时恢复原始入口点。返回前等待该绑定的在途 I/O 归零。
    pub fn deactivate(&self, binding: &Arc<CacheBinding>, force: bool) -> Result<()> {
        let cleaner = &self.inner.collab.cleaner;
        if !force && binding.mode() == CacheMode::WriteBack && !cleaner.is_failed(binding) {
            self.finish_dirty(binding)?;
        }

        {
            let mut bindings = self.inner.shard_of(binding.disk_id()).bindings.write();
            let pos = bindings
                .iter()
                .position(|b| Arc::ptr_eq(b, binding))
                .ok_or(Error::new(ErrorKind::NotFound, "binding is not active"))?;
            bindings.remove(pos);

            let siblings = bindings.iter().any(|b| b.disk_id() == binding.disk_id());
            if binding.is_whole_disk() || !siblings {
                if let Some(original) = binding.original() {
                    binding.source().disk().queue().swap_entry(original);
                    log::debug!(
                        "[TTC] {}: original entry point restored on {}",
                        binding.name(),
                        binding.source().disk().name()
                    );
                }
            }
        }

        self.wait_inflight(binding, self.inner.config.deactivate_poll);

        if binding.mode() == CacheMode::WriteBack {
            self.inner.collab.engine.free_wb_resources(binding);
        }
        log::info!("[TTC] {}: deactivated", binding.name());
        Ok(())
    }

    /// 休眠轮询直到绑定的在途 I/O 归零
    fn wait_inflight(&self, binding: &CacheBinding, poll: Duration) {
        let warn_every = self.inner.config.stuck_drain_warn_polls.max(1);
        let mut polls = 0u32;
        while binding.inflight() > 0 {
            thread::sleep(poll);
            polls = polls.wrapping_add(1);
            if polls % warn_every == 0 {
                log::warn!(
                    "[TTC] {}: still waiting for {} in-flight I/Os",
                    binding.name(),
                    binding.inflight()
                );
            }
        }
    }

    /// 排空绑定的脏块
    ///
    /// 先等在途 I/O 归零，再反复调用清理器直到脏块为零；
    /// `fast_remove` 打开或收到关机请求时提前结束。
    pub fn finish_dirty(&self, binding: &CacheBinding) -> Result<()> {
        let cleaner = &self.inner.collab.cleaner;
        self.wait_inflight(binding, self.inner.config.quiesce_poll);
        for attempt in 0..self.inner.config.drain_retry_count {
            if cleaner.is_failed(binding) {
                log::error!("[TTC] {}: cache failed, cannot drain dirty blocks", binding.name());
                return Err(Error::new(ErrorKind::DeviceFailed, "cache device failed"));
            }
            if binding.dirty_blocks() == 0
                || binding.fast_remove()
                || binding.lifecycle().shutdown_requested()
            {
                break;
            }
            if let Err(err) = cleaner.drain_dirty_blocks(binding) {
                log::error!(
                    "[TTC] {}: drain attempt {} failed: {}",
                    binding.name(),
                    attempt + 1,
                    err
                );
            }
        }

        if binding.dirty_blocks() > 0 && !binding.fast_remove() {
            log::error!(
                "[TTC] {}: {} dirty blocks left after draining",
                binding.name(),
                binding.dirty_blocks()
            );
            return Err(Error::new(ErrorKind::DrainFailed, "dirty blocks remain"));
        }
        Ok(())
    }

    /// 编辑缓存模式和/或替换策略
    ///
    /// # 参数
    ///
    /// * `name` - 缓存名
    /// * `mode` - 新模式，`None` 表示不变
    /// * `policy` - 新策略，`None` 表示不变
    ///
    /// # 错误
    ///
    /// - 两者都为 `None`：`InvalidInput`
    /// - 缓存不存在：`NotFound`
    /// - 缓存失效/降级：`DeviceFailed` / `Degraded`
    /// - 编辑、删除或关机进行中：`Busy`
    pub fn edit(&self, name: &str, mode: Option<CacheMode>, policy: Option<PolicyId>) -> Result<()> {
        if mode.is_none() && policy.is_none() {
            return Err(Error::new(ErrorKind::InvalidInput, "nothing to edit"));
        }
        let binding = self.lookup_by_name(name).ok_or_else(|| {
            log::error!("[TTC] edit: cache {} does not exist", name);
            Error::new(ErrorKind::NotFound, "cache does not exist")
        })?;

        let new_mode = mode.unwrap_or(binding.mode());
        let new_policy = policy.unwrap_or(binding.policy_id());
        if new_mode == binding.mode() && new_policy == binding.policy_id() {
            return Ok(());
        }

        let cleaner = &self.inner.collab.cleaner;
        if cleaner.is_failed(&binding) {
            log::error!("[TTC] {}: cannot edit a failed cache", name);
            return Err(Error::new(ErrorKind::DeviceFailed, "cache device failed"));
        }
        if cleaner.is_degraded(&binding) {
            log::error!("[TTC] {}: cannot edit a degraded cache", name);
            return Err(Error::new(ErrorKind::Degraded, "cache degraded"));
        }
        binding.lifecycle().begin_modify().map_err(|err| {
            log::error!("[TTC] {}: edit rejected: {}", name, err);
            err
        })?;

        let interval = binding.clean_interval();
        let restart = binding.mode() == CacheMode::WriteBack;
        if restart {
            cleaner.stop_async_tasks(&binding);
        }

        let result = self.apply_edit(&binding, new_mode, new_policy, interval);

        binding.set_clean_interval(interval);
        if restart && binding.mode() == CacheMode::WriteBack {
            log::debug!("[TTC] {}: restarting clean thread", name);
            cleaner.start_clean_thread(&binding);
            if interval > 0 && binding.dirty_blocks() > 0 {
                cleaner.schedule_aged_clean(&binding, interval);
            }
        }
        binding.lifecycle().end_modify();

        match &result {
            Ok(()) => log::info!(
                "[TTC] {}: now {:?} with {:?}",
                name,
                binding.mode(),
                binding.policy_id()
            ),
            Err(err) => log::error!("[TTC] {}: edit failed: {}", name, err),
        }
        result
    }

    fn apply_edit(
        &self,
        binding: &Arc<CacheBinding>,
        new_mode: CacheMode,
        new_policy: PolicyId,
        interval: u32,
    ) -> Result<()> {
        let old_mode = binding.mode();
        if old_mode == CacheMode::WriteBack && new_mode != CacheMode::WriteBack {
            self.finish_dirty(binding)?;
        }

        let _gate = self.quiesce(binding, self.inner.config.quiesce_poll);

        if new_policy != binding.policy_id() {
            self.switch_policy(binding, new_policy)?;
        }
        if new_mode != old_mode {
            self.switch_mode(binding, new_mode)?;
        }

        binding.set_clean_interval(interval);
        self.inner.collab.metadata.store_superblock(binding)
    }

    /// 替换策略；新策略初始化失败时保留旧策略
    fn switch_policy(&self, binding: &CacheBinding, policy: PolicyId) -> Result<()> {
        let engine = &self.inner.collab.policy;
        let mut new = engine.init(binding, policy)?;
        engine.mark_clean_lru(binding, &mut new);

        let old = binding.policy().lock().replace(new);
        binding.set_policy_id(policy);
        if let Some(old) = old {
            engine.switch_cleanup(binding, old);
        }
        Ok(())
    }

    fn switch_mode(&self, binding: &CacheBinding, mode: CacheMode) -> Result<()> {
        let engine = &self.inner.collab.engine;
        let old = binding.mode();
        log::debug!("[TTC] {}: mode switch {:?} -> {:?}", binding.name(), old, mode);

        if mode == CacheMode::WriteBack {
            binding.set_mode(mode);
            if let Err(err) = engine.allocate_wb_resources(binding) {
                binding.set_mode(old);
                return Err(err);
            }
        } else if old == CacheMode::WriteBack {
            engine.free_wb_resources(binding);
            binding.set_mode(mode);
        } else {
            binding.set_mode(mode);
        }
        Ok(())
    }

    /// 关闭绑定的 I/O 闸门并等待在途 I/O 归零
    ///
    /// 闸门在分片写锁内关闭：此后的路由决策都能看到关闭的闸门，
    /// 新 I/O 停在闸门前而不进入在途计数。
    fn quiesce<'a>(&self, binding: &'a CacheBinding, poll: Duration) -> GateGuard<'a> {
        {
            let _bindings = self.inner.shard_of(binding.disk_id()).bindings.write();
            binding.gate().close();
        }
        let guard = GateGuard { binding };
        while binding.inflight() > 0 {
            log::trace!("[LIFECYCLE] {}: draining in-flight I/O", binding.name());
            thread::sleep(poll);
        }
        log::debug!("[LIFECYCLE] {}: application I/O blocked", binding.name());
        guard
    }

    /// 删除缓存
    pub fn delete(&self, name: &str, force: bool) -> Result<()> {
        let binding = self
            .lookup_by_name(name)
            .ok_or(Error::new(ErrorKind::NotFound, "cache does not exist"))?;
        binding.lifecycle().begin_modify().map_err(|err| {
            log::error!("[TTC] {}: delete rejected: {}", name, err);
            err
        })?;

        match self.deactivate(&binding, force) {
            Ok(()) => {
                binding.lifecycle().finish_delete();
                log::info!("[TTC] {}: deleted", name);
                Ok(())
            }
            Err(err) => {
                binding.lifecycle().end_modify();
                log::error!("[TTC] {}: delete failed: {}", name, err);
                Err(err)
            }
        }
    }

    /// 重启/关机处理
    ///
    /// 只执行一次：并发调用者等第一个调用完成后直接返回。
    /// 每个健康的绑定停止后台任务、转为只读并持久化元数据；
    /// 冷启动绑定在未强制热启动时先清空脏块。
    pub fn handle_reboot(&self) -> Result<()> {
        {
            let mut state = self.inner.reboot.lock();
            loop {
                match *state {
                    RebootState::Done => return Ok(()),
                    RebootState::InProgress => self.inner.reboot_done.wait(&mut state),
                    RebootState::Idle => break,
                }
            }
            *state = RebootState::InProgress;
        }

        log::info!("[TTC] reboot: shutting down caches");
        for binding in self.inner.snapshot() {
            self.shutdown_binding(&binding);
        }

        *self.inner.reboot.lock() = RebootState::Done;
        self.inner.reboot_done.notify_all();
        log::info!("[TTC] reboot: all caches are read-only");
        Ok(())
    }

    fn shutdown_binding(&self, binding: &CacheBinding) {
        let collab = &self.inner.collab;
        let config = &self.inner.config;
        if collab.cleaner.is_failed(binding) || collab.cleaner.is_degraded(binding) {
            log::error!(
                "[TTC] reboot: {} is failed or degraded, skipping",
                binding.name()
            );
            return;
        }

        match binding.lifecycle().begin_shutdown() {
            ShutdownStart::Started => {}
            ShutdownStart::WaitForModify => {
                while matches!(binding.lifecycle().state(), BindingState::Modifying { .. }) {
                    thread::sleep(config.reboot_poll);
                }
                if binding.lifecycle().state() == BindingState::Deleted {
                    return;
                }
            }
            ShutdownStart::Skip => return,
        }

        {
            let _gate = self.quiesce(binding, config.reboot_poll);
            let interval = binding.clean_interval();
            collab.cleaner.stop_async_tasks(binding);
            binding.set_clean_interval(interval);
            binding.set_read_only();
        }

        if binding.cold_boot() && binding.dirty_blocks() > 0 && !config.force_warm_boot {
            if let Err(err) = collab.cleaner.clean_for_reboot(binding) {
                log::error!("[TTC] reboot: {}: cleaning failed: {}", binding.name(), err);
            }
        }
        if let Err(err) = collab.metadata.store_metadata(binding) {
            log::error!(
                "[TTC] reboot: {}: metadata store failed: {}",
                binding.name(),
                err
            );
        }
        binding.lifecycle().finish_shutdown();
    }
}
