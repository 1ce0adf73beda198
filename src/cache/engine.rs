//! 外部协作者接口
//!
//! 拦截层本身不做命中查找、脏块清理或元数据持久化，
//! 这些工作委托给以下 trait 的实现者。

use std::sync::Arc;

use super::binding::{CacheBinding, PolicyId};
use super::policy::{BuiltinPolicyEngine, PolicyHandle};
use crate::block::Bio;
use crate::error::Result;

/// 缓存引擎：接收路由到缓存的 I/O
pub trait CacheEngine: Send + Sync {
    /// 处理一个属于 `binding` 的 bio
    ///
    /// bio 的扇区已换算为相对绑定起点的地址；引擎取得所有权并负责完成它。
    fn map(&self, binding: &Arc<CacheBinding>, bio: Bio);

    /// 切换到回写模式前分配回写资源
    fn allocate_wb_resources(&self, _binding: &CacheBinding) -> Result<()> {
        Ok(())
    }

    /// 离开回写模式后释放回写资源
    fn free_wb_resources(&self, _binding: &CacheBinding) {}
}

/// 替换策略引擎
pub trait PolicyEngine: Send + Sync {
    /// 为绑定初始化一个新策略实例
    fn init(&self, binding: &CacheBinding, policy: PolicyId) -> Result<PolicyHandle>;

    /// 把当前缓存中的干净块登记到新策略实例
    fn mark_clean_lru(&self, binding: &CacheBinding, new: &mut PolicyHandle);

    /// 释放旧策略实例
    fn switch_cleanup(&self, binding: &CacheBinding, old: PolicyHandle);
}

/// 回写清理器
pub trait Cleaner: Send + Sync {
    /// 把脏块写回源设备
    fn drain_dirty_blocks(&self, binding: &CacheBinding) -> Result<()>;

    /// 重启前的脏块清理
    fn clean_for_reboot(&self, binding: &CacheBinding) -> Result<()> {
        self.drain_dirty_blocks(binding)
    }

    /// 停止后台清理任务
    fn stop_async_tasks(&self, binding: &CacheBinding);

    /// 启动清理线程
    fn start_clean_thread(&self, binding: &CacheBinding);

    /// 安排定时清理（间隔单位：分钟）
    fn schedule_aged_clean(&self, binding: &CacheBinding, interval: u32);

    /// 缓存设备是否已失效
    fn is_failed(&self, binding: &CacheBinding) -> bool {
        binding.lifecycle().is_failed()
    }

    /// 缓存是否处于降级状态
    fn is_degraded(&self, binding: &CacheBinding) -> bool {
        binding.lifecycle().is_degraded()
    }
}

/// 元数据持久化
pub trait MetadataStore: Send + Sync {
    /// 持久化超级块（编辑后调用）
    fn store_superblock(&self, binding: &CacheBinding) -> Result<()>;

    /// 持久化全部元数据（关机时调用）
    fn store_metadata(&self, binding: &CacheBinding) -> Result<()>;
}

/// 注册表使用的协作者集合
#[derive(Clone)]
pub struct Collaborators {
    /// 缓存引擎
    pub engine: Arc<dyn CacheEngine>,
    /// 替换策略引擎
    pub policy: Arc<dyn PolicyEngine>,
    /// 清理器
    pub cleaner: Arc<dyn Cleaner>,
    /// 元数据存储
    pub metadata: Arc<dyn MetadataStore>,
}

impl Collaborators {
    /// 使用内置策略引擎
    pub fn new(
        engine: Arc<dyn CacheEngine>,
        cleaner: Arc<dyn Cleaner>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            engine,
            policy: Arc::new(BuiltinPolicyEngine),
            cleaner,
            metadata,
        }
    }
}
