//! 绑定汇总（控制面列表接口）

use super::registry::Registry;
use crate::cache::{CacheBinding, CacheMode, Persistence, PolicyId, StatusFlags};

/// 单个绑定的汇总信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSummary {
    /// 缓存名
    pub name: String,
    /// 源设备名
    pub source_name: String,
    /// 源设备大小（字节）
    pub source_size: u64,
    /// 源设备逻辑块大小
    pub source_block_size: u32,
    /// 缓存设备名
    pub cache_name: String,
    /// 缓存设备大小（字节）
    pub cache_size: u64,
    /// 缓存设备逻辑块大小
    pub cache_block_size: u32,
    /// 状态标志
    pub flags: StatusFlags,
    /// 替换策略
    pub policy: PolicyId,
    /// 缓存模式
    pub mode: CacheMode,
    /// 持久化方式
    pub persistence: Persistence,
    /// 缓存块大小（扇区）
    pub block_size: u32,
    /// 组相联度
    pub assoc: u32,
}

impl From<&CacheBinding> for BindingSummary {
    fn from(binding: &CacheBinding) -> Self {
        Self {
            name: binding.name().to_string(),
            source_name: binding.source().name().to_string(),
            source_size: binding.source().size_bytes(),
            source_block_size: binding.source().logical_block_size(),
            cache_name: binding.cache().name().to_string(),
            cache_size: binding.cache().size_bytes(),
            cache_block_size: binding.cache().logical_block_size(),
            flags: binding.flags(),
            policy: binding.policy_id(),
            mode: binding.mode(),
            persistence: binding.persistence(),
            block_size: binding.block_size(),
            assoc: binding.assoc(),
        }
    }
}

impl Registry {
    /// 活动绑定数
    pub fn count_bindings(&self) -> usize {
        self.inner
            .shards
            .iter()
            .map(|shard| shard.bindings.read().len())
            .sum()
    }

    /// 最多列出 `max` 个绑定的汇总（按分片顺序）
    pub fn list_bindings(&self, max: usize) -> Vec<BindingSummary> {
        let mut out = Vec::new();
        for shard in self.inner.shards.iter() {
            if out.len() >= max {
                break;
            }
            let bindings = shard.bindings.read();
            out.extend(
                bindings
                    .iter()
                    .take(max - out.len())
                    .map(|b| BindingSummary::from(b.as_ref())),
            );
        }
        out
    }
}
