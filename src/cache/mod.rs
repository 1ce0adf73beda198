//! 缓存绑定与协作者
//!
//! - [`CacheBinding`]：缓存实例与源设备区域的绑定
//! - [`Lifecycle`] / [`IoGate`]：绑定状态机与 I/O 闸门
//! - 协作者接口：[`CacheEngine`]、[`PolicyEngine`]、[`Cleaner`]、[`MetadataStore`]
//! - 内置替换策略：FIFO / LRU

mod binding;
mod engine;
mod policy;
mod state;

pub use binding::{
    BindingConfig, CacheBinding, CacheMode, DeviceScope, InflightGuard, Persistence, PolicyId,
};
pub use engine::{CacheEngine, Cleaner, Collaborators, MetadataStore, PolicyEngine};
pub use policy::{BuiltinPolicyEngine, FifoPolicy, LruPolicy, PolicyHandle, ReplacementPolicy};
pub use state::{BindingState, IoGate, Lifecycle, ShutdownStart, StatusFlags};
