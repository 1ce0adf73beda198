//! ttc_core: 块缓存透明流量捕获层
//!
//! 在块设备的 I/O 入口点上插入一层拦截，把应用 I/O 按扇区范围
//! 路由到缓存或原始设备：
//! - **分片注册表**：按整盘设备号散列，互不相关的磁盘互不竞争
//! - **路由**：缓存 / 重叠拆分 / 直通三种决策
//! - **派发引擎**：同步或异步完成，非对齐头尾读-改-写
//! - **生命周期**：激活、停用、模式与策略切换、删除、重启处理
//!
//! # 示例
//!
//! ```rust,ignore
//! use ttc_core::{BindingConfig, CacheBinding, Collaborators, OpenMode, Registry, TtcConfig};
//!
//! let collab = Collaborators::new(engine, cleaner, metadata);
//! let registry = Registry::new(TtcConfig::default(), collab)?;
//!
//! let mode = OpenMode::READ | OpenMode::WRITE | OpenMode::EXCL;
//! let source = manager.open("/dev/sdb1", mode, "ttc")?;
//! let cache = manager.open("/dev/nvme0n1", mode, "ttc")?;
//! let binding = registry.activate(CacheBinding::new(BindingConfig::new("fast"), source, cache)?)?;
//! ```
//!
//! # 模块结构
//!
//! - [`error`] - 错误类型定义
//! - [`consts`] - 常量定义
//! - [`config`] - 拦截层配置
//! - [`block`] - 块设备模型（磁盘、分区、请求队列、bio）
//! - [`io`] - I/O 派发引擎
//! - [`cache`] - 缓存绑定、状态机与协作者接口
//! - [`ttc`] - 注册表、路由与生命周期控制

#![deny(unsafe_code)]
#![warn(missing_docs)]

// ===== 核心模块 =====

/// 错误处理
pub mod error;

/// 常量定义
pub mod consts;

/// 配置
pub mod config;

/// 块设备模型
pub mod block;

/// I/O 派发
pub mod io;

/// 缓存绑定
pub mod cache;

/// 透明流量捕获
pub mod ttc;

#[cfg(test)]
pub(crate) mod testing;

// ===== 公共导出 =====

// 错误处理
pub use error::{Error, ErrorKind, Result};

// 配置
pub use config::TtcConfig;

// 块设备
pub use block::{
    Bio, BioFlags, BioOp, BlockDev, DeviceManager, Disk, DiskGeometry, DiskId, EntryPoint,
    MakeRequest, OpenMode, Page, Partition, Segment,
};

// I/O 派发
pub use io::{Dispatcher, IoMemory, IoRegion, IoRequest};

// 缓存绑定
pub use cache::{
    BindingConfig, BindingState, CacheBinding, CacheEngine, CacheMode, Cleaner, Collaborators,
    MetadataStore, Persistence, PolicyEngine, PolicyId, StatusFlags,
};

// TTC
pub use ttc::{BindingSummary, Registry, Route};
