//! 透明流量捕获（TTC）
//!
//! 在块设备的请求队列上装入拦截入口点，把落在缓存绑定范围内的 I/O
//! 交给缓存引擎，其余 I/O 原样转发给设备驱动。
//!
//! - [`Registry`]：分片绑定表、路由决策与生命周期控制
//! - [`Route`]：路由分类结果
//! - [`BindingSummary`]：控制面列表接口

mod intercept;
mod lifecycle;
mod registry;
mod route;
mod split;
mod summary;

pub use registry::Registry;
pub use route::Route;
pub use summary::BindingSummary;
