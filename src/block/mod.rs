//! 块设备模型
//!
//! 提供拦截层所依赖的块层抽象。
//! block/device.rs 描述整块磁盘（几何、分区表、请求队列）；
//! block/queue.rs 提供请求队列和可替换的 I/O 入口点；
//! block/bio.rs 是在各层之间流转的 I/O 请求；
//! block/handle.rs 按路径打开设备并管理独占持有。

mod bio;
mod device;
mod handle;
mod queue;

pub use bio::{Bio, BioFlags, BioOp, EndIo, Page, Segment};
pub use device::{Disk, DiskGeometry, DiskId, Partition};
pub use handle::{BlockDev, DeviceManager, OpenMode};
pub use queue::{EntryPoint, MakeRequest, RequestQueue};
