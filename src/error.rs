//! 错误类型定义
//!
//! 提供拦截层、派发引擎与生命周期控制的统一错误类型。

use core::fmt;

/// 拦截层操作错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    message: &'static str,
}

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// I/O 错误
    Io,
    /// 无效参数（错误的设备路径、格式错误的编辑请求）
    InvalidInput,
    /// 同名缓存已存在
    AlreadyExists,
    /// 设备（或其某个分区）已被缓存
    AlreadyCached,
    /// 缓存不存在
    NotFound,
    /// 并发的修改/关机正在进行
    Busy,
    /// 不支持的操作（重叠区域上的 discard）
    Unsupported,
    /// 内存不足
    OutOfMemory,
    /// 缓存设备已失效
    DeviceFailed,
    /// 缓存处于降级状态
    Degraded,
    /// 脏块未能排空
    DrainFailed,
    /// 无效状态
    InvalidState,
}

impl Error {
    /// 创建新错误
    pub const fn new(kind: ErrorKind, message: &'static str) -> Self {
        Self { kind, message }
    }

    /// 内存分配失败
    pub const fn out_of_memory(message: &'static str) -> Self {
        Self::new(ErrorKind::OutOfMemory, message)
    }

    /// 获取错误类型
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// 获取错误消息
    pub const fn message(&self) -> &'static str {
        self.message
    }

    /// 映射为块层惯用的负 errno
    pub const fn errno(&self) -> i32 {
        match self.kind {
            ErrorKind::Io => -5,
            ErrorKind::InvalidInput | ErrorKind::InvalidState | ErrorKind::DrainFailed => -22,
            ErrorKind::AlreadyExists | ErrorKind::AlreadyCached => -17,
            ErrorKind::NotFound => -2,
            ErrorKind::Busy => -16,
            ErrorKind::Unsupported => -95,
            ErrorKind::OutOfMemory => -12,
            ErrorKind::DeviceFailed | ErrorKind::Degraded => -19,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

/// Result 类型别名
pub type Result<T> = core::result::Result<T, Error>;
