//! 拦截层配置

use core::time::Duration;

use crate::consts::{DEFAULT_IO_CONTEXT_POOL, DEFAULT_SHARD_COUNT, FINISH_DIRTY_RETRY_COUNT};
use crate::error::{Error, ErrorKind, Result};

/// 拦截层配置
///
/// 所有等待都是"休眠后复查"的有界轮询，间隔由这里的字段决定。
#[derive(Debug, Clone)]
pub struct TtcConfig {
    /// 注册表分片数
    pub shard_count: usize,
    /// 激活后发出屏障刷新前的沉淀延迟
    pub settle_delay: Duration,
    /// 停用时等待在途 I/O 的轮询间隔
    pub deactivate_poll: Duration,
    /// 编辑静默时等待在途 I/O 的轮询间隔
    pub quiesce_poll: Duration,
    /// 重启处理时等待在途 I/O / 编辑的轮询间隔
    pub reboot_poll: Duration,
    /// 提交中途失败后等待已发出传输的轮询间隔
    pub submit_error_poll: Duration,
    /// 脏块排空重试次数
    pub drain_retry_count: u32,
    /// 轮询多少次后记录一次"仍在等待"告警
    pub stuck_drain_warn_polls: u32,
    /// 异步完成跟踪器池大小
    pub io_context_pool_size: usize,
    /// 强制热启动语义（重启时不排空冷启动缓存的脏块）
    pub force_warm_boot: bool,
}

impl Default for TtcConfig {
    fn default() -> Self {
        Self {
            shard_count: DEFAULT_SHARD_COUNT,
            settle_delay: Duration::from_millis(1),
            deactivate_poll: Duration::from_millis(100),
            quiesce_poll: Duration::from_millis(1),
            reboot_poll: Duration::from_millis(10),
            submit_error_poll: Duration::from_millis(1),
            drain_retry_count: FINISH_DIRTY_RETRY_COUNT,
            stuck_drain_warn_polls: 50,
            io_context_pool_size: DEFAULT_IO_CONTEXT_POOL,
            force_warm_boot: false,
        }
    }
}

impl TtcConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "shard_count must be non-zero"));
        }
        if self.io_context_pool_size == 0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "io_context_pool_size must be non-zero",
            ));
        }
        Ok(())
    }
}
