//! 调用方取消令牌。
//!
//! # 教案式注释
//! - **意图 (Why)**：阻塞中的调用需要在“调用方已放弃”时尽快返回，但已经开始的发送
//!   不能被打断；因此取消是一个协作式查询，由引擎在每个挂起点自行检查。
//! - **逻辑 (How)**：克隆共享同一个 `AtomicBool`，`cancel` 以 CAS 保证只有首次调用返回 `true`；
//!   引擎在等待点以 `CANCELLATION_POLL_INTERVAL` 为间隔轮询。
//! - **契约 (What)**：令牌只在挂载为“可中断”时生效，见 `MountOptions::interruptible`。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// 取消轮询间隔。
pub(crate) const CANCELLATION_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// 协作式取消令牌。
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    inner: Arc<AtomicBool>,
}

impl Cancellation {
    /// 创建处于“未取消”状态的取消令牌。
    pub fn new() -> Self {
        Self::default()
    }

    /// 查询当前是否已被标记取消。
    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::Acquire)
    }

    /// 将当前令牌标记为取消。
    ///
    /// 返回值为 `true` 表示本次调用首次触发取消；返回 `false` 表示之前已被取消。
    pub fn cancel(&self) -> bool {
        self.inner
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
