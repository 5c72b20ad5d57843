//! 在途请求注册表。
//!
//! # 教案式注释
//! - **意图 (Why)**：调用路径、接收路径与重传定时器三方共享同一批在途请求；
//!   需要一个按插入顺序遍历、按 xid 查找、可安全删除的容器。
//! - **逻辑 (How)**：
//!   - [`Registry`] 是带代际号的槽位数组，[`RequestHandle`] 记录 `(index, generation)`，
//!     槽位复用后旧句柄自动失效；
//!   - `order` 队列保存插入顺序，定时器据此“最老优先”地扫描；
//!   - [`PendingTable`] 用一把短临界区的互斥锁包裹注册表，并在“空 ↔ 非空”切换时
//!     挂起或恢复定时器。
//! - **契约 (What)**：
//!   - 请求只由发起它的调用路径删除，删除会等待 `rexmit_in_progress` 清零；
//!   - 锁内不做任何传输 I/O；锁序为“注册表 → 拥塞状态”。

use crate::congestion::TimerClass;
use crate::contract::Cancellation;
use crate::timer::TimerSwitch;
use crate::xid::XidAllocator;
use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;

/// 请求状态位。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct RequestFlags {
    /// 已占用拥塞窗口。
    pub sent: bool,
    /// 下一次机会需要重发（面向连接链路）。
    pub must_resend: bool,
    /// 应答到达时采样 RTT。
    pub timing: bool,
    /// 已被定时器或强制卸载终止。
    pub soft_term: bool,
    /// 定时器正在锁外重发该请求。
    pub rexmit_in_progress: bool,
    /// 最近一次定时器重发失败。
    pub resend_error: bool,
    /// 已输出过“服务端无响应”提示。
    pub reported_down: bool,
}

/// 单个在途请求。
#[derive(Debug)]
pub(crate) struct RequestState {
    pub xid: u32,
    /// 原样重发的完整线上字节（含记录标记）。
    pub wire: Bytes,
    pub class: TimerClass,
    /// 已流逝节拍；-1 表示尚未发出或正在发送。
    pub rtt: i32,
    pub rexmit: u32,
    pub retry: u32,
    pub flags: RequestFlags,
    pub reply: Option<Bytes>,
    /// 最早可以再次输出“无响应”提示的时刻。
    pub next_notice: Instant,
    pub cancel: Cancellation,
    pub waker: Arc<Notify>,
}

impl RequestState {
    pub(crate) fn new(
        xid: u32,
        wire: Bytes,
        class: TimerClass,
        retry: u32,
        cancel: Cancellation,
        next_notice: Instant,
    ) -> Self {
        Self {
            xid,
            wire,
            class,
            rtt: 0,
            rexmit: 0,
            retry,
            flags: RequestFlags {
                timing: class.is_timed(),
                ..RequestFlags::default()
            },
            reply: None,
            next_notice,
            cancel,
            waker: Arc::new(Notify::new()),
        }
    }

    /// 请求是否已结束等待（有应答或被终止）。
    pub(crate) fn is_settled(&self) -> bool {
        self.reply.is_some() || self.flags.soft_term
    }

    /// 唤醒发起该请求的调用方。
    pub(crate) fn wake(&self) {
        self.waker.notify_one();
    }
}

/// 注册表句柄。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct RequestHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    entry: Option<RequestState>,
}

/// 带代际句柄的插入有序槽位表。
#[derive(Debug, Default)]
pub(crate) struct Registry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    order: VecDeque<RequestHandle>,
}

impl Registry {
    pub(crate) fn insert(&mut self, state: RequestState) -> RequestHandle {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.entry = Some(state);
        let handle = RequestHandle {
            index,
            generation: slot.generation,
        };
        self.order.push_back(handle);
        handle
    }

    pub(crate) fn get(&self, handle: RequestHandle) -> Option<&RequestState> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    pub(crate) fn get_mut(&mut self, handle: RequestHandle) -> Option<&mut RequestState> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_mut())
    }

    pub(crate) fn remove(&mut self, handle: RequestHandle) -> Option<RequestState> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let state = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        if let Some(position) = self.order.iter().position(|queued| *queued == handle) {
            self.order.remove(position);
        }
        Some(state)
    }

    pub(crate) fn find_by_xid(&self, xid: u32) -> Option<RequestHandle> {
        self.order
            .iter()
            .copied()
            .find(|handle| self.get(*handle).is_some_and(|state| state.xid == xid))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    /// 按插入顺序拍下句柄快照。
    pub(crate) fn handles(&self) -> Vec<RequestHandle> {
        self.order.iter().copied().collect()
    }

    /// 按插入顺序逐个修改请求。
    pub(crate) fn for_each_mut(&mut self, mut visit: impl FnMut(RequestHandle, &mut RequestState)) {
        for handle in self.order.iter().copied() {
            if let Some(slot) = self.slots.get_mut(handle.index as usize)
                && let Some(state) = slot.entry.as_mut()
            {
                visit(handle, state);
            }
        }
    }
}

/// 会话级的注册表及其同步外壳。
#[derive(Debug)]
pub(crate) struct PendingTable {
    registry: Mutex<Registry>,
    rexmit_done: Notify,
    timer: Arc<TimerSwitch>,
    xids: XidAllocator,
}

impl PendingTable {
    pub(crate) fn new(timer: Arc<TimerSwitch>, xids: XidAllocator) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            rexmit_done: Notify::new(),
            timer,
            xids,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock()
    }

    /// 以新分配的唯一 xid 构造并登记请求；注册表由空变为非空时启动定时器。
    pub(crate) fn enroll(&self, build: impl FnOnce(u32) -> RequestState) -> (RequestHandle, u32) {
        let mut registry = self.registry.lock();
        let xid = loop {
            let candidate = self.xids.next_candidate();
            if registry.find_by_xid(candidate).is_none() {
                break candidate;
            }
        };
        let was_empty = registry.is_empty();
        let handle = registry.insert(build(xid));
        if was_empty {
            self.timer.arm();
        }
        (handle, xid)
    }

    /// 注销请求；若定时器正在锁外重发它，则等待重发结束。
    ///
    /// `finalize` 在同一临界区内执行，用于归还窗口占用等需要与删除原子完成的记账。
    pub(crate) async fn remove_with(
        &self,
        handle: RequestHandle,
        finalize: impl FnOnce(&RequestState),
    ) -> Option<RequestState> {
        let mut finalize = Some(finalize);
        loop {
            let notified = self.rexmit_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut registry = self.registry.lock();
                let busy = registry.get(handle)?.flags.rexmit_in_progress;
                if !busy {
                    let state = registry.remove(handle)?;
                    if let Some(finalize) = finalize.take() {
                        finalize(&state);
                    }
                    if registry.is_empty() {
                        self.timer.disarm();
                    }
                    return Some(state);
                }
            }
            notified.await;
        }
    }

    /// 定时器完成锁外重发后调用，唤醒等待删除的调用方。
    pub(crate) fn retransmit_finished(&self) {
        self.rexmit_done.notify_waiters();
    }

    pub(crate) fn len(&self) -> usize {
        self.registry.lock().len()
    }
}
