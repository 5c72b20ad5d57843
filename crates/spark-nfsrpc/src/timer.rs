//! 周期性重传定时器。
//!
//! # 教案式注释
//! - **意图 (Why)**：数据报会丢、流会卡；必须有一个独立于调用方的时钟源，按 RTT 估计判定
//!   超时、升级退避、在软挂载下终止请求，并在窗口允许时直接重发数据报。
//! - **逻辑 (How)**：
//!   - 每个会话一个 Tokio 任务，只持有会话的 `Weak` 引用；注册表为空时在 [`TimerSwitch`]
//!     上休眠，非空时每个节拍扫描一次；
//!   - 扫描按插入顺序逐个处理：判定在注册表锁内完成，数据报重发在锁外进行，
//!     期间以 `rexmit_in_progress` 阻止该请求被删除；
//!   - 重发需要的写锁只 `try_lock`，拿不到就留待下一个节拍。
//! - **契约 (What)**：定时器从不等待任何调用方；一次扫描内新登记的请求留到下一节拍处理。

use crate::congestion::MAX_REXMIT;
use crate::error::TransportError;
use crate::registry::{RequestHandle, RequestState};
use crate::session::SessionInner;
use crate::status::bump;
use bytes::Bytes;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// 定时器启停开关：注册表“空 → 非空”时 `arm`，“非空 → 空”时 `disarm`。
#[derive(Debug, Default)]
pub(crate) struct TimerSwitch {
    armed: AtomicBool,
    wake: Notify,
}

impl TimerSwitch {
    pub(crate) fn arm(&self) {
        if !self.armed.swap(true, Ordering::AcqRel) {
            self.wake.notify_one();
        }
    }

    pub(crate) fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    async fn wait_armed(&self) {
        while !self.is_armed() {
            self.wake.notified().await;
        }
    }
}

/// 定时器任务主体。
pub(crate) async fn run(session: Weak<SessionInner>, switch: std::sync::Arc<TimerSwitch>, period: Duration) {
    loop {
        switch.wait_armed().await;
        tokio::time::sleep(period).await;
        let Some(session) = session.upgrade() else {
            return;
        };
        if switch.is_armed() {
            session.on_tick().await;
        }
    }
}

/// 一个请求在本节拍内的判定结果。
enum TickAction {
    Skip,
    Resend(Bytes),
}

impl SessionInner {
    /// 扫描一次注册表。
    pub(crate) async fn on_tick(&self) {
        let now = Instant::now();
        let connected = self.is_connected();
        let unmounting = self.is_unmounting();
        let mut notices = Vec::new();

        let handles = self.table.lock().handles();
        for handle in handles {
            let action = {
                let mut registry = self.table.lock();
                match registry.get_mut(handle) {
                    Some(state) => self.judge(state, now, connected, unmounting, &mut notices),
                    None => TickAction::Skip,
                }
            };
            if let TickAction::Resend(wire) = action {
                let outcome = self.resend_datagram(&wire).await;
                self.finish_resend(handle, outcome);
            }
        }

        for xid in notices {
            self.status.report_down(xid);
        }
    }

    /// 注册表锁内的逐请求判定。
    fn judge(
        &self,
        state: &mut RequestState,
        now: Instant,
        connected: bool,
        unmounting: bool,
        notices: &mut Vec<u32>,
    ) -> TickAction {
        let options = &self.options;
        if state.is_settled() || unmounting {
            return TickAction::Skip;
        }
        if options.interruptible && state.cancel.is_cancelled() {
            return TickAction::Skip;
        }
        if options.tprintf_initial_delay_secs != 0
            && (state.rexmit > 2 || state.flags.resend_error)
            && now > state.next_notice
        {
            state.next_notice = now + options.tprintf_delay();
            state.flags.reported_down = true;
            notices.push(state.xid);
        }

        let mut congestion = self.congestion.lock();
        if state.rtt >= 0 {
            state.rtt += 1;
            if state.rtt <= congestion.compute_timeout(state.class, options.dumb_timer) {
                return TickAction::Skip;
            }
            congestion.note_timeout();
        }

        if state.rexmit >= state.retry {
            bump(&self.stats.timeouts);
            state.flags.soft_term = true;
            if state.flags.sent {
                state.flags.sent = false;
                congestion.release_send();
            }
            state.wake();
            return TickAction::Skip;
        }

        if self.kind.is_connection_oriented() {
            state.rexmit = (state.rexmit + 1).min(MAX_REXMIT);
            state.rtt = 0;
            state.flags.timing = false;
            state.flags.must_resend = true;
            state.wake();
            return TickAction::Skip;
        }

        if !connected {
            return TickAction::Skip;
        }
        state.rtt = -1;
        if options.dumb_timer || state.flags.sent || congestion.has_room() {
            state.flags.rexmit_in_progress = true;
            TickAction::Resend(state.wire.clone())
        } else {
            TickAction::Skip
        }
    }

    /// 锁外重发；`Ok(false)` 表示本节拍没有发送机会。
    async fn resend_datagram(&self, wire: &Bytes) -> Result<bool, TransportError> {
        let Ok(mut writer) = self.writer.try_lock() else {
            return Ok(false);
        };
        let Some(sender) = writer.as_mut() else {
            return Ok(false);
        };
        if !sender.has_send_space(wire.len()) {
            return Ok(false);
        }
        sender.send(wire).await.map(|()| true)
    }

    fn finish_resend(&self, handle: RequestHandle, outcome: Result<bool, TransportError>) {
        {
            let mut registry = self.table.lock();
            if let Some(state) = registry.get_mut(handle) {
                state.flags.rexmit_in_progress = false;
                match outcome {
                    Ok(false) => {}
                    Err(error) => {
                        debug!(xid = state.xid, %error, "timer resend failed");
                        state.flags.resend_error = true;
                    }
                    Ok(true) => {
                        state.flags.resend_error = false;
                        let mut congestion = self.congestion.lock();
                        if state.flags.sent {
                            state.flags.timing = false;
                            state.rexmit = (state.rexmit + 1).min(MAX_REXMIT);
                            congestion.on_retransmit();
                            bump(&self.stats.retries);
                        } else {
                            state.flags.sent = true;
                            congestion.charge_send();
                        }
                        state.rtt = 0;
                    }
                }
            }
        }
        self.table.retransmit_finished();
    }
}
