//! 单次调用的完整生命周期：登记、首发、等待、注销与结果映射。
//!
//! # 教案式注释
//! - **意图 (Why)**：调用方只看到“一个请求进、一个结果出”；中间的准入、重发、重连与
//!   TRYLATER 退避都在这里被吸收。
//! - **逻辑 (How)**：
//!   1. 强制卸载中直接拒绝；
//!   2. 以新 xid 编帧并登记，快照重试预算（软挂载取 `retrans`，硬挂载取上限 + 1）；
//!   3. 已连接且准入（流链路总是准入）则在单写者锁下立即发送，否则留给定时器；
//!   4. 等待：面向连接的链路先在写锁下完成“重连 / 重发”，再阻塞等待自己的请求被唤醒，
//!      每次醒来都重新检查谓词；
//!   5. 注销（等待定时器的锁外重发结束），归还窗口占用；
//!   6. 解析应答信封：TRYLATER 整次重试，ESTALE 触发缓存清理，其余原样返回。
//! - **契约 (What)**：瞬时传输错误从不直达调用方；取消只在挂载可中断时生效，
//!   且不会打断已经开始的发送。

use crate::congestion::{BACKOFF, MAX_REXMIT};
use crate::contract::{CANCELLATION_POLL_INTERVAL, Cancellation};
use crate::error::{ErrorCategory, RpcError};
use crate::registry::{RequestHandle, RequestState};
use crate::reply::{NFSERR_STALE, NFSERR_TRYLATER, RpcCall, RpcReply, decode_reply, encode_call};
use crate::session::{MountSession, SessionInner, WriterGuard};
use crate::status::bump;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

/// 等待谓词的判定结果。
enum WaitState {
    Replied,
    Terminated,
    MustResend,
    Pending,
}

impl MountSession {
    /// 发起一次 RPC 调用并等待结果。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：
    ///   - 成功返回匹配 xid 的应答；
    ///   - 软挂载预算耗尽返回 [`RpcError::TimedOut`]；可中断挂载上取消返回
    ///     [`RpcError::Cancelled`]；强制卸载返回 [`RpcError::Unmounting`]；
    ///   - NFSv3 的 TRYLATER 在内部按退避表睡眠后整次重发，不会返回给调用方。
    /// - **注意事项 (Trade-offs)**：TRYLATER 的等待没有上限，只能被取消或卸载打断。
    pub async fn issue_call(&self, call: RpcCall, cancel: &Cancellation) -> Result<RpcReply, RpcError> {
        let inner = &self.inner;
        let mut try_later_delay = inner.options.try_later_delay();
        let mut try_later_step = 0usize;
        loop {
            if inner.is_unmounting() {
                return Err(RpcError::Unmounting);
            }
            let message = inner.transmit_and_wait(&call, cancel).await?;
            match decode_reply(message, inner.options.nfs_version) {
                Err(RpcError::Application {
                    status: NFSERR_TRYLATER,
                    ..
                }) if inner.options.nfs_version == 3 => {
                    debug!(server = %inner.options.server, delay = ?try_later_delay, "server asked to try later");
                    inner.interruptible_sleep(try_later_delay, cancel).await?;
                    try_later_delay = try_later_delay.saturating_mul(BACKOFF[try_later_step] as u32);
                    if try_later_step < BACKOFF.len() - 1 {
                        try_later_step += 1;
                    }
                }
                Err(err) if err.status() == Some(NFSERR_STALE) => {
                    call.stale_handle();
                    return Err(err);
                }
                other => return other,
            }
        }
    }

    /// 终止本会话的全部在途请求，并在有限时间内等待它们退出。
    ///
    /// 等待 `drain_attempts × drain_interval` 后仍有请求未注销则返回 [`RpcError::Busy`]。
    pub async fn cancel_all_for_session(&self) -> Result<(), RpcError> {
        let inner = &self.inner;
        {
            let mut registry = inner.table.lock();
            let mut congestion = inner.congestion.lock();
            registry.for_each_mut(|_, state| {
                if state.reply.is_none() && !state.flags.soft_term {
                    state.flags.soft_term = true;
                    if state.flags.sent {
                        state.flags.sent = false;
                        congestion.release_send();
                    }
                    state.wake();
                }
            });
        }
        for _ in 0..inner.options.drain_attempts {
            if inner.table.len() == 0 {
                return Ok(());
            }
            tokio::time::sleep(inner.options.drain_interval()).await;
        }
        match inner.table.len() {
            0 => Ok(()),
            outstanding => Err(RpcError::Busy { outstanding }),
        }
    }

    /// 强制卸载：拒绝新调用、终止在途调用、等待排空并断开连接。
    pub async fn force_unmount(&self) -> Result<(), RpcError> {
        self.begin_forced_unmount();
        let drained = self.cancel_all_for_session().await;
        self.disconnect().await;
        drained
    }
}

impl SessionInner {
    /// 一次完整的“登记 → 发送 → 等待 → 注销”，返回原始应答消息。
    async fn transmit_and_wait(&self, call: &RpcCall, cancel: &Cancellation) -> Result<Bytes, RpcError> {
        let retry = if self.options.soft {
            self.options.retrans
        } else {
            MAX_REXMIT + 1
        };
        let record_marking = self.kind.uses_record_marking();
        let next_notice = Instant::now() + self.options.tprintf_initial_delay();
        let (handle, xid) = self.table.enroll(|xid| {
            RequestState::new(
                xid,
                encode_call(xid, call.body(), record_marking),
                call.class(),
                retry,
                cancel.clone(),
                next_notice,
            )
        });
        bump(&self.stats.requests);

        let outcome = match self.initial_send(handle, cancel).await {
            Ok(()) => self.await_reply(handle, cancel).await,
            Err(err) => Err(err),
        };

        let state = self
            .table
            .remove_with(handle, |state| {
                if state.flags.sent {
                    self.congestion.lock().release_send();
                }
            })
            .await;
        outcome?;
        let state = state.ok_or(RpcError::Malformed("request vanished from registry"))?;
        let message = state
            .reply
            .ok_or(RpcError::Malformed("request settled without a reply"))?;
        self.status.report_up(xid, state.flags.reported_down);
        Ok(message)
    }

    /// 首发：已连接且准入时立即发送，否则置为延迟状态交给定时器。
    async fn initial_send(&self, handle: RequestHandle, cancel: &Cancellation) -> Result<(), RpcError> {
        let admitted = self.is_connected()
            && self
                .congestion
                .lock()
                .admit(self.kind, self.options.dumb_timer);
        if !admitted {
            if let Some(state) = self.table.lock().get_mut(handle) {
                state.rtt = -1;
            }
            return Ok(());
        }

        let mut writer = self.lock_writer(handle, cancel).await?;
        let sent = self.send_request(&mut writer, handle, cancel).await;
        drop(writer);
        match sent {
            Ok(()) => {
                let mut registry = self.table.lock();
                if let Some(state) = registry.get_mut(handle)
                    && state.reply.is_none()
                    && !state.flags.sent
                    && !state.flags.must_resend
                {
                    state.flags.sent = true;
                    self.congestion.lock().charge_send();
                }
                Ok(())
            }
            Err(RpcError::Transport(err)) if err.category() != ErrorCategory::NonRetryable => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// 在单写者锁下发送请求；没有链路时仅标记需重发。
    async fn send_request(
        &self,
        writer: &mut WriterGuard<'_>,
        handle: RequestHandle,
        cancel: &Cancellation,
    ) -> Result<(), RpcError> {
        if let Some(err) = self.request_interruption(handle, cancel) {
            return Err(err);
        }
        let (xid, wire) = {
            let mut registry = self.table.lock();
            let Some(state) = registry.get_mut(handle) else {
                return Ok(());
            };
            if writer.is_none() {
                state.flags.must_resend = true;
                return Ok(());
            }
            state.flags.must_resend = false;
            (state.xid, state.wire.clone())
        };
        let Some(sender) = writer.as_mut() else {
            return Ok(());
        };
        match sender.send(&wire).await {
            Ok(()) => {
                // 延迟发出的请求从真正上线时开始计时。
                if let Some(state) = self.table.lock().get_mut(handle)
                    && state.rtt < 0
                {
                    state.rtt = 0;
                }
                Ok(())
            }
            Err(err) => {
                if !matches!(
                    err.category(),
                    ErrorCategory::BrokenPipe | ErrorCategory::NoBuffers
                ) {
                    warn!(server = %self.options.server, xid, error = %err, "rpc send failed");
                }
                if let Some(state) = self.table.lock().get_mut(handle) {
                    state.flags.must_resend = true;
                }
                Err(RpcError::Transport(err))
            }
        }
    }

    /// 等待直到请求有应答或被终止。
    async fn await_reply(&self, handle: RequestHandle, cancel: &Cancellation) -> Result<(), RpcError> {
        let waker = self.waker_of(handle)?;
        let connection_oriented = self.kind.is_connection_oriented();
        loop {
            if connection_oriented {
                let mut writer = self.lock_writer(handle, cancel).await?;
                self.service_connection(&mut writer, handle, cancel).await?;
            }
            loop {
                match self.wait_state(handle) {
                    WaitState::Replied => return Ok(()),
                    WaitState::Terminated => return Err(self.termination_error()),
                    WaitState::MustResend if connection_oriented => break,
                    WaitState::MustResend | WaitState::Pending => {}
                }
                if let Some(err) = self.interruption(cancel) {
                    return Err(err);
                }
                if self.options.interruptible {
                    tokio::select! {
                        _ = waker.notified() => {}
                        _ = tokio::time::sleep(CANCELLATION_POLL_INTERVAL) => {}
                    }
                } else {
                    waker.notified().await;
                }
            }
        }
    }

    /// 持写锁处理面向连接链路的“需重连 / 需重发”，直到本请求不再需要发送。
    async fn service_connection(
        &self,
        writer: &mut WriterGuard<'_>,
        handle: RequestHandle,
        cancel: &Cancellation,
    ) -> Result<(), RpcError> {
        loop {
            match self.wait_state(handle) {
                WaitState::Replied => return Ok(()),
                WaitState::Terminated => return Err(self.termination_error()),
                WaitState::MustResend | WaitState::Pending => {}
            }
            let (connected, force_reconnect) = self.link_snapshot();
            if !connected || force_reconnect {
                self.reconnect(writer, handle, cancel).await?;
                continue;
            }
            if !matches!(self.wait_state(handle), WaitState::MustResend) {
                return Ok(());
            }
            if let Some(state) = self.table.lock().get_mut(handle)
                && state.rtt >= 0
            {
                // 重发的副本不参与 RTT 采样。
                state.flags.timing = false;
            }
            bump(&self.stats.retries);
            match self.send_request(writer, handle, cancel).await {
                Ok(()) => {}
                Err(RpcError::Transport(err)) => {
                    debug!(error = %err, "resend failed, reconnecting");
                    self.reconnect(writer, handle, cancel).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// 获取单写者锁；等待期间可被终止、取消或卸载打断。
    async fn lock_writer(
        &self,
        handle: RequestHandle,
        cancel: &Cancellation,
    ) -> Result<WriterGuard<'_>, RpcError> {
        tokio::select! {
            biased;
            guard = self.writer.lock() => Ok(guard),
            err = self.request_interrupted(handle, cancel) => Err(err),
        }
    }

    pub(crate) async fn request_interrupted(&self, handle: RequestHandle, cancel: &Cancellation) -> RpcError {
        loop {
            if let Some(err) = self.request_interruption(handle, cancel) {
                return err;
            }
            tokio::time::sleep(CANCELLATION_POLL_INTERVAL).await;
        }
    }

    fn request_interruption(&self, handle: RequestHandle, cancel: &Cancellation) -> Option<RpcError> {
        let terminated = self
            .table
            .lock()
            .get(handle)
            .is_some_and(|state| state.flags.soft_term);
        if terminated {
            return Some(self.termination_error());
        }
        self.interruption(cancel)
    }

    fn termination_error(&self) -> RpcError {
        if self.is_unmounting() {
            RpcError::Unmounting
        } else {
            RpcError::TimedOut
        }
    }

    fn wait_state(&self, handle: RequestHandle) -> WaitState {
        let registry = self.table.lock();
        match registry.get(handle) {
            None => WaitState::Terminated,
            Some(state) if state.reply.is_some() => WaitState::Replied,
            Some(state) if state.flags.soft_term => WaitState::Terminated,
            Some(state) if state.flags.must_resend => WaitState::MustResend,
            Some(_) => WaitState::Pending,
        }
    }

    fn waker_of(&self, handle: RequestHandle) -> Result<Arc<Notify>, RpcError> {
        self.table
            .lock()
            .get(handle)
            .map(|state| state.waker.clone())
            .ok_or(RpcError::Malformed("request vanished from registry"))
    }
}
