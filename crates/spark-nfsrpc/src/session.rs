//! 挂载会话：连接生命周期、接收路径与重连协议。
//!
//! # 教案式注释
//! - **意图 (Why)**：连接可以断开重建，但会话（注册表、拥塞估计、统计）必须跨越重连存续，
//!   因此会话持有“可替换的链路”，而不是链路本身。
//! - **逻辑 (How)**：
//!   - 发送半部放在 `tokio::sync::Mutex` 中，充当单写者锁，同时也是“谁来重连”的仲裁者；
//!   - `link` 是一把短锁，保存“已连接 / 需重连 / 代际号”快照；
//!   - 每次建连都会派生一个接收任务，独占接收半部，把应答投递到注册表；
//!     代际号变化或会话释放后任务自行退出。
//! - **契约 (What)**：
//!   - 断开是幂等的；重连成功后清除需重连标记，并将全部在途请求标记为需重发；
//!   - 锁序：单写者锁 → 注册表 → 拥塞状态；`link` 与重组器锁从不与其他短锁嵌套持有。
//! - **注意事项 (Trade-offs)**：接收任务与定时器都只持有 `Weak`，会话的最后一个句柄释放时
//!   它们在下一次唤醒时退出，`Drop` 也会主动中止它们。

use crate::config::MountOptions;
use crate::congestion::{CongestionSnapshot, CongestionState};
use crate::contract::Cancellation;
use crate::error::{ConfigError, ErrorCategory, RpcError, TransportError};
use crate::reassembly::{RecordReassembler, normalize_alignment};
use crate::registry::{PendingTable, RequestHandle};
use crate::status::{
    ConnectivityObserver, LogObserver, ServerStatus, SessionStats, StatsCounters, bump,
};
use crate::timer::{self, TimerSwitch};
use crate::transport::{Connector, Link, LinkReceiver, LinkSender, TransportKind};
use crate::xid::XidAllocator;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub(crate) type WriterSlot = Option<Box<dyn LinkSender>>;
pub(crate) type WriterGuard<'a> = tokio::sync::MutexGuard<'a, WriterSlot>;

const MSG_TYPE_REPLY: u32 = 1;

#[derive(Debug, Default)]
pub(crate) struct LinkState {
    pub connected: bool,
    pub force_reconnect: bool,
    pub generation: u64,
    /// 成功建连的累计次数。
    pub established: u64,
}

/// 会话内部状态，由 [`MountSession`] 以 `Arc` 共享。
pub(crate) struct SessionInner {
    pub(crate) options: MountOptions,
    pub(crate) kind: TransportKind,
    connector: Arc<dyn Connector>,
    me: Weak<SessionInner>,
    pub(crate) table: PendingTable,
    pub(crate) congestion: Mutex<CongestionState>,
    reassembler: Mutex<RecordReassembler>,
    link: Mutex<LinkState>,
    pub(crate) writer: tokio::sync::Mutex<WriterSlot>,
    receiver_task: Mutex<Option<JoinHandle<()>>>,
    timer_task: Mutex<Option<JoinHandle<()>>>,
    pub(crate) stats: StatsCounters,
    pub(crate) status: ServerStatus,
    unmounting: AtomicBool,
}

/// 一个挂载点对应的 RPC 会话。
///
/// # 教案式注释
/// - **意图 (Why)**：调用方只需持有会话句柄即可并发发起调用；克隆句柄共享同一会话。
/// - **契约 (What)**：必须在 Tokio 运行时中构造，构造时派生重传定时器任务。
#[derive(Clone)]
pub struct MountSession {
    pub(crate) inner: Arc<SessionInner>,
}

/// [`MountSession`] 构造器。
pub struct MountSessionBuilder {
    options: MountOptions,
    connector: Arc<dyn Connector>,
    observer: Arc<dyn ConnectivityObserver>,
    first_xid: Option<u32>,
}

impl MountSessionBuilder {
    /// 替换缺省的日志观察者。
    pub fn observer(mut self, observer: Arc<dyn ConnectivityObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// 固定首个 xid，便于测试复现。
    pub fn first_xid(mut self, xid: u32) -> Self {
        self.first_xid = Some(xid);
        self
    }

    /// 构造会话但不建连：面向连接的链路会在首个调用中自动建连，数据报会话需显式 `connect`。
    pub fn build(self) -> Result<MountSession, RpcError> {
        self.options.validate()?;
        let kind = self.connector.kind();
        if kind != self.options.transport {
            return Err(ConfigError::invalid(
                "transport",
                format!("connector speaks {kind}, options ask for {}", self.options.transport),
            )
            .into());
        }

        let switch = Arc::new(TimerSwitch::default());
        let xids = match self.first_xid {
            Some(first) => XidAllocator::starting_at(first),
            None => XidAllocator::seeded(),
        };
        let options = self.options;
        let observer = self.observer;
        let connector = self.connector;
        let timer_switch = switch.clone();
        let inner = Arc::new_cyclic(|me| SessionInner {
            kind,
            connector,
            me: me.clone(),
            table: PendingTable::new(timer_switch, xids),
            congestion: Mutex::new(CongestionState::new(options.timeo_ticks)),
            reassembler: Mutex::new(RecordReassembler::new(options.max_record_len)),
            link: Mutex::new(LinkState::default()),
            writer: tokio::sync::Mutex::new(None),
            receiver_task: Mutex::new(None),
            timer_task: Mutex::new(None),
            stats: StatsCounters::default(),
            status: ServerStatus::new(options.server.clone(), observer),
            unmounting: AtomicBool::new(false),
            options,
        });

        let period = inner.options.tick();
        let task = tokio::spawn(timer::run(Arc::downgrade(&inner), switch, period));
        *inner.timer_task.lock() = Some(task);
        Ok(MountSession { inner })
    }

    /// 构造会话并完成首次建连。
    pub async fn mount(self) -> Result<MountSession, RpcError> {
        let session = self.build()?;
        session.connect().await?;
        Ok(session)
    }
}

impl MountSession {
    pub fn builder(options: MountOptions, connector: impl Connector) -> MountSessionBuilder {
        MountSessionBuilder {
            options,
            connector: Arc::new(connector),
            observer: Arc::new(LogObserver),
            first_xid: None,
        }
    }

    pub fn options(&self) -> &MountOptions {
        &self.inner.options
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.inner.kind
    }

    /// 建立连接；已连接时直接返回，链路已失效时先拆除旧链路。
    pub async fn connect(&self) -> Result<(), RpcError> {
        let mut writer = self.inner.writer.lock().await;
        if self.inner.is_connected() {
            return Ok(());
        }
        if writer.is_some() {
            self.inner.disconnect_locked(&mut writer).await;
        }
        self.inner
            .connect_locked(&mut writer)
            .await
            .map_err(RpcError::Transport)
    }

    /// 断开连接；重复调用无害。
    pub async fn disconnect(&self) {
        let mut writer = self.inner.writer.lock().await;
        self.inner.disconnect_locked(&mut writer).await;
    }

    /// 当前是否持有可用链路。
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// 开始强制卸载：新调用立即失败，在途调用在下一个检查点观察到终止。
    pub fn begin_forced_unmount(&self) {
        self.inner.unmounting.store(true, Ordering::Release);
        self.inner.table.lock().for_each_mut(|_, state| state.wake());
    }

    pub fn is_unmounting(&self) -> bool {
        self.inner.is_unmounting()
    }

    /// 服务端当前是否处于“无响应”状态。
    pub fn is_server_not_responding(&self) -> bool {
        self.inner.status.is_not_responding()
    }

    pub fn stats(&self) -> SessionStats {
        self.inner.stats.snapshot()
    }

    pub fn congestion(&self) -> CongestionSnapshot {
        self.inner.congestion.lock().snapshot()
    }

    /// 在途请求数量。
    pub fn outstanding(&self) -> usize {
        self.inner.table.len()
    }
}

impl fmt::Debug for MountSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountSession")
            .field("server", &self.inner.options.server)
            .field("transport", &self.inner.kind)
            .field("connected", &self.inner.is_connected())
            .field("outstanding", &self.inner.table.len())
            .finish()
    }
}

impl SessionInner {
    pub(crate) fn is_connected(&self) -> bool {
        self.link.lock().connected
    }

    pub(crate) fn is_unmounting(&self) -> bool {
        self.unmounting.load(Ordering::Acquire)
    }

    /// `(已连接, 需重连)` 快照。
    pub(crate) fn link_snapshot(&self) -> (bool, bool) {
        let link = self.link.lock();
        (link.connected, link.force_reconnect)
    }

    fn is_current(&self, generation: u64) -> bool {
        let link = self.link.lock();
        link.connected && link.generation == generation && !link.force_reconnect
    }

    /// 持单写者锁建连：重置重组器与拥塞估计，安装发送半部并派生接收任务。
    pub(crate) async fn connect_locked(
        &self,
        writer: &mut WriterGuard<'_>,
    ) -> Result<(), TransportError> {
        let Link { sender, receiver } = self.connector.connect().await?;
        self.reassembler.lock().reset();
        self.congestion.lock().reset_on_connect();
        let generation = {
            let mut link = self.link.lock();
            link.generation += 1;
            link.established += 1;
            link.connected = true;
            link.generation
        };
        **writer = Some(sender);

        let task = tokio::spawn(receive_loop(self.me.clone(), receiver, generation));
        if let Some(previous) = self.receiver_task.lock().replace(task) {
            previous.abort();
        }
        debug!(server = %self.options.server, transport = %self.kind, generation, "connected");
        Ok(())
    }

    /// 持单写者锁断开；没有链路时什么也不做。
    pub(crate) async fn disconnect_locked(&self, writer: &mut WriterGuard<'_>) {
        {
            let mut link = self.link.lock();
            link.connected = false;
            link.generation += 1;
        }
        if let Some(task) = self.receiver_task.lock().take() {
            task.abort();
        }
        if let Some(mut sender) = writer.take() {
            sender.shutdown().await;
            debug!(server = %self.options.server, "disconnected");
        }
    }

    /// 重连协议：断开、循环建连、清除需重连标记、标记全部在途请求重发。
    ///
    /// 发起重连的请求被软终止、调用方取消或强制卸载时立即放弃。
    pub(crate) async fn reconnect(
        &self,
        writer: &mut WriterGuard<'_>,
        handle: RequestHandle,
        cancel: &Cancellation,
    ) -> Result<(), RpcError> {
        if self.link.lock().established > 0 {
            bump(&self.stats.reconnects);
        }
        self.disconnect_locked(writer).await;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let connected = tokio::select! {
                biased;
                err = self.request_interrupted(handle, cancel) => return Err(err),
                connected = self.connect_locked(writer) => connected,
            };
            match connected {
                Ok(()) => break,
                Err(err) if err.category() == ErrorCategory::NonRetryable => {
                    warn!(server = %self.options.server, error = %err, "reconnect aborted");
                    return Err(RpcError::Transport(err));
                }
                Err(err) => {
                    if let Some(limit) = self.options.reconnect_attempts
                        && attempts >= limit
                    {
                        return Err(RpcError::ReconnectFailed {
                            attempts,
                            last: err,
                        });
                    }
                    debug!(server = %self.options.server, attempts, error = %err, "reconnect attempt failed");
                    tokio::select! {
                        biased;
                        err = self.request_interrupted(handle, cancel) => return Err(err),
                        _ = tokio::time::sleep(self.options.reconnect_delay()) => {}
                    }
                }
            }
        }

        self.link.lock().force_reconnect = false;
        self.table.lock().for_each_mut(|_, state| {
            if !state.is_settled() {
                state.flags.must_resend = true;
                state.flags.timing = false;
                state.wake();
            }
        });
        info!(server = %self.options.server, attempts, "reconnected");
        Ok(())
    }

    /// 接收路径发现流损坏：标记需重连，并唤醒所有在途请求去重发。
    pub(crate) fn mark_for_reconnect(&self) {
        self.link.lock().force_reconnect = true;
        self.table.lock().for_each_mut(|_, state| {
            if !state.is_settled() {
                state.flags.must_resend = true;
                state.flags.timing = false;
                state.wake();
            }
        });
    }

    /// 数据报接收半部已关闭：链路视为断开，等待下一次 `connect` 重建。
    fn mark_link_lost(&self) {
        self.link.lock().connected = false;
    }

    /// 强制卸载与调用方取消的统一检查。
    pub(crate) fn interruption(&self, cancel: &Cancellation) -> Option<RpcError> {
        if self.is_unmounting() {
            Some(RpcError::Unmounting)
        } else if self.options.interruptible && cancel.is_cancelled() {
            Some(RpcError::Cancelled)
        } else {
            None
        }
    }

    /// 可被取消/卸载打断的睡眠。
    pub(crate) async fn interruptible_sleep(
        &self,
        duration: Duration,
        cancel: &Cancellation,
    ) -> Result<(), RpcError> {
        tokio::select! {
            biased;
            err = self.interrupted(cancel) => Err(err),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    async fn interrupted(&self, cancel: &Cancellation) -> RpcError {
        loop {
            if let Some(err) = self.interruption(cancel) {
                return err;
            }
            tokio::time::sleep(crate::contract::CANCELLATION_POLL_INTERVAL).await;
        }
    }

    /// 投递一条完整的 RPC 消息：按 xid 匹配在途请求，更新拥塞估计并唤醒调用方。
    pub(crate) fn deliver(&self, message: Bytes) {
        bump(&self.stats.realign_tests);
        let (message, copied) = normalize_alignment(message);
        if copied {
            bump(&self.stats.realign_copies);
        }
        if message.len() < 8 {
            bump(&self.stats.invalid);
            debug!(len = message.len(), "runt rpc message dropped");
            return;
        }
        let xid = u32::from_be_bytes([message[0], message[1], message[2], message[3]]);
        let msg_type = u32::from_be_bytes([message[4], message[5], message[6], message[7]]);
        if msg_type != MSG_TYPE_REPLY {
            bump(&self.stats.invalid);
            debug!(xid, msg_type, "non-reply rpc message dropped");
            return;
        }

        let waker = {
            let mut registry = self.table.lock();
            let matched = registry
                .find_by_xid(xid)
                .and_then(|handle| registry.get_mut(handle))
                .filter(|state| state.reply.is_none());
            matched.map(|state| {
                state.reply = Some(message);
                let sample = state.flags.timing.then_some((state.class, state.rtt));
                let was_sent = std::mem::take(&mut state.flags.sent);
                self.congestion.lock().on_reply(was_sent, sample);
                state.waker.clone()
            })
        };
        match waker {
            Some(waker) => waker.notify_one(),
            None => {
                bump(&self.stats.unexpected);
                debug!(xid, "reply matches no outstanding request");
            }
        }
    }

    /// 处理流链路上的一段字节；返回 `false` 表示链路已损坏。
    fn on_stream_bytes(&self, chunk: &[u8]) -> bool {
        let mut records = Vec::new();
        let result = {
            let mut reassembler = self.reassembler.lock();
            reassembler.push(chunk);
            loop {
                match reassembler.next_record() {
                    Ok(Some(record)) => records.push(record),
                    Ok(None) => break Ok(()),
                    Err(err) => break Err(err),
                }
            }
        };
        for record in records {
            self.deliver(record);
        }
        match result {
            Ok(()) => true,
            Err(err) => {
                error!(server = %self.options.server, error = %err, "impossible packet length, tearing down connection");
                self.mark_for_reconnect();
                false
            }
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(task) = self.timer_task.get_mut().take() {
            task.abort();
        }
        if let Some(task) = self.receiver_task.get_mut().take() {
            task.abort();
        }
    }
}

/// 接收任务：每条链路一个，代际号过期或会话释放后退出。
async fn receive_loop(
    session: Weak<SessionInner>,
    mut receiver: Box<dyn LinkReceiver>,
    generation: u64,
) {
    loop {
        let received = receiver.recv().await;
        let Some(session) = session.upgrade() else {
            return;
        };
        if !session.is_current(generation) {
            return;
        }
        match (session.kind, received) {
            (TransportKind::Datagram, Ok(message)) => session.deliver(message),
            (TransportKind::Datagram, Err(err)) => {
                if err.kind() == std::io::ErrorKind::UnexpectedEof {
                    warn!(server = %session.options.server, "datagram link closed");
                    session.mark_link_lost();
                    return;
                }
                debug!(error = %err, "datagram receive error ignored");
            }
            (_, Ok(bytes)) if bytes.is_empty() => {
                warn!(server = %session.options.server, "server closed connection");
                session.mark_for_reconnect();
                return;
            }
            (TransportKind::Stream, Ok(bytes)) => {
                if !session.on_stream_bytes(&bytes) {
                    return;
                }
            }
            (TransportKind::SequencedPacket, Ok(message)) => session.deliver(message),
            (_, Err(err)) => {
                if !err.is_connection_reset() {
                    error!(server = %session.options.server, error = %err, "receive failed, tearing down connection");
                }
                session.mark_for_reconnect();
                return;
            }
        }
    }
}
