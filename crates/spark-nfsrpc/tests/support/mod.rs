//! 集成测试共用的脚本化内存链路。
//!
//! `MockNet` 记录每一次成功发送的帧，并可按脚本：
//! - 自动应答（`respond_with`）；
//! - 注入原始入站字节、关闭当前链路；
//! - 让接下来的若干次建连或发送失败。
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use spark_nfsrpc::{
    Cancellation, Connector, Link, LinkReceiver, LinkSender, MountOptions, MountSession,
    OperationKind, RpcCall, RpcError, RpcReply, TransportError, TransportKind, frame_record,
};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type Inbound = mpsc::UnboundedSender<Result<Bytes, TransportError>>;
type Responder = Box<dyn FnMut(&SentCall) -> Option<Bytes> + Send>;

/// 一次成功发送的记录。
#[derive(Clone, Debug)]
pub struct SentCall {
    pub xid: u32,
    pub wire: Bytes,
    /// 第几条链路（从 1 开始）。
    pub link: usize,
}

#[derive(Clone)]
pub struct MockNet {
    inner: Arc<NetState>,
}

struct NetState {
    kind: TransportKind,
    sent: Mutex<Vec<SentCall>>,
    responder: Mutex<Option<Responder>>,
    inbound: Mutex<Option<Inbound>>,
    connect_failures: Mutex<VecDeque<io::ErrorKind>>,
    send_failures: Mutex<VecDeque<io::ErrorKind>>,
    connects: AtomicUsize,
    connect_attempts: AtomicUsize,
    send_attempts: AtomicUsize,
    send_space: AtomicBool,
}

impl MockNet {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            inner: Arc::new(NetState {
                kind,
                sent: Mutex::new(Vec::new()),
                responder: Mutex::new(None),
                inbound: Mutex::new(None),
                connect_failures: Mutex::new(VecDeque::new()),
                send_failures: Mutex::new(VecDeque::new()),
                connects: AtomicUsize::new(0),
                connect_attempts: AtomicUsize::new(0),
                send_attempts: AtomicUsize::new(0),
                send_space: AtomicBool::new(true),
            }),
        }
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector { net: self.clone() }
    }

    /// 每次成功发送后调用；返回 `Some` 即作为应答投递到当前链路。
    pub fn respond_with(&self, responder: impl FnMut(&SentCall) -> Option<Bytes> + Send + 'static) {
        *self.inner.responder.lock() = Some(Box::new(responder));
    }

    /// 对每个请求回复 NFS_OK 与给定结果。
    pub fn respond_ok(&self, results: &'static [u8]) {
        self.respond_with(move |call| Some(reply(call.xid, 0, results)));
    }

    pub fn stop_responding(&self) {
        *self.inner.responder.lock() = None;
    }

    pub fn sent(&self) -> Vec<SentCall> {
        self.inner.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.inner.sent.lock().len()
    }

    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn connect_attempts(&self) -> usize {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn send_attempts(&self) -> usize {
        self.inner.send_attempts.load(Ordering::SeqCst)
    }

    pub fn fail_connects(&self, kinds: &[io::ErrorKind]) {
        self.inner.connect_failures.lock().extend(kinds.iter().copied());
    }

    pub fn fail_sends(&self, kinds: &[io::ErrorKind]) {
        self.inner.send_failures.lock().extend(kinds.iter().copied());
    }

    pub fn set_send_space(&self, available: bool) {
        self.inner.send_space.store(available, Ordering::SeqCst);
    }

    /// 投递一条完整应答；流链路自动加记录标记。
    pub fn deliver(&self, message: Bytes) {
        let wire = if self.inner.kind.uses_record_marking() {
            frame_record(&message)
        } else {
            message
        };
        self.inject_raw(wire);
    }

    /// 原样投递入站字节。
    pub fn inject_raw(&self, bytes: Bytes) {
        if let Some(inbound) = self.inner.inbound.lock().as_ref() {
            let _ = inbound.send(Ok(bytes));
        }
    }

    /// 以错误结束当前链路的接收。
    pub fn inject_error(&self, kind: io::ErrorKind) {
        if let Some(inbound) = self.inner.inbound.lock().as_ref() {
            let _ = inbound.send(Err(TransportError::new(
                OperationKind::RECEIVE,
                kind,
                "injected receive failure",
            )));
        }
    }

    /// 对端关闭：面向连接链路收到空段。
    pub fn close_link(&self) {
        self.inject_raw(Bytes::new());
    }

    pub async fn wait_for_sent(&self, count: usize) {
        wait_until(|| self.sent_count() >= count).await;
    }

    fn record(&self, link: usize, wire: &[u8]) {
        let offset = if self.inner.kind.uses_record_marking() { 4 } else { 0 };
        let xid = u32::from_be_bytes([
            wire[offset],
            wire[offset + 1],
            wire[offset + 2],
            wire[offset + 3],
        ]);
        let call = SentCall {
            xid,
            wire: Bytes::copy_from_slice(wire),
            link,
        };
        self.inner.sent.lock().push(call.clone());
        let answer = self
            .inner
            .responder
            .lock()
            .as_mut()
            .and_then(|responder| responder(&call));
        if let Some(message) = answer {
            self.deliver(message);
        }
    }
}

pub struct MockConnector {
    net: MockNet,
}

#[async_trait]
impl Connector for MockConnector {
    fn kind(&self) -> TransportKind {
        self.net.inner.kind
    }

    async fn connect(&self) -> Result<Link, TransportError> {
        let state = &self.net.inner;
        state.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(kind) = state.connect_failures.lock().pop_front() {
            return Err(TransportError::new(
                OperationKind::CONNECT,
                kind,
                "injected connect failure",
            ));
        }
        let link = state.connects.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        *state.inbound.lock() = Some(tx);
        Ok(Link::new(
            MockSender {
                net: self.net.clone(),
                link,
                closed: false,
            },
            MockReceiver { rx },
        ))
    }
}

struct MockSender {
    net: MockNet,
    link: usize,
    closed: bool,
}

#[async_trait]
impl LinkSender for MockSender {
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.net.inner.send_attempts.fetch_add(1, Ordering::SeqCst);
        if self.closed {
            return Err(TransportError::closed(OperationKind::SEND));
        }
        if let Some(kind) = self.net.inner.send_failures.lock().pop_front() {
            return Err(TransportError::new(
                OperationKind::SEND,
                kind,
                "injected send failure",
            ));
        }
        self.net.record(self.link, frame);
        Ok(())
    }

    fn has_send_space(&self, _len: usize) -> bool {
        self.net.inner.send_space.load(Ordering::SeqCst)
    }

    async fn shutdown(&mut self) {
        self.closed = true;
    }
}

struct MockReceiver {
    rx: mpsc::UnboundedReceiver<Result<Bytes, TransportError>>,
}

#[async_trait]
impl LinkReceiver for MockReceiver {
    async fn recv(&mut self) -> Result<Bytes, TransportError> {
        self.rx
            .recv()
            .await
            .unwrap_or_else(|| Err(TransportError::closed(OperationKind::RECEIVE)))
    }
}

/// 构造一条 MSG_ACCEPTED/SUCCESS 应答，携带 NFS 状态字与结果。
pub fn reply(xid: u32, status: u32, results: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(28 + results.len());
    out.put_u32(xid);
    out.put_u32(1);
    out.put_u32(0);
    out.put_u32(0);
    out.put_u32(0);
    out.put_u32(0);
    out.put_u32(status);
    out.put_slice(results);
    out.freeze()
}

/// 一个最小的 NFSv3 调用体（xid 之后的部分）。
pub fn call_body(procedure: u32) -> Bytes {
    let mut out = BytesMut::new();
    for word in [0u32, 2, 100_003, 3, procedure, 0, 0, 0, 0] {
        out.put_u32(word);
    }
    out.freeze()
}

/// 测试缺省选项：静态超时 60 秒，避免计时器干扰与超时无关的断言。
pub fn options(kind: TransportKind) -> MountOptions {
    MountOptions {
        timeo_ticks: 6_000,
        reconnect_delay_ms: 100,
        ..MountOptions::new("mock:/export", kind)
    }
}

/// 在后台发起一次调用。
pub fn spawn_call(session: &MountSession, call: RpcCall) -> JoinHandle<Result<RpcReply, RpcError>> {
    let session = session.clone();
    tokio::spawn(async move { session.issue_call(call, &Cancellation::new()).await })
}

/// 轮询直到条件成立；虚拟时间下最多推进 60 秒。
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..60_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached within 60s of virtual time");
}
