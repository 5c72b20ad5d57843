//! 会话统计与服务端连通性通知。
//!
//! # 教案式注释
//! - **意图 (Why)**：运维需要知道“服务端多久没响应了”以及重传、重连的频度；
//!   这些信息既要打日志，也要能被上层（例如挂载管理器）以回调形式订阅。
//! - **逻辑 (How)**：
//!   - [`SessionStats`] 是原子计数器的只读快照；
//!   - [`ConnectivityObserver`] 只在“可达 ↔ 不可达”切换时收到一次事件，
//!     逐请求的提示则直接走 `tracing`。
//! - **契约 (What)**：观察者回调在定时器或调用路径上同步执行，实现必须快速返回、不可阻塞。

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{info, warn};

/// 连通性事件。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectivityEvent {
    /// 至少一个请求多次重传仍无应答。
    NotResponding { server: String },
    /// 此前无响应的服务端重新应答。
    Responding { server: String },
}

/// 连通性事件订阅者。
pub trait ConnectivityObserver: Send + Sync + 'static {
    fn on_event(&self, event: &ConnectivityEvent);
}

/// 仅输出日志的缺省观察者。
#[derive(Clone, Copy, Debug, Default)]
pub struct LogObserver;

impl ConnectivityObserver for LogObserver {
    fn on_event(&self, event: &ConnectivityEvent) {
        match event {
            ConnectivityEvent::NotResponding { server } => {
                warn!(server = %server, "nfs server not responding")
            }
            ConnectivityEvent::Responding { server } => info!(server = %server, "nfs server is alive again"),
        }
    }
}

/// 会话统计快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// 发起的 RPC 尝试数（TRYLATER 重新发起的整次调用分别计数）。
    pub requests: u64,
    /// 重传次数（定时器重发 + 流式链路的重发）。
    pub retries: u64,
    /// 软挂载预算耗尽的请求数。
    pub timeouts: u64,
    /// 无法解析为 RPC 应答的消息数。
    pub invalid: u64,
    /// xid 不匹配任何在途请求的应答数。
    pub unexpected: u64,
    pub reconnects: u64,
    /// 做过对齐检查的接收消息数。
    pub realign_tests: u64,
    /// 因未对齐而被复制的消息数。
    pub realign_copies: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub requests: AtomicU64,
    pub retries: AtomicU64,
    pub timeouts: AtomicU64,
    pub invalid: AtomicU64,
    pub unexpected: AtomicU64,
    pub reconnects: AtomicU64,
    pub realign_tests: AtomicU64,
    pub realign_copies: AtomicU64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl StatsCounters {
    pub(crate) fn snapshot(&self) -> SessionStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        SessionStats {
            requests: load(&self.requests),
            retries: load(&self.retries),
            timeouts: load(&self.timeouts),
            invalid: load(&self.invalid),
            unexpected: load(&self.unexpected),
            reconnects: load(&self.reconnects),
            realign_tests: load(&self.realign_tests),
            realign_copies: load(&self.realign_copies),
        }
    }
}

/// 会话级“服务端无响应”状态。
pub(crate) struct ServerStatus {
    server: String,
    not_responding: AtomicBool,
    observer: Arc<dyn ConnectivityObserver>,
}

impl ServerStatus {
    pub(crate) fn new(server: String, observer: Arc<dyn ConnectivityObserver>) -> Self {
        Self {
            server,
            not_responding: AtomicBool::new(false),
            observer,
        }
    }

    pub(crate) fn is_not_responding(&self) -> bool {
        self.not_responding.load(Ordering::Acquire)
    }

    /// 某个请求触发了无响应提示；会话状态只在首次切换时通知观察者。
    pub(crate) fn report_down(&self, xid: u32) {
        warn!(server = %self.server, xid, "nfs server not responding, still trying");
        if !self.not_responding.swap(true, Ordering::AcqRel) {
            self.observer.on_event(&ConnectivityEvent::NotResponding {
                server: self.server.clone(),
            });
        }
    }

    /// 调用成功返回。`printed` 表示该请求曾输出过无响应提示。
    pub(crate) fn report_up(&self, xid: u32, printed: bool) {
        if printed {
            info!(server = %self.server, xid, "nfs server is alive again");
        }
        if self.not_responding.swap(false, Ordering::AcqRel) {
            self.observer.on_event(&ConnectivityEvent::Responding {
                server: self.server.clone(),
            });
        }
    }
}

impl fmt::Debug for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerStatus")
            .field("server", &self.server)
            .field("not_responding", &self.is_not_responding())
            .finish_non_exhaustive()
    }
}
