#![doc = r#"
# spark-nfsrpc

## 设计动机（Why）
- **定位**：NFS 客户端的 RPC 传输与重试引擎，负责请求分帧、发送、拥塞准入、
  应答按 xid 分派、超时重传以及传输故障后的重连。
- **架构角色**：位于文件系统层（负责过程参数编解码）与传输实现层
  （见 `spark-nfsrpc-transport`）之间；两侧都只通过本 crate 的契约交互。
- **设计理念**：会话跨越重连存续；请求状态集中在注册表，由调用路径、接收路径与
  重传定时器三方在短临界区内协作，任何传输 I/O 都不在锁内执行。

## 核心契约（What）
- **输入条件**：在 Tokio 运行时中构造 [`MountSession`]，提供实现 [`Connector`] 的链路工厂；
- **输出保障**：[`MountSession::issue_call`] 对每个请求至多交付一次应答；瞬时传输错误被
  重传/重连吸收；软挂载在预算耗尽时返回 [`RpcError::TimedOut`]；
- **前置约束**：调用体由调用方完成编码（xid 之后的全部字节），引擎只写入 xid 与记录标记。

## 实现策略（How）
- [`CongestionState`] 维护缩放后的拥塞窗口与四组 `(srtt, sdrtt)`；
- [`RecordReassembler`] 负责字节流的记录标记重组；
- 注册表使用代际句柄的槽位表，重传定时器以 `Weak` 引用会话周期扫描；
- 面向连接的链路由单写者锁串行化发送与重连。

## 风险与考量（Trade-offs）
- 定时器以固定节拍推进，RTT 精度受节拍长度限制；
- 硬挂载在服务端长时间不可达时会无限等待，只有可中断挂载或强制卸载能够打断。
"#]

mod call;
mod config;
mod congestion;
mod contract;
mod error;
mod reassembly;
mod registry;
mod reply;
mod session;
mod status;
mod timer;
mod transport;
mod xid;

pub use config::MountOptions;
pub use congestion::{
    BACKOFF, CWND_SCALE, CongestionSnapshot, CongestionState, MAX_CWND, MAX_REXMIT, TimerClass,
};
pub use contract::Cancellation;
pub use error::{ConfigError, ErrorCategory, OperationKind, RpcError, TransportError};
pub use reassembly::{
    LAST_FRAGMENT, ReassemblyState, RecordReassembler, frame_record, normalize_alignment,
};
pub use reply::{NFSERR_STALE, NFSERR_TRYLATER, RpcCall, RpcReply, decode_reply};
pub use session::{MountSession, MountSessionBuilder};
pub use status::{ConnectivityEvent, ConnectivityObserver, LogObserver, SessionStats};
pub use transport::{Connector, Link, LinkReceiver, LinkSender, TransportKind};

/// 挂载选项的常量缺省值。
pub mod defaults {
    pub use crate::config::{
        DEFAULT_MAX_RECORD_LEN, DEFAULT_RETRANS, DEFAULT_TICK_MS, DEFAULT_TIMEO_TICKS,
        MAX_TIMEO_TICKS,
    };
}
