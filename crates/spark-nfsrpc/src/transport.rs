//! 传输协作者契约：建连、发送、接收与拆除。
//!
//! # 教案式注释
//! - **意图 (Why)**：引擎不直接持有套接字；真实网络（见 `spark-nfsrpc-transport`）与测试用
//!   内存链路都只需实现此处的三个 trait。
//! - **逻辑 (How)**：[`Connector::connect`] 返回一条 [`Link`]，拆分为发送半部与接收半部。
//!   发送半部由会话的单写者锁持有；接收半部交给会话的接收任务独占驱动。
//! - **契约 (What)**：
//!   - 数据报/顺序包链路：每次 `recv` 返回一条完整消息；
//!   - 流链路：`recv` 返回任意长度的字节段，空段表示对端关闭；
//!   - `send` 要么整段写出，要么返回错误，不存在部分成功。

use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::fmt;

/// 传输类型：建会话时选定，之后不再变化。
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// 无连接、保留消息边界（UDP）。
    #[default]
    Datagram,
    /// 面向连接的字节流，需要记录标记分帧（TCP）。
    Stream,
    /// 面向连接、保留消息边界。
    SequencedPacket,
}

impl TransportKind {
    /// 面向连接的链路走“单写者 + 重连”路径，不受拥塞窗口约束。
    pub fn is_connection_oriented(self) -> bool {
        !matches!(self, TransportKind::Datagram)
    }

    /// 仅字节流需要在请求前附加 4 字节记录标记。
    pub fn uses_record_marking(self) -> bool {
        matches!(self, TransportKind::Stream)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Datagram => "datagram",
            TransportKind::Stream => "stream",
            TransportKind::SequencedPacket => "seqpacket",
        })
    }
}

/// 建连工厂：每次重连都会重新调用。
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    fn kind(&self) -> TransportKind;

    async fn connect(&self) -> Result<Link, TransportError>;
}

/// 链路的发送半部。
#[async_trait]
pub trait LinkSender: Send + Sync {
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// 发送缓冲是否足以容纳 `len` 字节；定时器重发前据此跳过拥塞的链路。
    fn has_send_space(&self, _len: usize) -> bool {
        true
    }

    /// 拆除写方向；重复调用必须无害。
    async fn shutdown(&mut self);
}

/// 链路的接收半部。
#[async_trait]
pub trait LinkReceiver: Send {
    async fn recv(&mut self) -> Result<Bytes, TransportError>;
}

/// 一次建连得到的链路。
pub struct Link {
    pub sender: Box<dyn LinkSender>,
    pub receiver: Box<dyn LinkReceiver>,
}

impl Link {
    pub fn new(sender: impl LinkSender + 'static, receiver: impl LinkReceiver + 'static) -> Self {
        Self {
            sender: Box::new(sender),
            receiver: Box::new(receiver),
        }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}
