//! 引擎错误模型：传输错误分类、调用结果错误与配置错误。
//!
//! # 教案式注释
//! - **意图 (Why)**：调用方只应看到“必须由自己处理”的失败；瞬时传输错误由重传/重连吸收，
//!   因此传输错误在进入引擎时先被分类，而不是原样上抛。
//! - **逻辑 (How)**：[`TransportError`] 记录操作名与 [`io::ErrorKind`]，
//!   [`TransportError::category`] 将其映射为 [`ErrorCategory`]；
//!   [`RpcError`] 是 `issue_call` 的最终失败枚举。
//! - **契约 (What)**：`ErrorCategory::BrokenPipe` 独立成类，既不记录日志也不终止调用。

use bytes::Bytes;
use std::borrow::Cow;
use std::fmt;
use std::io;
use thiserror::Error;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

impl OperationKind {
    pub const CONNECT: OperationKind = OperationKind {
        code: "spark.nfsrpc.connect_failed",
        message: "rpc connect",
    };
    pub const SEND: OperationKind = OperationKind {
        code: "spark.nfsrpc.send_failed",
        message: "rpc send",
    };
    pub const RECEIVE: OperationKind = OperationKind {
        code: "spark.nfsrpc.receive_failed",
        message: "rpc receive",
    };
}

/// 传输错误的处置分类。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// 瞬时错误：标记重发，由定时器或重连吸收。
    Retryable,
    /// 对端已关闭写方向（EPIPE）：静默标记重发，调用继续等待。
    BrokenPipe,
    /// 数据报发送缓冲不足：视同“稍后重发”。
    NoBuffers,
    /// 致命错误：当前调用直接失败，重连循环随之中止。
    NonRetryable,
}

/// 传输协作者返回的错误。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{}: {message}", .op.message)]
pub struct TransportError {
    op: OperationKind,
    kind: io::ErrorKind,
    message: Cow<'static, str>,
}

impl TransportError {
    pub fn new(op: OperationKind, kind: io::ErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            op,
            kind,
            message: message.into(),
        }
    }

    /// 将 IO 错误映射为传输错误，保留原始 `ErrorKind`。
    pub fn from_io(op: OperationKind, error: &io::Error) -> Self {
        Self::new(op, error.kind(), error.to_string())
    }

    /// 连接已被关闭（对端 EOF 或本地拆除）。
    pub fn closed(op: OperationKind) -> Self {
        Self::new(op, io::ErrorKind::UnexpectedEof, "link closed")
    }

    /// 发送缓冲暂时不足（ENOBUFS 的对应物）。
    pub fn no_buffers(op: OperationKind) -> Self {
        Self::new(op, io::ErrorKind::OutOfMemory, "no buffer space available")
    }

    pub fn op(&self) -> OperationKind {
        self.op
    }

    pub fn kind(&self) -> io::ErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.op.code
    }

    pub fn category(&self) -> ErrorCategory {
        categorize(self.kind)
    }

    /// 对端重置连接时不输出拆链日志。
    pub fn is_connection_reset(&self) -> bool {
        self.kind == io::ErrorKind::ConnectionReset
    }
}

fn categorize(kind: io::ErrorKind) -> ErrorCategory {
    use io::ErrorKind;
    match kind {
        ErrorKind::BrokenPipe => ErrorCategory::BrokenPipe,
        ErrorKind::OutOfMemory => ErrorCategory::NoBuffers,
        ErrorKind::TimedOut
        | ErrorKind::WouldBlock
        | ErrorKind::Interrupted
        | ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::AddrInUse
        | ErrorKind::AddrNotAvailable
        | ErrorKind::HostUnreachable
        | ErrorKind::NetworkUnreachable
        | ErrorKind::NetworkDown
        | ErrorKind::UnexpectedEof
        | ErrorKind::WriteZero => ErrorCategory::Retryable,
        _ => ErrorCategory::NonRetryable,
    }
}

/// `issue_call` 与会话操作的失败结果。
#[derive(Debug, Error)]
pub enum RpcError {
    /// 不可恢复的传输错误。
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// 记录标记长度非法，流已失去同步。
    #[error("record marker length {length} outside 1..={max}")]
    ProtocolDesync { length: u32, max: usize },

    /// 软挂载重传预算耗尽。
    #[error("server did not respond within the retransmit budget")]
    TimedOut,

    /// 调用方请求取消（仅可中断挂载生效）。
    #[error("call cancelled")]
    Cancelled,

    /// 挂载正在被强制拆除。
    #[error("mount is being forcibly unmounted")]
    Unmounting,

    /// 排空期限内仍有请求未退出。
    #[error("{outstanding} request(s) still outstanding after drain")]
    Busy { outstanding: usize },

    /// 重连次数耗尽。
    #[error("reconnect failed after {attempts} attempt(s): {last}")]
    ReconnectFailed {
        attempts: u32,
        #[source]
        last: TransportError,
    },

    /// 服务端拒绝了调用（MSG_DENIED）。
    #[error("rpc call denied: {}", denial_reason(.mismatch))]
    Denied { mismatch: bool },

    /// 服务端接受但未执行（accept_stat 非 SUCCESS）。
    #[error("rpc call not executed, accept_stat {stat}")]
    Unaccepted { stat: u32 },

    /// 应答信封格式错误。
    #[error("malformed rpc reply: {0}")]
    Malformed(&'static str),

    /// 挂载选项非法。
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// 应用层状态码非零，原样上抛；NFSv3 附带应答体以便解析 post-op 属性。
    #[error("nfs status {status}")]
    Application { status: u32, reply: Option<Bytes> },
}

impl RpcError {
    /// 应用层状态码（若有）。
    pub fn status(&self) -> Option<u32> {
        match self {
            RpcError::Application { status, .. } => Some(*status),
            _ => None,
        }
    }
}

fn denial_reason(mismatch: &bool) -> &'static str {
    if *mismatch {
        "rpc version mismatch"
    } else {
        "authentication error"
    }
}

/// 配置解析与校验错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid mount option `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to parse mount options: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl fmt::Display) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broken_pipe_is_its_own_category() {
        let err = TransportError::new(OperationKind::SEND, io::ErrorKind::BrokenPipe, "epipe");
        assert_eq!(err.category(), ErrorCategory::BrokenPipe);
    }

    #[test]
    fn connection_level_failures_are_retryable() {
        for kind in [
            io::ErrorKind::ConnectionRefused,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::NotConnected,
            io::ErrorKind::TimedOut,
        ] {
            let err = TransportError::new(OperationKind::CONNECT, kind, "x");
            assert_eq!(err.category(), ErrorCategory::Retryable, "{kind:?}");
        }
        let denied =
            TransportError::new(OperationKind::CONNECT, io::ErrorKind::PermissionDenied, "x");
        assert_eq!(denied.category(), ErrorCategory::NonRetryable);
    }

    #[test]
    fn display_carries_operation() {
        let err = TransportError::no_buffers(OperationKind::SEND);
        assert_eq!(err.category(), ErrorCategory::NoBuffers);
        assert_eq!(err.to_string(), "rpc send: no buffer space available");
        assert_eq!(err.code(), "spark.nfsrpc.send_failed");
    }
}
