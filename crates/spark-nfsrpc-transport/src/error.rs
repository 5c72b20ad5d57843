use spark_nfsrpc::{OperationKind, TransportError};
use std::io;

pub(crate) const RESOLVE: OperationKind = OperationKind {
    code: "spark.nfsrpc.transport.resolve_failed",
    message: "resolve server address",
};
pub(crate) const TCP_CONNECT: OperationKind = OperationKind {
    code: "spark.nfsrpc.transport.tcp.connect_failed",
    message: "tcp connect",
};
pub(crate) const TCP_WRITE: OperationKind = OperationKind {
    code: "spark.nfsrpc.transport.tcp.write_failed",
    message: "tcp write",
};
pub(crate) const TCP_READ: OperationKind = OperationKind {
    code: "spark.nfsrpc.transport.tcp.read_failed",
    message: "tcp read",
};
pub(crate) const TCP_CONFIGURE: OperationKind = OperationKind {
    code: "spark.nfsrpc.transport.tcp.configure_failed",
    message: "tcp configure",
};
pub(crate) const UDP_BIND: OperationKind = OperationKind {
    code: "spark.nfsrpc.transport.udp.bind_failed",
    message: "udp bind",
};
pub(crate) const UDP_CONNECT: OperationKind = OperationKind {
    code: "spark.nfsrpc.transport.udp.connect_failed",
    message: "udp connect",
};
pub(crate) const UDP_SEND: OperationKind = OperationKind {
    code: "spark.nfsrpc.transport.udp.send_failed",
    message: "udp send",
};
pub(crate) const UDP_RECV: OperationKind = OperationKind {
    code: "spark.nfsrpc.transport.udp.recv_failed",
    message: "udp recv",
};

/// Linux 上 ENOBUFS 的错误号；标准库将其归入未分类错误。
const ENOBUFS: i32 = 105;

fn is_no_buffers(error: &io::Error) -> bool {
    cfg!(target_os = "linux") && error.raw_os_error() == Some(ENOBUFS)
}

/// 将 IO 错误映射为引擎可分类的传输错误。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> TransportError {
    if is_no_buffers(&error) {
        return TransportError::no_buffers(kind);
    }
    TransportError::from_io(kind, &error)
}

/// 构造超时错误。
pub(crate) fn timeout_error(kind: OperationKind) -> TransportError {
    TransportError::new(
        kind,
        io::ErrorKind::TimedOut,
        format!("{} timed out", kind.message),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use spark_nfsrpc::ErrorCategory;

    #[test]
    fn keeps_io_kind_for_categorisation() {
        let err = map_io_error(
            TCP_WRITE,
            io::Error::new(io::ErrorKind::BrokenPipe, "pipe"),
        );
        assert_eq!(err.code(), TCP_WRITE.code);
        assert_eq!(err.category(), ErrorCategory::BrokenPipe);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn enobufs_becomes_no_buffers() {
        let err = map_io_error(UDP_SEND, io::Error::from_raw_os_error(ENOBUFS));
        assert_eq!(err.category(), ErrorCategory::NoBuffers);
    }

    #[test]
    fn timeouts_are_retryable() {
        let err = timeout_error(TCP_CONNECT);
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(err.category(), ErrorCategory::Retryable);
        assert!(err.to_string().contains("tcp connect timed out"));
    }
}
