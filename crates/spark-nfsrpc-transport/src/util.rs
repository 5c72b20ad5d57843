use crate::error::{RESOLVE, map_io_error, timeout_error};
use spark_nfsrpc::{OperationKind, TransportError};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// 在可选超时内执行 IO Future，并把错误映射为 [`TransportError`]。
pub(crate) async fn run_with_timeout<F, T>(
    kind: OperationKind,
    timeout: Option<Duration>,
    future: F,
) -> Result<T, TransportError>
where
    F: Future<Output = io::Result<T>>,
{
    tokio::pin!(future);
    match timeout {
        Some(limit) => {
            let sleep = tokio::time::sleep(limit);
            tokio::pin!(sleep);
            tokio::select! {
                biased;
                result = &mut future => result.map_err(|err| map_io_error(kind, err)),
                _ = &mut sleep => Err(timeout_error(kind)),
            }
        }
        None => future.await.map_err(|err| map_io_error(kind, err)),
    }
}

/// 解析 `host:port`；每次建连都重新解析，服务端地址变更后重连即可生效。
pub(crate) async fn resolve(target: &str, timeout: Option<Duration>) -> Result<SocketAddr, TransportError> {
    let mut addrs = run_with_timeout(RESOLVE, timeout, tokio::net::lookup_host(target)).await?;
    addrs.next().ok_or_else(|| {
        TransportError::new(
            RESOLVE,
            io::ErrorKind::AddrNotAvailable,
            format!("{target} resolved to no address"),
        )
    })
}
