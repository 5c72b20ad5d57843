#![doc = r#"
# spark-nfsrpc-transport

## 设计动机（Why）
- **定位**：为 `spark-nfsrpc` 引擎提供基于 Tokio 的真实网络链路，使会话能够直接挂载 NFS 服务端。
- **架构角色**：实现引擎的 `Connector` / `LinkSender` / `LinkReceiver` 契约；引擎负责重连节奏，
  这里只负责“一次建连”与“一次收发”。

## 核心契约（What）
- [`TcpConnector`]：字节流链路，接收半部返回任意长度的字节段，对端关闭时返回空段；
- [`UdpConnector`]：已连接的 UDP 套接字，每次接收返回一条完整数据报；
- 所有 IO 错误都映射为携带 `io::ErrorKind` 的 `TransportError`，由引擎按类别决定重发或失败。

## 实现策略（How）
- 地址在每次建连时重新解析，建连与解析共享同一个可选超时；
- TCP 通过 `into_split` 获得独立的读写半部，`socket2` 负责 `SO_KEEPALIVE` 与 `SO_LINGER`；
- UDP 的收发半部共享同一个 `Arc<UdpSocket>`。

## 风险与考量（Trade-offs）
- UDP 接收每次分配最大数据报大小的缓冲，换取实现简单；
- 关闭 `runtime-tokio` 特性时本 crate 不导出任何链路实现。
"#]

#[cfg(feature = "runtime-tokio")]
mod error;
#[cfg(feature = "runtime-tokio")]
mod tcp;
#[cfg(feature = "runtime-tokio")]
mod udp;
#[cfg(feature = "runtime-tokio")]
mod util;

#[cfg(feature = "runtime-tokio")]
pub use tcp::{TcpConnector, TcpLinkConfig};
#[cfg(feature = "runtime-tokio")]
pub use udp::{MAX_DATAGRAM, UdpConnector};
