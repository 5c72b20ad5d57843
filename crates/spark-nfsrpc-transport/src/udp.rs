use crate::error::{UDP_BIND, UDP_CONNECT, UDP_RECV, UDP_SEND, map_io_error};
use crate::util::resolve;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use spark_nfsrpc::{Connector, Link, LinkReceiver, LinkSender, TransportError, TransportKind};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::debug;

/// 单个数据报的最大长度。
pub const MAX_DATAGRAM: usize = 65_535;
const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(30);

/// 面向 NFS 服务端的 UDP 建连工厂。
///
/// 每次 `connect` 都绑定一个新的临时端口并 `connect` 到服务端，之后只接收来自该服务端的数据报；
/// 重连因而天然丢弃旧端口上迟到的应答。
#[derive(Clone, Debug)]
pub struct UdpConnector {
    target: String,
    bind: Option<SocketAddr>,
    max_datagram: usize,
}

impl UdpConnector {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            bind: None,
            max_datagram: MAX_DATAGRAM,
        }
    }

    /// 指定本地绑定地址；缺省按服务端地址族选择通配地址与临时端口。
    pub fn with_bind(mut self, bind: SocketAddr) -> Self {
        self.bind = Some(bind);
        self
    }

    /// 接收缓冲上限；超出部分被内核截断。
    pub fn with_max_datagram(mut self, bytes: usize) -> Self {
        self.max_datagram = bytes.clamp(1, MAX_DATAGRAM);
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

fn wildcard_for(server: SocketAddr) -> SocketAddr {
    match server {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    }
}

#[async_trait]
impl Connector for UdpConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    async fn connect(&self) -> Result<Link, TransportError> {
        let server = resolve(&self.target, Some(DEFAULT_RESOLVE_TIMEOUT)).await?;
        let local = self.bind.unwrap_or_else(|| wildcard_for(server));
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|err| map_io_error(UDP_BIND, err))?;
        socket
            .connect(server)
            .await
            .map_err(|err| map_io_error(UDP_CONNECT, err))?;
        debug!(%server, local = ?socket.local_addr().ok(), "udp link established");

        let socket = Arc::new(socket);
        Ok(Link::new(
            UdpSender {
                socket: socket.clone(),
            },
            UdpReceiver {
                socket,
                max_datagram: self.max_datagram,
            },
        ))
    }
}

struct UdpSender {
    socket: Arc<UdpSocket>,
}

#[async_trait]
impl LinkSender for UdpSender {
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let written = self
            .socket
            .send(frame)
            .await
            .map_err(|err| map_io_error(UDP_SEND, err))?;
        if written != frame.len() {
            return Err(TransportError::new(
                UDP_SEND,
                std::io::ErrorKind::WriteZero,
                format!("short datagram write: {written} of {}", frame.len()),
            ));
        }
        Ok(())
    }

    fn has_send_space(&self, len: usize) -> bool {
        len <= MAX_DATAGRAM
    }

    async fn shutdown(&mut self) {}
}

struct UdpReceiver {
    socket: Arc<UdpSocket>,
    max_datagram: usize,
}

#[async_trait]
impl LinkReceiver for UdpReceiver {
    async fn recv(&mut self) -> Result<Bytes, TransportError> {
        let mut buffer = BytesMut::zeroed(self.max_datagram);
        let read = self
            .socket
            .recv(&mut buffer)
            .await
            .map_err(|err| map_io_error(UDP_RECV, err))?;
        buffer.truncate(read);
        Ok(buffer.freeze())
    }
}
