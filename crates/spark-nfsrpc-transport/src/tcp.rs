use crate::error::{TCP_CONFIGURE, TCP_CONNECT, TCP_READ, TCP_WRITE, map_io_error};
use crate::util::{resolve, run_with_timeout};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use socket2::SockRef;
use spark_nfsrpc::{Connector, Link, LinkReceiver, LinkSender, TransportError, TransportKind};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_READ_CHUNK: usize = 64 * 1024;

/// TCP 链路的套接字级配置。
///
/// # 教案式注释
/// - **意图 (Why)**：RPC 请求通常很小且需要尽快上线，缺省关闭 Nagle；
///   长时间空闲的挂载依赖 `SO_KEEPALIVE` 发现半开连接。
/// - **契约 (What)**：`apply` 在建连成功后立即执行，失败时本次建连整体失败。
/// - **注意事项 (Trade-offs)**：`linger` 仅影响关闭阶段，设置过短可能导致对端收到 RST。
#[derive(Clone, Debug)]
pub struct TcpLinkConfig {
    connect_timeout: Option<Duration>,
    nodelay: bool,
    keepalive: bool,
    linger: Option<Duration>,
    read_chunk: usize,
}

impl Default for TcpLinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            nodelay: true,
            keepalive: true,
            linger: None,
            read_chunk: DEFAULT_READ_CHUNK,
        }
    }
}

impl TcpLinkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 建连（含地址解析）的超时；`None` 表示交给内核。
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_keepalive(mut self, keepalive: bool) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    /// 单次读取预留的缓冲大小。
    pub fn with_read_chunk(mut self, bytes: usize) -> Self {
        self.read_chunk = bytes.max(1);
        self
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;
        let sock = SockRef::from(stream);
        sock.set_keepalive(self.keepalive)?;
        sock.set_linger(self.linger)
    }
}

/// 面向 NFS 服务端的 TCP 建连工厂。
///
/// # 教案式注释
/// - **意图 (Why)**：会话在每次重连时调用 [`Connector::connect`]，因此目标以 `host:port`
///   文本保存，每次重新解析。
/// - **逻辑 (How)**：解析 → 建连（受超时约束）→ 应用套接字选项 → `into_split` 拆成
///   独立的读写半部，写半部交给会话的单写者锁，读半部交给接收任务。
/// - **契约 (What)**：接收半部在对端关闭时返回空段；发送要么整段写出要么报错。
#[derive(Clone, Debug)]
pub struct TcpConnector {
    target: String,
    config: TcpLinkConfig,
}

impl TcpConnector {
    pub fn new(target: impl Into<String>) -> Self {
        Self::with_config(target, TcpLinkConfig::default())
    }

    pub fn with_config(target: impl Into<String>, config: TcpLinkConfig) -> Self {
        Self {
            target: target.into(),
            config,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn config(&self) -> &TcpLinkConfig {
        &self.config
    }
}

#[async_trait]
impl Connector for TcpConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    async fn connect(&self) -> Result<Link, TransportError> {
        let timeout = self.config.connect_timeout;
        let addr = resolve(&self.target, timeout).await?;
        let stream = run_with_timeout(TCP_CONNECT, timeout, TcpStream::connect(addr)).await?;
        self.config
            .apply(&stream)
            .map_err(|err| map_io_error(TCP_CONFIGURE, err))?;
        debug!(%addr, "tcp link established");

        let (reader, writer) = stream.into_split();
        Ok(Link::new(
            TcpSender {
                writer,
                closed: false,
            },
            TcpReceiver {
                reader,
                buffer: BytesMut::with_capacity(self.config.read_chunk),
                read_chunk: self.config.read_chunk,
            },
        ))
    }
}

struct TcpSender {
    writer: OwnedWriteHalf,
    closed: bool,
}

#[async_trait]
impl LinkSender for TcpSender {
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::closed(TCP_WRITE));
        }
        self.writer
            .write_all(frame)
            .await
            .map_err(|err| map_io_error(TCP_WRITE, err))
    }

    async fn shutdown(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        if let Err(error) = self.writer.shutdown().await {
            debug!(%error, "tcp shutdown failed");
        }
    }
}

struct TcpReceiver {
    reader: OwnedReadHalf,
    buffer: BytesMut,
    read_chunk: usize,
}

#[async_trait]
impl LinkReceiver for TcpReceiver {
    async fn recv(&mut self) -> Result<Bytes, TransportError> {
        self.buffer.reserve(self.read_chunk);
        let read = self
            .reader
            .read_buf(&mut self.buffer)
            .await
            .map_err(|err| map_io_error(TCP_READ, err))?;
        if read == 0 {
            return Ok(Bytes::new());
        }
        Ok(self.buffer.split().freeze())
    }
}
