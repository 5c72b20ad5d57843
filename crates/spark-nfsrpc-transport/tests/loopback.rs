//! 回环网络上的端到端调用：最小化的 NFS 应答方 + 真实 TCP/UDP 链路。

use bytes::{BufMut, Bytes, BytesMut};
use spark_nfsrpc::{Cancellation, MountOptions, MountSession, RpcCall, TransportKind, frame_record};
use spark_nfsrpc_transport::{TcpConnector, UdpConnector};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

fn null_call() -> RpcCall {
    let mut body = BytesMut::new();
    for word in [0u32, 2, 100_003, 3, 0, 0, 0, 0, 0] {
        body.put_u32(word);
    }
    RpcCall::new(body.freeze())
}

fn reply(xid: u32, results: &[u8]) -> Bytes {
    let mut out = BytesMut::new();
    for word in [xid, 1, 0, 0, 0, 0, 0] {
        out.put_u32(word);
    }
    out.put_slice(results);
    out.freeze()
}

/// 读出一条带记录标记的请求，返回其 xid。
async fn read_request(peer: &mut TcpStream) -> std::io::Result<u32> {
    let marker = peer.read_u32().await?;
    let mut body = vec![0u8; (marker & 0x7fff_ffff) as usize];
    peer.read_exact(&mut body).await?;
    Ok(u32::from_be_bytes([body[0], body[1], body[2], body[3]]))
}

fn options(transport: TransportKind) -> MountOptions {
    MountOptions {
        reconnect_delay_ms: 10,
        ..MountOptions::new("loopback", transport)
    }
}

#[tokio::test]
async fn tcp_session_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let (mut peer, _) = listener.accept().await.expect("accept");
        while let Ok(xid) = read_request(&mut peer).await {
            let framed = frame_record(&reply(xid, b"pong"));
            if peer.write_all(&framed).await.is_err() {
                break;
            }
        }
    });

    let session = MountSession::builder(
        options(TransportKind::Stream),
        TcpConnector::new(addr.to_string()),
    )
    .mount()
    .await
    .expect("mount");

    for _ in 0..3 {
        let reply = session
            .issue_call(null_call(), &Cancellation::new())
            .await
            .expect("null");
        assert_eq!(&reply.results()[..], b"pong");
    }
    assert_eq!(session.stats().requests, 3);
    assert_eq!(session.congestion().sent, 0);
}

#[tokio::test]
async fn tcp_session_survives_server_restart() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let (mut first, _) = listener.accept().await.expect("accept");
        let _ = read_request(&mut first).await;
        drop(first);

        let (mut second, _) = listener.accept().await.expect("accept again");
        while let Ok(xid) = read_request(&mut second).await {
            let framed = frame_record(&reply(xid, b"back"));
            if second.write_all(&framed).await.is_err() {
                break;
            }
        }
    });

    let session = MountSession::builder(
        options(TransportKind::Stream),
        TcpConnector::new(addr.to_string()),
    )
    .mount()
    .await
    .expect("mount");

    let reply = tokio::time::timeout(
        Duration::from_secs(10),
        session.issue_call(null_call(), &Cancellation::new()),
    )
    .await
    .expect("no hang")
    .expect("reply after reconnect");
    assert_eq!(&reply.results()[..], b"back");
    assert!(session.stats().reconnects >= 1);
}

#[tokio::test]
async fn udp_session_round_trip() {
    let server = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    let addr = server.local_addr().expect("addr");
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65_535];
        while let Ok((len, client)) = server.recv_from(&mut buf).await {
            if len < 4 {
                continue;
            }
            let xid = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
            let _ = server.send_to(&reply(xid, b"udp!"), client).await;
        }
    });

    let session = MountSession::builder(
        options(TransportKind::Datagram),
        UdpConnector::new(addr.to_string()),
    )
    .mount()
    .await
    .expect("mount");

    let reply = session
        .issue_call(null_call(), &Cancellation::new())
        .await
        .expect("null");
    assert_eq!(&reply.results()[..], b"udp!");
    assert_eq!(session.stats().retries, 0);
}
