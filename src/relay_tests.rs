use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::proxy::SocksListener;
use crate::relay::{RelayConnection, RelayState};
use crate::test_transport::LoopbackSession;
use crate::transport::SecureSession;
use crate::tunnel_stats::TunnelStats;

fn peer() -> SocketAddr {
    "127.0.0.1:50000".parse().unwrap()
}

fn connect_request(addr: SocketAddr) -> Vec<u8> {
    let SocketAddr::V4(addr) = addr else {
        panic!("loopback listeners are IPv4");
    };
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&addr.ip().octets());
    request.extend_from_slice(&addr.port().to_be_bytes());
    request
}

async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn non_socks5_greeting_is_dropped_without_reply() {
    let (client, mut client_peer) = duplex(1024);
    let session: Arc<dyn SecureSession> = LoopbackSession::new();
    let stats = TunnelStats::new();

    client_peer.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
    let relay = RelayConnection::new(client, peer(), session, Arc::clone(&stats));
    assert_eq!(relay.run().await, RelayState::AwaitingGreeting);

    let mut received = Vec::new();
    client_peer.read_to_end(&mut received).await.unwrap();
    assert!(received.is_empty());
    assert_eq!(stats.snapshot().handshakes_rejected, 1);
}

#[tokio::test]
async fn unsupported_command_closes_after_greeting_reply() {
    let (client, mut client_peer) = duplex(1024);
    let session: Arc<dyn SecureSession> = LoopbackSession::new();

    client_peer.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    client_peer
        .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
        .await
        .unwrap();
    let relay = RelayConnection::new(client, peer(), session, TunnelStats::new());
    assert_eq!(relay.run().await, RelayState::AwaitingRequest);

    let mut received = Vec::new();
    client_peer.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, [0x05, 0x00]);
}

#[tokio::test]
async fn refused_channel_echoes_request_with_failure_code() {
    let (client, mut client_peer) = duplex(1024);
    let loopback = LoopbackSession::new();
    loopback.refuse_channels();
    let session: Arc<dyn SecureSession> = loopback;
    let stats = TunnelStats::new();

    let mut request = vec![0x05, 0x01, 0x00, 0x03, 11];
    request.extend_from_slice(b"example.com");
    request.extend_from_slice(&80u16.to_be_bytes());

    client_peer.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    client_peer.write_all(&request).await.unwrap();
    let relay = RelayConnection::new(client, peer(), session, Arc::clone(&stats));
    relay.run().await;

    let mut received = Vec::new();
    client_peer.read_to_end(&mut received).await.unwrap();
    let mut expected = vec![0x05, 0x00];
    let mut failure = request.clone();
    failure[1] = 0x05;
    expected.extend_from_slice(&failure);
    assert_eq!(received, expected);

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.channels_refused, 1);
    assert_eq!(snapshot.total_relays, 0);
}

#[tokio::test]
async fn closed_session_fails_requests_but_not_the_listener() {
    let loopback = LoopbackSession::new();
    let session: Arc<dyn SecureSession> = loopback.clone();
    let listener = SocksListener::new(session, TunnelStats::new())
        .start()
        .await
        .unwrap();
    loopback.close();

    let target = echo_server().await;
    for _ in 0..2 {
        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        client.write_all(&connect_request(target)).await.unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(&received[..2], &[0x05, 0x00]);
        assert_eq!(received[3], 0x05, "failure status in echoed request");
    }
    listener.stop().await;
}

#[tokio::test]
async fn listener_relays_bytes_end_to_end() {
    let target = echo_server().await;
    let session: Arc<dyn SecureSession> = LoopbackSession::new();
    let stats = TunnelStats::new();
    let listener = SocksListener::new(session, Arc::clone(&stats))
        .start()
        .await
        .unwrap();
    assert!(listener.local_addr().ip().is_loopback());
    assert_ne!(listener.port(), 0);

    let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
    client.write_all(&[0x05, 0x02, 0x00, 0x02]).await.unwrap();
    let mut method = [0u8; 2];
    client.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    let request = connect_request(target);
    client.write_all(&request).await.unwrap();
    let mut reply = vec![0u8; request.len()];
    client.read_exact(&mut reply).await.unwrap();
    let mut expected = request.clone();
    expected[1] = 0x00;
    assert_eq!(reply, expected);

    client.write_all(b"hello through the tunnel").await.unwrap();
    let mut echoed = [0u8; 24];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"hello through the tunnel");
    assert_eq!(stats.snapshot().active_relays, 1);

    drop(client);
    listener.stop().await;
}

#[tokio::test]
async fn stopped_listener_releases_its_port() {
    let session: Arc<dyn SecureSession> = LoopbackSession::new();
    let listener = SocksListener::new(session, TunnelStats::new())
        .start()
        .await
        .unwrap();
    let addr = listener.local_addr();
    listener.stop().await;

    assert!(TcpStream::connect(addr).await.is_err());
}
