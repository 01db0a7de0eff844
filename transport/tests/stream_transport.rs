use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use rstest::rstest;
use tokio::time::{sleep, timeout};
use tracing::Level;
use transport::config::StreamTransportConfig;
use transport::stream_transport::{StreamProtocol, StreamTransport};
use transport::{ConnectionToken, Transport, BROADCAST_CLIENT};

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

async fn server(protocol: StreamProtocol) -> (Arc<StreamTransport>, u16) {
    let server = StreamTransport::new(protocol, StreamTransportConfig::server(0)).await.unwrap();
    let port = server.local_addr().await.unwrap().port();
    (server, port)
}

async fn client(protocol: StreamProtocol, port: u16) -> Arc<StreamTransport> {
    StreamTransport::new(protocol, StreamTransportConfig::client(Ipv4Addr::LOCALHOST.into(), port)).await.unwrap()
}

async fn accept_one(server: &StreamTransport) -> ConnectionToken {
    timeout(Duration::from_secs(5), async {
        loop {
            if let Some(token) = server.accept_new_connections().await.pop() {
                return token;
            }
            sleep(Duration::from_millis(1)).await;
        }
    }).await.unwrap()
}

async fn receive_exactly(token: &ConnectionToken, len: usize) -> Vec<u8> {
    timeout(Duration::from_secs(5), async {
        let mut result = Vec::new();
        let mut buf = [0u8; 1024];
        while result.len() < len {
            match token.receive(&mut buf).await {
                Some(0) => sleep(Duration::from_millis(1)).await,
                Some(n) => result.extend_from_slice(&buf[..n]),
                None => panic!("peer disconnected"),
            }
        }
        result
    }).await.unwrap()
}

async fn wait_for_disconnect(token: &ConnectionToken) {
    timeout(Duration::from_secs(5), async {
        let mut buf = [0u8; 1024];
        while token.receive(&mut buf).await.is_some() {
            sleep(Duration::from_millis(1)).await;
        }
    }).await.unwrap()
}

#[rstest]
#[case::tcp(StreamProtocol::Tcp)]
#[case::sctp(StreamProtocol::Sctp)]
#[tokio::test]
async fn test_send_receive(#[case] protocol: StreamProtocol) {
    if !protocol.is_supported() {
        eprintln!("{} is not supported on this system - skipping", protocol);
        return;
    }

    let (server, port) = server(protocol).await;
    let client = client(protocol, port).await;
    let client_token = client.connect().await.unwrap();
    let server_token = accept_one(&server).await;
    assert_eq!(server_token.name(), "127.0.0.1");
    assert_eq!(server.get_clients().await, vec![server_token.clone()]);

    assert_eq!(server_token.receive(&mut [0u8; 16]).await, Some(0));

    assert!(client_token.send(b"hello server").await);
    assert_eq!(receive_exactly(&server_token, 12).await, b"hello server");

    assert!(server_token.send(b"hello client").await);
    assert_eq!(receive_exactly(&client_token, 12).await, b"hello client");

    server.shut_down().await;
    client.shut_down().await;
}

#[tokio::test]
async fn test_disconnect_is_observed_by_peer() {
    let (server, port) = server(StreamProtocol::Tcp).await;
    let client = client(StreamProtocol::Tcp, port).await;
    let client_token = client.connect().await.unwrap();
    let server_token = accept_one(&server).await;

    client_token.disconnect().await;
    client_token.disconnect().await;
    assert!(!client_token.is_connected());
    assert!(client.get_clients().await.is_empty());
    assert!(!client_token.send(b"abc").await);

    wait_for_disconnect(&server_token).await;
    assert!(!server_token.is_connected());
    assert!(server.get_clients().await.is_empty());

    server_token.disconnect().await;
    server.disconnect_client(&server_token).await;
}

#[tokio::test]
async fn test_client_reconnects_lazily() {
    let (server, port) = server(StreamProtocol::Tcp).await;
    let client = client(StreamProtocol::Tcp, port).await;
    let first = client.connect().await.unwrap();
    assert_eq!(client.connect().await, Some(first.clone()));

    let server_side = accept_one(&server).await;
    server_side.disconnect().await;
    wait_for_disconnect(&first).await;
    assert!(client.get_clients().await.is_empty());

    let second = client.connect().await.unwrap();
    assert_ne!(first, second);
    let server_side = accept_one(&server).await;

    assert!(second.send(b"again").await);
    assert_eq!(receive_exactly(&server_side, 5).await, b"again");
}

#[tokio::test]
async fn test_client_without_server() {
    let (server, port) = server(StreamProtocol::Tcp).await;
    server.shut_down().await;
    drop(server);

    let client = client(StreamProtocol::Tcp, port).await;
    assert!(client.get_clients().await.is_empty());
    assert_eq!(client.connect().await, None);
}

#[tokio::test]
async fn test_several_clients_from_same_address() {
    let (server, port) = server(StreamProtocol::Tcp).await;
    let client_a = client(StreamProtocol::Tcp, port).await;
    let client_b = client(StreamProtocol::Tcp, port).await;
    let token_a = client_a.connect().await.unwrap();
    let token_b = client_b.connect().await.unwrap();

    accept_one(&server).await;
    if server.get_clients().await.len() < 2 {
        accept_one(&server).await;
    }
    let clients = server.get_clients().await;
    assert_eq!(clients.len(), 2);
    assert!(clients.iter().all(|c| c.name() == "127.0.0.1"));

    assert!(server.send_named(BROADCAST_CLIENT, b"to all").await);
    assert_eq!(receive_exactly(&token_a, 6).await, b"to all");
    assert_eq!(receive_exactly(&token_b, 6).await, b"to all");

    assert!(server.send_named("127.0.0.1", b"by name").await);
    assert_eq!(receive_exactly(&token_a, 7).await, b"by name");
    assert_eq!(receive_exactly(&token_b, 7).await, b"by name");

    assert!(!server.send_named("10.1.2.3", b"nobody").await);
}

#[tokio::test]
async fn test_concurrent_send_accept_and_disconnect() {
    let (server, port) = server(StreamProtocol::Tcp).await;
    let first_client = client(StreamProtocol::Tcp, port).await;
    let first_client_token = first_client.connect().await.unwrap();
    let first = accept_one(&server).await;

    let sender = {
        let first = first.clone();
        tokio::spawn(async move {
            for _ in 0..200 {
                first.send(b"0123456789").await;
                tokio::task::yield_now().await;
            }
        })
    };

    let mut late_clients = Vec::new();
    for _ in 0..5 {
        let late = client(StreamProtocol::Tcp, port).await;
        let token = accept_one(&server).await;
        token.disconnect().await;
        late_clients.push(late);
    }

    timeout(Duration::from_secs(10), sender).await.unwrap().unwrap();
    assert_eq!(receive_exactly(&first_client_token, 2000).await.len(), 2000);
    assert_eq!(server.get_clients().await, vec![first]);
}

#[tokio::test]
async fn test_shut_down_disconnects_everything() {
    let (server, port) = server(StreamProtocol::Tcp).await;
    let client = client(StreamProtocol::Tcp, port).await;
    let client_token = client.connect().await.unwrap();
    let server_token = accept_one(&server).await;

    server.shut_down().await;
    assert!(!server_token.is_connected());
    assert!(server.get_clients().await.is_empty());
    assert!(server.accept_new_connections().await.is_empty());
    assert_eq!(server.local_addr().await, None);

    wait_for_disconnect(&client_token).await;
}

#[tokio::test]
async fn test_tokens_of_other_transports_are_rejected() {
    let (server, port) = server(StreamProtocol::Tcp).await;
    let client = client(StreamProtocol::Tcp, port).await;
    let client_token = client.connect().await.unwrap();

    assert!(!server.check_token(&client_token));
    assert_eq!(server.receive(&client_token, &mut [0u8; 16]).await, None);
    assert!(!server.send(&client_token, b"abc").await);
    assert!(client_token.is_connected());
}

#[tokio::test]
async fn test_peer_that_does_not_read_does_not_block_sends() {
    let config = StreamTransportConfig {
        send_timeout: Duration::from_millis(200),
        ..StreamTransportConfig::server(0)
    };
    let server = StreamTransport::tcp(config).await.unwrap();
    let port = server.local_addr().await.unwrap().port();
    let client = client(StreamProtocol::Tcp, port).await;
    let _client_token = client.connect().await.unwrap();
    let server_token = accept_one(&server).await;

    let chunk = vec![7u8; 1024 * 1024];
    let sending = timeout(Duration::from_secs(5), async {
        for _ in 0..50 {
            if !server_token.send(&chunk).await {
                break;
            }
        }
    }).await;
    assert!(sending.is_ok(), "sending stalled on a peer that does not read");

    server.shut_down().await;
    client.shut_down().await;
}

#[rstest]
#[case::tcp(StreamProtocol::Tcp, false)]
#[case::sctp(StreamProtocol::Sctp, true)]
#[tokio::test]
async fn test_message_boundaries(#[case] protocol: StreamProtocol, #[case] expected: bool) {
    // a server that can not listen is still created, so this works without kernel SCTP support
    let server = StreamTransport::new(protocol, StreamTransportConfig::server(0)).await.unwrap();
    assert_eq!(server.preserves_message_boundaries(), expected);
    assert_eq!(server.kind(), protocol.transport_kind());
    server.shut_down().await;
}
