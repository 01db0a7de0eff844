use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::Level;
use transport::config::{ReliableUdpConfig, UdpTransportConfig};
use transport::reliable_udp::ReliableUdpTransport;
use transport::udp_transport::UdpTransport;
use transport::{ConnectionToken, Transport, TransportKind};

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

fn config() -> ReliableUdpConfig {
    ReliableUdpConfig {
        tick_interval: Duration::from_millis(5),
        retransmit_timeout: Duration::from_millis(20),
        max_retransmissions: 3,
        send_window_size: 8,
        ..ReliableUdpConfig::new(0)
    }
}

fn loopback(port: u16) -> String {
    format!("127.0.0.1:{}", port)
}

async fn receive_messages(token: &ConnectionToken, count: usize) -> Vec<Vec<u8>> {
    timeout(Duration::from_secs(10), async {
        let mut buf = [0u8; 2048];
        let mut result = Vec::new();
        while result.len() < count {
            match token.receive(&mut buf).await {
                Some(0) => sleep(Duration::from_millis(1)).await,
                Some(n) => result.push(buf[..n].to_vec()),
                None => panic!("disconnected"),
            }
        }
        result
    }).await.unwrap()
}

#[tokio::test]
async fn test_in_order_delivery() {
    let a = ReliableUdpTransport::new(config()).await.unwrap();
    let b = ReliableUdpTransport::new(config()).await.unwrap();
    assert_eq!(a.kind(), TransportKind::ReliableUdp);
    assert!(a.preserves_message_boundaries());

    let a_to_b = a.connect(&loopback(b.local_addr().port())).await.unwrap();
    let b_to_a = b.connect(&loopback(a.local_addr().port())).await.unwrap();

    let messages: Vec<Vec<u8>> = (0..50u32)
        .map(|i| format!("message #{}", i).into_bytes())
        .collect();
    for message in &messages {
        assert!(a_to_b.send(message).await);
    }

    assert_eq!(receive_messages(&b_to_a, messages.len()).await, messages);
    assert_eq!(b_to_a.receive(&mut [0u8; 64]).await, Some(0));

    a.shut_down().await;
    b.shut_down().await;
}

#[tokio::test]
async fn test_peer_registered_from_first_packet() {
    let a = ReliableUdpTransport::new(config()).await.unwrap();
    let b = ReliableUdpTransport::new(config()).await.unwrap();

    let a_to_b = a.connect(&loopback(b.local_addr().port())).await.unwrap();
    assert!(a_to_b.send(b"unannounced").await);

    let b_to_a = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(token) = b.get_clients().await.pop() {
                return token;
            }
            sleep(Duration::from_millis(1)).await;
        }
    }).await.unwrap();
    assert_eq!(b_to_a.name(), loopback(a.local_addr().port()));
    assert_eq!(receive_messages(&b_to_a, 1).await, vec![b"unannounced".to_vec()]);
}

#[tokio::test]
async fn test_unresponsive_peer_is_disconnected() {
    let a = ReliableUdpTransport::new(config()).await.unwrap();
    let silent: Arc<UdpTransport> = UdpTransport::new(UdpTransportConfig::new(0)).await.unwrap();

    let token = a.connect(&loopback(silent.local_addr().port())).await.unwrap();
    assert!(token.send(b"anybody there?").await);

    timeout(Duration::from_secs(5), async {
        while token.is_connected() {
            sleep(Duration::from_millis(5)).await;
        }
    }).await.unwrap();

    assert!(a.get_clients().await.is_empty());
    assert!(!token.send(b"still there?").await);

    // the original packet plus three retransmissions
    let silent_to_a = silent.connect(&loopback(a.local_addr().port())).await.unwrap();
    let mut num_received = 0;
    while silent_to_a.receive(&mut [0u8; 64]).await.unwrap() > 0 {
        num_received += 1;
    }
    assert_eq!(num_received, 4);
}

#[tokio::test]
async fn test_send_window_blocks_until_acked() {
    let a = ReliableUdpTransport::new(ReliableUdpConfig {
        send_window_size: 2,
        ..config()
    }).await.unwrap();
    let b = ReliableUdpTransport::new(config()).await.unwrap();

    let a_to_b = a.connect(&loopback(b.local_addr().port())).await.unwrap();
    for i in 0..10u8 {
        assert!(timeout(Duration::from_secs(5), a_to_b.send(&[i])).await.unwrap());
    }

    let b_to_a = b.connect(&loopback(a.local_addr().port())).await.unwrap();
    let received = receive_messages(&b_to_a, 10).await;
    assert_eq!(received, (0..10u8).map(|i| vec![i]).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let a = ReliableUdpTransport::new(config()).await.unwrap();
    let token = a.connect("127.0.0.1:40001").await.unwrap();
    assert_eq!(a.connect("127.0.0.1:40001").await.unwrap(), token);

    token.disconnect().await;
    token.disconnect().await;
    a.disconnect_client(&token).await;

    assert!(a.get_clients().await.is_empty());
    assert_eq!(token.receive(&mut [0u8; 16]).await, None);
}
