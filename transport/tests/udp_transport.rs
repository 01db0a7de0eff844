use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::Level;
use transport::config::UdpTransportConfig;
use transport::udp_transport::UdpTransport;
use transport::{ConnectionToken, Transport, BROADCAST_CLIENT};

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

async fn udp() -> Arc<UdpTransport> {
    UdpTransport::new(UdpTransportConfig::new(0)).await.unwrap()
}

fn loopback(transport: &UdpTransport) -> String {
    format!("127.0.0.1:{}", transport.local_addr().port())
}

async fn peer_of(transport: &UdpTransport, other: &UdpTransport) -> ConnectionToken {
    transport.connect(&loopback(other)).await.unwrap()
}

async fn receive_datagram(token: &ConnectionToken) -> Vec<u8> {
    timeout(Duration::from_secs(5), async {
        let mut buf = [0u8; 2048];
        loop {
            match token.receive(&mut buf).await {
                Some(0) => sleep(Duration::from_millis(1)).await,
                Some(n) => return buf[..n].to_vec(),
                None => panic!("token was disconnected"),
            }
        }
    }).await.unwrap()
}

#[tokio::test]
async fn test_send_receive() {
    let a = udp().await;
    let b = udp().await;

    let a_to_b = peer_of(&a, &b).await;
    assert!(a_to_b.send(b"ping").await);

    let b_to_a = peer_of(&b, &a).await;
    assert_eq!(receive_datagram(&b_to_a).await, b"ping");
    assert_eq!(b_to_a.receive(&mut [0u8; 16]).await, Some(0));
}

#[tokio::test]
async fn test_datagrams_from_other_peers_are_backlogged() {
    let t = udp().await;
    let a = udp().await;
    let b = udp().await;

    peer_of(&b, &t).await.send(b"from b").await;
    peer_of(&a, &t).await.send(b"from a").await;
    sleep(Duration::from_millis(20)).await;

    let t_a = peer_of(&t, &a).await;
    let t_b = peer_of(&t, &b).await;

    assert_eq!(receive_datagram(&t_a).await, b"from a");

    let mut buf = [0u8; 64];
    let n = t.receive_backlog(&t_b, &mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"from b");
    assert_eq!(t.receive_backlog(&t_b, &mut buf).await, Some(0));
}

#[tokio::test]
async fn test_receive_registers_unseen_sender_with_its_datagram() {
    let t = udp().await;
    let a = udp().await;
    let c = udp().await;

    let t_a = peer_of(&t, &a).await;
    assert_eq!(t.get_clients().await, vec![t_a.clone()]);

    peer_of(&c, &t).await.send(b"from c").await;
    sleep(Duration::from_millis(20)).await;
    peer_of(&a, &t).await.send(b"from a").await;

    assert_eq!(receive_datagram(&t_a).await, b"from a");

    let clients = t.get_clients().await;
    assert_eq!(clients.len(), 2);
    let t_c = clients.into_iter()
        .find(|token| *token != t_a)
        .unwrap();
    assert_eq!(t_c.name(), loopback(&c));
    assert_eq!(peer_of(&t, &c).await, t_c);

    let mut buf = [0u8; 64];
    let n = t.receive_backlog(&t_c, &mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"from c");
    assert_eq!(t_c.receive(&mut buf).await, Some(0));
}

#[tokio::test]
async fn test_unknown_senders_are_registered() {
    let t = udp().await;
    let a = udp().await;
    peer_of(&a, &t).await.send(b"hello").await;

    let mut buf = [0u8; 64];
    let (token, n) = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(x) = t.receive_fresh(&mut buf).await {
                return x;
            }
            sleep(Duration::from_millis(1)).await;
        }
    }).await.unwrap();

    assert_eq!(&buf[..n], b"hello");
    assert_eq!(token.name(), loopback(&a));
    assert_eq!(peer_of(&t, &a).await, token);
    assert_eq!(t.get_clients().await, vec![token]);
}

#[tokio::test]
async fn test_receive_any_prefers_backlog() {
    let t = udp().await;
    let a = udp().await;
    let b = udp().await;

    peer_of(&a, &t).await.send(b"first").await;
    sleep(Duration::from_millis(20)).await;
    let t_b = peer_of(&t, &b).await;
    assert_eq!(t_b.receive(&mut [0u8; 64]).await, Some(0));

    peer_of(&b, &t).await.send(b"second").await;
    sleep(Duration::from_millis(20)).await;

    let mut buf = [0u8; 64];
    let (token, n) = t.receive_any(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"first");
    assert_eq!(token, peer_of(&t, &a).await);

    let (token, n) = t.receive_any(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"second");
    assert_eq!(token, t_b);

    assert!(t.receive_any(&mut buf).await.is_none());
}

#[tokio::test]
async fn test_truncation() {
    let a = udp().await;
    let b = udp().await;
    peer_of(&a, &b).await.send(b"0123456789").await;

    let b_to_a = peer_of(&b, &a).await;
    let mut small = [0u8; 4];
    let n = timeout(Duration::from_secs(5), async {
        loop {
            match b_to_a.receive(&mut small).await {
                Some(0) => sleep(Duration::from_millis(1)).await,
                Some(n) => return n,
                None => panic!("disconnected"),
            }
        }
    }).await.unwrap();
    assert_eq!(n, 4);
    assert_eq!(&small, b"0123");
}

#[tokio::test]
async fn test_broadcast_token_pumps_socket() {
    let t = udp().await;
    let a = udp().await;
    let all = t.connect(BROADCAST_CLIENT).await.unwrap();

    peer_of(&a, &t).await.send(b"queued").await;
    sleep(Duration::from_millis(20)).await;

    assert_eq!(all.receive(&mut [0u8; 64]).await, Some(0));
    let clients = t.get_clients().await;
    assert_eq!(clients.len(), 2);

    let t_a = peer_of(&t, &a).await;
    let mut buf = [0u8; 64];
    let n = t.receive_backlog(&t_a, &mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"queued");
}

#[tokio::test]
async fn test_named_send_receive() {
    let a = udp().await;
    let b = udp().await;

    assert!(a.send_named(&loopback(&b), b"by name").await);
    let n = timeout(Duration::from_secs(5), async {
        let mut buf = [0u8; 64];
        loop {
            match b.receive_named(&loopback(&a), &mut buf).await {
                Some(0) => sleep(Duration::from_millis(1)).await,
                Some(n) => return buf[..n].to_vec(),
                None => panic!("disconnected"),
            }
        }
    }).await.unwrap();
    assert_eq!(n, b"by name");

    assert!(!a.send_named("not an address", b"x").await);
    assert_eq!(a.receive_named("not an address", &mut [0u8; 16]).await, None);
}

#[tokio::test]
async fn test_receive_task_drains_socket() {
    let t = udp().await;
    let a = udp().await;
    let mut task = t.spawn_receive_task(Duration::from_millis(5)).unwrap();

    let a_to_t = peer_of(&a, &t).await;
    a_to_t.send(b"one").await;
    a_to_t.send(b"two").await;

    let t_a = peer_of(&t, &a).await;
    let drained = timeout(Duration::from_secs(5), async {
        let mut buf = [0u8; 64];
        let mut result = Vec::new();
        while result.len() < 2 {
            match t.receive_backlog(&t_a, &mut buf).await {
                Some(0) => sleep(Duration::from_millis(1)).await,
                Some(n) => result.push(buf[..n].to_vec()),
                None => panic!("unknown token"),
            }
        }
        result
    }).await.unwrap();
    assert_eq!(drained, vec![b"one".to_vec(), b"two".to_vec()]);

    task.stop().await;
}

#[tokio::test]
async fn test_shut_down() {
    let t = udp().await;
    let a = udp().await;
    let token = peer_of(&t, &a).await;

    t.shut_down().await;
    assert!(!token.is_connected());
    assert!(t.get_clients().await.is_empty());
    assert!(!token.send(b"gone").await);
}

#[tokio::test]
async fn test_concurrent_drains_keep_datagrams_intact() {
    let t = udp().await;
    let a = udp().await;
    let a_to_t = peer_of(&a, &t).await;
    let t_a = peer_of(&t, &a).await;

    for i in 0..100u8 {
        a_to_t.send(&[i; 100]).await;
    }
    sleep(Duration::from_millis(20)).await;

    let (first, second) = tokio::join!(t.drain_socket(), t.drain_socket());
    assert_eq!(first + second, 100);

    let mut buf = [0u8; 256];
    let mut received = Vec::new();
    while let Some(n) = t.receive_backlog(&t_a, &mut buf).await {
        if n == 0 {
            break;
        }
        received.push(buf[..n].to_vec());
    }
    let expected: Vec<Vec<u8>> = (0..100u8).map(|i| vec![i; 100]).collect();
    assert_eq!(received, expected);
}
