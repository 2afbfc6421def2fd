use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::Framed;

use hl7_mllp_sim::ack::{AckKind, AckStatus};
use hl7_mllp_sim::{
    find_field, ChannelSink, Client, MessageSink, MllpCodec, SendOptions, Server, TransportError,
};

const MESSAGE: &[u8] = b"MSH|^~\\&|SIM|FAC|RCV|RFAC|20240101120000||ADT^A01|CTL123|P|2.5\rPID|1||12345\r";

fn options(ack_timeout: Duration) -> SendOptions {
    SendOptions {
        ack_timeout,
        ..SendOptions::default()
    }
}

/// A peer that answers every frame with a canned ack
async fn canned_responder(reply: &'static [u8]) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut transport = Framed::new(stream, MllpCodec::new());
        while let Some(Ok(_)) = transport.next().await {
            transport.send(BytesMut::from(reply)).await.unwrap();
        }
    });
    port
}

async fn start_server() -> (u16, tokio::sync::mpsc::UnboundedReceiver<bytes::Bytes>, watch::Sender<bool>, tokio::task::JoinHandle<Result<(), TransportError>>) {
    let server = Server::bind("127.0.0.1:0").await.unwrap();
    let port = server.local_addr().unwrap().port();
    let (sink, rx) = ChannelSink::channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(server.run(Arc::new(sink), shutdown_rx));
    (port, rx, shutdown_tx, handle)
}

#[tokio::test]
async fn client_decodes_application_accept() {
    let port = canned_responder(b"MSH|^~\\&|||||20240101120000||ACK|CTL123|P|2.5\rMSA|AA|CTL123|OK|").await;

    let code = Client::new(options(Duration::from_secs(5)))
        .send("127.0.0.1", port, MESSAGE)
        .await
        .unwrap();

    assert_eq!(code.kind, AckKind::Application);
    assert_eq!(code.status, AckStatus::Accept);
    assert_eq!(code.to_string(), "AA");
}

#[tokio::test]
async fn client_reports_reject() {
    let port = canned_responder(b"MSH|^~\\&|||||20240101120000||ACK|CTL123|P|2.5\rMSA|AR|CTL123|").await;

    let code = Client::new(options(Duration::from_secs(5)))
        .send("127.0.0.1", port, MESSAGE)
        .await
        .unwrap();

    assert_eq!(code.status, AckStatus::Reject);
    assert!(!code.is_accept());
}

#[tokio::test]
async fn garbage_ack_is_a_parse_error() {
    let port = canned_responder(b"not an ack").await;

    let result = Client::new(options(Duration::from_secs(5)))
        .send("127.0.0.1", port, MESSAGE)
        .await;

    assert!(matches!(result, Err(TransportError::AckParse(_))));
}

#[tokio::test]
async fn silent_peer_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        // read and never answer
        while let Ok(n) = stream.read(&mut buf).await {
            if n == 0 {
                break;
            }
        }
    });

    let timeout = Duration::from_millis(300);
    let started = Instant::now();
    let result = Client::new(options(timeout)).send("127.0.0.1", port, MESSAGE).await;
    let elapsed = started.elapsed();

    match result {
        Err(TransportError::AckTimeout(d)) => assert_eq!(d, timeout),
        other => panic!("Expected AckTimeout, got {:?}", other),
    }
    assert!(elapsed >= timeout, "gave up early after {:?}", elapsed);
    assert!(elapsed < timeout + Duration::from_secs(2), "took {:?}", elapsed);
}

#[tokio::test]
async fn send_returns_first_ack_and_still_sends_the_rest() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (count_tx, count_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut transport = Framed::new(stream, MllpCodec::new());
        let mut received = 0;
        while let Some(Ok(_)) = transport.next().await {
            received += 1;
            // only the first message is ever answered
            if received == 1 {
                let ack = &b"MSH|^~\\&|||||20240101120000||ACK|ONE|P|2.5\rMSA|AA|ONE|"[..];
                transport.send(BytesMut::from(ack)).await.unwrap();
            }
        }
        let _ = count_tx.send(received);
    });

    let payload = b"MSH|^~\\&|A||||||ADT^A01|ONE|P|2.5\rPID|1\rMSH|^~\\&|A||||||ADT^A01|TWO|P|2.5\rPID|2\r";
    let code = Client::new(options(Duration::from_millis(300)))
        .send("127.0.0.1", port, payload)
        .await
        .unwrap();
    assert_eq!(code.to_string(), "AA");

    let received = tokio::time::timeout(Duration::from_secs(5), count_rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, 2);
}

#[tokio::test]
async fn closed_port_is_a_connect_error() {
    // bind then drop, so nothing listens on this port
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let result = Client::new(options(Duration::from_secs(1)))
        .send("127.0.0.1", port, MESSAGE)
        .await;

    assert!(matches!(result, Err(TransportError::Connect { .. })));
}

#[tokio::test]
async fn empty_payload_sends_nothing() {
    let result = Client::default().send("127.0.0.1", 1, b"\r\n").await;
    assert!(matches!(result, Err(TransportError::EmptyPayload)));
}

#[tokio::test]
async fn server_acks_and_delivers() {
    let (port, mut rx, shutdown_tx, handle) = start_server().await;

    let acks = Client::new(options(Duration::from_secs(5)))
        .send_all("127.0.0.1", port, MESSAGE)
        .await
        .unwrap();

    assert_eq!(acks.len(), 1);
    assert!(acks[0].code.is_accept());
    assert_eq!(acks[0].control_id.as_deref(), Some("CTL123"));

    let delivered = rx.recv().await.unwrap();
    assert_eq!(&delivered[..], MESSAGE);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn each_message_in_a_payload_gets_its_own_ack() {
    let (port, mut rx, shutdown_tx, handle) = start_server().await;

    let payload = b"MSH|^~\\&|A||||||ADT^A01|ONE|P|2.5\rPID|1\rMSH|^~\\&|A||||||ADT^A01|TWO|P|2.5\rPID|2\r";
    let acks = Client::default()
        .send_all("127.0.0.1", port, payload)
        .await
        .unwrap();

    let ids: Vec<_> = acks.iter().filter_map(|a| a.control_id.clone()).collect();
    assert_eq!(ids, vec!["ONE", "TWO"]);

    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    assert_eq!(find_field(&first, "MSH", 10), Some(&b"ONE"[..]));
    assert_eq!(find_field(&second, "MSH", 10), Some(&b"TWO"[..]));

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn message_split_across_writes_is_delivered_once() {
    let (port, mut rx, shutdown_tx, handle) = start_server().await;

    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let framed = hl7_mllp_sim::mllp::wrap(MESSAGE);
    let (head, tail) = framed.split_at(framed.len() / 2);

    stream.write_all(head).await.unwrap();
    stream.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    stream.write_all(tail).await.unwrap();

    let delivered = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&delivered[..], MESSAGE);

    // the ack comes back framed, starting with the start block
    let mut buf = [0u8; 256];
    let n = stream.read(&mut buf).await.unwrap();
    assert!(n > 0);
    assert_eq!(buf[0], hl7_mllp_sim::mllp::START_BLOCK);

    drop(stream);
    assert!(
        tokio::time::timeout(Duration::from_millis(200), rx.recv()).await.is_err(),
        "message was delivered more than once"
    );

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn server_stops_when_shutdown_sender_is_dropped() {
    let (_port, _rx, shutdown_tx, handle) = start_server().await;
    drop(shutdown_tx);

    let result = tokio::time::timeout(Duration::from_secs(5), handle).await;
    assert!(result.is_ok(), "server kept running");
}

/// Blocks the calling thread for a while on messages with control id SLOW
struct SlowSink {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl MessageSink for SlowSink {
    fn deliver(&self, message: Bytes) -> io::Result<()> {
        if find_field(&message, "MSH", 10) == Some(&b"SLOW"[..]) {
            std::thread::sleep(Duration::from_millis(1500));
        }
        self.tx
            .send(message)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "receiver gone"))
    }
}

#[tokio::test]
async fn blocking_sink_does_not_stall_other_connections() {
    let server = Server::bind("127.0.0.1:0").await.unwrap();
    let port = server.local_addr().unwrap().port();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(server.run(Arc::new(SlowSink { tx }), shutdown_rx));

    let slow = tokio::spawn(async move {
        Client::new(options(Duration::from_secs(5)))
            .send("127.0.0.1", port, b"MSH|^~\\&|A||||||ADT^A01|SLOW|P|2.5\rPID|1\r")
            .await
    });
    // give the first connection time to reach its sink
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    let code = Client::new(options(Duration::from_secs(5)))
        .send("127.0.0.1", port, MESSAGE)
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(code.is_accept());
    assert!(elapsed < Duration::from_secs(1), "second connection waited {:?}", elapsed);
    assert!(slow.await.unwrap().unwrap().is_accept());

    // the fast message gets through first, the slow one follows once its sink returns
    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    let second = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(find_field(&first, "MSH", 10), Some(&b"CTL123"[..]));
    assert_eq!(find_field(&second, "MSH", 10), Some(&b"SLOW"[..]));

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
}
