//! End-to-end scenarios (spec §8, S1/S2/S5/S6) driven over real loopback TCP
//! connections, standing in for the external connection host and protocol
//! adapter that the unit tests (colocated with each module) can't exercise
//! together.
//!
//! The wire format here is a minimal stand-in invented for this test file: a
//! 4-byte big-endian length prefix (covering everything after it), a 4-byte
//! big-endian sequence id, then the body. It exists only so `TestProtocol`
//! has something concrete to parse; it carries no meaning beyond this file.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use rpcore::{Client, ClientConfig, Error, Message, Protocol};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

#[derive(Debug, Clone)]
struct TestMessage {
    seq_id: i32,
    body: Vec<u8>,
}

impl Message for TestMessage {
    fn seq_id(&self) -> i32 {
        self.seq_id
    }
}

struct TestProtocol {
    is_async: bool,
}

impl Protocol for TestProtocol {
    type Message = TestMessage;

    fn is_async(&self) -> bool {
        self.is_async
    }

    fn parse(&self, buf: &[u8]) -> Result<Option<(TestMessage, usize)>, Error> {
        if buf.len() < 8 {
            return Ok(None);
        }
        let len = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
        let total = 4 + len;
        if buf.len() < total {
            return Ok(None);
        }
        let seq_id = i32::from_be_bytes(buf[4..8].try_into().unwrap());
        let body = buf[8..total].to_vec();
        Ok(Some((TestMessage { seq_id, body }, total)))
    }
}

fn frame(seq_id: i32, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + body.len());
    buf.put_u32((4 + body.len()) as u32);
    buf.put_i32(seq_id);
    buf.put_slice(body);
    buf.freeze()
}

/// Reads off `stream` until one full frame has arrived, returning its
/// sequence id and body. Leaves any trailing bytes belonging to the next
/// frame unread (this helper is only ever used with one in-flight frame at a
/// time in these tests).
async fn read_one_request(stream: &mut TcpStream) -> (i32, Vec<u8>) {
    let protocol = TestProtocol { is_async: true };
    let mut buf = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        if let Ok(Some((msg, _consumed))) = protocol.parse(&buf) {
            return (msg.seq_id, msg.body);
        }
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before a full request arrived");
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn write_response(stream: &mut TcpStream, seq_id: i32, body: &[u8]) {
    stream.write_all(&frame(seq_id, body)).await.unwrap();
}

/// Accepts one connection and echoes every frame it receives back verbatim,
/// forever (until the peer disconnects). Stands in for an always-on server.
async fn echo_server(listener: TcpListener) {
    let (mut stream, _) = listener.accept().await.unwrap();
    loop {
        let protocol = TestProtocol { is_async: true };
        let mut buf = Vec::new();
        let mut chunk = [0u8; 256];
        let (seq_id, body) = loop {
            if let Ok(Some((msg, _consumed))) = protocol.parse(&buf) {
                break (msg.seq_id, msg.body);
            }
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        };
        if stream.write_all(&frame(seq_id, &body)).await.is_err() {
            return;
        }
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within the polling window");
}

fn fast_config() -> ClientConfig {
    ClientConfig::new()
        .with_send_timeout(Duration::from_millis(300))
        .with_pending_tick_interval(Duration::from_millis(20))
        .with_registry_scan_interval(Duration::from_millis(30))
}

/// Builds a pair of single-shot callbacks that forward into one
/// `oneshot::Receiver<Result<M, Error>>`. `Request::new`'s callbacks are each
/// only `FnOnce`, but the API takes two separate closures for the two
/// mutually-exclusive outcomes, so both close over a shared slot and race to
/// take it (only one ever fires).
fn result_channel<M: Send + 'static>() -> (
    impl Fn(Error) + Send + 'static,
    impl Fn(M) + Send + 'static,
    oneshot::Receiver<Result<M, Error>>,
) {
    let (tx, rx) = oneshot::channel();
    let tx = Arc::new(Mutex::new(Some(tx)));
    let tx_err = tx.clone();
    let on_exception = move |err: Error| {
        if let Some(tx) = tx_err.lock().unwrap().take() {
            let _ = tx.send(Err(err));
        }
    };
    let on_result = move |msg: M| {
        if let Some(tx) = tx.lock().unwrap().take() {
            let _ = tx.send(Ok(msg));
        }
    };
    (on_exception, on_result, rx)
}

async fn bind_loopback() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// S1: one node, no init function, a server that echoes back the same
/// sequence id a few milliseconds later. Expect exactly one `on_result`.
#[tokio::test]
async fn s1_happy_path_completes_with_result() {
    let (listener, addr) = bind_loopback().await;
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (seq_id, body) = read_one_request(&mut stream).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        write_response(&mut stream, seq_id, &body).await;
    });

    let client = Client::new(TestProtocol { is_async: true }, fast_config());
    assert!(client.try_register_endpoint("node-a", addr, None));
    wait_until(|| client.connection_count() == 1).await;

    let (on_exception, on_result, rx) = result_channel::<TestMessage>();
    let seq_id = client.next_seq_id();
    let req = client.new_request_with_seq_id(
        seq_id,
        "echo",
        frame(seq_id, &[0x01, 0x02]),
        Some(Duration::from_millis(1000)),
        on_exception,
        on_result,
    );
    client.send(req);

    let result = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
    let msg = result.expect("expected a successful result");
    assert_eq!(msg.seq_id, seq_id);
    assert_eq!(msg.body, vec![0x01, 0x02]);
}

/// S2: the server reads the request but never answers it. Expect
/// `ReceiveTimeout` within the request's deadline, not before and not
/// indefinitely after.
#[tokio::test]
async fn s2_receive_timeout_without_response() {
    let (listener, addr) = bind_loopback().await;
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_one_request(&mut stream).await;
        // Hold the connection open but never reply.
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let client = Client::new(TestProtocol { is_async: true }, fast_config());
    client.try_register_endpoint("node-a", addr, None);
    wait_until(|| client.connection_count() == 1).await;

    let (on_exception, on_result, rx) = result_channel::<TestMessage>();
    let seq_id = client.next_seq_id();
    let req = client.new_request_with_seq_id(
        seq_id,
        "slow",
        frame(seq_id, &[0xaa]),
        Some(Duration::from_millis(200)),
        on_exception,
        on_result,
    );
    let sent_at = std::time::Instant::now();
    client.send(req);

    let result = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
    let elapsed = sent_at.elapsed();
    assert!(elapsed >= Duration::from_millis(200), "fired before the deadline: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1000), "took far longer than the deadline: {elapsed:?}");
    match result {
        Err(Error::ReceiveTimeout { name }) => assert_eq!(name, "slow"),
        other => panic!("expected ReceiveTimeout, got {other:?}"),
    }
}

/// S5: no endpoint registered at all. Expect `PendingSendTimeout` once the
/// request ages past the configured send timeout.
#[tokio::test]
async fn s5_pending_timeout_without_any_endpoint() {
    let client = Client::new(TestProtocol { is_async: true }, fast_config());

    let (on_exception, on_result, rx) = result_channel::<TestMessage>();
    let seq_id = client.next_seq_id();
    let req = client.new_request_with_seq_id(
        seq_id,
        "noop",
        frame(seq_id, &[]),
        Some(Duration::from_secs(5)),
        on_exception,
        on_result,
    );
    client.send(req);

    let result = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
    match result {
        Err(Error::PendingSendTimeout { name }) => assert_eq!(name, "noop"),
        other => panic!("expected PendingSendTimeout, got {other:?}"),
    }
}

/// S6: a request in flight on a connection that then dies must not be failed
/// synchronously; it ages out via `ReceiveTimeout` at its own deadline while
/// requests issued after the failover land only on the surviving connection.
#[tokio::test]
async fn s6_failover_routes_to_survivor_and_ages_out_the_dead_request() {
    let (listener_a, addr_a) = bind_loopback().await;

    let (a_received_tx, a_received_rx) = oneshot::channel();
    let (kill_a_tx, kill_a_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let (mut stream, _) = listener_a.accept().await.unwrap();
        let _ = read_one_request(&mut stream).await;
        let _ = a_received_tx.send(());
        let _ = kill_a_rx.await;
        // Dropping both the stream and the (now out-of-scope) listener
        // closes node-a's socket for good, so it never answers and never
        // accepts a reconnect at this address again.
    });

    let client = Client::new(TestProtocol { is_async: true }, fast_config());
    client.try_register_endpoint("node-a", addr_a, None);
    wait_until(|| client.connection_count() == 1).await;

    let (on_exception_a, on_result_a, rx_a) = result_channel::<TestMessage>();
    let seq_a = client.next_seq_id();
    let req_a = client.new_request_with_seq_id(
        seq_a,
        "on-a",
        frame(seq_a, &[1]),
        Some(Duration::from_millis(400)),
        on_exception_a,
        on_result_a,
    );
    client.send(req_a);

    a_received_rx.await.unwrap();
    let _ = kill_a_tx.send(());
    wait_until(|| client.connection_count() == 0).await;

    let (listener_b, addr_b) = bind_loopback().await;
    tokio::spawn(echo_server(listener_b));
    client.try_register_endpoint("node-b", addr_b, None);
    wait_until(|| client.connection_count() == 1).await;

    for i in 0..3u8 {
        let (on_exception, on_result, rx) = result_channel::<TestMessage>();
        let seq_id = client.next_seq_id();
        let req = client.new_request_with_seq_id(
            seq_id,
            "on-b",
            frame(seq_id, &[i]),
            Some(Duration::from_millis(500)),
            on_exception,
            on_result,
        );
        client.send(req);
        let result = tokio::time::timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();
        let msg = result.expect("expected success on the surviving connection");
        assert_eq!(msg.body, vec![i]);
    }

    let result = tokio::time::timeout(Duration::from_secs(1), rx_a).await.unwrap().unwrap();
    match result {
        Err(Error::ReceiveTimeout { name }) => assert_eq!(name, "on-a"),
        other => panic!("expected ReceiveTimeout for the dead connection's request, got {other:?}"),
    }
}

/// Spec §8, universal property 2: sequence ids allocated concurrently are
/// all distinct and fall within `[1, i32::MAX]`.
#[tokio::test]
async fn concurrent_seq_id_allocation_is_unique() {
    let client = Client::new(TestProtocol { is_async: true }, fast_config());

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            (0..200).map(|_| client.next_seq_id()).collect::<Vec<_>>()
        }));
    }

    let mut all_ids = Vec::new();
    for task in tasks {
        all_ids.extend(task.await.unwrap());
    }

    assert_eq!(all_ids.len(), 16 * 200);
    assert!(all_ids.iter().all(|id| *id >= 1));
    let unique: std::collections::HashSet<_> = all_ids.iter().collect();
    assert_eq!(unique.len(), all_ids.len(), "sequence ids must be pairwise distinct");
}
