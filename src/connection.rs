//! The connection host: owns one TCP socket, does raw byte I/O, and reports
//! lifecycle events back to whoever is managing it.
//!
//! Built on `tokio::net::TcpStream` plus two background tasks, one per
//! direction, instead of a hand-rolled non-blocking poll loop. Framing and
//! negotiation aren't this crate's concern (the core is protocol-agnostic),
//! so there's no handshake step to thread through the connection's
//! lifecycle.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};

use crate::request::{next_connection_id, ConnectionId, SeqId};

/// Socket-level and buffering configuration for a single connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Whether to disable Nagle's algorithm. Defaults to `true`.
    pub nodelay: bool,
    /// `SO_LINGER` timeout applied to the socket before it is published to
    /// the pool. `Some(Duration::ZERO)` ("linger off") means a subsequent
    /// close/disconnect resets the connection immediately instead of
    /// lingering to flush buffered writes; `None` leaves the platform
    /// default in place. Defaults to `Some(Duration::ZERO)`.
    pub linger: Option<Duration>,
    /// Size, in bytes, of the chunks read off the socket at a time. Defaults
    /// to 8192.
    pub socket_buffer_size: usize,
    /// Size, in bytes, of the accumulation buffer's initial capacity before the
    /// protocol adapter has consumed anything from it. Defaults to 8192.
    pub message_buffer_size: usize,
    /// Upper bound, in bytes, the unparsed accumulation buffer is allowed to
    /// grow to before the connection is considered broken (a well-behaved
    /// peer never pipelines this much unparsed data; a buggy or malicious one
    /// that does would otherwise grow the buffer without limit). Defaults to
    /// 16 MiB.
    pub max_message_length: usize,
    /// Upper bound on how many requests the owning pool will let be
    /// in flight on a single connection at once. Only consulted by the async
    /// pool (the sync pool is already exclusive, one at a time); `None`
    /// (the default) means unlimited.
    pub max_in_flight_per_connection: Option<usize>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            nodelay: true,
            linger: Some(Duration::ZERO),
            socket_buffer_size: 8192,
            message_buffer_size: 8192,
            max_message_length: 16 * 1024 * 1024,
            max_in_flight_per_connection: None,
        }
    }
}

/// Lifecycle events a [`Connection`] reports to its owner.
///
/// Rather than subscription-style callback wiring, which tends to produce a
/// cyclic object graph, every event is a value sent down an `mpsc` channel to
/// a single owning task. No component holds a back-pointer to another.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The connection finished connecting and is ready to send/receive.
    Connected { id: ConnectionId },
    /// A send has begun for the given sequence id; the caller should register
    /// the request as in-flight before this event is followed by
    /// [`ConnectionEvent::SendComplete`].
    StartSending { id: ConnectionId, seq_id: SeqId },
    /// The send for `seq_id` completed, successfully or not.
    SendComplete {
        id: ConnectionId,
        seq_id: SeqId,
        ok: bool,
    },
    /// Bytes were read from the socket and appended to the connection's receive
    /// buffer; `data` is the buffer's full unconsumed contents, not just the
    /// newly-arrived bytes. The owner calls [`Connection::advance_read_buffer`]
    /// with however many bytes the protocol adapter consumed.
    MessageReceived { id: ConnectionId, data: Bytes },
    /// A non-fatal I/O error was observed (currently always followed by a
    /// disconnect; kept distinct from `Disconnected` because a future protocol
    /// adapter may want to distinguish transient read errors from an
    /// intentional close).
    ConnectionError { id: ConnectionId, error: String },
    /// The connection has torn down. Fired exactly once per connection.
    Disconnected {
        id: ConnectionId,
        error: Option<String>,
    },
}

enum WriterCommand {
    Send { seq_id: SeqId, payload: Bytes },
    Disconnect,
}

enum ReaderCommand {
    /// The protocol adapter consumed `len` bytes from the front of the receive
    /// buffer; drop them before the next read appends more.
    Consumed(usize),
}

/// A handle to one live TCP connection.
///
/// Cloning a `Connection` is cheap (it's a pair of command-channel handles);
/// the socket itself is owned by two background tasks (one per direction)
/// spawned by [`Connection::connect`].
#[derive(Clone)]
pub struct Connection {
    id: ConnectionId,
    addr: SocketAddr,
    writer_tx: mpsc::UnboundedSender<WriterCommand>,
    reader_tx: mpsc::UnboundedSender<ReaderCommand>,
    stop: Arc<Notify>,
    /// Guards `begin_disconnect` itself against being actioned twice; it says
    /// nothing about whether `ConnectionEvent::Disconnected` has been sent
    /// (that's the reader task's job, and it only ever runs once per
    /// connection regardless of who asked it to stop).
    disconnect_requested: Arc<AtomicBool>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field(
                "disconnect_requested",
                &self.disconnect_requested.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl Connection {
    /// Connects to `addr`, applies `options`, and spawns the reader/writer
    /// tasks. Emits [`ConnectionEvent::Connected`] on `events` once the socket
    /// is up, then streams further events until the connection is destroyed.
    pub async fn connect(
        addr: SocketAddr,
        options: ConnectionOptions,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> std::io::Result<Connection> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(options.nodelay)?;
        SockRef::from(&stream).set_linger(options.linger)?;
        log::debug!("connection: connected to {addr}");
        Ok(Connection::from_stream(addr, stream, options, events))
    }

    fn from_stream(
        addr: SocketAddr,
        stream: TcpStream,
        options: ConnectionOptions,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Connection {
        let id = next_connection_id();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (reader_tx, reader_rx) = mpsc::unbounded_channel();
        let stop = Arc::new(Notify::new());
        let disconnect_requested = Arc::new(AtomicBool::new(false));

        let (read_half, write_half) = stream.into_split();

        tokio::spawn(writer_task(id, write_half, writer_rx, events.clone()));
        tokio::spawn(reader_task(id, read_half, options, reader_rx, events.clone(), stop.clone()));

        let _ = events.send(ConnectionEvent::Connected { id });

        Connection {
            id,
            addr,
            writer_tx,
            reader_tx,
            stop,
            disconnect_requested,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Begins sending `payload` tagged with `seq_id`. Fire-and-forget: progress
    /// (and the `StartSending`/`SendComplete` events) is reported
    /// asynchronously via the connection's event channel.
    pub fn begin_send(&self, seq_id: SeqId, payload: Bytes) {
        // An error here means the writer task has already exited (the
        // connection is mid-teardown); the eventual `Disconnected` event, not
        // this call, is responsible for surfacing that to the owner.
        let _ = self
            .writer_tx
            .send(WriterCommand::Send { seq_id, payload });
    }

    /// Acknowledges that the protocol adapter consumed `len` bytes from the
    /// front of the most recently delivered receive buffer.
    pub fn advance_read_buffer(&self, len: usize) {
        let _ = self.reader_tx.send(ReaderCommand::Consumed(len));
    }

    /// Begins tearing down the connection. Idempotent: the teardown commands
    /// are issued at most once regardless of how many callers ask; the
    /// resulting [`ConnectionEvent::Disconnected`] is still reported exactly
    /// once by the reader task, whether it got there via this call, a read
    /// error, or a clean EOF.
    pub fn begin_disconnect(&self) {
        if self
            .disconnect_requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let _ = self.writer_tx.send(WriterCommand::Disconnect);
            self.stop.notify_waiters();
        }
    }
}

async fn writer_task(
    id: ConnectionId,
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut cmd_rx: mpsc::UnboundedReceiver<WriterCommand>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            WriterCommand::Send { seq_id, payload } => {
                let _ = events.send(ConnectionEvent::StartSending { id, seq_id });
                let ok = write_half.write_all(&payload).await.is_ok();
                if !ok {
                    log::warn!("connection {id}: send failed for seq_id {seq_id}");
                }
                let _ = events.send(ConnectionEvent::SendComplete { id, seq_id, ok });
            }
            WriterCommand::Disconnect => {
                let _ = write_half.shutdown().await;
                break;
            }
        }
    }
}

async fn reader_task(
    id: ConnectionId,
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    options: ConnectionOptions,
    mut reader_rx: mpsc::UnboundedReceiver<ReaderCommand>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    stop: Arc<Notify>,
) {
    let mut buf = BytesMut::with_capacity(options.message_buffer_size);
    let mut chunk = vec![0u8; options.socket_buffer_size];

    let error = loop {
        tokio::select! {
            _ = stop.notified() => break None,
            consumed = reader_rx.recv() => {
                match consumed {
                    Some(ReaderCommand::Consumed(len)) => {
                        let _ = buf.split_to(len.min(buf.len()));
                    }
                    None => break None,
                }
            }
            result = read_half.read(&mut chunk) => {
                match result {
                    Ok(0) => break None,
                    Ok(n) => {
                        buf.extend_from_slice(&chunk[..n]);
                        if buf.len() > options.max_message_length {
                            let error = format!(
                                "accumulated buffer of {} bytes exceeds max_message_length {}",
                                buf.len(),
                                options.max_message_length
                            );
                            let _ = events.send(ConnectionEvent::ConnectionError { id, error: error.clone() });
                            break Some(error);
                        }
                        let _ = events.send(ConnectionEvent::MessageReceived {
                            id,
                            data: buf.clone().freeze(),
                        });
                    }
                    Err(err) => {
                        let _ = events.send(ConnectionEvent::ConnectionError {
                            id,
                            error: err.to_string(),
                        });
                        break Some(err.to_string());
                    }
                }
            }
        }
    };

    // The reader task is the sole owner of this connection's teardown
    // reporting and only ever runs this tail once, so `Disconnected` fires
    // exactly once here regardless of which branch above produced `error` —
    // including an explicit `begin_disconnect()` call, which only requests
    // the stop and leaves reporting it to this task.
    let _ = events.send(ConnectionEvent::Disconnected { id, error });
}
