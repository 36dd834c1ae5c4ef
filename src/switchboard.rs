//! Connection pool and frame routing.
//!
//! ```text
//!  Stream::write ──► dispatch queue ──► coordinator ──► enclave queue ──► send_loop ──► conn
//!                                          ▲    │
//!                  sent / closing notices ─┘    └── new connections, load queries
//!
//!  conn ──► deplex ──► Obfuscator ──► route ──► Stream inbound queue / accept queue
//! ```
//!
//! The coordinator is the only task that touches the pool and the load
//! counters, so neither needs a lock. Each physical connection gets one
//! writer task (so writes to a connection never interleave) and one reader
//! task.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::obfs::Obfuscator;
use crate::session::SessionInner;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// A physical connection the session can multiplex over
///
/// Implemented for every `AsyncRead + AsyncWrite` type that can move between
/// tasks, e.g. `TcpStream`, a TLS stream, or `tokio::io::DuplexStream`.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub(crate) type BoxedTransport = Box<dyn Transport>;

/// Reported by a writer task after a unit hit the wire.
struct SentNotice {
    enclave: u64,
    sent: usize,
}

/// Reported when a connection's reader or writer gives up. Carries every unit
/// the writer could not send.
struct Closing {
    enclave: u64,
    unsent: Vec<Bytes>,
}

/// One physical connection plus its load accounting
struct Enclave {
    id: u64,

    /// Bytes handed to the writer task and not yet reported as sent
    outstanding: usize,

    /// Units for the writer task
    queue: mpsc::UnboundedSender<Bytes>,

    /// Stops this connection's reader and writer
    cancel: CancellationToken,
}

/// Session-side handle to the coordinator task
pub(crate) struct Switchboard {
    dispatch_tx: mpsc::Sender<Bytes>,
    new_conn_tx: mpsc::UnboundedSender<BoxedTransport>,
    query_tx: mpsc::UnboundedSender<oneshot::Sender<Vec<usize>>>,
    pool_size: Arc<AtomicUsize>,
}

impl Switchboard {
    /// Spawn the coordinator. Connections are attached with `add_connection`.
    pub(crate) fn start(
        session_id: u64,
        session: Weak<SessionInner>,
        obfs: Arc<dyn Obfuscator>,
        config: &Config,
        cancel: CancellationToken,
    ) -> Self {
        let (dispatch_tx, dispatch_rx) = mpsc::channel(config.dispatch_backlog);
        let (new_conn_tx, new_conn_rx) = mpsc::unbounded_channel();
        let (query_tx, query_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (closing_tx, closing_rx) = mpsc::unbounded_channel();
        let pool_size = Arc::new(AtomicUsize::new(0));

        let coordinator = Coordinator {
            session_id,
            session,
            obfs,
            read_buffer_size: config.read_buffer_size,
            pool: Vec::new(),
            next_enclave: 0,
            pending: VecDeque::new(),
            sent_tx,
            closing_tx,
            pool_size: pool_size.clone(),
            cancel,
        };
        let inbox = Inbox {
            dispatch_rx,
            new_conn_rx,
            query_rx,
            sent_rx,
            closing_rx,
        };
        tokio::spawn(coordinator.run(inbox));

        Self {
            dispatch_tx,
            new_conn_tx,
            query_tx,
            pool_size,
        }
    }

    /// Sender for serialized stream data
    pub(crate) fn dispatcher(&self) -> mpsc::Sender<Bytes> {
        self.dispatch_tx.clone()
    }

    /// Queue a unit, waiting for room. Returns false once the session is gone.
    pub(crate) async fn dispatch(&self, unit: Bytes) -> bool {
        self.dispatch_tx.send(unit).await.is_ok()
    }

    /// Queue a unit without waiting. Returns false if the queue is full or gone.
    pub(crate) fn try_dispatch(&self, unit: Bytes) -> bool {
        self.dispatch_tx.try_send(unit).is_ok()
    }

    pub(crate) fn add_connection(&self, conn: BoxedTransport) -> Result<()> {
        self.new_conn_tx
            .send(conn)
            .map_err(|_| Error::SessionClosed)
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.pool_size.load(Ordering::Acquire)
    }

    /// Ask the coordinator for the outstanding bytes of each connection
    pub(crate) async fn loads(&self) -> Result<Vec<usize>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.query_tx
            .send(reply_tx)
            .map_err(|_| Error::SessionClosed)?;
        reply_rx.await.map_err(|_| Error::SessionClosed)
    }
}

/// Everything the coordinator waits on
struct Inbox {
    dispatch_rx: mpsc::Receiver<Bytes>,
    new_conn_rx: mpsc::UnboundedReceiver<BoxedTransport>,
    query_rx: mpsc::UnboundedReceiver<oneshot::Sender<Vec<usize>>>,
    sent_rx: mpsc::UnboundedReceiver<SentNotice>,
    closing_rx: mpsc::UnboundedReceiver<Closing>,
}

struct Coordinator {
    session_id: u64,
    session: Weak<SessionInner>,
    obfs: Arc<dyn Obfuscator>,
    read_buffer_size: usize,

    /// Kept sorted by load, least loaded first
    pool: Vec<Enclave>,
    next_enclave: u64,

    /// Units waiting for a connection while the pool is empty
    pending: VecDeque<Bytes>,

    sent_tx: mpsc::UnboundedSender<SentNotice>,
    closing_tx: mpsc::UnboundedSender<Closing>,
    pool_size: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl Coordinator {
    async fn run(mut self, mut inbox: Inbox) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                // With no connection, leave data in the queue so writers feel backpressure
                unit = inbox.dispatch_rx.recv(), if !self.pool.is_empty() => match unit {
                    Some(unit) => self.dispatch(unit),
                    None => break,
                },
                Some(notice) = inbox.sent_rx.recv() => self.on_sent(notice),
                Some(closing) = inbox.closing_rx.recv() => self.on_closing(closing),
                conn = inbox.new_conn_rx.recv() => match conn {
                    Some(conn) => self.attach(conn),
                    None => break,
                },
                Some(reply) = inbox.query_rx.recv() => {
                    let _ = reply.send(self.pool.iter().map(|e| e.outstanding).collect());
                }
            }
        }

        for enclave in self.pool.drain(..) {
            enclave.cancel.cancel();
        }
        self.pool_size.store(0, Ordering::Release);
        debug!("Switchboard for session {} stopped", self.session_id);
    }

    /// Hand a unit to the least loaded connection, counting it as load right away
    fn dispatch(&mut self, unit: Bytes) {
        let Some(enclave) = self.pool.iter_mut().min_by_key(|e| e.outstanding) else {
            self.pending.push_back(unit);
            return;
        };

        let len = unit.len();
        match enclave.queue.send(unit) {
            Ok(()) => {
                enclave.outstanding += len;
                trace!(
                    "Dispatched {} bytes to connection {} (outstanding {})",
                    len,
                    enclave.id,
                    enclave.outstanding
                );
            }
            Err(mpsc::error::SendError(unit)) => {
                // Writer already exited; its closing notice flushes this
                self.pending.push_back(unit);
            }
        }
    }

    fn on_sent(&mut self, notice: SentNotice) {
        if let Some(enclave) = self.pool.iter_mut().find(|e| e.id == notice.enclave) {
            enclave.outstanding = enclave.outstanding.saturating_sub(notice.sent);
        }
        self.pool.sort_by_key(|e| e.outstanding);
    }

    fn attach(&mut self, conn: BoxedTransport) {
        let id = self.next_enclave;
        self.next_enclave += 1;

        let (reader, writer) = tokio::io::split(conn);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let cancel = self.cancel.child_token();

        tokio::spawn(send_loop(
            id,
            writer,
            queue_rx,
            self.sent_tx.clone(),
            self.closing_tx.clone(),
            cancel.clone(),
        ));

        let deplexer = Deplexer {
            enclave: id,
            session: self.session.clone(),
            obfs: self.obfs.clone(),
            buffer_size: self.read_buffer_size,
            closing_tx: self.closing_tx.clone(),
            cancel: cancel.clone(),
        };
        tokio::spawn(deplexer.run(reader));

        self.pool.push(Enclave {
            id,
            outstanding: 0,
            queue: queue_tx,
            cancel,
        });
        self.pool.sort_by_key(|e| e.outstanding);
        self.publish_pool_size();

        info!(
            "Session {}: connection {} attached ({} in pool)",
            self.session_id,
            id,
            self.pool.len()
        );
        self.flush_pending();
    }

    fn on_closing(&mut self, closing: Closing) {
        if let Some(pos) = self.pool.iter().position(|e| e.id == closing.enclave) {
            let enclave = self.pool.remove(pos);
            enclave.cancel.cancel();
            self.publish_pool_size();

            warn!(
                "Session {}: connection {} removed ({} left)",
                self.session_id,
                enclave.id,
                self.pool.len()
            );
            if self.pool.is_empty() {
                warn!(
                    "Session {}: no connections left, holding outbound data until one is added",
                    self.session_id
                );
            }
        }

        if !closing.unsent.is_empty() {
            debug!(
                "Session {}: re-dispatching {} units from connection {}",
                self.session_id,
                closing.unsent.len(),
                closing.enclave
            );
            for unit in closing.unsent {
                self.dispatch(unit);
            }
        }
        self.flush_pending();
    }

    fn flush_pending(&mut self) {
        if self.pool.is_empty() || self.pending.is_empty() {
            return;
        }
        for unit in std::mem::take(&mut self.pending) {
            self.dispatch(unit);
        }
    }

    fn publish_pool_size(&self) {
        self.pool_size.store(self.pool.len(), Ordering::Release);
    }
}

/// Writer task per connection
///
/// Writes units one at a time in queue order and reports each completion. On
/// a write error or cancellation, hands every unsent unit back to the
/// coordinator.
async fn send_loop(
    enclave: u64,
    mut writer: WriteHalf<BoxedTransport>,
    mut queue: mpsc::UnboundedReceiver<Bytes>,
    sent_tx: mpsc::UnboundedSender<SentNotice>,
    closing_tx: mpsc::UnboundedSender<Closing>,
    cancel: CancellationToken,
) {
    let failed = loop {
        let unit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break None,
            unit = queue.recv() => match unit {
                Some(unit) => unit,
                None => break None,
            },
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = write_unit(&mut writer, &unit) => Some(result),
        };

        match outcome {
            Some(Ok(())) => {
                let _ = sent_tx.send(SentNotice {
                    enclave,
                    sent: unit.len(),
                });
            }
            Some(Err(e)) => {
                warn!("Write on connection {} failed: {}", enclave, e);
                break Some(unit);
            }
            None => break Some(unit),
        }
    };

    let mut unsent: Vec<Bytes> = failed.into_iter().collect();
    queue.close();
    while let Ok(unit) = queue.try_recv() {
        unsent.push(unit);
    }

    trace!("Writer for connection {} exiting with {} unsent units", enclave, unsent.len());
    let _ = closing_tx.send(Closing { enclave, unsent });
}

async fn write_unit<W: AsyncWrite + Unpin>(writer: &mut W, unit: &[u8]) -> io::Result<()> {
    writer.write_all(unit).await?;
    writer.flush().await
}

/// Reader task per connection
struct Deplexer {
    enclave: u64,
    session: Weak<SessionInner>,
    obfs: Arc<dyn Obfuscator>,
    buffer_size: usize,
    closing_tx: mpsc::UnboundedSender<Closing>,
    cancel: CancellationToken,
}

impl Deplexer {
    /// Read units off the connection and route the frames they carry.
    ///
    /// Any read or decode error retires the connection.
    async fn run(self, mut reader: ReadHalf<BoxedTransport>) {
        let mut buf = BytesMut::with_capacity(self.buffer_size);

        loop {
            let unit = tokio::select! {
                _ = self.cancel.cancelled() => {
                    trace!("Reader for connection {} cancelled", self.enclave);
                    return;
                }
                unit = read_unit(&mut reader, &mut buf, self.obfs.as_ref(), self.buffer_size) => unit,
            };

            let frame = match unit.and_then(|unit| self.obfs.deobfuscate(&unit)) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Read on connection {} failed: {}", self.enclave, e);
                    let _ = self.closing_tx.send(Closing {
                        enclave: self.enclave,
                        unsent: Vec::new(),
                    });
                    return;
                }
            };

            let Some(session) = self.session.upgrade() else {
                return;
            };
            route(&session, frame).await;
        }
    }
}

/// Pull one complete unit off the connection
async fn read_unit<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
    obfs: &dyn Obfuscator,
    chunk: usize,
) -> Result<BytesMut> {
    loop {
        if let Some(unit) = obfs.split_unit(buf)? {
            return Ok(unit);
        }

        if buf.capacity() == buf.len() {
            buf.reserve(chunk);
        }
        if reader.read_buf(buf).await? == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            )));
        }
    }
}

/// Deliver one inbound frame.
///
/// Registers the target stream if the peer is opening it and queues the
/// payload, then applies a piggybacked closing notice. The payload goes
/// first so a frame that closes its own stream still delivers its data.
async fn route(session: &SessionInner, frame: Frame) {
    if !frame.is_meaningful() {
        warn!(
            "Session {}: dropping empty frame for stream {}",
            session.id(),
            frame.stream_id
        );
        return;
    }

    trace!(
        "Session {}: frame stream={} closing={} len={}",
        session.id(),
        frame.stream_id,
        frame.closing_stream_id,
        frame.payload.len()
    );

    let target = if frame.is_control() || frame.payload.is_empty() {
        None
    } else {
        session.lookup_or_register(frame.stream_id).await
    };

    if let Some(stream) = target {
        stream.deliver(frame.payload);
    }

    if frame.closing_stream_id != 0 {
        match session.lookup_stream(frame.closing_stream_id).await {
            Some(closing) => closing.close_by_peer().await,
            None => trace!(
                "Session {}: closing notice for unknown stream {}",
                session.id(),
                frame.closing_stream_id
            ),
        }
    }
}
