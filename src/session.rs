use crate::config::Config;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::obfs::Obfuscator;
use crate::stream::Stream;
use crate::switchboard::{Switchboard, Transport};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Live streams plus a bounded memory of recently closed IDs.
struct StreamTable {
    streams: HashMap<u32, Stream>,
    retired: HashSet<u32>,
    retired_order: VecDeque<u32>,
    retired_capacity: usize,
}

impl StreamTable {
    fn new(retired_capacity: usize) -> Self {
        Self {
            streams: HashMap::new(),
            retired: HashSet::new(),
            retired_order: VecDeque::new(),
            retired_capacity,
        }
    }

    fn retire(&mut self, id: u32) {
        if self.retired_capacity == 0 || !self.retired.insert(id) {
            return;
        }
        self.retired_order.push_back(id);
        if self.retired_order.len() > self.retired_capacity {
            if let Some(oldest) = self.retired_order.pop_front() {
                self.retired.remove(&oldest);
            }
        }
    }
}

pub(crate) struct SessionInner {
    id: u64,

    /// Self-reference handed to streams and background tasks
    me: Weak<SessionInner>,

    config: Config,

    obfs: Arc<dyn Obfuscator>,

    /// Next ID for locally opened streams (parity fixed by role)
    next_stream_id: AtomicU32,

    /// Active streams (stream_id -> Stream)
    streams: RwLock<StreamTable>,

    /// Sender for remote-opened streams (used by the frame router)
    accept_tx: mpsc::Sender<Stream>,

    /// Channel for remote-opened streams
    accept_rx: Mutex<mpsc::Receiver<Stream>>,

    switchboard: Switchboard,

    /// IDs of locally closed streams whose notice waits to ride on the next
    /// outgoing data frame
    pending_closes: std::sync::Mutex<VecDeque<u32>>,

    /// Cancellation token for shutdown of every background task
    cancel: CancellationToken,
}

/// Session is one logical multiplexed connection to a peer
///
/// Backed by a pool of physical connections managed by the switchboard.
/// Cloning yields another handle to the same session; the session shuts down
/// when [`close`](Session::close) is called or the last handle is dropped.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create a session over its first physical connection.
    ///
    /// Must be called from within a tokio runtime; the switchboard and the
    /// connection's reader and writer tasks are spawned immediately.
    pub fn new<T: Transport>(
        id: u64,
        conn: T,
        obfs: Arc<dyn Obfuscator>,
        config: Config,
    ) -> Result<Self> {
        config.validate()?;

        let cancel = CancellationToken::new();
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog);

        let inner = Arc::new_cyclic(|me: &Weak<SessionInner>| SessionInner {
            id,
            me: me.clone(),
            next_stream_id: AtomicU32::new(config.role.first_stream_id()),
            streams: RwLock::new(StreamTable::new(config.retired_ids)),
            accept_tx,
            accept_rx: Mutex::new(accept_rx),
            switchboard: Switchboard::start(id, me.clone(), obfs.clone(), &config, cancel.clone()),
            pending_closes: std::sync::Mutex::new(VecDeque::new()),
            obfs,
            config,
            cancel,
        });

        let session = Self { inner };
        session.add_connection(conn)?;
        debug!("Session {} created as {:?}", id, session.inner.config.role);
        Ok(session)
    }

    /// Session identifier supplied at creation
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Attach another physical connection to the pool.
    ///
    /// Does not wait for the switchboard to pick it up.
    pub fn add_connection<T: Transport>(&self, conn: T) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::SessionClosed);
        }
        self.inner.switchboard.add_connection(Box::new(conn))
    }

    /// Open a new stream to the peer.
    ///
    /// Nothing is sent until the first write; the peer discovers the stream
    /// from its first frame.
    pub async fn open_stream(&self) -> Result<Stream> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::SessionClosed);
        }

        let id = self.inner.allocate_stream_id()?;
        let stream = self.inner.make_stream(id);

        {
            let mut table = self.inner.streams.write().await;
            if table.streams.len() >= self.inner.config.max_streams {
                return Err(Error::TooManyStreams(self.inner.config.max_streams));
            }
            table.streams.insert(id, stream.clone());
        }

        debug!("Session {}: opened stream {}", self.inner.id, id);
        Ok(stream)
    }

    /// Accept the next stream opened by the peer, in arrival order
    pub async fn accept_stream(&self) -> Result<Stream> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::SessionClosed);
        }

        let mut incoming = self.inner.accept_rx.lock().await;

        tokio::select! {
            stream = incoming.recv() => stream.ok_or(Error::SessionClosed),
            _ = self.inner.cancel.cancelled() => Err(Error::SessionClosed),
        }
    }

    /// Shut down the session.
    ///
    /// Stops the switchboard and all connection tasks, dropping every physical
    /// connection. Open streams are closed without notifying the peer; data
    /// they already buffered can still be read.
    pub async fn close(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();

        let streams: Vec<Stream> = {
            let mut table = self.inner.streams.write().await;
            table.streams.drain().map(|(_, stream)| stream).collect()
        };
        for stream in &streams {
            stream.close_local();
        }

        debug!(
            "Session {} closed ({} streams dropped)",
            self.inner.id,
            streams.len()
        );
    }

    /// Check if the session has been closed
    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Get the number of open streams
    pub async fn stream_count(&self) -> usize {
        self.inner.streams.read().await.streams.len()
    }

    /// Number of physical connections currently in the pool
    pub fn connection_count(&self) -> usize {
        self.inner.switchboard.connection_count()
    }

    /// Outstanding (queued but unsent) bytes per connection, in pool order
    pub async fn connection_loads(&self) -> Result<Vec<usize>> {
        self.inner.switchboard.loads().await
    }
}

impl SessionInner {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Allocate a new stream ID
    fn allocate_stream_id(&self) -> Result<u32> {
        // Odd IDs for client, even for server
        self.next_stream_id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |id| id.checked_add(2))
            .map_err(|_| Error::StreamIdsExhausted)
    }

    fn make_stream(&self, id: u32) -> Stream {
        Stream::new(
            id,
            self.me.clone(),
            self.obfs.clone(),
            self.switchboard.dispatcher(),
            self.config.max_frame_payload,
        )
    }

    /// Look up an existing stream
    pub(crate) async fn lookup_stream(&self, id: u32) -> Option<Stream> {
        self.streams.read().await.streams.get(&id).cloned()
    }

    /// Find the stream a data frame is addressed to, registering it and
    /// queueing it for `accept_stream` when the peer is opening it.
    ///
    /// Returns `None` when the frame must be dropped: the ID belongs to our
    /// half of the ID space but is not live, the ID was recently closed, or
    /// the new stream was refused.
    pub(crate) async fn lookup_or_register(&self, id: u32) -> Option<Stream> {
        if let Some(stream) = self.lookup_stream(id).await {
            return Some(stream);
        }

        let mut table = self.streams.write().await;
        // Re-check: the stream may have been registered while unlocked
        if let Some(stream) = table.streams.get(&id) {
            return Some(stream.clone());
        }

        if self.config.role.owns(id) {
            trace!("Session {}: dropping frame for stale local stream {}", self.id, id);
            return None;
        }
        if table.retired.contains(&id) {
            trace!("Session {}: dropping frame for closed stream {}", self.id, id);
            return None;
        }

        if table.streams.len() >= self.config.max_streams {
            warn!(
                "Session {}: stream limit {} reached, refusing stream {}",
                self.id, self.config.max_streams, id
            );
            table.retire(id);
            drop(table);
            self.refuse(id);
            return None;
        }

        let stream = self.make_stream(id);
        if let Err(e) = self.accept_tx.try_send(stream.clone()) {
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    warn!("Session {}: accept backlog full, refusing stream {}", self.id, id)
                }
                mpsc::error::TrySendError::Closed(_) => {
                    trace!("Session {}: accept queue closed", self.id)
                }
            }
            table.retire(id);
            drop(table);
            self.refuse(id);
            return None;
        }
        table.streams.insert(id, stream.clone());

        debug!("Session {}: accepted stream {} from peer", self.id, id);
        Some(stream)
    }

    /// Remove a stream from the table and remember its ID as closed
    pub(crate) async fn remove_stream(&self, id: u32) {
        let mut table = self.streams.write().await;
        if table.streams.remove(&id).is_some() {
            table.retire(id);
            trace!("Session {}: removed stream {}", self.id, id);
        }
    }

    /// Announce that a locally opened or accepted stream is closed.
    ///
    /// The notice is queued so the next outgoing data frame of any stream can
    /// carry it. If no data frame picks it up within `close_linger`, or the
    /// queue is full, it goes out as a control frame of its own.
    pub(crate) async fn announce_close(&self, id: u32) {
        if !self.queue_close(id) {
            self.send_close_notice(id).await;
            return;
        }

        let me = self.me.clone();
        let linger = self.config.close_linger;
        tokio::spawn(async move {
            sleep(linger).await;
            if let Some(session) = me.upgrade() {
                if session.unqueue_close(id) {
                    session.send_close_notice(id).await;
                }
            }
        });
    }

    fn queue_close(&self, id: u32) -> bool {
        let mut pending = lock_pending(&self.pending_closes);
        if pending.len() >= self.config.close_backlog {
            return false;
        }
        pending.push_back(id);
        true
    }

    fn unqueue_close(&self, id: u32) -> bool {
        let mut pending = lock_pending(&self.pending_closes);
        match pending.iter().position(|&queued| queued == id) {
            Some(pos) => pending.remove(pos).is_some(),
            None => false,
        }
    }

    /// Take the oldest close notice waiting for a data frame
    pub(crate) fn take_pending_close(&self) -> Option<u32> {
        lock_pending(&self.pending_closes).pop_front()
    }

    /// Put back a notice whose data frame never made it into the queue
    pub(crate) fn requeue_close(&self, id: u32) {
        lock_pending(&self.pending_closes).push_front(id);
    }

    async fn send_close_notice(&self, id: u32) {
        match self.obfs.obfuscate(&Frame::closing(id)) {
            Ok(unit) => {
                if !self.switchboard.dispatch(unit).await {
                    trace!("Session {}: closing notice for stream {} dropped", self.id, id);
                }
            }
            Err(e) => warn!("Session {}: failed to encode closing notice for stream {}: {}", self.id, id, e),
        }
    }

    /// Tell the peer we will not serve a stream it opened.
    ///
    /// Called from a reader loop, so this never waits on the outbound queue.
    fn refuse(&self, id: u32) {
        match self.obfs.obfuscate(&Frame::closing(id)) {
            Ok(unit) => {
                if !self.switchboard.try_dispatch(unit) {
                    warn!("Session {}: outbound queue full, refusal of stream {} dropped", self.id, id);
                }
            }
            Err(e) => warn!("Session {}: failed to encode refusal of stream {}: {}", self.id, id, e),
        }
    }
}

fn lock_pending(pending: &std::sync::Mutex<VecDeque<u32>>) -> std::sync::MutexGuard<'_, VecDeque<u32>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.cancel.cancel();
        for (_, stream) in self.streams.get_mut().streams.drain() {
            stream.close_local();
        }
    }
}
