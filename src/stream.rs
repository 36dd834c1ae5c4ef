use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::obfs::Obfuscator;
use crate::session::SessionInner;
use bytes::{Buf, Bytes, BytesMut};
use std::fmt;
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Active, can send/receive
    Open,
    /// Close initiated, tearing down
    Closing,
    /// Closed locally or by the peer
    Closed,
}

/// Inbound side: queued payloads plus whatever a short read left behind.
struct Inbound {
    rx: mpsc::UnboundedReceiver<Bytes>,
    leftover: Bytes,
}

struct StreamInner {
    id: u32,

    /// Back-reference used to deregister on close
    session: Weak<SessionInner>,

    obfs: Arc<dyn Obfuscator>,

    /// Writes are fragmented into frames no larger than this
    max_payload: usize,

    /// Session-wide outbound queue feeding the switchboard
    dispatch: mpsc::Sender<Bytes>,

    state: Mutex<StreamState>,

    /// Dropped on close so readers see end-of-stream once the queue drains
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,

    inbound: Mutex<Inbound>,
}

/// Individual virtual stream within a session
///
/// Cloning is cheap and clones share state. Offers async `read`/`write`/`close`
/// returning crate errors, and implements [`AsyncRead`] + [`AsyncWrite`] for
/// standard Rust async I/O (a closed stream reads as EOF there).
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Stream {
    pub(crate) fn new(
        id: u32,
        session: Weak<SessionInner>,
        obfs: Arc<dyn Obfuscator>,
        dispatch: mpsc::Sender<Bytes>,
        max_payload: usize,
    ) -> Self {
        let (inbound_tx, rx) = mpsc::unbounded_channel();

        let inner = StreamInner {
            id,
            session,
            obfs,
            max_payload,
            dispatch,
            state: Mutex::new(StreamState::Open),
            inbound_tx: Mutex::new(Some(inbound_tx)),
            inbound: Mutex::new(Inbound {
                rx,
                leftover: Bytes::new(),
            }),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Get stream ID
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Get current stream state
    pub fn state(&self) -> StreamState {
        *lock(&self.inner.state)
    }

    /// Check if close has been initiated or completed
    pub fn is_closed(&self) -> bool {
        self.state() != StreamState::Open
    }

    /// Read into `buf`, waiting until data arrives or the stream closes.
    ///
    /// Bytes left over from a frame larger than `buf` are served first on the
    /// next call. Once the stream is closed, buffered data is still returned;
    /// after that every call fails with [`Error::BrokenStream`]. An empty `buf`
    /// returns `Ok(0)` while the stream is open.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        poll_fn(|cx| self.inner.poll_read(cx, &mut *buf)).await
    }

    /// Queue `data` for sending.
    ///
    /// The whole write travels as one unit over a single physical connection,
    /// so bytes of one stream keep their order. Waits only when the
    /// session-wide outbound queue is full.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::BrokenStream);
        }
        if data.is_empty() {
            return Ok(0);
        }

        let permit = self
            .inner
            .dispatch
            .reserve()
            .await
            .map_err(|_| Error::BrokenStream)?;
        // Closed while waiting for room
        if self.is_closed() {
            return Err(Error::BrokenStream);
        }
        permit.send(self.inner.encode(data)?);

        trace!("Stream {}: queued {} bytes", self.inner.id, data.len());
        Ok(data.len())
    }

    /// Close the stream and notify the peer.
    ///
    /// A second call returns [`Error::RepeatClose`] and changes nothing.
    pub async fn close(&self) -> Result<()> {
        if !self.inner.begin_close() {
            debug!("Stream {}: close on closed stream", self.inner.id);
            return Err(Error::RepeatClose);
        }
        self.inner.shut_inbound();
        self.finish_close().await;
        Ok(())
    }

    /// Leave the stream table, then tell the peer.
    async fn finish_close(&self) {
        let id = self.inner.id;
        self.inner.deregister().await;
        self.inner.set_state(StreamState::Closed);

        match self.inner.session.upgrade() {
            Some(session) => session.announce_close(id).await,
            None => self.inner.send_close_notice().await,
        }
        debug!("Stream {} closed", id);
    }

    /// Close in response to the peer's notice; nothing is sent back.
    pub(crate) async fn close_by_peer(&self) {
        if !self.inner.begin_close() {
            return;
        }
        self.inner.shut_inbound();
        self.inner.deregister().await;
        self.inner.set_state(StreamState::Closed);
        debug!("Stream {} closed by peer", self.inner.id);
    }

    /// Close without notice or deregistration, used when the session goes away.
    pub(crate) fn close_local(&self) {
        if !self.inner.begin_close() {
            return;
        }
        self.inner.shut_inbound();
        self.inner.set_state(StreamState::Closed);
    }

    /// Queue an inbound payload. Returns false if the stream is closed and
    /// the payload was dropped.
    pub(crate) fn deliver(&self, payload: Bytes) -> bool {
        match lock(&self.inner.inbound_tx).as_ref() {
            Some(tx) => tx.send(payload).is_ok(),
            None => {
                trace!(
                    "Stream {}: dropping {} bytes for closed stream",
                    self.inner.id,
                    payload.len()
                );
                false
            }
        }
    }
}

impl StreamInner {
    /// Open -> Closing. Returns false if close already started.
    fn begin_close(&self) -> bool {
        let mut state = lock(&self.state);
        if *state != StreamState::Open {
            return false;
        }
        *state = StreamState::Closing;
        true
    }

    fn set_state(&self, new: StreamState) {
        *lock(&self.state) = new;
    }

    fn shut_inbound(&self) {
        lock(&self.inbound_tx).take();
    }

    async fn deregister(&self) {
        if let Some(session) = self.session.upgrade() {
            session.remove_stream(self.id).await;
        }
    }

    async fn send_close_notice(&self) {
        match self.obfs.obfuscate(&Frame::closing(self.id)) {
            Ok(unit) => {
                if self.dispatch.send(unit).await.is_err() {
                    trace!("Stream {}: session gone, closing notice dropped", self.id);
                }
            }
            Err(e) => warn!("Stream {}: failed to encode closing notice: {}", self.id, e),
        }
    }

    /// Fragment `data` into frames and serialize them back to back.
    ///
    /// The first frame carries a pending close notice of the session, if any.
    fn encode(&self, data: &[u8]) -> Result<Bytes> {
        let session = self.session.upgrade();
        let closing = session
            .as_ref()
            .and_then(|session| session.take_pending_close())
            .unwrap_or(0);

        let mut unit = BytesMut::with_capacity(data.len());
        let mut closing_stream_id = closing;
        for chunk in data.chunks(self.max_payload) {
            let frame = Frame {
                stream_id: self.id,
                closing_stream_id,
                payload: Bytes::copy_from_slice(chunk),
            };
            closing_stream_id = 0;

            match self.obfs.obfuscate(&frame) {
                Ok(part) => unit.extend_from_slice(&part),
                Err(e) => {
                    if let Some(session) = session.as_ref().filter(|_| closing != 0) {
                        session.requeue_close(closing);
                    }
                    return Err(e);
                }
            }
        }
        Ok(unit.freeze())
    }

    fn poll_read(&self, cx: &mut Context<'_>, dst: &mut [u8]) -> Poll<Result<usize>> {
        let mut inbound = lock(&self.inbound);

        if dst.is_empty() {
            if inbound.leftover.is_empty() {
                match inbound.rx.try_recv() {
                    Ok(payload) => inbound.leftover = payload,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        return Poll::Ready(Err(Error::BrokenStream));
                    }
                    Err(mpsc::error::TryRecvError::Empty) => {}
                }
            }
            return Poll::Ready(Ok(0));
        }

        loop {
            if !inbound.leftover.is_empty() {
                let n = dst.len().min(inbound.leftover.len());
                dst[..n].copy_from_slice(&inbound.leftover[..n]);
                inbound.leftover.advance(n);
                return Poll::Ready(Ok(n));
            }

            match ready!(inbound.rx.poll_recv(cx)) {
                Some(payload) => inbound.leftover = payload,
                None => return Poll::Ready(Err(Error::BrokenStream)),
            }
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let dst = buf.initialize_unfilled();
        match ready!(this.inner.poll_read(cx, dst)) {
            Ok(n) => {
                buf.advance(n);
                Poll::Ready(Ok(()))
            }
            // Closed and drained: EOF
            Err(Error::BrokenStream) => Poll::Ready(Ok(())),
            Err(e) => Poll::Ready(Err(e.into())),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.is_closed() {
            return Poll::Ready(Err(Error::BrokenStream.into()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        // Enqueue synchronously so consecutive writes keep their order
        match this.inner.dispatch.try_reserve() {
            Ok(permit) => {
                let unit = match this.inner.encode(buf) {
                    Ok(unit) => unit,
                    Err(e) => return Poll::Ready(Err(e.into())),
                };
                permit.send(unit);
                trace!("poll_write: stream {} queued {} bytes", this.inner.id, buf.len());
                Poll::Ready(Ok(buf.len()))
            }
            Err(mpsc::error::TrySendError::Full(())) => {
                // Nothing consumed; wake once the outbound queue has room
                trace!("poll_write: outbound queue full for stream {}", this.inner.id);
                let waker = cx.waker().clone();
                let dispatch = this.inner.dispatch.clone();
                tokio::spawn(async move {
                    if let Ok(permit) = dispatch.reserve().await {
                        drop(permit);
                    }
                    waker.wake();
                });
                Poll::Pending
            }
            Err(mpsc::error::TrySendError::Closed(())) => {
                Poll::Ready(Err(Error::BrokenStream.into()))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Writes are handed to the switchboard as soon as they are accepted
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        // Writes fail from here on; only the notice and cleanup run later
        if this.inner.begin_close() {
            this.inner.shut_inbound();
            let stream = this.clone();
            tokio::spawn(async move {
                stream.finish_close().await;
            });
        }

        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obfs::PlainObfuscator;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn detached_stream(id: u32, max_payload: usize) -> (Stream, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(16);
        let stream = Stream::new(id, Weak::new(), Arc::new(PlainObfuscator), tx, max_payload);
        (stream, rx)
    }

    fn split_frames(unit: &Bytes) -> Vec<Frame> {
        let obfs = PlainObfuscator;
        let mut buf = BytesMut::from(&unit[..]);
        let mut frames = Vec::new();
        while let Some(part) = obfs.split_unit(&mut buf).unwrap() {
            frames.push(obfs.deobfuscate(&part).unwrap());
        }
        assert!(buf.is_empty());
        frames
    }

    #[tokio::test]
    async fn test_stream_creation() {
        let (stream, _rx) = detached_stream(3, 1024);

        assert_eq!(stream.id(), 3);
        assert_eq!(stream.state(), StreamState::Open);
        assert!(!stream.is_closed());
    }

    #[tokio::test]
    async fn test_write_fragments_into_frames() {
        let (stream, mut rx) = detached_stream(7, 4);

        let n = stream.write(b"0123456789").await.unwrap();
        assert_eq!(n, 10);

        // One write is one dispatch unit
        let unit = rx.recv().await.unwrap();
        assert!(rx.try_recv().is_err());

        let frames = split_frames(&unit);
        let payloads: Vec<&[u8]> = frames.iter().map(|f| &f.payload[..]).collect();
        assert_eq!(payloads, vec![&b"0123"[..], b"4567", b"89"]);
        assert!(frames.iter().all(|f| f.stream_id == 7 && f.closing_stream_id == 0));
    }

    #[tokio::test]
    async fn test_empty_write_sends_nothing() {
        let (stream, mut rx) = detached_stream(1, 1024);

        assert_eq!(stream.write(b"").await.unwrap(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_partial_reads_keep_leftover() {
        let (stream, _rx) = detached_stream(1, 1024);
        assert!(stream.deliver(Bytes::from_static(b"hello")));
        assert!(stream.deliver(Bytes::from_static(b"world")));

        let mut buf = [0u8; 3];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf, b"hel");
        assert_eq!(stream.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"lo");
        assert_eq!(stream.read(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf, b"wor");
    }

    #[tokio::test]
    async fn test_zero_length_read() {
        let (stream, _rx) = detached_stream(1, 1024);

        assert_eq!(stream.read(&mut []).await.unwrap(), 0);

        stream.close().await.unwrap();
        assert!(matches!(stream.read(&mut []).await, Err(Error::BrokenStream)));
    }

    #[tokio::test]
    async fn test_zero_length_read_with_buffered_data_after_close() {
        let (stream, _rx) = detached_stream(1, 1024);
        stream.deliver(Bytes::from_static(b"x"));
        stream.close().await.unwrap();

        // Still something to serve
        assert_eq!(stream.read(&mut []).await.unwrap(), 0);

        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 1);
        assert!(matches!(stream.read(&mut []).await, Err(Error::BrokenStream)));
    }

    #[tokio::test]
    async fn test_close_sends_notice_once() {
        let (stream, mut rx) = detached_stream(9, 1024);

        stream.close().await.unwrap();
        assert_eq!(stream.state(), StreamState::Closed);

        let unit = rx.recv().await.unwrap();
        assert_eq!(split_frames(&unit), vec![Frame::closing(9)]);

        assert!(matches!(stream.close().await, Err(Error::RepeatClose)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_read_after_close_drains_buffer() {
        let (stream, _rx) = detached_stream(1, 1024);
        stream.deliver(Bytes::from_static(b"abc"));
        stream.close().await.unwrap();

        let mut buf = [0u8; 10];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");
        assert!(matches!(stream.read(&mut buf).await, Err(Error::BrokenStream)));
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (stream, _rx) = detached_stream(1, 1024);
        stream.close().await.unwrap();

        assert!(matches!(stream.write(b"late").await, Err(Error::BrokenStream)));
    }

    #[tokio::test]
    async fn test_deliver_to_closed_stream_is_dropped() {
        let (stream, _rx) = detached_stream(1, 1024);
        stream.close_local();

        assert!(!stream.deliver(Bytes::from_static(b"ignored")));
        assert!(matches!(stream.read(&mut [0u8; 4]).await, Err(Error::BrokenStream)));
    }

    #[tokio::test]
    async fn test_close_by_peer_wakes_blocked_reader() {
        let (stream, mut rx) = detached_stream(5, 1024);

        let reader = {
            let stream = stream.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                stream.read(&mut buf).await
            })
        };

        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        stream.close_by_peer().await;

        let result = tokio::time::timeout(tokio::time::Duration::from_secs(1), reader)
            .await
            .expect("reader stayed blocked")
            .unwrap();
        assert!(matches!(result, Err(Error::BrokenStream)));

        // No notice is echoed back to the peer
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_async_io_traits() {
        let (mut stream, mut rx) = detached_stream(11, 1024);

        stream.write_all(b"via AsyncWrite").await.unwrap();
        let unit = rx.recv().await.unwrap();
        assert_eq!(&split_frames(&unit)[0].payload[..], b"via AsyncWrite");

        stream.deliver(Bytes::from_static(b"tail"));
        stream.close_local();

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"tail");

        let err = stream.write_all(b"more").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_write_after_shutdown_fails() {
        let (mut stream, mut rx) = detached_stream(13, 1024);

        stream.write_all(b"before").await.unwrap();
        stream.shutdown().await.unwrap();
        assert!(stream.is_closed());

        assert!(matches!(stream.write(b"after").await, Err(Error::BrokenStream)));
        let err = stream.write_all(b"after").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);

        // Data first, then the notice, nothing after
        let data = rx.recv().await.unwrap();
        assert_eq!(&split_frames(&data)[0].payload[..], b"before");
        let notice = rx.recv().await.unwrap();
        assert_eq!(split_frames(&notice), vec![Frame::closing(13)]);
        assert!(rx.try_recv().is_err());
        assert!(matches!(stream.close().await, Err(Error::RepeatClose)));
    }
}
