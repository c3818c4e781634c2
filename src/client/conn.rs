use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use reqwest::Client;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant as TokioInstant, Sleep};
use tokio_stream::StreamExt;
use tokio_util::io::StreamReader;

use crate::error::{ClientError, LockResultExt};
use crate::headers::{CHUNK_SIZE, CLOSE_HEADER, CONN_ID_HEADER, INGRESS_QUEUE_DEPTH, ORIGIN_HEADER, SERVER_URL_HEADER};
use crate::id::ConnectionId;

/// ~10 years out, used as the "no deadline set" sentinel, mirroring the
/// zero-value-means-unbounded convention of the protocol it tunnels for.
const FAR_FUTURE: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

fn now_unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

fn system_time_to_unix_nanos(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// One item produced by the receive pump for the owning `VirtualConn`.
enum PumpItem {
    Chunk(Bytes),
    Eof,
    Err(ClientError),
}

/// State shared between a `VirtualConn` and its cheaply-cloneable
/// [`ConnHandle`]. Everything here is safe to touch from another task
/// while a `Read`/`Write` is in flight on the `VirtualConn` itself -
/// that's the whole reason it's split out rather than living directly
/// on `VirtualConn`, which needs `&mut self` for the exclusive parts.
struct Shared {
    id: ConnectionId,
    origin: String,
    client: Client,
    server_url: RwLock<String>,
    read_deadline: AtomicI64,
    pump_started: AtomicBool,
    pump_handle: StdMutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    ingress_tx: mpsc::Sender<PumpItem>,
    chunk_size: usize,
}

/// A lightweight, `Clone`-able handle to a [`VirtualConn`]'s shared state.
/// Lets one task adjust the read deadline or close the connection while
/// another task owns the `VirtualConn` and is blocked in `poll_read`.
#[derive(Clone)]
pub struct ConnHandle(Arc<Shared>);

impl ConnHandle {
    pub fn id(&self) -> ConnectionId {
        self.0.id
    }

    /// Sets the absolute time after which a pending `Read` fails with a
    /// timeout error. Safe to call concurrently with an in-flight read;
    /// it takes effect on that read's next poll.
    pub fn set_read_deadline(&self, deadline: SystemTime) {
        self.0
            .read_deadline
            .store(system_time_to_unix_nanos(deadline), Ordering::SeqCst);
    }

    /// Alias for [`Self::set_read_deadline`]: only read deadlines are
    /// meaningful for this stream, since `Write` never blocks waiting on
    /// the peer.
    pub fn set_deadline(&self, deadline: SystemTime) {
        self.set_read_deadline(deadline);
    }

    /// No-op: writes complete as soon as the POST response headers land,
    /// so there is nothing for a write deadline to bound.
    pub fn set_write_deadline(&self, _deadline: SystemTime) {}

    /// Idempotent. Aborts the receive pump and best-effort notifies the
    /// server with a close POST; does not wait for in-flight writes.
    pub async fn close(&self) {
        if self.0.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.0.pump_handle.lock().recover_poison("pump_handle").take() {
            handle.abort();
        }
        let url = self.0.server_url.read().recover_poison("server_url read").clone();
        let result = self
            .0
            .client
            .post(&url)
            .header(CONN_ID_HEADER, self.0.id.to_string())
            .header(CLOSE_HEADER, "1")
            .send()
            .await;
        if let Err(e) = result {
            log::warn!(target: "enhttp::client", "close POST for {} failed: {e}", self.0.id);
        }
    }
}

enum WriteState {
    Idle,
    Pending(Pin<Box<dyn Future<Output = io::Result<usize>> + Send>>),
}

/// A bidirectional byte stream tunneled through sequential HTTP POSTs to
/// an enhttp server. Implements [`AsyncRead`] and [`AsyncWrite`] so it
/// drops into anything that takes a generic async byte stream.
///
/// Not `Clone`: a `VirtualConn` owns the exclusive ingress queue receiver
/// and in-flight write state. Use [`VirtualConn::handle`] to get a
/// cloneable [`ConnHandle`] for cross-task deadline/close control.
pub struct VirtualConn {
    shared: Arc<Shared>,
    ingress_rx: mpsc::Receiver<PumpItem>,
    unread: Vec<u8>,
    /// A terminal `Eof`/`Err` peeked by `try_fill_more` while bytes were
    /// still being copied out of `unread`, held here until the next
    /// `poll_read` instead of being applied (and thus lost) immediately.
    stashed: Option<PumpItem>,
    write_state: WriteState,
    read_timer: Pin<Box<Sleep>>,
}

impl VirtualConn {
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn origin(&self) -> &str {
        &self.shared.origin
    }

    pub fn handle(&self) -> ConnHandle {
        ConnHandle(self.shared.clone())
    }

    pub fn set_read_deadline(&self, deadline: SystemTime) {
        self.handle().set_read_deadline(deadline);
    }

    pub fn set_deadline(&self, deadline: SystemTime) {
        self.handle().set_deadline(deadline);
    }

    pub async fn close(&self) {
        self.handle().close().await;
    }

    /// Local/remote addresses are not meaningful for a tunnel: the real
    /// socket lives on the server, between it and the origin.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        None
    }

    pub fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        None
    }

    fn drain_unread_into(&mut self, buf: &mut ReadBuf<'_>) {
        let n = std::cmp::min(buf.remaining(), self.unread.len());
        buf.put_slice(&self.unread[..n]);
        self.unread.drain(..n);
    }

    /// Non-blocking best-effort top-up after the unread tail has been
    /// drained, so a caller with room left in `buf` doesn't have to make
    /// a second `poll_read` round trip just to pick up data that was
    /// already sitting in the ingress queue. A peeked terminal item (EOF
    /// or the pump's one-shot error) is stashed rather than applied here,
    /// since the bytes already copied from `unread` make this call a
    /// successful partial read; the terminal item surfaces on the next
    /// `poll_read` instead of being discarded.
    fn try_fill_more(&mut self, buf: &mut ReadBuf<'_>) {
        if buf.remaining() == 0 {
            return;
        }
        if let Ok(item) = self.ingress_rx.try_recv() {
            match item {
                PumpItem::Chunk(_) => {
                    let _ = self.apply_item(Some(item), buf);
                }
                terminal => self.stashed = Some(terminal),
            }
        }
    }

    fn apply_item(&mut self, item: Option<PumpItem>, buf: &mut ReadBuf<'_>) -> io::Result<()> {
        match item {
            None | Some(PumpItem::Eof) => Ok(()),
            Some(PumpItem::Err(e)) => Err(e.into()),
            Some(PumpItem::Chunk(bytes)) => {
                let n = std::cmp::min(buf.remaining(), bytes.len());
                buf.put_slice(&bytes[..n]);
                if n < bytes.len() {
                    self.unread = bytes[n..].to_vec();
                }
                Ok(())
            }
        }
    }

    async fn do_write(shared: Arc<Shared>, body: Vec<u8>) -> io::Result<usize> {
        let n = body.len();
        let url = shared.server_url.read().recover_poison("server_url read").clone();

        let resp = shared
            .client
            .post(&url)
            .header(CONN_ID_HEADER, shared.id.to_string())
            .header(ORIGIN_HEADER, shared.origin.clone())
            .body(body)
            .send()
            .await
            .map_err(|e| io::Error::from(ClientError::Transport(e.to_string())))?;

        if !resp.status().is_success() {
            return Err(io::Error::from(ClientError::BadStatus(resp.status().as_u16())));
        }

        if let Some(v) = resp.headers().get(SERVER_URL_HEADER) {
            if let Ok(s) = v.to_str() {
                if !s.is_empty() {
                    *shared.server_url.write().recover_poison("server_url write") = s.to_string();
                }
            }
        }

        if !shared.pump_started.swap(true, Ordering::SeqCst) {
            let tx = shared.ingress_tx.clone();
            let id = shared.id;
            let chunk_size = shared.chunk_size;
            let handle = tokio::spawn(run_pump(resp, tx, id, chunk_size));
            *shared.pump_handle.lock().recover_poison("pump_handle") = Some(handle);
        }
        // Else: a follow-up write. The response to it carries no body of
        // interest (the pump already owns the long-lived stream), so it
        // is simply dropped here.

        Ok(n)
    }
}

impl AsyncRead for VirtualConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.unread.is_empty() {
            this.drain_unread_into(buf);
            this.try_fill_more(buf);
            return Poll::Ready(Ok(()));
        }

        if let Some(item) = this.stashed.take() {
            return Poll::Ready(this.apply_item(Some(item), buf));
        }

        let deadline_nanos = this.shared.read_deadline.load(Ordering::SeqCst);
        let now_nanos = now_unix_nanos();
        if now_nanos >= deadline_nanos {
            return Poll::Ready(Err(ClientError::Timeout.into()));
        }
        let remaining = Duration::from_nanos((deadline_nanos - now_nanos) as u64);
        this.read_timer.as_mut().reset(TokioInstant::now() + remaining);

        if let Poll::Ready(item) = this.ingress_rx.poll_recv(cx) {
            return Poll::Ready(this.apply_item(item, buf));
        }

        match this.read_timer.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(ClientError::Timeout.into())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for VirtualConn {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            match &mut this.write_state {
                WriteState::Idle => {
                    let fut = Self::do_write(this.shared.clone(), buf.to_vec());
                    this.write_state = WriteState::Pending(Box::pin(fut));
                }
                WriteState::Pending(fut) => {
                    return match fut.as_mut().poll(cx) {
                        Poll::Ready(res) => {
                            this.write_state = WriteState::Idle;
                            Poll::Ready(res)
                        }
                        Poll::Pending => Poll::Pending,
                    };
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let handle = self.get_mut().handle();
        tokio::spawn(async move { handle.close().await });
        Poll::Ready(Ok(()))
    }
}

async fn run_pump(response: reqwest::Response, tx: mpsc::Sender<PumpItem>, conn_id: ConnectionId, chunk_size: usize) {
    let stream = response
        .bytes_stream()
        .map(|r| r.map_err(|e| io::Error::new(io::ErrorKind::Other, e)));
    let mut reader = StreamReader::new(stream);
    let mut buf = vec![0u8; chunk_size];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                log::debug!(target: "enhttp::client", "upstream EOF for {conn_id}");
                let _ = tx.send(PumpItem::Eof).await;
                break;
            }
            Ok(n) => {
                if tx.send(PumpItem::Chunk(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                log::warn!(target: "enhttp::client", "pump read error for {conn_id}: {e}");
                let _ = tx.send(PumpItem::Err(ClientError::Upstream(e.to_string()))).await;
                break;
            }
        }
    }
}

/// Builds [`VirtualConn`]s against a single tunnel server.
///
/// Cloning a `Dialer` is cheap (it only wraps a `reqwest::Client` and the
/// server URL) and each call to [`Dialer::dial`] yields an independently
/// tracked virtual connection with its own id.
#[derive(Clone)]
pub struct Dialer {
    client: Client,
    server_url: String,
    chunk_size: usize,
}

impl Dialer {
    pub fn new(client: Client, server_url: impl Into<String>) -> Self {
        Self {
            client,
            server_url: server_url.into(),
            chunk_size: CHUNK_SIZE,
        }
    }

    /// Builds a `Dialer` from a [`crate::config::ClientConfig`], honoring
    /// its `chunk_size` for the receive pump instead of the built-in
    /// default.
    pub fn from_config(client: Client, config: crate::config::ClientConfig) -> Self {
        Self {
            client,
            server_url: config.server_url,
            chunk_size: config.chunk_size,
        }
    }

    /// Allocates a connection id and local state for a new virtual
    /// connection. No network I/O happens here: the server only learns
    /// about this connection (and dials `origin`) on the first `Write`.
    pub fn dial(&self, origin: impl Into<String>) -> VirtualConn {
        let (tx, rx) = mpsc::channel(INGRESS_QUEUE_DEPTH);
        let deadline = now_unix_nanos() + FAR_FUTURE.as_nanos() as i64;
        let shared = Arc::new(Shared {
            id: ConnectionId::new(),
            origin: origin.into(),
            client: self.client.clone(),
            server_url: RwLock::new(self.server_url.clone()),
            read_deadline: AtomicI64::new(deadline),
            pump_started: AtomicBool::new(false),
            pump_handle: StdMutex::new(None),
            closed: AtomicBool::new(false),
            ingress_tx: tx,
            chunk_size: self.chunk_size,
        });

        VirtualConn {
            shared,
            ingress_rx: rx,
            unread: Vec::new(),
            stashed: None,
            write_state: WriteState::Idle,
            read_timer: Box::pin(tokio::time::sleep(FAR_FUTURE)),
        }
    }
}

/// Downcasts a trait object to check whether it is a [`VirtualConn`].
/// Useful for code paths that special-case tunneled connections (for
/// example, to skip TCP-only socket options that don't apply here).
pub fn is_virtual_conn(conn: &dyn std::any::Any) -> bool {
    conn.is::<VirtualConn>()
}
