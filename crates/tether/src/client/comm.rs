//! Client connection to a tether server.
//!
//! A writer task drains an outgoing queue onto the socket and a reader task
//! routes replies to waiters by request id, so replies may arrive in any
//! order. When the connection ends every outstanding request fails with
//! [`ClientError::ConnectionClosed`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, trace, warn};

use super::{ClientConfig, ClientError};
use crate::bridge::{
    ClientMessage, JsonCodec, PROTOCOL_VERSION, Request, RequestId, ServerMessage, WireError,
};
use crate::handle::RemoteHandle;
use crate::payload::ArrayPayload;

type Reply = Result<Option<RemoteHandle>, ClientError>;
type Pending = Arc<DashMap<RequestId, oneshot::Sender<Reply>>>;

struct CommInner {
    outgoing: mpsc::UnboundedSender<ClientMessage>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
    sent: AtomicU64,
    errors: broadcast::Sender<WireError>,
    server: String,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for CommInner {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Handle to one server connection. Cheap to clone; the connection closes
/// when the last clone is dropped.
#[derive(Clone)]
pub struct Comm {
    inner: Arc<CommInner>,
}

impl std::fmt::Debug for Comm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Comm")
            .field("server", &self.inner.server)
            .field("requests_sent", &self.requests_sent())
            .finish()
    }
}

impl Comm {
    /// Connect and wait for the server's hello, bounded by `config.connect_timeout`.
    pub async fn connect(addr: &str, config: &ClientConfig) -> Result<Self, ClientError> {
        let timeout = config.connect_timeout;
        let (reader, write_half, server) = tokio::time::timeout(timeout, handshake(addr))
            .await
            .map_err(|_| ClientError::ConnectionTimeout(timeout))??;
        debug!(addr, %server, "Connected");

        let pending: Pending = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (errors, _) = broadcast::channel(64);

        let writer = FramedWrite::new(write_half, JsonCodec::<ClientMessage>::new());
        let tasks = vec![
            tokio::spawn(write_loop(
                writer,
                outgoing_rx,
                Arc::clone(&pending),
                Arc::clone(&closed),
            )),
            tokio::spawn(read_loop(
                reader,
                Arc::clone(&pending),
                Arc::clone(&closed),
                errors.clone(),
            )),
        ];

        Ok(Self {
            inner: Arc::new(CommInner {
                outgoing,
                pending,
                closed,
                next_id: AtomicU64::new(1),
                sent: AtomicU64::new(0),
                errors,
                server,
                tasks,
            }),
        })
    }

    /// Server identification from its hello.
    pub fn server(&self) -> &str {
        &self.inner.server
    }

    pub fn requests_sent(&self) -> u64 {
        self.inner.sent.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Out-of-band failure notices broadcast by the server.
    pub fn errors(&self) -> broadcast::Receiver<WireError> {
        self.inner.errors.subscribe()
    }

    pub async fn upload(&self, handle: RemoteHandle) -> Result<RemoteHandle, ClientError> {
        expect_handle("upload", self.request(Request::Upload { handle }).await?)
    }

    /// Fetch the value behind `handle`. The reply carries it as payload.
    pub async fn download(&self, handle: &RemoteHandle) -> Result<RemoteHandle, ClientError> {
        let request = Request::Download {
            handle: handle.stripped(),
        };
        expect_handle("download", self.request(request).await?)
    }

    pub async fn update(
        &self,
        handle: &RemoteHandle,
        payload: ArrayPayload,
    ) -> Result<RemoteHandle, ClientError> {
        let request = Request::Update {
            handle: handle.stripped(),
            payload,
        };
        expect_handle("update", self.request(request).await?)
    }

    pub async fn op(
        &self,
        name: &str,
        args: Vec<RemoteHandle>,
    ) -> Result<Option<RemoteHandle>, ClientError> {
        self.request(Request::Op {
            name: name.to_string(),
            args,
        })
        .await
    }

    pub async fn method_call(
        &self,
        this: &RemoteHandle,
        name: &str,
        args: Vec<RemoteHandle>,
    ) -> Result<Option<RemoteHandle>, ClientError> {
        self.request(Request::MethodCall {
            this: this.stripped(),
            name: name.to_string(),
            args,
        })
        .await
    }

    async fn request(&self, request: Request) -> Reply {
        settle(self.submit(request)?).await
    }

    /// Queue `request` for the writer without waiting for its reply. Requests
    /// reach the socket in the order they are submitted.
    pub(crate) fn submit(&self, request: Request) -> Result<oneshot::Receiver<Reply>, ClientError> {
        let inner = &self.inner;
        let id = RequestId::new(inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        inner.pending.insert(id, tx);

        // The reader drains `pending` after setting `closed`; checking after
        // the insert means a request can never be left waiting forever.
        if inner.closed.load(Ordering::SeqCst) {
            inner.pending.remove(&id);
            return Err(ClientError::ConnectionClosed);
        }

        let kind = request.kind();
        if inner.outgoing.send(ClientMessage { id, request }).is_err() {
            inner.pending.remove(&id);
            return Err(ClientError::ConnectionClosed);
        }
        inner.sent.fetch_add(1, Ordering::Relaxed);
        trace!(%id, kind, "Request sent");
        Ok(rx)
    }
}

/// Wait for the reply to a submitted request.
pub(crate) async fn settle(reply: oneshot::Receiver<Reply>) -> Reply {
    reply.await.unwrap_or(Err(ClientError::ConnectionClosed))
}

pub(crate) fn expect_handle(kind: &str, reply: Option<RemoteHandle>) -> Result<RemoteHandle, ClientError> {
    reply.ok_or_else(|| ClientError::Protocol(format!("{kind} reply carried no handle")))
}

async fn handshake(
    addr: &str,
) -> Result<(FramedRead<OwnedReadHalf, JsonCodec<ServerMessage>>, OwnedWriteHalf, String), ClientError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| ClientError::Connection(format!("{addr}: {e}")))?;
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, JsonCodec::<ServerMessage>::new());

    match reader.next().await {
        Some(Ok(ServerMessage::Hello { version, server })) if version == PROTOCOL_VERSION => {
            Ok((reader, write_half, server))
        }
        Some(Ok(ServerMessage::Hello { version, .. })) => Err(ClientError::Protocol(format!(
            "server speaks protocol {version}, expected {PROTOCOL_VERSION}"
        ))),
        Some(Ok(other)) => Err(ClientError::Protocol(format!(
            "expected hello, got {other:?}"
        ))),
        Some(Err(e)) => Err(ClientError::Connection(e.to_string())),
        None => Err(ClientError::ConnectionClosed),
    }
}

fn fail_all(pending: &Pending, error: ClientError) {
    let ids: Vec<RequestId> = pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, tx)) = pending.remove(&id) {
            let _ = tx.send(Err(error.clone()));
        }
    }
}

async fn write_loop(
    mut writer: FramedWrite<OwnedWriteHalf, JsonCodec<ClientMessage>>,
    mut outgoing: mpsc::UnboundedReceiver<ClientMessage>,
    pending: Pending,
    closed: Arc<AtomicBool>,
) {
    while let Some(msg) = outgoing.recv().await {
        let id = msg.id;
        if let Err(e) = writer.send(msg).await {
            let failure = ClientError::Connection(e.to_string());
            if let Some((_, tx)) = pending.remove(&id) {
                let _ = tx.send(Err(failure));
            }
            match e.kind() {
                std::io::ErrorKind::InvalidInput | std::io::ErrorKind::InvalidData => {
                    warn!(%id, error = %e, "Request could not be encoded");
                }
                _ => {
                    error!(%id, error = %e, "Connection write failed");
                    closed.store(true, Ordering::SeqCst);
                    fail_all(&pending, ClientError::ConnectionClosed);
                    break;
                }
            }
        }
    }
}

async fn read_loop(
    mut reader: FramedRead<OwnedReadHalf, JsonCodec<ServerMessage>>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    errors: broadcast::Sender<WireError>,
) {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(ServerMessage::Reply { id, handle, error }) => {
                let reply = match error {
                    Some(e) => Err(ClientError::Remote(e)),
                    None => Ok(handle),
                };
                match pending.remove(&id) {
                    Some((_, tx)) => {
                        let _ = tx.send(reply);
                    }
                    None => warn!(%id, "Reply for unknown request"),
                }
            }
            Ok(ServerMessage::Error { request, error }) => {
                error!(request = ?request.map(|r| r.get()), %error, "Server reported error");
                let _ = errors.send(error);
            }
            Ok(ServerMessage::Hello { .. }) => {
                warn!("Unexpected hello after handshake");
            }
            Err(e) => {
                error!(error = %e, "Connection read failed");
                break;
            }
        }
    }

    debug!("Connection closed");
    closed.store(true, Ordering::SeqCst);
    fail_all(&pending, ClientError::ConnectionClosed);
}
