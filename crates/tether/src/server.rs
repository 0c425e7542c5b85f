//! TCP server: one framed JSON connection per client.
//!
//! Every connection gets a `hello`, then a read loop that admits each request
//! into the dispatcher's sequencer in receipt order and runs it on its own
//! task. Replies are written as they complete, so they may overtake each
//! other. Failures are answered on the reply and also announced as an `error`
//! frame.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

use crate::TETHER_VERSION;
use crate::backend::ComputeBackend;
use crate::bridge::{ClientMessage, ErrorKind, JsonCodec, ServerMessage, WireError};
use crate::dispatcher::Dispatcher;
use crate::table::{EvictionPolicy, IdleTimeout, NeverEvict};

type ConnectionWriter = Arc<tokio::sync::Mutex<FramedWrite<OwnedWriteHalf, JsonCodec<ServerMessage>>>>;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Evict table entries untouched for this long. `None` keeps them until disposed.
    pub idle_ttl: Option<Duration>,
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3060,
            idle_ttl: None,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `TETHER_HOST`, `TETHER_PORT`,
    /// `TETHER_IDLE_TTL_SECS` and `TETHER_SWEEP_INTERVAL_SECS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = |key: &str| {
            std::env::var(key)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs)
        };
        Self {
            host: std::env::var("TETHER_HOST").unwrap_or(defaults.host),
            port: std::env::var("TETHER_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            idle_ttl: secs("TETHER_IDLE_TTL_SECS"),
            sweep_interval: secs("TETHER_SWEEP_INTERVAL_SECS").unwrap_or(defaults.sweep_interval),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_idle_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.idle_ttl = ttl;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn eviction_policy(&self) -> Arc<dyn EvictionPolicy> {
        match self.idle_ttl {
            Some(ttl) => Arc::new(IdleTimeout::new(ttl)),
            None => Arc::new(NeverEvict),
        }
    }
}

/// Accept connections on `listener` until `shutdown` resolves.
pub async fn serve<B, F>(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher<B>>,
    config: &ServerConfig,
    shutdown: F,
) -> io::Result<()>
where
    B: ComputeBackend,
    F: Future<Output = ()>,
{
    info!("Serving tether on {}", listener.local_addr()?);

    let sweeper = config.idle_ttl.map(|ttl| {
        let dispatcher = Arc::clone(&dispatcher);
        let interval = config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = dispatcher.sweep();
                if evicted > 0 {
                    info!(evicted, ttl_secs = ttl.as_secs(), "Evicted idle values");
                }
            }
        })
    });

    let mut connections = JoinSet::new();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        connections.spawn(handle_connection(stream, peer, Arc::clone(&dispatcher)));
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = &mut shutdown => {
                info!("Shutting down, closing {} connections", connections.len());
                break;
            }
        }
    }

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    connections.shutdown().await;
    info!("Server shutdown complete");
    Ok(())
}

async fn handle_connection<B: ComputeBackend>(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher<B>>,
) {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, JsonCodec::<ClientMessage>::new());
    let writer: ConnectionWriter = Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
        write_half,
        JsonCodec::<ServerMessage>::new(),
    )));

    info!(%peer, "Client connected");
    if let Err(e) = send(&writer, ServerMessage::hello(format!("tether/{TETHER_VERSION}"))).await {
        warn!(%peer, error = %e, "Failed to send hello");
        return;
    }

    loop {
        match reader.next().await {
            Some(Ok(ClientMessage { id, request })) => {
                let kind = request.kind();
                debug!(%peer, %id, kind, "Request received");
                let mut ticket = dispatcher.admit(&request);
                let dispatcher = Arc::clone(&dispatcher);
                let writer = Arc::clone(&writer);
                tokio::spawn(async move {
                    ticket.ready().await;
                    let result = dispatcher.dispatch(request).await;
                    drop(ticket);

                    let result = result.map_err(|e| {
                        error!(%peer, %id, kind, error = %e, "Request failed");
                        e.to_wire()
                    });
                    if let Err(wire) = &result {
                        let notice = ServerMessage::Error {
                            request: Some(id),
                            error: wire.clone(),
                        };
                        if let Err(e) = send(&writer, notice).await {
                            debug!(%peer, error = %e, "Failed to send error notice");
                        }
                    }
                    if let Err(e) = send(&writer, ServerMessage::reply(id, result)).await {
                        warn!(%peer, %id, error = %e, "Failed to send reply");
                    }
                });
            }
            Some(Err(e)) => {
                error!(%peer, error = %e, "Malformed frame, closing connection");
                let notice = ServerMessage::Error {
                    request: None,
                    error: WireError::new(ErrorKind::Protocol, e.to_string()),
                };
                let _ = send(&writer, notice).await;
                break;
            }
            None => {
                info!(%peer, "Client disconnected");
                break;
            }
        }
    }
}

async fn send(writer: &ConnectionWriter, msg: ServerMessage) -> io::Result<()> {
    let mut w = writer.lock().await;
    w.send(msg).await
}
