//! Deferred values: metadata now, data later.
//!
//! Every call on a [`RemoteSession`] or [`Deferred`] infers the result's
//! metadata locally through a [`MetadataBackend`] and returns at once. The
//! remote request is queued on the session's outbound stage, which waits for
//! the handles of each request's arguments and then submits it. Requests
//! leave in the order they were made, so a later release or write can never
//! overtake an earlier call that reads the same value. Each node's future is
//! shared: awaiting it any number of times issues its request once.

use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, Shared, try_join_all};
use futures::{FutureExt, TryFutureExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use super::comm::{expect_handle, settle};
use super::{ClientConfig, ClientError, Comm};
use crate::artifacts::{ArtifactStore, HttpArtifactStore};
use crate::backend::{MetadataBackend, Operand, ShapeBackend};
use crate::bridge::{OP_DISPOSE, OP_LOAD_MODEL, OP_SAVE_MODEL, Request};
use crate::handle::{HandleId, Metadata, Payload, RemoteHandle};
use crate::payload::{ArrayData, ArrayPayload};

type Reply = Result<Option<RemoteHandle>, ClientError>;
type Node = Shared<BoxFuture<'static, Reply>>;
type HandleFuture = BoxFuture<'static, Result<RemoteHandle, ClientError>>;
type Build = Box<dyn FnOnce(Vec<RemoteHandle>) -> Result<Request, ClientError> + Send>;

/// One queued request: the handles it waits for and how to build it from them.
struct Job {
    upstream: Vec<HandleFuture>,
    build: Build,
    submitted: oneshot::Sender<Result<oneshot::Receiver<Reply>, ClientError>>,
}

struct SessionInner {
    comm: Comm,
    shapes: Arc<dyn MetadataBackend>,
    artifacts: Arc<dyn ArtifactStore>,
    jobs: mpsc::UnboundedSender<Job>,
}

/// Client entry point: a connection plus the metadata twin of the server's backend.
#[derive(Clone)]
pub struct RemoteSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSession")
            .field("comm", &self.inner.comm)
            .finish_non_exhaustive()
    }
}

impl RemoteSession {
    /// Connect to `addr` with the reference [`ShapeBackend`] and a weightless
    /// HTTP artifact store for model metadata.
    pub async fn connect(addr: &str, config: &ClientConfig) -> Result<Self, ClientError> {
        let comm = Comm::connect(addr, config).await?;
        Self::new(
            comm,
            Arc::new(ShapeBackend::new()),
            Arc::new(HttpArtifactStore::weightless()),
        )
    }

    /// Must be called from within a tokio runtime; the outbound stage runs on it.
    pub fn new(
        comm: Comm,
        shapes: Arc<dyn MetadataBackend>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Result<Self, ClientError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|e| ClientError::Task(e.to_string()))?;
        let (jobs, queue) = mpsc::unbounded_channel();
        runtime.spawn(outbound(comm.clone(), queue));
        Ok(Self {
            inner: Arc::new(SessionInner {
                comm,
                shapes,
                artifacts,
                jobs,
            }),
        })
    }

    pub fn comm(&self) -> &Comm {
        &self.inner.comm
    }

    /// Free-function operation.
    pub fn op(&self, name: &str, args: Vec<Arg>) -> Result<Deferred, ClientError> {
        let operands = operands(&args)?;
        let metadata = self.inner.shapes.infer_op(name, &operands)?;
        let upstream = args.into_iter().map(Arg::into_handle).collect();
        let name = name.to_string();
        let reply = self.enqueue(upstream, move |args| Ok(Request::Op { name, args }));
        Ok(self.node(metadata, reply))
    }

    /// Send `payload` to the server under a fresh id.
    pub fn upload(&self, payload: ArrayPayload) -> Result<Deferred, ClientError> {
        payload.validate()?;
        let metadata = payload.metadata();
        let reply = self
            .enqueue(Vec::new(), move |_| {
                Ok(Request::Upload {
                    handle: RemoteHandle::array(payload),
                })
            })
            .and_then(|reply| async move { expect_handle("upload", reply).map(Some) })
            .boxed();
        Ok(self.node(Some(metadata), reply))
    }

    /// Wrap a handle to a value the server already holds.
    pub fn attach(&self, handle: RemoteHandle) -> Deferred {
        let reference = handle.stripped();
        let metadata = reference.metadata.clone();
        self.node(
            Some(metadata),
            futures::future::ready(Ok(Some(reference))).boxed(),
        )
    }

    /// Load a model on the server. Returns once the model's metadata is known
    /// locally; the remote load continues in the background. Nothing is sent
    /// when the local load or inference fails.
    pub async fn load_model(&self, url: &str) -> Result<Deferred, ClientError> {
        let artifacts = self
            .inner
            .artifacts
            .load(url)
            .await
            .map_err(|e| ClientError::Artifacts(e.to_string()))?;
        let metadata = self.inner.shapes.infer_model(&artifacts)?;
        debug!(url, "Model metadata resolved locally");

        let url = Value::String(url.to_string());
        let reply = self.enqueue(Vec::new(), move |_| {
            Ok(Request::Op {
                name: OP_LOAD_MODEL.to_string(),
                args: vec![RemoteHandle::literal(url)],
            })
        });
        Ok(self.node(Some(metadata), reply))
    }

    /// Save a model held by the server to `url`. Queued when called.
    pub fn save_model(
        &self,
        model: &Deferred,
        url: &str,
    ) -> impl Future<Output = Result<(), ClientError>> + Send + 'static {
        let url = Value::String(url.to_string());
        let reply = self.enqueue(vec![model.handle_future()], move |handles| {
            let mut args = handles;
            args.push(RemoteHandle::literal(url));
            Ok(Request::Op {
                name: OP_SAVE_MODEL.to_string(),
                args,
            })
        });
        async move {
            reply.await?;
            Ok(())
        }
    }

    /// Queue a request behind every request made before it. The returned
    /// future resolves with the server's reply; the request is sent whether
    /// or not it is polled.
    fn enqueue<F>(&self, upstream: Vec<HandleFuture>, build: F) -> BoxFuture<'static, Reply>
    where
        F: FnOnce(Vec<RemoteHandle>) -> Result<Request, ClientError> + Send + 'static,
    {
        let (submitted, receipt) = oneshot::channel();
        let job = Job {
            upstream,
            build: Box::new(build),
            submitted,
        };
        let queued = self.inner.jobs.send(job).is_ok();
        async move {
            if !queued {
                return Err(ClientError::ConnectionClosed);
            }
            let reply = receipt.await.map_err(|_| ClientError::ConnectionClosed)??;
            settle(reply).await
        }
        .boxed()
    }

    fn node(&self, metadata: Option<Metadata>, future: BoxFuture<'static, Reply>) -> Deferred {
        let local_id = HandleId::mint();
        if let Some(metadata) = &metadata {
            self.inner.shapes.register(&local_id, metadata);
        }
        Deferred {
            session: self.clone(),
            local_id,
            metadata,
            node: future.shared(),
        }
    }
}

/// Submits queued jobs strictly in queue order. A job whose upstream failed
/// reports that failure and sends nothing.
async fn outbound(comm: Comm, mut queue: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = queue.recv().await {
        let submitted = match try_join_all(job.upstream).await {
            Ok(handles) => (job.build)(handles).and_then(|request| comm.submit(request)),
            Err(e) => Err(e),
        };
        if let Err(e) = &submitted {
            trace!(error = %e, "Queued request not sent");
        }
        let _ = job.submitted.send(submitted);
    }
}

/// The reference a request addresses: the first of its resolved upstreams.
fn target(handle: Option<RemoteHandle>) -> Result<RemoteHandle, ClientError> {
    handle
        .map(RemoteHandle::into_reference)
        .ok_or_else(|| ClientError::Protocol("request built without its target".into()))
}

/// A value the server is computing or holds.
///
/// Cloning is cheap and clones share the pending request.
#[derive(Clone)]
pub struct Deferred {
    session: RemoteSession,
    local_id: HandleId,
    metadata: Option<Metadata>,
    node: Node,
}

impl std::fmt::Debug for Deferred {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("local_id", &self.local_id)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

impl Deferred {
    /// Client-side id, distinct from the id the server assigns.
    pub fn local_id(&self) -> &HandleId {
        &self.local_id
    }

    /// Inferred metadata. `None` for calls that produce no value.
    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    pub fn is_void(&self) -> bool {
        self.metadata.is_none()
    }

    /// Method call with `self` as receiver.
    pub fn call(&self, name: &str, args: Vec<Arg>) -> Result<Deferred, ClientError> {
        let this = self
            .metadata
            .as_ref()
            .ok_or_else(|| ClientError::Void(name.to_string()))?;
        let operands = operands(&args)?;
        let metadata = self.session.inner.shapes.infer_method(this, name, &operands)?;

        let mut upstream = vec![self.handle_future()];
        upstream.extend(args.into_iter().map(Arg::into_handle));
        let name = name.to_string();
        let reply = self.session.enqueue(upstream, move |handles| {
            let mut handles = handles.into_iter();
            let this = target(handles.next())?;
            Ok(Request::MethodCall {
                this,
                name,
                args: handles.collect(),
            })
        });
        Ok(self.session.node(metadata, reply))
    }

    /// Wait for the server and return the reference to the stored value.
    pub async fn resolve(&self) -> Result<RemoteHandle, ClientError> {
        self.handle_future().await
    }

    /// Download the value once the server has it. Queued when called, so a
    /// later write or release does not affect what is downloaded.
    pub fn materialize(
        &self,
    ) -> impl Future<Output = Result<ArrayPayload, ClientError>> + Send + 'static {
        let reply = self.session.enqueue(vec![self.handle_future()], |handles| {
            Ok(Request::Download {
                handle: target(handles.into_iter().next())?,
            })
        });
        async move {
            let downloaded = expect_handle("download", reply.await?)?;
            match downloaded.payload {
                Some(Payload::Array(payload)) => {
                    payload.validate()?;
                    Ok(payload)
                }
                _ => Err(ClientError::Protocol(format!(
                    "download of {} carried no array payload",
                    downloaded.id
                ))),
            }
        }
    }

    /// [`materialize`](Self::materialize) decoded into typed elements.
    pub async fn materialize_data(&self) -> Result<ArrayData, ClientError> {
        Ok(self.materialize().await?.decode()?)
    }

    /// Always fails: the value lives on another process.
    pub fn materialize_sync(&self) -> Result<ArrayPayload, ClientError> {
        Err(ClientError::Unsupported(
            "synchronous materialization of a remote value".into(),
        ))
    }

    /// Tell the server the value may be discarded. Queued when called, after
    /// every request already made on this session.
    pub fn release(&self) -> impl Future<Output = Result<(), ClientError>> + Send + 'static {
        let reply = self.session.enqueue(vec![self.handle_future()], |handles| {
            Ok(Request::MethodCall {
                this: target(handles.into_iter().next())?,
                name: OP_DISPOSE.to_string(),
                args: Vec::new(),
            })
        });
        async move {
            reply.await?;
            Ok(())
        }
    }

    /// Replace the remote value with `payload` once this one is available.
    pub fn write(&self, payload: ArrayPayload) -> Result<Deferred, ClientError> {
        payload.validate()?;
        let metadata = payload.metadata();
        let reply = self
            .session
            .enqueue(vec![self.handle_future()], move |handles| {
                Ok(Request::Update {
                    handle: target(handles.into_iter().next())?,
                    payload,
                })
            })
            .and_then(|reply| async move { expect_handle("update", reply).map(Some) })
            .boxed();
        Ok(self.session.node(Some(metadata), reply))
    }

    fn handle_future(&self) -> HandleFuture {
        let local_id = self.local_id.clone();
        self.node
            .clone()
            .and_then(move |reply| async move {
                reply
                    .map(|handle| handle.into_reference())
                    .ok_or_else(|| ClientError::Void(local_id.to_string()))
            })
            .boxed()
    }
}

/// Argument to a deferred call.
#[derive(Debug, Clone)]
pub enum Arg {
    /// Another deferred value; the call waits for it.
    Deferred(Deferred),
    /// A handle sent as is: a reference, or carrying its payload inline.
    Handle(RemoteHandle),
    /// Array data sent inline.
    Array(ArrayPayload),
    /// JSON literal such as a scalar, shape or axis.
    Literal(Value),
}

impl Arg {
    fn operand(&self) -> Result<Operand<Metadata>, ClientError> {
        Ok(match self {
            Self::Deferred(d) => Operand::Value(Arc::new(
                d.metadata
                    .clone()
                    .ok_or_else(|| ClientError::Void(d.local_id.to_string()))?,
            )),
            Self::Handle(handle) => match &handle.payload {
                Some(Payload::Array(payload)) => Operand::Value(Arc::new(payload.metadata())),
                Some(Payload::Literal(value)) => Operand::Literal(value.clone()),
                None => Operand::Value(Arc::new(handle.metadata.clone())),
            },
            Self::Array(payload) => Operand::Value(Arc::new(payload.metadata())),
            Self::Literal(value) => Operand::Literal(value.clone()),
        })
    }

    fn into_handle(self) -> HandleFuture {
        match self {
            Self::Deferred(d) => d.handle_future(),
            Self::Handle(handle) => futures::future::ready(Ok(handle)).boxed(),
            Self::Array(payload) => futures::future::ready(Ok(RemoteHandle::array(payload))).boxed(),
            Self::Literal(value) => futures::future::ready(Ok(RemoteHandle::literal(value))).boxed(),
        }
    }
}

fn operands(args: &[Arg]) -> Result<Vec<Operand<Metadata>>, ClientError> {
    args.iter().map(Arg::operand).collect()
}

impl From<Deferred> for Arg {
    fn from(d: Deferred) -> Self {
        Self::Deferred(d)
    }
}

impl From<&Deferred> for Arg {
    fn from(d: &Deferred) -> Self {
        Self::Deferred(d.clone())
    }
}

impl From<RemoteHandle> for Arg {
    fn from(handle: RemoteHandle) -> Self {
        Self::Handle(handle)
    }
}

impl From<ArrayPayload> for Arg {
    fn from(payload: ArrayPayload) -> Self {
        Self::Array(payload)
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Self::Literal(value)
    }
}

impl From<f64> for Arg {
    fn from(n: f64) -> Self {
        Self::Literal(Value::from(n))
    }
}

impl From<bool> for Arg {
    fn from(b: bool) -> Self {
        Self::Literal(Value::Bool(b))
    }
}

impl From<Vec<usize>> for Arg {
    fn from(shape: Vec<usize>) -> Self {
        Self::Literal(Value::from(shape))
    }
}
