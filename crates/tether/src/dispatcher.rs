//! Server-side request dispatch.
//!
//! Turns protocol requests into table and backend calls. Backend kernels run
//! on the blocking pool so a panic in one surfaces as a failed request instead
//! of taking the connection down. A failing request never leaves the table
//! half-updated: values are decoded or computed before anything is installed.

use std::sync::Arc;

use crate::artifacts::{ArtifactError, ArtifactStore};
use crate::backend::{BackendError, ComputeBackend, Operand};
use crate::bridge::{ErrorKind, OP_DISPOSE, OP_LOAD_MODEL, OP_SAVE_MODEL, Request, WireError};
use crate::handle::{HandleId, Payload, RemoteHandle};
use crate::payload::{ArrayPayload, PayloadError};
use crate::sequencer::{IdSequencer, Ticket};
use crate::table::{EvictionPolicy, NeverEvict, TableError, VariableTable};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Table(#[from] TableError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Artifacts(#[from] ArtifactError),

    #[error("'{0}' panicked")]
    Panicked(String),

    #[error("'{name}' did not complete: {reason}")]
    Aborted { name: String, reason: String },
}

impl From<PayloadError> for DispatchError {
    fn from(e: PayloadError) -> Self {
        Self::InvalidPayload(e.to_string())
    }
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Table(TableError::NotFound(_)) => ErrorKind::NotFound,
            Self::Table(TableError::AlreadyRegistered(_)) => ErrorKind::RemoteExecutionFailure,
            Self::Backend(BackendError::UnknownOperation(_) | BackendError::UnknownMethod { .. }) => {
                ErrorKind::UnknownOperation
            }
            Self::Backend(BackendError::Payload(_)) | Self::InvalidPayload(_) => {
                ErrorKind::InvalidPayload
            }
            Self::Backend(BackendError::Unsupported(_)) => ErrorKind::Unsupported,
            Self::Backend(_) | Self::Artifacts(_) | Self::Panicked(_) | Self::Aborted { .. } => {
                ErrorKind::RemoteExecutionFailure
            }
        }
    }

    pub fn to_wire(&self) -> WireError {
        WireError::new(self.kind(), self.to_string())
    }
}

pub type DispatchResult = Result<Option<RemoteHandle>, DispatchError>;

pub struct Dispatcher<B: ComputeBackend> {
    backend: Arc<B>,
    table: VariableTable<B::Value>,
    artifacts: Arc<dyn ArtifactStore>,
    sequencer: IdSequencer,
}

impl<B: ComputeBackend> Dispatcher<B> {
    pub fn new(backend: B, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self::with_policy(backend, artifacts, Arc::new(NeverEvict))
    }

    pub fn with_policy(
        backend: B,
        artifacts: Arc<dyn ArtifactStore>,
        policy: Arc<dyn EvictionPolicy>,
    ) -> Self {
        let backend = Arc::new(backend);
        let releaser = Arc::clone(&backend);
        let table = VariableTable::with_policy(
            Arc::new(move |value: &B::Value| releaser.release(value)),
            policy,
        );
        Self {
            backend,
            table,
            artifacts,
            sequencer: IdSequencer::new(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn table(&self) -> &VariableTable<B::Value> {
        &self.table
    }

    /// Evict idle values, sparing ids that an admitted request still waits on.
    pub fn sweep(&self) -> usize {
        self.table.sweep(|id| self.sequencer.is_pending(id))
    }

    /// Reserve this request's place in line. Call in receipt order.
    pub fn admit(&self, request: &Request) -> Ticket {
        self.sequencer.admit(request.touched_ids())
    }

    /// Admit, wait for predecessors on the same ids, then dispatch.
    pub async fn handle(&self, request: Request) -> DispatchResult {
        let mut ticket = self.admit(&request);
        ticket.ready().await;
        self.dispatch(request).await
    }

    /// Execute a request. Callers must hold its admitted, ready [`Ticket`].
    pub async fn dispatch(&self, request: Request) -> DispatchResult {
        let kind = request.kind();
        tracing::debug!(kind, "Dispatching request");
        match request {
            Request::Upload { handle } => self.upload(handle),
            Request::Download { handle } => self.download(handle),
            Request::Update { handle, payload } => self.update(handle, payload),
            Request::Op { name, args } => self.op(name, args).await,
            Request::MethodCall { this, name, args } => self.method_call(this, name, args).await,
        }
    }

    fn upload(&self, handle: RemoteHandle) -> DispatchResult {
        let payload = match &handle.payload {
            Some(Payload::Array(payload)) => payload,
            Some(Payload::Literal(_)) => {
                return Err(DispatchError::InvalidPayload(
                    "upload expects an array payload".into(),
                ));
            }
            None => {
                return Err(DispatchError::InvalidPayload(
                    "upload carries no payload".into(),
                ));
            }
        };
        let value = self.decode(payload)?;
        self.table.replace(handle.id.clone(), value);
        Ok(Some(handle.into_reference()))
    }

    fn download(&self, handle: RemoteHandle) -> DispatchResult {
        let value = self.table.get(&handle.id)?;
        let payload = self.backend.encode(&value)?;
        let metadata = self.backend.metadata(&value);
        Ok(Some(
            RemoteHandle::new(handle.id, metadata).with_payload(Payload::Array(payload)),
        ))
    }

    fn update(&self, handle: RemoteHandle, payload: ArrayPayload) -> DispatchResult {
        let value = self.decode(&payload)?;
        let metadata = self.backend.metadata(&value);
        self.table.replace(handle.id.clone(), value);
        Ok(Some(RemoteHandle::new(handle.id, metadata)))
    }

    async fn op(&self, name: String, args: Vec<RemoteHandle>) -> DispatchResult {
        match name.as_str() {
            OP_LOAD_MODEL => return self.load_model(&args).await,
            OP_SAVE_MODEL => return self.save_model(&args).await,
            OP_DISPOSE => return self.dispose(&args),
            _ => {}
        }

        let operands = self.resolve(&args)?;
        let backend = Arc::clone(&self.backend);
        let label = name.clone();
        let result = run_blocking(label, move || backend.call_op(&name, &operands)).await?;
        result.map(|value| self.store(value)).transpose()
    }

    async fn method_call(
        &self,
        this: RemoteHandle,
        name: String,
        args: Vec<RemoteHandle>,
    ) -> DispatchResult {
        if name == OP_DISPOSE {
            return self.dispose(std::slice::from_ref(&this));
        }

        let receiver = self.table.get(&this.id)?;
        let operands = self.resolve(&args)?;
        let backend = Arc::clone(&self.backend);
        let label = name.clone();
        let result = run_blocking(label, move || {
            backend.call_method(&receiver, &name, &operands)
        })
        .await?;
        result.map(|value| self.store(value)).transpose()
    }

    /// Remove every addressed value. Validates all ids first; an id that
    /// vanishes after validation counts as released.
    fn dispose(&self, targets: &[RemoteHandle]) -> DispatchResult {
        if let Some(missing) = targets.iter().find(|h| !self.table.contains(&h.id)) {
            return Err(TableError::NotFound(missing.id.clone()).into());
        }
        for handle in targets {
            match self.table.delete(&handle.id) {
                Ok(()) => {}
                Err(TableError::NotFound(id)) => {
                    tracing::debug!(%id, "Value already released");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    async fn load_model(&self, args: &[RemoteHandle]) -> DispatchResult {
        let url = url_arg(OP_LOAD_MODEL, args, 0)?;
        let artifacts = self.artifacts.load(url).await?;
        tracing::info!(url, weights = artifacts.weight_specs.len(), "Loading model");
        let backend = Arc::clone(&self.backend);
        let value = run_blocking(OP_LOAD_MODEL.to_string(), move || {
            backend.load_model(artifacts)
        })
        .await?;
        self.store(value).map(Some)
    }

    async fn save_model(&self, args: &[RemoteHandle]) -> DispatchResult {
        let model = args
            .first()
            .ok_or_else(|| BackendError::invalid(OP_SAVE_MODEL, "missing model argument"))?;
        let url = url_arg(OP_SAVE_MODEL, args, 1)?;
        let value = self.table.get(&model.id)?;
        let artifacts = self.backend.export_model(&value)?;
        let status = self.artifacts.save(url, &artifacts).await?;
        tracing::info!(url, status = status.status, "Saved model");
        Ok(None)
    }

    fn decode(&self, payload: &ArrayPayload) -> Result<B::Value, DispatchError> {
        payload.validate()?;
        Ok(self.backend.decode(payload)?)
    }

    /// Inline payloads are decoded, references are looked up.
    fn resolve(&self, args: &[RemoteHandle]) -> Result<Vec<Operand<B::Value>>, DispatchError> {
        args.iter()
            .map(|arg| match &arg.payload {
                Some(Payload::Array(payload)) => Ok(Operand::Value(Arc::new(self.decode(payload)?))),
                Some(Payload::Literal(value)) => Ok(Operand::Literal(value.clone())),
                None => Ok(Operand::Value(self.table.get(&arg.id)?)),
            })
            .collect()
    }

    fn store(&self, value: B::Value) -> Result<RemoteHandle, DispatchError> {
        let id = HandleId::mint();
        let metadata = self.backend.metadata(&value);
        self.table.register(id.clone(), value)?;
        Ok(RemoteHandle::new(id, metadata))
    }
}

fn url_arg<'a>(op: &str, args: &'a [RemoteHandle], i: usize) -> Result<&'a str, DispatchError> {
    match args.get(i).and_then(|h| h.payload.as_ref()) {
        Some(Payload::Literal(serde_json::Value::String(url))) => Ok(url),
        _ => Err(BackendError::invalid(op, format!("argument {i} must be a url string")).into()),
    }
}

async fn run_blocking<T, F>(name: String, f: F) -> Result<T, DispatchError>
where
    F: FnOnce() -> Result<T, BackendError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => Ok(result?),
        Err(e) if e.is_panic() => {
            tracing::error!(%name, "Backend call panicked");
            Err(DispatchError::Panicked(name))
        }
        Err(e) => Err(DispatchError::Aborted {
            name,
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::MemoryArtifactStore;
    use crate::backend::model::fixtures::tiny_artifacts;
    use crate::backend::{CpuBackend, CpuValue};
    use crate::handle::Metadata;
    use crate::payload::ArrayData;
    use serde_json::json;

    fn dispatcher() -> (Dispatcher<CpuBackend>, Arc<MemoryArtifactStore>) {
        let store = Arc::new(MemoryArtifactStore::new());
        (Dispatcher::new(CpuBackend::new(), store.clone()), store)
    }

    fn floats(shape: &[usize], values: Vec<f32>) -> ArrayPayload {
        ArrayData::Float32(values).encode(shape).unwrap()
    }

    fn reference(id: &HandleId) -> RemoteHandle {
        RemoteHandle::new(id.clone(), Metadata::new())
    }

    async fn upload(d: &Dispatcher<CpuBackend>, payload: ArrayPayload) -> HandleId {
        let handle = RemoteHandle::array(payload);
        let id = handle.id.clone();
        d.handle(Request::Upload { handle }).await.unwrap();
        id
    }

    async fn download(d: &Dispatcher<CpuBackend>, id: &HandleId) -> ArrayData {
        let reply = d
            .handle(Request::Download { handle: reference(id) })
            .await
            .unwrap()
            .unwrap();
        match reply.payload {
            Some(Payload::Array(p)) => p.decode().unwrap(),
            other => panic!("expected array payload, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn upload_then_download_round_trips() {
        let (d, _) = dispatcher();
        let payload = floats(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let handle = RemoteHandle::array(payload.clone());
        let reply = d
            .handle(Request::Upload { handle: handle.clone() })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, handle.stripped());

        let downloaded = d
            .handle(Request::Download { handle: reference(&handle.id) })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(downloaded.payload, Some(Payload::Array(payload.clone())));
        assert_eq!(downloaded.metadata, payload.metadata());
    }

    #[tokio::test]
    async fn each_op_registers_one_value() {
        let (d, _) = dispatcher();
        let x = upload(&d, floats(&[3], vec![1.0, 2.0, 3.0])).await;
        assert_eq!(d.table().len(), 1);

        let mut ids = std::collections::HashSet::new();
        for _ in 0..5 {
            let reply = d
                .handle(Request::Op {
                    name: "add".into(),
                    args: vec![reference(&x), reference(&x)],
                })
                .await
                .unwrap()
                .unwrap();
            assert!(reply.is_reference());
            ids.insert(reply.id);
        }
        assert_eq!(ids.len(), 5);
        assert_eq!(d.table().len(), 6);
    }

    #[tokio::test]
    async fn void_results_are_not_registered() {
        let (d, _) = dispatcher();
        let x = upload(&d, floats(&[1], vec![1.0])).await;
        let reply = d
            .handle(Request::MethodCall {
                this: reference(&x),
                name: OP_DISPOSE.into(),
                args: vec![],
            })
            .await
            .unwrap();
        assert_eq!(reply, None);
        assert!(d.table().is_empty());
        assert_eq!(d.backend().released(), 1);
    }

    #[tokio::test]
    async fn inline_arguments_are_decoded_not_looked_up() {
        let (d, _) = dispatcher();
        let reply = d
            .handle(Request::Op {
                name: "mul".into(),
                args: vec![
                    RemoteHandle::array(floats(&[2], vec![2.0, 3.0])),
                    RemoteHandle::literal(json!(10)),
                ],
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(d.table().len(), 1);
        assert_eq!(download(&d, &reply.id).await, ArrayData::Float32(vec![20.0, 30.0]));
    }

    #[tokio::test]
    async fn update_releases_prior_value_once() {
        let (d, _) = dispatcher();
        let x = upload(&d, floats(&[2], vec![1.0, 2.0])).await;
        let reply = d
            .handle(Request::Update {
                handle: reference(&x),
                payload: ArrayData::Int32(vec![7, 8, 9]).encode(&[3]).unwrap(),
            })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reply.metadata["shape"], json!([3]));
        assert_eq!(d.backend().released(), 1);
        assert_eq!(download(&d, &x).await, ArrayData::Int32(vec![7, 8, 9]));
    }

    #[tokio::test]
    async fn unknown_op_leaves_table_unchanged() {
        let (d, _) = dispatcher();
        let x = upload(&d, floats(&[1], vec![1.0])).await;
        let err = d
            .handle(Request::Op {
                name: "explode".into(),
                args: vec![reference(&x)],
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownOperation);
        assert_eq!(d.table().len(), 1);
    }

    #[tokio::test]
    async fn queued_ids_survive_idle_sweep() {
        use crate::table::IdleTimeout;
        use std::time::Duration;

        let store = Arc::new(MemoryArtifactStore::new());
        let d = Dispatcher::with_policy(
            CpuBackend::new(),
            store,
            Arc::new(IdleTimeout::new(Duration::ZERO)),
        );
        let x = upload(&d, floats(&[1], vec![1.0])).await;

        let dispose = Request::Op {
            name: OP_DISPOSE.into(),
            args: vec![reference(&x)],
        };
        let mut ticket = d.admit(&dispose);
        assert_eq!(d.sweep(), 0);
        assert!(d.table().contains(&x));

        ticket.ready().await;
        assert_eq!(d.dispatch(dispose).await.unwrap(), None);
        drop(ticket);
        assert!(d.table().is_empty());
        assert_eq!(d.backend().released(), 1);

        let y = upload(&d, floats(&[1], vec![2.0])).await;
        assert_eq!(d.sweep(), 1);
        assert!(!d.table().contains(&y));
    }

    #[tokio::test]
    async fn dispose_tolerates_ids_gone_after_validation() {
        let (d, _) = dispatcher();
        let x = upload(&d, floats(&[1], vec![1.0])).await;
        let y = upload(&d, floats(&[1], vec![2.0])).await;

        // The second `x` finds its value already released by the first.
        let reply = d
            .handle(Request::Op {
                name: OP_DISPOSE.into(),
                args: vec![reference(&x), reference(&x), reference(&y)],
            })
            .await
            .unwrap();
        assert_eq!(reply, None);
        assert!(d.table().is_empty());
        assert_eq!(d.backend().released(), 2);
    }

    #[tokio::test]
    async fn missing_handle_is_not_found() {
        let (d, _) = dispatcher();
        let ghost = HandleId::from("ghost");
        let err = d
            .handle(Request::Download { handle: reference(&ghost) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = d
            .handle(Request::Op {
                name: OP_DISPOSE.into(),
                args: vec![reference(&ghost)],
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_wire().kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn bad_payload_is_rejected_before_install() {
        let (d, _) = dispatcher();
        let mut payload = floats(&[2], vec![1.0, 2.0]);
        payload.bytes.pop();
        let err = d
            .handle(Request::Upload { handle: RemoteHandle::array(payload) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPayload);
        assert!(d.table().is_empty());

        let err = d
            .handle(Request::Upload { handle: RemoteHandle::literal(json!(1)) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPayload);
    }

    #[tokio::test]
    async fn dispose_op_checks_every_target_first() {
        let (d, _) = dispatcher();
        let x = upload(&d, floats(&[1], vec![1.0])).await;
        let err = d
            .handle(Request::Op {
                name: OP_DISPOSE.into(),
                args: vec![reference(&x), reference(&HandleId::from("ghost"))],
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(d.table().contains(&x));
    }

    #[tokio::test]
    async fn load_predict_and_save_model() {
        let (d, store) = dispatcher();
        store.insert("mem://tiny/model.json", tiny_artifacts());

        let model = d
            .handle(Request::Op {
                name: OP_LOAD_MODEL.into(),
                args: vec![RemoteHandle::literal(json!("remote://mem://tiny/model.json"))],
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(model.metadata["kind"], "model");

        let input = upload(&d, floats(&[1, 3], vec![1.0, 0.0, 3.0])).await;
        let out = d
            .handle(Request::MethodCall {
                this: reference(&model.id),
                name: "predict".into(),
                args: vec![reference(&input)],
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(download(&d, &out.id).await, ArrayData::Float32(vec![8.0]));

        let saved = d
            .handle(Request::Op {
                name: OP_SAVE_MODEL.into(),
                args: vec![reference(&model.id), RemoteHandle::literal(json!("mem://copy/model.json"))],
            })
            .await
            .unwrap();
        assert_eq!(saved, None);
        assert_eq!(store.get("mem://copy/model.json"), Some(tiny_artifacts()));
    }

    #[tokio::test]
    async fn model_download_is_unsupported() {
        let (d, store) = dispatcher();
        store.insert("m", tiny_artifacts());
        let model = d
            .handle(Request::Op {
                name: OP_LOAD_MODEL.into(),
                args: vec![RemoteHandle::literal(json!("m"))],
            })
            .await
            .unwrap()
            .unwrap();
        let err = d
            .handle(Request::Download { handle: reference(&model.id) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    struct PanickingBackend;

    impl ComputeBackend for PanickingBackend {
        type Value = ();

        fn call_op(&self, name: &str, _: &[Operand<()>]) -> Result<Option<()>, BackendError> {
            panic!("kernel {name} blew up");
        }

        fn call_method(&self, _: &(), name: &str, _: &[Operand<()>]) -> Result<Option<()>, BackendError> {
            Err(BackendError::unknown_method("unit", name))
        }

        fn metadata(&self, _: &()) -> Metadata {
            Metadata::new()
        }

        fn decode(&self, _: &ArrayPayload) -> Result<(), BackendError> {
            Ok(())
        }

        fn encode(&self, _: &()) -> Result<ArrayPayload, BackendError> {
            Err(BackendError::Unsupported("encode".into()))
        }
    }

    #[tokio::test]
    async fn backend_panic_becomes_execution_failure() {
        let d = Dispatcher::new(PanickingBackend, Arc::new(MemoryArtifactStore::new()));
        let err = d
            .handle(Request::Op { name: "anything".into(), args: vec![] })
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Panicked(_)));
        assert_eq!(err.kind(), ErrorKind::RemoteExecutionFailure);
    }

    #[tokio::test]
    async fn same_id_requests_apply_in_admission_order() {
        let (d, _) = dispatcher();
        let d = Arc::new(d);
        let x = upload(&d, floats(&[1], vec![0.0])).await;

        let mut tasks = Vec::new();
        for i in 1..=20 {
            let request = Request::Update {
                handle: reference(&x),
                payload: floats(&[1], vec![i as f32]),
            };
            let mut ticket = d.admit(&request);
            let d = Arc::clone(&d);
            tasks.push(tokio::spawn(async move {
                ticket.ready().await;
                d.dispatch(request).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(download(&d, &x).await, ArrayData::Float32(vec![20.0]));
        assert_eq!(d.backend().released(), 20);
        assert!(matches!(
            d.table().get(&x).unwrap().as_ref(),
            CpuValue::Tensor(_)
        ));
    }
}
