//! Client and server over a real localhost connection.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use tether::artifacts::WeightSpec;
use tether::bridge::ErrorKind;
use tether::{
    Arg, ArrayData, ArrayPayload, ClientConfig, ClientError, Comm, CpuBackend, Dispatcher,
    ElementType, HandleId, MemoryArtifactStore, Metadata, ModelArtifacts, Payload, RemoteHandle,
    RemoteSession, ServerConfig, ShapeBackend, TensorMeta,
};

struct TestServer {
    addr: String,
    dispatcher: Arc<Dispatcher<CpuBackend>>,
    store: Arc<MemoryArtifactStore>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<std::io::Result<()>>,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(ServerConfig::default()).await
    }

    async fn start_with(config: ServerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let store = Arc::new(MemoryArtifactStore::new());
        let dispatcher = Arc::new(Dispatcher::with_policy(
            CpuBackend::new(),
            store.clone(),
            config.eviction_policy(),
        ));
        let (tx, rx) = oneshot::channel();
        let served = Arc::clone(&dispatcher);
        let task = tokio::spawn(async move {
            tether::serve(listener, served, &config, async {
                let _ = rx.await;
            })
            .await
        });
        Self {
            addr,
            dispatcher,
            store,
            shutdown: Some(tx),
            task,
        }
    }

    async fn comm(&self) -> Comm {
        Comm::connect(&self.addr, &ClientConfig::default()).await.unwrap()
    }

    async fn session(&self) -> RemoteSession {
        RemoteSession::new(self.comm().await, Arc::new(ShapeBackend::new()), self.store.clone()).unwrap()
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.await.unwrap().unwrap();
    }
}

fn floats(shape: &[usize], values: Vec<f32>) -> ArrayPayload {
    ArrayData::Float32(values).encode(shape).unwrap()
}

fn ints(shape: &[usize], values: Vec<i32>) -> ArrayPayload {
    ArrayData::Int32(values).encode(shape).unwrap()
}

fn reference(id: &str) -> RemoteHandle {
    RemoteHandle::new(HandleId::from(id), Metadata::new())
}

/// Two dense layers, 3 -> 2 (relu) -> 1, mapping [1, 0, 3] to 8.
fn tiny_model() -> ModelArtifacts {
    let spec = |name: &str, shape: Vec<usize>| WeightSpec {
        name: name.to_string(),
        shape,
        dtype: ElementType::Float32,
    };
    let weights: Vec<f32> = vec![1.0, -1.0, 1.0, -1.0, 1.0, -1.0, 0.5, 0.0, 2.0, 3.0, -1.0];
    ModelArtifacts {
        topology: json!({
            "class_name": "Sequential",
            "config": {
                "layers": [
                    {"class_name": "Dense", "config": {"name": "hidden", "units": 2, "activation": "relu", "batch_input_shape": [null, 3]}},
                    {"class_name": "Dense", "config": {"name": "out", "units": 1, "activation": "linear"}}
                ]
            }
        }),
        weight_specs: vec![
            spec("hidden/kernel", vec![3, 2]),
            spec("hidden/bias", vec![2]),
            spec("out/kernel", vec![2, 1]),
            spec("out/bias", vec![1]),
        ],
        weight_data: Some(weights.iter().flat_map(|w| w.to_le_bytes()).collect()),
    }
}

#[tokio::test]
async fn upload_then_download_by_id() {
    let server = TestServer::start().await;
    let comm = server.comm().await;
    assert!(comm.server().starts_with("tether/"));

    let payload = floats(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]);
    let handle = RemoteHandle::new(HandleId::from("x"), payload.metadata())
        .with_payload(Payload::Array(payload.clone()));
    let reply = comm.upload(handle.clone()).await.unwrap();
    assert_eq!(reply, handle.stripped());

    let downloaded = comm.download(&reference("x")).await.unwrap();
    let Some(Payload::Array(got)) = downloaded.payload else {
        panic!("download carried no array");
    };
    assert_eq!(got.shape, vec![2, 2]);
    assert_eq!(got.decode().unwrap(), ArrayData::Float32(vec![1.0, 2.0, 3.0, 4.0]));

    server.stop().await;
}

#[tokio::test]
async fn deferred_chain_metadata_matches_remote_result() {
    let server = TestServer::start().await;
    let session = server.session().await;

    let a = session.upload(ints(&[2, 3], vec![1, 2, 3, 4, 5, 6])).unwrap();
    let b = a.call("add", vec![Arg::from(1.0)]).unwrap();
    let w = session.upload(floats(&[3, 2], vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0])).unwrap();
    let c = session.op("matMul", vec![Arg::from(&b), Arg::from(&w)]).unwrap();
    let s = c.call("sum", vec![Arg::Literal(json!(1))]).unwrap();

    // Known before any reply arrives.
    let predicted = TensorMeta::from_metadata(s.metadata().unwrap()).unwrap();
    assert_eq!(predicted, TensorMeta::new(ElementType::Float32, vec![2]));
    assert_eq!(
        TensorMeta::from_metadata(c.metadata().unwrap()).unwrap(),
        TensorMeta::new(ElementType::Float32, vec![2, 2])
    );

    for deferred in [&a, &b, &w, &c, &s] {
        let remote = deferred.resolve().await.unwrap();
        assert_eq!(Some(&remote.metadata), deferred.metadata());
    }

    let result = s.materialize().await.unwrap();
    assert_eq!(result.meta(), predicted);
    assert_eq!(result.decode().unwrap(), ArrayData::Float32(vec![13.0, 25.0]));

    server.stop().await;
}

#[tokio::test]
async fn each_deferred_call_is_sent_once() {
    let server = TestServer::start().await;
    let session = server.session().await;

    let x = session.upload(floats(&[3], vec![1.0, -2.0, 3.0])).unwrap();
    let y = x.call("relu", vec![]).unwrap();
    let z = y.call("neg", vec![]).unwrap();

    let first = z.resolve().await.unwrap();
    let second = z.clone().resolve().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(session.comm().requests_sent(), 3);
    assert_eq!(server.dispatcher.table().len(), 3);

    assert_eq!(
        z.materialize_data().await.unwrap(),
        ArrayData::Float32(vec![-1.0, 0.0, -3.0])
    );
    assert_eq!(session.comm().requests_sent(), 4);

    server.stop().await;
}

#[tokio::test]
async fn unknown_op_rejects_and_is_broadcast() {
    let server = TestServer::start().await;
    let comm = server.comm().await;
    let mut notices = comm.errors();

    let err = comm.op("nonexistentOp", vec![]).await.unwrap_err();
    assert_eq!(err.remote_kind(), Some(ErrorKind::UnknownOperation));
    let notice = notices.recv().await.unwrap();
    assert_eq!(notice.kind, ErrorKind::UnknownOperation);
    assert!(server.dispatcher.table().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn unknown_op_fails_locally_before_sending() {
    let server = TestServer::start().await;
    let session = server.session().await;

    let err = session.op("nonexistentOp", vec![]).unwrap_err();
    assert!(matches!(err, ClientError::Metadata(_)));
    assert_eq!(session.comm().requests_sent(), 0);

    server.stop().await;
}

#[tokio::test]
async fn remote_not_found_surfaces_through_the_chain() {
    let server = TestServer::start().await;
    let session = server.session().await;

    let meta = TensorMeta::new(ElementType::Float32, vec![2]).to_metadata();
    let ghost = session.attach(RemoteHandle::new(HandleId::from("ghost"), meta));
    let negated = ghost.call("neg", vec![]).unwrap();
    let doubled = negated.call("mul", vec![Arg::from(2.0)]).unwrap();

    let err = doubled.materialize().await.unwrap_err();
    assert_eq!(err.remote_kind(), Some(ErrorKind::NotFound));
    assert!(server.dispatcher.table().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn synchronous_materialization_is_unsupported() {
    let server = TestServer::start().await;
    let session = server.session().await;

    let x = session.upload(floats(&[1], vec![1.0])).unwrap();
    assert!(matches!(x.materialize_sync(), Err(ClientError::Unsupported(_))));

    server.stop().await;
}

#[tokio::test]
async fn release_removes_the_value() {
    let server = TestServer::start().await;
    let session = server.session().await;

    let x = session.upload(floats(&[2], vec![1.0, 2.0])).unwrap();
    x.resolve().await.unwrap();
    assert_eq!(server.dispatcher.table().len(), 1);

    x.release().await.unwrap();
    assert!(server.dispatcher.table().is_empty());
    assert_eq!(server.dispatcher.backend().released(), 1);

    let err = x.materialize().await.unwrap_err();
    assert_eq!(err.remote_kind(), Some(ErrorKind::NotFound));

    server.stop().await;
}

#[tokio::test]
async fn void_calls_register_nothing() {
    let server = TestServer::start().await;
    let session = server.session().await;

    let x = session.upload(floats(&[2], vec![1.0, 2.0])).unwrap();
    let disposed = session.op("dispose", vec![Arg::from(&x)]).unwrap();
    assert!(disposed.is_void());
    assert!(matches!(disposed.resolve().await, Err(ClientError::Void(_))));
    assert!(server.dispatcher.table().is_empty());

    assert!(matches!(disposed.call("neg", vec![]), Err(ClientError::Void(_))));

    server.stop().await;
}

#[tokio::test]
async fn write_replaces_the_remote_value() {
    let server = TestServer::start().await;
    let session = server.session().await;

    let x = session.upload(floats(&[2], vec![1.0, 2.0])).unwrap();
    let written = x.write(ints(&[3], vec![7, 8, 9])).unwrap();
    assert_eq!(
        TensorMeta::from_metadata(written.metadata().unwrap()).unwrap(),
        TensorMeta::new(ElementType::Int32, vec![3])
    );

    assert_eq!(written.resolve().await.unwrap().id, x.resolve().await.unwrap().id);
    assert_eq!(written.materialize_data().await.unwrap(), ArrayData::Int32(vec![7, 8, 9]));
    assert_eq!(server.dispatcher.table().len(), 1);
    assert_eq!(server.dispatcher.backend().released(), 1);

    server.stop().await;
}

/// A release made after a call on the same value must reach the server
/// after that call.
async fn release_after_chained_call(server: &TestServer) {
    let session = server.session().await;
    let x = session.upload(floats(&[2], vec![1.0, -2.0])).unwrap();
    let y = x.call("neg", vec![]).unwrap();
    x.release().await.unwrap();
    assert_eq!(y.materialize_data().await.unwrap(), ArrayData::Float32(vec![-1.0, 2.0]));
    y.release().await.unwrap();
}

#[tokio::test]
async fn release_after_chained_call_keeps_result() {
    let server = TestServer::start().await;
    release_after_chained_call(&server).await;
    assert!(server.dispatcher.table().is_empty());
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn release_after_chained_call_keeps_result_multi_thread() {
    let server = TestServer::start().await;
    for _ in 0..20 {
        release_after_chained_call(&server).await;
    }
    assert!(server.dispatcher.table().is_empty());
    assert_eq!(server.dispatcher.backend().released(), 40);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_after_chained_call_keeps_result() {
    let server = TestServer::start().await;
    let session = server.session().await;

    for _ in 0..20 {
        let x = session.upload(floats(&[2], vec![1.0, 2.0])).unwrap();
        let y = x.call("neg", vec![]).unwrap();
        let before = x.materialize();
        x.write(floats(&[2], vec![5.0, 5.0])).unwrap();
        let after = x.materialize();

        assert_eq!(y.materialize_data().await.unwrap(), ArrayData::Float32(vec![-1.0, -2.0]));
        assert_eq!(before.await.unwrap().decode().unwrap(), ArrayData::Float32(vec![1.0, 2.0]));
        assert_eq!(after.await.unwrap().decode().unwrap(), ArrayData::Float32(vec![5.0, 5.0]));
    }

    server.stop().await;
}

#[tokio::test]
async fn failed_local_model_load_sends_nothing() {
    let server = TestServer::start().await;
    server.store.insert("mem://tiny/model.json", tiny_model());
    // The server can load the model but the client cannot read its metadata.
    let session = RemoteSession::new(
        server.comm().await,
        Arc::new(ShapeBackend::new()),
        Arc::new(MemoryArtifactStore::new()),
    )
    .unwrap();

    let err = session.load_model("remote://mem://tiny/model.json").await.unwrap_err();
    assert!(matches!(err, ClientError::Artifacts(_)));
    assert_eq!(session.comm().requests_sent(), 0);
    assert!(server.dispatcher.table().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn concurrent_updates_to_one_id_never_mix() {
    let server = TestServer::start().await;
    let comm = server.comm().await;

    let x = reference("shared");
    let initial = floats(&[2], vec![0.0, 0.0]);
    comm.upload(x.clone().with_payload(Payload::Array(initial))).await.unwrap();

    let left = floats(&[2], vec![1.0, 1.0]);
    let right = floats(&[3], vec![2.0, 2.0, 2.0]);
    let (a, b) = tokio::join!(comm.update(&x, left.clone()), comm.update(&x, right.clone()));
    a.unwrap();
    b.unwrap();

    let Some(Payload::Array(now)) = comm.download(&x).await.unwrap().payload else {
        panic!("download carried no array");
    };
    assert!(now == left || now == right);
    // The initial value and the overwritten update.
    assert_eq!(server.dispatcher.backend().released(), 2);

    server.stop().await;
}

#[tokio::test]
async fn model_load_predict_and_save() {
    let server = TestServer::start().await;
    server.store.insert("mem://tiny/model.json", tiny_model());
    let session = server.session().await;

    let model = session.load_model("remote://mem://tiny/model.json").await.unwrap();
    assert_eq!(model.metadata().unwrap()["kind"], "model");

    let input = session.upload(floats(&[1, 3], vec![1.0, 0.0, 3.0])).unwrap();
    let output = model.call("predict", vec![Arg::from(&input)]).unwrap();
    assert_eq!(
        TensorMeta::from_metadata(output.metadata().unwrap()).unwrap(),
        TensorMeta::new(ElementType::Float32, vec![1, 1])
    );
    assert_eq!(output.materialize_data().await.unwrap(), ArrayData::Float32(vec![8.0]));

    session.save_model(&model, "mem://copy/model.json").await.unwrap();
    assert_eq!(server.store.get("mem://copy/model.json"), Some(tiny_model()));

    server.stop().await;
}

#[tokio::test]
async fn idle_values_are_swept() {
    let config = ServerConfig::default()
        .with_idle_ttl(Some(Duration::from_millis(50)))
        .with_sweep_interval(Duration::from_millis(20));
    let server = TestServer::start_with(config).await;
    let session = server.session().await;

    let x = session.upload(floats(&[1], vec![1.0])).unwrap();
    x.resolve().await.unwrap();
    assert_eq!(server.dispatcher.table().len(), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(server.dispatcher.table().is_empty());
    assert_eq!(server.dispatcher.backend().released(), 1);

    server.stop().await;
}

#[tokio::test]
async fn shutdown_closes_client_connections() {
    let server = TestServer::start().await;
    let comm = server.comm().await;
    comm.op("zeros", vec![RemoteHandle::literal(json!([2]))]).await.unwrap();

    server.stop().await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while !comm.is_closed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let err = comm.op("zeros", vec![RemoteHandle::literal(json!([2]))]).await.unwrap_err();
    assert_eq!(err, ClientError::ConnectionClosed);
}
