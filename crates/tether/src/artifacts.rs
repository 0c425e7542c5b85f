//! Model artifact storage.
//!
//! A model travels as a `model.json` document (topology plus weights manifest)
//! and a concatenated binary of weights. [`HttpArtifactStore`] reads them from
//! any HTTP server and saves them with a multipart POST; in weightless mode it
//! reads the topology only, which is all a client needs to predict metadata.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::TETHER_VERSION;
use crate::payload::ElementType;

/// Url scheme marking artifacts that are resolved over HTTP after stripping.
pub const REMOTE_SCHEME: &str = "remote://";

const MODEL_JSON: &str = "model.json";
const WEIGHTS_BIN: &str = "model.weights.bin";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: ElementType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightsGroup {
    pub paths: Vec<String>,
    pub weights: Vec<WeightSpec>,
}

/// Contents of `model.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelJson {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_topology: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights_manifest: Option<Vec<WeightsGroup>>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModelArtifacts {
    pub topology: serde_json::Value,
    pub weight_specs: Vec<WeightSpec>,
    /// Absent when loaded weightless.
    pub weight_data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveStatus {
    pub status: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} responded with status {status}")]
    Status { url: String, status: u16 },

    #[error("malformed model artifacts at {url}: {reason}")]
    Malformed { url: String, reason: String },

    #[error("no model artifacts stored at {0}")]
    NotFound(String),
}

impl ArtifactError {
    fn request(url: &str, source: reqwest::Error) -> Self {
        Self::Request {
            url: url.to_string(),
            source,
        }
    }

    fn malformed(url: &str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            url: url.to_string(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn load(&self, url: &str) -> Result<ModelArtifacts, ArtifactError>;

    async fn save(&self, url: &str, artifacts: &ModelArtifacts) -> Result<SaveStatus, ArtifactError>;
}

/// Strip the `remote://` marker, leaving a plain HTTP url.
pub fn resolve_url(url: &str) -> &str {
    url.strip_prefix(REMOTE_SCHEME).unwrap_or(url)
}

pub struct HttpArtifactStore {
    client: reqwest::Client,
    fetch_weights: bool,
}

impl HttpArtifactStore {
    pub fn new() -> Self {
        Self {
            client: build_client(&format!("tether/{TETHER_VERSION}")),
            fetch_weights: true,
        }
    }

    /// Store that reads topology and manifest only.
    pub fn weightless() -> Self {
        Self {
            fetch_weights: false,
            ..Self::new()
        }
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, ArtifactError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ArtifactError::request(url, e))?;
        if !response.status().is_success() {
            return Err(ArtifactError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// A rejected setting is logged and dropped; the timeout is kept whenever
/// the platform can build a client at all.
fn build_client(user_agent: &str) -> reqwest::Client {
    let configured = reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(REQUEST_TIMEOUT)
        .build();
    match configured {
        Ok(client) => client,
        Err(e) => {
            tracing::warn!(error = %e, user_agent, "Artifact HTTP client settings rejected, retrying without user agent");
            reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "Artifact HTTP client falling back to defaults");
                    reqwest::Client::new()
                })
        }
    }
}

impl Default for HttpArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Directory part of `url`, including the trailing slash.
fn base_of(url: &str) -> &str {
    match url.rfind('/') {
        Some(i) => &url[..=i],
        None => "",
    }
}

#[async_trait]
impl ArtifactStore for HttpArtifactStore {
    async fn load(&self, url: &str) -> Result<ModelArtifacts, ArtifactError> {
        let url = resolve_url(url);
        let model: ModelJson = self
            .get(url)
            .await?
            .json()
            .await
            .map_err(|e| ArtifactError::request(url, e))?;

        if model.model_topology.is_none() && model.weights_manifest.is_none() {
            return Err(ArtifactError::malformed(
                url,
                "neither modelTopology nor weightsManifest is present",
            ));
        }

        let manifest = model.weights_manifest.unwrap_or_default();
        let weight_specs = manifest
            .iter()
            .flat_map(|group| group.weights.iter().cloned())
            .collect();

        let weight_data = if self.fetch_weights {
            let base = base_of(url);
            let mut data = Vec::new();
            for path in manifest.iter().flat_map(|group| &group.paths) {
                let path = path.trim_start_matches("./");
                let shard_url = format!("{base}{path}");
                let bytes = self
                    .get(&shard_url)
                    .await?
                    .bytes()
                    .await
                    .map_err(|e| ArtifactError::request(&shard_url, e))?;
                data.extend_from_slice(&bytes);
            }
            tracing::debug!(url, weight_bytes = data.len(), "Fetched model weights");
            Some(data)
        } else {
            None
        };

        Ok(ModelArtifacts {
            topology: model.model_topology.unwrap_or_default(),
            weight_specs,
            weight_data,
        })
    }

    async fn save(&self, url: &str, artifacts: &ModelArtifacts) -> Result<SaveStatus, ArtifactError> {
        use reqwest::multipart::{Form, Part};

        let url = resolve_url(url);
        let model = ModelJson {
            model_topology: Some(artifacts.topology.clone()),
            weights_manifest: Some(vec![WeightsGroup {
                paths: vec![format!("./{WEIGHTS_BIN}")],
                weights: artifacts.weight_specs.clone(),
            }]),
        };
        let json = serde_json::to_vec(&model)
            .map_err(|e| ArtifactError::malformed(url, e.to_string()))?;

        let mut form = Form::new().part(
            MODEL_JSON,
            Part::bytes(json)
                .file_name(MODEL_JSON)
                .mime_str("application/json")
                .map_err(|e| ArtifactError::request(url, e))?,
        );
        if let Some(data) = &artifacts.weight_data {
            form = form.part(
                WEIGHTS_BIN,
                Part::bytes(data.clone())
                    .file_name(WEIGHTS_BIN)
                    .mime_str("application/octet-stream")
                    .map_err(|e| ArtifactError::request(url, e))?,
            );
        }

        let response = self
            .client
            .post(url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ArtifactError::request(url, e))?;

        let status = response.status().as_u16();
        if status != 200 {
            return Err(ArtifactError::Status {
                url: url.to_string(),
                status,
            });
        }
        tracing::info!(url, "Saved model artifacts");
        Ok(SaveStatus { status })
    }
}

/// In-process store keyed by url.
#[derive(Default)]
pub struct MemoryArtifactStore {
    models: DashMap<String, ModelArtifacts>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: impl Into<String>, artifacts: ModelArtifacts) {
        self.models.insert(url.into(), artifacts);
    }

    pub fn get(&self, url: &str) -> Option<ModelArtifacts> {
        self.models.get(resolve_url(url)).map(|entry| entry.clone())
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn load(&self, url: &str) -> Result<ModelArtifacts, ArtifactError> {
        self.get(url)
            .ok_or_else(|| ArtifactError::NotFound(resolve_url(url).to_string()))
    }

    async fn save(&self, url: &str, artifacts: &ModelArtifacts) -> Result<SaveStatus, ArtifactError> {
        self.models
            .insert(resolve_url(url).to_string(), artifacts.clone());
        Ok(SaveStatus { status: 200 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn model_json() -> serde_json::Value {
        json!({
            "modelTopology": {"class_name": "Sequential", "config": {"layers": []}},
            "weightsManifest": [
                {"paths": ["group1-shard1of2.bin", "group1-shard2of2.bin"],
                 "weights": [{"name": "dense/kernel", "shape": [2, 1], "dtype": "float32"}]}
            ]
        })
    }

    async fn serve_model(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/models/tiny/model.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(model_json()))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/models/tiny/group1-shard1of2.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8, 2, 3, 4]))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/models/tiny/group1-shard2of2.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![5u8, 6, 7, 8]))
            .mount(server)
            .await;
    }

    #[test]
    fn remote_scheme_is_stripped() {
        assert_eq!(resolve_url("remote://http://host/m/model.json"), "http://host/m/model.json");
        assert_eq!(resolve_url("http://host/model.json"), "http://host/model.json");
        assert_eq!(base_of("http://host/m/model.json"), "http://host/m/");
    }

    #[tokio::test]
    async fn load_concatenates_weight_shards() {
        let server = MockServer::start().await;
        serve_model(&server).await;

        let store = HttpArtifactStore::new();
        let url = format!("{}/models/tiny/model.json", server.uri());
        let artifacts = store.load(&url).await.unwrap();

        assert_eq!(artifacts.weight_specs.len(), 1);
        assert_eq!(artifacts.weight_specs[0].name, "dense/kernel");
        assert_eq!(artifacts.weight_data, Some(vec![1, 2, 3, 4, 5, 6, 7, 8]));
        assert_eq!(artifacts.topology["class_name"], "Sequential");
    }

    #[tokio::test]
    async fn weightless_load_skips_shards() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models/tiny/model.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(model_json()))
            .expect(1)
            .mount(&server)
            .await;

        let store = HttpArtifactStore::weightless();
        let url = format!("{REMOTE_SCHEME}{}/models/tiny/model.json", server.uri());
        let artifacts = store.load(&url).await.unwrap();
        assert_eq!(artifacts.weight_data, None);
        assert_eq!(artifacts.weight_specs.len(), 1);
    }

    #[tokio::test]
    async fn empty_model_json_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/model.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let err = HttpArtifactStore::new()
            .load(&format!("{}/model.json", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, ArtifactError::Malformed { .. }));
    }

    #[tokio::test]
    async fn rejected_user_agent_still_yields_working_client() {
        let server = MockServer::start().await;
        serve_model(&server).await;

        let client = build_client("tether\nbroken");
        let response = client
            .get(format!("{}/models/tiny/model.json", server.uri()))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn missing_model_reports_status() {
        let server = MockServer::start().await;
        let err = HttpArtifactStore::new()
            .load(&format!("{}/nothing/model.json", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, ArtifactError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn save_posts_multipart_form() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let artifacts = ModelArtifacts {
            topology: json!({"class_name": "Sequential"}),
            weight_specs: vec![WeightSpec {
                name: "w".into(),
                shape: vec![1],
                dtype: ElementType::Float32,
            }],
            weight_data: Some(vec![0, 0, 128, 63]),
        };
        let status = HttpArtifactStore::new()
            .save(&format!("{}/upload", server.uri()), &artifacts)
            .await
            .unwrap();
        assert_eq!(status, SaveStatus { status: 200 });

        let requests = server.received_requests().await.unwrap();
        let body = String::from_utf8_lossy(&requests[0].body);
        assert!(body.contains("name=\"model.json\""));
        assert!(body.contains("name=\"model.weights.bin\""));
        assert!(body.contains("./model.weights.bin"));
    }

    #[tokio::test]
    async fn save_rejects_non_ok_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let err = HttpArtifactStore::new()
            .save(&server.uri(), &ModelArtifacts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ArtifactError::Status { status: 201, .. }));
    }

    #[tokio::test]
    async fn memory_store_round_trips() {
        let store = MemoryArtifactStore::new();
        let artifacts = ModelArtifacts {
            topology: json!({"class_name": "Sequential"}),
            ..Default::default()
        };
        store.save("remote://mem/model.json", &artifacts).await.unwrap();
        assert_eq!(store.load("mem/model.json").await.unwrap(), artifacts);
        assert!(matches!(
            store.load("mem/other.json").await,
            Err(ArtifactError::NotFound(_))
        ));
    }
}
