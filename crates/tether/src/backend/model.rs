//! Sequential dense models.
//!
//! Topology is the Keras-style JSON that model artifacts carry:
//! `{"class_name": "Sequential", "config": {"layers": [{"class_name": "Dense", "config": {...}}]}}`.
//! Weights are named `<layer>/kernel` (`[input, units]`) and `<layer>/bias` (`[units]`).

use std::collections::HashMap;

use serde_json::{Value, json};

use super::BackendError;
use crate::artifacts::{ModelArtifacts, WeightSpec};
use crate::handle::Metadata;
use crate::payload::{ArrayData, ArrayPayload, ElementType, TensorMeta, element_count};

const PREDICT: &str = "predict";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Linear,
    Relu,
    Sigmoid,
    Tanh,
    Softmax,
}

impl Activation {
    fn parse(name: Option<&str>) -> Result<Self, BackendError> {
        match name {
            None | Some("linear") => Ok(Self::Linear),
            Some("relu") => Ok(Self::Relu),
            Some("sigmoid") => Ok(Self::Sigmoid),
            Some("tanh") => Ok(Self::Tanh),
            Some("softmax") => Ok(Self::Softmax),
            Some(other) => Err(BackendError::Unsupported(format!("activation '{other}'"))),
        }
    }

    fn apply(self, row: &mut [f64]) {
        match self {
            Self::Linear => {}
            Self::Relu => row.iter_mut().for_each(|x| *x = x.max(0.0)),
            Self::Sigmoid => row.iter_mut().for_each(|x| *x = 1.0 / (1.0 + (-*x).exp())),
            Self::Tanh => row.iter_mut().for_each(|x| *x = x.tanh()),
            Self::Softmax => {
                let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let mut total = 0.0;
                for x in row.iter_mut() {
                    *x = (*x - max).exp();
                    total += *x;
                }
                if total > 0.0 {
                    row.iter_mut().for_each(|x| *x /= total);
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayerSpec {
    pub name: String,
    pub input_dim: usize,
    pub units: usize,
    pub activation: Activation,
    pub use_bias: bool,
}

/// Parsed model topology.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub topology: Value,
    pub layers: Vec<LayerSpec>,
}

impl ModelSpec {
    pub fn from_topology(topology: &Value) -> Result<Self, BackendError> {
        match topology.get("class_name").and_then(Value::as_str) {
            None | Some("Sequential") => {}
            Some(class) => {
                return Err(BackendError::Unsupported(format!("model class '{class}'")));
            }
        }
        let raw_layers = topology
            .pointer("/config/layers")
            .and_then(Value::as_array)
            .filter(|layers| !layers.is_empty())
            .ok_or_else(|| BackendError::invalid("loadModel", "topology has no layers"))?;

        let mut layers = Vec::with_capacity(raw_layers.len());
        let mut input_dim = None;
        for (i, raw) in raw_layers.iter().enumerate() {
            let class = raw.get("class_name").and_then(Value::as_str).unwrap_or("");
            if class != "Dense" {
                return Err(BackendError::Unsupported(format!("layer type '{class}'")));
            }
            let config = raw.get("config").cloned().unwrap_or(Value::Null);
            let name = config
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("dense_{}", i + 1));
            let units = usize_field(&config, "units")
                .ok_or_else(|| BackendError::invalid("loadModel", format!("layer {name} has no units")))?;

            let layer_input = match input_dim {
                Some(dim) => dim,
                None => first_input_dim(&config).ok_or_else(|| {
                    BackendError::invalid("loadModel", "first layer declares no input shape")
                })?,
            };

            layers.push(LayerSpec {
                name,
                input_dim: layer_input,
                units,
                activation: Activation::parse(config.get("activation").and_then(Value::as_str))?,
                use_bias: config.get("use_bias").and_then(Value::as_bool).unwrap_or(true),
            });
            input_dim = Some(units);
        }

        Ok(Self {
            topology: topology.clone(),
            layers,
        })
    }

    pub fn input_dim(&self) -> usize {
        self.layers.first().map(|l| l.input_dim).unwrap_or(0)
    }

    pub fn output_dim(&self) -> usize {
        self.layers.last().map(|l| l.units).unwrap_or(0)
    }

    /// Weights this topology expects, in storage order.
    pub fn weight_specs(&self) -> Vec<WeightSpec> {
        let mut specs = Vec::new();
        for layer in &self.layers {
            specs.push(WeightSpec {
                name: format!("{}/kernel", layer.name),
                shape: vec![layer.input_dim, layer.units],
                dtype: ElementType::Float32,
            });
            if layer.use_bias {
                specs.push(WeightSpec {
                    name: format!("{}/bias", layer.name),
                    shape: vec![layer.units],
                    dtype: ElementType::Float32,
                });
            }
        }
        specs
    }

    pub fn meta(&self) -> ModelMeta {
        ModelMeta {
            input_dim: self.input_dim(),
            output_dim: self.output_dim(),
            layers: self.layers.len(),
        }
    }
}

fn usize_field(config: &Value, key: &str) -> Option<usize> {
    config.get(key)?.as_u64().and_then(|v| usize::try_from(v).ok())
}

fn first_input_dim(config: &Value) -> Option<usize> {
    if let Some(dim) = usize_field(config, "input_dim") {
        return Some(dim);
    }
    let shape = config.get("batch_input_shape")?.as_array()?;
    match shape.as_slice() {
        [_, dim] => dim.as_u64().and_then(|d| usize::try_from(d).ok()),
        _ => None,
    }
}

/// Metadata of a loaded model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelMeta {
    pub input_dim: usize,
    pub output_dim: usize,
    pub layers: usize,
}

impl ModelMeta {
    pub fn to_metadata(&self) -> Metadata {
        let value = json!({
            "kind": "model",
            "inputDim": self.input_dim,
            "outputDim": self.output_dim,
            "layers": self.layers,
        });
        match value {
            Value::Object(map) => map,
            _ => Metadata::new(),
        }
    }

    pub fn from_metadata(metadata: &Metadata) -> Option<Self> {
        if metadata.get("kind")?.as_str()? != "model" {
            return None;
        }
        let field = |key: &str| {
            metadata
                .get(key)?
                .as_u64()
                .and_then(|v| usize::try_from(v).ok())
        };
        Some(Self {
            input_dim: field("inputDim")?,
            output_dim: field("outputDim")?,
            layers: field("layers")?,
        })
    }

    /// Resolve a method call on a model to its result metadata.
    pub fn infer_method(&self, name: &str, args: &[Option<&TensorMeta>]) -> Result<TensorMeta, BackendError> {
        if name != PREDICT {
            return Err(BackendError::unknown_method("model", name));
        }
        match args {
            [Some(input)] => self.infer_predict(input),
            _ => Err(BackendError::invalid(PREDICT, "expected a single tensor argument")),
        }
    }

    pub fn infer_predict(&self, input: &TensorMeta) -> Result<TensorMeta, BackendError> {
        if input.rank() != 2 || input.shape[1] != self.input_dim {
            return Err(BackendError::invalid(
                PREDICT,
                format!(
                    "input shape {:?} does not match [batch, {}]",
                    input.shape, self.input_dim
                ),
            ));
        }
        if input.dtype == ElementType::Bool {
            return Err(BackendError::invalid(PREDICT, "bool input is not supported"));
        }
        Ok(TensorMeta::new(
            ElementType::Float32,
            vec![input.shape[0], self.output_dim],
        ))
    }
}

#[derive(Debug, Clone)]
struct DenseLayer {
    kernel: Vec<f64>,
    bias: Option<Vec<f64>>,
}

/// A sequential stack of dense layers with weights loaded.
#[derive(Debug, Clone)]
pub struct DenseModel {
    spec: ModelSpec,
    layers: Vec<DenseLayer>,
}

impl DenseModel {
    pub fn from_artifacts(artifacts: &ModelArtifacts) -> Result<Self, BackendError> {
        let spec = ModelSpec::from_topology(&artifacts.topology)?;
        let data = artifacts
            .weight_data
            .as_deref()
            .ok_or_else(|| BackendError::invalid("loadModel", "artifacts carry no weight data"))?;

        let mut offset = 0;
        let mut stored: HashMap<&str, ArrayData> = HashMap::new();
        for weight in &artifacts.weight_specs {
            let len = element_count(&weight.shape)
                .and_then(|n| n.checked_mul(weight.dtype.size()))
                .ok_or_else(|| BackendError::invalid("loadModel", format!("weight {} is too large", weight.name)))?;
            let end = offset + len;
            let bytes = data.get(offset..end).ok_or_else(|| {
                BackendError::invalid("loadModel", format!("weight data ends before {}", weight.name))
            })?;
            let payload = ArrayPayload::new(weight.dtype, weight.shape.clone(), bytes.to_vec())?;
            stored.insert(weight.name.as_str(), payload.decode()?);
            offset = end;
        }

        let mut take = |expected: &WeightSpec| -> Result<Vec<f64>, BackendError> {
            let values = stored.remove(expected.name.as_str()).ok_or_else(|| {
                BackendError::invalid("loadModel", format!("missing weight {}", expected.name))
            })?;
            let count = element_count(&expected.shape).unwrap_or(0);
            if values.len() != count {
                return Err(BackendError::invalid(
                    "loadModel",
                    format!("weight {} should hold {count} values", expected.name),
                ));
            }
            Ok(values.to_f64())
        };

        let mut layers = Vec::with_capacity(spec.layers.len());
        let expected = spec.weight_specs();
        let mut expected = expected.iter();
        for layer in &spec.layers {
            let kernel = match expected.next() {
                Some(w) => take(w)?,
                None => return Err(BackendError::Execution("weight layout mismatch".into())),
            };
            let bias = if layer.use_bias {
                match expected.next() {
                    Some(w) => Some(take(w)?),
                    None => return Err(BackendError::Execution("weight layout mismatch".into())),
                }
            } else {
                None
            };
            layers.push(DenseLayer { kernel, bias });
        }

        Ok(Self { spec, layers })
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    pub fn meta(&self) -> ModelMeta {
        self.spec.meta()
    }

    /// Run `batch` rows of `input` (row-major `[batch, input_dim]`) through the stack.
    pub fn predict(&self, input: &[f64], batch: usize) -> Vec<f64> {
        let mut current = input.to_vec();
        for (spec, layer) in self.spec.layers.iter().zip(&self.layers) {
            let mut next = vec![0.0; batch * spec.units];
            for row in 0..batch {
                let x = &current[row * spec.input_dim..(row + 1) * spec.input_dim];
                let out = &mut next[row * spec.units..(row + 1) * spec.units];
                for (u, slot) in out.iter_mut().enumerate() {
                    let mut acc = layer.bias.as_ref().map(|b| b[u]).unwrap_or(0.0);
                    for (i, xi) in x.iter().enumerate() {
                        acc += xi * layer.kernel[i * spec.units + u];
                    }
                    *slot = acc;
                }
                spec.activation.apply(out);
            }
            current = next;
        }
        current
    }

    pub fn to_artifacts(&self) -> ModelArtifacts {
        let mut weight_data = Vec::new();
        for layer in &self.layers {
            for values in std::iter::once(&layer.kernel).chain(layer.bias.as_ref()) {
                weight_data.extend(values.iter().flat_map(|v| (*v as f32).to_le_bytes()));
            }
        }
        ModelArtifacts {
            topology: self.spec.topology.clone(),
            weight_specs: self.spec.weight_specs(),
            weight_data: Some(weight_data),
        }
    }
}
