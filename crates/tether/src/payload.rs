//! Array payload codec.
//!
//! An [`ArrayPayload`] is the wire form of an array value: element type, shape
//! and the raw little-endian element bytes. The bytes travel base64-encoded
//! inside JSON frames.

use serde::{Deserialize, Serialize};

use crate::handle::Metadata;

/// Element type of an array payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Bool,
    Int32,
    Float32,
}

impl ElementType {
    /// Size in bytes of one element.
    pub fn size(&self) -> usize {
        match self {
            Self::Bool => 1,
            Self::Int32 | Self::Float32 => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int32 => "int32",
            Self::Float32 => "float32",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bool" => Some(Self::Bool),
            "int32" => Some(Self::Int32),
            "float32" => Some(Self::Float32),
            _ => None,
        }
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("payload holds {actual} bytes, {element_type} {shape:?} needs {expected}")]
    ByteLength {
        element_type: ElementType,
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    #[error("{actual} elements do not fill shape {shape:?} ({expected} needed)")]
    ElementCount {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    #[error("shape {0:?} overflows the addressable element count")]
    ShapeOverflow(Vec<usize>),
}

/// Number of elements addressed by `shape`, or `None` on overflow.
pub fn element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
}

/// Shape and element type of an array, without its data.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorMeta {
    pub dtype: ElementType,
    pub shape: Vec<usize>,
}

impl TensorMeta {
    pub fn new(dtype: ElementType, shape: Vec<usize>) -> Self {
        Self { dtype, shape }
    }

    pub fn scalar(dtype: ElementType) -> Self {
        Self::new(dtype, Vec::new())
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn num_elements(&self) -> usize {
        element_count(&self.shape).unwrap_or(usize::MAX)
    }

    pub fn to_metadata(&self) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert("dtype".to_string(), self.dtype.as_str().into());
        metadata.insert("shape".to_string(), serde_json::json!(self.shape));
        metadata
    }

    /// Reads `{"dtype", "shape"}` metadata. Returns `None` for anything else.
    pub fn from_metadata(metadata: &Metadata) -> Option<Self> {
        let dtype = ElementType::parse(metadata.get("dtype")?.as_str()?)?;
        let shape = metadata
            .get("shape")?
            .as_array()?
            .iter()
            .map(|dim| dim.as_u64().and_then(|d| usize::try_from(d).ok()))
            .collect::<Option<Vec<_>>>()?;
        Some(Self { dtype, shape })
    }
}

/// Wire form of an array value.
///
/// Invariant: `bytes.len() == element_type.size() * product(shape)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArrayPayload {
    pub element_type: ElementType,
    pub shape: Vec<usize>,
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
}

impl ArrayPayload {
    pub fn new(
        element_type: ElementType,
        shape: Vec<usize>,
        bytes: Vec<u8>,
    ) -> Result<Self, PayloadError> {
        let payload = Self {
            element_type,
            shape,
            bytes,
        };
        payload.validate()?;
        Ok(payload)
    }

    pub fn validate(&self) -> Result<(), PayloadError> {
        let expected = element_count(&self.shape)
            .and_then(|n| n.checked_mul(self.element_type.size()))
            .ok_or_else(|| PayloadError::ShapeOverflow(self.shape.clone()))?;
        if expected != self.bytes.len() {
            return Err(PayloadError::ByteLength {
                element_type: self.element_type,
                shape: self.shape.clone(),
                expected,
                actual: self.bytes.len(),
            });
        }
        Ok(())
    }

    pub fn meta(&self) -> TensorMeta {
        TensorMeta::new(self.element_type, self.shape.clone())
    }

    /// Shape/type metadata describing this payload.
    pub fn metadata(&self) -> Metadata {
        self.meta().to_metadata()
    }

    pub fn decode(&self) -> Result<ArrayData, PayloadError> {
        self.validate()?;
        let data = match self.element_type {
            ElementType::Float32 => ArrayData::Float32(
                self.bytes
                    .chunks_exact(4)
                    .map(|chunk| f32::from_le_bytes(word(chunk)))
                    .collect(),
            ),
            ElementType::Int32 => ArrayData::Int32(
                self.bytes
                    .chunks_exact(4)
                    .map(|chunk| i32::from_le_bytes(word(chunk)))
                    .collect(),
            ),
            ElementType::Bool => ArrayData::Bool(self.bytes.iter().map(|b| *b != 0).collect()),
        };
        Ok(data)
    }
}

fn word(chunk: &[u8]) -> [u8; 4] {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(chunk);
    buf
}

/// Decoded element data of an array.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    Float32(Vec<f32>),
    Int32(Vec<i32>),
    Bool(Vec<bool>),
}

impl ArrayData {
    pub fn element_type(&self) -> ElementType {
        match self {
            Self::Float32(_) => ElementType::Float32,
            Self::Int32(_) => ElementType::Int32,
            Self::Bool(_) => ElementType::Bool,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Float32(v) => v.len(),
            Self::Int32(v) => v.len(),
            Self::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encode into a payload of the given shape.
    pub fn encode(&self, shape: &[usize]) -> Result<ArrayPayload, PayloadError> {
        let expected =
            element_count(shape).ok_or_else(|| PayloadError::ShapeOverflow(shape.to_vec()))?;
        if expected != self.len() {
            return Err(PayloadError::ElementCount {
                shape: shape.to_vec(),
                expected,
                actual: self.len(),
            });
        }

        let bytes = match self {
            Self::Float32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Self::Int32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Self::Bool(v) => v.iter().map(|b| u8::from(*b)).collect(),
        };

        Ok(ArrayPayload {
            element_type: self.element_type(),
            shape: shape.to_vec(),
            bytes,
        })
    }

    pub fn to_f64(&self) -> Vec<f64> {
        match self {
            Self::Float32(v) => v.iter().map(|x| f64::from(*x)).collect(),
            Self::Int32(v) => v.iter().map(|x| f64::from(*x)).collect(),
            Self::Bool(v) => v.iter().map(|b| if *b { 1.0 } else { 0.0 }).collect(),
        }
    }

    /// Cast `values` into storage of `element_type`. Integers truncate toward zero.
    pub fn from_f64(element_type: ElementType, values: &[f64]) -> Self {
        match element_type {
            ElementType::Float32 => Self::Float32(values.iter().map(|x| *x as f32).collect()),
            ElementType::Int32 => Self::Int32(values.iter().map(|x| *x as i32).collect()),
            ElementType::Bool => Self::Bool(values.iter().map(|x| *x != 0.0).collect()),
        }
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
