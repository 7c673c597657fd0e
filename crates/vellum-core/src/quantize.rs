//! Quantization from logical `f32` embeddings to the stored element layout
//!
//! A store picks one [`Quantization`] at construction. It fixes both the
//! element width on disk and the transform applied to every appended vector
//! and every search query, so scores are always computed in stored space.
//!
//! | Quantization   | Element | Bytes/elem | Score                         |
//! |----------------|---------|------------|-------------------------------|
//! | `float32`      | f32 LE  | 4          | dot product                   |
//! | `int8`         | i8      | 1          | i64 dot product / 127²        |
//! | `custom_f32`   | f32 LE  | 4          | dot product                   |
//! | `custom_i8`    | i8      | 1          | i64 dot product × `score_scale` |

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::format::FormatError;
use crate::simd::{dot_product, dot_product_i8, l2_normalized};

const INT8_SCALE: f32 = 127.0;

/// Width and interpretation of one stored vector element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    F32,
    I8,
}

impl ElementType {
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            ElementType::F32 => 4,
            ElementType::I8 => 1,
        }
    }
}

type F32Fn = Arc<dyn Fn(&[f32]) -> Vec<f32> + Send + Sync>;
type I8Fn = Arc<dyn Fn(&[f32]) -> Vec<i8> + Send + Sync>;

#[derive(Clone)]
enum Transform {
    Identity,
    NormalizedInt8,
    CustomF32(F32Fn),
    CustomI8(I8Fn),
}

/// Deterministic transform from the caller's vectors to stored bytes
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "QuantizationName", into = "QuantizationName")]
pub struct Quantization {
    transform: Transform,
    score_scale: f32,
}

/// Configuration name of a quantization. Custom functions only exist in-process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuantizationName {
    Float32,
    Int8,
    CustomF32,
    CustomI8,
}

impl TryFrom<QuantizationName> for Quantization {
    type Error = String;

    fn try_from(name: QuantizationName) -> Result<Self, Self::Error> {
        match name {
            QuantizationName::Float32 => Ok(Quantization::float32()),
            QuantizationName::Int8 => Ok(Quantization::int8()),
            QuantizationName::CustomF32 | QuantizationName::CustomI8 => Err(
                "custom quantization functions must be supplied in code, not configuration".into(),
            ),
        }
    }
}

impl From<Quantization> for QuantizationName {
    fn from(q: Quantization) -> Self {
        q.name()
    }
}

impl Default for Quantization {
    fn default() -> Self {
        Self::float32()
    }
}

impl fmt::Debug for Quantization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Quantization")
            .field("name", &self.name())
            .field("element", &self.element())
            .field("score_scale", &self.score_scale)
            .finish()
    }
}

impl Quantization {
    /// Store vectors unchanged as little-endian f32
    pub fn float32() -> Self {
        Self {
            transform: Transform::Identity,
            score_scale: 1.0,
        }
    }

    /// L2-normalize, then scale each component to `[-127, 127]`
    pub fn int8() -> Self {
        Self {
            transform: Transform::NormalizedInt8,
            score_scale: 1.0 / (INT8_SCALE * INT8_SCALE),
        }
    }

    /// Caller-supplied f32 → f32 transform (e.g. normalization)
    pub fn custom_f32<F>(f: F) -> Self
    where
        F: Fn(&[f32]) -> Vec<f32> + Send + Sync + 'static,
    {
        Self {
            transform: Transform::CustomF32(Arc::new(f)),
            score_scale: 1.0,
        }
    }

    /// Caller-supplied f32 → i8 transform; integer dot products are multiplied
    /// by `score_scale` to produce scores
    pub fn custom_i8<F>(f: F, score_scale: f32) -> Self
    where
        F: Fn(&[f32]) -> Vec<i8> + Send + Sync + 'static,
    {
        Self {
            transform: Transform::CustomI8(Arc::new(f)),
            score_scale,
        }
    }

    pub fn name(&self) -> QuantizationName {
        match self.transform {
            Transform::Identity => QuantizationName::Float32,
            Transform::NormalizedInt8 => QuantizationName::Int8,
            Transform::CustomF32(_) => QuantizationName::CustomF32,
            Transform::CustomI8(_) => QuantizationName::CustomI8,
        }
    }

    pub fn element(&self) -> ElementType {
        match self.transform {
            Transform::Identity | Transform::CustomF32(_) => ElementType::F32,
            Transform::NormalizedInt8 | Transform::CustomI8(_) => ElementType::I8,
        }
    }

    /// Transform `vector` into its query-side representation
    pub fn query(&self, vector: &[f32]) -> Result<QueryVector, FormatError> {
        let dims = vector.len();
        let q = match &self.transform {
            Transform::Identity => QueryVector::F32(vector.to_vec()),
            Transform::NormalizedInt8 => QueryVector::I8(quantize_int8(vector)),
            Transform::CustomF32(f) => QueryVector::F32(f(vector)),
            Transform::CustomI8(f) => QueryVector::I8(f(vector)),
        };
        if q.len() != dims {
            return Err(FormatError::DimensionMismatch {
                expected: dims,
                actual: q.len(),
            });
        }
        Ok(q)
    }

    /// Append the stored bytes for `vector` to `out`
    pub fn encode_into(&self, vector: &[f32], out: &mut Vec<u8>) -> Result<(), FormatError> {
        match self.query(vector)? {
            QueryVector::F32(values) => {
                out.reserve(values.len() * 4);
                for v in values {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
            QueryVector::I8(values) => {
                out.extend_from_slice(bytemuck::cast_slice(&values));
            }
        }
        Ok(())
    }

    /// Score between a query and a stored vector of the same element type
    #[inline]
    pub fn score(&self, query: &QueryVector, stored: &StoredVector<'_>) -> f32 {
        match (query, stored) {
            (QueryVector::F32(q), StoredVector::F32(s)) => dot_product(q, s) * self.score_scale,
            (QueryVector::I8(q), StoredVector::I8(s)) => {
                dot_product_i8(q, s) as f32 * self.score_scale
            }
            // Element type is fixed per store, so a mixed pair never scores
            _ => f32::NEG_INFINITY,
        }
    }
}

fn quantize_int8(vector: &[f32]) -> Vec<i8> {
    l2_normalized(vector)
        .into_iter()
        .map(|x| (x * INT8_SCALE).round().clamp(-INT8_SCALE, INT8_SCALE) as i8)
        .collect()
}

/// A query already mapped into stored space
#[derive(Debug, Clone, PartialEq)]
pub enum QueryVector {
    F32(Vec<f32>),
    I8(Vec<i8>),
}

impl QueryVector {
    pub fn len(&self) -> usize {
        match self {
            QueryVector::F32(v) => v.len(),
            QueryVector::I8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Borrowed view of one stored vector inside a mapped log
#[derive(Debug)]
pub enum StoredVector<'a> {
    F32(std::borrow::Cow<'a, [f32]>),
    I8(&'a [i8]),
}
