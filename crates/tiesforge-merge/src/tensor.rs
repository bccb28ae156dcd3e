//! Owned tensor buffers and float dtype conversion.

use half::{bf16, f16};
use safetensors::Dtype;

/// A tensor held in memory as little-endian bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorBuf {
    /// Storage dtype.
    pub dtype: Dtype,
    /// Shape.
    pub shape: Vec<usize>,
    /// Raw little-endian data.
    pub data: Vec<u8>,
}

impl TensorBuf {
    /// Wrap raw bytes.
    pub fn new(dtype: Dtype, shape: Vec<usize>, data: Vec<u8>) -> Self {
        Self { dtype, shape, data }
    }

    /// Build an `F32` tensor from values.
    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Self {
        Self::new(Dtype::F32, shape, encode(Dtype::F32, values))
    }

    /// Get number of elements.
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Size of the data in bytes.
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Decode to `f32` values. `None` for non-float dtypes.
    pub fn to_f32_vec(&self) -> Option<Vec<f32>> {
        decode(self.dtype, &self.data)
    }

    /// Convert float tensors to `target`.
    ///
    /// Only `F32`, `F16` and `BF16` take part in conversion; tensors of any
    /// other dtype (e.g. integer buffers) are returned unchanged.
    pub fn into_dtype(self, target: Dtype) -> Self {
        if self.dtype == target || !is_float(target) {
            return self;
        }
        match decode(self.dtype, &self.data) {
            Some(values) => Self::new(target, self.shape, encode(target, &values)),
            None => self,
        }
    }
}

fn is_float(dtype: Dtype) -> bool {
    matches!(dtype, Dtype::F32 | Dtype::F16 | Dtype::BF16)
}

fn decode(dtype: Dtype, data: &[u8]) -> Option<Vec<f32>> {
    let values = match dtype {
        Dtype::F32 => data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        Dtype::F16 => data
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        Dtype::BF16 => data
            .chunks_exact(2)
            .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        _ => return None,
    };
    Some(values)
}

fn encode(dtype: Dtype, values: &[f32]) -> Vec<u8> {
    match dtype {
        Dtype::F16 => values
            .iter()
            .flat_map(|v| f16::from_f32(*v).to_le_bytes())
            .collect(),
        Dtype::BF16 => values
            .iter()
            .flat_map(|v| bf16::from_f32(*v).to_le_bytes())
            .collect(),
        _ => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
    }
}
