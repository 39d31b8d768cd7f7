use nanoserve_core::{Backend, DType, Result, ServeError, Tensor};

use crate::tensor::CpuTensor;

/// CPU backend: all data lives in host memory as `Vec<f32>` wrapped in `Arc`.
#[derive(Clone, Debug)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_shape(data_len: usize, shape: &[usize]) -> Result<()> {
    let expected: usize = shape.iter().product();
    if data_len != expected {
        return Err(ServeError::ShapeMismatch {
            expected: shape.to_vec(),
            got: vec![data_len],
        });
    }
    Ok(())
}

fn validate_same_shape(a: &CpuTensor, b: &CpuTensor) -> Result<()> {
    if a.shape() != b.shape() {
        return Err(ServeError::ShapeMismatch {
            expected: a.shape().to_vec(),
            got: b.shape().to_vec(),
        });
    }
    Ok(())
}

impl Backend for CpuBackend {
    type Tensor = CpuTensor;

    fn name(&self) -> &str {
        "cpu"
    }

    // ── Data transfer ───────────────────────────────────────────

    fn copy_from_host_f32(&self, data: &[f32], shape: &[usize]) -> Result<CpuTensor> {
        validate_shape(data.len(), shape)?;
        Ok(CpuTensor::new(data.to_vec(), shape.to_vec()))
    }

    fn copy_from_host_f16(&self, data: &[half::f16], shape: &[usize]) -> Result<CpuTensor> {
        validate_shape(data.len(), shape)?;
        let f32_data: Vec<f32> = data.iter().map(|x| x.to_f32()).collect();
        Ok(CpuTensor::with_dtype(f32_data, shape.to_vec(), DType::F16))
    }

    fn copy_to_host_f32(&self, tensor: &CpuTensor) -> Result<Vec<f32>> {
        Ok(tensor.data().to_vec())
    }

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }

    // ── Compute ops ────────────────────────────────────────────

    fn add(&self, a: &CpuTensor, b: &CpuTensor) -> Result<CpuTensor> {
        validate_same_shape(a, b)?;
        let data: Vec<f32> = a
            .data()
            .iter()
            .zip(b.data().iter())
            .map(|(x, y)| x + y)
            .collect();
        Ok(CpuTensor::with_dtype(data, a.shape().to_vec(), a.dtype()))
    }

    fn mul_scalar(&self, a: &CpuTensor, scalar: f32) -> Result<CpuTensor> {
        let data: Vec<f32> = a.data().iter().map(|x| x * scalar).collect();
        Ok(CpuTensor::with_dtype(data, a.shape().to_vec(), a.dtype()))
    }

    fn cat(&self, tensors: &[&CpuTensor], dim: usize) -> Result<CpuTensor> {
        if tensors.is_empty() {
            return Err(ServeError::InvalidArgument("empty tensor list".into()));
        }
        let first = tensors[0].shape();
        let ndim = first.len();
        if dim >= ndim {
            return Err(ServeError::InvalidArgument(format!(
                "cat dim {dim} out of range for rank {ndim}"
            )));
        }
        for t in tensors.iter().skip(1) {
            let shape = t.shape();
            let compatible = shape.len() == ndim
                && (0..ndim).all(|d| d == dim || shape[d] == first[d]);
            if !compatible {
                return Err(ServeError::ShapeMismatch {
                    expected: first.to_vec(),
                    got: shape.to_vec(),
                });
            }
        }

        // Rows of the outer dims interleave the per-tensor chunks.
        let outer: usize = first[..dim].iter().product();
        let inner: usize = first[dim + 1..].iter().product();
        let total_len: usize = tensors.iter().map(|t| t.len()).sum();
        let mut all_data = Vec::with_capacity(total_len);
        for o in 0..outer {
            for t in tensors {
                let chunk = t.shape()[dim] * inner;
                all_data.extend_from_slice(&t.data()[o * chunk..(o + 1) * chunk]);
            }
        }

        let mut out_shape = first.to_vec();
        out_shape[dim] = tensors.iter().map(|t| t.shape()[dim]).sum();
        Ok(CpuTensor::with_dtype(all_data, out_shape, tensors[0].dtype()))
    }

    fn narrow(&self, tensor: &CpuTensor, dim: usize, start: usize, len: usize) -> Result<CpuTensor> {
        let shape = tensor.shape();
        if dim >= shape.len() || start + len > shape[dim] {
            return Err(ServeError::InvalidArgument(format!(
                "narrow {start}..{} on dim {dim} out of range for shape {shape:?}",
                start + len
            )));
        }
        let outer: usize = shape[..dim].iter().product();
        let inner: usize = shape[dim + 1..].iter().product();
        let src = tensor.data();
        let mut out = Vec::with_capacity(outer * len * inner);
        for o in 0..outer {
            let base = (o * shape[dim] + start) * inner;
            out.extend_from_slice(&src[base..base + len * inner]);
        }
        let mut out_shape = shape.to_vec();
        out_shape[dim] = len;
        Ok(CpuTensor::with_dtype(out, out_shape, tensor.dtype()))
    }
}
