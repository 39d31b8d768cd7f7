use crate::tensor::Tensor;
use crate::{Result, ServeError};

pub trait Backend: Send + Sync + 'static {
    type Tensor: Tensor;

    fn name(&self) -> &str;

    // Data transfer
    fn copy_from_host_f32(&self, data: &[f32], shape: &[usize]) -> Result<Self::Tensor>;
    fn copy_from_host_f16(&self, data: &[half::f16], shape: &[usize]) -> Result<Self::Tensor>;
    fn copy_to_host_f32(&self, tensor: &Self::Tensor) -> Result<Vec<f32>>;

    // Synchronization
    fn synchronize(&self) -> Result<()>;

    // Element-wise ops
    fn add(&self, a: &Self::Tensor, b: &Self::Tensor) -> Result<Self::Tensor>;
    fn mul_scalar(&self, a: &Self::Tensor, scalar: f32) -> Result<Self::Tensor>;

    /// Concatenate tensors along `dim`. All other dimensions must match.
    fn cat(&self, tensors: &[&Self::Tensor], dim: usize) -> Result<Self::Tensor>;

    /// Take `len` entries starting at `start` along `dim`.
    ///
    /// Default impl goes through host memory.
    fn narrow(
        &self,
        tensor: &Self::Tensor,
        dim: usize,
        start: usize,
        len: usize,
    ) -> Result<Self::Tensor> {
        let shape = tensor.shape();
        if dim >= shape.len() {
            return Err(ServeError::InvalidArgument(format!(
                "narrow dim {dim} out of range for rank {}",
                shape.len()
            )));
        }
        if start + len > shape[dim] {
            return Err(ServeError::InvalidArgument(format!(
                "narrow range {start}..{} exceeds dim size {}",
                start + len,
                shape[dim]
            )));
        }
        let outer: usize = shape[..dim].iter().product();
        let inner: usize = shape[dim + 1..].iter().product();
        let data = self.copy_to_host_f32(tensor)?;

        let mut out = Vec::with_capacity(outer * len * inner);
        for o in 0..outer {
            let base = (o * shape[dim] + start) * inner;
            out.extend_from_slice(&data[base..base + len * inner]);
        }
        let mut out_shape = shape.to_vec();
        out_shape[dim] = len;
        self.copy_from_host_f32(&out, &out_shape)
    }
}
