use std::sync::Arc;

use nanoserve_core::{DType, Tensor};

/// Host tensor. Data is shared and never mutated in place, so clones are
/// cheap and never alias a buffer someone else can write to.
#[derive(Clone, Debug)]
pub struct CpuTensor {
    pub(crate) data: Arc<Vec<f32>>,
    pub(crate) shape: Vec<usize>,
    pub(crate) dtype: DType,
}

impl CpuTensor {
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        Self::with_dtype(data, shape, DType::F32)
    }

    /// Values are held as f32; `dtype` is the logical element type used
    /// for memory accounting.
    pub fn with_dtype(data: Vec<f32>, shape: Vec<usize>, dtype: DType) -> Self {
        Self {
            data: Arc::new(data),
            shape,
            dtype,
        }
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Tensor for CpuTensor {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn dtype(&self) -> DType {
        self.dtype
    }
}
