//! CPU backend for the nanoserve inference layer.

mod backend;
pub mod tensor;

pub use backend::CpuBackend;
pub use tensor::CpuTensor;
