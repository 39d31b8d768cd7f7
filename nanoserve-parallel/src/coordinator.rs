//! Rank-aware split / gather / reduce over backend tensors.
//!
//! A coordinator starts uninitialized. [`ShardCoordinator::initialize`] picks
//! one of two modes for the lifetime of the worker: single-worker, where
//! every operation is the identity, or distributed, where gather and reduce
//! go through a [`Collective`]. Calling it again is a no-op.

use std::sync::Arc;

use nanoserve_core::{Backend, Result, ServeError, ShardDescriptor, Tensor};
use tracing::{debug, info};

use crate::collective::Collective;

#[derive(Clone)]
pub enum ParallelMode {
    SingleWorker,
    Distributed(Arc<dyn Collective>),
}

impl std::fmt::Debug for ParallelMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParallelMode::SingleWorker => f.write_str("SingleWorker"),
            ParallelMode::Distributed(group) => f
                .debug_struct("Distributed")
                .field("world_size", &group.world_size())
                .field("rank", &group.rank())
                .finish(),
        }
    }
}

pub struct ShardCoordinator<B: Backend> {
    backend: Arc<B>,
    shard: ShardDescriptor,
    mode: Option<ParallelMode>,
}

impl<B: Backend> ShardCoordinator<B> {
    pub fn new(backend: Arc<B>, shard: ShardDescriptor) -> Self {
        Self {
            backend,
            shard,
            mode: None,
        }
    }

    /// An already initialized single-worker coordinator.
    pub fn single(backend: Arc<B>) -> Self {
        Self {
            backend,
            shard: ShardDescriptor::single(),
            mode: Some(ParallelMode::SingleWorker),
        }
    }

    /// Choose the parallel mode. With `world_size > 1` a `group` whose size
    /// and rank match this worker's descriptor is required.
    pub fn initialize(&mut self, group: Option<Arc<dyn Collective>>) -> Result<()> {
        if self.mode.is_some() {
            debug!(rank = self.shard.rank(), "shard coordinator already initialized");
            return Ok(());
        }
        if self.shard.world_size() <= 1 {
            info!("tensor parallelism disabled (single worker)");
            self.mode = Some(ParallelMode::SingleWorker);
            return Ok(());
        }

        let group = group.ok_or_else(|| {
            ServeError::Collective(format!(
                "world_size {} requires a process group",
                self.shard.world_size()
            ))
        })?;
        if group.world_size() != self.shard.world_size() || group.rank() != self.shard.rank() {
            return Err(ServeError::Collective(format!(
                "process group is rank {}/{}, worker expects rank {}/{}",
                group.rank(),
                group.world_size(),
                self.shard.rank(),
                self.shard.world_size()
            )));
        }
        info!(
            rank = self.shard.rank(),
            world_size = self.shard.world_size(),
            "tensor parallelism initialized"
        );
        self.mode = Some(ParallelMode::Distributed(group));
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.mode.is_some()
    }

    pub fn is_distributed(&self) -> bool {
        matches!(self.mode, Some(ParallelMode::Distributed(_)))
    }

    pub fn mode(&self) -> Option<&ParallelMode> {
        self.mode.as_ref()
    }

    pub fn rank(&self) -> usize {
        self.shard.rank()
    }

    pub fn world_size(&self) -> usize {
        self.shard.world_size()
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    fn group(&self) -> Result<Option<&Arc<dyn Collective>>> {
        match &self.mode {
            None => Err(ServeError::Collective(
                "shard coordinator used before initialize".into(),
            )),
            Some(ParallelMode::SingleWorker) => Ok(None),
            Some(ParallelMode::Distributed(group)) => Ok(Some(group)),
        }
    }

    /// This rank's contiguous slice of `tensor` along `axis`. Negative axes
    /// count from the end. Needs no communication.
    pub fn split(&self, tensor: &B::Tensor, axis: isize) -> Result<B::Tensor> {
        let shape = tensor.shape();
        let axis = normalize_axis(axis, shape.len())?;
        let world_size = self.shard.world_size();
        if world_size == 1 {
            return Ok(tensor.clone());
        }
        let size = shape[axis];
        if size % world_size != 0 {
            return Err(ServeError::UnevenShard {
                axis,
                size,
                world_size,
            });
        }
        let per_rank = size / world_size;
        self.backend
            .narrow(tensor, axis, self.shard.rank() * per_rank, per_rank)
    }

    /// Concatenate every rank's tensor along the last axis, in rank order.
    /// All ranks must pass tensors of the same shape.
    pub fn all_gather(&self, tensor: &B::Tensor) -> Result<B::Tensor> {
        let Some(group) = self.group()? else {
            return Ok(tensor.clone());
        };
        let shape = tensor.shape();
        if shape.is_empty() {
            return Err(ServeError::InvalidArgument(
                "all_gather needs at least one axis".into(),
            ));
        }
        let host = self.backend.copy_to_host_f32(tensor)?;
        let parts = group.all_gather_host(&host)?;

        let mut shards = Vec::with_capacity(parts.len());
        for part in &parts {
            if part.len() != host.len() {
                return Err(ServeError::ShapeMismatch {
                    expected: vec![host.len()],
                    got: vec![part.len()],
                });
            }
            shards.push(self.backend.copy_from_host_f32(part, shape)?);
        }
        let refs: Vec<&B::Tensor> = shards.iter().collect();
        self.backend.cat(&refs, shape.len() - 1)
    }

    /// Element-wise mean across ranks. Shards are summed on the backend in
    /// rank order, so every rank computes the same result.
    pub fn all_reduce_mean(&self, tensor: &B::Tensor) -> Result<B::Tensor> {
        let Some(group) = self.group()? else {
            return Ok(tensor.clone());
        };
        let shape = tensor.shape();
        let host = self.backend.copy_to_host_f32(tensor)?;
        let parts = group.all_gather_host(&host)?;

        let mut sum: Option<B::Tensor> = None;
        for part in &parts {
            if part.len() != host.len() {
                return Err(ServeError::ShapeMismatch {
                    expected: vec![host.len()],
                    got: vec![part.len()],
                });
            }
            let shard = self.backend.copy_from_host_f32(part, shape)?;
            sum = Some(match sum {
                Some(acc) => self.backend.add(&acc, &shard)?,
                None => shard,
            });
        }
        let sum = sum.ok_or_else(|| ServeError::Collective("no ranks contributed".into()))?;
        self.backend.mul_scalar(&sum, 1.0 / parts.len() as f32)
    }

    /// Rank 0's `value`, returned on every rank.
    pub fn broadcast_u32(&self, value: u32) -> Result<u32> {
        let Some(group) = self.group()? else {
            return Ok(value);
        };
        // Halves stay exact in f32.
        let parts = group.all_gather_host(&[(value >> 16) as f32, (value & 0xffff) as f32])?;
        match parts.first().map(Vec::as_slice) {
            Some(&[hi, lo]) => Ok(((hi as u32) << 16) | lo as u32),
            _ => Err(ServeError::Collective("malformed broadcast from rank 0".into())),
        }
    }
}

fn normalize_axis(axis: isize, ndim: usize) -> Result<usize> {
    let resolved = if axis < 0 {
        ndim as isize + axis
    } else {
        axis
    };
    if resolved < 0 || resolved as usize >= ndim {
        return Err(ServeError::InvalidArgument(format!(
            "axis {axis} out of range for rank {ndim}"
        )));
    }
    Ok(resolved as usize)
}
