//! In-process worker group: ranks are threads sharing one exchange buffer.

use std::sync::{Arc, Barrier, Mutex};

use nanoserve_core::{Result, ServeError};

use crate::collective::Collective;

struct Shared {
    world_size: usize,
    barrier: Barrier,
    slots: Mutex<Vec<Option<Vec<f32>>>>,
}

/// Factory for the per-rank handles of a thread-based worker group.
pub struct LocalProcessGroup;

impl LocalProcessGroup {
    /// Create `world_size` connected handles, one per rank, in rank order.
    pub fn new(world_size: usize) -> Result<Vec<LocalRank>> {
        if world_size == 0 {
            return Err(ServeError::InvalidConfig(
                "world_size must be at least 1".into(),
            ));
        }
        let shared = Arc::new(Shared {
            world_size,
            barrier: Barrier::new(world_size),
            slots: Mutex::new(vec![None; world_size]),
        });
        Ok((0..world_size)
            .map(|rank| LocalRank {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect())
    }
}

/// One rank's handle into a [`LocalProcessGroup`].
pub struct LocalRank {
    rank: usize,
    shared: Arc<Shared>,
}

impl LocalRank {
    fn slots(&self) -> Result<std::sync::MutexGuard<'_, Vec<Option<Vec<f32>>>>> {
        self.shared
            .slots
            .lock()
            .map_err(|_| ServeError::Collective("peer rank panicked during exchange".into()))
    }
}

impl Collective for LocalRank {
    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn all_gather_host(&self, data: &[f32]) -> Result<Vec<Vec<f32>>> {
        // Errors are held until after the barriers so peers never block.
        let contributed = self
            .slots()
            .map(|mut slots| slots[self.rank] = Some(data.to_vec()));
        self.shared.barrier.wait();

        let gathered = contributed.and_then(|()| self.slots()).and_then(|slots| {
            slots
                .iter()
                .enumerate()
                .map(|(rank, slot)| {
                    slot.clone().ok_or_else(|| {
                        ServeError::Collective(format!("rank {rank} did not contribute"))
                    })
                })
                .collect::<Result<Vec<_>>>()
        });

        // Nobody may overwrite a slot until every rank has read all of them.
        self.shared.barrier.wait();
        gathered
    }
}
