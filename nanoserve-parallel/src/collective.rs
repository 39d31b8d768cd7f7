use nanoserve_core::Result;

/// Communication primitive shared by the ranks of one worker group.
///
/// Every rank must issue the same sequence of calls; a rank that skips a
/// collective leaves the others blocked. Reductions are built on top of the
/// gather by [`ShardCoordinator`](crate::ShardCoordinator).
pub trait Collective: Send + Sync {
    fn world_size(&self) -> usize;
    fn rank(&self) -> usize;

    /// Contribute `data` and receive every rank's contribution, in rank order.
    fn all_gather_host(&self, data: &[f32]) -> Result<Vec<Vec<f32>>>;
}
