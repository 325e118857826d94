//! Team-size reductions.

use crate::transport::{Transport, TransportError};
use serde::Serialize;

/// Global team sizes, known only at the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TeamTotals {
    /// Largest team on any rank
    pub max: usize,
    /// Threads over all ranks
    pub sum: usize,
}

/// Runs the two collective reductions of one report cycle.
///
/// Every rank must call [`team_sizes`](Self::team_sizes) exactly once per
/// cycle: it issues the max reduction and then the sum reduction, which keeps
/// the collective order identical on all ranks.
pub struct CollectiveReducer<'a, T: Transport + ?Sized> {
    transport: &'a mut T,
}

impl<'a, T: Transport + ?Sized> CollectiveReducer<'a, T> {
    /// Borrow `transport` for the reductions.
    pub fn new(transport: &'a mut T) -> Self {
        Self { transport }
    }

    /// Maximum team size over all ranks (coordinator only).
    pub fn reduce_max(&mut self, size: usize) -> Result<Option<usize>, TransportError> {
        Ok(self.transport.reduce_max(size as i64)?.map(to_size))
    }

    /// Total team size over all ranks (coordinator only).
    pub fn reduce_sum(&mut self, size: usize) -> Result<Option<usize>, TransportError> {
        Ok(self.transport.reduce_sum(size as i64)?.map(to_size))
    }

    /// Both reductions for this rank's team `size`.
    pub fn team_sizes(&mut self, size: usize) -> Result<Option<TeamTotals>, TransportError> {
        let max = self.reduce_max(size)?;
        let sum = self.reduce_sum(size)?;
        Ok(max.zip(sum).map(|(max, sum)| TeamTotals { max, sum }))
    }
}

fn to_size(value: i64) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}
