#![warn(missing_docs)]
//! rankmap Core - Rank Runtime
//!
//! Everything a single rank needs to describe where it runs:
//! - [`CoreLocator`] and the `sched_getcpu`-backed [`SchedLocator`]
//! - [`ThreadTeam`] fork-join sections over a rayon pool
//! - CPU pinning through [`BindPolicy`]
//! - Bounded [`HostName`] values that fit in a wire record header

mod host;
mod locate;
mod team;

pub use host::{HOST_NAME_CAPACITY, HostName};
pub use locate::{CoreId, CoreLocator, SchedLocator, available_cpus, pin_to_cpu};
pub use team::{BindPolicy, TEAM_SIZE_ENV, TeamError, ThreadTeam, team_size_from_env};

/// Rank of a worker process (`0..size`).
pub type Rank = usize;

/// The rank that coordinates reductions and the gather.
pub const COORDINATOR: Rank = 0;
