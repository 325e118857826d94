//! Thread Teams
//!
//! A [`ThreadTeam`] is the set of worker threads of one rank. It runs two
//! fork-join sections over a dedicated rayon pool:
//!
//! 1. [`ThreadTeam::determine_size`] - thread 0 publishes the team size.
//! 2. [`ThreadTeam::sample_cores`] - every thread records the core it runs on
//!    into its own slot.
//!
//! Both sections are rayon broadcasts, so every pool thread takes part and the
//! call returns only after all of them have joined.

use crate::locate::{CoreId, CoreLocator, available_cpus, pin_to_cpu};
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use thiserror::Error;

/// Environment variables consulted for the team size, in priority order.
pub const TEAM_SIZE_ENV: [&str; 2] = ["RANKMAP_NUM_THREADS", "OMP_NUM_THREADS"];

/// Errors raised by thread team sections
#[derive(Debug, Error)]
pub enum TeamError {
    /// The rayon pool could not be built
    #[error("Failed to build thread team")]
    Build(#[from] rayon::ThreadPoolBuildError),

    /// A team of zero threads was requested
    #[error("Thread team must have at least one thread")]
    Empty,

    /// No thread wrote the size slot
    #[error("Sizing section joined without publishing a size")]
    Unsized,

    /// The sampling section ran with a different team size
    #[error("Thread team size changed between sections: sized {sized}, sampled {sampled}")]
    SizeChanged {
        /// Size reported by the sizing section
        sized: usize,
        /// Size observed while sampling
        sampled: usize,
    },
}

/// How team threads are bound to CPUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BindPolicy {
    /// Leave placement to the OS scheduler (default)
    #[default]
    None,
    /// Consecutive CPUs, ranks packed one after another
    Compact,
    /// Team threads spaced evenly over all CPUs
    Spread,
}

impl BindPolicy {
    /// CPU that thread `index` of a `team`-sized team on `rank` should be
    /// pinned to, given `cpus` logical CPUs. `None` means leave it unpinned.
    pub fn cpu_for(self, rank: usize, team: usize, index: usize, cpus: usize) -> Option<usize> {
        let cpus = cpus.max(1);
        match self {
            BindPolicy::None => None,
            BindPolicy::Compact => Some((rank * team + index) % cpus),
            BindPolicy::Spread => Some((index * cpus / team.max(1)) % cpus),
        }
    }
}

impl std::str::FromStr for BindPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "false" => Ok(BindPolicy::None),
            "compact" | "close" => Ok(BindPolicy::Compact),
            "spread" => Ok(BindPolicy::Spread),
            other => Err(format!("Unknown bind policy: {}", other)),
        }
    }
}

impl std::fmt::Display for BindPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BindPolicy::None => "none",
            BindPolicy::Compact => "compact",
            BindPolicy::Spread => "spread",
        };
        f.write_str(name)
    }
}

/// Team size requested through the environment, if any.
pub fn team_size_from_env() -> Option<usize> {
    TEAM_SIZE_ENV.iter().find_map(|key| {
        std::env::var(key)
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|&n| n > 0)
    })
}

/// The worker threads of one rank.
pub struct ThreadTeam {
    pool: ThreadPool,
    rank: usize,
}

impl ThreadTeam {
    /// Build a team of `threads` workers for `rank`, pinned per `bind`.
    pub fn new(threads: usize, rank: usize, bind: BindPolicy) -> Result<Self, TeamError> {
        if threads == 0 {
            return Err(TeamError::Empty);
        }

        let cpus = available_cpus();
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |index| format!("rankmap-r{rank}-t{index}"))
            .start_handler(move |index| {
                if let Some(cpu) = bind.cpu_for(rank, threads, index, cpus) {
                    if let Err(e) = pin_to_cpu(cpu) {
                        tracing::warn!(rank, thread = index, cpu, error = %e, "failed to pin thread");
                    }
                }
            })
            .build()?;

        Ok(Self { pool, rank })
    }

    /// Rank this team belongs to.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Run the sizing section and return the team size.
    ///
    /// Only thread 0 writes the slot; it is read after the section joins.
    pub fn determine_size(&self) -> Result<usize, TeamError> {
        let slot = OnceLock::new();
        self.pool.broadcast(|ctx| {
            if ctx.index() == 0 {
                let _ = slot.set(ctx.num_threads());
            }
        });
        slot.into_inner().ok_or(TeamError::Unsized)
    }

    /// Run the sampling section: thread `i` stores its current core in
    /// `buffer[i]`.
    ///
    /// `buffer` must be exactly as long as the size reported by
    /// [`determine_size`](Self::determine_size); a team of any other size is a
    /// consistency error and leaves `buffer` untouched.
    pub fn sample_cores<L>(&self, locator: &L, buffer: &mut [CoreId]) -> Result<(), TeamError>
    where
        L: CoreLocator + ?Sized,
    {
        let sized = buffer.len();
        let samples = self
            .pool
            .broadcast(|ctx| (ctx.num_threads(), locator.current()));

        if let Some(&(sampled, _)) = samples.iter().find(|(n, _)| *n != sized) {
            return Err(TeamError::SizeChanged { sized, sampled });
        }
        if samples.len() != sized {
            return Err(TeamError::SizeChanged {
                sized,
                sampled: samples.len(),
            });
        }

        for (slot, (_, core)) in buffer.iter_mut().zip(samples) {
            *slot = core;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ThreadTeam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadTeam")
            .field("rank", &self.rank)
            .field("threads", &self.pool.current_num_threads())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread_index_locator() -> CoreId {
        rayon::current_thread_index()
            .map(|i| CoreId(100 + i as i32))
            .unwrap_or(CoreId::UNKNOWN)
    }

    #[test]
    fn test_determine_size() {
        for threads in [1, 2, 5] {
            let team = ThreadTeam::new(threads, 0, BindPolicy::None).unwrap();
            assert_eq!(team.determine_size().unwrap(), threads);
        }
    }

    #[test]
    fn test_empty_team_rejected() {
        assert!(matches!(
            ThreadTeam::new(0, 0, BindPolicy::None),
            Err(TeamError::Empty)
        ));
    }

    #[test]
    fn test_sample_cores_slot_per_thread() {
        let team = ThreadTeam::new(4, 1, BindPolicy::None).unwrap();
        let size = team.determine_size().unwrap();
        let mut buffer = vec![CoreId::UNKNOWN; size];

        team.sample_cores(&thread_index_locator, &mut buffer).unwrap();

        assert_eq!(buffer, vec![CoreId(100), CoreId(101), CoreId(102), CoreId(103)]);
    }

    #[test]
    fn test_sample_cores_real_locator() {
        let team = ThreadTeam::new(2, 0, BindPolicy::None).unwrap();
        let mut buffer = vec![CoreId::UNKNOWN; 2];
        team.sample_cores(&crate::SchedLocator, &mut buffer).unwrap();
        if cfg!(target_os = "linux") {
            assert!(buffer.iter().all(|c| c.is_known()));
        }
    }

    #[test]
    fn test_size_change_between_sections_is_flagged() {
        let sizing = ThreadTeam::new(3, 0, BindPolicy::None).unwrap();
        let size = sizing.determine_size().unwrap();
        let mut buffer = vec![CoreId::UNKNOWN; size];

        // The team that samples is not the one that was sized
        let sampling = ThreadTeam::new(2, 0, BindPolicy::None).unwrap();
        let err = sampling
            .sample_cores(&thread_index_locator, &mut buffer)
            .unwrap_err();

        assert!(matches!(
            err,
            TeamError::SizeChanged {
                sized: 3,
                sampled: 2
            }
        ));
        assert!(buffer.iter().all(|c| *c == CoreId::UNKNOWN));
    }

    #[test]
    fn test_bind_policy_cpu_for() {
        assert_eq!(BindPolicy::None.cpu_for(0, 4, 1, 8), None);
        assert_eq!(BindPolicy::Compact.cpu_for(1, 4, 1, 8), Some(5));
        assert_eq!(BindPolicy::Compact.cpu_for(2, 4, 1, 8), Some(1));
        assert_eq!(BindPolicy::Spread.cpu_for(0, 4, 3, 8), Some(6));
        assert_eq!(BindPolicy::Spread.cpu_for(0, 2, 1, 1), Some(0));
    }

    #[test]
    fn test_bind_policy_parse() {
        assert_eq!("compact".parse::<BindPolicy>().unwrap(), BindPolicy::Compact);
        assert_eq!("SPREAD".parse::<BindPolicy>().unwrap(), BindPolicy::Spread);
        assert!("sideways".parse::<BindPolicy>().is_err());
    }

    #[test]
    fn test_pinned_team_still_samples() {
        let team = ThreadTeam::new(2, 0, BindPolicy::Compact).unwrap();
        let mut buffer = vec![CoreId::UNKNOWN; team.determine_size().unwrap()];
        team.sample_cores(&thread_index_locator, &mut buffer).unwrap();
        assert_eq!(buffer.len(), 2);
    }
}
