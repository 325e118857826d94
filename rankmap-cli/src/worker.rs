//! Rank Worker Entry Point
//!
//! What a process started with `--rank-worker` runs: read its identity from
//! the environment the launcher set up, connect back to the coordinator over
//! the inherited pipes, take part in one report cycle, exit.

use crate::cycle::{CycleError, CycleOutcome, run_cycle};
use crate::launcher::{BIND_ENV, RANK_ENV, SIZE_ENV, THREADS_ENV};
use crate::report::NullSink;
use crate::transport::{SpokeTransport, Transport, spoke_link_from_env};
use rankmap_core::{BindPolicy, COORDINATOR, HostName, Rank, SchedLocator, ThreadTeam};
use thiserror::Error;

/// Errors in a worker's environment
#[derive(Debug, Error)]
pub enum WorkerEnvError {
    /// A required variable is absent
    #[error("{0} is not set; rank workers are started by the rankmap launcher")]
    Missing(&'static str),

    /// A variable is present but unusable
    #[error("Invalid {name}={value:?}: {reason}")]
    Invalid {
        /// Variable name
        name: &'static str,
        /// Its value
        value: String,
        /// Why it was rejected
        reason: String,
    },
}

/// Identity and team shape of a rank worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerEnv {
    /// This rank
    pub rank: Rank,
    /// Number of ranks in the job
    pub size: usize,
    /// Team size
    pub threads: usize,
    /// Thread binding
    pub bind: BindPolicy,
}

impl WorkerEnv {
    /// Read from the process environment.
    pub fn from_env() -> Result<Self, WorkerEnvError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, WorkerEnvError> {
        let get = |name: &'static str| lookup(name).ok_or(WorkerEnvError::Missing(name));
        let parse_count = |name: &'static str| -> Result<usize, WorkerEnvError> {
            let value = get(name)?;
            value.trim().parse().map_err(|e: std::num::ParseIntError| {
                WorkerEnvError::Invalid {
                    name,
                    value: value.clone(),
                    reason: e.to_string(),
                }
            })
        };

        let rank = parse_count(RANK_ENV)?;
        let size = parse_count(SIZE_ENV)?;
        let threads = parse_count(THREADS_ENV)?;
        let bind = match lookup(BIND_ENV) {
            Some(value) => value
                .parse()
                .map_err(|reason| WorkerEnvError::Invalid {
                    name: BIND_ENV,
                    value,
                    reason,
                })?,
            None => BindPolicy::default(),
        };

        if rank == COORDINATOR || rank >= size {
            return Err(WorkerEnvError::Invalid {
                name: RANK_ENV,
                value: rank.to_string(),
                reason: format!("rank workers are ranks 1..{size}"),
            });
        }

        Ok(Self {
            rank,
            size,
            threads,
            bind,
        })
    }
}

/// Run one report cycle as rank worker `env.rank`.
pub fn run_rank_worker(env: WorkerEnv) -> Result<CycleOutcome, CycleError> {
    let _span = tracing::info_span!("rank", rank = env.rank).entered();
    let team = ThreadTeam::new(env.threads, env.rank, env.bind)?;
    let mut transport = SpokeTransport::connect(env.rank, spoke_link_from_env())?;
    if transport.size() != env.size {
        tracing::warn!(
            rank = env.rank,
            announced = env.size,
            coordinator = transport.size(),
            "job size from the environment differs from the coordinator's"
        );
    }

    run_cycle(
        &mut transport,
        &team,
        &SchedLocator,
        HostName::local(),
        &mut NullSink,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&str, &str> = vars.iter().copied().collect();
        move |name: &str| map.get(name).map(|v| v.to_string())
    }

    #[test]
    fn test_from_lookup() {
        let env = WorkerEnv::from_lookup(lookup(&[
            (RANK_ENV, "2"),
            (SIZE_ENV, "3"),
            (THREADS_ENV, "4"),
            (BIND_ENV, "spread"),
        ]))
        .unwrap();
        assert_eq!(
            env,
            WorkerEnv {
                rank: 2,
                size: 3,
                threads: 4,
                bind: BindPolicy::Spread
            }
        );
    }

    #[test]
    fn test_bind_defaults_to_none() {
        let env = WorkerEnv::from_lookup(lookup(&[
            (RANK_ENV, "1"),
            (SIZE_ENV, "2"),
            (THREADS_ENV, "1"),
        ]))
        .unwrap();
        assert_eq!(env.bind, BindPolicy::None);
    }

    #[test]
    fn test_missing_variable() {
        let err = WorkerEnv::from_lookup(lookup(&[(RANK_ENV, "1")])).unwrap_err();
        assert!(matches!(err, WorkerEnvError::Missing(SIZE_ENV)));
    }

    #[test]
    fn test_invalid_values() {
        let err = WorkerEnv::from_lookup(lookup(&[
            (RANK_ENV, "one"),
            (SIZE_ENV, "2"),
            (THREADS_ENV, "1"),
        ]))
        .unwrap_err();
        assert!(matches!(err, WorkerEnvError::Invalid { name: RANK_ENV, .. }));

        // The coordinator is never a worker
        let err = WorkerEnv::from_lookup(lookup(&[
            (RANK_ENV, "0"),
            (SIZE_ENV, "2"),
            (THREADS_ENV, "1"),
        ]))
        .unwrap_err();
        assert!(matches!(err, WorkerEnvError::Invalid { name: RANK_ENV, .. }));

        let err = WorkerEnv::from_lookup(lookup(&[
            (RANK_ENV, "1"),
            (SIZE_ENV, "2"),
            (THREADS_ENV, "1"),
            (BIND_ENV, "scatter"),
        ]))
        .unwrap_err();
        assert!(matches!(err, WorkerEnvError::Invalid { name: BIND_ENV, .. }));
    }
}
