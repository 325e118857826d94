//! Report Cycle
//!
//! One pass of the placement report, run identically on every rank:
//!
//! 1. size the thread team
//! 2. reduce max and sum of team sizes (coordinator learns both)
//! 3. coordinator allocates its receive buffer and emits the summary
//! 4. sample cores, encode this rank's record, send it to the coordinator
//! 5. coordinator gathers every record in rank order
//! 6. barrier
//!
//! [`run_local`] runs a whole job with ranks as threads of this process.

use crate::gather::{GatherCoordinator, GatherError, GatherStats};
use crate::reducer::{CollectiveReducer, TeamTotals};
use crate::report::{NullSink, ReportError, ReportSink};
use crate::transport::{
    HubChannel, HubTransport, SpokeChannel, SpokeTransport, Transport, TransportError,
    channel_links,
};
use rankmap_core::{
    BindPolicy, COORDINATOR, CoreId, CoreLocator, HostName, Rank, TeamError, ThreadTeam,
};
use rankmap_ipc::{RankRecord, RecordError, SAMPLE_SIZE};
use thiserror::Error;

/// Errors raised by a report cycle
#[derive(Debug, Error)]
pub enum CycleError {
    /// Sizing or sampling the thread team failed
    #[error(transparent)]
    Team(#[from] TeamError),

    /// A collective or point-to-point operation failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Building this rank's record failed
    #[error("Failed to build this rank's record")]
    Record(#[source] RecordError),

    /// The coordinator's gather failed
    #[error(transparent)]
    Gather(#[from] GatherError),

    /// Writing the report failed
    #[error(transparent)]
    Report(#[from] ReportError),

    /// A job of zero ranks was requested
    #[error("A job needs at least one rank")]
    NoRanks,

    /// A rank thread could not be started
    #[error("Failed to start rank {rank}")]
    Spawn {
        /// Rank that failed to start
        rank: Rank,
        /// Spawn error
        #[source]
        source: std::io::Error,
    },

    /// A rank thread panicked
    #[error("Rank {0} panicked")]
    Panicked(Rank),
}

impl CycleError {
    /// Process exit code for this failure.
    ///
    /// The coordinator failing to allocate its receive buffer exits 2; every
    /// other failure, including this rank's own record, exits 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            CycleError::Gather(GatherError::Allocation(_)) => 2,
            _ => 1,
        }
    }
}

/// What one rank did during a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleOutcome {
    /// This rank
    pub rank: Rank,
    /// Size of this rank's team
    pub team_size: usize,
    /// Core sampled by each team thread
    pub cores: Vec<CoreId>,
    /// Global totals (coordinator only)
    pub totals: Option<TeamTotals>,
    /// Gather counters (coordinator only)
    pub stats: Option<GatherStats>,
}

/// Run one report cycle on this rank.
///
/// Only the coordinator writes to `sink`.
pub fn run_cycle<T, L, S>(
    transport: &mut T,
    team: &ThreadTeam,
    locator: &L,
    host: HostName,
    sink: &mut S,
) -> Result<CycleOutcome, CycleError>
where
    T: Transport + ?Sized,
    L: CoreLocator + ?Sized,
    S: ReportSink + ?Sized,
{
    let rank = transport.rank();
    let span = tracing::debug_span!("cycle", rank);
    let _guard = span.enter();

    let team_size = team.determine_size()?;
    tracing::debug!(team_size, "team sized");

    let totals = CollectiveReducer::new(transport).team_sizes(team_size)?;

    let mut gather = match totals {
        Some(totals) => {
            let mut gather = GatherCoordinator::new(transport.size(), totals)?;
            gather.summarize(sink)?;
            Some(gather)
        }
        None => None,
    };

    let mut cores = Vec::new();
    cores
        .try_reserve_exact(team_size)
        .map_err(|source| {
            CycleError::Record(RecordError::Allocation {
                bytes: team_size.saturating_mul(SAMPLE_SIZE),
                source,
            })
        })?;
    cores.resize(team_size, CoreId::UNKNOWN);
    team.sample_cores(locator, &mut cores)?;

    let record = RankRecord::new(rank, host, cores);
    let bytes = record.encode().map_err(CycleError::Record)?;
    let handle = transport.send_async(COORDINATOR, bytes)?;

    let stats = match gather.as_mut() {
        Some(gather) => Some(gather.run(transport, sink)?),
        None => None,
    };

    let sent = handle.wait()?;
    tracing::debug!(bytes = sent, "record sent");

    transport.barrier()?;

    if gather.is_some() {
        sink.finish()?;
    }

    Ok(CycleOutcome {
        rank,
        team_size,
        cores: record.core_samples,
        totals,
        stats,
    })
}

/// Run a job whose ranks are threads of this process.
///
/// `team_sizes[r]` is the team size of rank `r`; rank 0 runs on the calling
/// thread and renders into `sink`. Returns every rank's outcome in rank order.
pub fn run_local<L, S>(
    team_sizes: &[usize],
    bind: BindPolicy,
    locator: &L,
    host: HostName,
    sink: &mut S,
) -> Result<Vec<CycleOutcome>, CycleError>
where
    L: CoreLocator + ?Sized,
    S: ReportSink + ?Sized,
{
    let process_count = team_sizes.len();
    if process_count == 0 {
        return Err(CycleError::NoRanks);
    }
    let (hubs, spokes) = channel_links(process_count);

    std::thread::scope(|scope| {
        let mut workers = Vec::with_capacity(spokes.len());
        for (rank, link) in spokes {
            let threads = team_sizes[rank];
            let worker = std::thread::Builder::new()
                .name(format!("rankmap-rank-{rank}"))
                .spawn_scoped(scope, move || {
                    run_spoke(rank, link, threads, bind, locator, host)
                })
                .map_err(|source| CycleError::Spawn { rank, source })?;
            workers.push((rank, worker));
        }

        let coordinator = run_hub(hubs, team_sizes[COORDINATOR], bind, locator, host, sink);

        let mut outcomes = Vec::with_capacity(process_count);
        let mut first_error = None;
        match coordinator {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => {
                tracing::error!(rank = COORDINATOR, error = %e, "rank failed");
                first_error = Some(e);
            }
        }

        for (rank, worker) in workers {
            match worker.join() {
                Ok(Ok(outcome)) => outcomes.push(outcome),
                Ok(Err(e)) => {
                    // A peer failing first shows up here as a lost link
                    tracing::debug!(rank, error = %e, "rank failed");
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    first_error.get_or_insert(CycleError::Panicked(rank));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(outcomes),
        }
    })
}

fn run_hub<L, S>(
    links: Vec<HubChannel>,
    threads: usize,
    bind: BindPolicy,
    locator: &L,
    host: HostName,
    sink: &mut S,
) -> Result<CycleOutcome, CycleError>
where
    L: CoreLocator + ?Sized,
    S: ReportSink + ?Sized,
{
    let team = ThreadTeam::new(threads, COORDINATOR, bind)?;
    let mut hub = HubTransport::connect(links)?;
    run_cycle(&mut hub, &team, locator, host, sink)
}

fn run_spoke<L>(
    rank: Rank,
    link: SpokeChannel,
    threads: usize,
    bind: BindPolicy,
    locator: &L,
    host: HostName,
) -> Result<CycleOutcome, CycleError>
where
    L: CoreLocator + ?Sized,
{
    let team = ThreadTeam::new(threads, rank, bind)?;
    let mut transport = SpokeTransport::connect(rank, link)?;
    run_cycle(&mut transport, &team, locator, host, &mut NullSink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::CollectSink;

    fn thread_index_locator() -> CoreId {
        rayon::current_thread_index()
            .map(|i| CoreId(i as i32))
            .unwrap_or(CoreId::UNKNOWN)
    }

    #[test]
    fn test_single_rank_cycle() {
        let mut hub: HubTransport<HubChannel> =
            HubTransport::connect(Vec::new()).unwrap();
        let team = ThreadTeam::new(2, 0, BindPolicy::None).unwrap();
        let mut sink = CollectSink::new();

        let outcome = run_cycle(
            &mut hub,
            &team,
            &thread_index_locator,
            HostName::new("solo"),
            &mut sink,
        )
        .unwrap();

        assert_eq!(outcome.team_size, 2);
        assert_eq!(outcome.totals, Some(TeamTotals { max: 2, sum: 2 }));
        assert_eq!(outcome.cores, vec![CoreId(0), CoreId(1)]);
        assert!(sink.finished);
        assert_eq!(sink.order(), vec![(0, 0), (0, 1)]);
        assert_eq!(sink.lines[1].host.as_str(), "solo");
    }

    #[test]
    fn test_run_local_mixed_teams() {
        let mut sink = CollectSink::new();
        let outcomes = run_local(
            &[2, 1, 3],
            BindPolicy::None,
            &thread_index_locator,
            HostName::new("node"),
            &mut sink,
        )
        .unwrap();

        let summary = sink.summary.unwrap();
        assert_eq!(summary.total_threads, 6);
        assert_eq!(summary.process_count, 3);
        assert_eq!(summary.max_threads, 3);
        assert_eq!(
            sink.order(),
            vec![(0, 0), (0, 1), (1, 0), (2, 0), (2, 1), (2, 2)]
        );

        let ranks: Vec<Rank> = outcomes.iter().map(|o| o.rank).collect();
        assert_eq!(ranks, vec![0, 1, 2]);
        assert!(outcomes[1].totals.is_none());
        assert_eq!(outcomes[0].stats.unwrap().lines, 6);
    }

    #[test]
    fn test_run_local_no_ranks() {
        let mut sink = CollectSink::new();
        assert!(matches!(
            run_local(
                &[],
                BindPolicy::None,
                &thread_index_locator,
                HostName::default(),
                &mut sink
            ),
            Err(CycleError::NoRanks)
        ));
    }

    #[test]
    fn test_empty_team_fails_job() {
        let mut sink = CollectSink::new();
        let err = run_local(
            &[1, 0],
            BindPolicy::None,
            &thread_index_locator,
            HostName::default(),
            &mut sink,
        )
        .unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_exit_codes() {
        let mut v: Vec<u8> = Vec::new();
        let source = v.try_reserve_exact(usize::MAX).unwrap_err();
        let err = CycleError::Gather(GatherError::Allocation(RecordError::Allocation {
            bytes: usize::MAX,
            source,
        }));
        assert_eq!(err.exit_code(), 2);
        assert_eq!(CycleError::NoRanks.exit_code(), 1);
    }
}
