//! Ordered Gather
//!
//! The coordinator collects one record per rank and renders the report.
//!
//! ```text
//! Summarizing ──summary line──▶ Gathering{0} ──rank 0──▶ Gathering{1} ─ … ─▶ Done
//! ```
//!
//! Each gathering step receives from exactly the rank it expects next, so the
//! report order is rank order no matter which rank finished first. All records
//! pass through a single [`RecordBuffer`] sized for the largest team.

use crate::reducer::TeamTotals;
use crate::report::{ReportError, ReportLine, ReportSink, Summary};
use crate::transport::{Transport, TransportError};
use rankmap_core::Rank;
use rankmap_ipc::{RecordBuffer, RecordError};
use thiserror::Error;

/// Errors raised by the gather
#[derive(Debug, Error)]
pub enum GatherError {
    /// The receive buffer for the largest team could not be allocated
    #[error("Failed to allocate the receive buffer")]
    Allocation(#[source] RecordError),

    /// Receiving a record failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A received record failed validation
    #[error("Invalid record from rank {rank}")]
    Record {
        /// Sender
        rank: Rank,
        /// Validation failure
        #[source]
        source: RecordError,
    },

    /// A record's rank field differs from the rank it was received from
    #[error("Expected the record of rank {expected}, received one claiming rank {got}")]
    RankMismatch {
        /// Rank the receive was addressed to
        expected: Rank,
        /// Rank written in the record
        got: Rank,
    },

    /// Writing the report failed
    #[error(transparent)]
    Report(#[from] ReportError),

    /// An operation was called out of order
    #[error("Cannot {operation} while {state:?}")]
    InvalidState {
        /// Operation attempted
        operation: &'static str,
        /// State at the time
        state: GatherState,
    },
}

/// Progress of one gather.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatherState {
    /// Summary not yet emitted
    Summarizing,
    /// Waiting for the record of `next_rank`
    Gathering { next_rank: Rank },
    /// All records received
    Done,
}

/// Counters from a finished gather.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GatherStats {
    /// Records received
    pub records: usize,
    /// Report lines emitted
    pub lines: usize,
    /// Record bytes received
    pub bytes: usize,
}

/// Drives the ordered gather on the coordinator.
#[derive(Debug)]
pub struct GatherCoordinator {
    state: GatherState,
    process_count: usize,
    totals: TeamTotals,
    buffer: RecordBuffer,
    stats: GatherStats,
}

impl GatherCoordinator {
    /// Prepare a gather over `process_count` ranks, allocating the receive
    /// buffer for `totals.max` threads.
    pub fn new(process_count: usize, totals: TeamTotals) -> Result<Self, GatherError> {
        let buffer = RecordBuffer::with_capacity(totals.max).map_err(GatherError::Allocation)?;
        tracing::debug!(
            capacity = totals.max,
            bytes = buffer.max_bytes(),
            "receive buffer allocated"
        );
        Ok(Self {
            state: GatherState::Summarizing,
            process_count,
            totals,
            buffer,
            stats: GatherStats::default(),
        })
    }

    /// Current state.
    pub fn state(&self) -> GatherState {
        self.state
    }

    /// Counters so far.
    pub fn stats(&self) -> GatherStats {
        self.stats
    }

    /// The summary this gather reports.
    pub fn summary(&self) -> Summary {
        Summary {
            total_threads: self.totals.sum,
            process_count: self.process_count,
            max_threads: self.totals.max,
        }
    }

    /// Emit the summary and start gathering.
    pub fn summarize<S: ReportSink + ?Sized>(&mut self, sink: &mut S) -> Result<(), GatherError> {
        if self.state != GatherState::Summarizing {
            return Err(GatherError::InvalidState {
                operation: "summarize",
                state: self.state,
            });
        }
        sink.summary(&self.summary())?;
        self.state = if self.process_count == 0 {
            GatherState::Done
        } else {
            GatherState::Gathering { next_rank: 0 }
        };
        Ok(())
    }

    /// Receive the next rank's record and emit its lines.
    pub fn gather_next<T, S>(
        &mut self,
        transport: &mut T,
        sink: &mut S,
    ) -> Result<GatherState, GatherError>
    where
        T: Transport + ?Sized,
        S: ReportSink + ?Sized,
    {
        let rank = match self.state {
            GatherState::Gathering { next_rank } => next_rank,
            state => {
                return Err(GatherError::InvalidState {
                    operation: "gather",
                    state,
                });
            }
        };

        let received = transport.receive(rank, self.buffer.as_mut_bytes())?;
        let view = self
            .buffer
            .accept(received)
            .map_err(|source| GatherError::Record { rank, source })?;
        if view.rank() != rank {
            return Err(GatherError::RankMismatch {
                expected: rank,
                got: view.rank(),
            });
        }

        let host = view.host();
        let thread_count = view.thread_count();
        for (thread, core) in view.cores().enumerate() {
            sink.line(&ReportLine {
                rank,
                thread,
                process_count: self.process_count,
                thread_count,
                core,
                host,
            })?;
        }
        tracing::debug!(rank, threads = thread_count, bytes = received, "record gathered");

        self.stats.records += 1;
        self.stats.lines += thread_count;
        self.stats.bytes += received;
        self.state = if rank + 1 == self.process_count {
            GatherState::Done
        } else {
            GatherState::Gathering {
                next_rank: rank + 1,
            }
        };
        Ok(self.state)
    }

    /// Run the gather to completion.
    pub fn run<T, S>(&mut self, transport: &mut T, sink: &mut S) -> Result<GatherStats, GatherError>
    where
        T: Transport + ?Sized,
        S: ReportSink + ?Sized,
    {
        if self.state == GatherState::Summarizing {
            self.summarize(sink)?;
        }
        while self.state != GatherState::Done {
            self.gather_next(transport, sink)?;
        }

        if self.stats.lines != self.totals.sum {
            tracing::warn!(
                expected = self.totals.sum,
                emitted = self.stats.lines,
                "report line count differs from the reduced thread total"
            );
        }
        Ok(self.stats)
    }
}
