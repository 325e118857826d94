#![warn(missing_docs)]
//! # rankmap
//!
//! Reports where every thread of every rank of a hybrid job actually ran, in
//! one deterministic order: by rank, then by thread.
//!
//! - **Thread teams**: each rank sizes and samples a rayon team in two fork-join sections
//! - **Collectives**: max and sum of team sizes, known only to the coordinator
//! - **Self-describing records**: variable-length, with the payload offset fixed up on receipt
//! - **Ordered gather**: rank-addressed receives, independent of arrival order
//! - **Isolation**: ranks as child processes over pipes, or as threads over channels
//!
//! ## Quick Start
//!
//! ```ignore
//! use rankmap::prelude::*;
//!
//! let mut sink = CollectSink::new();
//! run_local(&[2, 1, 3], BindPolicy::None, &SchedLocator, HostName::local(), &mut sink)?;
//! assert_eq!(sink.lines.len(), 6);
//! ```

// Re-export core types
pub use rankmap_core::{
    BindPolicy, COORDINATOR, CoreId, CoreLocator, HOST_NAME_CAPACITY, HostName, Rank,
    SchedLocator, TeamError, ThreadTeam, available_cpus, pin_to_cpu, team_size_from_env,
};

// Re-export wire types
pub use rankmap_ipc::{
    HEADER_SIZE, PROTOCOL_VERSION, RankRecord, RecordBuffer, RecordError, RecordView, ReduceOp,
    encoded_len,
};

// Re-export the cycle and its collaborators
pub use rankmap_cli::transport;
pub use rankmap_cli::{
    CollectSink, CollectiveReducer, CycleError, CycleOutcome, GatherCoordinator, GatherError,
    GatherState, GatherStats, HumanSink, IsolationMode, JsonSink, NullSink, OutputFormat,
    RankmapConfig, ReportLine, ReportMeta, ReportSink, Summary, TeamSizes, TeamTotals, run_cycle,
    run_local,
};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::transport::{HubTransport, SpokeTransport, Transport, channel_links};
    pub use crate::{
        BindPolicy, CollectSink, CoreId, CoreLocator, HostName, ReportSink, SchedLocator,
        ThreadTeam, run_cycle, run_local,
    };
}

/// Run the rankmap CLI.
///
/// ```ignore
/// fn main() {
///     rankmap::run().unwrap();
/// }
/// ```
pub use rankmap_cli::{exit_code, run};
