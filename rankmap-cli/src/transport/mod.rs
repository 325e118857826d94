//! Rank Transport
//!
//! The message channel between ranks. Every operation of the report cycle is
//! rooted at the coordinator, so the transport is a star: the coordinator's
//! [`HubTransport`] holds one [`Link`] per other rank, and every other rank
//! holds a [`SpokeTransport`] with a single link back to the hub.
//!
//! ```text
//!            ┌──────────┐
//!     ┌──────┤  rank 0  ├──────┐      reductions, payloads and barrier
//!     │      │  (hub)   │      │      entries flow towards rank 0;
//!     │      └────┬─────┘      │      barrier releases flow back out
//!     ▼           ▼            ▼
//!  rank 1      rank 2  ...  rank P-1
//! ```
//!
//! Links come in two flavours sharing the same protocol code:
//! - [`StreamLink`] - framed messages over pipes to a child process
//! - [`ChannelLink`] - archives over in-process channels (ranks as threads)

mod channel;
mod hub;
mod pipe;
mod spoke;

pub use channel::{ChannelLink, HubChannel, SpokeChannel, channel_links};
pub use hub::HubTransport;
pub use pipe::{IPC_FD_ENV, SpokeStream, StreamLink, spoke_link_from_env};
pub use spoke::SpokeTransport;

use rankmap_core::{COORDINATOR, Rank};
use rankmap_ipc::{FrameError, ReduceOp};
use thiserror::Error;

/// Errors raised by transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer closed its link
    #[error("Link to rank {rank} lost")]
    PeerLost {
        /// Peer rank
        rank: Rank,
        /// Link error
        #[source]
        source: FrameError,
    },

    /// The link failed for a reason other than closing
    #[error("Link error with rank {rank}")]
    Link {
        /// Peer rank
        rank: Rank,
        /// Link error
        #[source]
        source: FrameError,
    },

    /// A message arrived that the protocol does not allow here
    #[error("Protocol error with rank {rank}: expected {expected}, got {got}")]
    Protocol {
        /// Peer rank
        rank: Rank,
        /// Message that was expected
        expected: String,
        /// Message that arrived
        got: String,
    },

    /// The peer speaks a different protocol version
    #[error("Protocol version mismatch with rank {rank}: expected {expected}, got {got}")]
    VersionMismatch {
        /// Peer rank
        rank: Rank,
        /// Local version
        expected: u32,
        /// Peer version
        got: u32,
    },

    /// Ranks called collectives in different orders
    #[error("Collective mismatch at rank {rank}: coordinator is in {expected}, rank is in {got}")]
    CollectiveMismatch {
        /// Peer rank
        rank: Rank,
        /// Collective the coordinator is in
        expected: String,
        /// Collective the peer is in
        got: String,
    },

    /// The star topology has no link between these ranks
    #[error("No route from rank {from} to rank {to}")]
    Unroutable {
        /// Sending rank
        from: Rank,
        /// Destination rank
        to: Rank,
    },

    /// Rank outside the job
    #[error("Invalid rank {rank} (job has {size} ranks)")]
    InvalidRank {
        /// Rank given
        rank: Rank,
        /// Number of ranks in the job
        size: usize,
    },

    /// A payload longer than the receive buffer
    #[error("Message from rank {from} is {len} bytes but the receive buffer holds {capacity}")]
    Truncated {
        /// Sending rank
        from: Rank,
        /// Payload length
        len: usize,
        /// Receive buffer length
        capacity: usize,
    },

    /// Receive from self with no self-send queued
    #[error("Rank {rank} would wait on itself: nothing was sent to it")]
    NothingPending {
        /// The receiving rank
        rank: Rank,
    },
}

impl TransportError {
    /// Classify a link failure: a closed stream means the peer is gone.
    pub(crate) fn from_link(rank: Rank, source: FrameError) -> Self {
        match source {
            FrameError::EndOfStream => TransportError::PeerLost { rank, source },
            source => TransportError::Link { rank, source },
        }
    }
}

/// One direction-typed end of a connection between two ranks.
pub trait Link: Send {
    /// Messages this end sends
    type Out;
    /// Messages this end receives
    type In;

    /// Send one message; returns once the message is handed to the link.
    fn send(&mut self, message: &Self::Out) -> Result<(), FrameError>;

    /// Block until the next message arrives.
    fn recv(&mut self) -> Result<Self::In, FrameError>;
}

/// Completion handle for [`Transport::send_async`].
///
/// Links take ownership of whole messages, so a send is complete as soon as
/// it has been queued; `wait` reports the number of bytes sent.
#[derive(Debug)]
#[must_use = "a send should be waited on before the cycle ends"]
pub struct SendHandle {
    bytes: usize,
}

impl SendHandle {
    pub(crate) fn completed(bytes: usize) -> Self {
        Self { bytes }
    }

    /// Wait for completion, returning the number of payload bytes sent.
    pub fn wait(self) -> Result<usize, TransportError> {
        Ok(self.bytes)
    }
}

/// Message passing between the ranks of one job.
///
/// All collectives (`reduce`, `barrier`) must be called by every rank, in the
/// same order. There are no timeouts: a rank that never arrives blocks the
/// others until its link closes.
pub trait Transport {
    /// This rank.
    fn rank(&self) -> Rank;

    /// Number of ranks in the job.
    fn size(&self) -> usize;

    /// Reduce `value` over all ranks. Only the coordinator gets `Some`.
    fn reduce(&mut self, value: i64, op: ReduceOp) -> Result<Option<i64>, TransportError>;

    /// Send `bytes` to `dest` without waiting for it to be received.
    fn send_async(&mut self, dest: Rank, bytes: Vec<u8>) -> Result<SendHandle, TransportError>;

    /// Receive the next payload from `source` (and only from `source`) into
    /// `buf`, returning its length. A payload shorter than `buf` is fine; a
    /// longer one is rejected with [`TransportError::Truncated`] and nothing
    /// is copied.
    fn receive(&mut self, source: Rank, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Block until every rank has called `barrier`.
    fn barrier(&mut self) -> Result<(), TransportError>;

    /// Maximum of `value` over all ranks (coordinator only).
    fn reduce_max(&mut self, value: i64) -> Result<Option<i64>, TransportError> {
        self.reduce(value, ReduceOp::Max)
    }

    /// Sum of `value` over all ranks (coordinator only).
    fn reduce_sum(&mut self, value: i64) -> Result<Option<i64>, TransportError> {
        self.reduce(value, ReduceOp::Sum)
    }

    /// Whether this rank is the coordinator.
    fn is_coordinator(&self) -> bool {
        self.rank() == COORDINATOR
    }
}

/// Copy a received payload into the caller's buffer, refusing oversize ones.
pub(crate) fn deliver(from: Rank, payload: &[u8], buf: &mut [u8]) -> Result<usize, TransportError> {
    if payload.len() > buf.len() {
        return Err(TransportError::Truncated {
            from,
            len: payload.len(),
            capacity: buf.len(),
        });
    }
    buf[..payload.len()].copy_from_slice(payload);
    Ok(payload.len())
}
