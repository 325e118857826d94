//! Link Message Types
//!
//! Messages exchanged between the coordinator (hub) and each rank (spoke).
//! All messages are serialized with rkyv and validated on receipt.

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

/// Reduction applied by a collective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum ReduceOp {
    /// Maximum value
    Max,
    /// Sum of values
    Sum,
}

impl ReduceOp {
    /// Combine two contributions.
    #[inline]
    pub fn apply(self, a: i64, b: i64) -> i64 {
        match self {
            ReduceOp::Max => a.max(b),
            ReduceOp::Sum => a.saturating_add(b),
        }
    }

    /// Reduce every contribution; `None` when there are none.
    pub fn fold<I>(self, values: I) -> Option<i64>
    where
        I: IntoIterator<Item = i64>,
    {
        values.into_iter().reduce(|acc, v| self.apply(acc, v))
    }
}

impl std::fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReduceOp::Max => f.write_str("max"),
            ReduceOp::Sum => f.write_str("sum"),
        }
    }
}

/// Messages sent from a rank to the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum RankMessage {
    /// Initial handshake
    Hello {
        /// Protocol version for compatibility
        protocol_version: u32,
        /// Rank the sender believes it has
        rank: u32,
    },

    /// Contribution to a reduction rooted at the coordinator
    Contribute {
        /// Position of this collective in the sender's call order
        sequence: u64,
        /// Reduction the sender is taking part in
        op: ReduceOp,
        /// Local value
        value: i64,
    },

    /// Point-to-point payload addressed to the coordinator
    Payload {
        /// Opaque bytes (an encoded rank record in the report cycle)
        bytes: Vec<u8>,
    },

    /// Sender reached the barrier
    BarrierEnter,
}

impl RankMessage {
    /// Short name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            RankMessage::Hello { .. } => "Hello",
            RankMessage::Contribute { .. } => "Contribute",
            RankMessage::Payload { .. } => "Payload",
            RankMessage::BarrierEnter => "BarrierEnter",
        }
    }
}

/// Messages sent from the coordinator to a rank
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum HubMessage {
    /// Handshake accepted
    Welcome {
        /// Number of ranks in the job
        size: u32,
    },

    /// Every rank reached the barrier
    BarrierRelease,
}

impl HubMessage {
    /// Short name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            HubMessage::Welcome { .. } => "Welcome",
            HubMessage::BarrierRelease => "BarrierRelease",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduce_apply() {
        assert_eq!(ReduceOp::Max.apply(3, 7), 7);
        assert_eq!(ReduceOp::Sum.apply(3, 7), 10);
        assert_eq!(ReduceOp::Sum.apply(i64::MAX, 1), i64::MAX);
    }

    #[test]
    fn test_reduce_fold() {
        assert_eq!(ReduceOp::Max.fold([2, 1, 3]), Some(3));
        assert_eq!(ReduceOp::Sum.fold([2, 1, 3]), Some(6));
        assert_eq!(ReduceOp::Sum.fold([5]), Some(5));
        assert_eq!(ReduceOp::Max.fold(std::iter::empty()), None);
    }

    #[test]
    fn test_message_kinds() {
        assert_eq!(RankMessage::BarrierEnter.kind(), "BarrierEnter");
        assert_eq!(
            RankMessage::Payload { bytes: vec![] }.kind(),
            "Payload"
        );
        assert_eq!(HubMessage::Welcome { size: 1 }.kind(), "Welcome");
    }
}
