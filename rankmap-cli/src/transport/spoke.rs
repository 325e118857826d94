//! Non-coordinator side of the star transport.

use super::{Link, SendHandle, Transport, TransportError};
use rankmap_core::{COORDINATOR, Rank};
use rankmap_ipc::{HubMessage, PROTOCOL_VERSION, RankMessage, ReduceOp};

/// A rank's transport: a single link to the coordinator.
pub struct SpokeTransport<L> {
    rank: Rank,
    size: usize,
    link: L,
    sequence: u64,
}

impl<L> SpokeTransport<L>
where
    L: Link<Out = RankMessage, In = HubMessage>,
{
    /// Announce `rank` to the coordinator and learn the job size.
    pub fn connect(rank: Rank, mut link: L) -> Result<Self, TransportError> {
        link.send(&RankMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            rank: rank as u32,
        })
        .map_err(|e| TransportError::from_link(COORDINATOR, e))?;

        let size = match link
            .recv()
            .map_err(|e| TransportError::from_link(COORDINATOR, e))?
        {
            HubMessage::Welcome { size } => size as usize,
            other => {
                return Err(TransportError::Protocol {
                    rank: COORDINATOR,
                    expected: "Welcome".to_string(),
                    got: other.kind().to_string(),
                });
            }
        };

        if rank == COORDINATOR || rank >= size {
            return Err(TransportError::InvalidRank { rank, size });
        }

        tracing::debug!(rank, size, "connected to coordinator");
        Ok(Self {
            rank,
            size,
            link,
            sequence: 0,
        })
    }

    fn send(&mut self, message: &RankMessage) -> Result<(), TransportError> {
        self.link
            .send(message)
            .map_err(|e| TransportError::from_link(COORDINATOR, e))
    }
}

impl<L> Transport for SpokeTransport<L>
where
    L: Link<Out = RankMessage, In = HubMessage>,
{
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn reduce(&mut self, value: i64, op: ReduceOp) -> Result<Option<i64>, TransportError> {
        let sequence = self.sequence;
        self.sequence += 1;
        self.send(&RankMessage::Contribute {
            sequence,
            op,
            value,
        })?;
        Ok(None)
    }

    fn send_async(&mut self, dest: Rank, bytes: Vec<u8>) -> Result<SendHandle, TransportError> {
        if dest != COORDINATOR {
            return Err(TransportError::Unroutable {
                from: self.rank,
                to: dest,
            });
        }
        let len = bytes.len();
        self.send(&RankMessage::Payload { bytes })?;
        Ok(SendHandle::completed(len))
    }

    fn receive(&mut self, source: Rank, _buf: &mut [u8]) -> Result<usize, TransportError> {
        Err(TransportError::Unroutable {
            from: source,
            to: self.rank,
        })
    }

    fn barrier(&mut self) -> Result<(), TransportError> {
        self.send(&RankMessage::BarrierEnter)?;
        match self
            .link
            .recv()
            .map_err(|e| TransportError::from_link(COORDINATOR, e))?
        {
            HubMessage::BarrierRelease => Ok(()),
            other => Err(TransportError::Protocol {
                rank: COORDINATOR,
                expected: "BarrierRelease".to_string(),
                got: other.kind().to_string(),
            }),
        }
    }
}
