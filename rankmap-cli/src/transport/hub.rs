//! Coordinator side of the star transport.

use super::{Link, SendHandle, Transport, TransportError, deliver};
use rankmap_core::{COORDINATOR, Rank};
use rankmap_ipc::{HubMessage, PROTOCOL_VERSION, RankMessage, ReduceOp};
use std::collections::VecDeque;

/// What to do with a message read while waiting for something else.
enum Disposition {
    Take,
    Defer,
    Reject(TransportError),
}

/// Link to one non-coordinator rank, plus messages read ahead of time.
struct Peer<L> {
    rank: Rank,
    link: L,
    pending: VecDeque<RankMessage>,
}

impl<L> Peer<L>
where
    L: Link<Out = HubMessage, In = RankMessage>,
{
    /// Next message from this rank accepted by `classify`. Deferred and
    /// rejected messages stay queued, in arrival order, for a later call.
    fn next(
        &mut self,
        classify: impl Fn(&RankMessage) -> Disposition,
    ) -> Result<RankMessage, TransportError> {
        let mut index = 0;
        while index < self.pending.len() {
            match classify(&self.pending[index]) {
                Disposition::Take => {
                    if let Some(message) = self.pending.remove(index) {
                        return Ok(message);
                    }
                }
                Disposition::Defer => index += 1,
                Disposition::Reject(e) => return Err(e),
            }
        }

        loop {
            let message = self
                .link
                .recv()
                .map_err(|e| TransportError::from_link(self.rank, e))?;
            match classify(&message) {
                Disposition::Take => return Ok(message),
                Disposition::Defer => {
                    tracing::trace!(rank = self.rank, kind = message.kind(), "deferring message");
                    self.pending.push_back(message);
                }
                Disposition::Reject(e) => {
                    self.pending.push_back(message);
                    return Err(e);
                }
            }
        }
    }

    fn send(&mut self, message: &HubMessage) -> Result<(), TransportError> {
        self.link
            .send(message)
            .map_err(|e| TransportError::from_link(self.rank, e))
    }
}

/// The coordinator's transport: one link per other rank.
pub struct HubTransport<L> {
    size: usize,
    peers: Vec<Peer<L>>,
    loopback: VecDeque<Vec<u8>>,
    sequence: u64,
}

impl<L> HubTransport<L>
where
    L: Link<Out = HubMessage, In = RankMessage>,
{
    /// Handshake with every rank. `links[i]` must lead to rank `i + 1`.
    pub fn connect(links: Vec<L>) -> Result<Self, TransportError> {
        let size = links.len() + 1;
        let mut peers: Vec<Peer<L>> = links
            .into_iter()
            .enumerate()
            .map(|(i, link)| Peer {
                rank: i + 1,
                link,
                pending: VecDeque::new(),
            })
            .collect();

        for peer in &mut peers {
            let rank = peer.rank;
            let hello = peer.next(|message| match message {
                RankMessage::Hello { .. } => Disposition::Take,
                other => Disposition::Reject(TransportError::Protocol {
                    rank,
                    expected: "Hello".to_string(),
                    got: other.kind().to_string(),
                }),
            })?;

            if let RankMessage::Hello {
                protocol_version,
                rank: announced,
            } = hello
            {
                if protocol_version != PROTOCOL_VERSION {
                    return Err(TransportError::VersionMismatch {
                        rank,
                        expected: PROTOCOL_VERSION,
                        got: protocol_version,
                    });
                }
                if announced as usize != rank {
                    return Err(TransportError::Protocol {
                        rank,
                        expected: format!("Hello from rank {rank}"),
                        got: format!("Hello from rank {announced}"),
                    });
                }
            }

            peer.send(&HubMessage::Welcome { size: size as u32 })?;
            tracing::debug!(rank, "rank connected");
        }

        Ok(Self {
            size,
            peers,
            loopback: VecDeque::new(),
            sequence: 0,
        })
    }

    fn peer_mut(&mut self, rank: Rank) -> Result<&mut Peer<L>, TransportError> {
        let size = self.size;
        rank.checked_sub(1)
            .and_then(|index| self.peers.get_mut(index))
            .ok_or(TransportError::InvalidRank { rank, size })
    }
}

impl<L> Transport for HubTransport<L>
where
    L: Link<Out = HubMessage, In = RankMessage>,
{
    fn rank(&self) -> Rank {
        COORDINATOR
    }

    fn size(&self) -> usize {
        self.size
    }

    fn reduce(&mut self, value: i64, op: ReduceOp) -> Result<Option<i64>, TransportError> {
        let sequence = self.sequence;
        self.sequence += 1;

        let mut contributions = Vec::with_capacity(self.size);
        contributions.push(value);
        for peer in &mut self.peers {
            let rank = peer.rank;
            let contribution = peer.next(|message| match message {
                RankMessage::Contribute {
                    sequence: s,
                    op: o,
                    ..
                } if *s == sequence && *o == op => Disposition::Take,
                RankMessage::Contribute {
                    sequence: s,
                    op: o,
                    ..
                } => Disposition::Reject(TransportError::CollectiveMismatch {
                    rank,
                    expected: format!("reduce #{sequence} ({op})"),
                    got: format!("reduce #{s} ({o})"),
                }),
                RankMessage::Payload { .. } => Disposition::Defer,
                other => Disposition::Reject(TransportError::CollectiveMismatch {
                    rank,
                    expected: format!("reduce #{sequence} ({op})"),
                    got: other.kind().to_string(),
                }),
            })?;

            if let RankMessage::Contribute { value, .. } = contribution {
                contributions.push(value);
            }
        }

        let result = op.fold(contributions);
        tracing::debug!(%op, sequence, ?result, "reduction complete");
        Ok(result)
    }

    fn send_async(&mut self, dest: Rank, bytes: Vec<u8>) -> Result<SendHandle, TransportError> {
        if dest != COORDINATOR {
            return Err(TransportError::Unroutable {
                from: COORDINATOR,
                to: dest,
            });
        }
        let len = bytes.len();
        self.loopback.push_back(bytes);
        Ok(SendHandle::completed(len))
    }

    fn receive(&mut self, source: Rank, buf: &mut [u8]) -> Result<usize, TransportError> {
        if source == COORDINATOR {
            return match self.loopback.front() {
                Some(payload) => {
                    let len = deliver(source, payload, buf)?;
                    self.loopback.pop_front();
                    Ok(len)
                }
                None => Err(TransportError::NothingPending { rank: source }),
            };
        }

        let peer = self.peer_mut(source)?;
        let message = peer.next(|message| match message {
            RankMessage::Payload { bytes } if bytes.len() > buf.len() => {
                Disposition::Reject(TransportError::Truncated {
                    from: source,
                    len: bytes.len(),
                    capacity: buf.len(),
                })
            }
            RankMessage::Payload { .. } => Disposition::Take,
            RankMessage::Contribute { .. } => Disposition::Defer,
            other => Disposition::Reject(TransportError::Protocol {
                rank: source,
                expected: "Payload".to_string(),
                got: other.kind().to_string(),
            }),
        })?;

        match message {
            RankMessage::Payload { bytes } => deliver(source, &bytes, buf),
            other => Err(TransportError::Protocol {
                rank: source,
                expected: "Payload".to_string(),
                got: other.kind().to_string(),
            }),
        }
    }

    fn barrier(&mut self) -> Result<(), TransportError> {
        for peer in &mut self.peers {
            let rank = peer.rank;
            peer.next(|message| match message {
                RankMessage::BarrierEnter => Disposition::Take,
                RankMessage::Payload { .. } => Disposition::Defer,
                other => Disposition::Reject(TransportError::CollectiveMismatch {
                    rank,
                    expected: "barrier".to_string(),
                    got: other.kind().to_string(),
                }),
            })?;
        }

        for peer in &mut self.peers {
            peer.send(&HubMessage::BarrierRelease)?;
        }

        if !self.loopback.is_empty() {
            tracing::warn!(
                pending = self.loopback.len(),
                "coordinator left the barrier with unreceived self-sends"
            );
        }
        tracing::debug!(ranks = self.size, "barrier released");
        Ok(())
    }
}
