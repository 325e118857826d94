//! In-process links.
//!
//! Used when ranks are threads of one process. Messages still go through the
//! rkyv archive path, so a thread-mode run exercises the same encoding as a
//! process-mode run.

use super::Link;
use rankmap_core::Rank;
use rankmap_ipc::{FrameError, HubMessage, RankMessage, decode_message, encode_message};
use rkyv::ser::serializers::AllocSerializer;
use rkyv::validation::validators::DefaultValidator;
use rkyv::{Archive, CheckBytes, Deserialize, Infallible, Serialize};
use std::marker::PhantomData;
use std::sync::mpsc::{Receiver, Sender, channel};

/// One end of an in-process connection.
pub struct ChannelLink<Out, In> {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    _marker: PhantomData<fn(Out) -> In>,
}

/// Coordinator end of a channel connection.
pub type HubChannel = ChannelLink<HubMessage, RankMessage>;

/// Rank end of a channel connection.
pub type SpokeChannel = ChannelLink<RankMessage, HubMessage>;

impl<Out, In> ChannelLink<Out, In> {
    /// Two connected ends.
    pub fn pair() -> (ChannelLink<Out, In>, ChannelLink<In, Out>) {
        let (a_tx, b_rx) = channel();
        let (b_tx, a_rx) = channel();
        (
            ChannelLink {
                tx: a_tx,
                rx: a_rx,
                _marker: PhantomData,
            },
            ChannelLink {
                tx: b_tx,
                rx: b_rx,
                _marker: PhantomData,
            },
        )
    }
}

impl<Out, In> Link for ChannelLink<Out, In>
where
    Out: Serialize<AllocSerializer<256>>,
    In: Archive,
    In::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<In, Infallible>,
{
    type Out = Out;
    type In = In;

    fn send(&mut self, message: &Out) -> Result<(), FrameError> {
        let bytes = encode_message(message)?;
        self.tx
            .send(bytes.to_vec())
            .map_err(|_| FrameError::EndOfStream)
    }

    fn recv(&mut self) -> Result<In, FrameError> {
        let bytes = self.rx.recv().map_err(|_| FrameError::EndOfStream)?;
        decode_message(&bytes)
    }
}

/// Links for a job of `size` ranks: the hub ends, in rank order starting at
/// rank 1, and each non-coordinator rank paired with its end.
pub fn channel_links(size: usize) -> (Vec<HubChannel>, Vec<(Rank, SpokeChannel)>) {
    let mut hub_ends = Vec::with_capacity(size.saturating_sub(1));
    let mut spoke_ends = Vec::with_capacity(size.saturating_sub(1));
    for rank in 1..size {
        let (hub, spoke) = HubChannel::pair();
        hub_ends.push(hub);
        spoke_ends.push((rank, spoke));
    }
    (hub_ends, spoke_ends)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_both_directions() {
        let (mut hub, mut spoke) = HubChannel::pair();

        spoke.send(&RankMessage::BarrierEnter).unwrap();
        assert_eq!(hub.recv().unwrap(), RankMessage::BarrierEnter);

        hub.send(&HubMessage::BarrierRelease).unwrap();
        assert_eq!(spoke.recv().unwrap(), HubMessage::BarrierRelease);
    }

    #[test]
    fn test_dropped_end_is_end_of_stream() {
        let (mut hub, spoke) = HubChannel::pair();
        drop(spoke);
        assert!(matches!(hub.recv(), Err(FrameError::EndOfStream)));
        assert!(matches!(
            hub.send(&HubMessage::BarrierRelease),
            Err(FrameError::EndOfStream)
        ));
    }

    #[test]
    fn test_channel_links_ranks() {
        let (hubs, spokes) = channel_links(4);
        assert_eq!(hubs.len(), 3);
        let ranks: Vec<Rank> = spokes.iter().map(|(r, _)| *r).collect();
        assert_eq!(ranks, vec![1, 2, 3]);

        let (hubs, spokes) = channel_links(1);
        assert!(hubs.is_empty() && spokes.is_empty());
    }
}
