#![warn(missing_docs)]
//! rankmap IPC Protocol
//!
//! Everything that crosses an address-space boundary:
//! - [`RankRecord`] and the reusable [`RecordBuffer`] receivers decode into
//! - rkyv link messages between the coordinator and each rank
//! - length-prefixed framing for byte-stream links

mod framing;
mod messages;
mod record;

pub use framing::{
    FrameError, FrameReader, FrameWriter, MAX_FRAME_SIZE, decode_message, encode_message,
    read_frame, write_frame,
};
pub use messages::{HubMessage, RankMessage, ReduceOp};
pub use record::{
    HEADER_SIZE, RECORD_MAGIC, RECORD_VERSION, RankRecord, RecordBuffer, RecordError, RecordView,
    SAMPLE_SIZE, encoded_len,
};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_fits_in_frame() {
        // A record for a very large team still fits in one frame
        assert!(encoded_len(1 << 20).is_some_and(|len| len < MAX_FRAME_SIZE));
    }
}
