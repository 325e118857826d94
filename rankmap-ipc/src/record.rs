//! Rank Records
//!
//! A rank record is the self-contained description one rank sends to the
//! coordinator: who it is, where it runs, and the core every team thread was
//! sampled on.
//!
//! Record format (little-endian, 4-byte aligned):
//! ```text
//! +-------+---------+----------+---------+---------+-------------+----------+--------------+
//! | magic | version | host len | rank    | threads | payload off | host     | core samples |
//! | 4     | 2       | 2        | 4 (i32) | 4 (u32) | 4 (u32)     | 40 bytes | 4 x threads  |
//! +-------+---------+----------+---------+---------+-------------+----------+--------------+
//! ```
//!
//! The payload offset locates the sample array inside the buffer that holds
//! the record. It is only meaningful to whoever owns that buffer: a receiver
//! never reads it, and overwrites it with its own value as soon as a record has
//! been validated (see [`RecordBuffer::accept`]).

use rankmap_core::{CoreId, HOST_NAME_CAPACITY, HostName, Rank};
use std::collections::TryReserveError;
use thiserror::Error;

/// Leading bytes of every record.
pub const RECORD_MAGIC: [u8; 4] = *b"RKMP";

/// Record layout version.
pub const RECORD_VERSION: u16 = 1;

/// Size of one core sample on the wire.
pub const SAMPLE_SIZE: usize = std::mem::size_of::<i32>();

/// Size of the fixed header preceding the samples.
pub const HEADER_SIZE: usize = HOST_OFFSET + HOST_NAME_CAPACITY;

const MAGIC_OFFSET: usize = 0;
const VERSION_OFFSET: usize = 4;
const HOST_LEN_OFFSET: usize = 6;
const RANK_OFFSET: usize = 8;
const THREADS_OFFSET: usize = 12;
const PAYLOAD_OFFSET_OFFSET: usize = 16;
const HOST_OFFSET: usize = 20;

const _: () = assert!(HEADER_SIZE % SAMPLE_SIZE == 0);

/// Errors raised while building or reading a record
#[derive(Debug, Error)]
pub enum RecordError {
    /// Fewer bytes than a header
    #[error("Record truncated: {len} bytes, need at least {needed}")]
    Truncated {
        /// Bytes available
        len: usize,
        /// Bytes required
        needed: usize,
    },

    /// Magic bytes do not match
    #[error("Not a rank record (bad magic {0:02x?})")]
    BadMagic([u8; 4]),

    /// Record format version this build cannot read
    #[error("Unsupported record version {0}")]
    UnsupportedVersion(u16),

    /// The record holds more samples than the receiver provisioned for
    #[error("Record declares {thread_count} threads but the buffer holds at most {capacity}")]
    CapacityViolation {
        /// Thread count declared in the header
        thread_count: usize,
        /// Samples the receiving buffer holds
        capacity: usize,
    },

    /// Byte length disagrees with the declared thread count
    #[error("Record length mismatch: header implies {expected} bytes, got {actual}")]
    LengthMismatch {
        /// Length implied by the header
        expected: usize,
        /// Length received
        actual: usize,
    },

    /// Declared host name length above capacity
    #[error("Host name length {0} exceeds the host name capacity")]
    HostNameTooLong(usize),

    /// Negative rank
    #[error("Invalid rank in record: {0}")]
    InvalidRank(i64),

    /// The encoded size of the record overflows `usize`
    #[error("A record of {thread_count} threads exceeds the addressable size")]
    TooLarge {
        /// Requested thread count
        thread_count: usize,
    },

    /// The allocator refused the record's storage
    #[error("Failed to allocate {bytes} bytes for a rank record")]
    Allocation {
        /// Bytes requested
        bytes: usize,
        /// Allocator error
        #[source]
        source: TryReserveError,
    },
}

/// Encoded size of a record with `thread_count` samples, or `None` if that
/// size is not addressable.
#[inline]
pub const fn encoded_len(thread_count: usize) -> Option<usize> {
    match thread_count.checked_mul(SAMPLE_SIZE) {
        Some(payload) => payload.checked_add(HEADER_SIZE),
        None => None,
    }
}

fn record_len(thread_count: usize) -> Result<usize, RecordError> {
    encoded_len(thread_count).ok_or(RecordError::TooLarge { thread_count })
}

/// Zero-filled byte vector, with allocation failure reported instead of aborting.
fn try_zeroed(bytes: usize) -> Result<Vec<u8>, RecordError> {
    let mut storage = Vec::new();
    storage
        .try_reserve_exact(bytes)
        .map_err(|source| RecordError::Allocation { bytes, source })?;
    storage.resize(bytes, 0);
    Ok(storage)
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_i32(bytes: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Validated header fields.
#[derive(Debug, Clone, Copy)]
struct Header {
    rank: Rank,
    thread_count: usize,
    host_len: usize,
}

impl Header {
    /// Parse and check a header against `capacity` samples and the number of
    /// bytes actually received. Never looks at the transmitted payload offset
    /// nor at any sample.
    fn parse(bytes: &[u8], capacity: usize) -> Result<Self, RecordError> {
        if bytes.len() < HEADER_SIZE {
            return Err(RecordError::Truncated {
                len: bytes.len(),
                needed: HEADER_SIZE,
            });
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[MAGIC_OFFSET..MAGIC_OFFSET + 4]);
        if magic != RECORD_MAGIC {
            return Err(RecordError::BadMagic(magic));
        }

        let version = read_u16(bytes, VERSION_OFFSET);
        if version != RECORD_VERSION {
            return Err(RecordError::UnsupportedVersion(version));
        }

        let thread_count = read_u32(bytes, THREADS_OFFSET) as usize;
        if thread_count > capacity {
            return Err(RecordError::CapacityViolation {
                thread_count,
                capacity,
            });
        }

        let expected = record_len(thread_count)?;
        if bytes.len() != expected {
            return Err(RecordError::LengthMismatch {
                expected,
                actual: bytes.len(),
            });
        }

        let host_len = read_u16(bytes, HOST_LEN_OFFSET) as usize;
        if host_len > HOST_NAME_CAPACITY {
            return Err(RecordError::HostNameTooLong(host_len));
        }

        let rank = read_i32(bytes, RANK_OFFSET);
        if rank < 0 {
            return Err(RecordError::InvalidRank(rank as i64));
        }

        Ok(Self {
            rank: rank as Rank,
            thread_count,
            host_len,
        })
    }
}

/// One rank's placement report.
///
/// Equality covers the logical content only: the payload offset lives in
/// whichever buffer currently holds the encoded form, never here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankRecord {
    /// Rank of the sender
    pub rank: Rank,
    /// Host the sender runs on
    pub host: HostName,
    /// Core of each team thread, indexed by thread
    pub core_samples: Vec<CoreId>,
}

impl RankRecord {
    /// Create a record.
    pub fn new(rank: Rank, host: HostName, core_samples: Vec<CoreId>) -> Self {
        Self {
            rank,
            host,
            core_samples,
        }
    }

    /// Number of team threads (and core samples).
    pub fn thread_count(&self) -> usize {
        self.core_samples.len()
    }

    /// Encode into a freshly allocated snapshot.
    pub fn encode(&self) -> Result<Vec<u8>, RecordError> {
        let rank = i32::try_from(self.rank).map_err(|_| RecordError::InvalidRank(self.rank as i64))?;
        let threads = self.thread_count();
        let mut bytes = try_zeroed(record_len(threads)?)?;

        bytes[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(&RECORD_MAGIC);
        bytes[VERSION_OFFSET..VERSION_OFFSET + 2].copy_from_slice(&RECORD_VERSION.to_le_bytes());
        bytes[HOST_LEN_OFFSET..HOST_LEN_OFFSET + 2]
            .copy_from_slice(&(self.host.len() as u16).to_le_bytes());
        bytes[RANK_OFFSET..RANK_OFFSET + 4].copy_from_slice(&rank.to_le_bytes());
        bytes[THREADS_OFFSET..THREADS_OFFSET + 4].copy_from_slice(&(threads as u32).to_le_bytes());
        // Local to this buffer; receivers recompute it
        bytes[PAYLOAD_OFFSET_OFFSET..PAYLOAD_OFFSET_OFFSET + 4]
            .copy_from_slice(&(HEADER_SIZE as u32).to_le_bytes());
        bytes[HOST_OFFSET..HOST_OFFSET + HOST_NAME_CAPACITY].copy_from_slice(self.host.padded());

        for (slot, core) in bytes[HEADER_SIZE..]
            .chunks_exact_mut(SAMPLE_SIZE)
            .zip(&self.core_samples)
        {
            slot.copy_from_slice(&core.0.to_le_bytes());
        }

        Ok(bytes)
    }

    /// Decode a record whose sender may have at most `capacity` threads.
    pub fn decode(bytes: &[u8], capacity: usize) -> Result<Self, RecordError> {
        let mut buffer = RecordBuffer::with_capacity(capacity)?;
        let view = buffer.load(bytes)?;
        Ok(view.to_record())
    }
}

/// Reusable receive buffer for rank records.
///
/// Sized once for the largest team in the job, then refilled for every sender.
/// Each fill is validated by [`accept`](Self::accept), which also performs the
/// payload-offset fix-up before any sample can be read.
#[derive(Debug)]
pub struct RecordBuffer {
    storage: Vec<u8>,
    capacity: usize,
}

impl RecordBuffer {
    /// Allocate room for a record of up to `capacity` threads.
    pub fn with_capacity(capacity: usize) -> Result<Self, RecordError> {
        Ok(Self {
            storage: try_zeroed(record_len(capacity)?)?,
            capacity,
        })
    }

    /// Maximum thread count this buffer accepts.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Maximum record size in bytes.
    pub fn max_bytes(&self) -> usize {
        self.storage.len()
    }

    /// Whole storage, for a transport to receive into.
    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.storage
    }

    /// Raw storage, including whatever the last fill left behind.
    pub fn as_bytes(&self) -> &[u8] {
        &self.storage
    }

    /// Validate the first `received` bytes as a record and fix up its payload
    /// offset for this buffer.
    pub fn accept(&mut self, received: usize) -> Result<RecordView<'_>, RecordError> {
        let received = received.min(self.storage.len());
        let header = Header::parse(&self.storage[..received], self.capacity)?;

        // Whatever offset the sender wrote is discarded here
        let payload_offset = HEADER_SIZE;
        self.storage[PAYLOAD_OFFSET_OFFSET..PAYLOAD_OFFSET_OFFSET + 4]
            .copy_from_slice(&(payload_offset as u32).to_le_bytes());

        Ok(RecordView {
            bytes: &self.storage[..received],
            header,
            payload_offset,
        })
    }

    /// Copy an encoded record in and accept it.
    ///
    /// The header is checked against the source first, so a record too large
    /// for this buffer is rejected before a single byte is copied.
    pub fn load(&mut self, bytes: &[u8]) -> Result<RecordView<'_>, RecordError> {
        if bytes.len() > self.storage.len() {
            // Parse for the precise error; a well-formed oversize record
            // always trips the capacity check.
            Header::parse(bytes, self.capacity)?;
            return Err(RecordError::LengthMismatch {
                expected: self.storage.len(),
                actual: bytes.len(),
            });
        }
        Header::parse(bytes, self.capacity)?;
        self.storage[..bytes.len()].copy_from_slice(bytes);
        self.accept(bytes.len())
    }
}

/// Borrowed, validated view of the record currently held by a [`RecordBuffer`].
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    bytes: &'a [u8],
    header: Header,
    payload_offset: usize,
}

impl<'a> RecordView<'a> {
    /// Rank of the sender.
    pub fn rank(&self) -> Rank {
        self.header.rank
    }

    /// Number of core samples.
    pub fn thread_count(&self) -> usize {
        self.header.thread_count
    }

    /// Host name of the sender.
    pub fn host(&self) -> HostName {
        HostName::from_raw(&self.bytes[HOST_OFFSET..], self.header.host_len)
    }

    /// Payload offset as fixed up by the receiving buffer.
    pub fn payload_offset(&self) -> usize {
        self.payload_offset
    }

    /// Core sample of `thread`, if in range.
    pub fn core(&self, thread: usize) -> Option<CoreId> {
        if thread >= self.header.thread_count {
            return None;
        }
        let at = self.payload_offset + thread * SAMPLE_SIZE;
        Some(CoreId(read_i32(self.bytes, at)))
    }

    /// Core samples in thread order.
    pub fn cores(&self) -> impl Iterator<Item = CoreId> + 'a {
        let start = self.payload_offset;
        let end = start + self.header.thread_count * SAMPLE_SIZE;
        self.bytes[start..end]
            .chunks_exact(SAMPLE_SIZE)
            .map(|chunk| CoreId(i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])))
    }

    /// Copy out into an owned record.
    pub fn to_record(&self) -> RankRecord {
        RankRecord {
            rank: self.rank(),
            host: self.host(),
            core_samples: self.cores().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> RankRecord {
        RankRecord::new(
            2,
            HostName::new("node-a17"),
            vec![CoreId(4), CoreId(5), CoreId(12)],
        )
    }

    #[test]
    fn test_header_size() {
        assert_eq!(HEADER_SIZE, 60);
        assert_eq!(encoded_len(3), Some(72));
    }

    #[test]
    fn test_encoded_layout() {
        let bytes = sample_record().encode().unwrap();
        assert_eq!(Some(bytes.len()), encoded_len(3));
        assert_eq!(&bytes[..4], b"RKMP");
        assert_eq!(read_i32(&bytes, RANK_OFFSET), 2);
        assert_eq!(read_u32(&bytes, THREADS_OFFSET), 3);
        assert_eq!(read_u16(&bytes, HOST_LEN_OFFSET), 8);
        assert_eq!(read_i32(&bytes, HEADER_SIZE + 2 * SAMPLE_SIZE), 12);
    }

    #[test]
    fn test_decode_matches_original() {
        let record = sample_record();
        let bytes = record.encode().unwrap();
        assert_eq!(RankRecord::decode(&bytes, 3).unwrap(), record);
        assert_eq!(RankRecord::decode(&bytes, 64).unwrap(), record);
    }

    #[test]
    fn test_empty_host_and_unknown_cores() {
        let record = RankRecord::new(0, HostName::default(), vec![CoreId::UNKNOWN]);
        let bytes = record.encode().unwrap();
        assert_eq!(RankRecord::decode(&bytes, 1).unwrap(), record);
    }

    #[test]
    fn test_transmitted_payload_offset_is_ignored() {
        let record = sample_record();
        let mut bytes = record.encode().unwrap();
        // A sender-local offset that means nothing here
        bytes[PAYLOAD_OFFSET_OFFSET..PAYLOAD_OFFSET_OFFSET + 4]
            .copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());

        let mut buffer = RecordBuffer::with_capacity(8).unwrap();
        let view = buffer.load(&bytes).unwrap();
        assert_eq!(view.payload_offset(), HEADER_SIZE);
        assert_eq!(view.to_record(), record);

        assert_eq!(
            read_u32(buffer.as_bytes(), PAYLOAD_OFFSET_OFFSET),
            HEADER_SIZE as u32
        );
    }

    #[test]
    fn test_capacity_violation_copies_nothing() {
        let bytes = RankRecord::new(1, HostName::new("big"), vec![CoreId(1); 5])
            .encode()
            .unwrap();

        let mut buffer = RecordBuffer::with_capacity(4).unwrap();
        let err = buffer.load(&bytes).unwrap_err();
        assert!(matches!(
            err,
            RecordError::CapacityViolation {
                thread_count: 5,
                capacity: 4
            }
        ));
        assert!(buffer.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_capacity_violation_on_short_lying_header() {
        // Header claims more threads than fit, but the record itself is small
        let mut bytes = RankRecord::new(1, HostName::new("liar"), vec![CoreId(1)])
            .encode()
            .unwrap();
        bytes[THREADS_OFFSET..THREADS_OFFSET + 4].copy_from_slice(&1000u32.to_le_bytes());

        let mut buffer = RecordBuffer::with_capacity(4).unwrap();
        assert!(matches!(
            buffer.load(&bytes),
            Err(RecordError::CapacityViolation {
                thread_count: 1000,
                ..
            })
        ));
        assert!(buffer.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_buffer_reuse_smaller_after_larger() {
        let mut buffer = RecordBuffer::with_capacity(3).unwrap();

        let big = sample_record();
        buffer.load(&big.encode().unwrap()).unwrap();

        let small = RankRecord::new(3, HostName::new("n"), vec![CoreId(9)]);
        let view = buffer.load(&small.encode().unwrap()).unwrap();
        assert_eq!(view.thread_count(), 1);
        assert_eq!(view.cores().collect::<Vec<_>>(), vec![CoreId(9)]);
        assert_eq!(view.core(1), None);
        assert_eq!(view.to_record(), small);
    }

    #[test]
    fn test_accept_partial_receive() {
        let record = sample_record();
        let bytes = record.encode().unwrap();

        let mut buffer = RecordBuffer::with_capacity(16).unwrap();
        buffer.as_mut_bytes()[..bytes.len()].copy_from_slice(&bytes);
        let view = buffer.accept(bytes.len()).unwrap();
        assert_eq!(view.to_record(), record);
    }

    #[test]
    fn test_rejects_garbage() {
        let mut bytes = sample_record().encode().unwrap();
        assert!(matches!(
            RankRecord::decode(&bytes[..10], 8),
            Err(RecordError::Truncated { .. })
        ));
        assert!(matches!(
            RankRecord::decode(&bytes[..bytes.len() - 1], 8),
            Err(RecordError::LengthMismatch { .. })
        ));

        bytes[VERSION_OFFSET] = 9;
        assert!(matches!(
            RankRecord::decode(&bytes, 8),
            Err(RecordError::UnsupportedVersion(9))
        ));

        bytes[0] = b'X';
        assert!(matches!(
            RankRecord::decode(&bytes, 8),
            Err(RecordError::BadMagic(_))
        ));
    }

    #[test]
    fn test_rejects_oversized_host_len() {
        let mut bytes = sample_record().encode().unwrap();
        bytes[HOST_LEN_OFFSET..HOST_LEN_OFFSET + 2].copy_from_slice(&200u16.to_le_bytes());
        assert!(matches!(
            RankRecord::decode(&bytes, 8),
            Err(RecordError::HostNameTooLong(200))
        ));
    }

    #[test]
    fn test_unaddressable_capacity() {
        assert_eq!(encoded_len(usize::MAX), None);
        assert!(matches!(
            RecordBuffer::with_capacity(usize::MAX),
            Err(RecordError::TooLarge {
                thread_count: usize::MAX
            })
        ));
        // Addressable but far beyond any allocator
        assert!(matches!(
            RecordBuffer::with_capacity(usize::MAX / SAMPLE_SIZE - HEADER_SIZE),
            Err(RecordError::Allocation { .. })
        ));
    }
}
