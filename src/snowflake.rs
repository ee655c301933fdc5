use crate::MergeError;

/// Provider-assigned 64-bit post identifier.
pub type PostId = u64;

/// Milliseconds since the Unix epoch at which relative timestamps start.
pub const CUSTOM_EPOCH_MS: i64 = 1_288_834_974_657;

const TIMESTAMP_BITS: u32 = 41;
const DATACENTER_BITS: u32 = 5;
const WORKER_BITS: u32 = 5;
const SEQUENCE_BITS: u32 = 12;

const WORKER_SHIFT: u32 = SEQUENCE_BITS;
const DATACENTER_SHIFT: u32 = SEQUENCE_BITS + WORKER_BITS;
const TIMESTAMP_SHIFT: u32 = SEQUENCE_BITS + WORKER_BITS + DATACENTER_BITS;

pub const MAX_RELATIVE_TIMESTAMP: i64 = (1 << TIMESTAMP_BITS) - 1;
pub const MAX_DATACENTER_ID: u8 = (1 << DATACENTER_BITS) - 1;
pub const MAX_WORKER_ID: u8 = (1 << WORKER_BITS) - 1;
pub const MAX_SEQUENCE: u16 = (1 << SEQUENCE_BITS) - 1;

/// Decoded fields of a time-embedded identifier.
///
/// Layout, most significant first: 41 bits of milliseconds since
/// [`CUSTOM_EPOCH_MS`], 5 bits datacenter, 5 bits worker, 12 bits sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Snowflake {
    pub timestamp_ms: i64,
    pub datacenter_id: u8,
    pub worker_id: u8,
    pub sequence: u16,
}

impl Snowflake {
    pub fn decode(id: PostId) -> Self {
        Self {
            timestamp_ms: (id >> TIMESTAMP_SHIFT) as i64 + CUSTOM_EPOCH_MS,
            datacenter_id: ((id >> DATACENTER_SHIFT) & MAX_DATACENTER_ID as u64) as u8,
            worker_id: ((id >> WORKER_SHIFT) & MAX_WORKER_ID as u64) as u8,
            sequence: (id & MAX_SEQUENCE as u64) as u16,
        }
    }

    pub fn encode(&self) -> Result<PostId, MergeError> {
        let relative = self.timestamp_ms.checked_sub(CUSTOM_EPOCH_MS).ok_or_else(|| {
            MergeError::CodecRange(format!("timestamp {} underflows", self.timestamp_ms))
        })?;
        if relative < 0 {
            return Err(MergeError::CodecRange(format!(
                "timestamp {} precedes epoch {}",
                self.timestamp_ms, CUSTOM_EPOCH_MS
            )));
        }
        if relative > MAX_RELATIVE_TIMESTAMP {
            return Err(MergeError::CodecRange(format!(
                "timestamp {} exceeds {} bits",
                self.timestamp_ms, TIMESTAMP_BITS
            )));
        }
        if self.datacenter_id > MAX_DATACENTER_ID {
            return Err(MergeError::CodecRange(format!(
                "datacenter id {} exceeds {}",
                self.datacenter_id, MAX_DATACENTER_ID
            )));
        }
        if self.worker_id > MAX_WORKER_ID {
            return Err(MergeError::CodecRange(format!(
                "worker id {} exceeds {}",
                self.worker_id, MAX_WORKER_ID
            )));
        }
        if self.sequence > MAX_SEQUENCE {
            return Err(MergeError::CodecRange(format!(
                "sequence {} exceeds {}",
                self.sequence, MAX_SEQUENCE
            )));
        }

        Ok(((relative as u64) << TIMESTAMP_SHIFT)
            | ((self.datacenter_id as u64) << DATACENTER_SHIFT)
            | ((self.worker_id as u64) << WORKER_SHIFT)
            | self.sequence as u64)
    }

    /// Synthesized keys carry the maximal datacenter and worker fields.
    pub fn is_synthetic(&self) -> bool {
        self.datacenter_id == MAX_DATACENTER_ID && self.worker_id == MAX_WORKER_ID
    }
}

pub fn decode(id: PostId) -> Snowflake {
    Snowflake::decode(id)
}

pub fn encode(
    timestamp_ms: i64,
    datacenter_id: u8,
    worker_id: u8,
    sequence: u16,
) -> Result<PostId, MergeError> {
    Snowflake {
        timestamp_ms,
        datacenter_id,
        worker_id,
        sequence,
    }
    .encode()
}

/// Absolute creation time embedded in an identifier.
pub fn timestamp_of(id: PostId) -> i64 {
    Snowflake::decode(id).timestamp_ms
}

/// Whether `timestamp_ms` fits the 41-bit timestamp field.
pub fn timestamp_in_range(timestamp_ms: i64) -> bool {
    timestamp_ms
        .checked_sub(CUSTOM_EPOCH_MS)
        .is_some_and(|relative| (0..=MAX_RELATIVE_TIMESTAMP).contains(&relative))
}

/// Placeholder key for a drop event so it sorts among real ids by time.
///
/// The timestamp is moved back by `offset_ms` so the event lands before every
/// post of its own millisecond; the capture index rides in the sequence field.
pub fn synthetic_key(
    arrival_ms: i64,
    capture_index: usize,
    offset_ms: i64,
) -> Result<PostId, MergeError> {
    let sequence = u16::try_from(capture_index)
        .ok()
        .filter(|s| *s <= MAX_SEQUENCE)
        .ok_or_else(|| {
            MergeError::CodecRange(format!(
                "capture index {} exceeds {}",
                capture_index, MAX_SEQUENCE
            ))
        })?;
    let shifted = arrival_ms.checked_sub(offset_ms).ok_or_else(|| {
        MergeError::CodecRange(format!("arrival {} minus offset {} underflows", arrival_ms, offset_ms))
    })?;
    encode(shifted, MAX_DATACENTER_ID, MAX_WORKER_ID, sequence)
}
