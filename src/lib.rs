//! # A Checkpoint Bitmap Index
//!
//! This module implements the bitmap index used by the ledger
//! indexer to record which checkpoints carry activity. A
//! checkpoint number is a 32-bit identifier starting at 1. A
//! writer marks checkpoints active in roughly-forward order, a
//! consumer later walks the active checkpoints in ascending
//! order, and whole indexes occasionally are merged together.
//!
//! The active set usually forms a dense cluster inside one
//! contiguous range, so the index stores it as a packed bitmap
//! anchored to a byte-aligned lower bound. Bit k of the bitmap,
//! counted from the most-significant bit of byte 0, represents
//! checkpoint `range_first_checkpoint() + k`.
//!
//! The index only grows while a writer holds it; bits are set,
//! never cleared. The flush method produces a self-describing
//! byte blob that the caller can store elsewhere, and from_bytes
//! reconstructs an equivalent index from such a blob.

#![deny(warnings)]
#![deny(missing_docs)]


use {
    log::debug,
    serde::{Deserialize, Serialize},
    std::cmp,
    thiserror::Error,
};

// The serialized form starts with three big-endian u32 words:
// the first checkpoint, the last checkpoint, and the count of
// bitmap bytes that follow.
const HEADER_SIZE: usize = 12;

/// The error type for index operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BitmapError {
    /// No active checkpoint exists at or after the requested
    /// position. This is the expected terminator when iterating,
    /// not a sign of a damaged index.
    #[error("There is no active checkpoint at or after the requested position.")]
    EndOfStream,

    /// Checkpoint numbers start at 1.
    #[error("That checkpoint (0) is out of range:  checkpoints start at 1.")]
    ZeroCheckpoint,

    /// A serialized blob failed its structural checks.
    #[error("The blob is malformed:  {0}")]
    MalformedBlob(String),
}

/// The result type used by this crate.
pub type Result<T> = std::result::Result<T, BitmapError>;

// Compute the byte-aligned anchor for a checkpoint:  the largest
// value of the form 8 * n + 1 that is at most the given
// checkpoint. The caller must not pass zero.
#[inline(always)]
fn byte_align(checkpoint: u32) -> u32 {
    (checkpoint - 1) / 8 * 8 + 1
}

// Find the most-significant set bit of the byte at a position at
// or after the given one, with positions counted from the MSB.
// Positions of 8 and beyond mask the entire byte off.
#[inline(always)]
fn max_bit_after(byte: u8, after: u32) -> Option<u32> {
    let masked = if after < 8 { byte & (0xff >> after) } else { 0 };

    if masked == 0 {
        None
    } else {
        Some(masked.leading_zeros())
    }
}

// Decode a big-endian u32 at the given offset. The caller has
// checked that the slice is long enough.
#[inline(always)]
fn decode_u32(bytes: &[u8], at: usize) -> u32 {
    let mut word = [0_u8; 4];

    word.copy_from_slice(&bytes[at..at + 4]);
    u32::from_be_bytes(word)
}

/// The in-memory structure for a set of active checkpoints.
///
/// Data kept for the index:
///   first_checkpoint   the smallest checkpoint ever marked
///                        active, or zero when the index is empty
///   last_checkpoint    the largest checkpoint ever marked
///                        active, or zero when the index is empty
///   bitmap             the packed bits, most-significant bit
///                        first, anchored at the byte-aligned
///                        range_first_checkpoint()
///
/// The bitmap is sized exactly:  the first byte holds the bit
/// for first_checkpoint and the final byte holds the bit for
/// last_checkpoint.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct CheckpointIndex {
    first_checkpoint: u32,
    last_checkpoint: u32,
    bitmap: Vec<u8>,
}

impl CheckpointIndex {
    /// Create a new, empty index.
    #[inline(always)]
    pub fn new() -> CheckpointIndex {
        CheckpointIndex::default()
    }

    /// Reconstruct an index from a blob produced by flush().
    ///
    /// The blob is checked structurally:  the bitmap length must
    /// match the checkpoint range exactly, and the bits for the
    /// first and last checkpoints must be set. A zero-length
    /// blob is accepted as a spelling of the empty index.
    pub fn from_bytes(bytes: &[u8]) -> Result<CheckpointIndex> {
        if bytes.is_empty() {
            return Ok(CheckpointIndex::new());
        }

        if bytes.len() < HEADER_SIZE {
            return Err(BitmapError::MalformedBlob(format!(
                "That blob is too short ({} bytes).",
                bytes.len()
            )));
        }

        let first = decode_u32(bytes, 0);
        let last = decode_u32(bytes, 4);
        let length = decode_u32(bytes, 8) as usize;
        let bitmap = &bytes[HEADER_SIZE..];

        if bitmap.len() != length {
            return Err(BitmapError::MalformedBlob(format!(
                "The header promised {} bitmap bytes, but {} follow.",
                length,
                bitmap.len()
            )));
        }

        if first == 0 {
            if last != 0 || length != 0 {
                return Err(BitmapError::MalformedBlob(format!(
                    "An empty index cannot have a last checkpoint ({}) or bits ({} bytes).",
                    last, length
                )));
            }

            return Ok(CheckpointIndex::new());
        }

        if first > last {
            return Err(BitmapError::MalformedBlob(format!(
                "The first checkpoint ({}) is past the last ({}).",
                first, last
            )));
        }

        // The anchor ordering was checked above, so this cannot
        // underflow.
        let expected = ((last - byte_align(first)) / 8 + 1) as usize;

        if length != expected {
            return Err(BitmapError::MalformedBlob(format!(
                "That bitmap length ({}) is invalid:  {} expected.",
                length, expected
            )));
        }

        let result = CheckpointIndex {
            first_checkpoint: first,
            last_checkpoint: last,
            bitmap: bitmap.to_vec(),
        };

        if !result.is_active(first) {
            return Err(BitmapError::MalformedBlob(format!(
                "The bit for the first checkpoint ({}) is clear.",
                first
            )));
        }

        if !result.is_active(last) {
            return Err(BitmapError::MalformedBlob(format!(
                "The bit for the last checkpoint ({}) is clear.",
                last
            )));
        }

        Ok(result)
    }

    /// Mark the given checkpoint as active. Re-setting an active
    /// checkpoint is a no-op. The bitmap grows to the left or to
    /// the right as needed; the range anchor stays byte-aligned
    /// throughout.
    pub fn set_active(&mut self, checkpoint: u32) -> Result<()> {
        if checkpoint == 0 {
            return Err(BitmapError::ZeroCheckpoint);
        }

        if self.first_checkpoint == 0 {
            // The index is empty, so allocate the first byte.
            self.first_checkpoint = checkpoint;
            self.last_checkpoint = checkpoint;
            self.bitmap = vec![0x80 >> (checkpoint - byte_align(checkpoint))];
            return Ok(());
        }

        let range_first = self.range_first_checkpoint();

        if checkpoint >= range_first {
            // The checkpoint lands at or past the current anchor.
            // Append zero bytes first if its bit is past the end.
            let offset = (checkpoint - range_first) as usize;
            let index = offset / 8;

            if index >= self.bitmap.len() {
                self.bitmap.resize(index + 1, 0);
            }

            self.bitmap[index] |= 0x80 >> (offset % 8);
        } else {
            // The checkpoint is below the anchor. Reallocate at
            // the new byte-aligned anchor and shift the existing
            // bytes right.
            let new_range_first = byte_align(checkpoint);
            let grown = ((range_first - new_range_first) / 8) as usize;

            debug!(
                "bitmap anchor moves left:  {} to {}",
                range_first, new_range_first
            );

            let mut bitmap = vec![0_u8; grown + self.bitmap.len()];

            bitmap[grown..].copy_from_slice(&self.bitmap);
            bitmap[0] |= 0x80 >> (checkpoint - new_range_first);
            self.bitmap = bitmap;
        }

        self.first_checkpoint = cmp::min(self.first_checkpoint, checkpoint);
        self.last_checkpoint = cmp::max(self.last_checkpoint, checkpoint);
        Ok(())
    }

    /// Query whether the given checkpoint is active. Checkpoints
    /// outside the [first, last] range are inactive, as is
    /// everything in an empty index.
    pub fn is_active(&self, checkpoint: u32) -> bool {
        if self.first_checkpoint == 0
            || checkpoint < self.first_checkpoint
            || checkpoint > self.last_checkpoint
        {
            return false;
        }

        let offset = checkpoint - self.range_first_checkpoint();

        self.bitmap[(offset / 8) as usize] & (0x80 >> (offset % 8)) != 0
    }

    /// Return the smallest active checkpoint at or after the
    /// given one. EndOfStream signals that no such checkpoint
    /// exists; it is the expected terminator when iterating.
    pub fn next_active(&self, checkpoint: u32) -> Result<u32> {
        if self.first_checkpoint == 0 || checkpoint > self.last_checkpoint {
            return Err(BitmapError::EndOfStream);
        }

        let range_first = self.range_first_checkpoint();
        let offset = cmp::max(checkpoint, self.first_checkpoint) - range_first;
        let mut index = (offset / 8) as usize;
        let mut after = offset % 8;

        // Scan a byte at a time. Only the first byte masks off
        // its leading positions.
        while index < self.bitmap.len() {
            if let Some(shift) = max_bit_after(self.bitmap[index], after) {
                return Ok(range_first + index as u32 * 8 + shift);
            }

            index += 1;
            after = 0;
        }

        Err(BitmapError::EndOfStream)
    }

    /// Merge the contents of another index into this one. The
    /// result holds the union of the two active sets; the other
    /// index is unchanged.
    pub fn merge(&mut self, other: &CheckpointIndex) {
        if other.first_checkpoint == 0 {
            return;
        }

        if self.first_checkpoint == 0 {
            *self = other.clone();
            return;
        }

        let first = cmp::min(self.first_checkpoint, other.first_checkpoint);
        let last = cmp::max(self.last_checkpoint, other.last_checkpoint);
        let range_first = byte_align(first);

        debug!(
            "merge reallocates for [{}, {}]:  {} bytes",
            first,
            last,
            (last - range_first) / 8 + 1
        );

        let mut bitmap = vec![0_u8; ((last - range_first) / 8 + 1) as usize];

        let offset = ((self.range_first_checkpoint() - range_first) / 8) as usize;
        bitmap[offset..offset + self.bitmap.len()].copy_from_slice(&self.bitmap);

        let offset = ((other.range_first_checkpoint() - range_first) / 8) as usize;
        for (merged, byte) in bitmap[offset..].iter_mut().zip(other.bitmap.iter()) {
            *merged |= byte;
        }

        self.first_checkpoint = first;
        self.last_checkpoint = last;
        self.bitmap = bitmap;
    }

    /// Produce the serialized form of the index:  the first and
    /// last checkpoints and the bitmap byte count as big-endian
    /// u32 words, followed by the raw bitmap bytes. An empty
    /// index flushes to the all-zero header.
    pub fn flush(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.bitmap.len());

        bytes.extend_from_slice(&self.first_checkpoint.to_be_bytes());
        bytes.extend_from_slice(&self.last_checkpoint.to_be_bytes());
        bytes.extend_from_slice(&(self.bitmap.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&self.bitmap);
        bytes
    }

    /// Iterate the active checkpoints in ascending order.
    #[inline(always)]
    pub fn iter(&self) -> ActiveCheckpoints<'_> {
        ActiveCheckpoints {
            index: self,
            position: Some(0),
        }
    }

    /// Return the count of active checkpoints.
    #[inline(always)]
    pub fn cardinality(&self) -> u32 {
        self.bitmap.iter().map(|byte| byte.count_ones()).sum()
    }

    /// Query whether any checkpoint is active.
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.first_checkpoint == 0
    }

    /// Return the smallest active checkpoint, if any.
    #[inline(always)]
    pub fn first_active(&self) -> Option<u32> {
        if self.first_checkpoint == 0 {
            None
        } else {
            Some(self.first_checkpoint)
        }
    }

    /// Return the largest active checkpoint, if any.
    #[inline(always)]
    pub fn last_active(&self) -> Option<u32> {
        if self.last_checkpoint == 0 {
            None
        } else {
            Some(self.last_checkpoint)
        }
    }

    /// Validate the index structure. This method is intended for
    /// use in tests.
    pub fn validate(&self) -> bool {
        if self.first_checkpoint == 0 {
            return self.last_checkpoint == 0 && self.bitmap.is_empty();
        }

        if self.first_checkpoint > self.last_checkpoint {
            return false;
        }

        let range_first = self.range_first_checkpoint();

        // The anchor is byte-aligned and the bitmap covers the
        // [anchor, last] range exactly, with no slack bytes on
        // either side.
        if (range_first - 1) % 8 != 0 {
            return false;
        }

        if self.bitmap.len() != ((self.last_checkpoint - range_first) / 8 + 1) as usize {
            return false;
        }

        let mut pass = self.is_active(self.first_checkpoint);

        pass &= self.is_active(self.last_checkpoint);

        // Every set bit corresponds to a checkpoint within the
        // [first, last] range.
        for (index, byte) in self.bitmap.iter().enumerate() {
            for shift in 0..8 {
                if byte & (0x80 >> shift) != 0 {
                    let checkpoint = range_first + index as u32 * 8 + shift;

                    pass &= checkpoint >= self.first_checkpoint
                        && checkpoint <= self.last_checkpoint;
                }
            }
        }

        pass
    }

    // The byte-aligned anchor of the bitmap:  the largest value
    // of the form 8 * n + 1 at most first_checkpoint. Callers
    // check that the index is not empty.
    #[inline(always)]
    fn range_first_checkpoint(&self) -> u32 {
        byte_align(self.first_checkpoint)
    }
}

/// An iterator over the active checkpoints of an index, in
/// ascending order.
pub struct ActiveCheckpoints<'a> {
    index: &'a CheckpointIndex,
    position: Option<u32>,
}

impl Iterator for ActiveCheckpoints<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        let found = self.index.next_active(self.position?).ok()?;

        // A checkpoint at u32::MAX ends the iteration on the
        // following call.
        self.position = found.checked_add(1);
        Some(found)
    }
}

impl<'a> IntoIterator for &'a CheckpointIndex {
    type Item = u32;
    type IntoIter = ActiveCheckpoints<'a>;

    fn into_iter(self) -> ActiveCheckpoints<'a> {
        self.iter()
    }
}
