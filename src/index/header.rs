//! The on-disk header of a persisted index.  The header is packed, 18 bytes,
//! all integers little-endian, and is followed immediately by the raw bucket
//! region.

use crate::error::ReadIndexError;
use std::io;
use std::io::{Read, Write};

/// The first eight bytes of every persisted index, no terminator.
pub const MAGIC: [u8; 8] = *b"BORG_IDX";

/// Size in bytes of the packed header.
pub const HEADER_SIZE: usize = 18;

/// Smallest supported key width.  The bucket hash reads a four byte prefix
/// from every key, so shorter keys cannot be indexed.
pub(crate) const MIN_KEY_SIZE: usize = 4;
/// Largest key width the header can record (the field is a signed byte).
pub(crate) const MAX_KEY_SIZE: usize = 127;
/// Smallest supported value width; the state tags live in the first four
/// value bytes.
pub(crate) const MIN_VALUE_SIZE: usize = 4;
/// Largest value width the header can record.
pub(crate) const MAX_VALUE_SIZE: usize = 127;

/// Decoded header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IndexHeader {
    pub num_entries: u32,
    pub num_buckets: u32,
    pub key_size: u8,
    pub value_size: u8,
}

impl IndexHeader {
    /// Load a header from the start of source.  Leaves the source positioned
    /// after the header.  The entry and bucket counts are trusted; only the
    /// magic and the cell widths are validated here, the file length identity
    /// is the caller's check.
    pub fn load_header<R: Read>(source: &mut R) -> Result<Self, ReadIndexError> {
        let mut buffer = [0_u8; HEADER_SIZE];
        source.read_exact(&mut buffer)?;
        if buffer[0..8] != MAGIC {
            return Err(ReadIndexError::BadMagic);
        }
        let mut buf32 = [0_u8; 4];
        let mut pos = 8;
        buf32.copy_from_slice(&buffer[pos..(pos + 4)]);
        let num_entries = u32::from_le_bytes(buf32);
        pos += 4;
        buf32.copy_from_slice(&buffer[pos..(pos + 4)]);
        let num_buckets = u32::from_le_bytes(buf32);
        pos += 4;
        let key_size = buffer[pos];
        pos += 1;
        let value_size = buffer[pos];
        if !(MIN_KEY_SIZE..=MAX_KEY_SIZE).contains(&(key_size as usize)) {
            return Err(ReadIndexError::BadKeySize(key_size));
        }
        if !(MIN_VALUE_SIZE..=MAX_VALUE_SIZE).contains(&(value_size as usize)) {
            return Err(ReadIndexError::BadValueSize(value_size));
        }
        Ok(Self {
            num_entries,
            num_buckets,
            key_size,
            value_size,
        })
    }

    /// Write the packed header at the current position of sink.
    pub fn write_header<W: Write>(&self, sink: &mut W) -> Result<(), io::Error> {
        let mut buffer = [0_u8; HEADER_SIZE];
        buffer[0..8].copy_from_slice(&MAGIC);
        let mut pos = 8;
        buffer[pos..(pos + 4)].copy_from_slice(&self.num_entries.to_le_bytes());
        pos += 4;
        buffer[pos..(pos + 4)].copy_from_slice(&self.num_buckets.to_le_bytes());
        pos += 4;
        buffer[pos] = self.key_size;
        pos += 1;
        buffer[pos] = self.value_size;
        sink.write_all(&buffer)?;
        Ok(())
    }
}
