//! The chunk index: a typed front end over the raw engine for deduplication
//! bookkeeping.  Keys are 32 byte chunk ids (digest prefixes are fine, the
//! engine only requires the leading four bytes to carry entropy) and values
//! are a refcount plus the uncompressed and stored sizes of the chunk.

use crate::error::{AllocError, ReadIndexError, WriteIndexError};
use crate::index::HashIndex;
use crate::iter::IndexIter;
use std::path::Path;

/// Width in bytes of a chunk id key.
pub const CHUNK_ID_SIZE: usize = 32;

/// A chunk id: the key type of a [`ChunkIndex`].
pub type ChunkId = [u8; CHUNK_ID_SIZE];

/// Width in bytes of an encoded [`ChunkEntry`].
const ENTRY_SIZE: usize = 12;

/// Largest storable refcount.  Refcounts saturate here and stay pinned once
/// they do; the gap up to the bucket state tags keeps every encoded entry's
/// leading word clear of the reserved patterns.
pub const MAX_REFCOUNT: u32 = u32::MAX - 1024;

/// One chunk's bookkeeping: how many times it is referenced and how large it
/// is, uncompressed and as stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkEntry {
    /// Number of references to the chunk, saturating at [`MAX_REFCOUNT`].
    pub refcount: u32,
    /// Uncompressed chunk size in bytes.
    pub size: u32,
    /// Stored (compressed and encrypted) chunk size in bytes.
    pub csize: u32,
}

impl ChunkEntry {
    fn to_bytes(self) -> [u8; ENTRY_SIZE] {
        let mut buffer = [0_u8; ENTRY_SIZE];
        buffer[0..4].copy_from_slice(&self.refcount.to_le_bytes());
        buffer[4..8].copy_from_slice(&self.size.to_le_bytes());
        buffer[8..12].copy_from_slice(&self.csize.to_le_bytes());
        buffer
    }

    fn from_bytes(buffer: &[u8]) -> Self {
        let mut word = [0_u8; 4];
        word.copy_from_slice(&buffer[0..4]);
        let refcount = u32::from_le_bytes(word);
        word.copy_from_slice(&buffer[4..8]);
        let size = u32::from_le_bytes(word);
        word.copy_from_slice(&buffer[8..12]);
        let csize = u32::from_le_bytes(word);
        Self {
            refcount,
            size,
            csize,
        }
    }
}

fn clamp_refcount(count: u64) -> u32 {
    if count > MAX_REFCOUNT as u64 {
        MAX_REFCOUNT
    } else {
        count as u32
    }
}

/// Aggregate statistics over a chunk index, reference counts applied.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChunkStats {
    /// Uncompressed bytes, counting each chunk once per reference.
    pub total_size: u64,
    /// Stored bytes, counting each chunk once per reference.
    pub total_csize: u64,
    /// Uncompressed bytes, counting each chunk once.
    pub unique_size: u64,
    /// Stored bytes, counting each chunk once.
    pub unique_csize: u64,
    /// Number of distinct chunks.
    pub total_unique_chunks: u64,
    /// Number of references across all chunks.
    pub total_chunks: u64,
}

/// Refcounted chunk bookkeeping over a [`HashIndex`] with 32 byte keys and
/// 12 byte values, persisted in the engine's single-file format.
pub struct ChunkIndex {
    index: HashIndex,
}

impl ChunkIndex {
    /// Create an empty chunk index at the minimum capacity.
    pub fn new() -> Result<Self, AllocError> {
        Self::with_capacity(0)
    }

    /// Create an empty chunk index sized for at least `capacity` chunks.
    pub fn with_capacity(capacity: usize) -> Result<Self, AllocError> {
        Ok(Self {
            index: HashIndex::with_capacity(capacity, CHUNK_ID_SIZE, ENTRY_SIZE)?,
        })
    }

    /// Load a chunk index from a file.  A well-formed index file whose cell
    /// widths belong to some other index kind is rejected.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, ReadIndexError> {
        let index = HashIndex::read(path)?;
        if index.key_size() != CHUNK_ID_SIZE {
            return Err(ReadIndexError::BadKeySize(index.key_size() as u8));
        }
        if index.value_size() != ENTRY_SIZE {
            return Err(ReadIndexError::BadValueSize(index.value_size() as u8));
        }
        Ok(Self { index })
    }

    /// Persist the chunk index to a file.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<(), WriteIndexError> {
        self.index.write(path)
    }

    /// Number of distinct chunks.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// True if no chunks are indexed.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Size in bytes of the persisted form.
    pub fn byte_size(&self) -> u64 {
        self.index.byte_size()
    }

    /// The entry for a chunk id, or None.
    pub fn get(&mut self, id: &ChunkId) -> Option<ChunkEntry> {
        self.index.get(id).map(ChunkEntry::from_bytes)
    }

    /// Insert or overwrite the entry for a chunk id.
    ///
    /// Panics if the refcount exceeds [`MAX_REFCOUNT`]; callers count
    /// references through [`ChunkIndex::add`] and
    /// [`ChunkIndex::increment_refcount`], which clamp.
    pub fn set(&mut self, id: &ChunkId, entry: ChunkEntry) -> Result<(), AllocError> {
        assert!(
            entry.refcount <= MAX_REFCOUNT,
            "chunk refcount above the storable maximum"
        );
        self.index.set(id, &entry.to_bytes())
    }

    /// True if the chunk id is indexed.
    pub fn contains(&mut self, id: &ChunkId) -> bool {
        self.index.contains(id)
    }

    /// Remove a chunk id.  Returns Ok(false) when it was absent.
    pub fn delete(&mut self, id: &ChunkId) -> Result<bool, AllocError> {
        self.index.delete(id)
    }

    /// Record `refcount` further references to a chunk.  A new chunk is
    /// inserted as given; for a known chunk the refcounts are summed with
    /// saturation and size/csize are replaced by the new values.
    pub fn add(
        &mut self,
        id: &ChunkId,
        refcount: u32,
        size: u32,
        csize: u32,
    ) -> Result<(), AllocError> {
        let refcount = match self.get(id) {
            Some(existing) => clamp_refcount(existing.refcount as u64 + refcount as u64),
            None => clamp_refcount(refcount as u64),
        };
        self.set(
            id,
            ChunkEntry {
                refcount,
                size,
                csize,
            },
        )
    }

    /// Add one reference to a known chunk and return the new refcount, or
    /// None when the chunk is absent.  A saturated refcount stays pinned.
    pub fn increment_refcount(&mut self, id: &ChunkId) -> Option<u32> {
        let value = self.index.get_mut(id)?;
        let mut entry = ChunkEntry::from_bytes(value);
        if entry.refcount < MAX_REFCOUNT {
            entry.refcount += 1;
        }
        value[0..4].copy_from_slice(&entry.refcount.to_le_bytes());
        Some(entry.refcount)
    }

    /// Drop one reference from a known chunk and return the new refcount, or
    /// None when the chunk is absent.  A saturated refcount stays pinned.
    ///
    /// Panics if the refcount is already zero.
    pub fn decrement_refcount(&mut self, id: &ChunkId) -> Option<u32> {
        let value = self.index.get_mut(id)?;
        let mut entry = ChunkEntry::from_bytes(value);
        assert!(entry.refcount > 0, "chunk refcount underflow");
        if entry.refcount != MAX_REFCOUNT {
            entry.refcount -= 1;
        }
        value[0..4].copy_from_slice(&entry.refcount.to_le_bytes());
        Some(entry.refcount)
    }

    /// Fold another chunk index into this one: every chunk of `other` is
    /// added, so shared chunks end up with the clamped sum of both refcounts
    /// and the sizes recorded by `other`.
    pub fn merge(&mut self, other: &ChunkIndex) -> Result<(), AllocError> {
        for (id, entry) in other.iter() {
            self.add(&id, entry.refcount, entry.size, entry.csize)?;
        }
        Ok(())
    }

    /// Aggregate sizes and counts over the whole index.
    pub fn summarize(&self) -> ChunkStats {
        let mut stats = ChunkStats::default();
        for (_, entry) in self.iter() {
            let refcount = entry.refcount as u64;
            stats.total_unique_chunks += 1;
            stats.total_chunks += refcount;
            stats.unique_size += entry.size as u64;
            stats.unique_csize += entry.csize as u64;
            stats.total_size += refcount * entry.size as u64;
            stats.total_csize += refcount * entry.csize as u64;
        }
        stats
    }

    /// Iterate the chunks in bucket order.
    pub fn iter(&self) -> ChunkIter<'_> {
        ChunkIter {
            inner: self.index.iter(),
        }
    }

    /// Drop every chunk and return to the minimum capacity.
    pub fn clear(&mut self) -> Result<(), AllocError> {
        self.index.clear()
    }
}

/// Iterator over `(chunk id, entry)` pairs of a [`ChunkIndex`].
pub struct ChunkIter<'a> {
    inner: IndexIter<'a>,
}

impl Iterator for ChunkIter<'_> {
    type Item = (ChunkId, ChunkEntry);

    fn next(&mut self) -> Option<Self::Item> {
        let (key, value) = self.inner.next()?;
        let mut id = [0_u8; CHUNK_ID_SIZE];
        id.copy_from_slice(key);
        Some((id, ChunkEntry::from_bytes(value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// Chunk id that depends on n, with the entropy the engine expects in
    /// the leading bytes.
    fn chunk_id(n: u32) -> ChunkId {
        let mut id = [0_u8; CHUNK_ID_SIZE];
        id[0..4].copy_from_slice(&n.wrapping_mul(2654435761).to_le_bytes());
        id[4..8].copy_from_slice(&n.to_le_bytes());
        id
    }

    fn entry(refcount: u32, size: u32, csize: u32) -> ChunkEntry {
        ChunkEntry {
            refcount,
            size,
            csize,
        }
    }

    #[test]
    fn test_set_get_delete() {
        let mut index = ChunkIndex::new().unwrap();
        assert_eq!(index.len(), 0);
        index.set(&chunk_id(1), entry(1, 100, 90)).unwrap();
        assert_eq!(index.get(&chunk_id(1)), Some(entry(1, 100, 90)));
        assert!(index.contains(&chunk_id(1)));
        assert!(!index.contains(&chunk_id(2)));
        assert!(index.delete(&chunk_id(1)).unwrap());
        assert!(!index.delete(&chunk_id(1)).unwrap());
        assert_eq!(index.get(&chunk_id(1)), None);
    }

    #[test]
    fn test_add() {
        let mut index = ChunkIndex::new().unwrap();
        index.add(&chunk_id(1), 5, 6, 7).unwrap();
        assert_eq!(index.get(&chunk_id(1)), Some(entry(5, 6, 7)));
        index.add(&chunk_id(1), 1, 2, 3).unwrap();
        assert_eq!(index.get(&chunk_id(1)), Some(entry(6, 2, 3)));
    }

    #[test]
    fn test_refcount_saturates_and_pins() {
        let mut index = ChunkIndex::new().unwrap();
        index.set(&chunk_id(1), entry(MAX_REFCOUNT - 1, 1, 2)).unwrap();
        // The first increment reaches the clamp; nothing moves it after.
        for _ in 0..5 {
            assert_eq!(index.increment_refcount(&chunk_id(1)), Some(MAX_REFCOUNT));
        }
        for _ in 0..5 {
            assert_eq!(index.decrement_refcount(&chunk_id(1)), Some(MAX_REFCOUNT));
        }
    }

    #[test]
    fn test_increment_decrement() {
        let mut index = ChunkIndex::new().unwrap();
        index.add(&chunk_id(1), 5, 6, 7).unwrap();
        assert_eq!(index.increment_refcount(&chunk_id(1)), Some(6));
        assert_eq!(index.get(&chunk_id(1)), Some(entry(6, 6, 7)));
        assert_eq!(index.decrement_refcount(&chunk_id(1)), Some(5));
        assert_eq!(index.get(&chunk_id(1)), Some(entry(5, 6, 7)));
        assert_eq!(index.increment_refcount(&chunk_id(9)), None);
        assert_eq!(index.decrement_refcount(&chunk_id(9)), None);
    }

    #[test]
    #[should_panic(expected = "chunk refcount underflow")]
    fn test_decrement_zero_refcount() {
        let mut index = ChunkIndex::new().unwrap();
        index.set(&chunk_id(1), entry(0, 0, 0)).unwrap();
        index.decrement_refcount(&chunk_id(1));
    }

    #[test]
    #[should_panic(expected = "above the storable maximum")]
    fn test_set_rejects_oversized_refcount() {
        let mut index = ChunkIndex::new().unwrap();
        index
            .set(&chunk_id(1), entry(MAX_REFCOUNT + 1, 0, 0))
            .unwrap();
    }

    #[test]
    fn test_merge() {
        let mut first = ChunkIndex::new().unwrap();
        first.set(&chunk_id(1), entry(1, 100, 100)).unwrap();
        first.set(&chunk_id(2), entry(2, 200, 200)).unwrap();
        first.set(&chunk_id(3), entry(3, 300, 300)).unwrap();
        let mut second = ChunkIndex::new().unwrap();
        second.set(&chunk_id(1), entry(4, 100, 100)).unwrap();
        second.set(&chunk_id(2), entry(5, 200, 200)).unwrap();
        second.set(&chunk_id(4), entry(6, 400, 400)).unwrap();

        first.merge(&second).unwrap();
        assert_eq!(first.get(&chunk_id(1)), Some(entry(5, 100, 100)));
        assert_eq!(first.get(&chunk_id(2)), Some(entry(7, 200, 200)));
        assert_eq!(first.get(&chunk_id(3)), Some(entry(3, 300, 300)));
        assert_eq!(first.get(&chunk_id(4)), Some(entry(6, 400, 400)));
        assert_eq!(first.len(), 4);
    }

    fn merged_refcount(a: u32, b: u32) -> u32 {
        let merge = |x: u32, y: u32| {
            let mut first = ChunkIndex::new().unwrap();
            first.set(&chunk_id(1), entry(x, 1, 2)).unwrap();
            let mut second = ChunkIndex::new().unwrap();
            second.set(&chunk_id(1), entry(y, 1, 2)).unwrap();
            first.merge(&second).unwrap();
            first.get(&chunk_id(1)).unwrap().refcount
        };
        let result = merge(a, b);
        assert_eq!(result, merge(b, a));
        result
    }

    #[test]
    fn test_merge_refcount_clamp() {
        let half = MAX_REFCOUNT / 2;
        // Just below, exactly at, and beyond the clamp.
        assert_eq!(merged_refcount(half, half), MAX_REFCOUNT - 1);
        assert_eq!(merged_refcount(half + 1, half), MAX_REFCOUNT);
        assert_eq!(merged_refcount(half + 2, half), MAX_REFCOUNT);
        assert_eq!(merged_refcount(half + 1, half + 1), MAX_REFCOUNT);
        assert_eq!(merged_refcount(3_000_000_000, 2_000_000_000), MAX_REFCOUNT);
    }

    #[test]
    fn test_summarize() {
        let mut index = ChunkIndex::new().unwrap();
        index.set(&chunk_id(1), entry(1, 1000, 100)).unwrap();
        index.set(&chunk_id(2), entry(2, 2000, 200)).unwrap();
        index.set(&chunk_id(3), entry(3, 3000, 300)).unwrap();

        let stats = index.summarize();
        assert_eq!(stats.total_size, 1000 + 2 * 2000 + 3 * 3000);
        assert_eq!(stats.total_csize, 100 + 2 * 200 + 3 * 300);
        assert_eq!(stats.unique_size, 6000);
        assert_eq!(stats.unique_csize, 600);
        assert_eq!(stats.total_chunks, 6);
        assert_eq!(stats.total_unique_chunks, 3);
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chunks.idx");
        let mut index = ChunkIndex::new().unwrap();
        for n in 0..500 {
            index.add(&chunk_id(n), 1 + n % 3, n * 10, n * 4).unwrap();
        }
        index.write(&path).unwrap();

        let mut index = ChunkIndex::read(&path).unwrap();
        assert_eq!(index.len(), 500);
        for n in 0..500 {
            assert_eq!(index.get(&chunk_id(n)), Some(entry(1 + n % 3, n * 10, n * 4)));
        }
    }

    #[test]
    fn test_read_rejects_other_cell_widths() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("other.idx");
        let index = HashIndex::new(16, 8).unwrap();
        index.write(&path).unwrap();
        assert!(matches!(
            ChunkIndex::read(&path),
            Err(ReadIndexError::BadKeySize(16))
        ));
    }

    #[test]
    fn test_clear() {
        let mut index = ChunkIndex::new().unwrap();
        for n in 0..100 {
            index.add(&chunk_id(n), 1, 1, 1).unwrap();
        }
        index.clear().unwrap();
        assert!(index.is_empty());
        assert_eq!(index.iter().count(), 0);
    }
}
