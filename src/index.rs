//! Main module for the hash index engine.  This implements the memory
//! resident table itself: linear probing with robin-hood displacement and
//! tombstone deletes, load triggered resizing along the fixed capacity
//! sequence, and the single-file persistence format.
//!
//! The engine stores raw fixed width keys and values.  It applies no hash of
//! its own; the bucket for a key is the key's first four bytes read as a
//! little-endian word, reduced modulo the bucket count.  Callers therefore
//! supply keys that are already well distributed, such as prefixes of
//! cryptographic digests.

use crate::error::{AllocError, ReadIndexError, WriteIndexError};
use crate::index::buckets::{value_collides_with_tags, BucketArray};
use crate::index::header::{
    IndexHeader, HEADER_SIZE, MAX_KEY_SIZE, MAX_VALUE_SIZE, MIN_KEY_SIZE, MIN_VALUE_SIZE,
};
use crate::iter::IndexIter;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::mem;
use std::path::Path;

pub mod buckets;
pub mod header;
pub mod sizes;

/// Outcome of probing for a key.
enum Slot {
    /// The key is live in this bucket.
    Occupied(usize),
    /// The key is absent; probing ended this many buckets past the ideal
    /// index.  An insert may continue from here instead of re-probing.
    Vacant { offset: usize },
}

/// A memory-resident hash index of fixed width binary keys and values,
/// loadable from and flushable to a compact single-file format.
///
/// An index is exclusively owned by its caller; operations never block and
/// never run concurrently with each other on one instance.
pub struct HashIndex {
    store: BucketArray,
    num_entries: usize,
    lower_limit: usize,
    upper_limit: usize,
    // Entry sized scratch kept on the instance so inserts do not allocate.
    scratch: Vec<u8>,
}

impl HashIndex {
    /// Create an empty index at the minimum capacity.
    ///
    /// Panics if `key_size` or `value_size` is outside 4..=127.  The four
    /// byte floors come from the hash reading a key prefix and the state
    /// tags living in the leading value word.
    pub fn new(key_size: usize, value_size: usize) -> Result<Self, AllocError> {
        Self::with_capacity(0, key_size, value_size)
    }

    /// Create an empty index sized for at least `capacity` entries, at the
    /// smallest permissible bucket count that fits.
    ///
    /// Panics under the same conditions as [`HashIndex::new`].
    pub fn with_capacity(
        capacity: usize,
        key_size: usize,
        value_size: usize,
    ) -> Result<Self, AllocError> {
        assert!(
            (MIN_KEY_SIZE..=MAX_KEY_SIZE).contains(&key_size),
            "invalid key size {}, must be in 4..=127",
            key_size
        );
        assert!(
            (MIN_VALUE_SIZE..=MAX_VALUE_SIZE).contains(&value_size),
            "invalid value size {}, must be in 4..=127",
            value_size
        );
        let capacity = capacity.min(u32::MAX as usize) as u32;
        let num_buckets = sizes::fit_size(capacity) as usize;
        let store = match BucketArray::alloc(num_buckets, key_size, value_size) {
            Ok(store) => store,
            Err(e) => {
                log::error!("hashindex: allocating {} buckets failed ({})", num_buckets, e);
                return Err(e);
            }
        };
        Ok(Self {
            store,
            num_entries: 0,
            lower_limit: sizes::lower_limit(num_buckets as u32) as usize,
            upper_limit: sizes::upper_limit(num_buckets as u32) as usize,
            scratch: Vec::new(),
        })
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.num_entries
    }

    /// True if the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }

    /// Current bucket count; always a member of the capacity sequence for
    /// indexes built through this API.
    pub fn num_buckets(&self) -> usize {
        self.store.num_buckets()
    }

    /// Width in bytes of every key.
    pub fn key_size(&self) -> usize {
        self.store.key_size()
    }

    /// Width in bytes of every value.
    pub fn value_size(&self) -> usize {
        self.store.value_size()
    }

    /// Size in bytes of the persisted form: header plus bucket region.
    pub fn byte_size(&self) -> u64 {
        HEADER_SIZE as u64 + self.store.as_bytes().len() as u64
    }

    /// The bucket a key would ideally land in.
    fn ideal_index(&self, key: &[u8]) -> usize {
        let mut word = [0_u8; 4];
        word.copy_from_slice(&key[0..4]);
        u32::from_le_bytes(word) as usize % self.store.num_buckets()
    }

    /// Wrap-around distance from a bucket back to an ideal index.
    fn probe_distance(num_buckets: usize, current: usize, ideal: usize) -> usize {
        if current >= ideal {
            current - ideal
        } else {
            current + num_buckets - ideal
        }
    }

    /// Probe for key.  On a hit that walked past a tombstone the entry is
    /// moved onto the first tombstone seen and the old bucket becomes the
    /// tombstone, shortening the chain for the next probe of the same key.
    ///
    /// The probe ends at the first never-occupied bucket: every entry was
    /// planted on a path of occupied cells from its ideal index, and deletes
    /// leave tombstones rather than gaps, so a hole proves absence.
    fn lookup(&mut self, key: &[u8]) -> Slot {
        let num_buckets = self.store.num_buckets();
        let start = self.ideal_index(key);
        let mut tombstone = None;
        let mut idx = start;
        let mut offset = 0;
        loop {
            if self.store.is_empty(idx) {
                return Slot::Vacant { offset };
            }
            if self.store.is_deleted(idx) {
                if tombstone.is_none() {
                    tombstone = Some(idx);
                }
            } else if self.store.key(idx) == key {
                if let Some(didx) = tombstone {
                    self.store.move_bucket(idx, didx);
                    self.store.mark_deleted(idx);
                    return Slot::Occupied(didx);
                }
                return Slot::Occupied(idx);
            }
            idx = (idx + 1) % num_buckets;
            if idx == start {
                return Slot::Vacant { offset };
            }
            offset += 1;
        }
    }

    /// Immutable view of the value stored for key, or None.
    ///
    /// Takes `&mut self` because a hit may compact the entry onto an earlier
    /// tombstone.
    pub fn get(&mut self, key: &[u8]) -> Option<&[u8]> {
        debug_assert_eq!(key.len(), self.key_size());
        match self.lookup(key) {
            Slot::Occupied(idx) => Some(self.store.value(idx)),
            Slot::Vacant { .. } => None,
        }
    }

    /// Mutable view of the value stored for key, or None.  The rewritten
    /// value must keep its leading word clear of the reserved tag patterns.
    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut [u8]> {
        debug_assert_eq!(key.len(), self.key_size());
        match self.lookup(key) {
            Slot::Occupied(idx) => Some(self.store.value_mut(idx)),
            Slot::Vacant { .. } => None,
        }
    }

    /// True if key is live in the index.
    pub fn contains(&mut self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Insert or overwrite the entry for key.
    ///
    /// Fails only when the insert pushes the load past the upper limit and
    /// the grown bucket region cannot be allocated; the index is unchanged
    /// in that case.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), AllocError> {
        debug_assert_eq!(key.len(), self.key_size());
        debug_assert_eq!(value.len(), self.value_size());
        debug_assert!(
            !value_collides_with_tags(value),
            "value collides with a reserved bucket tag"
        );
        match self.lookup(key) {
            Slot::Occupied(idx) => {
                self.store.value_mut(idx).copy_from_slice(value);
                Ok(())
            }
            Slot::Vacant { mut offset } => {
                if self.num_entries > self.upper_limit {
                    self.grow()?;
                    offset = 0;
                }
                let num_buckets = self.store.num_buckets();
                let mut idx = (self.ideal_index(key) + offset) % num_buckets;
                let mut entry = mem::take(&mut self.scratch);
                entry.clear();
                entry.extend_from_slice(key);
                entry.extend_from_slice(value);
                while self.store.is_live(idx) {
                    let occupant_ideal = self.ideal_index(self.store.key(idx));
                    let other = Self::probe_distance(num_buckets, idx, occupant_ideal);
                    if other < offset {
                        // Rob from the entry closer to home; it can afford
                        // the longer probe we are carrying.
                        self.store.swap_with(idx, &mut entry);
                        offset = other;
                    }
                    offset += 1;
                    idx = (idx + 1) % num_buckets;
                }
                self.store.bucket_mut(idx).copy_from_slice(&entry);
                self.num_entries += 1;
                self.scratch = entry;
                Ok(())
            }
        }
    }

    /// Remove the entry for key, leaving a tombstone.  Returns Ok(false)
    /// when the key was already absent.
    ///
    /// Fails only when the delete drops the load below the lower limit and
    /// the shrunk bucket region cannot be allocated.  The entry is gone
    /// regardless; the still-valid table retries the shrink on a later
    /// delete.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool, AllocError> {
        debug_assert_eq!(key.len(), self.key_size());
        match self.lookup(key) {
            Slot::Vacant { .. } => Ok(false),
            Slot::Occupied(idx) => {
                self.store.mark_deleted(idx);
                self.num_entries -= 1;
                if self.num_entries < self.lower_limit {
                    self.shrink()?;
                }
                Ok(true)
            }
        }
    }

    /// Drop every entry and return to the minimum capacity.
    pub fn clear(&mut self) -> Result<(), AllocError> {
        *self = Self::with_capacity(0, self.key_size(), self.value_size())?;
        Ok(())
    }

    fn grow(&mut self) -> Result<(), AllocError> {
        self.resize(sizes::grow_size(self.store.num_buckets() as u32))
    }

    fn shrink(&mut self) -> Result<(), AllocError> {
        self.resize(sizes::shrink_size(self.store.num_buckets() as u32))
    }

    /// Rebuild the table at capacity by re-inserting every live entry into a
    /// fresh bucket region, then swap the fresh region in.  Tombstones are
    /// not carried over.  On failure the index is untouched.
    fn resize(&mut self, capacity: u32) -> Result<(), AllocError> {
        let mut fresh = Self::with_capacity(capacity as usize, self.key_size(), self.value_size())?;
        let mut cursor = 0;
        while let Some(idx) = self.store.next_live(cursor) {
            fresh.set(self.store.key(idx), self.store.value(idx))?;
            cursor = idx + 1;
        }
        debug_assert_eq!(fresh.num_entries, self.num_entries);
        self.store = fresh.store;
        self.lower_limit = fresh.lower_limit;
        self.upper_limit = fresh.upper_limit;
        Ok(())
    }

    /// Iterate the live entries in bucket order.
    pub fn iter(&self) -> IndexIter<'_> {
        self.iter_from(0)
    }

    /// Iterate the live entries at or after the given bucket cursor.  A
    /// cursor saved from [`IndexIter::cursor`] resumes where the previous
    /// iteration stopped; mutating the index in between invalidates it.
    pub fn iter_from(&self, cursor: usize) -> IndexIter<'_> {
        IndexIter::new(&self.store, cursor)
    }

    /// Load an index from a file, logging the cause on failure.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, ReadIndexError> {
        let path = path.as_ref();
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) => {
                log::error!("hashindex: {}: open for reading failed ({})", path.display(), e);
                return Err(ReadIndexError::IO(e));
            }
        };
        Self::read_from(&mut file).map_err(|err| {
            log::error!("hashindex: {}: {}", path.display(), err);
            err
        })
    }

    /// Decode an index from any seekable byte source.
    ///
    /// The source must hold exactly one persisted index: the magic is
    /// checked, the cell widths validated and the total length compared
    /// against the header arithmetic before any state is built.
    pub fn read_from<R: Read + Seek>(source: &mut R) -> Result<Self, ReadIndexError> {
        let header = IndexHeader::load_header(source)?;
        let bucket_size = (header.key_size as u64) + (header.value_size as u64);
        let buckets_len = header.num_buckets as u64 * bucket_size;
        let expected = HEADER_SIZE as u64 + buckets_len;
        let actual = source.seek(SeekFrom::End(0))?;
        if actual != expected {
            return Err(ReadIndexError::LengthMismatch { expected, actual });
        }
        source.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        let mut data = Vec::new();
        data.try_reserve_exact(buckets_len as usize)
            .map_err(AllocError::from)?;
        data.resize(buckets_len as usize, 0);
        source.read_exact(&mut data)?;
        let num_buckets = header.num_buckets as usize;
        Ok(Self {
            store: BucketArray::from_parts(
                data,
                num_buckets,
                header.key_size as usize,
                header.value_size as usize,
            ),
            num_entries: header.num_entries as usize,
            lower_limit: sizes::lower_limit(header.num_buckets) as usize,
            upper_limit: sizes::upper_limit(header.num_buckets) as usize,
            scratch: Vec::new(),
        })
    }

    /// Persist the index to a file, logging the cause on failure.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<(), WriteIndexError> {
        let path = path.as_ref();
        let mut file = match File::create(path) {
            Ok(file) => file,
            Err(e) => {
                log::error!("hashindex: {}: open for writing failed ({})", path.display(), e);
                return Err(WriteIndexError::Create(e));
            }
        };
        self.write_to(&mut file).map_err(|err| {
            log::error!("hashindex: {}: {}", path.display(), err);
            err
        })
    }

    /// Encode the index into any byte sink: packed header, then the raw
    /// bucket region.  Tombstones and empty cells are persisted verbatim so
    /// that a load restores the exact table state.
    pub fn write_to<W: Write>(&self, sink: &mut W) -> Result<(), WriteIndexError> {
        let header = IndexHeader {
            num_entries: self.num_entries as u32,
            num_buckets: self.store.num_buckets() as u32,
            key_size: self.key_size() as u8,
            value_size: self.value_size() as u8,
        };
        header.write_header(sink).map_err(WriteIndexError::Write)?;
        sink.write_all(self.store.as_bytes())
            .map_err(WriteIndexError::Write)?;
        Ok(())
    }
}
