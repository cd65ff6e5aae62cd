//! The bucket region: a single contiguous allocation of fixed width cells,
//! each holding key bytes followed by value bytes.  A cell that is not live
//! encodes its state in the first four value bytes, so the region needs no
//! side metadata and round-trips to disk as raw bytes.

use crate::error::AllocError;

/// State tag of a never occupied cell, little-endian in the value region.
pub(crate) const TAG_EMPTY: u32 = 0xffff_ffff;
/// State tag of a tombstone.
pub(crate) const TAG_DELETED: u32 = 0xffff_fffe;

/// True if the leading value word collides with one of the reserved tags.
/// Callers must never store such a value; they widen the value type or bias
/// the stored quantity instead.
pub(crate) fn value_collides_with_tags(value: &[u8]) -> bool {
    let mut word = [0_u8; 4];
    word.copy_from_slice(&value[0..4]);
    matches!(u32::from_le_bytes(word), TAG_EMPTY | TAG_DELETED)
}

/// Fixed width cells in array-of-structs layout, the same layout the on-disk
/// format uses.  Indices are assumed valid; the probe engine has already
/// reduced them modulo the bucket count.
#[derive(Debug)]
pub(crate) struct BucketArray {
    data: Vec<u8>,
    num_buckets: usize,
    key_size: usize,
    value_size: usize,
    bucket_size: usize,
}

impl BucketArray {
    /// Allocate a region of num_buckets cells, all marked empty.
    /// Allocation failure is reported, not aborted on.
    pub fn alloc(
        num_buckets: usize,
        key_size: usize,
        value_size: usize,
    ) -> Result<Self, AllocError> {
        let bucket_size = key_size + value_size;
        let region_len = num_buckets * bucket_size;
        let mut data = Vec::new();
        data.try_reserve_exact(region_len)?;
        data.resize(region_len, 0);
        let mut buckets = Self {
            data,
            num_buckets,
            key_size,
            value_size,
            bucket_size,
        };
        for idx in 0..num_buckets {
            buckets.mark_empty(idx);
        }
        Ok(buckets)
    }

    /// Wrap a region read back from disk.  The caller has verified that
    /// data holds exactly num_buckets cells.
    pub fn from_parts(
        data: Vec<u8>,
        num_buckets: usize,
        key_size: usize,
        value_size: usize,
    ) -> Self {
        debug_assert_eq!(data.len(), num_buckets * (key_size + value_size));
        Self {
            data,
            num_buckets,
            key_size,
            value_size,
            bucket_size: key_size + value_size,
        }
    }

    fn offset(&self, idx: usize) -> usize {
        idx * self.bucket_size
    }

    pub fn num_buckets(&self) -> usize {
        self.num_buckets
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    pub fn value_size(&self) -> usize {
        self.value_size
    }

    /// The raw region, header-less, exactly as persisted.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn key(&self, idx: usize) -> &[u8] {
        let off = self.offset(idx);
        &self.data[off..off + self.key_size]
    }

    pub fn value(&self, idx: usize) -> &[u8] {
        let off = self.offset(idx) + self.key_size;
        &self.data[off..off + self.value_size]
    }

    pub fn value_mut(&mut self, idx: usize) -> &mut [u8] {
        let off = self.offset(idx) + self.key_size;
        &mut self.data[off..off + self.value_size]
    }

    /// The whole cell, key and value bytes together.
    pub fn bucket_mut(&mut self, idx: usize) -> &mut [u8] {
        let off = self.offset(idx);
        &mut self.data[off..off + self.bucket_size]
    }

    fn tag(&self, idx: usize) -> u32 {
        let off = self.offset(idx) + self.key_size;
        let mut word = [0_u8; 4];
        word.copy_from_slice(&self.data[off..off + 4]);
        u32::from_le_bytes(word)
    }

    fn set_tag(&mut self, idx: usize, tag: u32) {
        let off = self.offset(idx) + self.key_size;
        self.data[off..off + 4].copy_from_slice(&tag.to_le_bytes());
    }

    pub fn is_empty(&self, idx: usize) -> bool {
        self.tag(idx) == TAG_EMPTY
    }

    pub fn is_deleted(&self, idx: usize) -> bool {
        self.tag(idx) == TAG_DELETED
    }

    pub fn is_live(&self, idx: usize) -> bool {
        !matches!(self.tag(idx), TAG_EMPTY | TAG_DELETED)
    }

    pub fn mark_empty(&mut self, idx: usize) {
        self.set_tag(idx, TAG_EMPTY);
    }

    pub fn mark_deleted(&mut self, idx: usize) {
        self.set_tag(idx, TAG_DELETED);
    }

    /// Copy the cell at from over the cell at to.  The source cell keeps its
    /// bytes; callers mark it deleted when they are moving an entry.
    pub fn move_bucket(&mut self, from: usize, to: usize) {
        let src = self.offset(from);
        let dst = self.offset(to);
        self.data.copy_within(src..src + self.bucket_size, dst);
    }

    /// Exchange the cell at idx with an entry-sized scratch buffer.
    pub fn swap_with(&mut self, idx: usize, entry: &mut [u8]) {
        let off = self.offset(idx);
        entry.swap_with_slice(&mut self.data[off..off + self.bucket_size]);
    }

    /// First live cell at or after from, scanning to the end of the region.
    pub fn next_live(&self, from: usize) -> Option<usize> {
        let mut idx = from;
        while idx < self.num_buckets {
            if self.is_live(idx) {
                return Some(idx);
            }
            idx += 1;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_array() -> BucketArray {
        BucketArray::alloc(8, 4, 8).unwrap()
    }

    #[test]
    fn test_fresh_region_is_all_empty() {
        let buckets = small_array();
        for idx in 0..8 {
            assert!(buckets.is_empty(idx));
            assert!(!buckets.is_deleted(idx));
            assert!(!buckets.is_live(idx));
        }
        assert!(buckets.next_live(0).is_none());
        assert_eq!(buckets.as_bytes().len(), 8 * 12);
    }

    #[test]
    fn test_cell_states() {
        let mut buckets = small_array();
        buckets.bucket_mut(3).copy_from_slice(b"keyAvalue678");
        assert!(buckets.is_live(3));
        assert_eq!(buckets.key(3), b"keyA");
        assert_eq!(buckets.value(3), b"value678");
        assert_eq!(buckets.next_live(0), Some(3));
        assert_eq!(buckets.next_live(4), None);

        buckets.mark_deleted(3);
        assert!(buckets.is_deleted(3));
        assert!(!buckets.is_live(3));
        // The key bytes survive a delete, only the tag word changes.
        assert_eq!(buckets.key(3), b"keyA");
    }

    #[test]
    fn test_move_and_swap() {
        let mut buckets = small_array();
        buckets.bucket_mut(5).copy_from_slice(b"keyBvalue123");
        buckets.move_bucket(5, 1);
        assert_eq!(buckets.key(1), b"keyB");
        assert!(buckets.is_live(5));

        let mut entry = b"keyCvalue456".to_vec();
        buckets.swap_with(1, &mut entry);
        assert_eq!(entry, b"keyBvalue123");
        assert_eq!(buckets.key(1), b"keyC");
    }

    #[test]
    fn test_reserved_values() {
        assert!(value_collides_with_tags(&0xffff_ffff_u32.to_le_bytes()));
        assert!(value_collides_with_tags(&0xffff_fffe_u32.to_le_bytes()));
        assert!(!value_collides_with_tags(&0xffff_fffd_u32.to_le_bytes()));
        assert!(!value_collides_with_tags(&0_u32.to_le_bytes()));
    }
}
