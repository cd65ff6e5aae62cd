#![deny(missing_docs)]

//! Memory-resident, file-persistable hash index for deduplicating archive
//! backups.  Maps fixed width binary keys (chunk ids, manifest ids, segment
//! metadata keys) to fixed width binary values in one open-addressed table
//! that loads from and flushes to a compact single-file format: an 18 byte
//! packed header behind the magic `BORG_IDX`, then the raw bucket array,
//! everything little-endian.
//!
//! The table probes linearly with robin-hood displacement and deletes by
//! tombstone, growing and shrinking along a fixed sequence of near-prime
//! capacities.  Keys are expected to already be well distributed (prefixes
//! of cryptographic digests); the bucket hash is simply the first four key
//! bytes.  A bucket's state lives in the first four bytes of its value
//! region, so values whose leading little-endian word would be `0xffffffff`
//! or `0xfffffffe` cannot be stored as-is; callers encode around the two
//! reserved patterns (the chunk layer clamps its refcounts well below them).
//!
//! An index is exclusively owned by its caller and everything is single
//! threaded; two distinct indexes are fully independent.  Failed operations
//! log one diagnostic line through the `log` facade, prefixed `hashindex:`,
//! and return an error.

pub mod chunks;
pub mod error;
pub mod index;
pub mod iter;
