use core::mem;
use std::time::Duration;

use static_assertions::const_assert_eq;

/// Size of one block device sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Sector number denoting "no sector".
pub const SECTOR_NONE: u32 = u32::MAX;

/// Number of slots in the buffer cache.
pub const NBUF: usize = 64;

/// Direct entries in an on-disk inode.
pub const NDIRECT: usize = 122;

/// Sector numbers held by one index sector.
pub const NINDIRECT: usize = SECTOR_SIZE / mem::size_of::<u32>();

/// Usable entries of the double-indirect index sector.
pub const NDINDIRECT: usize = 127;

/// Data entries permitted in the final second-level index sector.
pub const NDLAST: usize = 6;

/// Largest number of data sectors one file can reach.
pub const MAXFILE_SECTORS: usize = NDIRECT + NINDIRECT + (NDINDIRECT - 1) * NINDIRECT + NDLAST;

/// Per-file size limit in bytes.
pub const MAXFILE: usize = 8 * 1024 * 1024;

/// Identifies an inode sector.
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// Default period of the background write-behind task.
pub const WRITE_BEHIND_INTERVAL: Duration = Duration::from_secs(100);

// The index must address the whole of an 8 MiB file and nothing more.
const_assert_eq!(NINDIRECT, 128);
const_assert_eq!(MAXFILE_SECTORS, 16384);
const_assert_eq!(MAXFILE_SECTORS * SECTOR_SIZE, MAXFILE);
