//! File storage core of a small teaching operating system: an indexed inode
//! layer over a write-back block buffer cache.
//!
//! Layers, bottom up:
//!  + Device: sector-granular reads and writes (`BlockDevice`, `MemDisk`).
//!  + Free map: one allocation bit per sector (`FreeMap`).
//!  + Buffer cache: `NBUF` cached sectors with second-chance eviction and a
//!    periodic write-behind task (`Bcache`, `WriteBehind`).
//!  + Inodes: files growing on demand up to 8 MiB, addressed through
//!    direct, indirect, and double-indirect index sectors (`Inode`, the
//!    file operations on `FileSys`).
//!
//! Directory and system-call layers sit above this crate and consume the
//! file API by inode sector number. This crate installs no logger; it emits
//! through the `log` facade.

#![deny(rust_2018_idioms)]

mod bio;
mod device;
mod freemap;
mod inode;
pub mod param;

use std::sync::Arc;
use std::time::Duration;

pub use crate::bio::{Bcache, Buf, WriteBehind};
pub use crate::device::{BlockDevice, MemDisk};
pub use crate::freemap::FreeMap;
pub use crate::inode::{Dinode, Inode, RcInode};

use crate::inode::Itable;

/// Why a file operation could not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The free map has no run of the requested size.
    OutOfSpace,
    /// The requested length exceeds the 8 MiB per-file limit.
    TooLarge,
}

/// The mounted file system: the buffer cache, the free-sector map, and the
/// table of open inodes. Created once at mount and shared by the layers
/// above; there is no global state. Mounting also starts the periodic
/// write-behind task, and dropping the `FileSys` stops it again.
pub struct FileSys {
    pub(crate) bcache: Arc<Bcache>,
    pub(crate) freemap: FreeMap,
    pub(crate) itable: Itable,
    _write_behind: WriteBehind,
}

impl FileSys {
    /// Mounts a file system over `dev`, which holds `nsectors` sectors.
    pub fn new(dev: Arc<dyn BlockDevice>, nsectors: u32) -> Self {
        Self::with_write_behind(dev, nsectors, param::WRITE_BEHIND_INTERVAL)
    }

    /// Like `new`, with a custom write-behind period.
    pub fn with_write_behind(
        dev: Arc<dyn BlockDevice>,
        nsectors: u32,
        interval: Duration,
    ) -> Self {
        let bcache = Arc::new(Bcache::new(dev));
        let write_behind = WriteBehind::spawn(Arc::clone(&bcache), interval);
        Self {
            bcache,
            freemap: FreeMap::new(nsectors),
            itable: Itable::new(),
            _write_behind: write_behind,
        }
    }

    /// The free-sector map. The directory layer reserves inode sectors
    /// here before calling `create`.
    pub fn freemap(&self) -> &FreeMap {
        &self.freemap
    }

    /// The buffer cache.
    pub fn bcache(&self) -> &Arc<Bcache> {
        &self.bcache
    }

    /// Writes every dirty cached sector to the device. Called at unmount;
    /// closing an inode does not flush by itself.
    pub fn flush_all(&self) {
        self.bcache.flush_all();
    }
}

#[cfg(test)]
pub(crate) mod helpers {
    use super::*;

    /// A file system over a fresh in-memory disk of `nsectors` sectors.
    pub(crate) fn fs(nsectors: u32) -> FileSys {
        FileSys::new(Arc::new(MemDisk::new(nsectors)), nsectors)
    }
}
