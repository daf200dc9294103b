//! Inodes.
//!
//! An inode describes a single unnamed file. The on-disk inode occupies one
//! sector and holds the file's byte length, a directory flag, and the map
//! from file blocks to device sectors: `NDIRECT` direct entries, one
//! indirect index sector covering the next `NINDIRECT` blocks, and one
//! double-indirect index sector whose entries each name a further index
//! sector. The last usable entry of the double-indirect sector maps only
//! `NDLAST` blocks, which caps a file at exactly 8 MiB.
//!
//! The file system keeps a table of open inodes in memory so that opening
//! the same sector twice yields the same handle. A handle counts its
//! openers; `remove` only marks the inode, and the sectors are returned to
//! the free map when the last opener closes.
//!
//! All on-disk state, the inode sector and every index sector included, is
//! read and written through the buffer cache. The byte length cached in the
//! handle can lag the on-disk inode while an extension is in flight, so
//! length queries always go back through the cache.
//!
//! Growing a file allocates the missing data sectors one by one, recording
//! each index entry through the cache as it goes. If the free map runs dry
//! while populating a brand-new inode, everything handed out so far is
//! released again. If it runs dry while extending a nonempty inode, the
//! already-extended part is kept but the length is not advanced, so the new
//! sectors stay unreachable.

use std::cmp;
use std::sync::{Arc, Mutex};

use core::mem;

use log::debug;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::param::{
    INODE_MAGIC, MAXFILE, MAXFILE_SECTORS, NDIRECT, NDINDIRECT, NDLAST, NINDIRECT, SECTOR_NONE,
    SECTOR_SIZE,
};
use crate::{Error, FileSys};

/// On-disk inode. Must be exactly one sector long.
#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes)]
pub struct Dinode {
    /// Sector holding this inode, its stable identity.
    pub self_sector: u32,
    /// Must be `INODE_MAGIC`.
    pub magic: u32,
    /// File size in bytes.
    pub length: i32,
    /// Nonzero for directories.
    pub is_dir: i32,
    /// Sectors of the first `NDIRECT` file blocks.
    pub direct: [u32; NDIRECT],
    /// Index sector covering the next `NINDIRECT` file blocks.
    pub indirect: u32,
    /// Index sector whose entries name second-level index sectors.
    pub double_indirect: u32,
}

const_assert_eq!(mem::size_of::<Dinode>(), SECTOR_SIZE);

/// An index sector: `NINDIRECT` sector numbers. Unused entries hold
/// `SECTOR_NONE`.
#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes)]
struct IndexBlock {
    entries: [u32; NINDIRECT],
}

const_assert_eq!(mem::size_of::<IndexBlock>(), SECTOR_SIZE);

impl Dinode {
    fn new(self_sector: u32, is_dir: bool) -> Self {
        Self {
            self_sector,
            magic: INODE_MAGIC,
            length: 0,
            is_dir: is_dir as i32,
            direct: [SECTOR_NONE; NDIRECT],
            indirect: SECTOR_NONE,
            double_indirect: SECTOR_NONE,
        }
    }
}

/// Number of sectors needed to hold `bytes` bytes.
fn bytes_to_sectors(bytes: u32) -> u32 {
    (bytes + SECTOR_SIZE as u32 - 1) / SECTOR_SIZE as u32
}

/// How a count of reachable data sectors spreads across the index: direct
/// entries, indirect entries, second-level index sectors under the
/// double-indirect sector, and entries in the last of those.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct SectorCounts {
    direct: usize,
    indirect: usize,
    dblocks: usize,
    in_last: usize,
}

fn sectors_divide(n: usize) -> SectorCounts {
    let direct = cmp::min(n, NDIRECT);
    let rest = n - direct;
    let indirect = cmp::min(rest, NINDIRECT);
    let rest = rest - indirect;
    let dblocks = (rest + NINDIRECT - 1) / NINDIRECT;
    let in_last = if rest == 0 { 0 } else { rest - (dblocks - 1) * NINDIRECT };
    debug_assert!(dblocks <= NDINDIRECT);
    SectorCounts { direct, indirect, dblocks, in_last }
}

/// In-memory handle for an open inode.
pub struct Inode {
    sector: u32,
    /// Serializes file extension; held across a whole `write_at`.
    extend: Mutex<()>,
    inner: Mutex<InodeInner>,
}

struct InodeInner {
    /// Number of openers; the handle is reclaimed when this reaches zero.
    open_cnt: u32,
    /// 0: writes ok, >0: writes denied.
    deny_write_cnt: u32,
    /// Set by `remove`; reclamation is deferred to the last close.
    removed: bool,
    /// Cached byte length; may lag the on-disk inode during an extension.
    length: i32,
    is_dir: bool,
    /// Directory scan cursor. Unused for regular files.
    pos: u32,
}

/// A shared reference to an open inode.
pub type RcInode = Arc<Inode>;

impl Inode {
    /// Sector number holding this inode, its stable identity.
    pub fn inumber(&self) -> u32 {
        self.sector
    }

    pub fn is_dir(&self) -> bool {
        self.inner.lock().unwrap().is_dir
    }

    /// The handle's cached byte length. It can lag the on-disk inode while
    /// an extension is in flight; `FileSys::length` is authoritative.
    pub fn cached_length(&self) -> i32 {
        self.inner.lock().unwrap().length
    }

    /// Directory scan cursor, kept here for the directory layer.
    pub fn pos(&self) -> u32 {
        self.inner.lock().unwrap().pos
    }

    pub fn set_pos(&self, pos: u32) {
        self.inner.lock().unwrap().pos = pos;
    }

    /// Bumps the opener count and returns another handle to this inode.
    pub fn reopen(self: &Arc<Self>) -> RcInode {
        self.inner.lock().unwrap().open_cnt += 1;
        Arc::clone(self)
    }

    /// Marks the inode for deletion once the last opener closes it. Reads
    /// and writes through open handles stay legal meanwhile.
    pub fn remove(&self) {
        self.inner.lock().unwrap().removed = true;
    }

    /// Disables writes. May be called at most once per opener.
    pub fn deny_write(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.deny_write_cnt += 1;
        assert!(inner.deny_write_cnt <= inner.open_cnt);
    }

    /// Re-enables writes; pairs with an earlier `deny_write`.
    pub fn allow_write(&self) {
        let mut inner = self.inner.lock().unwrap();
        assert!(inner.deny_write_cnt > 0);
        assert!(inner.deny_write_cnt <= inner.open_cnt);
        inner.deny_write_cnt -= 1;
    }
}

/// Table of open inodes, so that opening one sector twice returns the same
/// handle. Insertions and removals are serialized by its lock.
pub(crate) struct Itable {
    list: Mutex<Vec<RcInode>>,
}

impl Itable {
    pub(crate) fn new() -> Self {
        Self {
            list: Mutex::new(Vec::new()),
        }
    }
}

impl FileSys {
    /// Initializes an on-disk inode of `length` bytes at `sector`, which
    /// the caller has already reserved in the free map. On failure no
    /// sector stays allocated.
    pub fn create(&self, sector: u32, length: u32, is_dir: bool) -> Result<(), Error> {
        if length as usize > MAXFILE {
            return Err(Error::TooLarge);
        }
        let mut disk = Dinode::new(sector, is_dir);
        disk.length = length as i32;
        self.grow(&mut disk, 0, bytes_to_sectors(length))?;
        self.write_dinode(&disk);
        debug!("inode: created sector {}, {} bytes, dir {}", sector, length, is_dir);
        Ok(())
    }

    /// Opens the inode at `sector`. If it is already open, the existing
    /// handle is returned with its opener count bumped.
    pub fn open(&self, sector: u32) -> RcInode {
        let mut list = self.itable.list.lock().unwrap();
        if let Some(ip) = list.iter().find(|ip| ip.sector == sector) {
            ip.inner.lock().unwrap().open_cnt += 1;
            return Arc::clone(ip);
        }
        let disk = self.read_dinode(sector);
        debug_assert_eq!(disk.magic, INODE_MAGIC, "open of a non-inode sector");
        let ip = Arc::new(Inode {
            sector,
            extend: Mutex::new(()),
            inner: Mutex::new(InodeInner {
                open_cnt: 1,
                deny_write_cnt: 0,
                removed: false,
                length: disk.length,
                is_dir: disk.is_dir != 0,
                pos: 0,
            }),
        });
        list.push(Arc::clone(&ip));
        ip
    }

    /// Drops one reference to `ip`. The last close deregisters the handle;
    /// if the inode was removed, every reachable sector and the inode
    /// sector itself go back to the free map.
    pub fn close(&self, ip: RcInode) {
        let mut list = self.itable.list.lock().unwrap();
        let mut inner = ip.inner.lock().unwrap();
        debug_assert!(inner.open_cnt > 0);
        inner.open_cnt -= 1;
        if inner.open_cnt > 0 {
            return;
        }
        let removed = inner.removed;
        drop(inner);
        let pos = list
            .iter()
            .position(|p| Arc::ptr_eq(p, &ip))
            .expect("close of unregistered inode");
        list.remove(pos);
        if removed {
            let mut disk = self.read_dinode(ip.sector);
            let sectors = bytes_to_sectors(disk.length as u32);
            self.shrink(&mut disk, sectors);
            self.freemap.release(ip.sector, 1);
            debug!("inode: reclaimed sector {} and {} data sectors", ip.sector, sectors);
        }
    }

    /// Byte length of the file, read fresh through the cache.
    pub fn length(&self, ip: &Inode) -> i32 {
        self.read_dinode(ip.sector).length
    }

    /// Reads up to `dst.len()` bytes starting at byte `offset`. Returns the
    /// number of bytes read, which falls short at end of file.
    pub fn read_at(&self, ip: &Inode, dst: &mut [u8], offset: u32) -> usize {
        let mut off = offset as usize;
        let mut read = 0;
        while read < dst.len() {
            let disk = self.read_dinode(ip.sector);
            let length = disk.length as usize;
            if off >= length {
                break;
            }
            let sector = self.byte_to_sector(&disk, off as u32);
            debug_assert_ne!(sector, SECTOR_NONE);
            let sector_ofs = off % SECTOR_SIZE;
            let chunk = cmp::min(
                cmp::min(dst.len() - read, length - off),
                SECTOR_SIZE - sector_ofs,
            );
            self.bcache.get(sector).read(sector_ofs, &mut dst[read..read + chunk]);
            read += chunk;
            off += chunk;
        }
        read
    }

    /// Writes `src` starting at byte `offset`, extending the file on
    /// demand, and returns the number of bytes written. Returns 0 while
    /// writes are denied. A file never grows past `MAXFILE` bytes, and a
    /// failed extension surfaces as a short write with the length
    /// unchanged.
    pub fn write_at(&self, ip: &Inode, src: &[u8], offset: u32) -> usize {
        if ip.inner.lock().unwrap().deny_write_cnt > 0 {
            return 0;
        }
        let start = offset as usize;
        if src.is_empty() || start >= MAXFILE {
            return 0;
        }
        let src = &src[..cmp::min(src.len(), MAXFILE - start)];
        let end = start + src.len();

        // One extender at a time per inode. Concurrent readers see either
        // the old length or the one published below.
        let _extend = ip.extend.lock().unwrap();
        let disk = self.read_dinode(ip.sector);
        if end > disk.length as usize {
            let mut disk = disk;
            let old = bytes_to_sectors(disk.length as u32);
            let new = bytes_to_sectors(end as u32);
            if self.grow(&mut disk, old, new).is_ok() {
                disk.length = end as i32;
                self.write_dinode(&disk);
                ip.inner.lock().unwrap().length = disk.length;
                debug!("inode: extended sector {} to {} bytes", ip.sector, end);
            }
            // On failure the length stays put, so any partially grown index
            // is unreachable and the copy below stops at the old end.
        }

        let mut written = 0;
        let mut off = start;
        while written < src.len() {
            let disk = self.read_dinode(ip.sector);
            let length = disk.length as usize;
            if off >= length {
                break;
            }
            let sector = self.byte_to_sector(&disk, off as u32);
            debug_assert_ne!(sector, SECTOR_NONE);
            let sector_ofs = off % SECTOR_SIZE;
            let chunk = cmp::min(
                cmp::min(src.len() - written, length - off),
                SECTOR_SIZE - sector_ofs,
            );
            self.bcache.get(sector).write(sector_ofs, &src[written..written + chunk]);
            written += chunk;
            off += chunk;
        }
        written
    }

    /// Reads the on-disk inode at `sector` through the cache.
    fn read_dinode(&self, sector: u32) -> Dinode {
        let mut block = [0u8; SECTOR_SIZE];
        self.bcache.get(sector).read(0, &mut block);
        Dinode::read_from(&block[..]).expect("inode sector is one sector long")
    }

    /// Writes `disk` back to its sector through the cache.
    fn write_dinode(&self, disk: &Dinode) {
        self.bcache.get(disk.self_sector).write(0, disk.as_bytes());
    }

    /// Reads entry `idx` of the index sector `index` through the cache.
    fn index_entry(&self, index: u32, idx: usize) -> u32 {
        debug_assert!(idx < NINDIRECT);
        let mut entry = [0u8; mem::size_of::<u32>()];
        self.bcache.get(index).read(idx * mem::size_of::<u32>(), &mut entry);
        u32::from_ne_bytes(entry)
    }

    /// Writes entry `idx` of the index sector `index` through the cache,
    /// leaving the sector dirty.
    fn set_index_entry(&self, index: u32, idx: usize, sector: u32) {
        debug_assert!(idx < NINDIRECT);
        self.bcache
            .get(index)
            .write(idx * mem::size_of::<u32>(), &sector.to_ne_bytes());
    }

    fn read_index_block(&self, index: u32) -> IndexBlock {
        let mut block = [0u8; SECTOR_SIZE];
        self.bcache.get(index).read(0, &mut block);
        IndexBlock::read_from(&block[..]).expect("index sector is one sector long")
    }

    /// Device sector containing byte `pos` of the file described by `disk`,
    /// or `SECTOR_NONE` if `pos` is past the end.
    fn byte_to_sector(&self, disk: &Dinode, pos: u32) -> u32 {
        if pos >= disk.length as u32 {
            return SECTOR_NONE;
        }
        let mut idx = pos as usize / SECTOR_SIZE;
        if idx < NDIRECT {
            return disk.direct[idx];
        }
        idx -= NDIRECT;
        if idx < NINDIRECT {
            return self.index_entry(disk.indirect, idx);
        }
        idx -= NINDIRECT;
        let second = self.index_entry(disk.double_indirect, idx / NINDIRECT);
        self.index_entry(second, idx % NINDIRECT)
    }

    /// Allocates one data sector, zeroed through the cache.
    fn alloc_data_sector(&self) -> Result<u32, Error> {
        let sector = self.freemap.allocate(1).ok_or(Error::OutOfSpace)?;
        self.bcache.get(sector).fill(0);
        Ok(sector)
    }

    /// Allocates one index sector with every entry set to `SECTOR_NONE`.
    fn alloc_index_sector(&self) -> Result<u32, Error> {
        let sector = self.freemap.allocate(1).ok_or(Error::OutOfSpace)?;
        self.bcache.get(sector).fill(0xff);
        Ok(sector)
    }

    /// Extends the index of `disk` from `old` to `new` reachable data
    /// sectors. A failed from-scratch allocation is rolled back in full; a
    /// failed extension of a nonempty inode keeps its partial growth, and
    /// the caller leaves the length unchanged.
    fn grow(&self, disk: &mut Dinode, old: u32, new: u32) -> Result<(), Error> {
        debug_assert!(old <= new && new as usize <= MAXFILE_SECTORS);
        let mut done = old as usize;
        let res = self.grow_index(
            disk,
            sectors_divide(old as usize),
            sectors_divide(new as usize),
            &mut done,
        );
        if let Err(err) = res {
            debug!(
                "inode: extending sector {} from {} to {} sectors failed at {}",
                disk.self_sector, old, new, done
            );
            if old == 0 {
                self.shrink(disk, done as u32);
            }
            return Err(err);
        }
        Ok(())
    }

    fn grow_index(
        &self,
        disk: &mut Dinode,
        from: SectorCounts,
        to: SectorCounts,
        done: &mut usize,
    ) -> Result<(), Error> {
        for i in from.direct..to.direct {
            disk.direct[i] = self.alloc_data_sector()?;
            *done += 1;
        }

        if to.indirect > 0 {
            if from.indirect == 0 {
                disk.indirect = self.alloc_index_sector()?;
            }
            for i in from.indirect..to.indirect {
                let sector = self.alloc_data_sector()?;
                self.set_index_entry(disk.indirect, i, sector);
                *done += 1;
            }
        }

        if to.dblocks > 0 {
            if from.dblocks == 0 {
                disk.double_indirect = self.alloc_index_sector()?;
            }

            // Top up the partially filled last second-level sector first.
            if from.dblocks > 0 && from.in_last < NINDIRECT {
                let until = if to.dblocks > from.dblocks {
                    NINDIRECT
                } else {
                    to.in_last
                };
                let second = self.index_entry(disk.double_indirect, from.dblocks - 1);
                for i in from.in_last..until {
                    let sector = self.alloc_data_sector()?;
                    self.set_index_entry(second, i, sector);
                    *done += 1;
                }
            }

            // Then whole new second-level sectors.
            for b in from.dblocks..to.dblocks {
                let second = self.alloc_index_sector()?;
                self.set_index_entry(disk.double_indirect, b, second);
                let mut until = if b + 1 == to.dblocks { to.in_last } else { NINDIRECT };
                if b + 1 == NDINDIRECT {
                    // The 8 MiB cap leaves room for only NDLAST entries in
                    // the final second-level sector.
                    until = cmp::min(until, NDLAST);
                }
                for i in 0..until {
                    let sector = self.alloc_data_sector()?;
                    self.set_index_entry(second, i, sector);
                    *done += 1;
                }
            }
        }
        Ok(())
    }

    /// Releases the first `cnt` reachable data sectors of `disk` along with
    /// the index sectors that map them, resetting the pointers as it goes.
    fn shrink(&self, disk: &mut Dinode, cnt: u32) {
        let c = sectors_divide(cnt as usize);
        for i in 0..c.direct {
            self.freemap.release(disk.direct[i], 1);
            disk.direct[i] = SECTOR_NONE;
        }

        if disk.indirect != SECTOR_NONE {
            let block = self.read_index_block(disk.indirect);
            for i in 0..c.indirect {
                self.freemap.release(block.entries[i], 1);
            }
            self.freemap.release(disk.indirect, 1);
            disk.indirect = SECTOR_NONE;
        }

        if disk.double_indirect != SECTOR_NONE {
            let top = self.read_index_block(disk.double_indirect);
            for b in 0..c.dblocks {
                let second = top.entries[b];
                let block = self.read_index_block(second);
                let n = if b + 1 == c.dblocks { c.in_last } else { NINDIRECT };
                for i in 0..n {
                    self.freemap.release(block.entries[i], 1);
                }
                self.freemap.release(second, 1);
            }
            // A second-level sector allocated right before a failed data
            // allocation has no entries counted yet; it still goes back.
            if c.dblocks < NDINDIRECT {
                let extra = top.entries[c.dblocks];
                if extra != SECTOR_NONE {
                    self.freemap.release(extra, 1);
                }
            }
            self.freemap.release(disk.double_indirect, 1);
            disk.double_indirect = SECTOR_NONE;
        }
    }
}
