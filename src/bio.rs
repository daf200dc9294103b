//! Buffer cache.
//!
//! The buffer cache is a fixed pool of slots holding cached copies of disk
//! sector contents. Caching sectors in memory reduces the number of device
//! reads and also provides a synchronization point for sectors used by
//! multiple threads.
//!
//! Interface:
//! * To get a pinned buffer for a particular sector, call `Bcache::get`.
//! * Read or change the cached bytes with `Buf::read` and `Buf::write`;
//!   changed buffers reach the device on eviction, on `flush_all`, or
//!   through the periodic `WriteBehind` task.
//! * Drop the `Buf` when done. A pinned slot is never chosen for eviction,
//!   and a flush waits for its pins to drain, so the handle stays valid.
//! * Do not hold a `Buf` across another cache call.
//!
//! A cache-wide lock serializes lookup, miss handling, eviction, and
//! `flush_all`. Each slot additionally carries its own lock and two
//! condition variables: `accessed` is signalled when an accessor lets go of
//! the slot, `evicted` when a flush finishes. Victims are picked by a
//! second-chance clock sweep over the resident list.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use array_macro::array;
use arrayvec::ArrayVec;
use bitflags::bitflags;
use log::{debug, trace};

use crate::device::BlockDevice;
use crate::param::{NBUF, SECTOR_NONE, SECTOR_SIZE};

bitflags! {
    /// Per-slot state bits.
    struct SlotFlags: u8 {
        /// Slot holds a valid copy of its sector.
        const IN_USE = 1 << 0;
        /// Cached copy differs from the device.
        const DIRTY = 1 << 1;
        /// Touched since the clock hand last swept past.
        const ACCESS = 1 << 2;
        /// A flush is writing this slot to the device.
        const EVICTING = 1 << 3;
    }
}

struct SlotState {
    /// Sector this slot mirrors; `SECTOR_NONE` while the slot is empty.
    sector: u32,
    flags: SlotFlags,
    /// Count of live `Buf` handles. A pinned slot is skipped by the clock,
    /// and a flush waits for the count to reach zero.
    accessing: u32,
    /// Heap copy of the sector; present iff the slot is loaded.
    data: Option<Box<[u8; SECTOR_SIZE]>>,
}

struct BufSlot {
    state: Mutex<SlotState>,
    /// Signalled when an accessor unpins or finishes a copy.
    accessed: Condvar,
    /// Signalled when a flush finishes.
    evicted: Condvar,
}

impl BufSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                sector: SECTOR_NONE,
                flags: SlotFlags::empty(),
                accessing: 0,
                data: None,
            }),
            accessed: Condvar::new(),
            evicted: Condvar::new(),
        }
    }
}

/// Resident-set bookkeeping: the loaded slots in load order, plus the clock
/// hand, a position in that list where the next victim sweep starts.
struct Resident {
    list: ArrayVec<usize, NBUF>,
    hand: Option<usize>,
}

/// The buffer cache: `NBUF` slots in front of one block device.
pub struct Bcache {
    dev: Arc<dyn BlockDevice>,
    resident: Mutex<Resident>,
    slots: [BufSlot; NBUF],
}

/// A pinned reference to a loaded cache slot, returned by `Bcache::get`.
/// While any `Buf` for a slot is alive the slot keeps mirroring the same
/// sector.
pub struct Buf<'b> {
    cache: &'b Bcache,
    idx: usize,
    sector: u32,
}

impl Bcache {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        Self {
            dev,
            resident: Mutex::new(Resident {
                list: ArrayVec::new(),
                hand: None,
            }),
            slots: array![_ => BufSlot::new(); NBUF],
        }
    }

    /// Returns a pinned buffer mirroring `sector`, loading it from the
    /// device on a miss and evicting another sector if the cache is full.
    pub fn get(&self, sector: u32) -> Buf<'_> {
        assert_ne!(sector, SECTOR_NONE, "bcache: get of no sector");
        let mut resident = self.resident.lock().unwrap();

        if let Some(&idx) = resident.list.iter().find(|&&i| {
            let state = self.slots[i].state.lock().unwrap();
            state.flags.contains(SlotFlags::IN_USE) && state.sector == sector
        }) {
            let mut state = self.slots[idx].state.lock().unwrap();
            state.flags.insert(SlotFlags::ACCESS);
            state.accessing += 1;
            trace!("bcache: hit sector {}", sector);
            return Buf { cache: self, idx, sector };
        }

        let idx = if resident.list.len() < NBUF {
            self.slots
                .iter()
                .position(|slot| !slot.state.lock().unwrap().flags.contains(SlotFlags::IN_USE))
                .expect("bcache: no empty slot below capacity")
        } else {
            let victim = self.select_victim(&mut resident);
            let dirty = self.slots[victim]
                .state
                .lock()
                .unwrap()
                .flags
                .contains(SlotFlags::DIRTY);
            if dirty {
                self.flush_slot(victim);
            }
            self.release_slot(&mut resident, victim);
            victim
        };

        trace!("bcache: miss sector {}, loading into slot {}", sector, idx);
        let mut data = Box::new([0u8; SECTOR_SIZE]);
        self.dev.read(sector, &mut data);

        let mut state = self.slots[idx].state.lock().unwrap();
        debug_assert!(!state.flags.contains(SlotFlags::IN_USE));
        debug_assert_eq!(state.accessing, 0);
        state.sector = sector;
        state.flags = SlotFlags::IN_USE | SlotFlags::ACCESS;
        state.accessing = 1;
        state.data = Some(data);
        drop(state);
        resident.list.push(idx);
        Buf { cache: self, idx, sector }
    }

    /// Writes every dirty resident slot to the device, then returns every
    /// slot to the empty pool. On return the cache is clean and empty.
    pub fn flush_all(&self) {
        let mut resident = self.resident.lock().unwrap();
        let mut flushed = 0;
        while let Some(&idx) = resident.list.first() {
            // Drain pins before judging dirtiness, so a write through a
            // live handle cannot slip in afterwards. The cache-wide lock
            // is held, so no new pin can appear once the count is zero.
            let dirty = {
                let slot = &self.slots[idx];
                let mut state = slot.state.lock().unwrap();
                while state.accessing > 0 {
                    state = slot.accessed.wait(state).unwrap();
                }
                state.flags.contains(SlotFlags::DIRTY)
            };
            if dirty {
                self.flush_slot(idx);
                flushed += 1;
            }
            self.release_slot(&mut resident, idx);
        }
        resident.hand = None;
        debug!("bcache: flush_all wrote {} sectors", flushed);
    }

    /// Second-chance sweep from the clock hand. Slots with the access bit
    /// set lose the bit and are passed over; pinned slots are never picked.
    /// A fruitless full pass falls back to the oldest unpinned resident.
    fn select_victim(&self, resident: &mut Resident) -> usize {
        debug_assert_eq!(resident.list.len(), NBUF);
        let len = resident.list.len();
        let start = resident.hand.unwrap_or(0);
        for step in 0..len {
            let pos = (start + step) % len;
            let idx = resident.list[pos];
            let mut state = self.slots[idx].state.lock().unwrap();
            if state.accessing > 0 {
                continue;
            }
            if state.flags.contains(SlotFlags::ACCESS) {
                state.flags.remove(SlotFlags::ACCESS);
                continue;
            }
            resident.hand = Some((pos + 1) % len);
            trace!("bcache: victim slot {} (sector {})", idx, state.sector);
            return idx;
        }
        let pos = resident
            .list
            .iter()
            .position(|&i| self.slots[i].state.lock().unwrap().accessing == 0)
            .expect("bcache: all buffers pinned");
        resident.hand = Some((pos + 1) % len);
        resident.list[pos]
    }

    /// Writes the slot back to the device and marks it out of use. Waits
    /// for pinned accessors to drain first; the `EVICTING` bit excludes any
    /// late accessor while the device write is in flight without the slot
    /// lock held.
    fn flush_slot(&self, idx: usize) {
        let slot = &self.slots[idx];
        let mut state = slot.state.lock().unwrap();
        assert!(state.flags.contains(SlotFlags::IN_USE), "bcache: flush of empty slot");
        while state.accessing > 0 {
            state = slot.accessed.wait(state).unwrap();
        }
        state.flags.insert(SlotFlags::EVICTING);
        let sector = state.sector;
        let data = state.data.take().expect("bcache: flush of unloaded slot");
        drop(state);

        self.dev.write(sector, &data);

        let mut state = slot.state.lock().unwrap();
        state.data = Some(data);
        state.flags.remove(SlotFlags::EVICTING | SlotFlags::DIRTY | SlotFlags::IN_USE);
        slot.evicted.notify_all();
        debug!("bcache: flushed sector {}", sector);
    }

    /// Returns the slot to the empty pool and removes it from the resident
    /// list, keeping the hand on the element that followed it.
    fn release_slot(&self, resident: &mut Resident, idx: usize) {
        let mut state = self.slots[idx].state.lock().unwrap();
        debug_assert_eq!(state.accessing, 0, "bcache: release of pinned slot");
        state.sector = SECTOR_NONE;
        state.flags = SlotFlags::empty();
        state.data = None;
        drop(state);

        let pos = resident
            .list
            .iter()
            .position(|&i| i == idx)
            .expect("bcache: release of nonresident slot");
        resident.list.remove(pos);
        if let Some(hand) = resident.hand {
            if resident.list.is_empty() {
                resident.hand = None;
            } else if hand > pos {
                resident.hand = Some(hand - 1);
            } else if hand >= resident.list.len() {
                resident.hand = Some(0);
            }
        }
    }
}

impl Buf<'_> {
    /// Sector this buffer mirrors.
    pub fn sector(&self) -> u32 {
        self.sector
    }

    /// Copies `dst.len()` bytes out of the cached sector, starting at byte
    /// `ofs`.
    pub fn read(&self, ofs: usize, dst: &mut [u8]) {
        assert!(ofs + dst.len() <= SECTOR_SIZE, "bcache: read past sector end");
        let slot = &self.cache.slots[self.idx];
        let mut state = slot.state.lock().unwrap();
        while state.flags.contains(SlotFlags::EVICTING) {
            state = slot.evicted.wait(state).unwrap();
        }
        debug_assert_eq!(state.sector, self.sector);
        let data = state.data.as_ref().expect("bcache: read of unloaded slot");
        dst.copy_from_slice(&data[ofs..ofs + dst.len()]);
        state.flags.insert(SlotFlags::ACCESS);
        slot.accessed.notify_all();
    }

    /// Copies `src` into the cached sector at byte `ofs` and marks the slot
    /// dirty. The device copy is updated later, on eviction or flush.
    pub fn write(&self, ofs: usize, src: &[u8]) {
        assert!(ofs + src.len() <= SECTOR_SIZE, "bcache: write past sector end");
        let slot = &self.cache.slots[self.idx];
        let mut state = slot.state.lock().unwrap();
        while state.flags.contains(SlotFlags::EVICTING) {
            state = slot.evicted.wait(state).unwrap();
        }
        debug_assert_eq!(state.sector, self.sector);
        let data = state.data.as_mut().expect("bcache: write of unloaded slot");
        data[ofs..ofs + src.len()].copy_from_slice(src);
        state.flags.insert(SlotFlags::ACCESS | SlotFlags::DIRTY);
        slot.accessed.notify_all();
    }

    /// Fills the whole cached sector with `byte` and marks the slot dirty.
    pub fn fill(&self, byte: u8) {
        let slot = &self.cache.slots[self.idx];
        let mut state = slot.state.lock().unwrap();
        while state.flags.contains(SlotFlags::EVICTING) {
            state = slot.evicted.wait(state).unwrap();
        }
        let data = state.data.as_mut().expect("bcache: fill of unloaded slot");
        data.iter_mut().for_each(|b| *b = byte);
        state.flags.insert(SlotFlags::ACCESS | SlotFlags::DIRTY);
        slot.accessed.notify_all();
    }
}

impl Drop for Buf<'_> {
    fn drop(&mut self) {
        let slot = &self.cache.slots[self.idx];
        let mut state = slot.state.lock().unwrap();
        debug_assert!(state.accessing > 0);
        state.accessing -= 1;
        if state.accessing == 0 {
            slot.accessed.notify_all();
        }
    }
}

/// The periodic write-behind task.
///
/// A dedicated thread flushes the whole cache every `interval`, so dirty
/// sectors reach the device without an explicit flush. Dropping the handle
/// stops the thread and joins it.
pub struct WriteBehind {
    shutdown: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl WriteBehind {
    pub fn spawn(cache: Arc<Bcache>, interval: Duration) -> Self {
        let shutdown = Arc::new((Mutex::new(false), Condvar::new()));
        let flag = Arc::clone(&shutdown);
        let handle = thread::spawn(move || {
            let (lock, cond) = &*flag;
            let mut stop = lock.lock().unwrap();
            while !*stop {
                let (guard, timeout) = cond.wait_timeout(stop, interval).unwrap();
                stop = guard;
                if !*stop && timeout.timed_out() {
                    drop(stop);
                    trace!("bcache: write-behind pass");
                    cache.flush_all();
                    stop = lock.lock().unwrap();
                }
            }
        });
        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Stops the flusher thread and waits for it to exit.
    pub fn stop(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if let Some(handle) = self.handle.take() {
            let (lock, cond) = &*self.shutdown;
            *lock.lock().unwrap() = true;
            cond.notify_all();
            handle.join().expect("bcache: write-behind thread panicked");
        }
    }
}

impl Drop for WriteBehind {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
impl Bcache {
    fn in_use_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state.lock().unwrap().flags.contains(SlotFlags::IN_USE))
            .count()
    }

    fn dirty_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state.lock().unwrap().flags.contains(SlotFlags::DIRTY))
            .count()
    }

    fn resident_sectors(&self) -> Vec<u32> {
        let resident = self.resident.lock().unwrap();
        resident
            .list
            .iter()
            .map(|&i| self.slots[i].state.lock().unwrap().sector)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDisk;
    use crate::param::NBUF;

    /// A disk whose sector `s` is filled with the byte `s`.
    fn patterned_disk(nsectors: u32) -> Arc<MemDisk> {
        let disk = Arc::new(MemDisk::new(nsectors));
        for s in 0..nsectors {
            disk.write(s, &[s as u8; SECTOR_SIZE]);
        }
        disk
    }

    fn cache_on(disk: &Arc<MemDisk>) -> Bcache {
        Bcache::new(Arc::clone(disk) as Arc<dyn BlockDevice>)
    }

    #[test]
    fn miss_then_hit() {
        let disk = patterned_disk(16);
        let cache = cache_on(&disk);

        let mut got = [0u8; 4];
        cache.get(3).read(0, &mut got);
        assert_eq!(got, [3; 4]);
        assert_eq!(cache.in_use_count(), 1);

        // A hit does not load a second copy.
        cache.get(3).read(8, &mut got);
        assert_eq!(got, [3; 4]);
        assert_eq!(cache.in_use_count(), 1);
    }

    #[test]
    fn write_stays_cached_until_flush() {
        let disk = patterned_disk(16);
        let cache = cache_on(&disk);

        cache.get(5).write(100, b"hello");
        let mut on_disk = [0u8; SECTOR_SIZE];
        disk.read(5, &mut on_disk);
        assert_eq!(&on_disk[100..105], &[5; 5], "write-back leaked early");

        cache.flush_all();
        disk.read(5, &mut on_disk);
        assert_eq!(&on_disk[100..105], b"hello");
        assert_eq!(cache.dirty_count(), 0);
        assert_eq!(cache.in_use_count(), 0);
    }

    #[test]
    fn pressure_evicts_one_slot() {
        let disk = patterned_disk(NBUF as u32 + 8);
        let cache = cache_on(&disk);

        let mut byte = [0u8; 1];
        for s in 0..NBUF as u32 + 1 {
            cache.get(s).read(0, &mut byte);
            assert_eq!(byte[0], s as u8);
        }

        assert_eq!(cache.in_use_count(), NBUF);
        let resident = cache.resident_sectors();
        let mut unique = resident.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), NBUF, "a sector was loaded into two slots");
        // All access bits were set, so the full sweep fell back to the
        // oldest resident.
        assert!(!resident.contains(&0));
        assert!(resident.contains(&(NBUF as u32)));
    }

    #[test]
    fn eviction_writes_back_dirty_victim() {
        let disk = patterned_disk(NBUF as u32 + 8);
        let cache = cache_on(&disk);

        cache.get(0).write(0, b"dirty victim");
        let mut byte = [0u8; 1];
        for s in 1..NBUF as u32 + 1 {
            cache.get(s).read(0, &mut byte);
        }

        let mut on_disk = [0u8; SECTOR_SIZE];
        disk.read(0, &mut on_disk);
        assert_eq!(&on_disk[..12], b"dirty victim");

        // Reloading sees the written bytes again.
        let mut got = [0u8; 12];
        cache.get(0).read(0, &mut got);
        assert_eq!(&got, b"dirty victim");
    }

    #[test]
    fn pinned_slot_survives_pressure() {
        let disk = patterned_disk(NBUF as u32 + 8);
        let cache = cache_on(&disk);

        let pinned = cache.get(7);
        let mut byte = [0u8; 1];
        for s in 0..NBUF as u32 + 4 {
            if s != 7 {
                cache.get(s).read(0, &mut byte);
            }
        }

        let mut got = [0u8; 1];
        pinned.read(0, &mut got);
        assert_eq!(got[0], 7);
        drop(pinned);
    }

    #[test]
    fn concurrent_access_under_churn() {
        let disk = patterned_disk(200);
        let cache = Arc::new(cache_on(&disk));

        let mut workers = Vec::new();
        for t in 0..4u32 {
            let cache = Arc::clone(&cache);
            workers.push(thread::spawn(move || {
                let sector = 100 + t;
                for round in 0..64u8 {
                    cache.get(sector).write(0, &[round; 8]);
                    let mut got = [0u8; 8];
                    cache.get(sector).read(0, &mut got);
                    assert_eq!(got, [round; 8]);
                }
            }));
        }
        // Churn through enough other sectors to force evictions underneath.
        let churn = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                let mut byte = [0u8; 1];
                for s in (0..100u32).cycle().take(300) {
                    cache.get(s).read(0, &mut byte);
                }
            })
        };
        for w in workers {
            w.join().unwrap();
        }
        churn.join().unwrap();

        cache.flush_all();
        let mut on_disk = [0u8; SECTOR_SIZE];
        for t in 0..4u32 {
            disk.read(100 + t, &mut on_disk);
            assert_eq!(&on_disk[..8], &[63; 8]);
        }
    }

    #[test]
    fn write_behind_flushes_without_fsync() {
        let disk = patterned_disk(16);
        let cache = Arc::new(cache_on(&disk));
        let flusher = WriteBehind::spawn(Arc::clone(&cache), Duration::from_millis(25));

        cache.get(2).write(0, b"behind");

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut on_disk = [0u8; SECTOR_SIZE];
        loop {
            disk.read(2, &mut on_disk);
            if &on_disk[..6] == b"behind" {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "write-behind never flushed");
            thread::sleep(Duration::from_millis(10));
        }
        flusher.stop();
        assert_eq!(cache.dirty_count(), 0);
    }
}
