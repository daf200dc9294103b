//! Free-sector map.
//!
//! One allocation bit per device sector. `allocate` hands out the first fit
//! run of free sectors; `release` returns sectors and panics on a double
//! free, since freeing a free sector means the index bookkeeping above is
//! corrupt.

use log::trace;
use spin::Mutex;

/// Tracks which device sectors are in use. Thread safe; operations are
/// short and never touch the device.
pub struct FreeMap {
    inner: Mutex<Bits>,
}

struct Bits {
    map: Vec<u8>,
    nsectors: u32,
}

impl Bits {
    fn get(&self, sector: u32) -> bool {
        self.map[sector as usize / 8] & (1 << (sector % 8)) != 0
    }

    fn set(&mut self, sector: u32) {
        self.map[sector as usize / 8] |= 1 << (sector % 8);
    }

    fn clear(&mut self, sector: u32) {
        self.map[sector as usize / 8] &= !(1 << (sector % 8));
    }
}

impl FreeMap {
    /// A map of `nsectors` sectors, all free.
    pub fn new(nsectors: u32) -> Self {
        Self {
            inner: Mutex::new(Bits {
                map: vec![0; (nsectors as usize + 7) / 8],
                nsectors,
            }),
        }
    }

    /// Reserves a run of `cnt` consecutive sectors and returns the first,
    /// or `None` when no such run exists.
    pub fn allocate(&self, cnt: u32) -> Option<u32> {
        assert!(cnt > 0, "freemap: empty allocation");
        let mut bits = self.inner.lock();
        let mut run = 0;
        let mut start = 0;
        for byte_idx in 0..bits.map.len() {
            let byte = bits.map[byte_idx];
            if byte == 0xff {
                run = 0;
                continue;
            }
            for bit in 0..8 {
                let sector = (byte_idx * 8 + bit) as u32;
                if sector >= bits.nsectors {
                    return None;
                }
                if byte & (1 << bit) != 0 {
                    run = 0;
                    continue;
                }
                if run == 0 {
                    start = sector;
                }
                run += 1;
                if run == cnt {
                    for s in start..start + cnt {
                        bits.set(s);
                    }
                    trace!("freemap: allocated {} at {}", cnt, start);
                    return Some(start);
                }
            }
        }
        None
    }

    /// Returns the `cnt` sectors starting at `start` to the map.
    pub fn release(&self, start: u32, cnt: u32) {
        let mut bits = self.inner.lock();
        for sector in start..start + cnt {
            assert!(bits.get(sector), "freemap: freeing free sector {}", sector);
            bits.clear(sector);
        }
        trace!("freemap: released {} at {}", cnt, start);
    }

    /// Whether `sector` is currently reserved.
    pub fn is_allocated(&self, sector: u32) -> bool {
        self.inner.lock().get(sector)
    }

    /// Number of sectors still free.
    pub fn free_sectors(&self) -> u32 {
        let bits = self.inner.lock();
        (0..bits.nsectors).filter(|&s| !bits.get(s)).count() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_in_order() {
        let map = FreeMap::new(16);
        assert_eq!(map.allocate(1), Some(0));
        assert_eq!(map.allocate(1), Some(1));
        assert!(map.is_allocated(0));
        assert!(!map.is_allocated(2));
        assert_eq!(map.free_sectors(), 14);
    }

    #[test]
    fn run_skips_fragmentation() {
        let map = FreeMap::new(16);
        assert_eq!(map.allocate(3), Some(0));
        assert_eq!(map.allocate(1), Some(3));
        map.release(1, 1);
        // A run of two does not fit in the single-sector hole.
        assert_eq!(map.allocate(2), Some(4));
        assert_eq!(map.allocate(1), Some(1));
    }

    #[test]
    fn exhaustion() {
        let map = FreeMap::new(4);
        assert_eq!(map.allocate(4), Some(0));
        assert_eq!(map.allocate(1), None);
        map.release(2, 1);
        assert_eq!(map.allocate(1), Some(2));
    }

    #[test]
    #[should_panic(expected = "freeing free sector")]
    fn double_free() {
        let map = FreeMap::new(4);
        assert_eq!(map.allocate(1), Some(0));
        map.release(0, 1);
        map.release(0, 1);
    }
}
