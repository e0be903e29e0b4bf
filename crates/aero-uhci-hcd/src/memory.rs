//! Physically addressed memory shared between the driver and the host controller's DMA engine.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::{Result, UsbError};

/// Abstraction for physical memory as seen by the host controller.
///
/// Descriptor words are read and written by the controller concurrently with the driver, so
/// implementations must make every 32-bit access single-copy atomic (a torn `Active` bit would be
/// observed as a completed TD).
pub trait MemoryBus: Send + Sync {
    fn read_u32(&self, paddr: u32) -> u32;
    fn write_u32(&self, paddr: u32, val: u32);

    fn read_u8(&self, paddr: u32) -> u8 {
        let word = self.read_u32(paddr & !3);
        (word >> ((paddr & 3) * 8)) as u8
    }

    fn write_u8(&self, paddr: u32, val: u8) {
        let shift = (paddr & 3) * 8;
        let word = self.read_u32(paddr & !3);
        let word = (word & !(0xFF << shift)) | (u32::from(val) << shift);
        self.write_u32(paddr & !3, word);
    }

    fn read_physical(&self, paddr: u32, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.read_u8(paddr.wrapping_add(i as u32));
        }
    }

    fn write_physical(&self, paddr: u32, buf: &[u8]) {
        for (i, b) in buf.iter().enumerate() {
            self.write_u8(paddr.wrapping_add(i as u32), *b);
        }
    }
}

/// Memory that hands out [`DmaRegion`]s and takes them back when they are dropped.
pub trait DmaBacking: MemoryBus {
    fn release(&self, paddr: u32, len: usize);
}

/// A pinned, physically contiguous block of DMA memory.
///
/// The physical address never changes for the lifetime of the region; the bytes are returned to
/// the backing allocator on drop.
pub struct DmaRegion {
    phys: u32,
    len: usize,
    backing: Arc<dyn DmaBacking>,
}

impl DmaRegion {
    pub fn new(phys: u32, len: usize, backing: Arc<dyn DmaBacking>) -> Self {
        Self { phys, len, backing }
    }

    pub fn phys(&self) -> u32 {
        self.phys
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bus(&self) -> &dyn DmaBacking {
        &*self.backing
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        debug_assert!(offset + 4 <= self.len);
        self.backing.read_u32(self.phys + offset as u32)
    }

    pub fn write_u32(&self, offset: usize, val: u32) {
        debug_assert!(offset + 4 <= self.len);
        self.backing.write_u32(self.phys + offset as u32, val);
    }

    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        debug_assert!(offset + buf.len() <= self.len);
        self.backing.read_physical(self.phys + offset as u32, buf);
    }

    pub fn write(&self, offset: usize, buf: &[u8]) {
        debug_assert!(offset + buf.len() <= self.len);
        self.backing.write_physical(self.phys + offset as u32, buf);
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        self.backing.release(self.phys, self.len);
    }
}

impl fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaRegion")
            .field("phys", &format_args!("{:#x}", self.phys))
            .field("len", &self.len)
            .finish()
    }
}

/// Word-addressed RAM starting at a fixed physical base.
///
/// Every word is an `AtomicU32`, which gives the driver and a concurrently running controller
/// model the same single-copy atomicity real hardware provides for aligned dword accesses.
/// Accesses outside the window read as zero and drop writes.
pub struct DmaRam {
    base: u32,
    words: Box<[AtomicU32]>,
}

impl DmaRam {
    pub fn new(base: u32, size: usize) -> Self {
        assert_eq!(base & 3, 0, "DMA RAM base must be dword aligned");
        let words = (0..size.div_ceil(4)).map(|_| AtomicU32::new(0)).collect();
        Self { base, words }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.words.len() * 4
    }

    fn word(&self, paddr: u32) -> Option<&AtomicU32> {
        let off = paddr.checked_sub(self.base)?;
        self.words.get((off / 4) as usize)
    }
}

impl MemoryBus for DmaRam {
    fn read_u32(&self, paddr: u32) -> u32 {
        debug_assert_eq!(paddr & 3, 0);
        self.word(paddr).map_or(0, |w| w.load(Ordering::Acquire))
    }

    fn write_u32(&self, paddr: u32, val: u32) {
        debug_assert_eq!(paddr & 3, 0);
        if let Some(w) = self.word(paddr) {
            w.store(val, Ordering::Release);
        }
    }

    fn write_u8(&self, paddr: u32, val: u8) {
        let shift = (paddr & 3) * 8;
        if let Some(w) = self.word(paddr & !3) {
            let _ = w.fetch_update(Ordering::AcqRel, Ordering::Acquire, |old| {
                Some((old & !(0xFF << shift)) | (u32::from(val) << shift))
            });
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    next: u32,
    free: Vec<(u32, usize)>,
    in_use: usize,
}

/// A simple first-fit DMA heap over [`DmaRam`].
///
/// Freed blocks go onto a free list, merged with adjacent free space, and are reused (split as
/// needed) before the bump pointer advances. A free block ending at the bump pointer is folded
/// back into it. Newly allocated blocks are zeroed.
pub struct DmaPool {
    ram: DmaRam,
    state: Mutex<PoolState>,
}

const MIN_ALIGN: usize = 4;

fn align_up(value: u32, align: usize) -> Option<u32> {
    let mask = (align as u32).wrapping_sub(1);
    value.checked_add(mask).map(|v| v & !mask)
}

impl DmaPool {
    pub fn new(base: u32, size: usize) -> Arc<Self> {
        Arc::new(Self {
            ram: DmaRam::new(base, size),
            state: Mutex::new(PoolState {
                next: base,
                ..PoolState::default()
            }),
        })
    }

    pub fn ram(&self) -> &DmaRam {
        &self.ram
    }

    /// Bytes currently handed out (rounded to the allocation granule).
    pub fn in_use(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .in_use
    }

    pub fn allocate(self: &Arc<Self>, size: usize, align: usize) -> Result<DmaRegion> {
        if !align.is_power_of_two() {
            return Err(UsbError::InvalidArgument("DMA alignment must be a power of two"));
        }
        let align = align.max(MIN_ALIGN);
        let len = size.max(1).next_multiple_of(MIN_ALIGN);
        let oom = UsbError::OutOfMemory { size, align };

        let phys = {
            let mut state = self.state.lock().unwrap_or_else(|poison| poison.into_inner());
            let phys = match Self::take_free(&mut state.free, len, align) {
                Some(phys) => phys,
                None => {
                    let start = align_up(state.next, align).ok_or(oom.clone())?;
                    let end = u64::from(start) + len as u64;
                    if end > u64::from(self.ram.base) + self.ram.size() as u64 {
                        return Err(oom);
                    }
                    if start > state.next {
                        let gap = (start - state.next) as usize;
                        let next = state.next;
                        state.free.push((next, gap));
                    }
                    state.next = end as u32;
                    start
                }
            };
            state.in_use += len;
            phys
        };

        for off in (0..len).step_by(4) {
            self.ram.write_u32(phys + off as u32, 0);
        }
        Ok(DmaRegion::new(phys, len, self.clone()))
    }

    fn take_free(free: &mut Vec<(u32, usize)>, len: usize, align: usize) -> Option<u32> {
        let idx = free.iter().position(|&(addr, size)| {
            align_up(addr, align)
                .is_some_and(|a| u64::from(a) + len as u64 <= u64::from(addr) + size as u64)
        })?;
        let (addr, size) = free.swap_remove(idx);
        let start = align_up(addr, align)?;
        if start > addr {
            free.push((addr, (start - addr) as usize));
        }
        let tail = (addr as usize + size) - (start as usize + len);
        if tail > 0 {
            free.push((start + len as u32, tail));
        }
        Some(start)
    }
}

impl MemoryBus for DmaPool {
    fn read_u32(&self, paddr: u32) -> u32 {
        self.ram.read_u32(paddr)
    }

    fn write_u32(&self, paddr: u32, val: u32) {
        self.ram.write_u32(paddr, val);
    }

    fn write_u8(&self, paddr: u32, val: u8) {
        self.ram.write_u8(paddr, val);
    }
}

impl DmaBacking for DmaPool {
    fn release(&self, paddr: u32, len: usize) {
        let mut state = self.state.lock().unwrap_or_else(|poison| poison.into_inner());
        state.in_use = state.in_use.saturating_sub(len);
        state.free.push((paddr, len));
        state.coalesce();
    }
}

impl PoolState {
    /// Merge touching free blocks and hand a free tail back to the bump pointer.
    fn coalesce(&mut self) {
        self.free.sort_unstable_by_key(|&(addr, _)| addr);
        let mut merged: Vec<(u32, usize)> = Vec::with_capacity(self.free.len());
        for (addr, size) in self.free.drain(..) {
            match merged.last_mut() {
                Some((last, last_size)) if *last as usize + *last_size == addr as usize => {
                    *last_size += size;
                }
                _ => merged.push((addr, size)),
            }
        }
        if let Some(&(addr, size)) = merged.last() {
            if addr as usize + size == self.next as usize {
                self.next = addr;
                merged.pop();
            }
        }
        self.free = merged;
    }
}
