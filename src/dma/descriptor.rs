//! Descriptor arena
//!
//! Fixed pools of Queue Heads and qTDs with atomic allocation bitmaps, so
//! both calling context (transfer build) and interrupt context (retirement)
//! can allocate and free without locks. Handles are indices; the addresses
//! the controller sees are computed from the arena base.

use super::DmaCache;
use crate::ehci::{QueueHead, QueueTD};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Entries in the periodic frame list
pub const FRAME_LIST_LEN: usize = 1024;

/// Queue Head handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct QhHandle(u16);

impl QhHandle {
    /// Arena slot index
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// qTD handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct QtdHandle(u16);

impl QtdHandle {
    /// Arena slot index
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Arena occupancy snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PoolStats {
    /// Queue Heads available
    pub qh_free: usize,
    /// Queue Heads allocated
    pub qh_used: usize,
    /// qTDs available
    pub qtd_free: usize,
    /// qTDs allocated
    pub qtd_used: usize,
}

/// Memory pool for USB descriptors with compile-time sizing
#[repr(C)]
pub struct DescriptorPool<const N_QH: usize, const N_QTD: usize> {
    qh_memory: [QueueHead; N_QH],
    qtd_memory: [QueueTD; N_QTD],
    qh_allocated: [AtomicBool; N_QH],
    qtd_allocated: [AtomicBool; N_QTD],
}

impl<const N_QH: usize, const N_QTD: usize> DescriptorPool<N_QH, N_QTD> {
    const SIZE_CHECK: () = assert!(
        N_QH > 0 && N_QH < u16::MAX as usize && N_QTD > 0 && N_QTD < u16::MAX as usize
    );

    /// Create new descriptor pool (const-compatible)
    pub const fn new() -> Self {
        let () = Self::SIZE_CHECK;
        Self {
            qh_memory: [const { QueueHead::new() }; N_QH],
            qtd_memory: [const { QueueTD::new() }; N_QTD],
            qh_allocated: [const { AtomicBool::new(false) }; N_QH],
            qtd_allocated: [const { AtomicBool::new(false) }; N_QTD],
        }
    }

    /// Allocate a zeroed Queue Head
    pub fn alloc_qh(&self) -> Option<QhHandle> {
        for (i, allocated) in self.qh_allocated.iter().enumerate() {
            if !allocated.swap(true, Ordering::Acquire) {
                self.qh_memory[i].clear();
                return Some(QhHandle(i as u16));
            }
        }
        None
    }

    /// Allocate a zeroed qTD
    pub fn alloc_qtd(&self) -> Option<QtdHandle> {
        for (i, allocated) in self.qtd_allocated.iter().enumerate() {
            if !allocated.swap(true, Ordering::Acquire) {
                self.qtd_memory[i].clear();
                return Some(QtdHandle(i as u16));
            }
        }
        None
    }

    /// Return a Queue Head to the pool
    ///
    /// The QH must no longer be reachable from any schedule.
    pub fn free_qh(&self, handle: QhHandle) {
        let was = self.qh_allocated[handle.index()].swap(false, Ordering::Release);
        debug_assert!(was, "double free of QH {}", handle.index());
    }

    /// Return a qTD to the pool
    ///
    /// The qTD must no longer be reachable from any Queue Head.
    pub fn free_qtd(&self, handle: QtdHandle) {
        let was = self.qtd_allocated[handle.index()].swap(false, Ordering::Release);
        debug_assert!(was, "double free of qTD {}", handle.index());
    }

    /// Queue Head storage
    pub fn qh(&self, handle: QhHandle) -> &QueueHead {
        &self.qh_memory[handle.index()]
    }

    /// qTD storage
    pub fn qtd(&self, handle: QtdHandle) -> &QueueTD {
        &self.qtd_memory[handle.index()]
    }

    /// Bus address of a Queue Head
    pub fn qh_bus<C: DmaCache>(&self, handle: QhHandle) -> u32 {
        C::bus_address(self.qh(handle) as *const QueueHead as usize)
    }

    /// Bus address of a qTD
    pub fn qtd_bus<C: DmaCache>(&self, handle: QtdHandle) -> u32 {
        C::bus_address(self.qtd(handle) as *const QueueTD as usize)
    }

    /// Locate the Queue Head a link pointer refers to
    ///
    /// Type and terminate bits are ignored. Returns `None` for addresses
    /// outside the pool.
    pub fn qh_from_bus<C: DmaCache>(&self, bus: u32) -> Option<QhHandle> {
        let base = C::bus_address(self.qh_memory.as_ptr() as usize);
        let offset = (bus & QueueHead::LINK_ADDR_MASK).wrapping_sub(base) as usize;
        let size = core::mem::size_of::<QueueHead>();
        if offset % size == 0 && offset / size < N_QH {
            Some(QhHandle((offset / size) as u16))
        } else {
            None
        }
    }

    /// Locate the qTD a next/alternate pointer refers to
    pub fn qtd_from_bus<C: DmaCache>(&self, bus: u32) -> Option<QtdHandle> {
        if bus & QueueTD::TERMINATE != 0 {
            return None;
        }
        let base = C::bus_address(self.qtd_memory.as_ptr() as usize);
        let offset = (bus & !0x1F).wrapping_sub(base) as usize;
        let size = core::mem::size_of::<QueueTD>();
        if offset % size == 0 && offset / size < N_QTD {
            Some(QtdHandle((offset / size) as u16))
        } else {
            None
        }
    }

    /// Allocated Queue Head count
    pub fn qh_in_use(&self) -> usize {
        self.qh_allocated
            .iter()
            .filter(|a| a.load(Ordering::Relaxed))
            .count()
    }

    /// Allocated qTD count
    pub fn qtd_in_use(&self) -> usize {
        self.qtd_allocated
            .iter()
            .filter(|a| a.load(Ordering::Relaxed))
            .count()
    }

    /// Occupancy snapshot
    pub fn stats(&self) -> PoolStats {
        let qh_used = self.qh_in_use();
        let qtd_used = self.qtd_in_use();
        PoolStats {
            qh_free: N_QH - qh_used,
            qh_used,
            qtd_free: N_QTD - qtd_used,
            qtd_used,
        }
    }

    /// Release every descriptor
    ///
    /// Only valid while the controller is halted.
    pub(crate) fn reset(&self) {
        for flag in self.qh_allocated.iter().chain(self.qtd_allocated.iter()) {
            flag.store(false, Ordering::Release);
        }
    }
}

impl<const N_QH: usize, const N_QTD: usize> Default for DescriptorPool<N_QH, N_QTD> {
    fn default() -> Self {
        Self::new()
    }
}

/// All memory the controller reads or writes by DMA
///
/// Place in a `static` (in a DMA-capable, ideally non-cacheable, region)
/// and hand a reference to [`EhciHcd::new`](crate::ehci::EhciHcd::new).
#[repr(C, align(4096))]
pub struct HcdMemory<const N_QH: usize, const N_QTD: usize> {
    /// Periodic frame list
    pub(crate) frame_list: [AtomicU32; FRAME_LIST_LEN],
    /// Async schedule sentinel
    pub(crate) async_head: QueueHead,
    /// Periodic schedule sentinel shared by every frame list slot
    pub(crate) periodic_head: QueueHead,
    /// Descriptor arena
    pub(crate) pool: DescriptorPool<N_QH, N_QTD>,
}

impl<const N_QH: usize, const N_QTD: usize> HcdMemory<N_QH, N_QTD> {
    /// Zeroed controller memory
    pub const fn new() -> Self {
        Self {
            frame_list: [const { AtomicU32::new(0) }; FRAME_LIST_LEN],
            async_head: QueueHead::new(),
            periodic_head: QueueHead::new(),
            pool: DescriptorPool::new(),
        }
    }

    /// Descriptor arena
    pub fn pool(&self) -> &DescriptorPool<N_QH, N_QTD> {
        &self.pool
    }

    /// Async schedule sentinel
    pub fn async_head(&self) -> &QueueHead {
        &self.async_head
    }

    /// Periodic schedule sentinel
    pub fn periodic_head(&self) -> &QueueHead {
        &self.periodic_head
    }

    /// Frame list entry
    pub fn frame_list_entry(&self, index: usize) -> u32 {
        self.frame_list[index % FRAME_LIST_LEN].load(Ordering::Acquire)
    }
}

impl<const N_QH: usize, const N_QTD: usize> Default for HcdMemory<N_QH, N_QTD> {
    fn default() -> Self {
        Self::new()
    }
}

const _: () = assert!(core::mem::offset_of!(HcdMemory<1, 1>, async_head) == 4096);
