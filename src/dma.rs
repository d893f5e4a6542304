//! DMA memory: cache maintenance, transfer buffers and the descriptor arena

pub mod descriptor;

pub use descriptor::{DescriptorPool, HcdMemory, PoolStats, QhHandle, QtdHandle, FRAME_LIST_LEN};

use core::ptr::NonNull;

/// DMA alignment requirement (32 bytes for EHCI descriptors and cache lines)
pub const DMA_ALIGNMENT: usize = 32;

/// Cache maintenance and address translation for DMA-visible memory
///
/// Every method has a no-op (or identity) default for cache-coherent
/// platforms. Implementations must be callable from interrupt context.
pub trait DmaCache {
    /// Write dirty lines back before the controller reads `len` bytes at `addr`
    fn clean(_addr: usize, _len: usize) {}

    /// Discard cached lines before software reads memory the controller wrote
    fn invalidate(_addr: usize, _len: usize) {}

    /// Clean then invalidate, for memory the controller both reads and writes
    fn clean_invalidate(addr: usize, len: usize) {
        Self::clean(addr, len);
        Self::invalidate(addr, len);
    }

    /// Address the controller uses for a CPU address
    ///
    /// Descriptors are located from bus addresses by offset within the
    /// arena, so only differences between bus addresses must be preserved.
    fn bus_address(addr: usize) -> u32 {
        addr as u32
    }
}

/// Cortex-M7 data cache implementation of [`DmaCache`]
#[cfg(feature = "cortex-m7")]
pub struct CortexM7Cache;

#[cfg(feature = "cortex-m7")]
impl DmaCache for CortexM7Cache {
    fn clean(addr: usize, len: usize) {
        cache_ops::clean_dcache(addr, len);
    }

    fn invalidate(addr: usize, len: usize) {
        cache_ops::invalidate_dcache(addr, len);
    }

    fn clean_invalidate(addr: usize, len: usize) {
        cache_ops::clean_invalidate_dcache(addr, len);
    }
}

/// Transfer buffer in memory that lives for the rest of the program
///
/// A transfer that times out may still be retired by the controller later,
/// so buffers handed to the controller are never stack or heap memory that
/// could be reused. Until a timed-out pipe is cancelled or its transfer
/// retires, the controller may still write the buffer.
pub struct DmaBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: the buffer exclusively owns its 'static region
unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    /// Wrap a static region
    ///
    /// Cache maintenance works on whole lines, so the region should start on
    /// a [`DMA_ALIGNMENT`] boundary and not share lines with other data.
    pub fn from_static(buf: &'static mut [u8]) -> Self {
        let len = buf.len();
        // A slice pointer is never null, dangling only when empty
        let ptr = NonNull::from(buf).cast::<u8>();
        Self { ptr, len }
    }

    /// Buffer length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer has no bytes
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// CPU address of the first byte
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Whether the buffer starts on a cache line
    pub fn is_aligned(&self) -> bool {
        is_dma_aligned(self.addr())
    }

    /// Buffer contents
    pub fn as_slice(&self) -> &[u8] {
        // Safety: region is 'static and owned by self
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Mutable buffer contents
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: region is 'static and owned by self
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl core::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("addr", &self.addr())
            .field("len", &self.len)
            .finish()
    }
}

/// Cache maintenance operations for cacheable DMA buffers
///
/// Use these when DMA buffers are in cacheable memory regions.
#[cfg(feature = "cortex-m7")]
pub mod cache_ops {
    use cortex_m::asm::{dsb, isb};

    /// Data cache line size for Cortex-M7 (32 bytes)
    const DCACHE_LINE_SIZE: usize = 32;

    /// SCB cache maintenance registers for Cortex-M7
    const SCB_DCCMVAC: *mut u32 = 0xE000_EF68 as *mut u32; // Clean by MVA to PoC
    const SCB_DCIMVAC: *mut u32 = 0xE000_EF5C as *mut u32; // Invalidate by MVA to PoC
    const SCB_DCCIMVAC: *mut u32 = 0xE000_EF70 as *mut u32; // Clean & Invalidate by MVA to PoC

    fn by_line(reg: *mut u32, addr: usize, size: usize) {
        if size == 0 {
            return;
        }
        dsb();
        let start = addr & !(DCACHE_LINE_SIZE - 1);
        let end = (addr + size + DCACHE_LINE_SIZE - 1) & !(DCACHE_LINE_SIZE - 1);
        for line_addr in (start..end).step_by(DCACHE_LINE_SIZE) {
            // Safety: SCB maintenance registers are always mapped on Cortex-M7
            unsafe { core::ptr::write_volatile(reg, line_addr as u32) };
        }
        dsb();
        isb();
    }

    /// Clean lines covering `addr..addr + size`
    pub fn clean_dcache(addr: usize, size: usize) {
        by_line(SCB_DCCMVAC, addr, size);
    }

    /// Invalidate lines covering `addr..addr + size`
    pub fn invalidate_dcache(addr: usize, size: usize) {
        by_line(SCB_DCIMVAC, addr, size);
    }

    /// Clean and invalidate lines covering `addr..addr + size`
    pub fn clean_invalidate_dcache(addr: usize, size: usize) {
        by_line(SCB_DCCIMVAC, addr, size);
    }
}

/// Align address to DMA boundary
pub const fn align_dma(addr: usize) -> usize {
    (addr + DMA_ALIGNMENT - 1) & !(DMA_ALIGNMENT - 1)
}

/// Check if address is DMA aligned
pub const fn is_dma_aligned(addr: usize) -> bool {
    addr & (DMA_ALIGNMENT - 1) == 0
}
