//! Register access for EHCI
//!
//! The controller core never touches MMIO directly; it goes through a
//! [`RegisterBus`] so the same scheduler runs on silicon and against a
//! register-file model in tests.

use crate::error::{Result, UsbError};
use core::ptr::{read_volatile, write_volatile};

/// 32-bit register access at byte offsets from the capability register base
pub trait RegisterBus {
    /// Read a 32-bit little-endian register
    fn read32(&self, offset: usize) -> u32;

    /// Write a 32-bit little-endian register
    fn write32(&self, offset: usize, value: u32);

    /// Read a 16-bit field (HCIVERSION lives at offset 0x02)
    fn read16(&self, offset: usize) -> u16 {
        let word = self.read32(offset & !0x3);
        (word >> ((offset & 0x2) * 8)) as u16
    }

    /// Read-modify-write
    #[inline]
    fn modify32<F>(&self, offset: usize, f: F)
    where
        F: FnOnce(u32) -> u32,
    {
        let current = self.read32(offset);
        self.write32(offset, f(current));
    }
}

impl<T: RegisterBus + ?Sized> RegisterBus for &T {
    fn read32(&self, offset: usize) -> u32 {
        (**self).read32(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        (**self).write32(offset, value)
    }
}

/// Memory-mapped register block
///
/// Accesses are volatile and fenced. On Cortex-M7 (`cortex-m7` feature) the
/// fences are `dmb`/`dsb` so writes to USBCMD land before the descriptors they
/// publish are fetched by the controller.
#[derive(Debug, Clone, Copy)]
pub struct Mmio {
    base: usize,
}

impl Mmio {
    /// Wrap the capability register base address
    ///
    /// # Safety
    ///
    /// `base` must point at an EHCI capability register block that stays
    /// mapped for the lifetime of the value, and nothing else may drive the
    /// controller concurrently.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    /// Capability register base address
    pub const fn base(&self) -> usize {
        self.base
    }
}

#[inline(always)]
fn barrier_before() {
    #[cfg(feature = "cortex-m7")]
    cortex_m::asm::dmb();
    #[cfg(not(feature = "cortex-m7"))]
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

#[inline(always)]
fn barrier_after_write() {
    #[cfg(feature = "cortex-m7")]
    cortex_m::asm::dsb();
    #[cfg(not(feature = "cortex-m7"))]
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

impl RegisterBus for Mmio {
    #[inline(always)]
    fn read32(&self, offset: usize) -> u32 {
        debug_assert_eq!(offset & 0x3, 0, "unaligned register offset");
        barrier_before();
        // Safety: `new` guarantees the block is mapped; offset is inside it
        let value = unsafe { read_volatile((self.base + offset) as *const u32) };
        barrier_before();
        u32::from_le(value)
    }

    #[inline(always)]
    fn write32(&self, offset: usize, value: u32) {
        debug_assert_eq!(offset & 0x3, 0, "unaligned register offset");
        barrier_before();
        // Safety: as above
        unsafe { write_volatile((self.base + offset) as *mut u32, value.to_le()) };
        barrier_after_write();
    }
}

/// Bounded polling for register conditions
pub struct RegisterTimeout {
    remaining: u32,
    step: fn(),
}

impl RegisterTimeout {
    /// Poll roughly once per millisecond using the OS sleep primitive
    ///
    /// Only for calling context; never use from the interrupt handler.
    pub fn new_ms<O: crate::osal::Osal>(timeout_ms: u32) -> Self {
        Self {
            remaining: timeout_ms.max(1),
            step: sleep_one_ms::<O>,
        }
    }

    /// Busy-poll a fixed number of times
    ///
    /// Usable inside critical sections and the interrupt handler.
    pub const fn spins(iterations: u32) -> Self {
        Self {
            remaining: iterations,
            step: core::hint::spin_loop,
        }
    }

    /// Wait for condition with timeout
    pub fn wait_for<F>(mut self, mut condition: F) -> Result<()>
    where
        F: FnMut() -> bool,
    {
        loop {
            if condition() {
                return Ok(());
            }
            if self.remaining == 0 {
                return Err(UsbError::Timeout);
            }
            self.remaining -= 1;
            (self.step)();
        }
    }
}

fn sleep_one_ms<O: crate::osal::Osal>() {
    O::sleep_ms(1);
}
