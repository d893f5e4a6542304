//! Queue Transfer Descriptor (qTD) implementation for EHCI
//!
//! Based on EHCI Specification Section 3.5

use crate::error::{Result, UsbError};
use core::sync::atomic::{AtomicU32, Ordering};

/// qTD token field bit definitions
#[allow(missing_docs)]
pub mod token {
    pub const STATUS_ACTIVE: u32 = 1 << 7;
    pub const STATUS_HALTED: u32 = 1 << 6;
    pub const STATUS_DATA_BUFFER_ERROR: u32 = 1 << 5;
    pub const STATUS_BABBLE: u32 = 1 << 4;
    pub const STATUS_TRANSACTION_ERROR: u32 = 1 << 3;
    pub const STATUS_MISSED_MICROFRAME: u32 = 1 << 2;
    pub const STATUS_SPLIT_STATE: u32 = 1 << 1;
    pub const STATUS_PING_STATE: u32 = 1 << 0;

    /// Error bits that explain a halt other than a STALL handshake
    pub const STATUS_ERRORS: u32 =
        STATUS_DATA_BUFFER_ERROR | STATUS_TRANSACTION_ERROR | STATUS_MISSED_MICROFRAME;

    pub const PID_SHIFT: u32 = 8;
    pub const PID_MASK: u32 = 0x3;
    pub const PID_OUT: u32 = 0x0 << 8;
    pub const PID_IN: u32 = 0x1 << 8;
    pub const PID_SETUP: u32 = 0x2 << 8;

    pub const ERROR_COUNTER_SHIFT: u32 = 10;
    pub const ERROR_COUNTER_MASK: u32 = 0x3;

    pub const CURRENT_PAGE_SHIFT: u32 = 12;
    pub const CURRENT_PAGE_MASK: u32 = 0x7;

    pub const INTERRUPT_ON_COMPLETE: u32 = 1 << 15;

    pub const TOTAL_BYTES_SHIFT: u32 = 16;
    pub const TOTAL_BYTES_MASK: u32 = 0x7FFF;

    pub const DATA_TOGGLE: u32 = 1 << 31;

    /// Remaining (untransferred) byte count
    #[inline]
    pub const fn total_bytes(token: u32) -> u32 {
        (token >> TOTAL_BYTES_SHIFT) & TOTAL_BYTES_MASK
    }

    /// Error counter (CERR)
    #[inline]
    pub const fn error_counter(token: u32) -> u32 {
        (token >> ERROR_COUNTER_SHIFT) & ERROR_COUNTER_MASK
    }

    /// PID code bits, comparable with `PID_OUT` / `PID_IN` / `PID_SETUP`
    #[inline]
    pub const fn pid(token: u32) -> u32 {
        token & (PID_MASK << PID_SHIFT)
    }
}

/// Classify the token of a halted qTD or QH overlay
///
/// A halt with babble clear is a STALL when the error counter was not
/// exhausted, or when no transaction/buffer/missed-microframe bit explains it.
/// Anything else is a transport error.
pub fn halt_reason(tok: u32) -> UsbError {
    if tok & token::STATUS_BABBLE != 0 {
        UsbError::TransactionError
    } else if token::error_counter(tok) != 0 || tok & token::STATUS_ERRORS == 0 {
        UsbError::Stall
    } else {
        UsbError::TransactionError
    }
}

/// Queue Transfer Descriptor (qTD)
///
/// EHCI Specification Section 3.5. The first 52 bytes are hardware defined;
/// the tail is a software extension the controller never reads, except that a
/// SETUP qTD points its first buffer at [`QueueTD::setup`].
#[repr(C, align(32))]
pub struct QueueTD {
    /// Next qTD pointer (bits 31:5 valid, bit 0 = terminate)
    pub next_qtd: AtomicU32,

    /// Alternate next qTD pointer (taken on a short IN packet)
    pub alt_next_qtd: AtomicU32,

    /// Token field containing status, PID, and transfer length
    pub token: AtomicU32,

    /// Buffer pointer pages (up to 5 pages, 4KB each)
    pub buffer_pointers: [AtomicU32; 5],

    /// Extended buffer pointers for 64-bit addressing (always zero)
    pub ext_buffer_pointers: [AtomicU32; 5],

    // Software-only fields
    /// Bytes requested by this qTD
    pub length: AtomicU32,

    /// Eight byte SETUP packet, DMA-visible storage for the SETUP stage
    pub setup: [AtomicU32; 2],
}

impl QueueTD {
    /// qTD terminator bit
    pub const TERMINATE: u32 = 1;

    /// Maximum transfer size per qTD when the buffer starts page aligned
    pub const MAX_TRANSFER_SIZE: usize = 20 * 1024;

    /// Byte offset of the SETUP packet storage within the descriptor
    pub const SETUP_OFFSET: usize = 56;

    const PAGE_SIZE: u32 = 0x1000;

    /// Create a zeroed qTD
    pub const fn new() -> Self {
        Self {
            next_qtd: AtomicU32::new(0),
            alt_next_qtd: AtomicU32::new(0),
            token: AtomicU32::new(0),
            buffer_pointers: [const { AtomicU32::new(0) }; 5],
            ext_buffer_pointers: [const { AtomicU32::new(0) }; 5],
            length: AtomicU32::new(0),
            setup: [const { AtomicU32::new(0) }; 2],
        }
    }

    /// Largest transfer one qTD can describe for a buffer at `bus_addr`
    #[inline]
    pub const fn max_length_at(bus_addr: u32) -> usize {
        Self::MAX_TRANSFER_SIZE - (bus_addr & (Self::PAGE_SIZE - 1)) as usize
    }

    /// Initialize qTD for one transfer stage
    ///
    /// `next` and `alt_next` are left terminated; the builder patches them
    /// once the whole chain exists. The buffer must be physically contiguous
    /// starting at `bus_addr`.
    pub fn fill(
        &self,
        pid: u32,
        data_toggle: bool,
        bus_addr: u32,
        len: usize,
        interrupt_on_complete: bool,
    ) -> Result<()> {
        if len > Self::max_length_at(bus_addr) {
            return Err(UsbError::InvalidParameter);
        }

        self.next_qtd.store(Self::TERMINATE, Ordering::Relaxed);
        self.alt_next_qtd.store(Self::TERMINATE, Ordering::Relaxed);

        // Page 0 carries the byte offset, later pages are 4K aligned
        let base_page = bus_addr & !(Self::PAGE_SIZE - 1);
        let end = bus_addr as u64 + len as u64;
        for (i, ptr) in self.buffer_pointers.iter().enumerate() {
            let page = base_page as u64 + (Self::PAGE_SIZE as u64) * i as u64;
            let value = if len == 0 || page >= end {
                0
            } else if i == 0 {
                bus_addr
            } else {
                page as u32
            };
            ptr.store(value, Ordering::Relaxed);
        }
        for ptr in &self.ext_buffer_pointers {
            ptr.store(0, Ordering::Relaxed);
        }

        let mut tok = token::STATUS_ACTIVE;
        tok |= pid;
        tok |= 3 << token::ERROR_COUNTER_SHIFT;
        tok |= (len as u32) << token::TOTAL_BYTES_SHIFT;
        if data_toggle {
            tok |= token::DATA_TOGGLE;
        }
        if interrupt_on_complete {
            tok |= token::INTERRUPT_ON_COMPLETE;
        }

        self.length.store(len as u32, Ordering::Relaxed);
        // Token last: it carries the active bit
        self.token.store(tok, Ordering::Release);

        Ok(())
    }

    /// Store the SETUP packet in the descriptor's own storage
    pub fn set_setup(&self, packet: &[u8; 8]) {
        self.setup[0].store(
            u32::from_le_bytes([packet[0], packet[1], packet[2], packet[3]]),
            Ordering::Relaxed,
        );
        self.setup[1].store(
            u32::from_le_bytes([packet[4], packet[5], packet[6], packet[7]]),
            Ordering::Relaxed,
        );
    }

    /// Read back the stored SETUP packet
    pub fn setup_bytes(&self) -> [u8; 8] {
        let lo = self.setup[0].load(Ordering::Relaxed).to_le_bytes();
        let hi = self.setup[1].load(Ordering::Relaxed).to_le_bytes();
        [lo[0], lo[1], lo[2], lo[3], hi[0], hi[1], hi[2], hi[3]]
    }

    /// Check if qTD is still owned by hardware
    pub fn is_active(&self) -> bool {
        self.token.load(Ordering::Acquire) & token::STATUS_ACTIVE != 0
    }

    /// Check if qTD halted the queue
    pub fn is_halted(&self) -> bool {
        self.token.load(Ordering::Acquire) & token::STATUS_HALTED != 0
    }

    /// Check if qTD encountered an error
    pub fn has_error(&self) -> Option<UsbError> {
        let tok = self.token.load(Ordering::Acquire);
        if tok & token::STATUS_HALTED != 0 {
            Some(halt_reason(tok))
        } else {
            None
        }
    }

    /// Untransferred byte count
    pub fn residual(&self) -> usize {
        token::total_bytes(self.token.load(Ordering::Acquire)) as usize
    }

    /// PID code of this descriptor
    pub fn pid(&self) -> u32 {
        token::pid(self.token.load(Ordering::Relaxed))
    }

    /// Zero every field
    pub fn clear(&self) {
        self.next_qtd.store(0, Ordering::Relaxed);
        self.alt_next_qtd.store(0, Ordering::Relaxed);
        self.token.store(0, Ordering::Relaxed);
        for ptr in self.buffer_pointers.iter().chain(self.ext_buffer_pointers.iter()) {
            ptr.store(0, Ordering::Relaxed);
        }
        self.length.store(0, Ordering::Relaxed);
        self.setup[0].store(0, Ordering::Relaxed);
        self.setup[1].store(0, Ordering::Release);
    }

    /// Whether every field reads zero
    pub fn is_zeroed(&self) -> bool {
        self.next_qtd.load(Ordering::Relaxed) == 0
            && self.alt_next_qtd.load(Ordering::Relaxed) == 0
            && self.token.load(Ordering::Relaxed) == 0
            && self
                .buffer_pointers
                .iter()
                .chain(self.ext_buffer_pointers.iter())
                .chain(self.setup.iter())
                .all(|w| w.load(Ordering::Relaxed) == 0)
            && self.length.load(Ordering::Relaxed) == 0
    }
}

impl Default for QueueTD {
    fn default() -> Self {
        Self::new()
    }
}

const _: () = assert!(core::mem::size_of::<QueueTD>() == 64);
const _: () = assert!(core::mem::align_of::<QueueTD>() == 32);
const _: () = assert!(core::mem::offset_of!(QueueTD, setup) == QueueTD::SETUP_OFFSET);
