//! Queue Head (qH) implementation for EHCI
//!
//! Based on EHCI Specification Section 3.6

use super::qtd::token;
use super::PortSpeed;
use crate::error::{Result, UsbError};
use crate::pipe::EndpointConfig;
use crate::transfer::TransferType;
use core::sync::atomic::{AtomicU32, Ordering};

/// Endpoint characteristics field bits
#[allow(missing_docs)]
pub mod endpoint {
    pub const DEVICE_ADDRESS_SHIFT: u32 = 0;
    pub const DEVICE_ADDRESS_MASK: u32 = 0x7F;

    pub const INACTIVE_ON_NEXT: u32 = 1 << 7;

    pub const ENDPOINT_NUMBER_SHIFT: u32 = 8;
    pub const ENDPOINT_NUMBER_MASK: u32 = 0xF;

    pub const ENDPOINT_SPEED_SHIFT: u32 = 12;
    pub const ENDPOINT_SPEED_MASK: u32 = 0x3;
    pub const SPEED_FULL: u32 = 0;
    pub const SPEED_LOW: u32 = 1;
    pub const SPEED_HIGH: u32 = 2;

    pub const DATA_TOGGLE_CONTROL: u32 = 1 << 14;
    pub const HEAD_OF_LIST: u32 = 1 << 15;

    pub const MAX_PACKET_LENGTH_SHIFT: u32 = 16;
    pub const MAX_PACKET_LENGTH_MASK: u32 = 0x7FF;

    pub const CONTROL_ENDPOINT: u32 = 1 << 27;

    pub const NAK_COUNT_RELOAD_SHIFT: u32 = 28;
    pub const NAK_COUNT_RELOAD_MASK: u32 = 0xF;

    /// NAK reload used for high-speed control/bulk endpoints
    pub const NAK_RELOAD_HS: u32 = 4;
}

/// Endpoint capabilities field bits
#[allow(missing_docs)]
pub mod capabilities {
    pub const INTERRUPT_SCHEDULE_MASK_SHIFT: u32 = 0;
    pub const INTERRUPT_SCHEDULE_MASK_MASK: u32 = 0xFF;

    pub const SPLIT_COMPLETION_MASK_SHIFT: u32 = 8;
    pub const SPLIT_COMPLETION_MASK_MASK: u32 = 0xFF;

    pub const HUB_ADDRESS_SHIFT: u32 = 16;
    pub const HUB_ADDRESS_MASK: u32 = 0x7F;

    pub const PORT_NUMBER_SHIFT: u32 = 23;
    pub const PORT_NUMBER_MASK: u32 = 0x7F;

    pub const MULT_SHIFT: u32 = 30;
    pub const MULT_MASK: u32 = 0x3;

    /// Start-split in microframe 0
    pub const SPLIT_START_MASK: u8 = 0x01;
    /// Complete-split in microframes 2, 3 and 4
    pub const SPLIT_COMPLETE_MASK: u8 = 0x1C;
}

/// Interrupt schedule mask for a high-speed endpoint with raw `bInterval`
///
/// The endpoint is polled every `2^(bInterval-1)` microframes. Periods of a
/// frame or longer poll in microframe 0 of every frame.
pub const fn high_speed_smask(b_interval: u8) -> u8 {
    match b_interval {
        0 | 1 => 0xFF,
        2 => 0x55,
        3 => 0x11,
        _ => 0x01,
    }
}

/// Queue Head (qH)
///
/// EHCI Specification Section 3.6
/// Must be 32-byte aligned for DMA
#[repr(C, align(32))]
pub struct QueueHead {
    /// Horizontal link pointer to next qH (bit 0 = terminate, bits 2:1 = type)
    pub horizontal_link: AtomicU32,

    /// Endpoint characteristics
    pub endpoint_chars: AtomicU32,

    /// Endpoint capabilities (split transaction, multiplier)
    pub endpoint_caps: AtomicU32,

    /// Current qTD pointer (overlay area begins here)
    pub current_qtd: AtomicU32,

    // Queue Head Overlay Area (mirrors qTD structure)
    /// Next qTD pointer
    pub next_qtd: AtomicU32,

    /// Alternate next qTD
    pub alt_next_qtd: AtomicU32,

    /// Token (status and control)
    pub token: AtomicU32,

    /// Buffer pointers
    pub buffer_pointers: [AtomicU32; 5],

    /// Extended buffer pointers (always zero, 32-bit addressing only)
    pub ext_buffer_pointers: [AtomicU32; 5],

    // Software-only fields
    /// Bus address of the oldest qTD not yet retired, or `TERMINATE`
    pub first_qtd: AtomicU32,

    /// Owning pipe index plus one; zero when unowned
    pub owner: AtomicU32,

    /// Bytes requested by the data stages, reduced by every residual
    pub total_len: AtomicU32,

    _reserved: [u32; 3],
}

impl QueueHead {
    /// Type field values for horizontal link
    #[allow(missing_docs)]
    pub const TYPE_ITD: u32 = 0 << 1;
    #[allow(missing_docs)]
    pub const TYPE_QH: u32 = 1 << 1;
    #[allow(missing_docs)]
    pub const TYPE_SITD: u32 = 2 << 1;
    #[allow(missing_docs)]
    pub const TYPE_FSTN: u32 = 3 << 1;

    /// Terminator bit
    pub const TERMINATE: u32 = 1;

    /// Link pointer address bits
    pub const LINK_ADDR_MASK: u32 = !0x1F;

    /// Create a zeroed Queue Head
    pub const fn new() -> Self {
        Self {
            horizontal_link: AtomicU32::new(0),
            endpoint_chars: AtomicU32::new(0),
            endpoint_caps: AtomicU32::new(0),
            current_qtd: AtomicU32::new(0),
            next_qtd: AtomicU32::new(0),
            alt_next_qtd: AtomicU32::new(0),
            token: AtomicU32::new(0),
            buffer_pointers: [const { AtomicU32::new(0) }; 5],
            ext_buffer_pointers: [const { AtomicU32::new(0) }; 5],
            first_qtd: AtomicU32::new(0),
            owner: AtomicU32::new(0),
            total_len: AtomicU32::new(0),
            _reserved: [0; 3],
        }
    }

    /// Program endpoint characteristics and capabilities
    pub fn init_endpoint(&self, ep: &EndpointConfig) -> Result<()> {
        if ep.device_address > 127 {
            return Err(UsbError::InvalidParameter);
        }
        if ep.endpoint > 15 {
            return Err(UsbError::InvalidParameter);
        }
        let max_packet = ep.packet_size() as u32;
        if max_packet == 0 || max_packet > 1024 {
            return Err(UsbError::InvalidParameter);
        }

        let is_control = ep.transfer_type == TransferType::Control;
        let high_speed = ep.speed == PortSpeed::High;

        let mut chars = 0u32;
        chars |= (ep.device_address as u32) << endpoint::DEVICE_ADDRESS_SHIFT;
        chars |= (ep.endpoint as u32) << endpoint::ENDPOINT_NUMBER_SHIFT;
        chars |= ep.speed.endpoint_speed() << endpoint::ENDPOINT_SPEED_SHIFT;
        chars |= max_packet << endpoint::MAX_PACKET_LENGTH_SHIFT;

        if is_control {
            // Toggle comes from each qTD
            chars |= endpoint::DATA_TOGGLE_CONTROL;
            if !high_speed {
                chars |= endpoint::CONTROL_ENDPOINT;
            }
        }

        // Periodic and split endpoints must not count NAKs
        if high_speed && ep.transfer_type != TransferType::Interrupt {
            chars |= endpoint::NAK_RELOAD_HS << endpoint::NAK_COUNT_RELOAD_SHIFT;
        }

        let mut caps = 0u32;
        let mult = if high_speed { ep.transactions_per_microframe() } else { 1 };
        caps |= (mult as u32) << capabilities::MULT_SHIFT;

        if !high_speed {
            if let Some(tt) = ep.tt {
                if tt.hub_address > 127 || tt.hub_port > 127 {
                    return Err(UsbError::InvalidParameter);
                }
                caps |= (tt.hub_address as u32) << capabilities::HUB_ADDRESS_SHIFT;
                caps |= (tt.hub_port as u32) << capabilities::PORT_NUMBER_SHIFT;
            }
        }

        if ep.transfer_type == TransferType::Interrupt {
            if high_speed {
                caps |= (high_speed_smask(ep.interval) as u32)
                    << capabilities::INTERRUPT_SCHEDULE_MASK_SHIFT;
            } else {
                caps |= (capabilities::SPLIT_START_MASK as u32)
                    << capabilities::INTERRUPT_SCHEDULE_MASK_SHIFT;
                caps |= (capabilities::SPLIT_COMPLETE_MASK as u32)
                    << capabilities::SPLIT_COMPLETION_MASK_SHIFT;
            }
        }

        self.endpoint_chars.store(chars, Ordering::Relaxed);
        self.endpoint_caps.store(caps, Ordering::Relaxed);

        Ok(())
    }

    /// Point the overlay at a fresh qTD chain
    ///
    /// Must happen before the QH is reachable from a schedule.
    pub fn attach_chain(&self, first_qtd: u32, data_toggle: bool) -> Result<()> {
        if first_qtd & !Self::LINK_ADDR_MASK != 0 {
            return Err(UsbError::InvalidParameter);
        }

        self.current_qtd.store(0, Ordering::Relaxed);
        self.next_qtd.store(first_qtd, Ordering::Relaxed);
        self.alt_next_qtd.store(Self::TERMINATE, Ordering::Relaxed);
        for ptr in self.buffer_pointers.iter().chain(self.ext_buffer_pointers.iter()) {
            ptr.store(0, Ordering::Relaxed);
        }
        let tok = if data_toggle { token::DATA_TOGGLE } else { 0 };
        self.token.store(tok, Ordering::Relaxed);
        self.first_qtd.store(first_qtd, Ordering::Release);

        Ok(())
    }

    /// Check if Queue Head is active
    pub fn is_active(&self) -> bool {
        self.token.load(Ordering::Acquire) & token::STATUS_ACTIVE != 0
    }

    /// Check if the overlay reports a halted queue
    pub fn is_halted(&self) -> bool {
        self.token.load(Ordering::Acquire) & token::STATUS_HALTED != 0
    }

    /// Data toggle carried in the overlay after the last transaction
    pub fn data_toggle(&self) -> bool {
        self.token.load(Ordering::Acquire) & token::DATA_TOGGLE != 0
    }

    /// Whether this QH serves a control endpoint
    pub fn is_control(&self) -> bool {
        self.endpoint_chars.load(Ordering::Relaxed) & endpoint::DATA_TOGGLE_CONTROL != 0
    }

    /// Owning pipe index
    pub fn owner(&self) -> Option<usize> {
        match self.owner.load(Ordering::Acquire) {
            0 => None,
            n => Some(n as usize - 1),
        }
    }

    /// Record the owning pipe index
    pub fn set_owner(&self, pipe: usize) {
        self.owner.store(pipe as u32 + 1, Ordering::Release);
    }

    /// Reset Queue Head overlay area
    pub fn reset_overlay(&self) {
        self.current_qtd.store(0, Ordering::Relaxed);
        self.next_qtd.store(Self::TERMINATE, Ordering::Relaxed);
        self.alt_next_qtd.store(Self::TERMINATE, Ordering::Relaxed);
        for ptr in self.buffer_pointers.iter().chain(self.ext_buffer_pointers.iter()) {
            ptr.store(0, Ordering::Relaxed);
        }
        self.token.store(0, Ordering::Release);
    }

    /// Mark as head of async schedule list
    pub fn set_head_of_list(&self) {
        self.endpoint_chars
            .fetch_or(endpoint::HEAD_OF_LIST, Ordering::SeqCst);
    }

    /// Zero every field
    pub fn clear(&self) {
        self.horizontal_link.store(0, Ordering::Relaxed);
        self.endpoint_chars.store(0, Ordering::Relaxed);
        self.endpoint_caps.store(0, Ordering::Relaxed);
        self.current_qtd.store(0, Ordering::Relaxed);
        self.next_qtd.store(0, Ordering::Relaxed);
        self.alt_next_qtd.store(0, Ordering::Relaxed);
        for ptr in self.buffer_pointers.iter().chain(self.ext_buffer_pointers.iter()) {
            ptr.store(0, Ordering::Relaxed);
        }
        self.first_qtd.store(0, Ordering::Relaxed);
        self.owner.store(0, Ordering::Relaxed);
        self.total_len.store(0, Ordering::Relaxed);
        self.token.store(0, Ordering::Release);
    }

    /// Whether every field reads zero
    pub fn is_zeroed(&self) -> bool {
        let scalars = [
            &self.horizontal_link,
            &self.endpoint_chars,
            &self.endpoint_caps,
            &self.current_qtd,
            &self.next_qtd,
            &self.alt_next_qtd,
            &self.token,
            &self.first_qtd,
            &self.owner,
            &self.total_len,
        ];
        scalars
            .into_iter()
            .chain(self.buffer_pointers.iter())
            .chain(self.ext_buffer_pointers.iter())
            .all(|w| w.load(Ordering::Relaxed) == 0)
    }
}

impl Default for QueueHead {
    fn default() -> Self {
        Self::new()
    }
}

// Ensure size is correct per EHCI spec
const _: () = assert!(core::mem::size_of::<QueueHead>() == 96);
const _: () = assert!(core::mem::align_of::<QueueHead>() >= 32);
