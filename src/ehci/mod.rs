//! EHCI (Enhanced Host Controller Interface) host controller core
//!
//! Register bit definitions, hardware descriptors, the async and periodic
//! schedules and the engines that retire transfers from them.
//!
//! The EHCI registers are documented in:
//! - EHCI Specification Section 2 (Host Controller Interface)
//! - i.MX RT1060 Reference Manual, Chapter 66.6 (TDI/ChipIdea extensions)
//!
//! # Register Memory Layout
//!
//! The EHCI controller registers are divided into:
//! - Capability Registers (read-only, offset 0x000-0x00F)
//! - Operational Registers (read-write, offset given by CAPLENGTH)

pub mod register;
pub mod qtd;
pub mod qh;
pub mod schedule;
mod completion;
pub mod port;
mod cancel;
pub mod controller;

pub use qtd::QueueTD;
pub use qh::QueueHead;
pub use register::{Mmio, RegisterBus, RegisterTimeout};
pub use controller::{EhciConfig, EhciHcd, FrameListSize};
pub use port::PortListener;

// Re-export important types for easier use
pub use qtd::token;
pub use qh::{endpoint, capabilities};

use bitflags::bitflags;

/// Register byte offsets
pub mod offsets {
    /// Capability register length (u8) at the capability base
    pub const CAPLENGTH: usize = 0x00;
    /// Interface version number (u16)
    pub const HCIVERSION: usize = 0x02;
    /// Structural parameters
    pub const HCSPARAMS: usize = 0x04;
    /// Capability parameters
    pub const HCCPARAMS: usize = 0x08;

    // Relative to the operational base
    /// USB command
    pub const USBCMD: usize = 0x00;
    /// USB status
    pub const USBSTS: usize = 0x04;
    /// USB interrupt enable
    pub const USBINTR: usize = 0x08;
    /// Frame index
    pub const FRINDEX: usize = 0x0C;
    /// Upper 32 address bits of control structures
    pub const CTRLDSSEGMENT: usize = 0x10;
    /// Periodic frame list base address
    pub const PERIODICLISTBASE: usize = 0x14;
    /// Next async list QH
    pub const ASYNCLISTADDR: usize = 0x18;
    /// Configure flag
    pub const CONFIGFLAG: usize = 0x40;
    /// First port status and control register
    pub const PORTSC: usize = 0x44;
    /// TDI/ChipIdea USB mode register
    pub const USBMODE: usize = 0x68;
}

/// USBMODE controller mode field (TDI/ChipIdea)
pub const USBMODE_CM_MASK: u32 = 0b11;
/// USBMODE host controller mode
pub const USBMODE_CM_HOST: u32 = 0b11;

/// Bus speed of a root port or device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PortSpeed {
    /// 12 Mbps
    Full,
    /// 1.5 Mbps
    Low,
    /// 480 Mbps
    High,
}

impl PortSpeed {
    /// Endpoint speed (EPS) encoding used in the QH characteristics word
    pub const fn endpoint_speed(self) -> u32 {
        match self {
            Self::Full => endpoint::SPEED_FULL,
            Self::Low => endpoint::SPEED_LOW,
            Self::High => endpoint::SPEED_HIGH,
        }
    }

    /// Decode the TDI/ChipIdea PORTSC speed field
    pub const fn from_portsc_field(field: u32) -> Option<Self> {
        match field & 0b11 {
            0 => Some(Self::Full),
            1 => Some(Self::Low),
            2 => Some(Self::High),
            _ => None,
        }
    }
}

/// How a root port's speed is discovered after reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpeedDetection {
    /// EHCI rules: an enabled port is high speed, a K-state line before reset
    /// means low speed, anything else is full speed behind an integrated TT
    Standard,
    /// Read PORTSC bits 27:26 (TDI/ChipIdea cores with an integrated TT)
    PortscSpeedField,
}

bitflags! {
    /// USB Command Register (USBCMD) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbCmd: u32 {
        /// Run/Stop (RS) - Bit 0
        const RUN_STOP = 1 << 0;
        /// Host Controller Reset (HCRESET) - Bit 1
        const HC_RESET = 1 << 1;
        /// Frame List Size - Bits [3:2]
        const FRAME_LIST_SIZE_MASK = 0b11 << 2;
        const FRAME_LIST_SIZE_1024 = 0b00 << 2;
        const FRAME_LIST_SIZE_512 = 0b01 << 2;
        const FRAME_LIST_SIZE_256 = 0b10 << 2;
        /// Periodic Schedule Enable (PSE) - Bit 4
        const PERIODIC_SCHEDULE_ENABLE = 1 << 4;
        /// Asynchronous Schedule Enable (ASE) - Bit 5
        const ASYNC_SCHEDULE_ENABLE = 1 << 5;
        /// Interrupt on Async Advance Doorbell (IAAD) - Bit 6
        const INTERRUPT_ON_ASYNC_ADVANCE = 1 << 6;
        /// Light Host Controller Reset (LHCRESET) - Bit 7
        const LIGHT_HC_RESET = 1 << 7;
        /// Asynchronous Schedule Park Mode Count - Bits [9:8]
        const ASYNC_PARK_MODE_COUNT_MASK = 0b11 << 8;
        /// Asynchronous Schedule Park Mode Enable (ASPME) - Bit 11
        const ASYNC_PARK_MODE_ENABLE = 1 << 11;
        /// Interrupt Threshold Control - Bits [23:16]
        const INTERRUPT_THRESHOLD_MASK = 0xFF << 16;
    }
}

impl UsbCmd {
    /// Both schedule enable bits
    pub const SCHEDULES: Self =
        Self::ASYNC_SCHEDULE_ENABLE.union(Self::PERIODIC_SCHEDULE_ENABLE);

    /// Interrupt threshold field for `microframes` (1, 2, 4, 8, 16, 32 or 64)
    pub const fn interrupt_threshold(microframes: u8) -> Self {
        Self::from_bits_retain(((microframes as u32) << 16) & Self::INTERRUPT_THRESHOLD_MASK.bits())
    }

    /// Async park mode count field (1..=3)
    pub const fn park_mode_count(count: u8) -> Self {
        Self::from_bits_retain(((count as u32) << 8) & Self::ASYNC_PARK_MODE_COUNT_MASK.bits())
    }
}

bitflags! {
    /// USB Status Register (USBSTS) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbSts: u32 {
        /// USB Interrupt (USBINT) - Bit 0
        const USB_INTERRUPT = 1 << 0;
        /// USB Error Interrupt (USBERRINT) - Bit 1
        const USB_ERROR_INTERRUPT = 1 << 1;
        /// Port Change Detect (PCD) - Bit 2
        const PORT_CHANGE_DETECT = 1 << 2;
        /// Frame List Rollover (FLR) - Bit 3
        const FRAME_LIST_ROLLOVER = 1 << 3;
        /// Host System Error (HSE) - Bit 4
        const HOST_SYSTEM_ERROR = 1 << 4;
        /// Interrupt on Async Advance (IAA) - Bit 5
        const INTERRUPT_ON_ASYNC_ADVANCE = 1 << 5;
        /// Host Controller Halted (HCHalted) - Bit 12
        const HC_HALTED = 1 << 12;
        /// Reclamation (Reclamation) - Bit 13
        const RECLAMATION = 1 << 13;
        /// Periodic Schedule Status (PSS) - Bit 14
        const PERIODIC_SCHEDULE_STATUS = 1 << 14;
        /// Asynchronous Schedule Status (ASS) - Bit 15
        const ASYNC_SCHEDULE_STATUS = 1 << 15;
    }
}

impl UsbSts {
    /// Write-1-to-clear interrupt sources
    pub const INTERRUPTS: Self = Self::USB_INTERRUPT
        .union(Self::USB_ERROR_INTERRUPT)
        .union(Self::PORT_CHANGE_DETECT)
        .union(Self::FRAME_LIST_ROLLOVER)
        .union(Self::HOST_SYSTEM_ERROR)
        .union(Self::INTERRUPT_ON_ASYNC_ADVANCE);
}

bitflags! {
    /// USB Interrupt Enable Register (USBINTR) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbIntr: u32 {
        /// USB Interrupt Enable - Bit 0
        const USB_INTERRUPT_ENABLE = 1 << 0;
        /// USB Error Interrupt Enable - Bit 1
        const USB_ERROR_INTERRUPT_ENABLE = 1 << 1;
        /// Port Change Interrupt Enable - Bit 2
        const PORT_CHANGE_INTERRUPT_ENABLE = 1 << 2;
        /// Frame List Rollover Enable - Bit 3
        const FRAME_LIST_ROLLOVER_ENABLE = 1 << 3;
        /// Host System Error Enable - Bit 4
        const HOST_SYSTEM_ERROR_ENABLE = 1 << 4;
        /// Interrupt on Async Advance Enable - Bit 5
        const INTERRUPT_ON_ASYNC_ADVANCE_ENABLE = 1 << 5;
    }
}

bitflags! {
    /// Port Status and Control Register (PORTSC) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortSc: u32 {
        /// Current Connect Status (CCS) - Bit 0
        const CURRENT_CONNECT_STATUS = 1 << 0;
        /// Connect Status Change (CSC) - Bit 1
        const CONNECT_STATUS_CHANGE = 1 << 1;
        /// Port Enabled/Disabled (PED) - Bit 2
        const PORT_ENABLED = 1 << 2;
        /// Port Enable/Disable Change (PEDC) - Bit 3
        const PORT_ENABLE_CHANGE = 1 << 3;
        /// Over-current Active (OCA) - Bit 4
        const OVER_CURRENT_ACTIVE = 1 << 4;
        /// Over-current Change (OCC) - Bit 5
        const OVER_CURRENT_CHANGE = 1 << 5;
        /// Force Port Resume (FPR) - Bit 6
        const FORCE_PORT_RESUME = 1 << 6;
        /// Suspend (SUSP) - Bit 7
        const SUSPEND = 1 << 7;
        /// Port Reset (PR) - Bit 8
        const PORT_RESET = 1 << 8;
        /// Line Status - Bits [11:10]
        const LINE_STATUS_MASK = 0b11 << 10;
        const LINE_STATUS_SE0 = 0b00 << 10;
        const LINE_STATUS_K_STATE = 0b01 << 10;
        const LINE_STATUS_J_STATE = 0b10 << 10;
        /// Port Power (PP) - Bit 12
        const PORT_POWER = 1 << 12;
        /// Port Owner (PO) - Bit 13
        const PORT_OWNER = 1 << 13;
        /// Port Speed - Bits [27:26] (TDI/ChipIdea extension)
        const PORT_SPEED_MASK = 0b11 << 26;
        const PORT_SPEED_FULL = 0b00 << 26;
        const PORT_SPEED_LOW = 0b01 << 26;
        const PORT_SPEED_HIGH = 0b10 << 26;
    }
}

impl PortSc {
    /// Write-1-to-clear change bits
    pub const CHANGE_BITS: Self = Self::CONNECT_STATUS_CHANGE
        .union(Self::PORT_ENABLE_CHANGE)
        .union(Self::OVER_CURRENT_CHANGE);

    /// Bit position of the TDI/ChipIdea speed field
    pub const PORT_SPEED_SHIFT: u32 = 26;
}

bitflags! {
    /// Host Controller Capability Parameters (HCCPARAMS) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HcCparams: u32 {
        /// 64-bit Addressing Capability (ADC) - Bit 0
        const ADDRESSING_64BIT = 1 << 0;
        /// Programmable Frame List Flag (PFL) - Bit 1
        const PROGRAMMABLE_FRAME_LIST = 1 << 1;
        /// Asynchronous Schedule Park Capability (ASP) - Bit 2
        const ASYNC_SCHEDULE_PARK = 1 << 2;
        /// Isochronous Scheduling Threshold (IST) - Bits [7:4]
        const ISOC_SCHEDULING_THRESHOLD_MASK = 0xF << 4;
        /// EHCI Extended Capabilities Pointer (EECP) - Bits [15:8]
        const EXTENDED_CAPABILITIES_POINTER_MASK = 0xFF << 8;
    }
}

bitflags! {
    /// Host Controller Structural Parameters (HCSPARAMS) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HcSparams: u32 {
        /// Number of Ports (N_PORTS) - Bits [3:0]
        const N_PORTS_MASK = 0xF;
        /// Port Power Control (PPC) - Bit 4
        const PORT_POWER_CONTROL = 1 << 4;
        /// Number of Ports per Companion Controller (N_PCC) - Bits [11:8]
        const N_PCC_MASK = 0xF << 8;
        /// Number of Companion Controllers (N_CC) - Bits [15:12]
        const N_CC_MASK = 0xF << 12;
        /// Port Indicators (P_INDICATOR) - Bit 16
        const PORT_INDICATORS = 1 << 16;
        /// Debug Port Number (DEBUG_PORT_NUMBER) - Bits [23:20]
        const DEBUG_PORT_NUMBER_MASK = 0xF << 20;
    }
}

impl HcSparams {
    /// Number of root ports
    pub const fn n_ports(self) -> u8 {
        (self.bits() & Self::N_PORTS_MASK.bits()) as u8
    }
}

/// Timeout constants (milliseconds)
pub mod timeouts {
    /// Host controller reset (250ms per EHCI spec)
    pub const HC_RESET_MS: u32 = 250;
    /// Controller halt after clearing Run/Stop (16 microframes, rounded up)
    pub const HALT_MS: u32 = 20;
    /// Port reset completion after clearing PR (2ms per EHCI spec)
    pub const PORT_RESET_CLEAR_MS: u32 = 2;
    /// Schedule status to follow the enable bits, as spin iterations
    pub const SCHEDULE_SPINS: u32 = 100_000;
}
