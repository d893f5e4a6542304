#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

//! EHCI USB 2.0 host controller driver core
//!
//! This crate drives an EHCI host controller: it owns the descriptor arena,
//! builds qTD chains for control, bulk and interrupt transfers, links them
//! into the async and periodic schedules and retires them from the
//! controller interrupt. Class drivers and the hub/enumeration layer sit on
//! top of the pipe API; the platform supplies register access, DMA cache
//! maintenance and a handful of OS primitives.
//!
//! # Core Components
//!
//! - [`ehci`] - registers, hardware descriptors, schedules and the controller
//! - [`dma`] - cache maintenance, DMA buffers and the descriptor arena
//! - [`pipe`] - endpoint pipes and their completion channel
//! - [`transfer`] - transfer types, directions and SETUP packets
//! - [`osal`] - semaphore, mutex, sleep and critical section abstraction
//! - [`error`] - error type and errno-style result codes
//!
//! # Usage
//!
//! ```ignore
//! static MEMORY: HcdMemory<16, 48> = HcdMemory::new();
//!
//! let hcd = EhciHcd::<_, Platform, 16, 48, 8>::new(bus, &MEMORY, EhciConfig::chipidea());
//! hcd.init()?;
//! hcd.reset_port(0)?;
//! let speed = hcd.get_port_speed(0)?;
//!
//! let ep0 = hcd.pipe_open(EndpointConfig::control(speed, 64))?;
//! let setup = SetupPacket::get_descriptor(request::DESCRIPTOR_DEVICE, 0, 0, 18);
//! let n = hcd.control_transfer(ep0, &setup, Some(&mut buffer))?;
//! ```

#[cfg(feature = "defmt")]
use defmt as _;

#[macro_use]
mod fmt;

pub mod dma;
pub mod ehci;
pub mod error;
pub mod osal;
pub mod pipe;
pub mod transfer;

pub use dma::{DmaBuffer, DmaCache, HcdMemory, PoolStats};
pub use ehci::{EhciConfig, EhciHcd, Mmio, PortListener, PortSpeed, RegisterBus, SpeedDetection};
pub use error::{Result, UsbError};
pub use osal::{Mutex, Osal, Semaphore, WAIT_FOREVER};
pub use pipe::{CompletionCallback, EndpointConfig, Pipe, PipeHandle, TtLocation};
pub use transfer::{request, Direction, SetupPacket, TransferType};
