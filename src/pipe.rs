//! Endpoint pipes
//!
//! A pipe is the long-lived software side of one (device, endpoint) channel.
//! It carries the data toggle between transfers and the completion channel
//! of the single transfer it may have outstanding.
//!
//! Ownership of the per-transfer fields follows the `in_flight` flag: the
//! submitting side owns them while it is clear, the engine that retires the
//! transfer owns them from link until it clears the flag again.

use crate::ehci::PortSpeed;
use crate::error::{result_from_code, Result, UsbError};
use crate::osal::{Mutex, Osal, Semaphore, WAIT_FOREVER};
use crate::transfer::{Direction, TransferType};
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU16, AtomicUsize, Ordering};

/// Asynchronous completion callback
///
/// Invoked from interrupt context with the submission's `arg` and either the
/// number of bytes transferred or the error that ended the transfer.
pub type CompletionCallback = fn(arg: usize, result: Result<usize>);

/// Transaction translator a full/low-speed device sits behind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TtLocation {
    /// Address of the high-speed hub holding the TT
    pub hub_address: u8,
    /// Hub port the device is attached to
    pub hub_port: u8,
}

/// Static description of one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointConfig {
    /// Device address (0 until SET_ADDRESS)
    pub device_address: u8,
    /// Endpoint number without the direction bit
    pub endpoint: u8,
    /// Data direction (ignored for control endpoints)
    pub direction: Direction,
    /// Transfer type
    pub transfer_type: TransferType,
    /// Raw `wMaxPacketSize`, including the high-bandwidth bits 12:11
    pub max_packet_size: u16,
    /// Raw `bInterval`
    pub interval: u8,
    /// Device speed
    pub speed: PortSpeed,
    /// Transaction translator for full/low-speed devices behind a hub
    pub tt: Option<TtLocation>,
    /// Root port the device tree hangs off
    pub root_port: u8,
}

impl EndpointConfig {
    /// Describe an endpoint from its descriptor fields
    ///
    /// `ep_addr` is `bEndpointAddress` (bit 7 selects IN).
    pub const fn new(
        speed: PortSpeed,
        dev_addr: u8,
        ep_addr: u8,
        ep_type: TransferType,
        max_packet: u16,
        interval: u8,
    ) -> Self {
        Self {
            device_address: dev_addr,
            endpoint: ep_addr & 0x0F,
            direction: Direction::from_bit7(ep_addr),
            transfer_type: ep_type,
            max_packet_size: max_packet,
            interval,
            speed,
            tt: None,
            root_port: 0,
        }
    }

    /// Default control pipe of a freshly reset device
    pub const fn control(speed: PortSpeed, max_packet: u16) -> Self {
        Self::new(speed, 0, 0, TransferType::Control, max_packet, 0)
    }

    /// Set the transaction translator location
    pub const fn behind_tt(mut self, hub_address: u8, hub_port: u8) -> Self {
        self.tt = Some(TtLocation {
            hub_address,
            hub_port,
        });
        self
    }

    /// Set the root port
    pub const fn on_root_port(mut self, port: u8) -> Self {
        self.root_port = port;
        self
    }

    /// Bytes per packet (bits 10:0 of `wMaxPacketSize`)
    pub const fn packet_size(&self) -> u16 {
        self.max_packet_size & 0x7FF
    }

    /// Transactions per microframe for high-bandwidth endpoints (1..=3)
    pub const fn transactions_per_microframe(&self) -> u8 {
        let extra = ((self.max_packet_size >> 11) & 0x3) as u8;
        if extra > 2 {
            3
        } else {
            extra + 1
        }
    }

    /// Endpoint address with the direction bit
    pub const fn address(&self) -> u8 {
        match self.direction {
            Direction::In if !matches!(self.transfer_type, TransferType::Control) => {
                self.endpoint | 0x80
            }
            _ => self.endpoint,
        }
    }

    /// Check the fields a Queue Head can encode
    pub fn validate(&self) -> Result<()> {
        if self.transfer_type == TransferType::Isochronous {
            return Err(UsbError::Unsupported);
        }
        if self.device_address > 127 || self.endpoint > 15 {
            return Err(UsbError::InvalidParameter);
        }
        let size = self.packet_size();
        let limit = match (self.speed, self.transfer_type) {
            (PortSpeed::Low, _) => 8,
            (PortSpeed::Full, _) => 64,
            (PortSpeed::High, TransferType::Interrupt) => 1024,
            (PortSpeed::High, _) => 512,
        };
        if size == 0 || size > limit {
            return Err(UsbError::InvalidParameter);
        }
        if let Some(tt) = self.tt {
            if tt.hub_address == 0 || tt.hub_address > 127 || tt.hub_port > 127 {
                return Err(UsbError::InvalidParameter);
            }
        }
        Ok(())
    }
}

/// Handle to an open pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PipeHandle(u8);

impl PipeHandle {
    pub(crate) const fn new(index: usize) -> Self {
        Self(index as u8)
    }

    /// Pipe table index
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// How the engine tells the submitter its transfer is done
#[derive(Debug, Clone, Copy)]
pub enum Waiter {
    /// A thread sleeps on the pipe semaphore
    Blocking,
    /// Callback invoked from interrupt context
    Callback {
        /// Function to call
        func: CompletionCallback,
        /// Opaque argument handed back
        arg: usize,
    },
}

const NO_QH: u16 = u16::MAX;

/// Per-endpoint software state
pub struct Pipe<P: Osal> {
    allocated: AtomicBool,
    config: UnsafeCell<EndpointConfig>,
    /// Serializes blocking callers
    pub(crate) lock: P::Mutex,
    sem: P::Semaphore,
    waiter: UnsafeCell<Waiter>,
    in_flight: AtomicBool,
    waiting: AtomicBool,
    result: AtomicI32,
    toggle: AtomicBool,
    disconnected: AtomicBool,
    qh: AtomicU16,
    in_buffer: AtomicUsize,
    in_len: AtomicUsize,
}

// Safety: `config` is written only inside a critical section while no
// transfer is in flight; `waiter` is written only by the submitter before the
// Queue Head is linked and read only by the engine that retires it.
unsafe impl<P: Osal> Sync for Pipe<P> {}

impl<P: Osal> Pipe<P> {
    pub(crate) fn new() -> Self {
        Self {
            allocated: AtomicBool::new(false),
            config: UnsafeCell::new(EndpointConfig::control(PortSpeed::Full, 8)),
            lock: P::Mutex::new(),
            sem: P::Semaphore::new(),
            waiter: UnsafeCell::new(Waiter::Blocking),
            in_flight: AtomicBool::new(false),
            waiting: AtomicBool::new(false),
            result: AtomicI32::new(0),
            toggle: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            qh: AtomicU16::new(NO_QH),
            in_buffer: AtomicUsize::new(0),
            in_len: AtomicUsize::new(0),
        }
    }

    /// Claim an unused slot
    pub(crate) fn claim(&self) -> bool {
        !self.allocated.swap(true, Ordering::AcqRel)
    }

    /// Release the slot
    pub(crate) fn release(&self) {
        self.allocated.store(false, Ordering::Release);
    }

    /// Whether the slot is open
    pub fn is_open(&self) -> bool {
        self.allocated.load(Ordering::Acquire)
    }

    /// Endpoint description
    pub fn config(&self) -> EndpointConfig {
        // Safety: see the Sync impl; EndpointConfig is Copy
        unsafe { *self.config.get() }
    }

    /// Replace the endpoint description and reset the toggle
    ///
    /// # Safety
    ///
    /// Must run inside the controller's critical section with no transfer in
    /// flight on this pipe.
    pub(crate) unsafe fn set_config(&self, config: EndpointConfig) {
        // Safety: upheld by the caller
        unsafe { *self.config.get() = config };
        self.toggle.store(false, Ordering::Relaxed);
        self.disconnected.store(false, Ordering::Relaxed);
        self.result.store(0, Ordering::Relaxed);
        self.qh.store(NO_QH, Ordering::Relaxed);
    }

    /// Current data toggle (DATA1 when true)
    pub fn toggle(&self) -> bool {
        self.toggle.load(Ordering::Acquire)
    }

    pub(crate) fn set_toggle(&self, toggle: bool) {
        self.toggle.store(toggle, Ordering::Release);
    }

    /// Whether a transfer is outstanding
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Whether the device behind this pipe has gone away
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    pub(crate) fn mark_disconnected(&self) {
        self.disconnected.store(true, Ordering::Release);
    }

    /// Arena index of the Queue Head serving the outstanding transfer
    pub fn qh_index(&self) -> Option<usize> {
        match self.qh.load(Ordering::Acquire) {
            NO_QH => None,
            i => Some(i as usize),
        }
    }

    pub(crate) fn set_qh_index(&self, index: usize) {
        self.qh.store(index as u16, Ordering::Release);
    }

    /// Enter the in-flight state
    ///
    /// Fails with `InvalidState` while a previous transfer (possibly one whose
    /// caller timed out) is still owned by the engine.
    pub(crate) fn begin(&self) -> Result<()> {
        if self.disconnected.load(Ordering::Acquire) {
            return Err(UsbError::DeviceDisconnected);
        }
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| UsbError::InvalidState)
    }

    /// Undo [`Pipe::begin`] when the transfer never reached a schedule
    pub(crate) fn abandon(&self) {
        self.waiting.store(false, Ordering::Release);
        self.in_flight.store(false, Ordering::Release);
    }

    /// Prepare for a blocking wait
    pub(crate) fn arm_blocking(&self) {
        self.sem.drain();
        // Safety: in flight but not yet linked, nothing else reads the waiter
        unsafe { *self.waiter.get() = Waiter::Blocking };
        self.waiting.store(true, Ordering::Release);
    }

    /// Prepare for a callback completion
    pub(crate) fn arm_callback(&self, func: CompletionCallback, arg: usize) {
        // Safety: as in arm_blocking
        unsafe { *self.waiter.get() = Waiter::Callback { func, arg } };
        self.waiting.store(false, Ordering::Release);
    }

    /// Remember an IN buffer to invalidate once the controller is done
    pub(crate) fn set_in_buffer(&self, addr: usize, len: usize) {
        self.in_buffer.store(addr, Ordering::Relaxed);
        self.in_len.store(len, Ordering::Relaxed);
    }

    /// IN buffer of the outstanding transfer, if any
    pub(crate) fn take_in_buffer(&self) -> Option<(usize, usize)> {
        let len = self.in_len.swap(0, Ordering::Relaxed);
        if len == 0 {
            None
        } else {
            Some((self.in_buffer.load(Ordering::Relaxed), len))
        }
    }

    /// Resolve the outstanding transfer
    ///
    /// Called by exactly one engine, after the Queue Head is off every
    /// schedule and back in the arena.
    pub(crate) fn finish(&self, result: Result<usize>) {
        if !self.in_flight.load(Ordering::Acquire) {
            return;
        }
        // Safety: engine side owns the waiter until in_flight clears
        let waiter = unsafe { *self.waiter.get() };
        self.qh.store(NO_QH, Ordering::Release);

        match waiter {
            Waiter::Blocking => {
                let code = match result {
                    Ok(n) => n.min(i32::MAX as usize) as i32,
                    Err(e) => e.code(),
                };
                self.result.store(code, Ordering::Release);
                let wake = self.waiting.swap(false, Ordering::AcqRel);
                // Released before the wake so the woken caller can resubmit
                self.in_flight.store(false, Ordering::Release);
                if wake {
                    self.sem.give();
                }
            }
            Waiter::Callback { func, arg } => {
                // Cleared first so the callback may resubmit
                self.in_flight.store(false, Ordering::Release);
                func(arg, result);
            }
        }
    }

    /// Block until the engine resolves the transfer or `timeout_ms` passes
    pub(crate) fn wait(&self, timeout_ms: u32) -> Result<usize> {
        if self.sem.take(timeout_ms) {
            return result_from_code(self.result.load(Ordering::Acquire));
        }
        if self.waiting.swap(false, Ordering::AcqRel) {
            return Err(UsbError::Timeout);
        }
        // Lost the race to the engine: its give is already on the way
        self.sem.take(WAIT_FOREVER);
        result_from_code(self.result.load(Ordering::Acquire))
    }
}
