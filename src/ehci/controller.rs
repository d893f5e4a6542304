//! EHCI controller context
//!
//! One [`EhciHcd`] drives one controller. It owns the register bus, borrows
//! the DMA-visible [`HcdMemory`] and holds the pipe table. Every method takes
//! `&self`, so a single instance is shared between calling threads and the
//! interrupt handler.

use super::port::PortListener;
use super::register::{RegisterBus, RegisterTimeout};
use super::schedule::{self, ScheduleGuard, ScheduleKind};
use super::{
    offsets, timeouts, HcCparams, HcSparams, PortSc, SpeedDetection, UsbCmd, UsbIntr, UsbSts,
    USBMODE_CM_HOST, USBMODE_CM_MASK,
};
use crate::dma::{DmaBuffer, DmaCache, HcdMemory, PoolStats};
use crate::error::{Result, UsbError};
use crate::osal::{MutexGuard, Osal};
use crate::pipe::{CompletionCallback, EndpointConfig, Pipe, PipeHandle};
use crate::transfer::builder::{self, DataStage};
use crate::transfer::{Direction, SetupPacket, TransferType};
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

/// Frame list length programmed into USBCMD
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameListSize {
    /// 1024 entries (EHCI default)
    Entries1024,
    /// 512 entries
    Entries512,
    /// 256 entries
    Entries256,
}

impl FrameListSize {
    /// Entries the controller walks
    pub const fn entries(self) -> usize {
        match self {
            Self::Entries1024 => 1024,
            Self::Entries512 => 512,
            Self::Entries256 => 256,
        }
    }

    const fn command_bits(self) -> UsbCmd {
        match self {
            Self::Entries1024 => UsbCmd::FRAME_LIST_SIZE_1024,
            Self::Entries512 => UsbCmd::FRAME_LIST_SIZE_512,
            Self::Entries256 => UsbCmd::FRAME_LIST_SIZE_256,
        }
    }
}

/// Controller configuration
///
/// ```
/// use ehci_usbh::ehci::EhciConfig;
///
/// const CONFIG: EhciConfig = EhciConfig::new()
///     .with_interrupt_threshold(1)
///     .with_control_timeout_ms(1000);
/// assert_eq!(CONFIG.control_timeout_ms(), 1000);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EhciConfig {
    interrupt_threshold: u8,
    async_park: Option<u8>,
    frame_list_size: FrameListSize,
    speed_detection: SpeedDetection,
    set_host_mode: bool,
    control_timeout_ms: u32,
    port_reset_ms: u32,
}

impl EhciConfig {
    /// Defaults for a standard EHCI controller
    pub const fn new() -> Self {
        Self {
            interrupt_threshold: 1,
            async_park: None,
            frame_list_size: FrameListSize::Entries1024,
            speed_detection: SpeedDetection::Standard,
            set_host_mode: false,
            control_timeout_ms: 500,
            port_reset_ms: 50,
        }
    }

    /// Preset for TDI/ChipIdea cores such as the i.MX RT USB OTG controllers
    pub const fn chipidea() -> Self {
        Self::new()
            .with_speed_detection(SpeedDetection::PortscSpeedField)
            .with_host_mode(true)
            .with_async_park(Some(3))
    }

    /// Interrupt threshold in microframes (1, 2, 4, 8, 16, 32 or 64)
    pub const fn with_interrupt_threshold(mut self, microframes: u8) -> Self {
        self.interrupt_threshold = microframes;
        self
    }

    /// Async schedule park mode count (1..=3), `None` to leave parking off
    pub const fn with_async_park(mut self, count: Option<u8>) -> Self {
        self.async_park = count;
        self
    }

    /// Frame list size, honoured only when the frame list is programmable
    pub const fn with_frame_list_size(mut self, size: FrameListSize) -> Self {
        self.frame_list_size = size;
        self
    }

    /// How root-port speed is discovered
    pub const fn with_speed_detection(mut self, detection: SpeedDetection) -> Self {
        self.speed_detection = detection;
        self
    }

    /// Program USBMODE to host mode after reset (TDI/ChipIdea only)
    pub const fn with_host_mode(mut self, set: bool) -> Self {
        self.set_host_mode = set;
        self
    }

    /// Deadline for blocking control transfers
    pub const fn with_control_timeout_ms(mut self, ms: u32) -> Self {
        self.control_timeout_ms = ms;
        self
    }

    /// How long PR is held during a port reset
    pub const fn with_port_reset_ms(mut self, ms: u32) -> Self {
        self.port_reset_ms = ms;
        self
    }

    /// Interrupt threshold in microframes
    pub const fn interrupt_threshold(&self) -> u8 {
        self.interrupt_threshold
    }

    /// Async park mode count
    pub const fn async_park(&self) -> Option<u8> {
        self.async_park
    }

    /// Frame list size
    pub const fn frame_list_size(&self) -> FrameListSize {
        self.frame_list_size
    }

    /// Root-port speed discovery
    pub const fn speed_detection(&self) -> SpeedDetection {
        self.speed_detection
    }

    /// Whether USBMODE is programmed
    pub const fn sets_host_mode(&self) -> bool {
        self.set_host_mode
    }

    /// Blocking control transfer deadline
    pub const fn control_timeout_ms(&self) -> u32 {
        self.control_timeout_ms
    }

    /// Port reset hold time
    pub const fn port_reset_ms(&self) -> u32 {
        self.port_reset_ms
    }

    /// Reject values USBCMD cannot encode
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.interrupt_threshold, 1 | 2 | 4 | 8 | 16 | 32 | 64) {
            return Err(UsbError::InvalidParameter);
        }
        if let Some(count) = self.async_park {
            if !(1..=3).contains(&count) {
                return Err(UsbError::InvalidParameter);
            }
        }
        Ok(())
    }

    /// USBCMD value that starts the controller
    pub(crate) fn run_command(&self, caps: HcCparams) -> UsbCmd {
        let mut cmd = UsbCmd::RUN_STOP
            | UsbCmd::SCHEDULES
            | UsbCmd::interrupt_threshold(self.interrupt_threshold);
        if caps.contains(HcCparams::PROGRAMMABLE_FRAME_LIST) {
            cmd |= self.frame_list_size.command_bits();
        }
        if let Some(count) = self.async_park {
            if caps.contains(HcCparams::ASYNC_SCHEDULE_PARK) {
                cmd |= UsbCmd::ASYNC_PARK_MODE_ENABLE | UsbCmd::park_mode_count(count);
            }
        }
        cmd
    }
}

impl Default for EhciConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Request shape handed to the transfer builder
#[derive(Clone, Copy)]
pub(crate) enum Request<'r> {
    Control(&'r SetupPacket),
    Single,
}

/// EHCI host controller driver instance
///
/// - `N_QH` / `N_QTD`: descriptor arena sizes (see [`HcdMemory`])
/// - `N_PIPES`: pipe table size
///
/// `P` provides both the OS primitives and the platform's DMA cache
/// maintenance.
pub struct EhciHcd<'a, B, P, const N_QH: usize, const N_QTD: usize, const N_PIPES: usize>
where
    B: RegisterBus,
    P: Osal + DmaCache,
{
    pub(crate) bus: B,
    pub(crate) mem: &'a HcdMemory<N_QH, N_QTD>,
    pub(crate) pipes: [Pipe<P>; N_PIPES],
    pub(crate) listener: Option<&'a (dyn PortListener + Sync)>,
    pub(crate) config: EhciConfig,
    op: AtomicUsize,
    n_ports: AtomicU8,
    initialized: AtomicBool,
    running: AtomicBool,
}

impl<'a, B, P, const N_QH: usize, const N_QTD: usize, const N_PIPES: usize>
    EhciHcd<'a, B, P, N_QH, N_QTD, N_PIPES>
where
    B: RegisterBus,
    P: Osal + DmaCache,
{
    const PIPE_CHECK: () = assert!(N_PIPES > 0 && N_PIPES <= 256, "pipe handles are 8 bits");

    /// Create a driver instance; nothing touches the hardware until [`init`](Self::init)
    pub fn new(bus: B, mem: &'a HcdMemory<N_QH, N_QTD>, config: EhciConfig) -> Self {
        let () = Self::PIPE_CHECK;
        Self {
            bus,
            mem,
            pipes: core::array::from_fn(|_| Pipe::new()),
            listener: None,
            config,
            op: AtomicUsize::new(0),
            n_ports: AtomicU8::new(0),
            initialized: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }

    /// Register the hub/enumeration layer for root-port notifications
    pub fn with_listener(mut self, listener: &'a (dyn PortListener + Sync)) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Bring the controller up
    ///
    /// Halts and resets it, builds both schedules, enables interrupts, sets
    /// Run/Stop and routes every port to this controller.
    pub fn init(&self) -> Result<()> {
        self.config.validate()?;
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Err(UsbError::AlreadyInitialized);
        }
        let result = self.bring_up();
        match result {
            Ok(()) => self.running.store(true, Ordering::Release),
            Err(e) => {
                error!("controller bring-up failed: {}", e);
                self.initialized.store(false, Ordering::Release);
            }
        }
        result
    }

    fn bring_up(&self) -> Result<()> {
        let op = (self.bus.read32(offsets::CAPLENGTH) & 0xFF) as usize;
        self.op.store(op, Ordering::Release);
        let version = self.bus.read16(offsets::HCIVERSION);
        let sparams = HcSparams::from_bits_retain(self.bus.read32(offsets::HCSPARAMS));
        let cparams = HcCparams::from_bits_retain(self.bus.read32(offsets::HCCPARAMS));

        // Halt before reset
        self.bus
            .modify32(op + offsets::USBCMD, |cmd| cmd & !UsbCmd::RUN_STOP.bits());
        RegisterTimeout::new_ms::<P>(timeouts::HALT_MS)
            .wait_for(|| self.status().contains(UsbSts::HC_HALTED))?;

        self.bus.write32(op + offsets::USBCMD, UsbCmd::HC_RESET.bits());
        RegisterTimeout::new_ms::<P>(timeouts::HC_RESET_MS).wait_for(|| {
            !UsbCmd::from_bits_retain(self.bus.read32(op + offsets::USBCMD))
                .contains(UsbCmd::HC_RESET)
        })?;

        if self.config.set_host_mode {
            self.bus.modify32(op + offsets::USBMODE, |mode| {
                (mode & !USBMODE_CM_MASK) | USBMODE_CM_HOST
            });
        }

        self.mem.pool.reset();
        let (async_bus, frame_list_bus) = schedule::init_schedules::<P, N_QH, N_QTD>(self.mem);
        if cparams.contains(HcCparams::ADDRESSING_64BIT) {
            self.bus.write32(op + offsets::CTRLDSSEGMENT, 0);
        }
        self.bus.write32(op + offsets::PERIODICLISTBASE, frame_list_bus);
        self.bus.write32(op + offsets::ASYNCLISTADDR, async_bus);

        self.bus
            .write32(op + offsets::USBSTS, UsbSts::INTERRUPTS.bits());
        let intr = UsbIntr::USB_INTERRUPT_ENABLE
            | UsbIntr::USB_ERROR_INTERRUPT_ENABLE
            | UsbIntr::PORT_CHANGE_INTERRUPT_ENABLE
            | UsbIntr::HOST_SYSTEM_ERROR_ENABLE;
        self.bus.write32(op + offsets::USBINTR, intr.bits());

        self.bus
            .write32(op + offsets::USBCMD, self.config.run_command(cparams).bits());
        RegisterTimeout::new_ms::<P>(timeouts::HALT_MS)
            .wait_for(|| !self.status().contains(UsbSts::HC_HALTED))?;

        self.bus.write32(op + offsets::CONFIGFLAG, 1);

        let n_ports = sparams.n_ports();
        self.n_ports.store(n_ports, Ordering::Release);
        if sparams.contains(HcSparams::PORT_POWER_CONTROL) {
            for port in 0..n_ports {
                self.bus.modify32(Self::portsc_at(op, port), |sc| {
                    (sc & !PortSc::CHANGE_BITS.bits()) | PortSc::PORT_POWER.bits()
                });
            }
        }

        info!("EHCI {:x} running, {} root ports", version, n_ports);
        Ok(())
    }

    /// Stop the controller and fail every outstanding transfer with `ShuttingDown`
    ///
    /// Every descriptor returns to the arena. Pipes stay open.
    pub fn deinit(&self) -> Result<()> {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return Err(UsbError::NotInitialized);
        }
        self.running.store(false, Ordering::Release);

        let op = self.op();
        self.bus.write32(op + offsets::USBINTR, 0);
        self.bus.modify32(op + offsets::USBCMD, |cmd| {
            cmd & !(UsbCmd::RUN_STOP | UsbCmd::SCHEDULES).bits()
        });
        let halted = RegisterTimeout::new_ms::<P>(timeouts::HALT_MS)
            .wait_for(|| self.status().contains(UsbSts::HC_HALTED));
        if halted.is_err() {
            warn!("controller did not halt");
        }

        P::critical_section(|| self.abort_all(UsbError::ShuttingDown));
        self.mem.pool.reset();
        self.bus.write32(op + offsets::CONFIGFLAG, 0);
        self.bus
            .write32(op + offsets::USBSTS, UsbSts::INTERRUPTS.bits());
        info!("EHCI stopped");
        Ok(())
    }

    /// Controller interrupt service routine
    ///
    /// Call from the USB interrupt vector. Acknowledges the pending sources
    /// and runs the completion, error and root-port engines for them.
    pub fn irq_handler(&self) {
        if !self.initialized.load(Ordering::Acquire) {
            return;
        }
        let op = self.op();
        let enabled = UsbSts::from_bits_retain(self.bus.read32(op + offsets::USBINTR));
        let pending = self.status() & enabled & UsbSts::INTERRUPTS;
        if pending.is_empty() {
            return;
        }
        self.bus.write32(op + offsets::USBSTS, pending.bits());
        trace!("irq {:#x}", pending.bits());

        if pending.intersects(UsbSts::USB_INTERRUPT | UsbSts::USB_ERROR_INTERRUPT) {
            self.process_completions();
        }
        if pending.contains(UsbSts::USB_ERROR_INTERRUPT) {
            self.process_errors();
        }
        if pending.contains(UsbSts::PORT_CHANGE_DETECT) {
            self.process_port_changes();
        }
        if pending.contains(UsbSts::HOST_SYSTEM_ERROR) {
            error!("host system error, failing all transfers");
            self.abort_all(UsbError::HostSystemError);
        }
    }

    /// Open a pipe for one endpoint
    ///
    /// Fails with `NoResources` when the pipe table is full.
    pub fn pipe_open(&self, config: EndpointConfig) -> Result<PipeHandle> {
        config.validate()?;
        for (index, pipe) in self.pipes.iter().enumerate() {
            if pipe.claim() {
                // Safety: freshly claimed, so no transfer can be in flight
                P::critical_section(|| unsafe { pipe.set_config(config) });
                debug!(
                    "pipe {} open: dev {} ep {:#x}",
                    index,
                    config.device_address,
                    config.address()
                );
                return Ok(PipeHandle::new(index));
            }
        }
        warn!("pipe table exhausted");
        Err(UsbError::NoResources)
    }

    /// Cancel any outstanding transfer and free the pipe
    pub fn pipe_close(&self, handle: PipeHandle) -> Result<()> {
        let (_, pipe) = self.open_pipe(handle)?;
        self.cancel(handle)?;
        // Wait out a blocking caller that is still unwinding
        let _guard = MutexGuard::lock(&pipe.lock);
        pipe.release();
        Ok(())
    }

    /// Update device address and max packet size of an idle pipe
    ///
    /// Used on endpoint 0 after SET_ADDRESS and once `bMaxPacketSize0` is
    /// known. Resets the toggle.
    pub fn pipe_reconfigure(&self, handle: PipeHandle, dev_addr: u8, max_packet: u16) -> Result<()> {
        let (_, pipe) = self.open_pipe(handle)?;
        let mut config = pipe.config();
        config.device_address = dev_addr;
        config.max_packet_size = max_packet;
        config.validate()?;

        pipe.begin()?;
        // Safety: holding the in-flight flag with nothing linked
        P::critical_section(|| unsafe { pipe.set_config(config) });
        pipe.abandon();
        Ok(())
    }

    /// Blocking control transfer
    ///
    /// `buffer` must hold at least `setup.length` bytes. Returns the bytes
    /// moved in the data stage.
    pub fn control_transfer(
        &self,
        handle: PipeHandle,
        setup: &SetupPacket,
        buffer: Option<&mut DmaBuffer>,
    ) -> Result<usize> {
        let data = Self::control_data(setup, buffer)?;
        self.transfer_blocking(
            handle,
            Request::Control(setup),
            data,
            self.config.control_timeout_ms,
        )
    }

    /// Queue a control transfer, completing through `callback`
    pub fn control_transfer_async(
        &self,
        handle: PipeHandle,
        setup: &SetupPacket,
        buffer: Option<&mut DmaBuffer>,
        callback: CompletionCallback,
        arg: usize,
    ) -> Result<()> {
        let data = Self::control_data(setup, buffer)?;
        self.transfer_async(handle, Request::Control(setup), data, callback, arg)
    }

    /// Blocking bulk transfer of `len` bytes
    pub fn bulk_transfer(
        &self,
        handle: PipeHandle,
        buffer: &mut DmaBuffer,
        len: usize,
        timeout_ms: u32,
    ) -> Result<usize> {
        let data = self.single_data(handle, TransferType::Bulk, buffer, len)?;
        self.transfer_blocking(handle, Request::Single, data, timeout_ms)
    }

    /// Queue a bulk transfer, completing through `callback`
    pub fn bulk_transfer_async(
        &self,
        handle: PipeHandle,
        buffer: &mut DmaBuffer,
        len: usize,
        callback: CompletionCallback,
        arg: usize,
    ) -> Result<()> {
        let data = self.single_data(handle, TransferType::Bulk, buffer, len)?;
        self.transfer_async(handle, Request::Single, data, callback, arg)
    }

    /// Blocking interrupt transfer of `len` bytes
    pub fn interrupt_transfer(
        &self,
        handle: PipeHandle,
        buffer: &mut DmaBuffer,
        len: usize,
        timeout_ms: u32,
    ) -> Result<usize> {
        let data = self.single_data(handle, TransferType::Interrupt, buffer, len)?;
        self.transfer_blocking(handle, Request::Single, data, timeout_ms)
    }

    /// Queue an interrupt transfer, completing through `callback`
    pub fn interrupt_transfer_async(
        &self,
        handle: PipeHandle,
        buffer: &mut DmaBuffer,
        len: usize,
        callback: CompletionCallback,
        arg: usize,
    ) -> Result<()> {
        let data = self.single_data(handle, TransferType::Interrupt, buffer, len)?;
        self.transfer_async(handle, Request::Single, data, callback, arg)
    }

    /// Configuration in use
    pub fn config(&self) -> &EhciConfig {
        &self.config
    }

    /// Whether the controller is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Root ports reported by HCSPARAMS (0 before `init`)
    pub fn port_count(&self) -> u8 {
        self.n_ports.load(Ordering::Acquire)
    }

    /// Controller memory
    pub fn memory(&self) -> &'a HcdMemory<N_QH, N_QTD> {
        self.mem
    }

    /// Descriptor arena occupancy
    pub fn pool_stats(&self) -> PoolStats {
        self.mem.pool.stats()
    }

    /// Pipe state, if the handle refers to an open pipe
    pub fn pipe(&self, handle: PipeHandle) -> Option<&Pipe<P>> {
        self.open_pipe(handle).ok().map(|(_, pipe)| pipe)
    }

    pub(crate) fn op(&self) -> usize {
        self.op.load(Ordering::Acquire)
    }

    pub(crate) fn status(&self) -> UsbSts {
        UsbSts::from_bits_retain(self.bus.read32(self.op() + offsets::USBSTS))
    }

    const fn portsc_at(op: usize, port: u8) -> usize {
        op + offsets::PORTSC + 4 * port as usize
    }

    /// PORTSC offset of a root port
    pub(crate) fn portsc(&self, port: u8) -> Result<usize> {
        if port < self.port_count() {
            Ok(Self::portsc_at(self.op(), port))
        } else {
            Err(UsbError::InvalidParameter)
        }
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(UsbError::NotInitialized)
        }
    }

    pub(crate) fn open_pipe(&self, handle: PipeHandle) -> Result<(usize, &Pipe<P>)> {
        let index = handle.index();
        match self.pipes.get(index) {
            Some(pipe) if pipe.is_open() => Ok((index, pipe)),
            _ => Err(UsbError::InvalidParameter),
        }
    }

    fn control_data(setup: &SetupPacket, buffer: Option<&mut DmaBuffer>) -> Result<DataStage> {
        let len = setup.length as usize;
        match buffer {
            _ if len == 0 => Ok(DataStage::NONE),
            Some(buf) if buf.len() >= len => Ok(DataStage {
                addr: buf.addr(),
                len,
            }),
            _ => Err(UsbError::InvalidParameter),
        }
    }

    fn single_data(
        &self,
        handle: PipeHandle,
        expected: TransferType,
        buffer: &mut DmaBuffer,
        len: usize,
    ) -> Result<DataStage> {
        let (_, pipe) = self.open_pipe(handle)?;
        if pipe.config().transfer_type != expected || len > buffer.len() {
            return Err(UsbError::InvalidParameter);
        }
        Ok(DataStage {
            addr: buffer.addr(),
            len,
        })
    }

    fn transfer_blocking(
        &self,
        handle: PipeHandle,
        request: Request<'_>,
        data: DataStage,
        timeout_ms: u32,
    ) -> Result<usize> {
        let (index, pipe) = self.open_pipe(handle)?;
        self.ensure_running()?;

        let _guard = MutexGuard::lock(&pipe.lock);
        pipe.begin()?;
        pipe.arm_blocking();
        if let Err(e) = self.submit(index, pipe, request, data) {
            pipe.abandon();
            return Err(e);
        }
        let result = pipe.wait(timeout_ms);
        if result == Err(UsbError::Timeout) {
            warn!("pipe {} timed out after {} ms", index, timeout_ms);
        }
        result
    }

    fn transfer_async(
        &self,
        handle: PipeHandle,
        request: Request<'_>,
        data: DataStage,
        callback: CompletionCallback,
        arg: usize,
    ) -> Result<()> {
        let (index, pipe) = self.open_pipe(handle)?;
        self.ensure_running()?;

        pipe.begin()?;
        pipe.arm_callback(callback, arg);
        if let Err(e) = self.submit(index, pipe, request, data) {
            pipe.abandon();
            return Err(e);
        }
        Ok(())
    }

    /// Build and link one transfer for a pipe already in flight
    fn submit(&self, index: usize, pipe: &Pipe<P>, request: Request<'_>, data: DataStage) -> Result<()> {
        let ep = pipe.config();
        let pool = &self.mem.pool;
        let (qh, direction) = match request {
            Request::Control(setup) => (
                builder::build_control::<P, N_QH, N_QTD>(pool, &ep, index, setup, data)?,
                setup.direction(),
            ),
            Request::Single => (
                builder::build_single::<P, N_QH, N_QTD>(pool, &ep, index, pipe.toggle(), data)?,
                ep.direction,
            ),
        };
        if direction == Direction::In {
            pipe.set_in_buffer(data.addr, data.len);
        } else {
            pipe.set_in_buffer(0, 0);
        }
        pipe.set_qh_index(qh.index());

        let kind = ScheduleKind::for_transfer(ep.transfer_type);
        P::critical_section(|| {
            // A disconnect handled since `begin` would never see this QH
            if pipe.is_disconnected() {
                self.release_qh(qh);
                return Err(UsbError::DeviceDisconnected);
            }
            match kind {
                ScheduleKind::Async => schedule::link_qh::<P, N_QH, N_QTD>(self.mem, kind, qh),
                ScheduleKind::Periodic => {
                    let _stopped = ScheduleGuard::disable(
                        &self.bus,
                        self.op(),
                        UsbCmd::PERIODIC_SCHEDULE_ENABLE,
                    );
                    schedule::link_qh::<P, N_QH, N_QTD>(self.mem, kind, qh);
                }
            }
            trace!("pipe {} queued QH {}", index, qh.index());
            Ok(())
        })
    }
}
