//! Shared test utilities for ehci-usbh integration tests
//!
//! A [`Harness`] wires a [`MockEhci`] register file, leaked controller memory
//! and the [`StdOsal`] layer into a running driver. The simulation helpers
//! play the controller's part on the descriptors: they find what the driver
//! linked and retire it the way hardware would.

#![allow(dead_code)]

pub mod mock_hardware;
pub mod std_osal;

pub use mock_hardware::MockEhci;
pub use std_osal::StdOsal;

use ehci_usbh::dma::{QhHandle, QtdHandle};
use ehci_usbh::ehci::token;
use ehci_usbh::ehci::UsbSts;
use ehci_usbh::{
    DmaBuffer, DmaCache, EhciConfig, EhciHcd, HcdMemory, Osal, PortListener, PortSpeed, Result,
};
use std::sync::atomic::Ordering;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Driver type under test
pub type TestHcd<const N_QH: usize, const N_QTD: usize, const N_PIPES: usize> =
    EhciHcd<'static, &'static MockEhci, StdOsal, N_QH, N_QTD, N_PIPES>;

/// A running driver on simulated hardware
pub struct Harness<const N_QH: usize, const N_QTD: usize, const N_PIPES: usize> {
    pub hw: &'static MockEhci,
    pub mem: &'static HcdMemory<N_QH, N_QTD>,
    pub hcd: &'static TestHcd<N_QH, N_QTD, N_PIPES>,
    pub ports: &'static PortLog,
}

/// Harness with room for every test scenario
pub type TestHarness = Harness<8, 24, 8>;

/// Standard configuration for tests: short port reset
pub fn test_config() -> EhciConfig {
    EhciConfig::new().with_port_reset_ms(1)
}

impl<const N_QH: usize, const N_QTD: usize, const N_PIPES: usize> Harness<N_QH, N_QTD, N_PIPES> {
    /// Driver on one port with a high-speed device attached, not yet initialized
    pub fn build(config: EhciConfig) -> Self {
        let _ = env_logger_init();
        let hw: &'static MockEhci = Box::leak(Box::new(MockEhci::new(2)));
        hw.plug(0, PortSpeed::High);
        let mem: &'static HcdMemory<N_QH, N_QTD> = Box::leak(Box::new(HcdMemory::new()));
        let ports: &'static PortLog = Box::leak(Box::new(PortLog::default()));
        let hcd: &'static TestHcd<N_QH, N_QTD, N_PIPES> = Box::leak(Box::new(
            <TestHcd<N_QH, N_QTD, N_PIPES>>::new(hw, mem, config).with_listener(ports),
        ));
        Self {
            hw,
            mem,
            hcd,
            ports,
        }
    }

    /// Running driver with the default test configuration
    pub fn start() -> Self {
        Self::start_with(test_config())
    }

    /// Running driver with `config`
    pub fn start_with(config: EhciConfig) -> Self {
        let harness = Self::build(config);
        harness.hcd.init().unwrap();
        harness
    }

    /// Raise `bits` and run the interrupt handler as the USB vector would
    pub fn fire(&self, bits: UsbSts) {
        self.hw.raise(bits);
        StdOsal::critical_section(|| self.hcd.irq_handler());
    }

    /// Queue Heads currently linked on the async list, in service order
    pub fn async_list(&self) -> Vec<QhHandle> {
        let head = self.mem.async_head();
        let head_bus = bus(head);
        let mut out = Vec::new();
        let mut link = head.horizontal_link.load(Ordering::Acquire);
        while link & 1 == 0 && link & !0x1F != head_bus {
            let qh = self.mem.pool().qh_from_bus::<StdOsal>(link).expect("link outside arena");
            out.push(qh);
            link = self.mem.pool().qh(qh).horizontal_link.load(Ordering::Acquire);
        }
        out
    }

    /// Queue Heads currently linked on the periodic list
    pub fn periodic_list(&self) -> Vec<QhHandle> {
        let mut out = Vec::new();
        let mut link = self.mem.periodic_head().horizontal_link.load(Ordering::Acquire);
        while link & 1 == 0 {
            let qh = self.mem.pool().qh_from_bus::<StdOsal>(link).expect("link outside arena");
            out.push(qh);
            link = self.mem.pool().qh(qh).horizontal_link.load(Ordering::Acquire);
        }
        out
    }

    /// qTDs attached to a Queue Head, in chain order
    pub fn chain(&self, qh: QhHandle) -> Vec<QtdHandle> {
        let pool = self.mem.pool();
        let mut out = Vec::new();
        let mut link = pool.qh(qh).first_qtd.load(Ordering::Acquire);
        while let Some(td) = pool.qtd_from_bus::<StdOsal>(link) {
            out.push(td);
            link = pool.qtd(td).next_qtd.load(Ordering::Acquire);
        }
        out
    }

    /// Wait until `count` Queue Heads are linked on the async list
    pub fn wait_async(&self, count: usize) -> Vec<QhHandle> {
        wait_until(|| {
            let list = StdOsal::critical_section(|| self.async_list());
            (list.len() >= count).then_some(list)
        })
    }

    /// Wait until `count` Queue Heads are linked on the periodic list
    pub fn wait_periodic(&self, count: usize) -> Vec<QhHandle> {
        wait_until(|| {
            let list = StdOsal::critical_section(|| self.periodic_list());
            (list.len() >= count).then_some(list)
        })
    }

    /// Retire one qTD as hardware would after moving `transferred` bytes
    pub fn complete_qtd(&self, td: QtdHandle, transferred: usize) {
        let qtd = self.mem.pool().qtd(td);
        let length = qtd.length.load(Ordering::Relaxed) as usize;
        let residual = length.saturating_sub(transferred) as u32;
        let tok = qtd.token.load(Ordering::Acquire);
        let tok = (tok & !token::STATUS_ACTIVE & !(token::TOTAL_BYTES_MASK << token::TOTAL_BYTES_SHIFT))
            | (residual << token::TOTAL_BYTES_SHIFT);
        qtd.token.store(tok, Ordering::Release);
    }

    /// Halt a qTD with `status` error bits and error counter `cerr`
    pub fn halt_qtd(&self, td: QtdHandle, status: u32, cerr: u32) {
        let qtd = self.mem.pool().qtd(td);
        let tok = qtd.token.load(Ordering::Acquire);
        let tok = (tok & !token::STATUS_ACTIVE & !(token::ERROR_COUNTER_MASK << token::ERROR_COUNTER_SHIFT))
            | token::STATUS_HALTED
            | status
            | (cerr << token::ERROR_COUNTER_SHIFT);
        qtd.token.store(tok, Ordering::Release);
    }

    /// Leave the overlay idle with data toggle `toggle`, as after the last qTD
    pub fn settle_overlay(&self, qh: QhHandle, toggle: bool) {
        let qh = self.mem.pool().qh(qh);
        qh.next_qtd.store(1, Ordering::Relaxed);
        let tok = if toggle { token::DATA_TOGGLE } else { 0 };
        qh.token.store(tok, Ordering::Release);
    }

    /// Halt the overlay, as hardware does when a qTD halts
    pub fn halt_overlay(&self, qh: QhHandle, toggle: bool) {
        let tok = token::STATUS_HALTED | if toggle { token::DATA_TOGGLE } else { 0 };
        self.mem.pool().qh(qh).token.store(tok, Ordering::Release);
    }

    /// Overlay toggle the driver loaded when it built the Queue Head
    pub fn initial_toggle(&self, qh: QhHandle) -> bool {
        self.mem.pool().qh(qh).data_toggle()
    }

    /// Complete a single-qTD bulk/interrupt transfer moving `bytes` in
    /// packets of `max_packet`, flipping the toggle once per packet
    pub fn complete_single(&self, qh: QhHandle, bytes: usize, max_packet: usize) {
        let packets = if bytes == 0 { 1 } else { bytes.div_ceil(max_packet) };
        let toggle = self.initial_toggle(qh) ^ (packets % 2 == 1);
        for td in self.chain(qh) {
            self.complete_qtd(td, bytes);
        }
        self.settle_overlay(qh, toggle);
    }

    /// Complete every stage of a control transfer with `bytes` of data
    pub fn complete_control(&self, qh: QhHandle, bytes: usize) {
        for td in self.chain(qh) {
            let qtd = self.mem.pool().qtd(td);
            let moved = if qtd.pid() == token::PID_SETUP { 8 } else { bytes };
            self.complete_qtd(td, moved);
        }
        self.settle_overlay(qh, true);
    }
}

/// Bus address of a descriptor, as the driver computes it
pub fn bus<T>(descriptor: &T) -> u32 {
    StdOsal::bus_address(descriptor as *const T as usize)
}

/// Poll `f` until it yields, failing the test after five seconds
pub fn wait_until<T>(mut f: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = f() {
            return value;
        }
        assert!(Instant::now() < deadline, "timed out waiting for the driver");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[repr(C, align(32))]
struct Aligned([u8; 4096]);

/// Cache-line aligned DMA buffer of `len` bytes that lives for the test run
pub fn dma_buffer(len: usize) -> DmaBuffer {
    let region: &'static mut Aligned = Box::leak(Box::new(Aligned([0; 4096])));
    DmaBuffer::from_static(&mut region.0[..len])
}

/// Root-port notifications seen by the listener
#[derive(Default)]
pub struct PortLog {
    pub events: Mutex<Vec<(bool, u8)>>,
}

impl PortListener for PortLog {
    fn on_port_connected(&self, port: u8) {
        self.events.lock().unwrap().push((true, port));
    }

    fn on_port_disconnected(&self, port: u8) {
        self.events.lock().unwrap().push((false, port));
    }
}

/// Collects async completions; pass [`Completions::arg`] with [`record`]
#[derive(Default)]
pub struct Completions {
    results: Mutex<Vec<Result<usize>>>,
    cond: Condvar,
}

impl Completions {
    /// Leaked collector usable as a callback argument
    pub fn leak() -> &'static Self {
        Box::leak(Box::default())
    }

    /// Callback argument referring to this collector
    pub fn arg(&'static self) -> usize {
        self as *const Self as usize
    }

    /// Results delivered so far
    pub fn results(&self) -> Vec<Result<usize>> {
        self.results.lock().unwrap().clone()
    }

    /// Block until `n` results arrived
    pub fn wait_for(&self, n: usize) -> Vec<Result<usize>> {
        let guard = self.results.lock().unwrap();
        let (guard, timeout) = self
            .cond
            .wait_timeout_while(guard, Duration::from_secs(5), |r| r.len() < n)
            .unwrap();
        assert!(!timeout.timed_out(), "completion callback never ran");
        guard.clone()
    }
}

/// Completion callback recording into the [`Completions`] behind `arg`
pub fn record(arg: usize, result: Result<usize>) {
    // Safety: arg comes from Completions::arg on a leaked collector
    let completions = unsafe { &*(arg as *const Completions) };
    completions.results.lock().unwrap().push(result);
    completions.cond.notify_all();
}

fn env_logger_init() -> std::result::Result<(), log::SetLoggerError> {
    struct Stderr;
    impl log::Log for Stderr {
        fn enabled(&self, metadata: &log::Metadata) -> bool {
            metadata.level() <= log::Level::Debug
        }
        fn log(&self, record: &log::Record) {
            if self.enabled(record.metadata()) {
                eprintln!("[{}] {}", record.level(), record.args());
            }
        }
        fn flush(&self) {}
    }
    static LOGGER: Stderr = Stderr;
    log::set_logger(&LOGGER).map(|()| log::set_max_level(log::LevelFilter::Debug))
}
