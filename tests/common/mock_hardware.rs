//! Register-file model of an EHCI controller
//!
//! Emulates the side effects the driver depends on: HCRESET self-clears,
//! HCHalted and the schedule status bits follow USBCMD, USBSTS and PORTSC
//! change bits are write-1-to-clear, and releasing PR enables a connected
//! port the way the configured device speed dictates.

use ehci_usbh::ehci::{offsets, PortSc, UsbCmd, UsbSts};
use ehci_usbh::{PortSpeed, RegisterBus};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Operational register base (CAPLENGTH)
pub const CAPLENGTH: usize = 0x40;
/// HCIVERSION reported in the upper half of the first capability word
pub const HCIVERSION: u32 = 0x0100;

const WORDS: usize = 64;

/// Simulated controller registers
pub struct MockEhci {
    regs: [AtomicU32; WORDS],
    speeds: Mutex<[Option<PortSpeed>; 4]>,
    cmd_log: Mutex<Vec<u32>>,
}

impl MockEhci {
    /// Controller with `ports` root ports and port power control
    pub fn new(ports: u8) -> Self {
        let mock = Self {
            regs: [const { AtomicU32::new(0) }; WORDS],
            speeds: Mutex::new([None; 4]),
            cmd_log: Mutex::new(Vec::new()),
        };
        mock.set(offsets::CAPLENGTH, (HCIVERSION << 16) | CAPLENGTH as u32);
        // N_PORTS | PPC
        mock.set(offsets::HCSPARAMS, (ports as u32 & 0xF) | (1 << 4));
        // Programmable frame list, async park
        mock.set(offsets::HCCPARAMS, 0b110);
        mock.set_op(offsets::USBSTS, UsbSts::HC_HALTED.bits());
        mock
    }

    fn index(offset: usize) -> usize {
        assert_eq!(offset & 0x3, 0, "unaligned register access at {offset:#x}");
        offset / 4
    }

    fn get(&self, offset: usize) -> u32 {
        self.regs[Self::index(offset)].load(Ordering::SeqCst)
    }

    fn set(&self, offset: usize, value: u32) {
        self.regs[Self::index(offset)].store(value, Ordering::SeqCst);
    }

    fn set_op(&self, offset: usize, value: u32) {
        self.set(CAPLENGTH + offset, value);
    }

    /// Operational register value
    pub fn op(&self, offset: usize) -> u32 {
        self.get(CAPLENGTH + offset)
    }

    /// Current USBCMD
    pub fn usbcmd(&self) -> UsbCmd {
        UsbCmd::from_bits_retain(self.op(offsets::USBCMD))
    }

    /// Current USBSTS
    pub fn usbsts(&self) -> UsbSts {
        UsbSts::from_bits_retain(self.op(offsets::USBSTS))
    }

    /// PORTSC of a root port
    pub fn portsc(&self, port: u8) -> PortSc {
        PortSc::from_bits_retain(self.op(offsets::PORTSC + 4 * port as usize))
    }

    fn set_portsc(&self, port: u8, value: PortSc) {
        self.set_op(offsets::PORTSC + 4 * port as usize, value.bits());
    }

    /// Every value written to USBCMD since the last call
    pub fn take_cmd_log(&self) -> Vec<u32> {
        std::mem::take(&mut *self.cmd_log.lock().unwrap())
    }

    /// Raise USBSTS interrupt bits
    pub fn raise(&self, bits: UsbSts) {
        self.regs[Self::index(CAPLENGTH + offsets::USBSTS)].fetch_or(bits.bits(), Ordering::SeqCst);
    }

    fn line_state(speed: PortSpeed) -> PortSc {
        match speed {
            PortSpeed::Low => PortSc::LINE_STATUS_K_STATE,
            PortSpeed::Full | PortSpeed::High => PortSc::LINE_STATUS_J_STATE,
        }
    }

    fn speed_field(speed: PortSpeed) -> PortSc {
        match speed {
            PortSpeed::Full => PortSc::PORT_SPEED_FULL,
            PortSpeed::Low => PortSc::PORT_SPEED_LOW,
            PortSpeed::High => PortSc::PORT_SPEED_HIGH,
        }
    }

    /// Attach a device without raising a change
    pub fn plug(&self, port: u8, speed: PortSpeed) {
        self.speeds.lock().unwrap()[port as usize] = Some(speed);
        let sc = self.portsc(port) - PortSc::LINE_STATUS_MASK - PortSc::PORT_SPEED_MASK;
        self.set_portsc(
            port,
            sc | PortSc::CURRENT_CONNECT_STATUS | Self::line_state(speed) | Self::speed_field(speed),
        );
    }

    /// Attach a device and signal Port Change Detect
    pub fn connect(&self, port: u8, speed: PortSpeed) {
        self.plug(port, speed);
        self.set_portsc(port, self.portsc(port) | PortSc::CONNECT_STATUS_CHANGE);
        self.raise(UsbSts::PORT_CHANGE_DETECT);
    }

    /// Detach the device and signal Port Change Detect
    pub fn disconnect(&self, port: u8) {
        self.speeds.lock().unwrap()[port as usize] = None;
        let mut sc = self.portsc(port)
            - PortSc::CURRENT_CONNECT_STATUS
            - PortSc::LINE_STATUS_MASK
            - PortSc::PORT_SPEED_MASK;
        if sc.contains(PortSc::PORT_ENABLED) {
            sc = (sc - PortSc::PORT_ENABLED) | PortSc::PORT_ENABLE_CHANGE;
        }
        self.set_portsc(port, sc | PortSc::CONNECT_STATUS_CHANGE);
        self.raise(UsbSts::PORT_CHANGE_DETECT);
    }

    fn write_usbcmd(&self, value: u32) {
        self.cmd_log.lock().unwrap().push(value);
        let mut cmd = UsbCmd::from_bits_retain(value);
        if cmd.contains(UsbCmd::HC_RESET) {
            for offset in [offsets::USBINTR, offsets::CONFIGFLAG, offsets::USBMODE] {
                self.set_op(offset, 0);
            }
            self.set_op(offsets::USBSTS, UsbSts::HC_HALTED.bits());
            cmd = UsbCmd::empty();
        }
        self.set_op(offsets::USBCMD, cmd.bits());

        let running = cmd.contains(UsbCmd::RUN_STOP);
        let mut sts = self.usbsts()
            - UsbSts::HC_HALTED
            - UsbSts::ASYNC_SCHEDULE_STATUS
            - UsbSts::PERIODIC_SCHEDULE_STATUS;
        if !running {
            sts |= UsbSts::HC_HALTED;
        }
        if running && cmd.contains(UsbCmd::ASYNC_SCHEDULE_ENABLE) {
            sts |= UsbSts::ASYNC_SCHEDULE_STATUS;
        }
        if running && cmd.contains(UsbCmd::PERIODIC_SCHEDULE_ENABLE) {
            sts |= UsbSts::PERIODIC_SCHEDULE_STATUS;
        }
        self.set_op(offsets::USBSTS, sts.bits());
    }

    fn write_portsc(&self, port: u8, value: u32) {
        let old = self.portsc(port);
        let written = PortSc::from_bits_retain(value);

        // Read-only state comes from the device model
        let status = PortSc::CURRENT_CONNECT_STATUS
            | PortSc::OVER_CURRENT_ACTIVE
            | PortSc::LINE_STATUS_MASK
            | PortSc::PORT_SPEED_MASK;
        let cleared = old & PortSc::CHANGE_BITS & written;
        let changes = (old & PortSc::CHANGE_BITS) - cleared;

        let mut new = (written - status - PortSc::CHANGE_BITS) | (old & status) | changes;
        // Software can disable a port but never enable it
        if !old.contains(PortSc::PORT_ENABLED) {
            new -= PortSc::PORT_ENABLED;
        }
        if old.contains(PortSc::PORT_RESET) && !written.contains(PortSc::PORT_RESET) {
            let speed = self.speeds.lock().unwrap()[port as usize];
            let enable = match speed {
                Some(PortSpeed::High) => true,
                Some(_) => self.integrated_tt(),
                None => false,
            };
            if enable {
                new |= PortSc::PORT_ENABLED;
            }
        }
        self.set_portsc(port, new);
    }

    /// TDI/ChipIdea cores enable full/low-speed ports themselves
    fn integrated_tt(&self) -> bool {
        self.op(offsets::USBMODE) & 0b11 == 0b11
    }
}

impl RegisterBus for MockEhci {
    fn read32(&self, offset: usize) -> u32 {
        self.get(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        if offset < CAPLENGTH {
            // Capability registers are read-only
            return;
        }
        match offset - CAPLENGTH {
            offsets::USBCMD => self.write_usbcmd(value),
            offsets::USBSTS => {
                let clear = value & UsbSts::INTERRUPTS.bits();
                self.regs[Self::index(offset)].fetch_and(!clear, Ordering::SeqCst);
            }
            op if (offsets::PORTSC..offsets::PORTSC + 16).contains(&op) => {
                self.write_portsc(((op - offsets::PORTSC) / 4) as u8, value)
            }
            _ => self.set(offset, value),
        }
    }
}
