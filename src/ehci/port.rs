//! Root port control and monitoring
//!
//! Ports are numbered from 0 in PORTSC order. Writes always mask the
//! write-1-to-clear change bits so reading and writing back a PORTSC value
//! never acknowledges a change by accident.

use super::controller::EhciHcd;
use super::register::{RegisterBus, RegisterTimeout};
use super::{timeouts, PortSc, PortSpeed, SpeedDetection};
use crate::dma::DmaCache;
use crate::error::{Result, UsbError};
use crate::osal::Osal;
use crate::pipe::PipeHandle;

/// Receives root-port connect and disconnect notifications
///
/// Called from interrupt context. Disconnect is reported after every pipe on
/// the port has been failed with `DeviceDisconnected`.
pub trait PortListener {
    /// A device appeared on `port`
    fn on_port_connected(&self, port: u8);

    /// The device on `port` went away
    fn on_port_disconnected(&self, port: u8);
}

impl<'a, B, P, const N_QH: usize, const N_QTD: usize, const N_PIPES: usize>
    EhciHcd<'a, B, P, N_QH, N_QTD, N_PIPES>
where
    B: RegisterBus,
    P: Osal + DmaCache,
{
    fn read_port(&self, offset: usize) -> PortSc {
        PortSc::from_bits_retain(self.bus.read32(offset))
    }

    /// Write PORTSC preserving state and acknowledging only `ack`
    fn write_port(&self, offset: usize, value: PortSc, ack: PortSc) {
        let value = (value - PortSc::CHANGE_BITS) | (ack & PortSc::CHANGE_BITS);
        self.bus.write32(offset, value.bits());
    }

    /// Hand the port to the companion controller
    fn release_to_companion(&self, port: u8, offset: usize, sc: PortSc) -> Result<()> {
        info!("port {}: full/low-speed device, releasing to companion", port);
        self.write_port(offset, sc | PortSc::PORT_OWNER, PortSc::empty());
        Err(UsbError::PortError)
    }

    /// Reset the device on a root port
    ///
    /// Holds PR for the configured time, then waits for the controller to
    /// finish the reset. With standard speed detection a device that does not
    /// come out of reset enabled is not high speed and the port is handed to
    /// a companion controller (`PortError`).
    pub fn reset_port(&self, port: u8) -> Result<()> {
        self.ensure_running()?;
        let offset = self.portsc(port)?;
        let sc = self.read_port(offset);
        if !sc.contains(PortSc::CURRENT_CONNECT_STATUS) {
            return Err(UsbError::DeviceDisconnected);
        }

        let standard = self.config.speed_detection() == SpeedDetection::Standard;
        if standard && sc & PortSc::LINE_STATUS_MASK == PortSc::LINE_STATUS_K_STATE {
            return self.release_to_companion(port, offset, sc);
        }

        debug!("port {}: reset", port);
        self.write_port(
            offset,
            (sc - PortSc::PORT_ENABLED) | PortSc::PORT_RESET,
            PortSc::empty(),
        );
        P::sleep_ms(self.config.port_reset_ms());

        let sc = self.read_port(offset);
        self.write_port(offset, sc - PortSc::PORT_RESET, PortSc::empty());
        RegisterTimeout::new_ms::<P>(timeouts::PORT_RESET_CLEAR_MS)
            .wait_for(|| !self.read_port(offset).contains(PortSc::PORT_RESET))
            .map_err(|_| {
                warn!("port {}: reset did not complete", port);
                UsbError::PortError
            })?;

        let sc = self.read_port(offset);
        if !sc.contains(PortSc::PORT_ENABLED) {
            if standard && sc.contains(PortSc::CURRENT_CONNECT_STATUS) {
                return self.release_to_companion(port, offset, sc);
            }
            warn!("port {}: not enabled after reset", port);
            return Err(UsbError::PortError);
        }
        debug!("port {}: enabled", port);
        Ok(())
    }

    /// Speed of the device on a root port
    ///
    /// Meaningful after [`reset_port`](Self::reset_port).
    pub fn get_port_speed(&self, port: u8) -> Result<PortSpeed> {
        let offset = self.portsc(port)?;
        let sc = self.read_port(offset);
        if !sc.contains(PortSc::CURRENT_CONNECT_STATUS) {
            return Err(UsbError::DeviceDisconnected);
        }
        match self.config.speed_detection() {
            SpeedDetection::PortscSpeedField => {
                PortSpeed::from_portsc_field(sc.bits() >> PortSc::PORT_SPEED_SHIFT)
                    .ok_or(UsbError::PortError)
            }
            SpeedDetection::Standard => {
                if sc.contains(PortSc::PORT_ENABLED) {
                    Ok(PortSpeed::High)
                } else if sc & PortSc::LINE_STATUS_MASK == PortSc::LINE_STATUS_K_STATE {
                    Ok(PortSpeed::Low)
                } else {
                    Ok(PortSpeed::Full)
                }
            }
        }
    }

    /// Whether a device is attached to a root port
    pub fn get_port_connect_status(&self, port: u8) -> bool {
        self.portsc(port)
            .map(|offset| self.read_port(offset).contains(PortSc::CURRENT_CONNECT_STATUS))
            .unwrap_or(false)
    }

    /// Root-port monitor, run on Port Change Detect
    pub(crate) fn process_port_changes(&self) {
        for port in 0..self.port_count() {
            let Ok(offset) = self.portsc(port) else {
                continue;
            };
            let sc = self.read_port(offset);
            let changes = sc & PortSc::CHANGE_BITS;
            if changes.is_empty() {
                continue;
            }
            self.write_port(offset, sc, changes);

            if changes.contains(PortSc::OVER_CURRENT_CHANGE)
                && sc.contains(PortSc::OVER_CURRENT_ACTIVE)
            {
                warn!("port {}: over-current", port);
            }
            if !changes.contains(PortSc::CONNECT_STATUS_CHANGE) {
                continue;
            }
            if sc.contains(PortSc::CURRENT_CONNECT_STATUS) {
                info!("port {}: connected", port);
                if let Some(listener) = self.listener {
                    listener.on_port_connected(port);
                }
            } else {
                info!("port {}: disconnected", port);
                self.disconnect_port(port);
                if let Some(listener) = self.listener {
                    listener.on_port_disconnected(port);
                }
            }
        }
    }

    /// Fail every pipe on a root port with `DeviceDisconnected`
    ///
    /// Pipes stay open but refuse new transfers until closed.
    pub(crate) fn disconnect_port(&self, port: u8) {
        for (index, pipe) in self.pipes.iter().enumerate() {
            if !pipe.is_open() || pipe.config().root_port != port {
                continue;
            }
            pipe.mark_disconnected();
            if pipe.is_busy() {
                self.abort_pipe(index, pipe, UsbError::DeviceDisconnected);
            }
        }
    }

    /// Pipe handles open on a root port
    pub fn pipes_on_port(&self, port: u8) -> impl Iterator<Item = PipeHandle> + '_ {
        self.pipes
            .iter()
            .enumerate()
            .filter(move |(_, pipe)| pipe.is_open() && pipe.config().root_port == port)
            .map(|(index, _)| PipeHandle::new(index))
    }
}
