//! Cancellation engine
//!
//! Calling context may only unlink from a live list while the hardware is
//! kept off it, so every abort runs under a [`ScheduleGuard`] that clears
//! both schedule enable bits and waits for the status bits to follow.

use super::controller::EhciHcd;
use super::register::RegisterBus;
use super::schedule::{self, ScheduleGuard, ScheduleKind, Visit};
use super::UsbCmd;
use crate::dma::{DmaCache, QhHandle};
use crate::error::{Result, UsbError};
use crate::osal::Osal;
use crate::pipe::{Pipe, PipeHandle};

impl<'a, B, P, const N_QH: usize, const N_QTD: usize, const N_PIPES: usize>
    EhciHcd<'a, B, P, N_QH, N_QTD, N_PIPES>
where
    B: RegisterBus,
    P: Osal + DmaCache,
{
    /// Abort the pipe's outstanding transfer
    ///
    /// The waiter is resolved with `ShuttingDown`. A pipe with nothing
    /// outstanding is left untouched and the call succeeds.
    pub fn cancel(&self, handle: PipeHandle) -> Result<()> {
        let (index, pipe) = self.open_pipe(handle)?;
        if !pipe.is_busy() {
            return Ok(());
        }
        let aborted = P::critical_section(|| self.abort_pipe(index, pipe, UsbError::ShuttingDown));
        debug!("pipe {} cancelled, {} QH retired", index, aborted);
        Ok(())
    }

    /// Unlink and retire every Queue Head `index` owns, resolving it with `err`
    ///
    /// Safe from interrupt context; calling context must hold the critical
    /// section.
    pub(crate) fn abort_pipe(&self, index: usize, pipe: &Pipe<P>, err: UsbError) -> usize {
        let kind = ScheduleKind::for_transfer(pipe.config().transfer_type);
        let mut found = heapless::Vec::<QhHandle, N_QH>::new();

        let _stopped = ScheduleGuard::disable(&self.bus, self.op(), UsbCmd::SCHEDULES);
        schedule::unlink_where::<P, N_QH, N_QTD>(self.mem, kind, &mut found, |_, qh| {
            if qh.owner() == Some(index) {
                Visit::Unlink
            } else {
                Visit::Keep
            }
        });
        for &qh in &found {
            self.retire(qh, Some(err));
        }
        found.len()
    }

    /// Unlink and retire everything on both lists
    pub(crate) fn abort_all(&self, err: UsbError) {
        let mut found = heapless::Vec::<QhHandle, N_QH>::new();

        let _stopped = ScheduleGuard::disable(&self.bus, self.op(), UsbCmd::SCHEDULES);
        for kind in [ScheduleKind::Async, ScheduleKind::Periodic] {
            schedule::unlink_where::<P, N_QH, N_QTD>(self.mem, kind, &mut found, |_, _| {
                Visit::Unlink
            });
        }
        if !found.is_empty() {
            warn!("aborting {} transfers: {}", found.len(), err);
        }
        for qh in found {
            self.retire(qh, Some(err));
        }
    }
}
