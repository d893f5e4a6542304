//! Completion and error engines
//!
//! Both run from [`EhciHcd::irq_handler`] only. They walk the async and
//! periodic lists, unlink the Queue Heads whose work is over, and retire
//! them: qTDs back to the arena, bytes counted, outcome classified, toggle
//! written back and the pipe's waiter resolved.

use super::controller::EhciHcd;
use super::qtd::{halt_reason, token};
use super::register::RegisterBus;
use super::schedule::{self, ScheduleKind, Visit};
use super::{QueueHead, QueueTD};
use crate::dma::{DmaCache, QhHandle};
use crate::error::{Result, UsbError};
use crate::osal::Osal;
use core::sync::atomic::Ordering;

/// Where the hardware stands on a qTD chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChainState {
    /// Some qTD is still active
    Pending,
    /// Every qTD retired cleanly
    Done,
    /// A qTD halted the queue
    Halted,
}

impl<'a, B, P, const N_QH: usize, const N_QTD: usize, const N_PIPES: usize>
    EhciHcd<'a, B, P, N_QH, N_QTD, N_PIPES>
where
    B: RegisterBus,
    P: Osal + DmaCache,
{
    /// Retire every Queue Head whose chain finished without error
    pub(crate) fn process_completions(&self) {
        let mut done = heapless::Vec::<QhHandle, N_QH>::new();
        for kind in [ScheduleKind::Async, ScheduleKind::Periodic] {
            schedule::unlink_where::<P, N_QH, N_QTD>(self.mem, kind, &mut done, |_, qh| {
                if !qh.is_active() && self.chain_state(qh) == ChainState::Done {
                    Visit::Unlink
                } else {
                    Visit::Keep
                }
            });
        }
        for qh in done {
            self.retire(qh, None);
        }
    }

    /// Retire every halted Queue Head
    ///
    /// A halted queue never resumes: the whole remaining chain is dropped,
    /// which also gives a control pipe a clean start at its next SETUP.
    pub(crate) fn process_errors(&self) {
        let mut halted = heapless::Vec::<QhHandle, N_QH>::new();
        for kind in [ScheduleKind::Async, ScheduleKind::Periodic] {
            schedule::unlink_where::<P, N_QH, N_QTD>(self.mem, kind, &mut halted, |_, qh| {
                if qh.is_halted() || self.chain_state(qh) == ChainState::Halted {
                    Visit::Unlink
                } else {
                    Visit::Keep
                }
            });
        }
        for qh in halted {
            self.retire(qh, None);
        }
    }

    /// Inspect the chain attached to a linked Queue Head
    pub(crate) fn chain_state(&self, qh: &QueueHead) -> ChainState {
        let pool = &self.mem.pool;
        let mut link = qh.first_qtd.load(Ordering::Acquire);
        for _ in 0..N_QTD {
            let Some(handle) = pool.qtd_from_bus::<P>(link) else {
                break;
            };
            let qtd = pool.qtd(handle);
            P::invalidate(qtd as *const QueueTD as usize, core::mem::size_of::<QueueTD>());
            if qtd.is_halted() {
                return ChainState::Halted;
            }
            if qtd.is_active() {
                return ChainState::Pending;
            }
            link = qtd.next_qtd.load(Ordering::Acquire);
        }
        ChainState::Done
    }

    /// Free a Queue Head and its chain without resolving anyone
    ///
    /// The QH must not be reachable from a schedule.
    pub(crate) fn release_qh(&self, handle: QhHandle) {
        let pool = &self.mem.pool;
        let mut link = pool.qh(handle).first_qtd.load(Ordering::Acquire);
        for _ in 0..N_QTD {
            let Some(td) = pool.qtd_from_bus::<P>(link) else {
                break;
            };
            link = pool.qtd(td).next_qtd.load(Ordering::Acquire);
            pool.free_qtd(td);
        }
        pool.free_qh(handle);
    }

    /// Finish the transfer an unlinked Queue Head carried
    ///
    /// `forced` overrides the hardware outcome (cancel, disconnect, shutdown).
    pub(crate) fn retire(&self, handle: QhHandle, forced: Option<UsbError>) {
        let pool = &self.mem.pool;
        let qh = pool.qh(handle);
        P::invalidate(qh as *const QueueHead as usize, core::mem::size_of::<QueueHead>());

        let mut total = qh.total_len.load(Ordering::Acquire) as usize;
        let mut halted = None;
        let mut link = qh.first_qtd.load(Ordering::Acquire);
        for _ in 0..N_QTD {
            let Some(td) = pool.qtd_from_bus::<P>(link) else {
                break;
            };
            let qtd = pool.qtd(td);
            P::invalidate(qtd as *const QueueTD as usize, core::mem::size_of::<QueueTD>());
            let tok = qtd.token.load(Ordering::Acquire);
            if token::pid(tok) != token::PID_SETUP {
                let untransferred = if tok & token::STATUS_ACTIVE != 0 {
                    qtd.length.load(Ordering::Relaxed) as usize
                } else {
                    qtd.residual()
                };
                total = total.saturating_sub(untransferred);
            }
            if halted.is_none() {
                halted = qtd.has_error();
            }
            link = qtd.next_qtd.load(Ordering::Acquire);
            pool.free_qtd(td);
        }

        let overlay = qh.token.load(Ordering::Acquire);
        let result: Result<usize> = match forced {
            Some(e) => Err(e),
            None => match halted {
                Some(e) => Err(e),
                None if overlay & token::STATUS_HALTED != 0 => Err(halt_reason(overlay)),
                None => Ok(total),
            },
        };
        let owner = qh.owner();
        let toggle = overlay & token::DATA_TOGGLE != 0;
        let control = qh.is_control();
        pool.free_qh(handle);

        let Some((index, pipe)) = owner.and_then(|i| self.pipes.get(i).map(|p| (i, p))) else {
            warn!("retired QH {} has no owner", handle.index());
            return;
        };
        match result {
            Err(UsbError::Stall) => pipe.set_toggle(false),
            _ if !control => pipe.set_toggle(toggle),
            _ => {}
        }
        if let Err(e) = result {
            if forced.is_none() {
                debug!("pipe {} halted: {}", index, e);
            }
        }
        if let Some((addr, len)) = pipe.take_in_buffer() {
            P::invalidate(addr, len);
        }
        pipe.finish(result);
    }
}
