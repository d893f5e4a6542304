//! Async and periodic schedule management
//!
//! Both schedules hang off a sentinel Queue Head that never carries a
//! transfer. New Queue Heads are spliced in directly behind the sentinel, so
//! the most recently queued endpoint is serviced first.
//!
//! Interrupt endpoints all share the single periodic sentinel that every
//! frame list slot points at, whatever their requested interval.

use super::qtd::token;
use super::register::{RegisterBus, RegisterTimeout};
use super::{offsets, timeouts, QueueHead, QueueTD, UsbCmd, UsbSts};
use crate::dma::{DmaCache, HcdMemory, QhHandle, FRAME_LIST_LEN};
use crate::transfer::TransferType;
use core::sync::atomic::{AtomicU32, Ordering};

/// Which hardware list a Queue Head lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ScheduleKind {
    /// Control and bulk endpoints
    Async,
    /// Interrupt endpoints
    Periodic,
}

impl ScheduleKind {
    /// List serving a transfer type
    pub const fn for_transfer(transfer_type: TransferType) -> Self {
        match transfer_type {
            TransferType::Interrupt | TransferType::Isochronous => Self::Periodic,
            TransferType::Control | TransferType::Bulk => Self::Async,
        }
    }

    /// USBCMD enable bit for this list
    pub const fn enable_bit(self) -> UsbCmd {
        match self {
            Self::Async => UsbCmd::ASYNC_SCHEDULE_ENABLE,
            Self::Periodic => UsbCmd::PERIODIC_SCHEDULE_ENABLE,
        }
    }

    /// USBSTS bit that follows [`ScheduleKind::enable_bit`]
    pub const fn status_bit(self) -> UsbSts {
        match self {
            Self::Async => UsbSts::ASYNC_SCHEDULE_STATUS,
            Self::Periodic => UsbSts::PERIODIC_SCHEDULE_STATUS,
        }
    }
}

fn flush<C: DmaCache>(qh: &QueueHead) {
    C::clean(qh as *const QueueHead as usize, core::mem::size_of::<QueueHead>());
}

fn flush_link<C: DmaCache>(link: &AtomicU32) {
    C::clean(link as *const AtomicU32 as usize, 4);
}

/// Sentinel for a list
pub(crate) fn head<const N_QH: usize, const N_QTD: usize>(
    mem: &HcdMemory<N_QH, N_QTD>,
    kind: ScheduleKind,
) -> &QueueHead {
    match kind {
        ScheduleKind::Async => &mem.async_head,
        ScheduleKind::Periodic => &mem.periodic_head,
    }
}

/// Bus address of a sentinel
pub(crate) fn head_bus<C: DmaCache, const N_QH: usize, const N_QTD: usize>(
    mem: &HcdMemory<N_QH, N_QTD>,
    kind: ScheduleKind,
) -> u32 {
    C::bus_address(head(mem, kind) as *const QueueHead as usize)
}

/// Prepare both sentinels and the frame list
///
/// Returns the values for ASYNCLISTADDR and PERIODICLISTBASE.
pub(crate) fn init_schedules<C: DmaCache, const N_QH: usize, const N_QTD: usize>(
    mem: &HcdMemory<N_QH, N_QTD>,
) -> (u32, u32) {
    let async_bus = head_bus::<C, N_QH, N_QTD>(mem, ScheduleKind::Async);
    let periodic_bus = head_bus::<C, N_QH, N_QTD>(mem, ScheduleKind::Periodic);

    // Async sentinel: circular, reclamation head, never executes
    let a = &mem.async_head;
    a.clear();
    a.horizontal_link
        .store(async_bus | QueueHead::TYPE_QH, Ordering::Relaxed);
    a.set_head_of_list();
    a.reset_overlay();
    a.token.store(token::STATUS_HALTED, Ordering::Relaxed);
    a.first_qtd.store(QueueTD::TERMINATE, Ordering::Relaxed);
    flush::<C>(a);

    // Periodic sentinel: end of list, never executes
    let p = &mem.periodic_head;
    p.clear();
    p.horizontal_link.store(QueueHead::TERMINATE, Ordering::Relaxed);
    p.reset_overlay();
    p.token.store(token::STATUS_HALTED, Ordering::Relaxed);
    p.first_qtd.store(QueueTD::TERMINATE, Ordering::Relaxed);
    flush::<C>(p);

    for slot in &mem.frame_list {
        slot.store(periodic_bus | QueueHead::TYPE_QH, Ordering::Relaxed);
    }
    C::clean(
        mem.frame_list.as_ptr() as usize,
        FRAME_LIST_LEN * core::mem::size_of::<AtomicU32>(),
    );

    let frame_list_bus = C::bus_address(mem.frame_list.as_ptr() as usize);
    (async_bus, frame_list_bus)
}

/// Splice a built Queue Head in behind the sentinel
///
/// Caller holds the controller critical section; for the periodic list the
/// schedule must also be disabled (see [`ScheduleGuard`]).
pub(crate) fn link_qh<C: DmaCache, const N_QH: usize, const N_QTD: usize>(
    mem: &HcdMemory<N_QH, N_QTD>,
    kind: ScheduleKind,
    qh: QhHandle,
) {
    let sentinel = head(mem, kind);
    let new = mem.pool.qh(qh);

    new.horizontal_link.store(
        sentinel.horizontal_link.load(Ordering::Acquire),
        Ordering::Release,
    );
    flush::<C>(new);

    let bus = mem.pool.qh_bus::<C>(qh) | QueueHead::TYPE_QH;
    sentinel.horizontal_link.store(bus, Ordering::Release);
    flush_link::<C>(&sentinel.horizontal_link);
}

/// What to do with a Queue Head met during a walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Visit {
    /// Leave it linked
    Keep,
    /// Unlink it and report it back
    Unlink,
}

/// Walk a list, unlinking the Queue Heads `decide` selects
///
/// Unlinked handles are appended to `out` and remain allocated; the caller
/// retires them. The back-pointer makes unlinking safe mid-walk. Stops at
/// the terminate bit (periodic) or on wrapping back to the sentinel (async).
pub(crate) fn unlink_where<C: DmaCache, const N_QH: usize, const N_QTD: usize>(
    mem: &HcdMemory<N_QH, N_QTD>,
    kind: ScheduleKind,
    out: &mut heapless::Vec<QhHandle, N_QH>,
    mut decide: impl FnMut(QhHandle, &QueueHead) -> Visit,
) {
    let sentinel_bus = head_bus::<C, N_QH, N_QTD>(mem, kind);
    let mut bp: &AtomicU32 = &head(mem, kind).horizontal_link;

    // A corrupted list cannot hold more than the whole pool
    for _ in 0..=N_QH {
        let link = bp.load(Ordering::Acquire);
        if link & QueueHead::TERMINATE != 0
            || link & QueueHead::LINK_ADDR_MASK == sentinel_bus
        {
            return;
        }
        let Some(handle) = mem.pool.qh_from_bus::<C>(link) else {
            error!("schedule link {:#x} outside QH arena", link);
            return;
        };
        let qh = mem.pool.qh(handle);
        C::invalidate(qh as *const QueueHead as usize, core::mem::size_of::<QueueHead>());

        match decide(handle, qh) {
            Visit::Keep => bp = &qh.horizontal_link,
            Visit::Unlink => {
                bp.store(qh.horizontal_link.load(Ordering::Acquire), Ordering::Release);
                flush_link::<C>(bp);
                if out.push(handle).is_err() {
                    return;
                }
            }
        }
    }
}

/// Disables schedules for the guard's lifetime, restoring what was enabled
///
/// Stopping hardware progress is what makes calling-context unlinking safe;
/// the previous enable bits come back on drop.
pub(crate) struct ScheduleGuard<'b, B: RegisterBus> {
    bus: &'b B,
    op: usize,
    restore: UsbCmd,
}

impl<'b, B: RegisterBus> ScheduleGuard<'b, B> {
    /// Clear `which` in USBCMD and wait for USBSTS to follow
    ///
    /// Spins only, so it may run in interrupt context.
    pub(crate) fn disable(bus: &'b B, op: usize, which: UsbCmd) -> Self {
        let cmd = UsbCmd::from_bits_retain(bus.read32(op + offsets::USBCMD));
        let restore = cmd & which;
        if !restore.is_empty() {
            bus.write32(op + offsets::USBCMD, (cmd - restore).bits());
            let mut pending = UsbSts::empty();
            if restore.contains(UsbCmd::ASYNC_SCHEDULE_ENABLE) {
                pending |= UsbSts::ASYNC_SCHEDULE_STATUS;
            }
            if restore.contains(UsbCmd::PERIODIC_SCHEDULE_ENABLE) {
                pending |= UsbSts::PERIODIC_SCHEDULE_STATUS;
            }
            let stopped = RegisterTimeout::spins(timeouts::SCHEDULE_SPINS).wait_for(|| {
                UsbSts::from_bits_retain(bus.read32(op + offsets::USBSTS)) & pending
                    == UsbSts::empty()
            });
            if stopped.is_err() {
                warn!("schedule status did not follow enable bits");
            }
        }
        Self { bus, op, restore }
    }
}

impl<B: RegisterBus> Drop for ScheduleGuard<'_, B> {
    fn drop(&mut self) {
        if !self.restore.is_empty() {
            let restore = self.restore;
            self.bus
                .modify32(self.op + offsets::USBCMD, |cmd| cmd | restore.bits());
        }
    }
}
