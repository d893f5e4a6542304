//! Transfer builder
//!
//! Turns one control, bulk or interrupt request into an initialized Queue
//! Head with its qTD chain attached, ready to be linked into a schedule.

use super::{Direction, SetupPacket, TransferType};
use crate::dma::{DescriptorPool, DmaCache, QhHandle, QtdHandle};
use crate::ehci::qtd::token;
use crate::ehci::{QueueHead, QueueTD};
use crate::error::{Result, UsbError};
use crate::pipe::EndpointConfig;
use core::sync::atomic::Ordering;

/// Data stage of a request
#[derive(Debug, Clone, Copy)]
pub(crate) struct DataStage {
    /// CPU address of the buffer
    pub addr: usize,
    /// Bytes to move
    pub len: usize,
}

impl DataStage {
    pub(crate) const NONE: Self = Self { addr: 0, len: 0 };
}

/// Frees everything it holds unless disarmed
struct ResourceGuard<'p, const N_QH: usize, const N_QTD: usize> {
    pool: &'p DescriptorPool<N_QH, N_QTD>,
    qh: Option<QhHandle>,
    qtds: heapless::Vec<QtdHandle, 3>,
}

impl<'p, const N_QH: usize, const N_QTD: usize> ResourceGuard<'p, N_QH, N_QTD> {
    fn new(pool: &'p DescriptorPool<N_QH, N_QTD>) -> Self {
        Self {
            pool,
            qh: None,
            qtds: heapless::Vec::new(),
        }
    }

    fn alloc_qh(&mut self) -> Result<QhHandle> {
        let qh = self.pool.alloc_qh().ok_or_else(|| {
            warn!("QH pool exhausted");
            UsbError::NoResources
        })?;
        self.qh = Some(qh);
        Ok(qh)
    }

    fn alloc_qtd(&mut self) -> Result<QtdHandle> {
        let qtd = self.pool.alloc_qtd().ok_or_else(|| {
            warn!("qTD pool exhausted");
            UsbError::NoResources
        })?;
        if self.qtds.push(qtd).is_err() {
            self.pool.free_qtd(qtd);
            return Err(UsbError::NoResources);
        }
        Ok(qtd)
    }

    /// Disarm the guard - resources will not be freed on drop
    fn disarm(mut self) {
        self.qh = None;
        self.qtds.clear();
    }
}

impl<const N_QH: usize, const N_QTD: usize> Drop for ResourceGuard<'_, N_QH, N_QTD> {
    fn drop(&mut self) {
        for qtd in &self.qtds {
            self.pool.free_qtd(*qtd);
        }
        if let Some(qh) = self.qh {
            self.pool.free_qh(qh);
        }
    }
}

fn pid_for(direction: Direction) -> u32 {
    match direction {
        Direction::In => token::PID_IN,
        Direction::Out => token::PID_OUT,
    }
}

fn link<C: DmaCache, const N_QH: usize, const N_QTD: usize>(
    pool: &DescriptorPool<N_QH, N_QTD>,
    from: QtdHandle,
    to: QtdHandle,
) {
    pool.qtd(from)
        .next_qtd
        .store(pool.qtd_bus::<C>(to), Ordering::Relaxed);
}

fn flush_qtds<C: DmaCache, const N_QH: usize, const N_QTD: usize>(
    pool: &DescriptorPool<N_QH, N_QTD>,
    qtds: &[QtdHandle],
) {
    for qtd in qtds {
        C::clean(pool.qtd(*qtd) as *const QueueTD as usize, core::mem::size_of::<QueueTD>());
    }
}

fn finish_qh<C: DmaCache, const N_QH: usize, const N_QTD: usize>(
    pool: &DescriptorPool<N_QH, N_QTD>,
    qh: QhHandle,
    first: QtdHandle,
    owner: usize,
    toggle: bool,
    total: usize,
) -> Result<()> {
    let head = pool.qh(qh);
    head.attach_chain(pool.qtd_bus::<C>(first), toggle)?;
    head.set_owner(owner);
    head.total_len.store(total as u32, Ordering::Relaxed);
    C::clean(head as *const QueueHead as usize, core::mem::size_of::<QueueHead>());
    Ok(())
}

/// Build SETUP, optional DATA and STATUS stages for a control request
///
/// `data.len` must equal `setup.length`. The returned QH records only the
/// data stage in its byte total; the 8-byte SETUP stage is never counted.
pub(crate) fn build_control<C: DmaCache, const N_QH: usize, const N_QTD: usize>(
    pool: &DescriptorPool<N_QH, N_QTD>,
    ep: &EndpointConfig,
    owner: usize,
    setup: &SetupPacket,
    data: DataStage,
) -> Result<QhHandle> {
    if ep.transfer_type != TransferType::Control || data.len != setup.length as usize {
        return Err(UsbError::InvalidParameter);
    }
    let data_dir = setup.direction();

    let mut guard = ResourceGuard::new(pool);
    let qh = guard.alloc_qh()?;
    pool.qh(qh).init_endpoint(ep)?;

    // SETUP: DATA0, buffer is the descriptor's own setup storage
    let setup_td = guard.alloc_qtd()?;
    let setup_qtd = pool.qtd(setup_td);
    setup_qtd.set_setup(&setup.to_bytes());
    let setup_bus = pool
        .qtd_bus::<C>(setup_td)
        .wrapping_add(QueueTD::SETUP_OFFSET as u32);
    setup_qtd.fill(token::PID_SETUP, false, setup_bus, 8, false)?;

    let data_td = if data.len > 0 {
        let td = guard.alloc_qtd()?;
        pool.qtd(td)
            .fill(pid_for(data_dir), true, C::bus_address(data.addr), data.len, false)?;
        Some(td)
    } else {
        None
    };

    // STATUS: opposite of DATA, IN when there is no data stage
    let status_dir = if data_td.is_some() {
        data_dir.reverse()
    } else {
        Direction::In
    };
    let status_td = guard.alloc_qtd()?;
    pool.qtd(status_td)
        .fill(pid_for(status_dir), true, 0, 0, true)?;

    match data_td {
        Some(td) => {
            link::<C, N_QH, N_QTD>(pool, setup_td, td);
            link::<C, N_QH, N_QTD>(pool, td, status_td);
            if data_dir == Direction::In {
                // Short IN packet skips straight to STATUS
                pool.qtd(td)
                    .alt_next_qtd
                    .store(pool.qtd_bus::<C>(status_td), Ordering::Relaxed);
            }
            C::clean(data.addr, data.len);
        }
        None => link::<C, N_QH, N_QTD>(pool, setup_td, status_td),
    }

    flush_qtds::<C, N_QH, N_QTD>(pool, &guard.qtds);
    finish_qh::<C, N_QH, N_QTD>(pool, qh, setup_td, owner, false, data.len)?;

    guard.disarm();
    Ok(qh)
}

/// Build a single-qTD bulk or interrupt transfer
///
/// Carries the pipe's current toggle and always interrupts on completion.
pub(crate) fn build_single<C: DmaCache, const N_QH: usize, const N_QTD: usize>(
    pool: &DescriptorPool<N_QH, N_QTD>,
    ep: &EndpointConfig,
    owner: usize,
    toggle: bool,
    data: DataStage,
) -> Result<QhHandle> {
    if !matches!(ep.transfer_type, TransferType::Bulk | TransferType::Interrupt) {
        return Err(UsbError::InvalidParameter);
    }
    if data.len > QueueTD::max_length_at(C::bus_address(data.addr)) {
        return Err(UsbError::InvalidParameter);
    }

    let mut guard = ResourceGuard::new(pool);
    let qh = guard.alloc_qh()?;
    pool.qh(qh).init_endpoint(ep)?;

    let td = guard.alloc_qtd()?;
    pool.qtd(td).fill(
        pid_for(ep.direction),
        toggle,
        C::bus_address(data.addr),
        data.len,
        true,
    )?;
    if data.len > 0 {
        C::clean(data.addr, data.len);
    }

    flush_qtds::<C, N_QH, N_QTD>(pool, &guard.qtds);
    finish_qh::<C, N_QH, N_QTD>(pool, qh, td, owner, toggle, data.len)?;

    guard.disarm();
    Ok(qh)
}
