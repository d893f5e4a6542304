//! Cancel, close, disconnect and contention on a single pipe

mod common;

use common::{dma_buffer, record, Completions, StdOsal, TestHarness};
use ehci_usbh::ehci::{UsbCmd, UsbSts};
use ehci_usbh::{EndpointConfig, Osal, PipeHandle, PortSpeed, TransferType, UsbError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

fn bulk(ep_addr: u8) -> EndpointConfig {
    EndpointConfig::new(PortSpeed::High, 2, ep_addr, TransferType::Bulk, 512, 0)
}

#[test]
fn test_cancel_idle_pipe_is_noop() {
    let h = TestHarness::start();
    let pipe = h.hcd.pipe_open(bulk(0x81)).unwrap();
    let before = h.hcd.pool_stats();
    h.hw.take_cmd_log();

    assert_eq!(h.hcd.cancel(pipe), Ok(()));
    assert_eq!(h.hcd.pool_stats(), before);
    assert!(h.hw.take_cmd_log().is_empty());
    assert!(h.hcd.pipe(pipe).unwrap().is_open());
}

#[test]
fn test_cancel_outstanding_transfer() {
    let h = TestHarness::start();
    let done = Completions::leak();
    let pipe = h.hcd.pipe_open(bulk(0x81)).unwrap();
    let mut buf = dma_buffer(512);

    h.hcd
        .bulk_transfer_async(pipe, &mut buf, 512, record, done.arg())
        .unwrap();
    h.hw.take_cmd_log();

    h.hcd.cancel(pipe).unwrap();
    assert_eq!(done.results(), vec![Err(UsbError::ShuttingDown)]);
    assert!(h.async_list().is_empty());
    assert_eq!(h.hcd.pool_stats().qh_used, 0);
    assert_eq!(h.hcd.pool_stats().qtd_used, 0);

    // Both schedules were parked for the unlink and are running again
    let log = h.hw.take_cmd_log();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0] & UsbCmd::SCHEDULES.bits(), 0);
    assert_eq!(log[1] & UsbCmd::SCHEDULES.bits(), UsbCmd::SCHEDULES.bits());
    assert!(h.hw.usbsts().contains(UsbSts::ASYNC_SCHEDULE_STATUS));

    h.hcd
        .bulk_transfer_async(pipe, &mut buf, 512, record, done.arg())
        .unwrap();
    assert_eq!(h.async_list().len(), 1);
}

#[test]
fn test_cancel_wakes_blocking_caller() {
    let h = TestHarness::start();
    let hcd = h.hcd;
    let pipe = hcd.pipe_open(bulk(0x02)).unwrap();
    let mut buf = dma_buffer(512);

    let result = thread::scope(|s| {
        let caller = s.spawn(|| hcd.bulk_transfer(pipe, &mut buf, 512, 5000));
        h.wait_async(1);
        hcd.cancel(pipe).unwrap();
        caller.join().unwrap()
    });

    assert_eq!(result, Err(UsbError::ShuttingDown));
    assert!(!hcd.pipe(pipe).unwrap().is_busy());
}

#[test]
fn test_cancel_only_touches_its_pipe() {
    let h = TestHarness::start();
    let cancelled = Completions::leak();
    let kept = Completions::leak();
    let a = h.hcd.pipe_open(bulk(0x81)).unwrap();
    let b = h.hcd.pipe_open(bulk(0x02)).unwrap();
    let mut buf_a = dma_buffer(512);
    let mut buf_b = dma_buffer(512);

    h.hcd
        .bulk_transfer_async(a, &mut buf_a, 512, record, cancelled.arg())
        .unwrap();
    h.hcd
        .bulk_transfer_async(b, &mut buf_b, 512, record, kept.arg())
        .unwrap();

    h.hcd.cancel(a).unwrap();
    assert_eq!(cancelled.results(), vec![Err(UsbError::ShuttingDown)]);
    assert!(kept.results().is_empty());

    let linked = h.async_list();
    assert_eq!(linked.len(), 1);
    h.complete_single(linked[0], 512, 512);
    h.fire(UsbSts::USB_INTERRUPT);
    assert_eq!(kept.wait_for(1), vec![Ok(512)]);
}

#[test]
fn test_pipe_close_cancels_and_frees_slot() {
    let h = common::Harness::<8, 24, 2>::start();
    let done = Completions::leak();
    let a = h.hcd.pipe_open(bulk(0x81)).unwrap();
    let b = h.hcd.pipe_open(bulk(0x02)).unwrap();
    assert_eq!(h.hcd.pipe_open(bulk(0x83)), Err(UsbError::NoResources));

    let mut buf = dma_buffer(512);
    h.hcd
        .bulk_transfer_async(a, &mut buf, 512, record, done.arg())
        .unwrap();
    h.hcd.pipe_close(a).unwrap();
    assert_eq!(done.results(), vec![Err(UsbError::ShuttingDown)]);
    assert!(h.hcd.pipe(a).is_none());
    assert_eq!(h.hcd.cancel(a), Err(UsbError::InvalidParameter));
    assert_eq!(h.hcd.pipe_close(a), Err(UsbError::InvalidParameter));
    assert_eq!(
        h.hcd.bulk_transfer(a, &mut buf, 512, 10),
        Err(UsbError::InvalidParameter)
    );

    let c = h.hcd.pipe_open(bulk(0x83)).unwrap();
    assert_eq!(h.hcd.pipe(c).unwrap().config().endpoint, 3);
    assert!(!h.hcd.pipe(c).unwrap().toggle());
    assert!(h.hcd.pipe(b).unwrap().is_open());
}

#[test]
fn test_largest_pipe_table_keeps_handles_distinct() {
    let h = common::Harness::<2, 4, 256>::start();
    let handles: Vec<PipeHandle> = (0..256)
        .map(|_| h.hcd.pipe_open(bulk(0x81)).unwrap())
        .collect();
    assert_eq!(h.hcd.pipe_open(bulk(0x81)), Err(UsbError::NoResources));
    assert!(handles.iter().enumerate().all(|(i, p)| p.index() == i));

    let (first, last) = (handles[0], handles[255]);
    h.hcd.pipe_close(last).unwrap();
    assert!(h.hcd.pipe(last).is_none());
    assert!(h.hcd.pipe(first).unwrap().is_open());
    assert_eq!(h.hcd.pipe_open(bulk(0x02)).unwrap(), last);
}

#[test]
fn test_reconfigure_refused_while_busy() {
    let h = TestHarness::start();
    let done = Completions::leak();
    let pipe = h.hcd.pipe_open(EndpointConfig::control(PortSpeed::High, 64)).unwrap();

    h.hcd
        .control_transfer_async(
            pipe,
            &ehci_usbh::SetupPacket::set_address(9),
            None,
            record,
            done.arg(),
        )
        .unwrap();
    assert_eq!(h.hcd.pipe_reconfigure(pipe, 9, 64), Err(UsbError::InvalidState));
    assert_eq!(h.hcd.pipe_reconfigure(pipe, 200, 64), Err(UsbError::InvalidParameter));

    h.hcd.cancel(pipe).unwrap();
    h.hcd.pipe_reconfigure(pipe, 9, 64).unwrap();
    assert_eq!(h.hcd.pipe(pipe).unwrap().config().device_address, 9);
}

#[test]
fn test_one_transfer_in_flight_per_pipe() {
    const ROUNDS: usize = 5;

    let h = TestHarness::start();
    let hcd = h.hcd;
    let pipe = hcd.pipe_open(bulk(0x02)).unwrap();
    let most_linked = AtomicUsize::new(0);
    let finished = AtomicUsize::new(0);

    thread::scope(|s| {
        for _ in 0..2 {
            s.spawn(|| {
                let mut buf = dma_buffer(512);
                let results: Vec<_> = (0..ROUNDS)
                    .map(|_| hcd.bulk_transfer(pipe, &mut buf, 512, 5000))
                    .collect();
                finished.fetch_add(1, Ordering::SeqCst);
                assert!(results.iter().all(|r| *r == Ok(512)), "{results:?}");
            });
        }

        // Device side: acknowledge whatever is linked
        while finished.load(Ordering::SeqCst) < 2 {
            let linked = StdOsal::critical_section(|| {
                let linked = h.async_list();
                for &qh in &linked {
                    h.complete_single(qh, 512, 512);
                }
                linked
            });
            most_linked.fetch_max(linked.len(), Ordering::SeqCst);
            if !linked.is_empty() {
                h.fire(UsbSts::USB_INTERRUPT);
            }
            thread::sleep(Duration::from_millis(1));
        }
    });

    assert_eq!(most_linked.load(Ordering::SeqCst), 1);
    // One packet per transfer, so an even number of transfers ends on DATA0
    assert!(!hcd.pipe(pipe).unwrap().toggle());
    assert_eq!(hcd.pool_stats().qh_used, 0);
}

#[test]
fn test_disconnect_fails_every_pipe_on_port() {
    let h = TestHarness::start();
    let hcd = h.hcd;
    let before = hcd.pool_stats();
    let pipes: Vec<PipeHandle> = (1..=3u8)
        .map(|ep| hcd.pipe_open(bulk(0x80 | ep).on_root_port(0)).unwrap())
        .collect();

    // A device on the other port keeps its transfer
    h.hw.plug(1, PortSpeed::High);
    let other_done = Completions::leak();
    let other = hcd.pipe_open(bulk(0x81).on_root_port(1)).unwrap();
    let mut other_buf = dma_buffer(512);
    hcd.bulk_transfer_async(other, &mut other_buf, 512, record, other_done.arg())
        .unwrap();

    thread::scope(|s| {
        let callers: Vec<_> = pipes
            .iter()
            .map(|&pipe| {
                s.spawn(move || {
                    let mut buf = dma_buffer(512);
                    hcd.bulk_transfer(pipe, &mut buf, 512, 5000)
                })
            })
            .collect();

        h.wait_async(4);
        h.hw.disconnect(0);
        h.fire(UsbSts::empty());

        for caller in callers {
            assert_eq!(caller.join().unwrap(), Err(UsbError::DeviceDisconnected));
        }
    });

    assert_eq!(*h.ports.events.lock().unwrap(), vec![(false, 0)]);
    assert_eq!(h.async_list().len(), 1);
    assert!(other_done.results().is_empty());
    assert!(hcd.pipe(other).unwrap().is_busy());
    assert_eq!(hcd.pool_stats().qh_used, before.qh_used + 1);

    // Pipes on the dead port fail fast until closed
    let mut buf = dma_buffer(512);
    for &pipe in &pipes {
        assert!(hcd.pipe(pipe).unwrap().is_disconnected());
        assert_eq!(
            hcd.bulk_transfer(pipe, &mut buf, 512, 10),
            Err(UsbError::DeviceDisconnected)
        );
    }
    assert_eq!(hcd.pipes_on_port(0).count(), 3);
    for &pipe in &pipes {
        hcd.pipe_close(pipe).unwrap();
    }
    assert_eq!(hcd.pipes_on_port(0).count(), 0);
    assert_eq!(hcd.pipes_on_port(1).collect::<Vec<_>>(), vec![other]);
}

#[test]
fn test_reopened_pipe_after_disconnect_works() {
    let h = TestHarness::start();
    let done = Completions::leak();
    let pipe = h.hcd.pipe_open(bulk(0x81)).unwrap();
    h.hw.disconnect(0);
    h.fire(UsbSts::empty());
    assert!(h.hcd.pipe(pipe).unwrap().is_disconnected());

    h.hcd.pipe_close(pipe).unwrap();
    h.hw.connect(0, PortSpeed::High);
    h.fire(UsbSts::empty());
    h.hcd.reset_port(0).unwrap();

    let pipe = h.hcd.pipe_open(bulk(0x81)).unwrap();
    let mut buf = dma_buffer(512);
    h.hcd
        .bulk_transfer_async(pipe, &mut buf, 512, record, done.arg())
        .unwrap();
    let qh = h.async_list()[0];
    h.complete_single(qh, 512, 512);
    h.fire(UsbSts::USB_INTERRUPT);
    assert_eq!(done.wait_for(1), vec![Ok(512)]);
    assert_eq!(
        *h.ports.events.lock().unwrap(),
        vec![(false, 0), (true, 0)]
    );
}
