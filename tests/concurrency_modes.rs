//! Synchronous/asynchronous channel scheduling through the ConcurrencyManager

mod common;

use common::builders::LoopbackLink;
use common::wait_for;
use corrflow::{concurrency::IoMode, RuntimeError};

const ASYNC: IoMode = IoMode::Asynchronous { pool_size: 3 };

#[test]
fn test_sync_to_sync() {
    let mut link = LoopbackLink::new(IoMode::Synchronous, IoMode::Synchronous);
    for value in 1..=5 {
        link.send(value);
        assert_eq!(link.recv(), value);
    }
    let stats = link.manager.stats(link.input).unwrap();
    assert_eq!(stats.messages_received, 5);
    assert_eq!(stats.sequence_gaps, 0);
}

#[test]
fn test_async_writer_keeps_order() {
    let mut link = LoopbackLink::new(ASYNC, IoMode::Synchronous);
    for value in 0..20 {
        link.send(value);
    }
    for value in 0..20 {
        assert_eq!(link.recv(), value);
    }
}

#[test]
fn test_async_both_ends() {
    let mut link = LoopbackLink::new(ASYNC, ASYNC);
    let received: Vec<i16> = (0..10)
        .map(|value| {
            link.send(value);
            link.recv()
        })
        .collect();
    assert_eq!(received, (0..10).collect::<Vec<_>>());
    link.manager.shutdown().unwrap();
}

#[test]
fn test_mode_round_trip_loses_nothing() {
    let mut link = LoopbackLink::new(IoMode::Synchronous, IoMode::Synchronous);
    link.send(1);
    assert_eq!(link.recv(), 1);

    link.manager.set_mode(link.input, ASYNC).unwrap();
    link.send(2);
    assert_eq!(link.recv(), 2);

    // Let the reader thread pick this one up before switching back
    link.send(3);
    let mut early = None;
    assert!(wait_for(|| {
        early = link.manager.try_get_read_locked_buffer(link.input).unwrap();
        early.is_some()
    }));
    let entry = early.unwrap();
    assert_eq!(entry.buffer().get::<i16>(link.samples, 0).unwrap(), 3);
    link.manager.release(link.input, entry).unwrap();

    // One message in flight while the reader is being stopped
    link.send(4);
    link.manager.set_mode(link.input, IoMode::Synchronous).unwrap();
    assert_eq!(link.manager.mode(link.input), Some(IoMode::Synchronous));
    assert_eq!(link.recv(), 4);

    // Exactly once: nothing left over
    assert!(link
        .manager
        .try_get_read_locked_buffer(link.input)
        .unwrap()
        .is_none());

    link.send(5);
    assert_eq!(link.recv(), 5);
    let stats = link.manager.stats(link.input).unwrap();
    assert_eq!(stats.messages_received, 5);
    assert_eq!(stats.sequence_gaps, 0);
}

#[test]
fn test_switch_refused_while_buffer_held() {
    let mut link = LoopbackLink::new(IoMode::Synchronous, IoMode::Synchronous);
    link.send(9);
    let entry = link.manager.get_read_locked_buffer(link.input).unwrap();
    assert!(matches!(
        link.manager.set_mode(link.input, ASYNC),
        Err(RuntimeError::InvalidState(_))
    ));
    link.manager.release(link.input, entry).unwrap();
    link.manager.set_mode(link.input, ASYNC).unwrap();
}

#[test]
fn test_zero_pool_rejected() {
    let mut link = LoopbackLink::new(IoMode::Synchronous, IoMode::Synchronous);
    assert!(matches!(
        link.manager
            .set_mode(link.input, IoMode::Asynchronous { pool_size: 0 }),
        Err(RuntimeError::Config(_))
    ));
}

#[test]
fn test_reader_failure_reported() {
    let mut link = LoopbackLink::new(IoMode::Synchronous, ASYNC);
    link.send(1);
    assert_eq!(link.recv(), 1);

    // Closing the output end disconnects the loopback peer
    drop(link.manager.close(link.output).unwrap());
    let err = link.manager.get_read_locked_buffer(link.input).unwrap_err();
    assert!(
        matches!(err, RuntimeError::WorkerTerminated { tag, .. } if tag == link.input),
        "unexpected error {:?}",
        err
    );
    assert_eq!(link.manager.stats(link.input).unwrap().errors, 1);
}

#[test]
fn test_pool_shared_between_input_and_output() {
    use common::builders::sample_layout;
    use corrflow::{
        channel::TagAllocator,
        concurrency::{ConcurrencyManager, Direction},
        transport::LoopbackTransport,
    };
    use std::sync::Arc;

    let (layout, samples) = sample_layout();
    let mut manager = ConcurrencyManager::new(Arc::new(TagAllocator::new()));
    let (upstream_tx, upstream_rx) = LoopbackTransport::pair();
    let (downstream_tx, downstream_rx) = LoopbackTransport::pair();

    let source = manager
        .open(layout.clone_layout(), layout.clone_layout(), upstream_tx.into(), Direction::Output, IoMode::Synchronous)
        .unwrap();
    let input = manager
        .open(layout.clone_layout(), layout.clone_layout(), upstream_rx.into(), Direction::Input, IoMode::Synchronous)
        .unwrap();
    let output = manager
        .open(layout.clone_layout(), layout.clone_layout(), downstream_tx.into(), Direction::Output, IoMode::Synchronous)
        .unwrap();
    let sink = manager
        .open(layout.clone_layout(), layout.clone_layout(), downstream_rx.into(), Direction::Input, IoMode::Synchronous)
        .unwrap();
    manager.share_pool(input, output).unwrap();

    let mut entry = manager.get_write_locked_buffer(source).unwrap();
    entry.buffer_mut().unwrap().set(samples, 0, 77i16).unwrap();
    manager.release(source, entry).unwrap();

    let entry = manager.get_read_locked_buffer(input).unwrap();
    manager.forward(input, entry, output).unwrap();

    let entry = manager.get_read_locked_buffer(sink).unwrap();
    assert_eq!(entry.buffer().get::<i16>(samples, 0).unwrap(), 77);
    manager.release(sink, entry).unwrap();

    assert!(manager.set_mode(input, IoMode::Asynchronous { pool_size: 2 }).is_err());
}
