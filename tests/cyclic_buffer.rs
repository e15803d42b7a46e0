//! Producer/consumer behaviour of the cyclic sample buffer

mod common;

use common::test_timeout;
use corrflow::{
    cyclic::{CyclicSampleBuffer, ProducerId, SampleFlags},
    RuntimeError,
};
use std::sync::Arc;
use std::thread;

const PACKET: usize = 16;

fn packet(time: u64) -> Vec<u32> {
    (0..PACKET as u64).map(|i| (time + i) as u32).collect()
}

#[test]
fn test_blocking_producer_never_loses_data() {
    let buffer = Arc::new(CyclicSampleBuffer::<u32>::new(64, 1, false, 32).unwrap());
    buffer.start_read(Some(0)).unwrap();

    let producer = {
        let buffer = buffer.clone();
        thread::spawn(move || {
            for p in 0..40u64 {
                let time = p * PACKET as u64;
                let data = packet(time);
                buffer
                    .put_elements(ProducerId(1), time, &[data.as_slice()])
                    .unwrap();
            }
        })
    };

    let mut out = vec![0u32; 32];
    let mut flags = vec![SampleFlags::default()];
    for window in 0..20u64 {
        let end = (window + 1) * 32;
        assert!(buffer.wait_until_written(end, test_timeout()).unwrap());
        let missing = buffer
            .get_elements(&mut [out.as_mut_slice()], &mut flags, window * 32, 32)
            .unwrap();
        assert_eq!(missing, 0, "window {} had gaps", window);
        assert_eq!(out[0], (window * 32) as u32);
        assert_eq!(out[31], (window * 32 + 31) as u32);
    }
    producer.join().unwrap();

    let stats = buffer.producer_stats(ProducerId(1)).unwrap();
    assert_eq!(stats.samples_written, 640);
    assert_eq!(stats.evicted_unread, 0);
    assert_eq!(stats.refused, 0);
}

#[test]
fn test_lost_packets_are_flagged() {
    let buffer = CyclicSampleBuffer::<u32>::new(256, 2, true, 64).unwrap();
    for p in 0..8u64 {
        if p == 2 || p == 5 {
            continue;
        }
        let time = p * PACKET as u64;
        let data = packet(time);
        // Substream 1 only carries the first half
        let second: &[u32] = if p < 4 { &data } else { &[] };
        buffer
            .put_elements(ProducerId(0), time, &[data.as_slice(), second])
            .unwrap();
    }

    buffer.start_read(Some(0)).unwrap();
    let mut a = vec![0u32; 128];
    let mut b = vec![0u32; 128];
    let mut flags = vec![SampleFlags::default(), SampleFlags::default()];
    let missing = buffer
        .get_elements(&mut [a.as_mut_slice(), b.as_mut_slice()], &mut flags, 0, 128)
        .unwrap();

    assert_eq!(flags[0].ranges(), vec![32..48, 80..96]);
    assert_eq!(flags[1].ranges(), vec![32..48, 64..128]);
    assert_eq!(missing, 32 + 80);
    assert_eq!(a[33], 0);
    assert_eq!(a[48], 48);
}

#[test]
fn test_start_read_waits_for_a_window() {
    let buffer = Arc::new(CyclicSampleBuffer::<u32>::new(128, 1, true, 48).unwrap());
    assert_eq!(buffer.try_start_read(None).unwrap(), None);

    let producer = {
        let buffer = buffer.clone();
        thread::spawn(move || {
            for p in 0..4u64 {
                let time = 100 + p * PACKET as u64;
                let data = packet(time);
                buffer
                    .put_elements(ProducerId(0), time, &[data.as_slice()])
                    .unwrap();
                thread::sleep(std::time::Duration::from_millis(2));
            }
        })
    };
    let anchor = buffer.start_read(None).unwrap();
    producer.join().unwrap();
    assert_eq!(anchor, 100);
    assert_eq!(buffer.anchor().unwrap(), 100);

    let mut out = vec![0u32; 8];
    let mut flags = vec![SampleFlags::default()];
    buffer
        .get_elements(&mut [out.as_mut_slice()], &mut flags, 4, 8)
        .unwrap();
    assert_eq!(out[0], 104);
    assert!(flags[0].none_set());
}

#[test]
fn test_try_put_refuses_unread_history() {
    let buffer = CyclicSampleBuffer::<u32>::new(32, 1, false, 16).unwrap();
    buffer.start_read(Some(0)).unwrap();
    let first = packet(0);
    let second = packet(16);
    buffer.try_put_elements(ProducerId(3), 0, &[first.as_slice()]).unwrap();
    buffer.try_put_elements(ProducerId(3), 16, &[second.as_slice()]).unwrap();

    let third = packet(32);
    let result = buffer.try_put_elements(ProducerId(3), 32, &[third.as_slice()]);
    assert!(matches!(result, Err(RuntimeError::CapacityExceeded { .. })));
    assert_eq!(buffer.producer_stats(ProducerId(3)).unwrap().refused, 16);

    let mut out = vec![0u32; 16];
    let mut flags = vec![SampleFlags::default()];
    buffer
        .get_elements(&mut [out.as_mut_slice()], &mut flags, 0, 16)
        .unwrap();
    buffer.try_put_elements(ProducerId(3), 32, &[third.as_slice()]).unwrap();
}

#[test]
fn test_clear_wakes_blocked_producer() {
    let buffer = Arc::new(CyclicSampleBuffer::<u32>::new(16, 1, false, 16).unwrap());
    buffer.start_read(Some(0)).unwrap();
    let data = packet(0);
    buffer.put_elements(ProducerId(0), 0, &[data.as_slice()]).unwrap();

    let producer = {
        let buffer = buffer.clone();
        thread::spawn(move || {
            let data = packet(16);
            buffer.put_elements(ProducerId(0), 16, &[data.as_slice()])
        })
    };
    thread::sleep(std::time::Duration::from_millis(10));
    buffer.clear();
    let result = producer.join().unwrap();
    assert!(matches!(result, Err(RuntimeError::InvalidState(_))));
    assert!(buffer.is_cleared());
}

#[test]
fn test_no_overwrite_feed_starting_past_capacity() {
    // Station clocks are absolute, far beyond the ring size
    let buffer = Arc::new(CyclicSampleBuffer::<u32>::new(64, 1, false, 32).unwrap());
    let producer = {
        let buffer = buffer.clone();
        thread::spawn(move || {
            for p in 0..12u64 {
                let time = 1_000_000 + p * PACKET as u64;
                let data = packet(time);
                buffer
                    .put_elements(ProducerId(0), time, &[data.as_slice()])
                    .unwrap();
            }
        })
    };

    let anchor = buffer.start_read(None).unwrap();
    assert_eq!(anchor, 1_000_000);
    let mut out = vec![0u32; 32];
    let mut flags = vec![SampleFlags::default()];
    for window in 0..6u64 {
        assert!(buffer
            .wait_until_written((window + 1) * 32, test_timeout())
            .unwrap());
        let missing = buffer
            .get_elements(&mut [out.as_mut_slice()], &mut flags, window * 32, 32)
            .unwrap();
        assert_eq!(missing, 0);
        assert_eq!(out[0], (anchor + window * 32) as u32);
    }
    producer.join().unwrap();
    assert_eq!(buffer.producer_stats(ProducerId(0)).unwrap().refused, 0);
}

#[test]
fn test_clear_races_a_running_producer() {
    for _ in 0..200 {
        let buffer = Arc::new(CyclicSampleBuffer::<u32>::new(64, 2, true, 16).unwrap());
        let producer = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                let data = packet(0);
                let mut time = 0u64;
                loop {
                    let slices = [data.as_slice(), data.as_slice()];
                    if let Err(e) = buffer.put_elements(ProducerId(0), time, &slices) {
                        return e;
                    }
                    time += PACKET as u64;
                }
            })
        };
        thread::yield_now();
        buffer.clear();
        let err = producer.join().expect("producer must not panic");
        assert!(matches!(err, RuntimeError::InvalidState(_)));

        // The lock is still usable afterwards
        assert!(buffer.total_stats().is_ok());
    }
}

#[test]
fn test_clear_wakes_waiting_consumer() {
    let buffer = Arc::new(CyclicSampleBuffer::<u32>::new(64, 1, false, 32).unwrap());
    let consumer = {
        let buffer = buffer.clone();
        thread::spawn(move || buffer.start_read(None))
    };
    let data = packet(500);
    buffer
        .put_elements(ProducerId(0), 500, &[data.as_slice()])
        .unwrap();
    thread::sleep(std::time::Duration::from_millis(10));
    buffer.clear();
    let result = consumer.join().unwrap();
    assert!(matches!(result, Err(RuntimeError::InvalidState(_))));
}
