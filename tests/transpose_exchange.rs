//! Station-to-subband transpose across in-process participants

mod common;

use corrflow::{
    topology::{TopologyMapper, TorusDims},
    transpose::{
        CollectiveRedistributor, HalfAction, LocalCommunicator, RotationSchedule, StreamMetadata,
        TransposeLayout, TransposePlan,
    },
};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::BTreeSet;
use std::sync::{Arc, Barrier};
use std::thread;

fn slice_pattern(station: usize, subband: usize, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (station * 16 + subband) as u8 ^ i as u8)
        .collect()
}

/// Run one data exchange with one thread per participating group and return
/// each participant's plan and receive buffer.
fn run_transpose(layout: TransposeLayout) -> Vec<(TransposePlan, Vec<u8>)> {
    let groups: BTreeSet<usize> = layout
        .station_groups
        .iter()
        .chain(&layout.subband_groups)
        .copied()
        .collect();
    let comms = LocalCommunicator::group(groups.len());

    let handles: Vec<_> = groups
        .into_iter()
        .zip(comms)
        .map(|(group, comm)| {
            let layout = layout.clone();
            thread::spawn(move || {
                let plan = TransposePlan::new(layout.clone(), group).unwrap();
                let mut send = vec![0u8; plan.send_len()];
                for &station in plan.my_stations() {
                    for subband in 0..layout.subband_groups.len() {
                        let at = plan.send_offset(station, subband).unwrap();
                        send[at..at + layout.slice_bytes]
                            .copy_from_slice(&slice_pattern(station, subband, layout.slice_bytes));
                    }
                }
                let mut recv = vec![0u8; plan.recv_len()];
                let mut redistributor = CollectiveRedistributor::new(comm, plan.clone()).unwrap();
                redistributor.exchange(&send, &mut recv).unwrap();
                assert_eq!(redistributor.exchanges(), 1);
                (plan, recv)
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

fn assert_every_slice_arrived(layout: &TransposeLayout, results: &[(TransposePlan, Vec<u8>)]) {
    for (plan, recv) in results {
        for &subband in plan.my_subbands() {
            for station in 0..layout.station_groups.len() {
                let at = plan.recv_offset(station, subband).unwrap();
                assert_eq!(
                    &recv[at..at + layout.slice_bytes],
                    slice_pattern(station, subband, layout.slice_bytes).as_slice(),
                    "group {} station {} subband {}",
                    plan.my_group(),
                    station,
                    subband
                );
            }
        }
    }
}

#[test]
fn test_two_groups_cross_wired() {
    let layout = TransposeLayout {
        station_groups: vec![0, 1],
        subband_groups: vec![0, 1],
        slice_bytes: 32,
    };
    let results = run_transpose(layout.clone());
    assert_eq!(results.len(), 2);
    assert_every_slice_arrived(&layout, &results);

    // Group 0 sends subband 1 of station 0 to group 1 and keeps subband 0
    let (plan0, _) = &results[0];
    assert_eq!(plan0.send_table().counts, vec![32, 32]);
    assert_eq!(plan0.recv_table().counts, vec![32, 32]);
}

#[test]
fn test_uneven_assignment_with_idle_slots() {
    // Group 4 only correlates, group 0 only holds stations
    let layout = TransposeLayout {
        station_groups: vec![0, 0, 2, 2, 2],
        subband_groups: vec![2, 4, 4],
        slice_bytes: 8,
    };
    let results = run_transpose(layout.clone());
    assert_eq!(results.len(), 3);
    assert_every_slice_arrived(&layout, &results);

    for (plan, _) in &results {
        assert_eq!(plan.send_table().len(), 3);
        assert_eq!(plan.recv_table().len(), 3);
    }
    let (only_holds, _) = &results[0];
    assert_eq!(only_holds.recv_len(), 0);
    assert_eq!(only_holds.recv_table().counts, vec![0, 0, 0]);
    let (only_correlates, _) = &results[2];
    assert_eq!(only_correlates.send_len(), 0);
    assert_eq!(only_correlates.recv_table().counts, vec![2 * 2 * 8, 3 * 2 * 8, 0]);
}

#[test]
fn test_metadata_follows_the_data() {
    let layout = TransposeLayout {
        station_groups: vec![0, 1],
        subband_groups: vec![1, 0],
        slice_bytes: 16,
    };
    let comms = LocalCommunicator::group(2);
    let handles: Vec<_> = comms
        .into_iter()
        .enumerate()
        .map(|(group, comm)| {
            let layout = layout.clone();
            thread::spawn(move || {
                let plan = TransposePlan::new(layout, group).unwrap();
                let mut redistributor = CollectiveRedistributor::new(comm, plan).unwrap();
                let records: Vec<StreamMetadata> = (0..2)
                    .map(|subband| StreamMetadata {
                        station: group as u32,
                        subband,
                        delay_at_begin: group as f64 * 1e-6,
                        delay_after_end: group as f64 * 2e-6,
                        alignment_shift: -(group as i64),
                        flags: vec![0..group as u32 + 1],
                    })
                    .collect();
                redistributor.exchange_metadata(&records).unwrap()
            })
        })
        .collect();
    let received: Vec<Vec<StreamMetadata>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    // Group 0 owns subband 1, group 1 owns subband 0
    for (group, records) in received.iter().enumerate() {
        let owned = 1 - group as u32;
        assert_eq!(records.len(), 2);
        for (station, record) in records.iter().enumerate() {
            assert_eq!(record.station, station as u32);
            assert_eq!(record.subband, owned);
            assert_eq!(record.alignment_shift, -(station as i64));
            assert_eq!(record.flags, vec![0..station as u32 + 1]);
        }
    }
}

#[test]
fn test_rotation_on_torus_delivers_each_pair_once() {
    let mapper = TopologyMapper::new(TorusDims::new(4, 4, 4, 2)).unwrap();
    let schedule = RotationSchedule::on_topology(4, &mapper).unwrap();
    assert_eq!(schedule.phases(), 16);

    let ranks: BTreeSet<usize> = (0..4)
        .map(|s| schedule.location(s).unwrap().rank)
        .collect();
    assert_eq!(ranks.len(), 4, "stations must sit on distinct nodes");

    let (inboxes_tx, inboxes_rx): (Vec<Sender<usize>>, Vec<Receiver<usize>>) =
        (0..4).map(|_| unbounded()).unzip();
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = inboxes_rx
        .into_iter()
        .enumerate()
        .map(|(station, inbox)| {
            let schedule = schedule.clone();
            let peers = inboxes_tx.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let mut received = Vec::new();
                for phase in 0..schedule.phases() {
                    for action in schedule.actions(station, phase) {
                        match action {
                            HalfAction::Receive { from } => {
                                let got = inbox.recv_timeout(common::test_timeout()).unwrap();
                                assert_eq!(got, from, "phase {}", phase);
                                received.push(got);
                            }
                            HalfAction::Send { to } => peers[to].send(station).unwrap(),
                            HalfAction::Idle => {}
                        }
                    }
                    barrier.wait();
                }
                received
            })
        })
        .collect();

    for (station, handle) in handles.into_iter().enumerate() {
        let received = handle.join().unwrap();
        let unique: BTreeSet<usize> = received.iter().copied().collect();
        assert_eq!(received.len(), 3, "station {}", station);
        assert_eq!(unique.len(), 3);
        assert!(!unique.contains(&station));
    }
}
