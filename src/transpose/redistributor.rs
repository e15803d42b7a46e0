//! All-to-all redistribution of station data to subband owners.
//!
//! Each participating group holds the samples of some stations for every
//! subband, and owns some subbands for every station. One exchange moves each
//! `(station, subband)` slice from the group holding the station to the group
//! owning the subband.
//!
//! # Tables
//!
//! The groups named in either assignment list are merged into a sorted union;
//! a group's position in the union is its dense index, which is also its
//! participant index in the [`Collective`]. Every participant builds send and
//! receive tables with one slot per dense index. Slots a participant has
//! nothing to exchange with are `{count: 0, offset: 0}`, never omitted, so all
//! participants pass tables of identical length.
//!
//! Send buffers are laid out by destination (dense order), then station, then
//! subband. Receive buffers are laid out by source, then station, then
//! subband, which matches what each sender places in its slot.

use crate::error::{fatal, Result, RuntimeError};
use crate::transpose::communicator::Collective;
use std::collections::BTreeSet;
use std::ops::Range;

/// Fixed size of one metadata record on the wire
pub const METADATA_RECORD_LEN: usize = 168;

/// Flag ranges a metadata record can carry
pub const MAX_FLAG_RANGES: usize = 16;

/// Per-participant byte counts and offsets.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExchangeTable {
    pub counts: Vec<usize>,
    pub offsets: Vec<usize>,
}

impl ExchangeTable {
    /// `len` empty slots.
    pub fn zeroed(len: usize) -> Self {
        Self {
            counts: vec![0; len],
            offsets: vec![0; len],
        }
    }

    /// Slots packed back to back in order; empty slots get offset 0.
    pub fn from_counts(counts: &[usize]) -> Self {
        let mut offsets = Vec::with_capacity(counts.len());
        let mut next = 0;
        for &count in counts {
            offsets.push(if count == 0 { 0 } else { next });
            next += count;
        }
        Self {
            counts: counts.to_vec(),
            offsets,
        }
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Byte range of slot `index`.
    pub fn slot(&self, index: usize) -> Range<usize> {
        self.offsets[index]..self.offsets[index] + self.counts[index]
    }

    /// Bytes covered by all slots.
    pub fn total(&self) -> usize {
        (0..self.len()).map(|i| self.slot(i).end).max().unwrap_or(0)
    }
}

/// Which group holds each station and which group owns each subband.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransposeLayout {
    /// `station_groups[s]` holds the input of station `s`
    pub station_groups: Vec<usize>,
    /// `subband_groups[b]` correlates subband `b`
    pub subband_groups: Vec<usize>,
    /// Bytes of one `(station, subband)` slice
    pub slice_bytes: usize,
}

/// Send/receive tables and slice addressing for one participant.
#[derive(Debug, Clone)]
pub struct TransposePlan {
    layout: TransposeLayout,
    /// Sorted union of participating groups
    groups: Vec<usize>,
    my_group: usize,
    my_index: usize,
    my_stations: Vec<usize>,
    my_subbands: Vec<usize>,
    send: ExchangeTable,
    recv: ExchangeTable,
}

impl TransposePlan {
    pub fn new(layout: TransposeLayout, my_group: usize) -> Result<Self> {
        let groups: Vec<usize> = layout
            .station_groups
            .iter()
            .chain(&layout.subband_groups)
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let my_index = groups.binary_search(&my_group).map_err(|_| {
            RuntimeError::InvalidState(format!(
                "group {} takes no part in the transpose (groups {:?})",
                my_group, groups
            ))
        })?;

        let on = |assignment: &[usize], group: usize| -> Vec<usize> {
            (0..assignment.len())
                .filter(|&i| assignment[i] == group)
                .collect()
        };
        let my_stations = on(&layout.station_groups, my_group);
        let my_subbands = on(&layout.subband_groups, my_group);

        let slice = layout.slice_bytes;
        let send_counts: Vec<usize> = groups
            .iter()
            .map(|&g| my_stations.len() * on(&layout.subband_groups, g).len() * slice)
            .collect();
        let recv_counts: Vec<usize> = groups
            .iter()
            .map(|&g| on(&layout.station_groups, g).len() * my_subbands.len() * slice)
            .collect();

        tracing::debug!(
            "Transpose plan for group {} (index {} of {}): {} stations, {} subbands",
            my_group,
            my_index,
            groups.len(),
            my_stations.len(),
            my_subbands.len()
        );

        Ok(Self {
            send: ExchangeTable::from_counts(&send_counts),
            recv: ExchangeTable::from_counts(&recv_counts),
            layout,
            groups,
            my_group,
            my_index,
            my_stations,
            my_subbands,
        })
    }

    /// Same assignment with a different slice size.
    pub fn with_slice_bytes(&self, slice_bytes: usize) -> Result<Self> {
        let layout = TransposeLayout {
            slice_bytes,
            ..self.layout.clone()
        };
        Self::new(layout, self.my_group)
    }

    pub fn groups(&self) -> &[usize] {
        &self.groups
    }

    pub fn participants(&self) -> usize {
        self.groups.len()
    }

    pub fn my_index(&self) -> usize {
        self.my_index
    }

    pub fn my_group(&self) -> usize {
        self.my_group
    }

    pub fn my_stations(&self) -> &[usize] {
        &self.my_stations
    }

    pub fn my_subbands(&self) -> &[usize] {
        &self.my_subbands
    }

    pub fn slice_bytes(&self) -> usize {
        self.layout.slice_bytes
    }

    pub fn send_table(&self) -> &ExchangeTable {
        &self.send
    }

    pub fn recv_table(&self) -> &ExchangeTable {
        &self.recv
    }

    pub fn send_len(&self) -> usize {
        self.send.total()
    }

    pub fn recv_len(&self) -> usize {
        self.recv.total()
    }

    fn dense(&self, group: usize) -> Option<usize> {
        self.groups.binary_search(&group).ok()
    }

    /// Byte offset of the `(station, subband)` slice in the send buffer, if
    /// this participant holds `station`.
    pub fn send_offset(&self, station: usize, subband: usize) -> Option<usize> {
        let s = self.my_stations.iter().position(|&x| x == station)?;
        let dest = *self.layout.subband_groups.get(subband)?;
        let slot = self.dense(dest)?;
        let peers = &self.layout.subband_groups;
        let b = (0..subband).filter(|&i| peers[i] == dest).count();
        let per_station = peers.iter().filter(|&&g| g == dest).count();
        Some(self.send.offsets[slot] + (s * per_station + b) * self.layout.slice_bytes)
    }

    /// Byte offset of the `(station, subband)` slice in the receive buffer,
    /// if this participant owns `subband`.
    pub fn recv_offset(&self, station: usize, subband: usize) -> Option<usize> {
        let b = self.my_subbands.iter().position(|&x| x == subband)?;
        let source = *self.layout.station_groups.get(station)?;
        let slot = self.dense(source)?;
        let holders = &self.layout.station_groups;
        let s = (0..station).filter(|&i| holders[i] == source).count();
        Some(self.recv.offsets[slot] + (s * self.my_subbands.len() + b) * self.layout.slice_bytes)
    }
}

/// Delay, alignment and flag summary of one `(station, subband)` stream.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StreamMetadata {
    pub station: u32,
    pub subband: u32,
    pub delay_at_begin: f64,
    pub delay_after_end: f64,
    pub alignment_shift: i64,
    /// Flagged sample ranges; at most [`MAX_FLAG_RANGES`] survive encoding
    pub flags: Vec<Range<u32>>,
}

impl StreamMetadata {
    /// Write the fixed-size record. Extra flag ranges are folded into the
    /// last one, which may flag more samples but never fewer.
    pub fn encode(&self, out: &mut [u8]) {
        out[..METADATA_RECORD_LEN].fill(0);
        out[0..4].copy_from_slice(&self.station.to_le_bytes());
        out[4..8].copy_from_slice(&self.subband.to_le_bytes());
        out[8..16].copy_from_slice(&self.delay_at_begin.to_le_bytes());
        out[16..24].copy_from_slice(&self.delay_after_end.to_le_bytes());
        out[24..32].copy_from_slice(&self.alignment_shift.to_le_bytes());

        let ranges = self.record_flags();
        out[32..36].copy_from_slice(&(ranges.len() as u32).to_le_bytes());
        for (i, range) in ranges.iter().enumerate() {
            let at = 40 + i * 8;
            out[at..at + 4].copy_from_slice(&range.start.to_le_bytes());
            out[at + 4..at + 8].copy_from_slice(&range.end.to_le_bytes());
        }
    }

    /// Flag ranges sorted and merged, then cut to [`MAX_FLAG_RANGES`] with
    /// the overflow folded into the last kept range.
    fn record_flags(&self) -> Vec<Range<u32>> {
        let mut sorted: Vec<Range<u32>> = self.flags.iter().filter(|r| r.start < r.end).cloned().collect();
        sorted.sort_by_key(|r| r.start);
        let mut merged: Vec<Range<u32>> = Vec::with_capacity(sorted.len());
        for range in sorted {
            match merged.last_mut() {
                Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
                _ => merged.push(range),
            }
        }
        if merged.len() > MAX_FLAG_RANGES {
            let tail_end = merged.iter().map(|r| r.end).max().unwrap_or(0);
            merged.truncate(MAX_FLAG_RANGES);
            if let Some(last) = merged.last_mut() {
                last.end = last.end.max(tail_end);
            }
        }
        merged
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < METADATA_RECORD_LEN {
            return Err(RuntimeError::CollectiveFailure(format!(
                "metadata record of {} bytes, need {}",
                raw.len(),
                METADATA_RECORD_LEN
            )));
        }
        let u32_at = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        let u64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&raw[at..at + 8]);
            u64::from_le_bytes(b)
        };
        let count = (u32_at(32) as usize).min(MAX_FLAG_RANGES);
        Ok(Self {
            station: u32_at(0),
            subband: u32_at(4),
            delay_at_begin: f64::from_bits(u64_at(8)),
            delay_after_end: f64::from_bits(u64_at(16)),
            alignment_shift: u64_at(24) as i64,
            flags: (0..count)
                .map(|i| u32_at(40 + i * 8)..u32_at(44 + i * 8))
                .collect(),
        })
    }
}

/// Runs transposes for one participant.
pub struct CollectiveRedistributor<C: Collective> {
    comm: C,
    plan: TransposePlan,
    metadata_plan: TransposePlan,
    exchanges: u64,
}

impl<C: Collective> CollectiveRedistributor<C> {
    pub fn new(comm: C, plan: TransposePlan) -> Result<Self> {
        if comm.size() != plan.participants() || comm.index() != plan.my_index() {
            return Err(RuntimeError::CollectiveFailure(format!(
                "communicator is participant {} of {}, plan expects {} of {}",
                comm.index(),
                comm.size(),
                plan.my_index(),
                plan.participants()
            )));
        }
        let metadata_plan = plan.with_slice_bytes(METADATA_RECORD_LEN)?;
        Ok(Self {
            comm,
            plan,
            metadata_plan,
            exchanges: 0,
        })
    }

    pub fn plan(&self) -> &TransposePlan {
        &self.plan
    }

    pub fn exchanges(&self) -> u64 {
        self.exchanges
    }

    /// Fenced exchange with `plan`'s tables.
    fn run(&mut self, which: Which, send: &[u8], recv: &mut [u8]) -> Result<()> {
        let plan = match which {
            Which::Data => &self.plan,
            Which::Metadata => &self.metadata_plan,
        };
        if send.len() < plan.send_len() || recv.len() < plan.recv_len() {
            return Err(RuntimeError::CollectiveFailure(format!(
                "buffers of {}/{} bytes, plan needs {}/{}",
                send.len(),
                recv.len(),
                plan.send_len(),
                plan.recv_len()
            )));
        }
        let index = self.comm.index();
        tracing::debug!("Transpose {} ({:?}) begin on participant {}", self.exchanges, which, index);
        let to_collective = |e: RuntimeError| match e {
            RuntimeError::CollectiveFailure(_) => e,
            other => RuntimeError::CollectiveFailure(other.to_string()),
        };
        self.comm.barrier().map_err(to_collective)?;
        self.comm
            .all_to_all_v(send, &plan.send, recv, &plan.recv)
            .map_err(to_collective)?;
        self.comm.barrier().map_err(to_collective)?;
        tracing::debug!("Transpose {} ({:?}) end on participant {}", self.exchanges, which, index);
        self.exchanges += 1;
        Ok(())
    }

    /// Exchange sample slices. `send` is laid out per [`TransposePlan::send_offset`].
    pub fn exchange(&mut self, send: &[u8], recv: &mut [u8]) -> Result<()> {
        self.run(Which::Data, send, recv)
    }

    /// [`exchange`](Self::exchange), terminating the process on failure.
    pub fn exchange_or_abort(&mut self, send: &[u8], recv: &mut [u8]) {
        if let Err(e) = self.exchange(send, recv) {
            fatal(&e);
        }
    }

    /// Exchange one metadata record per `(station, subband)` slice.
    ///
    /// Records for slices this participant does not hold are ignored; slices
    /// without a record are sent as defaults carrying only their indices.
    /// Returns the received records in receive-buffer order.
    pub fn exchange_metadata(&mut self, records: &[StreamMetadata]) -> Result<Vec<StreamMetadata>> {
        let plan = &self.metadata_plan;
        let mut send = vec![0u8; plan.send_len()];
        for &station in plan.my_stations() {
            for subband in 0..plan.layout.subband_groups.len() {
                if let Some(at) = plan.send_offset(station, subband) {
                    let fallback = StreamMetadata {
                        station: station as u32,
                        subband: subband as u32,
                        ..Default::default()
                    };
                    records
                        .iter()
                        .find(|r| r.station as usize == station && r.subband as usize == subband)
                        .unwrap_or(&fallback)
                        .encode(&mut send[at..at + METADATA_RECORD_LEN]);
                }
            }
        }
        let mut recv = vec![0u8; plan.recv_len()];
        self.run(Which::Metadata, &send, &mut recv)?;
        recv.chunks_exact(METADATA_RECORD_LEN)
            .map(StreamMetadata::decode)
            .collect()
    }

    pub fn into_inner(self) -> C {
        self.comm
    }
}

#[derive(Debug, Clone, Copy)]
enum Which {
    Data,
    Metadata,
}
