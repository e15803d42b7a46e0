//! Point-to-point rotation: the transpose as a sequence of pairwise phases.
//!
//! With `N` stations there are `N²` phases. Phase `p` pairs sender `p / N`
//! with receiver `(p / N + p % N) % N`; phases with `p % N == 0` would pair a
//! station with itself and are idle. Every phase has a Receive half followed
//! by a Send half, so a station that is the receiver of phase `p` posts its
//! receive before the sender of phase `p` starts sending.
//!
//! One full rotation delivers exactly one message from every station to
//! every other station.

use crate::error::{Result, RuntimeError};
use crate::topology::{StreamLocation, TopologyMapper};

/// One directed transfer of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub from: usize,
    pub to: usize,
}

/// What a station does in one half of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalfAction {
    Idle,
    Receive { from: usize },
    Send { to: usize },
}

/// Phase table for `stations` participants.
#[derive(Debug, Clone)]
pub struct RotationSchedule {
    stations: usize,
    locations: Vec<StreamLocation>,
}

impl RotationSchedule {
    pub fn new(stations: usize) -> Self {
        Self {
            stations,
            locations: Vec::new(),
        }
    }

    /// A schedule whose stations are placed on `topology` as logical streams
    /// `0..stations`.
    pub fn on_topology(stations: usize, topology: &TopologyMapper) -> Result<Self> {
        if stations > topology.node_count() {
            return Err(RuntimeError::Config(format!(
                "{} stations do not fit on a {} torus",
                stations,
                topology.dims()
            )));
        }
        let locations = (0..stations)
            .map(|s| topology.stream_location(s))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            stations,
            locations,
        })
    }

    pub fn stations(&self) -> usize {
        self.stations
    }

    /// Phases in one full rotation.
    pub fn phases(&self) -> usize {
        self.stations * self.stations
    }

    /// Node of `station`, if the schedule was placed on a topology.
    pub fn location(&self, station: usize) -> Option<&StreamLocation> {
        self.locations.get(station)
    }

    /// Transfer of `phase` (taken modulo the rotation length), or `None` for
    /// idle phases.
    pub fn transfer(&self, phase: usize) -> Option<Transfer> {
        if self.stations == 0 {
            return None;
        }
        let p = phase % self.phases();
        let from = p / self.stations;
        let offset = p % self.stations;
        if offset == 0 {
            return None;
        }
        Some(Transfer {
            from,
            to: (from + offset) % self.stations,
        })
    }

    /// Receive half then Send half of `phase` for `station`.
    pub fn actions(&self, station: usize, phase: usize) -> [HalfAction; 2] {
        match self.transfer(phase) {
            Some(Transfer { from, to }) if to == station => {
                [HalfAction::Receive { from }, HalfAction::Idle]
            }
            Some(Transfer { from, to }) if from == station => {
                [HalfAction::Idle, HalfAction::Send { to }]
            }
            _ => [HalfAction::Idle, HalfAction::Idle],
        }
    }

    /// All non-idle transfers of one rotation, in phase order.
    pub fn transfers(&self) -> impl Iterator<Item = (usize, Transfer)> + '_ {
        (0..self.phases()).filter_map(move |p| self.transfer(p).map(|t| (p, t)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_sixteen_phases_for_four_stations() {
        let schedule = RotationSchedule::new(4);
        assert_eq!(schedule.phases(), 16);
        assert_eq!(schedule.transfers().count(), 12);
        assert_eq!(schedule.transfer(0), None);
        assert_eq!(schedule.transfer(1), Some(Transfer { from: 0, to: 1 }));
        assert_eq!(schedule.transfer(7), Some(Transfer { from: 1, to: 0 }));
        assert_eq!(schedule.transfer(17), schedule.transfer(1));
    }

    #[test]
    fn test_every_pair_exactly_once() {
        let schedule = RotationSchedule::new(5);
        let pairs: Vec<(usize, usize)> = schedule.transfers().map(|(_, t)| (t.from, t.to)).collect();
        let unique: HashSet<_> = pairs.iter().copied().collect();
        assert_eq!(pairs.len(), 20);
        assert_eq!(unique.len(), 20);
        assert!(pairs.iter().all(|(a, b)| a != b));
    }

    #[test]
    fn test_receive_half_precedes_send_half() {
        let schedule = RotationSchedule::new(4);
        assert_eq!(
            schedule.actions(1, 1),
            [HalfAction::Receive { from: 0 }, HalfAction::Idle]
        );
        assert_eq!(
            schedule.actions(0, 1),
            [HalfAction::Idle, HalfAction::Send { to: 1 }]
        );
        assert_eq!(schedule.actions(3, 1), [HalfAction::Idle, HalfAction::Idle]);
    }
}
