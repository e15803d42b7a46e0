//! Node placement on a 4-D torus.
//!
//! Ranks are laid out x-fastest: `rank = x + X * (y + Y * (z + Z * t))`.
//! Nodes are grouped into aligned 2x2x2x2 blocks (a dimension of extent 1
//! contributes a block extent of 1); a group is the set of nodes sharing an
//! I/O path, and logical streams are assigned to groups.

use crate::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Block extent along every dimension longer than one node
const GROUP_EXTENT: u32 = 2;

/// Torus extents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TorusDims {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub t: u32,
}

impl TorusDims {
    pub const fn new(x: u32, y: u32, z: u32, t: u32) -> Self {
        Self { x, y, z, t }
    }

    pub fn node_count(&self) -> usize {
        self.x as usize * self.y as usize * self.z as usize * self.t as usize
    }

    fn as_array(&self) -> [u32; 4] {
        [self.x, self.y, self.z, self.t]
    }

    /// Every extent must be 1 or a positive even number.
    pub fn validate(&self) -> Result<()> {
        for (name, dim) in ["x", "y", "z", "t"].iter().zip(self.as_array()) {
            if dim == 0 || (dim != 1 && dim % GROUP_EXTENT != 0) {
                return Err(RuntimeError::Config(format!(
                    "torus dimension {} = {} must be 1 or even",
                    name, dim
                )));
            }
        }
        Ok(())
    }
}

impl Default for TorusDims {
    fn default() -> Self {
        Self::new(4, 4, 4, 2)
    }
}

impl fmt::Display for TorusDims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}x{}", self.x, self.y, self.z, self.t)
    }
}

/// Position of a node on the torus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct Coordinate {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub t: u32,
}

impl Coordinate {
    pub const fn new(x: u32, y: u32, z: u32, t: u32) -> Self {
        Self { x, y, z, t }
    }

    fn as_array(&self) -> [u32; 4] {
        [self.x, self.y, self.z, self.t]
    }

    fn from_array(a: [u32; 4]) -> Self {
        Self::new(a[0], a[1], a[2], a[3])
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {}, {})", self.x, self.y, self.z, self.t)
    }
}

/// Where a logical stream lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamLocation {
    pub stream: usize,
    pub group: usize,
    pub index_in_group: usize,
    pub rank: usize,
    pub coordinate: Coordinate,
}

/// Converts between ranks, coordinates and groups for one torus.
#[derive(Debug, Clone, Copy)]
pub struct TopologyMapper {
    dims: TorusDims,
    block: [u32; 4],
}

impl TopologyMapper {
    pub fn new(dims: TorusDims) -> Result<Self> {
        dims.validate()?;
        let block = dims.as_array().map(|d| d.min(GROUP_EXTENT));
        Ok(Self { dims, block })
    }

    pub fn dims(&self) -> TorusDims {
        self.dims
    }

    pub fn node_count(&self) -> usize {
        self.dims.node_count()
    }

    /// Nodes per group.
    pub fn group_size(&self) -> usize {
        self.block.iter().map(|&b| b as usize).product()
    }

    pub fn group_count(&self) -> usize {
        self.node_count() / self.group_size()
    }

    /// Block extents along x, y, z, t.
    pub fn block_extent(&self) -> Coordinate {
        Coordinate::from_array(self.block)
    }

    fn check(&self, c: &Coordinate) -> Result<()> {
        let inside = c
            .as_array()
            .iter()
            .zip(self.dims.as_array())
            .all(|(&v, d)| v < d);
        if !inside {
            return Err(RuntimeError::InvalidState(format!(
                "coordinate {} outside torus {}",
                c, self.dims
            )));
        }
        Ok(())
    }

    pub fn coordinate(&self, rank: usize) -> Result<Coordinate> {
        if rank >= self.node_count() {
            return Err(RuntimeError::InvalidState(format!(
                "rank {} outside torus {} ({} nodes)",
                rank,
                self.dims,
                self.node_count()
            )));
        }
        let mut rest = rank;
        let mut out = [0u32; 4];
        for (slot, dim) in out.iter_mut().zip(self.dims.as_array()) {
            *slot = (rest % dim as usize) as u32;
            rest /= dim as usize;
        }
        Ok(Coordinate::from_array(out))
    }

    pub fn rank(&self, c: &Coordinate) -> Result<usize> {
        self.check(c)?;
        Ok(flatten(c.as_array(), self.dims.as_array()))
    }

    /// Lowest corner of the group containing `c`. Idempotent.
    pub fn group_base(&self, c: &Coordinate) -> Coordinate {
        let mut out = c.as_array();
        for (v, b) in out.iter_mut().zip(self.block) {
            *v -= *v % b;
        }
        Coordinate::from_array(out)
    }

    /// Flat index of the group containing `c`.
    pub fn group_id(&self, c: &Coordinate) -> Result<usize> {
        self.check(c)?;
        let blocks = self.blocks_per_dim();
        let mut pos = c.as_array();
        for (v, b) in pos.iter_mut().zip(self.block) {
            *v /= b;
        }
        Ok(flatten(pos, blocks))
    }

    /// Position of `c` inside its group, in `[0, group_size)`.
    pub fn index_within_group(&self, c: &Coordinate) -> Result<usize> {
        self.check(c)?;
        let mut pos = c.as_array();
        for (v, b) in pos.iter_mut().zip(self.block) {
            *v %= b;
        }
        Ok(flatten(pos, self.block))
    }

    /// Rank of the `index`-th node of `group`.
    pub fn rank_in_group(&self, group: usize, index: usize) -> Result<usize> {
        if group >= self.group_count() || index >= self.group_size() {
            return Err(RuntimeError::InvalidState(format!(
                "group {} index {} outside {} groups of {}",
                group,
                index,
                self.group_count(),
                self.group_size()
            )));
        }
        let block_pos = unflatten(group, self.blocks_per_dim());
        let inner = unflatten(index, self.block);
        let mut c = [0u32; 4];
        for i in 0..4 {
            c[i] = block_pos[i] * self.block[i] + inner[i];
        }
        self.rank(&Coordinate::from_array(c))
    }

    /// Group, position and node of logical stream `stream`.
    ///
    /// Streams fill groups in order: stream `s` is node `s % group_size` of
    /// group `s / group_size`.
    pub fn stream_location(&self, stream: usize) -> Result<StreamLocation> {
        let group = stream / self.group_size();
        let index_in_group = stream % self.group_size();
        let rank = self.rank_in_group(group, index_in_group)?;
        Ok(StreamLocation {
            stream,
            group,
            index_in_group,
            rank,
            coordinate: self.coordinate(rank)?,
        })
    }

    fn blocks_per_dim(&self) -> [u32; 4] {
        let dims = self.dims.as_array();
        [0, 1, 2, 3].map(|i| dims[i] / self.block[i])
    }
}

fn flatten(pos: [u32; 4], extents: [u32; 4]) -> usize {
    pos.iter()
        .zip(extents)
        .rev()
        .fold(0usize, |acc, (&p, e)| acc * e as usize + p as usize)
}

fn unflatten(mut flat: usize, extents: [u32; 4]) -> [u32; 4] {
    let mut out = [0u32; 4];
    for (slot, e) in out.iter_mut().zip(extents) {
        *slot = (flat % e as usize) as u32;
        flat /= e as usize;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn torus() -> TopologyMapper {
        TopologyMapper::new(TorusDims::new(4, 4, 4, 2)).unwrap()
    }

    #[test]
    fn test_rank_layout_is_x_fastest() {
        let topo = torus();
        assert_eq!(topo.rank(&Coordinate::new(1, 0, 0, 0)).unwrap(), 1);
        assert_eq!(topo.rank(&Coordinate::new(0, 1, 0, 0)).unwrap(), 4);
        assert_eq!(topo.rank(&Coordinate::new(0, 0, 0, 1)).unwrap(), 64);
    }

    #[test]
    fn test_group_sizes() {
        let topo = torus();
        assert_eq!(topo.group_size(), 16);
        assert_eq!(topo.group_count(), 8);

        let flat = TopologyMapper::new(TorusDims::new(4, 1, 1, 1)).unwrap();
        assert_eq!(flat.group_size(), 2);
        assert_eq!(flat.group_count(), 2);
    }

    #[test]
    fn test_odd_dimension_rejected() {
        assert!(TopologyMapper::new(TorusDims::new(3, 4, 4, 2)).is_err());
        assert!(TopologyMapper::new(TorusDims::new(0, 4, 4, 2)).is_err());
    }

    #[test]
    fn test_out_of_range() {
        let topo = torus();
        assert!(topo.coordinate(128).is_err());
        assert!(topo.rank(&Coordinate::new(4, 0, 0, 0)).is_err());
    }

    #[test]
    fn test_index_within_group_is_bijection() {
        let topo = torus();
        for group in 0..topo.group_count() {
            let seen: HashSet<usize> = (0..topo.node_count())
                .map(|r| topo.coordinate(r).unwrap())
                .filter(|c| topo.group_id(c).unwrap() == group)
                .map(|c| topo.index_within_group(&c).unwrap())
                .collect();
            assert_eq!(seen.len(), topo.group_size());
            assert!(seen.iter().all(|&i| i < topo.group_size()));
        }
    }

    #[test]
    fn test_stream_location() {
        let topo = torus();
        let loc = topo.stream_location(17).unwrap();
        assert_eq!(loc.group, 1);
        assert_eq!(loc.index_in_group, 1);
        let c = topo.coordinate(loc.rank).unwrap();
        assert_eq!(topo.group_id(&c).unwrap(), 1);
        assert_eq!(topo.index_within_group(&c).unwrap(), 1);
        assert!(topo.stream_location(128).is_err());
    }

    proptest! {
        #[test]
        fn prop_rank_round_trip(rank in 0usize..128) {
            let topo = torus();
            let c = topo.coordinate(rank).unwrap();
            prop_assert_eq!(topo.rank(&c).unwrap(), rank);
        }

        #[test]
        fn prop_coordinate_round_trip(x in 0u32..4, y in 0u32..4, z in 0u32..4, t in 0u32..2) {
            let topo = torus();
            let c = Coordinate::new(x, y, z, t);
            prop_assert_eq!(topo.coordinate(topo.rank(&c).unwrap()).unwrap(), c);
        }

        #[test]
        fn prop_group_base_idempotent_and_even(rank in 0usize..128) {
            let topo = torus();
            let c = topo.coordinate(rank).unwrap();
            let base = topo.group_base(&c);
            prop_assert_eq!(topo.group_base(&base), base);
            prop_assert_eq!(base.x % 2, 0);
            prop_assert_eq!(base.y % 2, 0);
            prop_assert_eq!(base.z % 2, 0);
            prop_assert_eq!(topo.group_id(&base).unwrap(), topo.group_id(&c).unwrap());
        }

        #[test]
        fn prop_rank_in_group_inverts(rank in 0usize..128) {
            let topo = torus();
            let c = topo.coordinate(rank).unwrap();
            let group = topo.group_id(&c).unwrap();
            let index = topo.index_within_group(&c).unwrap();
            prop_assert_eq!(topo.rank_in_group(group, index).unwrap(), rank);
        }
    }
}
