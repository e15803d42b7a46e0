//! Channel identity.
//!
//! Tags are dense `u32`s handed out by a [`TagAllocator`] owned by one runtime
//! instance, so two runtimes in the same process never share a tag space.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Monotonically increasing channel identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ChannelTag(pub u32);

impl ChannelTag {
    pub const INVALID: ChannelTag = ChannelTag(u32::MAX);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ChannelTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "ChannelTag(INVALID)")
        } else {
            write!(f, "ChannelTag({})", self.0)
        }
    }
}

impl fmt::Display for ChannelTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Hands out unique tags for one runtime instance.
#[derive(Debug, Default)]
pub struct TagAllocator {
    next: AtomicU32,
}

impl TagAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_tag(&self) -> ChannelTag {
        ChannelTag(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Number of tags handed out so far.
    pub fn issued(&self) -> u32 {
        self.next.load(Ordering::Relaxed)
    }
}
