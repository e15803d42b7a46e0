//! Per-channel traffic statistics.

use std::collections::VecDeque;

/// Size of the rolling window for recent transfer times
const RECENT_WINDOW_SIZE: usize = 64;

/// Counters and latency tracking for one channel.
#[derive(Debug, Clone)]
pub struct ChannelStats {
    /// Messages written completely
    pub messages_sent: u64,
    /// Messages read and unpacked completely
    pub messages_received: u64,
    /// Bytes written, headers included
    pub bytes_sent: u64,
    /// Bytes read, headers included
    pub bytes_received: u64,
    /// Received sequence numbers that skipped ahead or went backwards
    pub sequence_gaps: u64,
    /// Calls that ended in the Error state
    pub errors: u64,
    /// Non-blocking calls that returned Busy
    pub busy_returns: u64,

    /// Minimum blocking read time observed (microseconds)
    pub min_read_time_us: u64,
    /// Maximum blocking read time observed (microseconds)
    pub max_read_time_us: u64,
    /// Rolling window of recent read times
    pub recent_read_times: VecDeque<u64>,
}

impl Default for ChannelStats {
    fn default() -> Self {
        Self {
            messages_sent: 0,
            messages_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
            sequence_gaps: 0,
            errors: 0,
            busy_returns: 0,
            min_read_time_us: u64::MAX,
            max_read_time_us: 0,
            recent_read_times: VecDeque::with_capacity(RECENT_WINDOW_SIZE),
        }
    }
}

impl ChannelStats {
    pub fn record_sent(&mut self, bytes: usize) {
        self.messages_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    /// Record a completed read and how long the caller waited for it
    pub fn record_received(&mut self, bytes: usize, time_us: u64) {
        self.messages_received += 1;
        self.bytes_received += bytes as u64;
        self.min_read_time_us = self.min_read_time_us.min(time_us);
        self.max_read_time_us = self.max_read_time_us.max(time_us);
        self.recent_read_times.push_back(time_us);
        if self.recent_read_times.len() > RECENT_WINDOW_SIZE {
            self.recent_read_times.pop_front();
        }
    }

    pub fn record_gap(&mut self) {
        self.sequence_gaps += 1;
    }

    pub fn record_error(&mut self) {
        self.errors += 1;
    }

    pub fn record_busy(&mut self) {
        self.busy_returns += 1;
    }

    /// Average of the recent read times in microseconds
    pub fn avg_read_time_us(&self) -> f64 {
        if self.recent_read_times.is_empty() {
            0.0
        } else {
            self.recent_read_times.iter().sum::<u64>() as f64 / self.recent_read_times.len() as f64
        }
    }

    /// Jitter (max - min) over the recent window in microseconds
    pub fn jitter_us(&self) -> u64 {
        let min = self.recent_read_times.iter().min().copied().unwrap_or(0);
        let max = self.recent_read_times.iter().max().copied().unwrap_or(0);
        max.saturating_sub(min)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_received() {
        let mut stats = ChannelStats::default();
        stats.record_received(100, 10);
        stats.record_received(100, 30);
        assert_eq!(stats.messages_received, 2);
        assert_eq!(stats.bytes_received, 200);
        assert_eq!(stats.min_read_time_us, 10);
        assert_eq!(stats.max_read_time_us, 30);
        assert_eq!(stats.jitter_us(), 20);
        assert!((stats.avg_read_time_us() - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut stats = ChannelStats::default();
        for i in 0..(RECENT_WINDOW_SIZE as u64 + 10) {
            stats.record_received(1, i);
        }
        assert_eq!(stats.recent_read_times.len(), RECENT_WINDOW_SIZE);
    }

    #[test]
    fn test_reset() {
        let mut stats = ChannelStats::default();
        stats.record_sent(10);
        stats.record_gap();
        stats.reset();
        assert_eq!(stats.messages_sent, 0);
        assert_eq!(stats.sequence_gaps, 0);
    }
}
