//! Per-frame counters and phase timings.

use std::time::Duration;

use serde::Serialize;

/// Wall time spent in each phase of the frame loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PhaseTimings {
    pub filter: Duration,
    pub select: Duration,
    pub adapter: Duration,
    pub trace: Duration,
    pub shuffle: Duration,
    pub send: Duration,
    pub vote: Duration,
    pub gather: Duration,
    pub frame: Duration,
}

impl PhaseTimings {
    /// Sum of the individually timed phases.
    pub fn accounted(&self) -> Duration {
        self.filter
            + self.select
            + self.adapter
            + self.trace
            + self.shuffle
            + self.send
            + self.vote
            + self.gather
    }
}

/// Counters for one frame on one rank.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FrameStats {
    pub rank: usize,
    /// Scheduling rounds (local drain + exchange + vote)
    pub rounds: u64,
    /// Camera rays kept by the filter and queued on this rank
    pub rays_filtered: u64,
    /// Rays handed to adapters
    pub rays_traced: u64,
    /// Rays adapters returned beyond the ones they were given
    pub rays_spawned: u64,
    /// Rays returned by adapters and re-routed
    pub rays_shuffled: u64,
    /// Rays packed for another rank
    pub rays_sent: u64,
    pub bytes_sent: u64,
    pub rays_received: u64,
    /// Rays absorbed into the compositor
    pub rays_absorbed: u64,
    /// Rays that left the scene without contributing
    pub rays_dropped: u64,
    pub timings: PhaseTimings,
}

impl FrameStats {
    pub fn new(rank: usize) -> Self {
        Self {
            rank,
            ..Default::default()
        }
    }

    /// Log the frame summary.
    pub fn log_summary(&self, tracer: &str) {
        log::info!(
            "{} tracer [rank {}]: {} rounds, filtered {}, traced {}, spawned {}, shuffled {}, sent {} ({} bytes), received {}, absorbed {}, dropped {}",
            tracer,
            self.rank,
            self.rounds,
            self.rays_filtered,
            self.rays_traced,
            self.rays_spawned,
            self.rays_shuffled,
            self.rays_sent,
            self.bytes_sent,
            self.rays_received,
            self.rays_absorbed,
            self.rays_dropped,
        );
        let t = &self.timings;
        log::info!(
            "{} tracer [rank {}]: frame {:?} (filter {:?}, select {:?}, adapter {:?}, trace {:?}, shuffle {:?}, send {:?}, vote {:?}, gather {:?}, unaccounted {:?})",
            tracer,
            self.rank,
            t.frame,
            t.filter,
            t.select,
            t.adapter,
            t.trace,
            t.shuffle,
            t.send,
            t.vote,
            t.gather,
            t.frame.saturating_sub(t.accounted()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accounted_time() {
        let timings = PhaseTimings {
            trace: Duration::from_millis(5),
            send: Duration::from_millis(2),
            frame: Duration::from_millis(10),
            ..Default::default()
        };
        assert_eq!(timings.accounted(), Duration::from_millis(7));
    }

    #[test]
    fn test_stats_serialize() {
        let _ = env_logger::builder().is_test(true).try_init();
        let stats = FrameStats::new(3);
        stats.log_summary("domain");
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"rank\":3"));
    }
}
