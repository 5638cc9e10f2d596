use std::collections::VecDeque;

use tokio::time::Instant;

/// Keeps the last N events for post-mortem inspection, evicting the oldest. Recording is a no-op
///  unless enabled, and the event text is only built when it is actually recorded.
pub struct RecentEvents<const N: usize> {
    enabled: bool,
    started: Instant,
    events: VecDeque<String>,
}

impl<const N: usize> RecentEvents<N> {
    pub fn new(enabled: bool) -> RecentEvents<N> {
        RecentEvents {
            enabled,
            started: Instant::now(),
            events: VecDeque::with_capacity(if enabled { N } else { 0 }),
        }
    }

    pub fn record(&mut self, event: impl FnOnce() -> String) {
        if !self.enabled {
            return;
        }
        if self.events.len() == N {
            let _ = self.events.pop_front();
        }
        let elapsed = self.started.elapsed();
        self.events.push_back(format!("{:>6}.{:03} {}", elapsed.as_secs(), elapsed.subsec_millis(), event()));
    }

    /// oldest first
    pub fn snapshot(&self) -> Vec<String> {
        self.events.iter().cloned().collect()
    }
}
