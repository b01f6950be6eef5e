//! Liveness tracking for monitored peers
//!
//! Every monitored relationship (master -> slave, node -> registry) keeps one [`Liveness`]
//! per connection. Any received frame counts as a sign of life; heartbeats only exist to
//! keep an otherwise idle connection talking. A session loop waits on
//! [`Liveness::deadline`] alongside its other events and ends once it passes, which is
//! what makes the loss notification fire exactly once: it is sent after the loop exits.

use std::time::Duration;
use tokio::time::{interval, Instant, Interval, MissedTickBehavior};

#[derive(Debug, Clone)]
pub struct Liveness {
    last_seen: Instant,
    timeout: Duration,
}

impl Liveness {
    pub fn new(timeout: Duration) -> Self {
        Self {
            last_seen: Instant::now(),
            timeout,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn is_alive(&self) -> bool {
        self.last_seen.elapsed() < self.timeout
    }

    /// instant after which the peer counts as lost
    pub fn deadline(&self) -> Instant {
        self.last_seen + self.timeout
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Ticker for outgoing heartbeats, skipping ticks missed while the owner was busy
pub fn heartbeat(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    ticker
}
