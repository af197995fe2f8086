//! Heartbeat monitor: tells an idle-but-alive connection from a dead one.
//!
//! Armed while the reader loop waits for inbound data. After `read_timeout` of silence a
//! ping is issued; if nothing arrives within `ping_timeout` the connection is dead.
//! Any inbound frame counts as liveness and as the ping acknowledgment.

use std::time::Duration;
use tokio::time::Instant;

/// What the reader loop must do when the current deadline passes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send a ping carrying this payload and keep waiting.
    Ping(Vec<u8>),
    /// The ping went unanswered: treat as connection loss.
    Dead,
}

#[derive(Debug)]
pub struct Heartbeat {
    read_timeout: Duration,
    ping_timeout: Duration,
    deadline: Instant,
    pinged: bool,
    pings_sent: u64,
}

impl Heartbeat {
    pub fn new(read_timeout: Duration, ping_timeout: Duration) -> Self {
        Self {
            read_timeout,
            ping_timeout,
            deadline: Instant::now() + read_timeout,
            pinged: false,
            pings_sent: 0,
        }
    }

    /// Time left before the current deadline (zero when already passed).
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn awaiting_ack(&self) -> bool {
        self.pinged
    }

    pub fn pings_sent(&self) -> u64 {
        self.pings_sent
    }

    /// Inbound frame seen: back to normal waiting.
    pub fn on_activity(&mut self) {
        if self.pinged {
            log::info!("heartbeat acknowledged");
        }
        self.pinged = false;
        self.deadline = Instant::now() + self.read_timeout;
    }

    /// The deadline passed without inbound data.
    pub fn on_timeout(&mut self) -> HeartbeatAction {
        if self.pinged {
            return HeartbeatAction::Dead;
        }
        self.pinged = true;
        self.pings_sent += 1;
        self.deadline = Instant::now() + self.ping_timeout;
        HeartbeatAction::Ping(self.pings_sent.to_be_bytes().to_vec())
    }
}
