use tokio::time::{Duration, Instant};

/// What to do when the heartbeat interval fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    /// Previous heartbeat was acknowledged; send the next one
    Send,
    /// Previous heartbeat is still unacknowledged; the connection is dead
    Zombie,
}

/// Tracks heartbeat liveness for a single connection
#[derive(Debug, Default)]
pub struct HeartbeatMonitor {
    /// Interval announced by HELLO
    interval: Option<Duration>,

    /// A heartbeat went out and no ack has arrived yet
    ack_pending: bool,

    last_sent: Option<Instant>,

    last_ack: Option<Instant>,

    /// Send-to-ack time of the last acknowledged heartbeat
    latency: Option<Duration>,
}

impl HeartbeatMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh connection: nothing in flight, no interval until HELLO.
    pub fn reset(&mut self) {
        self.interval = None;
        self.ack_pending = false;
        self.last_sent = None;
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = Some(interval);
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Decide the action for an interval tick.
    pub fn tick(&self) -> Beat {
        if self.ack_pending {
            Beat::Zombie
        } else {
            Beat::Send
        }
    }

    /// Record that a heartbeat was written to the socket
    pub fn record_sent(&mut self) {
        self.ack_pending = true;
        self.last_sent = Some(Instant::now());
    }

    /// Record an ack; returns the measured latency if a heartbeat was in flight
    pub fn record_ack(&mut self) -> Option<Duration> {
        let now = Instant::now();
        self.last_ack = Some(now);

        if !self.ack_pending {
            return None;
        }
        self.ack_pending = false;
        self.latency = self.last_sent.map(|sent| now.saturating_duration_since(sent));
        self.latency
    }

    pub fn ack_pending(&self) -> bool {
        self.ack_pending
    }

    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    pub fn last_ack(&self) -> Option<Instant> {
        self.last_ack
    }
}
