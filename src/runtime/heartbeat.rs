//! Heartbeat keep-alive tracking.

use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum HeartbeatDecision {
    SendRequest,
    ConnectionDead,
}

/// Tracks send/receive idleness on the live connection. The server
/// normally initiates heartbeats; this covers servers that have gone
/// quiet entirely.
#[derive(Clone, Debug)]
pub(crate) struct HeartbeatTracker {
    interval: Duration,
    timeout: Duration,
    last_recv: Duration,
    last_send: Duration,
}

impl HeartbeatTracker {
    pub(crate) fn new(interval: Duration, timeout: Duration, now: Duration) -> Self {
        Self {
            interval,
            timeout,
            last_recv: now,
            last_send: now,
        }
    }

    pub(crate) fn note_recv(&mut self, now: Duration) {
        self.last_recv = now;
    }

    pub(crate) fn note_send(&mut self, now: Duration) {
        self.last_send = now;
    }

    pub(crate) fn poll(&mut self, now: Duration) -> Option<HeartbeatDecision> {
        if !self.timeout.is_zero() && now.saturating_sub(self.last_recv) >= self.timeout {
            return Some(HeartbeatDecision::ConnectionDead);
        }
        if !self.interval.is_zero() && now.saturating_sub(self.last_send) >= self.interval {
            return Some(HeartbeatDecision::SendRequest);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn emits_request_after_send_idle() {
        let mut tracker = HeartbeatTracker::new(ms(100), ms(1_000), ms(0));

        assert!(tracker.poll(ms(99)).is_none());
        assert_eq!(tracker.poll(ms(100)), Some(HeartbeatDecision::SendRequest));
        tracker.note_send(ms(100));

        assert!(tracker.poll(ms(150)).is_none());
        assert_eq!(tracker.poll(ms(201)), Some(HeartbeatDecision::SendRequest));
    }

    #[test]
    fn dead_connection_trumps_request() {
        let mut tracker = HeartbeatTracker::new(ms(50), ms(100), ms(0));
        assert_eq!(
            tracker.poll(ms(101)),
            Some(HeartbeatDecision::ConnectionDead)
        );
    }

    #[test]
    fn receive_resets_deadline() {
        let mut tracker = HeartbeatTracker::new(ms(0), ms(100), ms(0));

        tracker.note_recv(ms(80));
        assert!(tracker.poll(ms(150)).is_none());
        assert_eq!(
            tracker.poll(ms(181)),
            Some(HeartbeatDecision::ConnectionDead)
        );
    }

    #[test]
    fn zero_timeout_disables_monitoring() {
        let mut tracker = HeartbeatTracker::new(ms(0), ms(0), ms(0));
        assert!(tracker.poll(ms(60_000)).is_none());
    }
}
