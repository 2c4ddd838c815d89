//! Fault and timer supervision
//!
//! Heartbeat scheduling, the warm-reboot grace window, and the ring
//! log that correlates negative acknowledgments with the TLV kind of
//! the rejected message.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::tlv::TlvKind;

/// Capacity of the outstanding-message ring. A NAK referencing a
/// message that has already been overwritten falls back to a general
/// resynchronization request.
const MSG_LOG_CAPACITY: usize = 128;

/// Fixed-size ring mapping live outbound message identifiers to the
/// TLV kind they carried.
#[derive(Debug)]
pub struct MessageLog {
    ring: Vec<Option<(u32, TlvKind)>>,
    next: usize,
}

impl MessageLog {
    pub fn new() -> Self {
        Self {
            ring: vec![None; MSG_LOG_CAPACITY],
            next: 0,
        }
    }

    /// Records an identifier before the message is sent.
    pub fn record(&mut self, msg_id: u32, kind: TlvKind) {
        self.ring[self.next] = Some((msg_id, kind));
        self.next = (self.next + 1) % self.ring.len();
    }

    /// Recovers the TLV kind of an outstanding message, consuming the
    /// slot so each identifier resolves at most once.
    pub fn resolve(&mut self, msg_id: u32) -> Option<TlvKind> {
        for slot in self.ring.iter_mut() {
            if let Some((id, kind)) = *slot {
                if id == msg_id {
                    *slot = None;
                    return Some(kind);
                }
            }
        }
        None
    }

    pub fn clear(&mut self) {
        self.ring.iter_mut().for_each(|s| *s = None);
        self.next = 0;
    }
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::new()
    }
}

/// What a resolved (or unresolvable) NAK asks the engine to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakAction {
    /// The peer rejected our system configuration: node-id collision,
    /// decrement and re-announce.
    DecrementNodeId,
    /// Any other kind, or an identifier the log no longer holds: force
    /// a general resynchronization request on the next tick.
    ForceResync,
}

/// Heartbeat and warm-reboot grace timers.
#[derive(Debug)]
pub struct TimerSupervisor {
    keepalive: Duration,
    last_heartbeat_sent: Option<Instant>,
    last_peer_activity: Option<Instant>,
    grace: Duration,
    grace_armed_at: Option<Instant>,
}

impl TimerSupervisor {
    pub fn new(keepalive: Duration, grace: Duration) -> Self {
        Self {
            keepalive,
            last_heartbeat_sent: None,
            last_peer_activity: None,
            grace,
            grace_armed_at: None,
        }
    }

    /// True when a heartbeat is due, measured from the last send rather
    /// than a fixed wall-clock grid. Callers stamp via
    /// [`TimerSupervisor::heartbeat_sent`] once the send succeeded.
    pub fn heartbeat_due(&self, now: Instant) -> bool {
        match self.last_heartbeat_sent {
            Some(t) => now.duration_since(t) >= self.keepalive,
            None => true,
        }
    }

    pub fn heartbeat_sent(&mut self, now: Instant) {
        self.last_heartbeat_sent = Some(now);
    }

    /// Refreshes liveness bookkeeping on any peer message. A missed
    /// heartbeat is not itself fatal; failure detection is delegated to
    /// the transport.
    pub fn peer_activity(&mut self, now: Instant) {
        self.last_peer_activity = Some(now);
    }

    pub fn last_peer_activity(&self) -> Option<Instant> {
        self.last_peer_activity
    }

    /// Arms the warm-reboot grace window (peer announced a reboot, or
    /// the peer socket dropped).
    pub fn arm_grace(&mut self, now: Instant) {
        info!(grace_secs = self.grace.as_secs(), "warm-reboot grace window armed");
        self.grace_armed_at = Some(now);
    }

    /// True while the grace window is armed and unexpired. An expired
    /// window is disarmed as a side effect; normal aging handling then
    /// resumes unconditionally.
    pub fn grace_active(&mut self, now: Instant) -> bool {
        match self.grace_armed_at {
            Some(t) if now.duration_since(t) < self.grace => true,
            Some(_) => {
                debug!("warm-reboot grace window expired");
                self.grace_armed_at = None;
                false
            }
            None => false,
        }
    }

    /// Cancels the window on successful reconnection.
    pub fn disarm_grace(&mut self) {
        self.grace_armed_at = None;
    }

    pub fn reset(&mut self) {
        self.last_heartbeat_sent = None;
        self.last_peer_activity = None;
    }
}

/// Resolves a NAK'd message id into the action the engine must take.
pub fn resolve_nak(log: &mut MessageLog, rejected_msg_id: u32) -> NakAction {
    match log.resolve(rejected_msg_id) {
        Some(TlvKind::SystemConfig) => NakAction::DecrementNodeId,
        Some(kind) => {
            debug!(?kind, rejected_msg_id, "peer rejected message; forcing resync");
            NakAction::ForceResync
        }
        None => {
            debug!(rejected_msg_id, "NAK for unknown message id; forcing resync");
            NakAction::ForceResync
        }
    }
}
