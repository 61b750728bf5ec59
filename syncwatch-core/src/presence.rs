//! Presence Tracker
//!
//! Tracks which members are currently connected from heartbeats on the
//! `presence` channel. Presence carries no playback or authorization
//! meaning; its only output is "the online set changed".

use std::collections::HashMap;

use tracing::debug;

use crate::sync::PresenceEnvelope;

/// Result of observing one presence envelope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PresenceUpdate {
    /// The online set changed
    pub changed: bool,
    /// A peer came online that we had not seen; announce ourselves once so
    /// it learns about us without waiting a full heartbeat period
    pub announce: bool,
}

#[derive(Debug)]
pub struct PresenceTracker {
    self_user_id: String,
    timeout_ms: u64,
    /// user id -> local receive time of the last heartbeat
    last_seen: HashMap<String, u64>,
}

impl PresenceTracker {
    pub fn new(self_user_id: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            self_user_id: self_user_id.into(),
            timeout_ms,
            last_seen: HashMap::new(),
        }
    }

    /// Our own heartbeat
    pub fn heartbeat(&self, now_ms: u64) -> PresenceEnvelope {
        PresenceEnvelope::new(self.self_user_id.clone(), now_ms, true)
    }

    /// Sent once when leaving the room
    pub fn departure(&self, now_ms: u64) -> PresenceEnvelope {
        PresenceEnvelope::new(self.self_user_id.clone(), now_ms, false)
    }

    /// Apply a heartbeat or departure from a peer.
    ///
    /// Liveness uses the local receive time rather than `sent_at`, so peer
    /// clock skew cannot keep a member online or expire it early.
    pub fn observe(&mut self, envelope: &PresenceEnvelope, now_ms: u64) -> PresenceUpdate {
        if envelope.user_id == self.self_user_id {
            return PresenceUpdate::default();
        }
        if envelope.online {
            let was_online = self.last_seen.insert(envelope.user_id.clone(), now_ms).is_some();
            if !was_online {
                debug!("Presence: {} is online", envelope.user_id);
            }
            PresenceUpdate {
                changed: !was_online,
                announce: !was_online,
            }
        } else {
            let was_online = self.last_seen.remove(&envelope.user_id).is_some();
            if was_online {
                debug!("Presence: {} went offline", envelope.user_id);
            }
            PresenceUpdate {
                changed: was_online,
                announce: false,
            }
        }
    }

    /// Expire members whose last heartbeat is older than the timeout.
    /// Returns the users that went offline.
    pub fn sweep(&mut self, now_ms: u64) -> Vec<String> {
        let timeout = self.timeout_ms;
        let expired: Vec<String> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| now_ms.saturating_sub(**seen) > timeout)
            .map(|(user, _)| user.clone())
            .collect();
        for user in &expired {
            debug!("Presence: {} timed out", user);
            self.last_seen.remove(user);
        }
        expired
    }

    /// We are always online to ourselves
    pub fn is_online(&self, user_id: &str) -> bool {
        user_id == self.self_user_id || self.last_seen.contains_key(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beat(user: &str, online: bool) -> PresenceEnvelope {
        PresenceEnvelope::new(user, 0, online)
    }

    #[test]
    fn test_first_sight_announces_once() {
        let mut tracker = PresenceTracker::new("me", 75_000);
        let first = tracker.observe(&beat("alice", true), 1_000);
        assert!(first.changed && first.announce);

        let second = tracker.observe(&beat("alice", true), 31_000);
        assert_eq!(second, PresenceUpdate::default());
        assert!(tracker.is_online("alice"));
    }

    #[test]
    fn test_departure_marks_offline() {
        let mut tracker = PresenceTracker::new("me", 75_000);
        tracker.observe(&beat("alice", true), 0);
        let update = tracker.observe(&beat("alice", false), 10);
        assert!(update.changed);
        assert!(!tracker.is_online("alice"));
    }

    #[test]
    fn test_sweep_expires_silent_peers() {
        let mut tracker = PresenceTracker::new("me", 75_000);
        tracker.observe(&beat("alice", true), 0);
        tracker.observe(&beat("bob", true), 60_000);

        assert_eq!(tracker.sweep(80_000), vec!["alice".to_string()]);
        assert!(!tracker.is_online("alice"));
        assert!(tracker.is_online("bob"));
    }

    #[test]
    fn test_own_heartbeat_ignored() {
        let mut tracker = PresenceTracker::new("me", 75_000);
        assert_eq!(tracker.observe(&beat("me", true), 0), PresenceUpdate::default());
        assert!(tracker.last_seen.is_empty());
        assert!(tracker.is_online("me"));
    }
}
