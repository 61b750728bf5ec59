//! Per-field recency guard for member state
//!
//! Member state arrives on two paths: the `member-update` broadcast and the
//! slower store change feed. Each `(user, field)` remembers when and from
//! where it was last applied; the fallback path may only write a field that
//! no broadcast (or local optimistic write) touched within the window.
//!
//! Each `(user, field)` also keeps the host timestamp of the newest write
//! applied to it, so reordered broadcasts resolve last-write-wins. Only the
//! host issues member writes, so those timestamps share one clock.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberField {
    Controls,
    Banned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    /// Host's own optimistic mutation
    Optimistic,
    Broadcast,
    Fallback,
    Poll,
}

impl UpdateSource {
    fn is_primary(&self) -> bool {
        matches!(self, UpdateSource::Optimistic | UpdateSource::Broadcast)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Applied {
    at_ms: u64,
    source: UpdateSource,
}

/// Saved guard state of one `(user, field)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldStamp {
    applied: Option<Applied>,
    written_at: Option<u64>,
}

#[derive(Debug)]
pub struct RecencyGuard {
    window_ms: u64,
    applied: HashMap<(String, MemberField), Applied>,
    written_at: HashMap<(String, MemberField), u64>,
}

impl RecencyGuard {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            applied: HashMap::new(),
            written_at: HashMap::new(),
        }
    }

    pub fn record(&mut self, user_id: &str, field: MemberField, source: UpdateSource, now_ms: u64) {
        self.applied
            .insert((user_id.to_string(), field), Applied { at_ms: now_ms, source });
    }

    /// Remember the host timestamp of a write applied to `field`
    pub fn record_write(&mut self, user_id: &str, field: MemberField, written_at: u64) {
        let latest = self.written_at.entry((user_id.to_string(), field)).or_insert(written_at);
        *latest = (*latest).max(written_at);
    }

    /// Whether a write stamped `written_at` is at least as new as the last
    /// one applied to `field`
    pub fn is_current(&self, user_id: &str, field: MemberField, written_at: u64) -> bool {
        self.written_at
            .get(&(user_id.to_string(), field))
            .map(|latest| written_at >= *latest)
            .unwrap_or(true)
    }

    /// Whether a fallback value for `field` may be applied now
    pub fn allows_fallback(&self, user_id: &str, field: MemberField, now_ms: u64) -> bool {
        match self.applied.get(&(user_id.to_string(), field)) {
            Some(applied) if applied.source.is_primary() => {
                now_ms.saturating_sub(applied.at_ms) >= self.window_ms
            }
            _ => true,
        }
    }

    pub fn stamp(&self, user_id: &str, field: MemberField) -> FieldStamp {
        let key = (user_id.to_string(), field);
        FieldStamp {
            applied: self.applied.get(&key).copied(),
            written_at: self.written_at.get(&key).copied(),
        }
    }

    /// Put back a stamp taken before a write that did not land
    pub fn restore(&mut self, user_id: &str, field: MemberField, stamp: FieldStamp) {
        let key = (user_id.to_string(), field);
        match stamp.applied {
            Some(applied) => self.applied.insert(key.clone(), applied),
            None => self.applied.remove(&key),
        };
        match stamp.written_at {
            Some(written_at) => self.written_at.insert(key, written_at),
            None => self.written_at.remove(&key),
        };
    }

    pub fn forget_user(&mut self, user_id: &str) {
        self.applied.retain(|(user, _), _| user != user_id);
        self.written_at.retain(|(user, _), _| user != user_id);
    }
}
