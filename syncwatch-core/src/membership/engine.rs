//! Membership & Authorization Engine
//!
//! Owns the local view of a room's member set. Host operations are applied
//! optimistically and handed back as a [`MemberMutation`] for the session to
//! write; the session then either commits (broadcast) or rolls back.
//! Remote state arrives via broadcast, the store change feed, and the ban
//! poll, each with its own precedence.

use thiserror::Error;
use tracing::{debug, info, warn};

use super::optimistic::Transaction;
use super::recency::{FieldStamp, MemberField, RecencyGuard, UpdateSource};
use crate::sync::{Authority, MemberEnvelope, MemberPatch, MemberRow, SenderStatus};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MembershipError {
    #[error("Only the host can do that")]
    NotHost,

    #[error("Unknown member: {0}")]
    UnknownMember(String),

    #[error("The host cannot be targeted")]
    CannotTargetHost,
}

/// Self-membership standing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Standing {
    Normal,
    Banned,
}

/// User-facing membership notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    Banned,
    Unbanned,
    ControlsGranted,
    ControlsRevoked,
}

impl Notification {
    pub fn message(&self) -> &'static str {
        match self {
            Notification::Banned => "You have been banned from this room.",
            Notification::Unbanned => "You have been unbanned from this room.",
            Notification::ControlsGranted => "You have been granted room controls!",
            Notification::ControlsRevoked => "Your room controls have been revoked.",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberOp {
    SetControls,
    Ban,
    Unban,
    GrantAll,
    RevokeAll,
}

/// A host operation applied locally and waiting for its store write
#[derive(Debug)]
pub struct MemberMutation {
    pub op: MemberOp,
    pub patch: MemberPatch,
    txn: Transaction<String, MemberRow>,
    /// Guard state of every touched field before the mutation
    stamps: Vec<(String, MemberField, FieldStamp)>,
}

impl MemberMutation {
    /// Row ids the store write must target
    pub fn member_ids(&self) -> Vec<String> {
        self.txn.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.txn.is_empty()
    }
}

/// What a remote member update did to the local view
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemberUpdateOutcome {
    pub changed: bool,
    /// New self standing, when it transitioned
    pub standing: Option<Standing>,
    pub notification: Option<Notification>,
}

#[derive(Debug)]
pub struct MembershipEngine {
    room_id: String,
    self_user_id: String,
    host_id: String,
    /// Ordered by `joined_at`
    members: Vec<MemberRow>,
    standing: Standing,
    /// Controls state the local user was last told about
    notified_controls: bool,
    recency: RecencyGuard,
}

impl MembershipEngine {
    pub fn new(
        room_id: impl Into<String>,
        self_user_id: impl Into<String>,
        host_id: impl Into<String>,
        recency_window_ms: u64,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            self_user_id: self_user_id.into(),
            host_id: host_id.into(),
            members: Vec::new(),
            standing: Standing::Normal,
            notified_controls: false,
            recency: RecencyGuard::new(recency_window_ms),
        }
    }

    /// Replace the member list with a fresh store read
    pub fn load(&mut self, mut members: Vec<MemberRow>) {
        members.retain(|m| m.room_id == self.room_id);
        for member in &mut members {
            if member.is_banned {
                member.has_controls = false;
            }
        }
        members.sort_by_key(|m| m.joined_at);
        let me = members.iter().find(|m| m.user_id == self.self_user_id);
        self.standing = match me {
            Some(me) if me.is_banned => Standing::Banned,
            _ => Standing::Normal,
        };
        self.notified_controls = me.map(|m| m.has_controls).unwrap_or(false);
        self.members = members;
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn is_host(&self) -> bool {
        self.self_user_id == self.host_id
    }

    pub fn standing(&self) -> Standing {
        self.standing
    }

    pub fn members(&self) -> &[MemberRow] {
        &self.members
    }

    pub fn member_by_user(&self, user_id: &str) -> Option<&MemberRow> {
        self.members.iter().find(|m| m.user_id == user_id)
    }

    fn member_by_user_mut(&mut self, user_id: &str) -> Option<&mut MemberRow> {
        self.members.iter_mut().find(|m| m.user_id == user_id)
    }

    /// `has_controls && !is_banned`
    pub fn can_control(&self, user_id: &str) -> bool {
        self.member_by_user(user_id)
            .map(|m| m.has_controls && !m.is_banned)
            .unwrap_or(false)
    }

    /// Local user's authority for the synchronizer
    pub fn authority(&self) -> Authority {
        let is_banned = self.standing == Standing::Banned;
        Authority {
            can_control: !is_banned && self.can_control(&self.self_user_id),
            is_banned,
        }
    }

    /// How the synchronizer should treat an envelope from `user_id`
    pub fn sender_status(&self, user_id: &str) -> SenderStatus {
        match self.member_by_user(user_id) {
            Some(m) => SenderStatus::Known {
                can_control: m.has_controls && !m.is_banned,
                is_banned: m.is_banned,
            },
            None => SenderStatus::Unknown,
        }
    }

    // ---- Host operations ----

    fn require_host(&self) -> Result<(), MembershipError> {
        if self.is_host() {
            Ok(())
        } else {
            Err(MembershipError::NotHost)
        }
    }

    fn target(&self, member_id: &str) -> Result<usize, MembershipError> {
        let index = self
            .members
            .iter()
            .position(|m| m.id == member_id)
            .ok_or_else(|| MembershipError::UnknownMember(member_id.to_string()))?;
        if self.members[index].user_id == self.host_id {
            return Err(MembershipError::CannotTargetHost);
        }
        Ok(index)
    }

    fn mutate(&mut self, op: MemberOp, patch: MemberPatch, indices: Vec<usize>, now_ms: u64) -> MemberMutation {
        let label = match op {
            MemberOp::SetControls => "set controls",
            MemberOp::Ban => "ban",
            MemberOp::Unban => "unban",
            MemberOp::GrantAll => "grant all controls",
            MemberOp::RevokeAll => "revoke all controls",
        };
        let patch = patch.normalized();
        let mut txn = Transaction::begin(label);
        let mut stamps = Vec::new();
        for index in indices {
            let member = &mut self.members[index];
            txn.record(member.id.clone(), member.clone());
            member.apply(&patch);
            let user_id = member.user_id.clone();
            for field in patch_fields(&patch) {
                stamps.push((user_id.clone(), field, self.recency.stamp(&user_id, field)));
                self.recency.record(&user_id, field, UpdateSource::Optimistic, now_ms);
                self.recency.record_write(&user_id, field, now_ms);
            }
        }
        debug!("Optimistic {} on {} members", label, txn.keys().count());
        MemberMutation { op, patch, txn, stamps }
    }

    pub fn set_controls(
        &mut self,
        member_id: &str,
        has_controls: bool,
        now_ms: u64,
    ) -> Result<MemberMutation, MembershipError> {
        self.require_host()?;
        let index = self.target(member_id)?;
        Ok(self.mutate(MemberOp::SetControls, MemberPatch::controls(has_controls), vec![index], now_ms))
    }

    pub fn ban(&mut self, member_id: &str, now_ms: u64) -> Result<MemberMutation, MembershipError> {
        self.require_host()?;
        let index = self.target(member_id)?;
        Ok(self.mutate(MemberOp::Ban, MemberPatch::ban(), vec![index], now_ms))
    }

    pub fn unban(&mut self, member_id: &str, now_ms: u64) -> Result<MemberMutation, MembershipError> {
        self.require_host()?;
        let index = self.target(member_id)?;
        Ok(self.mutate(MemberOp::Unban, MemberPatch::unban(), vec![index], now_ms))
    }

    /// Every non-host, non-banned member
    pub fn grant_all(&mut self, now_ms: u64) -> Result<MemberMutation, MembershipError> {
        self.require_host()?;
        let indices = self
            .members
            .iter()
            .enumerate()
            .filter(|(_, m)| m.user_id != self.host_id && !m.is_banned)
            .map(|(i, _)| i)
            .collect();
        Ok(self.mutate(MemberOp::GrantAll, MemberPatch::controls(true), indices, now_ms))
    }

    /// Every non-host member
    pub fn revoke_all(&mut self, now_ms: u64) -> Result<MemberMutation, MembershipError> {
        self.require_host()?;
        let indices = self
            .members
            .iter()
            .enumerate()
            .filter(|(_, m)| m.user_id != self.host_id)
            .map(|(i, _)| i)
            .collect();
        Ok(self.mutate(MemberOp::RevokeAll, MemberPatch::controls(false), indices, now_ms))
    }

    /// The store write landed: one `member-update` envelope per member
    pub fn commit(&self, mutation: MemberMutation, now_ms: u64) -> Vec<MemberEnvelope> {
        let patch = mutation.patch;
        mutation
            .txn
            .keys()
            .filter_map(|id| self.members.iter().find(|m| &m.id == id))
            .map(|m| {
                MemberEnvelope::new(
                    self.self_user_id.clone(),
                    now_ms,
                    m.user_id.clone(),
                    patch.has_controls,
                    patch.is_banned,
                )
            })
            .collect()
    }

    /// The store write failed: restore every touched row and the guard
    /// state, so the store stays free to correct those fields
    pub fn rollback(&mut self, mutation: MemberMutation) {
        let members = &mut self.members;
        mutation.txn.rollback(|id, previous| {
            if let Some(member) = members.iter_mut().find(|m| m.id == id) {
                *member = previous;
            }
        });
        for (user_id, field, stamp) in mutation.stamps.into_iter().rev() {
            self.recency.restore(&user_id, field, stamp);
        }
    }

    // ---- Remote updates ----

    fn self_transition(&mut self, is_banned: bool) -> Option<Standing> {
        let next = if is_banned { Standing::Banned } else { Standing::Normal };
        if next == self.standing {
            return None;
        }
        info!("Self standing {:?} -> {:?}", self.standing, next);
        self.standing = next;
        if next == Standing::Banned {
            self.notified_controls = false;
        }
        Some(next)
    }

    /// Apply a `member-update` broadcast
    pub fn on_remote_member_update(&mut self, envelope: &MemberEnvelope, now_ms: u64) -> MemberUpdateOutcome {
        if envelope.origin_user_id == self.self_user_id {
            return MemberUpdateOutcome::default();
        }
        if envelope.origin_user_id != self.host_id {
            warn!(
                "Ignoring member update for {} from non-host {}",
                envelope.user_id, envelope.origin_user_id
            );
            return MemberUpdateOutcome::default();
        }

        let user_id = envelope.user_id.as_str();
        let sent_at = envelope.sent_at;
        let patch = MemberPatch {
            has_controls: envelope.has_controls,
            is_banned: envelope.is_banned,
        }
        .normalized();
        // Fields already holding a newer host write keep it
        let patch = MemberPatch {
            has_controls: patch
                .has_controls
                .filter(|_| self.recency.is_current(user_id, MemberField::Controls, sent_at)),
            is_banned: patch
                .is_banned
                .filter(|_| self.recency.is_current(user_id, MemberField::Banned, sent_at)),
        };
        if patch.has_controls.is_none() && patch.is_banned.is_none() {
            debug!("Member update for {} sent at {} superseded by a newer one", user_id, sent_at);
            return MemberUpdateOutcome::default();
        }

        let is_self = user_id == self.self_user_id;
        let Some(member) = self.member_by_user_mut(user_id) else {
            debug!("Member update for unknown user {}, waiting for change feed", user_id);
            return MemberUpdateOutcome::default();
        };

        let changed = member.apply(&patch);
        let has_controls = member.has_controls;
        let is_banned = member.is_banned;

        for field in patch_fields(&patch) {
            self.recency.record(user_id, field, UpdateSource::Broadcast, now_ms);
            self.recency.record_write(user_id, field, sent_at);
        }

        let mut outcome = MemberUpdateOutcome {
            changed,
            ..Default::default()
        };
        if !is_self {
            return outcome;
        }

        if let Some(banned) = patch.is_banned {
            outcome.standing = self.self_transition(banned);
        }
        outcome.notification = match outcome.standing {
            Some(Standing::Banned) => Some(Notification::Banned),
            Some(Standing::Normal) => Some(Notification::Unbanned),
            // Compared against what the user was last told, so a change feed
            // row that landed first does not swallow the toast
            None if !is_banned && patch.has_controls.is_some() && has_controls != self.notified_controls => {
                Some(if has_controls {
                    Notification::ControlsGranted
                } else {
                    Notification::ControlsRevoked
                })
            }
            None => None,
        };
        if outcome.notification.is_some() || is_banned {
            self.notified_controls = has_controls;
        }
        outcome
    }

    /// Apply a member row from the store change feed. Fields a broadcast
    /// set within the recency window are left alone, and control changes
    /// never notify from this path.
    pub fn on_store_change_fallback(&mut self, row: &MemberRow, now_ms: u64) -> MemberUpdateOutcome {
        if row.room_id != self.room_id {
            return MemberUpdateOutcome::default();
        }
        if self.member_by_user(&row.user_id).is_none() {
            return self.on_member_inserted(row.clone());
        }

        let allow_banned = self.recency.allows_fallback(&row.user_id, MemberField::Banned, now_ms);
        let allow_controls = self.recency.allows_fallback(&row.user_id, MemberField::Controls, now_ms);
        let patch = MemberPatch {
            has_controls: allow_controls.then_some(row.has_controls),
            is_banned: allow_banned.then_some(row.is_banned),
        };
        if patch.has_controls.is_none() && patch.is_banned.is_none() {
            debug!("Fallback for {} superseded by a recent broadcast", row.user_id);
            return MemberUpdateOutcome::default();
        }

        let changed = match self.member_by_user_mut(&row.user_id) {
            Some(member) => member.apply(&patch),
            None => false,
        };
        for field in patch_fields(&patch) {
            self.recency.record(&row.user_id, field, UpdateSource::Fallback, now_ms);
        }

        let mut outcome = MemberUpdateOutcome {
            changed,
            ..Default::default()
        };
        if changed {
            debug!("Fallback corrected member {}", row.user_id);
        }
        if row.user_id == self.self_user_id {
            if let Some(banned) = patch.is_banned {
                outcome.standing = self.self_transition(banned);
                outcome.notification = outcome.standing.map(|s| match s {
                    Standing::Banned => Notification::Banned,
                    Standing::Normal => Notification::Unbanned,
                });
            }
        }
        outcome
    }

    /// A member row appeared (join or rejoin)
    pub fn on_member_inserted(&mut self, mut row: MemberRow) -> MemberUpdateOutcome {
        if row.room_id != self.room_id {
            return MemberUpdateOutcome::default();
        }
        if row.is_banned {
            row.has_controls = false;
        }
        if let Some(existing) = self.member_by_user_mut(&row.user_id) {
            if *existing == row {
                return MemberUpdateOutcome::default();
            }
            *existing = row;
        } else {
            debug!("Member {} joined", row.user_id);
            self.members.push(row);
        }
        self.members.sort_by_key(|m| m.joined_at);
        MemberUpdateOutcome {
            changed: true,
            ..Default::default()
        }
    }

    /// A member row was deleted; the ban record (if any) is untouched
    pub fn on_member_deleted(&mut self, member_id: &str) -> MemberUpdateOutcome {
        let Some(index) = self.members.iter().position(|m| m.id == member_id) else {
            return MemberUpdateOutcome::default();
        };
        let removed = self.members.remove(index);
        self.recency.forget_user(&removed.user_id);
        debug!("Member {} left", removed.user_id);
        MemberUpdateOutcome {
            changed: true,
            ..Default::default()
        }
    }

    /// Result of the periodic own-ban poll. Only ever detects bans.
    pub fn on_ban_poll(&mut self, is_banned: bool, now_ms: u64) -> MemberUpdateOutcome {
        if !is_banned || self.standing == Standing::Banned {
            return MemberUpdateOutcome::default();
        }
        let self_user_id = self.self_user_id.clone();
        let changed = match self.member_by_user_mut(&self_user_id) {
            Some(me) => me.apply(&MemberPatch::ban()),
            None => false,
        };
        self.recency
            .record(&self_user_id, MemberField::Banned, UpdateSource::Poll, now_ms);
        warn!("Ban poll: we have been banned from {}", self.room_id);
        MemberUpdateOutcome {
            changed,
            standing: self.self_transition(true),
            notification: Some(Notification::Banned),
        }
    }
}

/// Fields a patch writes
fn patch_fields(patch: &MemberPatch) -> impl Iterator<Item = MemberField> {
    let controls = patch.has_controls.map(|_| MemberField::Controls);
    let banned = patch.is_banned.map(|_| MemberField::Banned);
    controls.into_iter().chain(banned)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: u64 = 10_000;

    fn row(id: &str, user: &str, has_controls: bool, joined_at: u64) -> MemberRow {
        MemberRow {
            id: id.into(),
            room_id: "room".into(),
            user_id: user.into(),
            has_controls,
            is_banned: false,
            joined_at,
        }
    }

    fn members() -> Vec<MemberRow> {
        vec![
            row("m-host", "host", true, 0),
            row("m-alice", "alice", false, 1),
            row("m-bob", "bob", true, 2),
        ]
    }

    fn engine(self_user: &str) -> MembershipEngine {
        let mut engine = MembershipEngine::new("room", self_user, "host", WINDOW);
        engine.load(members());
        engine
    }

    fn update(user: &str, has_controls: Option<bool>, is_banned: Option<bool>) -> MemberEnvelope {
        MemberEnvelope::new("host", 0, user, has_controls, is_banned)
    }

    fn assert_ban_invariant(engine: &MembershipEngine) {
        for m in engine.members() {
            assert!(!(m.is_banned && m.has_controls), "{} is banned with controls", m.user_id);
        }
    }

    #[test]
    fn test_host_operations_require_host() {
        let mut alice = engine("alice");
        assert_eq!(alice.ban("m-bob", 0).unwrap_err(), MembershipError::NotHost);
        assert_eq!(alice.grant_all(0).unwrap_err(), MembershipError::NotHost);
    }

    #[test]
    fn test_host_cannot_be_targeted() {
        let mut host = engine("host");
        assert_eq!(host.ban("m-host", 0).unwrap_err(), MembershipError::CannotTargetHost);
    }

    #[test]
    fn test_ban_commit_broadcasts_forced_controls_off() {
        let mut host = engine("host");
        let mutation = host.ban("m-bob", 100).unwrap();
        assert_eq!(mutation.member_ids(), vec!["m-bob".to_string()]);
        assert!(!host.can_control("bob"));
        assert_ban_invariant(&host);

        let envelopes = host.commit(mutation, 100);
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].user_id, "bob");
        assert_eq!(envelopes[0].is_banned, Some(true));
        assert_eq!(envelopes[0].has_controls, Some(false));
    }

    #[test]
    fn test_rollback_restores_previous_rows() {
        let mut host = engine("host");
        let mutation = host.revoke_all(0).unwrap();
        assert!(!host.can_control("bob"));
        host.rollback(mutation);
        assert!(host.can_control("bob"));
        assert!(!host.can_control("alice"));
    }

    #[test]
    fn test_rollback_lets_store_correct_again() {
        let mut host = engine("host");
        let mutation = host.set_controls("m-alice", true, 1_000).unwrap();
        host.rollback(mutation);

        // The optimistic value never reached the store, so the row wins at once
        let granted = row("m-alice", "alice", true, 1);
        let outcome = host.on_store_change_fallback(&granted, 2_000);
        assert!(outcome.changed);
        assert!(host.can_control("alice"));
    }

    #[test]
    fn test_grant_all_skips_host_and_banned() {
        let mut host = engine("host");
        let ban = host.ban("m-alice", 0).unwrap();
        host.commit(ban, 0);
        let mutation = host.grant_all(1).unwrap();
        assert_eq!(mutation.member_ids(), vec!["m-bob".to_string()]);
        assert!(!host.can_control("alice"));
        assert_ban_invariant(&host);
    }

    #[test]
    fn test_revoke_all_includes_banned_members() {
        let mut host = engine("host");
        let ban = host.ban("m-alice", 0).unwrap();
        host.commit(ban, 0);
        let mutation = host.revoke_all(1).unwrap();
        let mut ids = mutation.member_ids();
        ids.sort();
        assert_eq!(ids, vec!["m-alice".to_string(), "m-bob".to_string()]);
        assert!(host.can_control("host"));
    }

    #[test]
    fn test_remote_ban_transitions_self() {
        let mut bob = engine("bob");
        let outcome = bob.on_remote_member_update(&update("bob", Some(true), Some(true)), 0);
        assert_eq!(outcome.standing, Some(Standing::Banned));
        assert_eq!(outcome.notification, Some(Notification::Banned));
        assert!(!bob.can_control("bob"));
        assert!(bob.authority().is_banned);
        assert_ban_invariant(&bob);

        let outcome = bob.on_remote_member_update(&update("bob", None, Some(false)), 1);
        assert_eq!(outcome.standing, Some(Standing::Normal));
        assert_eq!(outcome.notification, Some(Notification::Unbanned));
    }

    #[test]
    fn test_reordered_ban_and_unban_keep_latest() {
        let mut bob = engine("bob");
        let unban = MemberEnvelope::new("host", 2_000, "bob", None, Some(false));
        let ban = MemberEnvelope::new("host", 1_000, "bob", Some(false), Some(true));

        bob.on_remote_member_update(&unban, 10);
        let outcome = bob.on_remote_member_update(&ban, 20);
        assert_eq!(outcome.standing, None);
        assert_eq!(outcome.notification, None);
        assert_eq!(bob.standing(), Standing::Normal);
        assert!(!bob.member_by_user("bob").unwrap().is_banned);
        assert_ban_invariant(&bob);

        // Arriving in order, the same pair ends the same way
        let mut bob = engine("bob");
        bob.on_remote_member_update(&ban, 10);
        bob.on_remote_member_update(&unban, 20);
        assert_eq!(bob.standing(), Standing::Normal);
        assert!(!bob.can_control("bob"));
    }

    #[test]
    fn test_older_controls_update_is_dropped() {
        let mut alice = engine("alice");
        let grant = MemberEnvelope::new("host", 5_000, "alice", Some(true), None);
        let revoke = MemberEnvelope::new("host", 4_000, "alice", Some(false), None);
        alice.on_remote_member_update(&grant, 0);
        assert_eq!(alice.on_remote_member_update(&revoke, 1), MemberUpdateOutcome::default());
        assert!(alice.can_control("alice"));
    }

    #[test]
    fn test_member_update_is_idempotent() {
        let mut alice = engine("alice");
        let envelope = update("alice", Some(true), None);
        let first = alice.on_remote_member_update(&envelope, 0);
        let after_first = alice.members().to_vec();
        let second = alice.on_remote_member_update(&envelope, 1);

        assert_eq!(first.notification, Some(Notification::ControlsGranted));
        assert_eq!(second, MemberUpdateOutcome::default());
        assert_eq!(alice.members(), after_first.as_slice());
    }

    #[test]
    fn test_controls_notification_only_for_self() {
        let mut alice = engine("alice");
        let outcome = alice.on_remote_member_update(&update("bob", Some(false), None), 0);
        assert!(outcome.changed);
        assert_eq!(outcome.notification, None);
    }

    #[test]
    fn test_non_host_updates_ignored() {
        let mut alice = engine("alice");
        let forged = MemberEnvelope::new("bob", 0, "alice", Some(true), None);
        assert_eq!(alice.on_remote_member_update(&forged, 0), MemberUpdateOutcome::default());
        assert!(!alice.can_control("alice"));
    }

    #[test]
    fn test_fallback_does_not_override_recent_broadcast() {
        let mut alice = engine("alice");
        alice.on_remote_member_update(&update("bob", Some(false), None), 1_000);

        // Stale row from before the broadcast still says bob has controls
        let stale = row("m-bob", "bob", true, 2);
        alice.on_store_change_fallback(&stale, 5_000);
        assert!(!alice.can_control("bob"));

        // Outside the window the store wins again
        alice.on_store_change_fallback(&stale, 12_000);
        assert!(alice.can_control("bob"));
    }

    #[test]
    fn test_fallback_catches_dropped_ban_without_controls_toast() {
        let mut bob = engine("bob");
        let mut banned = row("m-bob", "bob", false, 2);
        banned.is_banned = true;
        let outcome = bob.on_store_change_fallback(&banned, 0);
        assert_eq!(outcome.standing, Some(Standing::Banned));
        assert_eq!(outcome.notification, Some(Notification::Banned));

        // Same row again: no second notification
        assert_eq!(bob.on_store_change_fallback(&banned, 1).notification, None);

        let mut alice = engine("alice");
        let granted = row("m-alice", "alice", true, 1);
        let outcome = alice.on_store_change_fallback(&granted, 0);
        assert!(outcome.changed);
        assert_eq!(outcome.notification, None);

        // The broadcast arriving after the row still tells the user once
        let outcome = alice.on_remote_member_update(&update("alice", Some(true), None), 1);
        assert!(!outcome.changed);
        assert_eq!(outcome.notification, Some(Notification::ControlsGranted));
        let outcome = alice.on_remote_member_update(&update("alice", Some(true), None), 2);
        assert_eq!(outcome.notification, None);
    }

    #[test]
    fn test_ban_poll_only_detects_bans() {
        let mut bob = engine("bob");
        assert_eq!(bob.on_ban_poll(false, 0), MemberUpdateOutcome::default());

        let outcome = bob.on_ban_poll(true, 0);
        assert_eq!(outcome.standing, Some(Standing::Banned));
        assert!(!bob.can_control("bob"));
        assert_ban_invariant(&bob);

        assert_eq!(bob.on_ban_poll(true, 1), MemberUpdateOutcome::default());
        // A poll never unbans
        assert_eq!(bob.on_ban_poll(false, 2), MemberUpdateOutcome::default());
        assert_eq!(bob.standing(), Standing::Banned);
    }

    #[test]
    fn test_insert_and_delete() {
        let mut alice = engine("alice");
        alice.on_member_inserted(row("m-carol", "carol", false, 3));
        assert_eq!(alice.members().len(), 4);
        assert_eq!(alice.members()[3].user_id, "carol");

        // Rejoin replaces the row for the same user
        alice.on_member_inserted(row("m-carol-2", "carol", false, 4));
        assert_eq!(alice.members().len(), 4);

        alice.on_member_deleted("m-carol-2");
        assert!(alice.member_by_user("carol").is_none());
    }

    #[test]
    fn test_sender_status() {
        let alice = engine("alice");
        assert_eq!(
            alice.sender_status("bob"),
            SenderStatus::Known {
                can_control: true,
                is_banned: false
            }
        );
        assert_eq!(alice.sender_status("mallory"), SenderStatus::Unknown);
    }
}
