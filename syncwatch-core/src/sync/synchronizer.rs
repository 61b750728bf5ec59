//! Playback Synchronizer
//!
//! Merges three sources into one local timeline: local user actions,
//! `player-action` envelopes from peers, and snapshots of the stored room
//! row. It performs no I/O. Every entry point takes the current time and
//! returns the side effects (store writes, publishes, timer requests) for
//! the session to carry out.
//!
//! Conflicts are resolved last-write-wins per field (video, playing flag,
//! position) using the sender's or the row's timestamp.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::protocol::{PlayerAction, PlayerEnvelope};
use super::state::{PlaybackSnapshot, RoomPatch, RoomRow, VideoRef};
use crate::config::SyncConfig;
use crate::latency::{compensate, Compensation};

/// Reconciliation only moves the local position when it is off by more
/// than this many seconds
const DRIFT_THRESHOLD_SECS: f64 = 1.0;

#[derive(Debug, Error, PartialEq)]
pub enum SyncError {
    #[error("You don't have room controls")]
    Unauthorized,

    #[error("You are banned from this room")]
    Banned,

    #[error("Invalid seek position: {0}")]
    InvalidPosition(f64),

    #[error("Invalid video url")]
    InvalidVideo,
}

/// A playback action requested by the local user
#[derive(Debug, Clone, PartialEq)]
pub enum LocalAction {
    Play,
    Pause,
    Seek(f64),
    ChangeVideo(VideoRef),
}

/// What the caller's membership says about the local user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Authority {
    pub can_control: bool,
    pub is_banned: bool,
}

/// What the membership view says about the sender of an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderStatus {
    Known { can_control: bool, is_banned: bool },
    Unknown,
}

/// Side effects requested by the synchronizer
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEffect {
    /// Fire-and-forget store write
    WriteRoom(RoomPatch),
    /// Store write that must land before the envelope is published
    WriteRoomThenPublish(RoomPatch, PlayerEnvelope),
    Publish(PlayerEnvelope),
    /// Arm the trailing edge of the seek broadcast throttle
    ScheduleSeekFlush(Duration),
    /// Arm the trailing edge of the seek write debounce
    ScheduleSeekWrite(Duration),
    /// Drop both seek timers
    CancelSeekTimers,
}

/// Why a remote envelope was not applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    OwnEcho,
    SelfBanned,
    SenderBanned,
    SenderNotAuthorized,
    UnknownSenderVideoChange,
    AdvisoryLocked,
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    Applied,
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileMode {
    /// Timer or change-feed driven, subject to rate limit and suppression
    Periodic,
    /// Bypasses rate limit and suppression (join, unban)
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Merged; `changed` when the visible playback state moved
    Applied { changed: bool },
    RateLimited,
    Suppressed,
    Banned,
}

/// Timestamp of the write each field currently reflects
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct FieldStamps {
    video: u64,
    playing: u64,
    position: u64,
}

#[derive(Debug, Default)]
struct SeekState {
    /// Outbound throttle window end (local clock)
    window_until: Option<u64>,
    /// Latest seek waiting for the window to close
    pending: Option<f64>,
    /// A debounced store write is armed
    write_pending: bool,
}

/// Per-room playback state machine for one client
#[derive(Debug)]
pub struct PlaybackSynchronizer {
    self_user_id: String,
    config: SyncConfig,
    snapshot: PlaybackSnapshot,
    stamps: FieldStamps,
    /// Remote advisory events are dropped until this time
    lock_until: u64,
    last_play_pause_at: Option<u64>,
    last_reconcile_at: Option<u64>,
    seek: SeekState,
    banned: bool,
}

impl PlaybackSynchronizer {
    pub fn new(self_user_id: impl Into<String>, config: SyncConfig) -> Self {
        Self {
            self_user_id: self_user_id.into(),
            config,
            snapshot: PlaybackSnapshot::default(),
            stamps: FieldStamps::default(),
            lock_until: 0,
            last_play_pause_at: None,
            last_reconcile_at: None,
            seek: SeekState::default(),
            banned: false,
        }
    }

    pub fn snapshot(&self) -> &PlaybackSnapshot {
        &self.snapshot
    }

    pub fn current_position(&self, now_ms: u64) -> f64 {
        self.snapshot.current_position(now_ms)
    }

    pub fn is_banned(&self) -> bool {
        self.banned
    }

    fn envelope(&self, action: PlayerAction, now_ms: u64) -> PlayerEnvelope {
        PlayerEnvelope {
            origin_user_id: self.self_user_id.clone(),
            sent_at: now_ms,
            action,
        }
    }

    fn lock_for(&mut self, action: &PlayerAction, now_ms: u64) {
        let window = match action {
            PlayerAction::ChangeVideo { .. } => self.config.change_video_lock_ms,
            PlayerAction::Play { .. } | PlayerAction::Pause { .. } => self.config.play_pause_lock_ms,
            PlayerAction::Seek { .. } => return,
        };
        self.lock_until = self.lock_until.max(now_ms + window);
        self.snapshot.last_authoritative_action_at = now_ms;
        if action.is_play_pause() {
            self.last_play_pause_at = Some(now_ms);
        }
    }

    fn clear_seek(&mut self) {
        self.seek = SeekState::default();
    }

    // ---- Local actions ----

    /// Apply a local action optimistically and return the writes and
    /// publishes it needs. Rejected actions produce no effects.
    pub fn apply_local_action(
        &mut self,
        action: LocalAction,
        authority: Authority,
        now_ms: u64,
    ) -> Result<Vec<SyncEffect>, SyncError> {
        if self.banned || authority.is_banned {
            return Err(SyncError::Banned);
        }
        if !authority.can_control {
            return Err(SyncError::Unauthorized);
        }

        match action {
            LocalAction::Play | LocalAction::Pause => {
                let is_playing = matches!(action, LocalAction::Play);
                let position = self.snapshot.current_position(now_ms);
                self.snapshot.set_position(position, now_ms);
                self.snapshot.is_playing = is_playing;
                self.snapshot.last_local_action_at = now_ms;
                self.stamps.playing = now_ms;
                self.stamps.position = now_ms;
                self.clear_seek();

                let action = if is_playing {
                    PlayerAction::Play { position }
                } else {
                    PlayerAction::Pause {
                        position: Some(position),
                    }
                };
                self.lock_for(&action, now_ms);
                debug!("Local {} at {:.2}s", action.name(), position);

                Ok(vec![
                    SyncEffect::CancelSeekTimers,
                    SyncEffect::WriteRoom(RoomPatch::playback(is_playing, position, now_ms)),
                    SyncEffect::Publish(self.envelope(action, now_ms)),
                ])
            }
            LocalAction::Seek(position) => {
                if !position.is_finite() || position < 0.0 {
                    return Err(SyncError::InvalidPosition(position));
                }
                self.snapshot.set_position(position, now_ms);
                self.snapshot.last_local_action_at = now_ms;
                self.stamps.position = now_ms;

                let mut effects = Vec::new();
                let window_open = self.seek.window_until.map(|until| now_ms < until).unwrap_or(false);
                self.seek.pending = Some(position);
                if !window_open {
                    self.seek.window_until = Some(now_ms + self.config.seek_throttle_ms);
                    effects.push(SyncEffect::ScheduleSeekFlush(Duration::from_millis(
                        self.config.seek_throttle_ms,
                    )));
                }
                if !self.seek.write_pending {
                    self.seek.write_pending = true;
                    effects.push(SyncEffect::ScheduleSeekWrite(Duration::from_millis(
                        self.config.seek_write_debounce_ms,
                    )));
                }
                debug!("Local seek to {:.2}s (window open: {})", position, window_open);
                Ok(effects)
            }
            LocalAction::ChangeVideo(video) => {
                if video.url.trim().is_empty() {
                    return Err(SyncError::InvalidVideo);
                }
                self.snapshot.video = Some(video.clone());
                self.snapshot.is_playing = false;
                self.snapshot.set_position(0.0, now_ms);
                self.snapshot.last_local_action_at = now_ms;
                self.stamps = FieldStamps {
                    video: now_ms,
                    playing: now_ms,
                    position: now_ms,
                };
                self.clear_seek();

                let action = PlayerAction::change_video(&video);
                self.lock_for(&action, now_ms);
                info!("Local video change to {}", video.url);

                Ok(vec![
                    SyncEffect::CancelSeekTimers,
                    SyncEffect::WriteRoomThenPublish(
                        RoomPatch::change_video(&video, now_ms),
                        self.envelope(action, now_ms),
                    ),
                ])
            }
        }
    }

    /// Trailing edge of the seek throttle: publish the last buffered seek
    pub fn flush_seek(&mut self, authority: Authority, now_ms: u64) -> Vec<SyncEffect> {
        self.seek.window_until = None;
        let Some(target) = self.seek.pending.take() else {
            return Vec::new();
        };
        if self.banned || !authority.can_control || authority.is_banned {
            debug!("Dropping buffered seek to {:.2}s, controls lost", target);
            return Vec::new();
        }
        let position = self.snapshot.current_position(now_ms);
        vec![SyncEffect::Publish(self.envelope(PlayerAction::Seek { position }, now_ms))]
    }

    /// Trailing edge of the seek write debounce
    pub fn flush_seek_write(&mut self, authority: Authority, now_ms: u64) -> Vec<SyncEffect> {
        if !std::mem::take(&mut self.seek.write_pending) {
            return Vec::new();
        }
        if self.banned || !authority.can_control || authority.is_banned {
            return Vec::new();
        }
        let position = self.snapshot.current_position(now_ms);
        self.stamps.position = now_ms;
        vec![SyncEffect::WriteRoom(RoomPatch::position(position, now_ms))]
    }

    /// A fire-and-forget write stamped `stamp` failed. Fields still carrying
    /// that stamp forget it, so the next reconciliation adopts the store.
    pub fn write_failed(&mut self, stamp: u64) {
        warn!("Room write at {} failed, deferring to store", stamp);
        if self.stamps.video == stamp {
            self.stamps.video = 0;
        }
        if self.stamps.playing == stamp {
            self.stamps.playing = 0;
        }
        if self.stamps.position == stamp {
            self.stamps.position = 0;
        }
        self.last_reconcile_at = None;
    }

    // ---- Remote events ----

    /// Merge a `player-action` envelope from a peer
    pub fn apply_remote(&mut self, envelope: &PlayerEnvelope, sender: SenderStatus, now_ms: u64) -> RemoteOutcome {
        let action = &envelope.action;
        let reason = if envelope.origin_user_id == self.self_user_id {
            Some(IgnoreReason::OwnEcho)
        } else if self.banned {
            Some(IgnoreReason::SelfBanned)
        } else {
            match sender {
                SenderStatus::Known { is_banned: true, .. } => Some(IgnoreReason::SenderBanned),
                SenderStatus::Known {
                    can_control: false, ..
                } => Some(IgnoreReason::SenderNotAuthorized),
                SenderStatus::Unknown if matches!(action, PlayerAction::ChangeVideo { .. }) => {
                    Some(IgnoreReason::UnknownSenderVideoChange)
                }
                _ if !action.is_authoritative() && now_ms < self.lock_until => Some(IgnoreReason::AdvisoryLocked),
                _ => None,
            }
        };
        if let Some(reason) = reason {
            debug!(
                "Ignoring remote {} from {}: {:?}",
                action.name(),
                envelope.origin_user_id,
                reason
            );
            return RemoteOutcome::Ignored(reason);
        }

        let sent_at = envelope.sent_at;
        let applied = match action {
            PlayerAction::Play { position } => {
                let mut applied = false;
                if sent_at >= self.stamps.playing {
                    self.snapshot.is_playing = true;
                    self.stamps.playing = sent_at;
                    applied = true;
                }
                if sent_at >= self.stamps.position {
                    let position = compensate(*position, sent_at, now_ms, Compensation::Elapsed);
                    self.snapshot.set_position(position, now_ms);
                    self.stamps.position = sent_at;
                    applied = true;
                }
                applied
            }
            PlayerAction::Pause { position } => {
                let mut applied = false;
                if sent_at >= self.stamps.playing {
                    let frozen = self.snapshot.current_position(now_ms);
                    self.snapshot.is_playing = false;
                    self.snapshot.set_position(frozen, now_ms);
                    self.stamps.playing = sent_at;
                    applied = true;
                }
                if let Some(position) = position {
                    if sent_at >= self.stamps.position {
                        self.snapshot.set_position(*position, now_ms);
                        self.stamps.position = sent_at;
                        applied = true;
                    }
                }
                applied
            }
            PlayerAction::Seek { position } => {
                if sent_at >= self.stamps.position {
                    let rule = Compensation::for_seek(self.snapshot.is_playing);
                    let position = compensate(*position, sent_at, now_ms, rule);
                    self.snapshot.set_position(position, now_ms);
                    self.stamps.position = sent_at;
                    true
                } else {
                    false
                }
            }
            PlayerAction::ChangeVideo { video_url, video_kind } => {
                if sent_at >= self.stamps.video {
                    self.snapshot.video = Some(VideoRef::new(video_url.clone(), *video_kind));
                    self.stamps.video = sent_at;
                    if sent_at >= self.stamps.playing {
                        self.snapshot.is_playing = false;
                        self.stamps.playing = sent_at;
                    }
                    if sent_at >= self.stamps.position {
                        self.snapshot.set_position(0.0, now_ms);
                        self.stamps.position = sent_at;
                    }
                    true
                } else {
                    false
                }
            }
        };

        if !applied {
            debug!(
                "Remote {} from {} superseded by a newer write",
                action.name(),
                envelope.origin_user_id
            );
            return RemoteOutcome::Ignored(IgnoreReason::Superseded);
        }

        self.lock_for(action, now_ms);
        debug!(
            "Applied remote {} from {} (position {:.2}s, playing: {})",
            action.name(),
            envelope.origin_user_id,
            self.snapshot.position,
            self.snapshot.is_playing
        );
        RemoteOutcome::Applied
    }

    // ---- Store reconciliation ----

    /// Merge the stored room row into the local timeline
    pub fn reconcile(&mut self, row: &RoomRow, now_ms: u64, mode: ReconcileMode) -> ReconcileOutcome {
        if self.banned {
            return ReconcileOutcome::Banned;
        }
        if mode == ReconcileMode::Periodic {
            if let Some(last) = self.last_reconcile_at {
                if now_ms.saturating_sub(last) < self.config.reconcile_min_interval_ms {
                    return ReconcileOutcome::RateLimited;
                }
            }
            if let Some(last) = self.last_play_pause_at {
                if now_ms.saturating_sub(last) < self.config.reconcile_suppress_after_play_pause_ms {
                    debug!("Reconcile suppressed, play/pause {}ms ago", now_ms.saturating_sub(last));
                    return ReconcileOutcome::Suppressed;
                }
            }
        }
        self.last_reconcile_at = Some(now_ms);

        let written_at = row.last_write_at;
        // An old playing row may not start playback, but it never stops
        // playback that is already running: uninterrupted play leaves the
        // row untouched.
        let stale = row.is_playing && now_ms.saturating_sub(written_at) > self.config.staleness_threshold_ms;
        let effective_playing = if stale {
            if !self.snapshot.is_playing {
                info!(
                    "Room {} says playing but was last written {}s ago, treating as idle",
                    row.id,
                    now_ms.saturating_sub(written_at) / 1000
                );
            }
            self.snapshot.is_playing
        } else {
            row.is_playing
        };
        let mut changed = false;

        if written_at >= self.stamps.video {
            let video = row.video();
            if video != self.snapshot.video {
                debug!("Reconcile: video -> {:?}", video.as_ref().map(|v| v.url.as_str()));
                self.snapshot.video = video;
                changed = true;
            }
            self.stamps.video = written_at;
        }

        if written_at >= self.stamps.playing {
            if self.snapshot.is_playing != effective_playing {
                // Freeze or restart the local clock at the current position
                let position = self.snapshot.current_position(now_ms);
                self.snapshot.set_position(position, now_ms);
                self.snapshot.is_playing = effective_playing;
                changed = true;
            }
            self.stamps.playing = written_at;
        }

        if written_at >= self.stamps.position {
            let target = compensate(
                row.position,
                written_at,
                now_ms,
                Compensation::for_snapshot(effective_playing),
            );
            let drift = (self.snapshot.current_position(now_ms) - target).abs();
            if drift > DRIFT_THRESHOLD_SECS || changed {
                self.snapshot.set_position(target, now_ms);
                changed = changed || drift > DRIFT_THRESHOLD_SECS;
            }
            self.stamps.position = written_at;
        }

        if changed {
            info!(
                "Reconciled with store: {:.2}s, playing: {}",
                self.snapshot.position, self.snapshot.is_playing
            );
        }
        ReconcileOutcome::Applied { changed }
    }

    // ---- Membership transitions ----

    /// Enter or leave the banned state. Entering unloads the video and drops
    /// anything buffered; leaving forgets every stamp so the forced resync
    /// adopts the store.
    pub fn set_banned(&mut self, banned: bool, now_ms: u64) {
        if self.banned == banned {
            return;
        }
        self.banned = banned;
        self.clear_seek();
        if banned {
            self.snapshot.video = None;
            self.snapshot.is_playing = false;
            self.snapshot.set_position(0.0, now_ms);
        }
        self.stamps = FieldStamps::default();
        self.lock_until = 0;
        self.last_play_pause_at = None;
        self.last_reconcile_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::state::VideoKind;

    const T0: u64 = 1_700_000_000_000;
    const CONTROLLER: Authority = Authority {
        can_control: true,
        is_banned: false,
    };
    const HOST: SenderStatus = SenderStatus::Known {
        can_control: true,
        is_banned: false,
    };

    fn sync() -> PlaybackSynchronizer {
        PlaybackSynchronizer::new("me", SyncConfig::default())
    }

    fn remote(action: PlayerAction, sent_at: u64) -> PlayerEnvelope {
        PlayerEnvelope {
            origin_user_id: "host".into(),
            sent_at,
            action,
        }
    }

    fn row(position: f64, is_playing: bool, last_write_at: u64) -> RoomRow {
        let mut row = RoomRow::new("room", "Room", "host", last_write_at);
        row.video_url = Some("https://youtu.be/a".into());
        row.video_kind = Some(VideoKind::Youtube);
        row.position = position;
        row.is_playing = is_playing;
        row
    }

    #[test]
    fn test_remote_play_is_latency_compensated() {
        let mut s = sync();
        let outcome = s.apply_remote(&remote(PlayerAction::Play { position: 30.0 }, T0), HOST, T0 + 2_000);
        assert_eq!(outcome, RemoteOutcome::Applied);
        assert!((s.current_position(T0 + 2_000) - 32.0).abs() < 1e-6);
        assert!(s.snapshot().is_playing);
    }

    #[test]
    fn test_remote_pause_is_exact() {
        let mut s = sync();
        s.apply_remote(
            &remote(PlayerAction::Pause { position: Some(30.0) }, T0),
            HOST,
            T0 + 2_000,
        );
        assert_eq!(s.current_position(T0 + 2_000), 30.0);
        assert!(!s.snapshot().is_playing);
    }

    #[test]
    fn test_remote_seek_compensated_only_while_playing() {
        let mut s = sync();
        s.apply_remote(&remote(PlayerAction::Seek { position: 10.0 }, T0), HOST, T0 + 1_000);
        assert_eq!(s.current_position(T0 + 1_000), 10.0);

        let mut s = sync();
        s.apply_remote(&remote(PlayerAction::Play { position: 0.0 }, T0), HOST, T0);
        // Past the play/pause lock
        let at = T0 + 2_000;
        s.apply_remote(&remote(PlayerAction::Seek { position: 10.0 }, at - 500), HOST, at);
        assert!((s.current_position(at) - 10.5).abs() < 1e-6);
    }

    #[test]
    fn test_own_echo_ignored() {
        let mut s = sync();
        let mut envelope = remote(PlayerAction::Play { position: 1.0 }, T0);
        envelope.origin_user_id = "me".into();
        assert_eq!(s.apply_remote(&envelope, HOST, T0), RemoteOutcome::Ignored(IgnoreReason::OwnEcho));
    }

    #[test]
    fn test_unauthorized_senders_ignored() {
        let mut s = sync();
        let play = remote(PlayerAction::Play { position: 1.0 }, T0);
        let viewer = SenderStatus::Known {
            can_control: false,
            is_banned: false,
        };
        let banned = SenderStatus::Known {
            can_control: false,
            is_banned: true,
        };
        assert_eq!(
            s.apply_remote(&play, viewer, T0),
            RemoteOutcome::Ignored(IgnoreReason::SenderNotAuthorized)
        );
        assert_eq!(
            s.apply_remote(&play, banned, T0),
            RemoteOutcome::Ignored(IgnoreReason::SenderBanned)
        );
        assert!(!s.snapshot().is_playing);
    }

    #[test]
    fn test_unknown_sender_cannot_change_video() {
        let mut s = sync();
        let change = remote(
            PlayerAction::ChangeVideo {
                video_url: "https://evil/x".into(),
                video_kind: VideoKind::Direct,
            },
            T0,
        );
        assert_eq!(
            s.apply_remote(&change, SenderStatus::Unknown, T0),
            RemoteOutcome::Ignored(IgnoreReason::UnknownSenderVideoChange)
        );
        // Unknown senders can still play/pause (joined before our member list loaded)
        let play = remote(PlayerAction::Play { position: 0.0 }, T0);
        assert_eq!(s.apply_remote(&play, SenderStatus::Unknown, T0), RemoteOutcome::Applied);
    }

    #[test]
    fn test_seek_suppressed_during_authoritative_lock() {
        let mut s = sync();
        s.apply_remote(&remote(PlayerAction::Pause { position: Some(5.0) }, T0), HOST, T0);
        let seek = remote(PlayerAction::Seek { position: 90.0 }, T0 + 100);
        assert_eq!(
            s.apply_remote(&seek, HOST, T0 + 100),
            RemoteOutcome::Ignored(IgnoreReason::AdvisoryLocked)
        );
        // Authoritative events still pre-empt during the lock
        let play = remote(PlayerAction::Play { position: 5.0 }, T0 + 200);
        assert_eq!(s.apply_remote(&play, HOST, T0 + 200), RemoteOutcome::Applied);
        // Lock expires
        let seek = remote(PlayerAction::Seek { position: 90.0 }, T0 + 1_100);
        assert_eq!(s.apply_remote(&seek, HOST, T0 + 1_100), RemoteOutcome::Applied);
    }

    #[test]
    fn test_out_of_order_events_resolved_by_timestamp() {
        let mut s = sync();
        s.apply_remote(&remote(PlayerAction::Pause { position: Some(20.0) }, T0 + 500), HOST, T0 + 600);
        let late_play = remote(PlayerAction::Play { position: 10.0 }, T0);
        assert_eq!(
            s.apply_remote(&late_play, HOST, T0 + 700),
            RemoteOutcome::Ignored(IgnoreReason::Superseded)
        );
        assert!(!s.snapshot().is_playing);
        assert_eq!(s.current_position(T0 + 700), 20.0);
    }

    #[test]
    fn test_local_action_requires_controls() {
        let mut s = sync();
        let viewer = Authority {
            can_control: false,
            is_banned: false,
        };
        assert_eq!(s.apply_local_action(LocalAction::Play, viewer, T0), Err(SyncError::Unauthorized));
        assert!(!s.snapshot().is_playing);
    }

    #[test]
    fn test_banned_rejects_local_actions() {
        let mut s = sync();
        s.set_banned(true, T0);
        assert_eq!(
            s.apply_local_action(LocalAction::Seek(3.0), CONTROLLER, T0),
            Err(SyncError::Banned)
        );
    }

    #[test]
    fn test_change_video_writes_before_publish() {
        let mut s = sync();
        let video = VideoRef::new("https://youtu.be/b", VideoKind::Youtube);
        let effects = s
            .apply_local_action(LocalAction::ChangeVideo(video.clone()), CONTROLLER, T0)
            .unwrap();
        match effects.last() {
            Some(SyncEffect::WriteRoomThenPublish(patch, envelope)) => {
                assert_eq!(patch, &RoomPatch::change_video(&video, T0));
                assert_eq!(envelope.action, PlayerAction::change_video(&video));
            }
            other => panic!("unexpected effect: {:?}", other),
        }
        assert_eq!(s.snapshot().video, Some(video));
        assert!(!s.snapshot().is_playing);
    }

    #[test]
    fn test_play_writes_immediately() {
        let mut s = sync();
        let effects = s.apply_local_action(LocalAction::Play, CONTROLLER, T0).unwrap();
        assert!(effects.contains(&SyncEffect::WriteRoom(RoomPatch::playback(true, 0.0, T0))));
        assert!(effects.iter().any(|e| matches!(e, SyncEffect::Publish(_))));
    }

    #[test]
    fn test_seek_flood_publishes_last_value_once() {
        let mut s = sync();
        let mut flush_requests = 0;
        let mut write_requests = 0;
        for i in 0..10u64 {
            let effects = s
                .apply_local_action(LocalAction::Seek(i as f64 * 10.0), CONTROLLER, T0 + i * 10)
                .unwrap();
            for effect in effects {
                match effect {
                    SyncEffect::ScheduleSeekFlush(d) => {
                        flush_requests += 1;
                        assert_eq!(d, Duration::from_millis(150));
                    }
                    SyncEffect::ScheduleSeekWrite(_) => write_requests += 1,
                    other => panic!("seek produced {:?}", other),
                }
            }
        }
        assert_eq!(flush_requests, 1);
        assert_eq!(write_requests, 1);

        let effects = s.flush_seek(CONTROLLER, T0 + 150);
        assert_eq!(effects.len(), 1);
        match &effects[0] {
            SyncEffect::Publish(envelope) => assert_eq!(envelope.action, PlayerAction::Seek { position: 90.0 }),
            other => panic!("unexpected effect: {:?}", other),
        }
        assert!(s.flush_seek(CONTROLLER, T0 + 300).is_empty());

        let writes = s.flush_seek_write(CONTROLLER, T0 + 1_000);
        assert_eq!(writes, vec![SyncEffect::WriteRoom(RoomPatch::position(90.0, T0 + 1_000))]);
    }

    #[test]
    fn test_play_cancels_buffered_seek() {
        let mut s = sync();
        s.apply_local_action(LocalAction::Seek(40.0), CONTROLLER, T0).unwrap();
        let effects = s.apply_local_action(LocalAction::Play, CONTROLLER, T0 + 50).unwrap();
        assert_eq!(effects[0], SyncEffect::CancelSeekTimers);
        assert!(s.flush_seek(CONTROLLER, T0 + 150).is_empty());
        assert!(s.flush_seek_write(CONTROLLER, T0 + 1_000).is_empty());
    }

    #[test]
    fn test_reconcile_adopts_store() {
        let mut s = sync();
        let outcome = s.reconcile(&row(30.0, true, T0), T0 + 2_000, ReconcileMode::Forced);
        assert_eq!(outcome, ReconcileOutcome::Applied { changed: true });
        assert!(s.snapshot().is_playing);
        assert!((s.current_position(T0 + 2_000) - 32.0).abs() < 1e-6);
        assert_eq!(s.snapshot().video.as_ref().map(|v| v.url.as_str()), Some("https://youtu.be/a"));
    }

    #[test]
    fn test_stale_playing_row_does_not_autoplay() {
        let mut s = sync();
        let now = T0 + 10 * 60 * 1_000;
        s.reconcile(&row(30.0, true, T0), now, ReconcileMode::Forced);
        assert!(!s.snapshot().is_playing);
        assert_eq!(s.current_position(now), 30.0);
    }

    #[test]
    fn test_stale_row_keeps_running_playback() {
        let mut s = sync();
        s.apply_remote(&remote(PlayerAction::Play { position: 0.0 }, T0), HOST, T0);
        let now = T0 + 6 * 60 * 1_000;
        let outcome = s.reconcile(&row(0.0, true, T0), now, ReconcileMode::Periodic);
        assert_eq!(outcome, ReconcileOutcome::Applied { changed: false });
        assert!(s.snapshot().is_playing);
        assert!((s.current_position(now) - 360.0).abs() < 1e-6);
    }

    #[test]
    fn test_old_paused_row_is_trusted() {
        let mut s = sync();
        s.apply_remote(&remote(PlayerAction::Play { position: 0.0 }, 1), HOST, 1);
        let now = T0 + 10 * 60 * 1_000;
        s.reconcile(&row(30.0, false, T0), now, ReconcileMode::Forced);
        assert!(!s.snapshot().is_playing);
        assert_eq!(s.current_position(now), 30.0);
    }

    #[test]
    fn test_periodic_reconcile_rate_limited_and_suppressed() {
        let mut s = sync();
        assert!(matches!(
            s.reconcile(&row(0.0, false, T0), T0, ReconcileMode::Periodic),
            ReconcileOutcome::Applied { .. }
        ));
        assert_eq!(
            s.reconcile(&row(0.0, false, T0), T0 + 1_000, ReconcileMode::Periodic),
            ReconcileOutcome::RateLimited
        );

        s.apply_remote(&remote(PlayerAction::Play { position: 0.0 }, T0 + 3_000), HOST, T0 + 3_000);
        assert_eq!(
            s.reconcile(&row(0.0, false, T0), T0 + 4_000, ReconcileMode::Periodic),
            ReconcileOutcome::Suppressed
        );
        assert!(matches!(
            s.reconcile(&row(0.0, false, T0), T0 + 4_000, ReconcileMode::Forced),
            ReconcileOutcome::Applied { .. }
        ));
    }

    #[test]
    fn test_reconcile_does_not_clobber_newer_local_action() {
        let mut s = sync();
        s.apply_local_action(LocalAction::Pause, CONTROLLER, T0 + 1_000).unwrap();
        s.reconcile(&row(50.0, true, T0), T0 + 9_000, ReconcileMode::Forced);
        assert!(!s.snapshot().is_playing);
    }

    #[test]
    fn test_write_failure_lets_store_win() {
        let mut s = sync();
        s.apply_local_action(LocalAction::Play, CONTROLLER, T0 + 1_000).unwrap();
        s.write_failed(T0 + 1_000);
        s.reconcile(&row(0.0, false, T0), T0 + 9_000, ReconcileMode::Forced);
        assert!(!s.snapshot().is_playing);
    }

    #[test]
    fn test_reconcile_after_ban_is_noop() {
        let mut s = sync();
        s.set_banned(true, T0);
        assert_eq!(
            s.reconcile(&row(0.0, true, T0), T0, ReconcileMode::Forced),
            ReconcileOutcome::Banned
        );
        s.set_banned(false, T0 + 1);
        assert!(matches!(
            s.reconcile(&row(0.0, true, T0), T0 + 2, ReconcileMode::Forced),
            ReconcileOutcome::Applied { changed: true }
        ));
    }
}
