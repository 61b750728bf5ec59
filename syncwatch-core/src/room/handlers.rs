//! Broadcast, change-feed and timer handlers
//!
//! Every handler carries the epoch of the join that spawned it and becomes a
//! no-op once the session has left or moved to another room.

use std::sync::Arc;

use futures::stream::{BoxStream, StreamExt};
use tracing::{debug, info, warn};

use super::session::SessionContext;
use super::types::SessionEvent;
use crate::membership::{MemberUpdateOutcome, Standing};
use crate::store::{StoreChange, WriteOutcome};
use crate::sync::{
    Channel, Envelope, MemberEnvelope, PlayerEnvelope, PresenceEnvelope, ReconcileMode, ReconcileOutcome,
    RemoteOutcome, RoomRow, SyncEffect,
};
use crate::timer::{Timer, TimerKind};

// ---- Effects ----

/// Carry out what the synchronizer asked for
pub(crate) fn run_effects(ctx: &Arc<SessionContext>, epoch: u64, room_id: &str, effects: Vec<SyncEffect>) {
    for effect in effects {
        match effect {
            SyncEffect::WriteRoom(patch) => {
                let ctx = ctx.clone();
                let room_id = room_id.to_string();
                ctx.runtime.clone().spawn(async move {
                    let stamp = patch.last_write_at;
                    match ctx.store.write_room(&room_id, patch).await {
                        Ok(WriteOutcome::Applied) => {}
                        Ok(WriteOutcome::Superseded) => debug!("Room write at {} superseded", stamp),
                        Err(e) => {
                            warn!("Room write failed: {}", e);
                            ctx.with_room(epoch, |room| room.sync.write_failed(stamp));
                        }
                    }
                });
            }

            SyncEffect::WriteRoomThenPublish(patch, envelope) => {
                let ctx = ctx.clone();
                let room_id = room_id.to_string();
                ctx.runtime.clone().spawn(async move {
                    let stamp = patch.last_write_at;
                    let failure = match ctx.store.write_room(&room_id, patch).await {
                        Ok(WriteOutcome::Applied) => {
                            if ctx.with_room(epoch, |_| ()).is_some() {
                                ctx.publish(&room_id, &Envelope::Player(envelope));
                            }
                            return;
                        }
                        Ok(WriteOutcome::Superseded) => "the room has a newer change".to_string(),
                        Err(e) => e.to_string(),
                    };
                    // Peers must never see a video the store does not hold
                    warn!("Video change write did not land, not broadcasting: {}", failure);
                    if ctx.with_room(epoch, |room| room.sync.write_failed(stamp)).is_some() {
                        ctx.emit(SessionEvent::Error(format!("Failed to change video: {}", failure)));
                        reconcile(ctx, epoch, ReconcileMode::Forced).await;
                    }
                });
            }

            SyncEffect::Publish(envelope) => ctx.publish(room_id, &Envelope::Player(envelope)),

            SyncEffect::ScheduleSeekFlush(delay) => {
                let c = ctx.clone();
                let timer = Timer::after(&ctx.runtime, delay, async move { flush_seek(&c, epoch) });
                ctx.schedule(TimerKind::SeekFlush, timer);
            }

            SyncEffect::ScheduleSeekWrite(delay) => {
                let c = ctx.clone();
                let timer = Timer::after(&ctx.runtime, delay, async move { flush_seek_write(&c, epoch) });
                ctx.schedule(TimerKind::SeekWrite, timer);
            }

            SyncEffect::CancelSeekTimers => {
                let mut timers = ctx.timers.lock();
                timers.cancel(TimerKind::SeekFlush);
                timers.cancel(TimerKind::SeekWrite);
            }
        }
    }
}

fn flush_seek(ctx: &Arc<SessionContext>, epoch: u64) {
    let now = ctx.now_ms();
    let flushed = ctx.with_room(epoch, |room| {
        let authority = room.members.authority();
        (room.room_id.clone(), room.sync.flush_seek(authority, now))
    });
    if let Some((room_id, effects)) = flushed {
        run_effects(ctx, epoch, &room_id, effects);
    }
}

fn flush_seek_write(ctx: &Arc<SessionContext>, epoch: u64) {
    let now = ctx.now_ms();
    let flushed = ctx.with_room(epoch, |room| {
        let authority = room.members.authority();
        (room.room_id.clone(), room.sync.flush_seek_write(authority, now))
    });
    if let Some((room_id, effects)) = flushed {
        run_effects(ctx, epoch, &room_id, effects);
    }
}

// ---- Broadcast ----

/// Feed one channel's payloads into the session until unsubscribed
pub(crate) async fn listen(
    ctx: Arc<SessionContext>,
    epoch: u64,
    channel: Channel,
    mut payloads: BoxStream<'static, Vec<u8>>,
) {
    while let Some(bytes) = payloads.next().await {
        on_payload(&ctx, epoch, channel, &bytes);
    }
    debug!("{} listener ended", channel.name());
}

fn on_payload(ctx: &Arc<SessionContext>, epoch: u64, channel: Channel, bytes: &[u8]) {
    let envelope = match Envelope::decode(channel, bytes) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!("Dropping malformed {} payload: {}", channel.name(), e);
            return;
        }
    };
    match envelope {
        Envelope::Player(envelope) => on_player_action(ctx, epoch, &envelope),
        Envelope::Member(envelope) => on_member_update(ctx, epoch, &envelope),
        Envelope::Presence(envelope) => on_presence(ctx, epoch, &envelope),
    }
}

fn on_player_action(ctx: &Arc<SessionContext>, epoch: u64, envelope: &PlayerEnvelope) {
    let now = ctx.now_ms();
    let outcome = ctx.with_room(epoch, |room| {
        let sender = room.members.sender_status(&envelope.origin_user_id);
        room.sync.apply_remote(envelope, sender, now)
    });
    match outcome {
        Some(RemoteOutcome::Applied) => ctx.emit_state(),
        Some(RemoteOutcome::Ignored(reason)) => {
            debug!("Ignored {} from {}: {:?}", envelope.action.name(), envelope.origin_user_id, reason)
        }
        None => {}
    }
}

fn on_member_update(ctx: &Arc<SessionContext>, epoch: u64, envelope: &MemberEnvelope) {
    let now = ctx.now_ms();
    if let Some(outcome) = ctx.with_room(epoch, |room| room.members.on_remote_member_update(envelope, now)) {
        apply_member_outcome(ctx, epoch, outcome);
    }
}

fn on_presence(ctx: &Arc<SessionContext>, epoch: u64, envelope: &PresenceEnvelope) {
    let now = ctx.now_ms();
    let observed = ctx.with_room(epoch, |room| {
        let update = room.presence.observe(envelope, now);
        (room.room_id.clone(), update, room.presence.heartbeat(now))
    });
    let Some((room_id, update, heartbeat)) = observed else {
        return;
    };
    if update.announce {
        ctx.publish(&room_id, &Envelope::Presence(heartbeat));
    }
    if update.changed {
        ctx.emit_state();
    }
}

/// Surface a membership change: standing transitions, notifications, state
fn apply_member_outcome(ctx: &Arc<SessionContext>, epoch: u64, outcome: MemberUpdateOutcome) {
    if let Some(standing) = outcome.standing {
        let now = ctx.now_ms();
        let banned = standing == Standing::Banned;
        ctx.with_room(epoch, |room| room.sync.set_banned(banned, now));
        if banned {
            info!("Banned from the room, playback unloaded");
            let mut timers = ctx.timers.lock();
            timers.cancel(TimerKind::SeekFlush);
            timers.cancel(TimerKind::SeekWrite);
        } else {
            info!("Unbanned, resyncing with the store");
            ctx.runtime
                .spawn(reconcile(ctx.clone(), epoch, ReconcileMode::Forced));
        }
    }
    if let Some(notification) = outcome.notification {
        ctx.emit(SessionEvent::Notification(notification));
    }
    if outcome.changed || outcome.standing.is_some() {
        ctx.emit_state();
    }
}

// ---- Store ----

/// Feed the store change feed into the session
pub(crate) async fn watch_store(ctx: Arc<SessionContext>, epoch: u64, mut changes: BoxStream<'static, StoreChange>) {
    while let Some(change) = changes.next().await {
        on_store_change(&ctx, epoch, change);
    }
    debug!("Change feed ended");
}

fn on_store_change(ctx: &Arc<SessionContext>, epoch: u64, change: StoreChange) {
    let now = ctx.now_ms();
    let outcome = match change {
        StoreChange::RoomUpdated(row) => {
            apply_room_row(ctx, epoch, &row, ReconcileMode::Periodic);
            return;
        }
        StoreChange::MemberInserted(row) => ctx.with_room(epoch, |room| room.members.on_member_inserted(row)),
        StoreChange::MemberUpdated(row) => {
            ctx.with_room(epoch, |room| room.members.on_store_change_fallback(&row, now))
        }
        StoreChange::MemberDeleted { member_id } => {
            ctx.with_room(epoch, |room| room.members.on_member_deleted(&member_id))
        }
    };
    if let Some(outcome) = outcome {
        apply_member_outcome(ctx, epoch, outcome);
    }
}

fn apply_room_row(ctx: &Arc<SessionContext>, epoch: u64, row: &RoomRow, mode: ReconcileMode) {
    let now = ctx.now_ms();
    match ctx.with_room(epoch, |room| room.sync.reconcile(row, now, mode)) {
        Some(ReconcileOutcome::Applied { changed: true }) => ctx.emit_state(),
        Some(outcome) => debug!("Reconcile {:?}: {:?}", mode, outcome),
        None => {}
    }
}

// ---- Timers ----

/// Read the room row and merge it
pub(crate) async fn reconcile(ctx: Arc<SessionContext>, epoch: u64, mode: ReconcileMode) {
    let Some(room_id) = ctx.with_room(epoch, |room| room.room_id.clone()) else {
        return;
    };
    match ctx.store.read_room(&room_id).await {
        Ok(Some(row)) => apply_room_row(&ctx, epoch, &row, mode),
        Ok(None) => warn!("Room {} no longer exists", room_id),
        Err(e) => warn!("Reconcile read failed: {}", e),
    }
}

/// Check our own ban status against the member row and the ban records
pub(crate) async fn ban_poll(ctx: Arc<SessionContext>, epoch: u64) {
    let Some((room_id, user_id)) = ctx.with_room(epoch, |room| (room.room_id.clone(), room.user_id.clone())) else {
        return;
    };
    let member = ctx.store.find_member(&room_id, &user_id).await;
    let record = ctx.store.is_banned(&room_id, &user_id).await;
    let banned = match (member, record) {
        (Ok(member), Ok(record)) => record || member.map(|m| m.is_banned).unwrap_or(false),
        (Err(e), _) | (_, Err(e)) => {
            debug!("Ban poll failed: {}", e);
            return;
        }
    };

    let now = ctx.now_ms();
    if let Some(outcome) = ctx.with_room(epoch, |room| room.members.on_ban_poll(banned, now)) {
        apply_member_outcome(&ctx, epoch, outcome);
    }
}

/// Publish our heartbeat and expire silent peers
pub(crate) async fn heartbeat(ctx: Arc<SessionContext>, epoch: u64) {
    let now = ctx.now_ms();
    let beat = ctx.with_room(epoch, |room| {
        (room.room_id.clone(), room.presence.heartbeat(now), room.presence.sweep(now))
    });
    let Some((room_id, heartbeat, expired)) = beat else {
        return;
    };
    ctx.publish(&room_id, &Envelope::Presence(heartbeat));
    if !expired.is_empty() {
        debug!("Presence expired for {:?}", expired);
        ctx.emit_state();
    }
}
