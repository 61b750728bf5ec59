//! Room session orchestration
//!
//! `RoomSession` owns the room lifecycle. It loads a room from the store,
//! wires the broadcast channels and the change feed into the playback
//! synchronizer and the membership engine, and carries out the effects they
//! return. Every join gets a fresh epoch and background work tagged with an
//! older epoch is ignored, so nothing from a previous room leaks into the
//! next one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::handlers;
use super::types::*;
use crate::clock::SharedClock;
use crate::config::SyncConfig;
use crate::membership::{MemberMutation, MemberOp, MembershipEngine, MembershipError, Standing};
use crate::presence::PresenceTracker;
use crate::room_code::{random_row_id, RoomCode};
use crate::store::{AuthoritativeStore, StoreError};
use crate::sync::{
    Channel, Envelope, LocalAction, MemberRow, PlaybackSynchronizer, ReconcileMode, RoomRow, VideoRef,
};
use crate::timer::{Timer, TimerKind, TimerSet};
use crate::transport::BroadcastTransport;

/// A joined room and the state machines driving it
pub(crate) struct ActiveRoom {
    pub epoch: u64,
    pub room_id: String,
    pub room_name: String,
    pub user_id: String,
    pub sync: PlaybackSynchronizer,
    pub members: MembershipEngine,
    pub presence: PresenceTracker,
}

impl ActiveRoom {
    fn view(&self, now_ms: u64) -> SessionState {
        let snapshot = self.sync.snapshot();
        let host_id = self.members.host_id();
        SessionState {
            room_id: self.room_id.clone(),
            room_name: self.room_name.clone(),
            host_id: host_id.to_string(),
            video: snapshot.video.clone(),
            position: self.sync.current_position(now_ms),
            is_playing: snapshot.is_playing,
            is_banned: self.members.standing() == Standing::Banned,
            is_host: self.members.is_host(),
            can_control: self.members.authority().can_control,
            members: self
                .members
                .members()
                .iter()
                .map(|m| MemberState {
                    member_id: m.id.clone(),
                    user_id: m.user_id.clone(),
                    has_controls: m.has_controls,
                    is_banned: m.is_banned,
                    is_online: self.presence.is_online(&m.user_id),
                    is_host: m.user_id == host_id,
                })
                .collect(),
        }
    }
}

/// Represents the room we're in (or not)
#[derive(Default)]
pub(crate) enum Room {
    /// Not in any room
    #[default]
    None,
    /// Loading the room from the store
    Joining { room_id: String, epoch: u64 },
    Active(ActiveRoom),
}

impl Room {
    pub fn is_active(&self) -> bool {
        matches!(self, Room::Active(_))
    }

    /// Joining or active
    pub fn is_busy(&self) -> bool {
        !matches!(self, Room::None)
    }

    pub fn active_mut(&mut self) -> Option<&mut ActiveRoom> {
        match self {
            Room::Active(room) => Some(room),
            _ => None,
        }
    }
}

/// State shared between the session and its background tasks
pub(crate) struct SessionContext {
    pub identity: Arc<dyn Identity>,
    pub store: Arc<dyn AuthoritativeStore>,
    pub transport: Arc<dyn BroadcastTransport>,
    pub clock: SharedClock,
    pub config: SyncConfig,
    pub room: Mutex<Room>,
    pub timers: Mutex<TimerSet>,
    pub runtime: Handle,
    next_epoch: AtomicU64,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionContext {
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub fn state(&self) -> Option<SessionState> {
        let now = self.now_ms();
        match &*self.room.lock() {
            Room::Active(room) => Some(room.view(now)),
            _ => None,
        }
    }

    pub fn emit_state(&self) {
        if let Some(state) = self.state() {
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    /// Run `f` against the active room, if it is still the one from `epoch`
    pub fn with_room<R>(&self, epoch: u64, f: impl FnOnce(&mut ActiveRoom) -> R) -> Option<R> {
        let mut room = self.room.lock();
        match room.active_mut() {
            Some(active) if active.epoch == epoch => Some(f(active)),
            _ => None,
        }
    }

    /// Encode and broadcast; failures are logged and dropped
    pub fn publish(&self, room_id: &str, envelope: &Envelope) {
        let payload = match envelope.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode {} envelope: {}", envelope.channel().name(), e);
                return;
            }
        };
        if let Err(e) = self.transport.publish(room_id, envelope.channel(), payload) {
            warn!("Failed to publish on {}: {}", envelope.channel().name(), e);
        }
    }

    pub fn schedule(&self, kind: TimerKind, timer: Timer) {
        self.timers.lock().insert(kind, timer);
    }
}

/// One client's participation in at most one room at a time
pub struct RoomSession {
    ctx: Arc<SessionContext>,
}

impl RoomSession {
    /// Build a session. Background work is spawned on `runtime`.
    pub fn new(deps: SessionDeps, runtime: Handle) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let ctx = SessionContext {
            identity: deps.identity,
            store: deps.store,
            transport: deps.transport,
            clock: deps.clock,
            config: deps.config,
            room: Mutex::new(Room::None),
            timers: Mutex::new(TimerSet::new()),
            runtime,
            next_epoch: AtomicU64::new(0),
            events,
        };
        (Self { ctx: Arc::new(ctx) }, events_rx)
    }

    /// Create a public room hosted by the current user and join it
    #[instrument(skip(self))]
    pub async fn create_room(&self, name: &str) -> Result<String, SessionError> {
        if self.ctx.room.lock().is_busy() {
            return Err(SessionError::AlreadyInRoom);
        }
        let user_id = self.ctx.identity.current_user_id();
        let now = self.ctx.now_ms();
        let room_id = RoomCode::random().into_string();

        let room = RoomRow::new(&room_id, name, &user_id, now);
        let host = MemberRow {
            id: random_row_id(),
            room_id: room_id.clone(),
            user_id,
            has_controls: true,
            is_banned: false,
            joined_at: now,
        };
        tokio::time::timeout(self.ctx.config.join_timeout(), self.ctx.store.create_room(room, host))
            .await
            .map_err(|_| SessionError::JoinTimeout)??;
        info!("Created room {}", room_id);

        self.join_room(&room_id).await?;
        Ok(room_id)
    }

    /// Join an existing room. Fails if the room is missing, private, or the
    /// current user is banned from it.
    #[instrument(skip(self))]
    pub async fn join_room(&self, room_id: &str) -> Result<(), SessionError> {
        let room_id = normalize_room_id(room_id);
        let user_id = self.ctx.identity.current_user_id();
        let epoch = self.begin_join(&room_id)?;

        let now = self.ctx.now_ms();
        let loaded = tokio::time::timeout(
            self.ctx.config.join_timeout(),
            load_room(self.ctx.store.as_ref(), &room_id, &user_id, now),
        )
        .await;

        let (row, members) = match loaded {
            Ok(Ok(loaded)) => loaded,
            Ok(Err(e)) => {
                self.abort_join(epoch);
                info!("Join of {} rejected: {}", room_id, e);
                return Err(e);
            }
            Err(_) => {
                self.abort_join(epoch);
                warn!("Join of {} timed out", room_id);
                return Err(SessionError::JoinTimeout);
            }
        };

        self.activate(epoch, user_id, row, members)
    }

    fn begin_join(&self, room_id: &str) -> Result<u64, SessionError> {
        let mut room = self.ctx.room.lock();
        if room.is_busy() {
            return Err(SessionError::AlreadyInRoom);
        }
        let epoch = self.ctx.next_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        *room = Room::Joining {
            room_id: room_id.to_string(),
            epoch,
        };
        Ok(epoch)
    }

    fn abort_join(&self, epoch: u64) {
        let mut room = self.ctx.room.lock();
        if matches!(&*room, Room::Joining { epoch: e, .. } if *e == epoch) {
            *room = Room::None;
        }
    }

    fn activate(&self, epoch: u64, user_id: String, row: RoomRow, members: Vec<MemberRow>) -> Result<(), SessionError> {
        let ctx = &self.ctx;
        let now = ctx.now_ms();

        let mut sync = PlaybackSynchronizer::new(&user_id, ctx.config.clone());
        sync.reconcile(&row, now, ReconcileMode::Forced);
        let mut membership =
            MembershipEngine::new(&row.id, &user_id, &row.host_id, ctx.config.fallback_recency_window_ms);
        membership.load(members);
        let presence = PresenceTracker::new(&user_id, ctx.config.presence_timeout_ms);
        let heartbeat = presence.heartbeat(now);

        {
            let mut room = ctx.room.lock();
            if !matches!(&*room, Room::Joining { epoch: e, .. } if *e == epoch) {
                info!("Join of {} abandoned before it finished", row.id);
                return Err(SessionError::Cancelled);
            }
            *room = Room::Active(ActiveRoom {
                epoch,
                room_id: row.id.clone(),
                room_name: row.name.clone(),
                user_id,
                sync,
                members: membership,
                presence,
            });
        }

        self.start_background(epoch, &row.id);
        ctx.publish(&row.id, &Envelope::Presence(heartbeat));

        info!("Joined room {}", row.id);
        ctx.emit(SessionEvent::Joined { room_id: row.id.clone() });
        ctx.emit_state();
        Ok(())
    }

    /// Channel listeners, the change feed, and the periodic timers
    fn start_background(&self, epoch: u64, room_id: &str) {
        let ctx = &self.ctx;
        let mut started = Vec::new();

        for channel in Channel::ALL {
            match ctx.transport.subscribe(room_id, channel) {
                Ok(stream) => {
                    let listener = handlers::listen(ctx.clone(), epoch, channel, stream);
                    started.push((listener_kind(channel), Timer::task(&ctx.runtime, listener)));
                }
                Err(e) => warn!("Failed to subscribe to {}: {}", channel.name(), e),
            }
        }

        let changes = ctx.store.watch_changes(room_id);
        started.push((
            TimerKind::ChangeFeed,
            Timer::task(&ctx.runtime, handlers::watch_store(ctx.clone(), epoch, changes)),
        ));

        let c = ctx.clone();
        started.push((
            TimerKind::Reconcile,
            Timer::every(&ctx.runtime, ctx.config.reconcile_interval(), move || {
                handlers::reconcile(c.clone(), epoch, ReconcileMode::Periodic)
            }),
        ));

        let c = ctx.clone();
        started.push((
            TimerKind::BanPoll,
            Timer::every(&ctx.runtime, ctx.config.ban_poll_interval(), move || {
                handlers::ban_poll(c.clone(), epoch)
            }),
        ));

        let c = ctx.clone();
        started.push((
            TimerKind::PresenceHeartbeat,
            Timer::every(&ctx.runtime, ctx.config.presence_heartbeat(), move || {
                handlers::heartbeat(c.clone(), epoch)
            }),
        ));

        let mut timers = ctx.timers.lock();
        for (kind, timer) in started {
            timers.insert(kind, timer);
        }
        debug!("Started {} background tasks for {}", timers.len(), room_id);
    }

    /// Leave the current room. Announces the departure, unsubscribes every
    /// channel and cancels every timer. A join still in flight is abandoned.
    pub fn leave_room(&self) -> Result<(), SessionError> {
        let previous = std::mem::take(&mut *self.ctx.room.lock());
        self.ctx.timers.lock().cancel_all();

        match previous {
            Room::None => Err(SessionError::NotInRoom),
            Room::Joining { room_id, .. } => {
                info!("Abandoned join of {}", room_id);
                self.ctx.emit(SessionEvent::Left);
                Ok(())
            }
            Room::Active(room) => {
                let departure = room.presence.departure(self.ctx.now_ms());
                self.ctx.publish(&room.room_id, &Envelope::Presence(departure));
                for channel in Channel::ALL {
                    self.ctx.transport.unsubscribe(&room.room_id, channel);
                }
                info!("Left room {}", room.room_id);
                self.ctx.emit(SessionEvent::Left);
                Ok(())
            }
        }
    }

    // ---- Playback ----

    /// Apply a local playback action and carry out its effects
    pub fn on_local_action(&self, action: LocalAction) -> Result<(), SessionError> {
        let now = self.ctx.now_ms();
        let (epoch, room_id, effects) = {
            let mut room = self.ctx.room.lock();
            let active = room.active_mut().ok_or(SessionError::NotInRoom)?;
            let authority = active.members.authority();
            let effects = active.sync.apply_local_action(action, authority, now)?;
            (active.epoch, active.room_id.clone(), effects)
        };
        handlers::run_effects(&self.ctx, epoch, &room_id, effects);
        self.ctx.emit_state();
        Ok(())
    }

    pub fn play(&self) -> Result<(), SessionError> {
        self.on_local_action(LocalAction::Play)
    }

    pub fn pause(&self) -> Result<(), SessionError> {
        self.on_local_action(LocalAction::Pause)
    }

    pub fn seek(&self, position: f64) -> Result<(), SessionError> {
        self.on_local_action(LocalAction::Seek(position))
    }

    pub fn change_video(&self, video: VideoRef) -> Result<(), SessionError> {
        self.on_local_action(LocalAction::ChangeVideo(video))
    }

    // ---- Host operations ----

    pub async fn set_controls(&self, member_id: &str, has_controls: bool) -> Result<(), SessionError> {
        self.mutate_members(|engine, now| engine.set_controls(member_id, has_controls, now))
            .await
    }

    pub async fn ban(&self, member_id: &str) -> Result<(), SessionError> {
        self.mutate_members(|engine, now| engine.ban(member_id, now)).await
    }

    pub async fn unban(&self, member_id: &str) -> Result<(), SessionError> {
        self.mutate_members(|engine, now| engine.unban(member_id, now)).await
    }

    pub async fn grant_all_controls(&self) -> Result<(), SessionError> {
        self.mutate_members(|engine, now| engine.grant_all(now)).await
    }

    pub async fn revoke_all_controls(&self) -> Result<(), SessionError> {
        self.mutate_members(|engine, now| engine.revoke_all(now)).await
    }

    /// Optimistic update, store write, then broadcast or rollback
    async fn mutate_members<F>(&self, op: F) -> Result<(), SessionError>
    where
        F: FnOnce(&mut MembershipEngine, u64) -> Result<MemberMutation, MembershipError>,
    {
        let ctx = &self.ctx;
        let now = ctx.now_ms();
        let (epoch, room_id, mutation, targets) = {
            let mut room = ctx.room.lock();
            let active = room.active_mut().ok_or(SessionError::NotInRoom)?;
            let mutation = op(&mut active.members, now)?;
            let ids = mutation.member_ids();
            let targets: Vec<String> = active
                .members
                .members()
                .iter()
                .filter(|m| ids.contains(&m.id))
                .map(|m| m.user_id.clone())
                .collect();
            (active.epoch, active.room_id.clone(), mutation, targets)
        };
        if mutation.is_empty() {
            return Ok(());
        }
        ctx.emit_state();

        let op = mutation.op;
        if let Err(e) = write_members(ctx.store.as_ref(), &room_id, &mutation, &targets).await {
            warn!("Member update {:?} failed, rolling back: {}", op, e);
            if ctx.with_room(epoch, |room| room.members.rollback(mutation)).is_some() {
                ctx.emit_state();
            }
            return Err(e.into());
        }

        let envelopes = ctx
            .with_room(epoch, |room| room.members.commit(mutation, ctx.now_ms()))
            .unwrap_or_default();
        for envelope in envelopes {
            ctx.publish(&room_id, &Envelope::Member(envelope));
        }
        debug!("Member update {:?} committed for {} members", op, targets.len());
        Ok(())
    }

    // ---- Queries ----

    pub fn state(&self) -> Option<SessionState> {
        self.ctx.state()
    }

    pub fn can_control(&self) -> bool {
        self.ctx
            .room
            .lock()
            .active_mut()
            .map(|room| room.members.authority().can_control)
            .unwrap_or(false)
    }

    pub fn is_in_room(&self) -> bool {
        self.ctx.room.lock().is_active()
    }

    #[cfg(test)]
    pub(crate) fn timer_count(&self) -> usize {
        self.ctx.timers.lock().len()
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        if self.ctx.room.lock().is_busy() {
            let _ = self.leave_room();
        }
    }
}

/// Store side of a member mutation. Ban records change before the member
/// rows and are put back if the row write fails.
async fn write_members(
    store: &dyn AuthoritativeStore,
    room_id: &str,
    mutation: &MemberMutation,
    user_ids: &[String],
) -> Result<(), StoreError> {
    let banned = match mutation.op {
        MemberOp::Ban => Some(true),
        MemberOp::Unban => Some(false),
        _ => None,
    };
    if let Some(banned) = banned {
        set_ban_records(store, room_id, user_ids, banned).await?;
    }
    if let Err(e) = store
        .update_members(room_id, mutation.member_ids(), mutation.patch)
        .await
    {
        if let Some(banned) = banned {
            if let Err(undo) = set_ban_records(store, room_id, user_ids, !banned).await {
                warn!("Failed to restore ban records after rollback: {}", undo);
            }
        }
        return Err(e);
    }
    Ok(())
}

async fn set_ban_records(
    store: &dyn AuthoritativeStore,
    room_id: &str,
    user_ids: &[String],
    banned: bool,
) -> Result<(), StoreError> {
    for user_id in user_ids {
        if banned {
            store.record_ban(room_id, user_id).await?;
        } else {
            store.clear_ban(room_id, user_id).await?;
        }
    }
    Ok(())
}

fn listener_kind(channel: Channel) -> TimerKind {
    match channel {
        Channel::PlayerAction => TimerKind::PlayerChannel,
        Channel::MemberUpdate => TimerKind::MemberChannel,
        Channel::Presence => TimerKind::PresenceChannel,
    }
}

/// Room codes are accepted in any case, with or without the dash; other ids
/// pass through trimmed
fn normalize_room_id(input: &str) -> String {
    RoomCode::parse(input)
        .map(RoomCode::into_string)
        .unwrap_or_else(|| input.trim().to_string())
}

/// Read the room and admit the user, inserting a member row on first join
async fn load_room(
    store: &dyn AuthoritativeStore,
    room_id: &str,
    user_id: &str,
    now_ms: u64,
) -> Result<(RoomRow, Vec<MemberRow>), SessionError> {
    let row = store
        .read_room(room_id)
        .await?
        .ok_or_else(|| SessionError::RoomNotFound(room_id.to_string()))?;
    let is_host = row.host_id == user_id;

    if store.is_banned(room_id, user_id).await? {
        return Err(SessionError::Banned);
    }

    match store.find_member(room_id, user_id).await? {
        Some(member) if member.is_banned => return Err(SessionError::Banned),
        Some(member) => debug!("Rejoining as member {}", member.id),
        None => {
            if !row.is_public && !is_host {
                return Err(SessionError::PrivateRoom);
            }
            let member = MemberRow {
                id: random_row_id(),
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
                has_controls: is_host,
                is_banned: false,
                joined_at: now_ms,
            };
            store.insert_member(member).await?;
        }
    }

    let members = store.list_members(room_id).await?;
    Ok((row, members))
}
