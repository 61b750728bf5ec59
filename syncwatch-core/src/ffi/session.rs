//! Session implementation for FFI

use std::collections::VecDeque;
use std::sync::{Arc, Once};

use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::clock::system_clock;
use crate::config::SyncConfig;
use crate::room::{RoomSession, SessionDeps, SessionEvent, StaticIdentity};
use crate::store::{RestStore, RestStoreConfig};
use crate::sync::VideoRef;
use crate::transport::{GossipConfig, GossipTransport};

use super::types::*;

static TRACING_INIT: Once = Once::new();

const LOG_DIRECTIVES: &[&str] = &[
    "syncwatch_core=debug",
    "libp2p_mdns=info",
    "libp2p_gossipsub=info",
    "hyper_util=off",
    "reqwest=off",
    "hyper=off",
];

/// Events held while no callback is set
const MAX_PENDING_EVENTS: usize = 64;

/// Main session interface
#[derive(uniffi::Object)]
pub struct Session {
    // Dropped before the runtime so leaving can still reach the transport
    inner: RoomSession,
    relay: Arc<EventRelay>,
    runtime: Runtime,
}

#[uniffi::export]
impl Session {
    /// Create a new session
    #[uniffi::constructor]
    pub fn new(config: SessionConfig) -> Result<Self, CoreError> {
        TRACING_INIT.call_once(|| {
            let mut filter = tracing_subscriber::EnvFilter::from_default_env();
            for directive in LOG_DIRECTIVES {
                if let Ok(directive) = directive.parse() {
                    filter = filter.add_directive(directive);
                }
            }
            let _ = tracing_subscriber::fmt()
                .with_ansi(false) // Disable colors for Xcode console
                .with_target(false)
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init();
        });

        info!("Initializing syncwatch-core session for {}", config.user_id);

        let sync_config = match config.sync_config_json.as_deref() {
            Some(json) => SyncConfig::from_json(json).map_err(|e| CoreError::ConfigError(e.to_string()))?,
            None => SyncConfig::default(),
        };

        let runtime = Runtime::new().map_err(|e| CoreError::ConfigError(format!("Failed to create runtime: {}", e)))?;
        let (inner, events) = {
            // The swarm and the change-feed pollers spawn onto this runtime
            let _guard = runtime.enter();
            Self::build(config, sync_config, &runtime)?
        };

        let relay = Arc::new(EventRelay::default());
        runtime.spawn(forward_events(events, Arc::clone(&relay)));

        Ok(Self { inner, relay, runtime })
    }

    /// Set the event callback. Events raised before this call are
    /// delivered to it first, with only the latest state kept.
    pub fn set_callback(&self, callback: Box<dyn SessionCallback>) {
        self.relay.set_callback(Arc::from(callback));
    }

    /// Create a new room (become host); returns the room id
    pub fn create_room(&self, name: String) -> Result<String, CoreError> {
        let result = self.runtime.block_on(self.inner.create_room(&name));
        match &result {
            Ok(room_id) => info!("Created room {}", room_id),
            Err(e) => warn!("create_room failed: {}", e),
        }
        result.map_err(CoreError::from)
    }

    /// Join an existing room
    pub fn join_room(&self, room_id: String) -> Result<(), CoreError> {
        let result = self.runtime.block_on(self.inner.join_room(&room_id));
        if let Err(e) = &result {
            warn!("join_room {} failed: {}", room_id, e);
        }
        result.map_err(CoreError::from)
    }

    /// Leave the current room
    pub fn leave_room(&self) -> Result<(), CoreError> {
        let _guard = self.runtime.enter();
        self.inner.leave_room().map_err(CoreError::from)
    }

    pub fn play(&self) -> Result<(), CoreError> {
        let _guard = self.runtime.enter();
        self.inner.play().map_err(log_rejected("play"))
    }

    pub fn pause(&self) -> Result<(), CoreError> {
        let _guard = self.runtime.enter();
        self.inner.pause().map_err(log_rejected("pause"))
    }

    /// Seek to `position` seconds
    pub fn seek(&self, position: f64) -> Result<(), CoreError> {
        let _guard = self.runtime.enter();
        self.inner.seek(position).map_err(log_rejected("seek"))
    }

    pub fn change_video(&self, url: String, kind: VideoKind) -> Result<(), CoreError> {
        let _guard = self.runtime.enter();
        self.inner
            .change_video(VideoRef::new(url, kind.into()))
            .map_err(log_rejected("change_video"))
    }

    /// Grant or revoke controls for one member (host only)
    pub fn set_controls(&self, member_id: String, has_controls: bool) -> Result<(), CoreError> {
        self.runtime
            .block_on(self.inner.set_controls(&member_id, has_controls))
            .map_err(log_rejected("set_controls"))
    }

    pub fn ban(&self, member_id: String) -> Result<(), CoreError> {
        self.runtime
            .block_on(self.inner.ban(&member_id))
            .map_err(log_rejected("ban"))
    }

    pub fn unban(&self, member_id: String) -> Result<(), CoreError> {
        self.runtime
            .block_on(self.inner.unban(&member_id))
            .map_err(log_rejected("unban"))
    }

    pub fn grant_all_controls(&self) -> Result<(), CoreError> {
        self.runtime
            .block_on(self.inner.grant_all_controls())
            .map_err(log_rejected("grant_all_controls"))
    }

    pub fn revoke_all_controls(&self) -> Result<(), CoreError> {
        self.runtime
            .block_on(self.inner.revoke_all_controls())
            .map_err(log_rejected("revoke_all_controls"))
    }

    /// Get current room state
    pub fn get_state(&self) -> Option<RoomState> {
        self.inner.state().as_ref().map(RoomState::from)
    }

    /// Whether the local user may drive playback right now
    pub fn can_control(&self) -> bool {
        self.inner.can_control()
    }

    pub fn is_in_room(&self) -> bool {
        self.inner.is_in_room()
    }
}

impl Session {
    fn build(
        config: SessionConfig,
        sync_config: SyncConfig,
        runtime: &Runtime,
    ) -> Result<(RoomSession, UnboundedReceiver<SessionEvent>), CoreError> {
        let store = RestStore::new(RestStoreConfig {
            base_url: config.store_url,
            api_key: config.api_key,
            access_token: config.access_token,
            poll_interval: sync_config.change_poll_interval(),
        })
        .map_err(|e| CoreError::StoreError(e.to_string()))?;

        let transport = GossipTransport::start(GossipConfig {
            enable_mdns: config.enable_mdns,
            bootstrap_peers: config.bootstrap_peers,
            ..Default::default()
        })
        .map_err(|e| CoreError::NetworkError(e.to_string()))?;
        info!("Broadcast transport ready as {}", transport.local_peer_id());

        let deps = SessionDeps {
            identity: Arc::new(StaticIdentity(config.user_id)),
            store: Arc::new(store),
            transport: Arc::new(transport),
            clock: system_clock(),
            config: sync_config,
        };
        Ok(RoomSession::new(deps, runtime.handle().clone()))
    }
}

fn log_rejected(operation: &'static str) -> impl Fn(crate::room::SessionError) -> CoreError {
    move |e| {
        debug!("{} rejected: {}", operation, e);
        CoreError::from(e)
    }
}

/// Deliver session events to the UI callback
async fn forward_events(mut events: UnboundedReceiver<SessionEvent>, relay: Arc<EventRelay>) {
    while let Some(event) = events.recv().await {
        relay.dispatch(event);
    }
    debug!("Session event stream closed");
}

/// The UI callback, plus what arrived before it was set
#[derive(Default)]
struct EventRelay {
    state: Mutex<RelayState>,
}

#[derive(Default)]
struct RelayState {
    callback: Option<Arc<dyn SessionCallback>>,
    pending: VecDeque<SessionEvent>,
}

impl EventRelay {
    fn set_callback(&self, callback: Arc<dyn SessionCallback>) {
        let pending = {
            let mut state = self.state.lock();
            state.callback = Some(Arc::clone(&callback));
            std::mem::take(&mut state.pending)
        };
        if !pending.is_empty() {
            debug!("Replaying {} events to the new callback", pending.len());
        }
        for event in pending {
            deliver(callback.as_ref(), event);
        }
    }

    fn dispatch(&self, event: SessionEvent) {
        let callback = {
            let mut state = self.state.lock();
            match state.callback.clone() {
                Some(callback) => callback,
                None => {
                    state.hold(event);
                    return;
                }
            }
        };
        deliver(callback.as_ref(), event);
    }
}

impl RelayState {
    fn hold(&mut self, event: SessionEvent) {
        if matches!(event, SessionEvent::StateChanged(_)) {
            self.pending.retain(|e| !matches!(e, SessionEvent::StateChanged(_)));
        }
        if self.pending.len() >= MAX_PENDING_EVENTS {
            self.pending.pop_front();
        }
        self.pending.push_back(event);
    }
}

fn deliver(callback: &dyn SessionCallback, event: SessionEvent) {
    match event {
        SessionEvent::Joined { room_id } => callback.on_joined(room_id),
        SessionEvent::Left => callback.on_left(),
        SessionEvent::StateChanged(state) => callback.on_state_changed(RoomState::from(&state)),
        SessionEvent::Notification(notification) => {
            callback.on_notification(notification.into(), notification.message().to_string())
        }
        SessionEvent::Error(message) => callback.on_error(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::Notification;
    use crate::room::SessionState;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl SessionCallback for Recorder {
        fn on_state_changed(&self, state: RoomState) {
            self.seen.lock().push(format!("state {}", state.position));
        }
        fn on_notification(&self, _kind: NotificationKind, message: String) {
            self.seen.lock().push(message);
        }
        fn on_joined(&self, room_id: String) {
            self.seen.lock().push(format!("joined {}", room_id));
        }
        fn on_left(&self) {
            self.seen.lock().push("left".to_string());
        }
        fn on_error(&self, message: String) {
            self.seen.lock().push(message);
        }
    }

    fn state_at(position: f64) -> SessionEvent {
        SessionEvent::StateChanged(SessionState {
            room_id: "ABCD2345".into(),
            room_name: "Movie night".into(),
            host_id: "host".into(),
            video: None,
            position,
            is_playing: false,
            is_banned: false,
            is_host: false,
            can_control: false,
            members: Vec::new(),
        })
    }

    #[test]
    fn test_events_before_callback_are_replayed() {
        let relay = EventRelay::default();
        relay.dispatch(SessionEvent::Joined {
            room_id: "ABCD2345".into(),
        });
        relay.dispatch(state_at(1.0));
        relay.dispatch(SessionEvent::Notification(Notification::ControlsGranted));
        relay.dispatch(state_at(2.0));

        let recorder = Arc::new(Recorder::default());
        relay.set_callback(recorder.clone());
        relay.dispatch(SessionEvent::Left);

        assert_eq!(
            *recorder.seen.lock(),
            vec![
                "joined ABCD2345".to_string(),
                "You have been granted room controls!".to_string(),
                "state 2".to_string(),
                "left".to_string(),
            ]
        );
    }

    #[test]
    fn test_pending_events_are_bounded() {
        let relay = EventRelay::default();
        for i in 0..(MAX_PENDING_EVENTS + 10) {
            relay.dispatch(SessionEvent::Error(format!("error {}", i)));
        }
        let recorder = Arc::new(Recorder::default());
        relay.set_callback(recorder.clone());

        let seen = recorder.seen.lock();
        assert_eq!(seen.len(), MAX_PENDING_EVENTS);
        assert_eq!(seen[0], "error 10");
    }
}
