//! Session types shared by the room orchestration and the FFI layer

use std::sync::Arc;

use thiserror::Error;

use crate::clock::SharedClock;
use crate::config::SyncConfig;
use crate::membership::{MembershipError, Notification};
use crate::store::{AuthoritativeStore, StoreError};
use crate::sync::{ProtocolError, SyncError, VideoRef};
use crate::transport::{BroadcastTransport, TransportError};

/// Source of the signed-in user's id
pub trait Identity: Send + Sync {
    fn current_user_id(&self) -> String;
}

/// A fixed user id
#[derive(Debug, Clone)]
pub struct StaticIdentity(pub String);

impl Identity for StaticIdentity {
    fn current_user_id(&self) -> String {
        self.0.clone()
    }
}

/// Everything a session is built from
#[derive(Clone)]
pub struct SessionDeps {
    pub identity: Arc<dyn Identity>,
    pub store: Arc<dyn AuthoritativeStore>,
    pub transport: Arc<dyn BroadcastTransport>,
    pub clock: SharedClock,
    pub config: SyncConfig,
}

/// Errors surfaced by session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Not in a room")]
    NotInRoom,

    #[error("Already in a room")]
    AlreadyInRoom,

    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("This room is private")]
    PrivateRoom,

    #[error("You are banned from this room")]
    Banned,

    #[error("Timed out joining the room")]
    JoinTimeout,

    #[error("Left the room before the operation finished")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Membership(#[from] MembershipError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// One member as seen by the UI
#[derive(Debug, Clone, PartialEq)]
pub struct MemberState {
    pub member_id: String,
    pub user_id: String,
    pub has_controls: bool,
    pub is_banned: bool,
    pub is_online: bool,
    pub is_host: bool,
}

/// Read-only view of the room for rendering
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub room_id: String,
    pub room_name: String,
    pub host_id: String,
    pub video: Option<VideoRef>,
    pub position: f64,
    pub is_playing: bool,
    pub is_banned: bool,
    pub is_host: bool,
    pub can_control: bool,
    pub members: Vec<MemberState>,
}

/// Events emitted by a session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Joined { room_id: String },
    Left,
    StateChanged(SessionState),
    Notification(Notification),
    Error(String),
}
