//! FFI types exposed via uniffi

use crate::membership::Notification as InternalNotification;
use crate::room::{MemberState, SessionError, SessionState};
use crate::sync::{VideoKind as InternalVideoKind, VideoRef};

/// Error types exposed via FFI
#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum CoreError {
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

    #[error("Join timeout - room store not reachable")]
    JoinTimeout,

    #[error("Not allowed: {0}")]
    NotAuthorized(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<SessionError> for CoreError {
    fn from(e: SessionError) -> Self {
        use crate::sync::SyncError;
        match e {
            SessionError::NotInRoom | SessionError::Cancelled => CoreError::NotInRoom,
            SessionError::AlreadyInRoom => CoreError::AlreadyInRoom,
            SessionError::RoomNotFound(room) => CoreError::RoomNotFound(room),
            SessionError::PrivateRoom => CoreError::PrivateRoom,
            SessionError::Banned | SessionError::Sync(SyncError::Banned) => CoreError::Banned,
            SessionError::JoinTimeout => CoreError::JoinTimeout,
            SessionError::Sync(SyncError::Unauthorized) => {
                CoreError::NotAuthorized(SyncError::Unauthorized.to_string())
            }
            SessionError::Sync(e) => CoreError::InvalidInput(e.to_string()),
            SessionError::Membership(e) => CoreError::NotAuthorized(e.to_string()),
            SessionError::Store(e) => CoreError::StoreError(e.to_string()),
            SessionError::Transport(e) => CoreError::NetworkError(e.to_string()),
            SessionError::Protocol(e) => CoreError::NetworkError(e.to_string()),
        }
    }
}

/// Session construction parameters
#[derive(Debug, Clone, uniffi::Record)]
pub struct SessionConfig {
    /// Base URL of the REST room store
    pub store_url: String,
    pub api_key: String,
    /// Signed-in user's access token, if any
    pub access_token: Option<String>,
    /// Id of the signed-in user
    pub user_id: String,
    /// Overrides for sync timings as JSON (camelCase keys, all optional)
    pub sync_config_json: Option<String>,
    /// Discover peers on the local network
    pub enable_mdns: bool,
    /// Multiaddrs of peers to dial at startup
    pub bootstrap_peers: Vec<String>,
}

/// Where a video is hosted
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum VideoKind {
    Youtube,
    Direct,
    Drive,
}

impl From<InternalVideoKind> for VideoKind {
    fn from(kind: InternalVideoKind) -> Self {
        match kind {
            InternalVideoKind::Youtube => VideoKind::Youtube,
            InternalVideoKind::Direct => VideoKind::Direct,
            InternalVideoKind::Drive => VideoKind::Drive,
        }
    }
}

impl From<VideoKind> for InternalVideoKind {
    fn from(kind: VideoKind) -> Self {
        match kind {
            VideoKind::Youtube => InternalVideoKind::Youtube,
            VideoKind::Direct => InternalVideoKind::Direct,
            VideoKind::Drive => InternalVideoKind::Drive,
        }
    }
}

/// Video information exposed via FFI
#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct VideoInfo {
    pub url: String,
    pub kind: VideoKind,
}

impl From<&VideoRef> for VideoInfo {
    fn from(v: &VideoRef) -> Self {
        Self {
            url: v.url.clone(),
            kind: v.kind.into(),
        }
    }
}

/// Room member exposed via FFI
#[derive(Debug, Clone, uniffi::Record)]
pub struct Member {
    pub member_id: String,
    pub user_id: String,
    pub has_controls: bool,
    pub is_banned: bool,
    pub is_online: bool,
    pub is_host: bool,
}

impl From<&MemberState> for Member {
    fn from(m: &MemberState) -> Self {
        Self {
            member_id: m.member_id.clone(),
            user_id: m.user_id.clone(),
            has_controls: m.has_controls,
            is_banned: m.is_banned,
            is_online: m.is_online,
            is_host: m.is_host,
        }
    }
}

/// Room state exposed via FFI
#[derive(Debug, Clone, uniffi::Record)]
pub struct RoomState {
    pub room_id: String,
    pub room_name: String,
    pub host_id: String,
    pub video: Option<VideoInfo>,
    /// Current position in seconds
    pub position: f64,
    pub is_playing: bool,
    pub is_banned: bool,
    pub is_host: bool,
    pub can_control: bool,
    pub members: Vec<Member>,
}

impl From<&SessionState> for RoomState {
    fn from(s: &SessionState) -> Self {
        Self {
            room_id: s.room_id.clone(),
            room_name: s.room_name.clone(),
            host_id: s.host_id.clone(),
            video: s.video.as_ref().map(VideoInfo::from),
            position: s.position,
            is_playing: s.is_playing,
            is_banned: s.is_banned,
            is_host: s.is_host,
            can_control: s.can_control,
            members: s.members.iter().map(Member::from).collect(),
        }
    }
}

/// Membership notification kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum NotificationKind {
    Banned,
    Unbanned,
    ControlsGranted,
    ControlsRevoked,
}

impl From<InternalNotification> for NotificationKind {
    fn from(n: InternalNotification) -> Self {
        match n {
            InternalNotification::Banned => NotificationKind::Banned,
            InternalNotification::Unbanned => NotificationKind::Unbanned,
            InternalNotification::ControlsGranted => NotificationKind::ControlsGranted,
            InternalNotification::ControlsRevoked => NotificationKind::ControlsRevoked,
        }
    }
}

/// Callback interface for session events
#[uniffi::export(callback_interface)]
pub trait SessionCallback: Send + Sync {
    fn on_state_changed(&self, state: RoomState);
    /// `message` is ready to show to the user
    fn on_notification(&self, kind: NotificationKind, message: String);
    fn on_joined(&self, room_id: String);
    fn on_left(&self);
    fn on_error(&self, message: String);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::MembershipError;
    use crate::sync::SyncError;

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            CoreError::from(SessionError::Sync(SyncError::Banned)),
            CoreError::Banned
        ));
        assert!(matches!(
            CoreError::from(SessionError::Sync(SyncError::Unauthorized)),
            CoreError::NotAuthorized(_)
        ));
        assert!(matches!(
            CoreError::from(SessionError::Sync(SyncError::InvalidPosition(-1.0))),
            CoreError::InvalidInput(_)
        ));
        assert!(matches!(
            CoreError::from(SessionError::Membership(MembershipError::NotHost)),
            CoreError::NotAuthorized(_)
        ));
    }

    #[test]
    fn test_room_state_conversion() {
        let state = SessionState {
            room_id: "ABCD2345".into(),
            room_name: "Movie night".into(),
            host_id: "host".into(),
            video: Some(VideoRef::new("https://example.com/a.mp4", InternalVideoKind::Direct)),
            position: 12.5,
            is_playing: true,
            is_banned: false,
            is_host: false,
            can_control: false,
            members: vec![MemberState {
                member_id: "m1".into(),
                user_id: "host".into(),
                has_controls: true,
                is_banned: false,
                is_online: true,
                is_host: true,
            }],
        };
        let ffi = RoomState::from(&state);
        assert_eq!(
            ffi.video,
            Some(VideoInfo {
                url: "https://example.com/a.mp4".into(),
                kind: VideoKind::Direct,
            })
        );
        assert_eq!(ffi.members.len(), 1);
        assert!(ffi.members[0].is_host);
    }
}
