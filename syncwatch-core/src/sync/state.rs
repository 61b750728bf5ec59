//! Room, member and playback state

use serde::{Deserialize, Serialize};

use crate::latency::{compensate, Compensation};

/// Where a video is hosted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoKind {
    Youtube,
    Direct,
    Drive,
}

/// Pointer to the video a room is watching
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoRef {
    pub url: String,
    pub kind: VideoKind,
}

impl VideoRef {
    pub fn new(url: impl Into<String>, kind: VideoKind) -> Self {
        Self {
            url: url.into(),
            kind,
        }
    }
}

/// Durable room record (one row of the `rooms` table)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomRow {
    pub id: String,
    pub name: String,
    pub host_id: String,
    pub is_public: bool,
    pub video_url: Option<String>,
    pub video_kind: Option<VideoKind>,
    /// Seconds, relative to `last_write_at`
    pub position: f64,
    pub is_playing: bool,
    /// Epoch ms of the last accepted write
    pub last_write_at: u64,
}

impl RoomRow {
    /// A fresh public room with no video
    pub fn new(id: impl Into<String>, name: impl Into<String>, host_id: impl Into<String>, now_ms: u64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            host_id: host_id.into(),
            is_public: true,
            video_url: None,
            video_kind: None,
            position: 0.0,
            is_playing: false,
            last_write_at: now_ms,
        }
    }

    pub fn video(&self) -> Option<VideoRef> {
        match (&self.video_url, self.video_kind) {
            (Some(url), Some(kind)) => Some(VideoRef::new(url.clone(), kind)),
            _ => None,
        }
    }

    /// Merge a patch into the row (the store checks recency first)
    pub fn apply(&mut self, patch: &RoomPatch) {
        if let Some(url) = &patch.video_url {
            self.video_url = Some(url.clone());
        }
        if let Some(kind) = patch.video_kind {
            self.video_kind = Some(kind);
        }
        if let Some(position) = patch.position {
            self.position = position;
        }
        if let Some(is_playing) = patch.is_playing {
            self.is_playing = is_playing;
        }
        self.last_write_at = patch.last_write_at;
    }
}

/// Partial room update; every write carries its own `last_write_at`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_kind: Option<VideoKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_playing: Option<bool>,
    pub last_write_at: u64,
}

impl RoomPatch {
    /// New video, position 0, paused: one atomic update
    pub fn change_video(video: &VideoRef, now_ms: u64) -> Self {
        Self {
            video_url: Some(video.url.clone()),
            video_kind: Some(video.kind),
            position: Some(0.0),
            is_playing: Some(false),
            last_write_at: now_ms,
        }
    }

    /// Play/pause write
    pub fn playback(is_playing: bool, position: f64, now_ms: u64) -> Self {
        Self {
            video_url: None,
            video_kind: None,
            position: Some(position),
            is_playing: Some(is_playing),
            last_write_at: now_ms,
        }
    }

    /// Seek write
    pub fn position(position: f64, now_ms: u64) -> Self {
        Self {
            video_url: None,
            video_kind: None,
            position: Some(position),
            is_playing: None,
            last_write_at: now_ms,
        }
    }
}

/// Member record (one row of the `room_members` table)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRow {
    pub id: String,
    pub room_id: String,
    pub user_id: String,
    pub has_controls: bool,
    pub is_banned: bool,
    pub joined_at: u64,
}

impl MemberRow {
    /// Apply a patch, keeping `is_banned => !has_controls`. Returns whether
    /// anything changed.
    pub fn apply(&mut self, patch: &MemberPatch) -> bool {
        let patch = patch.normalized();
        let before = (self.has_controls, self.is_banned);
        if let Some(is_banned) = patch.is_banned {
            self.is_banned = is_banned;
        }
        if let Some(has_controls) = patch.has_controls {
            self.has_controls = has_controls;
        }
        if self.is_banned {
            self.has_controls = false;
        }
        before != (self.has_controls, self.is_banned)
    }
}

/// Partial member update
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_controls: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_banned: Option<bool>,
}

impl MemberPatch {
    pub fn controls(has_controls: bool) -> Self {
        Self {
            has_controls: Some(has_controls),
            is_banned: None,
        }
    }

    pub fn ban() -> Self {
        Self {
            has_controls: Some(false),
            is_banned: Some(true),
        }
    }

    pub fn unban() -> Self {
        Self {
            has_controls: None,
            is_banned: Some(false),
        }
    }

    /// A ban always carries `has_controls = false`
    pub fn normalized(&self) -> Self {
        if self.is_banned == Some(true) {
            Self {
                has_controls: Some(false),
                is_banned: Some(true),
            }
        } else {
            *self
        }
    }
}

/// Durable ban record, keyed by `(room_id, user_id)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BanRecord {
    pub room_id: String,
    pub user_id: String,
}

/// The local playback view of one client
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlaybackSnapshot {
    pub video: Option<VideoRef>,
    /// Position in seconds as of `position_at_ms`
    pub position: f64,
    pub is_playing: bool,
    pub position_at_ms: u64,
    pub last_authoritative_action_at: u64,
    pub last_local_action_at: u64,
}

impl PlaybackSnapshot {
    /// Position now, advancing while playing
    pub fn current_position(&self, now_ms: u64) -> f64 {
        compensate(
            self.position,
            self.position_at_ms,
            now_ms,
            Compensation::for_snapshot(self.is_playing),
        )
    }

    pub fn set_position(&mut self, position: f64, now_ms: u64) {
        self.position = position.max(0.0);
        self.position_at_ms = now_ms;
    }
}
