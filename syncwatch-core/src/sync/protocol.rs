//! Sync Protocol Messages
//!
//! Envelopes travel on three logical channels per room. Each channel has its
//! own envelope shape with a `type` discriminant; anything that does not
//! parse into one of the known shapes is rejected here, before it can reach
//! the synchronizer or the membership engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::state::{VideoKind, VideoRef};

/// Errors raised at the parse boundary
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid envelope: {0}")]
    Invalid(String),
}

/// Logical broadcast channels of a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    PlayerAction,
    MemberUpdate,
    Presence,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::PlayerAction, Channel::MemberUpdate, Channel::Presence];

    /// Wire name of the channel
    pub fn name(&self) -> &'static str {
        match self {
            Channel::PlayerAction => "player-action",
            Channel::MemberUpdate => "member-update",
            Channel::Presence => "presence",
        }
    }
}

/// A playback action as carried on the `player-action` channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PlayerAction {
    /// Start playback; `position` is the position at the time of sending
    Play { position: f64 },

    /// Pause playback at an exact position
    Pause {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position: Option<f64>,
    },

    /// Jump to `position`
    Seek { position: f64 },

    /// Replace the video, reset to 0 and pause
    #[serde(rename_all = "camelCase")]
    ChangeVideo { video_url: String, video_kind: VideoKind },
}

impl PlayerAction {
    pub fn change_video(video: &VideoRef) -> Self {
        PlayerAction::ChangeVideo {
            video_url: video.url.clone(),
            video_kind: video.kind,
        }
    }

    /// Authoritative actions must always apply; seeks are advisory
    pub fn is_authoritative(&self) -> bool {
        !matches!(self, PlayerAction::Seek { .. })
    }

    pub fn is_play_pause(&self) -> bool {
        matches!(self, PlayerAction::Play { .. } | PlayerAction::Pause { .. })
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            PlayerAction::Play { .. } => "play",
            PlayerAction::Pause { .. } => "pause",
            PlayerAction::Seek { .. } => "seek",
            PlayerAction::ChangeVideo { .. } => "changeVideo",
        }
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        let position = match self {
            PlayerAction::Play { position } | PlayerAction::Seek { position } => Some(*position),
            PlayerAction::Pause { position } => *position,
            PlayerAction::ChangeVideo { video_url, .. } => {
                if video_url.trim().is_empty() {
                    return Err(ProtocolError::Invalid("empty videoUrl".to_string()));
                }
                None
            }
        };
        match position {
            Some(p) if !p.is_finite() || p < 0.0 => {
                Err(ProtocolError::Invalid(format!("position out of range: {}", p)))
            }
            _ => Ok(()),
        }
    }
}

/// Envelope on the `player-action` channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerEnvelope {
    pub origin_user_id: String,
    /// Sender's wall clock, epoch ms
    pub sent_at: u64,
    #[serde(flatten)]
    pub action: PlayerAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum MemberEnvelopeType {
    #[serde(rename = "memberUpdate")]
    MemberUpdate,
}

/// Envelope on the `member-update` channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberEnvelope {
    #[serde(rename = "type")]
    kind: MemberEnvelopeType,
    pub origin_user_id: String,
    pub sent_at: u64,
    /// The member the update is about
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_controls: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_banned: Option<bool>,
}

impl MemberEnvelope {
    pub fn new(
        origin_user_id: impl Into<String>,
        sent_at: u64,
        user_id: impl Into<String>,
        has_controls: Option<bool>,
        is_banned: Option<bool>,
    ) -> Self {
        Self {
            kind: MemberEnvelopeType::MemberUpdate,
            origin_user_id: origin_user_id.into(),
            sent_at,
            user_id: user_id.into(),
            has_controls,
            is_banned,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum PresenceEnvelopeType {
    #[serde(rename = "presence")]
    Presence,
}

/// Envelope on the `presence` channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEnvelope {
    #[serde(rename = "type")]
    kind: PresenceEnvelopeType,
    pub user_id: String,
    pub sent_at: u64,
    pub online: bool,
}

impl PresenceEnvelope {
    pub fn new(user_id: impl Into<String>, sent_at: u64, online: bool) -> Self {
        Self {
            kind: PresenceEnvelopeType::Presence,
            user_id: user_id.into(),
            sent_at,
            online,
        }
    }
}

/// Any envelope, tagged by the channel it arrived on
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Player(PlayerEnvelope),
    Member(MemberEnvelope),
    Presence(PresenceEnvelope),
}

impl Envelope {
    /// Parse bytes received on `channel`
    pub fn decode(channel: Channel, bytes: &[u8]) -> Result<Self, ProtocolError> {
        let envelope = match channel {
            Channel::PlayerAction => {
                let envelope: PlayerEnvelope = serde_json::from_slice(bytes)?;
                envelope.action.validate()?;
                Envelope::Player(envelope)
            }
            Channel::MemberUpdate => Envelope::Member(serde_json::from_slice(bytes)?),
            Channel::Presence => Envelope::Presence(serde_json::from_slice(bytes)?),
        };
        if envelope.origin().is_empty() {
            return Err(ProtocolError::Invalid("missing origin".to_string()));
        }
        Ok(envelope)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let bytes = match self {
            Envelope::Player(e) => serde_json::to_vec(e)?,
            Envelope::Member(e) => serde_json::to_vec(e)?,
            Envelope::Presence(e) => serde_json::to_vec(e)?,
        };
        Ok(bytes)
    }

    pub fn channel(&self) -> Channel {
        match self {
            Envelope::Player(_) => Channel::PlayerAction,
            Envelope::Member(_) => Channel::MemberUpdate,
            Envelope::Presence(_) => Channel::Presence,
        }
    }

    /// User id of the sender
    pub fn origin(&self) -> &str {
        match self {
            Envelope::Player(e) => &e.origin_user_id,
            Envelope::Member(e) => &e.origin_user_id,
            Envelope::Presence(e) => &e.user_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_play_wire_format() {
        let envelope = Envelope::Player(PlayerEnvelope {
            origin_user_id: "u1".into(),
            sent_at: 1_000,
            action: PlayerAction::Play { position: 12.5 },
        });
        let json: serde_json::Value = serde_json::from_slice(&envelope.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "play");
        assert_eq!(json["originUserId"], "u1");
        assert_eq!(json["sentAt"], 1_000);
        assert_eq!(json["position"], 12.5);
    }

    #[test]
    fn test_change_video_decodes() {
        let raw = br#"{"type":"changeVideo","originUserId":"host","sentAt":5,"videoUrl":"https://youtu.be/x","videoKind":"youtube"}"#;
        let envelope = Envelope::decode(Channel::PlayerAction, raw).unwrap();
        match envelope {
            Envelope::Player(PlayerEnvelope {
                action: PlayerAction::ChangeVideo { video_url, video_kind },
                ..
            }) => {
                assert_eq!(video_url, "https://youtu.be/x");
                assert_eq!(video_kind, VideoKind::Youtube);
            }
            other => panic!("unexpected envelope: {:?}", other),
        }
    }

    #[test]
    fn test_pause_without_position() {
        let raw = br#"{"type":"pause","originUserId":"u","sentAt":1}"#;
        let envelope = Envelope::decode(Channel::PlayerAction, raw).unwrap();
        assert!(matches!(
            envelope,
            Envelope::Player(PlayerEnvelope {
                action: PlayerAction::Pause { position: None },
                ..
            })
        ));
    }

    #[test]
    fn test_unknown_discriminant_rejected() {
        let raw = br#"{"type":"rewind","originUserId":"u","sentAt":1,"position":3}"#;
        assert!(Envelope::decode(Channel::PlayerAction, raw).is_err());

        let raw = br#"{"type":"kick","originUserId":"h","sentAt":1,"userId":"u"}"#;
        assert!(Envelope::decode(Channel::MemberUpdate, raw).is_err());
    }

    #[test]
    fn test_missing_required_field_rejected() {
        let raw = br#"{"type":"seek","originUserId":"u","sentAt":1}"#;
        assert!(Envelope::decode(Channel::PlayerAction, raw).is_err());
        assert!(Envelope::decode(Channel::PlayerAction, b"not json").is_err());
    }

    #[test]
    fn test_negative_position_rejected() {
        let raw = br#"{"type":"seek","originUserId":"u","sentAt":1,"position":-3}"#;
        assert!(matches!(
            Envelope::decode(Channel::PlayerAction, raw),
            Err(ProtocolError::Invalid(_))
        ));
    }

    #[test]
    fn test_member_update_optional_fields() {
        let raw = br#"{"type":"memberUpdate","originUserId":"h","sentAt":9,"userId":"u","isBanned":true}"#;
        match Envelope::decode(Channel::MemberUpdate, raw).unwrap() {
            Envelope::Member(m) => {
                assert_eq!(m.user_id, "u");
                assert_eq!(m.is_banned, Some(true));
                assert_eq!(m.has_controls, None);
            }
            other => panic!("unexpected envelope: {:?}", other),
        }
    }

    #[test]
    fn test_action_classification() {
        assert!(PlayerAction::Play { position: 0.0 }.is_authoritative());
        assert!(PlayerAction::Pause { position: None }.is_play_pause());
        assert!(!PlayerAction::Seek { position: 1.0 }.is_authoritative());
    }
}
