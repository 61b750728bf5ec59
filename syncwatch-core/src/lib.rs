//! SyncWatch - Core Library
//!
//! Keeps a shared video timeline and room permissions consistent across the
//! clients in a watch-together room. Playback and membership changes travel
//! over a best-effort broadcast transport and are backed by a durable room
//! store that every client reconciles against.

pub mod clock;
pub mod config;
pub mod ffi;
pub mod latency;
pub mod membership;
pub mod presence;
pub mod room;
pub mod room_code;
pub mod store;
pub mod sync;
pub mod timer;
pub mod transport;

// Re-exports for convenience
pub use config::SyncConfig;
pub use room::{RoomSession, SessionDeps, SessionError, SessionEvent, SessionState};
pub use sync::{LocalAction, PlaybackSynchronizer, VideoKind, VideoRef};

// Setup uniffi scaffolding
uniffi::setup_scaffolding!();
