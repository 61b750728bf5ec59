//! Sync Engine
//!
//! Wire envelopes, room/member/playback state, and the playback
//! synchronizer that merges them.

mod protocol;
mod state;
mod synchronizer;

pub use protocol::*;
pub use state::*;
pub use synchronizer::*;
