//! Room Session
//!
//! Ties the store, the broadcast transport, the playback synchronizer, the
//! membership engine and presence together for one room at a time.

mod handlers;
mod session;
mod types;


pub use session::RoomSession;
pub use types::*;
