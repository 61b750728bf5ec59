//! Membership & Authorization
//!
//! Who may control playback and who is banned, kept consistent across the
//! broadcast channel, the store change feed and the ban poll.

mod engine;
mod optimistic;
mod recency;

pub use engine::*;
pub use optimistic::Transaction;
pub use recency::{FieldStamp, MemberField, RecencyGuard, UpdateSource};
