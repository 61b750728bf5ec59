//! Authoritative Store
//!
//! The durable record of rooms, members and ban records. The session only
//! talks to it through [`AuthoritativeStore`], so the same sync logic runs
//! against the in-process store in tests and the REST backend in the apps.

mod memory;
mod rest;

pub use memory::InMemoryStore;
pub use rest::{RestStore, RestStoreConfig};

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::sync::{MemberPatch, MemberRow, RoomPatch, RoomRow};

/// Errors that can occur when talking to the store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Store is not reachable: {0}")]
    Unavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store rejected the request: {0}")]
    Api(String),
}

/// Result of a conditional room write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// The stored row already carries a newer `last_write_at`
    Superseded,
}

/// One entry of the change feed
#[derive(Debug, Clone, PartialEq)]
pub enum StoreChange {
    RoomUpdated(RoomRow),
    MemberInserted(MemberRow),
    MemberUpdated(MemberRow),
    MemberDeleted { member_id: String },
}

/// Durable store operations the session needs
pub trait AuthoritativeStore: Send + Sync {
    /// Insert a room and its host member row
    fn create_room(&self, room: RoomRow, host: MemberRow) -> BoxFuture<'_, Result<(), StoreError>>;

    fn read_room<'a>(&'a self, room_id: &'a str) -> BoxFuture<'a, Result<Option<RoomRow>, StoreError>>;

    /// Apply `patch` unless the stored `last_write_at` is newer
    fn write_room<'a>(&'a self, room_id: &'a str, patch: RoomPatch) -> BoxFuture<'a, Result<WriteOutcome, StoreError>>;

    /// All member rows of a room, ordered by `joined_at`
    fn list_members<'a>(&'a self, room_id: &'a str) -> BoxFuture<'a, Result<Vec<MemberRow>, StoreError>>;

    fn find_member<'a>(
        &'a self,
        room_id: &'a str,
        user_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<MemberRow>, StoreError>>;

    fn insert_member(&self, member: MemberRow) -> BoxFuture<'_, Result<MemberRow, StoreError>>;

    /// Apply one patch to several member rows in a single write
    fn update_members<'a>(
        &'a self,
        room_id: &'a str,
        member_ids: Vec<String>,
        patch: MemberPatch,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Whether a durable ban record exists for `(room_id, user_id)`
    fn is_banned<'a>(&'a self, room_id: &'a str, user_id: &'a str) -> BoxFuture<'a, Result<bool, StoreError>>;

    /// Upsert the ban record
    fn record_ban<'a>(&'a self, room_id: &'a str, user_id: &'a str) -> BoxFuture<'a, Result<(), StoreError>>;

    fn clear_ban<'a>(&'a self, room_id: &'a str, user_id: &'a str) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Change feed for one room; ends when the receiver is dropped
    fn watch_changes(&self, room_id: &str) -> BoxStream<'static, StoreChange>;
}
