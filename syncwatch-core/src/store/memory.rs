//! In-process Authoritative Store
//!
//! Holds rooms, members and ban records in memory and pushes every change
//! to the room's watchers. Used by the tests and for offline sessions; it
//! can be told to fail writes, fail everything, or stall.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use futures::channel::mpsc;
use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use tracing::debug;

use super::{AuthoritativeStore, StoreChange, StoreError, WriteOutcome};
use crate::sync::{BanRecord, MemberPatch, MemberRow, RoomPatch, RoomRow};

#[derive(Default)]
struct Tables {
    rooms: HashMap<String, RoomRow>,
    members: HashMap<String, MemberRow>,
    bans: HashSet<BanRecord>,
    watchers: HashMap<String, Vec<mpsc::UnboundedSender<StoreChange>>>,
}

impl Tables {
    fn notify(&mut self, room_id: &str, change: StoreChange) {
        if let Some(watchers) = self.watchers.get_mut(room_id) {
            watchers.retain(|tx| tx.unbounded_send(change.clone()).is_ok());
        }
    }

    fn members_of(&self, room_id: &str) -> Vec<MemberRow> {
        let mut members: Vec<MemberRow> = self
            .members
            .values()
            .filter(|m| m.room_id == room_id)
            .cloned()
            .collect();
        members.sort_by_key(|m| m.joined_at);
        members
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    fail_writes: AtomicBool,
    fail_ban_records: AtomicBool,
    unreachable: AtomicBool,
    stalled: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail until reset
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make ban record writes fail until reset
    pub fn set_fail_ban_records(&self, fail: bool) {
        self.fail_ban_records.store(fail, Ordering::SeqCst);
    }

    /// Make every operation fail until reset
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Make every operation hang until reset
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn room(&self, room_id: &str) -> Option<RoomRow> {
        self.tables.lock().rooms.get(room_id).cloned()
    }

    pub fn member(&self, room_id: &str, user_id: &str) -> Option<MemberRow> {
        self.tables
            .lock()
            .members
            .values()
            .find(|m| m.room_id == room_id && m.user_id == user_id)
            .cloned()
    }

    pub fn has_ban(&self, room_id: &str, user_id: &str) -> bool {
        self.tables.lock().bans.contains(&BanRecord {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
        })
    }

    /// Insert or replace a room row directly (fixtures)
    pub fn put_room(&self, room: RoomRow) {
        let mut tables = self.tables.lock();
        let room_id = room.id.clone();
        tables.rooms.insert(room_id.clone(), room.clone());
        tables.notify(&room_id, StoreChange::RoomUpdated(room));
    }

    /// Delete a member row; the ban record survives
    pub fn delete_member(&self, member_id: &str) -> Option<MemberRow> {
        let mut tables = self.tables.lock();
        let removed = tables.members.remove(member_id)?;
        tables.notify(
            &removed.room_id,
            StoreChange::MemberDeleted {
                member_id: removed.id.clone(),
            },
        );
        Some(removed)
    }

    fn check(&self, write: bool) -> Result<(), StoreError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store unreachable".to_string()));
        }
        if write && self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("write rejected".to_string()));
        }
        Ok(())
    }

    fn check_ban_write(&self) -> Result<(), StoreError> {
        self.check(true)?;
        if self.fail_ban_records.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("ban record write rejected".to_string()));
        }
        Ok(())
    }

    fn respond<'a, T: Send + 'a>(&self, result: Result<T, StoreError>) -> BoxFuture<'a, Result<T, StoreError>> {
        if self.stalled.load(Ordering::SeqCst) {
            future::pending().boxed()
        } else {
            future::ready(result).boxed()
        }
    }

    fn do_write_room(&self, room_id: &str, patch: RoomPatch) -> Result<WriteOutcome, StoreError> {
        self.check(true)?;
        let mut tables = self.tables.lock();
        let room = tables
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| StoreError::NotFound(format!("room {}", room_id)))?;
        if patch.last_write_at < room.last_write_at {
            debug!(
                "Room {} write at {} superseded by {}",
                room_id, patch.last_write_at, room.last_write_at
            );
            return Ok(WriteOutcome::Superseded);
        }
        room.apply(&patch);
        let row = room.clone();
        tables.notify(room_id, StoreChange::RoomUpdated(row));
        Ok(WriteOutcome::Applied)
    }

    fn do_insert_member(&self, member: MemberRow) -> Result<MemberRow, StoreError> {
        self.check(true)?;
        let mut tables = self.tables.lock();
        if !tables.rooms.contains_key(&member.room_id) {
            return Err(StoreError::NotFound(format!("room {}", member.room_id)));
        }
        let duplicate = tables
            .members
            .values()
            .any(|m| m.room_id == member.room_id && m.user_id == member.user_id);
        if duplicate {
            return Err(StoreError::Api(format!("{} is already a member", member.user_id)));
        }
        tables.members.insert(member.id.clone(), member.clone());
        tables.notify(&member.room_id, StoreChange::MemberInserted(member.clone()));
        Ok(member)
    }

    fn do_update_members(&self, room_id: &str, member_ids: &[String], patch: MemberPatch) -> Result<(), StoreError> {
        self.check(true)?;
        let mut tables = self.tables.lock();
        let mut changed = Vec::new();
        for id in member_ids {
            if let Some(member) = tables.members.get_mut(id) {
                if member.room_id == room_id && member.apply(&patch) {
                    changed.push(member.clone());
                }
            }
        }
        for member in changed {
            tables.notify(room_id, StoreChange::MemberUpdated(member));
        }
        Ok(())
    }
}

impl AuthoritativeStore for InMemoryStore {
    fn create_room(&self, room: RoomRow, host: MemberRow) -> BoxFuture<'_, Result<(), StoreError>> {
        let result = self.check(true).and_then(|_| {
            let mut tables = self.tables.lock();
            if tables.rooms.contains_key(&room.id) {
                return Err(StoreError::Api(format!("room {} already exists", room.id)));
            }
            tables.rooms.insert(room.id.clone(), room);
            tables.members.insert(host.id.clone(), host);
            Ok(())
        });
        self.respond(result)
    }

    fn read_room<'a>(&'a self, room_id: &'a str) -> BoxFuture<'a, Result<Option<RoomRow>, StoreError>> {
        let result = self.check(false).map(|_| self.room(room_id));
        self.respond(result)
    }

    fn write_room<'a>(&'a self, room_id: &'a str, patch: RoomPatch) -> BoxFuture<'a, Result<WriteOutcome, StoreError>> {
        let result = self.do_write_room(room_id, patch);
        self.respond(result)
    }

    fn list_members<'a>(&'a self, room_id: &'a str) -> BoxFuture<'a, Result<Vec<MemberRow>, StoreError>> {
        let result = self.check(false).map(|_| self.tables.lock().members_of(room_id));
        self.respond(result)
    }

    fn find_member<'a>(
        &'a self,
        room_id: &'a str,
        user_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<MemberRow>, StoreError>> {
        let result = self.check(false).map(|_| self.member(room_id, user_id));
        self.respond(result)
    }

    fn insert_member(&self, member: MemberRow) -> BoxFuture<'_, Result<MemberRow, StoreError>> {
        let result = self.do_insert_member(member);
        self.respond(result)
    }

    fn update_members<'a>(
        &'a self,
        room_id: &'a str,
        member_ids: Vec<String>,
        patch: MemberPatch,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        let result = self.do_update_members(room_id, &member_ids, patch);
        self.respond(result)
    }

    fn is_banned<'a>(&'a self, room_id: &'a str, user_id: &'a str) -> BoxFuture<'a, Result<bool, StoreError>> {
        let result = self.check(false).map(|_| self.has_ban(room_id, user_id));
        self.respond(result)
    }

    fn record_ban<'a>(&'a self, room_id: &'a str, user_id: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        let result = self.check_ban_write().map(|_| {
            self.tables.lock().bans.insert(BanRecord {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
            });
        });
        self.respond(result)
    }

    fn clear_ban<'a>(&'a self, room_id: &'a str, user_id: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        let result = self.check_ban_write().map(|_| {
            self.tables.lock().bans.remove(&BanRecord {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
            });
        });
        self.respond(result)
    }

    fn watch_changes(&self, room_id: &str) -> BoxStream<'static, StoreChange> {
        let (tx, rx) = mpsc::unbounded();
        self.tables
            .lock()
            .watchers
            .entry(room_id.to_string())
            .or_default()
            .push(tx);
        rx.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str, user: &str) -> MemberRow {
        MemberRow {
            id: id.into(),
            room_id: "room".into(),
            user_id: user.into(),
            has_controls: false,
            is_banned: false,
            joined_at: 1,
        }
    }

    async fn seeded() -> InMemoryStore {
        let store = InMemoryStore::new();
        let mut host = member("m-host", "host");
        host.has_controls = true;
        host.joined_at = 0;
        store
            .create_room(RoomRow::new("room", "Room", "host", 1_000), host)
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_conditional_write_rejects_older_stamp() {
        let store = seeded().await;
        let newer = RoomPatch::playback(true, 5.0, 2_000);
        assert_eq!(store.write_room("room", newer).await.unwrap(), WriteOutcome::Applied);

        let older = RoomPatch::playback(false, 1.0, 1_500);
        assert_eq!(store.write_room("room", older).await.unwrap(), WriteOutcome::Superseded);
        assert!(store.room("room").unwrap().is_playing);
    }

    #[tokio::test]
    async fn test_change_feed_reports_member_updates() {
        let store = seeded().await;
        let mut feed = store.watch_changes("room");
        store.insert_member(member("m-a", "alice")).await.unwrap();
        store
            .update_members("room", vec!["m-a".into()], MemberPatch::ban())
            .await
            .unwrap();

        assert!(matches!(feed.next().await, Some(StoreChange::MemberInserted(m)) if m.user_id == "alice"));
        match feed.next().await {
            Some(StoreChange::MemberUpdated(m)) => {
                assert!(m.is_banned);
                assert!(!m.has_controls);
            }
            other => panic!("unexpected change: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_members_listed_by_join_order() {
        let store = seeded().await;
        let mut late = member("m-b", "bob");
        late.joined_at = 9;
        store.insert_member(late).await.unwrap();
        store.insert_member(member("m-a", "alice")).await.unwrap();

        let users: Vec<String> = store
            .list_members("room")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.user_id)
            .collect();
        assert_eq!(users, vec!["host", "alice", "bob"]);
    }

    #[tokio::test]
    async fn test_ban_record_survives_member_delete() {
        let store = seeded().await;
        store.insert_member(member("m-a", "alice")).await.unwrap();
        store.record_ban("room", "alice").await.unwrap();
        store.delete_member("m-a");

        assert!(store.member("room", "alice").is_none());
        assert!(store.is_banned("room", "alice").await.unwrap());
        store.clear_ban("room", "alice").await.unwrap();
        assert!(!store.is_banned("room", "alice").await.unwrap());
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = seeded().await;
        store.set_fail_writes(true);
        assert!(store.write_room("room", RoomPatch::position(1.0, 5_000)).await.is_err());
        assert!(store.read_room("room").await.unwrap().is_some());

        store.set_unreachable(true);
        assert!(matches!(store.read_room("room").await, Err(StoreError::Unavailable(_))));
    }
}
