//! REST Authoritative Store
//!
//! Talks to a PostgREST-style backend (`/rest/v1/{table}`) holding the
//! `rooms`, `room_members` and `room_bans` tables. Room writes are
//! conditional on `last_write_at`. The change feed is a polling task that
//! diffs the room row and member list.

use std::collections::HashMap;
use std::time::Duration;

use futures::channel::mpsc;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{BoxStream, StreamExt};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use super::{AuthoritativeStore, StoreChange, StoreError, WriteOutcome};
use crate::sync::{BanRecord, MemberPatch, MemberRow, RoomPatch, RoomRow};

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RestStoreConfig {
    /// Project URL, e.g. `https://xyz.example.co`
    pub base_url: String,
    /// Public API key sent as `apikey`
    pub api_key: String,
    /// User session token; falls back to the API key
    pub access_token: Option<String>,
    /// Change feed poll period
    pub poll_interval: Duration,
}

/// Client for the REST backend
#[derive(Debug, Clone)]
pub struct RestStore {
    http: Client,
    config: RestStoreConfig,
}

impl RestStore {
    pub fn new(config: RestStoreConfig) -> Result<Self, StoreError> {
        let http = Client::builder()
            .connect_timeout(CONNECTION_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(4)
            .build()?;
        Ok(Self {
            http,
            config: RestStoreConfig {
                base_url: config.base_url.trim_end_matches('/').to_string(),
                ..config
            },
        })
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        let url = format!("{}/rest/v1/{}", self.config.base_url, table);
        let token = self.config.access_token.as_deref().unwrap_or(&self.config.api_key);
        self.http
            .request(method, url)
            .header("apikey", &self.config.api_key)
            .bearer_auth(token)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, StoreError> {
        let resp = request.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                StoreError::Unavailable(e.to_string())
            } else {
                StoreError::Http(e)
            }
        })?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        debug!("Store responded {}: {}", status, body);
        match status.as_u16() {
            401 | 403 => Err(StoreError::Api("Not authorized".to_string())),
            404 => Err(StoreError::NotFound(body)),
            code => Err(StoreError::Api(format!("HTTP {}: {}", code, body))),
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<Vec<T>, StoreError> {
        Ok(self.send(request).await?.json().await?)
    }

    #[instrument(skip(self))]
    async fn get_room(&self, room_id: &str) -> Result<Option<RoomRow>, StoreError> {
        let rows: Vec<RoomRow> = self
            .fetch(
                self.request(Method::GET, "rooms")
                    .query(&[("id", format!("eq.{}", room_id)), ("select", "*".to_string())]),
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn patch_room(&self, room_id: &str, patch: RoomPatch) -> Result<WriteOutcome, StoreError> {
        let rows: Vec<RoomRow> = self
            .fetch(
                self.request(Method::PATCH, "rooms")
                    .query(&[
                        ("id", format!("eq.{}", room_id)),
                        ("last_write_at", format!("lte.{}", patch.last_write_at)),
                    ])
                    .header("Prefer", "return=representation")
                    .json(&patch),
            )
            .await?;
        if rows.is_empty() {
            debug!("Room {} write at {} matched no row", room_id, patch.last_write_at);
            Ok(WriteOutcome::Superseded)
        } else {
            Ok(WriteOutcome::Applied)
        }
    }

    async fn get_members(&self, room_id: &str) -> Result<Vec<MemberRow>, StoreError> {
        self.fetch(self.request(Method::GET, "room_members").query(&[
            ("room_id", format!("eq.{}", room_id)),
            ("order", "joined_at.asc".to_string()),
        ]))
        .await
    }

    async fn get_member(&self, room_id: &str, user_id: &str) -> Result<Option<MemberRow>, StoreError> {
        let rows: Vec<MemberRow> = self
            .fetch(self.request(Method::GET, "room_members").query(&[
                ("room_id", format!("eq.{}", room_id)),
                ("user_id", format!("eq.{}", user_id)),
            ]))
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn post_member(&self, member: MemberRow) -> Result<MemberRow, StoreError> {
        let rows: Vec<MemberRow> = self
            .fetch(
                self.request(Method::POST, "room_members")
                    .header("Prefer", "return=representation")
                    .json(&member),
            )
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StoreError::Api("insert returned no row".to_string()))
    }

    async fn patch_members(&self, room_id: &str, member_ids: Vec<String>, patch: MemberPatch) -> Result<(), StoreError> {
        if member_ids.is_empty() {
            return Ok(());
        }
        self.send(
            self.request(Method::PATCH, "room_members")
                .query(&[
                    ("room_id", format!("eq.{}", room_id)),
                    ("id", format!("in.({})", member_ids.join(","))),
                ])
                .json(&patch.normalized()),
        )
        .await?;
        Ok(())
    }

    async fn post_room(&self, room: RoomRow, host: MemberRow) -> Result<(), StoreError> {
        self.send(self.request(Method::POST, "rooms").json(&room)).await?;
        self.send(self.request(Method::POST, "room_members").json(&host)).await?;
        Ok(())
    }

    async fn has_ban(&self, room_id: &str, user_id: &str) -> Result<bool, StoreError> {
        let rows: Vec<BanRecord> = self
            .fetch(self.request(Method::GET, "room_bans").query(&[
                ("room_id", format!("eq.{}", room_id)),
                ("user_id", format!("eq.{}", user_id)),
            ]))
            .await?;
        Ok(!rows.is_empty())
    }

    async fn upsert_ban(&self, room_id: &str, user_id: &str) -> Result<(), StoreError> {
        let record = BanRecord {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
        };
        self.send(
            self.request(Method::POST, "room_bans")
                .query(&[("on_conflict", "room_id,user_id")])
                .header("Prefer", "resolution=merge-duplicates")
                .json(&record),
        )
        .await?;
        Ok(())
    }

    async fn delete_ban(&self, room_id: &str, user_id: &str) -> Result<(), StoreError> {
        self.send(self.request(Method::DELETE, "room_bans").query(&[
            ("room_id", format!("eq.{}", room_id)),
            ("user_id", format!("eq.{}", user_id)),
        ]))
        .await?;
        Ok(())
    }
}

impl AuthoritativeStore for RestStore {
    fn create_room(&self, room: RoomRow, host: MemberRow) -> BoxFuture<'_, Result<(), StoreError>> {
        self.post_room(room, host).boxed()
    }

    fn read_room<'a>(&'a self, room_id: &'a str) -> BoxFuture<'a, Result<Option<RoomRow>, StoreError>> {
        self.get_room(room_id).boxed()
    }

    fn write_room<'a>(&'a self, room_id: &'a str, patch: RoomPatch) -> BoxFuture<'a, Result<WriteOutcome, StoreError>> {
        self.patch_room(room_id, patch).boxed()
    }

    fn list_members<'a>(&'a self, room_id: &'a str) -> BoxFuture<'a, Result<Vec<MemberRow>, StoreError>> {
        self.get_members(room_id).boxed()
    }

    fn find_member<'a>(
        &'a self,
        room_id: &'a str,
        user_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<MemberRow>, StoreError>> {
        self.get_member(room_id, user_id).boxed()
    }

    fn insert_member(&self, member: MemberRow) -> BoxFuture<'_, Result<MemberRow, StoreError>> {
        self.post_member(member).boxed()
    }

    fn update_members<'a>(
        &'a self,
        room_id: &'a str,
        member_ids: Vec<String>,
        patch: MemberPatch,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        self.patch_members(room_id, member_ids, patch).boxed()
    }

    fn is_banned<'a>(&'a self, room_id: &'a str, user_id: &'a str) -> BoxFuture<'a, Result<bool, StoreError>> {
        self.has_ban(room_id, user_id).boxed()
    }

    fn record_ban<'a>(&'a self, room_id: &'a str, user_id: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        self.upsert_ban(room_id, user_id).boxed()
    }

    fn clear_ban<'a>(&'a self, room_id: &'a str, user_id: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        self.delete_ban(room_id, user_id).boxed()
    }

    fn watch_changes(&self, room_id: &str) -> BoxStream<'static, StoreChange> {
        let (tx, rx) = mpsc::unbounded();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime for the change feed of {}, feed disabled", room_id);
            return rx.boxed();
        };

        let store = self.clone();
        let room_id = room_id.to_string();
        runtime.spawn(async move {
            let mut poller = ChangePoller::default();
            let mut interval = tokio::time::interval(store.config.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if tx.is_closed() {
                    break;
                }
                let room = match store.get_room(&room_id).await {
                    Ok(room) => room,
                    Err(e) => {
                        warn!("Change poll for {} failed: {}", room_id, e);
                        continue;
                    }
                };
                let members = match store.get_members(&room_id).await {
                    Ok(members) => members,
                    Err(e) => {
                        warn!("Change poll for {} failed: {}", room_id, e);
                        continue;
                    }
                };
                for change in poller.diff(room, members) {
                    if tx.unbounded_send(change).is_err() {
                        return;
                    }
                }
            }
            debug!("Change feed for {} stopped", room_id);
        });
        rx.boxed()
    }
}

/// Turns successive polls into change events. The first poll only sets the
/// baseline.
#[derive(Debug, Default)]
struct ChangePoller {
    primed: bool,
    room: Option<RoomRow>,
    members: HashMap<String, MemberRow>,
}

impl ChangePoller {
    fn diff(&mut self, room: Option<RoomRow>, members: Vec<MemberRow>) -> Vec<StoreChange> {
        let members: HashMap<String, MemberRow> = members.into_iter().map(|m| (m.id.clone(), m)).collect();
        if !self.primed {
            self.primed = true;
            self.room = room;
            self.members = members;
            return Vec::new();
        }

        let mut changes = Vec::new();
        if let Some(room) = &room {
            if self.room.as_ref() != Some(room) {
                changes.push(StoreChange::RoomUpdated(room.clone()));
            }
        }
        let mut joined: Vec<&MemberRow> = Vec::new();
        for (id, member) in &members {
            match self.members.get(id) {
                None => joined.push(member),
                Some(previous) if previous != member => changes.push(StoreChange::MemberUpdated(member.clone())),
                Some(_) => {}
            }
        }
        joined.sort_by_key(|m| m.joined_at);
        changes.extend(joined.into_iter().cloned().map(StoreChange::MemberInserted));
        for id in self.members.keys() {
            if !members.contains_key(id) {
                changes.push(StoreChange::MemberDeleted { member_id: id.clone() });
            }
        }

        self.room = room;
        self.members = members;
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str, has_controls: bool) -> MemberRow {
        MemberRow {
            id: id.into(),
            room_id: "room".into(),
            user_id: format!("user-{}", id),
            has_controls,
            is_banned: false,
            joined_at: 0,
        }
    }

    #[test]
    fn test_first_poll_is_baseline() {
        let mut poller = ChangePoller::default();
        let changes = poller.diff(Some(RoomRow::new("room", "Room", "h", 0)), vec![member("a", false)]);
        assert!(changes.is_empty());
    }

    #[test]
    fn test_poll_diff() {
        let mut poller = ChangePoller::default();
        let room = RoomRow::new("room", "Room", "h", 0);
        poller.diff(Some(room.clone()), vec![member("a", false), member("b", false)]);

        let mut moved = room.clone();
        moved.apply(&RoomPatch::playback(true, 3.0, 10));
        let changes = poller.diff(Some(moved.clone()), vec![member("a", true), member("c", false)]);

        assert!(changes.contains(&StoreChange::RoomUpdated(moved)));
        assert!(changes.contains(&StoreChange::MemberUpdated(member("a", true))));
        assert!(changes.contains(&StoreChange::MemberInserted(member("c", false))));
        assert!(changes.contains(&StoreChange::MemberDeleted {
            member_id: "b".into()
        }));
        assert_eq!(changes.len(), 4);
    }

    #[test]
    fn test_new_trims_trailing_slash() {
        let store = RestStore::new(RestStoreConfig {
            base_url: "https://db.example.com/".into(),
            api_key: "key".into(),
            access_token: None,
            poll_interval: Duration::from_secs(2),
        })
        .unwrap();
        assert_eq!(store.config.base_url, "https://db.example.com");
    }
}
