//! In-process loopback transport
//!
//! Every `LoopbackTransport` created from one `LoopbackHub` can reach the
//! others. The hub can drop traffic to a given endpoint on a given channel
//! and keeps a log of everything published.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::channel::mpsc;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use tracing::debug;

use super::{topic_name, BroadcastTransport, TransportError};
use crate::sync::Channel;

/// One entry of the publish log
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub from: String,
    pub room_id: String,
    pub channel: Channel,
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct HubInner {
    /// topic -> (endpoint, sender)
    subscribers: HashMap<String, Vec<(String, mpsc::UnboundedSender<Vec<u8>>)>>,
    /// (endpoint, channel) pairs whose deliveries are dropped
    drops: HashSet<(String, Channel)>,
    log: Vec<Published>,
}

#[derive(Clone, Default)]
pub struct LoopbackHub {
    inner: Arc<Mutex<HubInner>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport endpoint named `endpoint` (usually the user id)
    pub fn endpoint(&self, endpoint: impl Into<String>) -> LoopbackTransport {
        LoopbackTransport {
            endpoint: endpoint.into(),
            hub: self.clone(),
        }
    }

    /// Drop (or stop dropping) deliveries to `endpoint` on `channel`
    pub fn set_drop(&self, endpoint: &str, channel: Channel, drop: bool) {
        let mut inner = self.inner.lock();
        let key = (endpoint.to_string(), channel);
        if drop {
            inner.drops.insert(key);
        } else {
            inner.drops.remove(&key);
        }
    }

    /// Everything published on `channel` so far
    pub fn published(&self, channel: Channel) -> Vec<Published> {
        self.inner
            .lock()
            .log
            .iter()
            .filter(|p| p.channel == channel)
            .cloned()
            .collect()
    }

    pub fn clear_log(&self) {
        self.inner.lock().log.clear();
    }

    pub fn subscriber_count(&self, room_id: &str, channel: Channel) -> usize {
        self.inner
            .lock()
            .subscribers
            .get(&topic_name(room_id, channel))
            .map(Vec::len)
            .unwrap_or(0)
    }
}

pub struct LoopbackTransport {
    endpoint: String,
    hub: LoopbackHub,
}

impl BroadcastTransport for LoopbackTransport {
    fn publish(&self, room_id: &str, channel: Channel, payload: Vec<u8>) -> Result<(), TransportError> {
        let mut inner = self.hub.inner.lock();
        inner.log.push(Published {
            from: self.endpoint.clone(),
            room_id: room_id.to_string(),
            channel,
            payload: payload.clone(),
        });

        let topic = topic_name(room_id, channel);
        let HubInner { subscribers, drops, .. } = &mut *inner;
        if let Some(subs) = subscribers.get_mut(&topic) {
            subs.retain(|(endpoint, tx)| {
                if *endpoint == self.endpoint {
                    return true;
                }
                if drops.contains(&(endpoint.clone(), channel)) {
                    debug!("Dropping {} delivery to {}", channel.name(), endpoint);
                    return true;
                }
                tx.unbounded_send(payload.clone()).is_ok()
            });
        }
        Ok(())
    }

    fn subscribe(&self, room_id: &str, channel: Channel) -> Result<BoxStream<'static, Vec<u8>>, TransportError> {
        let (tx, rx) = mpsc::unbounded();
        let mut inner = self.hub.inner.lock();
        let subs = inner.subscribers.entry(topic_name(room_id, channel)).or_default();
        subs.retain(|(endpoint, _)| *endpoint != self.endpoint);
        subs.push((self.endpoint.clone(), tx));
        Ok(rx.boxed())
    }

    fn unsubscribe(&self, room_id: &str, channel: Channel) {
        let mut inner = self.hub.inner.lock();
        if let Some(subs) = inner.subscribers.get_mut(&topic_name(room_id, channel)) {
            subs.retain(|(endpoint, _)| *endpoint != self.endpoint);
        }
    }
}
