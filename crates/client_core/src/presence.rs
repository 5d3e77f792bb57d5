use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use chrono::{DateTime, Utc};
use reqwest::Client;
use shared::{
    domain::UserId,
    protocol::{PresenceResponse, PresenceStatus},
};
use tokio::{
    sync::{broadcast, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::warn;

use crate::ClientEvent;

pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(10);

/// Online/last-seen state for a friend. Refreshed from the server, never
/// derived from message traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Online,
    Offline { last_seen: Option<DateTime<Utc>> },
}

impl From<PresenceResponse> for Presence {
    fn from(response: PresenceResponse) -> Self {
        match response.status {
            PresenceStatus::Online => Presence::Online,
            PresenceStatus::Offline => Presence::Offline {
                last_seen: response.last_seen,
            },
        }
    }
}

struct ActiveWatch {
    task: JoinHandle<()>,
}

/// Polls and caches presence for a set of friends. At most one watch task
/// exists; a new watch replaces the previous one instead of stacking timers.
pub struct PresenceTracker {
    http: Client,
    base_url: String,
    cache: RwLock<HashMap<UserId, Presence>>,
    watch: Mutex<Option<ActiveWatch>>,
    events: broadcast::Sender<ClientEvent>,
}

impl PresenceTracker {
    pub fn new(
        http: Client,
        base_url: impl Into<String>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            http,
            base_url: base_url.into(),
            cache: RwLock::new(HashMap::new()),
            watch: Mutex::new(None),
            events,
        })
    }

    pub async fn presence(&self, friend_id: UserId) -> Option<Presence> {
        self.cache.read().await.get(&friend_id).copied()
    }

    /// Single fetch; the cached value is overwritten on every refresh.
    pub async fn refresh(&self, friend_id: UserId) -> Result<Presence> {
        let response: PresenceResponse = self
            .http
            .get(format!("{}/api/last_seen", self.base_url))
            .query(&[("friend_id", friend_id.0)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let presence = Presence::from(response);
        self.cache.write().await.insert(friend_id, presence);
        let _ = self.events.send(ClientEvent::PresenceUpdated {
            friend_id,
            presence,
        });
        Ok(presence)
    }

    /// Refreshes every id on a fixed cadence until replaced or stopped. A
    /// failed refresh logs and moves on; the loop never dies on a bad tick.
    pub async fn watch(self: &Arc<Self>, friend_ids: Vec<UserId>, interval: Duration) {
        let tracker = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                for friend_id in &friend_ids {
                    if let Err(err) = tracker.refresh(*friend_id).await {
                        warn!(friend_id = friend_id.0, "presence: refresh failed: {err}");
                    }
                }
            }
        });

        let previous = self.watch.lock().await.replace(ActiveWatch { task });
        if let Some(previous) = previous {
            previous.task.abort();
        }
    }

    pub async fn stop(&self) {
        if let Some(active) = self.watch.lock().await.take() {
            active.task.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
