//! Per-user sessions — lifecycle, multi-step command state, expiry sweep.
//!
//! Sessions live in memory only. A session is created by the public `/bot`
//! command, refreshed by every valid private command, and removed by the
//! periodic sweep once idle past the TTL. All access goes through one lock
//! so command handling never observes a session the sweep is deleting.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

/// A resolved location cached for weather defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
    pub label: String,
}

/// An email being composed across two messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailDraft {
    pub recipient: String,
    pub subject: String,
    /// Id of the record being replied to, when this draft is a reply.
    pub in_reply_to: Option<String>,
}

/// The state-machine slot for multi-step command flows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PendingState {
    #[default]
    Idle,
    /// `/email` was issued; the next free-form message is the body.
    AwaitingEmailBody(EmailDraft),
}

/// One user's private interaction with the bot.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: u32,
    /// Gateway the user was last heard through; downlinks go back this way.
    pub gateway: String,
    pub channel: u32,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub pending: PendingState,
    pub cached_location: Option<GeoPoint>,
}

impl Session {
    fn new(user_id: u32, gateway: &str, channel: u32, now: Instant) -> Self {
        Self {
            user_id,
            gateway: gateway.to_string(),
            channel,
            created_at: now,
            last_activity: now,
            pending: PendingState::Idle,
            cached_location: None,
        }
    }

    /// Idle past the TTL — logically dead even before the sweep runs.
    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > ttl
    }
}

/// Owns all sessions. Every read-modify-write is serialized behind one lock.
pub struct SessionStore {
    ttl: Duration,
    inner: Mutex<HashMap<u32, Session>>,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Look up a live session without refreshing it.
    pub fn get(&self, user_id: u32) -> Option<Session> {
        let now = Instant::now();
        let map = self.inner.lock().unwrap();
        map.get(&user_id)
            .filter(|s| !s.is_expired(now, self.ttl))
            .cloned()
    }

    /// Create a session, or refresh it if one exists. Used on `/bot` only.
    pub fn create_or_refresh(&self, user_id: u32, gateway: &str, channel: u32) -> Session {
        let now = Instant::now();
        let mut map = self.inner.lock().unwrap();
        let session = map
            .entry(user_id)
            .and_modify(|s| {
                s.last_activity = now;
                s.gateway = gateway.to_string();
                s.channel = channel;
            })
            .or_insert_with(|| {
                tracing::info!(user_id, "session created");
                Session::new(user_id, gateway, channel, now)
            });
        session.clone()
    }

    /// Refresh an existing live session. Returns `None` when the user has no
    /// live session — the caller must treat that as "not authorized for
    /// private commands". Never creates.
    pub fn touch(&self, user_id: u32, gateway: &str, channel: u32) -> Option<Session> {
        let now = Instant::now();
        let mut map = self.inner.lock().unwrap();
        let session = map.get_mut(&user_id)?;
        if session.is_expired(now, self.ttl) {
            return None;
        }
        session.last_activity = now;
        session.gateway = gateway.to_string();
        session.channel = channel;
        Some(session.clone())
    }

    pub fn set_pending(&self, user_id: u32, state: PendingState) {
        if let Some(s) = self.inner.lock().unwrap().get_mut(&user_id) {
            s.pending = state;
        }
    }

    pub fn clear_pending(&self, user_id: u32) {
        self.set_pending(user_id, PendingState::Idle);
    }

    pub fn cache_location(&self, user_id: u32, location: GeoPoint) {
        if let Some(s) = self.inner.lock().unwrap().get_mut(&user_id) {
            s.cached_location = Some(location);
        }
    }

    pub fn cached_location(&self, user_id: u32) -> Option<GeoPoint> {
        self.inner
            .lock()
            .unwrap()
            .get(&user_id)
            .and_then(|s| s.cached_location.clone())
    }

    pub fn clear_cached_location(&self, user_id: u32) {
        if let Some(s) = self.inner.lock().unwrap().get_mut(&user_id) {
            s.cached_location = None;
        }
    }

    /// Remove every session idle past the TTL as of `now`. Returns the
    /// number removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut map = self.inner.lock().unwrap();
        let before = map.len();
        map.retain(|_, s| !s.is_expired(now, self.ttl));
        before - map.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Spawn the periodic expiry sweep. Runs independently of request traffic.
pub fn spawn_sweep_task(store: Arc<SessionStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.tick().await; // first tick fires immediately; skip it
        loop {
            tick.tick().await;
            let removed = store.sweep(Instant::now());
            if removed > 0 {
                tracing::info!(removed, "swept expired sessions");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const GW: &str = "!a1b2c3d4";

    fn store_with_ttl(secs: u64) -> SessionStore {
        SessionStore::new(Duration::from_secs(secs))
    }

    #[test]
    fn create_then_get() {
        let store = store_with_ttl(3600);
        store.create_or_refresh(1, GW, 0);
        let s = store.get(1).unwrap();
        assert_eq!(s.user_id, 1);
        assert_eq!(s.pending, PendingState::Idle);
        assert_eq!(s.gateway, GW);
    }

    #[test]
    fn get_never_creates() {
        let store = store_with_ttl(3600);
        assert!(store.get(42).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn touch_refreshes_existing_only() {
        let store = store_with_ttl(3600);
        assert!(store.touch(1, GW, 0).is_none());
        assert!(store.is_empty());

        store.create_or_refresh(1, GW, 0);
        let touched = store.touch(1, "!deadbeef", 2).unwrap();
        assert_eq!(touched.gateway, "!deadbeef");
        assert_eq!(touched.channel, 2);
    }

    #[test]
    fn create_or_refresh_keeps_creation_time() {
        let store = store_with_ttl(3600);
        let first = store.create_or_refresh(1, GW, 0);
        let second = store.create_or_refresh(1, GW, 0);
        assert_eq!(first.created_at, second.created_at);
        assert!(second.last_activity >= first.last_activity);
    }

    #[test]
    fn sweep_removes_only_expired() {
        let store = store_with_ttl(10);
        store.create_or_refresh(1, GW, 0);
        store.create_or_refresh(2, GW, 0);

        // Nothing is expired right now.
        assert_eq!(store.sweep(Instant::now()), 0);
        assert_eq!(store.len(), 2);

        // Past the TTL everything goes.
        let later = Instant::now() + Duration::from_secs(11);
        assert_eq!(store.sweep(later), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn expired_session_is_dead_before_sweep() {
        let store = SessionStore::new(Duration::ZERO);
        store.create_or_refresh(1, GW, 0);
        std::thread::sleep(Duration::from_millis(5));
        assert!(store.get(1).is_none());
        assert!(store.touch(1, GW, 0).is_none());
        // Still physically present until the sweep runs.
        assert_eq!(store.len(), 1);
        assert_eq!(store.sweep(Instant::now()), 1);
    }

    #[test]
    fn pending_state_transitions() {
        let store = store_with_ttl(3600);
        store.create_or_refresh(1, GW, 0);

        let draft = EmailDraft {
            recipient: "bob@example.com".into(),
            subject: "Hello".into(),
            in_reply_to: None,
        };
        store.set_pending(1, PendingState::AwaitingEmailBody(draft.clone()));
        assert_eq!(
            store.get(1).unwrap().pending,
            PendingState::AwaitingEmailBody(draft)
        );

        store.clear_pending(1);
        assert_eq!(store.get(1).unwrap().pending, PendingState::Idle);
    }

    #[test]
    fn cached_location_roundtrip() {
        let store = store_with_ttl(3600);
        store.create_or_refresh(1, GW, 0);

        let point = GeoPoint {
            lat: 42.7,
            lon: 23.3,
            label: "Sofia, BG".into(),
        };
        store.cache_location(1, point.clone());
        assert_eq!(store.cached_location(1), Some(point));

        store.clear_cached_location(1);
        assert_eq!(store.cached_location(1), None);
    }
}
