//! Room presence: who is active in which room, refreshed by heartbeats and expired by TTL.
//!
//! Two indexes (`room -> user -> entry` and `user -> rooms`) sit behind one store-wide
//! mutex, so every operation sees and leaves them consistent with each other. Timestamps
//! come from `tokio::time::Instant`, which is monotonic; a wall clock stepping backwards
//! cannot un-expire an entry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::ConfigLoadError;
use crate::models::presence::{PresenceStats, PresenceUser};
use crate::services::sweeper::Sweeper;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// 1.5x the heartbeat interval: one missed heartbeat plus jitter does not flap.
pub const DEFAULT_PRESENCE_TTL: Duration = Duration::from_secs(45);
/// Rough cost of one entry across both indexes, for stats only.
pub const APPROX_ENTRY_BYTES: usize = 200;

const EVICTION_CHANNEL_CAPACITY: usize = 256;

/// Heartbeat interval and TTL. Fixed for the life of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceConfig {
    /// How often clients heartbeat; also the sweep period.
    pub heartbeat_interval: Duration,
    /// Maximum age of `last_seen` before an entry is stale.
    pub ttl: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            ttl: DEFAULT_PRESENCE_TTL,
        }
    }
}

impl PresenceConfig {
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigLoadError::ZeroHeartbeatInterval);
        }
        if self.ttl <= self.heartbeat_interval {
            return Err(ConfigLoadError::TtlNotAboveInterval {
                ttl: self.ttl,
                interval: self.heartbeat_interval,
            });
        }
        Ok(())
    }
}

/// One user's liveness state within one room.
#[derive(Debug, Clone)]
struct PresenceEntry {
    user_id: String,
    display_name: String,
    avatar_url: Option<String>,
    idle: bool,
    last_seen: Instant,
}

impl PresenceEntry {
    fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) < ttl
    }

    fn to_user(&self) -> PresenceUser {
        PresenceUser {
            id: self.user_id.clone(),
            name: self.display_name.clone(),
            avatar: self.avatar_url.clone(),
            idle: self.idle,
        }
    }
}

/// Both indexes. Only touched while holding `PresenceStore::indexes`.
#[derive(Debug, Default)]
struct Indexes {
    rooms: HashMap<String, HashMap<String, PresenceEntry>>,
    users: HashMap<String, HashSet<String>>,
}

impl Indexes {
    /// Remove the (room, user) pair from both indexes, pruning empty containers.
    fn remove_pair(&mut self, room: &str, user: &str) -> bool {
        let removed = match self.rooms.get_mut(room) {
            Some(members) => {
                let removed = members.remove(user).is_some();
                if members.is_empty() {
                    self.rooms.remove(room);
                }
                removed
            }
            None => false,
        };
        self.unlink_user(user, room);
        removed
    }

    fn unlink_user(&mut self, user: &str, room: &str) {
        if let Some(rooms) = self.users.get_mut(user) {
            rooms.remove(room);
            if rooms.is_empty() {
                self.users.remove(user);
            }
        }
    }
}

/// Users removed from one room by a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub room: String,
    pub users: Vec<String>,
}

/// Outcome of one sweep iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evictions: Vec<Eviction>,
    pub rooms_removed: usize,
}

impl SweepReport {
    pub fn entries_removed(&self) -> usize {
        self.evictions.iter().map(|e| e.users.len()).sum()
    }
}

/// Process-wide presence registry. Clone to share; all clones see the same state.
#[derive(Clone)]
pub struct PresenceStore {
    config: PresenceConfig,
    indexes: Arc<Mutex<Indexes>>,
    evictions: broadcast::Sender<Eviction>,
    sweeper: Arc<Mutex<Option<Sweeper>>>,
}

impl Default for PresenceStore {
    fn default() -> Self {
        Self::new(PresenceConfig::default())
    }
}

impl PresenceStore {
    pub fn new(config: PresenceConfig) -> Self {
        let (evictions, _rx) = broadcast::channel(EVICTION_CHANNEL_CAPACITY);
        Self {
            config,
            indexes: Arc::new(Mutex::new(Indexes::default())),
            evictions,
            sweeper: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> PresenceConfig {
        self.config
    }

    /// Insert or replace the entry for (room, user) with `last_seen = now`.
    #[instrument(skip(self, display_name, avatar_url))]
    pub async fn heartbeat(
        &self,
        room: &str,
        user: &str,
        display_name: &str,
        avatar_url: Option<&str>,
        idle: bool,
    ) {
        let mut idx = self.indexes.lock().await;
        let entry = PresenceEntry {
            user_id: user.to_string(),
            display_name: display_name.to_string(),
            avatar_url: avatar_url.map(str::to_string),
            idle,
            last_seen: Instant::now(),
        };
        idx.rooms
            .entry(room.to_string())
            .or_default()
            .insert(user.to_string(), entry);
        idx.users
            .entry(user.to_string())
            .or_default()
            .insert(room.to_string());
        debug!(room = %room, user_id = %user, "heartbeat");
    }

    /// Remove the (room, user) entry. Absent pairs are a no-op.
    #[instrument(skip(self))]
    pub async fn leave(&self, room: &str, user: &str) {
        let removed = self.indexes.lock().await.remove_pair(room, user);
        if removed {
            info!(room = %room, user_id = %user, "left room");
        }
    }

    /// Remove the user from every room they occupy; returns the rooms they were removed from.
    #[instrument(skip(self))]
    pub async fn leave_all(&self, user: &str) -> Vec<String> {
        let mut idx = self.indexes.lock().await;
        let rooms: Vec<String> = idx
            .users
            .remove(user)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for room in &rooms {
            if let Some(members) = idx.rooms.get_mut(room) {
                members.remove(user);
                if members.is_empty() {
                    idx.rooms.remove(room);
                }
            }
        }
        drop(idx);
        if !rooms.is_empty() {
            info!(user_id = %user, rooms = rooms.len(), "left all rooms");
        }
        rooms
    }

    /// Snapshot of non-stale entries in the room, whether or not a sweep has run. Unordered.
    pub async fn get_presence(&self, room: &str) -> Vec<PresenceUser> {
        let now = Instant::now();
        let idx = self.indexes.lock().await;
        idx.rooms
            .get(room)
            .map(|members| {
                members
                    .values()
                    .filter(|e| e.is_fresh(now, self.config.ttl))
                    .map(PresenceEntry::to_user)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Raw room membership; not filtered by staleness.
    pub async fn get_user_rooms(&self, user: &str) -> Vec<String> {
        let idx = self.indexes.lock().await;
        idx.users
            .get(user)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The user's entry in the room, if present and not stale.
    pub async fn member(&self, room: &str, user: &str) -> Option<PresenceUser> {
        let now = Instant::now();
        let idx = self.indexes.lock().await;
        idx.rooms
            .get(room)
            .and_then(|members| members.get(user))
            .filter(|e| e.is_fresh(now, self.config.ttl))
            .map(PresenceEntry::to_user)
    }

    pub async fn is_present(&self, room: &str, user: &str) -> bool {
        let now = Instant::now();
        let idx = self.indexes.lock().await;
        idx.rooms
            .get(room)
            .and_then(|members| members.get(user))
            .map(|e| e.is_fresh(now, self.config.ttl))
            .unwrap_or(false)
    }

    pub async fn get_stats(&self) -> PresenceStats {
        let idx = self.indexes.lock().await;
        let total_entries: usize = idx.rooms.values().map(HashMap::len).sum();
        PresenceStats {
            total_users: idx.users.len(),
            total_rooms: idx.rooms.len(),
            total_entries,
            approx_memory_bytes: total_entries * APPROX_ENTRY_BYTES,
        }
    }

    /// Evict every entry whose `last_seen` is older than the TTL. One sweep iteration.
    pub async fn sweep_once(&self) -> SweepReport {
        let now = Instant::now();
        let ttl = self.config.ttl;
        let mut report = SweepReport::default();

        let mut idx = self.indexes.lock().await;
        let Indexes { rooms, users } = &mut *idx;
        rooms.retain(|room, members| {
            let mut evicted = Vec::new();
            members.retain(|user, entry| {
                let fresh = entry.is_fresh(now, ttl);
                if !fresh {
                    evicted.push(user.clone());
                }
                fresh
            });
            for user in &evicted {
                if let Some(user_rooms) = users.get_mut(user) {
                    user_rooms.remove(room);
                    if user_rooms.is_empty() {
                        users.remove(user);
                    }
                }
            }
            if !evicted.is_empty() {
                report.evictions.push(Eviction {
                    room: room.clone(),
                    users: evicted,
                });
            }
            let keep = !members.is_empty();
            if !keep {
                report.rooms_removed += 1;
            }
            keep
        });
        drop(idx);

        for eviction in &report.evictions {
            // No subscribers is fine.
            let _ = self.evictions.send(eviction.clone());
        }
        if !report.evictions.is_empty() {
            info!(
                entries = report.entries_removed(),
                rooms_removed = report.rooms_removed,
                "swept stale presence"
            );
        }
        report
    }

    /// Receive one `Eviction` per room touched by each sweep.
    pub fn subscribe_evictions(&self) -> broadcast::Receiver<Eviction> {
        self.evictions.subscribe()
    }

    /// Start the background sweep. Calling it while already running does nothing.
    pub async fn start(&self) {
        let mut slot = self.sweeper.lock().await;
        if slot.is_some() {
            warn!("presence sweeper already running");
            return;
        }
        let store = self.clone();
        *slot = Some(Sweeper::spawn(self.config.heartbeat_interval, move || {
            let store = store.clone();
            async move { store.sweep_once().await }.boxed()
        }));
    }

    /// Stop the background sweep, waiting for an in-flight iteration to finish.
    pub async fn stop(&self) {
        let sweeper = self.sweeper.lock().await.take();
        if let Some(sweeper) = sweeper {
            sweeper.shutdown().await;
        }
    }

    pub async fn is_running(&self) -> bool {
        self.sweeper.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = DEFAULT_PRESENCE_TTL;

    /// Cross-index symmetry and no empty containers.
    async fn assert_consistent(store: &PresenceStore) {
        let idx = store.indexes.lock().await;
        for (room, members) in &idx.rooms {
            assert!(!members.is_empty(), "room {room} left empty");
            for user in members.keys() {
                assert!(
                    idx.users.get(user).is_some_and(|r| r.contains(room)),
                    "{user} in {room} but not indexed back"
                );
            }
        }
        for (user, rooms) in &idx.users {
            assert!(!rooms.is_empty(), "user {user} left with no rooms");
            for room in rooms {
                assert!(
                    idx.rooms.get(room).is_some_and(|m| m.contains_key(user)),
                    "{room} listed for {user} but has no entry"
                );
            }
        }
    }

    fn sorted(mut v: Vec<String>) -> Vec<String> {
        v.sort();
        v
    }

    #[test]
    fn config_requires_ttl_above_interval() {
        assert!(PresenceConfig::default().validate().is_ok());
        let equal = PresenceConfig {
            heartbeat_interval: Duration::from_secs(30),
            ttl: Duration::from_secs(30),
        };
        assert!(matches!(
            equal.validate(),
            Err(ConfigLoadError::TtlNotAboveInterval { .. })
        ));
        let zero = PresenceConfig {
            heartbeat_interval: Duration::ZERO,
            ttl: Duration::from_secs(1),
        };
        assert!(matches!(
            zero.validate(),
            Err(ConfigLoadError::ZeroHeartbeatInterval)
        ));
    }

    #[tokio::test]
    async fn heartbeat_registers_both_indexes() {
        let store = PresenceStore::default();
        store
            .heartbeat("room1", "alice", "Alice", Some("https://a.example/a.png"), false)
            .await;

        let presence = store.get_presence("room1").await;
        assert_eq!(
            presence,
            vec![PresenceUser {
                id: "alice".to_string(),
                name: "Alice".to_string(),
                avatar: Some("https://a.example/a.png".to_string()),
                idle: false,
            }]
        );
        assert_eq!(store.get_user_rooms("alice").await, vec!["room1".to_string()]);
        assert!(store.is_present("room1", "alice").await);
        assert_consistent(&store).await;
    }

    #[tokio::test]
    async fn repeated_heartbeat_is_idempotent() {
        let store = PresenceStore::default();
        for _ in 0..3 {
            store.heartbeat("room1", "alice", "Alice", None, false).await;
        }
        let stats = store.get_stats().await;
        assert_eq!(stats.total_entries, 1);
        assert_eq!(stats.total_rooms, 1);
        assert_eq!(stats.total_users, 1);
        assert_eq!(store.get_presence("room1").await.len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_replaces_fields() {
        let store = PresenceStore::default();
        store.heartbeat("room1", "alice", "Alice", None, false).await;
        store.heartbeat("room1", "alice", "Alice B.", None, true).await;
        let presence = store.get_presence("room1").await;
        assert_eq!(presence.len(), 1);
        assert_eq!(presence[0].name, "Alice B.");
        assert!(presence[0].idle);
    }

    #[tokio::test]
    async fn leave_prunes_empty_containers() {
        let store = PresenceStore::default();
        store.heartbeat("room1", "alice", "Alice", None, false).await;
        store.heartbeat("room1", "bob", "Bob", None, false).await;

        store.leave("room1", "alice").await;
        assert!(!store.is_present("room1", "alice").await);
        assert!(store.get_user_rooms("alice").await.is_empty());
        assert_eq!(store.get_stats().await.total_rooms, 1);

        store.leave("room1", "bob").await;
        let stats = store.get_stats().await;
        assert_eq!(stats, PresenceStats::default());
        assert_consistent(&store).await;
    }

    #[tokio::test]
    async fn leave_absent_pair_is_noop() {
        let store = PresenceStore::default();
        store.leave("nowhere", "nobody").await;
        store.heartbeat("room1", "alice", "Alice", None, false).await;
        store.leave("room2", "alice").await;
        store.leave("room1", "bob").await;
        assert!(store.is_present("room1", "alice").await);
        assert_eq!(store.get_user_rooms("alice").await, vec!["room1".to_string()]);
        assert_consistent(&store).await;
    }

    #[tokio::test]
    async fn leave_all_returns_every_room() {
        let store = PresenceStore::default();
        store.heartbeat("r1", "u", "U", None, false).await;
        store.heartbeat("r2", "u", "U", None, false).await;
        store.heartbeat("r2", "v", "V", None, false).await;

        let left = sorted(store.leave_all("u").await);
        assert_eq!(left, vec!["r1".to_string(), "r2".to_string()]);
        assert!(store.get_user_rooms("u").await.is_empty());
        assert!(store.get_presence("r1").await.is_empty());
        assert!(store.get_presence("r2").await.iter().all(|p| p.id != "u"));
        assert_eq!(store.get_stats().await.total_rooms, 1);
        assert!(store.leave_all("u").await.is_empty());
        assert_consistent(&store).await;
    }

    #[tokio::test]
    async fn stats_count_users_rooms_entries() {
        let store = PresenceStore::default();
        store.heartbeat("r1", "a", "A", None, false).await;
        store.heartbeat("r1", "b", "B", None, false).await;
        store.heartbeat("r2", "c", "C", None, false).await;

        let stats = store.get_stats().await;
        assert_eq!(stats.total_rooms, 2);
        assert_eq!(stats.total_users, 3);
        assert_eq!(stats.total_entries, 3);
        assert_eq!(stats.approx_memory_bytes, 3 * APPROX_ENTRY_BYTES);
    }

    #[tokio::test(start_paused = true)]
    async fn presence_expires_at_ttl() {
        let store = PresenceStore::default();
        store.heartbeat("room1", "alice", "Alice", None, false).await;

        tokio::time::advance(TTL - Duration::from_millis(1)).await;
        assert!(store.is_present("room1", "alice").await);
        assert_eq!(store.get_presence("room1").await.len(), 1);

        tokio::time::advance(Duration::from_millis(2)).await;
        assert!(!store.is_present("room1", "alice").await);
        assert!(store.get_presence("room1").await.is_empty());
        // Membership is raw until a sweep or leave removes it.
        assert_eq!(store.get_user_rooms("alice").await, vec!["room1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_resets_last_seen() {
        let store = PresenceStore::default();
        store.heartbeat("room1", "alice", "Alice", None, false).await;
        tokio::time::advance(Duration::from_secs(40)).await;
        store.heartbeat("room1", "alice", "Alice", None, true).await;
        tokio::time::advance(Duration::from_secs(40)).await;
        assert!(store.is_present("room1", "alice").await);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_stale_without_leave() {
        let store = PresenceStore::default();
        let mut evictions = store.subscribe_evictions();
        store.heartbeat("room42", "bob", "Bob", None, false).await;
        store.heartbeat("lobby", "bob", "Bob", None, false).await;

        tokio::time::advance(Duration::from_secs(20)).await;
        store.heartbeat("lobby", "carol", "Carol", None, false).await;
        tokio::time::advance(Duration::from_secs(30)).await;

        let report = store.sweep_once().await;
        assert_eq!(report.entries_removed(), 2);
        assert_eq!(report.rooms_removed, 1);

        assert!(store.get_presence("room42").await.is_empty());
        assert!(store.get_user_rooms("bob").await.is_empty());
        let stats = store.get_stats().await;
        assert_eq!(stats.total_rooms, 1);
        assert_eq!(stats.total_entries, 1);
        assert!(store.is_present("lobby", "carol").await);
        assert_consistent(&store).await;

        let mut rooms = vec![
            evictions.recv().await.unwrap().room,
            evictions.recv().await.unwrap().room,
        ];
        rooms.sort();
        assert_eq!(rooms, vec!["lobby".to_string(), "room42".to_string()]);
    }

    #[tokio::test]
    async fn sweep_keeps_fresh_entries() {
        let store = PresenceStore::default();
        store.heartbeat("r", "u", "U", None, false).await;
        let report = store.sweep_once().await;
        assert_eq!(report, SweepReport::default());
        assert!(store.is_present("r", "u").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_heartbeat_and_leave_stay_consistent() {
        let store = PresenceStore::default();
        let mut tasks = Vec::new();
        for i in 0..200 {
            let store = store.clone();
            let user = format!("u{}", i % 5);
            let room = format!("r{}", i % 3);
            tasks.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    store.heartbeat(&room, &user, &user, None, false).await;
                } else {
                    store.leave(&room, &user).await;
                }
                if i % 17 == 0 {
                    store.leave_all(&user).await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_consistent(&store).await;

        for u in 0..5 {
            let user = format!("u{}", u);
            let rooms = store.get_user_rooms(&user).await;
            for r in 0..3 {
                let room = format!("r{}", r);
                assert_eq!(
                    rooms.contains(&room),
                    store.is_present(&room, &user).await,
                    "{user}/{room} asymmetric"
                );
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn member_skips_stale_entries() {
        let store = PresenceStore::default();
        assert!(store.member("r", "u").await.is_none());
        store.heartbeat("r", "u", "U", None, true).await;
        assert_eq!(store.member("r", "u").await.map(|m| m.idle), Some(true));
        tokio::time::advance(TTL).await;
        assert!(store.member("r", "u").await.is_none());
    }

    #[tokio::test]
    async fn clones_share_state() {
        let store = PresenceStore::default();
        let other = store.clone();
        store.heartbeat("r", "u", "U", None, false).await;
        assert!(other.is_present("r", "u").await);
    }
}
