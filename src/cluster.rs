//! Pool and cluster collaborators
//!
//! The connector does not own a pool. It reports back through
//! [`ConnectorSource`] and records what it learns about servers in the shared
//! caches here, which are constructed explicitly and injected so that tests
//! (and separate pools) get isolated instances.

use crate::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::OnceCell;

/// Identifier of one connector, unique within the process
pub type ConnectorId = u64;

static NEXT_CONNECTOR_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_connector_id() -> ConnectorId {
    NEXT_CONNECTOR_ID.fetch_add(1, Ordering::Relaxed)
}

/// Pool-side contract used by the connector
pub trait ConnectorSource: Send + Sync {
    /// The connector is idle again (multiplexing drained, or broken and
    /// ready for eviction bookkeeping)
    fn return_connector(&self, id: ConnectorId);

    /// Purge every pooled connector for this target
    fn clear(&self);
}

/// Observed health of a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClusterState {
    /// Nothing observed yet
    #[default]
    Unknown,
    /// Last observation succeeded
    Online,
    /// Last observation failed with a transient error
    Offline,
}

/// Server health keyed by (host, port)
///
/// Observations carry a timestamp; an observation older than the stored one
/// is discarded, so racing connectors cannot resurrect stale state.
#[derive(Debug, Default)]
pub struct ClusterStateCache {
    states: Mutex<HashMap<(String, u16), (ClusterState, Instant)>>,
}

impl ClusterStateCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of `host:port`
    pub fn get(&self, host: &str, port: u16) -> ClusterState {
        self.lock()
            .get(&(host.to_string(), port))
            .map(|(state, _)| *state)
            .unwrap_or_default()
    }

    /// Record an observation; returns whether it was applied
    pub fn update(&self, host: &str, port: u16, state: ClusterState, observed_at: Instant) -> bool {
        let mut states = self.lock();
        let entry = states
            .entry((host.to_string(), port))
            .or_insert((ClusterState::Unknown, observed_at));
        if entry.0 != ClusterState::Unknown && entry.1 > observed_at {
            return false;
        }
        *entry = (state, observed_at);
        true
    }

    /// Forget every observation
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, u16), (ClusterState, Instant)>> {
        // Entries are plain values, a panic mid-update cannot corrupt them
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Server metadata reported during startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseInfo {
    /// `server_version`
    pub server_version: String,
    /// `integer_datetimes` is on
    pub integer_datetimes: bool,
    /// `standard_conforming_strings` is on
    pub standard_conforming_strings: bool,
    /// `server_encoding`
    pub server_encoding: Option<String>,
}

impl DatabaseInfo {
    /// Build from the ParameterStatus values gathered at startup
    pub fn from_parameters(params: &HashMap<String, String>) -> Self {
        let on = |name: &str| params.get(name).is_some_and(|v| v == "on");
        Self {
            server_version: params.get("server_version").cloned().unwrap_or_default(),
            integer_datetimes: on("integer_datetimes"),
            standard_conforming_strings: on("standard_conforming_strings"),
            server_encoding: params.get("server_encoding").cloned(),
        }
    }

    /// Major version parsed from `server_version`
    pub fn major_version(&self) -> Option<u32> {
        self.server_version
            .split(|c: char| !c.is_ascii_digit())
            .next()
            .and_then(|major| major.parse().ok())
    }
}

/// Cache key for [`DatabaseInfoCache`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatabaseKey {
    /// Host
    pub host: String,
    /// Port
    pub port: u16,
    /// Database
    pub database: String,
}

/// Per-database metadata, loaded at most once per key
#[derive(Debug, Default)]
pub struct DatabaseInfoCache {
    entries: Mutex<HashMap<DatabaseKey, Arc<OnceCell<Arc<DatabaseInfo>>>>>,
}

impl DatabaseInfoCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached metadata, if loaded
    pub fn get(&self, key: &DatabaseKey) -> Option<Arc<DatabaseInfo>> {
        self.cell(key).get().cloned()
    }

    /// Return cached metadata, running `load` if absent
    ///
    /// Concurrent callers for the same key wait for a single load. A failed
    /// load leaves the entry empty so the next caller retries.
    pub async fn get_or_load<F, Fut>(&self, key: &DatabaseKey, load: F) -> Result<Arc<DatabaseInfo>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<DatabaseInfo>>,
    {
        let cell = self.cell(key);
        cell.get_or_try_init(|| async { load().await.map(Arc::new) })
            .await
            .cloned()
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn cell(&self, key: &DatabaseKey) -> Arc<OnceCell<Arc<DatabaseInfo>>> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key.clone())
            .or_default()
            .clone()
    }
}

/// Shared collaborators handed to every connector of one pool
#[derive(Clone, Default)]
pub struct ConnectorContext {
    /// Server health
    pub cluster: Arc<ClusterStateCache>,
    /// Server metadata
    pub databases: Arc<DatabaseInfoCache>,
    /// Owning pool, if any
    pub source: Option<Arc<dyn ConnectorSource>>,
}

impl ConnectorContext {
    /// Context with fresh caches and no pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the owning pool
    pub fn with_source(mut self, source: Arc<dyn ConnectorSource>) -> Self {
        self.source = Some(source);
        self
    }
}

impl std::fmt::Debug for ConnectorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorContext")
            .field("cluster", &self.cluster)
            .field("databases", &self.databases)
            .field("source", &self.source.as_ref().map(|_| "<ConnectorSource>"))
            .finish()
    }
}
