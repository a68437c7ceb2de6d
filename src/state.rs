//! Application state
//!
//! Holds all shared components and state

use std::path::PathBuf;
use std::sync::Arc;

use crate::orchestrator::CacheFirstOrchestrator;
use crate::registry::ServerRegistry;
use crate::remote_client::RemoteClient;
use crate::snapshot_store::SnapshotStore;

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Path to the server list JSON document
    pub servers_file: PathBuf,
    /// Snapshot cache root directory
    pub cache_dir: PathBuf,
    /// Server port
    pub port: u16,
    /// Server host
    pub host: String,
    /// Snapshot age (seconds) past which a refresh is required
    pub freshness_secs: u64,
    /// Deadline (seconds) for one whole fan-out pass
    pub fanout_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            servers_file: std::env::var("SERVERS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("list-opsmanager-all.json")),
            cache_dir: std::env::var("CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("cache")),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            freshness_secs: std::env::var("FRESHNESS_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
            fanout_timeout_secs: std::env::var("FANOUT_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(120),
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Application config
    pub config: AppConfig,
    /// Read-only server registry
    pub registry: Arc<ServerRegistry>,
    /// Snapshot cache
    pub store: Arc<SnapshotStore>,
    /// Management API client
    pub client: Arc<RemoteClient>,
    /// Cache-first aggregation policy
    pub orchestrator: Arc<CacheFirstOrchestrator>,
}
