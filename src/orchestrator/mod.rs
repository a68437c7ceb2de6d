//! CacheFirstOrchestrator - Per-request freshness policy
//!
//! ## Responsibilities
//!
//! - Decide, per server, whether to serve the snapshot cache or refresh
//! - Drive the fan-out for the servers that need refreshing
//! - Fall back to a stale cache (tagged) when a required refresh fails
//! - Status probes, cache age and invalidation for the outward API
//!
//! Every request terminates in an AggregateResult: served fresh, refreshed,
//! stale-tagged, or fully enumerated failures. Nothing is left
//! indeterminate and nothing blocks past one bounded fan-out pass.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::Semaphore;

use crate::error::Result;
use crate::fanout::{FanoutAggregator, ServerPayload, DEFAULT_MAX_IN_FLIGHT};
use crate::models::DataKind;
use crate::registry::{ServerDescriptor, ServerRegistry};
use crate::remote_client::{RemoteClient, StatusProbe};
use crate::snapshot_store::{SnapshotOrigin, SnapshotRecord, SnapshotStore};
pub use crate::fanout::AggregateResult;

/// Default age past which a snapshot stops being served without a refresh
pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(300);

/// Whether a (server, kind) cache entry needs refreshing.
///
/// A missing or unknown-age timestamp always leans toward refresh; a cache
/// written at `ts` is fresh for reads strictly before `ts + threshold`.
fn refresh_required(
    timestamp: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    threshold: chrono::Duration,
    force: bool,
) -> bool {
    if force {
        return true;
    }
    match timestamp {
        Some(ts) => now - ts >= threshold,
        None => true,
    }
}

/// Top-level policy component over registry, store, client and fan-out
pub struct CacheFirstOrchestrator {
    registry: Arc<ServerRegistry>,
    store: Arc<SnapshotStore>,
    client: Arc<RemoteClient>,
    fanout: FanoutAggregator,
    freshness: chrono::Duration,
    probe_concurrency: usize,
}

impl CacheFirstOrchestrator {
    pub fn new(
        registry: Arc<ServerRegistry>,
        store: Arc<SnapshotStore>,
        client: Arc<RemoteClient>,
        fanout: FanoutAggregator,
    ) -> Self {
        Self {
            registry,
            store,
            client,
            fanout,
            freshness: chrono::Duration::from_std(DEFAULT_FRESHNESS)
                .unwrap_or_else(|_| chrono::Duration::seconds(300)),
            probe_concurrency: DEFAULT_MAX_IN_FLIGHT,
        }
    }

    pub fn with_freshness(mut self, freshness: Duration) -> Self {
        self.freshness = chrono::Duration::from_std(freshness)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        self
    }

    /// Aggregate one kind across the whole registry, cache-first.
    ///
    /// Servers with a fresh snapshot are served from disk with zero network
    /// calls; the rest go through one bounded fan-out pass. A server whose
    /// refresh fails but which still has an older snapshot is served that
    /// snapshot, tagged stale, rather than erased from the result.
    pub async fn get_aggregate(&self, kind: DataKind, force_refresh: bool) -> AggregateResult {
        let now = Utc::now();

        let mut served_from_cache: Vec<ServerPayload> = Vec::new();
        let mut refresh_servers: Vec<ServerDescriptor> = Vec::new();
        let mut stale_copies: HashMap<String, SnapshotRecord> = HashMap::new();

        for server in self.registry.servers() {
            let timestamp = self.store.timestamp(&server.name, kind).await;

            if !refresh_required(timestamp, now, self.freshness, force_refresh) {
                match self.store.read(&server.name, kind).await {
                    Some(record) => {
                        served_from_cache.push(ServerPayload {
                            server: server.name.clone(),
                            origin: SnapshotOrigin::CachedCopy,
                            generated_at: record.generated_at,
                            stale: false,
                            refresh_error: None,
                            records: record.records,
                        });
                        continue;
                    }
                    // Timestamp looked fresh but the full read failed
                    // (corrupt payload); fall through to a live fetch.
                    None => {}
                }
            } else if let Some(record) = self.store.read(&server.name, kind).await {
                // Keep the outgoing record in memory for the stale-fallback
                // path before a forced refresh deletes it.
                stale_copies.insert(server.name.clone(), record);
            }

            if force_refresh {
                if let Err(e) = self.store.clear(&server.name, kind).await {
                    tracing::warn!(
                        server = %server.name,
                        kind = %kind,
                        error = %e,
                        "Failed to clear snapshot for forced refresh"
                    );
                }
            }

            refresh_servers.push(server.clone());
        }

        let mut result = if refresh_servers.is_empty() {
            tracing::debug!(
                kind = %kind,
                servers = served_from_cache.len(),
                "All snapshots fresh, serving cache without network calls"
            );
            AggregateResult::empty(kind)
        } else {
            let refreshed = self.fanout.refresh(&refresh_servers, kind).await;
            self.apply_stale_fallback(refreshed, &mut stale_copies)
        };

        result.from_cache += served_from_cache
            .iter()
            .map(|p| p.records.len())
            .sum::<usize>();
        result.succeeded.extend(served_from_cache);
        result.generated_at = Utc::now();

        tracing::info!(
            kind = %kind,
            force_refresh,
            succeeded = result.succeeded.len(),
            failed = result.failed.len(),
            fetched = result.fetched,
            from_cache = result.from_cache,
            "Aggregate request completed"
        );

        result
    }

    /// Replace failures that still have an older snapshot with that
    /// snapshot, tagged stale and carrying the refresh error.
    fn apply_stale_fallback(
        &self,
        mut refreshed: AggregateResult,
        stale_copies: &mut HashMap<String, SnapshotRecord>,
    ) -> AggregateResult {
        let mut remaining_failures = Vec::with_capacity(refreshed.failed.len());

        for failure in refreshed.failed.drain(..) {
            match stale_copies.remove(&failure.server) {
                Some(record) => {
                    tracing::warn!(
                        server = %failure.server,
                        error = %failure.message,
                        "Refresh failed, serving stale snapshot"
                    );
                    refreshed.from_cache += record.records.len();
                    refreshed.succeeded.push(ServerPayload {
                        server: failure.server.clone(),
                        origin: SnapshotOrigin::CachedCopy,
                        generated_at: record.generated_at,
                        stale: true,
                        refresh_error: Some(failure.message.clone()),
                        records: record.records,
                    });
                }
                None => remaining_failures.push(failure),
            }
        }

        refreshed.failed = remaining_failures;
        refreshed
    }

    /// Live connectivity + authentication probes for every server, bounded
    /// concurrency, sorted by (region, environment). Never cached.
    pub async fn get_status(&self) -> Vec<StatusProbe> {
        let semaphore = Arc::new(Semaphore::new(self.probe_concurrency));

        let probes = self.registry.servers().iter().map(|server| {
            let semaphore = semaphore.clone();
            let client = self.client.clone();
            async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("probe semaphore closed");
                client.probe_status(server).await
            }
        });

        let mut results = join_all(probes).await;
        results.sort_by(|a, b| {
            (a.region.as_deref(), a.environment.as_deref())
                .cmp(&(b.region.as_deref(), b.environment.as_deref()))
        });
        results
    }

    /// Most recent snapshot generation time across all servers for a kind
    pub async fn get_cache_age(&self, kind: DataKind) -> Option<DateTime<Utc>> {
        let mut latest: Option<DateTime<Utc>> = None;
        for server in self.registry.servers() {
            if let Some(ts) = self.store.timestamp(&server.name, kind).await {
                latest = Some(latest.map_or(ts, |cur| cur.max(ts)));
            }
        }
        latest
    }

    /// Remove every server's snapshot for a kind
    pub async fn invalidate(&self, kind: DataKind) -> Result<()> {
        for server in self.registry.servers() {
            self.store.clear(&server.name, kind).await?;
        }
        tracing::info!(kind = %kind, "Snapshot cache invalidated");
        Ok(())
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_freshness_boundary_is_exact() {
        let threshold = chrono::Duration::seconds(60);
        let written = Utc::now();

        // Strictly inside the window: serve cache
        assert!(!refresh_required(
            Some(written),
            written + chrono::Duration::seconds(59),
            threshold,
            false
        ));
        // Exactly at the boundary: refresh
        assert!(refresh_required(
            Some(written),
            written + chrono::Duration::seconds(60),
            threshold,
            false
        ));
        // Past it: refresh
        assert!(refresh_required(
            Some(written),
            written + chrono::Duration::seconds(61),
            threshold,
            false
        ));
    }

    #[test]
    fn test_unknown_age_leans_refresh() {
        let threshold = chrono::Duration::seconds(60);
        assert!(refresh_required(None, Utc::now(), threshold, false));
    }

    #[test]
    fn test_force_overrides_fresh_cache() {
        let threshold = chrono::Duration::seconds(60);
        let now = Utc::now();
        assert!(refresh_required(Some(now), now, threshold, true));
    }
}
