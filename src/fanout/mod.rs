//! FanoutAggregator - Bounded parallel fetch across the fleet
//!
//! ## Responsibilities
//!
//! - One fetch task per server, concurrency capped by a semaphore
//! - Wait for every task to reach a terminal state, bounded by a deadline
//! - Persist each success through the SnapshotStore before returning
//! - Merge partial successes and typed failures into one AggregateResult
//!
//! Tasks are independent: one server's failure never aborts or delays the
//! others. A task abandoned at the deadline is aborted and recorded as a
//! timeout failure; the run-liveness flag keeps an aborted task from
//! committing a late cache write.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::models::DataKind;
use crate::registry::ServerDescriptor;
use crate::remote_client::{FetchError, FetchErrorKind, RemoteClient};
use crate::snapshot_store::{SnapshotOrigin, SnapshotStore};

/// Ceiling on simultaneous outbound fetches. Server count can exceed what
/// should be opened as concurrent HTTPS connections at once.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 10;

/// Default deadline for one whole fan-out pass
pub const DEFAULT_FANOUT_TIMEOUT: Duration = Duration::from_secs(120);

/// Successful per-server slice of an aggregate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerPayload {
    pub server: String,
    pub origin: SnapshotOrigin,
    /// When this slice's data was generated; `None` for legacy cache files
    pub generated_at: Option<DateTime<Utc>>,
    /// True when this slice is a stale cache served because a required
    /// refresh failed
    pub stale: bool,
    /// The refresh failure that forced the stale fallback, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_error: Option<String>,
    pub records: Vec<Map<String, Value>>,
}

/// Failed per-server slice of an aggregate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchFailure {
    pub server: String,
    pub kind: FetchErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub at: DateTime<Utc>,
}

impl FetchFailure {
    fn new(server: &str, error: FetchError) -> Self {
        Self {
            server: server.to_string(),
            kind: error.kind,
            message: error.message,
            status_code: error.status_code,
            at: Utc::now(),
        }
    }
}

/// Union of per-server outcomes for one data kind. Every requested server
/// appears exactly once, in `succeeded` or in `failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateResult {
    pub kind: DataKind,
    pub generated_at: DateTime<Utc>,
    pub succeeded: Vec<ServerPayload>,
    pub failed: Vec<FetchFailure>,
    /// Records fetched live in this pass
    pub fetched: usize,
    /// Records served from cache in this pass
    pub from_cache: usize,
}

impl AggregateResult {
    pub fn empty(kind: DataKind) -> Self {
        Self {
            kind,
            generated_at: Utc::now(),
            succeeded: Vec::new(),
            failed: Vec::new(),
            fetched: 0,
            from_cache: 0,
        }
    }

    /// Number of servers represented in this result
    pub fn server_count(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

/// Bounded worker pool over RemoteClient fetches
pub struct FanoutAggregator {
    client: Arc<RemoteClient>,
    store: Arc<SnapshotStore>,
    max_in_flight: usize,
    fanout_timeout: Duration,
}

impl FanoutAggregator {
    pub fn new(client: Arc<RemoteClient>, store: Arc<SnapshotStore>) -> Self {
        Self {
            client,
            store,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            fanout_timeout: DEFAULT_FANOUT_TIMEOUT,
        }
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    pub fn with_fanout_timeout(mut self, timeout: Duration) -> Self {
        self.fanout_timeout = timeout;
        self
    }

    /// Fetch one kind from every given server in parallel.
    ///
    /// Successes are written through the SnapshotStore before this returns,
    /// so a subsequent cache-first read sees the fresh data. Failures never
    /// touch existing cache entries: stale-but-present beats erased.
    pub async fn refresh(
        &self,
        servers: &[ServerDescriptor],
        kind: DataKind,
    ) -> AggregateResult {
        let mut result = AggregateResult::empty(kind);
        if servers.is_empty() {
            return result;
        }

        tracing::info!(
            kind = %kind,
            servers = servers.len(),
            max_in_flight = self.max_in_flight,
            "Starting fan-out refresh"
        );

        let semaphore = Arc::new(Semaphore::new(self.max_in_flight));
        // Flipped off when this run ends; a task that lost the race must
        // not commit a late write after the aggregate has been returned.
        let live = Arc::new(AtomicBool::new(true));
        let deadline = tokio::time::Instant::now() + self.fanout_timeout;

        type TaskOutcome = Result<(Vec<Map<String, Value>>, DateTime<Utc>), FetchError>;

        let mut tasks: JoinSet<(usize, TaskOutcome)> = JoinSet::new();
        for (idx, server) in servers.iter().enumerate() {
            let semaphore = semaphore.clone();
            let live = live.clone();
            let client = self.client.clone();
            let store = self.store.clone();
            let server = server.clone();
            let fetch_timeout = self.fanout_timeout;

            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("fan-out semaphore closed");

                let records = match client.fetch(&server, kind, fetch_timeout).await {
                    Ok(records) => records,
                    Err(e) => return (idx, Err(e)),
                };

                // A task that lost the race to the deadline must not commit
                // a snapshot after the aggregate has been returned.
                let written_at = if live.load(Ordering::Acquire) {
                    match store.write(&server.name, kind, &records).await {
                        Ok(ts) => ts,
                        Err(e) => {
                            // Data was retrieved; losing the cache write is
                            // not a reason to report the server as failed.
                            tracing::warn!(
                                server = %server.name,
                                kind = %kind,
                                error = %e,
                                "Fetched data but cache write failed"
                            );
                            Utc::now()
                        }
                    }
                } else {
                    Utc::now()
                };

                (idx, Ok((records, written_at)))
            });
        }

        let mut outcomes: Vec<Option<TaskOutcome>> =
            (0..servers.len()).map(|_| None).collect();

        loop {
            let joined = tokio::select! {
                joined = tasks.join_next() => joined,
                _ = tokio::time::sleep_until(deadline) => {
                    live.store(false, Ordering::Release);
                    tasks.abort_all();
                    tracing::warn!(
                        kind = %kind,
                        "Fan-out deadline elapsed, abandoning in-flight fetches"
                    );
                    break;
                }
            };

            match joined {
                Some(Ok((idx, outcome))) => outcomes[idx] = Some(outcome),
                Some(Err(join_err)) => {
                    // A panicked task surfaces as an internal failure for
                    // whichever server is still unaccounted for below.
                    tracing::error!(error = %join_err, "Fan-out task failed to join");
                }
                None => break,
            }
        }
        live.store(false, Ordering::Release);

        for (idx, server) in servers.iter().enumerate() {
            match outcomes[idx].take() {
                Some(Ok((records, written_at))) => {
                    result.fetched += records.len();
                    result.succeeded.push(ServerPayload {
                        server: server.name.clone(),
                        origin: SnapshotOrigin::LiveFetch,
                        generated_at: Some(written_at),
                        stale: false,
                        refresh_error: None,
                        records,
                    });
                }
                Some(Err(e)) => {
                    tracing::warn!(
                        server = %server.name,
                        kind = %kind,
                        error = %e,
                        "Server fetch failed"
                    );
                    result.failed.push(FetchFailure::new(&server.name, e));
                }
                None => {
                    // Still pending when the deadline hit
                    result.failed.push(FetchFailure::new(
                        &server.name,
                        FetchError::timeout(format!(
                            "still pending after {}s fan-out deadline",
                            self.fanout_timeout.as_secs()
                        )),
                    ));
                }
            }
        }

        tracing::info!(
            kind = %kind,
            succeeded = result.succeeded.len(),
            failed = result.failed.len(),
            records = result.fetched,
            "Fan-out refresh completed"
        );

        result
    }
}
