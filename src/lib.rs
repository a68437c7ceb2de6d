//! OpsTower - Ops Manager fleet control tower
//!
//! Cache-first aggregation of backup, monitoring and backup-storage data
//! from an arbitrary number of independently-credentialed Ops Manager
//! instances.
//!
//! ## Architecture
//!
//! 1. ServerRegistry - immutable server list, loaded once at startup
//! 2. SnapshotStore - durable per-(server, kind) result cache
//! 3. RemoteClient - authenticated management API calls + status probes
//! 4. FanoutAggregator - bounded parallel fetch across the fleet
//! 5. CacheFirstOrchestrator - per-request freshness policy
//! 6. WebAPI - REST endpoints over the orchestrator
//!
//! ## Design Principles
//!
//! - Partial failure is normal: one dead server never hides the others
//! - Stale-but-present beats erased: failures never clobber the cache
//! - Every fan-out is bounded: concurrency ceiling and a hard deadline

pub mod error;
pub mod fanout;
pub mod models;
pub mod orchestrator;
pub mod registry;
pub mod remote_client;
pub mod snapshot_store;
pub mod state;
pub mod web_api;

pub use error::{Error, Result};
pub use state::AppState;
