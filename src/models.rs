//! Shared models and types
//!
//! Types shared across multiple modules to avoid circular dependencies.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Kind of operational data fetched from a managed server.
///
/// Each kind owns its own cache namespace; two kinds never share a cache
/// slot even for the same server. The four storage kinds map onto the
/// distinct backup-storage configuration endpoints of the management API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    /// Backup agent records (per-cluster backup configuration)
    Backup,
    /// Monitoring agent records (per-host ping data)
    Monitoring,
    /// Snapshot blockstore configurations
    SnapshotBlockstore,
    /// Snapshot S3 storage configurations
    SnapshotS3,
    /// Oplog store configurations
    OplogStore,
    /// Oplog S3 storage configurations
    OplogS3,
}

impl DataKind {
    /// All kinds, in cache-directory order
    pub const ALL: [DataKind; 6] = [
        DataKind::Backup,
        DataKind::Monitoring,
        DataKind::SnapshotBlockstore,
        DataKind::SnapshotS3,
        DataKind::OplogStore,
        DataKind::OplogS3,
    ];

    /// Stable name, used as cache subdirectory and API path segment
    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Backup => "backup",
            DataKind::Monitoring => "monitoring",
            DataKind::SnapshotBlockstore => "snapshot_blockstore",
            DataKind::SnapshotS3 => "snapshot_s3",
            DataKind::OplogStore => "oplog_store",
            DataKind::OplogS3 => "oplog_s3",
        }
    }
}

impl std::fmt::Display for DataKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DataKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backup" => Ok(DataKind::Backup),
            "monitoring" => Ok(DataKind::Monitoring),
            "snapshot_blockstore" => Ok(DataKind::SnapshotBlockstore),
            "snapshot_s3" => Ok(DataKind::SnapshotS3),
            "oplog_store" => Ok(DataKind::OplogStore),
            "oplog_s3" => Ok(DataKind::OplogS3),
            other => Err(Error::Validation(format!("unknown data kind: {}", other))),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub servers_registered: usize,
    pub cache_dir: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_kind_round_trips_through_str() {
        for kind in DataKind::ALL {
            assert_eq!(DataKind::from_str(kind.as_str()).unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(DataKind::from_str("status").is_err());
        assert!(DataKind::from_str("").is_err());
    }

    #[test]
    fn test_kind_names_are_unique() {
        let mut names: Vec<_> = DataKind::ALL.iter().map(|k| k.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), DataKind::ALL.len());
    }
}
