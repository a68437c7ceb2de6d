//! RemoteClient - HTTP client for one Ops Manager's management API
//!
//! ## Responsibilities
//!
//! - Authenticated GETs against the versioned API prefix, credential pair
//!   sent per request
//! - Per-kind record gathering, including the org -> project -> cluster
//!   traversal behind the backup and monitoring kinds
//! - Reachability / authentication / version probes (see `probes`)
//!
//! Every record leaves here as an opaque field mapping; field extraction
//! beyond what each kind's gatherer composes belongs to the consumer.

mod probes;

pub use probes::{
    AttemptOutcome, AuthProbe, AuthVerdict, ProbeAttempt, ReachabilityProbe, ServerStatus,
    StatusProbe, PROBE_FIRST_TIMEOUT, PROBE_SECOND_TIMEOUT,
};

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::models::DataKind;
use crate::registry::ServerDescriptor;

/// Versioned path prefix of the management API
const API_PREFIX: &str = "/api/public/v1.0";

/// Timeout for one HTTP request within a fetch cycle
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Concurrency for per-host detail requests inside one monitoring fetch
const HOST_DETAIL_CONCURRENCY: usize = 3;

/// Classified failure of one fetch against one server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    /// Connection-level failure
    Network,
    /// The fetch exceeded its deadline
    Timeout,
    /// Credentials rejected (HTTP 401/403)
    Auth,
    /// Non-2xx application response
    Api,
}

/// Typed failure of one RemoteClient fetch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

impl FetchError {
    fn network(message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Network,
            message: message.into(),
            status_code: None,
        }
    }

    pub(crate) fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Timeout,
            message: message.into(),
            status_code: None,
        }
    }

    fn auth(status: u16) -> Self {
        Self {
            kind: FetchErrorKind::Auth,
            message: format!("credentials rejected (HTTP {})", status),
            status_code: Some(status),
        }
    }

    fn api(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Api,
            message: message.into(),
            status_code: Some(status),
        }
    }

    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::timeout(e.to_string())
        } else {
            Self::network(e.to_string())
        }
    }
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{:?} (HTTP {}): {}", self.kind, code, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

/// HTTP client for the fleet's management APIs.
///
/// One instance serves all servers; credentials come from the
/// `ServerDescriptor` passed per call. TLS verification is disabled because
/// the fleet commonly runs on self-signed certificates.
#[derive(Clone)]
pub struct RemoteClient {
    http: reqwest::Client,
    probe_first_timeout: Duration,
    probe_second_timeout: Duration,
}

impl RemoteClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(true)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            http,
            probe_first_timeout: PROBE_FIRST_TIMEOUT,
            probe_second_timeout: PROBE_SECOND_TIMEOUT,
        }
    }

    /// Override the two reachability-probe timeouts. The long-then-short
    /// shape is part of the contract; only the magnitudes change here.
    pub fn with_probe_timeouts(mut self, first: Duration, second: Duration) -> Self {
        self.probe_first_timeout = first;
        self.probe_second_timeout = second;
        self
    }

    pub(crate) fn probe_timeouts(&self) -> (Duration, Duration) {
        (self.probe_first_timeout, self.probe_second_timeout)
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Fetch all records of one kind from one server, bounded by `timeout`.
    ///
    /// Failures are typed, never coerced into empty data: an unreachable
    /// server, rejected credentials and an upstream error are all distinct.
    pub async fn fetch(
        &self,
        server: &ServerDescriptor,
        kind: DataKind,
        timeout: Duration,
    ) -> Result<Vec<Map<String, Value>>, FetchError> {
        let gather = async {
            match kind {
                DataKind::Backup => self.gather_backup(server).await,
                DataKind::Monitoring => self.gather_monitoring(server).await,
                DataKind::SnapshotBlockstore => {
                    self.gather_storage_configs(
                        server,
                        "/admin/backup/snapshot/mongoConfigs?assignableOnly=false",
                        "snapshot_blockstore",
                        false,
                    )
                    .await
                }
                DataKind::SnapshotS3 => {
                    self.gather_storage_configs(
                        server,
                        "/admin/backup/snapshot/s3Configs?assignableOnly=false",
                        "snapshot_s3",
                        true,
                    )
                    .await
                }
                DataKind::OplogStore => {
                    self.gather_storage_configs(
                        server,
                        "/admin/backup/oplog/mongoConfigs?assignableOnly=false",
                        "oplog_store",
                        false,
                    )
                    .await
                }
                DataKind::OplogS3 => {
                    self.gather_storage_configs(
                        server,
                        "/admin/backup/oplog/s3Configs?assignableOnly=false",
                        "oplog_s3",
                        true,
                    )
                    .await
                }
            }
        };

        match tokio::time::timeout(timeout, gather).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::timeout(format!(
                "fetch exceeded {}s deadline",
                timeout.as_secs()
            ))),
        }
    }

    /// One authenticated GET under the API prefix, JSON body returned
    async fn get_json(
        &self,
        server: &ServerDescriptor,
        path_and_query: &str,
    ) -> Result<Value, FetchError> {
        let url = format!("{}{}{}", server.url, API_PREFIX, path_and_query);

        let resp = self
            .http
            .get(&url)
            .header(ACCEPT, "application/json")
            .basic_auth(&server.public_key, Some(&server.private_key))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;

        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(FetchError::auth(status.as_u16()));
        }
        if !status.is_success() {
            return Err(FetchError::api(
                status.as_u16(),
                format!("GET {} returned {}", url, status),
            ));
        }

        resp.json::<Value>()
            .await
            .map_err(|e| FetchError::network(format!("invalid JSON from {}: {}", url, e)))
    }

    /// GET a results-array endpoint and return its items as field mappings
    async fn get_results(
        &self,
        server: &ServerDescriptor,
        path_and_query: &str,
    ) -> Result<Vec<Map<String, Value>>, FetchError> {
        let body = self.get_json(server, path_and_query).await?;
        Ok(results_array(&body))
    }

    /// One of the four backup-storage configuration endpoints
    async fn gather_storage_configs(
        &self,
        server: &ServerDescriptor,
        path_and_query: &str,
        type_tag: &str,
        with_bucket: bool,
    ) -> Result<Vec<Map<String, Value>>, FetchError> {
        let items = self.get_results(server, path_and_query).await?;
        let hostname = server.hostname();

        let mut out = Vec::with_capacity(items.len());
        for item in items {
            let mut record = Map::new();
            record.insert("type".to_string(), json!(type_tag));
            record.insert("id".to_string(), item.get("id").cloned().unwrap_or(Value::Null));
            record.insert("uri".to_string(), item.get("uri").cloned().unwrap_or(Value::Null));
            if with_bucket {
                record.insert(
                    "bucket_name".to_string(),
                    item.get("s3BucketName").cloned().unwrap_or(json!("N/A")),
                );
            }
            record.insert("Ops Manager".to_string(), json!(hostname));
            out.push(record);
        }

        tracing::debug!(
            server = %server.name,
            configs = out.len(),
            config_type = type_tag,
            "Storage configurations gathered"
        );

        Ok(out)
    }

    /// Backup records: every non-sharded cluster of every project that has a
    /// backup configuration, flattened to display-ready rows
    async fn gather_backup(
        &self,
        server: &ServerDescriptor,
    ) -> Result<Vec<Map<String, Value>>, FetchError> {
        let domain = domain_of(&server.url);
        let mut rows = Vec::new();

        for (org_id, _org_name) in self.list_organizations(server).await? {
            for (project_id, project_name) in self.list_projects(server, &org_id).await? {
                for cluster in self.list_clusters(server, &project_id).await? {
                    let Some(cluster_id) = str_field(&cluster, "id") else {
                        continue;
                    };
                    let rs_name = str_field(&cluster, "replicaSetName")
                        .or_else(|| str_field(&cluster, "clusterName"))
                        .unwrap_or_default()
                        .to_string();
                    let last_heartbeat = str_field(&cluster, "lastHeartbeat");

                    // Clusters without a backup configuration (404) simply
                    // produce no row, matching the source dashboard.
                    let config = match self
                        .get_json(
                            server,
                            &format!("/groups/{}/backupConfigs/{}", project_id, cluster_id),
                        )
                        .await
                    {
                        Ok(v) => v,
                        Err(e) if e.kind == FetchErrorKind::Api && e.status_code == Some(404) => {
                            continue;
                        }
                        Err(e) => return Err(e),
                    };

                    let mut row = Map::new();
                    row.insert("Project".to_string(), json!(project_name));
                    row.insert("Replica Set Name".to_string(), json!(rs_name));
                    row.insert("Ops Manager".to_string(), json!(domain));
                    row.insert(
                        "Username".to_string(),
                        config.get("username").cloned().unwrap_or(Value::Null),
                    );
                    row.insert(
                        "Last Ping".to_string(),
                        json!(humanize_last_ping(last_heartbeat)),
                    );
                    row.insert(
                        "Backup Status".to_string(),
                        config.get("statusName").cloned().unwrap_or(Value::Null),
                    );
                    rows.push(row);
                }
            }
        }

        tracing::debug!(server = %server.name, rows = rows.len(), "Backup records gathered");
        Ok(rows)
    }

    /// Monitoring records: every host of every non-sharded cluster with its
    /// last-ping age, flattened to display-ready rows
    async fn gather_monitoring(
        &self,
        server: &ServerDescriptor,
    ) -> Result<Vec<Map<String, Value>>, FetchError> {
        let domain = domain_of(&server.url);
        let mut rows = Vec::new();

        for (org_id, _org_name) in self.list_organizations(server).await? {
            for (project_id, project_name) in self.list_projects(server, &org_id).await? {
                for cluster in self.list_clusters(server, &project_id).await? {
                    let Some(cluster_id) = str_field(&cluster, "id") else {
                        continue;
                    };
                    let rs_name = str_field(&cluster, "replicaSetName")
                        .or_else(|| str_field(&cluster, "clusterName"))
                        .unwrap_or_default()
                        .to_string();

                    let host_ids: Vec<String> = self
                        .get_results(
                            server,
                            &format!("/groups/{}/hosts?clusterId={}", project_id, cluster_id),
                        )
                        .await?
                        .iter()
                        .filter_map(|h| str_field(h, "id").map(str::to_string))
                        .collect();

                    let details: Vec<Result<Value, FetchError>> = stream::iter(host_ids)
                        .map(|host_id| {
                            let path = format!("/groups/{}/hosts/{}", project_id, host_id);
                            async move { self.get_json(server, &path).await }
                        })
                        .buffer_unordered(HOST_DETAIL_CONCURRENCY)
                        .collect()
                        .await;

                    for detail in details {
                        let host = detail?;
                        let hostname = host.get("hostname").and_then(Value::as_str);
                        let port = host.get("port").and_then(Value::as_u64);
                        let host_port = match (hostname, port) {
                            (Some(h), Some(p)) => format!("{}:{}", h, p),
                            _ => "Unknown".to_string(),
                        };

                        // Merge cluster and host replica set names when they
                        // disagree, as the source dashboard does
                        let host_rs = host.get("replicaSetName").and_then(Value::as_str);
                        let rs_combined = match host_rs {
                            Some(hr) if !hr.is_empty() && hr != rs_name => {
                                format!("{}-{}", rs_name, hr)
                            }
                            _ => rs_name.clone(),
                        };

                        let mut row = Map::new();
                        row.insert("Project".to_string(), json!(project_name));
                        row.insert("Ops Manager".to_string(), json!(domain));
                        row.insert("Replica Set Name".to_string(), json!(rs_combined));
                        row.insert("Hostname:Port".to_string(), json!(host_port));
                        row.insert(
                            "Username".to_string(),
                            host.get("username").cloned().unwrap_or(Value::Null),
                        );
                        row.insert(
                            "Last Ping".to_string(),
                            json!(humanize_last_ping(
                                host.get("lastPing").and_then(Value::as_str)
                            )),
                        );
                        rows.push(row);
                    }
                }
            }
        }

        tracing::debug!(server = %server.name, rows = rows.len(), "Monitoring records gathered");
        Ok(rows)
    }

    /// (id, name) of all non-deleted organizations
    async fn list_organizations(
        &self,
        server: &ServerDescriptor,
    ) -> Result<Vec<(String, String)>, FetchError> {
        Ok(self
            .get_results(server, "/orgs")
            .await?
            .iter()
            .filter(|o| !o.get("isDeleted").and_then(Value::as_bool).unwrap_or(false))
            .filter_map(|o| {
                Some((
                    str_field(o, "id")?.to_string(),
                    str_field(o, "name").unwrap_or_default().to_string(),
                ))
            })
            .collect())
    }

    /// (id, name) of all projects in an organization
    async fn list_projects(
        &self,
        server: &ServerDescriptor,
        org_id: &str,
    ) -> Result<Vec<(String, String)>, FetchError> {
        Ok(self
            .get_results(server, &format!("/orgs/{}/groups", org_id))
            .await?
            .iter()
            .filter_map(|g| {
                Some((
                    str_field(g, "id")?.to_string(),
                    str_field(g, "name").unwrap_or_default().to_string(),
                ))
            })
            .collect())
    }

    /// Clusters of a project, shard members excluded (rows are per replica
    /// set; shard internals would duplicate them)
    async fn list_clusters(
        &self,
        server: &ServerDescriptor,
        project_id: &str,
    ) -> Result<Vec<Map<String, Value>>, FetchError> {
        Ok(self
            .get_results(server, &format!("/groups/{}/clusters", project_id))
            .await?
            .into_iter()
            .filter(|c| !c.contains_key("shardName"))
            .collect())
    }
}

impl Default for RemoteClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Items of the body's `results` array, objects only
fn results_array(body: &Value) -> Vec<Map<String, Value>> {
    body.get("results")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_object().cloned())
                .collect()
        })
        .unwrap_or_default()
}

/// Base URL without its scheme, the display form of a server identity
fn domain_of(url: &str) -> &str {
    url.trim_start_matches("https://").trim_start_matches("http://")
}

/// Field as &str, if present and a string
fn str_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

/// Age of a last-ping timestamp as a coarse human-readable duration.
///
/// `None` means the server never pinged; an unparseable timestamp reads as
/// "Unknown" rather than failing the whole row.
fn humanize_last_ping(last_ping: Option<&str>) -> String {
    let Some(raw) = last_ping else {
        return "Never".to_string();
    };
    let Ok(parsed) = DateTime::parse_from_rfc3339(raw) else {
        return "Unknown".to_string();
    };

    let total_seconds = (Utc::now() - parsed.with_timezone(&Utc)).num_seconds().max(0);
    if total_seconds > 86_400 {
        format!("{} days", total_seconds / 86_400)
    } else if total_seconds > 3_600 {
        format!("{} hours", total_seconds / 3_600)
    } else if total_seconds > 60 {
        format!("{} minutes", total_seconds / 60)
    } else {
        format!("{} seconds", total_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_humanize_last_ping_buckets() {
        let ts = |delta: ChronoDuration| (Utc::now() - delta).to_rfc3339();

        assert_eq!(humanize_last_ping(None), "Never");
        assert_eq!(humanize_last_ping(Some("not-a-date")), "Unknown");
        assert_eq!(
            humanize_last_ping(Some(&ts(ChronoDuration::days(3)))),
            "3 days"
        );
        assert_eq!(
            humanize_last_ping(Some(&ts(ChronoDuration::hours(5)))),
            "5 hours"
        );
        assert_eq!(
            humanize_last_ping(Some(&ts(ChronoDuration::minutes(12)))),
            "12 minutes"
        );
        assert!(humanize_last_ping(Some(&ts(ChronoDuration::seconds(30)))).ends_with("seconds"));
    }

    #[test]
    fn test_domain_of_strips_scheme_only() {
        assert_eq!(domain_of("https://om.example.com:8443"), "om.example.com:8443");
        assert_eq!(domain_of("http://10.0.0.5"), "10.0.0.5");
    }

    #[test]
    fn test_results_array_tolerates_shape_drift() {
        let body = serde_json::json!({"results": [{"id": "a"}, 42, {"id": "b"}]});
        assert_eq!(results_array(&body).len(), 2);

        assert!(results_array(&serde_json::json!({})).is_empty());
        assert!(results_array(&serde_json::json!({"results": "nope"})).is_empty());
    }
}
