//! Connectivity, authentication and version probes
//!
//! Probes are always live; their results are never cached to disk. The
//! reachability probe deliberately uses a long-then-short timeout pair: the
//! first attempt gives a slow-but-alive server time to answer, the second
//! confirms a genuinely down one without doubling the total wait.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::RemoteClient;
use crate::registry::ServerDescriptor;

/// First reachability attempt timeout
pub const PROBE_FIRST_TIMEOUT: Duration = Duration::from_secs(5);
/// Second (confirming) reachability attempt timeout
pub const PROBE_SECOND_TIMEOUT: Duration = Duration::from_secs(3);

/// Authenticated probe timeout
const AUTH_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
/// Version manifest probe timeout
const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Version header set by the management server on the version manifest
const VERSION_HEADER: &str = "X-MongoDB-Service-Version";

/// What one reachability attempt observed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum AttemptOutcome {
    /// The service answered with a status that proves it is running
    Success { http_status: u16 },
    /// Answered, but with a status outside the accepted set
    UnexpectedStatus { http_status: u16 },
    /// No answer within this attempt's timeout
    Timeout,
    /// Connection-level failure
    ConnectionError { error: String },
}

/// One recorded reachability attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeAttempt {
    pub attempt: u32,
    pub timeout_secs: u64,
    pub latency_ms: u64,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

/// Result of the two-attempt reachability check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReachabilityProbe {
    pub reachable: bool,
    pub total_latency_ms: u64,
    pub attempts: Vec<ProbeAttempt>,
    pub details: String,
}

/// Result of the single authenticated probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthVerdict {
    /// Credentials accepted
    Authenticated,
    /// Reached the API, credentials rejected
    Rejected,
    /// Reached the API, non-auth failure (5xx etc.)
    Error,
    /// No answer within the probe timeout
    Timeout,
    /// Could not reach the API at all
    Unreachable,
    /// Skipped because the server was already unreachable
    NotChecked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthProbe {
    pub verdict: AuthVerdict,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

impl AuthProbe {
    fn not_checked() -> Self {
        Self {
            verdict: AuthVerdict::NotChecked,
            latency_ms: 0,
            status_code: None,
        }
    }
}

/// Combined health verdict for one server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    /// Reachable and credentials accepted
    Healthy,
    /// Did not answer either reachability attempt
    Unreachable,
    /// Reachable but credentials rejected
    Unauthenticated,
    /// Reachable but the authenticated probe failed for a non-auth reason
    Degraded,
}

/// Full connectivity + authentication status of one server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusProbe {
    pub server: String,
    pub url: String,
    pub hostname: String,
    pub region: Option<String>,
    pub environment: Option<String>,
    pub status: ServerStatus,
    pub reachability: ReachabilityProbe,
    pub authentication: AuthProbe,
    pub version: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl RemoteClient {
    /// Check whether a server's web frontend answers at all.
    ///
    /// Up to two attempts, short-circuiting on the first success. HTTP 200,
    /// 401 and 403 all count as "the service is running"; an auth challenge
    /// from a live server is still an answer.
    pub async fn probe_reachability(&self, server: &ServerDescriptor) -> ReachabilityProbe {
        let url = format!("{}/", server.url);
        let (first, second) = self.probe_timeouts();
        let probe_start = Instant::now();
        let mut attempts = Vec::with_capacity(2);

        for (idx, timeout) in [first, second].into_iter().enumerate() {
            let attempt_no = idx as u32 + 1;
            let start = Instant::now();
            let outcome = match self.http().get(&url).timeout(timeout).send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if matches!(status, 200 | 401 | 403) {
                        AttemptOutcome::Success {
                            http_status: status,
                        }
                    } else {
                        AttemptOutcome::UnexpectedStatus {
                            http_status: status,
                        }
                    }
                }
                Err(e) if e.is_timeout() => AttemptOutcome::Timeout,
                Err(e) => AttemptOutcome::ConnectionError {
                    error: e.to_string(),
                },
            };

            let success = matches!(outcome, AttemptOutcome::Success { .. });
            attempts.push(ProbeAttempt {
                attempt: attempt_no,
                timeout_secs: timeout.as_secs(),
                latency_ms: start.elapsed().as_millis() as u64,
                outcome,
            });

            if success {
                return ReachabilityProbe {
                    reachable: true,
                    total_latency_ms: probe_start.elapsed().as_millis() as u64,
                    details: format!("connected on attempt {}", attempt_no),
                    attempts,
                };
            }
        }

        let all_timed_out = attempts
            .iter()
            .all(|a| a.outcome == AttemptOutcome::Timeout);
        let details = if all_timed_out {
            format!(
                "both attempts timed out ({}s + {}s)",
                first.as_secs(),
                second.as_secs()
            )
        } else {
            "both attempts failed".to_string()
        };

        tracing::warn!(
            server = %server.name,
            url = %url,
            details = %details,
            "Server unreachable"
        );

        ReachabilityProbe {
            reachable: false,
            total_latency_ms: probe_start.elapsed().as_millis() as u64,
            details,
            attempts,
        }
    }

    /// One lightweight authenticated call to verify the credential pair.
    ///
    /// A rejected credential (401/403) is reported distinctly from every
    /// non-auth failure so callers can tell "can't reach" from "reached but
    /// rejected".
    pub async fn probe_authentication(&self, server: &ServerDescriptor) -> AuthProbe {
        let url = format!("{}{}/orgs", server.url, super::API_PREFIX);
        let start = Instant::now();

        let result = self
            .http()
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .basic_auth(&server.public_key, Some(&server.private_key))
            .timeout(AUTH_PROBE_TIMEOUT)
            .send()
            .await;

        let latency_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let verdict = match status {
                    200..=299 => AuthVerdict::Authenticated,
                    401 | 403 => AuthVerdict::Rejected,
                    _ => AuthVerdict::Error,
                };
                AuthProbe {
                    verdict,
                    latency_ms,
                    status_code: Some(status),
                }
            }
            Err(e) if e.is_timeout() => AuthProbe {
                verdict: AuthVerdict::Timeout,
                latency_ms,
                status_code: None,
            },
            Err(e) if e.is_connect() => AuthProbe {
                verdict: AuthVerdict::Unreachable,
                latency_ms,
                status_code: None,
            },
            Err(_) => AuthProbe {
                verdict: AuthVerdict::Error,
                latency_ms,
                status_code: None,
            },
        }
    }

    /// Server version from the unauthenticated version manifest, parsed out
    /// of the service-version header. Any failure reads as unknown.
    pub async fn fetch_version(&self, server: &ServerDescriptor) -> Option<String> {
        let url = format!("{}{}/unauth/versionManifest", server.url, super::API_PREFIX);

        let resp = self
            .http()
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(VERSION_PROBE_TIMEOUT)
            .send()
            .await
            .ok()?;

        let header = resp.headers().get(VERSION_HEADER)?.to_str().ok()?;

        // Header shape: "gitHash=abc123; versionString=7.0.1.123"
        header
            .split(';')
            .map(str::trim)
            .find_map(|part| part.strip_prefix("versionString="))
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }

    /// Combined reachability + authentication + version check.
    ///
    /// Authentication and version are only probed once the server has
    /// proven reachable; probing a dead server again would just stack
    /// timeouts.
    pub async fn probe_status(&self, server: &ServerDescriptor) -> StatusProbe {
        let reachability = self.probe_reachability(server).await;

        let (authentication, version) = if reachability.reachable {
            let auth = self.probe_authentication(server).await;
            let version = self.fetch_version(server).await;
            (auth, version)
        } else {
            (AuthProbe::not_checked(), None)
        };

        let status = if !reachability.reachable {
            ServerStatus::Unreachable
        } else {
            match authentication.verdict {
                AuthVerdict::Authenticated => ServerStatus::Healthy,
                AuthVerdict::Rejected => ServerStatus::Unauthenticated,
                _ => ServerStatus::Degraded,
            }
        };

        tracing::info!(
            server = %server.name,
            status = ?status,
            attempts = reachability.attempts.len(),
            "Status probe completed"
        );

        StatusProbe {
            server: server.name.clone(),
            url: server.url.clone(),
            hostname: server.hostname(),
            region: server.region.clone(),
            environment: server.environment.clone(),
            status,
            reachability,
            authentication,
            version,
            checked_at: Utc::now(),
        }
    }
}
