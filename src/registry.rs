//! Server Registry
//!
//! Immutable list of managed Ops Manager instances, loaded once at startup
//! from a JSON document of the shape `{"ops_manager": [...]}`. The registry
//! is the single source of truth for which servers exist; it is never
//! mutated after load and is shared read-only for the process lifetime.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Identity of one managed Ops Manager instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Unique name, used as the cache key for this server
    pub name: String,
    /// Base URL (scheme + host + optional port), no trailing slash
    pub url: String,
    /// API public key
    pub public_key: String,
    /// API private key
    pub private_key: String,
    /// Deployment region tag (e.g. us-east-1)
    #[serde(default)]
    pub region: Option<String>,
    /// Environment tag (e.g. prod, staging)
    #[serde(default)]
    pub environment: Option<String>,
}

impl ServerDescriptor {
    /// Hostname portion of the base URL, for display fields
    pub fn hostname(&self) -> String {
        let stripped = self
            .url
            .trim_start_matches("https://")
            .trim_start_matches("http://");
        stripped
            .split(['/', ':'])
            .next()
            .unwrap_or(stripped)
            .to_string()
    }
}

/// Raw config entry before validation. All fields optional so a missing
/// field produces a config error instead of a serde parse failure.
#[derive(Debug, Deserialize)]
struct RawEntry {
    name: Option<String>,
    url: Option<String>,
    public_key: Option<String>,
    private_key: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    environment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    ops_manager: Vec<RawEntry>,
}

/// Read-only registry of all managed servers
#[derive(Debug)]
pub struct ServerRegistry {
    servers: Vec<ServerDescriptor>,
}

impl ServerRegistry {
    /// Load the registry from a JSON file.
    ///
    /// Fails with a config error if the file is absent or malformed, if any
    /// entry lacks a name/url/credential pair, or if two entries share a
    /// name. A bad entry fails the whole load; there is no partial registry.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::Config(format!(
                "cannot read server list {}: {}",
                path.display(),
                e
            ))
        })?;

        let file: RegistryFile = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("malformed server list: {}", e)))?;

        let registry = Self::from_entries(file.ops_manager)?;

        tracing::info!(
            servers = registry.len(),
            path = %path.display(),
            "Server registry loaded"
        );

        Ok(registry)
    }

    /// Build a registry from validated descriptors. Used by `load` and by
    /// tests that construct servers programmatically.
    pub fn from_descriptors(servers: Vec<ServerDescriptor>) -> Result<Self> {
        let mut seen = HashSet::new();
        for server in &servers {
            if server.name.is_empty() {
                return Err(Error::Config("server entry with empty name".to_string()));
            }
            if server.url.is_empty() {
                return Err(Error::Config(format!(
                    "server {} has an empty url",
                    server.name
                )));
            }
            if server.public_key.is_empty() || server.private_key.is_empty() {
                return Err(Error::Config(format!(
                    "server {} is missing its credential pair",
                    server.name
                )));
            }
            if !seen.insert(server.name.clone()) {
                return Err(Error::Config(format!(
                    "duplicate server name: {}",
                    server.name
                )));
            }
        }

        Ok(Self { servers })
    }

    fn from_entries(entries: Vec<RawEntry>) -> Result<Self> {
        let mut servers = Vec::with_capacity(entries.len());
        for (idx, entry) in entries.into_iter().enumerate() {
            let url = entry
                .url
                .filter(|u| !u.is_empty())
                .ok_or_else(|| Error::Config(format!("server entry {} has no url", idx)))?;
            let url = url.trim_end_matches('/').to_string();

            // The original config allowed name to default to the url
            let name = entry.name.filter(|n| !n.is_empty()).unwrap_or_else(|| url.clone());

            let public_key = entry
                .public_key
                .filter(|k| !k.is_empty())
                .ok_or_else(|| Error::Config(format!("server {} has no public_key", name)))?;
            let private_key = entry
                .private_key
                .filter(|k| !k.is_empty())
                .ok_or_else(|| Error::Config(format!("server {} has no private_key", name)))?;

            servers.push(ServerDescriptor {
                name,
                url,
                public_key,
                private_key,
                region: entry.region,
                environment: entry.environment,
            });
        }

        Self::from_descriptors(servers)
    }

    /// All registered servers
    pub fn servers(&self) -> &[ServerDescriptor] {
        &self.servers
    }

    /// Look up a server by name
    pub fn get(&self, name: &str) -> Option<&ServerDescriptor> {
        self.servers.iter().find(|s| s.name == name)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}
