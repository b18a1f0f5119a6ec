//! HTTP client for the optional sync authority.
//!
//! The authority exposes three endpoints:
//!
//! - `GET  /latest-version` returns `{"version_hash": "..."}`
//! - `GET  /changes-since/{hash}` returns a JSON array of version records;
//!   `0` stands for "from the beginning"
//! - `POST /push-changes` takes one version record; `409 Conflict` means the
//!   authority refused it
//!
//! Requests are blocking `ureq` calls run on tokio's blocking pool.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::error::SyncError;
use crate::storage::VersionRecord;
use crate::sync::VersionSource;

const FROM_THE_BEGINNING: &str = "0";

#[derive(Debug, Deserialize)]
struct LatestVersion {
    version_hash: Option<String>,
}

#[derive(Clone)]
pub struct HttpAuthority {
    base_url: String,
    agent: ureq::Agent,
}

impl HttpAuthority {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json<T>(&self, path: String) -> Result<T, SyncError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let url = format!("{}{}", self.base_url, path);
        let agent = self.agent.clone();
        blocking(move || {
            debug!("GET {}", url);
            let response = agent
                .get(&url)
                .call()
                .map_err(|e| SyncError::Authority(format!("GET {} failed: {}", url, e)))?;
            response.into_json::<T>().map_err(|e| SyncError::BadResponse {
                source_name: url.clone(),
                reason: e.to_string(),
            })
        })
        .await
    }
}

async fn blocking<T, F>(f: F) -> Result<T, SyncError>
where
    F: FnOnce() -> Result<T, SyncError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SyncError::Authority(format!("request task failed: {}", e)))?
}

#[async_trait]
impl VersionSource for HttpAuthority {
    async fn latest_version(&self) -> Result<Option<String>, SyncError> {
        let latest: LatestVersion = self.get_json("/latest-version".to_string()).await?;
        Ok(latest.version_hash)
    }

    async fn changes_since(&self, version_hash: Option<String>) -> Result<Vec<VersionRecord>, SyncError> {
        let since = version_hash.unwrap_or_else(|| FROM_THE_BEGINNING.to_string());
        self.get_json(format!("/changes-since/{}", since)).await
    }

    async fn push_changes(&self, record: VersionRecord) -> Result<bool, SyncError> {
        let url = format!("{}/push-changes", self.base_url);
        let agent = self.agent.clone();
        blocking(move || {
            debug!("POST {} ({})", url, record.version_hash);
            match agent.post(&url).send_json(&record) {
                Ok(_) => Ok(true),
                Err(ureq::Error::Status(409, _)) => Ok(false),
                Err(e) => Err(SyncError::Authority(format!("POST {} failed: {}", url, e))),
            }
        })
        .await
    }
}
