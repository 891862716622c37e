//! Staging: download an accepted version's tarball into storage and tell
//! downstream ingestion about it.

pub mod error;

use self::error::{ErrorKind, Result};
use crate::layout::staged_key;
use crate::worker::Verdict;
use exn::ResultExt;
use regmirror_integrity::{Algorithm, Envelope, Integrity, Verification, verify};
use regmirror_policy::{DenyList, Detection};
use regmirror_queue::QueueHandle;
use regmirror_registry::{TarballSource, VersionInfo};
use regmirror_storage::{BackendHandle, Metadata};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use url::Url;

/// Everything needed to stage one version, as handed over by the follower.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRequest {
    pub name: String,
    pub version: String,
    pub tarball_url: String,
    /// Upstream Subresource Integrity string, if published.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub modified: OffsetDateTime,
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub frameworks: Vec<String>,
}

impl StageRequest {
    pub fn new(
        name: &str,
        version: &str,
        info: &VersionInfo,
        modified: OffsetDateTime,
        sequence: u64,
        frameworks: &[Detection],
    ) -> Self {
        let mut names: Vec<String> = frameworks.iter().map(|d| d.framework.clone()).collect();
        names.dedup();
        Self {
            name: name.to_string(),
            version: version.to_string(),
            tarball_url: info.dist.tarball.clone(),
            integrity: info.dist.integrity.clone(),
            modified,
            sequence,
            frameworks: names,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Staged { key: String },
    /// Deny-listed since it was accepted; nothing was done.
    Denied { reason: String },
}

/// The message published for downstream ingestion, before sealing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub tarball_uri: String,
    pub metadata: NotificationMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMetadata {
    /// The upstream tarball URL.
    pub dist: String,
    pub integrity: String,
    pub modified: String,
    pub sequence: String,
}

pub struct Stager {
    backend: BackendHandle,
    tarballs: Arc<dyn TarballSource>,
    ingestion: QueueHandle,
    deny_list: DenyList,
}

impl Stager {
    pub fn new(
        backend: BackendHandle,
        tarballs: Arc<dyn TarballSource>,
        ingestion: QueueHandle,
        deny_list: DenyList,
    ) -> Self {
        Self {
            backend,
            tarballs,
            ingestion,
            deny_list,
        }
    }

    /// Stage one version.
    ///
    /// Safe to repeat: the key and metadata depend only on the request, so
    /// staging the same request twice writes the same object twice.
    #[tracing::instrument(skip_all, fields(package = %request.name, version = %request.version))]
    pub async fn stage(&self, request: &StageRequest) -> Result<Outcome> {
        if let Some(rule) = self.deny_list.lookup(&request.name, &request.version) {
            tracing::info!(reason = %rule.reason, "Version is deny-listed, not staging");
            return Ok(Outcome::Denied {
                reason: rule.reason.clone(),
            });
        }

        let invalid_url = || ErrorKind::InvalidUrl(request.tarball_url.clone());
        let url = Url::parse(&request.tarball_url).or_raise(invalid_url)?;
        if !matches!(url.scheme(), "http" | "https") {
            exn::bail!(invalid_url());
        }
        let Some(key) = staged_key(&url) else {
            exn::bail!(invalid_url());
        };

        let data = self.tarballs.fetch(&url).await.or_raise(|| ErrorKind::Fetch(url.to_string()))?;
        let integrity = self.check_integrity(request, &url, &data)?;

        let modified = request.modified.format(&Rfc3339).or_raise(|| ErrorKind::Encode)?;
        let mut metadata = Metadata::from([
            ("modified".to_string(), modified.clone()),
            ("source-integrity".to_string(), integrity.clone()),
            ("source-url".to_string(), url.to_string()),
            ("sequence".to_string(), request.sequence.to_string()),
        ]);
        if !request.frameworks.is_empty() {
            metadata.insert("frameworks".to_string(), request.frameworks.join(","));
        }
        self.backend.write(&key, &data, &metadata).await.or_raise(|| ErrorKind::Storage(key.clone()))?;
        tracing::info!(key = %key, bytes = data.len(), "Staged tarball");

        let notification = Notification {
            tarball_uri: self.backend.uri(&key),
            metadata: NotificationMetadata {
                dist: url.to_string(),
                integrity,
                modified,
                sequence: request.sequence.to_string(),
            },
        };
        let envelope = Envelope::seal(notification, &data, OffsetDateTime::now_utc()).or_raise(|| ErrorKind::Encode)?;
        let body = serde_json::to_string(&envelope).or_raise(|| ErrorKind::Encode)?;
        self.ingestion.publish(&body).await.or_raise(|| ErrorKind::Queue(self.ingestion.name().to_string()))?;
        Ok(Outcome::Staged { key })
    }

    /// Verify `data` against the upstream hint and return the integrity
    /// string to record: the hint itself, or a fresh SHA-512 digest if
    /// upstream published none.
    fn check_integrity(&self, request: &StageRequest, url: &Url, data: &[u8]) -> Result<String> {
        let Some(hint) = &request.integrity else {
            return Ok(Integrity::compute(Algorithm::Sha512, data).to_string());
        };
        match verify(hint, data) {
            Ok(Verification::Verified(algorithm)) => {
                tracing::debug!(algorithm = algorithm.as_str(), "Verified tarball integrity");
            },
            Ok(Verification::Unsupported) => {
                tracing::debug!(integrity = %hint, "No supported digest in integrity hint, not verified");
            },
            Err(err) if err.is_retryable() => return Err(err.raise(ErrorKind::Integrity(url.to_string()))),
            Err(err) => return Err(err.raise(ErrorKind::InvalidIntegrity(url.to_string()))),
        }
        Ok(hint.clone())
    }

    /// Handle one stage-queue message.
    pub async fn handle(&self, body: &str) -> Verdict {
        let request: StageRequest = match serde_json::from_str(body) {
            Ok(request) => request,
            Err(err) => {
                tracing::error!(error = %err, "Discarding malformed stage request");
                return Verdict::Discard;
            },
        };
        match self.stage(&request).await {
            Ok(_) => Verdict::Done,
            Err(err) if err.is_retryable() => {
                tracing::warn!(package = %request.name, version = %request.version, error = ?err, "Staging failed, will retry");
                Verdict::Retry
            },
            Err(err) => {
                tracing::error!(package = %request.name, version = %request.version, error = ?err, "Staging failed permanently");
                Verdict::Discard
            },
        }
    }
}
