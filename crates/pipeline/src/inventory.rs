//! The versions index: every package in the downstream index with all of its
//! versions, built from delimited listings alone.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use futures::{StreamExt, TryStreamExt, stream};
use regmirror_config::CatalogConfig;
use regmirror_storage::{BackendHandle, Metadata};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionsIndex {
    pub packages: BTreeMap<String, Vec<String>>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryReport {
    pub packages: usize,
    pub versions: usize,
}

pub struct Inventory {
    backend: BackendHandle,
    data_prefix: String,
    versions_key: String,
    concurrency: usize,
}

impl Inventory {
    pub fn new(backend: BackendHandle, config: &CatalogConfig) -> Self {
        Self {
            backend,
            data_prefix: config.data_prefix.clone(),
            versions_key: config.versions_key.clone(),
            concurrency: config.list_concurrency.max(1),
        }
    }

    /// List everything and replace the stored index. Any failed listing fails
    /// the run before anything is written.
    pub async fn run(&self) -> Result<InventoryReport> {
        let top = self.list(self.data_prefix.clone()).await?;
        let (scopes, mut packages): (Vec<String>, Vec<String>) =
            top.into_iter().partition(|prefix| prefix[self.data_prefix.len()..].starts_with('@'));
        let scoped: Vec<Vec<String>> =
            stream::iter(scopes).map(|scope| self.list(scope)).buffer_unordered(self.concurrency).try_collect().await?;
        packages.extend(scoped.into_iter().flatten());
        tracing::debug!(packages = packages.len(), "Listed packages");

        let listed: Vec<(String, Vec<String>)> = stream::iter(packages)
            .map(|prefix| async move {
                let versions = self.list(prefix.clone()).await?;
                Ok::<_, crate::error::Error>((prefix, versions))
            })
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;

        let mut index = BTreeMap::new();
        for (prefix, version_prefixes) in listed {
            let name = prefix[self.data_prefix.len()..].trim_end_matches('/');
            let mut versions: Vec<String> = version_prefixes
                .iter()
                .filter_map(|sub| sub[prefix.len()..].strip_prefix('v')?.strip_suffix('/'))
                .filter(|version| !version.is_empty())
                .map(str::to_string)
                .collect();
            if versions.is_empty() {
                continue;
            }
            versions.sort_by(|a, b| compare_versions(a, b));
            index.insert(name.to_string(), versions);
        }

        let report = InventoryReport {
            packages: index.len(),
            versions: index.values().map(Vec::len).sum(),
        };
        let document = VersionsIndex {
            packages: index,
            updated_at: OffsetDateTime::now_utc(),
        };
        let data = serde_json::to_vec(&document).or_raise(|| ErrorKind::Encode("versions index".to_string()))?;
        let metadata = Metadata::from([
            ("package-count".to_string(), report.packages.to_string()),
            ("version-count".to_string(), report.versions.to_string()),
        ]);
        self.backend
            .write(&self.versions_key, &data, &metadata)
            .await
            .or_raise(|| ErrorKind::Storage(self.versions_key.clone()))?;
        tracing::info!(key = %self.versions_key, packages = report.packages, versions = report.versions, "Wrote versions index");
        Ok(report)
    }

    async fn list(&self, prefix: String) -> Result<Vec<String>> {
        self.backend.list_prefixes(&prefix).await.or_raise(|| ErrorKind::Storage(prefix.clone()))
    }
}

/// Semver order where both sides parse, plain string order otherwise.
fn compare_versions(a: &str, b: &str) -> Ordering {
    match (Version::parse(a), Version::parse(b)) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}
