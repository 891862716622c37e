//! The catalog: the newest version of every major line of every package in
//! the downstream index.

use crate::error::{ErrorKind, Result};
use crate::layout::parse_package_json_key;
use exn::ResultExt;
use futures::{StreamExt, TryStreamExt, stream};
use regmirror_config::CatalogConfig;
use regmirror_policy::DenyList;
use regmirror_registry::VersionInfo;
use regmirror_storage::{BackendHandle, Metadata};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub name: String,
    pub version: String,
    pub major: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Catalog {
    pub packages: Vec<CatalogEntry>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogReport {
    pub read: usize,
    /// Index entries that could not be read or parsed.
    pub unreadable: usize,
    pub entries: usize,
}

/// Keep the highest version of each `(name, major)`, dropping versions that
/// are not semver or are deny-listed. Sorted by name, then major.
pub fn reduce<'v>(versions: impl IntoIterator<Item = &'v VersionInfo>, deny_list: &DenyList) -> Vec<CatalogEntry> {
    let mut newest: BTreeMap<(&str, u64), (Version, &VersionInfo)> = BTreeMap::new();
    for info in versions {
        let Ok(version) = Version::parse(&info.version) else {
            tracing::debug!(id = %info.id(), "Skipping version that is not semver");
            continue;
        };
        if deny_list.lookup(&info.name, &info.version).is_some() {
            continue;
        }
        match newest.entry((info.name.as_str(), version.major)) {
            Entry::Vacant(slot) => {
                slot.insert((version, info));
            },
            Entry::Occupied(mut slot) if version > slot.get().0 => {
                slot.insert((version, info));
            },
            Entry::Occupied(_) => {},
        }
    }
    newest
        .into_iter()
        .map(|((name, major), (_, info))| CatalogEntry {
            name: name.to_string(),
            version: info.version.clone(),
            major,
            description: info.description.clone(),
            license: info.license.clone(),
            keywords: info.keywords.clone(),
        })
        .collect()
}

pub struct CatalogBuilder {
    backend: BackendHandle,
    data_prefix: String,
    catalog_key: String,
    concurrency: usize,
}

impl CatalogBuilder {
    pub fn new(backend: BackendHandle, config: &CatalogConfig) -> Self {
        Self {
            backend,
            data_prefix: config.data_prefix.clone(),
            catalog_key: config.catalog_key.clone(),
            concurrency: config.list_concurrency.max(1),
        }
    }

    /// Rebuild the catalog from scratch and replace the stored one.
    pub async fn run(&self, deny_list: &DenyList) -> Result<CatalogReport> {
        let keys: Vec<String> = self
            .backend
            .list_stream(&self.data_prefix)
            .map_ok(|info| info.key)
            .try_filter(|key| std::future::ready(parse_package_json_key(&self.data_prefix, key).is_some()))
            .try_collect()
            .await
            .or_raise(|| ErrorKind::Storage(self.data_prefix.clone()))?;

        let loaded: Vec<Option<VersionInfo>> =
            stream::iter(&keys).map(|key| self.load(key)).buffer_unordered(self.concurrency).collect().await;
        let mut report = CatalogReport {
            read: keys.len(),
            ..Default::default()
        };
        let versions: Vec<VersionInfo> = loaded.into_iter().flatten().collect();
        report.unreadable = keys.len() - versions.len();

        let catalog = Catalog {
            packages: reduce(&versions, deny_list),
            updated_at: OffsetDateTime::now_utc(),
        };
        report.entries = catalog.packages.len();
        let data = serde_json::to_vec(&catalog).or_raise(|| ErrorKind::Encode("catalog".to_string()))?;
        let metadata = Metadata::from([("entry-count".to_string(), report.entries.to_string())]);
        self.backend
            .write(&self.catalog_key, &data, &metadata)
            .await
            .or_raise(|| ErrorKind::Storage(self.catalog_key.clone()))?;
        tracing::info!(key = %self.catalog_key, entries = report.entries, unreadable = report.unreadable, "Wrote catalog");
        Ok(report)
    }

    /// Read one `package.json`, filling in name and version from its key if
    /// the document lacks them. `None` if it cannot be read.
    async fn load(&self, key: &str) -> Option<VersionInfo> {
        let (name, version) = parse_package_json_key(&self.data_prefix, key)?;
        let data = match self.backend.read(key).await {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(key, error = ?err, "Skipping unreadable index entry");
                return None;
            },
        };
        let mut info: VersionInfo = match serde_json::from_slice(&data) {
            Ok(info) => info,
            Err(err) => {
                tracing::warn!(key, error = %err, "Skipping unparsable index entry");
                return None;
            },
        };
        if info.name.is_empty() {
            info.name = name.to_string();
        }
        if info.version.is_empty() {
            info.version = version.to_string();
        }
        Some(info)
    }
}
