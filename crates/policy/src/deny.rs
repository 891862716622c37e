//! The deny list.
//!
//! A rule either covers a whole package (`foo`) or a single version of it
//! (`foo/v1.2.3`). A package may have one or the other, never both: a mix
//! would make it unclear whether removing the package-wide rule should
//! un-deny the versions.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use regmirror_storage::BackendHandle;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DenyRule {
    pub package_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub reason: String,
}

impl DenyRule {
    /// The map key this rule is filed under: `name` or `name/v<version>`.
    pub fn key(&self) -> String {
        match &self.version {
            Some(version) => version_key(&self.package_name, version),
            None => self.package_name.clone(),
        }
    }
}

fn version_key(name: &str, version: &str) -> String {
    format!("{name}/v{version}")
}

/// An immutable snapshot of the deny list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DenyList {
    rules: BTreeMap<String, DenyRule>,
}

impl DenyList {
    /// Build the list, rejecting duplicate keys and packages that have both a
    /// package-wide and version-scoped rules (whichever comes first).
    pub fn build(rules: impl IntoIterator<Item = DenyRule>) -> Result<Self> {
        let mut map: BTreeMap<String, DenyRule> = BTreeMap::new();
        for rule in rules {
            let key = rule.key();
            if map.contains_key(&key) {
                exn::bail!(ErrorKind::Duplicate(key));
            }
            let conflicting: Vec<&str> = match &rule.version {
                None => map
                    .values()
                    .filter(|other| other.package_name == rule.package_name)
                    .filter_map(|other| other.version.as_deref())
                    .collect(),
                Some(version) => match map.contains_key(&rule.package_name) {
                    true => vec![version.as_str()],
                    false => vec![],
                },
            };
            if !conflicting.is_empty() {
                exn::bail!(ErrorKind::ConflictingScope {
                    package: rule.package_name.clone(),
                    versions: conflicting.join(", "),
                });
            }
            map.insert(key, rule);
        }
        Ok(Self { rules: map })
    }

    /// Find the rule that denies `name@version`: the version-scoped rule if
    /// one exists, otherwise the package-wide one.
    pub fn lookup(&self, name: &str, version: &str) -> Option<&DenyRule> {
        self.rules.get(&version_key(name, version)).or_else(|| self.rules.get(name))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Rules in key order.
    pub fn rules(&self) -> impl Iterator<Item = &DenyRule> {
        self.rules.values()
    }

    /// Parse the persisted form: one JSON object mapping each rule's key to
    /// the rule.
    pub fn from_json(name: &str, data: &[u8]) -> Result<Self> {
        let document: BTreeMap<String, DenyRule> =
            serde_json::from_slice(data).or_raise(|| ErrorKind::Malformed(name.to_string()))?;
        for (key, rule) in &document {
            let expected = rule.key();
            if *key != expected {
                exn::bail!(ErrorKind::KeyMismatch { key: key.clone(), expected });
            }
        }
        Self::build(document.into_values())
    }

    /// Load the list stored at `key`. A missing object is an empty list.
    pub async fn load(backend: &BackendHandle, key: &str) -> Result<Self> {
        let Some(data) = backend.try_read(key).await.or_raise(|| ErrorKind::Storage(key.to_string()))? else {
            tracing::info!(backend = backend.name(), key, "No deny list found, nothing is denied");
            return Ok(Self::default());
        };
        let list = Self::from_json(key, &data)?;
        tracing::debug!(backend = backend.name(), key, rules = list.len(), "Loaded deny list");
        Ok(list)
    }
}
