//! The license allow-list.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use regmirror_storage::BackendHandle;
use serde::Deserialize;
use std::collections::BTreeSet;

/// Stand-in license for versions that declare none.
pub const UNLICENSED: &str = "UNLICENSED";

/// Used when no allow-list has been stored: common OSI-approved licenses.
pub const DEFAULT_LICENSES: &[&str] = &[
    "0BSD",
    "Apache-2.0",
    "BSD-2-Clause",
    "BSD-3-Clause",
    "EPL-2.0",
    "ISC",
    "MIT",
    "MIT-0",
    "MPL-2.0",
    "Zlib",
];

#[derive(Deserialize)]
#[serde(untagged)]
enum Document {
    Wrapped { licenses: Vec<String> },
    Bare(Vec<String>),
}

/// An immutable snapshot of the acceptable license identifiers. Matching is
/// case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseList {
    allowed: BTreeSet<String>,
}

impl LicenseList {
    pub fn new<S: AsRef<str>>(licenses: impl IntoIterator<Item = S>) -> Self {
        Self {
            allowed: licenses.into_iter().map(|l| normalize(l.as_ref())).filter(|l| !l.is_empty()).collect(),
        }
    }

    /// Whether a version declaring `license` may be accepted. No license
    /// counts as [`UNLICENSED`].
    pub fn allows(&self, license: Option<&str>) -> bool {
        self.allowed.contains(&normalize(license.unwrap_or(UNLICENSED)))
    }

    pub fn len(&self) -> usize {
        self.allowed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }

    /// Parse the persisted form, `{"licenses": [...]}` or a bare array.
    pub fn from_json(name: &str, data: &[u8]) -> Result<Self> {
        let licenses = match serde_json::from_slice::<Document>(data).or_raise(|| ErrorKind::Malformed(name.to_string()))? {
            Document::Wrapped { licenses } | Document::Bare(licenses) => licenses,
        };
        Ok(Self::new(licenses))
    }

    /// Load the list stored at `key`, falling back to [`DEFAULT_LICENSES`].
    pub async fn load(backend: &BackendHandle, key: &str) -> Result<Self> {
        let Some(data) = backend.try_read(key).await.or_raise(|| ErrorKind::Storage(key.to_string()))? else {
            tracing::info!(backend = backend.name(), key, "No license list found, using defaults");
            return Ok(Self::default());
        };
        let list = Self::from_json(key, &data)?;
        tracing::debug!(backend = backend.name(), key, licenses = list.len(), "Loaded license list");
        Ok(list)
    }
}
impl Default for LicenseList {
    fn default() -> Self {
        Self::new(DEFAULT_LICENSES)
    }
}

fn normalize(license: &str) -> String {
    license.trim().to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use regmirror_storage::backend::MockBackend;
    use rstest::rstest;
    use std::sync::Arc;

    #[rstest]
    #[case(Some("MIT"), true)]
    #[case(Some("mit"), true)]
    #[case(Some(" Apache-2.0 "), true)]
    #[case(Some("GPL-3.0"), false)]
    #[case(None, false)]
    fn test_default_list(#[case] license: Option<&str>, #[case] allowed: bool) {
        assert_eq!(LicenseList::default().allows(license), allowed);
    }

    #[test]
    fn test_unlicensed_can_be_allowed() {
        let list = LicenseList::new(["MIT", "unlicensed"]);
        assert!(list.allows(None));
        assert!(list.allows(Some("UNLICENSED")));
    }

    #[rstest]
    #[case(br#"{"licenses": ["MIT", "ISC"]}"#.as_slice())]
    #[case(br#"["MIT", "ISC"]"#.as_slice())]
    fn test_from_json(#[case] json: &[u8]) {
        let list = LicenseList::from_json("licenses.json", json).unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.allows(Some("isc")));
        assert!(!list.allows(Some("Apache-2.0")));
    }

    #[tokio::test]
    async fn test_load() {
        let backend: BackendHandle = Arc::new(MockBackend::default());
        assert_eq!(LicenseList::load(&backend, "licenses.json").await.unwrap(), LicenseList::default());

        let backend: BackendHandle =
            Arc::new(MockBackend::with_objects([("licenses.json", Vec::from(*br#"{"licenses": "MIT"}"#))]));
        let err = LicenseList::load(&backend, "licenses.json").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Malformed(_)));
    }
}
