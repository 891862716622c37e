//! Upstream registry models.
//!
//! Registry documents are old and inconsistent: decades of publishing tools
//! have produced every variant of every field. Deserialization here is
//! lenient about shape (licenses as objects, keywords as a string,
//! descriptions that are not strings, dependency maps with junk values) and
//! strict only about what the pipeline cannot work without. `dist` is added
//! by the registry, so a bare `package.json` has none; only feed documents
//! must carry a tarball.

use crate::error::{ErrorKind, Result};
use serde::de::{Deserializer, Error as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Keys of a document's `time` map that are not versions.
const TIME_SENTINELS: [&str; 2] = ["created", "modified"];

/// One entry of the upstream change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub sequence: u64,
    pub document_id: String,
    /// The raw document; `Null` when the feed did not include it.
    pub document: Value,
    pub deleted: bool,
}
impl ChangeRecord {
    /// The package name carried by the document, if any.
    pub fn name(&self) -> Option<&str> {
        self.document.get("name").and_then(Value::as_str).filter(|n| !n.is_empty())
    }
}

/// A normalized package document.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageDocument {
    pub name: String,
    pub versions: BTreeMap<String, VersionInfo>,
    /// Publication/modification time per version, without the `created`
    /// and `modified` sentinels.
    pub times: BTreeMap<String, OffsetDateTime>,
    /// The document-level `modified` sentinel, if present.
    pub modified: Option<OffsetDateTime>,
}

impl PackageDocument {
    /// Normalize a raw registry document.
    ///
    /// Fails with [`ErrorKind::Unprocessable`] if the document has no name,
    /// no `versions` or `time` maps, any entry in them cannot be read, or a
    /// version has no tarball.
    pub fn parse(document: &Value) -> Result<Self> {
        let unprocessable = |reason: &str| ErrorKind::Unprocessable(reason.to_string());
        let Some(name) = document.get("name").and_then(Value::as_str) else {
            exn::bail!(unprocessable("missing name"));
        };
        let Some(raw_versions) = document.get("versions").and_then(Value::as_object) else {
            exn::bail!(unprocessable(&format!("{name}: missing versions")));
        };
        let Some(raw_times) = document.get("time").and_then(Value::as_object) else {
            exn::bail!(unprocessable(&format!("{name}: missing times")));
        };

        let mut versions = BTreeMap::new();
        for (version, info) in raw_versions {
            let Ok(info) = VersionInfo::deserialize(info) else {
                exn::bail!(unprocessable(&format!("{name}@{version}: malformed version")));
            };
            if info.dist.tarball.is_empty() {
                exn::bail!(unprocessable(&format!("{name}@{version}: missing tarball")));
            }
            versions.insert(version.clone(), info);
        }

        let mut times = BTreeMap::new();
        let mut modified = None;
        for (key, raw) in raw_times {
            let Some(parsed) = raw.as_str().and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok()) else {
                exn::bail!(unprocessable(&format!("{name}: malformed time for {key}")));
            };
            match key.as_str() {
                "modified" => modified = Some(parsed),
                key if TIME_SENTINELS.contains(&key) => {},
                _ => {
                    times.insert(key.clone(), parsed);
                },
            }
        }

        Ok(Self {
            name: name.to_string(),
            versions,
            times,
            modified,
        })
    }

    /// The most recent modification recorded anywhere in the document.
    pub fn last_modified(&self) -> Option<OffsetDateTime> {
        self.times.values().copied().chain(self.modified).max()
    }

    /// `(version, info, modified)` for every version present in both maps.
    pub fn modified_versions(&self) -> impl Iterator<Item = (&str, &VersionInfo, OffsetDateTime)> {
        self.times.iter().filter_map(|(version, modified)| {
            self.versions.get(version).map(|info| (version.as_str(), info, *modified))
        })
    }
}

/// A single published version, as found in a package document's `versions`
/// map (and in `package.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, deserialize_with = "description", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "license", skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, deserialize_with = "keywords", skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(default, deserialize_with = "dependency_map", skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "dependency_map", skip_serializing_if = "BTreeMap::is_empty")]
    pub dev_dependencies: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "dependency_map", skip_serializing_if = "BTreeMap::is_empty")]
    pub peer_dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub dist: Dist,
    /// The jsii assembly marker. Only its presence matters here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsii: Option<Value>,
}
impl VersionInfo {
    pub fn is_jsii(&self) -> bool {
        self.jsii.as_ref().is_some_and(|marker| !marker.is_null())
    }

    /// `name@version`, the key used for de-duplication.
    pub fn id(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dist {
    #[serde(default)]
    pub tarball: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shasum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
}

/// Accepts `"MIT"`, `{"type": "MIT"}` and arrays of either.
fn license<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<String>, D::Error> {
    fn one(value: &Value) -> Option<String> {
        match value {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Object(map) => map.get("type").and_then(one),
            _ => None,
        }
    }
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => {
            let all: Vec<_> = items.iter().filter_map(one).collect();
            match all.len() {
                0 => None,
                1 => all.into_iter().next(),
                _ => Some(format!("({})", all.join(" OR "))),
            }
        },
        other => one(&other),
    })
}

/// Anything but a non-blank string is treated as missing.
fn description<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) if !s.trim().is_empty() => Some(s),
        _ => None,
    })
}

/// Accepts an array of strings, a single (comma- or space-separated) string,
/// or nothing.
fn keywords<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items.iter().filter_map(Value::as_str).map(str::to_string).collect(),
        Value::String(s) => s.split([',', ' ']).filter(|k| !k.is_empty()).map(str::to_string).collect(),
        _ => Vec::new(),
    })
}

/// Accepts a map of name to range; non-string ranges are kept as their JSON
/// text and anything that is not a map is treated as empty.
fn dependency_map<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<BTreeMap<String, String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Object(map) => map
            .into_iter()
            .map(|(name, range)| match range {
                Value::String(range) => (name, range),
                other => (name, other.to_string()),
            })
            .collect(),
        _ => BTreeMap::new(),
    })
}

/// Sequences are either plain numbers or strings with a numeric prefix
/// (`"123-g1AAAA..."`); only the number matters for ordering.
pub(crate) fn sequence<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    parse_sequence(&value).ok_or_else(|| D::Error::custom(format!("invalid sequence: {value}")))
}

pub(crate) fn parse_sequence(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => {
            let digits: &str = s.split('-').next().unwrap_or_default();
            digits.parse().ok()
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;
    use time::macros::datetime;

    fn document() -> Value {
        json!({
            "_id": "foo",
            "name": "foo",
            "versions": {
                "1.0.0": {
                    "name": "foo",
                    "version": "1.0.0",
                    "license": "MIT",
                    "jsii": {"outdir": "dist"},
                    "dist": {"tarball": "https://registry.example/foo/-/foo-1.0.0.tgz", "shasum": "abc"}
                },
                "1.1.0": {
                    "name": "foo",
                    "version": "1.1.0",
                    "license": {"type": "Apache-2.0", "url": "https://apache.org"},
                    "keywords": "cdk, aws",
                    "dependencies": {"constructs": "^10.0.0", "weird": {"not": "a range"}},
                    "unknownField": true,
                    "dist": {"tarball": "https://registry.example/foo/-/foo-1.1.0.tgz"}
                }
            },
            "time": {
                "created": "2020-01-01T00:00:00.000Z",
                "modified": "2021-06-01T00:00:00.000Z",
                "1.0.0": "2020-01-01T00:00:00.000Z",
                "1.1.0": "2021-05-01T00:00:00.000Z",
                "0.9.0": "2019-01-01T00:00:00.000Z"
            }
        })
    }

    #[test]
    fn test_parse_document() {
        let doc = PackageDocument::parse(&document()).unwrap();
        assert_eq!(doc.name, "foo");
        assert_eq!(doc.versions.len(), 2);
        assert_eq!(doc.times.keys().collect::<Vec<_>>(), vec!["0.9.0", "1.0.0", "1.1.0"]);
        assert_eq!(doc.modified, Some(datetime!(2021-06-01 00:00:00 UTC)));
        assert_eq!(doc.last_modified(), Some(datetime!(2021-06-01 00:00:00 UTC)));

        let v100 = &doc.versions["1.0.0"];
        assert!(v100.is_jsii());
        assert_eq!(v100.license.as_deref(), Some("MIT"));
        assert_eq!(v100.id(), "foo@1.0.0");

        let v110 = &doc.versions["1.1.0"];
        assert!(!v110.is_jsii());
        assert_eq!(v110.license.as_deref(), Some("Apache-2.0"));
        assert_eq!(v110.keywords, vec!["cdk", "aws"]);
        assert_eq!(v110.dependencies["constructs"], "^10.0.0");
        assert_eq!(v110.dependencies["weird"], r#"{"not":"a range"}"#);
    }

    #[test]
    fn test_modified_versions_skips_versions_without_manifest() {
        let doc = PackageDocument::parse(&document()).unwrap();
        let pairs: Vec<_> = doc.modified_versions().map(|(version, _, _)| version).collect();
        assert_eq!(pairs, vec!["1.0.0", "1.1.0"]);
    }

    #[rstest]
    #[case::no_versions("versions")]
    #[case::no_times("time")]
    #[case::no_name("name")]
    fn test_parse_rejects_incomplete(#[case] field: &str) {
        let mut doc = document();
        doc.as_object_mut().unwrap().remove(field);
        let err = PackageDocument::parse(&doc).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Unprocessable(_)));
    }

    #[test]
    fn test_parse_rejects_bad_time() {
        let mut doc = document();
        doc["time"]["1.0.0"] = json!("yesterday");
        assert!(PackageDocument::parse(&doc).is_err());
    }

    #[rstest]
    #[case::no_dist(json!(null))]
    #[case::no_tarball(json!({"shasum": "abc"}))]
    fn test_parse_rejects_version_without_tarball(#[case] dist: Value) {
        let mut doc = document();
        let version = doc["versions"]["1.0.0"].as_object_mut().unwrap();
        match dist {
            Value::Null => version.remove("dist"),
            dist => version.insert("dist".to_string(), dist),
        };
        let err = PackageDocument::parse(&doc).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Unprocessable(reason) if reason.contains("missing tarball")));
    }

    #[test]
    fn test_manifest_without_dist() {
        let info: VersionInfo =
            serde_json::from_value(json!({"name": "a", "version": "1.0.0", "license": "MIT"})).unwrap();
        assert_eq!(info.id(), "a@1.0.0");
        assert!(info.dist.tarball.is_empty());
    }

    #[test]
    fn test_junk_description_does_not_reject_document() {
        let mut doc = document();
        doc["versions"]["1.0.0"]["description"] = json!(["old", "junk"]);
        doc["versions"]["1.1.0"]["description"] = json!("Constructs for foo");
        let doc = PackageDocument::parse(&doc).unwrap();
        assert_eq!(doc.versions["1.0.0"].description, None);
        assert_eq!(doc.versions["1.1.0"].description.as_deref(), Some("Constructs for foo"));
    }

    #[rstest]
    #[case(json!({"a": 1}), None)]
    #[case(json!(42), None)]
    #[case(json!("  "), None)]
    #[case(json!("Stack helpers"), Some("Stack helpers"))]
    fn test_description_forms(#[case] description: Value, #[case] expected: Option<&str>) {
        let info: VersionInfo = serde_json::from_value(json!({"description": description})).unwrap();
        assert_eq!(info.description.as_deref(), expected);
    }

    #[rstest]
    #[case(json!("MIT"), Some("MIT"))]
    #[case(json!({"type": "ISC"}), Some("ISC"))]
    #[case(json!([{"type": "MIT"}, {"type": "Apache-2.0"}]), Some("(MIT OR Apache-2.0)"))]
    #[case(json!([{"type": "MIT"}]), Some("MIT"))]
    #[case(json!(""), None)]
    #[case(json!(null), None)]
    fn test_license_forms(#[case] license: Value, #[case] expected: Option<&str>) {
        let info: VersionInfo = serde_json::from_value(json!({"license": license, "dist": {"tarball": "t"}})).unwrap();
        assert_eq!(info.license.as_deref(), expected);
    }

    #[rstest]
    #[case(json!(42), Some(42))]
    #[case(json!("123-g1AAAAbcd"), Some(123))]
    #[case(json!("77"), Some(77))]
    #[case(json!("now"), None)]
    #[case(json!(-1), None)]
    #[case(json!(null), None)]
    fn test_parse_sequence(#[case] value: Value, #[case] expected: Option<u64>) {
        assert_eq!(parse_sequence(&value), expected);
    }
}
