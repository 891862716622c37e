//! Object key layout.
//!
//! ```text
//! staged/<tarball URL path>                 staged tarballs
//! <data>/<name>/v<version>/package.json     downstream index, one per version
//! ```

use regmirror_policy::DenyRule;
use regmirror_storage::validate_key;
use url::Url;

pub const STAGED_PREFIX: &str = "staged/";
pub const PACKAGE_JSON: &str = "package.json";

/// The key a tarball is staged under: its URL path, with duplicate
/// separators collapsed, below [`STAGED_PREFIX`].
///
/// Returns `None` if the path is empty or escapes the prefix.
pub fn staged_key(url: &Url) -> Option<String> {
    let path = validate_key(url.path()).ok()?;
    Some(format!("{STAGED_PREFIX}{path}"))
}

/// `<data>/<name>/`
pub fn package_prefix(data_prefix: &str, name: &str) -> String {
    format!("{data_prefix}{name}/")
}

/// `<data>/<name>/v<version>/`
pub fn version_prefix(data_prefix: &str, name: &str, version: &str) -> String {
    format!("{data_prefix}{name}/v{version}/")
}

/// Every object a deny rule covers lives under this prefix.
pub fn rule_prefix(data_prefix: &str, rule: &DenyRule) -> String {
    match &rule.version {
        Some(version) => version_prefix(data_prefix, &rule.package_name, version),
        None => package_prefix(data_prefix, &rule.package_name),
    }
}

/// Split `<data>/<name>/v<version>/package.json` into name and version.
pub fn parse_package_json_key<'k>(data_prefix: &str, key: &'k str) -> Option<(&'k str, &'k str)> {
    let rest = key.strip_prefix(data_prefix)?.strip_suffix(PACKAGE_JSON)?.strip_suffix('/')?;
    let (name, version) = rest.rsplit_once("/v")?;
    (!name.is_empty() && !version.is_empty() && !version.contains('/')).then_some((name, version))
}
