//! Key validation and security utilities.
//!
//! Object keys are flat strings using `/` as a separator. Local backends map
//! them onto the filesystem, so they must never be able to escape the
//! storage root.

use crate::error::{ErrorKind, Result};

/// Validates an object key, returning its normalized form.
///
/// Duplicate separators, `.` segments, and leading or trailing slashes are
/// collapsed. `..` segments are resolved but must never leave the root.
///
/// > **Note:** Null bytes and backslashes are rejected outright.
///
/// # Examples
///
/// ```
/// use regmirror_storage::validate_key;
/// // Valid keys
/// assert!(validate_key("staged/foo-1.0.0.tgz").is_ok());
/// assert!(validate_key("a/../file.json").is_ok()); // (never leaves the root)
/// // Invalid keys
/// assert!(validate_key("../etc/passwd").is_err());
/// assert!(validate_key("a/../../b").is_err()); // (leaves the root)
/// assert!(validate_key("a\0b").is_err());
/// // Keys get normalized
/// assert_eq!(validate_key("/staged//@scope/./pkg/-/pkg-1.0.0.tgz").unwrap(), "staged/@scope/pkg/-/pkg-1.0.0.tgz");
/// ```
pub fn validate(key: impl AsRef<str>) -> Result<String> {
    let key = key.as_ref();
    let mut segments: Vec<&str> = Vec::new();
    for segment in key.split('/') {
        match segment {
            "" | "." => {},
            ".." => {
                if segments.pop().is_none() {
                    exn::bail!(ErrorKind::InvalidKey(key.to_string()));
                }
            },
            s if s.contains('\0') || s.contains('\\') => exn::bail!(ErrorKind::InvalidKey(key.to_string())),
            s => segments.push(s),
        }
    }
    match segments.is_empty() {
        true => exn::bail!(ErrorKind::InvalidKey(key.to_string())),
        false => Ok(segments.join("/")),
    }
}

/// Validates a listing prefix.
///
/// Unlike keys, prefixes are matched byte-for-byte against keys (the way
/// S3 does it), so they are returned untouched. The empty prefix is valid
/// and matches everything.
pub fn validate_prefix(prefix: impl AsRef<str>) -> Result<String> {
    let prefix = prefix.as_ref();
    let escapes = prefix.split('/').any(|segment| segment == "..");
    if escapes || prefix.starts_with('/') || prefix.contains('\0') || prefix.contains('\\') {
        exn::bail!(ErrorKind::InvalidKey(prefix.to_string()));
    }
    Ok(prefix.to_string())
}
