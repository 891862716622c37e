//! Upstream package registry access: document models, the change feed and
//! tarball downloads.

pub mod error;
mod feed;
mod models;
mod tarball;

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use std::time::Duration;

#[cfg(feature = "mock")]
pub use crate::feed::MockChangeFeed;
pub use crate::feed::{ChangeBatch, ChangeFeed, CouchChangeFeed};
pub use crate::models::{ChangeRecord, Dist, PackageDocument, VersionInfo};
#[cfg(feature = "mock")]
pub use crate::tarball::MockTarballSource;
pub use crate::tarball::{HttpTarballSource, TarballSource};

/// Build the HTTP client shared by the feed and tarball clients for a run.
pub fn http_client(user_agent: &str, timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder().user_agent(user_agent).timeout(timeout).build().or_raise(|| ErrorKind::Client)
}
