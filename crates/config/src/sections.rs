use regmirror_policy::{FrameworkRule, default_frameworks};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use time::OffsetDateTime;
use time::macros::datetime;

/// Where objects live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(flatten)]
    pub backend: BackendConfig,
    /// Log writes and deletes instead of performing them.
    #[serde(default)]
    pub dry_run: bool,
}
impl Default for StorageConfig {
    fn default() -> Self {
        let path = directories::ProjectDirs::from("", "", "regmirror")
            .map(|dirs| dirs.data_dir().join("store"))
            .unwrap_or_else(|| std::env::temp_dir().join("regmirror"));
        Self {
            backend: BackendConfig::Local { path },
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    Local {
        path: PathBuf,
    },
    S3 {
        bucket: String,
        #[serde(default)]
        prefix: Option<String>,
        region: String,
        #[serde(default)]
        endpoint: Option<String>,
        key_id: String,
        key_secret: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuesConfig {
    /// Key prefix under which store-backed queues keep their messages.
    pub root_prefix: String,
    /// Deliveries after which a failing message is dead-lettered.
    pub max_receives: u32,
    /// Stage requests from the follower to the stage worker.
    pub staging: String,
    /// Notifications for downstream ingestion of staged tarballs.
    pub ingestion: String,
    /// Objects to delete because they are deny-listed.
    pub prune: String,
    /// Notified after a prune queued anything, e.g. to rebuild the catalog.
    pub catalog_trigger: Option<String>,
}
impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            root_prefix: "queues".to_string(),
            max_receives: 5,
            staging: "staging".to_string(),
            ingestion: "ingestion".to_string(),
            prune: "prune".to_string(),
            catalog_trigger: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Base URL of the CouchDB-style replication database.
    pub feed_url: String,
    pub user_agent: String,
    pub timeout_secs: u64,
    /// Changes requested per batch.
    pub batch_size: usize,
}
impl RegistryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            feed_url: "https://replicate.npmjs.com/registry/".to_string(),
            user_agent: concat!("regmirror/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout_secs: 60,
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FollowerConfig {
    /// Wall-clock budget for one run.
    pub budget_secs: u64,
    /// Batches whose newest change predates this are not classified.
    #[serde(with = "time::serde::rfc3339")]
    pub epoch: OffsetDateTime,
    pub cursor_key: String,
}
impl FollowerConfig {
    pub fn budget(&self) -> Duration {
        Duration::from_secs(self.budget_secs)
    }
}
impl Default for FollowerConfig {
    fn default() -> Self {
        Self {
            budget_secs: 14 * 60,
            epoch: datetime!(2018-08-01 00:00:00 UTC),
            cursor_key: "state/follower-cursor.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub deny_list_key: String,
    pub license_list_key: String,
    pub frameworks: Vec<FrameworkRule>,
}
impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            deny_list_key: "policy/deny-list.json".to_string(),
            license_list_key: "policy/allowed-licenses.json".to_string(),
            frameworks: default_frameworks(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Prefix of the downstream index (`<data_prefix><name>/v<version>/`).
    pub data_prefix: String,
    pub catalog_key: String,
    pub versions_key: String,
    /// Maximum listings in flight while building the inventory.
    pub list_concurrency: usize,
}
impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            data_prefix: "data/".to_string(),
            catalog_key: "catalog.json".to_string(),
            versions_key: "all-versions.json".to_string(),
            list_concurrency: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Messages processed at once.
    pub concurrency: usize,
    /// Messages requested per receive.
    pub receive_batch: usize,
}
impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            receive_batch: 10,
        }
    }
}
