//! Layered configuration.
//!
//! Sources, later ones overriding earlier ones:
//!
//! 1. built-in defaults,
//! 2. a config file (TOML, YAML or JSON, chosen by extension): the path given
//!    on the command line, or `config.toml` in the platform config directory
//!    if it exists,
//! 3. environment variables prefixed `REGMIRROR_`, with `__` separating
//!    nested keys (`REGMIRROR_STORAGE__BUCKET=mirror`).

pub mod error;
mod sections;

pub use crate::sections::{
    BackendConfig, CatalogConfig, FollowerConfig, PolicyConfig, QueuesConfig, RegistryConfig, StorageConfig,
    WorkerConfig,
};
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

const ENV_PREFIX: &str = "REGMIRROR_";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub queues: QueuesConfig,
    pub registry: RegistryConfig,
    pub follower: FollowerConfig,
    pub policy: PolicyConfig,
    pub catalog: CatalogConfig,
    pub worker: WorkerConfig,
}

impl Config {
    /// Load and validate the configuration.
    ///
    /// An explicitly given file must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, ENV_PREFIX)
    }

    fn load_with_env(path: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let file = match path {
            Some(path) if !path.is_file() => exn::bail!(ErrorKind::Load(path.display().to_string())),
            Some(path) => Some(path.to_path_buf()),
            None => default_path().filter(|p| p.is_file()),
        };
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(file) = &file {
            tracing::debug!(path = %file.display(), "Loading configuration file");
            figment = match file.extension().and_then(|e| e.to_str()) {
                Some("toml") => figment.merge(Toml::file(file)),
                Some("yaml" | "yml") => figment.merge(Yaml::file(file)),
                Some("json") => figment.merge(Json::file(file)),
                _ => exn::bail!(ErrorKind::Invalid(format!("config file extension of {}", file.display()))),
            };
        }
        figment = figment.merge(Env::prefixed(env_prefix).split("__"));
        Self::extract(figment, file.as_deref())
    }

    fn extract(figment: Figment, file: Option<&Path>) -> Result<Self> {
        let source = file.map(|f| f.display().to_string()).unwrap_or_else(|| "defaults and environment".to_string());
        let config: Config = figment.extract().or_raise(|| ErrorKind::Load(source))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would only fail later, mid-run.
    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str| exn::Exn::from(ErrorKind::Invalid(field.to_string()));

        match &self.storage.backend {
            BackendConfig::Local { path } if !path.is_absolute() => return Err(invalid("storage.path")),
            BackendConfig::S3 { bucket, .. } if bucket.trim().is_empty() => return Err(invalid("storage.bucket")),
            BackendConfig::S3 { region, .. } if region.trim().is_empty() => return Err(invalid("storage.region")),
            _ => {},
        }

        if self.queues.max_receives == 0 {
            return Err(invalid("queues.max_receives"));
        }
        let queue_names = [
            ("queues.staging", Some(&self.queues.staging)),
            ("queues.ingestion", Some(&self.queues.ingestion)),
            ("queues.prune", Some(&self.queues.prune)),
            ("queues.catalog_trigger", self.queues.catalog_trigger.as_ref()),
        ];
        for (field, name) in queue_names {
            if let Some(name) = name
                && (name.is_empty() || name.contains('/'))
            {
                return Err(invalid(field));
            }
        }

        match Url::parse(&self.registry.feed_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {},
            _ => return Err(invalid("registry.feed_url")),
        }
        if self.registry.timeout_secs == 0 {
            return Err(invalid("registry.timeout_secs"));
        }
        if self.registry.batch_size == 0 {
            return Err(invalid("registry.batch_size"));
        }

        if self.follower.budget_secs == 0 {
            return Err(invalid("follower.budget_secs"));
        }
        let keys = [
            ("follower.cursor_key", &self.follower.cursor_key),
            ("policy.deny_list_key", &self.policy.deny_list_key),
            ("policy.license_list_key", &self.policy.license_list_key),
            ("catalog.catalog_key", &self.catalog.catalog_key),
            ("catalog.versions_key", &self.catalog.versions_key),
        ];
        for (field, key) in keys {
            if key.is_empty() || key.ends_with('/') {
                return Err(invalid(field));
            }
        }
        if self.policy.frameworks.iter().any(|rule| rule.name.is_empty()) {
            return Err(invalid("policy.frameworks"));
        }

        if self.catalog.data_prefix.is_empty() || !self.catalog.data_prefix.ends_with('/') {
            return Err(invalid("catalog.data_prefix"));
        }
        if self.catalog.list_concurrency == 0 {
            return Err(invalid("catalog.list_concurrency"));
        }
        if self.worker.concurrency == 0 {
            return Err(invalid("worker.concurrency"));
        }
        if self.worker.receive_batch == 0 {
            return Err(invalid("worker.receive_batch"));
        }
        Ok(())
    }
}

/// `config.toml` in the platform's config directory for regmirror.
pub fn default_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "regmirror").map(|dirs| dirs.config_dir().join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;
    use time::macros::datetime;

    fn write_config(extension: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(extension).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_toml_file() {
        let file = write_config(
            ".toml",
            r#"
            [storage]
            type = "s3"
            bucket = "mirror"
            region = "us-west-004"
            endpoint = "https://s3.us-west-004.backblazeb2.com"
            key_id = "id"
            key_secret = "secret"
            dry_run = true

            [follower]
            epoch = "2020-01-01T00:00:00Z"

            [[policy.frameworks]]
            name = "projen"
            packages = ["projen"]
            "#,
        );
        let config = Config::load_with_env(Some(file.path()), "REGMIRROR_TEST_TOML_").unwrap();
        assert!(config.storage.dry_run);
        assert!(matches!(config.storage.backend, BackendConfig::S3 { ref bucket, prefix: None, .. } if bucket == "mirror"));
        assert_eq!(config.follower.epoch, datetime!(2020-01-01 00:00:00 UTC));
        assert_eq!(config.policy.frameworks.len(), 1);
        // Untouched sections keep their defaults.
        assert_eq!(config.registry, RegistryConfig::default());
    }

    #[test]
    fn test_yaml_file() {
        let file = write_config(".yaml", "registry:\n  batch_size: 25\nqueues:\n  catalog_trigger: rebuild\n");
        let config = Config::load_with_env(Some(file.path()), "REGMIRROR_TEST_YAML_").unwrap();
        assert_eq!(config.registry.batch_size, 25);
        assert_eq!(config.queues.catalog_trigger.as_deref(), Some("rebuild"));
    }

    #[test]
    fn test_environment_overrides_file() {
        let file = write_config(".json", r#"{"worker": {"concurrency": 4, "receive_batch": 2}}"#);
        // SAFETY: the variable name is unique to this test.
        unsafe { std::env::set_var("REGMIRROR_TEST_ENV_WORKER__CONCURRENCY", "16") };
        let config = Config::load_with_env(Some(file.path()), "REGMIRROR_TEST_ENV_").unwrap();
        assert_eq!(config.worker.concurrency, 16);
        assert_eq!(config.worker.receive_batch, 2);
    }

    #[test]
    fn test_missing_explicit_file() {
        let err = Config::load_with_env(Some(Path::new("/nonexistent/regmirror.toml")), "REGMIRROR_TEST_MISSING_")
            .unwrap_err();
        assert!(matches!(&*err, ErrorKind::Load(_)));
    }

    #[test]
    fn test_unknown_extension() {
        let file = write_config(".ini", "[storage]");
        let err = Config::load_with_env(Some(file.path()), "REGMIRROR_TEST_INI_").unwrap_err();
        assert!(matches!(&*err, ErrorKind::Invalid(_)));
    }

    #[rstest]
    #[case::batch_size(|c: &mut Config| c.registry.batch_size = 0, "registry.batch_size")]
    #[case::feed_url(|c: &mut Config| c.registry.feed_url = "ftp://registry".to_string(), "registry.feed_url")]
    #[case::relative_path(|c: &mut Config| c.storage.backend = BackendConfig::Local { path: "store".into() }, "storage.path")]
    #[case::queue_name(|c: &mut Config| c.queues.prune = "a/b".to_string(), "queues.prune")]
    #[case::data_prefix(|c: &mut Config| c.catalog.data_prefix = "data".to_string(), "catalog.data_prefix")]
    #[case::cursor_key(|c: &mut Config| c.follower.cursor_key = String::new(), "follower.cursor_key")]
    #[case::concurrency(|c: &mut Config| c.catalog.list_concurrency = 0, "catalog.list_concurrency")]
    fn test_validation(#[case] mutate: fn(&mut Config), #[case] field: &str) {
        let mut config = Config::default();
        mutate(&mut config);
        let err = config.validate().unwrap_err();
        assert!(matches!(&*err, ErrorKind::Invalid(f) if f == field));
    }
}
