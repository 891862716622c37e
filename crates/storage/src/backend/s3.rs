//! Mirror storage on an S3 bucket (or anything that speaks the S3 API).
//!
//! Keys live under an optional bucket prefix. Credentials come from the
//! configuration file only.
//!
//! TODO: fall back to the AWS SDK credential provider chain when no key pair
//! is configured, so the followers can run under instance roles.

use crate::{
    ListPage, Metadata, Object, ObjectInfo, StorageBackend,
    error::{ErrorKind, Result},
    validate_key, validate_prefix,
};
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::{BehaviorVersion, Credentials, Region, retry::RetryConfig},
    error::{DisplayErrorContext, SdkError},
    primitives::{ByteStream, DateTime},
};
use exn::ResultExt;
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Upper bound on in-flight S3 calls per backend.
const DEFAULT_CONCURRENT_REQUESTS: usize = 100;

/// Bucket-backed storage. Object metadata maps onto S3 user metadata and
/// delimited listings onto `ListObjectsV2` common prefixes.
///
/// # Examples
///
/// ```no_run
/// use regmirror_storage::backend::S3Backend;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = S3Backend::new(
///     "mirror",
///     "my-bucket",
///     Some("mirror/".to_string()),
///     "us-west-004",
///     Some("https://s3.us-west-004.backblazeb2.com".to_string()),
///     "access_key_id",
///     "secret_access_key",
/// ).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct S3Backend {
    name: String,
    client: Client,
    bucket: String,
    prefix: Option<String>,
    /// Caps in-flight requests.
    rate_limiter: Arc<Semaphore>,
}

impl S3Backend {
    /// Build a client for `bucket`. `prefix` must be a valid key; `endpoint`
    /// is only needed for providers other than AWS.
    pub async fn new(
        name: impl Into<String>,
        bucket: impl Into<String>,
        prefix: Option<String>,
        region: impl Into<String>,
        endpoint: Option<impl Into<String>>,
        key_id: impl Into<String>,
        key_secret: impl Into<String>,
    ) -> Result<Self> {
        let prefix = prefix.map(|p| validate_key(&p)).transpose()?;
        let name = name.into();
        let bucket = bucket.into();
        let region = Region::new(region.into());
        let credentials = Credentials::new(key_id, key_secret, None, None, "regmirror-config");
        let mut config_builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(region)
            .retry_config(RetryConfig::standard().with_max_attempts(4))
            // Virtual-host addressing breaks on most self-hosted endpoints.
            .force_path_style(true);
        if let Some(endpoint_url) = endpoint {
            config_builder = config_builder.endpoint_url(endpoint_url);
        }
        let client = Client::from_conf(config_builder.build());
        let rate_limiter = Arc::new(Semaphore::new(DEFAULT_CONCURRENT_REQUESTS));
        Ok(Self {
            name,
            client,
            bucket,
            prefix,
            rate_limiter,
        })
    }

    /// Construct the full S3 key from a relative key.
    fn full_key(&self, key: &str) -> Result<String> {
        Ok(join_prefix(self.prefix.as_deref(), &validate_key(key)?))
    }

    /// Acquire a rate limiter permit before making an S3 API call.
    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        self.rate_limiter
            .clone()
            .acquire_owned()
            .await
            .or_raise(|| ErrorKind::BackendError("S3 rate limiter closed".to_string()))
    }

    /// Convert AWS DateTime to OffsetDateTime.
    fn parse_datetime(dt: Option<&DateTime>) -> Result<OffsetDateTime> {
        match dt {
            Some(dt) => OffsetDateTime::from_unix_timestamp_nanos(dt.as_nanos())
                .or_raise(|| ErrorKind::BackendError("S3 datetime out of range".to_string())),
            None => Ok(OffsetDateTime::UNIX_EPOCH),
        }
    }

    fn object_info(key: &str, size: Option<i64>, modified: Option<&DateTime>, etag: Option<&str>) -> Result<ObjectInfo> {
        let info = ObjectInfo::new(key, size.unwrap_or_default().max(0) as u64, Self::parse_datetime(modified)?);
        Ok(match etag {
            Some(etag) => info.with_etag(etag.trim_matches('"')),
            None => info,
        })
    }
}

/// Join the backend prefix and a relative key (or listing prefix).
fn join_prefix(prefix: Option<&str>, key: &str) -> String {
    match prefix {
        Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), key),
        None => key.to_string(),
    }
}

/// Strip the configured prefix from an S3 key to get the relative key.
fn relative_key<'a>(prefix: Option<&str>, key: &'a str) -> &'a str {
    match prefix {
        Some(prefix) => {
            let prefix_normalized = prefix.trim_end_matches('/');
            key.strip_prefix(prefix_normalized).and_then(|s| s.strip_prefix('/')).unwrap_or(key)
        },
        None => key,
    }
}

fn map_sdk_error<E, R>(err: SdkError<E, R>, key: &str) -> ErrorKind
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => {
            ErrorKind::Network(format!("{key}: {}", DisplayErrorContext(&err)))
        },
        _ => ErrorKind::BackendError(format!("{key}: {}", DisplayErrorContext(&err))),
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn name(&self) -> &str {
        &self.name
    }

    fn uri(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, join_prefix(self.prefix.as_deref(), key))
    }

    async fn list_page(&self, prefix: &str, delimited: bool, continuation: Option<&str>) -> Result<ListPage> {
        let full_prefix = join_prefix(self.prefix.as_deref(), &validate_prefix(prefix)?);
        let _permit = self.acquire_permit().await?;
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&full_prefix)
            .set_delimiter(delimited.then(|| "/".to_string()))
            .set_continuation_token(continuation.map(str::to_string))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &full_prefix))?;

        let mut page = ListPage::default();
        for object in output.contents() {
            let Some(key) = object.key() else {
                continue;
            };
            let key = relative_key(self.prefix.as_deref(), key);
            page.objects.push(Self::object_info(key, object.size(), object.last_modified(), object.e_tag())?);
        }
        for common in output.common_prefixes() {
            if let Some(rolled) = common.prefix() {
                page.prefixes.push(relative_key(self.prefix.as_deref(), rolled).to_string());
            }
        }
        page.continuation = output.next_continuation_token().map(str::to_string);
        Ok(page)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self.stat(key).await {
            Ok(_) => Ok(true),
            Err(e) if matches!(&*e, ErrorKind::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn read_object(&self, key: &str) -> Result<Object> {
        let full_key = self.full_key(key)?;
        let _permit = self.acquire_permit().await?;
        let output = match self.client.get_object().bucket(&self.bucket).key(&full_key).send().await {
            Ok(output) => output,
            Err(e) if e.as_service_error().is_some_and(|s| s.is_no_such_key()) => {
                exn::bail!(ErrorKind::NotFound(key.to_string()))
            },
            Err(e) => exn::bail!(map_sdk_error(e, &full_key)),
        };
        let info = Self::object_info(key, output.content_length(), output.last_modified(), output.e_tag())?;
        let metadata: Metadata = output.metadata().map(|m| m.clone().into_iter().collect()).unwrap_or_default();
        let data = output
            .body
            .collect()
            .await
            .or_raise(|| ErrorKind::Network(format!("{full_key}: body interrupted")))?
            .into_bytes()
            .to_vec();
        Ok(Object { info, metadata, data })
    }

    async fn write(&self, key: &str, data: &[u8], metadata: &Metadata) -> Result<()> {
        let full_key = self.full_key(key)?;
        let metadata: HashMap<String, String> = metadata.clone().into_iter().collect();
        let _permit = self.acquire_permit().await?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .body(ByteStream::from(data.to_vec()))
            .set_metadata((!metadata.is_empty()).then_some(metadata))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &full_key))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let full_key = self.full_key(key)?;
        let _permit = self.acquire_permit().await?;
        // S3 reports success for keys that do not exist.
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &full_key))?;
        Ok(())
    }

    async fn stat(&self, key: &str) -> Result<ObjectInfo> {
        let full_key = self.full_key(key)?;
        let _permit = self.acquire_permit().await?;
        match self.client.head_object().bucket(&self.bucket).key(&full_key).send().await {
            Ok(output) => Self::object_info(key, output.content_length(), output.last_modified(), output.e_tag()),
            Err(e) if e.as_service_error().is_some_and(|s| s.is_not_found()) => {
                exn::bail!(ErrorKind::NotFound(key.to_string()))
            },
            Err(e) => exn::bail!(map_sdk_error(e, &full_key)),
        }
    }
}
