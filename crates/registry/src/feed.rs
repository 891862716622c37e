//! Change-feed clients.

use crate::error::{ErrorKind, Result};
use crate::models::{ChangeRecord, parse_sequence, sequence};
use async_trait::async_trait;
use exn::ResultExt;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

/// One page of changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeBatch {
    /// Records in ascending sequence order.
    pub records: Vec<ChangeRecord>,
    /// The feed's position after this page. Passing it back as `since`
    /// fetches the next page.
    pub last_sequence: u64,
}

/// An ordered, paginated feed of document changes.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// The feed's current high-water mark: the sequence of the most recent
    /// change.
    async fn high_water_mark(&self) -> Result<u64>;

    /// Fetch up to `limit` changes with sequences strictly after `since`.
    async fn changes(&self, since: u64, limit: usize) -> Result<ChangeBatch>;
}

/// [`ChangeFeed`] over a CouchDB-style replication endpoint.
///
/// ```text
/// GET {base}/                                       -> {"update_seq": n}
/// GET {base}/_changes?since=m&limit=k&include_docs=true
///     -> {"results": [{"seq", "id", "doc", "deleted"}], "last_seq"}
/// ```
#[derive(Debug, Clone)]
pub struct CouchChangeFeed {
    client: reqwest::Client,
    base: Url,
}

#[derive(Deserialize)]
struct DatabaseInfo {
    update_seq: Value,
}

#[derive(Deserialize)]
struct ChangesResponse {
    results: Vec<WireChange>,
    #[serde(default)]
    last_seq: Option<Value>,
}

#[derive(Deserialize)]
struct WireChange {
    #[serde(deserialize_with = "sequence")]
    seq: u64,
    id: String,
    #[serde(default)]
    doc: Value,
    #[serde(default)]
    deleted: bool,
}

impl CouchChangeFeed {
    pub fn new(client: reqwest::Client, mut base: Url) -> Self {
        // `Url::join` replaces the last path segment unless it ends in `/`.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Self { client, base }
    }

    async fn get<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        let response =
            self.client.get(url.clone()).send().await.or_raise(|| ErrorKind::Transport(url.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            exn::bail!(ErrorKind::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        response.json().await.or_raise(|| ErrorKind::Decode(url.to_string()))
    }
}

#[async_trait]
impl ChangeFeed for CouchChangeFeed {
    async fn high_water_mark(&self) -> Result<u64> {
        let info: DatabaseInfo = self.get(self.base.clone()).await?;
        let Some(sequence) = parse_sequence(&info.update_seq) else {
            exn::bail!(ErrorKind::Decode(self.base.to_string()));
        };
        Ok(sequence)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn changes(&self, since: u64, limit: usize) -> Result<ChangeBatch> {
        let mut url = self.base.join("_changes").or_raise(|| ErrorKind::Decode(self.base.to_string()))?;
        url.query_pairs_mut()
            .append_pair("since", &since.to_string())
            .append_pair("limit", &limit.to_string())
            .append_pair("include_docs", "true");
        let response: ChangesResponse = self.get(url).await?;

        let mut records: Vec<ChangeRecord> = response
            .results
            .into_iter()
            .map(|change| ChangeRecord {
                sequence: change.seq,
                document_id: change.id,
                document: change.doc,
                deleted: change.deleted,
            })
            .collect();
        records.sort_by_key(|record| record.sequence);
        let max_seen = records.last().map(|record| record.sequence).unwrap_or(since);
        let last_sequence = response.last_seq.as_ref().and_then(parse_sequence).unwrap_or(max_seen).max(max_seen);
        tracing::debug!(records = records.len(), last_sequence, "Fetched changes");
        Ok(ChangeBatch { records, last_sequence })
    }
}

#[cfg(feature = "mock")]
pub use self::mock::MockChangeFeed;

#[cfg(feature = "mock")]
mod mock {
    use super::*;
    use tokio::sync::Mutex;

    /// In-memory change feed for testing.
    pub struct MockChangeFeed {
        high_water_mark: u64,
        records: Vec<ChangeRecord>,
        requests: Mutex<Vec<(u64, usize)>>,
    }

    impl MockChangeFeed {
        /// A feed serving `records`, which are sorted by sequence. The
        /// high-water mark defaults to the highest sequence.
        pub fn new(mut records: Vec<ChangeRecord>) -> Self {
            records.sort_by_key(|record| record.sequence);
            Self {
                high_water_mark: records.last().map(|record| record.sequence).unwrap_or(0),
                records,
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn with_high_water_mark(mut self, high_water_mark: u64) -> Self {
            self.high_water_mark = high_water_mark;
            self
        }

        /// Every `(since, limit)` pair requested so far.
        pub async fn requests(&self) -> Vec<(u64, usize)> {
            self.requests.lock().await.clone()
        }
    }

    #[async_trait]
    impl ChangeFeed for MockChangeFeed {
        async fn high_water_mark(&self) -> Result<u64> {
            Ok(self.high_water_mark)
        }

        async fn changes(&self, since: u64, limit: usize) -> Result<ChangeBatch> {
            self.requests.lock().await.push((since, limit));
            let records: Vec<_> = self.records.iter().filter(|r| r.sequence > since).take(limit).cloned().collect();
            let last_sequence = records.last().map(|record| record.sequence).unwrap_or(since);
            Ok(ChangeBatch { records, last_sequence })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn feed(server: &MockServer) -> CouchChangeFeed {
        let base = Url::parse(&format!("{}/registry", server.uri())).unwrap();
        CouchChangeFeed::new(reqwest::Client::new(), base)
    }

    #[tokio::test]
    async fn test_high_water_mark() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/registry/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"db_name": "registry", "update_seq": 4521})))
            .mount(&server)
            .await;
        assert_eq!(feed(&server).await.high_water_mark().await.unwrap(), 4521);
    }

    #[tokio::test]
    async fn test_high_water_mark_string_sequence() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/registry/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"update_seq": "981-g1AAAAFTeJzLYWBg"})))
            .mount(&server)
            .await;
        assert_eq!(feed(&server).await.high_water_mark().await.unwrap(), 981);
    }

    #[tokio::test]
    async fn test_changes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/registry/_changes"))
            .and(query_param("since", "10"))
            .and(query_param("limit", "2"))
            .and(query_param("include_docs", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [
                    {"seq": "12-abc", "id": "bar", "changes": [{"rev": "2-x"}], "deleted": true},
                    {"seq": 11, "id": "foo", "changes": [{"rev": "1-x"}], "doc": {"name": "foo"}}
                ],
                "last_seq": "12-abc"
            })))
            .mount(&server)
            .await;

        let batch = feed(&server).await.changes(10, 2).await.unwrap();
        assert_eq!(batch.last_sequence, 12);
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.records[0].sequence, 11);
        assert_eq!(batch.records[0].name(), Some("foo"));
        assert!(!batch.records[0].deleted);
        assert_eq!(batch.records[1].document_id, "bar");
        assert!(batch.records[1].deleted);
        assert_eq!(batch.records[1].name(), None);
    }

    #[tokio::test]
    async fn test_empty_changes_stays_put() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/registry/_changes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": []})))
            .mount(&server)
            .await;
        let batch = feed(&server).await.changes(99, 10).await.unwrap();
        assert!(batch.records.is_empty());
        assert_eq!(batch.last_sequence, 99);
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/registry/_changes"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let err = feed(&server).await.changes(0, 10).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Status { status: 503, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_garbage_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/registry/_changes"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
            .mount(&server)
            .await;
        let err = feed(&server).await.changes(0, 10).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Decode(_)));
    }
}
