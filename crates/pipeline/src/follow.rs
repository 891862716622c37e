//! The change-feed follower.
//!
//! One run pulls batches from the feed, starting at the persisted cursor,
//! until it has caught up or its time budget is nearly spent. Every version
//! that is new (or modified since it was last seen) is classified, and
//! accepted versions are dispatched for staging. The cursor is saved after
//! each batch, so a run that dies loses at most the batch in progress, and
//! that batch is redone (dispatching is safe to repeat).

use crate::classify::{Classification, Policy, Rejection};
use crate::cursor::Cursor;
use crate::dispatch::Dispatch;
use crate::error::{ErrorKind, Result};
use crate::stage::StageRequest;
use exn::ResultExt;
use regmirror_config::FollowerConfig;
use regmirror_registry::{ChangeBatch, ChangeFeed, PackageDocument};
use regmirror_storage::BackendHandle;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;

pub const DEFAULT_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    /// The feed had nothing after the marker.
    CaughtUp,
    /// Another batch would likely not finish within the budget.
    Budget,
    /// The feed returned records that did not move the marker forward.
    Stalled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowReport {
    pub initial_marker: u64,
    pub final_marker: u64,
    /// The upstream sequence was reset and the marker restarted from zero.
    pub reset: bool,
    pub batches: usize,
    pub accepted: usize,
    /// Rejections by reason code.
    pub rejected: BTreeMap<&'static str, usize>,
    pub unprocessable: usize,
    /// Records without a package name.
    pub skipped: usize,
    pub deleted: usize,
    pub dispatch_failures: usize,
    pub stop_reason: Option<StopReason>,
}

pub struct Follower {
    feed: Arc<dyn ChangeFeed>,
    backend: BackendHandle,
    policy: Policy,
    dispatch: Arc<dyn Dispatch>,
    cursor_key: String,
    epoch: OffsetDateTime,
    batch_size: usize,
}

impl Follower {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        backend: BackendHandle,
        policy: Policy,
        dispatch: Arc<dyn Dispatch>,
        config: &FollowerConfig,
    ) -> Self {
        Self {
            feed,
            backend,
            policy,
            dispatch,
            cursor_key: config.cursor_key.clone(),
            epoch: config.epoch,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Follow the feed for at most roughly `budget`.
    ///
    /// Errors from the feed or from storage abort the run; the cursor stays
    /// at the last completed batch.
    pub async fn run(&self, budget: Duration) -> Result<FollowReport> {
        let started = Instant::now();
        let mut cursor = Cursor::load(&self.backend, &self.cursor_key).await?;
        let mut report = FollowReport {
            initial_marker: cursor.marker,
            final_marker: cursor.marker,
            ..Default::default()
        };
        match self.follow(&mut cursor, &mut report, started, budget).await {
            Ok(reason) => {
                report.stop_reason = Some(reason);
                tracing::info!(
                    initial_marker = report.initial_marker,
                    final_marker = report.final_marker,
                    batches = report.batches,
                    accepted = report.accepted,
                    stop_reason = ?reason,
                    "Follower run finished"
                );
                Ok(report)
            },
            Err(err) => {
                tracing::error!(
                    initial_marker = report.initial_marker,
                    final_marker = report.final_marker,
                    batches = report.batches,
                    accepted = report.accepted,
                    "Follower run aborted"
                );
                Err(err)
            },
        }
    }

    async fn follow(
        &self,
        cursor: &mut Cursor,
        report: &mut FollowReport,
        started: Instant,
        budget: Duration,
    ) -> Result<StopReason> {
        let high_water_mark = self.feed.high_water_mark().await.or_raise(|| ErrorKind::Feed)?;
        if high_water_mark < cursor.marker {
            tracing::warn!(marker = cursor.marker, high_water_mark, "Upstream sequence was reset, restarting from 0");
            cursor.marker = 0;
            report.reset = true;
        }

        let mut slowest = Duration::ZERO;
        loop {
            let batch_started = Instant::now();
            let batch = self.feed.changes(cursor.marker, self.batch_size).await.or_raise(|| ErrorKind::Feed)?;
            if batch.records.is_empty() {
                return Ok(StopReason::CaughtUp);
            }

            self.process(&batch, cursor, report).await;
            let previous = cursor.marker;
            let next = batch.records.iter().map(|record| record.sequence).max().unwrap_or(previous);
            cursor.marker = cursor.marker.max(next);
            cursor.save(&self.backend, &self.cursor_key).await?;
            report.batches += 1;
            report.final_marker = cursor.marker;
            tracing::debug!(marker = cursor.marker, records = batch.records.len(), "Processed batch");

            if cursor.marker == previous {
                tracing::warn!(marker = cursor.marker, "Feed did not advance past the marker, stopping");
                return Ok(StopReason::Stalled);
            }
            slowest = slowest.max(batch_started.elapsed());
            let remaining = budget.saturating_sub(started.elapsed());
            if remaining <= slowest {
                tracing::info!(remaining = ?remaining, slowest_batch = ?slowest, "Budget nearly spent, stopping");
                return Ok(StopReason::Budget);
            }
        }
    }

    /// Classify and dispatch everything new in one batch. Never fails: a bad
    /// document or a failed dispatch only affects itself.
    async fn process(&self, batch: &ChangeBatch, cursor: &mut Cursor, report: &mut FollowReport) {
        let mut documents = Vec::with_capacity(batch.records.len());
        for record in &batch.records {
            if record.deleted {
                report.deleted += 1;
                continue;
            }
            let Some(name) = record.name() else {
                report.skipped += 1;
                continue;
            };
            match PackageDocument::parse(&record.document) {
                Ok(document) => documents.push((record.sequence, document)),
                Err(err) => {
                    tracing::warn!(package = name, sequence = record.sequence, error = %err, "Skipping unprocessable document");
                    report.unprocessable += 1;
                },
            }
        }

        let newest = documents.iter().filter_map(|(_, document)| document.last_modified()).max();
        if newest.is_none_or(|newest| newest < self.epoch) {
            tracing::debug!(newest = ?newest, epoch = %self.epoch, "Batch predates the epoch, not classifying");
            return;
        }

        for (sequence, document) in &documents {
            for (version, info, modified) in document.modified_versions() {
                let id = format!("{}@{version}", document.name);
                if !cursor.is_newer(&id, modified) {
                    continue;
                }
                match self.policy.classify(info) {
                    Classification::Rejected(Rejection::NotRelevant) => {
                        *report.rejected.entry(Rejection::NotRelevant.code()).or_default() += 1;
                    },
                    Classification::Rejected(rejection) => {
                        tracing::debug!(id = %id, reason = rejection.code(), "Rejected version");
                        *report.rejected.entry(rejection.code()).or_default() += 1;
                        cursor.record(id, modified);
                    },
                    Classification::Accepted { frameworks } => {
                        report.accepted += 1;
                        let request = StageRequest::new(&document.name, version, info, modified, *sequence, &frameworks);
                        if let Err(err) = self.dispatch.dispatch(&request).await {
                            tracing::warn!(id = %id, error = ?err, "Could not dispatch accepted version");
                            report.dispatch_failures += 1;
                        }
                        cursor.record(id, modified);
                    },
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::QueueDispatch;
    use crate::stage::Stager;
    use async_trait::async_trait;
    use regmirror_policy::DenyList;
    use regmirror_queue::MemoryQueue;
    use regmirror_registry::{ChangeRecord, MockChangeFeed, MockTarballSource};
    use regmirror_storage::StorageBackend;
    use regmirror_storage::backend::MockBackend;
    use serde_json::{Value, json};
    use time::macros::datetime;

    const CURSOR: &str = "state/follower-cursor.json";

    fn config() -> FollowerConfig {
        FollowerConfig {
            cursor_key: CURSOR.to_string(),
            ..Default::default()
        }
    }

    fn document(name: &str, versions: &[(&str, bool, &str)], modified: &str) -> Value {
        let mut doc = json!({"name": name, "versions": {}, "time": {"modified": modified}});
        for (version, jsii, license) in versions {
            let mut info = json!({
                "name": name,
                "version": version,
                "license": license,
                "dist": {"tarball": format!("https://registry.example/{name}-{version}.tgz")}
            });
            if *jsii {
                info["jsii"] = json!({"outdir": "dist"});
            }
            doc["versions"][*version] = info;
            doc["time"][*version] = json!(modified);
        }
        doc
    }

    fn record(sequence: u64, document: Value) -> ChangeRecord {
        ChangeRecord {
            sequence,
            document_id: document["name"].as_str().unwrap_or_default().to_string(),
            document,
            deleted: false,
        }
    }

    fn follower(feed: Arc<dyn ChangeFeed>, backend: Arc<MockBackend>, dispatch: Arc<dyn Dispatch>) -> Follower {
        Follower::new(feed, backend, Policy::default(), dispatch, &config())
    }

    async fn stored_cursor(backend: &MockBackend) -> Cursor {
        Cursor::from_json(&backend.read(CURSOR).await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_end_to_end() {
        let backend = Arc::new(MockBackend::default());
        let ingestion = Arc::new(MemoryQueue::new("ingestion"));
        let tarballs = Arc::new(MockTarballSource::with_tarballs([(
            "https://registry.example/foo-1.0.0.tgz",
            b"foo tarball".to_vec(),
        )]));
        let stager = Arc::new(Stager::new(backend.clone(), tarballs.clone(), ingestion.clone(), DenyList::default()));
        let feed = Arc::new(MockChangeFeed::new(vec![record(
            1,
            document("foo", &[("1.0.0", true, "MIT")], "2024-01-01T00:00:00Z"),
        )]));

        let report = follower(feed, backend.clone(), stager).run(Duration::from_secs(60)).await.unwrap();

        assert_eq!(report.accepted, 1);
        assert_eq!(report.final_marker, 1);
        assert_eq!(report.stop_reason, Some(StopReason::CaughtUp));
        assert_eq!(tarballs.fetched().await, vec!["https://registry.example/foo-1.0.0.tgz"]);
        assert!(backend.exists("staged/foo-1.0.0.tgz").await.unwrap());
        assert_eq!(ingestion.published().await.len(), 1);
        let cursor = stored_cursor(&backend).await;
        assert_eq!(cursor.marker, 1);
        assert!(cursor.known_versions().contains_key("foo@1.0.0"));
    }

    #[tokio::test]
    async fn test_classification_and_deduplication() {
        let backend = Arc::new(MockBackend::default());
        let staging = Arc::new(MemoryQueue::new("staging"));
        let feed = Arc::new(MockChangeFeed::new(vec![
            record(1, document("foo", &[("1.0.0", true, "MIT")], "2024-01-01T00:00:00Z")),
            record(2, document("plain", &[("1.0.0", false, "MIT")], "2024-01-01T00:00:00Z")),
            record(3, document("gpl", &[("1.0.0", true, "GPL-3.0")], "2024-01-01T00:00:00Z")),
            record(4, json!({"name": "broken", "versions": {}})),
            record(5, json!({"_id": "_design/app"})),
            ChangeRecord {
                sequence: 6,
                document_id: "gone".to_string(),
                document: Value::Null,
                deleted: true,
            },
            // Same version seen again at the same time: not dispatched twice.
            record(7, document("foo", &[("1.0.0", true, "MIT")], "2024-01-01T00:00:00Z")),
        ]));
        let dispatch = Arc::new(QueueDispatch::new(staging.clone()));

        let report = follower(feed, backend.clone(), dispatch).with_batch_size(3).run(Duration::from_secs(60)).await.unwrap();

        assert_eq!(report.accepted, 1);
        assert_eq!(report.rejected["not-relevant"], 1);
        assert_eq!(report.rejected["license"], 1);
        assert_eq!(report.unprocessable, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.deleted, 1);
        assert_eq!(report.batches, 3);
        assert_eq!(report.final_marker, 7);
        assert_eq!(staging.published().await.len(), 1);

        let cursor = stored_cursor(&backend).await;
        assert!(cursor.known_versions().contains_key("gpl@1.0.0"));
        assert!(!cursor.known_versions().contains_key("plain@1.0.0"));
    }

    #[tokio::test]
    async fn test_modified_version_is_reclassified() {
        let backend = Arc::new(MockBackend::default());
        let staging = Arc::new(MemoryQueue::new("staging"));
        let feed = Arc::new(MockChangeFeed::new(vec![
            record(1, document("foo", &[("1.0.0", true, "MIT")], "2024-01-01T00:00:00Z")),
            record(2, document("foo", &[("1.0.0", true, "MIT")], "2024-02-01T00:00:00Z")),
        ]));
        let dispatch = Arc::new(QueueDispatch::new(staging.clone()));
        let report = follower(feed, backend, dispatch).run(Duration::from_secs(60)).await.unwrap();
        assert_eq!(report.accepted, 2);
        assert_eq!(staging.published().await.len(), 2);
    }

    #[tokio::test]
    async fn test_marker_and_stamps_never_regress_across_runs() {
        let backend = Arc::new(MockBackend::default());
        let staging = Arc::new(MemoryQueue::new("staging"));
        let dispatch: Arc<dyn Dispatch> = Arc::new(QueueDispatch::new(staging.clone()));
        let first_records = vec![
            record(1, document("foo", &[("1.0.0", true, "MIT")], "2024-03-01T00:00:00Z")),
            record(2, document("bar", &[("1.0.0", true, "MIT")], "2024-03-01T00:00:00Z")),
        ];
        let first = Arc::new(MockChangeFeed::new(first_records.clone()));
        let report = follower(first, backend.clone(), dispatch.clone()).run(Duration::from_secs(60)).await.unwrap();
        assert_eq!(report.final_marker, 2);
        let before = stored_cursor(&backend).await;

        // The feed grows, and replays foo@1.0.0 with an older timestamp.
        let mut grown = first_records;
        grown.push(record(3, document("foo", &[("1.0.0", true, "MIT")], "2024-01-01T00:00:00Z")));
        grown.push(record(4, document("baz", &[("2.0.0", true, "MIT")], "2024-04-01T00:00:00Z")));
        let second = Arc::new(MockChangeFeed::new(grown));
        let report = follower(second.clone(), backend.clone(), dispatch).run(Duration::from_secs(60)).await.unwrap();

        assert_eq!(report.initial_marker, 2);
        assert_eq!(report.final_marker, 4);
        assert!(!report.reset);
        assert_eq!(report.accepted, 1);
        // Records already covered by the stored marker are not requested again.
        assert!(second.requests().await.iter().all(|(since, _)| *since >= 2));

        let after = stored_cursor(&backend).await;
        assert!(after.marker >= before.marker);
        for (id, stamp) in before.known_versions() {
            assert!(after.known_versions()[id] >= *stamp, "{id} went backwards");
        }
        assert_eq!(after.known_versions()["foo@1.0.0"], datetime!(2024-03-01 00:00:00 UTC));
        assert!(after.known_versions().contains_key("baz@2.0.0"));
        assert_eq!(staging.published().await.len(), 3);
    }

    #[tokio::test]
    async fn test_batches_before_epoch_are_not_classified() {
        let backend = Arc::new(MockBackend::default());
        let staging = Arc::new(MemoryQueue::new("staging"));
        let feed = Arc::new(MockChangeFeed::new(vec![record(
            9,
            document("old", &[("1.0.0", true, "MIT")], "2016-01-01T00:00:00Z"),
        )]));
        let dispatch = Arc::new(QueueDispatch::new(staging.clone()));
        let report = follower(feed, backend.clone(), dispatch).run(Duration::from_secs(60)).await.unwrap();
        assert_eq!(report.accepted, 0);
        assert_eq!(report.final_marker, 9);
        assert!(staging.published().await.is_empty());
        assert_eq!(stored_cursor(&backend).await.marker, 9);
    }

    #[tokio::test]
    async fn test_reset_keeps_known_versions() {
        let mut stored = Cursor::new(500);
        stored.record("foo@1.0.0", datetime!(2024-01-01 00:00:00 UTC));
        let backend = Arc::new(MockBackend::with_objects([(CURSOR, stored.to_json().unwrap())]));
        let staging = Arc::new(MemoryQueue::new("staging"));
        let feed = Arc::new(
            MockChangeFeed::new(vec![record(
                1,
                document("foo", &[("1.0.0", true, "MIT")], "2024-01-01T00:00:00Z"),
            )])
            .with_high_water_mark(100),
        );
        let dispatch = Arc::new(QueueDispatch::new(staging.clone()));

        let report = follower(feed.clone(), backend.clone(), dispatch).run(Duration::from_secs(60)).await.unwrap();

        assert!(report.reset);
        assert_eq!(report.initial_marker, 500);
        assert_eq!(feed.requests().await[0].0, 0);
        // Already known at this modification time.
        assert!(staging.published().await.is_empty());
        let cursor = stored_cursor(&backend).await;
        assert_eq!(cursor.marker, 1);
        assert!(cursor.known_versions().contains_key("foo@1.0.0"));
    }

    /// Takes ten (virtual) seconds per batch.
    struct SlowFeed(MockChangeFeed);

    #[async_trait]
    impl ChangeFeed for SlowFeed {
        async fn high_water_mark(&self) -> regmirror_registry::error::Result<u64> {
            self.0.high_water_mark().await
        }

        async fn changes(&self, since: u64, limit: usize) -> regmirror_registry::error::Result<ChangeBatch> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            self.0.changes(since, limit).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_stops_after_one_batch() {
        let backend = Arc::new(MockBackend::default());
        let staging = Arc::new(MemoryQueue::new("staging"));
        let feed = Arc::new(SlowFeed(MockChangeFeed::new(vec![
            record(10, document("a", &[("1.0.0", true, "MIT")], "2024-01-01T00:00:00Z")),
            record(20, document("b", &[("1.0.0", true, "MIT")], "2024-01-01T00:00:00Z")),
        ])));
        let dispatch = Arc::new(QueueDispatch::new(staging.clone()));

        let report = follower(feed, backend.clone(), dispatch)
            .with_batch_size(1)
            .run(Duration::from_secs(15))
            .await
            .unwrap();

        assert_eq!(report.batches, 1);
        assert_eq!(report.stop_reason, Some(StopReason::Budget));
        assert_eq!(report.final_marker, 10);
        assert_eq!(stored_cursor(&backend).await.marker, 10);
        assert_eq!(staging.published().await.len(), 1);
    }

    /// Keeps returning the same record.
    struct StuckFeed;

    #[async_trait]
    impl ChangeFeed for StuckFeed {
        async fn high_water_mark(&self) -> regmirror_registry::error::Result<u64> {
            Ok(5)
        }

        async fn changes(&self, _since: u64, _limit: usize) -> regmirror_registry::error::Result<ChangeBatch> {
            Ok(ChangeBatch {
                records: vec![record(5, json!({"_id": "_design/app"}))],
                last_sequence: 5,
            })
        }
    }

    #[tokio::test]
    async fn test_stalled_feed() {
        let backend = Arc::new(MockBackend::with_objects([(CURSOR, b"5".to_vec())]));
        let dispatch = Arc::new(QueueDispatch::new(Arc::new(MemoryQueue::new("staging"))));
        let report = follower(Arc::new(StuckFeed), backend, dispatch).run(Duration::from_secs(60)).await.unwrap();
        assert_eq!(report.stop_reason, Some(StopReason::Stalled));
        assert_eq!(report.batches, 1);
    }

    #[tokio::test]
    async fn test_corrupt_cursor_aborts() {
        let backend = Arc::new(MockBackend::with_objects([(CURSOR, b"{oops".to_vec())]));
        let feed = Arc::new(MockChangeFeed::new(vec![]));
        let dispatch = Arc::new(QueueDispatch::new(Arc::new(MemoryQueue::new("staging"))));
        let err = follower(feed.clone(), backend.clone(), dispatch).run(Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::CorruptCursor(_)));
        assert!(feed.requests().await.is_empty());
        assert_eq!(backend.read(CURSOR).await.unwrap(), b"{oops");
    }
}
