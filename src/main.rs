mod cli;
mod logging;

use crate::cli::{Args, Command, QueueName};
use clap::Parser;
use derive_more::{Display, Error};
use exn::ResultExt;
use regmirror_config::{BackendConfig, Config};
use regmirror_pipeline::{
    CatalogBuilder, Dispatch, Follower, Inventory, Policy, Pruner, QueueDispatch, QueueHook, Stager, drain, prune,
};
use regmirror_policy::DenyList;
use regmirror_queue::{QueueHandle, StoreQueue};
use regmirror_registry::{ChangeFeed, CouchChangeFeed, HttpTarballSource, http_client};
use regmirror_storage::BackendHandle;
use regmirror_storage::backend::{LocalBackend, ReadOnlyBackend, S3Backend};
use serde_json::Value;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

type Result<T> = std::result::Result<T, exn::Exn<ErrorKind>>;

#[derive(Debug, Display, Error)]
enum ErrorKind {
    #[display("could not load configuration")]
    Config,
    #[display("could not set up {_0}")]
    Setup(#[error(not(source))] &'static str),
    #[display("{_0} failed")]
    Command(#[error(not(source))] &'static str),
    #[display("could not encode report")]
    Report,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(err) = logging::setup_logging(args.log_json) {
        eprintln!("could not install logger: {err}");
        return ExitCode::FAILURE;
    }
    match run(args).await {
        Ok(report) => {
            println!("{report}");
            ExitCode::SUCCESS
        },
        Err(err) => {
            tracing::error!("{err}");
            eprintln!("{err:?}");
            ExitCode::FAILURE
        },
    }
}

/// Run one subcommand and return its report.
async fn run(args: Args) -> Result<Value> {
    let mut config = Config::load(args.config.as_deref()).or_raise(|| ErrorKind::Config)?;
    config.storage.dry_run |= args.dry_run;
    let context = Context::new(config).await?;

    match args.command {
        Command::Follow { direct, budget_secs } => context.follow(direct, budget_secs).await,
        Command::StageWorker => context.stage_worker().await,
        Command::Redrive { queue } => context.redrive(queue).await,
        Command::Prune => context.prune().await,
        Command::PruneWorker => context.prune_worker().await,
        Command::Catalog => context.catalog().await,
        Command::Inventory => context.inventory().await,
    }
}

/// Everything a run needs, built from configuration.
struct Context {
    config: Config,
    backend: BackendHandle,
    client: reqwest::Client,
}

impl Context {
    async fn new(config: Config) -> Result<Self> {
        let backend: BackendHandle = match &config.storage.backend {
            BackendConfig::Local { path } => {
                Arc::new(LocalBackend::new("local", path).or_raise(|| ErrorKind::Setup("local storage"))?)
            },
            BackendConfig::S3 {
                bucket,
                prefix,
                region,
                endpoint,
                key_id,
                key_secret,
            } => Arc::new(
                S3Backend::new("s3", bucket, prefix.clone(), region, endpoint.clone(), key_id, key_secret)
                    .await
                    .or_raise(|| ErrorKind::Setup("S3 storage"))?,
            ),
        };
        let backend: BackendHandle = match config.storage.dry_run {
            true => {
                tracing::warn!(backend = backend.name(), "Dry run: writes and deletes will be skipped");
                Arc::new(ReadOnlyBackend::new(backend))
            },
            false => backend,
        };
        let client = http_client(&config.registry.user_agent, config.registry.timeout())
            .or_raise(|| ErrorKind::Setup("HTTP client"))?;
        Ok(Self {
            config,
            backend,
            client,
        })
    }

    fn queue(&self, name: &str) -> QueueHandle {
        Arc::new(
            StoreQueue::new(self.backend.clone(), &self.config.queues.root_prefix, name)
                .with_max_receives(self.config.queues.max_receives),
        )
    }

    fn queue_by_name(&self, queue: QueueName) -> QueueHandle {
        let queues = &self.config.queues;
        match queue {
            QueueName::Staging => self.queue(&queues.staging),
            QueueName::Ingestion => self.queue(&queues.ingestion),
            QueueName::Prune => self.queue(&queues.prune),
        }
    }

    async fn policy(&self) -> Result<Policy> {
        Policy::load(&self.backend, &self.config.policy).await.or_raise(|| ErrorKind::Setup("policy"))
    }

    async fn deny_list(&self) -> Result<DenyList> {
        DenyList::load(&self.backend, &self.config.policy.deny_list_key).await.or_raise(|| ErrorKind::Setup("deny list"))
    }

    fn stager(&self, deny_list: DenyList) -> Stager {
        Stager::new(
            self.backend.clone(),
            Arc::new(HttpTarballSource::new(self.client.clone())),
            self.queue(&self.config.queues.ingestion),
            deny_list,
        )
    }

    async fn follow(&self, direct: bool, budget_secs: Option<u64>) -> Result<Value> {
        let feed_url = Url::parse(&self.config.registry.feed_url).or_raise(|| ErrorKind::Setup("change feed"))?;
        let feed: Arc<dyn ChangeFeed> = Arc::new(CouchChangeFeed::new(self.client.clone(), feed_url));
        let policy = self.policy().await?;
        let dispatch: Arc<dyn Dispatch> = match direct {
            true => Arc::new(self.stager(policy.deny_list.clone())),
            false => Arc::new(QueueDispatch::new(self.queue(&self.config.queues.staging))),
        };
        let budget = budget_secs.map(Duration::from_secs).unwrap_or_else(|| self.config.follower.budget());
        let report = Follower::new(feed, self.backend.clone(), policy, dispatch, &self.config.follower)
            .with_batch_size(self.config.registry.batch_size)
            .run(budget)
            .await
            .or_raise(|| ErrorKind::Command("follow"))?;
        to_value(&report)
    }

    async fn stage_worker(&self) -> Result<Value> {
        let stager = self.stager(self.deny_list().await?);
        let queue = self.queue(&self.config.queues.staging);
        let stager = &stager;
        let report = drain(&queue, &self.config.worker, |body| async move { stager.handle(&body).await })
            .await
            .or_raise(|| ErrorKind::Command("stage worker"))?;
        to_value(&report)
    }

    async fn redrive(&self, name: QueueName) -> Result<Value> {
        let queue = self.queue_by_name(name);
        let moved = queue.redrive().await.or_raise(|| ErrorKind::Command("redrive"))?;
        tracing::info!(queue = queue.name(), moved, "Redrove dead letters");
        Ok(serde_json::json!({"queue": queue.name(), "redriven": moved}))
    }

    async fn prune(&self) -> Result<Value> {
        let deny_list = self.deny_list().await?;
        let mut pruner = Pruner::new(
            self.backend.clone(),
            self.queue(&self.config.queues.prune),
            &self.config.catalog.data_prefix,
        );
        if let Some(trigger) = &self.config.queues.catalog_trigger {
            pruner = pruner.with_hook(Arc::new(QueueHook::new(self.queue(trigger))));
        }
        let report = pruner.run(&deny_list).await.or_raise(|| ErrorKind::Command("prune"))?;
        to_value(&report)
    }

    async fn prune_worker(&self) -> Result<Value> {
        let queue = self.queue(&self.config.queues.prune);
        let backend = &self.backend;
        let report = drain(&queue, &self.config.worker, |body| async move { prune::delete(backend, &body).await })
            .await
            .or_raise(|| ErrorKind::Command("prune worker"))?;
        to_value(&report)
    }

    async fn catalog(&self) -> Result<Value> {
        let deny_list = self.deny_list().await?;
        let report = CatalogBuilder::new(self.backend.clone(), &self.config.catalog)
            .run(&deny_list)
            .await
            .or_raise(|| ErrorKind::Command("catalog"))?;
        to_value(&report)
    }

    async fn inventory(&self) -> Result<Value> {
        let report = Inventory::new(self.backend.clone(), &self.config.catalog)
            .run()
            .await
            .or_raise(|| ErrorKind::Command("inventory"))?;
        to_value(&report)
    }
}

fn to_value<T: serde::Serialize>(report: &T) -> Result<Value> {
    serde_json::to_value(report).or_raise(|| ErrorKind::Report)
}
