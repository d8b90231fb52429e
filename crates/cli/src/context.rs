use std::sync::Arc;

use anyhow::Context as _;
use tokio::sync::Notify;
use tracing::{info, warn};

use credsync_infra::config::FileConfigProvider;
use credsync_infra::jobs::{ExecutorStats, JobExecutorConfig};
use credsync_infra::records::{InMemoryLearnerRecords, InMemoryProgramCatalog, RecordsSnapshot};
use credsync_infra::{
    CredentialsNotifier, CredentialsTasks, HttpCredentialsClient, InMemoryJobStore, JobExecutor,
    JobStore, Settings,
};

/// Collaborators shared by every command of one process.
pub struct Context {
    pub settings: Settings,
    config: Arc<FileConfigProvider>,
    records: Arc<InMemoryLearnerRecords>,
    catalog: Arc<InMemoryProgramCatalog>,
    client: Arc<HttpCredentialsClient>,
    pub queue: Arc<InMemoryJobStore>,
}

impl Context {
    pub fn load(config_path: &str, records_path: &str) -> anyhow::Result<Self> {
        let config = Arc::new(FileConfigProvider::new(config_path));
        let settings = Settings::load(config.path())
            .with_context(|| format!("loading configuration from {config_path}"))?;
        let snapshot = RecordsSnapshot::from_json_file(records_path)
            .with_context(|| format!("loading learner records from {records_path}"))?;
        let client = HttpCredentialsClient::from_config(&settings.credentials)
            .context("building the Credentials client")?;

        let programs = snapshot.programs.clone();
        Ok(Self {
            settings,
            config,
            records: Arc::new(InMemoryLearnerRecords::from_snapshot(snapshot)),
            catalog: Arc::new(InMemoryProgramCatalog::new(programs)),
            client: Arc::new(client),
            queue: InMemoryJobStore::arc(),
        })
    }

    pub fn tasks(&self) -> CredentialsTasks {
        CredentialsTasks::new(
            self.config.clone(),
            self.records.clone(),
            self.catalog.clone(),
            self.client.clone(),
            self.queue.clone(),
        )
    }

    pub fn notifier(&self) -> CredentialsNotifier {
        CredentialsNotifier::new(
            self.config.clone(),
            self.records.clone(),
            self.catalog.clone(),
            self.queue.clone(),
        )
    }

    /// Run queued tasks, waiting out retry countdowns, until the queue is
    /// empty or the process receives ctrl-c. Prints a report when done.
    pub async fn drain(&self) -> anyhow::Result<ExecutorStats> {
        let executor = JobExecutor::new(self.queue.clone(), self.tasks());
        let config = JobExecutorConfig::default().with_name("credsync-cli");

        let shutdown = Arc::new(Notify::new());
        let signal = shutdown.clone();
        let ctrl_c = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping after the current task");
                signal.notify_one();
            }
        });

        let stats = executor.run_until_drained(&config, &shutdown).await;
        ctrl_c.abort();
        let stats = stats?;

        self.report(&stats)?;
        Ok(stats)
    }

    fn report(&self, stats: &ExecutorStats) -> anyhow::Result<()> {
        let queue = self.queue.stats()?;
        println!("{}", serde_json::to_string_pretty(stats)?);
        println!("{}", serde_json::to_string_pretty(&queue)?);

        let dead = self.queue.list_dead_letters(100)?;
        if dead.is_empty() {
            info!("no dead-lettered tasks");
        }
        for entry in dead {
            println!(
                "dead letter {} ({}): {}",
                entry.job.id,
                entry.job.kind.name(),
                entry.reason
            );
        }
        Ok(())
    }
}
