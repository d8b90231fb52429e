//! Infrastructure layer: configuration, local records, the Credentials
//! client, the job runner and the reconciliation tasks built on them.

pub mod config;
pub mod credentials;
pub mod jobs;
pub mod notify;
pub mod paging;
pub mod records;
pub mod signals;
pub mod tasks;


pub use config::{ConfigError, ConfigProvider, FileConfigProvider, Settings, StaticConfigProvider};
pub use credentials::{ClientError, CredentialsClient, HttpCredentialsClient, InMemoryCredentialsClient};
pub use jobs::{InMemoryJobStore, Job, JobExecutor, JobStore, TaskKind};
pub use notify::{CredentialsNotifier, NotifyError, NotifyOptions, NotifySummary};
pub use paging::{PagedQuery, StoreError, paged_query};
pub use records::{LearnerRecords, ProgramCatalog};
pub use signals::{CertificateSignals, SignalError};
pub use tasks::CredentialsTasks;
