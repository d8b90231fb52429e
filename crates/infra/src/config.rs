//! TOML-based configuration and the providers tasks read it through.
//!
//! Tasks never cache settings: they call [`ConfigProvider::current`] at the
//! start of every invocation so an operator can switch issuance off (or back
//! on) without restarting workers.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use credsync_core::ProgramId;
use credsync_observability::LogFormat;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level settings, deserialized from a TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Programs that never get a program certificate.
    #[serde(default)]
    pub programs_without_certificates: ProgramExclusions,
    /// Platform-wide learner records switch; sites may override it.
    #[serde(default = "default_true")]
    pub enable_learner_records: bool,
    #[serde(default)]
    pub credentials: CredentialsApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub sites: Vec<SiteConfiguration>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            programs_without_certificates: ProgramExclusions::default(),
            enable_learner_records: true,
            credentials: CredentialsApiConfig::default(),
            logging: LoggingConfig::default(),
            sites: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Connection to the Credentials service and the issuance switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialsApiConfig {
    #[serde(default)]
    pub is_learner_issuance_enabled: bool,
    #[serde(default = "default_service_url")]
    pub internal_service_url: String,
    #[serde(default)]
    pub service_token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CredentialsApiConfig {
    fn default() -> Self {
        Self {
            is_learner_issuance_enabled: false,
            internal_service_url: default_service_url(),
            service_token: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl CredentialsApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_service_url() -> String {
    "http://localhost:18150".into()
}

fn default_timeout_secs() -> u64 {
    30
}

/// `programs_without_certificates`: a list of program UUIDs, or `["all"]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub enum ProgramExclusions {
    /// No program certificates are awarded at all.
    All,
    Programs(BTreeSet<ProgramId>),
}

impl Default for ProgramExclusions {
    fn default() -> Self {
        Self::Programs(BTreeSet::new())
    }
}

impl ProgramExclusions {
    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    pub fn excludes(&self, program: &ProgramId) -> bool {
        match self {
            Self::All => true,
            Self::Programs(set) => set.contains(program),
        }
    }
}

impl TryFrom<Vec<String>> for ProgramExclusions {
    type Error = String;

    fn try_from(values: Vec<String>) -> Result<Self, Self::Error> {
        if values.iter().any(|v| v.trim().eq_ignore_ascii_case("all")) {
            return Ok(Self::All);
        }
        values
            .iter()
            .map(|v| {
                v.trim()
                    .parse::<ProgramId>()
                    .map_err(|e| format!("programs_without_certificates: {e}"))
            })
            .collect::<Result<BTreeSet<_>, _>>()
            .map(Self::Programs)
    }
}

impl From<ProgramExclusions> for Vec<String> {
    fn from(value: ProgramExclusions) -> Self {
        match value {
            ProgramExclusions::All => vec!["all".to_string()],
            ProgramExclusions::Programs(set) => set.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Per-site overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteConfiguration {
    pub domain: String,
    #[serde(default)]
    pub orgs: Vec<String>,
    #[serde(default)]
    pub enable_learner_records: Option<bool>,
}

impl SiteConfiguration {
    pub fn has_org(&self, org: &str) -> bool {
        self.orgs.iter().any(|o| o == org)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

impl Settings {
    /// Load configuration from a TOML file at the given path.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let settings: Self = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.credentials.internal_service_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "credentials.internal_service_url must not be empty".into(),
            ));
        }
        let mut seen = BTreeSet::new();
        for site in &self.sites {
            if !seen.insert(site.domain.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "site {} is configured twice",
                    site.domain
                )));
            }
        }
        Ok(())
    }

    pub fn site(&self, domain: &str) -> Option<&SiteConfiguration> {
        self.sites.iter().find(|s| s.domain == domain)
    }

    /// Learner records switch for the site that owns `org`, falling back to
    /// the platform-wide value.
    pub fn is_learner_records_enabled_for_org(&self, org: &str) -> bool {
        self.sites
            .iter()
            .find(|site| site.has_org(org))
            .and_then(|site| site.enable_learner_records)
            .unwrap_or(self.enable_learner_records)
    }
}

/// Source of the current settings.
pub trait ConfigProvider: Send + Sync {
    fn current(&self) -> Result<Settings, ConfigError>;
}

impl<P: ConfigProvider + ?Sized> ConfigProvider for std::sync::Arc<P> {
    fn current(&self) -> Result<Settings, ConfigError> {
        (**self).current()
    }
}

/// Settings held in memory; tests flip switches with [`StaticConfigProvider::update`].
#[derive(Debug, Default)]
pub struct StaticConfigProvider {
    settings: RwLock<Settings>,
}

impl StaticConfigProvider {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: RwLock::new(settings),
        }
    }

    pub fn set(&self, settings: Settings) {
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
    }

    pub fn update(&self, f: impl FnOnce(&mut Settings)) {
        f(&mut self.settings.write().unwrap_or_else(PoisonError::into_inner));
    }
}

impl ConfigProvider for StaticConfigProvider {
    fn current(&self) -> Result<Settings, ConfigError> {
        Ok(self
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

/// Re-reads a TOML file on every call.
#[derive(Debug, Clone)]
pub struct FileConfigProvider {
    path: PathBuf,
}

impl FileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigProvider for FileConfigProvider {
    fn current(&self) -> Result<Settings, ConfigError> {
        Settings::load(&self.path)
    }
}
