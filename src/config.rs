use std::fs;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::Category;
use crate::error::SyncError;
use crate::retry::RetryPolicy;

pub const CONFIG_FILE: &str = "geolayer-sync.json";

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub catalog: Option<String>,
    #[serde(default)]
    pub data_root: Option<String>,
    #[serde(default)]
    pub reports_dir: Option<String>,
    #[serde(default)]
    pub run_report: Option<String>,
    #[serde(default)]
    pub retry_report: Option<String>,
    #[serde(default)]
    pub reconcile_report: Option<String>,
    #[serde(default)]
    pub status_report: Option<String>,
    #[serde(default)]
    pub discovery_timeout_secs: Option<u64>,
    #[serde(default)]
    pub fetch_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_redirects: Option<usize>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub request_delay_ms: Option<u64>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub default_category: Option<String>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_delay_secs: Option<u64>,
    #[serde(default)]
    pub item_delay_secs: Option<u64>,
    #[serde(default)]
    pub fetch_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub source: Option<Utf8PathBuf>,
    pub catalog: Utf8PathBuf,
    pub data_root: Utf8PathBuf,
    pub run_report: Utf8PathBuf,
    pub retry_report: Utf8PathBuf,
    pub reconcile_report: Utf8PathBuf,
    pub status_report: Utf8PathBuf,
    pub discovery_timeout: Duration,
    pub fetch_timeout: Duration,
    pub max_redirects: usize,
    pub concurrency: usize,
    pub request_delay: Duration,
    pub user_agent: String,
    pub default_category: Option<Category>,
    pub retry: RetryPolicy,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, SyncError> {
        if let Some(path) = path {
            let path = Utf8PathBuf::from(path);
            if !path.as_std_path().exists() {
                return Err(SyncError::MissingConfig(path));
            }
            return Self::resolve_file(&path);
        }

        let candidates = [Some(Utf8PathBuf::from(CONFIG_FILE)), user_config_path()];
        for candidate in candidates.into_iter().flatten() {
            if candidate.as_std_path().is_file() {
                return Self::resolve_file(&candidate);
            }
        }
        debug!("no config file found, using defaults");
        Self::resolve_config(Config::default(), None)
    }

    pub fn resolve_file(path: &Utf8Path) -> Result<ResolvedConfig, SyncError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|_| SyncError::ConfigRead(path.to_path_buf()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| SyncError::ConfigParse(err.to_string()))?;
        debug!(path = %path, "loaded config");
        Self::resolve_config(config, Some(path.to_path_buf()))
    }

    pub fn resolve_config(
        config: Config,
        source: Option<Utf8PathBuf>,
    ) -> Result<ResolvedConfig, SyncError> {
        let reports_dir = Utf8PathBuf::from(config.reports_dir.as_deref().unwrap_or("."));
        let report = |name: Option<String>, default: &str| {
            reports_dir.join(name.as_deref().unwrap_or(default))
        };

        let concurrency = config.concurrency.unwrap_or(1);
        if concurrency == 0 {
            return Err(SyncError::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }
        let discovery_timeout = positive_secs("discovery_timeout_secs", config.discovery_timeout_secs, 30)?;
        let fetch_timeout = positive_secs("fetch_timeout_secs", config.fetch_timeout_secs, 60)?;
        let request_delay = Duration::from_millis(config.request_delay_ms.unwrap_or(1000));

        let user_agent = config
            .user_agent
            .unwrap_or_else(|| format!("geolayer-sync/{}", env!("CARGO_PKG_VERSION")));
        if user_agent.trim().is_empty() {
            return Err(SyncError::InvalidConfig(
                "user_agent must not be empty".to_string(),
            ));
        }

        let default_category = config
            .default_category
            .as_deref()
            .map(str::parse::<Category>)
            .transpose()?;

        let retry = config.retry.unwrap_or_default();
        let retry = RetryPolicy {
            max_retries: retry.max_retries.unwrap_or(2),
            retry_delay: Duration::from_secs(retry.retry_delay_secs.unwrap_or(5)),
            item_delay: Duration::from_secs(retry.item_delay_secs.unwrap_or(2)),
            discovery_timeout,
            fetch_timeout: positive_secs("retry.fetch_timeout_secs", retry.fetch_timeout_secs, 300)?,
            workers: concurrency,
        };

        Ok(ResolvedConfig {
            source,
            catalog: Utf8PathBuf::from(config.catalog.as_deref().unwrap_or("Datasource.txt")),
            data_root: Utf8PathBuf::from(config.data_root.as_deref().unwrap_or("data")),
            run_report: report(config.run_report, "download_report.json"),
            retry_report: report(config.retry_report, "retry_report.json"),
            reconcile_report: report(config.reconcile_report, "verification_report.json"),
            status_report: report(config.status_report, "current_data_status.json"),
            discovery_timeout,
            fetch_timeout,
            max_redirects: config.max_redirects.unwrap_or(10),
            concurrency,
            request_delay,
            user_agent,
            default_category,
            retry,
        })
    }
}

fn positive_secs(field: &str, value: Option<u64>, default: u64) -> Result<Duration, SyncError> {
    match value.unwrap_or(default) {
        0 => Err(SyncError::InvalidConfig(format!("{field} must be greater than 0"))),
        secs => Ok(Duration::from_secs(secs)),
    }
}

fn user_config_path() -> Option<Utf8PathBuf> {
    let dirs = BaseDirs::new()?;
    let path = dirs.config_dir().join("geolayer-sync").join("config.json");
    Utf8PathBuf::from_path_buf(path).ok()
}
