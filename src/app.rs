use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{info, warn};

use crate::catalog::{Catalog, CatalogReader};
use crate::config::ResolvedConfig;
use crate::discovery::ServiceDiscoverer;
use crate::domain::CatalogEntry;
use crate::error::{FailureKind, SyncError};
use crate::fetcher::ArtifactFetcher;
use crate::reconcile::{ReconciliationEngine, ReconciliationResult};
use crate::report::{AttemptRecord, Ledger, RunKind, RunReport};
use crate::retry::{self, RetryCoordinator, RetryItem};
use crate::service::LayerService;
use crate::store::Store;
use crate::worker::{CancelToken, PathLocks, PoolOptions, run_pool};

#[derive(Debug, Clone, Copy)]
pub enum ProgressSinkKind {
    Run,
    Retry,
    Reconcile,
    Status,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

impl ProgressEvent {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            elapsed: None,
        }
    }
}

pub trait ProgressSink: Sync {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone)]
pub enum RetrySource {
    Report {
        path: Utf8PathBuf,
        all_failures: bool,
    },
    Items(Utf8PathBuf),
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderStatus {
    pub files: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub timestamp: String,
    pub data_root: Utf8PathBuf,
    pub total_files: usize,
    pub total_bytes: u64,
    pub folders: BTreeMap<String, FolderStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_report: Option<Utf8PathBuf>,
    pub recovered: usize,
    pub still_missing: Vec<AttemptRecord>,
}

const ROOT_FOLDER: &str = "(root)";

pub struct App<S: LayerService> {
    config: ResolvedConfig,
    store: Store,
    service: S,
    locks: PathLocks,
    cancel: CancelToken,
}

impl<S: LayerService> App<S> {
    pub fn new(config: ResolvedConfig, service: S) -> Self {
        let store = Store::new(config.data_root.clone());
        Self {
            config,
            store,
            service,
            locks: PathLocks::new(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn run(&self, sink: &dyn ProgressSink) -> Result<RunReport, SyncError> {
        let started = Instant::now();
        let catalog = self.load_catalog(sink)?;
        self.store.ensure_category_dirs()?;

        let ledger = Ledger::new();
        run_pool(
            catalog.entries.iter().enumerate().collect(),
            self.pool(),
            &self.cancel,
            |(seq, entry): (usize, &CatalogEntry)| self.sync_entry(seq, entry, &ledger, sink),
            |(seq, entry): (usize, &CatalogEntry)| {
                ledger.append(
                    seq,
                    AttemptRecord::endpoint_failure(
                        entry.endpoint.as_str(),
                        entry.category.label(),
                        "cancelled before start".to_string(),
                        FailureKind::Cancelled,
                    )
                    .with_attempts(0),
                );
            },
        );
        let offset = catalog.entries.len();
        for (index, unassigned) in catalog.unassigned.iter().enumerate() {
            ledger.append(
                offset + index,
                AttemptRecord::endpoint_failure(
                    unassigned.endpoint.as_str(),
                    unassigned.heading.as_deref().unwrap_or_default(),
                    format!("no known category heading above line {}", unassigned.line),
                    FailureKind::Uncategorized,
                )
                .with_attempts(0),
            );
        }

        let report = ledger.into_report(RunKind::Run, catalog.endpoint_count());
        sink.event(ProgressEvent {
            message: format!("phase=Store; writing {}", self.config.run_report),
            elapsed: Some(started.elapsed()),
        });
        report.write(&self.config.run_report)?;
        info!(
            ok = report.success_count,
            failed = report.failure_count,
            path = %self.config.run_report,
            "run finished"
        );
        Ok(report)
    }

    pub fn retry(
        &self,
        source: &RetrySource,
        sink: &dyn ProgressSink,
    ) -> Result<RunReport, SyncError> {
        sink.event(ProgressEvent::new("phase=Resolve; selecting retry items"));
        let (items, carried) = match source {
            RetrySource::Report { path, all_failures } => {
                let seed = RunReport::load(path)?;
                let selection = retry::select_from_report(&seed, *all_failures);
                (selection.items, selection.unusable)
            }
            RetrySource::Items(path) => (RetryItem::load_list(path)?, Vec::new()),
        };
        self.store.ensure_category_dirs()?;

        let coordinator = RetryCoordinator::new(
            &self.service,
            &self.store,
            &self.locks,
            self.config.retry,
            &self.cancel,
        );
        let report = coordinator.run(items, carried, sink);
        report.write(&self.config.retry_report)?;
        info!(
            recovered = report.success_count,
            failed = report.failure_count,
            path = %self.config.retry_report,
            "retry finished"
        );
        Ok(report)
    }

    pub fn reconcile(
        &self,
        report_path: Option<&Utf8Path>,
        sink: &dyn ProgressSink,
    ) -> Result<ReconciliationResult, SyncError> {
        let catalog = self.load_catalog(sink)?;
        let last = load_optional_report(report_path.unwrap_or(self.config.run_report.as_path()))?;
        let engine = ReconciliationEngine::new(
            &self.service,
            &self.store,
            self.config.discovery_timeout,
            self.pool(),
            &self.cancel,
        );
        let result = engine.reconcile(&catalog, last.as_ref(), sink)?;
        Store::write_json_atomic(&self.config.reconcile_report, &result)?;
        Ok(result)
    }

    pub fn status(
        &self,
        report_path: Option<&Utf8Path>,
        sink: &dyn ProgressSink,
    ) -> Result<StatusReport, SyncError> {
        sink.event(ProgressEvent::new("phase=Verify; scanning data root"));
        let artifacts = self.store.list_artifacts()?;
        let mut folders: BTreeMap<String, FolderStatus> = BTreeMap::new();
        for artifact in &artifacts {
            let folder = artifact.folder.as_deref().unwrap_or(ROOT_FOLDER);
            let status = folders.entry(folder.to_string()).or_default();
            status.files += 1;
            status.bytes += artifact.size;
        }

        let path = report_path.unwrap_or(self.config.run_report.as_path());
        let last = load_optional_report(path)?;
        let mut recovered = 0;
        let mut still_missing = Vec::new();
        for record in last.iter().flat_map(|report| report.failed.iter()) {
            let present = match (record.category(), record.filename.as_deref()) {
                (Some(category), Some(filename)) => self.store.locate(category, filename).is_some(),
                _ => false,
            };
            if present {
                recovered += 1;
            } else {
                still_missing.push(record.clone());
            }
        }

        let status = StatusReport {
            timestamp: chrono::Utc::now().to_rfc3339(),
            data_root: self.store.data_root().to_path_buf(),
            total_files: artifacts.len(),
            total_bytes: artifacts.iter().map(|artifact| artifact.size).sum(),
            folders,
            last_report: last.is_some().then(|| path.to_path_buf()),
            recovered,
            still_missing,
        };
        sink.event(ProgressEvent::new(format!(
            "phase=Store; {} files, {} still missing",
            status.total_files,
            status.still_missing.len()
        )));
        Store::write_json_atomic(&self.config.status_report, &status)?;
        Ok(status)
    }

    fn load_catalog(&self, sink: &dyn ProgressSink) -> Result<Catalog, SyncError> {
        sink.event(ProgressEvent::new(format!(
            "phase=Resolve; reading {}",
            self.config.catalog
        )));
        CatalogReader::new(self.config.default_category).read(&self.config.catalog)
    }

    fn pool(&self) -> PoolOptions {
        PoolOptions {
            workers: self.config.concurrency,
            item_delay: self.config.request_delay,
        }
    }

    fn sync_entry(&self, seq: usize, entry: &CatalogEntry, ledger: &Ledger, sink: &dyn ProgressSink) {
        sink.event(ProgressEvent::new(format!("phase=Discover; {}", entry.endpoint)));
        sink.event(ProgressEvent::new("service.request"));
        let start = Instant::now();
        let discovered = ServiceDiscoverer::new(&self.service, self.config.discovery_timeout)
            .discover(&entry.endpoint);
        sink.event(ProgressEvent::new(format!(
            "service.response latency_ms={}",
            start.elapsed().as_millis()
        )));

        let service = match discovered {
            Ok(service) => service,
            Err(err) => {
                warn!(endpoint = %entry.endpoint, error = %err, "discovery failed");
                sink.event(ProgressEvent::new(format!("item.failed {}", entry.endpoint)));
                ledger.append(
                    seq,
                    AttemptRecord::endpoint_failure(
                        entry.endpoint.as_str(),
                        entry.category.label(),
                        err.to_string(),
                        err.kind(),
                    ),
                );
                return;
            }
        };

        let fetcher = ArtifactFetcher::new(
            &self.service,
            &self.store,
            &self.locks,
            self.config.fetch_timeout,
        );
        for (index, layer) in service.layers.iter().enumerate() {
            if index > 0 && !self.cancel.sleep(self.config.request_delay) {
                ledger.append(
                    seq,
                    AttemptRecord::layer_failure(
                        layer,
                        entry.category,
                        None,
                        "cancelled before start".to_string(),
                        FailureKind::Cancelled,
                    )
                    .with_attempts(0),
                );
                continue;
            }
            sink.event(ProgressEvent::new(format!(
                "phase=Fetch; {} layer {}",
                entry.endpoint, layer.id
            )));
            sink.event(ProgressEvent::new("service.request"));
            let start = Instant::now();
            let record = fetcher.fetch(entry.category, &service.service_name, layer);
            sink.event(ProgressEvent::new(format!(
                "service.response latency_ms={}",
                start.elapsed().as_millis()
            )));
            sink.event(ProgressEvent::new(if record.is_success() {
                format!("item.ok {}", record.filename.as_deref().unwrap_or_default())
            } else {
                format!("item.failed {} layer {}", entry.endpoint, layer.id)
            }));
            ledger.append(seq, record);
        }
    }
}

fn load_optional_report(path: &Utf8Path) -> Result<Option<RunReport>, SyncError> {
    if !path.as_std_path().exists() {
        warn!(path = %path, "no run report found");
        return Ok(None);
    }
    RunReport::load(path).map(Some)
}
