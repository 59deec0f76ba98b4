use std::collections::HashSet;
use std::fs;
use std::time::Duration;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::app::{ProgressEvent, ProgressSink};
use crate::discovery::ServiceDiscoverer;
use crate::domain::{Category, Endpoint, LayerDescriptor};
use crate::error::{FailureKind, SyncError};
use crate::fetcher::ArtifactFetcher;
use crate::naming;
use crate::report::{AttemptRecord, Ledger, RunKind, RunReport};
use crate::service::LayerService;
use crate::store::Store;
use crate::worker::{CancelToken, PathLocks, PoolOptions, run_pool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub item_delay: Duration,
    pub discovery_timeout: Duration,
    pub fetch_timeout: Duration,
    pub workers: usize,
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryItem {
    #[serde(alias = "url", alias = "endpointUrl")]
    pub endpoint: Endpoint,
    pub category: Category,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_name: Option<String>,
}

impl RetryItem {
    pub fn load_list(path: &Utf8Path) -> Result<Vec<RetryItem>, SyncError> {
        let content = fs::read_to_string(path.as_std_path()).map_err(|err| SyncError::ReportRead {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        let items: Vec<RetryItem> = serde_json::from_str(&content)
            .map_err(|err| SyncError::InvalidRetryItem(format!("{path}: {err}")))?;
        Ok(dedup(items))
    }
}

#[derive(Debug, Default)]
pub struct RetrySelection {
    pub items: Vec<RetryItem>,
    pub unusable: Vec<AttemptRecord>,
}

pub fn select_from_report(report: &RunReport, all_failures: bool) -> RetrySelection {
    let mut selection = RetrySelection::default();
    for record in &report.failed {
        let eligible = match record.error_kind {
            None | Some(FailureKind::Cancelled) => true,
            Some(kind) => all_failures || kind.is_transient(),
        };
        if !eligible {
            debug!(endpoint = %record.endpoint_url, kind = ?record.error_kind, "not retrying");
            continue;
        }

        let endpoint: Endpoint = match record.endpoint_url.parse() {
            Ok(endpoint) => endpoint,
            Err(err) => {
                warn!(error = %err, "report entry has an invalid endpoint");
                let mut carried = record.clone().with_attempts(0);
                carried.error = Some(format!("not retried: {err}"));
                selection.unusable.push(carried);
                continue;
            }
        };
        let Some(category) = record.category() else {
            warn!(endpoint = %endpoint, category = %record.category, "report entry has no known category");
            let mut carried = record.clone().with_attempts(0);
            carried.error = Some(format!("not retried: unknown category {:?}", record.category));
            carried.error_kind = Some(FailureKind::Uncategorized);
            selection.unusable.push(carried);
            continue;
        };
        selection.items.push(RetryItem {
            endpoint,
            category,
            layer_id: record.layer_id,
            layer_name: record.layer_name.clone(),
        });
    }
    selection.items = dedup(selection.items);
    selection
}

fn dedup(items: Vec<RetryItem>) -> Vec<RetryItem> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert((item.endpoint.clone(), item.layer_id)))
        .collect()
}

pub struct RetryCoordinator<'a, S: LayerService> {
    service: &'a S,
    store: &'a Store,
    locks: &'a PathLocks,
    policy: RetryPolicy,
    cancel: &'a CancelToken,
}

impl<'a, S: LayerService> RetryCoordinator<'a, S> {
    pub fn new(
        service: &'a S,
        store: &'a Store,
        locks: &'a PathLocks,
        policy: RetryPolicy,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            service,
            store,
            locks,
            policy,
            cancel,
        }
    }

    pub fn run(
        &self,
        items: Vec<RetryItem>,
        carried: Vec<AttemptRecord>,
        sink: &dyn ProgressSink,
    ) -> RunReport {
        let total = items.len() + carried.len();
        info!(items = items.len(), max_attempts = self.policy.max_attempts(), "retry pass starting");
        sink.event(ProgressEvent::new(format!(
            "phase=Resolve; {} items to retry",
            items.len()
        )));

        let ledger = Ledger::new();
        let offset = items.len();
        run_pool(
            items.into_iter().enumerate().collect(),
            PoolOptions {
                workers: self.policy.workers,
                item_delay: self.policy.item_delay,
            },
            self.cancel,
            |(seq, item): (usize, RetryItem)| {
                let record = self.retry_item(&item, sink);
                sink.event(ProgressEvent::new(if record.is_success() {
                    format!("item.ok {}", item.endpoint)
                } else {
                    format!("item.failed {}", item.endpoint)
                }));
                ledger.append(seq, record);
            },
            |(seq, item): (usize, RetryItem)| ledger.append(seq, cancelled(&item)),
        );
        for (index, record) in carried.into_iter().enumerate() {
            ledger.append(offset + index, record);
        }

        let report = ledger.into_report(RunKind::Retry, total);
        sink.event(ProgressEvent::new(format!(
            "phase=Store; {} recovered, {} still failing",
            report.success_count, report.failure_count
        )));
        report
    }

    pub fn retry_item(&self, item: &RetryItem, sink: &dyn ProgressSink) -> AttemptRecord {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            debug!(endpoint = %item.endpoint, layer_id = ?item.layer_id, attempt, "retry attempt");
            let record = self.attempt(item, sink);
            let transient = !record.is_success()
                && record.error_kind.is_some_and(FailureKind::is_transient);
            if !transient || attempt >= max_attempts {
                return record.with_attempts(attempt);
            }
            warn!(
                endpoint = %item.endpoint,
                attempt,
                error = record.error.as_deref().unwrap_or_default(),
                "transient failure, retrying"
            );
            sink.event(ProgressEvent::new(format!(
                "retry attempt={} of {max_attempts} {}",
                attempt + 1,
                item.endpoint
            )));
            if !self.cancel.sleep(self.policy.retry_delay) {
                return record.with_attempts(attempt);
            }
        }
    }

    fn attempt(&self, item: &RetryItem, sink: &dyn ProgressSink) -> AttemptRecord {
        let Some(service_name) = naming::service_name_from_path(&item.endpoint) else {
            return AttemptRecord::endpoint_failure(
                item.endpoint.as_str(),
                item.category.label(),
                format!("cannot derive a service name from {}", item.endpoint),
                FailureKind::UnnamedService,
            );
        };

        let layer = match (item.layer_id, &item.layer_name) {
            (Some(id), Some(name)) => LayerDescriptor {
                endpoint: item.endpoint.clone(),
                id,
                name: name.clone(),
            },
            (wanted, _) => {
                sink.event(ProgressEvent::new(format!("phase=Discover; {}", item.endpoint)));
                sink.event(ProgressEvent::new("service.request"));
                let discoverer = ServiceDiscoverer::new(self.service, self.policy.discovery_timeout);
                let service = match discoverer.discover(&item.endpoint) {
                    Ok(service) => service,
                    Err(err) => {
                        return AttemptRecord::endpoint_failure(
                            item.endpoint.as_str(),
                            item.category.label(),
                            err.to_string(),
                            err.kind(),
                        );
                    }
                };
                match wanted {
                    Some(id) => match service.layers.into_iter().find(|layer| layer.id == id) {
                        Some(layer) => layer,
                        None => {
                            let mut record = AttemptRecord::endpoint_failure(
                                item.endpoint.as_str(),
                                item.category.label(),
                                format!("layer {id} is no longer listed by the service"),
                                FailureKind::NoLayersFound,
                            );
                            record.layer_id = Some(id);
                            return record;
                        }
                    },
                    None => match service.layers.into_iter().next() {
                        Some(layer) => layer,
                        None => {
                            return AttemptRecord::endpoint_failure(
                                item.endpoint.as_str(),
                                item.category.label(),
                                "No layers found".to_string(),
                                FailureKind::NoLayersFound,
                            );
                        }
                    },
                }
            }
        };

        sink.event(ProgressEvent::new(format!(
            "phase=Fetch; {} layer {}",
            item.endpoint, layer.id
        )));
        sink.event(ProgressEvent::new("service.request"));
        let fetcher = ArtifactFetcher::new(
            self.service,
            self.store,
            self.locks,
            self.policy.fetch_timeout,
        );
        fetcher.fetch(item.category, &service_name, &layer)
    }
}

fn cancelled(item: &RetryItem) -> AttemptRecord {
    let mut record = AttemptRecord::endpoint_failure(
        item.endpoint.as_str(),
        item.category.label(),
        "cancelled before start".to_string(),
        FailureKind::Cancelled,
    );
    record.layer_id = item.layer_id;
    record.layer_name = item.layer_name.clone();
    record.with_attempts(0)
}
