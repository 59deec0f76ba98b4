use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{info, warn};

use crate::app::{ProgressEvent, ProgressSink};
use crate::catalog::Catalog;
use crate::discovery::{DiscoveredService, ServiceDiscoverer};
use crate::domain::{CatalogEntry, Category};
use crate::error::{DiscoveryError, FailureKind, SyncError};
use crate::naming;
use crate::report::{AttemptRecord, RunReport};
use crate::service::LayerService;
use crate::store::{Placement, Store, StoredArtifact};
use crate::worker::{CancelToken, PoolOptions, run_pool};

pub const DEFAULT_MISSING_REASON: &str = "not downloaded or download failed";

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryBreakdown {
    pub endpoints: usize,
    pub expected: usize,
    pub existing: usize,
    pub missing: usize,
    pub endpoint_errors: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresentLayer {
    pub endpoint_url: String,
    pub category: Category,
    pub layer_id: u32,
    pub layer_name: String,
    pub filename: String,
    pub filepath: Utf8PathBuf,
    pub size: u64,
    pub placement: Placement,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingLayer {
    pub endpoint_url: String,
    pub category: Category,
    pub layer_id: u32,
    pub layer_name: String,
    pub filename: String,
    pub expected_path: Utf8PathBuf,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recommendation {
    pub issue: String,
    pub count: usize,
    pub remediation: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationResult {
    pub timestamp: String,
    pub expected_count: usize,
    pub existing_count: usize,
    pub missing_count: usize,
    pub total_bytes: u64,
    pub per_category: BTreeMap<Category, CategoryBreakdown>,
    pub present: Vec<PresentLayer>,
    pub missing_details: Vec<MissingLayer>,
    pub endpoint_issues: Vec<AttemptRecord>,
    pub recommendations: Vec<Recommendation>,
    pub unexpected_artifacts: Vec<StoredArtifact>,
}

enum Discovered {
    Service(DiscoveredService),
    Failed(DiscoveryError),
    Cancelled,
}

pub struct ReconciliationEngine<'a, S: LayerService> {
    service: &'a S,
    store: &'a Store,
    discovery_timeout: Duration,
    pool: PoolOptions,
    cancel: &'a CancelToken,
}

impl<'a, S: LayerService> ReconciliationEngine<'a, S> {
    pub fn new(
        service: &'a S,
        store: &'a Store,
        discovery_timeout: Duration,
        pool: PoolOptions,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            service,
            store,
            discovery_timeout,
            pool,
            cancel,
        }
    }

    // Never writes to the data root.
    pub fn reconcile(
        &self,
        catalog: &Catalog,
        last_report: Option<&RunReport>,
        sink: &dyn ProgressSink,
    ) -> Result<ReconciliationResult, SyncError> {
        let discovered = self.discover_all(&catalog.entries, sink);

        sink.event(ProgressEvent::new("phase=Verify; checking artifacts on disk"));
        let mut result = ReconciliationResult {
            timestamp: chrono::Utc::now().to_rfc3339(),
            expected_count: 0,
            existing_count: 0,
            missing_count: 0,
            total_bytes: 0,
            per_category: BTreeMap::new(),
            present: Vec::new(),
            missing_details: Vec::new(),
            endpoint_issues: Vec::new(),
            recommendations: Vec::new(),
            unexpected_artifacts: Vec::new(),
        };
        let mut located = HashSet::new();

        for (entry, outcome) in catalog.entries.iter().zip(discovered) {
            let breakdown = result.per_category.entry(entry.category).or_default();
            breakdown.endpoints += 1;

            let service = match outcome {
                Discovered::Service(service) => service,
                Discovered::Failed(err) => {
                    breakdown.endpoint_errors += 1;
                    result.endpoint_issues.push(AttemptRecord::endpoint_failure(
                        entry.endpoint.as_str(),
                        entry.category.label(),
                        err.to_string(),
                        err.kind(),
                    ));
                    continue;
                }
                Discovered::Cancelled => {
                    breakdown.endpoint_errors += 1;
                    result.endpoint_issues.push(AttemptRecord::endpoint_failure(
                        entry.endpoint.as_str(),
                        entry.category.label(),
                        "cancelled before discovery".to_string(),
                        FailureKind::Cancelled,
                    ));
                    continue;
                }
            };

            for layer in &service.layers {
                let filename = naming::layer_filename(&service.service_name, layer);
                breakdown.expected += 1;
                match self.store.locate(entry.category, &filename) {
                    Some(found) => {
                        breakdown.existing += 1;
                        breakdown.bytes += found.size;
                        located.insert(found.path.clone());
                        result.present.push(PresentLayer {
                            endpoint_url: entry.endpoint.to_string(),
                            category: entry.category,
                            layer_id: layer.id,
                            layer_name: layer.display_name(),
                            filename,
                            filepath: found.path,
                            size: found.size,
                            placement: found.placement,
                        });
                    }
                    None => {
                        breakdown.missing += 1;
                        let prior = last_report.and_then(|report| report.failure_for(&entry.endpoint, layer.id));
                        result.missing_details.push(MissingLayer {
                            endpoint_url: entry.endpoint.to_string(),
                            category: entry.category,
                            layer_id: layer.id,
                            layer_name: layer.display_name(),
                            expected_path: self.store.artifact_path(entry.category, &filename),
                            filename,
                            reason: prior
                                .and_then(|record| record.error.clone())
                                .unwrap_or_else(|| DEFAULT_MISSING_REASON.to_string()),
                            error_kind: prior.and_then(|record| record.error_kind),
                        });
                    }
                }
            }
        }

        for unassigned in &catalog.unassigned {
            result.endpoint_issues.push(AttemptRecord::endpoint_failure(
                unassigned.endpoint.as_str(),
                unassigned.heading.as_deref().unwrap_or_default(),
                format!("no known category heading above line {}", unassigned.line),
                FailureKind::Uncategorized,
            ));
        }

        result.expected_count = result.present.len() + result.missing_details.len();
        result.existing_count = result.present.len();
        result.missing_count = result.missing_details.len() + result.endpoint_issues.len();
        result.total_bytes = result.present.iter().map(|layer| layer.size).sum();
        result.recommendations = recommend(&result.missing_details, &result.endpoint_issues);
        result.unexpected_artifacts = self
            .store
            .list_artifacts()?
            .into_iter()
            .filter(|artifact| !located.contains(&artifact.path))
            .collect();

        info!(
            expected = result.expected_count,
            existing = result.existing_count,
            missing = result.missing_count,
            unexpected = result.unexpected_artifacts.len(),
            "reconciliation finished"
        );
        sink.event(ProgressEvent::new(format!(
            "phase=Store; {} of {} layers present",
            result.existing_count, result.expected_count
        )));
        Ok(result)
    }

    fn discover_all(&self, entries: &[CatalogEntry], sink: &dyn ProgressSink) -> Vec<Discovered> {
        let outcomes = Mutex::new(Vec::with_capacity(entries.len()));
        let discoverer = ServiceDiscoverer::new(self.service, self.discovery_timeout);
        let push = |seq: usize, outcome: Discovered| {
            outcomes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((seq, outcome));
        };

        run_pool(
            entries.iter().enumerate().collect(),
            self.pool,
            self.cancel,
            |(seq, entry): (usize, &CatalogEntry)| {
                sink.event(ProgressEvent::new(format!("phase=Discover; {}", entry.endpoint)));
                sink.event(ProgressEvent::new("service.request"));
                let start = Instant::now();
                let outcome = match discoverer.discover(&entry.endpoint) {
                    Ok(service) => Discovered::Service(service),
                    Err(err) => {
                        warn!(endpoint = %entry.endpoint, error = %err, "discovery failed");
                        Discovered::Failed(err)
                    }
                };
                sink.event(ProgressEvent::new(format!(
                    "service.response latency_ms={}",
                    start.elapsed().as_millis()
                )));
                push(seq, outcome);
            },
            |(seq, _): (usize, &CatalogEntry)| push(seq, Discovered::Cancelled),
        );

        let mut outcomes = outcomes
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        outcomes.sort_by_key(|(seq, _)| *seq);
        outcomes.into_iter().map(|(_, outcome)| outcome).collect()
    }
}

fn rule_for(kind: Option<FailureKind>) -> (&'static str, &'static str) {
    match kind {
        Some(FailureKind::Timeout) => (
            "Download timeout",
            "run `geolayer-sync retry` with a longer retry.fetch_timeout_secs",
        ),
        Some(FailureKind::Transport(kind)) if kind.is_transient() => (
            "Network error",
            "check connectivity to the service host, then run `geolayer-sync retry`",
        ),
        Some(FailureKind::Transport(_)) => (
            "Transport error",
            "inspect the endpoint manually; redirects or TLS may be misconfigured",
        ),
        Some(FailureKind::NoLayersFound) => (
            "No layers found",
            "verify manually that the service still exists and exposes layers",
        ),
        Some(FailureKind::HttpStatus) => (
            "HTTP error",
            "check whether the service moved or now requires a token",
        ),
        Some(FailureKind::MalformedResponse) => (
            "Malformed metadata",
            "open the metadata URL in a browser; the host may be serving a maintenance page",
        ),
        Some(FailureKind::EmptyOrInvalidArtifact) => (
            "Empty or invalid data",
            "the layer query returned no usable features; check query permissions and retry with --all-failures",
        ),
        Some(FailureKind::UnnamedService) => (
            "Unnamed service",
            "fix the catalog line so the path contains services/<name>/MapServer",
        ),
        Some(FailureKind::Uncategorized) => (
            "No category",
            "add a known category heading above the endpoint or set default_category",
        ),
        Some(FailureKind::Filesystem) => (
            "Filesystem error",
            "check free space and permissions under the data root",
        ),
        Some(FailureKind::Cancelled) => ("Cancelled", "run the pass again to finish"),
        None => (
            "Not downloaded",
            "run `geolayer-sync run` or `geolayer-sync retry --all-failures`",
        ),
    }
}

pub fn recommend(missing: &[MissingLayer], endpoint_issues: &[AttemptRecord]) -> Vec<Recommendation> {
    let mut histogram: BTreeMap<&'static str, (usize, &'static str)> = BTreeMap::new();
    let kinds = missing
        .iter()
        .map(|layer| layer.error_kind)
        .chain(endpoint_issues.iter().map(|record| record.error_kind));
    for kind in kinds {
        let (issue, remediation) = rule_for(kind);
        histogram.entry(issue).or_insert((0, remediation)).0 += 1;
    }

    let mut recommendations: Vec<_> = histogram
        .into_iter()
        .map(|(issue, (count, remediation))| Recommendation {
            issue: issue.to_string(),
            count,
            remediation: remediation.to_string(),
        })
        .collect();
    recommendations.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.issue.cmp(&b.issue)));
    recommendations
}
