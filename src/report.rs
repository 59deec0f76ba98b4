use std::sync::{Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::domain::{Category, Endpoint, LayerDescriptor};
use crate::error::{FailureKind, SyncError};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    #[default]
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    #[serde(alias = "url")]
    pub endpoint_url: String,
    #[serde(default)]
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_name: Option<String>,
    #[serde(default)]
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filepath: Option<Utf8PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
}

fn default_attempts() -> u32 {
    1
}

impl AttemptRecord {
    pub fn success(
        layer: &LayerDescriptor,
        category: Category,
        filename: String,
        filepath: Utf8PathBuf,
        size: u64,
        features: u64,
    ) -> Self {
        Self {
            endpoint_url: layer.endpoint.to_string(),
            category: category.label().to_string(),
            layer_id: Some(layer.id),
            layer_name: Some(layer.name.clone()),
            outcome: Outcome::Success,
            filename: Some(filename),
            filepath: Some(filepath),
            size: Some(size),
            features: Some(features),
            error: None,
            error_kind: None,
            attempts: 1,
        }
    }

    pub fn layer_failure(
        layer: &LayerDescriptor,
        category: Category,
        filename: Option<String>,
        error: String,
        kind: FailureKind,
    ) -> Self {
        Self {
            endpoint_url: layer.endpoint.to_string(),
            category: category.label().to_string(),
            layer_id: Some(layer.id),
            layer_name: Some(layer.name.clone()),
            outcome: Outcome::Failure,
            filename,
            filepath: None,
            size: None,
            features: None,
            error: Some(error),
            error_kind: Some(kind),
            attempts: 1,
        }
    }

    pub fn endpoint_failure(
        endpoint: &str,
        category: &str,
        error: String,
        kind: FailureKind,
    ) -> Self {
        Self {
            endpoint_url: endpoint.to_string(),
            category: category.to_string(),
            layer_id: None,
            layer_name: None,
            outcome: Outcome::Failure,
            filename: None,
            filepath: None,
            size: None,
            features: None,
            error: Some(error),
            error_kind: Some(kind),
            attempts: 1,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    pub fn is_endpoint_level(&self) -> bool {
        self.layer_id.is_none()
    }

    pub fn category(&self) -> Option<Category> {
        Category::from_label(&self.category).or_else(|| Category::from_folder(&self.category))
    }

    pub fn matches(&self, endpoint: &Endpoint, layer_id: Option<u32>) -> bool {
        self.layer_id == layer_id && same_endpoint(&self.endpoint_url, endpoint)
    }
}

fn same_endpoint(recorded: &str, endpoint: &Endpoint) -> bool {
    match recorded.parse::<Endpoint>() {
        Ok(parsed) => &parsed == endpoint,
        Err(_) => recorded.trim().trim_end_matches('/') == endpoint.as_str(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    #[default]
    Run,
    Retry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub timestamp: String,
    #[serde(default)]
    pub kind: RunKind,
    #[serde(alias = "totalMapServers", alias = "totalRetries", default)]
    pub total_endpoints: usize,
    #[serde(default)]
    pub success_count: usize,
    #[serde(default)]
    pub failure_count: usize,
    #[serde(default)]
    pub successful: Vec<AttemptRecord>,
    #[serde(default)]
    pub failed: Vec<AttemptRecord>,
}

impl RunReport {
    pub fn load(path: &Utf8Path) -> Result<Self, SyncError> {
        let mut report: RunReport = Store::read_json(path)?;
        // Older reports carry no outcome field; the array decides.
        for record in &mut report.successful {
            record.outcome = Outcome::Success;
        }
        for record in &mut report.failed {
            record.outcome = Outcome::Failure;
        }
        report.success_count = report.successful.len();
        report.failure_count = report.failed.len();
        Ok(report)
    }

    pub fn write(&self, path: &Utf8Path) -> Result<(), SyncError> {
        Store::write_json_atomic(path, self)
    }

    pub fn failure_for(&self, endpoint: &Endpoint, layer_id: u32) -> Option<&AttemptRecord> {
        self.failed
            .iter()
            .find(|record| record.matches(endpoint, Some(layer_id)))
            .or_else(|| self.endpoint_failure(endpoint))
    }

    pub fn endpoint_failure(&self, endpoint: &Endpoint) -> Option<&AttemptRecord> {
        self.failed
            .iter()
            .find(|record| record.matches(endpoint, None))
    }
}

// Records carry the sequence number of their work item; the report keeps input order.
#[derive(Debug, Default)]
pub struct Ledger {
    records: Mutex<Vec<(usize, AttemptRecord)>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, seq: usize, record: AttemptRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((seq, record));
    }

    pub fn counts(&self) -> (usize, usize) {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let ok = records.iter().filter(|(_, r)| r.is_success()).count();
        (ok, records.len() - ok)
    }

    pub fn into_report(self, kind: RunKind, total_endpoints: usize) -> RunReport {
        let mut records = self
            .records
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        records.sort_by_key(|(seq, _)| *seq);
        let (successful, failed): (Vec<_>, Vec<_>) = records
            .into_iter()
            .map(|(_, record)| record)
            .partition(AttemptRecord::is_success);
        RunReport {
            timestamp: chrono::Utc::now().to_rfc3339(),
            kind,
            total_endpoints,
            success_count: successful.len(),
            failure_count: failed.len(),
            successful,
            failed,
        }
    }
}
