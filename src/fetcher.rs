use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::Deserialize;
use serde::de::IgnoredAny;
use tempfile::Builder;
use tracing::{debug, info, warn};

use crate::domain::{Category, LayerDescriptor};
use crate::error::FetchError;
use crate::naming::{self, ServiceName};
use crate::report::AttemptRecord;
use crate::service::LayerService;
use crate::store::Store;
use crate::worker::PathLocks;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedArtifact {
    pub filename: String,
    pub path: Utf8PathBuf,
    pub size: u64,
    pub features: u64,
}

#[derive(Debug, Deserialize)]
struct FeatureCollectionProbe {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    features: Option<Vec<IgnoredAny>>,
    #[serde(default)]
    error: Option<IgnoredAny>,
}

// The destination keeps its previous content unless a valid artifact replaces it.
pub struct ArtifactFetcher<'a, S: LayerService> {
    service: &'a S,
    store: &'a Store,
    locks: &'a PathLocks,
    timeout: Duration,
}

impl<'a, S: LayerService> ArtifactFetcher<'a, S> {
    pub fn new(service: &'a S, store: &'a Store, locks: &'a PathLocks, timeout: Duration) -> Self {
        Self {
            service,
            store,
            locks,
            timeout,
        }
    }

    pub fn fetch(
        &self,
        category: Category,
        service_name: &ServiceName,
        layer: &LayerDescriptor,
    ) -> AttemptRecord {
        let filename = naming::layer_filename(service_name, layer);
        match self.try_fetch(category, &filename, layer) {
            Ok(artifact) => AttemptRecord::success(
                layer,
                category,
                artifact.filename,
                artifact.path,
                artifact.size,
                artifact.features,
            ),
            Err(err) => AttemptRecord::layer_failure(
                layer,
                category,
                Some(filename),
                err.to_string(),
                err.kind(),
            ),
        }
    }

    pub fn try_fetch(
        &self,
        category: Category,
        filename: &str,
        layer: &LayerDescriptor,
    ) -> Result<FetchedArtifact, FetchError> {
        let destination = self.store.artifact_path(category, filename);
        let parent = self.store.category_dir(category);
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| FetchError::Filesystem(err.to_string()))?;

        let guard = self.locks.for_path(&destination);
        let _held = guard.hold();

        let mut temp = Builder::new()
            .prefix(".partial-")
            .suffix(".geojson.tmp")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| FetchError::Filesystem(err.to_string()))?;

        let url = layer.endpoint.query_url(layer.id);
        debug!(url = %url, timeout_secs = self.timeout.as_secs(), "downloading layer");
        let start = Instant::now();
        let streamed = {
            let mut writer = BufWriter::new(temp.as_file_mut());
            let streamed = self
                .service
                .download(&url, self.timeout, &mut writer)
                .inspect_err(|err| {
                    warn!(endpoint = %layer.endpoint, layer_id = layer.id, error = %err, "download failed");
                })?;
            writer
                .flush()
                .map_err(|err| FetchError::Filesystem(err.to_string()))?;
            streamed
        };

        let features = validate_artifact(temp.path()).inspect_err(|err| {
            warn!(endpoint = %layer.endpoint, layer_id = layer.id, error = %err, "discarding artifact");
        })?;

        temp.persist(destination.as_std_path())
            .map_err(|err| FetchError::Filesystem(err.error.to_string()))?;
        info!(
            path = %destination,
            size = streamed,
            features,
            latency_ms = start.elapsed().as_millis() as u64,
            "artifact written"
        );

        Ok(FetchedArtifact {
            filename: filename.to_string(),
            path: destination,
            size: streamed,
            features,
        })
    }
}

pub fn validate_artifact(path: &Path) -> Result<u64, FetchError> {
    let size = fs::metadata(path)
        .map_err(|err| FetchError::Filesystem(err.to_string()))?
        .len();
    if size == 0 {
        return Err(FetchError::EmptyOrInvalidArtifact(
            "Downloaded file is empty".to_string(),
        ));
    }

    let file = File::open(path).map_err(|err| FetchError::Filesystem(err.to_string()))?;
    let probe: FeatureCollectionProbe = serde_json::from_reader(BufReader::new(file))
        .map_err(|err| FetchError::EmptyOrInvalidArtifact(format!("not valid JSON: {err}")))?;

    if probe.error.is_some() {
        return Err(FetchError::EmptyOrInvalidArtifact(
            "service returned an error document instead of features".to_string(),
        ));
    }
    match (probe.kind.as_deref(), probe.features) {
        (Some("FeatureCollection"), Some(features)) => Ok(features.len() as u64),
        (Some("FeatureCollection"), None) => Err(FetchError::EmptyOrInvalidArtifact(
            "feature collection has no features array".to_string(),
        )),
        (other, _) => Err(FetchError::EmptyOrInvalidArtifact(format!(
            "expected a FeatureCollection, got {}",
            other.unwrap_or("an untyped document")
        ))),
    }
}
