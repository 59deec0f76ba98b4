use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::Builder;

use crate::domain::Category;
use crate::error::SyncError;
use crate::naming::ARTIFACT_EXTENSION;

#[derive(Debug, Clone)]
pub struct Store {
    data_root: Utf8PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Placement {
    Canonical,
    Legacy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLocation {
    pub path: Utf8PathBuf,
    pub size: u64,
    pub placement: Placement,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredArtifact {
    pub filename: String,
    pub path: Utf8PathBuf,
    pub folder: Option<String>,
    pub size: u64,
}

impl Store {
    pub fn new(data_root: Utf8PathBuf) -> Self {
        Self { data_root }
    }

    pub fn data_root(&self) -> &Utf8Path {
        &self.data_root
    }

    pub fn category_dir(&self, category: Category) -> Utf8PathBuf {
        self.data_root.join(category.folder())
    }

    pub fn artifact_path(&self, category: Category, filename: &str) -> Utf8PathBuf {
        self.category_dir(category).join(filename)
    }

    // Older runs wrote into a folder named after the raw heading, or into the root.
    pub fn legacy_paths(&self, category: Category, filename: &str) -> [Utf8PathBuf; 2] {
        [
            self.data_root.join(category.label()).join(filename),
            self.data_root.join(filename),
        ]
    }

    pub fn locate(&self, category: Category, filename: &str) -> Option<ArtifactLocation> {
        let canonical = self.artifact_path(category, filename);
        if let Some(size) = file_size(&canonical) {
            return Some(ArtifactLocation {
                path: canonical,
                size,
                placement: Placement::Canonical,
            });
        }
        self.legacy_paths(category, filename)
            .into_iter()
            .find_map(|path| {
                file_size(&path).map(|size| ArtifactLocation {
                    path,
                    size,
                    placement: Placement::Legacy,
                })
            })
    }

    pub fn ensure_category_dirs(&self) -> Result<(), SyncError> {
        for category in Category::ALL {
            fs::create_dir_all(self.category_dir(category).as_std_path())
                .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }

    pub fn list_artifacts(&self) -> Result<Vec<StoredArtifact>, SyncError> {
        if !self.data_root.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut artifacts = Vec::new();
        for path in walk_dir(self.data_root.as_std_path())? {
            if !path.is_file()
                || path.extension().map(|ext| ext != ARTIFACT_EXTENSION).unwrap_or(true)
            {
                continue;
            }
            let path = Utf8PathBuf::from_path_buf(path)
                .map_err(|_| SyncError::Filesystem("non-utf8 artifact path".to_string()))?;
            let size = fs::metadata(path.as_std_path())
                .map_err(|err| SyncError::Filesystem(err.to_string()))?
                .len();
            let folder = path
                .strip_prefix(&self.data_root)
                .ok()
                .and_then(|relative| {
                    let mut components = relative.components();
                    let first = components.next()?;
                    components.next().map(|_| first.as_str().to_string())
                });
            artifacts.push(StoredArtifact {
                filename: path.file_name().unwrap_or_default().to_string(),
                path,
                folder,
                size,
            });
        }
        artifacts.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(artifacts)
    }

    pub fn write_json_atomic<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), SyncError> {
        let content = serde_json::to_vec_pretty(value)
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        Self::write_bytes_atomic(path, &content)
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), SyncError> {
        let parent = match path.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent.to_path_buf(),
            _ => Utf8PathBuf::from("."),
        };
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let mut temp = Builder::new()
            .prefix(".geolayer-sync")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        temp.write_all(content)
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<T, SyncError> {
        let content = fs::read_to_string(path.as_std_path()).map_err(|err| SyncError::ReportRead {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        serde_json::from_str(&content).map_err(|err| SyncError::ReportParse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }
}

fn file_size(path: &Utf8Path) -> Option<u64> {
    fs::metadata(path.as_std_path())
        .ok()
        .filter(|meta| meta.is_file())
        .map(|meta| meta.len())
}

fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, SyncError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(&path).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| SyncError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    Ok(items)
}
