use std::collections::HashSet;
use std::fs;

use camino::Utf8Path;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{Category, CatalogEntry, Endpoint};
use crate::error::SyncError;

const HEADING_MARKER: char = '#';
const URL_PREFIX: &str = "http";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnassignedEndpoint {
    pub line: usize,
    pub endpoint: Endpoint,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub entries: Vec<CatalogEntry>,
    pub unassigned: Vec<UnassignedEndpoint>,
    pub duplicates: usize,
    pub invalid_lines: usize,
}

impl Catalog {
    pub fn endpoint_count(&self) -> usize {
        self.entries.len() + self.unassigned.len()
    }
}

pub struct CatalogReader {
    default_category: Option<Category>,
}

impl CatalogReader {
    pub fn new(default_category: Option<Category>) -> Self {
        Self { default_category }
    }

    pub fn read(&self, path: &Utf8Path) -> Result<Catalog, SyncError> {
        let text = fs::read_to_string(path.as_std_path()).map_err(|err| SyncError::CatalogRead {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        let catalog = self.parse(&text);
        info!(
            path = %path,
            entries = catalog.entries.len(),
            unassigned = catalog.unassigned.len(),
            duplicates = catalog.duplicates,
            "catalog loaded"
        );
        Ok(catalog)
    }

    pub fn parse(&self, text: &str) -> Catalog {
        let mut catalog = Catalog::default();
        let mut seen = HashSet::new();
        let mut heading: Option<String> = None;

        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(label) = line.strip_prefix(HEADING_MARKER) {
                let label = label.trim().to_string();
                if Category::from_label(&label).is_none() {
                    debug!(line = index + 1, heading = %label, "unknown category heading");
                }
                heading = Some(label);
                continue;
            }
            if !line.starts_with(URL_PREFIX) {
                continue;
            }

            let endpoint: Endpoint = match line.parse() {
                Ok(endpoint) => endpoint,
                Err(err) => {
                    warn!(line = index + 1, error = %err, "skipping invalid endpoint");
                    catalog.invalid_lines += 1;
                    continue;
                }
            };
            if !seen.insert(endpoint.clone()) {
                debug!(line = index + 1, endpoint = %endpoint, "duplicate endpoint");
                catalog.duplicates += 1;
                continue;
            }

            let known = heading.as_deref().and_then(Category::from_label);
            match known.or(self.default_category) {
                Some(category) => catalog.entries.push(CatalogEntry { endpoint, category }),
                None => {
                    warn!(line = index + 1, endpoint = %endpoint, "endpoint has no category");
                    catalog.unassigned.push(UnassignedEndpoint {
                        line: index + 1,
                        endpoint,
                        heading: heading.clone(),
                    });
                }
            }
        }
        catalog
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const SAMPLE: &str = "\
# Energi Terbarukan
https://host/arcgis/rest/services/DBP/Potensi_Biogas/MapServer

https://host/arcgis/rest/services/DBP/Potensi_Surya/MapServer/

notes about the next block
# Ketenagalistrikan
https://host/arcgis/rest/services/SDL1/Rasio_Elektrifikasi/MapServer
https://host/arcgis/rest/services/DBP/Potensi_Biogas/MapServer
";

    #[test]
    fn headings_assign_categories_in_order() {
        let catalog = CatalogReader::new(None).parse(SAMPLE);
        assert_eq!(catalog.entries.len(), 3);
        assert_eq!(catalog.entries[0].category, Category::EnergiTerbarukan);
        assert_eq!(
            catalog.entries[1].endpoint.as_str(),
            "https://host/arcgis/rest/services/DBP/Potensi_Surya/MapServer"
        );
        assert_eq!(catalog.entries[2].category, Category::Ketenagalistrikan);
        assert_eq!(catalog.duplicates, 1);
        assert!(catalog.unassigned.is_empty());
    }

    #[test]
    fn endpoints_before_any_heading_are_unassigned() {
        let text = "https://host/rest/services/A/MapServer\n# Batas Wilayah\nhttps://host/rest/services/B/MapServer\n";
        let catalog = CatalogReader::new(None).parse(text);
        assert_eq!(catalog.entries.len(), 1);
        assert_matches!(
            catalog.unassigned.as_slice(),
            [UnassignedEndpoint { line: 1, heading: None, .. }]
        );
        assert_eq!(catalog.endpoint_count(), 2);
    }

    #[test]
    fn unknown_heading_uses_default_category() {
        let text = "# Lainnya\nhttps://host/rest/services/A/MapServer\n";
        let unassigned = CatalogReader::new(None).parse(text);
        assert_eq!(unassigned.unassigned[0].heading.as_deref(), Some("Lainnya"));

        let assigned = CatalogReader::new(Some(Category::BatasWilayah)).parse(text);
        assert_eq!(assigned.entries[0].category, Category::BatasWilayah);
        assert!(assigned.unassigned.is_empty());
    }

    #[test]
    fn unreadable_source_is_fatal() {
        let temp = tempfile::tempdir().unwrap();
        let missing = camino::Utf8PathBuf::from_path_buf(temp.path().join("none.txt")).unwrap();
        assert_matches!(
            CatalogReader::new(None).read(&missing),
            Err(SyncError::CatalogRead { .. })
        );
    }
}
