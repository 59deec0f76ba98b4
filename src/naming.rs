use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::domain::{Endpoint, LayerDescriptor};

static DISALLOWED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9_]").unwrap());
static REPEATED_UNDERSCORE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"_+").unwrap());

const PATH_MARKER: &str = "services";
const SERVICE_TYPE_MARKERS: &[&str] = &["MapServer", "FeatureServer"];

pub const ARTIFACT_EXTENSION: &str = "geojson";

pub fn sanitize(value: &str) -> String {
    let lowered = value.to_lowercase();
    let replaced = DISALLOWED.replace_all(&lowered, "_");
    let collapsed = REPEATED_UNDERSCORE.replace_all(&replaced, "_");
    collapsed.trim_matches('_').to_string()
}

pub fn service_name_from_path(endpoint: &Endpoint) -> Option<ServiceName> {
    let segments: Vec<&str> = endpoint.url().path_segments()?.collect();
    let start = segments.iter().position(|segment| *segment == PATH_MARKER)?;
    let parts: Vec<String> = segments[start + 1..]
        .iter()
        .take_while(|segment| !SERVICE_TYPE_MARKERS.contains(*segment))
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            urlencoding::decode(segment)
                .map(|decoded| decoded.into_owned())
                .unwrap_or_else(|_| segment.to_string())
        })
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(ServiceName(parts.join("_")))
}

// {service}_{layer}_layer{id}.geojson
pub fn canonical_filename(service: &ServiceName, layer_name: &str, layer_id: u32) -> String {
    format!(
        "{}_{}_layer{layer_id}.{ARTIFACT_EXTENSION}",
        sanitize(service.as_str()),
        sanitize(layer_name)
    )
}

pub fn layer_filename(service: &ServiceName, layer: &LayerDescriptor) -> String {
    canonical_filename(service, &layer.display_name(), layer.id)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceName(String);

impl ServiceName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(url: &str) -> Endpoint {
        url.parse().unwrap()
    }

    #[test]
    fn sanitize_collapses_case_and_punctuation() {
        assert_eq!(sanitize("Potensi Biogas"), "potensi_biogas");
        assert_eq!(sanitize("potensi_biogas"), "potensi_biogas");
        assert_eq!(sanitize("  Batas Administrasi Kabupaten/Kota "), "batas_administrasi_kabupaten_kota");
        assert_eq!(sanitize("__a--b__"), "a_b");
        assert_eq!(sanitize("Mineral & Batubara"), "mineral_batubara");
        assert_eq!(sanitize(""), "");
    }

    #[test]
    fn sanitize_is_idempotent() {
        for input in ["Rasio Elektrifikasi Tahun 2024", "WKP (Panas Bumi)", "Ä-ö"] {
            let once = sanitize(input);
            assert_eq!(sanitize(&once), once);
        }
    }

    #[test]
    fn service_name_spans_folder_and_service() {
        let name = service_name_from_path(&endpoint(
            "https://geoportal.esdm.go.id/gis2/rest/services/DBP/Potensi_Biogas/MapServer",
        ))
        .unwrap();
        assert_eq!(name.as_str(), "DBP_Potensi_Biogas");

        let name = service_name_from_path(&endpoint(
            "https://host/arcgis/rest/services/Root_Service/FeatureServer",
        ))
        .unwrap();
        assert_eq!(name.as_str(), "Root_Service");
    }

    #[test]
    fn service_name_uses_decoded_segments() {
        let name = service_name_from_path(&endpoint(
            "https://host/rest/services/DBP/Potensi Surya/MapServer",
        ))
        .unwrap();
        assert_eq!(name.as_str(), "DBP_Potensi Surya");
        assert_eq!(
            canonical_filename(&name, "Potensi Surya", 0),
            "dbp_potensi_surya_potensi_surya_layer0.geojson"
        );
    }

    #[test]
    fn service_name_requires_services_segment() {
        assert_eq!(
            service_name_from_path(&endpoint("https://host/arcgis/rest/DBP/MapServer")),
            None
        );
        assert_eq!(
            service_name_from_path(&endpoint("https://host/rest/services/MapServer")),
            None
        );
    }

    #[test]
    fn canonical_filename_shape() {
        let service = ServiceName("SDL1/Rasio_Elektrifikasi".replace('/', "_"));
        assert_eq!(
            canonical_filename(&service, "Rasio Elektrifikasi Tahun 2024", 0),
            "sdl1_rasio_elektrifikasi_rasio_elektrifikasi_tahun_2024_layer0.geojson"
        );
    }

    #[test]
    fn canonical_filename_is_stable_across_spellings() {
        let service = ServiceName("DBP_Potensi_Biogas".to_string());
        let a = canonical_filename(&service, "Potensi Biogas", 0);
        let b = canonical_filename(&service, "potensi_biogas", 0);
        assert_eq!(a, b);
        assert_ne!(a, canonical_filename(&service, "Potensi Biogas", 1));
    }
}
