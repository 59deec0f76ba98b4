use std::fmt;
use std::str::FromStr;

use reqwest::Url;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "Energi Terbarukan")]
    EnergiTerbarukan,
    #[serde(rename = "Mineral & Batubara")]
    MineralBatubara,
    #[serde(rename = "Minyak & Gas Bumi")]
    MinyakGasBumi,
    #[serde(rename = "Ketenagalistrikan")]
    Ketenagalistrikan,
    #[serde(rename = "Batas Wilayah")]
    BatasWilayah,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::EnergiTerbarukan,
        Category::MineralBatubara,
        Category::MinyakGasBumi,
        Category::Ketenagalistrikan,
        Category::BatasWilayah,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Category::EnergiTerbarukan => "Energi Terbarukan",
            Category::MineralBatubara => "Mineral & Batubara",
            Category::MinyakGasBumi => "Minyak & Gas Bumi",
            Category::Ketenagalistrikan => "Ketenagalistrikan",
            Category::BatasWilayah => "Batas Wilayah",
        }
    }

    pub fn folder(self) -> &'static str {
        match self {
            Category::EnergiTerbarukan => "energi_terbarukan",
            Category::MineralBatubara => "mineral_batubara",
            Category::MinyakGasBumi => "minyak_gas_bumi",
            Category::Ketenagalistrikan => "ketenagalistrikan",
            Category::BatasWilayah => "batas_wilayah",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|category| category.label() == label)
    }

    pub fn from_folder(folder: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|category| category.folder() == folder)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for Category {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        Self::from_label(trimmed)
            .or_else(|| Self::from_folder(trimmed))
            .ok_or_else(|| SyncError::InvalidConfig(format!("unknown category: {value}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint(Url);

impl Endpoint {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn url(&self) -> &Url {
        &self.0
    }

    pub fn metadata_url(&self) -> Url {
        let mut url = self.0.clone();
        url.query_pairs_mut().append_pair("f", "json");
        url
    }

    pub fn query_url(&self, layer_id: u32) -> Url {
        let mut url = self.0.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .push(&layer_id.to_string())
                .push("query");
        }
        url.query_pairs_mut()
            .append_pair("where", "1=1")
            .append_pair("outFields", "*")
            .append_pair("f", "geojson");
        url
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim().trim_end_matches('/');
        let url = Url::parse(trimmed).map_err(|err| format!("{trimmed}: {err}"))?;
        if !matches!(url.scheme(), "http" | "https") || url.cannot_be_a_base() {
            return Err(format!("{trimmed}: not an http(s) service address"));
        }
        Ok(Self(url))
    }
}

impl Serialize for Endpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub endpoint: Endpoint,
    pub category: Category,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerDescriptor {
    pub endpoint: Endpoint,
    pub id: u32,
    pub name: String,
}

impl LayerDescriptor {
    pub fn display_name(&self) -> String {
        if self.name.trim().is_empty() {
            format!("layer{}", self.id)
        } else {
            self.name.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENDPOINT: &str =
        "https://geoportal.esdm.go.id/gis2/rest/services/SDL1/Rasio_Elektrifikasi/MapServer";

    #[test]
    fn category_labels_round_trip_through_folders() {
        for category in Category::ALL {
            assert_eq!(Category::from_label(category.label()), Some(category));
            assert_eq!(Category::from_folder(category.folder()), Some(category));
        }
        assert_eq!(Category::from_label("energi terbarukan"), None);
    }

    #[test]
    fn category_serializes_as_label() {
        let json = serde_json::to_string(&Category::MinyakGasBumi).unwrap();
        assert_eq!(json, "\"Minyak & Gas Bumi\"");
    }

    #[test]
    fn endpoint_urls() {
        let endpoint: Endpoint = format!("{ENDPOINT}/").parse().unwrap();
        assert_eq!(endpoint.as_str(), ENDPOINT);
        assert_eq!(endpoint.metadata_url().as_str(), format!("{ENDPOINT}?f=json"));
        assert_eq!(
            endpoint.query_url(3).as_str(),
            format!("{ENDPOINT}/3/query?where=1%3D1&outFields=*&f=geojson")
        );
    }

    #[test]
    fn endpoint_rejects_other_schemes() {
        assert!("ftp://example.org/services/A/MapServer".parse::<Endpoint>().is_err());
        assert!("not a url".parse::<Endpoint>().is_err());
    }

    #[test]
    fn unnamed_layer_falls_back_to_id() {
        let layer = LayerDescriptor {
            endpoint: ENDPOINT.parse().unwrap(),
            id: 4,
            name: "  ".to_string(),
        };
        assert_eq!(layer.display_name(), "layer4");
    }
}
