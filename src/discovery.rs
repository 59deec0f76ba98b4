use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, info};

use crate::domain::{Endpoint, LayerDescriptor};
use crate::error::DiscoveryError;
use crate::naming::{self, ServiceName};
use crate::service::LayerService;

#[derive(Debug, Clone)]
pub struct DiscoveredService {
    pub endpoint: Endpoint,
    pub service_name: ServiceName,
    pub layers: Vec<LayerDescriptor>,
}

#[derive(Debug, Deserialize)]
struct ServiceInfo {
    #[serde(default)]
    layers: Option<Vec<LayerInfo>>,
    #[serde(default)]
    error: Option<RemoteError>,
}

#[derive(Debug, Deserialize)]
struct LayerInfo {
    id: u32,
    #[serde(default)]
    name: Option<String>,
}

// ArcGIS servers report failures in-band with a 200 status.
#[derive(Debug, Deserialize)]
struct RemoteError {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

pub struct ServiceDiscoverer<'a, S: LayerService> {
    service: &'a S,
    timeout: Duration,
}

impl<'a, S: LayerService> ServiceDiscoverer<'a, S> {
    pub fn new(service: &'a S, timeout: Duration) -> Self {
        Self { service, timeout }
    }

    pub fn discover(&self, endpoint: &Endpoint) -> Result<DiscoveredService, DiscoveryError> {
        let service_name = naming::service_name_from_path(endpoint)
            .ok_or_else(|| DiscoveryError::UnnamedService(endpoint.to_string()))?;

        let start = Instant::now();
        let body = self
            .service
            .get_metadata(&endpoint.metadata_url(), self.timeout)?;
        debug!(
            endpoint = %endpoint,
            latency_ms = start.elapsed().as_millis() as u64,
            bytes = body.len(),
            "metadata received"
        );

        let layers = parse_layers(endpoint, &body)?;
        info!(endpoint = %endpoint, layers = layers.len(), "discovered layers");
        Ok(DiscoveredService {
            endpoint: endpoint.clone(),
            service_name,
            layers,
        })
    }
}

fn parse_layers(endpoint: &Endpoint, body: &[u8]) -> Result<Vec<LayerDescriptor>, DiscoveryError> {
    let info: ServiceInfo = serde_json::from_slice(body)
        .map_err(|err| DiscoveryError::MalformedResponse(err.to_string()))?;

    if let Some(error) = info.error {
        let status = error
            .code
            .and_then(|code| u16::try_from(code).ok())
            .unwrap_or(500);
        return Err(DiscoveryError::HttpStatus {
            status,
            message: error
                .message
                .unwrap_or_else(|| "service reported an error".to_string()),
        });
    }

    let layers = info.layers.unwrap_or_default();
    if layers.is_empty() {
        return Err(DiscoveryError::NoLayersFound);
    }

    Ok(layers
        .into_iter()
        .map(|layer| LayerDescriptor {
            endpoint: endpoint.clone(),
            id: layer.id,
            name: layer.name.unwrap_or_default(),
        })
        .collect())
}
