#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use reqwest::Url;
use serde_json::json;

use geolayer_sync::config::{Config, ConfigLoader, ResolvedConfig, RetryConfig};
use geolayer_sync::domain::Endpoint;
use geolayer_sync::error::{HttpFailure, TransportKind};
use geolayer_sync::service::LayerService;

pub const BIOGAS: &str = "https://geoportal.esdm.go.id/gis4/rest/services/DBP/Potensi_Biogas/MapServer";
pub const WKP: &str = "https://geoportal.esdm.go.id/gis4/rest/services/Minerba/WKP/FeatureServer";

#[derive(Debug, Clone)]
pub enum Answer {
    Body(String),
    Timeout,
    Status(u16),
    Reset,
}

impl Answer {
    pub fn features(count: usize) -> Self {
        let features: Vec<_> = (0..count)
            .map(|id| json!({"type": "Feature", "id": id, "geometry": null, "properties": {}}))
            .collect();
        Answer::Body(json!({"type": "FeatureCollection", "features": features}).to_string())
    }
}

/// Per-URL answer queues; the last answer repeats, unknown URLs get 404.
#[derive(Default)]
pub struct MockService {
    answers: Mutex<HashMap<String, VecDeque<Answer>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl MockService {
    pub fn with_layers(self, endpoint: &str, layers: &[(u32, &str)]) -> Self {
        let layers: Vec<_> = layers
            .iter()
            .map(|(id, name)| json!({"id": id, "name": name}))
            .collect();
        let body = json!({"layers": layers}).to_string();
        self.answer(parse_endpoint(endpoint).metadata_url(), vec![Answer::Body(body)])
    }

    pub fn metadata(self, endpoint: &str, answers: Vec<Answer>) -> Self {
        self.answer(parse_endpoint(endpoint).metadata_url(), answers)
    }

    pub fn layer(self, endpoint: &str, layer_id: u32, answers: Vec<Answer>) -> Self {
        self.answer(parse_endpoint(endpoint).query_url(layer_id), answers)
    }

    pub fn layer_calls(&self, endpoint: &str, layer_id: u32) -> usize {
        let url = parse_endpoint(endpoint).query_url(layer_id);
        self.calls
            .lock()
            .unwrap()
            .get(url.as_str())
            .copied()
            .unwrap_or(0)
    }

    fn answer(self, url: Url, answers: Vec<Answer>) -> Self {
        self.answers
            .lock()
            .unwrap()
            .insert(url.to_string(), answers.into());
        self
    }

    fn next(&self, url: &Url) -> Result<Vec<u8>, HttpFailure> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default() += 1;
        let answer = {
            let mut answers = self.answers.lock().unwrap();
            match answers.get_mut(url.as_str()) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };
        match answer.unwrap_or(Answer::Status(404)) {
            Answer::Body(body) => Ok(body.into_bytes()),
            Answer::Timeout => Err(HttpFailure::Timeout),
            Answer::Status(status) => Err(HttpFailure::Status { status }),
            Answer::Reset => Err(HttpFailure::Transport {
                kind: TransportKind::ConnectionAborted,
                message: "connection reset by peer".to_string(),
            }),
        }
    }
}

impl LayerService for MockService {
    fn get_metadata(&self, url: &Url, _timeout: Duration) -> Result<Vec<u8>, HttpFailure> {
        self.next(url)
    }

    fn download(
        &self,
        url: &Url,
        _timeout: Duration,
        sink: &mut dyn Write,
    ) -> Result<u64, HttpFailure> {
        let body = self.next(url)?;
        sink.write_all(&body)
            .map_err(|err| HttpFailure::Sink(err.to_string()))?;
        Ok(body.len() as u64)
    }
}

pub fn parse_endpoint(value: &str) -> Endpoint {
    value.parse().unwrap()
}

pub struct Workspace {
    _temp: tempfile::TempDir,
    pub root: Utf8PathBuf,
}

impl Workspace {
    pub fn new(catalog: &str) -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        fs::write(root.join("Datasource.txt"), catalog).unwrap();
        Self { _temp: temp, root }
    }

    pub fn config(&self) -> ResolvedConfig {
        let config = Config {
            catalog: Some(self.root.join("Datasource.txt").to_string()),
            data_root: Some(self.root.join("data").to_string()),
            reports_dir: Some(self.root.to_string()),
            request_delay_ms: Some(0),
            retry: Some(RetryConfig {
                max_retries: Some(1),
                retry_delay_secs: Some(0),
                item_delay_secs: Some(0),
                ..RetryConfig::default()
            }),
            ..Config::default()
        };
        ConfigLoader::resolve_config(config, None).unwrap()
    }

    pub fn data(&self, relative: &str) -> Utf8PathBuf {
        self.root.join("data").join(relative)
    }

    pub fn write_data(&self, relative: &str, content: &str) {
        let path = self.data(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    pub fn files_under(&self, relative: &str) -> Vec<String> {
        let dir: &Utf8Path = &self.data(relative);
        let mut names: Vec<String> = match fs::read_dir(dir) {
            Ok(entries) => entries
                .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }
}
