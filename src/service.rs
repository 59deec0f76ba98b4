use std::error::Error as _;
use std::io::{self, Write};
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Url, redirect};

use crate::error::{HttpFailure, SyncError, TransportKind};

pub trait LayerService: Send + Sync {
    fn get_metadata(&self, url: &Url, timeout: Duration) -> Result<Vec<u8>, HttpFailure>;

    fn download(
        &self,
        url: &Url,
        timeout: Duration,
        sink: &mut dyn Write,
    ) -> Result<u64, HttpFailure>;
}

#[derive(Clone)]
pub struct ArcGisHttpClient {
    client: Client,
    max_redirects: usize,
}

impl ArcGisHttpClient {
    pub fn new(user_agent: &str, max_redirects: usize) -> Result<Self, SyncError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(user_agent).map_err(|err| SyncError::HttpClient(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .redirect(redirect::Policy::limited(max_redirects))
            .build()
            .map_err(|err| SyncError::HttpClient(err.to_string()))?;
        Ok(Self {
            client,
            max_redirects,
        })
    }

    fn send(&self, url: &Url, timeout: Duration) -> Result<Response, HttpFailure> {
        let response = self
            .client
            .get(url.clone())
            .timeout(timeout)
            .send()
            .map_err(|err| classify(&err, self.max_redirects))?;
        let status = response.status();
        if !status.is_success() {
            return Err(HttpFailure::Status {
                status: status.as_u16(),
            });
        }
        Ok(response)
    }
}

impl LayerService for ArcGisHttpClient {
    fn get_metadata(&self, url: &Url, timeout: Duration) -> Result<Vec<u8>, HttpFailure> {
        let response = self.send(url, timeout)?;
        let bytes = response
            .bytes()
            .map_err(|err| classify(&err, self.max_redirects))?;
        Ok(bytes.to_vec())
    }

    fn download(
        &self,
        url: &Url,
        timeout: Duration,
        sink: &mut dyn Write,
    ) -> Result<u64, HttpFailure> {
        let mut response = self.send(url, timeout)?;
        let mut buffer = [0u8; 64 * 1024];
        let mut written = 0u64;
        loop {
            let read = match io::Read::read(&mut response, &mut buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(classify_body(&err)),
            };
            sink.write_all(&buffer[..read])
                .map_err(|err| HttpFailure::Sink(err.to_string()))?;
            written += read as u64;
        }
        Ok(written)
    }
}

fn classify(err: &reqwest::Error, limit: usize) -> HttpFailure {
    if err.is_timeout() {
        return HttpFailure::Timeout;
    }
    if err.is_redirect() {
        return HttpFailure::TooManyRedirects { limit };
    }
    if let Some(status) = err.status() {
        return HttpFailure::Status {
            status: status.as_u16(),
        };
    }
    let kind = match io_kind(err).map(transport_kind_for) {
        Some(kind) if kind != TransportKind::Other => kind,
        _ if err.is_connect() => TransportKind::Connect,
        _ if err.is_body() || err.is_request() => TransportKind::ConnectionAborted,
        _ => TransportKind::Other,
    };
    HttpFailure::Transport {
        kind,
        message: err.to_string(),
    }
}

// Body reads surface as io::Error wrapping the reqwest error.
fn classify_body(err: &io::Error) -> HttpFailure {
    if let Some(inner) = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
    {
        if inner.is_timeout() {
            return HttpFailure::Timeout;
        }
    }
    if err.kind() == io::ErrorKind::TimedOut {
        return HttpFailure::Timeout;
    }
    HttpFailure::Transport {
        kind: TransportKind::ConnectionAborted,
        message: err.to_string(),
    }
}

fn io_kind(err: &reqwest::Error) -> Option<io::ErrorKind> {
    let mut source = err.source();
    while let Some(current) = source {
        if let Some(io_err) = current.downcast_ref::<io::Error>() {
            return Some(io_err.kind());
        }
        source = current.source();
    }
    None
}

fn transport_kind_for(kind: io::ErrorKind) -> TransportKind {
    match kind {
        io::ErrorKind::TimedOut => TransportKind::TimedOut,
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => TransportKind::ConnectionAborted,
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::NotFound
        | io::ErrorKind::HostUnreachable
        | io::ErrorKind::NetworkUnreachable
        | io::ErrorKind::AddrNotAvailable => TransportKind::Connect,
        _ => TransportKind::Other,
    }
}


// Each URL replays its queue; the last reply repeats, unscripted URLs answer 404.
#[cfg(test)]
pub(crate) mod scripted {
    use std::collections::{HashMap, VecDeque};
    use std::io::Write;
    use std::sync::Mutex;
    use std::time::Duration;

    use reqwest::Url;

    use super::LayerService;
    use crate::domain::Endpoint;
    use crate::error::{HttpFailure, TransportKind};

    #[derive(Debug, Clone)]
    pub enum Reply {
        Body(Vec<u8>),
        Timeout,
        Status(u16),
        Reset,
    }

    impl Reply {
        pub fn json(value: serde_json::Value) -> Self {
            Reply::Body(value.to_string().into_bytes())
        }

        pub fn features(count: usize) -> Self {
            let features: Vec<_> = (0..count)
                .map(|id| serde_json::json!({"type": "Feature", "id": id, "geometry": null, "properties": {}}))
                .collect();
            Reply::json(serde_json::json!({"type": "FeatureCollection", "features": features}))
        }

        fn into_result(self) -> Result<Vec<u8>, HttpFailure> {
            match self {
                Reply::Body(body) => Ok(body),
                Reply::Timeout => Err(HttpFailure::Timeout),
                Reply::Status(status) => Err(HttpFailure::Status { status }),
                Reply::Reset => Err(HttpFailure::Transport {
                    kind: TransportKind::ConnectionAborted,
                    message: "connection reset".to_string(),
                }),
            }
        }
    }

    #[derive(Default)]
    pub struct ScriptedService {
        replies: Mutex<HashMap<String, VecDeque<Reply>>>,
        calls: Mutex<HashMap<String, usize>>,
    }

    impl ScriptedService {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn layers(self, endpoint: &Endpoint, layers: &[(u32, &str)]) -> Self {
            let layers: Vec<_> = layers
                .iter()
                .map(|(id, name)| serde_json::json!({"id": id, "name": name}))
                .collect();
            self.on_metadata(endpoint, vec![Reply::json(serde_json::json!({"layers": layers}))])
        }

        pub fn on_metadata(self, endpoint: &Endpoint, replies: Vec<Reply>) -> Self {
            self.script(endpoint.metadata_url(), replies)
        }

        pub fn on_layer(self, endpoint: &Endpoint, layer_id: u32, replies: Vec<Reply>) -> Self {
            self.script(endpoint.query_url(layer_id), replies)
        }

        pub fn calls(&self, url: &Url) -> usize {
            self.calls
                .lock()
                .unwrap()
                .get(url.as_str())
                .copied()
                .unwrap_or(0)
        }

        fn script(self, url: Url, replies: Vec<Reply>) -> Self {
            self.replies
                .lock()
                .unwrap()
                .insert(url.to_string(), replies.into());
            self
        }

        fn next(&self, url: &Url) -> Result<Vec<u8>, HttpFailure> {
            *self
                .calls
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_default() += 1;
            let mut replies = self.replies.lock().unwrap();
            let reply = match replies.get_mut(url.as_str()) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            };
            reply.unwrap_or(Reply::Status(404)).into_result()
        }
    }

    impl LayerService for ScriptedService {
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
}
