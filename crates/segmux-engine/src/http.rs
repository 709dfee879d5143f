//! HTTP plumbing: client construction, manifest text retrieval and the
//! reachability probe.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use tracing::{debug, warn};
use url::Url;

use crate::config::EngineConfig;
use crate::error::{Error, FetchError, Result};

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Another crate got there first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Create a reqwest Client with the provided configuration
pub fn create_client(config: &EngineConfig) -> Result<Client> {
    install_rustls_provider();

    let mut builder = Client::builder()
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .redirect(reqwest::redirect::Policy::limited(10));

    if !config.connect_timeout.is_zero() {
        builder = builder.connect_timeout(config.connect_timeout);
    }

    builder
        .build()
        .map_err(|e| Error::configuration(format!("failed to build HTTP client: {e}")))
}

/// Parse a URL supplied by a caller.
pub fn parse_url(input: &str) -> Result<Url> {
    let url = Url::parse(input.trim()).map_err(|e| Error::invalid_url(input, e))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(Error::invalid_url(
            input,
            format!("unsupported scheme `{other}`"),
        )),
    }
}

/// Convert `(name, value)` pairs into a header map.
pub fn header_map<'a, I>(pairs: I) -> Result<HeaderMap>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|e| Error::configuration(format!("invalid header name `{name}`: {e}")))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|e| Error::configuration(format!("invalid value for header `{name}`: {e}")))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Result of a reachability check. Never an error; failures are described
/// in `error`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProbeReport {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Retrieves manifests and media playlists as text.
#[derive(Clone)]
pub struct ManifestFetcher {
    client: Client,
    timeout: Duration,
}

impl ManifestFetcher {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Fetch `url` as text.
    ///
    /// Any response body is accepted whatever the status code; some playlist
    /// hosts answer with odd statuses and a valid body.
    pub async fn fetch_text(&self, url: &Url, headers: &HeaderMap) -> Result<String> {
        let response = self
            .client
            .get(url.clone())
            .headers(headers.clone())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(url.as_str(), &e))?;

        let status = response.status();
        if !status.is_success() {
            warn!(url = %url, %status, "Playlist host answered with non-success status, using body anyway");
        }

        let text = response
            .text()
            .await
            .map_err(|e| FetchError::from_reqwest(url.as_str(), &e))?;
        debug!(url = %url, bytes = text.len(), "Fetched playlist text");
        Ok(text)
    }

    /// Lightweight reachability check. Statuses outside 2xx/3xx count as failure.
    pub async fn probe(&self, url: &str, headers: &HeaderMap, timeout: Duration) -> ProbeReport {
        let start = Instant::now();

        let url = match parse_url(url) {
            Ok(url) => url,
            Err(e) => {
                return ProbeReport {
                    ok: false,
                    status: None,
                    latency_ms: 0,
                    error: Some(e.to_string()),
                };
            }
        };

        let result = self
            .client
            .get(url.clone())
            .headers(headers.clone())
            .timeout(timeout)
            .send()
            .await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(response) => {
                let status = response.status();
                let ok = status.is_success() || status.is_redirection();
                ProbeReport {
                    ok,
                    status: Some(status.as_u16()),
                    latency_ms,
                    error: (!ok).then(|| FetchError::http_status(url.as_str(), status).to_string()),
                }
            }
            Err(e) => ProbeReport {
                ok: false,
                status: None,
                latency_ms,
                error: Some(FetchError::from_reqwest(url.as_str(), &e).to_string()),
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod test_server {
    use axum::Router;
    use tokio::net::TcpListener;
    use url::Url;

    /// Serve `app` on an ephemeral local port and return its base URL.
    pub async fn spawn(app: Router) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Url::parse(&format!("http://{addr}/")).unwrap()
    }
}
