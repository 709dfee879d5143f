use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use reqwest::header::{HeaderMap, HeaderValue, RANGE};
use tracing::{debug, trace, warn};

use crate::error::{FetchError, Result};
use crate::hls::Segment;

/// Where segment bytes come from.
#[async_trait]
pub trait SegmentSource: Send + Sync {
    async fn fetch(&self, segment: &Segment) -> Result<Bytes>;
}

/// Fetches segments over HTTP with a shared client.
#[derive(Clone)]
pub struct HttpSegmentSource {
    client: Client,
    headers: HeaderMap,
    timeout: Option<Duration>,
}

impl HttpSegmentSource {
    pub fn new(client: Client, headers: HeaderMap, timeout: Option<Duration>) -> Self {
        Self {
            client,
            headers,
            timeout,
        }
    }
}

#[async_trait]
impl SegmentSource for HttpSegmentSource {
    async fn fetch(&self, segment: &Segment) -> Result<Bytes> {
        let url = segment.uri.as_str();
        let mut request = self
            .client
            .get(segment.uri.clone())
            .headers(self.headers.clone());

        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        if let Some(range) = segment.byte_range {
            let value = HeaderValue::from_str(&range.header_value())
                .map_err(|e| crate::Error::internal(format!("invalid range header: {e}")))?;
            request = request.header(RANGE, value);
            trace!(index = segment.index, range = ?range, "Requesting byte range");
        }

        let response = request
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(url, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::http_status(url, status).into());
        }

        let mut data = response
            .bytes()
            .await
            .map_err(|e| FetchError::from_reqwest(url, &e))?;

        // A server that ignores Range answers 200 with the whole resource.
        if let Some(range) = segment.byte_range
            && status != StatusCode::PARTIAL_CONTENT
        {
            data = range.slice(&data).ok_or_else(|| {
                warn!(
                    index = segment.index,
                    bytes = data.len(),
                    range = ?range,
                    "Full response shorter than the requested byte range"
                );
                FetchError::http_status(url, status)
            })?;
            debug!(index = segment.index, range = ?range, "Range ignored by server, sliced full body");
        }

        debug!(index = segment.index, bytes = data.len(), "Segment downloaded");
        Ok(data)
    }
}
