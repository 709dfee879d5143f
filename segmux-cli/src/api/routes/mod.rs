//! API routes.

mod convert;
mod download;
mod health;
mod probe;
mod resolve;

use std::collections::BTreeMap;

use axum::Router;
use axum::http::HeaderMap;

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;

/// Create the API router with all routes.
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .nest("/health", health::router())
        .merge(resolve::router())
        .merge(probe::router())
        .merge(convert::router())
        .merge(download::router());

    Router::new().nest("/api", api).with_state(state)
}

/// Decode the `headers` query parameter, a JSON object of header names to values.
pub(crate) fn headers_param(raw: Option<&str>) -> ApiResult<HeaderMap> {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return Ok(HeaderMap::new());
    };

    let map: BTreeMap<String, String> = serde_json::from_str(raw)
        .map_err(|e| ApiError::bad_request(format!("headers must be a JSON object of strings: {e}")))?;

    segmux_engine::header_map(map.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .map_err(|e| ApiError::bad_request(e.to_string()))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_param_accepts_json_objects() {
        let headers = headers_param(Some(r#"{"Referer":"https://site.test/"}"#)).unwrap();
        assert_eq!(headers.get("referer").unwrap(), "https://site.test/");

        assert!(headers_param(None).unwrap().is_empty());
        assert!(headers_param(Some("  ")).unwrap().is_empty());
        assert!(headers_param(Some("[1,2]")).is_err());
    }
}
