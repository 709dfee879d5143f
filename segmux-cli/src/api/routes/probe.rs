//! Reachability probe.

use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Query, State},
    routing::get,
};
use segmux_engine::ProbeReport;
use serde::Deserialize;

use super::headers_param;
use crate::api::error::ApiResult;
use crate::api::server::AppState;

#[derive(Debug, Deserialize)]
pub struct ProbeQuery {
    pub url: String,
    pub headers: Option<String>,
    pub timeout_ms: Option<u64>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/probe", get(probe))
}

async fn probe(
    State(state): State<AppState>,
    Query(query): Query<ProbeQuery>,
) -> ApiResult<Json<ProbeReport>> {
    let headers = headers_param(query.headers.as_deref())?;
    let timeout = query.timeout_ms.map(Duration::from_millis);

    Ok(Json(state.converter.probe(&query.url, &headers, timeout).await))
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::api::routes::{create_router, test_support};

    #[tokio::test]
    async fn unreachable_url_is_reported_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(test_support::state(dir.path()));

        let response = app
            .oneshot(
                Request::get("/api/probe?url=not-a-url&timeout_ms=500")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["ok"], false);
        assert!(json["error"].is_string());
    }
}
