//! Best-source resolution.

use axum::{
    Json, Router,
    extract::{Query, State},
    routing::get,
};
use serde::{Deserialize, Serialize};

use super::headers_param;
use crate::api::error::ApiResult;
use crate::api::server::AppState;

#[derive(Debug, Deserialize)]
pub struct ResolveQuery {
    pub url: String,
    pub headers: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ResolveResponse {
    /// Media playlist that a conversion would download.
    pub url: String,
    pub segments: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/resolve", get(resolve))
}

async fn resolve(
    State(state): State<AppState>,
    Query(query): Query<ResolveQuery>,
) -> ApiResult<Json<ResolveResponse>> {
    let headers = headers_param(query.headers.as_deref())?;
    let converter = &state.converter;

    let playlist_url = converter.resolve_best_source(&query.url, &headers).await?;
    let playlist = converter.list_segments(&playlist_url, &headers).await?;

    Ok(Json(ResolveResponse {
        url: playlist_url.to_string(),
        segments: playlist.segments.len(),
        duration: playlist.total_duration(),
    }))
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::api::routes::{create_router, test_support};

    #[tokio::test]
    async fn invalid_url_is_a_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(test_support::state(dir.path()));

        let response = app
            .oneshot(
                Request::get("/api/resolve?url=ftp%3A%2F%2Fnowhere")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "INVALID_URL");
    }
}
