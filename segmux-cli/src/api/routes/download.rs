//! One-time artifact retrieval.

use axum::{
    Router,
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{StreamExt, stream};
use segmux_engine::{ArtifactLease, Error, JobId};
use tokio_util::io::ReaderStream;

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/download/{id}", get(download))
}

async fn download(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    let id: JobId = id.parse().map_err(|_| Error::not_ready(&id))?;
    let lease = state.converter.fetch_artifact(&id)?;

    let file = tokio::fs::File::open(lease.path()).await.map_err(|e| {
        tracing::error!(job_id = %id, error = %e, "Artifact file missing");
        ApiError::internal("artifact file could not be opened")
    })?;
    let length = file.metadata().await.ok().map(|m| m.len());

    let content_type = content_type_for(lease.file_name());
    let disposition = content_disposition(lease.file_name());
    let body = Body::from_stream(leased_stream(ReaderStream::new(file), lease));

    let mut response = (StatusCode::OK, body).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if let Some(length) = length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    }
    Ok(response)
}

/// Yield the file, then mark the lease finished once the last chunk is sent.
fn leased_stream(
    reader: ReaderStream<tokio::fs::File>,
    lease: ArtifactLease,
) -> impl futures::Stream<Item = std::io::Result<Bytes>> {
    stream::unfold((reader, Some(lease)), |(mut reader, mut lease)| async move {
        match reader.next().await {
            Some(chunk) => Some((chunk, (reader, lease))),
            None => {
                if let Some(lease) = lease.take() {
                    lease.finish();
                }
                None
            }
        }
    })
}

fn content_type_for(file_name: &str) -> &'static str {
    let extension = std::path::Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("mp4" | "m4v") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("mkv") => "video/x-matroska",
        Some("webm") => "video/webm",
        Some("ts") => "video/mp2t",
        Some("m4a") => "audio/mp4",
        Some("mp3") => "audio/mpeg",
        _ => "application/octet-stream",
    }
}

fn content_disposition(file_name: &str) -> String {
    let ascii: String = file_name
        .chars()
        .map(|c| if c.is_ascii() && c != '"' && c != '\\' { c } else { '_' })
        .collect();
    format!("attachment; filename=\"{ascii}\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::api::routes::{create_router, test_support};

    #[tokio::test]
    async fn unknown_and_malformed_ids_are_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(test_support::state(dir.path()));

        for path in [
            format!("/api/download/{}", JobId::new()),
            "/api/download/not-a-job".to_string(),
        ] {
            let response = app
                .clone()
                .oneshot(Request::get(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);

            let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(json["code"], "NOT_READY");
        }
    }

    #[tokio::test]
    async fn ready_artifact_downloads_once() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_support::state(dir.path());
        let registry = state.converter.registry().clone();
        let app = create_router(state);

        let id = JobId::new();
        let path = dir.path().join("artifact.mp4");
        std::fs::write(&path, b"movie-bytes").unwrap();
        registry.register(id.clone(), &path, "My Show.mp4");
        registry.mark_ready(&id).unwrap();

        let uri = format!("/api/download/{id}");
        let response = app
            .clone()
            .oneshot(Request::get(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"My Show.mp4\""
        );
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"movie-bytes");

        let again = app
            .oneshot(Request::get(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn disposition_replaces_unsafe_characters() {
        assert_eq!(
            content_disposition("épisode \"1\".mp4"),
            "attachment; filename=\"_pisode _1_.mp4\""
        );
        assert_eq!(content_type_for("clip.MKV"), "video/x-matroska");
    }
}
