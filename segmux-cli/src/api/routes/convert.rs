//! Conversion jobs streamed as server-sent events.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    Router,
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
};
use futures::{Stream, StreamExt, stream};
use segmux_engine::{ConversionEvent, ConversionMode, ConversionRequest, parse_url};
use serde::Deserialize;

use super::headers_param;
use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;

#[derive(Debug, Deserialize)]
pub struct ConvertQuery {
    pub url: String,
    pub filename: Option<String>,
    /// Expected media duration in seconds.
    pub duration: Option<f64>,
    pub headers: Option<String>,
    #[serde(default)]
    pub mode: ConversionMode,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/convert", get(convert))
}

/// Start a job and stream its events. Dropping the stream cancels the job.
async fn convert(
    State(state): State<AppState>,
    Query(query): Query<ConvertQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    parse_url(&query.url)?;
    let headers = headers_param(query.headers.as_deref())?;
    if query.duration.is_some_and(|d| !d.is_finite() || d < 0.0) {
        return Err(ApiError::bad_request("duration must be a non-negative number of seconds"));
    }

    let mut request = ConversionRequest::new(query.url)
        .with_headers(headers)
        .with_mode(query.mode);
    if let Some(filename) = query.filename {
        request = request.with_filename(filename);
    }
    if let Some(duration) = query.duration {
        request = request.with_expected_duration(duration);
    }

    let (job_id, events, guard) = state.converter.start(request).into_parts();
    let started = Event::default()
        .event("started")
        .data(serde_json::json!({ "job_id": job_id }).to_string());

    let updates = stream::unfold((events, Some(guard)), |(mut events, mut guard)| async move {
        let event = events.recv().await?;
        if event.is_terminal() {
            // The job finished on its own; closing the stream must not cancel it.
            if let Some(guard) = guard.take() {
                guard.disarm();
            }
        }
        Some((sse_event(&event), (events, guard)))
    });

    let stream = stream::once(async move { Ok(started) }).chain(updates);
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

fn sse_event(event: &ConversionEvent) -> Result<Event, Infallible> {
    let data = serde_json::to_string(event).unwrap_or_else(|e| {
        serde_json::json!({ "type": "failed", "code": "INTERNAL_ERROR", "message": e.to_string() })
            .to_string()
    });
    Ok(Event::default().event(event.name()).data(data))
}
