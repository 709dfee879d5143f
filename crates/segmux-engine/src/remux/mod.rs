//! Reassembly of downloaded segments (or a direct stream) into one container.

mod ffmpeg;

use std::path::PathBuf;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Result;

pub use ffmpeg::FfmpegRemuxer;

/// Highest percent reported before the remuxer confirms completion.
pub const MAX_RUNNING_PERCENT: f64 = 99.0;

#[derive(Debug, Clone)]
pub enum RemuxInput {
    /// Ordered local segment files.
    Files(Vec<PathBuf>),
    /// A remote stream read directly by the remuxer.
    Url { url: Url, headers: HeaderMap },
}

#[derive(Debug, Clone)]
pub struct RemuxJob {
    pub input: RemuxInput,
    pub output: PathBuf,
    /// Media duration in seconds, when known. Drives `percent`.
    pub expected_duration: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RemuxProgress {
    pub seconds_elapsed: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    pub done: bool,
}

impl RemuxProgress {
    pub fn running(seconds_elapsed: f64, expected_duration: Option<f64>) -> Self {
        Self {
            seconds_elapsed,
            percent: expected_duration.and_then(|expected| percent_complete(seconds_elapsed, expected)),
            done: false,
        }
    }

    pub fn finished(seconds_elapsed: f64) -> Self {
        Self {
            seconds_elapsed,
            percent: Some(100.0),
            done: true,
        }
    }
}

/// Percent of `expected` covered by `elapsed`, held at or below 99 while running.
pub fn percent_complete(elapsed: f64, expected: f64) -> Option<f64> {
    if !(expected > 0.0) || !elapsed.is_finite() {
        return None;
    }
    Some((elapsed / expected * 100.0).clamp(0.0, MAX_RUNNING_PERCENT))
}

/// Turns ordered inputs into a single output file.
#[async_trait]
pub trait Remuxer: Send + Sync {
    /// Run the job to completion and return the output path.
    ///
    /// On failure or cancellation no output file is left behind.
    async fn remux(
        &self,
        job: RemuxJob,
        progress_tx: Option<mpsc::UnboundedSender<RemuxProgress>>,
        token: &CancellationToken,
    ) -> Result<PathBuf>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(60.0, 120.0, Some(50.0))]
    #[case(0.0, 120.0, Some(0.0))]
    #[case(119.9, 120.0, Some(99.0))]
    #[case(240.0, 120.0, Some(99.0))]
    #[case(10.0, 0.0, None)]
    #[case(10.0, -5.0, None)]
    fn percent_is_clamped_while_running(
        #[case] elapsed: f64,
        #[case] expected: f64,
        #[case] percent: Option<f64>,
    ) {
        assert_eq!(percent_complete(elapsed, expected), percent);
    }

    #[test]
    fn finished_progress_reports_full_percent() {
        let running = RemuxProgress::running(60.0, Some(120.0));
        assert_eq!(running.percent, Some(50.0));
        assert!(!running.done);

        let done = RemuxProgress::finished(120.0);
        assert_eq!(done.percent, Some(100.0));
        assert!(done.done);

        assert_eq!(RemuxProgress::running(5.0, None).percent, None);
    }
}
