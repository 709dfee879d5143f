//! A single conversion request, from source URL to a ready artifact.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{Instrument, debug, error, info, info_span};
use uuid::Uuid;

use crate::converter::Converter;
use crate::error::{Error, Result};
use crate::events::ConversionEvent;
use crate::http::parse_url;
use crate::registry::remove_file_quietly;
use crate::remux::{RemuxInput, RemuxJob};

const DEFAULT_FILE_NAME: &str = "video.mp4";
const DEFAULT_EXTENSION: &str = "mp4";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionMode {
    /// Resolve, list and download segments locally, then remux the files.
    #[default]
    Segmented,
    /// Hand the source URL straight to the remuxer.
    Direct,
}

#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub url: String,
    pub headers: HeaderMap,
    /// Name offered on download. Its extension picks the container.
    pub filename: Option<String>,
    pub mode: ConversionMode,
    /// Media duration in seconds, used for percent in direct mode.
    pub expected_duration: Option<f64>,
}

impl ConversionRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HeaderMap::new(),
            filename: None,
            mode: ConversionMode::default(),
            expected_duration: None,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_mode(mut self, mode: ConversionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_expected_duration(mut self, seconds: f64) -> Self {
        self.expected_duration = Some(seconds);
        self
    }

    /// Download name, reduced to a bare file name with an extension.
    pub fn file_name(&self) -> String {
        sanitize_file_name(self.filename.as_deref().unwrap_or(DEFAULT_FILE_NAME))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Running,
    Done,
    Failed,
}

/// Caller side of a running conversion.
pub struct ConversionHandle {
    pub id: JobId,
    pub events: mpsc::UnboundedReceiver<ConversionEvent>,
    pub state: watch::Receiver<JobState>,
    token: CancellationToken,
    join: JoinHandle<Result<PathBuf>>,
}

impl ConversionHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait for the job and return the artifact path.
    pub async fn wait(self) -> Result<PathBuf> {
        self.join
            .await
            .map_err(|e| Error::internal(format!("conversion task failed: {e}")))?
    }

    pub fn into_parts(self) -> (JobId, mpsc::UnboundedReceiver<ConversionEvent>, DropGuard) {
        let guard = self.token.drop_guard();
        (self.id, self.events, guard)
    }
}

pub(crate) fn spawn(converter: Converter, request: ConversionRequest) -> ConversionHandle {
    let id = JobId::new();
    let (events_tx, events) = mpsc::unbounded_channel();
    let (state_tx, state) = watch::channel(JobState::Running);
    let token = CancellationToken::new();

    let job = ConversionJob {
        id: id.clone(),
        request,
        converter,
        events: events_tx,
        state: state_tx,
        token: token.clone(),
    };

    let span = info_span!("conversion", job_id = %id);
    let join = tokio::spawn(job.run().instrument(span));

    ConversionHandle {
        id,
        events,
        state,
        token,
        join,
    }
}

struct ConversionJob {
    id: JobId,
    request: ConversionRequest,
    converter: Converter,
    events: mpsc::UnboundedSender<ConversionEvent>,
    state: watch::Sender<JobState>,
    token: CancellationToken,
}

impl ConversionJob {
    async fn run(self) -> Result<PathBuf> {
        info!(url = %self.request.url, mode = ?self.request.mode, "Conversion started");

        let output = self.output_path();
        let registry = self.converter.registry();
        registry.register(self.id.clone(), &output, self.request.file_name());

        let result = match self.execute(&output).await {
            Ok(path) => self.finalize(&path).await.map(|()| path),
            Err(e) => Err(e),
        };

        match result {
            Ok(path) => {
                info!(path = %path.display(), "Conversion finished");
                let _ = self.state.send(JobState::Done);
                self.emit(ConversionEvent::Done {
                    job_id: self.id.clone(),
                });
                Ok(path)
            }
            Err(e) => {
                error!(error = %e, "Conversion failed");
                registry.remove(&self.id).await;
                remove_file_quietly(&output).await;
                let _ = self.state.send(JobState::Failed);
                self.emit(ConversionEvent::failed(&e));
                Err(e)
            }
        }
    }

    async fn execute(&self, output: &Path) -> Result<PathBuf> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let result = match self.request.mode {
            ConversionMode::Segmented => self.segmented(output).await,
            ConversionMode::Direct => self.direct(output).await,
        };

        if self.token.is_cancelled() && result.is_ok() {
            return Err(Error::Cancelled);
        }
        result
    }

    async fn segmented(&self, output: &Path) -> Result<PathBuf> {
        let headers = &self.request.headers;
        let playlist_url = self
            .converter
            .resolve_best_source(&self.request.url, headers)
            .await?;
        self.emit(ConversionEvent::Resolved {
            job_id: self.id.clone(),
            url: playlist_url.to_string(),
        });

        let playlist = self.converter.list_segments(&playlist_url, headers).await?;
        let expected_duration = self.request.expected_duration.or(playlist.total_duration());
        self.emit(ConversionEvent::SegmentsListed {
            count: playlist.segments.len(),
            duration: expected_duration,
        });

        let staging_root = self.converter.config().work_dir.join("staging");
        tokio::fs::create_dir_all(&staging_root).await?;
        // Removed on drop, whatever the outcome.
        let staging = tempfile::Builder::new()
            .prefix(&format!("{}-", self.id))
            .tempdir_in(&staging_root)?;
        debug!(dir = %staging.path().display(), "Staging directory created");

        let (progress_tx, forwarder) = self.forward(ConversionEvent::Download);
        let report = self
            .converter
            .download_all(
                &playlist.segments,
                headers,
                staging.path(),
                Some(progress_tx),
                &self.token,
            )
            .await;
        let _ = forwarder.await;
        let report = report?;

        let job = RemuxJob {
            input: RemuxInput::Files(report.files),
            output: output.to_path_buf(),
            expected_duration,
        };
        self.remux(job).await
    }

    async fn direct(&self, output: &Path) -> Result<PathBuf> {
        let url = parse_url(&self.request.url)?;
        self.emit(ConversionEvent::Resolved {
            job_id: self.id.clone(),
            url: url.to_string(),
        });

        let job = RemuxJob {
            input: RemuxInput::Url {
                url,
                headers: self.request.headers.clone(),
            },
            output: output.to_path_buf(),
            expected_duration: self.request.expected_duration,
        };
        self.remux(job).await
    }

    async fn remux(&self, job: RemuxJob) -> Result<PathBuf> {
        let (progress_tx, forwarder) = self.forward(ConversionEvent::Remux);
        let result = self.converter.remux(job, Some(progress_tx), &self.token).await;
        let _ = forwarder.await;
        result
    }

    /// Flush the artifact to disk, then expose it for retrieval.
    async fn finalize(&self, path: &Path) -> Result<()> {
        sync_to_disk(path).await?;
        self.converter.registry().mark_ready(&self.id)
    }

    fn output_path(&self) -> PathBuf {
        let file_name = self.request.file_name();
        let extension = Path::new(&file_name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or(DEFAULT_EXTENSION)
            .to_ascii_lowercase();
        self.converter
            .config()
            .work_dir
            .join("artifacts")
            .join(format!("{}.{extension}", self.id))
    }

    fn emit(&self, event: ConversionEvent) {
        // The caller may have stopped listening.
        let _ = self.events.send(event);
    }

    /// Relay typed progress into the event stream until the sender is dropped.
    fn forward<T: Send + 'static>(
        &self,
        wrap: fn(T) -> ConversionEvent,
    ) -> (mpsc::UnboundedSender<T>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<T>();
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            while let Some(progress) = rx.recv().await {
                let _ = events.send(wrap(progress));
            }
        });
        (tx, handle)
    }
}

/// Flush file contents and metadata. Windows only flushes handles opened for writing.
async fn sync_to_disk(path: &Path) -> Result<()> {
    let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    file.sync_all().await?;
    Ok(())
}

/// Keep only the final path component and drop characters that break
/// `Content-Disposition` or file systems.
pub fn sanitize_file_name(input: &str) -> String {
    let base = input
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, '"' | ':' | '*' | '?' | '<' | '>' | '|'))
        .collect::<String>();
    let base = base.trim().trim_start_matches('.').to_string();

    if base.is_empty() {
        return DEFAULT_FILE_NAME.to_string();
    }
    if Path::new(&base).extension().is_none() {
        return format!("{base}.{DEFAULT_EXTENSION}");
    }
    base
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("movie.mkv", "movie.mkv")]
    #[case("../../etc/passwd", "passwd.mp4")]
    #[case("dir\\clip.mp4", "clip.mp4")]
    #[case("bad\"name?.mp4", "badname.mp4")]
    #[case("", "video.mp4")]
    #[case("...", "video.mp4")]
    fn file_names_are_sanitized(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(sanitize_file_name(input), expected);
    }

    #[test]
    fn job_ids_round_trip_through_strings() {
        let id = JobId::new();
        assert_eq!(id.to_string().parse::<JobId>().unwrap(), id);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }

    #[test]
    fn request_defaults_to_segmented_mp4() {
        let request = ConversionRequest::new("https://cdn.test/master.m3u8");
        assert_eq!(request.mode, ConversionMode::Segmented);
        assert_eq!(request.file_name(), "video.mp4");
    }

    #[tokio::test]
    async fn sync_to_disk_keeps_contents_and_rejects_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.mp4");
        std::fs::write(&path, b"media").unwrap();

        sync_to_disk(&path).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"media");

        let missing = dir.path().join("missing.mp4");
        assert!(matches!(
            sync_to_disk(&missing).await,
            Err(Error::Io { .. })
        ));
        assert!(!missing.exists());
    }
}
