use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use reqwest::header::HeaderMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use url::Url;

use crate::config::EngineConfig;
use crate::download::{
    DownloadProgress, DownloadReport, HttpSegmentSource, SegmentDownloader, SegmentSource,
};
use crate::error::Result;
use crate::hls::{self, MediaPlaylist, Segment};
use crate::http::{ManifestFetcher, ProbeReport, create_client, parse_url};
use crate::job::{self, ConversionHandle, ConversionRequest, JobId};
use crate::registry::{ArtifactLease, ArtifactRegistry};
use crate::remux::{FfmpegRemuxer, RemuxJob, RemuxProgress, Remuxer};

/// Entry point of the engine. Cheap to clone.
#[derive(Clone)]
pub struct Converter {
    inner: Arc<Inner>,
}

struct Inner {
    config: EngineConfig,
    client: Client,
    fetcher: ManifestFetcher,
    remuxer: Arc<dyn Remuxer>,
    registry: ArtifactRegistry,
    segment_source: Option<Arc<dyn SegmentSource>>,
}

impl Converter {
    /// Converter with an HTTP client, ffmpeg remuxer and in-memory registry.
    pub fn new(config: EngineConfig) -> Result<Self> {
        ConverterBuilder::new(config).build()
    }

    pub fn builder(config: EngineConfig) -> ConverterBuilder {
        ConverterBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &ArtifactRegistry {
        &self.inner.registry
    }

    /// URL of the best variant playlist, or `manifest_url` itself when it
    /// declares no variants.
    #[instrument(skip(self, headers))]
    pub async fn resolve_best_source(&self, manifest_url: &str, headers: &HeaderMap) -> Result<Url> {
        let url = parse_url(manifest_url)?;
        let text = self.inner.fetcher.fetch_text(&url, headers).await?;

        match hls::select_variant(&text, &url)? {
            Some(variant) => Ok(variant),
            None => {
                debug!("No variant declarations, using manifest as media playlist");
                Ok(url)
            }
        }
    }

    #[instrument(skip(self, headers), fields(url = %playlist_url))]
    pub async fn list_segments(&self, playlist_url: &Url, headers: &HeaderMap) -> Result<MediaPlaylist> {
        let text = self.inner.fetcher.fetch_text(playlist_url, headers).await?;
        hls::parse_media_playlist(&text, playlist_url)
    }

    pub async fn download_all(
        &self,
        segments: &[Segment],
        headers: &HeaderMap,
        dest_dir: &Path,
        progress_tx: Option<mpsc::UnboundedSender<DownloadProgress>>,
        token: &CancellationToken,
    ) -> Result<DownloadReport> {
        let source = match &self.inner.segment_source {
            Some(source) => Arc::clone(source),
            None => Arc::new(HttpSegmentSource::new(
                self.inner.client.clone(),
                headers.clone(),
                self.inner.config.segment_timeout,
            )),
        };

        SegmentDownloader::new(source, self.inner.config.effective_concurrency())
            .download_all(segments, dest_dir, progress_tx, token)
            .await
    }

    pub async fn remux(
        &self,
        job: RemuxJob,
        progress_tx: Option<mpsc::UnboundedSender<RemuxProgress>>,
        token: &CancellationToken,
    ) -> Result<PathBuf> {
        self.inner.remuxer.remux(job, progress_tx, token).await
    }

    /// Reachability check. `timeout` defaults to the fetch timeout.
    pub async fn probe(&self, url: &str, headers: &HeaderMap, timeout: Option<Duration>) -> ProbeReport {
        let timeout = timeout.unwrap_or(self.inner.config.fetch_timeout);
        self.inner.fetcher.probe(url, headers, timeout).await
    }

    pub fn fetch_artifact(&self, id: &JobId) -> Result<ArtifactLease> {
        self.inner.registry.retrieve(id)
    }

    /// Start a conversion in the background.
    pub fn start(&self, request: ConversionRequest) -> ConversionHandle {
        let handle = job::spawn(self.clone(), request);
        info!(job_id = %handle.id, "Conversion job spawned");
        handle
    }
}

pub struct ConverterBuilder {
    config: EngineConfig,
    client: Option<Client>,
    remuxer: Option<Arc<dyn Remuxer>>,
    registry: Option<ArtifactRegistry>,
    segment_source: Option<Arc<dyn SegmentSource>>,
}

impl ConverterBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            client: None,
            remuxer: None,
            registry: None,
            segment_source: None,
        }
    }

    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn remuxer(mut self, remuxer: Arc<dyn Remuxer>) -> Self {
        self.remuxer = Some(remuxer);
        self
    }

    pub fn registry(mut self, registry: ArtifactRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Replace HTTP segment retrieval. Request headers are then not applied.
    pub fn segment_source(mut self, source: Arc<dyn SegmentSource>) -> Self {
        self.segment_source = Some(source);
        self
    }

    pub fn build(self) -> Result<Converter> {
        let config = self.config;
        let client = match self.client {
            Some(client) => client,
            None => create_client(&config)?,
        };
        let remuxer = self.remuxer.unwrap_or_else(|| {
            Arc::new(FfmpegRemuxer::new(
                config.ffmpeg_path.clone(),
                config.remux_timeout,
            ))
        });
        let registry = self
            .registry
            .unwrap_or_else(|| ArtifactRegistry::in_memory(config.artifact_grace));
        let fetcher = ManifestFetcher::new(client.clone(), config.fetch_timeout);

        Ok(Converter {
            inner: Arc::new(Inner {
                config,
                client,
                fetcher,
                remuxer,
                registry,
                segment_source: self.segment_source,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::events::ConversionEvent;
    use crate::http::test_server;
    use crate::job::{ConversionMode, JobState};
    use crate::remux::RemuxInput;
    use async_trait::async_trait;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::get;
    use parking_lot::Mutex;

    /// Concatenates input files, or writes the URL for direct input.
    #[derive(Default)]
    struct ConcatRemuxer {
        jobs: Mutex<Vec<RemuxJob>>,
    }

    #[async_trait]
    impl Remuxer for ConcatRemuxer {
        async fn remux(
            &self,
            job: RemuxJob,
            progress_tx: Option<mpsc::UnboundedSender<RemuxProgress>>,
            _token: &CancellationToken,
        ) -> Result<PathBuf> {
            let body = match &job.input {
                RemuxInput::Files(files) => {
                    let mut body = Vec::new();
                    for file in files {
                        body.extend(tokio::fs::read(file).await?);
                    }
                    body
                }
                RemuxInput::Url { url, .. } => url.as_str().as_bytes().to_vec(),
            };
            tokio::fs::write(&job.output, body).await?;
            if let Some(tx) = progress_tx {
                let _ = tx.send(RemuxProgress::running(1.0, job.expected_duration));
                let _ = tx.send(RemuxProgress::finished(2.0));
            }
            let output = job.output.clone();
            self.jobs.lock().push(job);
            Ok(output)
        }
    }

    /// Holds the remux open until its token fires.
    #[derive(Default)]
    struct StallingRemuxer {
        started: tokio::sync::Notify,
        cancelled: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl Remuxer for StallingRemuxer {
        async fn remux(
            &self,
            job: RemuxJob,
            _progress_tx: Option<mpsc::UnboundedSender<RemuxProgress>>,
            token: &CancellationToken,
        ) -> Result<PathBuf> {
            tokio::fs::write(&job.output, b"partial").await?;
            self.started.notify_one();
            token.cancelled().await;
            self.cancelled
                .store(true, std::sync::atomic::Ordering::SeqCst);
            Err(Error::Cancelled)
        }
    }

    fn upstream() -> Router {
        Router::new()
            .route(
                "/master.m3u8",
                get(|| async {
                    "#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=500000\n\
low/index.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=1200000\n\
high/index.m3u8\n"
                }),
            )
            .route(
                "/high/index.m3u8",
                get(|| async {
                    "#EXTM3U\n#EXTINF:2.0,\nseg0.ts\n#EXTINF:2.0,\nseg1.ts\n#EXTINF:2.0,\nseg2.ts\n"
                }),
            )
            .route("/high/seg0.ts", get(|| async { "A" }))
            .route("/high/seg1.ts", get(|| async { "B" }))
            .route("/high/seg2.ts", get(|| async { "C" }))
            .route(
                "/broken/index.m3u8",
                get(|| async { "#EXTM3U\nseg0.ts\nseg1.ts\nmissing.ts\nseg3.ts\n" }),
            )
            .route("/broken/seg0.ts", get(|| async { "A" }))
            .route("/broken/seg1.ts", get(|| async { "B" }))
            .route("/broken/missing.ts", get(|| async { StatusCode::NOT_FOUND }))
            .route("/broken/seg3.ts", get(|| async { "D" }))
            .route("/empty.m3u8", get(|| async { "#EXTM3U\n#EXT-X-ENDLIST\n" }))
    }

    fn converter(work_dir: &Path, remuxer: Arc<ConcatRemuxer>) -> Converter {
        let config = EngineConfig::default()
            .with_work_dir(work_dir)
            .with_concurrency(2);
        Converter::builder(config).remuxer(remuxer).build().unwrap()
    }

    async fn drain(handle: &mut ConversionHandle) -> Vec<ConversionEvent> {
        let mut events = Vec::new();
        while let Some(event) = handle.events.recv().await {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    }

    #[tokio::test]
    async fn resolves_best_variant_or_keeps_media_playlist() {
        let base = test_server::spawn(upstream()).await;
        let dir = tempfile::tempdir().unwrap();
        let converter = converter(dir.path(), Arc::default());

        let best = converter
            .resolve_best_source(base.join("master.m3u8").unwrap().as_str(), &HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(best, base.join("high/index.m3u8").unwrap());

        let media = base.join("high/index.m3u8").unwrap();
        let same = converter
            .resolve_best_source(media.as_str(), &HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(same, media);
    }

    #[tokio::test]
    async fn segmented_job_produces_a_ready_artifact() {
        let base = test_server::spawn(upstream()).await;
        let dir = tempfile::tempdir().unwrap();
        let remuxer = Arc::new(ConcatRemuxer::default());
        let converter = converter(dir.path(), remuxer.clone());

        let request = ConversionRequest::new(base.join("master.m3u8").unwrap().as_str())
            .with_filename("show.mp4");
        let mut handle = converter.start(request);
        let id = handle.id.clone();

        let events = drain(&mut handle).await;
        assert!(matches!(events.first(), Some(ConversionEvent::Resolved { .. })));
        assert!(events.contains(&ConversionEvent::SegmentsListed {
            count: 3,
            duration: Some(6.0)
        }));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, ConversionEvent::Download(_)))
                .count(),
            3
        );
        assert_eq!(events.last(), Some(&ConversionEvent::Done { job_id: id.clone() }));
        assert_eq!(*handle.state.borrow(), JobState::Done);

        let lease = converter.fetch_artifact(&id).unwrap();
        assert_eq!(lease.file_name(), "show.mp4");
        assert_eq!(std::fs::read(lease.path()).unwrap(), b"ABC");
        assert_eq!(remuxer.jobs.lock()[0].expected_duration, Some(6.0));
        lease.finish();

        assert!(matches!(
            converter.fetch_artifact(&id),
            Err(Error::NotReady { .. })
        ));
    }

    #[tokio::test]
    async fn failed_segment_aborts_job_without_artifact() {
        let base = test_server::spawn(upstream()).await;
        let dir = tempfile::tempdir().unwrap();
        let remuxer = Arc::new(ConcatRemuxer::default());
        let converter = converter(dir.path(), remuxer.clone());

        let mut handle = converter.start(ConversionRequest::new(
            base.join("broken/index.m3u8").unwrap().as_str(),
        ));
        let id = handle.id.clone();

        let events = drain(&mut handle).await;
        let failures: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, ConversionEvent::Failed { .. }))
            .collect();
        assert_eq!(failures.len(), 1);
        assert!(matches!(
            failures[0],
            ConversionEvent::Failed { code, .. } if code == "FETCH_ERROR"
        ));
        assert!(!events.iter().any(|e| matches!(e, ConversionEvent::Done { .. })));
        assert!(remuxer.jobs.lock().is_empty());

        assert!(matches!(handle.wait().await, Err(Error::Fetch(_))));
        assert!(matches!(
            converter.fetch_artifact(&id),
            Err(Error::NotReady { .. })
        ));
        let staging = dir.path().join("staging");
        assert_eq!(std::fs::read_dir(staging).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn empty_playlist_fails_the_job() {
        let base = test_server::spawn(upstream()).await;
        let dir = tempfile::tempdir().unwrap();
        let converter = converter(dir.path(), Arc::default());

        let handle = converter.start(ConversionRequest::new(
            base.join("empty.m3u8").unwrap().as_str(),
        ));
        assert!(matches!(
            handle.wait().await,
            Err(Error::EmptyPlaylist { .. })
        ));
    }

    #[tokio::test]
    async fn direct_job_hands_url_to_remuxer() {
        let dir = tempfile::tempdir().unwrap();
        let remuxer = Arc::new(ConcatRemuxer::default());
        let converter = converter(dir.path(), remuxer.clone());

        let request = ConversionRequest::new("https://cdn.test/live/master.m3u8")
            .with_mode(ConversionMode::Direct)
            .with_expected_duration(120.0);
        let mut handle = converter.start(request);
        let events = drain(&mut handle).await;

        assert!(events.iter().any(|e| matches!(
            e,
            ConversionEvent::Remux(p) if p.done && p.percent == Some(100.0)
        )));
        let id = handle.id.clone();
        let lease = converter.fetch_artifact(&id).unwrap();
        assert_eq!(
            std::fs::read_to_string(lease.path()).unwrap(),
            "https://cdn.test/live/master.m3u8"
        );
        assert_eq!(remuxer.jobs.lock()[0].expected_duration, Some(120.0));
    }

    #[tokio::test]
    async fn probe_uses_configured_timeout_by_default() {
        let base = test_server::spawn(upstream()).await;
        let dir = tempfile::tempdir().unwrap();
        let converter = converter(dir.path(), Arc::default());

        let report = converter
            .probe(base.join("master.m3u8").unwrap().as_str(), &HeaderMap::new(), None)
            .await;
        assert!(report.ok);
        assert_eq!(report.status, Some(200));
    }

    #[tokio::test]
    async fn dropping_the_guard_cancels_a_running_remux() {
        let dir = tempfile::tempdir().unwrap();
        let remuxer = Arc::new(StallingRemuxer::default());
        let config = EngineConfig::default().with_work_dir(dir.path());
        let converter = Converter::builder(config)
            .remuxer(remuxer.clone())
            .build()
            .unwrap();

        let request = ConversionRequest::new("https://cdn.test/live/master.m3u8")
            .with_mode(ConversionMode::Direct);
        let (id, mut events, guard) = converter.start(request).into_parts();

        tokio::time::timeout(Duration::from_secs(5), remuxer.started.notified())
            .await
            .unwrap();
        drop(guard);

        let mut last = None;
        while let Some(event) = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
        {
            let terminal = event.is_terminal();
            last = Some(event);
            if terminal {
                break;
            }
        }

        assert!(matches!(
            last,
            Some(ConversionEvent::Failed { ref code, .. }) if code == "CANCELLED"
        ));
        assert!(remuxer.cancelled.load(std::sync::atomic::Ordering::SeqCst));
        assert!(matches!(
            converter.fetch_artifact(&id),
            Err(Error::NotReady { .. })
        ));
        let artifacts = dir.path().join("artifacts");
        assert_eq!(std::fs::read_dir(artifacts).unwrap().count(), 0);
    }
}
