use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::metrics::{DownloadProgress, ThroughputMeter};
use super::source::SegmentSource;
use crate::error::{Error, Result};
use crate::hls::Segment;

/// Minimum zero-padding of segment file indices.
const MIN_INDEX_WIDTH: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InFlight,
    Done,
    Failed,
}

/// One segment scheduled for download.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub segment: Segment,
    pub destination: PathBuf,
    pub status: TaskStatus,
    pub bytes: u64,
}

impl DownloadTask {
    fn new(segment: Segment, destination: PathBuf) -> Self {
        Self {
            segment,
            destination,
            status: TaskStatus::Pending,
            bytes: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadReport {
    /// Written files, in segment order.
    pub files: Vec<PathBuf>,
    pub total_bytes: u64,
    pub elapsed: Duration,
    pub throughput_mbps: f64,
}

/// Zero-padding width for `total` segments.
pub fn index_width(total: usize) -> usize {
    total.to_string().len().max(MIN_INDEX_WIDTH)
}

/// File name for a segment, ordered lexicographically by index.
pub fn segment_file_name(segment: &Segment, width: usize) -> String {
    format!(
        "seg{:0width$}.{}",
        segment.index,
        segment.extension(),
        width = width
    )
}

/// Bounded-concurrency segment fetcher.
#[derive(Clone)]
pub struct SegmentDownloader {
    source: Arc<dyn SegmentSource>,
    concurrency: usize,
}

impl SegmentDownloader {
    pub fn new(source: Arc<dyn SegmentSource>, concurrency: usize) -> Self {
        Self {
            source,
            concurrency: concurrency.max(1),
        }
    }

    /// Download every segment into `dest_dir`, at most `concurrency` at a time.
    ///
    /// The first failure stops dispatch of pending segments, waits for the
    /// ones already running, removes what was written and returns that error.
    #[instrument(skip_all, fields(segments = segments.len(), concurrency = self.concurrency))]
    pub async fn download_all(
        &self,
        segments: &[Segment],
        dest_dir: &Path,
        progress_tx: Option<mpsc::UnboundedSender<DownloadProgress>>,
        token: &CancellationToken,
    ) -> Result<DownloadReport> {
        let total = segments.len();
        let meter = Arc::new(ThroughputMeter::new(total));

        if total == 0 {
            return Ok(DownloadReport {
                files: Vec::new(),
                total_bytes: 0,
                elapsed: meter.elapsed(),
                throughput_mbps: 0.0,
            });
        }

        tokio::fs::create_dir_all(dest_dir).await?;

        let width = index_width(total);
        let tasks = Arc::new(Mutex::new(
            segments
                .iter()
                .map(|s| DownloadTask::new(s.clone(), dest_dir.join(segment_file_name(s, width))))
                .collect::<Vec<_>>(),
        ));

        let pool_token = token.child_token();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let first_error: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
        let mut join_set = JoinSet::new();

        for position in 0..total {
            let permit = tokio::select! {
                biased;
                _ = pool_token.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    permit.map_err(|_| Error::internal("download semaphore closed"))?
                }
            };

            let (segment, destination) = {
                let mut tasks = tasks.lock();
                let task = &mut tasks[position];
                task.status = TaskStatus::InFlight;
                (task.segment.clone(), task.destination.clone())
            };

            let source = Arc::clone(&self.source);
            let meter = Arc::clone(&meter);
            let tasks = Arc::clone(&tasks);
            let first_error = Arc::clone(&first_error);
            let pool_token = pool_token.clone();
            let progress_tx = progress_tx.clone();

            join_set.spawn(async move {
                let _permit = permit;

                let result = tokio::select! {
                    biased;
                    _ = pool_token.cancelled() => Err(Error::Cancelled),
                    result = fetch_to_file(source.as_ref(), &segment, &destination) => result,
                };

                match result {
                    Ok(bytes) => {
                        {
                            let mut tasks = tasks.lock();
                            tasks[position].status = TaskStatus::Done;
                            tasks[position].bytes = bytes;
                        }
                        let progress = meter.record(bytes);
                        debug!(
                            index = segment.index,
                            completed = progress.completed,
                            total = progress.total,
                            "Segment written"
                        );
                        if let Some(tx) = &progress_tx {
                            let _ = tx.send(progress);
                        }
                    }
                    Err(Error::Cancelled) => {
                        tasks.lock()[position].status = TaskStatus::Failed;
                    }
                    Err(e) => {
                        warn!(index = segment.index, url = %segment.uri, error = %e, "Segment download failed");
                        tasks.lock()[position].status = TaskStatus::Failed;
                        first_error.lock().get_or_insert(e);
                        pool_token.cancel();
                    }
                }
            });
        }

        while let Some(joined) = join_set.join_next().await {
            if let Err(e) = joined {
                first_error
                    .lock()
                    .get_or_insert(Error::internal(format!("download task panicked: {e}")));
                pool_token.cancel();
            }
        }

        let failure = first_error.lock().take();
        let failure = match failure {
            Some(e) => Some(e),
            None if token.is_cancelled() => Some(Error::Cancelled),
            None => None,
        };

        let tasks = std::mem::take(&mut *tasks.lock());

        if let Some(e) = failure {
            remove_written(&tasks).await;
            return Err(e);
        }

        let report = DownloadReport {
            files: tasks.iter().map(|t| t.destination.clone()).collect(),
            total_bytes: meter.bytes(),
            elapsed: meter.elapsed(),
            throughput_mbps: super::metrics::throughput_mbps(meter.bytes(), meter.elapsed()),
        };

        info!(
            segments = total,
            bytes = report.total_bytes,
            throughput_mbps = report.throughput_mbps,
            "All segments downloaded"
        );
        Ok(report)
    }
}

async fn fetch_to_file(source: &dyn SegmentSource, segment: &Segment, destination: &Path) -> Result<u64> {
    let data = source.fetch(segment).await?;
    tokio::fs::write(destination, &data).await?;
    Ok(data.len() as u64)
}

async fn remove_written(tasks: &[DownloadTask]) {
    for task in tasks {
        match tokio::fs::remove_file(&task.destination).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %task.destination.display(), error = %e, "Failed to remove segment file")
            }
        }
    }
}
