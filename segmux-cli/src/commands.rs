use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::http::HeaderMap;
use indicatif::{ProgressBar, ProgressStyle};
use segmux_engine::{ConversionEvent, ConversionMode, ConversionRequest, Converter};
use tracing::{debug, info, warn};

use crate::api::{ApiServer, ApiServerConfig, AppState};
use crate::error::{AppError, Result};

pub struct ConvertOptions {
    pub url: String,
    pub output: PathBuf,
    pub headers: HeaderMap,
    pub direct: bool,
    pub duration: Option<f64>,
}

pub async fn convert(converter: &Converter, options: ConvertOptions) -> Result<PathBuf> {
    let file_name = options
        .output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| AppError::InvalidInput("output must name a file".to_string()))?;

    let mode = if options.direct {
        ConversionMode::Direct
    } else {
        ConversionMode::Segmented
    };
    let mut request = ConversionRequest::new(&options.url)
        .with_headers(options.headers)
        .with_filename(file_name)
        .with_mode(mode);
    if let Some(duration) = options.duration {
        request = request.with_expected_duration(duration);
    }

    let mut handle = converter.start(request);
    let id = handle.id.clone();
    let progress = ConvertProgress::new();

    loop {
        let event = tokio::select! {
            event = handle.events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling conversion");
                handle.cancel();
                continue;
            }
        };
        let Some(event) = event else { break };
        progress.update(&event);
        if event.is_terminal() {
            break;
        }
    }

    let artifact = match handle.wait().await {
        Ok(path) => path,
        Err(e) => {
            progress.abandon();
            return Err(e.into());
        }
    };
    debug!(path = %artifact.display(), "Artifact produced");

    let lease = converter.fetch_artifact(&id)?;
    move_file(lease.path(), &options.output).await?;
    lease.finish();
    converter.registry().remove(&id).await;

    Ok(options.output)
}

pub async fn resolve(converter: &Converter, url: &str, headers: &HeaderMap) -> Result<()> {
    let playlist_url = converter.resolve_best_source(url, headers).await?;
    let playlist = converter.list_segments(&playlist_url, headers).await?;

    println!("{playlist_url}");
    match playlist.total_duration() {
        Some(duration) => info!(
            segments = playlist.segments.len(),
            duration_secs = duration,
            "Resolved media playlist"
        ),
        None => info!(segments = playlist.segments.len(), "Resolved media playlist"),
    }
    Ok(())
}

pub async fn probe(converter: &Converter, url: &str, headers: &HeaderMap) -> Result<()> {
    let report = converter.probe(url, headers, None).await;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).map_err(|e| AppError::InvalidInput(e.to_string()))?
    );
    if report.ok {
        Ok(())
    } else {
        Err(AppError::InvalidInput(
            report.error.unwrap_or_else(|| "unreachable".to_string()),
        ))
    }
}

pub async fn serve(converter: Converter, bind: String, port: u16) -> Result<()> {
    let config = ApiServerConfig {
        bind_address: bind,
        port,
        ..ApiServerConfig::default()
    };
    let server = ApiServer::new(config, AppState::new(converter));

    let token = server.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });

    server.run().await
}

/// Rename when possible, copy across file systems otherwise.
async fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::rename(from, to).await.is_err() {
        tokio::fs::copy(from, to).await?;
    }
    Ok(())
}

/// Terminal progress for one conversion.
struct ConvertProgress {
    bar: ProgressBar,
}

impl ConvertProgress {
    fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.enable_steady_tick(Duration::from_millis(120));
        bar.set_style(spinner_style());
        bar.set_message("Resolving stream...");
        Self { bar }
    }

    fn update(&self, event: &ConversionEvent) {
        match event {
            ConversionEvent::Resolved { url, .. } => {
                self.bar.set_message(format!("Resolved {url}"));
            }
            ConversionEvent::SegmentsListed { count, .. } => {
                self.bar.set_style(bar_style("{pos}/{len} segments {msg}"));
                self.bar.set_length(*count as u64);
                self.bar.set_position(0);
                self.bar.set_message("");
            }
            ConversionEvent::Download(progress) => {
                self.bar.set_position(progress.completed as u64);
                self.bar
                    .set_message(format!("{:.2} MiB/s", progress.throughput_mbps));
            }
            ConversionEvent::Remux(progress) => match progress.percent {
                Some(percent) => {
                    if self.bar.length() != Some(100) {
                        self.bar.set_style(bar_style("{pos}% remuxing {msg}"));
                        self.bar.set_length(100);
                    }
                    self.bar.set_position(percent.floor() as u64);
                    self.bar
                        .set_message(format!("{:.0}s", progress.seconds_elapsed));
                }
                None => {
                    self.bar.set_style(spinner_style());
                    self.bar
                        .set_message(format!("Remuxing... {:.0}s", progress.seconds_elapsed));
                }
            },
            ConversionEvent::Done { .. } => self.bar.finish_with_message("done"),
            ConversionEvent::Failed { message, .. } => {
                self.bar.abandon_with_message(format!("failed: {message}"))
            }
        }
    }

    fn abandon(&self) {
        if !self.bar.is_finished() {
            self.bar.abandon();
        }
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.blue} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn bar_style(suffix: &str) -> ProgressStyle {
    ProgressStyle::with_template(&format!("{{spinner:.yellow}} [{{bar:30.yellow/white}}] {suffix}"))
        .map(|style| style.progress_chars("=> "))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn move_file_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("artifact.mp4");
        std::fs::write(&from, b"x").unwrap();
        let to = dir.path().join("nested/out/video.mp4");

        move_file(&from, &to).await.unwrap();
        assert_eq!(std::fs::read(&to).unwrap(), b"x");
    }

    #[test]
    fn bar_templates_are_valid() {
        assert!(
            ProgressStyle::with_template("{spinner:.yellow} [{bar:30.yellow/white}] {pos}/{len} segments {msg}")
                .is_ok()
        );
        let _ = bar_style("{pos}% remuxing {msg}");
    }
}
