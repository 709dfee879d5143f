use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use super::{RemuxInput, RemuxJob, RemuxProgress, Remuxer};
use crate::error::{Error, Result};

/// Number of diagnostic lines kept for error reports.
const STDERR_TAIL_LINES: usize = 20;

/// Remuxer backed by an ffmpeg binary.
#[derive(Debug, Clone)]
pub struct FfmpegRemuxer {
    ffmpeg_path: String,
    timeout: Option<Duration>,
}

impl FfmpegRemuxer {
    pub fn new(ffmpeg_path: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            timeout,
        }
    }

    /// Build the argument list. `concat_list` is required for file input.
    fn build_args(&self, job: &RemuxJob, concat_list: Option<&Path>) -> Vec<String> {
        let mut args: Vec<String> = [
            "-y",
            "-hide_banner",
            "-nostats",
            "-loglevel",
            "error",
            "-progress",
            "pipe:1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        match &job.input {
            RemuxInput::Files(_) => {
                args.extend(["-f", "concat", "-safe", "0"].map(String::from));
                if let Some(list) = concat_list {
                    args.push("-i".to_string());
                    args.push(list.to_string_lossy().into_owned());
                }
            }
            RemuxInput::Url { url, headers } => {
                let header_block = ffmpeg_headers(headers);
                if !header_block.is_empty() {
                    args.push("-headers".to_string());
                    args.push(header_block);
                }
                args.push("-i".to_string());
                args.push(url.to_string());
            }
        }

        args.extend(["-c", "copy", "-bsf:a", "aac_adtstoasc"].map(String::from));

        if is_mp4_family(&job.output) {
            args.push("-movflags".to_string());
            args.push("+faststart".to_string());
        }

        args.push(job.output.to_string_lossy().into_owned());
        args
    }

    async fn run(
        &self,
        job: &RemuxJob,
        args: &[String],
        progress_tx: Option<&mpsc::UnboundedSender<RemuxProgress>>,
        token: &CancellationToken,
    ) -> Result<()> {
        debug!(ffmpeg = %self.ffmpeg_path, ?args, "Spawning ffmpeg");

        let mut child = ffmpeg_command(&self.ffmpeg_path)
            .args(args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::remux(format!("failed to spawn {}: {e}", self.ffmpeg_path)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::remux("failed to capture ffmpeg stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::remux("failed to capture ffmpeg stderr"))?;
        let stderr_task = collect_stderr_tail(stderr);

        let outcome = {
            let drive = drive_progress(&mut child, stdout, job.expected_duration, progress_tx);
            tokio::pin!(drive);

            let deadline = async {
                match self.timeout {
                    Some(limit) => tokio::time::sleep(limit).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = token.cancelled() => Outcome::Cancelled,
                _ = deadline => Outcome::TimedOut,
                result = &mut drive => Outcome::Exited(result),
            }
        };

        match outcome {
            Outcome::Exited(Ok((status, seconds))) if status.success() => {
                stderr_task.abort();
                if let Some(tx) = progress_tx {
                    let _ = tx.send(RemuxProgress::finished(seconds));
                }
                Ok(())
            }
            Outcome::Exited(Ok((status, _))) => {
                let tail = stderr_task.await.unwrap_or_default();
                warn!(%status, "ffmpeg exited unsuccessfully");
                let details = if tail.is_empty() {
                    format!("ffmpeg exited with {status}")
                } else {
                    tail.into_iter().collect::<Vec<_>>().join("\n")
                };
                Err(Error::remux(details))
            }
            Outcome::Exited(Err(e)) => {
                kill(&mut child).await;
                stderr_task.abort();
                Err(e)
            }
            Outcome::Cancelled => {
                info!("Remux cancelled, killing ffmpeg");
                kill(&mut child).await;
                stderr_task.abort();
                Err(Error::Cancelled)
            }
            Outcome::TimedOut => {
                warn!(timeout = ?self.timeout, "Remux timed out, killing ffmpeg");
                kill(&mut child).await;
                stderr_task.abort();
                Err(Error::timeout(format!(
                    "remux exceeded {:?}",
                    self.timeout.unwrap_or_default()
                )))
            }
        }
    }
}

enum Outcome {
    Exited(Result<(ExitStatus, f64)>),
    Cancelled,
    TimedOut,
}

#[async_trait]
impl Remuxer for FfmpegRemuxer {
    #[instrument(skip_all, fields(output = %job.output.display()))]
    async fn remux(
        &self,
        job: RemuxJob,
        progress_tx: Option<mpsc::UnboundedSender<RemuxProgress>>,
        token: &CancellationToken,
    ) -> Result<PathBuf> {
        // Held until ffmpeg exits; removed on drop.
        let concat_list = match &job.input {
            RemuxInput::Files(files) if files.is_empty() => {
                return Err(Error::remux("no input files to remux"));
            }
            RemuxInput::Files(files) => Some(write_concat_list(files, &job.output).await?),
            RemuxInput::Url { .. } => None,
        };

        let args = self.build_args(&job, concat_list.as_ref().map(|f| f.path()));
        let result = self.run(&job, &args, progress_tx.as_ref(), token).await;

        match result {
            Ok(()) => {
                info!(output = %job.output.display(), "Remux finished");
                Ok(job.output)
            }
            Err(e) => {
                remove_partial(&job.output).await;
                Err(e)
            }
        }
    }
}

/// Read `-progress` key=value lines until EOF, then wait for the exit status.
async fn drive_progress(
    child: &mut Child,
    stdout: impl AsyncRead + Unpin,
    expected_duration: Option<f64>,
    progress_tx: Option<&mpsc::UnboundedSender<RemuxProgress>>,
) -> Result<(ExitStatus, f64)> {
    let mut lines = BufReader::new(stdout).lines();
    let mut seconds = 0.0;

    while let Some(line) = lines.next_line().await? {
        match parse_progress_line(&line) {
            Some(ProgressLine::OutTime(secs)) => {
                seconds = secs;
                if let Some(tx) = progress_tx {
                    let _ = tx.send(RemuxProgress::running(secs, expected_duration));
                }
            }
            Some(ProgressLine::End) => trace!(seconds, "ffmpeg reported end of progress"),
            None => {}
        }
    }

    let status = child.wait().await?;
    Ok((status, seconds))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ProgressLine {
    OutTime(f64),
    End,
}

fn parse_progress_line(line: &str) -> Option<ProgressLine> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        // out_time_ms carries microseconds as well.
        "out_time_us" | "out_time_ms" => value
            .trim()
            .parse::<i64>()
            .ok()
            .filter(|us| *us >= 0)
            .map(|us| ProgressLine::OutTime(us as f64 / 1_000_000.0)),
        "progress" if value.trim() == "end" => Some(ProgressLine::End),
        _ => None,
    }
}

fn collect_stderr_tail(stderr: impl AsyncRead + Unpin + Send + 'static) -> JoinHandle<VecDeque<String>> {
    tokio::spawn(async move {
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            debug!(stderr = %line, "ffmpeg");
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        tail
    })
}

/// `Name: value` lines joined with CRLF, as ffmpeg's `-headers` expects.
fn ffmpeg_headers(headers: &HeaderMap) -> String {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| format!("{}: {}\r\n", name.as_str(), value))
        })
        .collect()
}

fn is_mp4_family(output: &Path) -> bool {
    output
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| matches!(ext.to_ascii_lowercase().as_str(), "mp4" | "m4v" | "mov"))
}

fn concat_entry(path: &Path) -> String {
    let escaped = path.to_string_lossy().replace('\'', r"'\''");
    format!("file '{escaped}'\n")
}

async fn write_concat_list(files: &[PathBuf], output: &Path) -> Result<tempfile::NamedTempFile> {
    let dir = output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(dir).await?;

    let list = tempfile::Builder::new()
        .prefix("concat-")
        .suffix(".txt")
        .tempfile_in(dir)?;

    let mut content = String::new();
    for file in files {
        let absolute = if file.is_absolute() {
            file.clone()
        } else {
            std::path::absolute(file)?
        };
        content.push_str(&concat_entry(&absolute));
    }
    tokio::fs::write(list.path(), content).await?;
    Ok(list)
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        debug!(error = %e, "ffmpeg already exited");
    }
}

async fn remove_partial(output: &Path) {
    match tokio::fs::remove_file(output).await {
        Ok(()) => debug!(path = %output.display(), "Removed partial output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %output.display(), error = %e, "Failed to remove partial output"),
    }
}

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// ffmpeg invocation that opens no console window on Windows.
fn ffmpeg_command(program: &str) -> Command {
    let mut cmd = Command::new(program);
    hide_console(&mut cmd);
    cmd
}

#[cfg(windows)]
fn hide_console(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;
    cmd.as_std_mut().creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn hide_console(_cmd: &mut Command) {}
