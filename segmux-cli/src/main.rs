mod api;
mod cli;
mod commands;
mod error;

use std::path::Path;
use std::process;
use std::time::Duration;

use clap::Parser;
use segmux_engine::{Converter, EngineConfig};
use tracing::{Level, error, info};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::cli::{Args, Commands};
use crate::commands::ConvertOptions;
use crate::error::{Result, parse_header_args};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    if let Err(e) = run(args).await {
        error!("Application error: {}", e);
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = EngineConfig::default().with_ffmpeg_path(args.ffmpeg);
    config.fetch_timeout = Duration::from_secs(args.timeout.max(1));
    if let Some(work_dir) = args.work_dir {
        config = config.with_work_dir(work_dir);
    }

    match args.command {
        Commands::Convert {
            url,
            output,
            concurrency,
            headers,
            direct,
            duration,
        } => {
            let converter = Converter::new(config.with_concurrency(concurrency))?;
            let options = ConvertOptions {
                url,
                output,
                headers: parse_header_args(&headers)?,
                direct,
                duration,
            };
            let written = commands::convert(&converter, options).await?;
            info!(path = %written.display(), "Conversion complete");
            println!("{}", file_link(&written));
        }
        Commands::Resolve { url, headers } => {
            let converter = Converter::new(config)?;
            commands::resolve(&converter, &url, &parse_header_args(&headers)?).await?;
        }
        Commands::Probe { url, headers } => {
            let converter = Converter::new(config)?;
            commands::probe(&converter, &url, &parse_header_args(&headers)?).await?;
        }
        Commands::Serve { bind, port } => {
            let converter = Converter::new(config)?;
            commands::serve(converter, bind, port).await?;
        }
    }

    Ok(())
}

/// `file://` link to a written file, or its plain path when no link can be formed.
fn file_link(path: &Path) -> String {
    std::path::absolute(path)
        .ok()
        .and_then(|abs| url::Url::from_file_path(abs).ok())
        .map(|url| url.to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_level(verbose))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_link_uses_file_scheme() {
        let dir = std::env::temp_dir();
        let link = file_link(&dir.join("video.mp4"));
        assert!(link.starts_with("file://"));
        assert!(link.ends_with("video.mp4"));
    }
}
