use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "segmux")]
#[command(about = "Download segmented (HLS) streams and reassemble them into one file")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the ffmpeg binary
    #[arg(long, global = true, env = "FFMPEG_PATH", default_value = "ffmpeg")]
    pub ffmpeg: String,

    /// Directory for staging segments and finished artifacts
    #[arg(long, global = true, env = "SEGMUX_WORK_DIR")]
    pub work_dir: Option<PathBuf>,

    /// Timeout for manifest and probe requests, in seconds
    #[arg(long, global = true, default_value_t = 10)]
    pub timeout: u64,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download a stream and write it to a single file
    Convert {
        /// Manifest or media playlist URL
        url: String,

        /// Output file; its extension picks the container
        #[arg(short, long, default_value = "video.mp4")]
        output: PathBuf,

        /// Maximum number of segments downloaded at once
        #[arg(short = 'j', long, default_value_t = segmux_engine::config::DEFAULT_CONCURRENCY)]
        concurrency: usize,

        /// Extra request header, `Name: value`; may be repeated
        #[arg(short = 'H', long = "header", value_name = "HEADER")]
        headers: Vec<String>,

        /// Let ffmpeg read the stream directly instead of downloading segments
        #[arg(long)]
        direct: bool,

        /// Stream duration in seconds, used for progress in direct mode
        #[arg(long)]
        duration: Option<f64>,
    },

    /// Print the playlist URL that would be downloaded
    Resolve {
        url: String,

        #[arg(short = 'H', long = "header", value_name = "HEADER")]
        headers: Vec<String>,
    },

    /// Check that a URL is reachable
    Probe {
        url: String,

        #[arg(short = 'H', long = "header", value_name = "HEADER")]
        headers: Vec<String>,
    },

    /// Run the HTTP API
    Serve {
        /// Address to bind
        #[arg(long, env = "API_BIND_ADDRESS", default_value = "0.0.0.0")]
        bind: String,

        /// Port to listen on
        #[arg(short, long, env = "API_PORT", default_value_t = 12555)]
        port: u16,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn parses_convert_with_repeated_headers() {
        let args = Args::parse_from([
            "segmux",
            "-v",
            "convert",
            "https://cdn.test/master.m3u8",
            "-o",
            "out.mkv",
            "-j",
            "4",
            "-H",
            "Referer: https://site.test/",
            "-H",
            "Origin: https://site.test",
        ]);
        assert!(args.verbose);
        match args.command {
            Commands::Convert {
                output,
                concurrency,
                headers,
                direct,
                ..
            } => {
                assert_eq!(output, PathBuf::from("out.mkv"));
                assert_eq!(concurrency, 4);
                assert_eq!(headers.len(), 2);
                assert!(!direct);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
