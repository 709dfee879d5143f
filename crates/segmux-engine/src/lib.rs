//! Acquisition and reassembly of segmented (HLS) video streams.
//!
//! A [`Converter`] resolves the best variant of a manifest, downloads its
//! segments with bounded concurrency, remuxes them into one container and
//! holds the result for a single retrieval.

pub mod config;
pub mod converter;
pub mod download;
pub mod error;
pub mod events;
pub mod hls;
pub mod http;
pub mod job;
pub mod registry;
pub mod remux;

pub use config::EngineConfig;
pub use converter::{Converter, ConverterBuilder};
pub use download::{DownloadProgress, DownloadReport, SegmentDownloader, SegmentSource};
pub use error::{Error, FetchError, FetchErrorKind, Result};
pub use events::ConversionEvent;
pub use hls::{MediaPlaylist, Segment, Variant};
pub use http::{ProbeReport, header_map, parse_url};
pub use job::{ConversionHandle, ConversionMode, ConversionRequest, JobId, JobState};
pub use registry::{ArtifactLease, ArtifactRegistry, ArtifactStore, InMemoryArtifactStore};
pub use remux::{FfmpegRemuxer, RemuxInput, RemuxJob, RemuxProgress, Remuxer};
