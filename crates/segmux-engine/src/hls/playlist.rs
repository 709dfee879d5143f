// HLS playlist parsing: variant selection for multi-variant manifests and
// segment listing for media playlists.

use std::collections::HashMap;
use std::sync::LazyLock;

use bytes::Bytes;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, trace};
use url::Url;

use crate::error::{Error, Result};

const STREAM_INF_TAG: &str = "#EXT-X-STREAM-INF";
const EXTINF_TAG: &str = "#EXTINF:";
const BYTERANGE_TAG: &str = "#EXT-X-BYTERANGE:";

// BANDWIDTH must start the attribute list or follow a comma, otherwise
// AVERAGE-BANDWIDTH would match too.
static BANDWIDTH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:[:,]\s*)BANDWIDTH=(\d+)").expect("valid regex"));

/// One quality rendition declared by a multi-variant manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    pub bandwidth: u64,
    /// URI as written in the manifest, possibly relative.
    pub uri: String,
}

impl Variant {
    /// Resolve the URI against the manifest URL.
    pub fn resolve(&self, manifest_url: &Url) -> Result<Url> {
        manifest_url
            .join(&self.uri)
            .map_err(|e| Error::invalid_url(&self.uri, e))
    }
}

/// `#EXT-X-BYTERANGE` sub-range of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ByteRange {
    pub length: u64,
    pub offset: u64,
}

impl ByteRange {
    /// Value for an HTTP `Range` header.
    pub fn header_value(&self) -> String {
        let end = (self.offset + self.length).saturating_sub(1);
        format!("bytes={}-{}", self.offset, end)
    }

    /// The covered part of a full resource body, `None` when it runs past the end.
    pub fn slice(&self, data: &Bytes) -> Option<Bytes> {
        let start = usize::try_from(self.offset).ok()?;
        let end = start.checked_add(usize::try_from(self.length).ok()?)?;
        (end <= data.len()).then(|| data.slice(start..end))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Position in the media playlist; defines output order.
    pub index: usize,
    pub uri: Url,
    pub duration: Option<f64>,
    pub byte_range: Option<ByteRange>,
}

impl Segment {
    /// File extension taken from the URI path, `ts` when there is none.
    pub fn extension(&self) -> &str {
        self.uri
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext)
            .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or("ts")
    }
}

#[derive(Debug, Clone)]
pub struct MediaPlaylist {
    pub url: Url,
    pub segments: Vec<Segment>,
}

impl MediaPlaylist {
    /// Sum of EXTINF durations, if every segment declared one.
    pub fn total_duration(&self) -> Option<f64> {
        self.segments
            .iter()
            .map(|s| s.duration)
            .sum::<Option<f64>>()
            .filter(|total| *total > 0.0)
    }
}

/// Collect every stream declaration that is followed by a URI line.
pub fn parse_variants(text: &str) -> Vec<Variant> {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    let mut variants = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        if !line.starts_with(STREAM_INF_TAG) {
            continue;
        }

        let bandwidth = BANDWIDTH_RE
            .captures(line)
            .and_then(|caps| caps[1].parse::<u64>().ok())
            .unwrap_or(0);

        match lines.get(i + 1) {
            Some(uri) if !uri.starts_with('#') => variants.push(Variant {
                bandwidth,
                uri: uri.to_string(),
            }),
            next => trace!(?next, "Stream declaration without URI, skipping"),
        }
    }

    variants
}

/// Pick the highest-bandwidth variant; ties go to the first declared.
pub fn best_variant(variants: &[Variant]) -> Option<&Variant> {
    variants.iter().fold(None, |best: Option<&Variant>, v| match best {
        Some(b) if b.bandwidth >= v.bandwidth => Some(b),
        _ => Some(v),
    })
}

/// Resolve the best variant URL of a manifest, or `None` when the manifest is
/// itself a media playlist.
pub fn select_variant(text: &str, manifest_url: &Url) -> Result<Option<Url>> {
    let variants = parse_variants(text);
    match best_variant(&variants) {
        Some(best) => {
            let url = best.resolve(manifest_url)?;
            debug!(
                bandwidth = best.bandwidth,
                candidates = variants.len(),
                url = %url,
                "Selected best variant"
            );
            Ok(Some(url))
        }
        None => Ok(None),
    }
}

/// Parse a media playlist into ordered segments resolved against `playlist_url`.
pub fn parse_media_playlist(text: &str, playlist_url: &Url) -> Result<MediaPlaylist> {
    let mut segments = Vec::new();
    let mut pending_duration: Option<f64> = None;
    let mut pending_range: Option<(u64, Option<u64>)> = None;
    // End offset of the last byte range seen per resource.
    let mut range_ends: HashMap<Url, u64> = HashMap::new();

    for line in text.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix(EXTINF_TAG) {
            pending_duration = rest
                .split(',')
                .next()
                .and_then(|d| d.trim().parse::<f64>().ok());
            continue;
        }

        if let Some(rest) = line.strip_prefix(BYTERANGE_TAG) {
            pending_range = parse_byte_range(rest);
            continue;
        }

        if line.starts_with('#') {
            continue;
        }

        let uri = playlist_url
            .join(line)
            .map_err(|e| Error::invalid_url(line, e))?;

        let byte_range = pending_range.take().map(|(length, offset)| {
            let offset = offset.unwrap_or_else(|| range_ends.get(&uri).copied().unwrap_or(0));
            range_ends.insert(uri.clone(), offset + length);
            ByteRange { length, offset }
        });

        segments.push(Segment {
            index: segments.len(),
            uri,
            duration: pending_duration.take(),
            byte_range,
        });
    }

    if segments.is_empty() {
        return Err(Error::empty_playlist(playlist_url.as_str()));
    }

    debug!(url = %playlist_url, segments = segments.len(), "Parsed media playlist");
    Ok(MediaPlaylist {
        url: playlist_url.clone(),
        segments,
    })
}

fn parse_byte_range(value: &str) -> Option<(u64, Option<u64>)> {
    let (length, offset) = match value.trim().split_once('@') {
        Some((length, offset)) => (length, Some(offset.trim().parse().ok()?)),
        None => (value, None),
    };
    Some((length.trim().parse().ok()?, offset))
}
