use serde::Serialize;

use crate::download::DownloadProgress;
use crate::error::Error;
use crate::job::JobId;
use crate::remux::RemuxProgress;

/// Progress notifications of one conversion job, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversionEvent {
    /// Source resolved to the playlist that will be downloaded.
    Resolved { job_id: JobId, url: String },
    SegmentsListed {
        count: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration: Option<f64>,
    },
    Download(DownloadProgress),
    Remux(RemuxProgress),
    Done { job_id: JobId },
    Failed { code: String, message: String },
}

impl ConversionEvent {
    pub fn failed(error: &Error) -> Self {
        Self::Failed {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }

    /// Whether no further events follow this one.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Failed { .. })
    }

    /// Short name used as the SSE event type.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Resolved { .. } => "resolved",
            Self::SegmentsListed { .. } => "segments",
            Self::Download(_) => "download",
            Self::Remux(_) => "remux",
            Self::Done { .. } => "done",
            Self::Failed { .. } => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = ConversionEvent::Remux(RemuxProgress::running(60.0, Some(120.0)));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "remux");
        assert_eq!(json["percent"], 50.0);
        assert_eq!(json["seconds_elapsed"], 60.0);

        let failed = ConversionEvent::failed(&Error::empty_playlist("https://cdn.test/p.m3u8"));
        assert!(failed.is_terminal());
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["type"], "failed");
        assert_eq!(json["code"], "EMPTY_PLAYLIST");
    }
}
