//! Concurrency-bounded segment retrieval.

mod metrics;
mod pool;
mod source;

pub use metrics::{DownloadProgress, ThroughputMeter, throughput_mbps};
pub use pool::{
    DownloadReport, DownloadTask, SegmentDownloader, TaskStatus, index_width, segment_file_name,
};
pub use source::{HttpSegmentSource, SegmentSource};
