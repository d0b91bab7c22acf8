//! Transcript following and context-usage tracking.

pub mod monitor;
pub mod record;

pub use monitor::{
    latest_transcript, ContextMonitor, MonitorHandle, MonitorStats, MonitorStatus,
    TranscriptSource,
};
pub use record::{apply_record, parse_line, parse_timestamp};
