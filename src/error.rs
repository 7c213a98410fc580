// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transcoder binary not found: {0}")]
    TranscoderBinaryMissing(String),

    #[error("invalid timeline {id}: {reason}")]
    InvalidTimeline { id: i64, reason: String },

    #[error("stream {stream_id} not found")]
    StreamNotFound { stream_id: i64 },

    #[error("stream {stream_id} already running")]
    StreamAlreadyRunning { stream_id: i64 },

    #[error("concurrent stream ceiling reached ({max})")]
    ConcurrencyLimitReached { max: u32 },

    #[error("handoff for stream {stream_id} failed: {reason}")]
    HandoffFailed { stream_id: i64, reason: String },

    #[error("ONVIF error: {0}")]
    Onvif(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
