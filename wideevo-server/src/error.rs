//! Per-item pipeline failures.
//!
//! Everything here is local to one photo: the orchestrator records the error
//! on the item and moves on to the next one.

use thiserror::Error;

/// Failure while processing a single queued photo.
#[derive(Error, Debug)]
pub enum ItemError {
    #[error("failed to decode image: {0}")]
    Decode(String),

    #[error("failed to encode jpeg: {0}")]
    Encode(String),

    #[error("invalid jpeg stream: {0}")]
    Format(#[from] FormatError),

    #[error("worker failed: {0}")]
    Worker(String),

    #[error("no file names left after counter {last}")]
    NamesExhausted { last: u32 },
}

/// Structural problems in a JPEG marker stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("stream does not start with an SOI marker")]
    MissingSoi,

    #[error("segment payload of {len} bytes does not fit a 16-bit length field")]
    SegmentTooLarge { len: usize },

    #[error("expected a marker at offset {offset}")]
    ExpectedMarker { offset: usize },

    #[error("segment at offset {offset} is truncated")]
    Truncated { offset: usize },

    #[error("segment at offset {offset} has invalid length {len}")]
    BadLength { offset: usize, len: u16 },
}

/// Misuse of the EXIF builder. Never caused by user data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    #[error("orientation {0} is outside the EXIF range 1..=8")]
    InvalidOrientation(u16),
}
