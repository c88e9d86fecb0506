//! JPEG marker stream plumbing: APP1 insertion right after SOI, plus a
//! header walker used to drop metadata an encoder may already have written.

use crate::error::FormatError;

pub const SOI: [u8; 2] = [0xFF, 0xD8];
pub const MARKER_APP1: u8 = 0xE1;
const MARKER_SOS: u8 = 0xDA;
const MARKER_EOI: u8 = 0xD9;
const MARKER_TEM: u8 = 0x01;
/// Marker bytes plus the length field.
pub const SEGMENT_HEADER_LEN: usize = 4;

/// One marker segment in the header part of a stream (before entropy data).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub marker: u8,
    /// Offset of the leading 0xFF.
    pub offset: usize,
    /// Total bytes including marker and length field.
    pub len: usize,
}

fn is_standalone(marker: u8) -> bool {
    marker == MARKER_TEM || (0xD0..=0xD7).contains(&marker)
}

fn check_soi(jpeg: &[u8]) -> Result<(), FormatError> {
    if jpeg.len() < 2 || jpeg[..2] != SOI {
        return Err(FormatError::MissingSoi);
    }
    Ok(())
}

/// Wrap `payload` into a complete APP1 segment (`FF E1`, big-endian length, payload).
pub fn app1_segment(payload: &[u8]) -> Result<Vec<u8>, FormatError> {
    let len = u16::try_from(payload.len() + 2)
        .map_err(|_| FormatError::SegmentTooLarge { len: payload.len() })?;
    let mut seg = Vec::with_capacity(SEGMENT_HEADER_LEN + payload.len());
    seg.extend_from_slice(&[0xFF, MARKER_APP1]);
    seg.extend_from_slice(&len.to_be_bytes());
    seg.extend_from_slice(payload);
    Ok(seg)
}

/// Insert `payload` as an APP1 segment directly after SOI.
///
/// Everything after SOI is copied through untouched, so the output is
/// exactly `SEGMENT_HEADER_LEN + payload.len()` bytes longer than `jpeg`.
pub fn inject_segment(jpeg: &[u8], payload: &[u8]) -> Result<Vec<u8>, FormatError> {
    check_soi(jpeg)?;
    let seg = app1_segment(payload)?;
    let mut out = Vec::with_capacity(jpeg.len() + seg.len());
    out.extend_from_slice(&jpeg[..2]);
    out.extend_from_slice(&seg);
    out.extend_from_slice(&jpeg[2..]);
    Ok(out)
}

/// Walk marker segments from SOI up to and including SOS (or EOI).
pub fn segments(jpeg: &[u8]) -> Result<Vec<Segment>, FormatError> {
    check_soi(jpeg)?;
    let mut out = Vec::new();
    let mut pos = 2;
    while pos < jpeg.len() {
        if jpeg[pos] != 0xFF {
            return Err(FormatError::ExpectedMarker { offset: pos });
        }
        // Skip fill bytes.
        let mut m = pos + 1;
        while m < jpeg.len() && jpeg[m] == 0xFF {
            m += 1;
        }
        let Some(&marker) = jpeg.get(m) else {
            return Err(FormatError::Truncated { offset: pos });
        };
        if marker == MARKER_EOI || is_standalone(marker) {
            out.push(Segment {
                marker,
                offset: pos,
                len: m + 1 - pos,
            });
            if marker == MARKER_EOI {
                break;
            }
            pos = m + 1;
            continue;
        }
        if m + 3 > jpeg.len() {
            return Err(FormatError::Truncated { offset: pos });
        }
        let seg_len = u16::from_be_bytes([jpeg[m + 1], jpeg[m + 2]]);
        if seg_len < 2 {
            return Err(FormatError::BadLength {
                offset: pos,
                len: seg_len,
            });
        }
        let end = m + 1 + seg_len as usize;
        if end > jpeg.len() {
            return Err(FormatError::Truncated { offset: pos });
        }
        out.push(Segment {
            marker,
            offset: pos,
            len: end - pos,
        });
        if marker == MARKER_SOS {
            break;
        }
        pos = end;
    }
    Ok(out)
}

/// Remove every APP1 segment that precedes the scan data.
/// Returns the input unchanged when there is nothing to strip.
pub fn strip_app1(jpeg: Vec<u8>) -> Result<Vec<u8>, FormatError> {
    let found: Vec<Segment> = segments(&jpeg)?
        .into_iter()
        .filter(|s| s.marker == MARKER_APP1)
        .collect();
    if found.is_empty() {
        return Ok(jpeg);
    }
    let removed: usize = found.iter().map(|s| s.len).sum();
    let mut out = Vec::with_capacity(jpeg.len() - removed);
    let mut cursor = 0;
    for s in &found {
        out.extend_from_slice(&jpeg[cursor..s.offset]);
        cursor = s.offset + s.len;
    }
    out.extend_from_slice(&jpeg[cursor..]);
    tracing::debug!(segments = found.len(), bytes = removed, "stripped encoder APP1");
    Ok(out)
}
