//! Header names and range codecs of the resumable-upload wire protocol.

use reqwest::header::HeaderMap;

use crate::{Result, UploadError};

/// Declared payload size, sent when creating a session.
pub const UPLOAD_CONTENT_LENGTH: &str = "x-upload-content-length";

/// Declared payload MIME type, sent when creating a session.
pub const UPLOAD_CONTENT_TYPE: &str = "x-upload-content-type";

/// Byte range carried by a chunk or status request.
pub const CONTENT_RANGE: &str = "content-range";

/// Bytes the server has received, e.g. `bytes=0-1023`.
pub const RANGE: &str = "range";

/// Session URL returned on creation.
pub const LOCATION: &str = "location";

pub const OCTET_STREAM: &str = "application/octet-stream";
pub const JSON: &str = "application/json";

/// "Resume Incomplete": the server accepted the chunk and wants more.
pub const RESUME_INCOMPLETE: u16 = 308;

/// `Content-Range` value for the chunk `[start, end)` of a `total`-byte payload.
pub fn content_range_for_chunk(start: u64, end: u64, total: u64) -> String {
    debug_assert!(start < end && end <= total);
    format!("bytes {}-{}/{}", start, end - 1, total)
}

/// `Content-Range` value for a zero-body status probe.
pub fn content_range_for_status(total: Option<u64>) -> String {
    match total {
        Some(total) => format!("bytes */{}", total),
        None => "bytes */*".to_string(),
    }
}

/// Number of bytes the server reports as received.
///
/// `Ok(None)` when the header is absent; callers decide what that means.
pub fn parse_received_range(headers: &HeaderMap) -> Result<Option<u64>> {
    let Some(value) = headers.get(RANGE) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| UploadError::Protocol("non-ASCII Range header".to_string()))?;
    parse_range_value(value).map(Some)
}

fn parse_range_value(value: &str) -> Result<u64> {
    let malformed = || UploadError::Protocol(format!("malformed Range header: {value:?}"));

    let range = value.trim().strip_prefix("bytes=").ok_or_else(malformed)?;
    let (_, end) = range.split_once('-').ok_or_else(malformed)?;
    let end: u64 = end.trim().parse().map_err(|_| malformed())?;
    end.checked_add(1).ok_or_else(malformed)
}

/// Whether a response status counts as success for this protocol.
pub fn is_accepted_status(status: u16) -> bool {
    (200..400).contains(&status) || status == RESUME_INCOMPLETE
}
