//! One bounded byte range sent to a session.

use std::sync::Arc;

use bytes::Bytes;
use reqwest::Method;
use tracing::debug;
use url::Url;

use crate::cancel::CancelSignal;
use crate::error::{Phase, PhaseExt};
use crate::protocol;
use crate::transport::{ByteProgress, Transport, TransportRequest};
use crate::{Result, UploadError};

/// Upload progress as a fraction in `[0, 1]` of the declared size.
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

/// A half-open range `[start, end)` of the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkBounds {
    pub start: u64,
    pub end: u64,
}

impl ChunkBounds {
    /// The chunk starting at `start`, or `None` once `start` reaches `total`.
    pub fn at(start: u64, chunk_size: u64, total: u64) -> Option<Self> {
        if start >= total {
            return None;
        }
        Some(Self {
            start,
            end: start.saturating_add(chunk_size).min(total),
        })
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Fraction of `total` covered once `sent` bytes past `start` are out.
pub(crate) fn fraction(start: u64, sent: u64, total: u64) -> f64 {
    if total == 0 {
        return 1.0;
    }
    ((start + sent) as f64 / total as f64).min(1.0)
}

/// Sends `data` as the range `bounds` of a `total`-byte payload and returns
/// the byte count the server reports as received.
///
/// `None` means the reply carried no range header. The caller decides what
/// that implies; it never counts as the chunk being confirmed.
pub async fn send_chunk(
    transport: &dyn Transport,
    session_url: &Url,
    data: Bytes,
    bounds: ChunkBounds,
    total: u64,
    progress: Option<&ProgressFn>,
    cancel: &CancelSignal,
) -> Result<Option<u64>> {
    async {
        if data.len() as u64 != bounds.len() {
            return Err(UploadError::Source(format!(
                "expected {} bytes for range {}-{}, got {}",
                bounds.len(),
                bounds.start,
                bounds.end,
                data.len()
            )));
        }
        cancel.check()?;

        let byte_progress: Option<ByteProgress> = progress.map(|progress| {
            let progress = progress.clone();
            let start = bounds.start;
            Arc::new(move |sent: u64| progress(fraction(start, sent, total))) as ByteProgress
        });

        let request = TransportRequest::new(Method::PUT, session_url.clone())
            .header("content-type", protocol::OCTET_STREAM)
            .header(
                protocol::CONTENT_RANGE,
                protocol::content_range_for_chunk(bounds.start, bounds.end, total),
            )
            .body(data);

        let response = transport.send(request, cancel, byte_progress).await?;
        let acked = protocol::parse_received_range(&response.headers)?;

        debug!(
            session = %session_url,
            start = bounds.start,
            end = bounds.end,
            ?acked,
            status = response.status.as_u16(),
            "chunk sent"
        );
        Ok::<_, UploadError>(acked)
    }
    .await
    .phase(Phase::ChunkUpload)
}
