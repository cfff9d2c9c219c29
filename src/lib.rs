//! Resumable, chunked HTTP uploads.
//!
//! A session is opened with a `POST` to an upload endpoint, which answers with
//! the session URL in `Location`. The payload is then sent as a sequence of
//! `PUT` requests carrying `Content-Range: bytes s-e/total`; the server replies
//! with `Range: bytes=0-n` describing what it has actually received, and the
//! client always continues from that offset. An interrupted upload can be
//! resumed later from the session URL alone.
//!
//! Payloads come from a [`Bytes`](bytes::Bytes) buffer, any [`Blob`], a file
//! path, or a push stream (see [`UploadSource::channel`]) that is paused
//! while a chunk is in flight.
//!
//! ```no_run
//! # async fn run() -> resumable_upload::Result<()> {
//! use resumable_upload::{CallOptions, ClientConfig, UploadClient, UploadMetadata, UploadSource};
//!
//! let client = UploadClient::new(ClientConfig::default())?;
//! let endpoint = "https://uploads.example.com/upload".parse()?;
//! let metadata = UploadMetadata::new("report.pdf", 12_345).with_mime_type("application/pdf");
//!
//! let outcome = client
//!     .upload(&endpoint, &metadata, UploadSource::file("report.pdf"), &CallOptions::new())
//!     .await?;
//! println!("{outcome:?}");
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod chunk;
pub mod client;
mod driver;
pub mod error;
pub mod metadata;
pub mod protocol;
pub mod retry;
mod serde_utils;
pub mod session;
pub mod source;
pub mod transport;

#[cfg(test)]
mod testing;

pub use cancel::{AbortHandle, CancelSignal};
pub use chunk::{ChunkBounds, ProgressFn, send_chunk};
pub use client::{
    CallOptions, ClientConfig, DEFAULT_CHUNK_SIZE, UploadClient, UploadEvent, UploadOutcome,
};
pub use driver::MAX_STALLED_CHUNKS;
pub use error::{Phase, Result, TransportError, UploadError};
pub use metadata::UploadMetadata;
pub use retry::RetryPolicy;
pub use session::{Session, create_session, query_status};
pub use source::{Blob, ByteStream, FileBlob, StreamWriter, UploadSource};
pub use transport::{
    ByteProgress, HttpTransport, Transport, TransportOptions, TransportRequest, TransportResponse,
};
pub use tokio_util::sync::CancellationToken;
