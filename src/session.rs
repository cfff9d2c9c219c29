//! Session creation and resume-offset discovery.

use reqwest::Method;
use tracing::debug;
use url::Url;

use crate::cancel::CancelSignal;
use crate::error::{Phase, PhaseExt};
use crate::metadata::UploadMetadata;
use crate::protocol;
use crate::transport::{Transport, TransportRequest};
use crate::{Result, UploadError};

/// A server-issued upload session and the bytes it has confirmed so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub url: Url,
    pub acked_bytes: u64,
}

/// Opens a new session at `endpoint` for the described payload.
pub async fn create_session(
    transport: &dyn Transport,
    endpoint: &Url,
    metadata: &UploadMetadata,
    cancel: &CancelSignal,
) -> Result<Session> {
    async {
        cancel.check()?;
        let body = serde_json::to_vec(metadata)?;
        let request = TransportRequest::new(Method::POST, endpoint.clone())
            .header(protocol::UPLOAD_CONTENT_LENGTH, metadata.size.to_string())
            .header(protocol::UPLOAD_CONTENT_TYPE, metadata.content_type())
            .header("content-type", protocol::JSON)
            .body(body);

        let response = transport.send(request, cancel, None).await?;

        let location = response
            .headers
            .get(protocol::LOCATION)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| UploadError::Protocol("response has no Location header".to_string()))?;
        // Location may be relative to the endpoint.
        let url = endpoint.join(location)?;
        let acked_bytes = protocol::parse_received_range(&response.headers)?.unwrap_or(0);

        debug!(session = %url, acked_bytes, size = metadata.size, "session created");
        Ok::<_, UploadError>(Session { url, acked_bytes })
    }
    .await
    .phase(Phase::SessionCreation)
}

/// Asks the server how many bytes of `session_url` it has received.
///
/// `total` is declared in the probe when known; absence of a range in the
/// reply means nothing has been received.
pub async fn query_status(
    transport: &dyn Transport,
    session_url: &Url,
    total: Option<u64>,
    cancel: &CancelSignal,
) -> Result<u64> {
    async {
        cancel.check()?;
        let request = TransportRequest::new(Method::PUT, session_url.clone())
            .header("content-type", protocol::OCTET_STREAM)
            .header(
                protocol::CONTENT_RANGE,
                protocol::content_range_for_status(total),
            );

        let response = transport.send(request, cancel, None).await?;
        let acked_bytes = protocol::parse_received_range(&response.headers)?.unwrap_or(0);

        debug!(session = %session_url, acked_bytes, "status queried");
        Ok::<_, UploadError>(acked_bytes)
    }
    .await
    .phase(Phase::StatusQuery)
}
