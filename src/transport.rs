//! The HTTP capability the upload engine is written against.
//!
//! [`Transport`] keeps session and chunk logic decoupled from reqwest so the
//! drivers can be exercised against scripted responses.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use futures::future::BoxFuture;
use reqwest::header::{CONTENT_LENGTH, HeaderMap};
use reqwest::{Client, Method, StatusCode, redirect};
use tracing::{debug, warn};
use url::Url;

use crate::cancel::CancelSignal;
use crate::error::TransportError;
use crate::protocol;
use crate::retry::RetryPolicy;

/// Receives the cumulative number of body bytes handed to the connection.
pub type ByteProgress = Arc<dyn Fn(u64) + Send + Sync>;

const SUB_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(&'static str, String)>,
    pub body: Option<Bytes>,
}

impl TransportRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Value of the first header named `name` (case-insensitive).
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Sends one request and returns status + headers, or fails once retries
/// are exhausted. Implementations must abort promptly when `cancel` fires.
pub trait Transport: Send + Sync {
    fn send<'a>(
        &'a self,
        request: TransportRequest,
        cancel: &'a CancelSignal,
        progress: Option<ByteProgress>,
    ) -> BoxFuture<'a, Result<TransportResponse, TransportError>>;
}

/// Settings for [`HttpTransport`].
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    pub retry: RetryPolicy,
    pub timeout: Option<Duration>,
    /// Added to every request, e.g. `Authorization`.
    pub default_headers: HeaderMap,
    pub user_agent: Option<String>,
}

/// reqwest-backed [`Transport`] with retry and backoff.
pub struct HttpTransport {
    client: Client,
    retry: RetryPolicy,
}

impl HttpTransport {
    pub fn new(options: TransportOptions) -> Result<Self, TransportError> {
        // 308 is the protocol's "keep going" status, never a redirect to follow.
        let mut builder = Client::builder()
            .redirect(redirect::Policy::none())
            .default_headers(options.default_headers);
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(user_agent) = options.user_agent {
            builder = builder.user_agent(user_agent);
        }

        Ok(Self {
            client: builder.build()?,
            retry: options.retry,
        })
    }

    async fn send_with_retry(
        &self,
        request: TransportRequest,
        cancel: &CancelSignal,
        progress: Option<ByteProgress>,
    ) -> Result<TransportResponse, TransportError> {
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                result = self.send_once(&request, progress.clone()) => result,
            };

            let err = match result {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };

            let retryable = match &err {
                TransportError::Request(e) => RetryPolicy::is_retryable_error(e),
                TransportError::Status { status, .. } => RetryPolicy::is_retryable_status(*status),
                TransportError::Cancelled => false,
            };
            if !retryable || attempt >= self.retry.max_attempts {
                return Err(err);
            }

            let delay = self.retry.delay_for_attempt(attempt);
            warn!(
                method = %request.method,
                url = %request.url,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying request: {err}"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    async fn send_once(
        &self,
        request: &TransportRequest,
        progress: Option<ByteProgress>,
    ) -> Result<TransportResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }

        match (&request.body, progress) {
            (Some(body), Some(progress)) => {
                builder = builder
                    .header(CONTENT_LENGTH, body.len())
                    .body(reqwest::Body::wrap_stream(progress_stream(body.clone(), progress)));
            }
            (Some(body), None) => builder = builder.body(body.clone()),
            (None, _) => builder = builder.header(CONTENT_LENGTH, 0),
        }

        let response = builder.send().await?;
        let status = response.status();
        debug!(method = %request.method, url = %request.url, status = status.as_u16(), "response");

        if !protocol::is_accepted_status(status.as_u16()) {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status { status, body });
        }

        Ok(TransportResponse {
            status,
            headers: response.headers().clone(),
        })
    }
}

impl Transport for HttpTransport {
    fn send<'a>(
        &'a self,
        request: TransportRequest,
        cancel: &'a CancelSignal,
        progress: Option<ByteProgress>,
    ) -> BoxFuture<'a, Result<TransportResponse, TransportError>> {
        Box::pin(self.send_with_retry(request, cancel, progress))
    }
}

/// Splits `body` into sub-chunks and reports the running total as each is
/// handed to the connection.
fn progress_stream(
    body: Bytes,
    progress: ByteProgress,
) -> impl futures::Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
    let pieces: Vec<Bytes> = (0..body.len())
        .step_by(SUB_CHUNK_SIZE)
        .map(|start| body.slice(start..(start + SUB_CHUNK_SIZE).min(body.len())))
        .collect();

    let mut sent = 0u64;
    futures::stream::iter(pieces).map(move |piece| {
        sent += piece.len() as u64;
        progress(sent);
        Ok(piece)
    })
}
