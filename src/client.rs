use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::stream::BoxStream;
use reqwest::Method;
use reqwest::header::HeaderMap;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::cancel::{AbortHandle, CancelSignal};
use crate::chunk::ProgressFn;
use crate::driver::{self, Transfer};
use crate::error::{Phase, PhaseExt};
use crate::metadata::UploadMetadata;
use crate::protocol;
use crate::retry::RetryPolicy;
use crate::session::{self, Session};
use crate::source::{PullSource, UploadSource};
use crate::transport::{HttpTransport, Transport, TransportOptions, TransportRequest};
use crate::{Result, UploadError};

const MEGABYTE: u64 = 1024 * 1024; // 1MB
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * MEGABYTE;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bytes per chunk request. `0` falls back to [`DEFAULT_CHUNK_SIZE`].
    pub chunk_size: u64,
    pub retry: RetryPolicy,
    pub request_timeout: Option<Duration>,
    /// Sent with every request, e.g. `Authorization`.
    pub default_headers: HeaderMap,
    pub user_agent: Option<String>,
    /// When false, file-path sources are refused before any request is made.
    pub allow_filesystem: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry: RetryPolicy::default(),
            request_timeout: None,
            default_headers: HeaderMap::new(),
            user_agent: Some(concat!("rupload/", env!("CARGO_PKG_VERSION")).to_string()),
            allow_filesystem: true,
        }
    }
}

impl ClientConfig {
    fn effective_chunk_size(&self) -> u64 {
        if self.chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            self.chunk_size
        }
    }

    fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            retry: self.retry.clone(),
            timeout: self.request_timeout,
            default_headers: self.default_headers.clone(),
            user_agent: self.user_agent.clone(),
        }
    }
}

/// Per-call cancellation and progress reporting.
#[derive(Clone, Default)]
pub struct CallOptions {
    pub cancel: Option<CancellationToken>,
    pub progress: Option<ProgressFn>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_progress(mut self, progress: impl Fn(f64) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(progress));
        self
    }
}

/// How an upload call ended. Cancellation is an outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Completed { session: Url },
    /// `session` is `None` when cancelled before the session existed.
    Cancelled { session: Option<Url> },
}

impl UploadOutcome {
    pub fn session(&self) -> Option<&Url> {
        match self {
            UploadOutcome::Completed { session } => Some(session),
            UploadOutcome::Cancelled { session } => session.as_ref(),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, UploadOutcome::Completed { .. })
    }
}

#[derive(Debug)]
pub enum UploadEvent {
    Progress(f64),
    Complete(UploadOutcome),
}

enum Target<'a> {
    Create(&'a Url),
    Resume(&'a Url),
}

pub struct UploadClient {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    abort: AbortHandle,
}

impl UploadClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport = HttpTransport::new(config.transport_options())?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            config,
            abort: AbortHandle::new(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Cancels every call in flight on this client. Later calls are unaffected.
    pub fn abort(&self) {
        info!("aborting all uploads");
        self.abort.abort();
    }

    /// A handle that can abort this client's calls from elsewhere, e.g. a signal handler.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    fn signal(&self, options: &CallOptions) -> CancelSignal {
        self.abort.signal(options.cancel.clone())
    }

    pub async fn create_upload(
        &self,
        endpoint: &Url,
        metadata: &UploadMetadata,
        options: &CallOptions,
    ) -> Result<Session> {
        let cancel = self.signal(options);
        session::create_session(self.transport.as_ref(), endpoint, metadata, &cancel).await
    }

    /// Bytes of `session_url` the server has received.
    pub async fn get_upload_status(
        &self,
        session_url: &Url,
        metadata: Option<&UploadMetadata>,
        options: &CallOptions,
    ) -> Result<u64> {
        let cancel = self.signal(options);
        session::query_status(
            self.transport.as_ref(),
            session_url,
            metadata.map(|m| m.size),
            &cancel,
        )
        .await
    }

    /// Creates a session at `endpoint` and uploads `source` into it.
    pub async fn upload(
        &self,
        endpoint: &Url,
        metadata: &UploadMetadata,
        source: UploadSource,
        options: &CallOptions,
    ) -> Result<UploadOutcome> {
        self.check_environment(&source)?;
        let cancel = self.signal(options);

        let session =
            match session::create_session(self.transport.as_ref(), endpoint, metadata, &cancel)
                .await
            {
                Ok(session) => session,
                Err(err) if err.is_cancelled() => {
                    info!("upload cancelled before a session was created");
                    return Ok(UploadOutcome::Cancelled { session: None });
                }
                Err(err) => return Err(err),
            };

        // The creation response already carries the authoritative offset.
        let result = self
            .drive(&session.url, metadata, source, session.acked_bytes, options, &cancel)
            .await;
        finish(result, session.url)
    }

    /// Continues an existing session from the offset the server reports.
    pub async fn resume_upload(
        &self,
        session_url: &Url,
        metadata: &UploadMetadata,
        source: UploadSource,
        options: &CallOptions,
    ) -> Result<UploadOutcome> {
        self.check_environment(&source)?;
        let cancel = self.signal(options);

        let result = async {
            let start = session::query_status(
                self.transport.as_ref(),
                session_url,
                Some(metadata.size),
                &cancel,
            )
            .await?;
            debug!(session = %session_url, start, "resuming");
            self.drive(session_url, metadata, source, start, options, &cancel)
                .await
        }
        .await;
        finish(result, session_url.clone())
    }

    /// Sends a partial metadata object to the session.
    pub async fn update_upload(
        &self,
        session_url: &Url,
        patch: &Map<String, Value>,
        options: &CallOptions,
    ) -> Result<()> {
        let cancel = self.signal(options);
        async {
            let request = TransportRequest::new(Method::PATCH, session_url.clone())
                .header("content-type", protocol::JSON)
                .body(serde_json::to_vec(patch)?);
            self.transport.send(request, &cancel, None).await?;
            Ok::<_, UploadError>(())
        }
        .await
        .phase(Phase::MetadataUpdate)
    }

    pub async fn delete_upload(&self, session_url: &Url, options: &CallOptions) -> Result<()> {
        let cancel = self.signal(options);
        let request = TransportRequest::new(Method::DELETE, session_url.clone());
        self.transport
            .send(request, &cancel, None)
            .await
            .phase(Phase::SessionDeletion)?;
        info!(session = %session_url, "session deleted");
        Ok(())
    }

    /// Like [`upload`](Self::upload), but reports progress as a stream of events.
    pub fn upload_events<'a>(
        &'a self,
        endpoint: &'a Url,
        metadata: &'a UploadMetadata,
        source: UploadSource,
        cancel: Option<CancellationToken>,
    ) -> BoxStream<'a, Result<UploadEvent>> {
        self.events(Target::Create(endpoint), metadata, source, cancel)
    }

    /// Like [`resume_upload`](Self::resume_upload), but reports progress as a stream of events.
    pub fn resume_events<'a>(
        &'a self,
        session_url: &'a Url,
        metadata: &'a UploadMetadata,
        source: UploadSource,
        cancel: Option<CancellationToken>,
    ) -> BoxStream<'a, Result<UploadEvent>> {
        self.events(Target::Resume(session_url), metadata, source, cancel)
    }

    fn events<'a>(
        &'a self,
        target: Target<'a>,
        metadata: &'a UploadMetadata,
        source: UploadSource,
        cancel: Option<CancellationToken>,
    ) -> BoxStream<'a, Result<UploadEvent>> {
        let stream = async_stream::try_stream! {
            yield UploadEvent::Progress(0.0);

            let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<f64>();
            let options = CallOptions {
                cancel,
                progress: Some(Arc::new(move |value| {
                    let _ = progress_tx.send(value);
                })),
            };

            let upload_fut = async {
                match target {
                    Target::Create(endpoint) => {
                        self.upload(endpoint, metadata, source, &options).await
                    }
                    Target::Resume(session_url) => {
                        self.resume_upload(session_url, metadata, source, &options).await
                    }
                }
            };
            tokio::pin!(upload_fut);

            let result: Result<UploadOutcome> = loop {
                tokio::select! {
                    biased;
                    result = &mut upload_fut => {
                        break result;
                    }
                    Some(value) = progress_rx.recv() => {
                        yield UploadEvent::Progress(value);
                    }
                }
            };
            while let Ok(value) = progress_rx.try_recv() {
                yield UploadEvent::Progress(value);
            }

            yield UploadEvent::Complete(result?);
        };

        Box::pin(stream)
    }

    fn check_environment(&self, source: &UploadSource) -> Result<()> {
        match source {
            UploadSource::File(path) if !self.config.allow_filesystem => {
                Err(UploadError::Environment(format!(
                    "filesystem access is disabled; cannot read {}",
                    path.display()
                )))
            }
            _ => Ok(()),
        }
    }

    async fn drive(
        &self,
        session_url: &Url,
        metadata: &UploadMetadata,
        source: UploadSource,
        start: u64,
        options: &CallOptions,
        cancel: &CancelSignal,
    ) -> Result<u64> {
        let progress = options.progress.clone().map(monotonic);
        let transfer = Transfer {
            transport: self.transport.as_ref(),
            session_url,
            total: metadata.size,
            chunk_size: self.config.effective_chunk_size(),
            progress: progress.as_ref(),
            cancel,
        };
        debug!(
            session = %session_url,
            source = source.kind(),
            start,
            total = metadata.size,
            chunk_size = transfer.chunk_size,
            "starting transfer"
        );
        transfer.report(start);

        match source {
            UploadSource::Buffer(data) => {
                driver::drive_pull(&transfer, &PullSource::Buffer(&data), start).await
            }
            UploadSource::Blob(blob) => {
                driver::drive_pull(&transfer, &PullSource::Blob(blob.as_ref()), start).await
            }
            UploadSource::File(path) => {
                driver::drive_pull(&transfer, &PullSource::File(&path), start).await
            }
            UploadSource::Stream(stream) => driver::drive_stream(&transfer, stream, start).await,
        }
    }
}

/// Wraps `progress` so a value below the highest one reported so far is
/// replaced by that highest value.
fn monotonic(progress: ProgressFn) -> ProgressFn {
    let highest = AtomicU64::new(0);
    Arc::new(move |value: f64| {
        // Non-negative floats order the same as their bit patterns.
        let bits = value.clamp(0.0, 1.0).to_bits();
        let previous = highest.fetch_max(bits, Ordering::Relaxed);
        progress(f64::from_bits(previous.max(bits)));
    })
}

fn finish(result: Result<u64>, session: Url) -> Result<UploadOutcome> {
    match result {
        Ok(bytes) => {
            info!(session = %session, bytes, "upload complete");
            Ok(UploadOutcome::Completed { session })
        }
        Err(err) if err.is_cancelled() => {
            info!(session = %session, "upload cancelled");
            Ok(UploadOutcome::Cancelled {
                session: Some(session),
            })
        }
        Err(err) => Err(err),
    }
}
