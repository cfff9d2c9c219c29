//! Scripted [`Transport`] for unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use futures::future::BoxFuture;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::cancel::CancelSignal;
use crate::error::TransportError;
use crate::transport::{ByteProgress, Transport, TransportRequest, TransportResponse};

type SendHook = Box<dyn Fn(usize) + Send + Sync>;

/// Records every request and replays queued responses in order.
#[derive(Default)]
pub(crate) struct MockTransport {
    responses: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
    requests: Mutex<Vec<TransportRequest>>,
    on_send: Mutex<Option<SendHook>>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, response: TransportResponse) {
        self.responses.lock().unwrap().push_back(Ok(response));
    }

    pub(crate) fn push_status_error(&self, status: StatusCode) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Err(TransportError::Status {
                status,
                body: String::new(),
            }));
    }

    /// Queues a chunk response acknowledging the first `acked` bytes.
    pub(crate) fn push_ack(&self, acked: u64) {
        self.push(ack(acked));
    }

    /// Runs `hook` with the index of each request as it is sent.
    pub(crate) fn on_send(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        *self.on_send.lock().unwrap() = Some(Box::new(hook));
    }

    pub(crate) fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// `Content-Range` of every request that carried a body.
    pub(crate) fn chunk_ranges(&self) -> Vec<String> {
        self.requests()
            .iter()
            .filter(|r| r.body.as_ref().is_some_and(|b| !b.is_empty()))
            .filter_map(|r| r.header_value("content-range").map(str::to_string))
            .collect()
    }
}

impl Transport for MockTransport {
    fn send<'a>(
        &'a self,
        request: TransportRequest,
        cancel: &'a CancelSignal,
        progress: Option<ByteProgress>,
    ) -> BoxFuture<'a, Result<TransportResponse, TransportError>> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }

            if let (Some(progress), Some(body)) = (progress, request.body.as_ref()) {
                let len = body.len() as u64;
                progress(len / 2);
                progress(len);
            }

            let index = {
                let mut requests = self.requests.lock().unwrap();
                requests.push(request);
                requests.len() - 1
            };
            if let Some(hook) = self.on_send.lock().unwrap().as_ref() {
                hook(index);
            }

            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }

            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Err(TransportError::Status {
                        status: StatusCode::INTERNAL_SERVER_ERROR,
                        body: "no scripted response".to_string(),
                    })
                })
        })
    }
}

pub(crate) fn response(status: StatusCode, headers: &[(&str, &str)]) -> TransportResponse {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    TransportResponse {
        status,
        headers: map,
    }
}

/// 308 with `Range: bytes=0-(acked-1)`, or no range at all for zero.
pub(crate) fn ack(acked: u64) -> TransportResponse {
    if acked == 0 {
        response(StatusCode::PERMANENT_REDIRECT, &[])
    } else {
        let range = format!("bytes=0-{}", acked - 1);
        response(StatusCode::PERMANENT_REDIRECT, &[("range", range.as_str())])
    }
}
