//! Sequential chunk loops, one per source shape.
//!
//! Exactly one chunk is in flight at a time. After every chunk the position is
//! re-derived from the server's acknowledgement: bytes the server reports
//! beyond the chunk are skipped, bytes it did not confirm are sent again.

use bytes::{Buf, Bytes, BytesMut};
use futures::StreamExt;
use tracing::{debug, trace, warn};
use url::Url;

use crate::cancel::CancelSignal;
use crate::chunk::{self, ChunkBounds, ProgressFn, fraction};
use crate::error::{Phase, PhaseExt};
use crate::source::{ByteStream, PullSource};
use crate::transport::Transport;
use crate::{Result, UploadError};

/// Consecutive chunk responses without progress tolerated before giving up.
pub const MAX_STALLED_CHUNKS: u32 = 3;

/// Everything one transfer needs besides its source.
pub(crate) struct Transfer<'a> {
    pub transport: &'a dyn Transport,
    pub session_url: &'a Url,
    pub total: u64,
    pub chunk_size: u64,
    pub progress: Option<&'a ProgressFn>,
    pub cancel: &'a CancelSignal,
}

impl Transfer<'_> {
    async fn send(&self, data: Bytes, bounds: ChunkBounds) -> Result<Option<u64>> {
        chunk::send_chunk(
            self.transport,
            self.session_url,
            data,
            bounds,
            self.total,
            self.progress,
            self.cancel,
        )
        .await
    }

    pub(crate) fn report(&self, position: u64) {
        if let Some(progress) = self.progress {
            progress(fraction(position, 0, self.total));
        }
    }
}

/// Bytes confirmed by the server, plus the no-progress counter.
#[derive(Debug)]
struct Cursor {
    position: u64,
    stalled: u32,
}

impl Cursor {
    fn new(position: u64) -> Self {
        Self {
            position,
            stalled: 0,
        }
    }

    /// Moves to the offset the server acknowledged, which may lie behind
    /// `bounds.start`. A reply without a range header resends the chunk.
    fn reconcile(&mut self, bounds: ChunkBounds, acked: Option<u64>) -> Result<u64> {
        let next = match acked {
            Some(acked) if acked < bounds.start => {
                warn!(
                    start = bounds.start,
                    acked,
                    "server confirmed fewer bytes than before this chunk; rewinding"
                );
                acked
            }
            Some(acked) if acked < bounds.end => {
                warn!(
                    start = bounds.start,
                    end = bounds.end,
                    acked,
                    "server confirmed less than was sent; resending tail"
                );
                acked
            }
            Some(acked) => {
                if acked > bounds.end {
                    debug!(end = bounds.end, acked, "server is ahead of the sent range");
                }
                acked
            }
            None => {
                warn!(
                    start = bounds.start,
                    end = bounds.end,
                    "chunk response carried no range; resending chunk"
                );
                bounds.start
            }
        };

        if next > bounds.start {
            self.stalled = 0;
        } else {
            self.stalled += 1;
            if self.stalled >= MAX_STALLED_CHUNKS {
                return Err(UploadError::Protocol(format!(
                    "server confirmed no bytes past {} after {} attempts",
                    bounds.start, self.stalled
                )));
            }
        }

        self.position = next;
        Ok(next)
    }
}

/// Drives a buffer, blob or file from `start` until `total` is confirmed.
pub(crate) async fn drive_pull(
    transfer: &Transfer<'_>,
    source: &PullSource<'_>,
    start: u64,
) -> Result<u64> {
    source.check_len(transfer.total).phase(Phase::ChunkUpload)?;

    let mut cursor = Cursor::new(start);
    while let Some(bounds) = ChunkBounds::at(cursor.position, transfer.chunk_size, transfer.total)
    {
        transfer.cancel.check()?;
        let data = source.slice(bounds).await.phase(Phase::ChunkUpload)?;
        transfer.cancel.check()?;

        let acked = transfer.send(data, bounds).await?;
        cursor
            .reconcile(bounds, acked)
            .phase(Phase::ChunkUpload)?;
        transfer.report(cursor.position);
    }

    Ok(cursor.position.min(transfer.total))
}

/// States of the push-stream driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    /// Reading from the producer until a chunk's worth is buffered.
    WaitingData,
    /// A full chunk is buffered; the producer is not polled.
    ChunkReady,
    /// Everything left of the payload is buffered and shorter than a chunk.
    FlushTail,
    Done,
}

/// Bytes read from the stream and not yet confirmed by the server.
#[derive(Debug, Default)]
struct Accumulator {
    buf: BytesMut,
    /// Incoming bytes to drop before buffering resumes.
    skip: u64,
}

impl Accumulator {
    fn len(&self) -> u64 {
        self.buf.len() as u64
    }

    fn push(&mut self, mut data: Bytes) {
        if self.skip > 0 {
            let dropped = self.skip.min(data.len() as u64);
            data.advance(dropped as usize);
            self.skip -= dropped;
        }
        self.buf.extend_from_slice(&data);
    }

    fn take(&mut self, len: u64) -> Bytes {
        self.buf.split_to(len as usize).freeze()
    }

    /// Puts bytes the server did not confirm back in front of the buffer.
    fn unshift(&mut self, data: Bytes) {
        let mut buf = BytesMut::with_capacity(data.len() + self.buf.len());
        buf.extend_from_slice(&data);
        buf.extend_from_slice(&self.buf);
        self.buf = buf;
    }

    /// Drops `n` payload bytes, whether already buffered or still to arrive.
    fn discard(&mut self, n: u64) {
        let buffered = n.min(self.len());
        self.buf.advance(buffered as usize);
        self.skip += n - buffered;
    }
}

/// Drives a push stream from `start` until `total` is confirmed.
///
/// The stream always begins at payload byte 0; bytes below `start` are read
/// and dropped. The producer is only polled in [`StreamState::WaitingData`],
/// so at most about one chunk is buffered while a chunk is in flight.
pub(crate) async fn drive_stream(
    transfer: &Transfer<'_>,
    mut stream: ByteStream,
    start: u64,
) -> Result<u64> {
    let mut cursor = Cursor::new(start);
    let mut acc = Accumulator {
        skip: start,
        ..Accumulator::default()
    };
    let mut ended = false;
    let mut state = StreamState::WaitingData;

    loop {
        trace!(?state, position = cursor.position, buffered = acc.len(), "stream driver");
        state = match state {
            StreamState::WaitingData => {
                let remaining = transfer.total.saturating_sub(cursor.position);
                if remaining == 0 {
                    StreamState::Done
                } else if acc.len() >= transfer.chunk_size.min(remaining) {
                    if remaining <= transfer.chunk_size {
                        StreamState::FlushTail
                    } else {
                        StreamState::ChunkReady
                    }
                } else if ended {
                    return Err(UploadError::Source(format!(
                        "stream ended after {} of {} bytes",
                        cursor.position + acc.len(),
                        transfer.total
                    ))
                    .in_phase(Phase::ChunkUpload));
                } else {
                    let next = tokio::select! {
                        biased;
                        _ = transfer.cancel.cancelled() => return Err(UploadError::Cancelled),
                        next = stream.next() => next,
                    };
                    match next {
                        Some(Ok(data)) => acc.push(data),
                        Some(Err(err)) => {
                            return Err(UploadError::Io(err).in_phase(Phase::ChunkUpload));
                        }
                        None => ended = true,
                    }
                    StreamState::WaitingData
                }
            }
            StreamState::ChunkReady | StreamState::FlushTail => {
                // Cancellation between buffering and upload must stop the upload.
                transfer.cancel.check()?;

                let remaining = transfer.total - cursor.position;
                let len = acc.len().min(transfer.chunk_size).min(remaining);
                let bounds = ChunkBounds {
                    start: cursor.position,
                    end: cursor.position + len,
                };
                let data = acc.take(len);

                let acked = transfer.send(data.clone(), bounds).await?;
                // Bytes below the chunk start are gone from the stream.
                if let Some(acked) = acked.filter(|&acked| acked < bounds.start) {
                    return Err(UploadError::Protocol(format!(
                        "server confirmed {acked} bytes, behind offset {} the stream has moved past",
                        bounds.start
                    ))
                    .in_phase(Phase::ChunkUpload));
                }
                let next = cursor
                    .reconcile(bounds, acked)
                    .phase(Phase::ChunkUpload)?;
                if next < bounds.end {
                    acc.unshift(data.slice((next - bounds.start) as usize..));
                } else if next > bounds.end {
                    acc.discard(next - bounds.end);
                }
                transfer.report(cursor.position);
                StreamState::WaitingData
            }
            StreamState::Done => return Ok(cursor.position.min(transfer.total)),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use reqwest::StatusCode;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tokio_util::sync::CancellationToken;

    fn url() -> Url {
        Url::parse("https://uploads.example.com/s/1").unwrap()
    }

    fn payload(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
    }

    fn stream_of(data: Bytes, piece: usize) -> ByteStream {
        let pieces: Vec<io::Result<Bytes>> = (0..data.len())
            .step_by(piece)
            .map(|s| Ok(data.slice(s..(s + piece).min(data.len()))))
            .collect();
        Box::pin(futures::stream::iter(pieces))
    }

    fn transfer<'a>(
        mock: &'a MockTransport,
        url: &'a Url,
        total: u64,
        chunk_size: u64,
        cancel: &'a CancelSignal,
    ) -> Transfer<'a> {
        Transfer {
            transport: mock,
            session_url: url,
            total,
            chunk_size,
            progress: None,
            cancel,
        }
    }

    #[test]
    fn reconcile_rules() {
        let bounds = ChunkBounds { start: 100, end: 200 };

        let mut c = Cursor::new(100);
        assert_eq!(c.reconcile(bounds, Some(200)).unwrap(), 200);
        let mut c = Cursor::new(100);
        assert_eq!(c.reconcile(bounds, Some(150)).unwrap(), 150);
        let mut c = Cursor::new(100);
        assert_eq!(c.reconcile(bounds, Some(300)).unwrap(), 300);
        // An explicit short ack wins over the chunk start.
        let mut c = Cursor::new(100);
        assert_eq!(c.reconcile(bounds, Some(40)).unwrap(), 40);
        assert_eq!(c.stalled, 1);
        // No header: resend from the chunk start.
        let mut c = Cursor::new(100);
        assert_eq!(c.reconcile(bounds, None).unwrap(), 100);
        assert_eq!(c.stalled, 1);
    }

    #[test]
    fn reconcile_gives_up_after_stalls() {
        let bounds = ChunkBounds { start: 0, end: 10 };
        let mut c = Cursor::new(0);
        for _ in 1..MAX_STALLED_CHUNKS {
            c.reconcile(bounds, None).unwrap();
        }
        let err = c.reconcile(bounds, None).unwrap_err();
        assert!(matches!(err, UploadError::Protocol(_)));
    }

    #[test]
    fn accumulator_skip_and_unshift() {
        let mut acc = Accumulator {
            skip: 3,
            ..Accumulator::default()
        };
        acc.push(Bytes::from_static(b"ab"));
        acc.push(Bytes::from_static(b"cdef"));
        assert_eq!(&acc.buf[..], b"def");

        let taken = acc.take(2);
        assert_eq!(&taken[..], b"de");
        acc.unshift(taken.slice(1..));
        assert_eq!(&acc.buf[..], b"ef");

        acc.discard(4);
        assert!(acc.buf.is_empty());
        assert_eq!(acc.skip, 2);
    }

    #[tokio::test]
    async fn pull_sends_ceil_chunks() {
        let mock = MockTransport::new();
        for acked in [1000, 2000, 2500] {
            mock.push_ack(acked);
        }
        let data = payload(2500);
        let url = url();
        let cancel = CancelSignal::never();

        let done = drive_pull(
            &transfer(&mock, &url, 2500, 1000, &cancel),
            &PullSource::Buffer(&data),
            0,
        )
        .await
        .unwrap();

        assert_eq!(done, 2500);
        assert_eq!(
            mock.chunk_ranges(),
            vec!["bytes 0-999/2500", "bytes 1000-1999/2500", "bytes 2000-2499/2500"]
        );
    }

    #[tokio::test]
    async fn pull_resends_unconfirmed_tail() {
        let mock = MockTransport::new();
        mock.push_ack(600);
        mock.push_ack(1600);
        mock.push_ack(2000);
        let data = payload(2000);
        let url = url();
        let cancel = CancelSignal::never();

        drive_pull(
            &transfer(&mock, &url, 2000, 1000, &cancel),
            &PullSource::Buffer(&data),
            0,
        )
        .await
        .unwrap();

        let requests = mock.requests();
        assert_eq!(
            mock.chunk_ranges(),
            vec!["bytes 0-999/2000", "bytes 600-1599/2000", "bytes 1600-1999/2000"]
        );
        assert_eq!(requests[1].body.as_ref().unwrap(), &data.slice(600..1600));
    }

    #[tokio::test]
    async fn pull_rewinds_to_explicit_short_ack() {
        let mock = MockTransport::new();
        for acked in [1000, 500, 1500, 2000] {
            mock.push_ack(acked);
        }
        let data = payload(2000);
        let url = url();
        let cancel = CancelSignal::never();

        let done = drive_pull(
            &transfer(&mock, &url, 2000, 1000, &cancel),
            &PullSource::Buffer(&data),
            0,
        )
        .await
        .unwrap();

        assert_eq!(done, 2000);
        assert_eq!(
            mock.chunk_ranges(),
            vec![
                "bytes 0-999/2000",
                "bytes 1000-1999/2000",
                "bytes 500-1499/2000",
                "bytes 1500-1999/2000",
            ]
        );
        assert_eq!(mock.requests()[2].body.as_ref().unwrap(), &data.slice(500..1500));
    }

    #[tokio::test]
    async fn pull_resends_chunk_without_range_header() {
        let mock = MockTransport::new();
        mock.push_ack(1000);
        mock.push(crate::testing::response(StatusCode::PERMANENT_REDIRECT, &[]));
        mock.push_ack(2000);
        let data = payload(2000);
        let url = url();
        let cancel = CancelSignal::never();

        drive_pull(
            &transfer(&mock, &url, 2000, 1000, &cancel),
            &PullSource::Buffer(&data),
            0,
        )
        .await
        .unwrap();

        assert_eq!(
            mock.chunk_ranges(),
            vec!["bytes 0-999/2000", "bytes 1000-1999/2000", "bytes 1000-1999/2000"]
        );
    }

    #[tokio::test]
    async fn pull_skips_range_server_already_has() {
        let mock = MockTransport::new();
        mock.push_ack(1500);
        mock.push_ack(2000);
        let data = payload(2000);
        let url = url();
        let cancel = CancelSignal::never();

        drive_pull(
            &transfer(&mock, &url, 2000, 1000, &cancel),
            &PullSource::Buffer(&data),
            0,
        )
        .await
        .unwrap();

        assert_eq!(
            mock.chunk_ranges(),
            vec!["bytes 0-999/2000", "bytes 1500-1999/2000"]
        );
    }

    #[tokio::test]
    async fn pull_complete_is_noop() {
        let mock = MockTransport::new();
        let data = payload(10);
        let url = url();
        let cancel = CancelSignal::never();

        let done = drive_pull(
            &transfer(&mock, &url, 10, 4, &cancel),
            &PullSource::Buffer(&data),
            10,
        )
        .await
        .unwrap();
        assert_eq!(done, 10);
        assert!(mock.requests().is_empty());
    }

    #[tokio::test]
    async fn pull_stops_between_chunks_on_cancel() {
        let mock = Arc::new(MockTransport::new());
        mock.push_ack(4);
        mock.push_ack(8);
        let token = CancellationToken::new();
        mock.on_send({
            let token = token.clone();
            move |_| token.cancel()
        });
        // Cancelled while the first chunk is in flight; the second is never sent.
        let cancel = CancelSignal::new(CancellationToken::new(), Some(token));
        let data = payload(8);
        let url = url();

        let err = drive_pull(
            &transfer(&mock, &url, 8, 4, &cancel),
            &PullSource::Buffer(&data),
            0,
        )
        .await
        .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(mock.requests().len(), 1);
    }

    #[tokio::test]
    async fn stream_uploads_full_chunks_then_tail() {
        let mock = MockTransport::new();
        for acked in [1024, 2048, 2500] {
            mock.push_ack(acked);
        }
        let data = payload(2500);
        let url = url();
        let cancel = CancelSignal::never();

        let done = drive_stream(
            &transfer(&mock, &url, 2500, 1024, &cancel),
            stream_of(data.clone(), 300),
            0,
        )
        .await
        .unwrap();

        assert_eq!(done, 2500);
        assert_eq!(
            mock.chunk_ranges(),
            vec!["bytes 0-1023/2500", "bytes 1024-2047/2500", "bytes 2048-2499/2500"]
        );
        let sent: Vec<u8> = mock
            .requests()
            .iter()
            .flat_map(|r| r.body.clone().unwrap().to_vec())
            .collect();
        assert_eq!(sent, data.to_vec());
    }

    #[tokio::test]
    async fn stream_resumes_by_dropping_confirmed_prefix() {
        let mock = MockTransport::new();
        mock.push_ack(1536);
        mock.push_ack(2048);
        let data = payload(2048);
        let url = url();
        let cancel = CancelSignal::never();

        drive_stream(
            &transfer(&mock, &url, 2048, 1024, &cancel),
            stream_of(data.clone(), 100),
            512,
        )
        .await
        .unwrap();

        let requests = mock.requests();
        assert_eq!(
            mock.chunk_ranges(),
            vec!["bytes 512-1535/2048", "bytes 1536-2047/2048"]
        );
        assert_eq!(requests[0].body.as_ref().unwrap(), &data.slice(512..1536));
    }

    #[tokio::test]
    async fn stream_resends_unconfirmed_bytes() {
        let mock = MockTransport::new();
        mock.push_ack(700);
        mock.push_ack(1700);
        mock.push_ack(2000);
        let data = payload(2000);
        let url = url();
        let cancel = CancelSignal::never();

        drive_stream(
            &transfer(&mock, &url, 2000, 1000, &cancel),
            stream_of(data.clone(), 250),
            0,
        )
        .await
        .unwrap();

        let requests = mock.requests();
        assert_eq!(
            mock.chunk_ranges(),
            vec!["bytes 0-999/2000", "bytes 700-1699/2000", "bytes 1700-1999/2000"]
        );
        assert_eq!(requests[1].body.as_ref().unwrap(), &data.slice(700..1700));
        assert_eq!(requests[2].body.as_ref().unwrap(), &data.slice(1700..2000));
    }

    #[tokio::test]
    async fn stream_skips_bytes_server_is_ahead_on() {
        let mock = MockTransport::new();
        mock.push_ack(1200);
        mock.push_ack(2000);
        let data = payload(2000);
        let url = url();
        let cancel = CancelSignal::never();

        drive_stream(
            &transfer(&mock, &url, 2000, 1000, &cancel),
            stream_of(data.clone(), 64),
            0,
        )
        .await
        .unwrap();

        let requests = mock.requests();
        assert_eq!(
            mock.chunk_ranges(),
            vec!["bytes 0-999/2000", "bytes 1200-1999/2000"]
        );
        assert_eq!(requests[1].body.as_ref().unwrap(), &data.slice(1200..2000));
    }

    #[tokio::test]
    async fn stream_fails_when_ack_falls_behind_released_bytes() {
        let mock = MockTransport::new();
        mock.push_ack(1000);
        mock.push_ack(500);
        let data = payload(2000);
        let url = url();
        let cancel = CancelSignal::never();

        let err = drive_stream(
            &transfer(&mock, &url, 2000, 1000, &cancel),
            stream_of(data, 250),
            0,
        )
        .await
        .unwrap_err();

        assert_eq!(err.phase(), Some(Phase::ChunkUpload));
        assert!(matches!(err.root(), UploadError::Protocol(_)));
        assert!(err.to_string().contains("server confirmed 500 bytes"));
        assert_eq!(
            mock.chunk_ranges(),
            vec!["bytes 0-999/2000", "bytes 1000-1999/2000"]
        );
    }

    #[tokio::test]
    async fn stream_shorter_than_declared_fails() {
        let mock = MockTransport::new();
        mock.push_ack(100);
        let url = url();
        let cancel = CancelSignal::never();

        let err = drive_stream(
            &transfer(&mock, &url, 500, 100, &cancel),
            stream_of(payload(150), 50),
            0,
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            UploadError::Phase { phase: Phase::ChunkUpload, .. }
        ));
        assert!(err.to_string().contains("stream ended after 150 of 500 bytes"));
        assert_eq!(mock.requests().len(), 1);
    }

    #[tokio::test]
    async fn stream_error_is_terminal() {
        let mock = MockTransport::new();
        let url = url();
        let cancel = CancelSignal::never();
        let stream: ByteStream = Box::pin(futures::stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Err(io::Error::other("disk unplugged")),
        ]));

        let err = drive_stream(&transfer(&mock, &url, 10, 4, &cancel), stream, 0)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disk unplugged"));
        assert!(mock.requests().is_empty());
    }

    #[tokio::test]
    async fn stream_cancel_before_upload_sends_nothing() {
        let mock = MockTransport::new();
        let url = url();
        let token = CancellationToken::new();
        let cancel = CancelSignal::new(token.clone(), None);

        let cancel_after_first = {
            let token = token.clone();
            futures::stream::iter(vec![Ok::<_, io::Error>(payload(8))]).inspect(move |_| token.cancel())
        };

        let err = drive_stream(
            &transfer(&mock, &url, 8, 8, &cancel),
            Box::pin(cancel_after_first),
            0,
        )
        .await
        .unwrap_err();
        assert!(err.is_cancelled());
        assert!(mock.requests().is_empty());
    }

    #[tokio::test]
    async fn stream_pauses_producer_while_chunk_in_flight() {
        let mock = Arc::new(MockTransport::new());
        mock.push_ack(4);
        mock.push_ack(8);

        let (writer, source) = crate::UploadSource::channel(1);
        let crate::UploadSource::Stream(stream) = source else {
            unreachable!()
        };

        let written = Arc::new(Mutex::new(0usize));
        let observed = Arc::new(Mutex::new(Vec::new()));
        mock.on_send({
            let written = written.clone();
            let observed = observed.clone();
            move |_| observed.lock().unwrap().push(*written.lock().unwrap())
        });

        let producer = tokio::spawn({
            let written = written.clone();
            async move {
                for piece in [b"ab", b"cd", b"ef", b"gh"] {
                    writer.write(Bytes::from_static(piece)).await.unwrap();
                    *written.lock().unwrap() += 1;
                }
                writer.finish();
            }
        });

        let url = url();
        let cancel = CancelSignal::never();
        let done = drive_stream(&transfer(&mock, &url, 8, 4, &cancel), stream, 0)
            .await
            .unwrap();
        producer.await.unwrap();

        assert_eq!(done, 8);
        // With a one-slot channel the producer is at most one piece ahead of
        // the two pieces that make up the first chunk.
        assert!(observed.lock().unwrap()[0] <= 3);
        assert_eq!(mock.chunk_ranges(), vec!["bytes 0-3/8", "bytes 4-7/8"]);
    }
}
