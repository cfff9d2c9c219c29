//! The four payload shapes an upload can be driven from.

use std::fmt;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{Mutex, mpsc};

use crate::chunk::ChunkBounds;
use crate::{Result, UploadError};

/// A push-based byte stream. Items are consumed in order starting at payload byte 0.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// A random-access payload that can hand out arbitrary byte ranges.
pub trait Blob: Send + Sync {
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads `[start, end)`.
    fn slice(&self, start: u64, end: u64) -> BoxFuture<'_, io::Result<Bytes>>;
}

/// A [`Blob`] over an already-open file handle.
pub struct FileBlob {
    file: Mutex<File>,
    len: u64,
}

impl FileBlob {
    pub async fn new(file: File) -> io::Result<Self> {
        let len = file.metadata().await?.len();
        Ok(Self {
            file: Mutex::new(file),
            len,
        })
    }

    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::new(File::open(path).await?).await
    }
}

impl Blob for FileBlob {
    fn len(&self) -> u64 {
        self.len
    }

    fn slice(&self, start: u64, end: u64) -> BoxFuture<'_, io::Result<Bytes>> {
        Box::pin(async move {
            let mut file = self.file.lock().await;
            read_range(&mut file, start, end).await
        })
    }
}

async fn read_range(file: &mut File, start: u64, end: u64) -> io::Result<Bytes> {
    file.seek(SeekFrom::Start(start)).await?;
    let mut buf = vec![0u8; (end - start) as usize];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// Payload handed to [`UploadClient::upload`](crate::UploadClient::upload).
pub enum UploadSource {
    /// In-memory bytes.
    Buffer(Bytes),
    /// A sliceable handle.
    Blob(Arc<dyn Blob>),
    /// A push stream; buffered one chunk at a time.
    Stream(ByteStream),
    /// A file on disk, opened once per chunk.
    File(PathBuf),
}

impl UploadSource {
    pub fn buffer(data: impl Into<Bytes>) -> Self {
        UploadSource::Buffer(data.into())
    }

    pub fn blob(blob: impl Blob + 'static) -> Self {
        UploadSource::Blob(Arc::new(blob))
    }

    pub fn stream<S>(stream: S) -> Self
    where
        S: futures::Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        UploadSource::Stream(Box::pin(stream))
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        UploadSource::File(path.into())
    }

    /// A stream source fed through a bounded channel. The returned writer
    /// suspends while `capacity` items are queued, which is what pauses the
    /// producer while a chunk is in flight.
    pub fn channel(capacity: usize) -> (StreamWriter, Self) {
        let (tx, mut rx) = mpsc::channel::<io::Result<Bytes>>(capacity.max(1));
        let stream = async_stream::stream! {
            while let Some(item) = rx.recv().await {
                yield item;
            }
        };
        (StreamWriter { tx }, UploadSource::stream(stream))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UploadSource::Buffer(_) => "buffer",
            UploadSource::Blob(_) => "blob",
            UploadSource::Stream(_) => "stream",
            UploadSource::File(_) => "file",
        }
    }
}

impl fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadSource::Buffer(b) => write!(f, "Buffer({} bytes)", b.len()),
            UploadSource::Blob(b) => write!(f, "Blob({} bytes)", b.len()),
            UploadSource::Stream(_) => write!(f, "Stream"),
            UploadSource::File(p) => write!(f, "File({})", p.display()),
        }
    }
}

/// Producer half of [`UploadSource::channel`].
pub struct StreamWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl StreamWriter {
    /// Pushes bytes, waiting while the upload side is busy.
    ///
    /// Fails with `BrokenPipe` once the upload has stopped reading.
    pub async fn write(&self, data: impl Into<Bytes>) -> io::Result<()> {
        self.tx
            .send(Ok(data.into()))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "upload is no longer reading"))
    }

    /// Terminates the stream with an error.
    pub async fn fail(self, err: io::Error) {
        let _ = self.tx.send(Err(err)).await;
    }

    /// Ends the stream.
    pub fn finish(self) {}
}

/// The pull-based shapes, borrowed for the duration of one transfer.
pub(crate) enum PullSource<'a> {
    Buffer(&'a Bytes),
    Blob(&'a dyn Blob),
    File(&'a Path),
}

impl PullSource<'_> {
    /// Fails when the source holds fewer than `total` bytes.
    pub(crate) fn check_len(&self, total: u64) -> Result<()> {
        let len = match self {
            PullSource::Buffer(b) => b.len() as u64,
            PullSource::Blob(b) => b.len(),
            // The file is re-read per chunk; a short file fails on that chunk.
            PullSource::File(_) => return Ok(()),
        };
        if len < total {
            return Err(UploadError::Source(format!(
                "source holds {len} bytes but {total} were declared"
            )));
        }
        Ok(())
    }

    pub(crate) async fn slice(&self, bounds: ChunkBounds) -> Result<Bytes> {
        match self {
            PullSource::Buffer(b) => Ok(b.slice(bounds.start as usize..bounds.end as usize)),
            PullSource::Blob(b) => Ok(b.slice(bounds.start, bounds.end).await?),
            PullSource::File(path) => {
                // Only this chunk's read window holds the descriptor.
                let mut file = File::open(path).await?;
                Ok(read_range(&mut file, bounds.start, bounds.end).await?)
            }
        }
    }
}
