//! Random access to the content of a large file.

use std::io;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _};

/// Content which can be read one part at a time.
///
/// Parts may be read more than once (when an upload is retried) and, when
/// uploading concurrently, in any order.
#[async_trait::async_trait]
pub trait PartSource: Send + Sync {
    /// Total size of the content in bytes.
    fn size(&self) -> u64;

    /// Read `length` bytes starting at `offset`.
    async fn read_range(&self, offset: u64, length: u64) -> io::Result<Bytes>;
}

#[async_trait::async_trait]
impl PartSource for Bytes {
    fn size(&self) -> u64 {
        self.len() as u64
    }

    async fn read_range(&self, offset: u64, length: u64) -> io::Result<Bytes> {
        let start = usize::try_from(offset).map_err(io::Error::other)?;
        let end = usize::try_from(offset + length).map_err(io::Error::other)?;

        if end > self.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("range {start}..{end} is past the end of {} bytes", self.len()),
            ));
        }

        Ok(self.slice(start..end))
    }
}

/// Content read from a file on disk.
///
/// The file is opened for each part, so parts can be read concurrently.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: Utf8PathBuf,
    size: u64,
}

impl FileSource {
    /// Use the file at `path`, recording its current size.
    pub async fn open(path: impl AsRef<Utf8Path>) -> io::Result<Self> {
        let path = path.as_ref().to_owned();
        let size = tokio::fs::metadata(&path).await?.len();
        Ok(Self { path, size })
    }

    /// The path of the file.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl PartSource for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    #[tracing::instrument(level = "trace", skip(self), fields(path = %self.path))]
    async fn read_range(&self, offset: u64, length: u64) -> io::Result<Bytes> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(io::SeekFrom::Start(offset)).await?;

        let capacity = usize::try_from(length).map_err(io::Error::other)?;
        let mut buffer = Vec::with_capacity(capacity);
        file.take(length).read_to_end(&mut buffer).await?;

        Ok(buffer.into())
    }
}
