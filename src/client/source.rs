//! Byte sources the driver can upload.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

/// Outgoing request body.
pub type SourceStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + Sync>>;

/// Something with a known length that can be streamed from any offset.
pub trait UploadSource: Send + Sync {
    /// Total number of bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stream the bytes from `offset` to the end.
    fn stream_from(
        &self,
        offset: u64,
    ) -> Pin<Box<dyn Future<Output = io::Result<SourceStream>> + Send + '_>>;
}

fn check_offset(offset: u64, len: u64) -> io::Result<()> {
    if offset > len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("offset {offset} is past the end of the source ({len} bytes)"),
        ));
    }
    Ok(())
}

/// A local file, reopened for every request.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    len: u64,
}

impl FileSource {
    /// Open `path` and record its current length.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let len = tokio::fs::metadata(&path).await?.len();
        Ok(Self { path, len })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl UploadSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn stream_from(
        &self,
        offset: u64,
    ) -> Pin<Box<dyn Future<Output = io::Result<SourceStream>> + Send + '_>> {
        Box::pin(async move {
            check_offset(offset, self.len)?;
            let mut file = tokio::fs::File::open(&self.path).await?;
            file.seek(io::SeekFrom::Start(offset)).await?;
            // Stop at the length seen at open time even if the file grows.
            let stream: SourceStream = Box::pin(ReaderStream::new(file.take(self.len - offset)));
            Ok(stream)
        })
    }
}

impl UploadSource for Bytes {
    fn len(&self) -> u64 {
        Bytes::len(self) as u64
    }

    fn stream_from(
        &self,
        offset: u64,
    ) -> Pin<Box<dyn Future<Output = io::Result<SourceStream>> + Send + '_>> {
        Box::pin(async move {
            check_offset(offset, UploadSource::len(self))?;
            let rest = self.slice(offset as usize..);
            let stream: SourceStream = Box::pin(futures_util::stream::iter([Ok(rest)]));
            Ok(stream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;

    async fn collect(stream: SourceStream) -> Vec<u8> {
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
        chunks.concat()
    }

    #[tokio::test]
    async fn test_file_source_from_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.txt");
        tokio::fs::write(&path, b"Hello, World!").await.unwrap();

        let source = FileSource::open(&path).await.unwrap();
        assert_eq!(source.len(), 13);
        assert_eq!(collect(source.stream_from(0).await.unwrap()).await, b"Hello, World!");
        assert_eq!(collect(source.stream_from(7).await.unwrap()).await, b"World!");
        assert!(collect(source.stream_from(13).await.unwrap()).await.is_empty());
        assert!(source.stream_from(14).await.is_err());
    }

    #[tokio::test]
    async fn test_file_source_ignores_growth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.txt");
        tokio::fs::write(&path, b"abc").await.unwrap();
        let source = FileSource::open(&path).await.unwrap();
        tokio::fs::write(&path, b"abcdef").await.unwrap();
        assert_eq!(collect(source.stream_from(1).await.unwrap()).await, b"bc");
    }

    #[tokio::test]
    async fn test_bytes_source() {
        let source = Bytes::from_static(b"Hello, World!");
        assert_eq!(UploadSource::len(&source), 13);
        assert_eq!(collect(source.stream_from(7).await.unwrap()).await, b"World!");
        assert!(source.stream_from(20).await.is_err());
    }
}
