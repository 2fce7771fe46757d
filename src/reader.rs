use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::stream::{self, Iter};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio_util::io::StreamReader;

type ChunkStream = Iter<std::vec::IntoIter<io::Result<Bytes>>>;

/// A file's plaintext, stitched together from chunk handles in plan order.
///
/// Holds shared handles onto the stored chunks. Dropping the reader releases
/// all of them, whether or not it was read to the end.
pub struct ComposedReader {
    len: u64,
    chunks: usize,
    inner: StreamReader<ChunkStream, Bytes>,
}

impl ComposedReader {
    pub fn new(chunks: Vec<Bytes>) -> Self {
        let len = chunks.iter().map(|chunk| chunk.len() as u64).sum();
        let count = chunks.len();
        let chunks: Vec<_> = chunks.into_iter().map(Ok).collect();
        Self {
            len,
            chunks: count,
            inner: StreamReader::new(stream::iter(chunks)),
        }
    }

    /// Total plaintext length.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks
    }

    pub async fn read_to_vec(&mut self) -> io::Result<Vec<u8>> {
        let mut contents = Vec::with_capacity(self.len as usize);
        self.read_to_end(&mut contents).await?;
        Ok(contents)
    }
}

impl AsyncRead for ComposedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl std::fmt::Debug for ComposedReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComposedReader")
            .field("len", &self.len)
            .field("chunks", &self.chunks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn concatenates_in_order() {
        let mut reader = ComposedReader::new(vec![
            Bytes::from_static(b"hello"),
            Bytes::new(),
            Bytes::from_static(b", "),
            Bytes::from_static(b"world"),
        ]);
        assert_eq!(reader.len(), 12);
        assert_eq!(reader.chunk_count(), 4);
        assert_eq!(reader.read_to_vec().await.unwrap(), b"hello, world");
        // exhausted
        assert!(reader.read_to_vec().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn small_reads_cross_chunk_boundaries() {
        let mut reader =
            ComposedReader::new(vec![Bytes::from_static(b"abc"), Bytes::from_static(b"def")]);
        let mut buf = [0; 2];
        let mut collected = vec![];
        loop {
            let n = reader.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
        }
        assert_eq!(collected, b"abcdef");
    }

    #[test]
    fn dropping_releases_handles() {
        let shared = Bytes::from(vec![1u8; 16]);
        let reader = ComposedReader::new(vec![shared.clone()]);
        assert!(!reader.is_empty());
        assert!(!shared.is_unique());
        drop(reader);
        assert!(shared.is_unique());
    }
}
