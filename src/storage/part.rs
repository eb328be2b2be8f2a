//! Upload part representations and the generators that produce them.
//!
//! The generator is invoked sequentially (one producer per upload), but the
//! parts it hands out must be safe to read more than once: a part request
//! that fails mid-flight is retried against the same payload. `Inline` parts
//! re-read from memory; `Reopenable` parts re-read the byte range from disk.

use std::cmp::min;
use std::path::PathBuf;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_smithy_types::byte_stream::Length;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::types::error::TransferError;

#[derive(Debug, Clone)]
pub enum Part {
    /// A completed byte range held in memory.
    Inline(Bytes),
    /// A byte range of a regular file, dereferenced at upload time.
    Reopenable {
        path: PathBuf,
        offset: u64,
        length: u64,
    },
}

impl Part {
    pub fn len(&self) -> u64 {
        match self {
            Part::Inline(bytes) => bytes.len() as u64,
            Part::Reopenable { length, .. } => *length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dereferences the part into a request body.
    pub async fn byte_stream(&self) -> Result<ByteStream> {
        match self {
            Part::Inline(bytes) => Ok(ByteStream::from(bytes.clone())),
            Part::Reopenable {
                path,
                offset,
                length,
            } => ByteStream::read_from()
                .path(path)
                .offset(*offset)
                .length(Length::Exact(*length))
                .build()
                .await
                .map_err(|e| {
                    anyhow::Error::new(e)
                        .context(TransferError::Io(format!(
                            "failed to reopen {} at offset {offset}",
                            path.display()
                        )))
                }),
        }
    }
}

/// Sequential producer of upload parts. Implementations must emit at least
/// one part: a zero-byte source yields exactly one empty part, since S3
/// rejects uploads with no parts at all.
#[async_trait]
pub trait PartSource: Send {
    async fn next_part(&mut self) -> Result<Option<Part>>;

    /// Total plaintext size when known up front (regular files). Streaming
    /// sources return `None`.
    fn total_size(&self) -> Option<u64>;
}

/// Slices a regular file into fixed-size ranges. Ranges are re-read from
/// disk by each part request, so concurrent part uploads never contend on a
/// shared file handle.
pub struct FilePartSource {
    path: PathBuf,
    size: u64,
    part_size: u64,
    offset: u64,
    emitted_any: bool,
}

impl FilePartSource {
    pub async fn new(path: PathBuf, part_size: u64) -> Result<Self> {
        let metadata = tokio::fs::metadata(&path).await.with_context(|| {
            TransferError::Io(format!("failed to stat {}", path.display()))
        })?;

        Ok(Self {
            path,
            size: metadata.len(),
            part_size,
            offset: 0,
            emitted_any: false,
        })
    }
}

#[async_trait]
impl PartSource for FilePartSource {
    async fn next_part(&mut self) -> Result<Option<Part>> {
        if self.offset >= self.size {
            if !self.emitted_any {
                self.emitted_any = true;
                return Ok(Some(Part::Inline(Bytes::new())));
            }
            return Ok(None);
        }

        let length = min(self.part_size, self.size - self.offset);
        let part = Part::Reopenable {
            path: self.path.clone(),
            offset: self.offset,
            length,
        };

        self.offset += length;
        self.emitted_any = true;
        Ok(Some(part))
    }

    fn total_size(&self) -> Option<u64> {
        Some(self.size)
    }
}

/// Chunks a pipe, socket or subprocess output into parts of exactly
/// `part_size` bytes (the final part may be short). The payload has to be
/// buffered in memory, because streams cannot be re-read.
pub struct ReaderPartSource<R: AsyncRead + Unpin + Send> {
    reader: R,
    part_size: usize,
    emitted_any: bool,
    eof: bool,
}

impl<R: AsyncRead + Unpin + Send> ReaderPartSource<R> {
    pub fn new(reader: R, part_size: u64) -> Self {
        Self {
            reader,
            part_size: part_size as usize,
            emitted_any: false,
            eof: false,
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> PartSource for ReaderPartSource<R> {
    async fn next_part(&mut self) -> Result<Option<Part>> {
        if self.eof {
            return Ok(None);
        }

        let mut buffer = Vec::new();
        let read_bytes = (&mut self.reader)
            .take(self.part_size as u64)
            .read_to_end(&mut buffer)
            .await
            .context(TransferError::Io("stream read failed".to_string()))?;

        // read_to_end only stops short of the take limit at end of stream.
        if read_bytes < self.part_size {
            self.eof = true;
        }

        if buffer.is_empty() {
            if !self.emitted_any {
                self.emitted_any = true;
                return Ok(Some(Part::Inline(Bytes::new())));
            }
            return Ok(None);
        }

        self.emitted_any = true;
        Ok(Some(Part::Inline(Bytes::from(buffer))))
    }

    fn total_size(&self) -> Option<u64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::io::Write;

    async fn collect_parts(source: &mut dyn PartSource) -> Vec<Part> {
        let mut parts = Vec::new();
        while let Some(part) = source.next_part().await.unwrap() {
            parts.push(part);
        }
        parts
    }

    #[tokio::test]
    async fn file_source_slices_by_part_size() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![1u8; 2500]).unwrap();

        let mut source = FilePartSource::new(file.path().to_path_buf(), 1000)
            .await
            .unwrap();
        assert_eq!(source.total_size(), Some(2500));

        let parts = collect_parts(&mut source).await;
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 1000);
        assert_eq!(parts[1].len(), 1000);
        assert_eq!(parts[2].len(), 500);

        match &parts[1] {
            Part::Reopenable { offset, length, .. } => {
                assert_eq!(*offset, 1000);
                assert_eq!(*length, 1000);
            }
            Part::Inline(_) => panic!("file parts must be reopenable"),
        }
    }

    #[tokio::test]
    async fn file_source_single_byte_over_threshold_makes_two_parts() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![0u8; 1001]).unwrap();

        let mut source = FilePartSource::new(file.path().to_path_buf(), 1000)
            .await
            .unwrap();
        let parts = collect_parts(&mut source).await;

        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].len(), 1000);
        assert_eq!(parts[1].len(), 1);
    }

    #[tokio::test]
    async fn zero_byte_file_emits_exactly_one_empty_part() {
        let file = tempfile::NamedTempFile::new().unwrap();

        let mut source = FilePartSource::new(file.path().to_path_buf(), 1000)
            .await
            .unwrap();
        let parts = collect_parts(&mut source).await;

        assert_eq!(parts.len(), 1);
        assert!(parts[0].is_empty());
    }

    #[tokio::test]
    async fn reader_source_chunks_exactly() {
        let data: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        let mut source = ReaderPartSource::new(Cursor::new(data.clone()), 1000);
        assert_eq!(source.total_size(), None);

        let parts = collect_parts(&mut source).await;
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].len(), 500);

        let mut reassembled = Vec::new();
        for part in &parts {
            match part {
                Part::Inline(bytes) => reassembled.extend_from_slice(bytes),
                Part::Reopenable { .. } => panic!("stream parts must be inline"),
            }
        }
        assert_eq!(reassembled, data);
    }

    #[tokio::test]
    async fn zero_byte_reader_emits_exactly_one_empty_part() {
        let mut source = ReaderPartSource::new(Cursor::new(Vec::new()), 1000);
        let parts = collect_parts(&mut source).await;

        assert_eq!(parts.len(), 1);
        assert!(parts[0].is_empty());
    }

    #[tokio::test]
    async fn reopenable_part_can_be_read_twice() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();

        let part = Part::Reopenable {
            path: file.path().to_path_buf(),
            offset: 2,
            length: 5,
        };

        for _ in 0..2 {
            let body = part.byte_stream().await.unwrap();
            let collected = body.collect().await.unwrap().into_bytes();
            assert_eq!(&collected[..], b"23456");
        }
    }
}
