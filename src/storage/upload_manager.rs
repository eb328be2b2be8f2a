//! Multipart upload driver.
//!
//! The part generator is pulled sequentially; a semaphore bounds how many
//! part requests are in flight, so production never outruns the uploader by
//! more than the configured parallelism. Parts are uploaded in production
//! order and completed in part-number order. Any failure aborts the
//! multipart upload so no orphaned upload ids accumulate.

use std::collections::{HashMap, VecDeque};
use std::io::SeekFrom;

use anyhow::{Context, Result, anyhow};
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Semaphore;
use tracing::{debug, trace, warn};

use crate::storage::part::{Part, PartSource};
use crate::storage::{ObjectStore, classify_sdk_error, convert_to_buf_byte_stream_with_progress};
use crate::types::error::TransferError;
use crate::types::token::TransferCancellationToken;
use crate::types::ProgressHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutPartsOutput {
    pub e_tag: String,
    /// Bytes that went on the wire (ciphertext size for encrypted uploads).
    pub bytes: u64,
}

pub struct UploadManager {
    client: Arc<Client>,
    bucket: String,
    parallel_part_uploads: u16,
    cancellation_token: TransferCancellationToken,
    progress: Option<ProgressHandle>,
}

impl UploadManager {
    pub fn new(
        store: &ObjectStore,
        parallel_part_uploads: u16,
        cancellation_token: TransferCancellationToken,
        progress: Option<ProgressHandle>,
    ) -> Self {
        Self {
            client: store.client(),
            bucket: store.bucket().to_string(),
            parallel_part_uploads: parallel_part_uploads.max(1),
            cancellation_token,
            progress,
        }
    }

    /// Uploads every part the source yields and returns the resulting etag.
    /// A source that yields exactly one part becomes a plain PUT; anything
    /// longer goes through create/part/complete.
    pub async fn upload(
        &self,
        key: &str,
        source: &mut dyn PartSource,
        user_meta: &HashMap<String, String>,
    ) -> Result<PutPartsOutput> {
        let first_part = source
            .next_part()
            .await?
            .unwrap_or_else(|| Part::Inline(Bytes::new()));
        let second_part = source.next_part().await?;

        match second_part {
            None => self.singlepart_upload(key, first_part, user_meta).await,
            Some(second_part) => {
                self.multipart_upload(key, first_part, second_part, source, user_meta)
                    .await
            }
        }
    }

    async fn singlepart_upload(
        &self,
        key: &str,
        part: Part,
        user_meta: &HashMap<String, String>,
    ) -> Result<PutPartsOutput> {
        trace!(key = key, size = part.len(), "singlepart upload.");

        let body = part_body(&part, self.progress.clone()).await?;
        let put_object_output = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_length(part.len() as i64)
            .body(body)
            .set_metadata(Some(user_meta.clone()))
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, "put_object"))?;

        Ok(PutPartsOutput {
            e_tag: put_object_output.e_tag().unwrap_or_default().to_string(),
            bytes: part.len(),
        })
    }

    async fn multipart_upload(
        &self,
        key: &str,
        first_part: Part,
        second_part: Part,
        source: &mut dyn PartSource,
        user_meta: &HashMap<String, String>,
    ) -> Result<PutPartsOutput> {
        let create_multipart_upload_output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .set_metadata(Some(user_meta.clone()))
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, "create_multipart_upload"))?;
        let upload_id = create_multipart_upload_output
            .upload_id()
            .unwrap_or_default()
            .to_string();

        debug!(key = key, upload_id = upload_id, "multipart upload started.");

        let upload_result = self
            .upload_parts_and_complete(key, &upload_id, first_part, second_part, source)
            .await;

        if upload_result.is_err() {
            if let Err(e) = self.abort_multipart_upload(key, &upload_id).await {
                warn!(
                    key = key,
                    upload_id = upload_id,
                    error = e.to_string(),
                    "abort_multipart_upload() failed."
                );
            }
        }

        upload_result
    }

    async fn upload_parts_and_complete(
        &self,
        key: &str,
        upload_id: &str,
        first_part: Part,
        second_part: Part,
        source: &mut dyn PartSource,
    ) -> Result<PutPartsOutput> {
        let semaphore = Arc::new(Semaphore::new(self.parallel_part_uploads as usize));
        let mut upload_part_join_handles = FuturesUnordered::new();
        let mut pending = VecDeque::from([first_part, second_part]);
        let mut part_number: i32 = 0;
        let mut total_bytes: u64 = 0;

        loop {
            if self.cancellation_token.is_cancelled() {
                return Err(anyhow!(TransferError::Cancelled));
            }

            // Acquiring the permit before pulling the next part bounds both
            // in-flight requests and buffered part payloads.
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .context("tokio::sync::Semaphore::acquire_owned() failed.")?;

            let part = match pending.pop_front() {
                Some(part) => Some(part),
                None => source.next_part().await?,
            };
            let Some(part) = part else {
                break;
            };
            part_number += 1;
            total_bytes += part.len();

            let client = self.client.clone();
            let bucket = self.bucket.clone();
            let key = key.to_string();
            let upload_id = upload_id.to_string();
            let progress = self.progress.clone();

            upload_part_join_handles.push(tokio::spawn(async move {
                let _permit = permit;

                let body = part_body(&part, progress).await?;
                let upload_part_output = client
                    .upload_part()
                    .bucket(&bucket)
                    .key(&key)
                    .upload_id(&upload_id)
                    .part_number(part_number)
                    .content_length(part.len() as i64)
                    .body(body)
                    .send()
                    .await
                    .map_err(|e| classify_sdk_error(e, "upload_part"))?;

                trace!(
                    key = key,
                    part_number = part_number,
                    size = part.len(),
                    "part uploaded."
                );

                Ok::<CompletedPart, anyhow::Error>(
                    CompletedPart::builder()
                        .part_number(part_number)
                        .e_tag(upload_part_output.e_tag().unwrap_or_default())
                        .build(),
                )
            }));
        }

        let mut completed_parts = Vec::with_capacity(part_number as usize);
        while let Some(join_result) = upload_part_join_handles.next().await {
            let completed_part = join_result.context("upload_part task panicked.")??;
            completed_parts.push(completed_part);
        }
        completed_parts.sort_by_key(|part| part.part_number().unwrap_or(0));

        let complete_multipart_upload_output = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, "complete_multipart_upload"))?;

        debug!(
            key = key,
            upload_id = upload_id,
            parts = part_number,
            "multipart upload completed."
        );

        Ok(PutPartsOutput {
            e_tag: complete_multipart_upload_output
                .e_tag()
                .unwrap_or_default()
                .to_string(),
            bytes: total_bytes,
        })
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, "abort_multipart_upload"))?;

        Ok(())
    }
}

/// Dereferences a part into a request body, reporting wire progress when a
/// handle is present. Progress-wrapped bodies are not replayable, which is
/// fine: SDK-level retries are disabled and the engine retries whole
/// operations itself.
async fn part_body(part: &Part, progress: Option<ProgressHandle>) -> Result<ByteStream> {
    let Some(progress) = progress else {
        return part.byte_stream().await;
    };

    match part {
        Part::Inline(bytes) => Ok(convert_to_buf_byte_stream_with_progress(
            std::io::Cursor::new(bytes.clone()),
            Some(progress),
            None,
        )),
        Part::Reopenable {
            path,
            offset,
            length,
        } => {
            let mut file = tokio::fs::File::open(path).await.with_context(|| {
                TransferError::Io(format!("failed to open {}", path.display()))
            })?;
            file.seek(SeekFrom::Start(*offset)).await.with_context(|| {
                TransferError::Io(format!("failed to seek {}", path.display()))
            })?;

            Ok(convert_to_buf_byte_stream_with_progress(
                file.take(*length),
                Some(progress),
                None,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn part_body_without_progress_is_replayable() {
        init_dummy_tracing_subscriber();

        let part = Part::Inline(Bytes::from_static(b"abc"));
        let body = part_body(&part, None).await.unwrap();
        let collected = body.collect().await.unwrap().into_bytes();
        assert_eq!(&collected[..], b"abc");
    }

    #[tokio::test]
    async fn part_body_with_progress_reports_bytes() {
        init_dummy_tracing_subscriber();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();

        let (stats_sender, stats_receiver) = async_channel::unbounded();
        let progress = ProgressHandle::new(stats_sender, 3);

        let part = Part::Reopenable {
            path: file.path().to_path_buf(),
            offset: 4,
            length: 3,
        };
        let body = part_body(&part, Some(progress)).await.unwrap();
        let collected = body.collect().await.unwrap().into_bytes();
        assert_eq!(&collected[..], b"456");

        let mut reported = 0;
        while let Ok(stats) = stats_receiver.try_recv() {
            if let crate::types::TransferStatistics::TransferBytes { bytes, .. } = stats {
                reported += bytes;
            }
        }
        assert_eq!(reported, 3);
    }

    fn init_dummy_tracing_subscriber() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("dummy=trace")
            .try_init();
    }
}
