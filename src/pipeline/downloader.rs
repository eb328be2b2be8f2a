//! Download path of the chunk pipeline.
//!
//! The md5sum sidecar and the content object are fetched as one logical
//! operation; either 404 fails the whole download. Chunks flow to the sink
//! in byte order while the plaintext MD5 rolls along. A stall mid-body turns
//! into a ranged re-request guarded by `If-Match`, so the resumed bytes are
//! guaranteed to belong to the same object generation. Every other
//! retriable failure truncates the sink and restarts the attempt with
//! exponential backoff.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use filetime::{FileTime, set_file_mtime};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::crypto::GpgDecryptor;
use crate::storage::layout::KeyLayout;
use crate::storage::meta::MetaLayer;
use crate::storage::ObjectStore;
use crate::types::error::{TransferError, is_retriable_error};
use crate::types::token::TransferCancellationToken;
use crate::types::{
    KEYID_METADATA_KEY, MTIME_METADATA_KEY, ProgressHandle, parse_mtime,
};

#[derive(Debug, Clone)]
pub enum DownloadSink {
    File(PathBuf),
    Stdout,
    /// Verify-only mode: bytes are hashed and dropped.
    Discard,
}

impl DownloadSink {
    /// Stdout cannot be truncated, so only the in-band ranged resume is safe
    /// there; a full restart would duplicate output.
    fn supports_restart(&self) -> bool {
        !matches!(self, DownloadSink::Stdout)
    }
}

enum SinkWriter {
    File(tokio::fs::File),
    Stdout(tokio::io::Stdout),
    Discard,
}

impl SinkWriter {
    async fn open(sink: &DownloadSink) -> Result<Self> {
        match sink {
            DownloadSink::File(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        tokio::fs::create_dir_all(parent).await.with_context(|| {
                            TransferError::Io(format!(
                                "failed to create directory {}",
                                parent.display()
                            ))
                        })?;
                    }
                }
                let file = tokio::fs::File::create(path).await.with_context(|| {
                    TransferError::Io(format!("failed to create {}", path.display()))
                })?;
                Ok(SinkWriter::File(file))
            }
            DownloadSink::Stdout => Ok(SinkWriter::Stdout(tokio::io::stdout())),
            DownloadSink::Discard => Ok(SinkWriter::Discard),
        }
    }

    async fn write_all(&mut self, chunk: &[u8]) -> Result<()> {
        let result = match self {
            SinkWriter::File(file) => file.write_all(chunk).await,
            SinkWriter::Stdout(stdout) => stdout.write_all(chunk).await,
            SinkWriter::Discard => Ok(()),
        };
        result.context(TransferError::Io("sink write failed".to_string()))
    }

    async fn flush(&mut self) -> Result<()> {
        let result = match self {
            SinkWriter::File(file) => file.flush().await,
            SinkWriter::Stdout(stdout) => stdout.flush().await,
            SinkWriter::Discard => Ok(()),
        };
        result.context(TransferError::Io("sink flush failed".to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// Plaintext bytes delivered to the sink.
    pub bytes: u64,
    pub md5_hex: String,
    pub mtime: Option<DateTime<Utc>>,
}

pub struct ObjectDownloader {
    store: ObjectStore,
    meta: MetaLayer,
    layout: KeyLayout,
    config: Config,
    cancellation_token: TransferCancellationToken,
    agent_info: Option<String>,
}

impl ObjectDownloader {
    pub fn new(
        store: ObjectStore,
        layout: KeyLayout,
        config: Config,
        cancellation_token: TransferCancellationToken,
    ) -> Self {
        let meta = MetaLayer::new(store.clone(), layout.clone());
        Self {
            store,
            meta,
            layout,
            config,
            cancellation_token,
            agent_info: None,
        }
    }

    /// Points `gpg --use-agent` at a passphrase agent socket.
    pub fn with_agent_info(mut self, agent_info: Option<String>) -> Self {
        self.agent_info = agent_info;
        self
    }

    pub async fn download(
        &self,
        logical_path: &str,
        sink: &DownloadSink,
        progress: Option<ProgressHandle>,
    ) -> Result<DownloadOutcome> {
        let expected_md5 = self
            .meta
            .get_md5sum(logical_path)
            .await
            .context("get_file failed.")?;
        let key = self.layout.data_key(logical_path);

        let mut backoff = Duration::from_millis(
            self.config.retry_config.initial_backoff_milliseconds,
        );
        let mut attempt: u32 = 0;

        loop {
            if self.cancellation_token.is_cancelled() {
                return Err(anyhow!(TransferError::Cancelled));
            }

            match self
                .download_attempt(&key, sink, &expected_md5, progress.clone())
                .await
            {
                Ok(outcome) => {
                    if let (DownloadSink::File(path), Some(mtime)) = (sink, outcome.mtime) {
                        set_file_mtime(path, FileTime::from_unix_time(mtime.timestamp(), 0))
                            .with_context(|| {
                                TransferError::Io(format!(
                                    "failed to set mtime on {}",
                                    path.display()
                                ))
                            })?;
                    }

                    debug!(
                        path = logical_path,
                        bytes = outcome.bytes,
                        md5 = outcome.md5_hex,
                        "download completed."
                    );
                    return Ok(outcome);
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > self.config.retry_config.retry_count
                        || !is_retriable_error(&e)
                        || !sink.supports_restart()
                    {
                        return Err(e);
                    }

                    warn!(
                        path = logical_path,
                        attempt = attempt,
                        error = e.to_string(),
                        "download failed, retrying."
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }

    /// One attempt: a fresh GET from offset zero with the sink truncated.
    /// Stalls are handled in-band with a ranged, `If-Match`-guarded
    /// re-request that continues the byte stream exactly where it stopped.
    async fn download_attempt(
        &self,
        key: &str,
        sink: &DownloadSink,
        expected_md5: &str,
        progress: Option<ProgressHandle>,
    ) -> Result<DownloadOutcome> {
        let writer = SinkWriter::open(sink).await?;

        let get_object_output = self
            .store
            .get(key, None, None)
            .await
            .context("get_file failed.")?;

        let e_tag = get_object_output.e_tag().map(|e_tag| e_tag.to_string());
        let user_meta = get_object_output.metadata().cloned().unwrap_or_default();
        let mtime = user_meta.get(MTIME_METADATA_KEY).and_then(|v| parse_mtime(v));
        let encrypted = user_meta.contains_key(KEYID_METADATA_KEY);

        let (bytes, md5_hex) = if encrypted {
            self.pump_encrypted(key, get_object_output.body, writer, e_tag, progress)
                .await?
        } else {
            self.pump_plain(key, get_object_output.body, writer, e_tag, progress)
                .await?
        };

        if md5_hex != expected_md5 {
            return Err(anyhow!(TransferError::Md5Mismatch {
                expected: expected_md5.to_string(),
                got: md5_hex,
            })
            .context("get_file failed."));
        }

        Ok(DownloadOutcome {
            bytes,
            md5_hex,
            mtime,
        })
    }

    async fn pump_plain(
        &self,
        key: &str,
        mut body: aws_sdk_s3::primitives::ByteStream,
        mut writer: SinkWriter,
        e_tag: Option<String>,
        progress: Option<ProgressHandle>,
    ) -> Result<(u64, String)> {
        let mut md5_context = md5::Context::new();
        let mut received: u64 = 0;
        let mut stall_resumes: u32 = 0;

        loop {
            let chunk = match self.next_chunk(key, &mut body, received, &e_tag, &mut stall_resumes).await? {
                Some(chunk) => chunk,
                None => break,
            };

            md5_context.consume(&chunk);
            writer.write_all(&chunk).await?;
            received += chunk.len() as u64;
            if let Some(progress) = &progress {
                progress.add_bytes(chunk.len() as u64).await;
            }
        }

        writer.flush().await?;
        Ok((received, format!("{:x}", md5_context.compute())))
    }

    async fn pump_encrypted(
        &self,
        key: &str,
        mut body: aws_sdk_s3::primitives::ByteStream,
        mut writer: SinkWriter,
        e_tag: Option<String>,
        progress: Option<ProgressHandle>,
    ) -> Result<(u64, String)> {
        let mut decryptor = GpgDecryptor::spawn(self.agent_info.as_deref())?;
        let mut stdin = decryptor.take_stdin()?;
        let mut stdout = decryptor.take_stdout()?;

        // Plaintext side runs concurrently: gpg's stdout feeds the sink and
        // the rolling MD5 while ciphertext is still arriving.
        let plaintext_task = tokio::spawn(async move {
            let mut md5_context = md5::Context::new();
            let mut plaintext_bytes: u64 = 0;
            let mut buffer = vec![0u8; 64 * 1024];

            loop {
                let read_bytes = stdout
                    .read(&mut buffer)
                    .await
                    .context(TransferError::Crypto("gpg stdout read failed".to_string()))?;
                if read_bytes == 0 {
                    break;
                }

                md5_context.consume(&buffer[..read_bytes]);
                writer.write_all(&buffer[..read_bytes]).await?;
                plaintext_bytes += read_bytes as u64;
            }

            writer.flush().await?;
            Ok::<(u64, String), anyhow::Error>((
                plaintext_bytes,
                format!("{:x}", md5_context.compute()),
            ))
        });

        let mut received: u64 = 0;
        let mut stall_resumes: u32 = 0;
        loop {
            let chunk = match self.next_chunk(key, &mut body, received, &e_tag, &mut stall_resumes).await? {
                Some(chunk) => chunk,
                None => break,
            };

            stdin
                .write_all(&chunk)
                .await
                .context(TransferError::Crypto("gpg stdin write failed".to_string()))?;
            received += chunk.len() as u64;
            if let Some(progress) = &progress {
                progress.add_bytes(chunk.len() as u64).await;
            }
        }
        // Closing stdin lets gpg flush and exit.
        drop(stdin);

        let (plaintext_bytes, md5_hex) = plaintext_task
            .await
            .context("plaintext pump task panicked.")??;
        decryptor.finish().await?;

        Ok((plaintext_bytes, md5_hex))
    }

    /// Reads the next body chunk, converting inactivity into a ranged
    /// resume. The `If-Match` guard fails the resume if the object changed
    /// underneath us.
    async fn next_chunk(
        &self,
        key: &str,
        body: &mut aws_sdk_s3::primitives::ByteStream,
        received: u64,
        e_tag: &Option<String>,
        stall_resumes: &mut u32,
    ) -> Result<Option<bytes::Bytes>> {
        let stall_timeout =
            Duration::from_secs(self.config.timeout_config.stall_timeout_seconds);

        loop {
            match tokio::time::timeout(stall_timeout, body.try_next()).await {
                Ok(Ok(chunk)) => return Ok(chunk),
                Ok(Err(e)) => {
                    return Err(anyhow::Error::new(e)
                        .context(TransferError::Http { status: 0 })
                        .context("get_file body read failed."));
                }
                Err(_elapsed) => {
                    *stall_resumes += 1;
                    if *stall_resumes > self.config.retry_config.retry_count {
                        return Err(anyhow!(TransferError::StallTimeout {
                            seconds: self.config.timeout_config.stall_timeout_seconds,
                        })
                        .context("get_file failed."));
                    }

                    warn!(
                        key = key,
                        received = received,
                        "no bytes received, resuming with ranged request."
                    );

                    let resumed = self
                        .store
                        .get(
                            key,
                            Some(format!("bytes={received}-")),
                            e_tag.clone(),
                        )
                        .await
                        .context("get_file resume failed.")?;
                    *body = resumed.body;

                    trace!(key = key, offset = received, "resumed.");
                }
            }
        }
    }
}
