//! Compare path of the chunk pipeline: streams a remote object against a
//! local file and reports the first divergence. Size is checked before
//! mtime, mtime before bytes; the body is only fetched when the cheap checks
//! pass.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::config::Config;
use crate::storage::layout::KeyLayout;
use crate::storage::ObjectStore;
use crate::types::error::{TransferError, is_not_found_error, is_retriable_error};
use crate::types::token::TransferCancellationToken;
use crate::types::mtime_from_system_time;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffKind {
    Size,
    Mtime,
    Bytes,
    MissingRemote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOutcome {
    Identical,
    Different(DiffKind),
}

pub struct ObjectComparer {
    store: ObjectStore,
    layout: KeyLayout,
    config: Config,
    cancellation_token: TransferCancellationToken,
}

impl ObjectComparer {
    pub fn new(
        store: ObjectStore,
        layout: KeyLayout,
        config: Config,
        cancellation_token: TransferCancellationToken,
    ) -> Self {
        Self {
            store,
            layout,
            config,
            cancellation_token,
        }
    }

    pub async fn compare(&self, logical_path: &str, local_path: &Path) -> Result<CompareOutcome> {
        let mut backoff = Duration::from_millis(
            self.config.retry_config.initial_backoff_milliseconds,
        );
        let mut attempt: u32 = 0;

        loop {
            if self.cancellation_token.is_cancelled() {
                return Err(anyhow!(TransferError::Cancelled));
            }

            match self.compare_attempt(logical_path, local_path).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    attempt += 1;
                    if attempt > self.config.retry_config.retry_count || !is_retriable_error(&e) {
                        return Err(e);
                    }

                    warn!(
                        path = logical_path,
                        attempt = attempt,
                        error = e.to_string(),
                        "compare failed, retrying."
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }

    async fn compare_attempt(
        &self,
        logical_path: &str,
        local_path: &Path,
    ) -> Result<CompareOutcome> {
        let local_metadata = std::fs::metadata(local_path).with_context(|| {
            TransferError::Io(format!("failed to stat {}", local_path.display()))
        })?;

        let key = self.layout.data_key(logical_path);
        let stat = match self.store.head(&key).await {
            Ok(stat) => stat,
            Err(e) if is_not_found_error(&e) => {
                return Ok(CompareOutcome::Different(DiffKind::MissingRemote));
            }
            Err(e) => return Err(e),
        };

        if stat.content_length != local_metadata.len() {
            debug!(
                path = logical_path,
                local_size = local_metadata.len(),
                remote_size = stat.content_length,
                "size differs."
            );
            return Ok(CompareOutcome::Different(DiffKind::Size));
        }

        let local_mtime = local_metadata.modified().ok().map(mtime_from_system_time);
        if stat.mtime() != local_mtime {
            debug!(path = logical_path, "mtime differs.");
            return Ok(CompareOutcome::Different(DiffKind::Mtime));
        }

        self.compare_bytes(&key, logical_path, local_path).await
    }

    async fn compare_bytes(
        &self,
        key: &str,
        logical_path: &str,
        local_path: &Path,
    ) -> Result<CompareOutcome> {
        let get_object_output = self
            .store
            .get(key, None, None)
            .await
            .context("cmp failed.")?;
        let mut body = get_object_output.body;

        let mut file = tokio::fs::File::open(local_path).await.with_context(|| {
            TransferError::Io(format!("failed to open {}", local_path.display()))
        })?;

        let stall_timeout =
            Duration::from_secs(self.config.timeout_config.stall_timeout_seconds);
        let mut local_buffer = Vec::new();

        loop {
            let chunk = match tokio::time::timeout(stall_timeout, body.try_next()).await {
                Ok(Ok(Some(chunk))) => chunk,
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    return Err(anyhow::Error::new(e)
                        .context(TransferError::Http { status: 0 })
                        .context("cmp body read failed."));
                }
                Err(_elapsed) => {
                    return Err(anyhow!(TransferError::StallTimeout {
                        seconds: self.config.timeout_config.stall_timeout_seconds,
                    })
                    .context("cmp failed."));
                }
            };

            local_buffer.resize(chunk.len(), 0);
            if file.read_exact(&mut local_buffer).await.is_err() {
                // Local file ended early; sizes matched at HEAD time, so the
                // file changed underneath us.
                return Ok(CompareOutcome::Different(DiffKind::Bytes));
            }

            if local_buffer != chunk {
                debug!(path = logical_path, "bytes differ.");
                return Ok(CompareOutcome::Different(DiffKind::Bytes));
            }
        }

        // Any trailing local bytes mean divergence too.
        let mut trailing = [0u8; 1];
        if file.read(&mut trailing).await.unwrap_or(0) != 0 {
            return Ok(CompareOutcome::Different(DiffKind::Bytes));
        }

        Ok(CompareOutcome::Identical)
    }
}
