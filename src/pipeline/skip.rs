//! Skip-if-unchanged decisions.
//!
//! `stat` skips when the local file exists, the content object's length
//! matches, the md5sum sidecar is present and the `Mtime` header equals the
//! local mtime at second precision. `md5sum` additionally requires the local
//! digest to equal the sidecar value. Any 404 on the way means "do not
//! skip". The reason for not skipping is logged at debug level.

use std::path::Path;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::storage::layout::KeyLayout;
use crate::storage::meta::MetaLayer;
use crate::storage::ObjectStore;
use crate::types::error::{TransferError, is_not_found_error};
use crate::types::{SkipLogic, mtime_from_system_time};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SkipDecision {
    pub skip: bool,
    /// The sidecar value when it was read along the way, so a chained
    /// consumer does not fetch it again.
    pub remote_md5: Option<String>,
}

impl SkipDecision {
    fn transfer() -> Self {
        Self {
            skip: false,
            remote_md5: None,
        }
    }
}

pub struct SkipOracle {
    store: ObjectStore,
    meta: MetaLayer,
    layout: KeyLayout,
}

impl SkipOracle {
    pub fn new(store: ObjectStore, layout: KeyLayout) -> Self {
        let meta = MetaLayer::new(store.clone(), layout.clone());
        Self {
            store,
            meta,
            layout,
        }
    }

    pub async fn should_skip(
        &self,
        local_path: &Path,
        logical_path: &str,
        policy: SkipLogic,
    ) -> Result<SkipDecision> {
        match policy {
            SkipLogic::All => {
                debug!(path = logical_path, "transfer forced, skip check disabled.");
                Ok(SkipDecision::transfer())
            }
            SkipLogic::Stat => self.stat_decision(local_path, logical_path).await,
            SkipLogic::Md5sum => {
                let decision = self.stat_decision(local_path, logical_path).await?;
                if !decision.skip {
                    return Ok(decision);
                }

                let remote_md5 = decision.remote_md5.clone().unwrap_or_default();
                let local_md5 = compute_local_md5(local_path).await?;
                if local_md5 != remote_md5 {
                    debug!(
                        path = logical_path,
                        local_md5 = local_md5,
                        remote_md5 = remote_md5,
                        "not skipped: md5 differs."
                    );
                    return Ok(SkipDecision {
                        skip: false,
                        remote_md5: Some(remote_md5),
                    });
                }

                Ok(decision)
            }
        }
    }

    async fn stat_decision(&self, local_path: &Path, logical_path: &str) -> Result<SkipDecision> {
        let Ok(local_metadata) = std::fs::metadata(local_path) else {
            debug!(path = logical_path, "not skipped: no local file.");
            return Ok(SkipDecision::transfer());
        };
        if !local_metadata.is_file() {
            debug!(path = logical_path, "not skipped: local path is not a regular file.");
            return Ok(SkipDecision::transfer());
        }

        let stat = match self.store.head(&self.layout.data_key(logical_path)).await {
            Ok(stat) => stat,
            Err(e) if is_not_found_error(&e) => {
                debug!(path = logical_path, "not skipped: no remote object.");
                return Ok(SkipDecision::transfer());
            }
            Err(e) => return Err(e),
        };

        if stat.content_length != local_metadata.len() {
            debug!(
                path = logical_path,
                local_size = local_metadata.len(),
                remote_size = stat.content_length,
                "not skipped: size differs."
            );
            return Ok(SkipDecision::transfer());
        }

        let remote_md5 = match self.meta.get_md5sum(logical_path).await {
            Ok(remote_md5) => remote_md5,
            Err(e) if is_not_found_error(&e) => {
                debug!(path = logical_path, "not skipped: no md5sum sidecar.");
                return Ok(SkipDecision::transfer());
            }
            Err(e) => return Err(e),
        };

        let local_mtime = mtime_from_system_time(
            local_metadata
                .modified()
                .with_context(|| TransferError::Io("mtime unavailable".to_string()))?,
        );
        match stat.mtime() {
            Some(remote_mtime) if remote_mtime == local_mtime => {}
            Some(remote_mtime) => {
                debug!(
                    path = logical_path,
                    local_mtime = local_mtime.timestamp(),
                    remote_mtime = remote_mtime.timestamp(),
                    "not skipped: mtime differs."
                );
                return Ok(SkipDecision {
                    skip: false,
                    remote_md5: Some(remote_md5),
                });
            }
            None => {
                debug!(path = logical_path, "not skipped: no Mtime header.");
                return Ok(SkipDecision {
                    skip: false,
                    remote_md5: Some(remote_md5),
                });
            }
        }

        Ok(SkipDecision {
            skip: true,
            remote_md5: Some(remote_md5),
        })
    }
}

/// Streaming in-process MD5 of a local file, byte-for-byte over the raw
/// content.
pub async fn compute_local_md5(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| TransferError::Io(format!("failed to open {}", path.display())))?;

    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read_bytes = file
            .read(&mut buffer)
            .await
            .with_context(|| TransferError::Io(format!("failed to read {}", path.display())))?;
        if read_bytes == 0 {
            break;
        }
        context.consume(&buffer[..read_bytes]);
    }

    Ok(format!("{:x}", context.compute()))
}
