//! Upload path of the chunk pipeline.
//!
//! Streams one object's bytes to the store with rolling plaintext MD5 and
//! optional GPG encryption, then writes the sidecars. Sidecars are written
//! strictly after the content object succeeds; a failed content put leaves
//! no sidecar behind.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::io::AsyncRead;
use tracing::{debug, trace};

use crate::config::Config;
use crate::crypto::GpgEncryptor;
use crate::storage::layout::KeyLayout;
use crate::storage::meta::MetaLayer;
use crate::storage::part::{FilePartSource, PartSource, ReaderPartSource};
use crate::storage::upload_manager::UploadManager;
use crate::storage::watermark::spawn_watermarked_reader;
use crate::storage::ObjectStore;
use crate::types::async_callback::{AsyncReadWithProgress, finalize_shared_md5, new_shared_md5};
use crate::types::error::TransferError;
use crate::types::token::TransferCancellationToken;
use crate::types::{
    CRYPTOKEY_SIDECAR, GPG_CRYPTOKEY_VALUE, KEYID_METADATA_KEY, MTIME_METADATA_KEY,
    ProgressHandle, format_mtime, mtime_from_system_time,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    /// Hex MD5 of the plaintext, as written to the sidecar.
    pub md5_hex: String,
    /// Bytes that went on the wire.
    pub bytes: u64,
}

pub struct ObjectUploader {
    store: ObjectStore,
    meta: MetaLayer,
    layout: KeyLayout,
    config: Config,
    cancellation_token: TransferCancellationToken,
}

impl ObjectUploader {
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
        }
    }

    /// Uploads a regular file. The `Mtime` header carries the file's mtime
    /// at upload time, truncated to seconds.
    pub async fn upload_file(
        &self,
        local_path: &Path,
        logical_path: &str,
        progress: Option<ProgressHandle>,
    ) -> Result<UploadOutcome> {
        let metadata = tokio::fs::metadata(local_path).await.with_context(|| {
            TransferError::Io(format!("failed to stat {}", local_path.display()))
        })?;
        let mtime = metadata
            .modified()
            .ok()
            .map(mtime_from_system_time);

        if self.config.crypto_keyid.is_some() {
            let file = tokio::fs::File::open(local_path).await.with_context(|| {
                TransferError::Io(format!("failed to open {}", local_path.display()))
            })?;
            return self
                .upload_encrypted(file, logical_path, mtime, progress)
                .await;
        }

        let mut source = FilePartSource::new(
            local_path.to_path_buf(),
            self.config.transfer_config.part_size,
        )
        .await?;

        // The plaintext digest streams from disk concurrently with the part
        // uploads; parts re-read their ranges independently.
        let md5_path = local_path.to_path_buf();
        let md5_task =
            tokio::spawn(async move { crate::pipeline::skip::compute_local_md5(&md5_path).await });

        let put_output = self
            .put_parts(logical_path, &mut source, self.user_meta(mtime, None), progress)
            .await?;

        let md5_hex = md5_task.await.context("md5 task panicked.")??;
        self.write_sidecars(logical_path, &md5_hex, false).await?;

        debug!(
            path = logical_path,
            md5 = md5_hex,
            bytes = put_output.bytes,
            "upload completed."
        );

        Ok(UploadOutcome {
            md5_hex,
            bytes: put_output.bytes,
        })
    }

    /// Uploads from a pipe or any other one-shot reader. A high/low
    /// watermark buffer keeps the producer from outrunning the uploader.
    pub async fn upload_reader<R>(
        &self,
        reader: R,
        logical_path: &str,
        mtime: Option<DateTime<Utc>>,
        progress: Option<ProgressHandle>,
    ) -> Result<UploadOutcome>
    where
        R: AsyncRead + Unpin + Send + Sync + 'static,
    {
        if self.config.crypto_keyid.is_some() {
            return self.upload_encrypted(reader, logical_path, mtime, progress).await;
        }

        let md5 = new_shared_md5();
        let hashing_reader = AsyncReadWithProgress::new(reader, None, Some(md5.clone()));
        let buffered = spawn_watermarked_reader(
            hashing_reader,
            self.config.transfer_config.high_watermark as usize,
            self.config.transfer_config.low_watermark as usize,
        );
        let mut source =
            ReaderPartSource::new(buffered, self.config.transfer_config.part_size);

        let put_output = self
            .put_parts(logical_path, &mut source, self.user_meta(mtime, None), progress)
            .await?;

        let md5_hex = finalize_shared_md5(&md5);
        self.write_sidecars(logical_path, &md5_hex, false).await?;

        Ok(UploadOutcome {
            md5_hex,
            bytes: put_output.bytes,
        })
    }

    async fn upload_encrypted<R>(
        &self,
        plaintext: R,
        logical_path: &str,
        mtime: Option<DateTime<Utc>>,
        progress: Option<ProgressHandle>,
    ) -> Result<UploadOutcome>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let keyid = self
            .config
            .crypto_keyid
            .clone()
            .expect("upload_encrypted requires crypto_keyid");

        // The MD5 is taken over the plaintext before it enters gpg; the
        // ciphertext is what goes on the wire.
        let md5 = new_shared_md5();
        let hashing_reader = AsyncReadWithProgress::new(plaintext, None, Some(md5.clone()));
        let mut encryptor = GpgEncryptor::spawn(
            &keyid,
            hashing_reader,
            self.config.transfer_config.high_watermark,
            self.config.transfer_config.low_watermark,
        )?;
        let ciphertext = encryptor.take_ciphertext()?;
        let mut source =
            ReaderPartSource::new(ciphertext, self.config.transfer_config.part_size);

        let put_output = self
            .put_parts(
                logical_path,
                &mut source,
                self.user_meta(mtime, Some(&keyid)),
                progress,
            )
            .await?;

        // A non-zero gpg exit poisons the upload even though parts landed.
        encryptor.finish().await?;

        let md5_hex = finalize_shared_md5(&md5);
        self.write_sidecars(logical_path, &md5_hex, true).await?;

        debug!(
            path = logical_path,
            keyid = keyid,
            bytes = put_output.bytes,
            "encrypted upload completed."
        );

        Ok(UploadOutcome {
            md5_hex,
            bytes: put_output.bytes,
        })
    }

    async fn put_parts(
        &self,
        logical_path: &str,
        source: &mut dyn PartSource,
        user_meta: HashMap<String, String>,
        progress: Option<ProgressHandle>,
    ) -> Result<crate::storage::upload_manager::PutPartsOutput> {
        let upload_manager = UploadManager::new(
            &self.store,
            self.config.transfer_config.parallel_part_uploads,
            self.cancellation_token.clone(),
            progress,
        );

        upload_manager
            .upload(&self.layout.data_key(logical_path), source, &user_meta)
            .await
            .context("put_parts failed.")
    }

    fn user_meta(
        &self,
        mtime: Option<DateTime<Utc>>,
        keyid: Option<&str>,
    ) -> HashMap<String, String> {
        let mut user_meta = HashMap::new();
        if let Some(mtime) = mtime {
            user_meta.insert(MTIME_METADATA_KEY.to_string(), format_mtime(mtime));
        }
        if let Some(keyid) = keyid {
            user_meta.insert(KEYID_METADATA_KEY.to_string(), keyid.to_string());
        }
        user_meta
    }

    async fn write_sidecars(
        &self,
        logical_path: &str,
        md5_hex: &str,
        encrypted: bool,
    ) -> Result<()> {
        self.meta
            .put_md5sum(logical_path, md5_hex)
            .await
            .context("put_meta failed.")?;

        if encrypted {
            self.meta
                .put_meta(
                    logical_path,
                    CRYPTOKEY_SIDECAR,
                    &format!("{GPG_CRYPTOKEY_VALUE}\n"),
                )
                .await
                .context("put_meta failed.")?;
        } else {
            // A plaintext upload over a previously encrypted object must not
            // leave a stale cryptokey behind.
            self.meta
                .delete_meta(logical_path, CRYPTOKEY_SIDECAR)
                .await
                .context("put_meta failed.")?;
        }

        trace!(path = logical_path, "sidecars written.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::args::{EnvSettings, build_config, parse_from_args};
    use crate::config::ConfFile;

    fn test_config() -> Config {
        let args = parse_from_args(vec!["sfs3", "ls"]).unwrap();
        let conf = ConfFile {
            access_key: Some("a".to_string()),
            secret_key: Some("s".to_string()),
            bucket: Some("bucket".to_string()),
            ..Default::default()
        };
        build_config(&args, conf, EnvSettings::default()).unwrap()
    }

    #[test]
    fn user_meta_carries_mtime_and_keyid() {
        let client = std::sync::Arc::new(aws_sdk_s3::Client::from_conf(
            aws_sdk_s3::config::Builder::new()
                .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
                .build(),
        ));
        let uploader = ObjectUploader::new(
            ObjectStore::new(client, "bucket"),
            KeyLayout::new(""),
            test_config(),
            crate::types::token::create_transfer_cancellation_token(),
        );

        let mtime = crate::types::mtime_from_unix_seconds(1380896764);
        let user_meta = uploader.user_meta(Some(mtime), Some("ABCD1234"));
        assert_eq!(
            user_meta.get(MTIME_METADATA_KEY).unwrap(),
            "2013-10-04T14:26:04Z"
        );
        assert_eq!(user_meta.get(KEYID_METADATA_KEY).unwrap(), "ABCD1234");

        let user_meta = uploader.user_meta(None, None);
        assert!(user_meta.is_empty());
    }
}
