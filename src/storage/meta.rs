//! Sidecar metadata operations.
//!
//! Sidecars are small text objects under `meta/<path>/`. Absence has
//! semantic meaning here, so 404 is translated to [`TransferError::NotFound`]
//! by the store and surfaced unchanged.

use anyhow::{Context, Result};
use bytes::Bytes;
use tracing::trace;

use crate::storage::layout::KeyLayout;
use crate::storage::ObjectStore;
use crate::types::error::{TransferError, is_not_found_error};
use crate::types::MD5SUM_SIDECAR;

#[derive(Clone)]
pub struct MetaLayer {
    store: ObjectStore,
    layout: KeyLayout,
}

impl MetaLayer {
    pub fn new(store: ObjectStore, layout: KeyLayout) -> Self {
        Self { store, layout }
    }

    pub async fn put_meta(&self, path: &str, name: &str, value: &str) -> Result<()> {
        let key = self.layout.meta_key(path, name);
        self.store
            .put_bytes(&key, Bytes::from(value.to_string()), None)
            .await
            .context("put_meta failed.")?;

        trace!(key = key, "sidecar written.");
        Ok(())
    }

    pub async fn get_meta(&self, path: &str, name: &str) -> Result<String> {
        let key = self.layout.meta_key(path, name);
        let get_object_output = self
            .store
            .get(&key, None, None)
            .await
            .context("get_meta failed.")?;

        let data = get_object_output
            .body
            .collect()
            .await
            .context(TransferError::Http { status: 0 })
            .context("get_meta body read failed.")?
            .into_bytes();

        Ok(String::from_utf8_lossy(&data).to_string())
    }

    /// Deletes one sidecar. HEAD-tests first so a missing key does not
    /// require delete permission; absence is success.
    pub async fn delete_meta(&self, path: &str, name: &str) -> Result<()> {
        let key = self.layout.meta_key(path, name);
        match self.store.head(&key).await {
            Ok(_) => self.store.delete(&key).await,
            Err(e) if is_not_found_error(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Deletes every sidecar of `path`; no orphans survive an object
    /// deletion.
    pub async fn delete_all_meta(&self, path: &str) -> Result<()> {
        let prefix = self.layout.meta_prefix(path);
        let listing = self.store.list(&prefix, None).await?;

        for object in listing.objects {
            self.store.delete(&object.key).await?;
        }

        Ok(())
    }

    /// The hex MD5 of the plaintext, trimmed of the trailing newline the
    /// sidecar format carries.
    pub async fn get_md5sum(&self, path: &str) -> Result<String> {
        Ok(self
            .get_meta(path, MD5SUM_SIDECAR)
            .await?
            .trim()
            .to_string())
    }

    pub async fn put_md5sum(&self, path: &str, hex_md5: &str) -> Result<()> {
        self.put_meta(path, MD5SUM_SIDECAR, &format!("{hex_md5}\n"))
            .await
    }
}
