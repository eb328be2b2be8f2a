//! The object store client: authenticated list/head/get/put/delete over the
//! shared S3 client. Errors carry a semantic kind (404 is always
//! distinguishable); the client itself never retries, higher layers decide
//! between resume, abort and absent-is-fine.

use std::collections::HashMap;

use anyhow::Result;
use aws_sdk_s3::Client;
use aws_sdk_s3::operation::get_object::GetObjectOutput;
use aws_sdk_s3::primitives::ByteStream;
use aws_smithy_runtime_api::client::result::SdkError;
use aws_smithy_runtime_api::http::Response;
use aws_smithy_types::body::SdkBody;
use bytes::Bytes;
use futures_util::stream::TryStreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use std::sync::Arc;
use tokio::io::{AsyncRead, BufReader};
use tokio_util::io::ReaderStream;
use tracing::trace;

use crate::types::async_callback::{AsyncReadWithProgress, SharedMd5};
use crate::types::error::TransferError;
use crate::types::{ObjectStat, ProgressHandle, RemoteObject};

pub mod client_builder;
pub mod layout;
pub mod meta;
pub mod part;
pub mod upload_manager;
pub mod watermark;

const MAX_KEYS_PER_PAGE: i32 = 1000;

#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub objects: Vec<RemoteObject>,
    pub common_prefixes: Vec<String>,
}

/// One client, shared by every component of the engine. Cloning is cheap;
/// all clones drive the same connection pool.
#[derive(Clone)]
pub struct ObjectStore {
    client: Arc<Client>,
    bucket: String,
}

impl ObjectStore {
    pub fn new(client: Arc<Client>, bucket: &str) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
        }
    }

    pub fn client(&self) -> Arc<Client> {
        self.client.clone()
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Complete listing under `prefix`. With a delimiter, directly contained
    /// keys are returned together with the rolled-up common prefixes.
    pub async fn list(&self, prefix: &str, delimiter: Option<&str>) -> Result<Listing> {
        let mut listing = Listing::default();
        let mut continuation_token: Option<String> = None;

        loop {
            let list_objects_output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .max_keys(MAX_KEYS_PER_PAGE)
                .set_delimiter(delimiter.map(str::to_string))
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| classify_sdk_error(e, "list_objects_v2"))?;

            for object in list_objects_output.contents() {
                let Some(key) = object.key() else {
                    continue;
                };
                listing.objects.push(RemoteObject {
                    key: key.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    last_modified: object.last_modified().and_then(to_chrono_datetime),
                });
            }

            for common_prefix in list_objects_output.common_prefixes() {
                if let Some(prefix) = common_prefix.prefix() {
                    listing.common_prefixes.push(prefix.to_string());
                }
            }

            if !list_objects_output.is_truncated().unwrap_or(false) {
                break;
            }

            continuation_token = list_objects_output
                .next_continuation_token()
                .map(|token| token.to_string());
        }

        trace!(
            prefix = prefix,
            objects = listing.objects.len(),
            common_prefixes = listing.common_prefixes.len(),
            "listing completed."
        );

        Ok(listing)
    }

    pub async fn head(&self, key: &str) -> Result<ObjectStat> {
        let head_object_output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, "head_object"))?;

        Ok(ObjectStat {
            content_length: head_object_output.content_length().unwrap_or(0).max(0) as u64,
            e_tag: head_object_output.e_tag().map(|e_tag| e_tag.to_string()),
            user_meta: head_object_output.metadata().cloned().unwrap_or_default(),
        })
    }

    /// Streaming GET. `range` and `if_match` carry the resume contract: a
    /// ranged re-request must name the etag of the object it resumes.
    pub async fn get(
        &self,
        key: &str,
        range: Option<String>,
        if_match: Option<String>,
    ) -> Result<GetObjectOutput> {
        self.client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .set_range(range)
            .set_if_match(if_match)
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, "get_object"))
    }

    /// Small full-body PUT, used for sidecars.
    pub async fn put_bytes(
        &self,
        key: &str,
        bytes: Bytes,
        user_meta: Option<HashMap<String, String>>,
    ) -> Result<String> {
        let content_length = bytes.len() as i64;
        let put_object_output = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_length(content_length)
            .body(ByteStream::from(bytes))
            .set_metadata(user_meta)
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, "put_object"))?;

        Ok(put_object_output
            .e_tag()
            .unwrap_or_default()
            .to_string())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, "delete_object"))?;

        trace!(key = key, "object deleted.");
        Ok(())
    }
}

/// Attaches the semantic error kind and the failed operation to an SDK error
/// without losing the original chain.
pub(crate) fn classify_sdk_error<E>(
    e: SdkError<E, Response<SdkBody>>,
    operation: &'static str,
) -> anyhow::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    let kind = match &e {
        SdkError::ServiceError(context) => {
            let status = context.raw().status().as_u16();
            match status {
                404 => TransferError::NotFound,
                401 | 403 => TransferError::Auth,
                status => TransferError::Http { status },
            }
        }
        // No response ever hit the wire; status 0 marks transport-level
        // failures, which the retry rule treats as retriable.
        _ => TransferError::Http { status: 0 },
    };

    anyhow::Error::new(e)
        .context(kind)
        .context(format!("aws_sdk_s3::client::Client {operation}() failed."))
}

pub(crate) fn to_chrono_datetime(
    datetime: &aws_smithy_types::DateTime,
) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::from_timestamp(datetime.secs(), datetime.subsec_nanos())
}

/// Wraps a reader into a request body that reports wire progress and
/// optionally feeds the rolling plaintext MD5 as bytes leave the producer.
pub fn convert_to_buf_byte_stream_with_progress<R>(
    byte_stream: R,
    progress: Option<ProgressHandle>,
    md5: Option<SharedMd5>,
) -> ByteStream
where
    R: AsyncRead + Send + Sync + 'static,
{
    let async_read = AsyncReadWithProgress::new(byte_stream, progress, md5);

    let buf_reader = BufReader::new(async_read);

    let reader_stream = ReaderStream::new(buf_reader).map_ok(Frame::data);

    let stream_body = StreamBody::new(reader_stream);

    let boxed_body = BodyExt::boxed(stream_body);

    ByteStream::new(SdkBody::from_body_1_x(boxed_body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chrono_conversion() {
        init_dummy_tracing_subscriber();

        let datetime = aws_smithy_types::DateTime::from_secs(1380896764);
        let converted = to_chrono_datetime(&datetime).unwrap();
        assert_eq!(converted.timestamp(), 1380896764);
    }

    #[tokio::test]
    async fn progress_byte_stream_collects_and_hashes() {
        init_dummy_tracing_subscriber();

        let md5 = crate::types::async_callback::new_shared_md5();
        let stream = convert_to_buf_byte_stream_with_progress(
            std::io::Cursor::new(b"The value of key-1".to_vec()),
            None,
            Some(md5.clone()),
        );

        let collected = stream.collect().await.unwrap().into_bytes();
        assert_eq!(&collected[..], b"The value of key-1");
        assert_eq!(
            crate::types::async_callback::finalize_shared_md5(&md5),
            "e28cbeebcc243df62a59d90ddfe4b3e8"
        );
    }

    fn init_dummy_tracing_subscriber() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("dummy=trace")
            .try_init();
    }
}
