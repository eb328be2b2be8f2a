use std::io::Result;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use pin_project::pin_project;
use tokio::io::{AsyncRead, ReadBuf};

use crate::types::ProgressHandle;

/// Rolling plaintext MD5 context shared between the byte producer and the
/// sidecar writer.
pub type SharedMd5 = Arc<Mutex<md5::Context>>;

pub fn new_shared_md5() -> SharedMd5 {
    Arc::new(Mutex::new(md5::Context::new()))
}

/// Hex lowercase digest of everything consumed so far. The context itself is
/// left usable; callers finalize once at EOF.
pub fn finalize_shared_md5(md5: &SharedMd5) -> String {
    let context = md5.lock().unwrap().clone();
    format!("{:x}", context.compute())
}

/// An `AsyncRead` adapter that reports consumed byte counts to the progress
/// aggregator and optionally feeds a rolling MD5. MD5 feeding requires the
/// reader to be consumed exactly once, in byte order; wire-side retries must
/// not run through an MD5-feeding instance.
#[pin_project]
pub struct AsyncReadWithProgress<R: AsyncRead + Send> {
    #[pin]
    inner: R,
    progress: Option<ProgressHandle>,
    md5: Option<SharedMd5>,
}

impl<R: AsyncRead + Send> AsyncReadWithProgress<R> {
    pub fn new(inner: R, progress: Option<ProgressHandle>, md5: Option<SharedMd5>) -> Self {
        Self {
            inner,
            progress,
            md5,
        }
    }
}

impl<R: AsyncRead + Send> AsyncRead for AsyncReadWithProgress<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<()>> {
        let this = self.project();

        let before = buf.filled().len();

        let result = this.inner.poll_read(cx, buf);
        if !result.is_ready() {
            return result;
        }

        let after = buf.filled().len();
        let read_bytes = after - before;

        if 0 < read_bytes {
            if let Some(md5) = this.md5 {
                md5.lock().unwrap().consume(&buf.filled()[before..after]);
            }

            if let Some(progress) = this.progress {
                progress.add_bytes_blocking(read_bytes as u64);
            }
        }

        result
    }
}
