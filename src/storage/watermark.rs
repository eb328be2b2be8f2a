//! High/low watermark read-ahead for pipe and subprocess feeds.
//!
//! A background task pulls from the underlying reader into a bounded chunk
//! queue. The producer pauses once `high` bytes are buffered and resumes when
//! consumption drains the queue to `low`, so a fast source cannot outrun a
//! slow uploader.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

const READ_CHUNK_SIZE: usize = 64 * 1024;

struct State {
    chunks: VecDeque<Bytes>,
    buffered: usize,
    eof: bool,
    closed: bool,
    error: Option<io::Error>,
    producer_waker: Option<Waker>,
    consumer_waker: Option<Waker>,
}

pub struct WatermarkedReader {
    state: Arc<Mutex<State>>,
    low: usize,
}

/// Spawns the read-ahead task and returns the consumer side.
pub fn spawn_watermarked_reader<R>(mut reader: R, high: usize, low: usize) -> WatermarkedReader
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let state = Arc::new(Mutex::new(State {
        chunks: VecDeque::new(),
        buffered: 0,
        eof: false,
        closed: false,
        error: None,
        producer_waker: None,
        consumer_waker: None,
    }));

    let producer_state = state.clone();
    tokio::spawn(async move {
        let mut buffer = vec![0u8; READ_CHUNK_SIZE];
        loop {
            // Block while the buffer sits at or above the high watermark.
            let closed = std::future::poll_fn(|cx: &mut Context<'_>| {
                let mut state = producer_state.lock().unwrap();
                if state.closed {
                    Poll::Ready(true)
                } else if state.buffered < high {
                    Poll::Ready(false)
                } else {
                    state.producer_waker = Some(cx.waker().clone());
                    Poll::Pending
                }
            })
            .await;
            if closed {
                return;
            }

            let result = reader.read(&mut buffer).await;

            let mut state = producer_state.lock().unwrap();
            match result {
                Ok(0) => {
                    state.eof = true;
                    if let Some(waker) = state.consumer_waker.take() {
                        waker.wake();
                    }
                    return;
                }
                Ok(read_bytes) => {
                    state
                        .chunks
                        .push_back(Bytes::copy_from_slice(&buffer[..read_bytes]));
                    state.buffered += read_bytes;
                    if let Some(waker) = state.consumer_waker.take() {
                        waker.wake();
                    }
                }
                Err(e) => {
                    state.error = Some(e);
                    state.eof = true;
                    if let Some(waker) = state.consumer_waker.take() {
                        waker.wake();
                    }
                    return;
                }
            }
        }
    });

    WatermarkedReader { state, low }
}

impl Drop for WatermarkedReader {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        if let Some(waker) = state.producer_waker.take() {
            waker.wake();
        }
    }
}

impl AsyncRead for WatermarkedReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut state = self.state.lock().unwrap();

        let Some(mut chunk) = state.chunks.pop_front() else {
            // Drain buffered data before surfacing a stored error.
            if let Some(error) = state.error.take() {
                return Poll::Ready(Err(error));
            }
            if state.eof {
                return Poll::Ready(Ok(()));
            }
            state.consumer_waker = Some(cx.waker().clone());
            return Poll::Pending;
        };

        let take = chunk.len().min(buf.remaining());
        buf.put_slice(&chunk.split_to(take));
        if !chunk.is_empty() {
            state.chunks.push_front(chunk);
        }
        state.buffered -= take;

        if state.buffered <= self.low {
            if let Some(waker) = state.producer_waker.take() {
                waker.wake();
            }
        }

        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn passes_bytes_through_unchanged() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let mut reader = spawn_watermarked_reader(Cursor::new(data.clone()), 64 * 1024, 16 * 1024);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn empty_source_yields_immediate_eof() {
        let mut reader = spawn_watermarked_reader(Cursor::new(Vec::new()), 1024, 512);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn producer_stops_at_high_watermark() {
        let data = vec![7u8; 1_000_000];
        let reader = spawn_watermarked_reader(Cursor::new(data), 128 * 1024, 32 * 1024);

        // Give the producer a chance to run ahead, then verify the buffer is
        // bounded by the high watermark plus one read chunk.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let buffered = reader.state.lock().unwrap().buffered;
        assert!(buffered <= 128 * 1024 + READ_CHUNK_SIZE);

        drop(reader);
    }
}
