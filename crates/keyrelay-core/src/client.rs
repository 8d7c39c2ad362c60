//! The connection back to the waiting client.
//!
//! Streaming clients get a bounded byte channel whose receiving half is the
//! HTTP response body. The sending half reports saturation instead of blocking
//! so heartbeats can tell a stalled reader from a slow upstream. Blocking
//! clients get a single-slot reply channel.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::Stream;
use keyrelay_common::ApiFormat;
use tokio::sync::mpsc;

use crate::error::GatewayError;
use crate::response::ProxyResponse;

pub const DEFAULT_SINK_CAPACITY: usize = 32;

#[derive(Debug, Default)]
struct SinkStats {
    written: AtomicU64,
    drained: AtomicU64,
    killed: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The client is not reading fast enough; the frame was dropped.
    Saturated,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("client connection terminated by the proxy")]
pub struct SinkKilled;

#[derive(Debug, Clone)]
pub struct ClientSink {
    tx: mpsc::Sender<Bytes>,
    stats: Arc<SinkStats>,
}

/// Creates a connected sink/body pair.
pub fn client_channel(capacity: usize) -> (ClientSink, ClientStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let stats = Arc::new(SinkStats::default());
    (
        ClientSink {
            tx,
            stats: stats.clone(),
        },
        ClientStream {
            rx,
            stats,
            finished: false,
        },
    )
}

impl ClientSink {
    pub fn try_write(&self, frame: impl Into<Bytes>) -> WriteOutcome {
        if self.is_killed() {
            return WriteOutcome::Closed;
        }
        let frame = frame.into();
        let len = frame.len() as u64;
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.stats.written.fetch_add(len, Ordering::Relaxed);
                WriteOutcome::Written
            }
            Err(mpsc::error::TrySendError::Full(_)) => WriteOutcome::Saturated,
            Err(mpsc::error::TrySendError::Closed(_)) => WriteOutcome::Closed,
        }
    }

    /// Waits for room; returns false once the client is gone.
    pub async fn write(&self, frame: impl Into<Bytes>) -> bool {
        if self.is_killed() {
            return false;
        }
        let frame = frame.into();
        let len = frame.len() as u64;
        if self.tx.send(frame).await.is_err() {
            return false;
        }
        self.stats.written.fetch_add(len, Ordering::Relaxed);
        true
    }

    /// Bytes accepted by the sink that the client has not consumed yet.
    pub fn pending_bytes(&self) -> u64 {
        let written = self.stats.written.load(Ordering::Relaxed);
        written.saturating_sub(self.drained_bytes())
    }

    pub fn drained_bytes(&self) -> u64 {
        self.stats.drained.load(Ordering::Relaxed)
    }

    /// Ends the response body with an error so the connection is torn down.
    pub fn kill(&self) {
        self.stats.killed.store(true, Ordering::SeqCst);
        // Wakes a reader parked on an empty channel.
        let _ = self.tx.try_send(Bytes::new());
    }

    pub fn is_killed(&self) -> bool {
        self.stats.killed.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || self.is_killed()
    }

    /// Resolves when the receiving body has been dropped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Response body half of a [`ClientSink`].
#[derive(Debug)]
pub struct ClientStream {
    rx: mpsc::Receiver<Bytes>,
    stats: Arc<SinkStats>,
    finished: bool,
}

impl Stream for ClientStream {
    type Item = Result<Bytes, SinkKilled>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        if self.stats.killed.load(Ordering::SeqCst) {
            self.finished = true;
            self.rx.close();
            return Poll::Ready(Some(Err(SinkKilled)));
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(frame)) => {
                self.stats
                    .drained
                    .fetch_add(frame.len() as u64, Ordering::Relaxed);
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Receiving half of a blocking client's reply.
#[derive(Debug)]
pub struct BlockingReply {
    rx: mpsc::Receiver<ProxyResponse>,
}

impl BlockingReply {
    /// `None` when the job was dropped without an answer.
    pub async fn recv(mut self) -> Option<ProxyResponse> {
        self.rx.recv().await
    }
}

/// Where the outcome of a job is delivered.
#[derive(Debug, Clone)]
pub enum ClientHandle {
    Stream(ClientSink),
    Blocking(mpsc::Sender<ProxyResponse>),
}

impl ClientHandle {
    pub fn streaming(capacity: usize) -> (Self, ClientStream) {
        let (sink, stream) = client_channel(capacity);
        (ClientHandle::Stream(sink), stream)
    }

    pub fn blocking() -> (Self, BlockingReply) {
        let (tx, rx) = mpsc::channel(1);
        (ClientHandle::Blocking(tx), BlockingReply { rx })
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, ClientHandle::Stream(_))
    }

    pub fn sink(&self) -> Option<&ClientSink> {
        match self {
            ClientHandle::Stream(sink) => Some(sink),
            ClientHandle::Blocking(_) => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            ClientHandle::Stream(sink) => sink.is_closed(),
            ClientHandle::Blocking(tx) => tx.is_closed(),
        }
    }

    /// Resolves once the client has disconnected.
    pub async fn closed(&self) {
        match self {
            ClientHandle::Stream(sink) => sink.closed().await,
            ClientHandle::Blocking(tx) => tx.closed().await,
        }
    }

    pub async fn respond(&self, response: ProxyResponse) {
        match self {
            ClientHandle::Blocking(tx) => {
                let _ = tx.send(response).await;
            }
            ClientHandle::Stream(sink) => {
                sink.write(response.body).await;
            }
        }
    }

    /// Reports `error` in whatever shape the client can still receive.
    pub async fn fail(&self, error: &GatewayError, format: ApiFormat, model: &str) {
        match self {
            ClientHandle::Blocking(tx) => {
                let _ = tx.send(error.clone().into_response(format)).await;
            }
            ClientHandle::Stream(sink) => {
                sink.write(error.to_stream_bytes(format, model)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;

    #[tokio::test]
    async fn saturation_is_reported_and_drain_tracked() {
        let (sink, mut stream) = client_channel(1);
        assert_eq!(sink.try_write("abc"), WriteOutcome::Written);
        assert_eq!(sink.try_write("def"), WriteOutcome::Saturated);
        assert_eq!(sink.pending_bytes(), 3);

        assert_eq!(stream.next().await, Some(Ok(Bytes::from("abc"))));
        assert_eq!(sink.pending_bytes(), 0);
        assert_eq!(sink.drained_bytes(), 3);

        drop(stream);
        assert_eq!(sink.try_write("ghi"), WriteOutcome::Closed);
        assert!(sink.is_closed());
    }

    #[tokio::test]
    async fn kill_ends_body_with_error() {
        let (sink, mut stream) = client_channel(4);
        sink.try_write("x");
        sink.kill();
        assert_eq!(stream.next().await, Some(Err(SinkKilled)));
        assert_eq!(stream.next().await, None);
        assert!(!sink.write("late").await);
    }

    #[tokio::test]
    async fn blocking_reply_observes_disconnect() {
        let (handle, reply) = ClientHandle::blocking();
        assert!(!handle.is_closed());
        drop(reply);
        handle.closed().await;
        assert!(handle.is_closed());
    }
}
