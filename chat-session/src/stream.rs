//! Cancellable reply streams.
//!
//! A producer task pushes text fragments through a [`ReplySender`]; the
//! consumer pulls them from the matching [`ReplyHandle`] at its own pace and
//! learns how the stream ended from its [`StreamStatus`].

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How a reply stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamStatus {
    Completed,
    Cancelled,
    Failed(String),
}

impl StreamStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl std::fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

#[derive(Debug)]
enum StreamEvent {
    Fragment(String),
    Finished(StreamStatus),
}

/// Producer side of a reply stream.
pub struct ReplySender {
    events: mpsc::UnboundedSender<StreamEvent>,
    cancel: CancellationToken,
}

impl ReplySender {
    /// Push one fragment. Returns `false` once the consumer is gone.
    pub fn fragment(&self, text: impl Into<String>) -> bool {
        self.events.send(StreamEvent::Fragment(text.into())).is_ok()
    }

    /// End the stream.
    pub fn finish(self, status: StreamStatus) {
        let _ = self.events.send(StreamEvent::Finished(status));
    }

    /// Token the producer should watch to stop early.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Consumer side of a reply stream.
///
/// Fragments come out in order, once each. After the terminal status is
/// known no further fragments are yielded.
pub struct ReplyHandle {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    cancel: CancellationToken,
    status: Option<StreamStatus>,
}

impl ReplyHandle {
    /// Create a connected sender/handle pair.
    pub fn channel() -> (ReplySender, ReplyHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        (
            ReplySender {
                events: tx,
                cancel: cancel.clone(),
            },
            ReplyHandle {
                events: rx,
                cancel,
                status: None,
            },
        )
    }

    /// Wait for the next fragment. `None` means the stream has ended; see
    /// [`ReplyHandle::status`] for how.
    pub async fn next_fragment(&mut self) -> Option<String> {
        if self.status.is_some() {
            return None;
        }
        if self.cancel.is_cancelled() {
            self.status = Some(StreamStatus::Cancelled);
            return None;
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.status = Some(StreamStatus::Cancelled);
                None
            }
            event = self.events.recv() => match event {
                Some(StreamEvent::Fragment(text)) => Some(text),
                Some(StreamEvent::Finished(status)) => {
                    self.status = Some(status);
                    None
                }
                None => {
                    self.status = Some(StreamStatus::Failed(
                        "reply stream closed unexpectedly".into(),
                    ));
                    None
                }
            },
        }
    }

    /// Stop the stream. Fragments not yet consumed are discarded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this stream, e.g. for a Ctrl-C handler.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Terminal status, once the stream has ended.
    pub fn status(&self) -> Option<&StreamStatus> {
        self.status.as_ref()
    }

    /// Consume remaining fragments and return the terminal status.
    pub async fn wait(&mut self) -> StreamStatus {
        while self.next_fragment().await.is_some() {}
        self.status
            .clone()
            .unwrap_or_else(|| StreamStatus::Failed("reply stream closed unexpectedly".into()))
    }
}

impl Drop for ReplyHandle {
    fn drop(&mut self) {
        // Producers stop reading upstream once nobody listens
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fragments_in_order_then_completed() {
        let (tx, mut handle) = ReplyHandle::channel();
        tx.fragment("Hi");
        tx.fragment(" there!");
        tx.finish(StreamStatus::Completed);

        assert_eq!(handle.next_fragment().await.as_deref(), Some("Hi"));
        assert_eq!(handle.next_fragment().await.as_deref(), Some(" there!"));
        assert_eq!(handle.next_fragment().await, None);
        assert_eq!(handle.status(), Some(&StreamStatus::Completed));
        // Not restartable
        assert_eq!(handle.next_fragment().await, None);
    }

    #[tokio::test]
    async fn test_cancel_discards_buffered_fragments() {
        let (tx, mut handle) = ReplyHandle::channel();
        tx.fragment("Hi th");
        tx.fragment("ere!");

        assert_eq!(handle.next_fragment().await.as_deref(), Some("Hi th"));
        handle.cancel();
        assert!(tx.is_cancelled());

        assert_eq!(handle.next_fragment().await, None);
        assert_eq!(handle.status(), Some(&StreamStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_wakes_pending_consumer() {
        let (tx, mut handle) = ReplyHandle::channel();
        let token = handle.cancellation_token();

        let waiter = tokio::spawn(async move {
            let fragment = handle.next_fragment().await;
            (fragment, handle.status().cloned())
        });
        tokio::task::yield_now().await;
        token.cancel();

        let (fragment, status) = waiter.await.unwrap();
        assert_eq!(fragment, None);
        assert_eq!(status, Some(StreamStatus::Cancelled));
        drop(tx);
    }

    #[tokio::test]
    async fn test_dropped_producer_is_failure() {
        let (tx, mut handle) = ReplyHandle::channel();
        tx.fragment("partial");
        drop(tx);

        assert_eq!(handle.wait().await, StreamStatus::Failed("reply stream closed unexpectedly".into()));
    }

    #[tokio::test]
    async fn test_dropping_handle_cancels_producer() {
        let (tx, handle) = ReplyHandle::channel();
        drop(handle);
        assert!(tx.is_cancelled());
        assert!(!tx.fragment("nobody listens"));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(StreamStatus::Completed.to_string(), "completed");
        assert_eq!(
            StreamStatus::Failed("boom".into()).to_string(),
            "failed: boom"
        );
        assert!(!StreamStatus::Cancelled.is_completed());
    }
}
