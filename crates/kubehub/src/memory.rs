//! In-memory change feed driven by a channel.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use podsync_core::{FeedEvent, FilterSpec};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{ChangeFeed, FeedError};

/// Feed whose events are pushed by the test through the sender returned from
/// [`MemoryFeed::channel`]. Once the sender is dropped the feed idles until
/// cancelled, unless built with [`MemoryFeed::closing_when_drained`].
pub struct MemoryFeed {
    inbound: Mutex<Option<mpsc::UnboundedReceiver<FeedEvent>>>,
    failure: Mutex<Option<FeedError>>,
    close_when_drained: bool,
}

impl MemoryFeed {
    pub fn channel() -> (Self, mpsc::UnboundedSender<FeedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let feed = Self { inbound: Mutex::new(Some(rx)), failure: Mutex::new(None), close_when_drained: false };
        (feed, tx)
    }

    /// A feed whose initial listing fails with `err`.
    pub fn failing(err: FeedError) -> Self {
        Self { inbound: Mutex::new(None), failure: Mutex::new(Some(err)), close_when_drained: false }
    }

    /// End the feed once the sender is dropped and every event was delivered.
    pub fn closing_when_drained(mut self) -> Self {
        self.close_when_drained = true;
        self
    }
}

#[async_trait]
impl ChangeFeed for MemoryFeed {
    async fn feed(
        &self,
        filter: FilterSpec,
        events: mpsc::Sender<FeedEvent>,
        cancel: CancellationToken,
    ) -> Result<(), FeedError> {
        let failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(err) = failure {
            return Err(err);
        }
        let inbound = self.inbound.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(mut inbound) = inbound else {
            cancel.cancelled().await;
            return Ok(());
        };
        debug!(ns = %filter.namespace, selector = %filter.label_selector, "memory feed started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                next = inbound.recv() => match next {
                    Some(ev) => {
                        if events.send(ev).await.is_err() {
                            return Ok(());
                        }
                    }
                    None if self.close_when_drained => return Ok(()),
                    None => {
                        cancel.cancelled().await;
                        return Ok(());
                    }
                },
            }
        }
    }
}
