//! podsync informer: keeps a filtered pod snapshot current and hands every
//! change to a consumer callback.
//!
//! A [`PodInformer`] moves through `Created → Running → Stopping → Stopped`.
//! [`PodInformer::run`] drives the event loop and returns once the informer is
//! stopped or its change feed ends; [`PodInformer::stop`] may be called from any
//! other task. Events are applied one at a time: store mutation, full
//! re-projection, then one callback invocation per add/update/delete.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use metrics::{counter, gauge, histogram};
use podsync_core::{project, FeedEvent, FilterSpec, Projection, Snapshot};
use podsync_kubehub::{ChangeFeed, FeedError};
use podsync_store::LocalStore;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, info_span, Dispatch, Instrument};

mod options;

pub use options::{Options, OnUpdate, DEFAULT_QUEUE_CAPACITY};
pub use podsync_core::PodRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Lifecycle::Created => "created",
            Lifecycle::Running => "running",
            Lifecycle::Stopping => "stopping",
            Lifecycle::Stopped => "stopped",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InformerError {
    #[error("Options::on_update is required")]
    MissingCallback,
    #[error("Options::feed is required")]
    MissingFeed,
    /// `run` called twice, or `stop` called before `run` or more than once.
    #[error("{op} not allowed while {state}")]
    Lifecycle { op: &'static str, state: Lifecycle },
    #[error("change feed: {0}")]
    Feed(#[from] FeedError),
    #[error("feed task: {0}")]
    FeedTask(String),
}

pub struct PodInformer {
    filter: FilterSpec,
    on_update: OnUpdate,
    feed: Arc<dyn ChangeFeed>,
    queue_capacity: usize,
    logger: Option<Dispatch>,
    state: watch::Sender<Lifecycle>,
    cancel: CancellationToken,
    snap: ArcSwap<Snapshot>,
    epoch: watch::Sender<u64>,
}

/// Marks the informer stopped when `run` unwinds, including by panic.
struct MarkStopped<'a>(&'a watch::Sender<Lifecycle>);

impl Drop for MarkStopped<'_> {
    fn drop(&mut self) {
        self.0.send_replace(Lifecycle::Stopped);
    }
}

impl PodInformer {
    /// Validate options. Performs no I/O.
    pub fn new(options: Options) -> Result<Self, InformerError> {
        let on_update = options.on_update.ok_or(InformerError::MissingCallback)?;
        let feed = options.feed.ok_or(InformerError::MissingFeed)?;
        let (state, _) = watch::channel(Lifecycle::Created);
        let (epoch, _) = watch::channel(0u64);
        Ok(Self {
            filter: options.filter,
            on_update,
            feed,
            queue_capacity: options.queue_capacity.max(1),
            logger: options.logger,
            state,
            cancel: CancellationToken::new(),
            snap: ArcSwap::from_pointee(Snapshot::default()),
            epoch,
        })
    }

    pub fn filter(&self) -> &FilterSpec { &self.filter }
    pub fn state(&self) -> Lifecycle { *self.state.borrow() }
    pub fn subscribe_state(&self) -> watch::Receiver<Lifecycle> { self.state.subscribe() }

    /// Last snapshot handed to the callback (epoch 0 and empty before the first event).
    pub fn snapshot(&self) -> Arc<Snapshot> { self.snap.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch.subscribe() }

    /// Run the event loop until [`stop`](Self::stop) is called or the feed ends.
    ///
    /// An error from the feed (for example a failed initial listing) is returned.
    /// A panicking callback unwinds out of this call; the feed is still cancelled.
    pub async fn run(&self) -> Result<(), InformerError> {
        self.transition("run", Lifecycle::Created, Lifecycle::Running)?;
        let _stopped = MarkStopped(&self.state);
        let fut = async {
            let span = info_span!("informer", ns = %self.filter.namespace, selector = %self.filter.label_selector);
            self.event_loop().instrument(span).await
        };
        match &self.logger {
            Some(dispatch) => fut.with_subscriber(dispatch.clone()).await,
            None => fut.await,
        }
    }

    /// Request shutdown. Does not wait for `run` to return.
    pub fn stop(&self) -> Result<(), InformerError> {
        self.transition("stop", Lifecycle::Running, Lifecycle::Stopping)?;
        self.cancel.cancel();
        let log = || info!(ns = %self.filter.namespace, "informer stop requested");
        match &self.logger {
            Some(dispatch) => tracing::dispatcher::with_default(dispatch, log),
            None => log(),
        }
        Ok(())
    }

    fn transition(&self, op: &'static str, from: Lifecycle, to: Lifecycle) -> Result<(), InformerError> {
        let mut observed = from;
        self.state.send_if_modified(|s| {
            observed = *s;
            if *s == from {
                *s = to;
                true
            } else {
                false
            }
        });
        if observed == from {
            Ok(())
        } else {
            Err(InformerError::Lifecycle { op, state: observed })
        }
    }

    async fn event_loop(&self) -> Result<(), InformerError> {
        let _cancel_on_exit = self.cancel.clone().drop_guard();
        let (tx, mut rx) = mpsc::channel::<FeedEvent>(self.queue_capacity);
        let feed_task = tokio::spawn({
            let feed = Arc::clone(&self.feed);
            let filter = self.filter.clone();
            let cancel = self.cancel.clone();
            async move { feed.feed(filter, tx, cancel).await }
                .in_current_span()
                .with_current_subscriber()
        });
        info!(resync = ?self.filter.resync_period(), "informer running");

        let mut store = LocalStore::new();
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("stop signal observed");
                    break;
                }
                next = rx.recv() => match next {
                    Some(event) => self.dispatch(&mut store, event),
                    None => {
                        debug!("change feed closed");
                        break;
                    }
                },
            }
        }

        self.cancel.cancel();
        drop(rx);
        let outcome = match feed_task.await {
            Ok(res) => res.map_err(InformerError::from),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(InformerError::FeedTask(e.to_string())),
        };
        match &outcome {
            Ok(()) => info!(objects = store.len(), "informer stopped"),
            Err(e) => error!(error = %e, "informer stopped with error"),
        }
        outcome
    }

    fn dispatch(&self, store: &mut LocalStore, event: FeedEvent) {
        counter!("informer_events_total", 1u64, "kind" => event.kind());
        if matches!(event, FeedEvent::Resynced) {
            debug!(objects = store.len(), "resync pass complete");
            return;
        }
        if let Some(id) = event.identity() {
            debug!(kind = event.kind(), key = %id, "event");
        }
        store.apply(event);
        self.update(store);
    }

    /// Re-project the whole store and hand the result to the callback.
    fn update(&self, store: &LocalStore) {
        let started = Instant::now();
        let Projection { pods, errors } = project(store.list_all());
        for e in &errors {
            counter!("informer_shape_errors_total", 1u64);
            error!(error = %e, "object left out of snapshot");
        }
        histogram!("informer_project_ms", started.elapsed().as_secs_f64() * 1000.0);
        gauge!("informer_pods", pods.len() as f64);
        debug!(objects = store.len(), pods = pods.len(), "delivering snapshot");

        let epoch = self.snap.load().epoch + 1;
        let snap = Arc::new(Snapshot { epoch, pods });
        self.snap.store(Arc::clone(&snap));
        (self.on_update)(&snap.pods);
        counter!("informer_updates_total", 1u64);
        self.epoch.send_replace(epoch);
    }
}
