//! podsync kubehub: change feed contract and the kube list+watch adapter

#![forbid(unsafe_code)]

use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::Api,
    runtime::{watcher, WatchStreamExt},
    Client,
};
use metrics::counter;
use podsync_core::{FeedEvent, FilterSpec};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod tracker;
#[cfg(feature = "test-util")]
mod memory;

pub use tracker::{identity_of, remote_object, FeedTracker};
#[cfg(feature = "test-util")]
pub use memory::MemoryFeed;

/// Errors that end a feed.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// Failure before the first listing completed. Later watch errors are retried.
    #[error("watch failed before initial listing: {0}")]
    Watch(#[from] watcher::Error),
    #[error("kube client: {0}")]
    Client(#[from] kube::Error),
    #[error("feed disconnected: {0}")]
    Disconnected(String),
}

/// Source of typed object events for a filter.
///
/// Implementations push events onto `events` one at a time until `cancel` fires
/// or the receiver hangs up, and then return `Ok(())`. The initial listing must be
/// delivered as `Added` events before any other event for the same identity.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn feed(
        &self,
        filter: FilterSpec,
        events: mpsc::Sender<FeedEvent>,
        cancel: CancellationToken,
    ) -> Result<(), FeedError>;
}

/// Build a client from kubeconfig (`KUBECONFIG` or `~/.kube/config`) or the in-cluster environment.
pub async fn get_kube_client() -> Result<Client, FeedError> {
    Ok(Client::try_default().await?)
}

/// List+watch of pods through `kube::runtime::watcher`.
#[derive(Clone)]
pub struct KubeFeed {
    client: Client,
}

impl KubeFeed {
    pub fn new(client: Client) -> Self { Self { client } }

    pub async fn try_default() -> Result<Self, FeedError> {
        Ok(Self::new(get_kube_client().await?))
    }

    fn api(&self, filter: &FilterSpec) -> Api<Pod> {
        if filter.namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), &filter.namespace)
        }
    }
}

fn watcher_config(filter: &FilterSpec) -> watcher::Config {
    let cfg = watcher::Config::default();
    if filter.label_selector.is_empty() {
        cfg
    } else {
        cfg.labels(&filter.label_selector)
    }
}

fn resync_timer(filter: &FilterSpec) -> Option<Interval> {
    filter.resync_period().map(|period| {
        let mut t = interval_at(Instant::now() + period, period);
        t.set_missed_tick_behavior(MissedTickBehavior::Delay);
        t
    })
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[async_trait]
impl ChangeFeed for KubeFeed {
    async fn feed(
        &self,
        filter: FilterSpec,
        events: mpsc::Sender<FeedEvent>,
        cancel: CancellationToken,
    ) -> Result<(), FeedError> {
        let stream = watcher(self.api(&filter), watcher_config(&filter)).default_backoff();
        pump(stream, &filter, events, cancel).await
    }
}

/// Drive a watcher stream into `events` until cancelled or the consumer hangs up.
///
/// An error before the first listing ends the feed; later errors are counted and
/// skipped. The resync timer is armed by the first listing.
async fn pump<S>(
    stream: S,
    filter: &FilterSpec,
    events: mpsc::Sender<FeedEvent>,
    cancel: CancellationToken,
) -> Result<(), FeedError>
where
    S: Stream<Item = Result<watcher::Event<Pod>, watcher::Error>>,
{
    futures::pin_mut!(stream);
    let mut tracker = FeedTracker::default();
    let mut resync: Option<Interval> = None;
    let mut listed = false;
    info!(ns = %filter.namespace, selector = %filter.label_selector, resync = ?filter.resync_period(), "pod watcher started");

    loop {
        let batch = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("pod watcher cancelled");
                return Ok(());
            }
            _ = next_tick(&mut resync) => {
                counter!("feed_resyncs_total", 1u64);
                debug!(count = tracker.len(), "periodic resync");
                tracker.resync()
            }
            next = stream.try_next() => match next {
                Ok(Some(ev)) => {
                    if matches!(ev, watcher::Event::Restarted(_)) && !listed {
                        info!("initial pod listing received");
                        listed = true;
                        resync = resync_timer(filter);
                    }
                    tracker.observe(ev)
                }
                Ok(None) => {
                    warn!("pod watch stream ended");
                    return Err(FeedError::Disconnected("watch stream ended".into()));
                }
                Err(e) if !listed => return Err(FeedError::Watch(e)),
                Err(e) => {
                    counter!("feed_watch_errors_total", 1u64);
                    warn!(error = %e, "pod watch error; re-establishing");
                    continue;
                }
            }
        };
        for ev in batch {
            if events.send(ev).await.is_err() {
                debug!("feed consumer gone");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::core::ErrorResponse;
    use podsync_core::Identity;
    use std::time::Duration;

    type WatchItem = Result<watcher::Event<Pod>, watcher::Error>;

    fn pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn watch_error() -> watcher::Error {
        watcher::Error::WatchError(ErrorResponse {
            status: "Failure".into(),
            message: "too old resource version".into(),
            reason: "Expired".into(),
            code: 410,
        })
    }

    /// Watcher stream fed by the test; stays pending until an item is pushed.
    fn scripted() -> (mpsc::UnboundedSender<WatchItem>, impl Stream<Item = WatchItem>) {
        let (tx, rx) = mpsc::unbounded_channel::<WatchItem>();
        let stream = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
        (tx, stream)
    }

    fn spawn_pump(
        filter: FilterSpec,
    ) -> (
        mpsc::UnboundedSender<WatchItem>,
        mpsc::Receiver<FeedEvent>,
        CancellationToken,
        tokio::task::JoinHandle<Result<(), FeedError>>,
    ) {
        let (watch_tx, stream) = scripted();
        let (out_tx, out_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { pump(stream, &filter, out_tx, cancel).await }
        });
        (watch_tx, out_rx, cancel, task)
    }

    async fn next(rx: &mut mpsc::Receiver<FeedEvent>) -> FeedEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no feed event in time")
            .expect("feed closed")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn error_before_listing_ends_feed() {
        let (watch_tx, _out, _cancel, task) = spawn_pump(FilterSpec::default());
        watch_tx.send(Err(watch_error())).unwrap();
        let res = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(matches!(res, Err(FeedError::Watch(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn error_after_listing_is_skipped() {
        let (watch_tx, mut out, cancel, task) = spawn_pump(FilterSpec::default());
        watch_tx.send(Ok(watcher::Event::Restarted(vec![pod("a")]))).unwrap();
        assert!(matches!(next(&mut out).await, FeedEvent::Added(o) if o.identity == Identity::new("default", "a")));
        assert_eq!(next(&mut out).await, FeedEvent::Resynced);

        watch_tx.send(Err(watch_error())).unwrap();
        watch_tx.send(Ok(watcher::Event::Applied(pod("b")))).unwrap();
        assert!(matches!(next(&mut out).await, FeedEvent::Added(o) if o.identity == Identity::new("default", "b")));

        cancel.cancel();
        let res = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(res.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stream_end_is_a_disconnect() {
        let (watch_tx, _out, _cancel, task) = spawn_pump(FilterSpec::default());
        drop(watch_tx);
        let res = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(matches!(res, Err(FeedError::Disconnected(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn consumer_hangup_ends_feed() {
        let (watch_tx, out, _cancel, task) = spawn_pump(FilterSpec::default());
        drop(out);
        watch_tx.send(Ok(watcher::Event::Applied(pod("a")))).unwrap();
        let res = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(res.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn resync_waits_for_initial_listing() {
        let filter = FilterSpec { resync_interval: Some(Duration::from_secs(10)), ..FilterSpec::default() };
        let (watch_tx, mut out, cancel, task) = spawn_pump(filter);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(out.try_recv().is_err(), "resync before the initial listing");

        watch_tx.send(Ok(watcher::Event::Restarted(vec![pod("a")]))).unwrap();
        assert!(matches!(next(&mut out).await, FeedEvent::Added(_)));
        assert_eq!(next(&mut out).await, FeedEvent::Resynced);

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(out.try_recv().is_err(), "resync before one period elapsed");

        assert!(matches!(next(&mut out).await, FeedEvent::Updated(o) if o.identity == Identity::new("default", "a")));
        assert_eq!(next(&mut out).await, FeedEvent::Resynced);

        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }
}
