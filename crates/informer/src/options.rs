//! Informer configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use podsync_core::{FilterSpec, PodRecord};
use podsync_kubehub::ChangeFeed;
use tracing::Dispatch;

/// Consumer callback. Invoked from the event loop, never concurrently with itself.
pub type OnUpdate = Arc<dyn Fn(&[PodRecord]) + Send + Sync>;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Builder-style options for [`crate::PodInformer`].
///
/// `on_update` and `feed` are required; [`crate::PodInformer::new`] rejects
/// options without them.
#[derive(Clone)]
pub struct Options {
    pub(crate) filter: FilterSpec,
    pub(crate) on_update: Option<OnUpdate>,
    pub(crate) feed: Option<Arc<dyn ChangeFeed>>,
    pub(crate) queue_capacity: usize,
    pub(crate) logger: Option<Dispatch>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            filter: FilterSpec::default(),
            on_update: None,
            feed: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            logger: None,
        }
    }
}

impl Options {
    pub fn filter(mut self, filter: FilterSpec) -> Self {
        self.filter = filter;
        self
    }

    /// Restrict to one namespace; empty watches all namespaces.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.filter.namespace = namespace.into();
        self
    }

    /// Label selector, e.g. `app=miniapi,tier=backend`. Empty matches everything.
    pub fn label_selector(mut self, selector: impl Into<String>) -> Self {
        self.filter.label_selector = selector.into();
        self
    }

    pub fn resync_interval(mut self, period: Option<Duration>) -> Self {
        self.filter.resync_interval = period;
        self
    }

    pub fn on_update<F>(mut self, f: F) -> Self
    where
        F: Fn(&[PodRecord]) + Send + Sync + 'static,
    {
        self.on_update = Some(Arc::new(f));
        self
    }

    pub fn feed<F: ChangeFeed + 'static>(mut self, feed: F) -> Self {
        self.feed = Some(Arc::new(feed));
        self
    }

    /// Bound of the feed → event loop queue.
    pub fn queue_capacity(mut self, cap: usize) -> Self {
        self.queue_capacity = cap.max(1);
        self
    }

    /// Route the informer's own logs to `dispatch` instead of the global subscriber.
    pub fn logger(mut self, dispatch: impl Into<Dispatch>) -> Self {
        self.logger = Some(dispatch.into());
        self
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("filter", &self.filter)
            .field("on_update", &self.on_update.is_some())
            .field("feed", &self.feed.is_some())
            .field("queue_capacity", &self.queue_capacity)
            .field("logger", &self.logger.is_some())
            .finish()
    }
}
