//! Live mirror of one cluster-stored secret.
//!
//! A [`Synchronizer`] consumes a single [`EventStream`], backed either by a native watch or by
//! the [`poll`] fallback, and keeps a cached copy of the secret up to date. Callers can hook into
//! the stream with action handlers; the [`overwatch::Overwatch`] restarts sessions that end.

use futures::{FutureExt, StreamExt, future::BoxFuture};
use k8s_openapi::api::core::v1::Secret;
use log::{debug, error, info, trace, warn};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};

use crate::{Error, ObjectKey, Result};

pub mod memory;
pub mod overwatch;
pub mod poll;
pub mod store;

#[cfg(test)]
pub(crate) mod test;

pub use store::SecretStore;

/// Default time between two polls of the synchronized secret.
pub const SECRET_SYNC_PERIOD: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Added(Secret),
    Modified(Secret),
    Deleted(Secret),
    Error(Error),
}
impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Added(_) => EventKind::Added,
            Self::Modified(_) => EventKind::Modified,
            Self::Deleted(_) => EventKind::Deleted,
            Self::Error(_) => EventKind::Error,
        }
    }

    pub fn into_object(self) -> Option<Secret> {
        match self {
            Self::Added(s) | Self::Modified(s) | Self::Deleted(s) => Some(s),
            Self::Error(_) => None,
        }
    }
}

/// Blocking "next event" source, whatever the transport behind it.
pub type EventStream = std::pin::Pin<Box<dyn futures::Stream<Item = Event> + Send>>;

pub type ActionHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// native watch, falling back to polling if it fails
    Watch,
    Poll,
}
impl std::str::FromStr for SyncMode {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "watch" => Ok(Self::Watch),
            "poll" => Ok(Self::Poll),
            _ => Err(format!("unknown sync mode: {s}")),
        }
    }
}

pub struct Builder {
    pub store: SecretStore,
    pub key: ObjectKey,
    pub mode: SyncMode,
    pub poll_period: Duration,
}
impl Builder {
    pub fn build(self) -> Arc<Synchronizer> {
        Arc::new(Synchronizer {
            key: self.key,
            store: self.store,
            mode: self.mode,
            poll_period: self.poll_period,
            secret: Mutex::new(None),
            handlers: Mutex::new(HashMap::new()),
            errors: Mutex::new(None),
            watch_failed: AtomicBool::new(false),
        })
    }
}

pub struct Synchronizer {
    key: ObjectKey,
    store: SecretStore,
    mode: SyncMode,
    poll_period: Duration,

    secret: Mutex<Option<Secret>>,
    handlers: Mutex<HashMap<EventKind, Vec<ActionHandler>>>,
    errors: Mutex<Option<oneshot::Receiver<Error>>>,
    watch_failed: AtomicBool,
}

impl Synchronizer {
    pub fn name(&self) -> String {
        format!("{}-{}", self.key.name, self.key.namespace)
    }

    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    /// Starts a new watch session. The session's outcome is delivered on [`Self::error`].
    pub async fn start(self: &Arc<Self>) {
        let (tx, rx) = oneshot::channel();
        *self.errors.lock().await = Some(rx);

        let events = self.events().await;

        let this = self.clone();
        tokio::spawn(async move {
            info!("starting secret synchronizer for {}", this.key);
            let err = this.process(events).await;
            // nobody may be listening anymore
            let _ = tx.send(err);
        });
    }

    /// Takes the receiver of the current session's terminal error.
    ///
    /// The receiver yields exactly one error when the session ends, or is closed without a value
    /// if the session was dropped.
    pub async fn error(&self) -> Option<oneshot::Receiver<Error>> {
        self.errors.lock().await.take()
    }

    /// Returns the cached secret, fetching it synchronously if it was never populated.
    pub async fn get(&self) -> Option<Secret> {
        let mut secret = self.secret.lock().await;

        if secret.is_none() {
            match self.store.get(&self.key).await {
                Ok(Some(s)) => {
                    info!("initializing secret synchronizer synchronously using secret {}", self.key);
                    *secret = Some(s);
                }
                Ok(None) => {}
                Err(e) => warn!("{}: failed to get secret: {e}", self.name()),
            }
        }

        secret.clone()
    }

    pub async fn refresh(&self) {
        let mut secret = self.secret.lock().await;
        match self.store.get(&self.key).await {
            Ok(s) => *secret = s,
            Err(e) => error!("{}: failed to refresh secret: {e}", self.name()),
        }
    }

    pub async fn create(&self, secret: &Secret) -> Result<()> {
        self.store.create(secret).await
    }

    pub async fn update(&self, secret: &Secret) -> Result<()> {
        self.store.update(secret).await
    }

    pub async fn delete(&self) -> Result<()> {
        self.store.delete(&self.key).await
    }

    /// Registers a handler called for each event of the given kinds, before the cache is updated.
    pub async fn register_action_handler<F, Fut>(&self, kinds: &[EventKind], handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let boxed: ActionHandler = Arc::new(move |event| handler(event).boxed());

        let mut handlers = self.handlers.lock().await;
        for kind in kinds {
            handlers.entry(*kind).or_default().push(boxed.clone());
        }
    }

    async fn events(&self) -> EventStream {
        if self.mode == SyncMode::Poll || self.watch_failed.load(Ordering::Relaxed) {
            return poll::poll(self.store.clone(), self.key.clone(), self.poll_period);
        }

        match self.store.watch(&self.key).await {
            Ok(events) => events,
            Err(e) => {
                warn!("{}: watch unavailable ({e}), falling back to polling", self.name());
                self.watch_failed.store(true, Ordering::Relaxed);
                poll::poll(self.store.clone(), self.key.clone(), self.poll_period)
            }
        }
    }

    async fn process(&self, mut events: EventStream) -> Error {
        while let Some(event) = events.next().await {
            trace!("{}: got event {:?}", self.name(), event.kind());

            if let Err(e) = self.handle_event(event).await {
                return e;
            }
        }
        Error::WatchEnded(self.name())
    }

    async fn handle_event(&self, event: Event) -> Result<()> {
        let handlers = (self.handlers.lock().await)
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();

        for handler in handlers {
            if let Err(e) = handler(event.clone()).await {
                error!("{}: action handler failed: {e}", self.name());
                return Err(e);
            }
        }

        match event {
            Event::Added(secret) | Event::Modified(secret) => {
                let mut current = self.secret.lock().await;
                if current.as_ref() == Some(&secret) {
                    return Ok(());
                }
                debug!("{}: cached secret updated", self.name());
                *current = Some(secret);
            }
            Event::Deleted(_) => {
                *self.secret.lock().await = None;
            }
            Event::Error(e) => {
                // transient failures end the session only; the restart watches again
                if matches!(e, Error::Forbidden(_)) {
                    warn!("{}: watch refused ({e}), falling back to polling", self.name());
                    self.watch_failed.store(true, Ordering::Relaxed);
                }
                return Err(e);
            }
        }
        Ok(())
    }
}
