use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use std::collections::BTreeMap as Map;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

use super::{Event, EventStream, store::key_of};
use crate::{Error, ObjectKey, Result};

/// Secrets held in process memory, with the same semantics as the API server for
/// create/update/delete conflicts, and watch fan-out.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

struct State {
    secrets: Map<ObjectKey, Secret>,
    watchers: Vec<(ObjectKey, mpsc::UnboundedSender<Event>)>,
    version: u64,
    watch_available: bool,
    watches_severed: bool,
    reads_failing: bool,
}
impl Default for State {
    fn default() -> Self {
        Self {
            secrets: Map::new(),
            watchers: Vec::new(),
            version: 0,
            watch_available: true,
            watches_severed: false,
            reads_failing: false,
        }
    }
}
impl State {
    fn stamp(&mut self, secret: &mut Secret) {
        self.version += 1;
        secret.metadata.resource_version = Some(self.version.to_string());
    }

    fn notify(&mut self, key: &ObjectKey, event: Event) {
        self.watchers
            .retain(|(k, tx)| k != key || tx.send(event.clone()).is_ok());
    }
}

impl MemoryStore {
    pub async fn get(&self, key: &ObjectKey) -> Option<Secret> {
        self.state.lock().await.secrets.get(key).cloned()
    }

    /// Reads as a client would, failing while [`Self::set_reads_failing`] is on.
    pub async fn read(&self, key: &ObjectKey) -> Result<Option<Secret>> {
        let state = self.state.lock().await;
        if state.reads_failing {
            return Err(Error::internal("the server is currently unable to handle the request"));
        }
        Ok(state.secrets.get(key).cloned())
    }

    pub async fn create(&self, mut secret: Secret) -> Result<()> {
        let key = key_of(&secret)?;
        let mut state = self.state.lock().await;

        if state.secrets.contains_key(&key) {
            return Err(Error::AlreadyExists(format!(
                "secrets \"{}\" already exists",
                key.name
            )));
        }

        state.stamp(&mut secret);
        state.secrets.insert(key.clone(), secret.clone());
        state.notify(&key, Event::Added(secret));
        Ok(())
    }

    pub async fn update(&self, mut secret: Secret) -> Result<()> {
        let key = key_of(&secret)?;
        let mut state = self.state.lock().await;

        if !state.secrets.contains_key(&key) {
            return Err(not_found(&key));
        }

        state.stamp(&mut secret);
        state.secrets.insert(key.clone(), secret.clone());
        state.notify(&key, Event::Modified(secret));
        Ok(())
    }

    pub async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let mut state = self.state.lock().await;

        let Some(secret) = state.secrets.remove(key) else {
            return Err(not_found(key));
        };

        state.notify(key, Event::Deleted(secret));
        Ok(())
    }

    /// Streams changes to the given secret, starting with its current state if it exists.
    pub async fn watch(&self, key: &ObjectKey) -> Result<EventStream> {
        let mut state = self.state.lock().await;

        if !state.watch_available {
            return Err(Error::Forbidden(format!(
                "secrets \"{}\" can't be watched",
                key.name
            )));
        }
        if state.watches_severed {
            return Ok(futures::stream::empty().boxed());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(secret) = state.secrets.get(key) {
            let _ = tx.send(Event::Added(secret.clone()));
        }
        state.watchers.push((key.clone(), tx));

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed())
    }

    /// Ends every running watch, as an API server closing its watch connections would.
    pub async fn end_watches(&self) {
        self.state.lock().await.watchers.clear();
    }

    pub async fn set_watch_available(&self, available: bool) {
        self.state.lock().await.watch_available = available;
    }

    pub async fn set_reads_failing(&self, failing: bool) {
        self.state.lock().await.reads_failing = failing;
    }

    /// While severed, running watches are ended and new ones end immediately.
    pub async fn set_watches_severed(&self, severed: bool) {
        let mut state = self.state.lock().await;
        state.watches_severed = severed;
        if severed {
            state.watchers.clear();
        }
    }
}

fn not_found(key: &ObjectKey) -> Error {
    Error::NotFound(format!("secrets \"{}\" not found", key.name))
}
