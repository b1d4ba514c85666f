//! Supervision of synchronizers.
//!
//! Every registered [`Synchronizer`] gets a watcher task on its error channel. Depending on its
//! [`RestartPolicy`], a synchronizer that exits is restarted after [`RESTART_DELAY`]. Restarts
//! are counted for the process lifetime: past [`MAX_RESTART_COUNT`] the problem is assumed to be
//! systemic (revoked permissions, broken API server...) and [`Overwatch::run`] returns a fatal
//! error so the whole process gets restarted by its orchestrator.

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

use super::Synchronizer;
use crate::Error;


pub const RESTART_DELAY: Duration = Duration::from_secs(2);
pub const MAX_RESTART_COUNT: u32 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    Always,
    Never,
}

pub struct Overwatch {
    inner: Arc<Inner>,
    signals: Mutex<Option<Signals>>,
}

struct Inner {
    registry: Mutex<Registry>,
    registration_tx: mpsc::UnboundedSender<String>,
    restart_tx: mpsc::UnboundedSender<String>,
    fatal_tx: mpsc::UnboundedSender<Error>,
    restart_delay: Duration,
    max_restart_count: u32,
}

struct Signals {
    registration_rx: mpsc::UnboundedReceiver<String>,
    restart_rx: mpsc::UnboundedReceiver<String>,
    fatal_rx: mpsc::UnboundedReceiver<Error>,
}

#[derive(Default)]
struct Registry {
    synchronizers: HashMap<String, Arc<Synchronizer>>,
    policies: HashMap<String, RestartPolicy>,
    restart_counts: HashMap<String, u32>,
}

impl Default for Overwatch {
    fn default() -> Self {
        Self::new()
    }
}

impl Overwatch {
    pub fn new() -> Self {
        Self::with_limits(RESTART_DELAY, MAX_RESTART_COUNT)
    }

    pub fn with_limits(restart_delay: Duration, max_restart_count: u32) -> Self {
        let (registration_tx, registration_rx) = mpsc::unbounded_channel();
        let (restart_tx, restart_rx) = mpsc::unbounded_channel();
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry::default()),
                registration_tx,
                restart_tx,
                fatal_tx,
                restart_delay,
                max_restart_count,
            }),
            signals: Mutex::new(Some(Signals {
                registration_rx,
                restart_rx,
                fatal_rx,
            })),
        }
    }

    /// Registers a synchronizer; it is started as soon as [`Self::run`] picks it up.
    /// Registering a name twice is a no-op.
    pub async fn register_synchronizer(&self, synchronizer: Arc<Synchronizer>, policy: RestartPolicy) {
        let name = synchronizer.name();

        {
            let mut registry = self.inner.registry.lock().await;
            if registry.synchronizers.contains_key(&name) {
                info!("synchronizer {name} is already registered, skipping");
                return;
            }
            registry.synchronizers.insert(name.clone(), synchronizer);
            registry.policies.insert(name.clone(), policy);
        }

        // the receiver lives as long as self
        let _ = self.inner.registration_tx.send(name);
    }

    /// Supervises registered synchronizers. Only returns on an unrecoverable error.
    pub async fn run(&self) -> Error {
        let Some(mut signals) = self.signals.lock().await.take() else {
            return Error::internal("overwatch is already running");
        };

        info!("starting overwatch");

        loop {
            tokio::select! {
                Some(name) = signals.registration_rx.recv() => {
                    self.inner.on_registration(&name).await;
                }
                Some(name) = signals.restart_rx.recv() => {
                    if let Err(e) = self.inner.on_restart(&name).await {
                        return e;
                    }
                }
                Some(e) = signals.fatal_rx.recv() => {
                    return e;
                }
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.registry.lock().await.synchronizers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn restart_count(&self, name: &str) -> u32 {
        let registry = self.inner.registry.lock().await;
        registry.restart_counts.get(name).copied().unwrap_or(0)
    }
}

impl Inner {
    async fn synchronizer(&self, name: &str) -> Option<Arc<Synchronizer>> {
        self.registry.lock().await.synchronizers.get(name).cloned()
    }

    async fn on_registration(self: &Arc<Self>, name: &str) {
        let Some(synchronizer) = self.synchronizer(name).await else {
            return;
        };

        info!("new synchronizer has been registered: {name}, starting");
        synchronizer.start().await;
        self.monitor(synchronizer).await;
    }

    async fn on_restart(self: &Arc<Self>, name: &str) -> Result<(), Error> {
        let count = self.registry.lock().await.restart_counts.get(name).copied();
        if count.unwrap_or(0) > self.max_restart_count {
            return Err(Error::fatal(format!(
                "synchronizer {name} restart limit exceeded"
            )));
        }

        let Some(synchronizer) = self.synchronizer(name).await else {
            return Ok(());
        };

        info!("restarting synchronizer {name}");
        synchronizer.start().await;
        self.monitor(synchronizer).await;
        Ok(())
    }

    async fn monitor(self: &Arc<Self>, synchronizer: Arc<Synchronizer>) {
        let name = synchronizer.name();

        let Some(errors) = synchronizer.error().await else {
            warn!("synchronizer {name} has no running session to monitor");
            return;
        };

        let inner = self.clone();
        tokio::spawn(async move {
            let Ok(err) = errors.await else {
                debug!("synchronizer {name} stopped");
                return;
            };

            error!("synchronizer {name} exited with error: {err}");

            if err.is_fatal() {
                let _ = inner.fatal_tx.send(err);
                return;
            }

            let policy = inner.registry.lock().await.policies.get(&name).copied();
            if policy != Some(RestartPolicy::Always) {
                return;
            }

            tokio::time::sleep(inner.restart_delay).await;

            *(inner.registry.lock().await.restart_counts)
                .entry(name.clone())
                .or_default() += 1;

            let _ = inner.restart_tx.send(name);
        });
    }
}
