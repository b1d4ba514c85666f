use k8s_openapi::{ByteString, api::core::v1::Secret};
use log::{debug, info, warn};
use openssl::pkey::{PKey, Private};
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;

use super::{Encrypter, PRIVATE_KEY_FIELD, PUBLIC_KEY_FIELD, export_key, generate_key, parse_key};
use crate::sync::{EventKind, Synchronizer};
use crate::{Error, Result};

/// Holds the token encryption key, kept in sync with the cluster secret.
///
/// Every replica generates a key at startup; the first one to store it in the cluster wins and
/// the others adopt it when the secret reaches them. A corrupted secret is overwritten with the
/// local key, a deleted one is recreated from it.
#[derive(Clone)]
pub struct KeyHolder {
    inner: Arc<Inner>,
}

struct Inner {
    key: RwLock<PKey<Private>>,
    synchronizer: Arc<Synchronizer>,
}

impl KeyHolder {
    pub async fn new(synchronizer: Arc<Synchronizer>) -> Result<Self> {
        let key = generate_key()
            .map_err(|e| Error::fatal(format!("failed to generate encryption key: {e}")))?;
        info!("generated a new encryption key");

        let holder = Self {
            inner: Arc::new(Inner {
                key: RwLock::new(key),
                synchronizer,
            }),
        };

        holder.register_handlers().await;
        holder.inner.init().await?;

        Ok(holder)
    }

    pub async fn encrypter(&self) -> Result<Encrypter> {
        Encrypter::new(&*self.inner.key.read().await)
    }

    pub async fn key(&self) -> PKey<Private> {
        self.inner.key.read().await.clone()
    }

    /// Re-reads the secret from the cluster and adopts the key it holds.
    pub async fn refresh(&self) -> Result<()> {
        let synchronizer = &self.inner.synchronizer;
        synchronizer.refresh().await;

        match synchronizer.get().await {
            Some(secret) => self.inner.update(secret).await,
            None => Ok(()),
        }
    }

    async fn register_handlers(&self) {
        let synchronizer = &self.inner.synchronizer;

        // handlers are owned by the synchronizer, they must not keep us alive
        let inner = Arc::downgrade(&self.inner);
        synchronizer
            .register_action_handler(&[EventKind::Added, EventKind::Modified], move |event| {
                on_event(inner.clone(), event.into_object(), |inner, secret| async move {
                    inner.update(secret).await
                })
            })
            .await;

        let inner = Arc::downgrade(&self.inner);
        synchronizer
            .register_action_handler(&[EventKind::Deleted], move |event| {
                on_event(inner.clone(), event.into_object(), |inner, _| async move {
                    inner.recreate().await
                })
            })
            .await;
    }
}

async fn on_event<F, Fut>(inner: Weak<Inner>, secret: Option<Secret>, handler: F) -> Result<()>
where
    F: FnOnce(Arc<Inner>, Secret) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    match (inner.upgrade(), secret) {
        (Some(inner), Some(secret)) => handler(inner, secret).await,
        _ => Ok(()),
    }
}

impl Inner {
    async fn init(&self) -> Result<()> {
        if let Some(secret) = self.synchronizer.get().await {
            info!("initializing encryption key from synchronized object");
            return self.update(secret).await;
        }

        info!("storing encryption key in a secret");
        match self.synchronizer.create(&self.secret().await?).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_already_exists() => {
                // another replica won the race; its key arrives with the next event
                debug!("key holder secret already exists, waiting for it to be synchronized");
                Ok(())
            }
            Err(e) => Err(Error::fatal(format!(
                "failed to store encryption key: {e}"
            ))),
        }
    }

    async fn update(&self, secret: Secret) -> Result<()> {
        let key = match parse_secret(&secret) {
            Ok(key) => key,
            Err(e) => {
                warn!("key holder secret is invalid ({e}), overwriting it with the local key");
                return self.synchronizer.update(&self.secret().await?).await;
            }
        };

        let mut current = self.key.write().await;
        if !current.public_eq(&key) {
            info!("adopting encryption key from {}", self.synchronizer.key());
            *current = key;
        }
        Ok(())
    }

    async fn recreate(&self) -> Result<()> {
        info!("key holder secret was deleted, recreating it");

        match self.synchronizer.create(&self.secret().await?).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_already_exists() => {
                debug!("key holder secret was already recreated");
                Ok(())
            }
            Err(e) => Err(Error::fatal(format!(
                "failed to recreate key holder secret: {e}"
            ))),
        }
    }

    async fn secret(&self) -> Result<Secret> {
        let (private_pem, public_pem) = export_key(&*self.key.read().await)?;

        Ok(Secret {
            metadata: self.synchronizer.key().metadata(),
            data: Some(
                [
                    (PRIVATE_KEY_FIELD.to_string(), ByteString(private_pem)),
                    (PUBLIC_KEY_FIELD.to_string(), ByteString(public_pem)),
                ]
                .into(),
            ),
            ..Default::default()
        })
    }
}

fn parse_secret(secret: &Secret) -> Result<PKey<Private>> {
    let field = |name: &str| {
        (secret.data.as_ref())
            .and_then(|data| data.get(name))
            .map(|v| v.0.as_slice())
            .ok_or_else(|| Error::invalid(format!("missing field {name}")))
    };

    parse_key(field(PRIVATE_KEY_FIELD)?, field(PUBLIC_KEY_FIELD)?)
}
