use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    Client,
    api::{Api, DeleteParams, PostParams},
    runtime::watcher,
};
use log::debug;

use super::{Event, EventStream, memory::MemoryStore};
use crate::{Error, ObjectKey, Result};

/// The cluster side of a synchronizer: where the secret actually lives.
#[derive(Clone)]
pub enum SecretStore {
    Kube(Client),
    /// process-local store, for single replica setups
    Memory(MemoryStore),
}

impl SecretStore {
    fn api(client: &Client, namespace: &str) -> Api<Secret> {
        Api::namespaced(client.clone(), namespace)
    }

    pub async fn get(&self, key: &ObjectKey) -> Result<Option<Secret>> {
        match self {
            Self::Kube(client) => Ok(Self::api(client, &key.namespace)
                .get_opt(&key.name)
                .await?),
            Self::Memory(store) => store.read(key).await,
        }
    }

    pub async fn create(&self, secret: &Secret) -> Result<()> {
        let key = key_of(secret)?;
        match self {
            Self::Kube(client) => {
                (Self::api(client, &key.namespace))
                    .create(&PostParams::default(), secret)
                    .await?;
            }
            Self::Memory(store) => store.create(secret.clone()).await?,
        }
        debug!("created secret {key}");
        Ok(())
    }

    pub async fn update(&self, secret: &Secret) -> Result<()> {
        let key = key_of(secret)?;
        match self {
            Self::Kube(client) => {
                (Self::api(client, &key.namespace))
                    .replace(&key.name, &PostParams::default(), secret)
                    .await?;
            }
            Self::Memory(store) => store.update(secret.clone()).await?,
        }
        debug!("updated secret {key}");
        Ok(())
    }

    pub async fn delete(&self, key: &ObjectKey) -> Result<()> {
        match self {
            Self::Kube(client) => {
                let params = DeleteParams {
                    grace_period_seconds: Some(0),
                    ..Default::default()
                };
                (Self::api(client, &key.namespace))
                    .delete(&key.name, &params)
                    .await?;
            }
            Self::Memory(store) => store.delete(key).await?,
        }
        debug!("deleted secret {key}");
        Ok(())
    }

    pub async fn watch(&self, key: &ObjectKey) -> Result<EventStream> {
        match self {
            Self::Kube(client) => Ok(native_watch(Self::api(client, &key.namespace), &key.name)),
            Self::Memory(store) => store.watch(key).await,
        }
    }
}

pub(super) fn key_of(secret: &Secret) -> Result<ObjectKey> {
    ObjectKey::try_from(&secret.metadata).map_err(|e| Error::invalid(format!("bad secret: {e}")))
}

fn native_watch(api: Api<Secret>, name: &str) -> EventStream {
    let config = watcher::Config::default().fields(&format!("metadata.name={name}"));
    let stream = watcher(api, config).boxed();

    futures::stream::unfold(
        (stream, NativeState::default()),
        |(mut stream, mut state)| async move {
            loop {
                let Some(result) = stream.next().await else {
                    return None;
                };
                let event = match result {
                    Ok(event) => event,
                    Err(e) => return Some((Event::Error(watch_error(e)), (stream, state))),
                };
                if let Some(event) = state.ingest(event) {
                    return Some((event, (stream, state)));
                }
            }
        },
    )
    .boxed()
}

/// Refusals (RBAC, no watch support) are reported as `Forbidden`, anything else is transient.
fn watch_error(e: watcher::Error) -> Error {
    use watcher::Error::*;
    let refused = match &e {
        InitialListFailed(kube::Error::Api(resp))
        | WatchStartFailed(kube::Error::Api(resp))
        | WatchError(resp) => matches!(resp.code, 403 | 405),
        NoResourceVersion => true,
        _ => false,
    };
    if refused {
        Error::Forbidden(format!("watch refused: {e}"))
    } else {
        Error::internal(format!("watch failed: {e}"))
    }
}

/// Turns the watcher's (re)list protocol into added/modified/deleted transitions.
#[derive(Default)]
struct NativeState {
    known: Option<Secret>,
    relisted: bool,
}
impl NativeState {
    fn ingest(&mut self, event: watcher::Event<Secret>) -> Option<Event> {
        use watcher::Event::*;
        match event {
            Init => {
                self.relisted = false;
                None
            }
            InitApply(secret) | Apply(secret) => {
                self.relisted = true;
                let event = match self.known {
                    Some(_) => Event::Modified(secret.clone()),
                    None => Event::Added(secret.clone()),
                };
                self.known = Some(secret);
                Some(event)
            }
            InitDone => {
                if self.relisted {
                    return None;
                }
                // gone while we were not watching
                self.known.take().map(Event::Deleted)
            }
            Delete(secret) => {
                self.known = None;
                Some(Event::Deleted(secret))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sync::test::secret;

    fn api_error(code: u16) -> kube::core::ErrorResponse {
        kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "nope".into(),
            reason: String::new(),
            code,
        }
    }

    #[test]
    fn test_watch_error() {
        use watcher::Error::*;

        let refused = [
            InitialListFailed(kube::Error::Api(api_error(403))),
            WatchStartFailed(kube::Error::Api(api_error(405))),
            WatchError(api_error(403)),
            NoResourceVersion,
        ];
        for e in refused {
            assert!(matches!(watch_error(e), Error::Forbidden(_)));
        }

        let transient = [
            WatchError(api_error(410)),
            WatchFailed(kube::Error::Api(api_error(500))),
            InitialListFailed(kube::Error::Api(api_error(503))),
        ];
        for e in transient {
            assert!(matches!(watch_error(e), Error::Internal(_)));
        }
    }

    #[test]
    fn test_native_relist() {
        let key = ObjectKey::new("ns", "s");
        let s = secret(&key, &[("k", b"v")]);
        let mut state = NativeState::default();

        assert_eq!(None, state.ingest(watcher::Event::Init));
        assert_eq!(
            Some(Event::Added(s.clone())),
            state.ingest(watcher::Event::InitApply(s.clone()))
        );
        assert_eq!(None, state.ingest(watcher::Event::InitDone));
        assert_eq!(
            Some(Event::Modified(s.clone())),
            state.ingest(watcher::Event::Apply(s.clone()))
        );

        // relist without the secret
        assert_eq!(None, state.ingest(watcher::Event::Init));
        assert_eq!(
            Some(Event::Deleted(s.clone())),
            state.ingest(watcher::Event::InitDone)
        );
        assert_eq!(
            Some(Event::Added(s.clone())),
            state.ingest(watcher::Event::Apply(s))
        );
    }
}
