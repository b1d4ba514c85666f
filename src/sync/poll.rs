use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use log::{trace, warn};
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};

use super::{Event, EventStream, SecretStore};
use crate::ObjectKey;

/// Polls the secret every `period`, emitting an event each time its data changes.
///
/// Fetch errors are logged and skipped: the stream never ends by itself.
pub fn poll(store: SecretStore, key: ObjectKey, period: Duration) -> EventStream {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let poller = Poller {
        store,
        key,
        interval,
        last: None,
    };

    futures::stream::unfold(poller, |mut poller| async move {
        let event = poller.next_event().await;
        Some((event, poller))
    })
    .boxed()
}

struct Poller {
    store: SecretStore,
    key: ObjectKey,
    interval: Interval,
    last: Option<Secret>,
}
impl Poller {
    async fn next_event(&mut self) -> Event {
        loop {
            self.interval.tick().await;

            let secret = match self.store.get(&self.key).await {
                Ok(v) => v,
                Err(e) => {
                    warn!("failed to poll secret {}: {e}", self.key);
                    continue;
                }
            };

            match (secret, self.last.take()) {
                (None, None) => {}
                (None, Some(last)) => return Event::Deleted(last),
                (Some(secret), None) => {
                    self.last = Some(secret.clone());
                    return Event::Added(secret);
                }
                (Some(secret), Some(last)) => {
                    let changed = secret.data != last.data || secret.string_data != last.string_data;
                    self.last = Some(secret.clone());
                    if changed {
                        return Event::Modified(secret);
                    }
                    trace!("secret {} unchanged", self.key);
                }
            }
        }
    }
}
