//! Connection event intake.

use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::durable::SignalRouter;
use crate::store::{SessionStore, StoreResult};
use crate::values::Value;

/// Saves incoming events and wakes the workflows subscribed to them.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn SessionStore>,
    router: SignalRouter,
}

impl Dispatcher {
    /// Dispatcher writing to `store` and signaling through `router`.
    pub fn new(store: Arc<dyn SessionStore>, router: SignalRouter) -> Self {
        Self { store, router }
    }

    /// Persist an event and signal every matching subscription.
    ///
    /// Returns the event's sequence number. Subscriptions whose workflow is
    /// not running here are skipped; the event stays readable from the store.
    pub async fn dispatch(
        &self,
        connection_id: &str,
        event_type: &str,
        data: BTreeMap<String, Value>,
    ) -> StoreResult<u64> {
        let seq = self.store.save_event(connection_id, event_type, data).await?;
        let signals = self.store.list_signals(connection_id, event_type).await?;
        info!(connection_id, event_type, seq, subscribers = signals.len(), "event saved");
        for signal in signals {
            let delivered =
                self.router
                    .signal(&signal.workflow_id, &signal.signal_id, json!({ "seq": seq }));
            if !delivered {
                debug!(
                    workflow_id = %signal.workflow_id,
                    signal_id = %signal.signal_id,
                    "workflow not running, signal dropped"
                );
            }
        }
        Ok(seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::WorkflowContext;
    use crate::sessions::types::Signal;
    use crate::store::MemStore;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn matching_workflows_are_signaled() {
        let store = Arc::new(MemStore::new());
        let router = SignalRouter::new();
        let ctx = WorkflowContext::new("wf", CancellationToken::new());
        router.register(ctx.signal_sender());
        store
            .save_signal(&Signal {
                signal_id: "sig".into(),
                workflow_id: "wf".into(),
                connection_id: "c1".into(),
                event_type: Some("push".into()),
            })
            .await
            .unwrap();

        let dispatcher = Dispatcher::new(store.clone(), router);
        dispatcher.dispatch("c1", "pull", BTreeMap::new()).await.unwrap();
        let seq = dispatcher.dispatch("c1", "push", BTreeMap::new()).await.unwrap();

        let fired = ctx
            .select_signal(&["sig".to_string()], None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fired.0, "sig");
        assert_eq!(fired.1["seq"], seq);
        assert_eq!(store.latest_event_seq().await.unwrap(), seq);
    }
}
