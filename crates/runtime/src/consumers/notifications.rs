use std::sync::Arc;

use parking_lot::Mutex;
use quern_store::{StoreState, Value};
use tracing::debug;

use crate::RuntimeInner;
use crate::client::{CallClient, InvocationContext};
use crate::error::Error;
use crate::registry::Library;
use crate::sandbox::{CallResult, Callback, NotificationDef};

#[derive(Clone, Debug, Default)]
pub(crate) struct NotificationStats {
    pub num_triggered: u64,
    pub num_success: u64,
    pub num_failed: u64,
    pub last_error: Option<String>,
}

/// A keyspace-notification consumer: every mutation event on a key under
/// `prefix` is delivered to the handler, at-least-once, with no ack
/// protocol. Handler failures are recorded and the event still counts as
/// delivered.
pub(crate) struct NotificationConsumer {
    pub(crate) name: String,
    pub(crate) prefix: String,
    callback: Callback,
    stats: Mutex<NotificationStats>,
}

impl NotificationConsumer {
    pub(crate) fn new(def: NotificationDef) -> Self {
        Self {
            name: def.name,
            prefix: def.prefix,
            callback: def.callback,
            stats: Mutex::new(NotificationStats::default()),
        }
    }

    pub(crate) fn dispatch(
        this: &Arc<Self>,
        rt: &Arc<RuntimeInner>,
        state: &mut StoreState,
        library: &Arc<Library>,
        event: &str,
        key: &str,
    ) {
        this.stats.lock().num_triggered += 1;
        let payload = Value::Map(vec![
            ("event".to_owned(), Value::str(event)),
            ("key".to_owned(), Value::str(key)),
        ]);
        let ctx = Arc::new(InvocationContext::consumer(Some(Arc::clone(library))));
        let outcome = {
            let mut client = CallClient::new(state, rt, ctx);
            (this.callback)(&mut client, &[payload])
        };
        match outcome {
            Ok(CallResult::Value(_)) => this.record(Ok(())),
            Ok(CallResult::Async(task)) => {
                let consumer = Arc::clone(this);
                drop(tokio::spawn(async move {
                    consumer.record(task.await.map(drop));
                }));
            }
            Err(error) => this.record(Err(error)),
        }
    }

    fn record(&self, outcome: Result<(), Error>) {
        let mut stats = self.stats.lock();
        match outcome {
            Ok(()) => stats.num_success += 1,
            Err(error) => {
                debug!(consumer = %self.name, %error, "notification handler failed");
                stats.num_failed += 1;
                stats.last_error = Some(error.to_string());
            }
        }
    }

    pub(crate) fn stats(&self) -> NotificationStats {
        self.stats.lock().clone()
    }
}
