use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use quern_store::{Record, Role, StoreState, StreamId, Value};
use tracing::debug;

use crate::RuntimeInner;
use crate::client::{CallClient, InvocationContext};
use crate::error::Error;
use crate::registry::Library;
use crate::replication::ReplicationRecord;
use crate::sandbox::{CallResult, Callback, StreamDef};

#[derive(Clone, Copy, Debug)]
struct Pending {
    id: StreamId,
    done: bool,
}

/// Per-(consumer, stream-key) progress.
///
/// `pending` holds every in-flight id in delivery order; ids stay listed
/// until they reach the front completed, so trimming and the processed
/// counter advance strictly oldest-first even when handlers finish out of
/// order. A failed record keeps its slot, which stalls that portion of the
/// window until the library is reloaded.
#[derive(Debug, Default)]
struct Cursor {
    id_to_read_from: StreamId,
    pending: VecDeque<Pending>,
    total_processed: u64,
    last_error: Option<String>,
}

/// Read-only cursor view for LIST output.
#[derive(Clone, Debug)]
pub(crate) struct CursorSnapshot {
    pub id_to_read_from: StreamId,
    pub pending_ids: Vec<StreamId>,
    pub total_record_processed: u64,
    pub last_error: Option<String>,
}

/// A bounded-window consumer over stream keys matching `prefix`.
pub(crate) struct StreamConsumer {
    pub(crate) library: String,
    pub(crate) name: String,
    pub(crate) prefix: String,
    pub(crate) window: usize,
    pub(crate) trim: bool,
    callback: Callback,
    cursors: Mutex<BTreeMap<String, Cursor>>,
}

impl StreamConsumer {
    pub(crate) fn new(library: String, def: StreamDef) -> Self {
        Self {
            library,
            name: def.name,
            prefix: def.prefix,
            window: def.window,
            trim: def.trim,
            callback: def.callback,
            cursors: Mutex::new(BTreeMap::new()),
        }
    }

    /// Ensure a cursor exists for every matching stream key; returns the
    /// full set of tracked keys.
    pub(crate) fn discover(&self, state: &StoreState) -> Vec<String> {
        let mut cursors = self.cursors.lock();
        for key in state.stream_keys() {
            if key.starts_with(&self.prefix) {
                cursors.entry(key.to_owned()).or_default();
            }
        }
        cursors.keys().cloned().collect()
    }

    /// Deliver unread records while the window has room.
    pub(crate) fn pull(
        this: &Arc<Self>,
        rt: &Arc<RuntimeInner>,
        state: &mut StoreState,
        library: &Arc<Library>,
        key: &str,
    ) {
        loop {
            let (id, record) = {
                let mut cursors = this.cursors.lock();
                let cursor = cursors.entry(key.to_owned()).or_default();
                if cursor.pending.len() >= this.window {
                    return;
                }
                let Some((id, record)) = state
                    .stream(key)
                    .and_then(|s| s.first_from(cursor.id_to_read_from))
                else {
                    return;
                };
                cursor.pending.push_back(Pending { id, done: false });
                cursor.id_to_read_from = id.next();
                (id, record.clone())
            };
            Self::dispatch(this, rt, state, library, key, id, record);
        }
    }

    fn dispatch(
        this: &Arc<Self>,
        rt: &Arc<RuntimeInner>,
        state: &mut StoreState,
        library: &Arc<Library>,
        key: &str,
        id: StreamId,
        record: Record,
    ) {
        let fields = record.into_iter().map(|(f, v)| (f, Value::Str(v))).collect();
        let payload = Value::Map(vec![
            ("id".to_owned(), Value::str(id.to_string())),
            ("stream".to_owned(), Value::str(key)),
            ("record".to_owned(), Value::Map(fields)),
        ]);
        let ctx = Arc::new(InvocationContext::consumer(Some(Arc::clone(library))));
        let outcome = {
            let mut client = CallClient::new(state, rt, ctx);
            (this.callback)(&mut client, &[payload])
        };
        match outcome {
            Ok(CallResult::Value(_)) => this.complete(rt, state, key, id, Ok(())),
            Ok(CallResult::Async(task)) => {
                let consumer = Arc::clone(this);
                let rt = Arc::clone(rt);
                let library = Arc::clone(library);
                let key = key.to_owned();
                drop(tokio::spawn(async move {
                    let outcome = task.await.map(drop);
                    let mut state = rt.store.lock().await;
                    consumer.complete(&rt, &mut state, &key, id, outcome);
                    Self::pull(&consumer, &rt, &mut state, &library, &key);
                    crate::consumers::flush_events(&rt, &mut state);
                }));
            }
            Err(error) => this.complete(rt, state, key, id, Err(error)),
        }
    }

    /// Settle the record `id`; on success, advance the oldest-first done
    /// prefix of the window, trimming and counting as configured.
    pub(crate) fn complete(
        &self,
        rt: &Arc<RuntimeInner>,
        state: &mut StoreState,
        key: &str,
        id: StreamId,
        outcome: Result<(), Error>,
    ) {
        let advance = {
            let mut cursors = self.cursors.lock();
            let cursor = cursors.entry(key.to_owned()).or_default();
            match outcome {
                Ok(()) => {
                    if let Some(pending) = cursor.pending.iter_mut().find(|p| p.id == id) {
                        pending.done = true;
                    }
                    let mut trimmed = Vec::new();
                    let mut popped = 0;
                    while let Some(front) = cursor.pending.front().copied() {
                        if !front.done {
                            break;
                        }
                        cursor.pending.pop_front();
                        cursor.total_processed += 1;
                        popped += 1;
                        if self.trim {
                            trimmed.push(front.id);
                        }
                    }
                    if popped == 0 {
                        None
                    } else {
                        Some((cursor.id_to_read_from, cursor.total_processed, trimmed))
                    }
                }
                Err(error) => {
                    debug!(
                        consumer = %self.name,
                        stream = %key,
                        record = %id,
                        %error,
                        "stream handler failed"
                    );
                    cursor.last_error = Some(error.to_string());
                    None
                }
            }
        };
        if let Some((id_to_read_from, total_record_processed, trimmed)) = advance {
            for id in trimmed {
                state.trim_stream_entry(key, id);
            }
            if state.role() == Role::Primary {
                rt.replicate(ReplicationRecord::CursorAdvance {
                    library: self.library.clone(),
                    consumer: self.name.clone(),
                    stream: key.to_owned(),
                    id_to_read_from,
                    total_record_processed,
                });
            }
        }
    }

    /// Overwrite cursor progress with replicated values.
    pub(crate) fn apply_replicated(&self, stream: &str, id_to_read_from: StreamId, total: u64) {
        let mut cursors = self.cursors.lock();
        let cursor = cursors.entry(stream.to_owned()).or_default();
        cursor.id_to_read_from = cursor.id_to_read_from.max(id_to_read_from);
        cursor.total_processed = total;
    }

    pub(crate) fn snapshots(&self) -> Vec<(String, CursorSnapshot)> {
        self.cursors
            .lock()
            .iter()
            .map(|(key, cursor)| {
                (
                    key.clone(),
                    CursorSnapshot {
                        id_to_read_from: cursor.id_to_read_from,
                        pending_ids: cursor.pending.iter().map(|p| p.id).collect(),
                        total_record_processed: cursor.total_processed,
                        last_error: cursor.last_error.clone(),
                    },
                )
            })
            .collect()
    }
}
