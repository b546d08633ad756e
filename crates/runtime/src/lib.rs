//! Function & event-handler runtime over an embedded key-value store.
//!
//! Users load named libraries of sandboxed functions, call them over a
//! structured wire facade, and attach long-lived consumers to keyspace
//! notifications and append-only streams. The runtime enforces ACL
//! identity, replica-role, and memory-pressure policy at every entry and
//! re-entry point, including across the suspension points of asynchronous
//! functions.
//!
//! # Quickstart
//!
//! ```
//! use std::sync::Arc;
//!
//! use quern_runtime::{
//!     Runtime, Value,
//!     sandbox::{CallResult, FunctionFlags, GuestArg, native::NativeBackend},
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = NativeBackend::new();
//! backend.module("hello", |load| {
//!     load.register_function(
//!         GuestArg::str("greet"),
//!         GuestArg::callable(|_client, _args| Ok(CallResult::Value(Value::str("hi")))),
//!         FunctionFlags::default(),
//!     )
//! });
//!
//! let runtime = Runtime::builder().backend(Arc::new(backend)).build();
//! let session = runtime.connect();
//! session
//!     .execute("function", &["load", "#!rs name=hello\nhello"])
//!     .await?;
//! let reply = session.execute("function", &["call", "hello", "greet"]).await?;
//! assert_eq!(reply, Value::str("hi"));
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod replication;
pub mod sandbox;

mod consumers;
mod policy;
mod registry;
mod session;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use quern_store::Store;

pub use crate::error::{Error, Result};
pub use crate::session::Session;
pub use quern_store::{StreamId, Value};

use crate::registry::Registry;
use crate::replication::{ReplicationRecord, ReplicationSink};
use crate::sandbox::Backend;

pub(crate) struct RuntimeInner {
    pub(crate) store: Store,
    engines: RwLock<HashMap<String, Arc<dyn Backend>>>,
    pub(crate) registry: Registry,
    sink: RwLock<Option<Arc<dyn ReplicationSink>>>,
}

impl RuntimeInner {
    pub(crate) fn backend(&self, tag: &str) -> Result<Arc<dyn Backend>> {
        self.engines
            .read()
            .get(tag)
            .cloned()
            .ok_or_else(|| Error::UnknownBackend(tag.to_owned()))
    }

    pub(crate) fn replicate(&self, record: ReplicationRecord) {
        if let Some(sink) = self.sink.read().clone() {
            sink.publish(record);
        }
    }
}

/// The runtime handle; cheap to clone, one per process.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    #[must_use]
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    /// Open a session running as the default user.
    #[must_use]
    pub fn connect(&self) -> Session {
        Session::new(Arc::clone(&self.inner))
    }

    /// Install the sink replicated state is published through.
    pub fn set_replication_sink(&self, sink: Arc<dyn ReplicationSink>) {
        *self.inner.sink.write() = Some(sink);
    }

    /// Apply one record received from a primary.
    ///
    /// Writes applied here bypass the replica write rejection; they came
    /// from the replication link. Consumers still do not dispatch until
    /// this store is promoted.
    ///
    /// # Errors
    /// Returns an error if the record cannot be applied.
    pub async fn apply(&self, record: ReplicationRecord) -> Result<()> {
        let mut state = self.inner.store.lock().await;
        match record {
            ReplicationRecord::Command { cmd, args } => {
                state.execute(&cmd, &args)?;
                consumers::flush_events(&self.inner, &mut state);
            }
            ReplicationRecord::LoadLibrary { source } => {
                RuntimeInner::load_library(&self.inner, &mut state, &source, true)?;
            }
            ReplicationRecord::DeleteLibrary { name } => {
                drop(self.inner.registry.remove(&name)?);
            }
            ReplicationRecord::CursorAdvance {
                library,
                consumer,
                stream,
                id_to_read_from,
                total_record_processed,
            } => {
                if let Some(library) = self.inner.registry.get(&library)
                    && let Some(found) = library.streams.iter().find(|c| c.name == consumer)
                {
                    found.apply_replicated(&stream, id_to_read_from, total_record_processed);
                }
            }
        }
        Ok(())
    }
}

/// Builder for a [`Runtime`].
#[derive(Default)]
pub struct RuntimeBuilder {
    backends: Vec<Arc<dyn Backend>>,
    sink: Option<Arc<dyn ReplicationSink>>,
}

impl RuntimeBuilder {
    /// Register a script backend; its tag is matched against library
    /// headers.
    #[must_use]
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backends.push(backend);
        self
    }

    #[must_use]
    pub fn replication_sink(mut self, sink: Arc<dyn ReplicationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    #[must_use]
    pub fn build(self) -> Runtime {
        let engines = self
            .backends
            .into_iter()
            .map(|backend| (backend.tag().to_owned(), backend))
            .collect();
        Runtime {
            inner: Arc::new(RuntimeInner {
                store: Store::new(),
                engines: RwLock::new(engines),
                registry: Registry::default(),
                sink: RwLock::new(self.sink),
            }),
        }
    }
}
