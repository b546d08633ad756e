//! Minimal embedded key-value store substrate for the quern runtime.
//!
//! This crate provides the storage half of the system: string and stream
//! keys, an ACL user table, a replica role, memory accounting, and a
//! key-mutation event queue. All of it lives behind one
//! [`Store`] value whose `tokio` mutex is the single global cooperative
//! write lock; callers hold the guard for every store-touching operation
//! and release it across suspensions.
//!
//! The store executes structured commands (`execute`) but does not parse a
//! wire protocol, snapshot to disk, or speak a replication transport;
//! those belong to the embedder.

mod acl;
mod command;
mod stream;
mod value;

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

pub use crate::acl::{Acl, AclUser, DEFAULT_USER};
pub use crate::command::{CommandSpec, command_spec};
pub use crate::stream::{Record, Stream, StreamId};
pub use crate::value::Value;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("wrong number of arguments for '{0}'")]
    WrongArity(String),
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,
    #[error("value is not an integer or out of range")]
    NotAnInteger,
    #[error("Invalid stream ID specified as stream command argument: '{0}'")]
    InvalidStreamId(String),
    #[error("The ID specified in XADD is equal or smaller than the target stream top item")]
    StreamIdTooSmall,
    #[error("unknown ACL rule '{0}'")]
    InvalidAclRule(String),
    #[error("The 'default' user cannot be removed")]
    DeleteDefaultUser,
    #[error("unknown configuration parameter '{0}'")]
    UnknownConfig(String),
}

/// Replication role of this store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Primary,
    Replica,
}

/// A stored value: either a plain string or an append-only stream.
#[derive(Clone, Debug)]
pub enum Entry {
    String(String),
    Stream(Stream),
}

/// Event queued by a mutating command, drained by the embedder while the
/// store lock is still held.
#[derive(Clone, Debug)]
pub enum StoreEvent {
    Key { event: String, key: String },
    RoleChanged(Role),
}

/// The store's mutable world: keys, ACL table, role, and memory limit.
#[derive(Debug)]
pub struct StoreState {
    keys: HashMap<String, Entry>,
    pub acl: Acl,
    role: Role,
    maxmemory: u64,
    events: Vec<StoreEvent>,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            keys: HashMap::new(),
            acl: Acl::default(),
            role: Role::Primary,
            maxmemory: 0,
            events: Vec::new(),
        }
    }
}

impl StoreState {
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub const fn maxmemory(&self) -> u64 {
        self.maxmemory
    }

    /// Additive estimate of key/value memory, compared against `maxmemory`.
    #[must_use]
    pub fn memory_used(&self) -> u64 {
        self.keys
            .iter()
            .map(|(key, entry)| {
                let value = match entry {
                    Entry::String(s) => s.len() as u64,
                    Entry::Stream(stream) => stream.memory_estimate(),
                };
                key.len() as u64 + value + 48
            })
            .sum()
    }

    #[must_use]
    pub fn out_of_memory(&self) -> bool {
        self.maxmemory > 0 && self.memory_used() > self.maxmemory
    }

    /// Drain events queued since the last call.
    pub fn take_events(&mut self) -> Vec<StoreEvent> {
        std::mem::take(&mut self.events)
    }

    /// Read a stream key, if present and of stream type.
    #[must_use]
    pub fn stream(&self, key: &str) -> Option<&Stream> {
        match self.keys.get(key) {
            Some(Entry::Stream(stream)) => Some(stream),
            _ => None,
        }
    }

    /// Keys currently holding streams.
    pub fn stream_keys(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().filter_map(|(key, entry)| match entry {
            Entry::Stream(_) => Some(key.as_str()),
            Entry::String(_) => None,
        })
    }

    /// Remove one stream entry without queueing a key event; used for
    /// consumer-side trimming.
    pub fn trim_stream_entry(&mut self, key: &str, id: StreamId) {
        if let Some(Entry::Stream(stream)) = self.keys.get_mut(key) {
            stream.remove(id);
        }
    }

    fn push_key_event(&mut self, event: &str, key: &str) {
        self.events.push(StoreEvent::Key {
            event: event.to_owned(),
            key: key.to_owned(),
        });
    }
}

/// The store behind its global cooperative write lock.
#[derive(Debug, Default)]
pub struct Store {
    state: Mutex<StoreState>,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the global write lock. Held implicitly for synchronous
    /// command execution and explicitly by re-entrant callers; every
    /// suspension point releases it.
    pub async fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().await
    }
}
