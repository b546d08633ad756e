//! Replication seam.
//!
//! The transport is the embedder's concern: a primary publishes
//! [`ReplicationRecord`]s through whatever [`ReplicationSink`] is
//! installed, and a replica feeds the same records into
//! [`crate::Runtime::apply`]. Library definitions, store writes, and
//! stream-cursor progress all travel this way, so a promoted replica
//! resumes consumption from the id the old primary reached.

use quern_store::{CommandSpec, StreamId, Value};
use serde::{Deserialize, Serialize};

/// One unit of replicated state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ReplicationRecord {
    /// A write command executed on the primary.
    Command { cmd: String, args: Vec<String> },
    /// A library was loaded or upgraded; replicas compile the same source.
    LoadLibrary { source: String },
    /// A library was deleted.
    DeleteLibrary { name: String },
    /// A stream consumer advanced past completed records.
    CursorAdvance {
        library: String,
        consumer: String,
        stream: String,
        id_to_read_from: StreamId,
        total_record_processed: u64,
    },
}

/// Outbound half of the seam, installed on the primary.
pub trait ReplicationSink: Send + Sync + 'static {
    fn publish(&self, record: ReplicationRecord);
}

/// Rewrite a write command so non-deterministic effects replay identically
/// on replicas: an auto-generated stream id is replaced by the id the
/// primary actually assigned.
pub(crate) fn rewritten_args(
    spec: &CommandSpec,
    mut args: Vec<String>,
    reply: &Value,
) -> Vec<String> {
    if spec.name == "xadd"
        && args.get(1).is_some_and(|id| id == "*")
        && let Some(id) = reply.as_str()
    {
        args[1] = id.to_owned();
    }
    args
}
