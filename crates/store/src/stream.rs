use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::StoreError;

/// Entry id within a stream key, ordered by `(ms, seq)`.
///
/// Rendered as `<ms>-<seq>` on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    pub const ZERO: Self = Self { ms: 0, seq: 0 };

    /// Smallest id strictly greater than `self`.
    #[must_use]
    pub const fn next(self) -> Self {
        Self {
            ms: self.ms,
            seq: self.seq + 1,
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for StreamId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ms, seq) = s
            .split_once('-')
            .ok_or_else(|| StoreError::InvalidStreamId(s.to_owned()))?;
        let parse = |part: &str| {
            part.parse::<u64>()
                .map_err(|_| StoreError::InvalidStreamId(s.to_owned()))
        };
        Ok(Self {
            ms: parse(ms)?,
            seq: parse(seq)?,
        })
    }
}

/// Field/value pairs of one stream entry.
pub type Record = Vec<(String, String)>;

/// An append-only log of records ordered by [`StreamId`].
#[derive(Clone, Debug, Default)]
pub struct Stream {
    entries: BTreeMap<StreamId, Record>,
    last_id: StreamId,
}

impl Stream {
    /// Append with an auto-generated id: wall-clock milliseconds, falling
    /// back to `last_id.next()` so ids never regress.
    pub fn add_auto(&mut self, record: Record) -> StreamId {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        let id = if now > self.last_id.ms {
            StreamId { ms: now, seq: 0 }
        } else {
            self.last_id.next()
        };
        self.last_id = id;
        self.entries.insert(id, record);
        id
    }

    /// Append with an explicit id.
    ///
    /// # Errors
    /// Returns an error if `id` is not greater than the last id in the stream.
    pub fn add(&mut self, id: StreamId, record: Record) -> Result<(), StoreError> {
        if id <= self.last_id {
            return Err(StoreError::StreamIdTooSmall);
        }
        self.last_id = id;
        self.entries.insert(id, record);
        Ok(())
    }

    /// First entry with an id at or after `id`.
    #[must_use]
    pub fn first_from(&self, id: StreamId) -> Option<(StreamId, &Record)> {
        self.entries.range(id..).next().map(|(k, v)| (*k, v))
    }

    pub fn remove(&mut self, id: StreamId) -> bool {
        self.entries.remove(&id).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub const fn last_id(&self) -> StreamId {
        self.last_id
    }

    pub fn iter(&self) -> impl Iterator<Item = (StreamId, &Record)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }

    pub(crate) fn memory_estimate(&self) -> u64 {
        self.entries
            .iter()
            .map(|(_, record)| {
                16 + record
                    .iter()
                    .map(|(f, v)| (f.len() + v.len()) as u64)
                    .sum::<u64>()
            })
            .sum()
    }
}
