//! Library catalog: header parsing, load/upgrade/delete, and LIST output.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use quern_store::{Role, StoreState, Value};
use tracing::info;

use crate::RuntimeInner;
use crate::consumers::notifications::NotificationConsumer;
use crate::consumers::stream::StreamConsumer;
use crate::error::{Error, Result};
use crate::sandbox::{Backend as _, Callback, FunctionFlags, LoadContext, SandboxHandle};

/// Parsed `#!<engine> name=<library>` header and the remaining body.
pub(crate) struct LibraryHeader<'a> {
    pub engine: &'a str,
    pub name: &'a str,
    pub body: &'a str,
}

pub(crate) fn parse_header(source: &str) -> Result<LibraryHeader<'_>> {
    let (first, body) = source.split_once('\n').unwrap_or((source, ""));
    let rest = first.trim().strip_prefix("#!").ok_or(Error::BadHeader)?;
    let mut tokens = rest.split_whitespace();
    let engine = tokens.next().ok_or(Error::BadHeader)?;
    let name = tokens
        .find_map(|token| token.strip_prefix("name="))
        .filter(|name| !name.is_empty())
        .ok_or(Error::MissingName)?;
    Ok(LibraryHeader { engine, name, body })
}

/// An immutable registered function.
pub(crate) struct FunctionDecl {
    pub name: String,
    pub flags: FunctionFlags,
    pub callback: Callback,
}

/// A loaded library: compiled sandbox plus everything it registered.
pub(crate) struct Library {
    pub name: String,
    pub engine: String,
    pub source: String,
    pub functions: HashMap<String, Arc<FunctionDecl>>,
    pub notifications: Vec<Arc<NotificationConsumer>>,
    pub streams: Vec<Arc<StreamConsumer>>,
    _sandbox: SandboxHandle,
}

impl Library {
    pub(crate) fn function(&self, name: &str) -> Option<Arc<FunctionDecl>> {
        self.functions.get(name).cloned()
    }

    fn describe(&self, verbosity: Verbosity) -> Value {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        let functions = if verbosity == Verbosity::Base {
            names.iter().map(|n| Value::str(*n)).collect()
        } else {
            names
                .iter()
                .filter_map(|name| self.functions.get(*name))
                .map(|decl| {
                    Value::Map(vec![
                        ("name".to_owned(), Value::str(decl.name.clone())),
                        (
                            "flags".to_owned(),
                            Value::Array(decl.flags.names().iter().map(|f| Value::str(*f)).collect()),
                        ),
                    ])
                })
                .collect()
        };

        let notifications = self
            .notifications
            .iter()
            .map(|consumer| {
                if verbosity == Verbosity::Base {
                    return Value::str(consumer.name.clone());
                }
                let mut entries = vec![
                    ("name".to_owned(), Value::str(consumer.name.clone())),
                    ("prefix".to_owned(), Value::str(consumer.prefix.clone())),
                ];
                if verbosity >= Verbosity::Vv {
                    let stats = consumer.stats();
                    entries.extend([
                        (
                            "num_triggered".to_owned(),
                            Value::Int(i64::try_from(stats.num_triggered).unwrap_or(i64::MAX)),
                        ),
                        (
                            "num_success".to_owned(),
                            Value::Int(i64::try_from(stats.num_success).unwrap_or(i64::MAX)),
                        ),
                        (
                            "num_failed".to_owned(),
                            Value::Int(i64::try_from(stats.num_failed).unwrap_or(i64::MAX)),
                        ),
                        (
                            "last_error".to_owned(),
                            stats.last_error.map_or(Value::Null, Value::Str),
                        ),
                    ]);
                }
                Value::Map(entries)
            })
            .collect();

        let streams = self
            .streams
            .iter()
            .map(|consumer| {
                if verbosity == Verbosity::Base {
                    return Value::str(consumer.name.clone());
                }
                let mut entries = vec![
                    ("name".to_owned(), Value::str(consumer.name.clone())),
                    ("prefix".to_owned(), Value::str(consumer.prefix.clone())),
                    (
                        "window".to_owned(),
                        Value::Int(i64::try_from(consumer.window).unwrap_or(i64::MAX)),
                    ),
                    ("trim".to_owned(), Value::Bool(consumer.trim)),
                ];
                if verbosity >= Verbosity::Vv {
                    let streams = consumer
                        .snapshots()
                        .into_iter()
                        .map(|(key, cursor)| {
                            let mut entries = vec![
                                ("name".to_owned(), Value::str(key)),
                                (
                                    "last_error".to_owned(),
                                    cursor.last_error.map_or(Value::Null, Value::Str),
                                ),
                            ];
                            if verbosity >= Verbosity::Vvv {
                                entries.extend([
                                    (
                                        "id_to_read_from".to_owned(),
                                        Value::str(cursor.id_to_read_from.to_string()),
                                    ),
                                    (
                                        "pending_ids".to_owned(),
                                        Value::Array(
                                            cursor
                                                .pending_ids
                                                .iter()
                                                .map(|id| Value::str(id.to_string()))
                                                .collect(),
                                        ),
                                    ),
                                    (
                                        "total_record_processed".to_owned(),
                                        Value::Int(
                                            i64::try_from(cursor.total_record_processed)
                                                .unwrap_or(i64::MAX),
                                        ),
                                    ),
                                ]);
                            }
                            Value::Map(entries)
                        })
                        .collect();
                    entries.push(("streams".to_owned(), Value::Array(streams)));
                }
                Value::Map(entries)
            })
            .collect();

        Value::Map(vec![
            ("name".to_owned(), Value::str(self.name.clone())),
            ("engine".to_owned(), Value::str(self.engine.clone())),
            ("functions".to_owned(), Value::Array(functions)),
            ("notification_consumers".to_owned(), Value::Array(notifications)),
            ("stream_consumers".to_owned(), Value::Array(streams)),
        ])
    }
}

/// LIST verbosity levels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Verbosity {
    Base,
    V,
    Vv,
    Vvv,
}

impl Verbosity {
    pub(crate) fn parse(arg: Option<&str>) -> Result<Self> {
        match arg {
            None => Ok(Self::Base),
            Some(v) if v.eq_ignore_ascii_case("v") => Ok(Self::V),
            Some(v) if v.eq_ignore_ascii_case("vv") => Ok(Self::Vv),
            Some(v) if v.eq_ignore_ascii_case("vvv") => Ok(Self::Vvv),
            Some(other) => Err(Error::BadSubcommand(format!("list {other}"))),
        }
    }
}

/// Process-wide catalog of loaded libraries.
#[derive(Default)]
pub(crate) struct Registry {
    libraries: RwLock<HashMap<String, Arc<Library>>>,
}

impl Registry {
    pub(crate) fn get(&self, name: &str) -> Option<Arc<Library>> {
        self.libraries.read().get(name).cloned()
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.libraries.read().contains_key(name)
    }

    fn insert(&self, library: Arc<Library>, upgrade: bool) -> Result<()> {
        let mut libraries = self.libraries.write();
        if !upgrade && libraries.contains_key(&library.name) {
            return Err(Error::LibraryExists(library.name.clone()));
        }
        libraries.insert(library.name.clone(), library);
        Ok(())
    }

    pub(crate) fn remove(&self, name: &str) -> Result<Arc<Library>> {
        self.libraries
            .write()
            .remove(name)
            .ok_or_else(|| Error::UnknownLibrary(name.to_owned()))
    }

    /// All libraries, sorted by name for stable iteration and LIST output.
    pub(crate) fn all(&self) -> Vec<Arc<Library>> {
        let mut libraries: Vec<_> = self.libraries.read().values().cloned().collect();
        libraries.sort_by(|a, b| a.name.cmp(&b.name));
        libraries
    }

    pub(crate) fn list(&self, verbosity: Verbosity) -> Value {
        Value::Array(
            self.all()
                .iter()
                .map(|library| library.describe(verbosity))
                .collect(),
        )
    }
}

impl RuntimeInner {
    /// Load or upgrade a library from source.
    ///
    /// The new source is compiled to a fresh sandbox before anything is
    /// swapped; on failure the previous library keeps serving and the new
    /// sandbox is discarded.
    pub(crate) fn load_library(
        rt: &Arc<Self>,
        state: &mut StoreState,
        source: &str,
        upgrade: bool,
    ) -> Result<Arc<Library>> {
        let header = parse_header(source)?;
        let backend = rt.backend(header.engine)?;
        if !upgrade && rt.registry.contains(header.name) {
            return Err(Error::LibraryExists(header.name.to_owned()));
        }

        let mut load = LoadContext::default();
        let sandbox = backend.compile(header.body, &mut load)?;
        if load.is_empty() {
            return Err(Error::EmptyLibrary);
        }

        let functions = load
            .functions
            .into_iter()
            .map(|def| {
                (
                    def.name.clone(),
                    Arc::new(FunctionDecl {
                        name: def.name,
                        flags: def.flags,
                        callback: def.callback,
                    }),
                )
            })
            .collect();
        let notifications = load
            .notifications
            .into_iter()
            .map(|def| Arc::new(NotificationConsumer::new(def)))
            .collect();
        let streams: Vec<Arc<StreamConsumer>> = load
            .streams
            .into_iter()
            .map(|def| Arc::new(StreamConsumer::new(header.name.to_owned(), def)))
            .collect();

        let library = Arc::new(Library {
            name: header.name.to_owned(),
            engine: header.engine.to_owned(),
            source: source.to_owned(),
            functions,
            notifications,
            streams,
            _sandbox: sandbox,
        });
        rt.registry.insert(Arc::clone(&library), upgrade)?;
        info!(library = %library.name, engine = %library.engine, upgrade, "library loaded");

        // Matching streams may already hold unread entries.
        for consumer in &library.streams {
            let keys = consumer.discover(state);
            if state.role() == Role::Primary {
                for key in keys {
                    StreamConsumer::pull(consumer, rt, state, &library, &key);
                }
            }
        }
        Ok(library)
    }
}
