//! Sandbox adapter: the opaque boundary between the runtime and a script
//! engine.
//!
//! A [`Backend`] compiles a library body once; while the body runs it
//! registers functions and consumers through a [`LoadContext`]. Nothing can
//! be registered after compilation because the context is consumed by the
//! load. Invocations return a [`CallResult`]: either a settled value or a
//! future the caller awaits after releasing the store lock.

pub mod native;

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use quern_store::Value;

use crate::client::CallClient;
use crate::error::{Error, Result};

/// Outcome of invoking a sandboxed callable.
pub enum CallResult {
    /// The callable completed synchronously.
    Value(Value),
    /// The callable suspended; the reply settles when the future does.
    /// The future runs without the store lock and re-enters through
    /// [`crate::client::BackgroundClient::block`].
    Async(BoxFuture<'static, Result<Value>>),
}

impl fmt::Debug for CallResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("CallResult::Value").field(value).finish(),
            Self::Async(..) => f.debug_tuple("CallResult::Async").field(&"<future>").finish(),
        }
    }
}

/// A host-invokable callable registered by a library.
pub type Callback = Arc<dyn Fn(&mut CallClient<'_>, &[Value]) -> Result<CallResult> + Send + Sync>;

/// A value crossing the guest registration boundary.
///
/// Guest code is dynamically typed, so a registration argument arrives as
/// either a plain value or a callable; [`LoadContext`] validates the shape.
#[derive(Clone)]
pub enum GuestArg {
    Value(Value),
    Callable(Callback),
}

impl GuestArg {
    #[must_use]
    pub fn str(s: impl Into<String>) -> Self {
        Self::Value(Value::Str(s.into()))
    }

    #[must_use]
    pub const fn int(v: i64) -> Self {
        Self::Value(Value::Int(v))
    }

    #[must_use]
    pub fn callable(
        f: impl Fn(&mut CallClient<'_>, &[Value]) -> Result<CallResult> + Send + Sync + 'static,
    ) -> Self {
        Self::Callable(Arc::new(f))
    }

    fn into_name(self, what: &'static str) -> Result<String> {
        match self {
            Self::Value(Value::Str(s)) => Ok(s),
            _ => Err(Error::NotAString(what)),
        }
    }

    fn into_callback(self, what: &'static str) -> Result<Callback> {
        match self {
            Self::Callable(cb) => Ok(cb),
            Self::Value(_) => Err(Error::NotAFunction(what)),
        }
    }
}

impl fmt::Debug for GuestArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("GuestArg::Value").field(value).finish(),
            Self::Callable(..) => f.debug_tuple("GuestArg::Callable").finish(),
        }
    }
}

/// Flag set attached to a registered function.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FunctionFlags {
    /// The function promises not to write; it may run on a replica and its
    /// `call`s reject write commands.
    pub no_writes: bool,
    /// The function may run while the store is out of memory.
    pub allow_oom: bool,
    /// Arguments are delivered as raw bytes instead of strings.
    pub raw_arguments: bool,
}

impl FunctionFlags {
    /// Parse a guest-supplied flag list.
    ///
    /// # Errors
    /// Returns an error on an unrecognized flag name.
    pub fn parse<I>(flags: I) -> Result<Self>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut parsed = Self::default();
        for flag in flags {
            match flag.as_ref() {
                "no-writes" => parsed.no_writes = true,
                "allow-oom" => parsed.allow_oom = true,
                "raw-arguments" => parsed.raw_arguments = true,
                other => return Err(Error::UnknownFlag(other.to_owned())),
            }
        }
        Ok(parsed)
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.no_writes {
            names.push("no-writes");
        }
        if self.allow_oom {
            names.push("allow-oom");
        }
        if self.raw_arguments {
            names.push("raw-arguments");
        }
        names
    }
}

pub(crate) struct FunctionDef {
    pub name: String,
    pub flags: FunctionFlags,
    pub callback: Callback,
}

pub(crate) struct NotificationDef {
    pub name: String,
    pub prefix: String,
    pub callback: Callback,
}

pub(crate) struct StreamDef {
    pub name: String,
    pub prefix: String,
    pub window: usize,
    pub trim: bool,
    pub callback: Callback,
}

/// Registration collector handed to [`Backend::compile`].
///
/// Valid only while the library body runs; a library that registers
/// nothing is rejected when the load completes.
#[derive(Default)]
pub struct LoadContext {
    pub(crate) functions: Vec<FunctionDef>,
    pub(crate) notifications: Vec<NotificationDef>,
    pub(crate) streams: Vec<StreamDef>,
}

impl LoadContext {
    /// Register a named function.
    ///
    /// # Errors
    /// Returns an error if the name is not a string, the body is not a
    /// callable, or the name is already taken within this library.
    pub fn register_function(
        &mut self,
        name: GuestArg,
        body: GuestArg,
        flags: FunctionFlags,
    ) -> Result<()> {
        let name = name.into_name("function name")?;
        let callback = body.into_callback("function body")?;
        if self.functions.iter().any(|f| f.name == name) {
            return Err(Error::FunctionExists(name));
        }
        self.functions.push(FunctionDef {
            name,
            flags,
            callback,
        });
        Ok(())
    }

    /// Register a keyspace-notification consumer for keys under `prefix`
    /// (empty prefix matches every key).
    ///
    /// # Errors
    /// Returns an error if the name is not a string or the handler is not
    /// a callable.
    pub fn register_notification_consumer(
        &mut self,
        name: GuestArg,
        prefix: impl Into<String>,
        handler: GuestArg,
    ) -> Result<()> {
        let name = name.into_name("consumer name")?;
        let callback = handler.into_callback("consumer handler")?;
        self.notifications.push(NotificationDef {
            name,
            prefix: prefix.into(),
            callback,
        });
        Ok(())
    }

    /// Register a stream consumer over stream keys under `prefix`, with at
    /// most `window` records in flight per stream.
    ///
    /// # Errors
    /// Returns an error if the name is not a string, the handler is not a
    /// callable, or `window` is zero.
    pub fn register_stream_consumer(
        &mut self,
        name: GuestArg,
        prefix: impl Into<String>,
        window: usize,
        trim: bool,
        handler: GuestArg,
    ) -> Result<()> {
        let name = name.into_name("consumer name")?;
        let callback = handler.into_callback("consumer handler")?;
        if window == 0 {
            return Err(Error::BadWindow);
        }
        self.streams.push(StreamDef {
            name,
            prefix: prefix.into(),
            window,
            trim,
            callback,
        });
        Ok(())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.functions.is_empty() && self.notifications.is_empty() && self.streams.is_empty()
    }
}

/// Exclusive handle to a live sandbox; dropping it releases the engine
/// resources behind a library.
pub struct SandboxHandle {
    on_release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SandboxHandle {
    #[must_use]
    pub fn new(on_release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            on_release: Some(Box::new(on_release)),
        }
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        if let Some(release) = self.on_release.take() {
            release();
        }
    }
}

impl fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxHandle").finish_non_exhaustive()
    }
}

/// A script engine the runtime can host libraries on.
pub trait Backend: Send + Sync + 'static {
    /// Engine tag matched against the `#!<engine>` library header.
    fn tag(&self) -> &'static str;

    /// Compile `body` and run it against `load` to collect registrations.
    ///
    /// On failure the engine must release whatever sandbox it created so
    /// that its statistics reflect the discard promptly.
    ///
    /// # Errors
    /// Returns parse, validation, or engine errors from the library body.
    fn compile(&self, body: &str, load: &mut LoadContext) -> Result<SandboxHandle>;

    /// Engine-specific debug subcommands (e.g. `isolates_stats`).
    ///
    /// # Errors
    /// Returns an error for unknown subcommands.
    fn debug(&self, args: &[String]) -> Result<Value>;
}

#[cfg(test)]
mod tests {
    use super::{FunctionFlags, GuestArg, LoadContext};
    use crate::error::Error;
    use crate::sandbox::CallResult;

    fn noop() -> GuestArg {
        GuestArg::callable(|_, _| Ok(CallResult::Value(quern_store::Value::Null)))
    }

    #[test]
    fn parse_flags() {
        let flags = FunctionFlags::parse(["no-writes", "allow-oom"]).expect("parse");
        assert!(flags.no_writes && flags.allow_oom && !flags.raw_arguments);
        assert_eq!(flags.names(), vec!["no-writes", "allow-oom"]);
        assert!(matches!(
            FunctionFlags::parse(["nope"]),
            Err(Error::UnknownFlag(f)) if f == "nope"
        ));
    }

    #[test]
    fn registration_validation() {
        let mut load = LoadContext::default();
        assert!(matches!(
            load.register_function(GuestArg::int(1), noop(), FunctionFlags::default()),
            Err(Error::NotAString(_))
        ));
        assert!(matches!(
            load.register_function(
                GuestArg::str("f"),
                GuestArg::str("not callable"),
                FunctionFlags::default()
            ),
            Err(Error::NotAFunction(_))
        ));
        load.register_function(GuestArg::str("f"), noop(), FunctionFlags::default())
            .expect("register");
        assert!(matches!(
            load.register_function(GuestArg::str("f"), noop(), FunctionFlags::default()),
            Err(Error::FunctionExists(name)) if name == "f"
        ));
        assert!(matches!(
            load.register_stream_consumer(GuestArg::str("c"), "s", 0, false, noop()),
            Err(Error::BadWindow)
        ));
        assert!(!load.is_empty());
    }
}
