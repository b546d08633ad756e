//! Native backend: libraries authored as Rust modules.
//!
//! Embedders register module initializers on the backend by name; a library
//! body names the module it instantiates. Each load runs the initializer
//! against a fresh [`LoadContext`], so module-level state is created per
//! sandbox and replaced wholesale on upgrade.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::anyhow;
use parking_lot::RwLock;
use quern_store::Value;

use super::{Backend, LoadContext, SandboxHandle};
use crate::error::{Error, Result};

/// Initializer run once per library load.
pub type ModuleInit = Arc<dyn Fn(&mut LoadContext) -> Result<()> + Send + Sync>;

pub struct NativeBackend {
    tag: &'static str,
    modules: RwLock<HashMap<String, ModuleInit>>,
    active: Arc<AtomicUsize>,
    not_active: Arc<AtomicUsize>,
}

impl NativeBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::with_tag("rs")
    }

    #[must_use]
    pub fn with_tag(tag: &'static str) -> Self {
        Self {
            tag,
            modules: RwLock::new(HashMap::new()),
            active: Arc::new(AtomicUsize::new(0)),
            not_active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Register a module initializer under `name`.
    pub fn module(
        &self,
        name: impl Into<String>,
        init: impl Fn(&mut LoadContext) -> Result<()> + Send + Sync + 'static,
    ) {
        self.modules.write().insert(name.into(), Arc::new(init));
    }

    fn new_handle(&self) -> SandboxHandle {
        self.active.fetch_add(1, Ordering::SeqCst);
        let active = Arc::clone(&self.active);
        let not_active = Arc::clone(&self.not_active);
        SandboxHandle::new(move || {
            active.fetch_sub(1, Ordering::SeqCst);
            not_active.fetch_add(1, Ordering::SeqCst);
        })
    }
}

impl Default for NativeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for NativeBackend {
    fn tag(&self) -> &'static str {
        self.tag
    }

    fn compile(&self, body: &str, load: &mut LoadContext) -> Result<SandboxHandle> {
        let name = body.trim();
        let init = self
            .modules
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Runtime(anyhow!("no native module named '{name}'")))?;
        // Created before the initializer runs so a failed load still shows
        // up as a released sandbox in the statistics.
        let handle = self.new_handle();
        init(load)?;
        Ok(handle)
    }

    fn debug(&self, args: &[String]) -> Result<Value> {
        match args.first().map(String::as_str) {
            Some("isolates_stats") => {
                let count = |v: &AtomicUsize| {
                    i64::try_from(v.load(Ordering::SeqCst)).unwrap_or(i64::MAX)
                };
                Ok(Value::Map(vec![
                    ("active".to_owned(), Value::Int(count(&self.active))),
                    ("not_active".to_owned(), Value::Int(count(&self.not_active))),
                ]))
            }
            _ => Err(Error::Runtime(anyhow!(
                "unknown debug subcommand for backend '{}'",
                self.tag
            ))),
        }
    }
}
