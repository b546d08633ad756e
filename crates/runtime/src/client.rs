//! Client capabilities handed to library code.
//!
//! A [`CallClient`] exists only while the global store lock is held; it is
//! how a function or consumer touches the store synchronously. A
//! [`BackgroundClient`] is its detached counterpart: owned by a background
//! task, holding no lock, able to re-enter the store only through
//! [`BackgroundClient::block`], where the policy checks run again.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use quern_store::{Role, StoreState, Value};
use smallvec::SmallVec;
use tracing::debug;

use crate::RuntimeInner;
use crate::error::Result;
use crate::policy;
use crate::registry::Library;
use crate::replication::ReplicationRecord;
use crate::sandbox::FunctionFlags;

/// Identity and flag snapshot for one invocation.
///
/// Taken at CALL entry and shared with every background task the
/// invocation spawns. Holding the originating library keeps its sandbox
/// alive until all tasks settle, so upgrade and delete never invalidate
/// in-flight work.
#[derive(Clone)]
pub struct InvocationContext {
    pub(crate) user: String,
    pub(crate) flags: FunctionFlags,
    pub(crate) library: Option<Arc<Library>>,
}

impl InvocationContext {
    pub(crate) fn new(
        user: impl Into<String>,
        flags: FunctionFlags,
        library: Option<Arc<Library>>,
    ) -> Self {
        Self {
            user: user.into(),
            flags,
            library,
        }
    }

    /// Context for system-triggered consumer handlers.
    pub(crate) fn consumer(library: Option<Arc<Library>>) -> Self {
        Self::new(quern_store::DEFAULT_USER, FunctionFlags::default(), library)
    }
}

impl fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationContext")
            .field("user", &self.user)
            .field("flags", &self.flags)
            .field("library", &self.library.as_ref().map(|l| l.name.as_str()))
            .finish()
    }
}

/// Synchronous store access for library code, valid while the global lock
/// is held.
pub struct CallClient<'a> {
    state: &'a mut StoreState,
    rt: &'a Arc<RuntimeInner>,
    ctx: Arc<InvocationContext>,
}

impl<'a> CallClient<'a> {
    pub(crate) fn new(
        state: &'a mut StoreState,
        rt: &'a Arc<RuntimeInner>,
        ctx: Arc<InvocationContext>,
    ) -> Self {
        Self { state, rt, ctx }
    }

    /// Run a store command on behalf of the snapshotted identity.
    ///
    /// # Errors
    /// Returns an error if ACL verification fails, a write is attempted
    /// under `no-writes`, or the command itself fails.
    pub fn call(&mut self, cmd: &str, args: &[&str]) -> Result<Value> {
        let spec = policy::check_command(self.state, &self.ctx, cmd, args)?;
        let owned: SmallVec<[String; 4]> = args.iter().map(|s| (*s).to_owned()).collect();
        let reply = self.state.execute(cmd, &owned)?;
        if spec.write && self.state.role() == Role::Primary {
            self.rt.replicate(ReplicationRecord::Command {
                cmd: spec.name.to_owned(),
                args: crate::replication::rewritten_args(spec, owned.to_vec(), &reply),
            });
        }
        Ok(reply)
    }

    /// Detach a client for use after the lock is released.
    #[must_use]
    pub fn background(&self) -> BackgroundClient {
        BackgroundClient {
            rt: Arc::clone(self.rt),
            ctx: Arc::clone(&self.ctx),
        }
    }

    /// Spawn a background task carrying this invocation's context.
    ///
    /// The task runs off the store loop and does not hold the lock; it
    /// re-enters through [`BackgroundClient::block`]. Its result is not
    /// reported anywhere, so the task communicates through state it
    /// mutates itself.
    pub fn run_on_background<F, Fut>(&self, task: F)
    where
        F: FnOnce(BackgroundClient) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let client = self.background();
        drop(tokio::spawn(async move {
            if let Err(error) = task(client).await {
                debug!(%error, "background task ended with error");
            }
        }));
    }
}

/// Store access capability owned by a background task.
#[derive(Clone)]
pub struct BackgroundClient {
    rt: Arc<RuntimeInner>,
    ctx: Arc<InvocationContext>,
}

impl BackgroundClient {
    /// Acquire the global write lock and run `f` under it.
    ///
    /// Identity, role, and memory are re-verified before `f` runs; any
    /// store events raised by `f` are dispatched before the lock is
    /// released.
    ///
    /// # Errors
    /// Returns "Failed authenticating client" if the snapshotted user no
    /// longer exists, "Can not lock redis for write on replica" if the
    /// store was demoted, "OOM Can not lock redis for write" under memory
    /// pressure, and otherwise whatever `f` returns.
    pub async fn block<T>(&self, f: impl FnOnce(&mut CallClient<'_>) -> Result<T>) -> Result<T> {
        let mut state = self.rt.store.lock().await;
        policy::check_lock(&state, &self.ctx)?;
        let result = {
            let mut client = CallClient::new(&mut state, &self.rt, Arc::clone(&self.ctx));
            f(&mut client)
        };
        crate::consumers::flush_events(&self.rt, &mut state);
        result
    }

    /// Spawn a sibling background task sharing this task's context.
    pub fn run_on_background<F, Fut>(&self, task: F)
    where
        F: FnOnce(Self) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let client = self.clone();
        drop(tokio::spawn(async move {
            if let Err(error) = task(client).await {
                debug!(%error, "background task ended with error");
            }
        }));
    }
}
