//! The wire facade: one [`Session`] per client connection.
//!
//! A session executes structured commands (RESP parsing is the embedder's
//! concern): `AUTH` rebinds the session identity, the `FUNCTION` family
//! routes into the runtime, and everything else dispatches to the store
//! under the global lock with ACL and replica-role checks applied.

use std::sync::Arc;

use parking_lot::Mutex;
use quern_store::{Role, Value};
use smallvec::SmallVec;
use tracing::info;

use crate::RuntimeInner;
use crate::client::{CallClient, InvocationContext};
use crate::consumers::flush_events;
use crate::error::{Error, Result};
use crate::policy;
use crate::registry::Verbosity;
use crate::replication::ReplicationRecord;
use crate::sandbox::{Backend as _, CallResult};

/// One client connection with its authenticated identity.
pub struct Session {
    rt: Arc<RuntimeInner>,
    user: Mutex<String>,
}

impl Session {
    pub(crate) fn new(rt: Arc<RuntimeInner>) -> Self {
        Self {
            rt,
            user: Mutex::new(quern_store::DEFAULT_USER.to_owned()),
        }
    }

    /// The identity this session currently runs as.
    #[must_use]
    pub fn user(&self) -> String {
        self.user.lock().clone()
    }

    /// Execute one command and return its reply.
    ///
    /// # Errors
    /// Returns authentication, ACL, policy, or command errors; for an
    /// asynchronous function call, whatever the settled promise carries.
    pub async fn execute(&self, cmd: &str, args: &[&str]) -> Result<Value> {
        if cmd.eq_ignore_ascii_case("auth") {
            return self.auth(args).await;
        }
        if cmd.eq_ignore_ascii_case("function") {
            return self.function(args).await;
        }

        let user = self.user();
        let mut state = self.rt.store.lock().await;
        let spec = policy::check_session_command(&state, &user, cmd, args)?;
        let owned: Vec<String> = args.iter().map(|s| (*s).to_owned()).collect();
        let reply = state.execute(cmd, &owned)?;
        if spec.write && state.role() == Role::Primary {
            self.rt.replicate(ReplicationRecord::Command {
                cmd: spec.name.to_owned(),
                args: crate::replication::rewritten_args(spec, owned, &reply),
            });
        }
        flush_events(&self.rt, &mut state);
        Ok(reply)
    }

    async fn auth(&self, args: &[&str]) -> Result<Value> {
        let [user, password] = args else {
            return Err(Error::BadSubcommand("auth".to_owned()));
        };
        let state = self.rt.store.lock().await;
        if !state.acl.auth(user, password) {
            return Err(Error::WrongPass);
        }
        drop(state);
        *self.user.lock() = (*user).to_owned();
        Ok(Value::ok())
    }

    async fn function(&self, args: &[&str]) -> Result<Value> {
        let Some((&sub, rest)) = args.split_first() else {
            return Err(Error::BadSubcommand("function".to_owned()));
        };
        let user = self.user();

        if sub.eq_ignore_ascii_case("load") {
            let (upgrade, source) = match rest {
                [source] => (false, *source),
                [upgrade, source] if upgrade.eq_ignore_ascii_case("upgrade") => (true, *source),
                _ => return Err(Error::BadSubcommand("function load".to_owned())),
            };
            let mut state = self.rt.store.lock().await;
            policy::check_function_command(&state, &user)?;
            let library = RuntimeInner::load_library(&self.rt, &mut state, source, upgrade)?;
            if state.role() == Role::Primary {
                self.rt.replicate(ReplicationRecord::LoadLibrary {
                    source: library.source.clone(),
                });
            }
            flush_events(&self.rt, &mut state);
            Ok(Value::ok())
        } else if sub.eq_ignore_ascii_case("delete") {
            let [name] = rest else {
                return Err(Error::BadSubcommand("function delete".to_owned()));
            };
            let state = self.rt.store.lock().await;
            policy::check_function_command(&state, &user)?;
            let library = self.rt.registry.remove(name)?;
            info!(library = %library.name, "library deleted");
            if state.role() == Role::Primary {
                self.rt.replicate(ReplicationRecord::DeleteLibrary {
                    name: library.name.clone(),
                });
            }
            Ok(Value::ok())
        } else if sub.eq_ignore_ascii_case("list") {
            let verbosity = Verbosity::parse(rest.first().copied())?;
            let state = self.rt.store.lock().await;
            policy::check_function_command(&state, &user)?;
            Ok(self.rt.registry.list(verbosity))
        } else if sub.eq_ignore_ascii_case("debug") {
            let Some((&engine, debug_args)) = rest.split_first() else {
                return Err(Error::BadSubcommand("function debug".to_owned()));
            };
            let state = self.rt.store.lock().await;
            policy::check_function_command(&state, &user)?;
            drop(state);
            let backend = self.rt.backend(engine)?;
            let owned: Vec<String> = debug_args.iter().map(|s| (*s).to_owned()).collect();
            backend.debug(&owned)
        } else if sub.eq_ignore_ascii_case("call") {
            self.call_function(&user, rest).await
        } else {
            Err(Error::BadSubcommand(format!("function {sub}")))
        }
    }

    /// The invocation gate: resolve, snapshot identity, enforce entry
    /// policy, invoke, and hold the reply until a pending result settles.
    async fn call_function(&self, user: &str, args: &[&str]) -> Result<Value> {
        let [library, function, call_args @ ..] = args else {
            return Err(Error::BadSubcommand("function call".to_owned()));
        };
        let pending = {
            let mut state = self.rt.store.lock().await;
            policy::check_function_command(&state, user)?;
            let library = self
                .rt
                .registry
                .get(library)
                .ok_or_else(|| Error::UnknownLibrary((*library).to_owned()))?;
            let decl = library
                .function(function)
                .ok_or_else(|| Error::UnknownFunction((*function).to_owned()))?;
            policy::check_call_entry(&state, decl.flags)?;

            let ctx = Arc::new(InvocationContext::new(
                user,
                decl.flags,
                Some(Arc::clone(&library)),
            ));
            let values: SmallVec<[Value; 4]> = call_args
                .iter()
                .map(|arg| {
                    if decl.flags.raw_arguments {
                        Value::Bytes(arg.as_bytes().to_vec())
                    } else {
                        Value::str(*arg)
                    }
                })
                .collect();
            let outcome = {
                let mut client = CallClient::new(&mut state, &self.rt, ctx);
                (decl.callback)(&mut client, &values)
            };
            flush_events(&self.rt, &mut state);
            match outcome? {
                CallResult::Value(value) => return Ok(value),
                CallResult::Async(task) => task,
            }
        };
        // Lock released; the reply settles with the promise.
        pending.await
    }
}
