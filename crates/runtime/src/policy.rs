//! Cross-cutting enforcement: identity, writability, and memory pressure.
//!
//! The same three predicates run at CALL entry and again at every `block`
//! acquisition; only the error surfaces differ. Identity is never trusted
//! from capture: the snapshotted user name is re-resolved against the live
//! ACL table on every check, so mid-flight `ACL` edits and deletions take
//! effect at the next suspension point.

use quern_store::{AclUser, CommandSpec, Role, StoreError, StoreState, command_spec};

use crate::client::InvocationContext;
use crate::error::{Error, Result};
use crate::sandbox::FunctionFlags;

/// Resolve the snapshotted identity against the live ACL table.
pub(crate) fn authenticate<'a>(state: &'a StoreState, user: &str) -> Result<&'a AclUser> {
    state
        .acl
        .user(user)
        .filter(|u| u.enabled())
        .ok_or(Error::AuthenticationFailed)
}

/// Entry checks for `FUNCTION CALL`.
pub(crate) fn check_call_entry(state: &StoreState, flags: FunctionFlags) -> Result<()> {
    if !flags.no_writes && state.role() == Role::Replica {
        return Err(Error::WriteFunctionOnReplica);
    }
    if !flags.allow_oom && state.out_of_memory() {
        return Err(Error::OomAtCall);
    }
    Ok(())
}

/// Re-checks performed when a background task acquires the store lock.
pub(crate) fn check_lock(state: &StoreState, ctx: &InvocationContext) -> Result<()> {
    authenticate(state, &ctx.user)?;
    if !ctx.flags.no_writes && state.role() == Role::Replica {
        return Err(Error::LockOnReplica);
    }
    if !ctx.flags.allow_oom && state.out_of_memory() {
        return Err(Error::OomAtLock);
    }
    Ok(())
}

fn verify_acl(
    user: &AclUser,
    spec: &'static CommandSpec,
    cmd: &str,
    args: &[&str],
) -> Result<()> {
    if !user.permits_command(cmd) {
        return Err(Error::AclDenied(cmd.to_ascii_lowercase()));
    }
    for &position in spec.keys {
        if let Some(key) = args.get(position)
            && !user.permits_key(key)
        {
            return Err(Error::AclDenied(cmd.to_ascii_lowercase()));
        }
    }
    Ok(())
}

/// Per-command check for `client.call` inside a function or consumer.
pub(crate) fn check_command(
    state: &StoreState,
    ctx: &InvocationContext,
    cmd: &str,
    args: &[&str],
) -> Result<&'static CommandSpec> {
    let spec = command_spec(cmd)
        .ok_or_else(|| Error::Store(StoreError::UnknownCommand(cmd.to_owned())))?;
    let user = authenticate(state, &ctx.user)?;
    verify_acl(user, spec, cmd, args)?;
    if spec.write && ctx.flags.no_writes {
        return Err(Error::WriteNotAllowed(cmd.to_ascii_lowercase()));
    }
    Ok(spec)
}

/// Check for commands arriving directly over a session.
pub(crate) fn check_session_command(
    state: &StoreState,
    user: &str,
    cmd: &str,
    args: &[&str],
) -> Result<&'static CommandSpec> {
    let spec = command_spec(cmd)
        .ok_or_else(|| Error::Store(StoreError::UnknownCommand(cmd.to_owned())))?;
    let user = authenticate(state, user)?;
    verify_acl(user, spec, cmd, args)?;
    if spec.write && state.role() == Role::Replica {
        return Err(Error::ReadOnlyReplica);
    }
    Ok(spec)
}

/// Permission gate for the `FUNCTION` command family itself.
pub(crate) fn check_function_command(state: &StoreState, user: &str) -> Result<()> {
    let user = authenticate(state, user)?;
    if !user.permits_command("function") {
        return Err(Error::AclDenied("function".to_owned()));
    }
    Ok(())
}
