use quern_store::StoreError;
use thiserror::Error;

/// Result type used across `quern-runtime` APIs.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Every error surfaced over the wire facade.
///
/// The rendered strings are part of the compatibility contract: clients
/// match on substrings of enforcer and load failures, so variants spell
/// their messages exactly.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown backend {0}")]
    UnknownBackend(String),

    #[error("Failed find 'name' property")]
    MissingName,

    #[error("Failed to parse library header, expected #!<engine> name=<library name>")]
    BadHeader,

    #[error("Library {0} already exists")]
    LibraryExists(String),

    #[error("Unknown library {0}")]
    UnknownLibrary(String),

    #[error("Unknown function {0}")]
    UnknownFunction(String),

    #[error("Function {0} already exists")]
    FunctionExists(String),

    #[error("{0} must be a string")]
    NotAString(&'static str),

    #[error("{0} must be a function")]
    NotAFunction(&'static str),

    #[error("Unknown function flag '{0}'")]
    UnknownFlag(String),

    #[error("stream consumer window must be at least 1")]
    BadWindow,

    #[error("No function nor registrations was registered")]
    EmptyLibrary,

    #[error("Unknown subcommand or wrong number of arguments for '{0}'")]
    BadSubcommand(String),

    #[error("acl verification failed, can not run command '{0}'")]
    AclDenied(String),

    #[error("Failed authenticating client")]
    AuthenticationFailed,

    #[error("WRONGPASS invalid username-password pair or user is disabled")]
    WrongPass,

    #[error("can not run a function that might perform writes on a replica")]
    WriteFunctionOnReplica,

    #[error("Can not lock redis for write on replica")]
    LockOnReplica,

    #[error("OOM can not run the function when out of memory")]
    OomAtCall,

    #[error("OOM Can not lock redis for write")]
    OomAtLock,

    #[error("Write command '{0}' was called while write is not allowed")]
    WriteNotAllowed(String),

    #[error("READONLY You can't write against a read only replica")]
    ReadOnlyReplica,

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Failure raised by library code itself.
    #[error("{message}")]
    Function { message: String },

    /// Internal runtime failure.
    #[error("runtime error: {0}")]
    Runtime(#[source] anyhow::Error),
}

impl Error {
    /// Build a library-code failure from any displayable payload.
    pub fn function(message: impl Into<String>) -> Self {
        Self::Function {
            message: message.into(),
        }
    }
}
