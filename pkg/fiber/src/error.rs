use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the runtime internals.
///
/// Programmer misuse (calling coroutine-only APIs off a scheduler thread,
/// double-registering an fd direction) is not an `Error`; those are checked
/// panics with a diagnostic.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to create i/o poller: {0}")]
    PollerCreate(#[source] io::Error),

    #[error("i/o poller wait failed: {0}")]
    PollerWait(#[source] io::Error),

    #[error("failed to register fd {fd} with the poller: {source}")]
    PollerRegister {
        fd: i32,
        #[source]
        source: io::Error,
    },

    #[error("failed to map coroutine stack of {1} bytes: {0}")]
    StackMap(#[source] io::Error, usize),
}
