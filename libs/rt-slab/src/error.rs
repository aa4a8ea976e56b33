use core::fmt;

/// The six error kinds every fallible operation in this workspace can
/// return. Shared across `rt-slab` and `task-runner` rather than given a
/// crate-local variant each, the way `kasync::error` keeps one small
/// vocabulary instead of one enum per module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A caller-supplied argument violates a structural precondition
    /// (oversized record, re-entrant `run_all`'s sibling cases excluded —
    /// see `Busy`).
    Invalid,
    /// The page allocator could not satisfy a request.
    OutOfMemory,
    /// An operation that requires at least one element found none.
    NoData,
    /// A shrink/pop requested more bytes than are present.
    Overflow,
    /// `run_all` was invoked while a pass was already in progress.
    Busy,
    /// A task failed to clean up after an `ABORT` signal.
    Abort,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Error::Invalid => "invalid argument",
            Error::OutOfMemory => "out of memory",
            Error::NoData => "no data",
            Error::Overflow => "overflow",
            Error::Busy => "busy",
            Error::Abort => "abort",
        };
        f.write_str(s)
    }
}

impl core::error::Error for Error {}
