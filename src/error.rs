use thiserror::Error;

#[derive(Debug, Error)]
pub enum KstateError {
    /// A symbol, type or member the tool depends on is not available.
    #[error("accessor unavailable: {0}")]
    AccessorUnavailable(String),

    #[error("mm_struct.rss_stat matches neither the atomic array nor the percpu_counter layout")]
    UnsupportedCounterLayout,

    #[error("{list} list integrity error after {visited} nodes: {reason}")]
    ListIntegrity {
        list: String,
        visited: usize,
        reason: &'static str,
    },

    /// A value read from memory is out of any sensible range, typically a
    /// torn read of a structure that changed underneath us.
    #[error("implausible {what}: {value:#x}")]
    Implausible { what: &'static str, value: u64 },

    #[error("memory read failed: {0}")]
    Memory(memflow::error::Error),

    #[error("invalid schema: {0}")]
    Schema(String),

    #[error("symbol table: {0}")]
    Symbols(String),

    #[error("configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<memflow::error::Error> for KstateError {
    fn from(err: memflow::error::Error) -> Self {
        KstateError::Memory(err)
    }
}

impl KstateError {
    pub(crate) fn unavailable(what: impl Into<String>) -> Self {
        KstateError::AccessorUnavailable(what.into())
    }
}

pub type Result<T> = std::result::Result<T, KstateError>;
