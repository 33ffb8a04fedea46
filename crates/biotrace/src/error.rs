/// Everything that can go wrong inside the engine.
///
/// The variants mirror how failures propagate: source and decode problems are usually local to a
/// chunk and survivable, allocation and state problems fail the operation that hit them, protocol
/// problems reject a single commission, and cancellation is not really an error at all (it is
/// logged at debug and otherwise ignored).
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying I/O failure (network, file handle, permission).
    #[error("source read failed over bytes {start}..{end}: {message}")]
    Source {
        message: String,
        start: u64,
        end: u64,
    },

    /// Malformed bytes from the source.
    #[error("malformed data over bytes {start}..{end}: {message}")]
    Decode {
        message: String,
        start: u64,
        end: u64,
    },

    /// The memory manager could not satisfy an allocation.
    #[error("allocation of {requested} bytes failed ({available} bytes evictable)")]
    Allocation { requested: usize, available: usize },

    /// A commission with an unknown action, duplicate request number, or mismatched payload.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// An operation was invoked in the wrong lifecycle state.
    #[error("invalid state: {0}")]
    State(String),

    /// Consumer- or shutdown-initiated cancellation.
    #[error("cancelled: {0}")]
    Cancelled(&'static str),
}

impl Error {
    pub fn source_io(err: std::io::Error, start: u64, end: u64) -> Error {
        Error::Source {
            message: err.to_string(),
            start,
            end,
        }
    }

    pub fn decode(message: impl Into<String>, start: u64, end: u64) -> Error {
        Error::Decode {
            message: message.into(),
            start,
            end,
        }
    }

    /// True for failures a chunk loop may skip over rather than aborting the recording.
    pub fn is_chunk_recoverable(&self) -> bool {
        matches!(self, Error::Source { .. } | Error::Decode { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
