use thiserror::Error;

/// Errors surfaced by the control API.
///
/// Per-request failures never show up here: they are recorded as
/// [`RequestOutcome`](crate::types::RequestOutcome)s and the run continues.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid workload parameters, detected before anything starts
    #[error("configuration error: {0}")]
    Config(String),

    #[error("worker pool is closed")]
    PoolClosed,

    #[error("no run in progress")]
    NotRunning,

    #[error("a run is already in progress")]
    AlreadyRunning,

    /// The runner already completed a run; phases never repeat
    #[error("run already finished, create a new runner")]
    Finished,

    #[error("start must be called from within a Tokio runtime")]
    NoRuntime,

    #[error("failed to build HTTP client: {0}")]
    Client(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}
