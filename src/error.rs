//! Error types shared by the loader, the fetch layer and the scheduler.
//!
//! Every error is `Clone` because cached futures hand the same outcome to
//! every requester of a URL.

use thiserror::Error;

/// Failure to turn a URL into text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The server answered, but with a status the browser would treat as a
    /// script load error (4xx / 5xx).
    #[error("{url} load failed with status {status}")]
    Status { url: String, status: u16 },

    #[error("failed to fetch {url}: {message}")]
    Network { url: String, message: String },

    #[error("fetch blocked for {url}: {reason}")]
    Blocked { url: String, reason: String },

    #[error("failed to decode {url} as {charset}")]
    Decode { url: String, charset: String },

    #[error("failed to create HTTP client: {0}")]
    Client(String),
}

/// Top level error of the loading and execution pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// An empty entry URL was passed to `import_html` / `import_entry`.
    #[error("entry should not be empty!")]
    EmptyEntry,

    /// A descriptor entry carries neither `scripts` nor `styles`.
    #[error("entry scripts or styles should be array!")]
    InvalidDescriptor,

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("template error: {0}")]
    Template(String),

    /// The entry script threw; the whole execution is rejected.
    #[error("error occurs while executing entry script {src}: {message}")]
    EntryScript { src: String, message: String },

    /// The execution primitive itself failed (binding the proxy, reading exports).
    #[error("script runtime error: {0}")]
    Runtime(String),
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Runtime(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
