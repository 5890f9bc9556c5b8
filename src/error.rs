//! Error types used across the build orchestrator.

use std::{
    io,
    path::{Path, PathBuf},
};

/// The crate-wide result type.
pub type Result<T, E = BuildError> = std::result::Result<T, E>;

/// Various errors raised while orchestrating a build.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// The SCC DAG handed to the topological sort still contained a cycle.
    ///
    /// Impossible for input produced by an SCC computation; kept as a
    /// defensive invariant.
    #[error("cyclic dependency amongst {0:?}")]
    CyclicDependency(Vec<String>),
    #[error("{0}")]
    Message(String),
}

/// A blocking failure carrying the diagnostics accumulated up to the point
/// where the build had to stop.
///
/// This is the only failure that escapes [`build`](crate::build): parse
/// errors, bogus relative imports, duplicate roots and unusable cache
/// directories all unwind through this type after pending messages have been
/// flushed.
#[derive(Clone, Debug, Default, thiserror::Error)]
#[error("{}", .messages.join("\n"))]
pub struct CompileError {
    /// Diagnostics that have not been streamed out yet.
    pub messages: Vec<String>,
    /// Whether the messages target regular diagnostic output rather than the
    /// error channel.
    pub use_stdout: bool,
    /// The module that produced the blocking diagnostic, if known.
    pub module_with_blocker: Option<String>,
}

impl CompileError {
    pub fn new(messages: Vec<String>) -> Self {
        Self { messages, use_stdout: false, module_with_blocker: None }
    }

    pub(crate) fn from_message(msg: impl Into<String>) -> Self {
        Self::new(vec![msg.into()])
    }
}

/// A wrapper around `io::Error` that remembers the path the operation was
/// performed on.
#[derive(Debug, thiserror::Error)]
#[error("\"{}\": {io}", self.path.display())]
pub struct IoError {
    io: io::Error,
    path: PathBuf,
}

impl IoError {
    pub fn new(io: io::Error, path: impl Into<PathBuf>) -> Self {
        Self { io, path: path.into() }
    }

    /// The path at which the operation failed.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl From<IoError> for io::Error {
    fn from(err: IoError) -> Self {
        err.io
    }
}
