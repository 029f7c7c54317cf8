#[cfg(feature = "live")]
use std::sync::mpsc::RecvError;

use thiserror::Error;

pub use crate::compiler::{CompileError, ObjectError, TranspileError};
pub use crate::graph::SolveError;
pub use crate::linker::LinkError;
pub use crate::resolve::ResolveError;

#[derive(Debug, Error)]
pub enum KobakoError {
    #[error("Error while compiling sources:\n{0}")]
    Compile(#[from] CompileError),

    #[error("Error while linking bundles:\n{0}")]
    Link(#[from] LinkError),

    #[cfg(feature = "live")]
    #[error("Error while watching for file changes:\n{0}")]
    Watch(#[from] WatchError),
}

#[cfg(feature = "live")]
#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Notify(#[from] notify::Error),

    #[error(transparent)]
    Recv(#[from] RecvError),
}
