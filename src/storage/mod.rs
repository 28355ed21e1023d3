//! External collaborators of the controller: job specification store,
//! status persistence, pipeline artifacts and the log directory layout.

pub mod catalog;
pub mod logs;
pub mod pipeline;
pub mod status_store;

use tokio::runtime::{Handle, RuntimeFlavor};

use crate::error::{FlowError, Result};

pub use catalog::{JobCatalog, JobPaths};
pub use logs::LogLayout;
pub use pipeline::{Pipeline, PipelineStore};
pub use status_store::{FileStatusStore, MemoryStatusStore, StatusStore};

/// Check that `value` names exactly one directory entry below a storage
/// root. `kind` labels the value in the error.
pub fn path_segment<'a>(kind: &str, value: &'a str) -> Result<&'a str> {
    if value.is_empty() || value == "." || value == ".." || value.contains(['/', '\\', '\0']) {
        return Err(FlowError::InvalidSpec(format!(
            "{} '{}' is not a valid name",
            kind,
            value.escape_default()
        )));
    }
    Ok(value)
}

/// Run synchronous file I/O from async code. On a multi-threaded runtime the
/// worker hands its queued tasks to other workers first; otherwise `f` runs
/// inline.
pub fn run_blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}
