use std::path::PathBuf;

/// An error that can occur while starting, running or stopping a backend.
///
/// None of these are ever returned to the host through the [`crate::Backend`]
/// hooks, they are logged and the backend is left partially or fully inactive.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Unable to `mmap` memory
    #[error("unable to allocate memory")]
    OutOfMemory,
    /// Only one handler chain can be attached at any one time.
    #[error("a crash handler is already installed")]
    HandlerAlreadyInstalled,
    /// The handler executable could not be resolved to an existing file
    #[error("invalid handler path '{}'", .0.display())]
    InvalidHandlerPath(PathBuf),
    /// The handler process failed to start
    #[error("failed to launch handler process")]
    HandlerLaunch(#[source] std::io::Error),
    /// The crash report database could not be opened or updated
    #[error("crash report database at '{}' is unusable", path.display())]
    Database {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
    /// The DSN could not be parsed
    #[error("invalid DSN '{0}'")]
    InvalidDsn(String),
    /// An I/O or other syscall failed
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
