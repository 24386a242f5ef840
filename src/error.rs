use std::io;

/// Errors surfaced by [`crate::set_log_file`].
///
/// Failures leave the logger's sink unchanged.
#[derive(thiserror::Error, Debug)]
pub enum SetLogFileError {
    #[error("unable to read/write file: {0}")]
    NotAccessible(String),

    #[error("can't open file {0}: {1}")]
    Open(String, #[source] io::Error),

    #[error("log file path contains an interior NUL byte: {0}")]
    InvalidPath(String),
}
