//! Low-latency structured logging for long-running multi-threaded
//! processes.
//!
//! All formatting work happens off the calling thread. A `log!` call
//! packs a compact binary record (site id, timestamp, raw argument
//! bytes) into the calling thread's lock-free staging ring; a single
//! background thread polls every ring, reassembles the human-readable
//! lines and writes finished buffers asynchronously through io_uring.
//!
//! ```ignore
//! use deferlog::{log, Level};
//!
//! deferlog::set_log_file("/var/log/app.log")?;
//! log!(Level::Info, "request %d served in %.3f ms", id, elapsed);
//! ```
//!
//! Format strings use printf syntax and are analyzed at compile time; a
//! bad specifier or a wrong argument count fails the build.

pub mod arguments;
pub mod clock;
pub mod config;
pub mod error;
pub mod format_analysis;
pub mod log_assembler;
pub mod log_site;
pub mod logger;
mod macros;
pub mod staging_buffer;

pub use arguments::{LogArgs, LogArgument, WideStr, MAX_LOG_ARGS};
pub use error::SetLogFileError;
pub use log_site::Level;
pub use logger::Logger;

/// Caps the emitted verbosity at `level`.
pub fn set_log_level(level: Level) {
    Logger::set_log_level(level)
}

/// The level currently emitted.
pub fn log_level() -> Level {
    Logger::log_level()
}

/// Redirects the sink to `path`, creating the file if needed. The
/// default sink is standard output.
pub fn set_log_file(path: &str) -> Result<(), SetLogFileError> {
    Logger::set_log_file(path)
}
