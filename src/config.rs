//! Build-time tunables. None of these are runtime-configurable.

use crate::log_site::Level;

/// Capacity of each producer's staging ring.
pub const STAGING_BUFFER_SIZE: usize = 1024 * 1024;

/// Size of each half of the consumer's output double buffer.
pub const DOUBLE_BUFFER_SIZE: usize = 1024 * 1024 * 8;

/// io_uring submission-queue depth. At most one write is ever in flight.
pub const IO_URING_ENTRIES: u32 = 1;

/// Open flags for a log file set via [`crate::set_log_file`].
pub const LOG_FILE_FLAGS: libc::c_int =
    libc::O_CREAT | libc::O_APPEND | libc::O_RDWR | libc::O_DSYNC | libc::O_NOATIME;

/// Mode bits for a freshly created log file.
pub const LOG_FILE_MODE: libc::mode_t = 0o666;

/// Level the logger starts with before any [`crate::set_log_level`] call.
pub const DEFAULT_LOG_LEVEL: Level = Level::Info;
