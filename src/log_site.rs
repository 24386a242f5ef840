//! Static and dynamic log-site descriptors shared between the producer
//! path, the registry, and the consumer.

use std::sync::Arc;

use crate::format_analysis::{FormatFragment, ParamType};

/// Default value of a site's id cell before registration.
pub const UNREGISTERED_LOG_ID: i32 = -1;

/// Severity of a log line. Higher values are chattier; a record is emitted
/// only when its level is at or below the logger's current level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    None = 0,
    Error = 1,
    Warning = 2,
    Info = 3,
    Debug = 4,
}

impl Level {
    /// Printable form, bracket-wrapped as it appears on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Level::None => "[<none>]",
            Level::Error => "[ERROR]",
            Level::Warning => "[WARNING]",
            Level::Info => "[INFO]",
            Level::Debug => "[DEBUG]",
        }
    }
}

/// Immutable per-site metadata, fully computed at compile time by the
/// `log!` macro. One of these lives in static storage at every call site.
pub struct LogSite {
    pub file: &'static str,
    pub line: u32,
    pub format: &'static str,
    /// The printable specifier forms, NUL-separated.
    pub conversion_storage: &'static [u8],
    pub fragments: &'static [FormatFragment],
    pub param_types: &'static [ParamType],
}

/// A registered site: the static descriptor plus the pieces that are only
/// known at the first call (severity as passed, per-parameter scalar
/// widths). Cloned into the consumer's shadow table.
#[derive(Clone)]
pub struct SiteRecord {
    pub site: &'static LogSite,
    pub level: Level,
    pub param_sizes: Arc<[usize]>,
}

/// Byte size of the record header: `log_id`, `info_size`, `ms_timestamp`.
/// Field order is a wire contract; `info_size` counts header plus payload.
pub const DYNAMIC_HEADER_SIZE: usize =
    std::mem::size_of::<usize>() * 2 + std::mem::size_of::<i64>();

#[derive(Clone, Copy, Debug)]
pub struct DynamicHeader {
    pub log_id: usize,
    pub info_size: usize,
    pub ms_timestamp: i64,
}

pub fn write_dynamic_header(buf: &mut [u8], header: DynamicHeader) {
    const WORD: usize = std::mem::size_of::<usize>();
    buf[..WORD].copy_from_slice(&header.log_id.to_ne_bytes());
    buf[WORD..2 * WORD].copy_from_slice(&header.info_size.to_ne_bytes());
    buf[2 * WORD..DYNAMIC_HEADER_SIZE].copy_from_slice(&header.ms_timestamp.to_ne_bytes());
}

/// Records may start at any byte offset inside a ring, so all reads are
/// unaligned-safe byte copies.
pub fn read_dynamic_header(buf: &[u8]) -> DynamicHeader {
    const WORD: usize = std::mem::size_of::<usize>();
    let mut word = [0u8; WORD];
    word.copy_from_slice(&buf[..WORD]);
    let log_id = usize::from_ne_bytes(word);
    word.copy_from_slice(&buf[WORD..2 * WORD]);
    let info_size = usize::from_ne_bytes(word);
    let mut quad = [0u8; 8];
    quad.copy_from_slice(&buf[2 * WORD..DYNAMIC_HEADER_SIZE]);
    DynamicHeader {
        log_id,
        info_size,
        ms_timestamp: i64::from_ne_bytes(quad),
    }
}
