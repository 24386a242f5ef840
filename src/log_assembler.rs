//! Reconstruction of formatted log lines on the consumer thread.
//!
//! [`LogAssembler`] turns one (static descriptor, dynamic record) pair
//! into the textual line
//!
//! ```text
//! YYYY-MM-DD hh:mm:ss.mmm <file>:<line> [SEVERITY][producer]: body\r\n
//! ```
//!
//! writing into a bounded buffer. The assembler is deliberately
//! conservative about that buffer: whenever a piece cannot fit into the
//! remaining space it rolls the piece back, reports the buffer full and
//! keeps enough state to continue from exactly the next byte once the
//! caller supplies fresh space. Literal runs of the format string may be
//! split at any byte; every other piece is written atomically.
//!
//! Argument rendering goes through the platform `snprintf` with the
//! specifier's printable form recovered from the descriptor's conversion
//! storage, so the output matches C's printf semantics exactly.

use std::ffi::CStr;
use std::fmt::Write as _;
use std::mem::size_of;

use chrono::TimeZone;
use libc::c_char;

use crate::format_analysis::{ConversionType, ParamType};
use crate::log_site::SiteRecord;

const WORD: usize = size_of::<usize>();

pub struct LogAssembler {
    buffer_size: usize,
    written_count: usize,
    bytes_last_written: usize,
    is_full: bool,

    conversion_index: usize,
    parameter_index: usize,
    format_index: usize,
    args_read_pos: usize,

    site: Option<SiteRecord>,
    arg_data: Vec<u8>,
    wide_scratch: Vec<libc::wchar_t>,
    spec_scratch: Vec<u8>,

    /// "YYYY-MM-DD hh:mm:ss.mmm " with a trailing space.
    timestamp_str: String,
    /// "file:line " with a trailing space.
    file_and_line: String,
    /// "[id]: " including the separator.
    producer_id: String,

    is_timestamp_written: bool,
    is_file_and_line_written: bool,
    is_severity_written: bool,
    is_producer_id_written: bool,
    is_end_of_log_written: bool,
}

impl LogAssembler {
    pub fn new() -> Self {
        Self {
            buffer_size: 0,
            written_count: 0,
            bytes_last_written: 0,
            is_full: false,
            conversion_index: 0,
            parameter_index: 0,
            format_index: 0,
            args_read_pos: 0,
            site: None,
            arg_data: Vec::new(),
            wide_scratch: Vec::new(),
            spec_scratch: Vec::new(),
            timestamp_str: String::new(),
            file_and_line: String::new(),
            producer_id: String::from("[0]: "),
            is_timestamp_written: false,
            is_file_and_line_written: false,
            is_severity_written: false,
            is_producer_id_written: false,
            is_end_of_log_written: false,
        }
    }

    /// Points the assembler at a fresh output buffer of `buffer_size`
    /// bytes. Resumption state of a partially written line is kept.
    pub fn set_buffer(&mut self, buffer_size: usize) {
        self.buffer_size = buffer_size;
        self.written_count = 0;
        self.is_full = false;
    }

    /// Loads one record. Indices and phase flags reset; the next
    /// [`LogAssembler::write`] starts a new line.
    pub fn load_log_info(
        &mut self,
        record: &SiteRecord,
        ms_timestamp: i64,
        arg_data: &[u8],
        producer_id: u32,
    ) {
        self.site = Some(record.clone());
        self.arg_data.clear();
        self.arg_data.extend_from_slice(arg_data);

        let seconds = ms_timestamp.div_euclid(1000);
        let millis = ms_timestamp.rem_euclid(1000);
        let datetime = chrono::Local
            .timestamp_opt(seconds, 0)
            .earliest()
            .unwrap_or_else(|| {
                chrono::Local
                    .timestamp_opt(0, 0)
                    .earliest()
                    .expect("the epoch is representable in local time")
            });
        self.timestamp_str.clear();
        let _ = write!(
            self.timestamp_str,
            "{}.{:03} ",
            datetime.format("%Y-%m-%d %H:%M:%S"),
            millis
        );

        self.file_and_line.clear();
        let _ = write!(
            self.file_and_line,
            "{}:{} ",
            record.site.file, record.site.line
        );

        self.producer_id.clear();
        let _ = write!(self.producer_id, "[{}]: ", producer_id);

        self.reset_indices();
        self.reset_flags();
    }

    /// True while the loaded record has bytes left to emit.
    pub fn has_remaining_data(&self) -> bool {
        self.site.is_some() && !self.is_end_of_log_written
    }

    /// Bytes emitted into the current buffer so far.
    pub fn written_bytes(&self) -> usize {
        self.written_count
    }

    pub fn is_buffer_full(&self) -> bool {
        self.is_full
    }

    /// Emits as much of the loaded record as fits, returning the bytes
    /// written by this call. When the buffer fills mid-line the caller
    /// swaps buffers, calls [`LogAssembler::set_buffer`] and writes again.
    pub fn write(&mut self, out: &mut [u8]) -> usize {
        debug_assert_eq!(out.len(), self.buffer_size);
        if self.is_full {
            return 0;
        }
        self.bytes_last_written = 0;
        let Some(record) = self.site.clone() else {
            return 0;
        };

        if !self.is_timestamp_written {
            match try_copy(out, self.written_count, self.timestamp_str.as_bytes()) {
                Some(n) => {
                    self.finish_piece(n);
                    self.is_timestamp_written = true;
                }
                None => return self.mark_full(),
            }
        }

        if !self.is_file_and_line_written {
            match try_copy(out, self.written_count, self.file_and_line.as_bytes()) {
                Some(n) => {
                    self.finish_piece(n);
                    self.is_file_and_line_written = true;
                }
                None => return self.mark_full(),
            }
        }

        if !self.is_severity_written {
            match try_copy(out, self.written_count, record.level.as_str().as_bytes()) {
                Some(n) => {
                    self.finish_piece(n);
                    self.is_severity_written = true;
                }
                None => return self.mark_full(),
            }
        }

        if !self.is_producer_id_written {
            match try_copy(out, self.written_count, self.producer_id.as_bytes()) {
                Some(n) => {
                    self.finish_piece(n);
                    self.is_producer_id_written = true;
                }
                None => return self.mark_full(),
            }
        }

        let format_len = record.site.format.len();
        while self.format_index < format_len {
            if self.conversion_index < record.site.fragments.len() {
                let fragment = record.site.fragments[self.conversion_index];
                if self.format_index < fragment.format_pos {
                    if !self.write_literal_run(out, &record, fragment.format_pos) {
                        return self.bytes_last_written;
                    }
                } else if !self.write_argument(out, &record) {
                    return self.bytes_last_written;
                }
            } else if !self.write_literal_run(out, &record, format_len) {
                return self.bytes_last_written;
            }
        }

        if !self.is_end_of_log_written {
            match try_copy(out, self.written_count, b"\r\n") {
                Some(n) => {
                    self.finish_piece(n);
                    self.is_end_of_log_written = true;
                }
                None => return self.mark_full(),
            }
        }

        self.bytes_last_written
    }

    fn reset_indices(&mut self) {
        self.conversion_index = 0;
        self.parameter_index = 0;
        self.format_index = 0;
        self.args_read_pos = 0;
    }

    fn reset_flags(&mut self) {
        self.is_timestamp_written = false;
        self.is_file_and_line_written = false;
        self.is_severity_written = false;
        self.is_producer_id_written = false;
        self.is_end_of_log_written = false;
    }

    fn finish_piece(&mut self, bytes_written: usize) {
        self.bytes_last_written += bytes_written;
        self.written_count += bytes_written;
    }

    fn mark_full(&mut self) -> usize {
        self.is_full = true;
        self.bytes_last_written
    }

    /// Copies format-string bytes `[format_index, run_end)`. Unlike the
    /// atomic pieces a literal run may be split: whatever fits is
    /// committed and `format_index` advances by exactly that much.
    fn write_literal_run(&mut self, out: &mut [u8], record: &SiteRecord, run_end: usize) -> bool {
        let src = &record.site.format.as_bytes()[self.format_index..run_end];
        let free = out.len() - self.written_count;
        let fit = src.len().min(free);
        out[self.written_count..self.written_count + fit].copy_from_slice(&src[..fit]);
        self.finish_piece(fit);
        self.format_index += fit;
        if fit < src.len() {
            self.is_full = true;
            return false;
        }
        true
    }

    /// Formats the next specifier's argument. On a full buffer the
    /// pre-argument cursor is restored so the retry re-reads the same
    /// dynamic width/precision and payload.
    fn write_argument(&mut self, out: &mut [u8], record: &SiteRecord) -> bool {
        let fragment = record.site.fragments[self.conversion_index];
        let param_types = record.site.param_types;
        let param_sizes = &record.param_sizes;

        let saved_conversion_index = self.conversion_index;
        let saved_parameter_index = self.parameter_index;
        let saved_read_pos = self.args_read_pos;

        let mut width = -1i32;
        let mut precision = -1i32;

        if param_types[self.parameter_index] == ParamType::DynamicWidth {
            let nbytes = param_sizes[self.parameter_index];
            width = decode_signed(&self.arg_data[self.args_read_pos..], nbytes) as i32;
            self.args_read_pos += nbytes;
            self.parameter_index += 1;
        }

        if param_types[self.parameter_index] == ParamType::DynamicPrecision {
            let nbytes = param_sizes[self.parameter_index];
            precision = decode_signed(&self.arg_data[self.args_read_pos..], nbytes) as i32;
            self.args_read_pos += nbytes;
            self.parameter_index += 1;
        }

        let storage = record.site.conversion_storage;
        let spec_with_nul =
            &storage[fragment.storage_pos..fragment.storage_pos + fragment.specifier_length + 1];
        let fmt: &CStr = if fragment.conversion_type == ConversionType::LongDouble {
            // No long double exists on the producer side; the payload is a
            // double, so the length modifier has to go.
            self.spec_scratch.clear();
            for &byte in spec_with_nul {
                if byte != b'L' {
                    self.spec_scratch.push(byte);
                }
            }
            CStr::from_bytes_with_nul(&self.spec_scratch)
                .expect("conversion storage entries are NUL-terminated")
        } else {
            CStr::from_bytes_with_nul(spec_with_nul)
                .expect("conversion storage entries are NUL-terminated")
        };

        let arg_size = param_sizes[self.parameter_index];
        let written = self.written_count;
        let data = &self.arg_data[self.args_read_pos..];

        let emitted: Option<usize> = match fragment.conversion_type {
            ConversionType::SignedChar | ConversionType::Short | ConversionType::Int => {
                emit_arg(out, written, fmt, width, precision, decode_signed(data, arg_size) as i32)
            }
            ConversionType::Long | ConversionType::LongLong | ConversionType::IntMax => {
                emit_arg(out, written, fmt, width, precision, decode_signed(data, arg_size))
            }
            ConversionType::PtrDiff => {
                emit_arg(out, written, fmt, width, precision, decode_signed(data, arg_size) as isize)
            }
            ConversionType::UnsignedChar
            | ConversionType::UnsignedShort
            | ConversionType::UnsignedInt
            | ConversionType::WideChar => {
                emit_arg(out, written, fmt, width, precision, decode_unsigned(data, arg_size) as u32)
            }
            ConversionType::UnsignedLong | ConversionType::UnsignedLongLong | ConversionType::UintMax => {
                emit_arg(out, written, fmt, width, precision, decode_unsigned(data, arg_size))
            }
            ConversionType::Size => {
                emit_arg(out, written, fmt, width, precision, decode_unsigned(data, arg_size) as usize)
            }
            ConversionType::Double | ConversionType::LongDouble => {
                emit_arg(out, written, fmt, width, precision, decode_float(data, arg_size))
            }
            ConversionType::VoidPtr => {
                let addr = decode_unsigned(data, arg_size) as usize;
                emit_arg(out, written, fmt, width, precision, addr as *const libc::c_void)
            }
            ConversionType::CharPtr => {
                let len = decode_word(data);
                self.args_read_pos += WORD;
                let payload = self.arg_data[self.args_read_pos..].as_ptr() as *const c_char;
                let result = emit_arg(out, written, fmt, width, precision, payload);
                // Skip payload plus its trailing NUL.
                self.args_read_pos += len + 1;
                result
            }
            ConversionType::WideCharPtr => {
                let len = decode_word(data);
                self.args_read_pos += WORD;
                let unit = size_of::<libc::wchar_t>();
                self.wide_scratch.clear();
                let mut offset = self.args_read_pos;
                for _ in 0..len / unit {
                    let mut bytes = [0u8; size_of::<libc::wchar_t>()];
                    bytes.copy_from_slice(&self.arg_data[offset..offset + unit]);
                    self.wide_scratch.push(libc::wchar_t::from_ne_bytes(bytes));
                    offset += unit;
                }
                self.wide_scratch.push(0);
                let result = emit_arg(out, written, fmt, width, precision, self.wide_scratch.as_ptr());
                self.args_read_pos += len + 1;
                result
            }
            ConversionType::None => Some(0),
        };

        match emitted {
            Some(bytes_written) => {
                self.finish_piece(bytes_written);
                self.args_read_pos += param_sizes[self.parameter_index];
                self.conversion_index += 1;
                self.parameter_index += 1;
                self.format_index += fragment.specifier_length;
                true
            }
            None => {
                self.conversion_index = saved_conversion_index;
                self.parameter_index = saved_parameter_index;
                self.args_read_pos = saved_read_pos;
                self.is_full = true;
                false
            }
        }
    }
}

impl Default for LogAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// All-or-nothing copy. Refuses to completely fill the buffer, mirroring
/// the `len < free` headroom the formatter needs for its terminator.
fn try_copy(out: &mut [u8], written: usize, src: &[u8]) -> Option<usize> {
    let free = out.len() - written;
    if src.len() >= free {
        return None;
    }
    out[written..written + src.len()].copy_from_slice(src);
    Some(src.len())
}

fn decode_word(bytes: &[u8]) -> usize {
    let mut word = [0u8; WORD];
    word.copy_from_slice(&bytes[..WORD]);
    usize::from_ne_bytes(word)
}

fn decode_signed(bytes: &[u8], nbytes: usize) -> i64 {
    match nbytes {
        1 => bytes[0] as i8 as i64,
        2 => i16::from_ne_bytes([bytes[0], bytes[1]]) as i64,
        4 => i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64,
        8 => {
            let mut quad = [0u8; 8];
            quad.copy_from_slice(&bytes[..8]);
            i64::from_ne_bytes(quad)
        }
        _ => panic!("integer argument width {nbytes} is not one of 1, 2, 4, 8"),
    }
}

fn decode_unsigned(bytes: &[u8], nbytes: usize) -> u64 {
    match nbytes {
        1 => bytes[0] as u64,
        2 => u16::from_ne_bytes([bytes[0], bytes[1]]) as u64,
        4 => u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64,
        8 => {
            let mut quad = [0u8; 8];
            quad.copy_from_slice(&bytes[..8]);
            u64::from_ne_bytes(quad)
        }
        _ => panic!("integer argument width {nbytes} is not one of 1, 2, 4, 8"),
    }
}

fn decode_float(bytes: &[u8], nbytes: usize) -> f64 {
    match nbytes {
        4 => f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
        8 => {
            let mut quad = [0u8; 8];
            quad.copy_from_slice(&bytes[..8]);
            f64::from_ne_bytes(quad)
        }
        _ => panic!("float argument width {nbytes} is not sizeof(f32) or sizeof(f64)"),
    }
}

/// One value the platform formatter can receive as a variadic argument.
/// Integer arguments are handed over already promoted.
trait PrintfArg: Copy {
    /// # Safety
    /// `dst` must point at `cap` writable bytes and `fmt` at a valid
    /// NUL-terminated printf format consuming exactly this value (plus
    /// the optional width/precision ints).
    unsafe fn format_into(
        self,
        dst: *mut c_char,
        cap: usize,
        fmt: *const c_char,
        width: i32,
        precision: i32,
    ) -> i32;
}

macro_rules! impl_printf_arg {
    ($($t:ty),*) => {$(
        impl PrintfArg for $t {
            unsafe fn format_into(
                self,
                dst: *mut c_char,
                cap: usize,
                fmt: *const c_char,
                width: i32,
                precision: i32,
            ) -> i32 {
                match (width >= 0, precision >= 0) {
                    (false, false) => libc::snprintf(dst, cap, fmt, self),
                    (true, false) => libc::snprintf(dst, cap, fmt, width, self),
                    (false, true) => libc::snprintf(dst, cap, fmt, precision, self),
                    (true, true) => libc::snprintf(dst, cap, fmt, width, precision, self),
                }
            }
        }
    )*};
}

impl_printf_arg!(
    i32,
    u32,
    i64,
    u64,
    usize,
    isize,
    f64,
    *const libc::c_void,
    *const c_char,
    *const libc::wchar_t
);

/// Runs the formatter against the buffer's free region. `None` means the
/// attempt needed at least the remaining space and committed nothing; the
/// caller must roll back and report a full buffer.
fn emit_arg<T: PrintfArg>(
    out: &mut [u8],
    written: usize,
    fmt: &CStr,
    width: i32,
    precision: i32,
    value: T,
) -> Option<usize> {
    let free = out.len() - written;
    let dst = out[written..].as_mut_ptr() as *mut c_char;
    let needed = unsafe { value.format_into(dst, free, fmt.as_ptr(), width, precision) };
    if needed < 0 {
        // Encoding failure inside the formatter; drop the argument.
        return Some(0);
    }
    let needed = needed as usize;
    if needed >= free {
        None
    } else {
        Some(needed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format_analysis::{
        analyze_parameters, conversions_count, format_fragments, make_conversion_storage,
        parameters_count, storage_size_needed, FormatFragment, ParamType,
    };
    use crate::arguments::LogArgs;
    use crate::log_site::{Level, LogSite};
    use std::sync::Arc;

    const FMT: &str = "value %d and %.*s here, hex %#06x.";
    const NUM_PARAMS: usize = parameters_count(FMT);
    const NUM_CONVERSIONS: usize = conversions_count(FMT);
    const STORAGE_SIZE: usize = storage_size_needed(FMT);
    const PARAM_TYPES: [ParamType; NUM_PARAMS] = analyze_parameters(FMT);
    const STORAGE: [u8; STORAGE_SIZE] = make_conversion_storage(FMT);
    const FRAGMENTS: [FormatFragment; NUM_CONVERSIONS] = format_fragments(FMT, &STORAGE);

    static SITE: LogSite = LogSite {
        file: "test.rs",
        line: 7,
        format: FMT,
        conversion_storage: &STORAGE,
        fragments: &FRAGMENTS,
        param_types: &PARAM_TYPES,
    };

    fn test_record() -> (SiteRecord, Vec<u8>) {
        let args = (&42i32, &4i32, &"resumable text", &0xBEEFu32);
        let mut string_sizes = [0usize; NUM_PARAMS];
        let mut param_sizes = vec![0usize; NUM_PARAMS];
        let mut pre_precision = 0usize;
        args.fill_static_sizes(&PARAM_TYPES, &mut param_sizes);
        let total = args.packed_size(&PARAM_TYPES, &mut string_sizes, &mut pre_precision);
        let mut arg_data = vec![0u8; total];
        args.store_all(&mut arg_data, &PARAM_TYPES, &string_sizes);
        let record = SiteRecord {
            site: &SITE,
            level: Level::Info,
            param_sizes: Arc::from(param_sizes.into_boxed_slice()),
        };
        (record, arg_data)
    }

    fn assemble_with_buffers(sizes: &[usize]) -> Vec<u8> {
        let (record, arg_data) = test_record();
        let mut assembler = LogAssembler::new();
        assembler.load_log_info(&record, 1_700_000_000_123, &arg_data, 3);

        let mut out = Vec::new();
        let mut next = 0;
        let mut rounds = 0;
        while assembler.has_remaining_data() {
            rounds += 1;
            assert!(rounds < 10_000, "assembler failed to make progress");
            let size = sizes[next % sizes.len()];
            next += 1;
            let mut buf = vec![0u8; size];
            assembler.set_buffer(size);
            assembler.write(&mut buf);
            out.extend_from_slice(&buf[..assembler.written_bytes()]);
        }
        out
    }

    #[test]
    fn test_single_shot_line_content() {
        let line = String::from_utf8(assemble_with_buffers(&[8192])).unwrap();
        assert!(line.ends_with("\r\n"), "line must be CRLF-terminated: {line:?}");
        assert!(line.contains("test.rs:7 "), "missing file:line in {line:?}");
        assert!(line.contains("[INFO][3]: "), "missing severity/producer in {line:?}");
        assert!(
            line.contains("value 42 and resu here, hex 0xbeef."),
            "body mismatch in {line:?}"
        );
        // Timestamp prefix: "YYYY-MM-DD hh:mm:ss.mmm ".
        let prefix = &line[..24];
        assert_eq!(prefix.as_bytes()[4], b'-');
        assert_eq!(prefix.as_bytes()[10], b' ');
        assert_eq!(prefix.as_bytes()[19], b'.');
        assert!(prefix.ends_with("123 "));
    }

    #[test]
    fn test_resumability_across_buffer_sizes() {
        let reference = assemble_with_buffers(&[1 << 16]);
        for sizes in [
            &[27usize][..],
            &[32, 33][..],
            &[40, 28, 64][..],
            &[30, 30, 30, 128][..],
        ] {
            let pieced = assemble_with_buffers(sizes);
            assert_eq!(
                pieced, reference,
                "chopped assembly must byte-match the one-shot line (sizes {sizes:?})"
            );
        }
    }

    #[test]
    fn test_dynamic_width_and_precision() {
        const WFMT: &str = "Hello %*lf World!";
        const WN: usize = parameters_count(WFMT);
        const WC: usize = conversions_count(WFMT);
        const WS: usize = storage_size_needed(WFMT);
        const WPARAMS: [ParamType; WN] = analyze_parameters(WFMT);
        const WSTORAGE: [u8; WS] = make_conversion_storage(WFMT);
        const WFRAGS: [FormatFragment; WC] = format_fragments(WFMT, &WSTORAGE);
        static WSITE: LogSite = LogSite {
            file: "test.rs",
            line: 9,
            format: WFMT,
            conversion_storage: &WSTORAGE,
            fragments: &WFRAGS,
            param_types: &WPARAMS,
        };

        let args = (&10i32, &3.1415f64);
        let mut string_sizes = [0usize; WN];
        let mut param_sizes = vec![0usize; WN];
        let mut pre_precision = 0usize;
        args.fill_static_sizes(&WPARAMS, &mut param_sizes);
        let total = args.packed_size(&WPARAMS, &mut string_sizes, &mut pre_precision);
        let mut arg_data = vec![0u8; total];
        args.store_all(&mut arg_data, &WPARAMS, &string_sizes);

        let record = SiteRecord {
            site: &WSITE,
            level: Level::Info,
            param_sizes: Arc::from(param_sizes.into_boxed_slice()),
        };
        let mut assembler = LogAssembler::new();
        assembler.load_log_info(&record, 1_700_000_000_000, &arg_data, 1);
        let mut buf = vec![0u8; 4096];
        assembler.set_buffer(buf.len());
        assembler.write(&mut buf);
        let line = String::from_utf8(buf[..assembler.written_bytes()].to_vec()).unwrap();
        assert!(
            line.contains("Hello   3.141500 World!"),
            "width-10 float body mismatch: {line:?}"
        );
    }

    #[test]
    fn test_decode_widths() {
        assert_eq!(decode_signed(&(-7i8).to_ne_bytes(), 1), -7);
        assert_eq!(decode_signed(&(-7i16).to_ne_bytes(), 2), -7);
        assert_eq!(decode_signed(&(-7i64).to_ne_bytes(), 8), -7);
        assert_eq!(decode_unsigned(&0xFFu8.to_ne_bytes(), 1), 255);
        assert_eq!(decode_float(&2.5f32.to_ne_bytes(), 4), 2.5);
        assert_eq!(decode_float(&2.5f64.to_ne_bytes(), 8), 2.5);
    }

    #[test]
    #[should_panic(expected = "not one of 1, 2, 4, 8")]
    fn test_decode_rejects_bad_width() {
        decode_signed(&[0u8; 8], 3);
    }
}
