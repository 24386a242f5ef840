//! The `log!` macro family.
//!
//! Every call site expands to a block holding its own compile-time format
//! tables, a static descriptor and an atomic id cell. The level gate runs
//! before the argument list is touched, so arguments of suppressed calls
//! are never evaluated; passing calls bind each argument exactly once.

/// Emits one log record.
///
/// ```ignore
/// deferlog::log!(deferlog::Level::Info, "val: %d", 10);
/// ```
///
/// The format string must be a literal; it is analyzed during constant
/// evaluation and a malformed specifier (or `%n`) fails the build, as
/// does an argument count that disagrees with the format.
#[macro_export]
macro_rules! log {
    ($severity:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {{
        const FMT: &str = $fmt;
        const NUM_PARAMETERS: usize = $crate::format_analysis::parameters_count(FMT);
        const NUM_CONVERSIONS: usize = $crate::format_analysis::conversions_count(FMT);
        const STORAGE_SIZE: usize = $crate::format_analysis::storage_size_needed(FMT);
        const PARAM_TYPES: [$crate::format_analysis::ParamType; NUM_PARAMETERS] =
            $crate::format_analysis::analyze_parameters(FMT);
        const CONVERSION_STORAGE: [u8; STORAGE_SIZE] =
            $crate::format_analysis::make_conversion_storage(FMT);
        const FORMAT_FRAGMENTS: [$crate::format_analysis::FormatFragment; NUM_CONVERSIONS] =
            $crate::format_analysis::format_fragments(FMT, &CONVERSION_STORAGE);
        const _: () = ::std::assert!(
            NUM_PARAMETERS == $crate::__count_args!($($arg),*),
            "the number of format parameters differs from the number of arguments"
        );

        static SITE: $crate::log_site::LogSite = $crate::log_site::LogSite {
            file: ::std::file!(),
            line: ::std::line!(),
            format: FMT,
            conversion_storage: &CONVERSION_STORAGE,
            fragments: &FORMAT_FRAGMENTS,
            param_types: &PARAM_TYPES,
        };
        static SITE_ID: ::std::sync::atomic::AtomicI32 =
            ::std::sync::atomic::AtomicI32::new($crate::log_site::UNREGISTERED_LOG_ID);

        let severity: $crate::Level = $severity;
        if severity <= $crate::logger::Logger::log_level() {
            $crate::logger::log_record(&SITE, &SITE_ID, severity, ($( &$arg, )*));
        }
    }};
}

/// `log!` at [`Level::Error`](crate::Level::Error).
#[macro_export]
macro_rules! error {
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::log!($crate::Level::Error, $fmt $(, $arg)*)
    };
}

/// `log!` at [`Level::Warning`](crate::Level::Warning).
#[macro_export]
macro_rules! warning {
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::log!($crate::Level::Warning, $fmt $(, $arg)*)
    };
}

/// `log!` at [`Level::Info`](crate::Level::Info).
#[macro_export]
macro_rules! info {
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::log!($crate::Level::Info, $fmt $(, $arg)*)
    };
}

/// `log!` at [`Level::Debug`](crate::Level::Debug).
#[macro_export]
macro_rules! debug {
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::log!($crate::Level::Debug, $fmt $(, $arg)*)
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __count_args {
    () => { 0usize };
    ($head:expr $(, $rest:expr)*) => { 1usize + $crate::__count_args!($($rest),*) };
}
