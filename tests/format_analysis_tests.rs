use deferlog::format_analysis::{
    analyze_parameters, conversion_type, conversions_count, format_fragments,
    make_conversion_storage, parameters_count, storage_size_needed, ConversionType,
    FormatFragment, ParamType,
};

/// Checks that every specifier's bytes land in the conversion storage
/// exactly as they appear in the source format, NUL-terminated.
macro_rules! check_specifier_round_trip {
    ($fmt:literal) => {{
        const FMT: &str = $fmt;
        const STORAGE_SIZE: usize = storage_size_needed(FMT);
        const NUM_CONVERSIONS: usize = conversions_count(FMT);
        const STORAGE: [u8; STORAGE_SIZE] = make_conversion_storage(FMT);
        const FRAGMENTS: [FormatFragment; NUM_CONVERSIONS] = format_fragments(FMT, &STORAGE);

        for fragment in FRAGMENTS.iter() {
            let from_format = &FMT.as_bytes()
                [fragment.format_pos..fragment.format_pos + fragment.specifier_length];
            let from_storage =
                &STORAGE[fragment.storage_pos..fragment.storage_pos + fragment.specifier_length];
            assert_eq!(
                from_format, from_storage,
                "specifier bytes must round-trip through storage for {:?}",
                FMT
            );
            assert_eq!(
                STORAGE[fragment.storage_pos + fragment.specifier_length],
                0,
                "each stored specifier must be NUL-terminated for {:?}",
                FMT
            );
            assert_eq!(FMT.as_bytes()[fragment.format_pos], b'%');
        }
    }};
}

#[test]
fn test_parameter_count_matches_slot_expansion() {
    // (format, value slots, dynamic width slots, dynamic precision slots)
    let cases: &[(&str, usize)] = &[
        ("plain text, no specifiers", 0),
        ("escaped 100%% only", 0),
        ("%d", 1),
        ("%u %i %x", 3),
        ("%*d", 2),
        ("%.*f", 2),
        ("%*.*s", 3),
        ("%-08.3e", 1),
        ("%s=%p (%c)", 3),
        ("mixed %*d then %.*s then %llu", 2 + 2 + 1),
    ];
    for &(fmt, expected) in cases {
        assert_eq!(
            parameters_count(fmt),
            expected,
            "wrong parameter count for {fmt:?}"
        );
    }
}

#[test]
fn test_parameter_types_by_position() {
    const FMT: &str = "%*.*s %d %.7s %s %p";
    const N: usize = parameters_count(FMT);
    const TYPES: [ParamType; N] = analyze_parameters(FMT);
    assert_eq!(
        TYPES,
        [
            ParamType::DynamicWidth,
            ParamType::DynamicPrecision,
            ParamType::StringWithDynamicPrecision,
            ParamType::NonString,
            ParamType::String(7),
            ParamType::StringWithNoPrecision,
            ParamType::NonString,
        ]
    );
}

#[test]
fn test_out_of_range_position_is_invalid() {
    use deferlog::format_analysis::param_info;
    assert_eq!(param_info("%d %s", 2), ParamType::Invalid);
    assert_eq!(param_info("%d %s", 999), ParamType::Invalid);
    assert_eq!(param_info("no params", 0), ParamType::Invalid);
}

#[test]
fn test_specifier_round_trips() {
    check_specifier_round_trip!("%d");
    check_specifier_round_trip!("leading %08.3f trailing");
    check_specifier_round_trip!("%-+ #042.17Lg then %.*s then %hhx");
    check_specifier_round_trip!("a%%b%zuc%%d%tde");
    check_specifier_round_trip!("%*.*s%p%lc%ls");
}

#[test]
fn test_length_modifier_resolution() {
    assert_eq!(conversion_type("%hhi", 0), ConversionType::SignedChar);
    assert_eq!(conversion_type("%hi", 0), ConversionType::Short);
    assert_eq!(conversion_type("%li", 0), ConversionType::Long);
    assert_eq!(conversion_type("%lli", 0), ConversionType::LongLong);
    assert_eq!(conversion_type("%jx", 0), ConversionType::UintMax);
    assert_eq!(conversion_type("%zx", 0), ConversionType::Size);
    assert_eq!(conversion_type("%to", 0), ConversionType::PtrDiff);
    assert_eq!(conversion_type("%LA", 0), ConversionType::LongDouble);
    assert_eq!(conversion_type("%lE", 0), ConversionType::Double);
    assert_eq!(conversion_type("%ls", 0), ConversionType::WideCharPtr);
    assert_eq!(conversion_type("%lc", 0), ConversionType::WideChar);
}

#[test]
fn test_storage_size_accounts_for_separators() {
    // Two specifiers of 2 and 5 bytes plus one NUL each.
    assert_eq!(storage_size_needed("%d and %.3lf"), 2 + 1 + 5 + 1);
    assert_eq!(storage_size_needed("no conversions"), 0);
    assert_eq!(storage_size_needed("escaped %% only"), 0);
}

#[test]
fn test_fragment_positions_skip_escapes() {
    const FMT: &str = "%%%d%%";
    const N: usize = conversions_count(FMT);
    const STORAGE_SIZE: usize = storage_size_needed(FMT);
    const STORAGE: [u8; STORAGE_SIZE] = make_conversion_storage(FMT);
    const FRAGMENTS: [FormatFragment; N] = format_fragments(FMT, &STORAGE);
    assert_eq!(N, 1);
    assert_eq!(FRAGMENTS[0].format_pos, 2);
    assert_eq!(FRAGMENTS[0].specifier_length, 2);
    assert_eq!(FRAGMENTS[0].conversion_type, ConversionType::Int);
}
