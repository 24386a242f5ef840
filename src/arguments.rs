//! Producer-side argument packing.
//!
//! [`LogArgument`] gives every loggable type three things: the scalar
//! width recorded in a site's parameter-size table, the number of bytes
//! the value occupies in a packed record, and the packed materialization
//! itself. [`LogArgs`] fans those out over the whole argument tuple of a
//! call site.
//!
//! Wire layout per argument:
//! - scalars and pointers: a raw machine-endian bit copy,
//! - strings: a machine-word byte length, the (possibly truncated)
//!   payload bytes, then one NUL byte so the consumer can hand the
//!   payload straight to a C formatter.

use std::mem::size_of;

use crate::format_analysis::ParamType;

/// Upper bound on the arguments a single log call may carry. Matches the
/// largest tuple arity [`LogArgs`] is implemented for.
pub const MAX_LOG_ARGS: usize = 12;

const WORD: usize = size_of::<usize>();

/// One value that can be packed into a dynamic record.
pub trait LogArgument {
    /// Width recorded in the site's parameter-size table: the scalar's
    /// natural width, pointer width for strings demoted to pointers, and
    /// 0 for real string payloads (their length travels in-record).
    fn static_size(&self, param: ParamType) -> usize;

    /// Packed byte count for this call. String types record their
    /// truncated payload length into `string_size`; a value sitting in a
    /// `DynamicPrecision` slot captures itself into `pre_precision` for
    /// the string that follows it.
    fn packed_size(
        &self,
        param: ParamType,
        string_size: &mut usize,
        pre_precision: &mut usize,
    ) -> usize;

    /// Writes the packed form at the start of `dst`, returning the bytes
    /// written. `string_size` must be the value produced by
    /// [`LogArgument::packed_size`] for the same call.
    fn store(&self, dst: &mut [u8], param: ParamType, string_size: usize) -> usize;
}

macro_rules! impl_int_argument {
    ($($t:ty),*) => {$(
        impl LogArgument for $t {
            fn static_size(&self, _param: ParamType) -> usize {
                size_of::<$t>()
            }

            fn packed_size(
                &self,
                param: ParamType,
                _string_size: &mut usize,
                pre_precision: &mut usize,
            ) -> usize {
                if param == ParamType::DynamicPrecision {
                    *pre_precision = *self as usize;
                }
                size_of::<$t>()
            }

            fn store(&self, dst: &mut [u8], _param: ParamType, _string_size: usize) -> usize {
                let bytes = self.to_ne_bytes();
                dst[..bytes.len()].copy_from_slice(&bytes);
                bytes.len()
            }
        }
    )*};
}

impl_int_argument!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

macro_rules! impl_float_argument {
    ($($t:ty),*) => {$(
        impl LogArgument for $t {
            fn static_size(&self, _param: ParamType) -> usize {
                size_of::<$t>()
            }

            fn packed_size(
                &self,
                param: ParamType,
                _string_size: &mut usize,
                pre_precision: &mut usize,
            ) -> usize {
                // A float has no usable value as a precision.
                if param == ParamType::DynamicPrecision {
                    *pre_precision = 0;
                }
                size_of::<$t>()
            }

            fn store(&self, dst: &mut [u8], _param: ParamType, _string_size: usize) -> usize {
                let bytes = self.to_ne_bytes();
                dst[..bytes.len()].copy_from_slice(&bytes);
                bytes.len()
            }
        }
    )*};
}

impl_float_argument!(f32, f64);

/// `%c` consumes a promoted int in C, so a char packs as four bytes.
impl LogArgument for char {
    fn static_size(&self, _param: ParamType) -> usize {
        size_of::<u32>()
    }

    fn packed_size(
        &self,
        param: ParamType,
        _string_size: &mut usize,
        pre_precision: &mut usize,
    ) -> usize {
        if param == ParamType::DynamicPrecision {
            *pre_precision = *self as usize;
        }
        size_of::<u32>()
    }

    fn store(&self, dst: &mut [u8], _param: ParamType, _string_size: usize) -> usize {
        let bytes = (*self as u32).to_ne_bytes();
        dst[..4].copy_from_slice(&bytes);
        4
    }
}

impl<T> LogArgument for *const T {
    fn static_size(&self, _param: ParamType) -> usize {
        WORD
    }

    fn packed_size(
        &self,
        _param: ParamType,
        _string_size: &mut usize,
        _pre_precision: &mut usize,
    ) -> usize {
        WORD
    }

    fn store(&self, dst: &mut [u8], _param: ParamType, _string_size: usize) -> usize {
        let addr = *self as usize;
        dst[..WORD].copy_from_slice(&addr.to_ne_bytes());
        WORD
    }
}

impl<T> LogArgument for *mut T {
    fn static_size(&self, _param: ParamType) -> usize {
        WORD
    }

    fn packed_size(
        &self,
        _param: ParamType,
        _string_size: &mut usize,
        _pre_precision: &mut usize,
    ) -> usize {
        WORD
    }

    fn store(&self, dst: &mut [u8], _param: ParamType, _string_size: usize) -> usize {
        let addr = *self as usize;
        dst[..WORD].copy_from_slice(&addr.to_ne_bytes());
        WORD
    }
}

/// Truncated payload length for a string of `len` code units.
fn truncated_len(len: usize, param: ParamType, pre_precision: usize) -> usize {
    match param {
        ParamType::String(max) if len > max => max,
        ParamType::StringWithDynamicPrecision if len > pre_precision => pre_precision,
        _ => len,
    }
}

impl LogArgument for str {
    fn static_size(&self, param: ParamType) -> usize {
        // A string handed to a non-string slot is treated as a pointer.
        if param.is_string_kind() {
            0
        } else {
            WORD
        }
    }

    fn packed_size(
        &self,
        param: ParamType,
        string_size: &mut usize,
        pre_precision: &mut usize,
    ) -> usize {
        if !param.is_string_kind() {
            return WORD;
        }
        let len = truncated_len(self.len(), param, *pre_precision);
        *string_size = len;
        WORD + len + 1
    }

    fn store(&self, dst: &mut [u8], param: ParamType, string_size: usize) -> usize {
        if !param.is_string_kind() {
            let addr = self.as_ptr() as usize;
            dst[..WORD].copy_from_slice(&addr.to_ne_bytes());
            return WORD;
        }
        dst[..WORD].copy_from_slice(&string_size.to_ne_bytes());
        dst[WORD..WORD + string_size].copy_from_slice(&self.as_bytes()[..string_size]);
        dst[WORD + string_size] = 0;
        WORD + string_size + 1
    }
}

impl LogArgument for String {
    fn static_size(&self, param: ParamType) -> usize {
        self.as_str().static_size(param)
    }

    fn packed_size(
        &self,
        param: ParamType,
        string_size: &mut usize,
        pre_precision: &mut usize,
    ) -> usize {
        self.as_str().packed_size(param, string_size, pre_precision)
    }

    fn store(&self, dst: &mut [u8], param: ParamType, string_size: usize) -> usize {
        self.as_str().store(dst, param, string_size)
    }
}

/// A wide (`wchar_t`) string for `%ls`. Payload length travels in bytes,
/// truncation by precision happens in code units.
#[derive(Clone, Copy)]
pub struct WideStr<'a>(pub &'a [libc::wchar_t]);

impl LogArgument for WideStr<'_> {
    fn static_size(&self, param: ParamType) -> usize {
        if param.is_string_kind() {
            0
        } else {
            WORD
        }
    }

    fn packed_size(
        &self,
        param: ParamType,
        string_size: &mut usize,
        pre_precision: &mut usize,
    ) -> usize {
        if !param.is_string_kind() {
            return WORD;
        }
        let units = truncated_len(self.0.len(), param, *pre_precision);
        *string_size = units * size_of::<libc::wchar_t>();
        WORD + *string_size + 1
    }

    fn store(&self, dst: &mut [u8], param: ParamType, string_size: usize) -> usize {
        if !param.is_string_kind() {
            let addr = self.0.as_ptr() as usize;
            dst[..WORD].copy_from_slice(&addr.to_ne_bytes());
            return WORD;
        }
        dst[..WORD].copy_from_slice(&string_size.to_ne_bytes());
        let mut cursor = WORD;
        for unit in &self.0[..string_size / size_of::<libc::wchar_t>()] {
            let bytes = unit.to_ne_bytes();
            dst[cursor..cursor + bytes.len()].copy_from_slice(&bytes);
            cursor += bytes.len();
        }
        dst[cursor] = 0;
        cursor + 1
    }
}

impl<T: LogArgument + ?Sized> LogArgument for &T {
    fn static_size(&self, param: ParamType) -> usize {
        (**self).static_size(param)
    }

    fn packed_size(
        &self,
        param: ParamType,
        string_size: &mut usize,
        pre_precision: &mut usize,
    ) -> usize {
        (**self).packed_size(param, string_size, pre_precision)
    }

    fn store(&self, dst: &mut [u8], param: ParamType, string_size: usize) -> usize {
        (**self).store(dst, param, string_size)
    }
}

/// The full argument list of one log call, sized and stored positionally
/// against the site's parameter-type vector.
pub trait LogArgs {
    /// Fills the per-parameter scalar widths recorded at registration.
    fn fill_static_sizes(&self, params: &[ParamType], out: &mut [usize]);

    /// Total packed payload size; also fills `string_sizes` and captures
    /// dynamic precision values in argument order.
    fn packed_size(
        &self,
        params: &[ParamType],
        string_sizes: &mut [usize],
        pre_precision: &mut usize,
    ) -> usize;

    /// Packs every argument at the start of `dst`; returns bytes written.
    fn store_all(&self, dst: &mut [u8], params: &[ParamType], string_sizes: &[usize]) -> usize;
}

macro_rules! impl_log_args {
    ($( ($($idx:tt $name:ident),*) );* $(;)?) => {$(
        impl<$($name: LogArgument),*> LogArgs for ($($name,)*) {
            fn fill_static_sizes(&self, params: &[ParamType], out: &mut [usize]) {
                $( out[$idx] = self.$idx.static_size(params[$idx]); )*
                let _ = (params, out);
            }

            fn packed_size(
                &self,
                params: &[ParamType],
                string_sizes: &mut [usize],
                pre_precision: &mut usize,
            ) -> usize {
                let mut total = 0;
                $(
                    total += self.$idx.packed_size(
                        params[$idx],
                        &mut string_sizes[$idx],
                        pre_precision,
                    );
                )*
                let _ = (params, string_sizes, pre_precision);
                total
            }

            fn store_all(
                &self,
                dst: &mut [u8],
                params: &[ParamType],
                string_sizes: &[usize],
            ) -> usize {
                let mut cursor = 0;
                $(
                    cursor += self.$idx.store(
                        &mut dst[cursor..],
                        params[$idx],
                        string_sizes[$idx],
                    );
                )*
                let _ = (dst, params, string_sizes);
                cursor
            }
        }
    )*};
}

impl_log_args! {
    ();
    (0 A0);
    (0 A0, 1 A1);
    (0 A0, 1 A1, 2 A2);
    (0 A0, 1 A1, 2 A2, 3 A3);
    (0 A0, 1 A1, 2 A2, 3 A3, 4 A4);
    (0 A0, 1 A1, 2 A2, 3 A3, 4 A4, 5 A5);
    (0 A0, 1 A1, 2 A2, 3 A3, 4 A4, 5 A5, 6 A6);
    (0 A0, 1 A1, 2 A2, 3 A3, 4 A4, 5 A5, 6 A6, 7 A7);
    (0 A0, 1 A1, 2 A2, 3 A3, 4 A4, 5 A5, 6 A6, 7 A7, 8 A8);
    (0 A0, 1 A1, 2 A2, 3 A3, 4 A4, 5 A5, 6 A6, 7 A7, 8 A8, 9 A9);
    (0 A0, 1 A1, 2 A2, 3 A3, 4 A4, 5 A5, 6 A6, 7 A7, 8 A8, 9 A9, 10 A10);
    (0 A0, 1 A1, 2 A2, 3 A3, 4 A4, 5 A5, 6 A6, 7 A7, 8 A8, 9 A9, 10 A10, 11 A11);
}
