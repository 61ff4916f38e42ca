//! Raven Core: the shared data model of the Raven language
//!
//! Everything the compiler and the VM both need to agree on lives here:
//!
//! - `value`: the Value representation (tagged union by default, NaN-boxed
//!   behind the `nanbox` feature; identical method surface either way)
//! - `object`: heap object variants (strings, functions, closures, classes,
//!   lists, dicts, options) and the handle type that names them
//! - `chunk`: bytecode chunks (code bytes, line map, constant pool) and the
//!   opcode catalog
//! - `table`: the open-addressed hash table used for globals, interning,
//!   fields, methods, and dict storage
//! - `heap`: the object arena, string interning, and the mark-sweep
//!   collector core
//! - `debug`: the chunk disassembler

pub mod chunk;
pub mod debug;
pub mod heap;
pub mod object;
pub mod table;

#[cfg(not(feature = "nanbox"))]
pub mod value;

#[cfg(feature = "nanbox")]
#[path = "nanbox.rs"]
pub mod value;

pub use chunk::{Chunk, OpCode};
pub use heap::Heap;
pub use object::{
    Handle, NativeError, NativeFn, NativeHost, Obj, ObjBoundMethod, ObjBoundNative, ObjClass,
    ObjClosure, ObjFunction, ObjInstance, ObjNative, ObjString, ObjUpvalue, UpvalueState,
};
pub use table::Table;
pub use value::Value;

/// Render a number the way the language prints it: C `printf("%g")`
/// semantics with six significant digits. Integers up to six digits come
/// out bare (`42`), larger magnitudes switch to scientific notation with a
/// signed two-digit exponent (`3.6288e+06`).
pub fn format_number(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value < 0.0 { "-inf" } else { "inf" }.to_string();
    }
    if value == 0.0 {
        return if value.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    // %g with precision 6: round to 6 significant digits first, then pick
    // fixed or scientific based on the decimal exponent.
    let sci = format!("{:.5e}", value);
    let (mantissa, exp) = sci
        .split_once('e')
        .expect("{:e} always contains an exponent");
    let exp: i32 = exp.parse().expect("{:e} exponent is an integer");

    if exp < -4 || exp >= 6 {
        let mantissa = mantissa.trim_end_matches('0').trim_end_matches('.');
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", mantissa, sign, exp.abs())
    } else {
        let precision = (5 - exp).max(0) as usize;
        let fixed = format!("{:.*}", precision, value);
        if fixed.contains('.') {
            fixed
                .trim_end_matches('0')
                .trim_end_matches('.')
                .to_string()
        } else {
            fixed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::format_number;

    #[test]
    fn test_format_small_integers_bare() {
        assert_eq!(format_number(0.0), "0");
        assert_eq!(format_number(4.0), "4");
        assert_eq!(format_number(42.0), "42");
        assert_eq!(format_number(100.0), "100");
        assert_eq!(format_number(-7.0), "-7");
        assert_eq!(format_number(99999.0), "99999");
    }

    #[test]
    fn test_format_switches_to_scientific_at_six_digits() {
        assert_eq!(format_number(3628800.0), "3.6288e+06");
        assert_eq!(format_number(1000000.0), "1e+06");
        assert_eq!(format_number(-2500000.0), "-2.5e+06");
    }

    #[test]
    fn test_format_fractions() {
        assert_eq!(format_number(0.5), "0.5");
        assert_eq!(format_number(1.25), "1.25");
        assert_eq!(format_number(0.00001), "1e-05");
        assert_eq!(format_number(0.0001), "0.0001");
    }

    #[test]
    fn test_format_non_finite() {
        assert_eq!(format_number(f64::NAN), "nan");
        assert_eq!(format_number(f64::INFINITY), "inf");
        assert_eq!(format_number(f64::NEG_INFINITY), "-inf");
    }
}
