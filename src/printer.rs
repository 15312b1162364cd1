///! Literal-form rendering of RJoy values.
///!
///! `put` and autoput use the quoting form: strings in double quotes with
///! escapes, chars with a leading ', lists in brackets, sets in braces.
///! Floats always carry a mark that distinguishes them from integers
///! (2.0 rather than 2); NaN and infinities render as nan / inf / -inf.

use crate::symbol::SymbolTable;
use crate::value::Value;

/// Print a value to a string in literal (re-readable) form.
pub fn print_val(val: &Value, syms: &SymbolTable) -> String {
    let mut buf = String::new();
    write_val(val, syms, &mut buf, true);
    buf
}

/// Display form: strings raw, chars bare.
#[allow(dead_code)]
pub fn display_val(val: &Value, syms: &SymbolTable) -> String {
    let mut buf = String::new();
    write_val(val, syms, &mut buf, false);
    buf
}

fn write_val(val: &Value, syms: &SymbolTable, buf: &mut String, quoting: bool) {
    match val {
        Value::Bool(b) => buf.push_str(if *b { "true" } else { "false" }),
        Value::Int(i) => buf.push_str(&i.to_string()),
        Value::Float(f) => buf.push_str(&format_float(*f)),
        Value::Char(c) => {
            if quoting {
                buf.push('\'');
                match c {
                    '\n' => buf.push_str("\\n"),
                    '\t' => buf.push_str("\\t"),
                    '\r' => buf.push_str("\\r"),
                    '\\' => buf.push_str("\\\\"),
                    '\'' => buf.push_str("\\'"),
                    c if (*c as u32) < 32 => buf.push_str(&format!("\\{}", *c as u32)),
                    c => buf.push(*c),
                }
            } else {
                buf.push(*c);
            }
        }
        Value::Str(s) => {
            if quoting {
                buf.push('"');
                for c in s.chars() {
                    match c {
                        '"' => buf.push_str("\\\""),
                        '\\' => buf.push_str("\\\\"),
                        '\n' => buf.push_str("\\n"),
                        '\t' => buf.push_str("\\t"),
                        '\r' => buf.push_str("\\r"),
                        _ => buf.push(c),
                    }
                }
                buf.push('"');
            } else {
                buf.push_str(s);
            }
        }
        Value::Set(bits) => {
            buf.push('{');
            let mut first = true;
            for i in 0..64 {
                if bits & (1u64 << i) != 0 {
                    if !first {
                        buf.push(' ');
                    }
                    first = false;
                    buf.push_str(&i.to_string());
                }
            }
            buf.push('}');
        }
        Value::List(items) => {
            buf.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    buf.push(' ');
                }
                write_val(item, syms, buf, quoting);
            }
            buf.push(']');
        }
        Value::Symbol(sym) => buf.push_str(syms.name(*sym)),
        Value::File(handle) => buf.push_str(&handle.to_string()),
    }
}

/// Stable float rendering: a forced decimal point on whole numbers so a
/// float never reads back as an integer.
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        "nan".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "inf" } else { "-inf" }.to_string()
    } else if f == f.trunc() && f.abs() < 1e15 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::FileHandle;

    #[test]
    fn literal_forms() {
        let syms = SymbolTable::new();
        assert_eq!(print_val(&Value::Int(5), &syms), "5");
        assert_eq!(print_val(&Value::Bool(true), &syms), "true");
        assert_eq!(print_val(&Value::Char('A'), &syms), "'A");
        assert_eq!(print_val(&Value::Char('\n'), &syms), "'\\n");
        assert_eq!(print_val(&Value::string("a\"b"), &syms), "\"a\\\"b\"");
        assert_eq!(
            print_val(
                &Value::list(vec![Value::Int(1), Value::list(vec![Value::Int(2)])]),
                &syms
            ),
            "[1 [2]]"
        );
        assert_eq!(
            print_val(&Value::Set((1 << 3) | (1 << 5)), &syms),
            "{3 5}"
        );
        assert_eq!(print_val(&Value::File(FileHandle::Stdin), &syms), "stdin");
    }

    #[test]
    fn float_rendering_is_unambiguous() {
        assert_eq!(format_float(2.0), "2.0");
        assert_eq!(format_float(-3.0), "-3.0");
        assert_eq!(format_float(2.5), "2.5");
        assert_eq!(format_float(f64::NAN), "nan");
        assert_eq!(format_float(f64::INFINITY), "inf");
        assert_eq!(format_float(f64::NEG_INFINITY), "-inf");
    }

    #[test]
    fn display_form_is_raw() {
        let syms = SymbolTable::new();
        assert_eq!(display_val(&Value::string("hi"), &syms), "hi");
        assert_eq!(display_val(&Value::Char('x'), &syms), "x");
    }
}
