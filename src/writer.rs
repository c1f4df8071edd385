//! Value printing.
//!
//! Two renderings share one walker: display form (strings unquoted, used by
//! `print` and the REPL echo) and write form (strings quoted, so the reader
//! can round-trip the output).

use crate::context::{CellData, Context};
use crate::value::Obj;

impl Context {
    /// Appends the rendering of `obj` to `out`. `quote_strings` selects the
    /// write form.
    pub fn write_obj(&self, obj: Obj, out: &mut String, quote_strings: bool) {
        match obj {
            Obj::Nil => out.push_str("nil"),
            Obj::Bool(true) => out.push_str("true"),
            Obj::Bool(false) => out.push_str("false"),
            Obj::Fix(i) => out.push_str(&i.to_string()),
            Obj::Cell(id) => match &self.cells[id as usize].data {
                CellData::Number(n) => out.push_str(&format_number(*n)),
                CellData::Str(s) => {
                    if quote_strings {
                        out.push('"');
                        for ch in s.chars() {
                            if ch == '"' {
                                out.push('\\');
                            }
                            out.push(ch);
                        }
                        out.push('"');
                    } else {
                        out.push_str(s);
                    }
                }
                CellData::Symbol { .. } => {
                    out.push_str(self.sym_name(obj).unwrap_or(""));
                }
                CellData::Pair { car, .. } => {
                    if *car == Obj::Cell(self.sym_frame) {
                        out.push_str("[env frame]");
                        return;
                    }
                    out.push('(');
                    let mut cur = obj;
                    loop {
                        let (car, cdr) = match self.as_pair(cur) {
                            Some(p) => p,
                            None => break,
                        };
                        self.write_obj(car, out, true);
                        cur = cdr;
                        if self.as_pair(cur).is_none() {
                            break;
                        }
                        out.push(' ');
                    }
                    if cur != Obj::Nil {
                        out.push_str(" . ");
                        self.write_obj(cur, out, true);
                    }
                    out.push(')');
                }
                other => {
                    out.push_str(&format!("[{} {}]", data_name(other), id));
                }
            },
        }
    }

    /// Display form: strings appear without quotes.
    pub fn to_display_string(&self, obj: Obj) -> String {
        let mut out = String::new();
        self.write_obj(obj, &mut out, false);
        out
    }

    /// Write form: strings are quoted so output reads back as input.
    pub fn to_write_string(&self, obj: Obj) -> String {
        let mut out = String::new();
        self.write_obj(obj, &mut out, true);
        out
    }
}

fn data_name(data: &CellData) -> &'static str {
    match data {
        CellData::Free { .. } => "free",
        CellData::Func(_) => "func",
        CellData::Macro(_) => "macro",
        CellData::Prim(_) => "prim",
        CellData::Native(_) => "cfunc",
        CellData::Ptr(_) => "ptr",
        _ => "pair",
    }
}

/// `%.7g`-style rendering: up to seven significant digits, scientific
/// notation outside [1e-4, 1e7), trailing zeros trimmed.
pub(crate) fn format_number(n: f64) -> String {
    if n == 0.0 {
        return "0".to_string();
    }
    if n.is_nan() {
        return "nan".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let exp = n.abs().log10().floor() as i32;
    if !(-4..7).contains(&exp) {
        let s = format!("{:.6e}", n);
        let (mantissa, exponent) = match s.split_once('e') {
            Some(parts) => parts,
            None => (s.as_str(), "0"),
        };
        format!("{}e{}", trim_zeros(mantissa), exponent)
    } else {
        let decimals = (6 - exp).max(0) as usize;
        trim_zeros(&format!("{:.*}", decimals, n)).to_string()
    }
}

fn trim_zeros(s: &str) -> &str {
    if !s.contains('.') {
        return s;
    }
    s.trim_end_matches('0').trim_end_matches('.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Obj;
    use crate::Context;

    #[test]
    fn number_formatting() {
        assert_eq!(format_number(3.14159), "3.14159");
        assert_eq!(format_number(0.5), "0.5");
        assert_eq!(format_number(-2.25), "-2.25");
        assert_eq!(format_number(100.0), "100");
        assert_eq!(format_number(1e10), "1e10");
        assert_eq!(format_number(0.30000000000000004), "0.3");
    }

    #[test]
    fn lists_and_dotted_pairs() {
        let mut ctx = Context::open(256 * 1024).expect("arena");
        let tail = ctx.cons(Obj::Fix(2), Obj::Fix(3)).unwrap();
        let lst = ctx.cons(Obj::Fix(1), tail).unwrap();
        assert_eq!(ctx.to_display_string(lst), "(1 2 . 3)");

        let a = ctx.symbol("a").unwrap();
        let inner = ctx.cons(a, Obj::Nil).unwrap();
        let outer = ctx.cons(inner, Obj::Nil).unwrap();
        assert_eq!(ctx.to_display_string(outer), "((a))");
    }

    #[test]
    fn strings_quote_only_in_write_form() {
        let mut ctx = Context::open(256 * 1024).expect("arena");
        let s = ctx.string("say \"hi\"").unwrap();
        assert_eq!(ctx.to_display_string(s), "say \"hi\"");
        assert_eq!(ctx.to_write_string(s), "\"say \\\"hi\\\"\"");
    }
}
