//! printf-style expansion of command templates.
//!
//! Expansion never fails outright. A verb that cannot be satisfied is
//! rendered in place as a marker starting with `%!`, and the caller decides
//! what a marker means:
//!
//! ```text
//! %!d(str=hello)     wrong argument type for the verb
//! %!d(MISSING)       fewer arguments than verbs
//! %!z(i64=5)         unknown verb
//! %!(NOVERB)         template ends in a lone '%'
//! %!(EXTRA i64=1)    more arguments than verbs
//! %!(BADWIDTH)       width above one million, or a `*` width that is no integer
//! %!(BADPREC)        the same for precision
//! ```

use std::fmt;
use std::iter::Peekable;
use std::str::Chars;

/// Prefix shared by every expansion failure marker.
pub(crate) const BAD_VERB: &str = "%!";

/// A typed value substituted into a command template.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Int(i64),
    Uint(u64),
    Float(f64),
    Str(String),
    Bool(bool),
    Char(char),
}

impl Arg {
    fn type_name(&self) -> &'static str {
        match self {
            Arg::Int(_) => "i64",
            Arg::Uint(_) => "u64",
            Arg::Float(_) => "f64",
            Arg::Str(_) => "str",
            Arg::Bool(_) => "bool",
            Arg::Char(_) => "char",
        }
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Int(v) => write!(f, "{v}"),
            Arg::Uint(v) => write!(f, "{v}"),
            Arg::Float(v) => write!(f, "{v}"),
            Arg::Str(v) => f.write_str(v),
            Arg::Bool(v) => write!(f, "{v}"),
            Arg::Char(v) => write!(f, "{v}"),
        }
    }
}

macro_rules! arg_from {
    ($variant:ident($target:ty): $($source:ty),+) => {
        $(
            impl From<$source> for Arg {
                fn from(value: $source) -> Self {
                    Arg::$variant(<$target>::from(value))
                }
            }
        )+
    };
}

arg_from!(Int(i64): i8, i16, i32, i64);
arg_from!(Uint(u64): u8, u16, u32, u64);
arg_from!(Float(f64): f32, f64);

impl From<isize> for Arg {
    fn from(value: isize) -> Self {
        Arg::Int(value as i64)
    }
}

impl From<usize> for Arg {
    fn from(value: usize) -> Self {
        Arg::Uint(value as u64)
    }
}

impl From<bool> for Arg {
    fn from(value: bool) -> Self {
        Arg::Bool(value)
    }
}

impl From<char> for Arg {
    fn from(value: char) -> Self {
        Arg::Char(value)
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Arg::Str(value.to_string())
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Arg::Str(value)
    }
}

impl From<&String> for Arg {
    fn from(value: &String) -> Self {
        Arg::Str(value.clone())
    }
}

/// Expand `template` with `args`.
///
/// The result contains [`BAD_VERB`] iff some verb or argument could not be
/// paired up correctly.
pub fn expand(template: &str, args: &[Arg]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut consumed = 0;
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }

        let spec = Spec::parse(&mut chars, args, &mut consumed, &mut out);
        let Some(verb) = chars.next() else {
            out.push_str("%!(NOVERB)");
            break;
        };
        if verb == '%' {
            out.push('%');
            continue;
        }

        match args.get(consumed) {
            Some(arg) => {
                consumed += 1;
                match spec.render(verb, arg) {
                    Some(rendered) => spec.pad(rendered, &mut out),
                    None => {
                        out.push_str(&format!("%!{verb}({}={arg})", arg.type_name()));
                    }
                }
            }
            None => out.push_str(&format!("%!{verb}(MISSING)")),
        }
    }

    if let Some(extra) = args.get(consumed..).filter(|rest| !rest.is_empty()) {
        let listed: Vec<String> = extra
            .iter()
            .map(|arg| format!("{}={arg}", arg.type_name()))
            .collect();
        out.push_str(&format!("%!(EXTRA {})", listed.join(", ")));
    }

    out
}

/// Largest width or precision a template may ask for.
const MAX_NUMBER: usize = 1_000_000;

/// Largest precision handed to `format!`. No f64 has a nonzero decimal
/// digit past this point, so anything beyond it is zero fill.
const EXACT_DIGITS: usize = 1100;

/// Decimal exponent from which shortest float output switches to `e` form.
const SHORTEST_EXP_LIMIT: i64 = 6;

/// Flags, width and precision between '%' and the verb.
#[derive(Debug, Default)]
struct Spec {
    minus: bool,
    plus: bool,
    space: bool,
    zero: bool,
    sharp: bool,
    width: Option<usize>,
    precision: Option<usize>,
}

/// A rendered verb before padding: sign/radix prefix and the rest.
struct Rendered {
    prefix: String,
    body: String,
    /// Whether a `0` flag pads between prefix and body.
    zero_fill: bool,
}

impl Rendered {
    fn text(body: String) -> Self {
        Self {
            prefix: String::new(),
            body,
            zero_fill: false,
        }
    }
}

/// A width or precision written out in digits.
enum Number {
    Absent,
    Value(usize),
    TooLarge,
}

impl Spec {
    /// Parse flags, width and precision. `*` takes its value from the next
    /// argument; unusable values leave a marker in `out`.
    fn parse(
        chars: &mut Peekable<Chars<'_>>,
        args: &[Arg],
        consumed: &mut usize,
        out: &mut String,
    ) -> Self {
        let mut spec = Spec::default();
        while let Some(&c) = chars.peek() {
            match c {
                '-' => spec.minus = true,
                '+' => spec.plus = true,
                ' ' => spec.space = true,
                '0' => spec.zero = true,
                '#' => spec.sharp = true,
                _ => break,
            }
            chars.next();
        }

        if chars.next_if_eq(&'*').is_some() {
            match star(args, consumed) {
                Some(width) => {
                    if width < 0 {
                        spec.minus = true;
                    }
                    spec.width = usize::try_from(width.unsigned_abs()).ok();
                }
                None => out.push_str("%!(BADWIDTH)"),
            }
        } else {
            match digits(chars) {
                Number::Absent => {}
                Number::Value(width) => spec.width = Some(width),
                Number::TooLarge => out.push_str("%!(BADWIDTH)"),
            }
        }

        if chars.next_if_eq(&'.').is_some() {
            if chars.next_if_eq(&'*').is_some() {
                match star(args, consumed).and_then(|p| usize::try_from(p).ok()) {
                    Some(precision) => spec.precision = Some(precision),
                    None => out.push_str("%!(BADPREC)"),
                }
            } else {
                match digits(chars) {
                    Number::Absent => spec.precision = Some(0),
                    Number::Value(precision) => spec.precision = Some(precision),
                    Number::TooLarge => out.push_str("%!(BADPREC)"),
                }
            }
        }
        spec
    }

    /// Render `arg` for `verb`, or `None` if the pairing is invalid.
    fn render(&self, verb: char, arg: &Arg) -> Option<Rendered> {
        match (verb, arg) {
            ('d' | 'x' | 'X' | 'o' | 'b' | 'v', Arg::Int(v)) => {
                Some(self.integer(*v < 0, v.unsigned_abs(), verb))
            }
            ('d' | 'x' | 'X' | 'o' | 'b' | 'v', Arg::Uint(v)) => Some(self.integer(false, *v, verb)),
            ('d', Arg::Char(c)) => Some(self.integer(false, u64::from(u32::from(*c)), verb)),
            ('c', Arg::Char(c)) => Some(Rendered::text(c.to_string())),
            ('c', Arg::Int(v)) => Some(Rendered::text(code_point(u64::try_from(*v).ok()).to_string())),
            ('c', Arg::Uint(v)) => Some(Rendered::text(code_point(Some(*v)).to_string())),
            ('s' | 'v', Arg::Str(s)) => Some(Rendered::text(match self.precision {
                Some(p) => s.chars().take(p).collect(),
                None => s.clone(),
            })),
            ('x', Arg::Str(s)) => Some(Rendered::text(s.bytes().map(|b| format!("{b:02x}")).collect())),
            ('X', Arg::Str(s)) => Some(Rendered::text(s.bytes().map(|b| format!("{b:02X}")).collect())),
            ('q', Arg::Str(s)) => Some(Rendered::text(quote(s.chars(), '"'))),
            ('q', Arg::Char(c)) => Some(Rendered::text(quote(std::iter::once(*c), '\''))),
            ('q', Arg::Int(v)) => Some(Rendered::text(quote(
                std::iter::once(code_point(u64::try_from(*v).ok())),
                '\'',
            ))),
            ('q', Arg::Uint(v)) => Some(Rendered::text(quote(
                std::iter::once(code_point(Some(*v))),
                '\'',
            ))),
            ('t' | 'v', Arg::Bool(b)) => Some(Rendered::text(b.to_string())),
            ('v', Arg::Char(c)) => Some(Rendered::text(c.to_string())),
            ('f' | 'F' | 'e' | 'E' | 'g' | 'G' | 'v', Arg::Float(v)) => Some(self.float(verb, *v)),
            _ => None,
        }
    }

    fn integer(&self, negative: bool, magnitude: u64, verb: char) -> Rendered {
        // An explicit zero precision prints nothing at all for zero.
        if self.precision == Some(0) && magnitude == 0 {
            return Rendered::text(String::new());
        }

        let mut body = match verb {
            'x' => format!("{magnitude:x}"),
            'X' => format!("{magnitude:X}"),
            'o' => format!("{magnitude:o}"),
            'b' => format!("{magnitude:b}"),
            _ => magnitude.to_string(),
        };
        if let Some(min_digits) = self.precision {
            if body.len() < min_digits {
                body = format!("{}{body}", "0".repeat(min_digits - body.len()));
            }
        }

        let mut prefix = self.sign(negative).to_string();
        if self.sharp {
            prefix.push_str(match verb {
                'x' => "0x",
                'X' => "0X",
                'o' if !body.starts_with('0') => "0",
                'b' => "0b",
                _ => "",
            });
        }

        Rendered {
            prefix,
            body,
            // Precision already fixed the digit count; padding is spaces.
            zero_fill: self.precision.is_none(),
        }
    }

    fn float(&self, verb: char, value: f64) -> Rendered {
        let magnitude = value.abs();
        if value.is_nan() {
            return Rendered::text("NaN".to_string());
        }

        let body = if magnitude.is_infinite() {
            "Inf".to_string()
        } else {
            let precision = self.precision.unwrap_or(6);
            match verb {
                'f' | 'F' => fixed(magnitude, precision),
                'e' => exponent(magnitude, precision, false),
                'E' => exponent(magnitude, precision, true),
                'G' => self.general_body(magnitude).to_uppercase(),
                _ => self.general_body(magnitude),
            }
        };

        Rendered {
            prefix: self.sign(value < 0.0).to_string(),
            body,
            zero_fill: magnitude.is_finite(),
        }
    }

    fn general_body(&self, magnitude: f64) -> String {
        match self.precision {
            Some(p) => general(magnitude, p),
            None => shortest(magnitude),
        }
    }

    fn sign(&self, negative: bool) -> &'static str {
        if negative {
            "-"
        } else if self.plus {
            "+"
        } else if self.space {
            " "
        } else {
            ""
        }
    }

    fn pad(&self, rendered: Rendered, out: &mut String) {
        let len = rendered.prefix.chars().count() + rendered.body.chars().count();
        let fill = self.width.unwrap_or(0).saturating_sub(len);

        if self.minus {
            out.push_str(&rendered.prefix);
            out.push_str(&rendered.body);
            out.push_str(&" ".repeat(fill));
        } else if self.zero && rendered.zero_fill {
            out.push_str(&rendered.prefix);
            out.push_str(&"0".repeat(fill));
            out.push_str(&rendered.body);
        } else {
            out.push_str(&" ".repeat(fill));
            out.push_str(&rendered.prefix);
            out.push_str(&rendered.body);
        }
    }
}

fn digits(chars: &mut Peekable<Chars<'_>>) -> Number {
    let mut value: Option<usize> = None;
    while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
        chars.next();
        value = Some(value.unwrap_or(0).saturating_mul(10).saturating_add(d as usize));
    }
    match value {
        None => Number::Absent,
        Some(n) if n > MAX_NUMBER => Number::TooLarge,
        Some(n) => Number::Value(n),
    }
}

/// Take the next argument as a `*` width or precision.
fn star(args: &[Arg], consumed: &mut usize) -> Option<i64> {
    let arg = args.get(*consumed)?;
    *consumed += 1;
    let n = match arg {
        Arg::Int(v) => *v,
        Arg::Uint(v) => i64::try_from(*v).ok()?,
        _ => return None,
    };
    (n.unsigned_abs() <= MAX_NUMBER as u64).then_some(n)
}

fn code_point(value: Option<u64>) -> char {
    value
        .and_then(|v| u32::try_from(v).ok())
        .and_then(char::from_u32)
        .unwrap_or(char::REPLACEMENT_CHARACTER)
}

/// Quote `text` between `delim`s with backslash escapes for control
/// characters, the delimiter and backslash.
fn quote(text: impl Iterator<Item = char>, delim: char) -> String {
    let mut out = String::from(delim);
    for c in text {
        match c {
            '\x07' => out.push_str("\\a"),
            '\x08' => out.push_str("\\b"),
            '\x0c' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\x0b' => out.push_str("\\v"),
            '\\' => out.push_str("\\\\"),
            c if c == delim => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_ascii_control() => out.push_str(&format!("\\x{:02x}", u32::from(c))),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", u32::from(c))),
            c => out.push(c),
        }
    }
    out.push(delim);
    out
}

/// Fixed-point with exactly `precision` decimals.
fn fixed(magnitude: f64, precision: usize) -> String {
    let shown = precision.min(EXACT_DIGITS);
    let mut out = format!("{magnitude:.shown$}");
    out.push_str(&"0".repeat(precision - shown));
    out
}

/// Scientific notation with a signed, at least two digit exponent.
fn exponent(magnitude: f64, precision: usize, upper: bool) -> String {
    let shown = precision.min(EXACT_DIGITS);
    let raw = format!("{magnitude:.shown$e}");
    let (mantissa, exp) = raw.split_once('e').unwrap_or((raw.as_str(), "0"));
    with_exponent(
        &format!("{mantissa}{}", "0".repeat(precision - shown)),
        exp.parse().unwrap_or(0),
        upper,
    )
}

fn with_exponent(mantissa: &str, exp: i64, upper: bool) -> String {
    format!(
        "{mantissa}{}{}{:02}",
        if upper { 'E' } else { 'e' },
        if exp < 0 { '-' } else { '+' },
        exp.unsigned_abs()
    )
}

/// Fewest digits that read back as the same value.
fn shortest(magnitude: f64) -> String {
    let raw = format!("{magnitude:e}");
    let (mantissa, exp) = raw.split_once('e').unwrap_or((raw.as_str(), "0"));
    let exp: i64 = exp.parse().unwrap_or(0);
    if magnitude != 0.0 && (exp < -4 || exp >= SHORTEST_EXP_LIMIT) {
        with_exponent(mantissa, exp, false)
    } else {
        magnitude.to_string()
    }
}

/// `%g` with an explicit number of significant digits.
fn general(magnitude: f64, precision: usize) -> String {
    let precision = precision.max(1);
    let raw = exponent(magnitude, precision - 1, false);
    let Some((mantissa, exp_text)) = raw.split_once('e') else {
        return raw;
    };
    let exp: i64 = exp_text.parse().unwrap_or(0);
    let significant = i64::try_from(precision).unwrap_or(i64::MAX);

    if exp < -4 || exp >= significant {
        format!("{}e{exp_text}", trim_fraction(mantissa))
    } else {
        let decimals = usize::try_from(significant - 1 - exp).unwrap_or(0);
        trim_fraction(&fixed(magnitude, decimals)).to_string()
    }
}

fn trim_fraction(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}
