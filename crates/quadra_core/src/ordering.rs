//! Total order over node values.
//!
//! Category first (URI < untyped literal < typed literal). URIs sort before
//! blank nodes. Typed literals sort by datatype then lexical form, except the
//! numeric datatypes, which share one family and sort by value.

use crate::node::{Limit, NodeValue, RangeValue, XSD, XSD_DECIMAL};
use std::cmp::Ordering;

/// Comparator contract used by the value pool and range scans.
pub trait ValueComparator: Send + Sync {
    fn compare(&self, a: &RangeValue, b: &RangeValue) -> Ordering;

    /// Compares a complete order key `a` against `b`, which may be the first
    /// bytes of a longer key whose full length is `b_len`. `None` means the
    /// available bytes cannot decide; callers fall back to [`compare`].
    ///
    /// [`compare`]: ValueComparator::compare
    fn compare_prefix(&self, a: &[u8], b: &[u8], b_len: usize) -> Option<Ordering>;
}

/// The pool's ordering.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeOrdering;

impl ValueComparator for NodeOrdering {
    fn compare(&self, a: &RangeValue, b: &RangeValue) -> Ordering {
        compare_range(a, b)
    }

    fn compare_prefix(&self, a: &[u8], b: &[u8], b_len: usize) -> Option<Ordering> {
        compare_prefix(a, b, b_len)
    }
}

const NUMERIC_TYPES: &[&str] = &[
    "decimal",
    "integer",
    "nonPositiveInteger",
    "negativeInteger",
    "long",
    "int",
    "short",
    "byte",
    "nonNegativeInteger",
    "unsignedLong",
    "unsignedInt",
    "unsignedShort",
    "unsignedByte",
    "positiveInteger",
    "float",
    "double",
];

pub fn is_numeric_datatype(dt: &str) -> bool {
    dt.strip_prefix(XSD).is_some_and(|local| NUMERIC_TYPES.contains(&local))
}

/// Parsed numeric value of a numeric literal.
#[derive(Debug, Clone, PartialEq)]
pub enum Number {
    Int(i128),
    Dec(Decimal),
    Float(f64),
}

/// Canonical decimal: no leading zeros in `int`, no trailing zeros in `frac`,
/// zero is never negative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decimal {
    neg: bool,
    int: String,
    frac: String,
}

impl Decimal {
    fn parse(s: &str) -> Option<Self> {
        let (neg, body) = match s.as_bytes().first()? {
            b'-' => (true, &s[1..]),
            b'+' => (false, &s[1..]),
            _ => (false, s),
        };
        let (int, frac) = body.split_once('.').unwrap_or((body, ""));
        if int.is_empty() && frac.is_empty() {
            return None;
        }
        if !int.bytes().chain(frac.bytes()).all(|b| b.is_ascii_digit()) {
            return None;
        }
        let int = int.trim_start_matches('0').to_string();
        let frac = frac.trim_end_matches('0').to_string();
        let neg = neg && !(int.is_empty() && frac.is_empty());
        Some(Decimal { neg, int, frac })
    }

    fn from_int(i: i128) -> Self {
        let int = if i == 0 { String::new() } else { i.unsigned_abs().to_string() };
        Decimal { neg: i < 0, int, frac: String::new() }
    }

    fn magnitude_cmp(&self, other: &Self) -> Ordering {
        self.int
            .len()
            .cmp(&other.int.len())
            .then_with(|| self.int.cmp(&other.int))
            .then_with(|| self.frac.cmp(&other.frac))
    }

    /// Exact value of a finite double. 1074 fractional digits reach the
    /// smallest subnormal.
    fn from_f64(f: f64) -> Self {
        Decimal::parse(&format!("{f:.1074}")).unwrap_or_else(|| Decimal::from_int(0))
    }
}

impl Ord for Decimal {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.neg, other.neg) {
            (false, true) => Ordering::Greater,
            (true, false) => Ordering::Less,
            (false, false) => self.magnitude_cmp(other),
            (true, true) => other.magnitude_cmp(self),
        }
    }
}

impl PartialOrd for Decimal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Number {
    /// `None` when `dt` is not numeric or the lexical form does not parse.
    pub fn parse(lexical: &str, dt: &str) -> Option<Number> {
        let local = dt.strip_prefix(XSD)?;
        let lex = lexical.trim();
        match local {
            "float" | "double" => match lex {
                "INF" | "+INF" => Some(Number::Float(f64::INFINITY)),
                "-INF" => Some(Number::Float(f64::NEG_INFINITY)),
                "NaN" => Some(Number::Float(f64::NAN)),
                _ => lex.parse::<f64>().ok().filter(|f| f.is_finite()).map(Number::Float),
            },
            "decimal" => Decimal::parse(lex).map(Number::Dec),
            l if NUMERIC_TYPES.contains(&l) => {
                if lex.contains('.') {
                    return None;
                }
                match lex.parse::<i128>() {
                    Ok(i) => Some(Number::Int(i)),
                    Err(_) => Decimal::parse(lex).map(Number::Dec),
                }
            }
            _ => None,
        }
    }

    /// Exact decimal form. Only called on finite values.
    fn exact(&self) -> Decimal {
        match self {
            Number::Int(i) => Decimal::from_int(*i),
            Number::Dec(d) => d.clone(),
            Number::Float(f) => Decimal::from_f64(*f),
        }
    }

    /// Exact numeric order. Infinities and NaN sit outside every finite
    /// value; `-0` equals `0`.
    pub fn numeric_cmp(&self, other: &Number) -> Ordering {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a.cmp(b),
            (Number::Dec(a), Number::Dec(b)) => a.cmp(b),
            (Number::Int(a), Number::Dec(b)) => Decimal::from_int(*a).cmp(b),
            (Number::Dec(a), Number::Int(b)) => a.cmp(&Decimal::from_int(*b)),
            (Number::Float(a), Number::Float(b)) => a.partial_cmp(b).unwrap_or_else(|| a.total_cmp(b)),
            (Number::Float(a), _) if !a.is_finite() => a.total_cmp(&0.0),
            (_, Number::Float(b)) if !b.is_finite() => 0.0f64.total_cmp(b),
            (a, b) => a.exact().cmp(&b.exact()),
        }
    }
}

fn family(dt: &str) -> &str {
    if is_numeric_datatype(dt) {
        XSD_DECIMAL
    } else {
        dt
    }
}

/// Plain lexical comparison. Never reached with two parsed numbers.
fn compare_lexical(a: &str, a_num: bool, b: &str, b_num: bool) -> Ordering {
    debug_assert!(!(a_num && b_num), "lexical comparison of two numeric values");
    a.cmp(b)
}

fn compare_typed(a_lex: &str, a_dt: &str, b_lex: &str, b_dt: &str) -> Ordering {
    let fam = family(a_dt).cmp(family(b_dt));
    if fam != Ordering::Equal {
        return fam;
    }
    if !is_numeric_datatype(a_dt) {
        return compare_lexical(a_lex, false, b_lex, false);
    }
    match (Number::parse(a_lex, a_dt), Number::parse(b_lex, b_dt)) {
        (Some(x), Some(y)) => x
            .numeric_cmp(&y)
            .then_with(|| a_dt.cmp(b_dt))
            .then_with(|| a_lex.cmp(b_lex)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => compare_lexical(a_lex, false, b_lex, false).then_with(|| a_dt.cmp(b_dt)),
    }
}

/// Full comparison of two node values.
pub fn compare_values(a: &NodeValue, b: &NodeValue) -> Ordering {
    let cat = a.category().cmp(&b.category());
    if cat != Ordering::Equal {
        return cat;
    }
    match (a, b) {
        (NodeValue::Uri(x), NodeValue::Uri(y)) | (NodeValue::Blank(x), NodeValue::Blank(y)) => x.cmp(y),
        (NodeValue::Uri(_), NodeValue::Blank(_)) => Ordering::Less,
        (NodeValue::Blank(_), NodeValue::Uri(_)) => Ordering::Greater,
        (NodeValue::Plain { lexical: la, lang: ga }, NodeValue::Plain { lexical: lb, lang: gb }) => {
            compare_lexical(la, false, lb, false).then_with(|| ga.cmp(gb))
        }
        (
            NodeValue::Typed { lexical: la, datatype: da },
            NodeValue::Typed { lexical: lb, datatype: db },
        ) => compare_typed(la, da, lb, db),
        // categories matched, so the variants above are exhaustive
        _ => Ordering::Equal,
    }
}

fn compare_limit(l: &Limit, v: &RangeValue) -> Ordering {
    let cat = l.category.cmp(&v.category());
    if cat != Ordering::Equal {
        return cat;
    }
    match v {
        RangeValue::Limit(o) if o.smallest == l.smallest => Ordering::Equal,
        _ if l.smallest => Ordering::Less,
        _ => Ordering::Greater,
    }
}

pub fn compare_range(a: &RangeValue, b: &RangeValue) -> Ordering {
    match (a, b) {
        (RangeValue::Node(x), RangeValue::Node(y)) => compare_values(x, y),
        (RangeValue::Limit(l), other) => compare_limit(l, other),
        (other, RangeValue::Limit(l)) => compare_limit(l, other).reverse(),
    }
}

/// Byte form used by [`compare_prefix`]: `[category][numeric flag][text]`.
/// URIs and blank nodes carry a sub-tag byte before their text, typed
/// literals carry `datatype \0 lexical`.
pub fn order_key(v: &NodeValue) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.lexical_form().len() + 4);
    out.push(v.category() as u8);
    match v {
        NodeValue::Uri(s) => {
            out.extend_from_slice(&[0, 0]);
            out.extend_from_slice(s.as_bytes());
        }
        NodeValue::Blank(s) => {
            out.extend_from_slice(&[0, 1]);
            out.extend_from_slice(s.as_bytes());
        }
        NodeValue::Plain { lexical, .. } => {
            out.push(0);
            out.extend_from_slice(lexical.as_bytes());
        }
        NodeValue::Typed { lexical, datatype } => {
            out.push(u8::from(is_numeric_datatype(datatype)));
            out.extend_from_slice(datatype.as_bytes());
            out.push(0);
            out.extend_from_slice(lexical.as_bytes());
        }
    }
    out
}

/// Drops a trailing, incomplete UTF-8 sequence left by truncation.
fn trim_partial_char(b: &[u8]) -> &[u8] {
    let mut start = b.len();
    // at most 3 continuation bytes precede a lead byte
    for _ in 0..4 {
        if start == 0 {
            return b;
        }
        start -= 1;
        let byte = b[start];
        if byte & 0xC0 != 0x80 {
            let need = match byte {
                0x00..=0x7F => 1,
                0xC0..=0xDF => 2,
                0xE0..=0xEF => 3,
                _ => 4,
            };
            return if b.len() - start < need { &b[..start] } else { b };
        }
    }
    b
}

/// See [`ValueComparator::compare_prefix`].
pub fn compare_prefix(a: &[u8], b: &[u8], b_len: usize) -> Option<Ordering> {
    let (&ca, &cb) = (a.first()?, b.first()?);
    if ca != cb {
        return Some(ca.cmp(&cb));
    }
    let (fa, fb) = (a.get(1)?, b.get(1)?);
    if *fa == 1 || *fb == 1 {
        return None;
    }
    let truncated = b.len() < b_len;
    let b = if truncated { trim_partial_char(b) } else { b };
    let n = a.len().min(b.len());
    let (pa, pb) = (&a[2..n.max(2)], &b[2..n.max(2)]);
    match pa.iter().zip(pb).find(|(x, y)| x != y) {
        Some((x, y)) => Some(x.cmp(y)),
        None if truncated => None,
        None if a.len() != b.len() => Some(a.len().cmp(&b.len())),
        None => None,
    }
}
