//! Node values: the closed set of RDF terms a node identifier can denote.

use crate::errors::{QuadError, Result};
use crate::utils::{uvarint_decode, uvarint_encode};
use std::fmt;
use std::str::FromStr;

pub const XSD: &str = "http://www.w3.org/2001/XMLSchema#";
pub const XSD_STRING: &str = "http://www.w3.org/2001/XMLSchema#string";
pub const XSD_DECIMAL: &str = "http://www.w3.org/2001/XMLSchema#decimal";
pub const XSD_INTEGER: &str = "http://www.w3.org/2001/XMLSchema#integer";
pub const XSD_INT: &str = "http://www.w3.org/2001/XMLSchema#int";
pub const XSD_DOUBLE: &str = "http://www.w3.org/2001/XMLSchema#double";
pub const XSD_FLOAT: &str = "http://www.w3.org/2001/XMLSchema#float";

const TAG_URI: u8 = 1;
const TAG_BLANK: u8 = 2;
const TAG_PLAIN: u8 = 3;
const TAG_TYPED: u8 = 4;

/// Coarse classification; the primary sort key.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TypeCategory {
    /// URI references and blank nodes.
    Uri = 1,
    Untyped = 2,
    Typed = 3,
}

impl TypeCategory {
    pub const ALL: [TypeCategory; 3] = [TypeCategory::Uri, TypeCategory::Untyped, TypeCategory::Typed];

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(TypeCategory::Uri),
            2 => Some(TypeCategory::Untyped),
            3 => Some(TypeCategory::Typed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeValue {
    Uri(String),
    Blank(String),
    Plain { lexical: String, lang: Option<String> },
    Typed { lexical: String, datatype: String },
}

impl NodeValue {
    pub fn uri(s: impl Into<String>) -> Self {
        NodeValue::Uri(s.into())
    }

    pub fn blank(label: impl Into<String>) -> Self {
        NodeValue::Blank(label.into())
    }

    pub fn plain(lexical: impl Into<String>) -> Self {
        NodeValue::Plain { lexical: lexical.into(), lang: None }
    }

    pub fn lang(lexical: impl Into<String>, lang: impl Into<String>) -> Self {
        let lang = lang.into();
        NodeValue::Plain { lexical: lexical.into(), lang: (!lang.is_empty()).then_some(lang) }
    }

    pub fn typed(lexical: impl Into<String>, datatype: impl Into<String>) -> Self {
        NodeValue::Typed { lexical: lexical.into(), datatype: datatype.into() }
    }

    pub fn category(&self) -> TypeCategory {
        match self {
            NodeValue::Uri(_) | NodeValue::Blank(_) => TypeCategory::Uri,
            NodeValue::Plain { .. } => TypeCategory::Untyped,
            NodeValue::Typed { .. } => TypeCategory::Typed,
        }
    }

    pub fn lexical_form(&self) -> &str {
        match self {
            NodeValue::Uri(s) | NodeValue::Blank(s) => s,
            NodeValue::Plain { lexical, .. } | NodeValue::Typed { lexical, .. } => lexical,
        }
    }

    pub fn is_blank(&self) -> bool {
        matches!(self, NodeValue::Blank(_))
    }

    /// Compact binary form stored in the pool dictionary and journal.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.lexical_form().len() + 8);
        match self {
            NodeValue::Uri(s) => {
                out.push(TAG_URI);
                out.extend_from_slice(s.as_bytes());
            }
            NodeValue::Blank(s) => {
                out.push(TAG_BLANK);
                out.extend_from_slice(s.as_bytes());
            }
            NodeValue::Plain { lexical, lang } => {
                out.push(TAG_PLAIN);
                uvarint_encode(lexical.len() as u64, &mut out);
                out.extend_from_slice(lexical.as_bytes());
                if let Some(l) = lang {
                    out.extend_from_slice(l.as_bytes());
                }
            }
            NodeValue::Typed { lexical, datatype } => {
                out.push(TAG_TYPED);
                uvarint_encode(datatype.len() as u64, &mut out);
                out.extend_from_slice(datatype.as_bytes());
                out.extend_from_slice(lexical.as_bytes());
            }
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let (&tag, rest) = buf.split_first().ok_or(QuadError::Corrupt)?;
        let text = |b: &[u8]| String::from_utf8(b.to_vec()).map_err(|_| QuadError::Corrupt);
        let split = |b: &[u8]| -> Result<(String, String)> {
            let (n, tail) = uvarint_decode(b).ok_or(QuadError::Corrupt)?;
            let n = n as usize;
            if n > tail.len() {
                return Err(QuadError::Corrupt);
            }
            Ok((text(&tail[..n])?, text(&tail[n..])?))
        };
        match tag {
            TAG_URI => Ok(NodeValue::Uri(text(rest)?)),
            TAG_BLANK => Ok(NodeValue::Blank(text(rest)?)),
            TAG_PLAIN => {
                let (lexical, lang) = split(rest)?;
                Ok(NodeValue::Plain { lexical, lang: (!lang.is_empty()).then_some(lang) })
            }
            TAG_TYPED => {
                let (datatype, lexical) = split(rest)?;
                Ok(NodeValue::Typed { lexical, datatype })
            }
            _ => Err(QuadError::Corrupt),
        }
    }
}

fn escape(s: &str, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for c in s.chars() {
        match c {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\r' => f.write_str("\\r")?,
            '\t' => f.write_str("\\t")?,
            c => write!(f, "{c}")?,
        }
    }
    Ok(())
}

/// N-Triples term syntax.
impl fmt::Display for NodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeValue::Uri(u) => write!(f, "<{u}>"),
            NodeValue::Blank(b) => write!(f, "_:{b}"),
            NodeValue::Plain { lexical, lang } => {
                f.write_str("\"")?;
                escape(lexical, f)?;
                f.write_str("\"")?;
                match lang {
                    Some(l) => write!(f, "@{l}"),
                    None => Ok(()),
                }
            }
            NodeValue::Typed { lexical, datatype } => {
                f.write_str("\"")?;
                escape(lexical, f)?;
                write!(f, "\"^^<{datatype}>")
            }
        }
    }
}

impl FromStr for NodeValue {
    type Err = QuadError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let bad = || QuadError::InvalidValue(s.to_string());
        if let Some(inner) = s.strip_prefix('<') {
            let uri = inner.strip_suffix('>').ok_or_else(bad)?;
            if uri.is_empty() || uri.contains(['<', '>', ' ']) {
                return Err(bad());
            }
            return Ok(NodeValue::Uri(uri.to_string()));
        }
        if let Some(label) = s.strip_prefix("_:") {
            if label.is_empty() || label.contains(char::is_whitespace) {
                return Err(bad());
            }
            return Ok(NodeValue::Blank(label.to_string()));
        }
        let body = s.strip_prefix('"').ok_or_else(bad)?;
        let mut lexical = String::new();
        let mut chars = body.char_indices();
        let mut end = None;
        while let Some((i, c)) = chars.next() {
            match c {
                '"' => {
                    end = Some(i + 1);
                    break;
                }
                '\\' => match chars.next().map(|(_, e)| e) {
                    Some('"') => lexical.push('"'),
                    Some('\\') => lexical.push('\\'),
                    Some('n') => lexical.push('\n'),
                    Some('r') => lexical.push('\r'),
                    Some('t') => lexical.push('\t'),
                    _ => return Err(bad()),
                },
                c => lexical.push(c),
            }
        }
        let tail = &body[end.ok_or_else(bad)?..];
        if tail.is_empty() {
            return Ok(NodeValue::Plain { lexical, lang: None });
        }
        if let Some(lang) = tail.strip_prefix('@') {
            if lang.is_empty() || !lang.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
                return Err(bad());
            }
            return Ok(NodeValue::Plain { lexical, lang: Some(lang.to_string()) });
        }
        if let Some(dt) = tail.strip_prefix("^^<").and_then(|t| t.strip_suffix('>')) {
            if dt.is_empty() {
                return Err(bad());
            }
            return Ok(NodeValue::Typed { lexical, datatype: dt.to_string() });
        }
        Err(bad())
    }
}

/// Open-ended range bound for one type category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Limit {
    pub category: TypeCategory,
    pub smallest: bool,
}

impl Limit {
    pub fn smallest(category: TypeCategory) -> Self {
        Limit { category, smallest: true }
    }

    pub fn largest(category: TypeCategory) -> Self {
        Limit { category, smallest: false }
    }
}

/// A value that can take part in pool ordering: a real node value or a
/// category limit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RangeValue {
    Node(NodeValue),
    Limit(Limit),
}

impl RangeValue {
    pub fn category(&self) -> TypeCategory {
        match self {
            RangeValue::Node(v) => v.category(),
            RangeValue::Limit(l) => l.category,
        }
    }

    /// Limits have no content; asking for it is a usage error.
    pub fn lexical_form(&self) -> Result<&str> {
        match self {
            RangeValue::Node(v) => Ok(v.lexical_form()),
            RangeValue::Limit(_) => Err(QuadError::NoLexicalForm),
        }
    }
}

impl From<NodeValue> for RangeValue {
    fn from(v: NodeValue) -> Self {
        RangeValue::Node(v)
    }
}

impl From<Limit> for RangeValue {
    fn from(l: Limit) -> Self {
        RangeValue::Limit(l)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples() -> Vec<NodeValue> {
        vec![
            NodeValue::uri("http://example.org/a"),
            NodeValue::blank("b12"),
            NodeValue::plain("hello \"world\"\n"),
            NodeValue::lang("chat", "fr"),
            NodeValue::typed("42", XSD_INT),
            NodeValue::plain(""),
        ]
    }

    #[test]
    fn binary_form_is_lossless() {
        for v in samples() {
            assert_eq!(NodeValue::decode(&v.encode()).unwrap(), v);
        }
        assert!(NodeValue::decode(&[9, 1, 2]).is_err());
        assert!(NodeValue::decode(&[]).is_err());
    }

    #[test]
    fn ntriples_text_form() {
        for v in samples() {
            let text = v.to_string();
            assert_eq!(text.parse::<NodeValue>().unwrap(), v, "{text}");
        }
        assert_eq!(NodeValue::typed("1", XSD_INT).to_string(), format!("\"1\"^^<{XSD_INT}>"));
        for bad in ["", "<>", "plain", "\"open", "\"x\"@", "\"x\"^^dt", "_:"] {
            assert!(bad.parse::<NodeValue>().is_err(), "{bad}");
        }
    }

    #[test]
    fn categories_and_limits() {
        assert_eq!(NodeValue::blank("x").category(), TypeCategory::Uri);
        assert_eq!(NodeValue::lang("x", "en").category(), TypeCategory::Untyped);
        let lim: RangeValue = Limit::smallest(TypeCategory::Typed).into();
        assert!(matches!(lim.lexical_form(), Err(QuadError::NoLexicalForm)));
        assert_eq!(RangeValue::from(NodeValue::plain("x")).lexical_form().unwrap(), "x");
    }
}
