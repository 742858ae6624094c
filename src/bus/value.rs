//! Bus value model
//!
//! A small mirror of the D-Bus type system: [`ValueKind`] describes the shape
//! of one value, [`Value`] carries one, and [`Signature`] is the ordered tuple
//! of kinds that describes a whole message body. Signatures render and parse
//! the usual D-Bus type strings (`(ss)`, `(ao)`, `(a{sv})`), which is also the
//! form used when logging shape mismatches.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Kind of a single bus value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Byte,
    Boolean,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Double,
    String,
    ObjectPath,
    Signature,
    Variant,
    Array(Box<ValueKind>),
    Struct(Vec<ValueKind>),
    Dict(Box<ValueKind>, Box<ValueKind>),
}

impl ValueKind {
    pub fn array_of(element: ValueKind) -> Self {
        ValueKind::Array(Box::new(element))
    }

    /// `ay`
    pub fn is_byte_array(&self) -> bool {
        matches!(self, ValueKind::Array(inner) if **inner == ValueKind::Byte)
    }

    /// Basic kinds are the only ones allowed as dictionary keys.
    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            ValueKind::Variant | ValueKind::Array(_) | ValueKind::Struct(_) | ValueKind::Dict(..)
        )
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Byte => f.write_str("y"),
            ValueKind::Boolean => f.write_str("b"),
            ValueKind::Int16 => f.write_str("n"),
            ValueKind::UInt16 => f.write_str("q"),
            ValueKind::Int32 => f.write_str("i"),
            ValueKind::UInt32 => f.write_str("u"),
            ValueKind::Int64 => f.write_str("x"),
            ValueKind::UInt64 => f.write_str("t"),
            ValueKind::Double => f.write_str("d"),
            ValueKind::String => f.write_str("s"),
            ValueKind::ObjectPath => f.write_str("o"),
            ValueKind::Signature => f.write_str("g"),
            ValueKind::Variant => f.write_str("v"),
            ValueKind::Array(inner) => write!(f, "a{inner}"),
            ValueKind::Struct(fields) => {
                f.write_str("(")?;
                for field in fields {
                    write!(f, "{field}")?;
                }
                f.write_str(")")
            }
            ValueKind::Dict(key, value) => write!(f, "a{{{key}{value}}}"),
        }
    }
}

impl FromStr for ValueKind {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parser = KindParser::new(s);
        let kind = parser.parse_one()?;
        parser.finish()?;
        Ok(kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("empty type string")]
    Empty,

    #[error("unexpected character '{found}' at offset {offset} in '{input}'")]
    Unexpected {
        input: String,
        offset: usize,
        found: char,
    },

    #[error("type string '{0}' ended early")]
    Truncated(String),

    #[error("dictionary key in '{0}' must be a basic type")]
    NonBasicKey(String),

    #[error("payload schema '{0}' must be a tuple")]
    NotATuple(String),
}

struct KindParser<'a> {
    input: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> KindParser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.char_indices().peekable(),
        }
    }

    fn unexpected(&self, offset: usize, found: char) -> SignatureError {
        SignatureError::Unexpected {
            input: self.input.to_string(),
            offset,
            found,
        }
    }

    fn parse_one(&mut self) -> Result<ValueKind, SignatureError> {
        let Some((offset, c)) = self.chars.next() else {
            return Err(if self.input.is_empty() {
                SignatureError::Empty
            } else {
                SignatureError::Truncated(self.input.to_string())
            });
        };

        let kind = match c {
            'y' => ValueKind::Byte,
            'b' => ValueKind::Boolean,
            'n' => ValueKind::Int16,
            'q' => ValueKind::UInt16,
            'i' => ValueKind::Int32,
            'u' => ValueKind::UInt32,
            'x' => ValueKind::Int64,
            't' => ValueKind::UInt64,
            'd' => ValueKind::Double,
            's' => ValueKind::String,
            'o' => ValueKind::ObjectPath,
            'g' => ValueKind::Signature,
            'v' => ValueKind::Variant,
            'a' => {
                if let Some(&(_, '{')) = self.chars.peek() {
                    self.chars.next();
                    let key = self.parse_one()?;
                    if !key.is_basic() {
                        return Err(SignatureError::NonBasicKey(self.input.to_string()));
                    }
                    let value = self.parse_one()?;
                    self.expect('}')?;
                    ValueKind::Dict(Box::new(key), Box::new(value))
                } else {
                    ValueKind::Array(Box::new(self.parse_one()?))
                }
            }
            '(' => {
                let mut fields = Vec::new();
                loop {
                    match self.chars.peek() {
                        Some(&(_, ')')) => {
                            self.chars.next();
                            break;
                        }
                        Some(_) => fields.push(self.parse_one()?),
                        None => return Err(SignatureError::Truncated(self.input.to_string())),
                    }
                }
                ValueKind::Struct(fields)
            }
            other => return Err(self.unexpected(offset, other)),
        };
        Ok(kind)
    }

    fn expect(&mut self, want: char) -> Result<(), SignatureError> {
        match self.chars.next() {
            Some((_, c)) if c == want => Ok(()),
            Some((offset, c)) => Err(self.unexpected(offset, c)),
            None => Err(SignatureError::Truncated(self.input.to_string())),
        }
    }

    fn finish(&mut self) -> Result<(), SignatureError> {
        match self.chars.next() {
            Some((offset, c)) => Err(self.unexpected(offset, c)),
            None => Ok(()),
        }
    }
}

/// Ordered tuple of value kinds describing a message body.
///
/// Always rendered with surrounding parentheses, so an empty body is `()`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Signature(Vec<ValueKind>);

impl Signature {
    pub fn new(kinds: Vec<ValueKind>) -> Self {
        Self(kinds)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Shape of an actual message body
    pub fn of(values: &[Value]) -> Self {
        Self(values.iter().map(Value::kind).collect())
    }

    pub fn kinds(&self) -> &[ValueKind] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, values: &[Value]) -> bool {
        self.0.len() == values.len() && self.0.iter().zip(values).all(|(k, v)| *k == v.kind())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for kind in &self.0 {
            write!(f, "{kind}")?;
        }
        f.write_str(")")
    }
}

impl FromStr for Signature {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<ValueKind>()? {
            ValueKind::Struct(fields) => Ok(Self(fields)),
            _ => Err(SignatureError::NotATuple(s.to_string())),
        }
    }
}

/// A single bus value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(u8),
    Bool(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Str(String),
    ObjectPath(String),
    Signature(String),
    Variant(Box<Value>),
    /// Element kind is carried so empty arrays keep their shape
    Array(ValueKind, Vec<Value>),
    Struct(Vec<Value>),
    Dict(ValueKind, ValueKind, Vec<(Value, Value)>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Byte(_) => ValueKind::Byte,
            Value::Bool(_) => ValueKind::Boolean,
            Value::Int16(_) => ValueKind::Int16,
            Value::UInt16(_) => ValueKind::UInt16,
            Value::Int32(_) => ValueKind::Int32,
            Value::UInt32(_) => ValueKind::UInt32,
            Value::Int64(_) => ValueKind::Int64,
            Value::UInt64(_) => ValueKind::UInt64,
            Value::Double(_) => ValueKind::Double,
            Value::Str(_) => ValueKind::String,
            Value::ObjectPath(_) => ValueKind::ObjectPath,
            Value::Signature(_) => ValueKind::Signature,
            Value::Variant(_) => ValueKind::Variant,
            Value::Array(element, _) => ValueKind::Array(Box::new(element.clone())),
            Value::Struct(fields) => ValueKind::Struct(fields.iter().map(Value::kind).collect()),
            Value::Dict(key, value, _) => {
                ValueKind::Dict(Box::new(key.clone()), Box::new(value.clone()))
            }
        }
    }

    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn object_path(path: impl Into<String>) -> Self {
        Value::ObjectPath(path.into())
    }

    /// `ay`
    pub fn bytes(bytes: &[u8]) -> Self {
        Value::Array(ValueKind::Byte, bytes.iter().copied().map(Value::Byte).collect())
    }

    /// `as`
    pub fn strings<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Value::Array(
            ValueKind::String,
            items.into_iter().map(|s| Value::Str(s.into())).collect(),
        )
    }

    /// `ao`
    pub fn object_paths<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Value::Array(
            ValueKind::ObjectPath,
            items.into_iter().map(|s| Value::ObjectPath(s.into())).collect(),
        )
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::ObjectPath(s) | Value::Signature(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::Byte(v) => Some(u32::from(*v)),
            Value::UInt16(v) => Some(u32::from(*v)),
            Value::UInt32(v) => Some(*v),
            _ => None,
        }
    }

    /// Raw bytes of an `ay` value
    pub fn as_byte_vec(&self) -> Option<Vec<u8>> {
        match self {
            Value::Array(ValueKind::Byte, items) => items
                .iter()
                .map(|v| match v {
                    Value::Byte(b) => Some(*b),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }

    /// Elements of an `as`/`ao` value
    pub fn as_string_vec(&self) -> Option<Vec<String>> {
        match self {
            Value::Array(ValueKind::String | ValueKind::ObjectPath, items) => items
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => None,
        }
    }
}
