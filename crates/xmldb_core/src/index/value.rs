//! Typed index values and their keys.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The declared type of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ValueType {
    /// `xs:string`, compared by code points.
    String,
    /// `xs:integer`.
    Integer,
    /// `xs:double`.
    Double,
    /// `xs:boolean`.
    Boolean,
}

impl ValueType {
    /// Returns the XML Schema type name.
    #[must_use]
    pub fn type_name(self) -> &'static str {
        match self {
            Self::String => "xs:string",
            Self::Integer => "xs:integer",
            Self::Double => "xs:double",
            Self::Boolean => "xs:boolean",
        }
    }

    /// Returns true for the numeric types.
    #[must_use]
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::Double)
    }

    /// Returns true if values of the two types can be compared for equality.
    ///
    /// Integers and doubles compare numerically with each other; every other
    /// pairing must be the same type.
    #[must_use]
    pub fn is_comparable_with(self, other: Self) -> bool {
        self == other || (self.is_numeric() && other.is_numeric())
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// A value with its type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypedValue {
    /// A string.
    String(String),
    /// An integer.
    Integer(i64),
    /// A double.
    Double(f64),
    /// A boolean.
    Boolean(bool),
}

impl TypedValue {
    /// Returns the value's type.
    #[must_use]
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::String(_) => ValueType::String,
            Self::Integer(_) => ValueType::Integer,
            Self::Double(_) => ValueType::Double,
            Self::Boolean(_) => ValueType::Boolean,
        }
    }

    /// Casts lexical text to `ty`, returning `None` if it is not a valid
    /// literal of that type.
    #[must_use]
    pub fn cast(lexical: &str, ty: ValueType) -> Option<Self> {
        let trimmed = lexical.trim();
        match ty {
            ValueType::String => Some(Self::String(lexical.to_string())),
            ValueType::Integer => trimmed.parse().ok().map(Self::Integer),
            ValueType::Double => parse_double(trimmed).map(Self::Double),
            ValueType::Boolean => match trimmed {
                "true" | "1" => Some(Self::Boolean(true)),
                "false" | "0" => Some(Self::Boolean(false)),
                _ => None,
            },
        }
    }

    /// Returns the key under which this value is indexed.
    ///
    /// # Errors
    ///
    /// Returns `IndexTypeMismatch` if the value's type cannot be compared
    /// with `declared`.
    pub fn key_for(&self, declared: ValueType) -> CoreResult<IndexKey> {
        if !self.value_type().is_comparable_with(declared) {
            return Err(CoreError::type_mismatch(
                declared.type_name(),
                self.value_type().type_name(),
            ));
        }
        Ok(self.key())
    }

    pub(crate) fn key(&self) -> IndexKey {
        match self {
            Self::String(s) => IndexKey::String(s.clone()),
            Self::Integer(i) => IndexKey::number(*i as f64),
            Self::Double(d) => IndexKey::number(*d),
            Self::Boolean(b) => IndexKey::Boolean(*b),
        }
    }
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Double(d) => write!(f, "{d}"),
            Self::Boolean(b) => write!(f, "{b}"),
        }
    }
}

/// Parses an `xs:double` literal, including `INF`, `-INF` and `NaN`.
pub(crate) fn parse_double(text: &str) -> Option<f64> {
    match text {
        "INF" | "+INF" => Some(f64::INFINITY),
        "-INF" => Some(f64::NEG_INFINITY),
        "NaN" => Some(f64::NAN),
        _ if text.eq_ignore_ascii_case("inf") || text.eq_ignore_ascii_case("nan") => None,
        _ => text.parse().ok(),
    }
}

/// Hashable equality key of a typed value.
///
/// Numbers are keyed by the bits of their `f64` value so `3` and `3.0`
/// share a key; `-0.0` is folded into `0.0`. NaN has no key because it is
/// equal to nothing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexKey {
    /// String key.
    String(String),
    /// Numeric key.
    Number(u64),
    /// Boolean key.
    Boolean(bool),
    /// A value equal to nothing.
    Unmatchable,
}

impl IndexKey {
    fn number(value: f64) -> Self {
        if value.is_nan() {
            Self::Unmatchable
        } else if value == 0.0 {
            Self::Number(0.0f64.to_bits())
        } else {
            Self::Number(value.to_bits())
        }
    }
}
