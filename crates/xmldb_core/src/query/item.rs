//! Items, atomic values and their comparison and arithmetic rules.

use crate::dom::{NodeKind, NodeRef};
use crate::error::{CoreError, CoreResult};
use crate::index::{parse_double, IndexKey, TypedValue};
use std::cmp::Ordering;
use std::fmt;

/// An atomic value.
#[derive(Debug, Clone, PartialEq)]
pub enum Atomic {
    /// `xs:string`.
    String(String),
    /// `xs:untypedAtomic`, the typed value of a node.
    Untyped(String),
    /// `xs:integer`.
    Integer(i64),
    /// `xs:double`.
    Double(f64),
    /// `xs:boolean`.
    Boolean(bool),
}

impl Atomic {
    /// Returns the XML Schema type name.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "xs:string",
            Self::Untyped(_) => "xs:untypedAtomic",
            Self::Integer(_) => "xs:integer",
            Self::Double(_) => "xs:double",
            Self::Boolean(_) => "xs:boolean",
        }
    }

    /// Returns true for integers and doubles.
    #[must_use]
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer(_) | Self::Double(_))
    }

    /// Returns the numeric value, casting untyped and string values.
    #[must_use]
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Double(d) => Some(*d),
            Self::String(s) | Self::Untyped(s) => parse_double(s.trim()),
            Self::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
        }
    }

    /// Converts to the value type used by the index.
    #[must_use]
    pub fn to_typed(&self) -> TypedValue {
        match self {
            Self::String(s) | Self::Untyped(s) => TypedValue::String(s.clone()),
            Self::Integer(i) => TypedValue::Integer(*i),
            Self::Double(d) => TypedValue::Double(*d),
            Self::Boolean(b) => TypedValue::Boolean(*b),
        }
    }

    /// Equality key: `1` and `1.0` share a key, strings never match numbers.
    pub(crate) fn key(&self) -> IndexKey {
        self.to_typed().key()
    }

    /// Treats an untyped value as a string; leaves others unchanged.
    fn promote_untyped(&self) -> Self {
        match self {
            Self::Untyped(s) => Self::String(s.clone()),
            other => other.clone(),
        }
    }
}

impl fmt::Display for Atomic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) | Self::Untyped(s) => f.write_str(s),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Double(d) => f.write_str(&format_double(*d)),
            Self::Boolean(b) => write!(f, "{b}"),
        }
    }
}

/// Formats a double the way queries print it: `3`, `2.5`, `INF`, `NaN`.
#[must_use]
pub fn format_double(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        let text = if value > 0.0 { "INF" } else { "-INF" };
        text.to_string()
    } else if value == value.trunc() && value.abs() < 1e15 {
        if value == 0.0 && value.is_sign_negative() {
            "-0".to_string()
        } else {
            format!("{}", value as i64)
        }
    } else {
        format!("{value}")
    }
}

/// A node or an atomic value.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    /// A stored or constructed node.
    Node(NodeRef),
    /// An atomic value.
    Atomic(Atomic),
}

/// An ordered sequence of items.
pub type Sequence = Vec<Item>;

impl Item {
    /// Returns the node, if this item is one.
    #[must_use]
    pub fn as_node(&self) -> Option<&NodeRef> {
        match self {
            Self::Node(node) => Some(node),
            Self::Atomic(_) => None,
        }
    }

    /// Returns the string value.
    #[must_use]
    pub fn string_value(&self) -> String {
        match self {
            Self::Node(node) => node.string_value(),
            Self::Atomic(atomic) => atomic.to_string(),
        }
    }

    /// Returns the typed value.
    #[must_use]
    pub fn atomize(&self) -> Atomic {
        match self {
            Self::Node(node) => match node.kind() {
                NodeKind::Comment | NodeKind::ProcessingInstruction => {
                    Atomic::String(node.string_value())
                }
                _ => Atomic::Untyped(node.string_value()),
            },
            Self::Atomic(atomic) => atomic.clone(),
        }
    }
}

impl From<Atomic> for Item {
    fn from(value: Atomic) -> Self {
        Self::Atomic(value)
    }
}

impl From<NodeRef> for Item {
    fn from(value: NodeRef) -> Self {
        Self::Node(value)
    }
}

/// Atomizes every item of a sequence.
#[must_use]
pub fn atomize(items: &[Item]) -> Vec<Atomic> {
    items.iter().map(Item::atomize).collect()
}

/// Atomizes a sequence expected to hold at most one item.
pub(crate) fn atomize_optional(items: &[Item], what: &str) -> CoreResult<Option<Atomic>> {
    match items {
        [] => Ok(None),
        [item] => Ok(Some(item.atomize())),
        _ => Err(CoreError::evaluation(
            "XPTY0004",
            format!("{what} expects at most one item, got {}", items.len()),
        )),
    }
}

/// Computes the effective boolean value of a sequence.
///
/// # Errors
///
/// `FORG0006` for a sequence of several atomic values.
pub fn effective_boolean(items: &[Item]) -> CoreResult<bool> {
    match items {
        [] => Ok(false),
        [Item::Node(_), ..] => Ok(true),
        [Item::Atomic(atomic)] => Ok(match atomic {
            Atomic::Boolean(b) => *b,
            Atomic::String(s) | Atomic::Untyped(s) => !s.is_empty(),
            Atomic::Integer(i) => *i != 0,
            Atomic::Double(d) => *d != 0.0 && !d.is_nan(),
        }),
        _ => Err(CoreError::evaluation(
            "FORG0006",
            "effective boolean value of a sequence of several atomic values",
        )),
    }
}

/// A comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Comparison {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparison {
    fn holds(self, ordering: Option<Ordering>) -> bool {
        match ordering {
            None => self == Self::Ne,
            Some(o) => match self {
                Self::Eq => o == Ordering::Equal,
                Self::Ne => o != Ordering::Equal,
                Self::Lt => o == Ordering::Less,
                Self::Le => o != Ordering::Greater,
                Self::Gt => o == Ordering::Greater,
                Self::Ge => o != Ordering::Less,
            },
        }
    }
}

/// Orders two atomics of comparable types. `None` means unordered (NaN).
fn compare_atomics(left: &Atomic, right: &Atomic) -> CoreResult<Option<Ordering>> {
    use Atomic::{Boolean, Double, Integer, String as Str};
    match (left, right) {
        (Integer(a), Integer(b)) => Ok(Some(a.cmp(b))),
        (a, b) if a.is_numeric() && b.is_numeric() => {
            let (a, b) = (a.as_double().unwrap_or(f64::NAN), b.as_double().unwrap_or(f64::NAN));
            Ok(a.partial_cmp(&b))
        }
        (Str(a), Str(b)) => Ok(Some(a.cmp(b))),
        (Boolean(a), Boolean(b)) => Ok(Some(a.cmp(b))),
        _ => Err(CoreError::type_mismatch(left.type_name(), right.type_name())),
    }
}

/// Value comparison (`eq`, `lt`, ...). Untyped operands compare as strings.
///
/// # Errors
///
/// `IndexTypeMismatch` for incomparable types.
pub(crate) fn value_compare(op: Comparison, left: &Atomic, right: &Atomic) -> CoreResult<bool> {
    let ordering = compare_atomics(&left.promote_untyped(), &right.promote_untyped())?;
    Ok(op.holds(ordering))
}

/// One pair of a general comparison (`=`, `<`, ...).
///
/// An untyped operand takes the type of the other side. An untyped value
/// that does not cast to a number or boolean compares false.
pub(crate) fn general_compare_pair(
    op: Comparison,
    left: &Atomic,
    right: &Atomic,
) -> CoreResult<bool> {
    let cast = |untyped: &str, other: &Atomic| -> Option<Atomic> {
        match other {
            Atomic::Integer(_) | Atomic::Double(_) => {
                parse_double(untyped.trim()).map(Atomic::Double)
            }
            Atomic::Boolean(_) => match untyped.trim() {
                "true" | "1" => Some(Atomic::Boolean(true)),
                "false" | "0" => Some(Atomic::Boolean(false)),
                _ => None,
            },
            _ => Some(Atomic::String(untyped.to_string())),
        }
    };
    let (left, right) = match (left, right) {
        (Atomic::Untyped(l), other) => match cast(l, other) {
            Some(l) => (l, other.promote_untyped()),
            None => return Ok(false),
        },
        (other, Atomic::Untyped(r)) => match cast(r, other) {
            Some(r) => (other.clone(), r),
            None => return Ok(false),
        },
        (l, r) => (l.clone(), r.clone()),
    };
    value_compare(op, &left, &right)
}

/// Ordering used by `order by`, `min` and `max`.
///
/// Untyped values sort as strings. NaN sorts below every other number.
pub(crate) fn order_compare(left: &Atomic, right: &Atomic) -> CoreResult<Ordering> {
    let (left, right) = (left.promote_untyped(), right.promote_untyped());
    Ok(match compare_atomics(&left, &right)? {
        Some(o) => o,
        None => {
            let l_nan = left.as_double().is_some_and(f64::is_nan);
            let r_nan = right.as_double().is_some_and(f64::is_nan);
            l_nan.cmp(&r_nan).reverse()
        }
    })
}

/// An arithmetic operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
}

impl ArithOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "div",
            Self::IDiv => "idiv",
            Self::Mod => "mod",
        }
    }
}

fn numeric_operand(value: Atomic, op: ArithOp) -> CoreResult<Atomic> {
    match value {
        Atomic::Integer(_) | Atomic::Double(_) => Ok(value),
        Atomic::Untyped(s) => parse_double(s.trim()).map(Atomic::Double).ok_or_else(|| {
            CoreError::evaluation("FORG0001", format!("cannot cast '{s}' to xs:double"))
        }),
        other => Err(CoreError::evaluation(
            "XPTY0004",
            format!("operator '{}' is not defined for {}", op.symbol(), other.type_name()),
        )),
    }
}

fn overflow() -> CoreError {
    CoreError::evaluation("FOAR0002", "integer overflow")
}

fn division_by_zero() -> CoreError {
    CoreError::evaluation("FOAR0001", "division by zero")
}

/// Applies an arithmetic operator to two atomic operands.
///
/// # Errors
///
/// `XPTY0004` for non-numeric operands, `FOAR0001` for integer division by
/// zero, `FOAR0002` on integer overflow.
pub(crate) fn arithmetic(op: ArithOp, left: Atomic, right: Atomic) -> CoreResult<Atomic> {
    let left = numeric_operand(left, op)?;
    let right = numeric_operand(right, op)?;
    if let (Atomic::Integer(a), Atomic::Integer(b)) = (&left, &right) {
        let (a, b) = (*a, *b);
        return match op {
            ArithOp::Add => a.checked_add(b).map(Atomic::Integer).ok_or_else(overflow),
            ArithOp::Sub => a.checked_sub(b).map(Atomic::Integer).ok_or_else(overflow),
            ArithOp::Mul => a.checked_mul(b).map(Atomic::Integer).ok_or_else(overflow),
            ArithOp::Div if b == 0 => Err(division_by_zero()),
            ArithOp::Div if a % b == 0 => Ok(Atomic::Integer(a / b)),
            ArithOp::Div => Ok(Atomic::Double(a as f64 / b as f64)),
            ArithOp::IDiv if b == 0 => Err(division_by_zero()),
            ArithOp::IDiv => a.checked_div(b).map(Atomic::Integer).ok_or_else(overflow),
            ArithOp::Mod if b == 0 => Err(division_by_zero()),
            ArithOp::Mod => a.checked_rem(b).map(Atomic::Integer).ok_or_else(overflow),
        };
    }

    let a = left.as_double().unwrap_or(f64::NAN);
    let b = right.as_double().unwrap_or(f64::NAN);
    Ok(match op {
        ArithOp::Add => Atomic::Double(a + b),
        ArithOp::Sub => Atomic::Double(a - b),
        ArithOp::Mul => Atomic::Double(a * b),
        ArithOp::Div => Atomic::Double(a / b),
        ArithOp::Mod => Atomic::Double(a % b),
        ArithOp::IDiv => {
            if b == 0.0 {
                return Err(division_by_zero());
            }
            let q = (a / b).trunc();
            if !q.is_finite() || q.abs() > i64::MAX as f64 {
                return Err(CoreError::evaluation("FOAR0002", "idiv result out of range"));
            }
            Atomic::Integer(q as i64)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_print_like_queries() {
        assert_eq!(format_double(3.0), "3");
        assert_eq!(format_double(2.5), "2.5");
        assert_eq!(format_double(f64::INFINITY), "INF");
        assert_eq!(format_double(f64::NAN), "NaN");
    }

    #[test]
    fn general_comparison_casts_untyped_leniently() {
        let untyped = Atomic::Untyped("3".into());
        assert!(general_compare_pair(Comparison::Eq, &untyped, &Atomic::Integer(3)).unwrap());
        let three = Atomic::String("3".into());
        assert!(general_compare_pair(Comparison::Eq, &untyped, &three).unwrap());

        let word = Atomic::Untyped("abc".into());
        assert!(!general_compare_pair(Comparison::Eq, &word, &Atomic::Integer(3)).unwrap());
    }

    #[test]
    fn value_comparison_of_string_and_number_is_a_type_mismatch() {
        let err = value_compare(Comparison::Eq, &Atomic::String("3".into()), &Atomic::Integer(3))
            .unwrap_err();
        assert!(matches!(err, CoreError::IndexTypeMismatch { .. }));
    }

    #[test]
    fn integer_arithmetic_is_checked() {
        assert_eq!(
            arithmetic(ArithOp::Div, Atomic::Integer(6), Atomic::Integer(3)).unwrap(),
            Atomic::Integer(2)
        );
        assert_eq!(
            arithmetic(ArithOp::Div, Atomic::Integer(1), Atomic::Integer(2)).unwrap(),
            Atomic::Double(0.5)
        );
        let err =
            arithmetic(ArithOp::Add, Atomic::Integer(i64::MAX), Atomic::Integer(1)).unwrap_err();
        assert_eq!(err.query_code(), Some("FOAR0002"));
        let err = arithmetic(ArithOp::IDiv, Atomic::Integer(1), Atomic::Integer(0)).unwrap_err();
        assert_eq!(err.query_code(), Some("FOAR0001"));
    }

    #[test]
    fn effective_boolean_value() {
        assert!(!effective_boolean(&[]).unwrap());
        assert!(effective_boolean(&[Atomic::String("x".into()).into()]).unwrap());
        assert!(!effective_boolean(&[Atomic::Double(f64::NAN).into()]).unwrap());
        let pair: [Item; 2] = [Atomic::Integer(1).into(), Atomic::Integer(2).into()];
        assert!(effective_boolean(&pair).is_err());
    }

    #[test]
    fn nan_orders_first() {
        let nan = Atomic::Double(f64::NAN);
        assert_eq!(order_compare(&nan, &Atomic::Integer(1)).unwrap(), Ordering::Less);
        assert_eq!(order_compare(&Atomic::Integer(1), &nan).unwrap(), Ordering::Greater);
    }
}
