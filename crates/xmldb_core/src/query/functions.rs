//! Built-in functions and the extension points for native functions.

use super::eval::Evaluator;
use super::item::{
    arithmetic, atomize, atomize_optional, effective_boolean, order_compare, ArithOp, Atomic, Item,
    Sequence,
};
use super::{FN_NAMESPACE, UTIL_NAMESPACE, XS_NAMESPACE};
use crate::dom::{NodeKind, NodeRef, QName};
use crate::error::{CoreError, CoreResult};
use crate::index::parse_double;
use crate::store::{document_path, normalize_path, split_document_path};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Functions of one `host:` namespace, implemented by the embedding
/// application.
///
/// Bindings are registered on the pool per namespace and resolved when a
/// query is compiled. Compilation fails with `BindingDisabled` while host
/// bindings are switched off.
///
/// ```rust
/// use std::sync::atomic::{AtomicI64, Ordering};
/// use xmldb_core::query::{Atomic, HostBinding, Item, Sequence};
/// use xmldb_core::{CoreError, CoreResult};
///
/// struct Ticker(AtomicI64);
///
/// impl HostBinding for Ticker {
///     fn call(&self, function: &str, _args: &[Sequence]) -> CoreResult<Sequence> {
///         match function {
///             "tick" => Ok(vec![Item::Atomic(Atomic::Integer(
///                 self.0.fetch_add(1, Ordering::SeqCst) + 1,
///             ))]),
///             other => Err(CoreError::evaluation("XPST0017", format!("no function {other}"))),
///         }
///     }
/// }
/// ```
pub trait HostBinding: Send + Sync {
    /// Returns true if the binding implements `function` with `arity`
    /// arguments. Checked at compile time.
    fn provides(&self, function: &str, arity: usize) -> bool {
        let _ = (function, arity);
        true
    }

    /// Calls `function` with evaluated arguments.
    ///
    /// # Errors
    ///
    /// Errors are returned to the query unchanged.
    fn call(&self, function: &str, args: &[Sequence]) -> CoreResult<Sequence>;
}

type NativeCallback = dyn Fn(&[Sequence]) -> CoreResult<Sequence> + Send + Sync;

/// A function implemented in Rust and registered on a pool.
#[derive(Clone)]
pub struct NativeFunction {
    name: QName,
    arity: usize,
    callback: Arc<NativeCallback>,
}

impl NativeFunction {
    /// Creates a function `{namespace}local` taking `arity` arguments.
    pub fn new(
        namespace: &str,
        local: &str,
        arity: usize,
        callback: impl Fn(&[Sequence]) -> CoreResult<Sequence> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: QName::namespaced(namespace, local),
            arity,
            callback: Arc::new(callback),
        }
    }

    /// Returns the function name.
    #[must_use]
    pub fn name(&self) -> &QName {
        &self.name
    }

    /// Returns the number of arguments.
    #[must_use]
    pub fn arity(&self) -> usize {
        self.arity
    }

    pub(crate) fn call(&self, args: &[Sequence]) -> CoreResult<Sequence> {
        (self.callback)(args)
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish_non_exhaustive()
    }
}

pub(crate) type BuiltinFn = fn(&mut Evaluator<'_>, Vec<Sequence>) -> CoreResult<Sequence>;

pub(crate) struct Builtin {
    pub namespace: &'static str,
    pub name: &'static str,
    pub min: usize,
    pub max: usize,
    pub call: BuiltinFn,
}

const MANY: usize = usize::MAX;

macro_rules! builtin {
    ($ns:expr, $name:literal, $min:expr, $max:expr, $call:expr) => {
        Builtin {
            namespace: $ns,
            name: $name,
            min: $min,
            max: $max,
            call: $call,
        }
    };
}

pub(crate) static BUILTINS: &[Builtin] = &[
    builtin!(FN_NAMESPACE, "count", 1, 1, fn_count),
    builtin!(FN_NAMESPACE, "position", 0, 0, fn_position),
    builtin!(FN_NAMESPACE, "last", 0, 0, fn_last),
    builtin!(FN_NAMESPACE, "doc", 1, 1, fn_doc),
    builtin!(FN_NAMESPACE, "collection", 0, 1, fn_collection),
    builtin!(FN_NAMESPACE, "string", 0, 1, fn_string),
    builtin!(FN_NAMESPACE, "data", 1, 1, fn_data),
    builtin!(FN_NAMESPACE, "number", 0, 1, fn_number),
    builtin!(FN_NAMESPACE, "sum", 1, 2, fn_sum),
    builtin!(FN_NAMESPACE, "avg", 1, 1, fn_avg),
    builtin!(FN_NAMESPACE, "min", 1, 1, fn_min),
    builtin!(FN_NAMESPACE, "max", 1, 1, fn_max),
    builtin!(FN_NAMESPACE, "empty", 1, 1, fn_empty),
    builtin!(FN_NAMESPACE, "exists", 1, 1, fn_exists),
    builtin!(FN_NAMESPACE, "not", 1, 1, fn_not),
    builtin!(FN_NAMESPACE, "boolean", 1, 1, fn_boolean),
    builtin!(FN_NAMESPACE, "true", 0, 0, fn_true),
    builtin!(FN_NAMESPACE, "false", 0, 0, fn_false),
    builtin!(FN_NAMESPACE, "concat", 2, MANY, fn_concat),
    builtin!(FN_NAMESPACE, "string-join", 1, 2, fn_string_join),
    builtin!(FN_NAMESPACE, "string-length", 0, 1, fn_string_length),
    builtin!(FN_NAMESPACE, "contains", 2, 2, fn_contains),
    builtin!(FN_NAMESPACE, "starts-with", 2, 2, fn_starts_with),
    builtin!(FN_NAMESPACE, "ends-with", 2, 2, fn_ends_with),
    builtin!(FN_NAMESPACE, "substring", 2, 3, fn_substring),
    builtin!(FN_NAMESPACE, "upper-case", 1, 1, fn_upper_case),
    builtin!(FN_NAMESPACE, "lower-case", 1, 1, fn_lower_case),
    builtin!(FN_NAMESPACE, "normalize-space", 0, 1, fn_normalize_space),
    builtin!(FN_NAMESPACE, "name", 0, 1, fn_name),
    builtin!(FN_NAMESPACE, "local-name", 0, 1, fn_local_name),
    builtin!(FN_NAMESPACE, "namespace-uri", 0, 1, fn_namespace_uri),
    builtin!(FN_NAMESPACE, "root", 0, 1, fn_root),
    builtin!(FN_NAMESPACE, "reverse", 1, 1, fn_reverse),
    builtin!(FN_NAMESPACE, "distinct-values", 1, 1, fn_distinct_values),
    builtin!(FN_NAMESPACE, "subsequence", 2, 3, fn_subsequence),
    builtin!(FN_NAMESPACE, "index-of", 2, 2, fn_index_of),
    builtin!(FN_NAMESPACE, "abs", 1, 1, fn_abs),
    builtin!(FN_NAMESPACE, "floor", 1, 1, fn_floor),
    builtin!(FN_NAMESPACE, "ceiling", 1, 1, fn_ceiling),
    builtin!(FN_NAMESPACE, "round", 1, 1, fn_round),
    builtin!(FN_NAMESPACE, "error", 0, 2, fn_error),
    builtin!(XS_NAMESPACE, "string", 1, 1, xs_string),
    builtin!(XS_NAMESPACE, "integer", 1, 1, xs_integer),
    builtin!(XS_NAMESPACE, "double", 1, 1, xs_double),
    builtin!(XS_NAMESPACE, "boolean", 1, 1, xs_boolean),
    builtin!(UTIL_NAMESPACE, "counter-next", 1, 1, util_counter_next),
    builtin!(UTIL_NAMESPACE, "document-name", 1, 1, util_document_name),
];

/// Finds a built-in by name and arity.
pub(crate) fn lookup_builtin(name: &QName, arity: usize) -> Option<usize> {
    BUILTINS.iter().position(|b| {
        name.namespace.as_deref() == Some(b.namespace)
            && name.local == b.name
            && (b.min..=b.max).contains(&arity)
    })
}

/// Returns true if `namespace` belongs to the built-in library.
pub(crate) fn is_builtin_namespace(namespace: &str) -> bool {
    [FN_NAMESPACE, XS_NAMESPACE, UTIL_NAMESPACE].contains(&namespace)
}

// ---- helpers -------------------------------------------------------------------

fn boolean(value: bool) -> Item {
    Item::Atomic(Atomic::Boolean(value))
}

fn string(value: impl Into<String>) -> Item {
    Item::Atomic(Atomic::String(value.into()))
}

fn integer(value: i64) -> Item {
    Item::Atomic(Atomic::Integer(value))
}

fn double(value: f64) -> Item {
    Item::Atomic(Atomic::Double(value))
}

fn take(args: &mut Vec<Sequence>) -> Sequence {
    if args.is_empty() {
        Vec::new()
    } else {
        args.remove(0)
    }
}

/// String value of an optional single item; the empty sequence is `""`.
fn string_arg(items: &[Item], what: &str) -> CoreResult<String> {
    Ok(atomize_optional(items, what)?
        .map(|a| a.to_string())
        .unwrap_or_default())
}

fn node_arg(items: &[Item], what: &str) -> CoreResult<Option<NodeRef>> {
    match items {
        [] => Ok(None),
        [Item::Node(node)] => Ok(Some(node.clone())),
        [Item::Atomic(a)] => Err(CoreError::evaluation(
            "XPTY0004",
            format!("{what} expects a node, got {}", a.type_name()),
        )),
        _ => Err(CoreError::evaluation(
            "XPTY0004",
            format!("{what} expects at most one node"),
        )),
    }
}

/// The node argument, or the context node when the argument is omitted.
fn node_or_context(
    ev: &Evaluator<'_>,
    mut args: Vec<Sequence>,
    what: &str,
) -> CoreResult<Option<NodeRef>> {
    if args.is_empty() {
        match ev.context_item()? {
            Item::Node(node) => Ok(Some(node.clone())),
            Item::Atomic(_) => Err(CoreError::evaluation(
                "XPTY0004",
                format!("{what}: the context item is not a node"),
            )),
        }
    } else {
        node_arg(&take(&mut args), what)
    }
}

/// The string argument, or the context item's string value.
fn string_or_context(
    ev: &Evaluator<'_>,
    mut args: Vec<Sequence>,
    what: &str,
) -> CoreResult<String> {
    if args.is_empty() {
        Ok(ev.context_item()?.string_value())
    } else {
        string_arg(&take(&mut args), what)
    }
}

fn number_arg(items: &[Item], what: &str) -> CoreResult<Option<Atomic>> {
    match atomize_optional(items, what)? {
        None => Ok(None),
        Some(value @ (Atomic::Integer(_) | Atomic::Double(_))) => Ok(Some(value)),
        Some(Atomic::Untyped(s)) => parse_double(s.trim())
            .map(|d| Some(Atomic::Double(d)))
            .ok_or_else(|| {
                CoreError::evaluation("FORG0001", format!("cannot cast '{s}' to xs:double"))
            }),
        Some(other) => Err(CoreError::evaluation(
            "XPTY0004",
            format!("{what} expects a number, got {}", other.type_name()),
        )),
    }
}

fn double_arg(items: &[Item], what: &str) -> CoreResult<f64> {
    Ok(number_arg(items, what)?
        .and_then(|a| a.as_double())
        .unwrap_or(f64::NAN))
}

/// Numeric values for aggregation; untyped values are cast to doubles.
fn numeric_values(items: &[Item], what: &str) -> CoreResult<Vec<Atomic>> {
    atomize(items)
        .into_iter()
        .map(|value| match value {
            Atomic::Untyped(s) => parse_double(s.trim()).map(Atomic::Double).ok_or_else(|| {
                CoreError::evaluation("FORG0001", format!("cannot cast '{s}' to xs:double"))
            }),
            v if v.is_numeric() => Ok(v),
            other => Err(CoreError::evaluation(
                "FORG0006",
                format!("{what} is not defined for {}", other.type_name()),
            )),
        })
        .collect()
}

/// Positions selected by `substring` and `subsequence` (1-based, rounded).
fn in_window(position: usize, start: f64, length: Option<f64>) -> bool {
    let p = position as f64;
    let first = round_half_up(start);
    match length {
        Some(length) => p >= first && p < first + round_half_up(length),
        None => p >= first,
    }
}

fn round_half_up(value: f64) -> f64 {
    (value + 0.5).floor()
}

// ---- fn: -----------------------------------------------------------------------

fn fn_count(_: &mut Evaluator<'_>, mut args: Vec<Sequence>) -> CoreResult<Sequence> {
    Ok(vec![integer(take(&mut args).len() as i64)])
}

fn fn_position(ev: &mut Evaluator<'_>, _: Vec<Sequence>) -> CoreResult<Sequence> {
    Ok(vec![integer(ev.position()? as i64)])
}

fn fn_last(ev: &mut Evaluator<'_>, _: Vec<Sequence>) -> CoreResult<Sequence> {
    Ok(vec![integer(ev.last()? as i64)])
}

fn fn_doc(ev: &mut Evaluator<'_>, mut args: Vec<Sequence>) -> CoreResult<Sequence> {
    let uri = take(&mut args);
    if uri.is_empty() {
        return Ok(Vec::new());
    }
    let uri = string_arg(&uri, "fn:doc")?;
    let not_found = || CoreError::evaluation("FODC0002", format!("document '{uri}' not found"));
    let (collection, name) = split_document_path(&uri).map_err(|_| not_found())?;
    match ev.view().document(&document_path(&collection, &name)) {
        Some(doc) => Ok(vec![Item::Node(doc.root())]),
        None => Err(not_found()),
    }
}

fn fn_collection(ev: &mut Evaluator<'_>, mut args: Vec<Sequence>) -> CoreResult<Sequence> {
    let uri = if args.is_empty() {
        crate::store::ROOT_COLLECTION.to_string()
    } else {
        string_arg(&take(&mut args), "fn:collection")?
    };
    let not_found = || CoreError::evaluation("FODC0002", format!("collection '{uri}' not found"));
    let path = normalize_path(&uri).map_err(|_| not_found())?;
    let view = ev.view();
    if view.collection(&path).is_none() {
        return Err(not_found());
    }
    let mut roots: Vec<NodeRef> = view.documents_under(&path).map(|d| d.root()).collect();
    roots.sort();
    Ok(roots.into_iter().map(Item::Node).collect())
}

fn fn_string(ev: &mut Evaluator<'_>, args: Vec<Sequence>) -> CoreResult<Sequence> {
    Ok(vec![string(string_or_context(ev, args, "fn:string")?)])
}

fn fn_data(_: &mut Evaluator<'_>, mut args: Vec<Sequence>) -> CoreResult<Sequence> {
    Ok(atomize(&take(&mut args)).into_iter().map(Item::Atomic).collect())
}

fn fn_number(ev: &mut Evaluator<'_>, mut args: Vec<Sequence>) -> CoreResult<Sequence> {
    let value = if args.is_empty() {
        Some(ev.context_item()?.atomize())
    } else {
        atomize_optional(&take(&mut args), "fn:number")?
    };
    let number = value.and_then(|a| a.as_double()).unwrap_or(f64::NAN);
    Ok(vec![double(number)])
}

fn fn_sum(_: &mut Evaluator<'_>, mut args: Vec<Sequence>) -> CoreResult<Sequence> {
    let values = numeric_values(&take(&mut args), "fn:sum")?;
    let Some((first, rest)) = values.split_first() else {
        return Ok(if args.is_empty() {
            vec![integer(0)]
        } else {
            take(&mut args)
        });
    };
    let mut total = first.clone();
    for value in rest {
        total = arithmetic(ArithOp::Add, total, value.clone())?;
    }
    Ok(vec![Item::Atomic(total)])
}

fn fn_avg(_: &mut Evaluator<'_>, mut args: Vec<Sequence>) -> CoreResult<Sequence> {
    let values = numeric_values(&take(&mut args), "fn:avg")?;
    if values.is_empty() {
        return Ok(Vec::new());
    }
    let count = values.len() as f64;
    let total: f64 = values.iter().filter_map(Atomic::as_double).sum();
    Ok(vec![double(total / count)])
}

fn extreme(args: &mut Vec<Sequence>, what: &str, wanted: Ordering) -> CoreResult<Sequence> {
    let values: Vec<Atomic> = atomize(&take(args))
        .into_iter()
        .map(|value| match value {
            Atomic::Untyped(s) => parse_double(s.trim()).map(Atomic::Double).ok_or_else(|| {
                CoreError::evaluation("FORG0001", format!("cannot cast '{s}' to xs:double"))
            }),
            other => Ok(other),
        })
        .collect::<CoreResult<_>>()?;
    let mut best: Option<Atomic> = None;
    for value in values {
        if value.as_double().is_some_and(f64::is_nan) && value.is_numeric() {
            return Ok(vec![double(f64::NAN)]);
        }
        best = match best {
            None => Some(value),
            Some(current) => {
                if order_compare(&value, &current).map_err(|_| {
                    CoreError::evaluation("FORG0006", format!("{what}: values are not comparable"))
                })? == wanted
                {
                    Some(value)
                } else {
                    Some(current)
                }
            }
        };
    }
    Ok(best.map(Item::Atomic).into_iter().collect())
}

fn fn_min(_: &mut Evaluator<'_>, mut args: Vec<Sequence>) -> CoreResult<Sequence> {
    extreme(&mut args, "fn:min", Ordering::Less)
}

fn fn_max(_: &mut Evaluator<'_>, mut args: Vec<Sequence>) -> CoreResult<Sequence> {
    extreme(&mut args, "fn:max", Ordering::Greater)
}

fn fn_empty(_: &mut Evaluator<'_>, mut args: Vec<Sequence>) -> CoreResult<Sequence> {
    Ok(vec![boolean(take(&mut args).is_empty())])
}

fn fn_exists(_: &mut Evaluator<'_>, mut args: Vec<Sequence>) -> CoreResult<Sequence> {
    Ok(vec![boolean(!take(&mut args).is_empty())])
}

fn fn_not(_: &mut Evaluator<'_>, mut args: Vec<Sequence>) -> CoreResult<Sequence> {
    Ok(vec![boolean(!effective_boolean(&take(&mut args))?)])
}

fn fn_boolean(_: &mut Evaluator<'_>, mut args: Vec<Sequence>) -> CoreResult<Sequence> {
    Ok(vec![boolean(effective_boolean(&take(&mut args))?)])
}

fn fn_true(_: &mut Evaluator<'_>, _: Vec<Sequence>) -> CoreResult<Sequence> {
    Ok(vec![boolean(true)])
}

fn fn_false(_: &mut Evaluator<'_>, _: Vec<Sequence>) -> CoreResult<Sequence> {
    Ok(vec![boolean(false)])
}

fn fn_concat(_: &mut Evaluator<'_>, args: Vec<Sequence>) -> CoreResult<Sequence> {
    let mut out = String::new();
    for arg in &args {
        out.push_str(&string_arg(arg, "fn:concat")?);
    }
    Ok(vec![string(out)])
}

fn fn_string_join(_: &mut Evaluator<'_>, mut args: Vec<Sequence>) -> CoreResult<Sequence> {
    let parts: Vec<String> = take(&mut args).iter().map(Item::string_value).collect();
    let separator = string_arg(&take(&mut args), "fn:string-join")?;
    Ok(vec![string(parts.join(&separator))])
}

fn fn_string_length(ev: &mut Evaluator<'_>, args: Vec<Sequence>) -> CoreResult<Sequence> {
    let text = string_or_context(ev, args, "fn:string-length")?;
    Ok(vec![integer(text.chars().count() as i64)])
}

fn two_strings(args: &mut Vec<Sequence>, what: &str) -> CoreResult<(String, String)> {
    let a = string_arg(&take(args), what)?;
    let b = string_arg(&take(args), what)?;
    Ok((a, b))
}

fn fn_contains(_: &mut Evaluator<'_>, mut args: Vec<Sequence>) -> CoreResult<Sequence> {
    let (a, b) = two_strings(&mut args, "fn:contains")?;
    Ok(vec![boolean(a.contains(&b))])
}

fn fn_starts_with(_: &mut Evaluator<'_>, mut args: Vec<Sequence>) -> CoreResult<Sequence> {
    let (a, b) = two_strings(&mut args, "fn:starts-with")?;
    Ok(vec![boolean(a.starts_with(&b))])
}

fn fn_ends_with(_: &mut Evaluator<'_>, mut args: Vec<Sequence>) -> CoreResult<Sequence> {
    let (a, b) = two_strings(&mut args, "fn:ends-with")?;
    Ok(vec![boolean(a.ends_with(&b))])
}

fn fn_substring(_: &mut Evaluator<'_>, mut args: Vec<Sequence>) -> CoreResult<Sequence> {
    let text = string_arg(&take(&mut args), "fn:substring")?;
    let start = double_arg(&take(&mut args), "fn:substring")?;
    let length = if args.is_empty() {
        None
    } else {
        Some(double_arg(&take(&mut args), "fn:substring")?)
    };
    let out: String = text
        .chars()
        .enumerate()
        .filter(|(i, _)| in_window(i + 1, start, length))
        .map(|(_, c)| c)
        .collect();
    Ok(vec![string(out)])
}

fn fn_upper_case(_: &mut Evaluator<'_>, mut args: Vec<Sequence>) -> CoreResult<Sequence> {
    Ok(vec![string(string_arg(&take(&mut args), "fn:upper-case")?.to_uppercase())])
}

fn fn_lower_case(_: &mut Evaluator<'_>, mut args: Vec<Sequence>) -> CoreResult<Sequence> {
    Ok(vec![string(string_arg(&take(&mut args), "fn:lower-case")?.to_lowercase())])
}

fn fn_normalize_space(ev: &mut Evaluator<'_>, args: Vec<Sequence>) -> CoreResult<Sequence> {
    let text = string_or_context(ev, args, "fn:normalize-space")?;
    Ok(vec![string(text.split_whitespace().collect::<Vec<_>>().join(" "))])
}

fn fn_name(ev: &mut Evaluator<'_>, args: Vec<Sequence>) -> CoreResult<Sequence> {
    let node = node_or_context(ev, args, "fn:name")?;
    let name = node
        .filter(|n| n.kind() != NodeKind::Document)
        .and_then(|n| n.name().map(QName::lexical))
        .unwrap_or_default();
    Ok(vec![string(name)])
}

fn fn_local_name(ev: &mut Evaluator<'_>, args: Vec<Sequence>) -> CoreResult<Sequence> {
    let node = node_or_context(ev, args, "fn:local-name")?;
    let name = node
        .and_then(|n| n.name().map(|q| q.local.clone()))
        .unwrap_or_default();
    Ok(vec![string(name)])
}

fn fn_namespace_uri(ev: &mut Evaluator<'_>, args: Vec<Sequence>) -> CoreResult<Sequence> {
    let node = node_or_context(ev, args, "fn:namespace-uri")?;
    let uri = node
        .filter(|n| matches!(n.kind(), NodeKind::Element | NodeKind::Attribute))
        .and_then(|n| n.name().map(|q| q.namespace_uri().to_string()))
        .unwrap_or_default();
    Ok(vec![string(uri)])
}

fn fn_root(ev: &mut Evaluator<'_>, args: Vec<Sequence>) -> CoreResult<Sequence> {
    let node = node_or_context(ev, args, "fn:root")?;
    Ok(node.map(|n| Item::Node(n.root())).into_iter().collect())
}

fn fn_reverse(_: &mut Evaluator<'_>, mut args: Vec<Sequence>) -> CoreResult<Sequence> {
    let mut items = take(&mut args);
    items.reverse();
    Ok(items)
}

fn fn_distinct_values(_: &mut Evaluator<'_>, mut args: Vec<Sequence>) -> CoreResult<Sequence> {
    let mut seen = HashSet::new();
    Ok(atomize(&take(&mut args))
        .into_iter()
        .filter(|a| seen.insert(a.key()))
        .map(Item::Atomic)
        .collect())
}

fn fn_subsequence(_: &mut Evaluator<'_>, mut args: Vec<Sequence>) -> CoreResult<Sequence> {
    let items = take(&mut args);
    let start = double_arg(&take(&mut args), "fn:subsequence")?;
    let length = if args.is_empty() {
        None
    } else {
        Some(double_arg(&take(&mut args), "fn:subsequence")?)
    };
    Ok(items
        .into_iter()
        .enumerate()
        .filter(|(i, _)| in_window(i + 1, start, length))
        .map(|(_, item)| item)
        .collect())
}

fn fn_index_of(_: &mut Evaluator<'_>, mut args: Vec<Sequence>) -> CoreResult<Sequence> {
    let items = atomize(&take(&mut args));
    let Some(search) = atomize_optional(&take(&mut args), "fn:index-of")? else {
        return Ok(Vec::new());
    };
    let key = search.key();
    Ok(items
        .iter()
        .enumerate()
        .filter(|(_, a)| a.key() == key)
        .map(|(i, _)| integer(i as i64 + 1))
        .collect())
}

fn rounding(args: &mut Vec<Sequence>, what: &str, op: fn(f64) -> f64) -> CoreResult<Sequence> {
    Ok(match number_arg(&take(args), what)? {
        None => Vec::new(),
        Some(Atomic::Integer(i)) => vec![integer(i)],
        Some(value) => vec![double(op(value.as_double().unwrap_or(f64::NAN)))],
    })
}

fn fn_abs(_: &mut Evaluator<'_>, mut args: Vec<Sequence>) -> CoreResult<Sequence> {
    Ok(match number_arg(&take(&mut args), "fn:abs")? {
        None => Vec::new(),
        Some(Atomic::Integer(i)) => vec![integer(
            i.checked_abs()
                .ok_or_else(|| CoreError::evaluation("FOAR0002", "integer overflow"))?,
        )],
        Some(value) => vec![double(value.as_double().unwrap_or(f64::NAN).abs())],
    })
}

fn fn_floor(_: &mut Evaluator<'_>, mut args: Vec<Sequence>) -> CoreResult<Sequence> {
    rounding(&mut args, "fn:floor", f64::floor)
}

fn fn_ceiling(_: &mut Evaluator<'_>, mut args: Vec<Sequence>) -> CoreResult<Sequence> {
    rounding(&mut args, "fn:ceiling", f64::ceil)
}

fn fn_round(_: &mut Evaluator<'_>, mut args: Vec<Sequence>) -> CoreResult<Sequence> {
    rounding(&mut args, "fn:round", round_half_up)
}

fn fn_error(_: &mut Evaluator<'_>, mut args: Vec<Sequence>) -> CoreResult<Sequence> {
    let code = string_arg(&take(&mut args), "fn:error")?;
    let code = match code.rsplit_once(':') {
        Some((_, local)) => local.to_string(),
        None if code.is_empty() => "FOER0000".to_string(),
        None => code,
    };
    let message = string_arg(&take(&mut args), "fn:error")?;
    let message = if message.is_empty() {
        "error raised by query".to_string()
    } else {
        message
    };
    Err(CoreError::evaluation(&code, message))
}

// ---- xs: -----------------------------------------------------------------------

fn cast_error(value: &Atomic, target: &str) -> CoreError {
    CoreError::evaluation("FORG0001", format!("cannot cast '{value}' to {target}"))
}

fn xs_string(_: &mut Evaluator<'_>, mut args: Vec<Sequence>) -> CoreResult<Sequence> {
    Ok(atomize_optional(&take(&mut args), "xs:string")?
        .map(|a| string(a.to_string()))
        .into_iter()
        .collect())
}

fn xs_integer(_: &mut Evaluator<'_>, mut args: Vec<Sequence>) -> CoreResult<Sequence> {
    let Some(value) = atomize_optional(&take(&mut args), "xs:integer")? else {
        return Ok(Vec::new());
    };
    let result = match &value {
        Atomic::Integer(i) => *i,
        Atomic::Boolean(b) => i64::from(*b),
        Atomic::Double(d) if d.is_finite() && d.abs() < i64::MAX as f64 => d.trunc() as i64,
        Atomic::Double(_) => {
            let message = format!("cannot cast {value} to xs:integer");
            return Err(CoreError::evaluation("FOCA0002", message));
        }
        Atomic::String(s) | Atomic::Untyped(s) => {
            s.trim().parse().map_err(|_| cast_error(&value, "xs:integer"))?
        }
    };
    Ok(vec![integer(result)])
}

fn xs_double(_: &mut Evaluator<'_>, mut args: Vec<Sequence>) -> CoreResult<Sequence> {
    let Some(value) = atomize_optional(&take(&mut args), "xs:double")? else {
        return Ok(Vec::new());
    };
    let result = match &value {
        Atomic::String(s) | Atomic::Untyped(s) => {
            parse_double(s.trim()).ok_or_else(|| cast_error(&value, "xs:double"))?
        }
        other => other.as_double().unwrap_or(f64::NAN),
    };
    Ok(vec![double(result)])
}

fn xs_boolean(_: &mut Evaluator<'_>, mut args: Vec<Sequence>) -> CoreResult<Sequence> {
    let Some(value) = atomize_optional(&take(&mut args), "xs:boolean")? else {
        return Ok(Vec::new());
    };
    let result = match &value {
        Atomic::Boolean(b) => *b,
        Atomic::Integer(i) => *i != 0,
        Atomic::Double(d) => *d != 0.0 && !d.is_nan(),
        Atomic::String(s) | Atomic::Untyped(s) => match s.trim() {
            "true" | "1" => true,
            "false" | "0" => false,
            _ => return Err(cast_error(&value, "xs:boolean")),
        },
    };
    Ok(vec![boolean(result)])
}

// ---- util: ---------------------------------------------------------------------

fn util_counter_next(ev: &mut Evaluator<'_>, mut args: Vec<Sequence>) -> CoreResult<Sequence> {
    let name = string_arg(&take(&mut args), "util:counter-next")?;
    Ok(vec![integer(ev.next_counter(&name))])
}

fn util_document_name(ev: &mut Evaluator<'_>, mut args: Vec<Sequence>) -> CoreResult<Sequence> {
    let node = node_arg(&take(&mut args), "util:document-name")?;
    Ok(node
        .and_then(|n| n.document_id())
        .and_then(|id| ev.view().document_by_id(id))
        .map(|doc| string(doc.name.clone()))
        .into_iter()
        .collect())
}
