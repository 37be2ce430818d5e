//! Tree-walking evaluator for compiled programs.

use super::ast::{
    Axis, CallTarget, Clause, Content, Expr, Flwor, FunctionDecl, KindTest, NameExpr,
    NodeComparison, NodeTest, OrderSpec, SetOp, Step,
};
use super::functions::BUILTINS;
use super::item::{
    arithmetic, atomize, atomize_optional, effective_boolean, general_compare_pair, order_compare,
    value_compare, ArithOp, Atomic, Comparison, Item, Sequence,
};
use crate::dom::{NodeKind, NodeRef, QName, TreeBuilder};
use crate::error::{CoreError, CoreResult};
use crate::index::{IndexTarget, ValueType};
use crate::store::StoreState;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::trace;

/// A resolved program, shared by every execution of a compiled query.
#[derive(Debug)]
pub(crate) struct Program {
    pub functions: Vec<FunctionDecl>,
    pub body: Expr,
    pub externals: Vec<QName>,
    pub namespaces: Vec<(String, String)>,
    pub max_call_depth: usize,
}

/// State private to one execution.
#[derive(Debug, Default)]
pub(crate) struct ExecutionState {
    counters: HashMap<String, i64>,
    depth: usize,
}

impl ExecutionState {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

struct Focus {
    item: Item,
    position: usize,
    size: usize,
}

struct Tuple {
    keys: Vec<Option<Atomic>>,
    result: Sequence,
}

pub(crate) struct Evaluator<'a> {
    program: &'a Program,
    globals: &'a [(QName, Sequence)],
    externals: &'a HashMap<QName, Sequence>,
    view: &'a StoreState,
    state: &'a mut ExecutionState,
    locals: Vec<(QName, Sequence)>,
    focus: Option<Focus>,
}

impl<'a> Evaluator<'a> {
    pub(crate) fn new(
        program: &'a Program,
        globals: &'a [(QName, Sequence)],
        externals: &'a HashMap<QName, Sequence>,
        view: &'a StoreState,
        state: &'a mut ExecutionState,
    ) -> Self {
        Self {
            program,
            globals,
            externals,
            view,
            state,
            locals: Vec::new(),
            focus: None,
        }
    }

    /// Sets the initial context item.
    pub(crate) fn with_context_item(mut self, item: Option<Item>) -> Self {
        self.focus = item.map(|item| Focus {
            item,
            position: 1,
            size: 1,
        });
        self
    }

    pub(crate) fn view(&self) -> &'a StoreState {
        self.view
    }

    pub(crate) fn context_item(&self) -> CoreResult<&Item> {
        self.focus
            .as_ref()
            .map(|f| &f.item)
            .ok_or_else(|| CoreError::evaluation("XPDY0002", "the context item is undefined"))
    }

    pub(crate) fn position(&self) -> CoreResult<usize> {
        self.focus
            .as_ref()
            .map(|f| f.position)
            .ok_or_else(|| CoreError::evaluation("XPDY0002", "the context position is undefined"))
    }

    pub(crate) fn last(&self) -> CoreResult<usize> {
        self.focus
            .as_ref()
            .map(|f| f.size)
            .ok_or_else(|| CoreError::evaluation("XPDY0002", "the context size is undefined"))
    }

    /// Returns the next value of a named counter, starting at 1 in every
    /// execution.
    pub(crate) fn next_counter(&mut self, name: &str) -> i64 {
        let counter = self.state.counters.entry(name.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    fn with_focus<T>(
        &mut self,
        item: Item,
        position: usize,
        size: usize,
        f: impl FnOnce(&mut Self) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let saved = self.focus.replace(Focus {
            item,
            position,
            size,
        });
        let result = f(self);
        self.focus = saved;
        result
    }

    fn with_local<T>(
        &mut self,
        name: &QName,
        value: Sequence,
        f: impl FnOnce(&mut Self) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let mark = self.locals.len();
        self.locals.push((name.clone(), value));
        let result = f(self);
        self.locals.truncate(mark);
        result
    }

    fn variable(&self, name: &QName) -> CoreResult<Sequence> {
        if let Some((_, value)) = self.locals.iter().rev().find(|(n, _)| n == name) {
            return Ok(value.clone());
        }
        if let Some((_, value)) = self.globals.iter().find(|(n, _)| n == name) {
            return Ok(value.clone());
        }
        self.externals.get(name).cloned().ok_or_else(|| {
            CoreError::evaluation(
                "XPDY0002",
                format!("variable ${} has no value", name.lexical()),
            )
        })
    }

    fn context_node(&self, code: &str) -> CoreResult<NodeRef> {
        match self.context_item()? {
            Item::Node(node) => Ok(node.clone()),
            Item::Atomic(a) => Err(CoreError::evaluation(
                code,
                format!("the context item is a {}, not a node", a.type_name()),
            )),
        }
    }

    pub(crate) fn eval(&mut self, expr: &Expr) -> CoreResult<Sequence> {
        match expr {
            Expr::Literal(value) => Ok(vec![Item::Atomic(value.clone())]),
            Expr::Sequence(parts) => {
                let mut out = Vec::new();
                for part in parts {
                    out.extend(self.eval(part)?);
                }
                Ok(out)
            }
            Expr::Range(from, to) => self.range(from, to),
            Expr::Variable(name) => self.variable(name),
            Expr::ContextItem => Ok(vec![self.context_item()?.clone()]),
            Expr::Root => {
                let root = self.context_node("XPDY0050")?.root();
                if root.kind() != NodeKind::Document {
                    return Err(CoreError::evaluation(
                        "XPDY0050",
                        "the root of the context node is not a document node",
                    ));
                }
                Ok(vec![Item::Node(root)])
            }
            Expr::Path(lhs, rhs) => self.path(lhs, rhs),
            Expr::Step(step) => {
                let node = self.context_node("XPTY0020")?;
                let nodes = self.step(&node, step)?;
                Ok(document_order(nodes).into_iter().map(Item::Node).collect())
            }
            Expr::Filter(base, predicates) => {
                let mut items = self.eval(base)?;
                for predicate in predicates {
                    items = self.apply_predicate(items, predicate)?;
                }
                Ok(items)
            }
            Expr::Call { name, args, target } => self.call(name, args, target),
            Expr::Arithmetic(op, left, right) => {
                let (Some(left), Some(right)) = (self.operand(left)?, self.operand(right)?) else {
                    return Ok(Vec::new());
                };
                Ok(vec![Item::Atomic(arithmetic(*op, left, right)?)])
            }
            Expr::Negate(operand) => match self.operand(operand)? {
                Some(value) => Ok(vec![Item::Atomic(arithmetic(
                    ArithOp::Mul,
                    value,
                    Atomic::Integer(-1),
                )?)]),
                None => Ok(Vec::new()),
            },
            Expr::ValueCompare(op, left, right) => {
                let (Some(left), Some(right)) = (self.operand(left)?, self.operand(right)?) else {
                    return Ok(Vec::new());
                };
                Ok(vec![boolean(value_compare(*op, &left, &right)?)])
            }
            Expr::GeneralCompare(op, left, right) => {
                let left = atomize(&self.eval(left)?);
                let right = atomize(&self.eval(right)?);
                Ok(vec![boolean(general_compare(*op, &left, &right)?)])
            }
            Expr::NodeCompare(op, left, right) => self.node_compare(*op, left, right),
            Expr::And(left, right) => {
                let result = effective_boolean(&self.eval(left)?)?
                    && effective_boolean(&self.eval(right)?)?;
                Ok(vec![boolean(result)])
            }
            Expr::Or(left, right) => {
                let result = effective_boolean(&self.eval(left)?)?
                    || effective_boolean(&self.eval(right)?)?;
                Ok(vec![boolean(result)])
            }
            Expr::SetOp(op, left, right) => self.set_op(*op, left, right),
            Expr::If(condition, then, otherwise) => {
                if effective_boolean(&self.eval(condition)?)? {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
            Expr::Quantified {
                every,
                bindings,
                condition,
            } => Ok(vec![boolean(self.quantify(*every, bindings, condition)?)]),
            Expr::Flwor(flwor) => self.flwor(flwor),
            Expr::Element {
                name,
                attributes,
                content,
            } => self.construct_element(name, attributes, content),
            Expr::Attribute(name, value) => {
                let name = self.constructed_name(name, false)?;
                let value = self.content_string(value)?;
                let mut builder = TreeBuilder::fragment();
                builder.attribute(name, value)?;
                finish(builder)
            }
            Expr::Text(value) => {
                let items = self.eval(value)?;
                let text = join_atomics(&items);
                if text.is_empty() {
                    return Ok(Vec::new());
                }
                let mut builder = TreeBuilder::fragment();
                builder.text(&text)?;
                finish(builder)
            }
            Expr::Comment(value) => {
                let text = self.content_string(value)?;
                let mut builder = TreeBuilder::fragment();
                builder.comment(&text)?;
                finish(builder)
            }
            Expr::ProcessingInstruction(name, value) => {
                let target = self.constructed_name(name, false)?;
                let data = self.content_string(value)?;
                let mut builder = TreeBuilder::fragment();
                builder.processing_instruction(&target.local, data.trim_start())?;
                finish(builder)
            }
            Expr::Document(content) => {
                let items = self.eval(content)?;
                let mut builder = TreeBuilder::document();
                add_items(&mut builder, items)?;
                finish(builder)
            }
        }
    }

    /// Atomizes an operand that must be empty or a single value.
    fn operand(&mut self, expr: &Expr) -> CoreResult<Option<Atomic>> {
        let items = self.eval(expr)?;
        atomize_optional(&items, "operand")
    }

    fn range(&mut self, from: &Expr, to: &Expr) -> CoreResult<Sequence> {
        let (Some(from), Some(to)) = (self.operand(from)?, self.operand(to)?) else {
            return Ok(Vec::new());
        };
        let (from, to) = (range_bound(&from)?, range_bound(&to)?);
        Ok((from..=to).map(|i| Item::Atomic(Atomic::Integer(i))).collect())
    }

    // ---- paths ----------------------------------------------------------------

    fn path(&mut self, lhs: &Expr, rhs: &Expr) -> CoreResult<Sequence> {
        if let Some(result) = self.indexed_path(lhs, rhs)? {
            return Ok(result);
        }
        let context = self.eval(lhs)?;
        self.path_from(context, rhs)
    }

    fn path_from(&mut self, context: Sequence, rhs: &Expr) -> CoreResult<Sequence> {
        let size = context.len();
        let mut out = Vec::new();
        for (i, item) in context.into_iter().enumerate() {
            if let Item::Atomic(a) = &item {
                return Err(CoreError::evaluation(
                    "XPTY0019",
                    format!("a path step was applied to a {}", a.type_name()),
                ));
            }
            out.extend(self.with_focus(item, i + 1, size, |ev| ev.eval(rhs))?);
        }

        let nodes = out.iter().filter(|i| i.as_node().is_some()).count();
        if nodes == out.len() {
            let nodes = out.into_iter().filter_map(|i| match i {
                Item::Node(n) => Some(n),
                Item::Atomic(_) => None,
            });
            Ok(document_order(nodes.collect()).into_iter().map(Item::Node).collect())
        } else if nodes == 0 {
            Ok(out)
        } else {
            Err(CoreError::evaluation(
                "XPTY0018",
                "the last step of a path mixes nodes and atomic values",
            ))
        }
    }

    /// Nodes selected by one step from `node`, in axis order.
    fn step(&mut self, node: &NodeRef, step: &Step) -> CoreResult<Vec<NodeRef>> {
        let principal = step.axis.principal_kind();
        let mut items: Sequence = step
            .axis
            .select(node)
            .into_iter()
            .filter(|n| step.test.matches(n, principal))
            .map(Item::Node)
            .collect();
        for predicate in &step.predicates {
            items = self.apply_predicate(items, predicate)?;
        }
        Ok(items
            .into_iter()
            .filter_map(|i| match i {
                Item::Node(n) => Some(n),
                Item::Atomic(_) => None,
            })
            .collect())
    }

    fn apply_predicate(&mut self, items: Sequence, predicate: &Expr) -> CoreResult<Sequence> {
        let size = items.len();
        let mut kept = Vec::new();
        for (i, item) in items.into_iter().enumerate() {
            let position = i + 1;
            let value = self.with_focus(item.clone(), position, size, |ev| ev.eval(predicate))?;
            let keep = match value.as_slice() {
                [Item::Atomic(a)] if a.is_numeric() => a.as_double() == Some(position as f64),
                _ => effective_boolean(&value)?,
            };
            if keep {
                kept.push(item);
            }
        }
        Ok(kept)
    }

    /// Answers `ctx//name[. = literal]` and `ctx//name[@attr = literal]`
    /// from the value index when every context node is a stored node whose
    /// collection declares a matching index. Returns `None` to fall back to
    /// a scan.
    fn indexed_path(&mut self, lhs: &Expr, rhs: &Expr) -> CoreResult<Option<Sequence>> {
        let Expr::Step(step) = rhs else {
            return Ok(None);
        };
        let [predicate] = step.predicates.as_slice() else {
            return Ok(None);
        };
        let NodeTest::Name(name) = &step.test else {
            return Ok(None);
        };
        let (context_expr, through) = match (step.axis, lhs) {
            (Axis::Descendant, _) => (lhs, None),
            (Axis::Child, Expr::Path(inner, dos)) if is_descendant_or_self_node(dos) => {
                (inner.as_ref(), Some(dos.as_ref()))
            }
            _ => return Ok(None),
        };
        let Some((target, wanted, literal)) = indexable_predicate(name, predicate) else {
            return Ok(None);
        };

        let context = self.eval(context_expr)?;
        if let Some(hits) = self.index_lookup(&context, &target, wanted, literal, name)? {
            return Ok(Some(hits));
        }
        let context = match through {
            Some(dos) => self.path_from(context, dos)?,
            None => context,
        };
        self.path_from(context, rhs).map(Some)
    }

    fn index_lookup(
        &self,
        context: &[Item],
        target: &IndexTarget,
        wanted: ValueType,
        literal: &Atomic,
        name: &QName,
    ) -> CoreResult<Option<Sequence>> {
        let view = self.view;
        let mut covered: HashMap<&str, bool> = HashMap::new();
        let mut anchors = HashSet::new();
        for item in context {
            let Item::Node(node) = item else {
                return Ok(None);
            };
            let Some(doc) = node.document_id().and_then(|id| view.document_by_id(id)) else {
                return Ok(None);
            };
            if !Arc::ptr_eq(&doc.tree, node.tree()) {
                return Ok(None);
            }
            let declared = *covered.entry(doc.collection.as_str()).or_insert_with(|| {
                view.declarations_for(&doc.collection)
                    .iter()
                    .any(|d| &d.target == target && d.value_type == wanted)
            });
            if !declared {
                return Ok(None);
            }
            anchors.insert(node.clone());
        }

        let mut hits = Vec::new();
        for node in view.index_lookup(target, &literal.to_typed())? {
            let element = match target {
                IndexTarget::Element(_) => node,
                IndexTarget::Attribute(_) => match node.parent() {
                    Some(p) if p.kind() == NodeKind::Element && p.name() == Some(name) => p,
                    _ => continue,
                },
            };
            if element.ancestors(false).iter().any(|a| anchors.contains(a)) {
                hits.push(element);
            }
        }
        let hits = document_order(hits);
        trace!(%target, hits = hits.len(), "path answered from value index");
        Ok(Some(hits.into_iter().map(Item::Node).collect()))
    }

    // ---- operators --------------------------------------------------------------

    fn single_node(&mut self, expr: &Expr) -> CoreResult<Option<NodeRef>> {
        let items = self.eval(expr)?;
        match items.as_slice() {
            [] => Ok(None),
            [Item::Node(node)] => Ok(Some(node.clone())),
            _ => Err(CoreError::evaluation(
                "XPTY0004",
                "a node comparison operand must be a single node",
            )),
        }
    }

    fn node_compare(
        &mut self,
        op: NodeComparison,
        left: &Expr,
        right: &Expr,
    ) -> CoreResult<Sequence> {
        let (Some(left), Some(right)) = (self.single_node(left)?, self.single_node(right)?) else {
            return Ok(Vec::new());
        };
        let result = match op {
            NodeComparison::Is => left == right,
            NodeComparison::Precedes => left < right,
            NodeComparison::Follows => left > right,
        };
        Ok(vec![boolean(result)])
    }

    fn nodes_of(&mut self, expr: &Expr) -> CoreResult<Vec<NodeRef>> {
        self.eval(expr)?
            .into_iter()
            .map(|item| match item {
                Item::Node(node) => Ok(node),
                Item::Atomic(a) => Err(CoreError::evaluation(
                    "XPTY0004",
                    format!("set operators take nodes, got {}", a.type_name()),
                )),
            })
            .collect()
    }

    fn set_op(&mut self, op: SetOp, left: &Expr, right: &Expr) -> CoreResult<Sequence> {
        let mut left = self.nodes_of(left)?;
        let right = self.nodes_of(right)?;
        let nodes = match op {
            SetOp::Union => {
                left.extend(right);
                left
            }
            SetOp::Intersect | SetOp::Except => {
                let right: HashSet<NodeRef> = right.into_iter().collect();
                let keep = op == SetOp::Intersect;
                left.into_iter().filter(|n| right.contains(n) == keep).collect()
            }
        };
        Ok(document_order(nodes).into_iter().map(Item::Node).collect())
    }

    // ---- calls -----------------------------------------------------------------

    fn call(&mut self, name: &QName, args: &[Expr], target: &CallTarget) -> CoreResult<Sequence> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg)?);
        }
        match target {
            CallTarget::Builtin(index) => {
                let builtin = BUILTINS
                    .get(*index)
                    .ok_or_else(|| unknown_function(name, args.len()))?;
                (builtin.call)(self, values)
            }
            CallTarget::User(index) => self.call_user(*index, values),
            CallTarget::Host(binding) => binding.call(&name.local, &values),
            CallTarget::Extension(function) => function.call(&values),
            CallTarget::Unresolved => Err(unknown_function(name, args.len())),
        }
    }

    fn call_user(&mut self, index: usize, args: Vec<Sequence>) -> CoreResult<Sequence> {
        let program = self.program;
        let Some(function) = program.functions.get(index) else {
            return Err(CoreError::evaluation("XPST0017", "unresolved user function"));
        };
        if self.state.depth >= program.max_call_depth {
            return Err(CoreError::evaluation(
                "XPDY0130",
                format!(
                    "call depth limit of {} exceeded in {}()",
                    program.max_call_depth,
                    function.name.lexical()
                ),
            ));
        }

        let params = function.params.iter().cloned().zip(args).collect();
        let saved_locals = std::mem::replace(&mut self.locals, params);
        let saved_focus = self.focus.take();
        self.state.depth += 1;
        let result = self.eval(&function.body);
        self.state.depth -= 1;
        self.focus = saved_focus;
        self.locals = saved_locals;
        result
    }

    // ---- FLWOR and quantifiers -------------------------------------------------

    fn flwor(&mut self, flwor: &Flwor) -> CoreResult<Sequence> {
        let mut tuples = Vec::new();
        self.bind_clauses(flwor, 0, &mut tuples)?;

        if !flwor.order.is_empty() {
            let mut failure = None;
            tuples.sort_by(|a, b| match compare_keys(&flwor.order, &a.keys, &b.keys) {
                Ok(ordering) => ordering,
                Err(e) => {
                    failure.get_or_insert(e);
                    Ordering::Equal
                }
            });
            if let Some(e) = failure {
                return Err(e);
            }
        }
        Ok(tuples.into_iter().flat_map(|t| t.result).collect())
    }

    fn bind_clauses(
        &mut self,
        flwor: &Flwor,
        index: usize,
        out: &mut Vec<Tuple>,
    ) -> CoreResult<()> {
        let Some(clause) = flwor.clauses.get(index) else {
            if let Some(condition) = &flwor.condition {
                if !effective_boolean(&self.eval(condition)?)? {
                    return Ok(());
                }
            }
            let mut keys = Vec::with_capacity(flwor.order.len());
            for spec in &flwor.order {
                let value = self.eval(&spec.key)?;
                keys.push(atomize_optional(&value, "order by key")?);
            }
            let result = self.eval(&flwor.body)?;
            out.push(Tuple { keys, result });
            return Ok(());
        };

        match clause {
            Clause::For {
                var,
                position,
                source,
            } => {
                let items = self.eval(source)?;
                for (i, item) in items.into_iter().enumerate() {
                    self.with_local(var, vec![item], |ev| match position {
                        Some(at) => {
                            let at_value = vec![Item::Atomic(Atomic::Integer(i as i64 + 1))];
                            ev.with_local(at, at_value, |ev| ev.bind_clauses(flwor, index + 1, out))
                        }
                        None => ev.bind_clauses(flwor, index + 1, out),
                    })?;
                }
                Ok(())
            }
            Clause::Let { var, value } => {
                let value = self.eval(value)?;
                self.with_local(var, value, |ev| ev.bind_clauses(flwor, index + 1, out))
            }
        }
    }

    fn quantify(
        &mut self,
        every: bool,
        bindings: &[(QName, Expr)],
        condition: &Expr,
    ) -> CoreResult<bool> {
        let Some(((var, source), rest)) = bindings.split_first() else {
            return effective_boolean(&self.eval(condition)?);
        };
        for item in self.eval(source)? {
            let holds = self.with_local(var, vec![item], |ev| ev.quantify(every, rest, condition))?;
            if holds != every {
                return Ok(holds);
            }
        }
        Ok(every)
    }

    // ---- constructors ----------------------------------------------------------

    fn construct_element(
        &mut self,
        name: &NameExpr,
        attributes: &[(QName, Vec<Content>)],
        content: &[Content],
    ) -> CoreResult<Sequence> {
        let name = self.constructed_name(name, true)?;
        let mut builder = TreeBuilder::fragment();
        builder.start_element(name)?;
        for (attr, value) in attributes {
            let value = self.content_string(value)?;
            builder.attribute(attr.clone(), value)?;
        }
        for part in content {
            match part {
                Content::Text(text) => builder.text(text)?,
                Content::Expr(expr) => {
                    let items = self.eval(expr)?;
                    add_items(&mut builder, items)?;
                }
            }
        }
        builder.end_element()?;
        finish(builder)
    }

    /// String value of attribute, comment and PI content: literal text plus
    /// enclosed values joined by single spaces.
    fn content_string(&mut self, content: &[Content]) -> CoreResult<String> {
        let mut out = String::new();
        for part in content {
            match part {
                Content::Text(text) => out.push_str(text),
                Content::Expr(expr) => {
                    let items = self.eval(expr)?;
                    out.push_str(&join_atomics(&items));
                }
            }
        }
        Ok(out)
    }

    fn constructed_name(&mut self, name: &NameExpr, is_element: bool) -> CoreResult<QName> {
        let expr = match name {
            NameExpr::Static(name) => return Ok(name.clone()),
            NameExpr::Computed(expr) => expr,
        };
        let items = self.eval(expr)?;
        let Some(value) = atomize_optional(&items, "constructor name")? else {
            return Err(CoreError::evaluation("XPTY0004", "a constructor name cannot be empty"));
        };
        let lexical = match &value {
            Atomic::String(s) | Atomic::Untyped(s) => s.trim().to_string(),
            other => {
                return Err(CoreError::evaluation(
                    "XPTY0004",
                    format!("a constructor name cannot be a {}", other.type_name()),
                ))
            }
        };
        let (prefix, local) = match lexical.split_once(':') {
            Some((prefix, local)) => (Some(prefix), local),
            None => (None, lexical.as_str()),
        };
        if !is_ncname(local) || prefix.is_some_and(|p| !is_ncname(p)) {
            return Err(CoreError::evaluation(
                "XQDY0074",
                format!("'{lexical}' is not a valid name"),
            ));
        }
        let lookup = |p: &str| {
            self.program
                .namespaces
                .iter()
                .rev()
                .find(|(bound, _)| bound == p)
                .map(|(_, uri)| uri.clone())
        };
        let name = match prefix {
            Some(prefix) => {
                let uri = lookup(prefix).ok_or_else(|| {
                    let message = format!("undeclared namespace prefix '{prefix}'");
                    CoreError::evaluation("XQDY0074", message)
                })?;
                let name = if uri.is_empty() {
                    QName::local(local)
                } else {
                    QName::namespaced(uri, local)
                };
                name.with_prefix(prefix)
            }
            None => match lookup("").filter(|uri| is_element && !uri.is_empty()) {
                Some(uri) => QName::namespaced(uri, local),
                None => QName::local(local),
            },
        };
        Ok(name)
    }
}

fn boolean(value: bool) -> Item {
    Item::Atomic(Atomic::Boolean(value))
}

fn unknown_function(name: &QName, arity: usize) -> CoreError {
    CoreError::evaluation(
        "XPST0017",
        format!("no function {}#{arity}", name.lexical()),
    )
}

fn range_bound(value: &Atomic) -> CoreResult<i64> {
    match value {
        Atomic::Integer(i) => Ok(*i),
        Atomic::Untyped(s) => s
            .trim()
            .parse()
            .map_err(|_| {
                CoreError::evaluation("FORG0001", format!("cannot cast '{s}' to xs:integer"))
            }),
        other => Err(CoreError::evaluation(
            "XPTY0004",
            format!("range bounds must be integers, got {}", other.type_name()),
        )),
    }
}

fn general_compare(op: Comparison, left: &[Atomic], right: &[Atomic]) -> CoreResult<bool> {
    for l in left {
        for r in right {
            if general_compare_pair(op, l, r)? {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

fn document_order(mut nodes: Vec<NodeRef>) -> Vec<NodeRef> {
    nodes.sort();
    nodes.dedup();
    nodes
}

fn join_atomics(items: &[Item]) -> String {
    atomize(items)
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Adds enclosed-expression results to a constructor: adjacent atomic
/// values become one text node separated by spaces, nodes are copied.
fn add_items(builder: &mut TreeBuilder, items: Sequence) -> CoreResult<()> {
    let mut pending: Option<String> = None;
    for item in items {
        match item {
            Item::Atomic(value) => {
                let text = value.to_string();
                pending = Some(match pending {
                    Some(before) => format!("{before} {text}"),
                    None => text,
                });
            }
            Item::Node(node) => {
                if let Some(text) = pending.take() {
                    builder.text(&text)?;
                }
                builder.copy(&node)?;
            }
        }
    }
    if let Some(text) = pending {
        builder.text(&text)?;
    }
    Ok(())
}

fn finish(builder: TreeBuilder) -> CoreResult<Sequence> {
    Ok(vec![Item::Node(NodeRef::constructed(builder.finish()?))])
}

fn is_ncname(text: &str) -> bool {
    let mut chars = text.chars();
    chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn is_descendant_or_self_node(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::Step(Step {
            axis: Axis::DescendantOrSelf,
            test: NodeTest::Kind(KindTest::AnyNode),
            predicates,
        }) if predicates.is_empty()
    )
}

/// Matches `. = literal` and `@attr = literal` (either operand order).
fn indexable_predicate<'e>(
    name: &QName,
    predicate: &'e Expr,
) -> Option<(IndexTarget, ValueType, &'e Atomic)> {
    let Expr::GeneralCompare(Comparison::Eq, left, right) = predicate else {
        return None;
    };
    let (operand, literal) = match (left.as_ref(), right.as_ref()) {
        (operand, Expr::Literal(literal)) => (operand, literal),
        (Expr::Literal(literal), operand) => (operand, literal),
        _ => return None,
    };
    let target = match operand {
        Expr::ContextItem => IndexTarget::Element(name.clone()),
        Expr::Step(Step {
            axis: Axis::Attribute,
            test: NodeTest::Name(attr),
            predicates,
        }) if predicates.is_empty() => IndexTarget::Attribute(attr.clone()),
        _ => return None,
    };
    let wanted = match literal {
        Atomic::String(_) => ValueType::String,
        Atomic::Integer(_) | Atomic::Double(_) => ValueType::Double,
        Atomic::Untyped(_) | Atomic::Boolean(_) => return None,
    };
    Some((target, wanted, literal))
}

fn compare_keys(
    specs: &[OrderSpec],
    left: &[Option<Atomic>],
    right: &[Option<Atomic>],
) -> CoreResult<Ordering> {
    for ((spec, l), r) in specs.iter().zip(left).zip(right) {
        let ordering = match (l, r) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) if spec.empty_greatest => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) if spec.empty_greatest => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(l), Some(r)) => order_compare(l, r)?,
        };
        let ordering = if spec.descending {
            ordering.reverse()
        } else {
            ordering
        };
        if ordering != Ordering::Equal {
            return Ok(ordering);
        }
    }
    Ok(Ordering::Equal)
}
