//! XQuery parser.
//!
//! `xquery.pest` recognises the syntax; the builder below walks the pairs in
//! source order and produces the syntax tree. Names are resolved while
//! walking, so a prolog declaration or an `xmlns` attribute on a direct
//! element applies to everything after it.

use pest::error::{ErrorVariant, LineColLocation};
use pest::iterators::Pair;
use pest::Parser as _;

use super::ast::{
    Axis, CallTarget, Clause, Content, Expr, Flwor, FunctionDecl, KindTest, Module, NameExpr,
    NodeComparison, NodeTest, OrderSpec, SetOp, Step, VariableDecl,
};
use super::item::{ArithOp, Atomic, Comparison};
use super::FN_NAMESPACE;
use crate::dom::{unescape, QName};
use crate::error::{CoreError, CoreResult};

#[derive(pest_derive::Parser)]
#[grammar = "query/xquery.pest"]
struct XQueryParser;

type Node<'i> = Pair<'i, Rule>;

/// Parses a main or library module.
///
/// `namespaces` are the prefixes bound before the prolog is read.
pub(crate) fn parse_module(source: &str, namespaces: &[(String, String)]) -> CoreResult<Module> {
    let root = XQueryParser::parse(Rule::module, source)
        .map_err(grammar_error)?
        .next()
        .ok_or_else(|| CoreError::compilation("XPST0003", "empty query"))?;
    let mut builder = Builder {
        namespaces: namespaces.to_vec(),
        default_function: FN_NAMESPACE.to_string(),
        preserve_boundary_space: false,
    };
    builder.module(root)
}

fn located(message: &str, (line, column): (usize, usize)) -> CoreError {
    CoreError::compilation("XPST0003", format!("{message} at line {line}, column {column}"))
}

fn grammar_error(error: pest::error::Error<Rule>) -> CoreError {
    let position = match error.line_col {
        LineColLocation::Pos(position) | LineColLocation::Span(position, _) => position,
    };
    let message = match &error.variant {
        ErrorVariant::ParsingError { positives, .. } if !positives.is_empty() => {
            let expected: Vec<String> =
                positives.iter().take(4).map(|r| format!("{r:?}")).collect();
            format!("expected {}", expected.join(" or "))
        }
        ErrorVariant::ParsingError { .. } => "unexpected input".to_string(),
        ErrorVariant::CustomError { message } => message.clone(),
    };
    located(&message, position)
}

fn syntax_error(pair: &Node<'_>, message: impl AsRef<str>) -> CoreError {
    located(message.as_ref(), pair.as_span().start_pos().line_col())
}

fn child<'i>(pair: &Node<'i>, rule: Rule) -> Option<Node<'i>> {
    pair.clone().into_inner().find(|p| p.as_rule() == rule)
}

fn children<'i>(pair: &Node<'i>, rule: Rule) -> impl Iterator<Item = Node<'i>> {
    pair.clone().into_inner().filter(move |p| p.as_rule() == rule)
}

fn has(pair: &Node<'_>, rule: Rule) -> bool {
    child(pair, rule).is_some()
}

fn required<'i>(pair: &Node<'i>, rule: Rule) -> CoreResult<Node<'i>> {
    child(pair, rule).ok_or_else(|| syntax_error(pair, format!("expected {rule:?}")))
}

/// Splits a `qname` pair into prefix and local part.
fn lexical(pair: &Node<'_>) -> (Option<String>, String) {
    let mut parts = pair.clone().into_inner().map(|p| p.as_str().to_string());
    match (parts.next(), parts.next()) {
        (Some(prefix), Some(local)) => (Some(prefix), local),
        (Some(local), None) => (None, local),
        _ => (None, pair.as_str().to_string()),
    }
}

fn binary(op: Rule, left: Box<Expr>, right: Box<Expr>) -> Option<Expr> {
    Some(match op {
        Rule::K_OR => Expr::Or(left, right),
        Rule::K_AND => Expr::And(left, right),
        Rule::K_EQ => Expr::ValueCompare(Comparison::Eq, left, right),
        Rule::K_NE => Expr::ValueCompare(Comparison::Ne, left, right),
        Rule::K_LT => Expr::ValueCompare(Comparison::Lt, left, right),
        Rule::K_LE => Expr::ValueCompare(Comparison::Le, left, right),
        Rule::K_GT => Expr::ValueCompare(Comparison::Gt, left, right),
        Rule::K_GE => Expr::ValueCompare(Comparison::Ge, left, right),
        Rule::OP_EQ => Expr::GeneralCompare(Comparison::Eq, left, right),
        Rule::OP_NE => Expr::GeneralCompare(Comparison::Ne, left, right),
        Rule::OP_LT => Expr::GeneralCompare(Comparison::Lt, left, right),
        Rule::OP_LE => Expr::GeneralCompare(Comparison::Le, left, right),
        Rule::OP_GT => Expr::GeneralCompare(Comparison::Gt, left, right),
        Rule::OP_GE => Expr::GeneralCompare(Comparison::Ge, left, right),
        Rule::K_IS => Expr::NodeCompare(NodeComparison::Is, left, right),
        Rule::OP_PRECEDES => Expr::NodeCompare(NodeComparison::Precedes, left, right),
        Rule::OP_FOLLOWS => Expr::NodeCompare(NodeComparison::Follows, left, right),
        Rule::K_TO => Expr::Range(left, right),
        Rule::OP_PLUS => Expr::Arithmetic(ArithOp::Add, left, right),
        Rule::OP_MINUS => Expr::Arithmetic(ArithOp::Sub, left, right),
        Rule::OP_STAR => Expr::Arithmetic(ArithOp::Mul, left, right),
        Rule::K_DIV => Expr::Arithmetic(ArithOp::Div, left, right),
        Rule::K_IDIV => Expr::Arithmetic(ArithOp::IDiv, left, right),
        Rule::K_MOD => Expr::Arithmetic(ArithOp::Mod, left, right),
        Rule::K_UNION | Rule::OP_PIPE => Expr::SetOp(SetOp::Union, left, right),
        Rule::K_INTERSECT => Expr::SetOp(SetOp::Intersect, left, right),
        Rule::K_EXCEPT => Expr::SetOp(SetOp::Except, left, right),
        _ => return None,
    })
}

fn descendant_or_self() -> Expr {
    Expr::Step(Step {
        axis: Axis::DescendantOrSelf,
        test: NodeTest::Kind(KindTest::AnyNode),
        predicates: Vec::new(),
    })
}

fn path(left: Expr, right: Expr) -> Expr {
    Expr::Path(Box::new(left), Box::new(right))
}

struct Builder {
    /// Prefix bindings, innermost last. The empty prefix is the default
    /// element namespace; an empty URI unbinds.
    namespaces: Vec<(String, String)>,
    default_function: String,
    preserve_boundary_space: bool,
}

impl Builder {
    // ---- names -------------------------------------------------------------

    fn lookup_prefix(&self, prefix: &str) -> Option<&str> {
        self.namespaces
            .iter()
            .rev()
            .find(|(p, _)| p == prefix)
            .map(|(_, uri)| uri.as_str())
    }

    fn namespace_of(&self, prefix: &str) -> CoreResult<&str> {
        self.lookup_prefix(prefix).ok_or_else(|| {
            CoreError::compilation("XPST0081", format!("undeclared namespace prefix '{prefix}'"))
        })
    }

    fn resolve(
        &self,
        (prefix, local): (Option<String>, String),
        default: Option<&str>,
    ) -> CoreResult<QName> {
        match prefix {
            Some(prefix) => {
                let uri = self.namespace_of(&prefix)?;
                let mut name = if uri.is_empty() {
                    QName::local(local)
                } else {
                    QName::namespaced(uri, local)
                };
                name.prefix = Some(prefix);
                Ok(name)
            }
            None => Ok(match default {
                Some(uri) if !uri.is_empty() => QName::namespaced(uri, local),
                _ => QName::local(local),
            }),
        }
    }

    fn element_name(&self, qname: &Node<'_>) -> CoreResult<QName> {
        let default = self.lookup_prefix("").map(str::to_string);
        self.resolve(lexical(qname), default.as_deref())
    }

    fn plain_name(&self, qname: &Node<'_>) -> CoreResult<QName> {
        self.resolve(lexical(qname), None)
    }

    fn function_name(&self, qname: &Node<'_>) -> CoreResult<QName> {
        self.resolve(lexical(qname), Some(&self.default_function))
    }

    fn variable(&self, var_ref: &Node<'_>) -> CoreResult<QName> {
        self.plain_name(&required(var_ref, Rule::qname)?)
    }

    fn string(&self, literal: &Node<'_>) -> CoreResult<String> {
        let raw = literal.as_str();
        let quote = &raw[..1];
        let body = raw[1..raw.len() - 1].replace(&quote.repeat(2), quote);
        unescape(&body).map_err(|e| syntax_error(literal, e.to_string()))
    }

    fn reference(&self, reference: &Node<'_>) -> CoreResult<String> {
        unescape(reference.as_str()).map_err(|e| syntax_error(reference, e.to_string()))
    }

    // ---- modules and prolog ----------------------------------------------

    fn module(&mut self, root: Node<'_>) -> CoreResult<Module> {
        let mut module = Module::default();
        for part in root.into_inner() {
            match part.as_rule() {
                Rule::library_module => {
                    let decl = required(&part, Rule::module_decl)?;
                    let (prefix, uri) = self.namespace_binding(&decl)?;
                    self.namespaces.push((prefix, uri.clone()));
                    module.library = Some(uri);
                    self.prolog(required(&part, Rule::prolog)?, &mut module)?;
                    module.namespaces = self.namespaces.clone();
                }
                Rule::main_module => {
                    self.prolog(required(&part, Rule::prolog)?, &mut module)?;
                    module.namespaces = self.namespaces.clone();
                    module.body = Some(self.expr(required(&part, Rule::expr)?)?);
                }
                _ => {}
            }
        }
        Ok(module)
    }

    fn namespace_binding(&self, decl: &Node<'_>) -> CoreResult<(String, String)> {
        let prefix = required(decl, Rule::ncname)?.as_str().to_string();
        let uri = self.string(&required(decl, Rule::string_literal)?)?;
        Ok((prefix, uri))
    }

    fn prolog(&mut self, prolog: Node<'_>, module: &mut Module) -> CoreResult<()> {
        for decl in prolog.into_inner() {
            match decl.as_rule() {
                Rule::namespace_decl => {
                    let binding = self.namespace_binding(&decl)?;
                    self.namespaces.push(binding);
                }
                Rule::default_namespace_decl => {
                    let uri = self.string(&required(&decl, Rule::string_literal)?)?;
                    if has(&decl, Rule::K_ELEMENT) {
                        self.namespaces.push((String::new(), uri));
                    } else {
                        self.default_function = uri;
                    }
                }
                Rule::boundary_space_decl => {
                    self.preserve_boundary_space = has(&decl, Rule::K_PRESERVE);
                }
                Rule::var_decl => {
                    let name = self.variable(&required(&decl, Rule::var_ref)?)?;
                    let value = child(&decl, Rule::expr_single)
                        .map(|value| self.expression(value))
                        .transpose()?;
                    module.variables.push(VariableDecl { name, value });
                }
                Rule::function_decl => {
                    let function = self.function_decl(&decl, module.library.as_deref())?;
                    module.functions.push(function);
                }
                Rule::import_decl => {
                    let (prefix, uri) = self.namespace_binding(&decl)?;
                    self.namespaces.push((prefix, uri.clone()));
                    module.imports.push(uri);
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn function_decl(
        &mut self,
        decl: &Node<'_>,
        library: Option<&str>,
    ) -> CoreResult<FunctionDecl> {
        let name = self.function_name(&required(decl, Rule::qname)?)?;
        if let Some(target) = library {
            if name.namespace_uri() != target {
                return Err(CoreError::compilation(
                    "XQST0048",
                    format!("function {} is not in the module namespace {target}", name.lexical()),
                ));
            }
        }
        let params = match child(decl, Rule::param_list) {
            Some(list) => children(&list, Rule::param)
                .map(|param| self.variable(&required(&param, Rule::var_ref)?))
                .collect::<CoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        let body = match child(&required(decl, Rule::function_body)?, Rule::expr) {
            Some(body) => self.expr(body)?,
            None => Expr::Sequence(Vec::new()),
        };
        Ok(FunctionDecl { name, params, body })
    }

    // ---- expressions -------------------------------------------------------

    fn expr(&mut self, pair: Node<'_>) -> CoreResult<Expr> {
        let mut items = pair
            .into_inner()
            .map(|item| self.expression(item))
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Expr::Sequence(items)
        })
    }

    fn expression(&mut self, pair: Node<'_>) -> CoreResult<Expr> {
        match pair.as_rule() {
            Rule::expr => self.expr(pair),
            Rule::expr_single => {
                let inner = pair
                    .clone()
                    .into_inner()
                    .next()
                    .ok_or_else(|| syntax_error(&pair, "expected an expression"))?;
                self.expression(inner)
            }
            Rule::flwor_expr => self.flwor(pair),
            Rule::quantified_expr => self.quantified(pair),
            Rule::if_expr => {
                let condition = self.expr(required(&pair, Rule::expr)?)?;
                let mut branches = children(&pair, Rule::expr_single);
                let (Some(then), Some(otherwise)) = (branches.next(), branches.next()) else {
                    return Err(syntax_error(&pair, "expected 'then' and 'else' branches"));
                };
                Ok(Expr::If(
                    Box::new(condition),
                    Box::new(self.expression(then)?),
                    Box::new(self.expression(otherwise)?),
                ))
            }
            Rule::or_expr
            | Rule::and_expr
            | Rule::comparison_expr
            | Rule::range_expr
            | Rule::additive_expr
            | Rule::multiplicative_expr
            | Rule::union_expr
            | Rule::intersect_expr => self.chain(pair),
            Rule::unary_expr => self.unary(pair),
            Rule::path_expr => self.path_expr(pair),
            Rule::relative_path => self.relative_path(pair),
            Rule::step_expr => self.step(pair),
            other => Err(syntax_error(&pair, format!("unexpected {other:?}"))),
        }
    }

    /// Folds `operand (op operand)*` to the left.
    fn chain(&mut self, pair: Node<'_>) -> CoreResult<Expr> {
        let mut inner = pair.clone().into_inner();
        let first = inner
            .next()
            .ok_or_else(|| syntax_error(&pair, "expected an operand"))?;
        let mut left = self.expression(first)?;
        while let Some(op) = inner.next() {
            let operand = inner
                .next()
                .ok_or_else(|| syntax_error(&op, "expected an operand"))?;
            let right = self.expression(operand)?;
            left = binary(op.as_rule(), Box::new(left), Box::new(right))
                .ok_or_else(|| syntax_error(&op, "unknown operator"))?;
        }
        Ok(left)
    }

    fn unary(&mut self, pair: Node<'_>) -> CoreResult<Expr> {
        let mut negate = false;
        for part in pair.clone().into_inner() {
            match part.as_rule() {
                Rule::OP_MINUS => negate = !negate,
                Rule::OP_PLUS => {}
                _ => {
                    let operand = self.expression(part)?;
                    return Ok(if negate {
                        Expr::Negate(Box::new(operand))
                    } else {
                        operand
                    });
                }
            }
        }
        Err(syntax_error(&pair, "expected an operand"))
    }

    fn flwor(&mut self, pair: Node<'_>) -> CoreResult<Expr> {
        let mut clauses = Vec::new();
        let mut condition = None;
        let mut order = Vec::new();
        let mut body = None;
        for part in pair.clone().into_inner() {
            match part.as_rule() {
                Rule::for_clause => {
                    for binding in children(&part, Rule::for_binding) {
                        let var = self.variable(&required(&binding, Rule::var_ref)?)?;
                        let position = match child(&binding, Rule::positional_var) {
                            Some(at) => Some(self.variable(&required(&at, Rule::var_ref)?)?),
                            None => None,
                        };
                        let source = self.expression(required(&binding, Rule::expr_single)?)?;
                        clauses.push(Clause::For {
                            var,
                            position,
                            source,
                        });
                    }
                }
                Rule::let_clause => {
                    for binding in children(&part, Rule::let_binding) {
                        let var = self.variable(&required(&binding, Rule::var_ref)?)?;
                        let value = self.expression(required(&binding, Rule::expr_single)?)?;
                        clauses.push(Clause::Let { var, value });
                    }
                }
                Rule::where_clause => {
                    condition = Some(self.expression(required(&part, Rule::expr_single)?)?);
                }
                Rule::order_by_clause => {
                    for spec in children(&part, Rule::order_spec) {
                        order.push(OrderSpec {
                            key: self.expression(required(&spec, Rule::expr_single)?)?,
                            descending: has(&spec, Rule::K_DESCENDING),
                            empty_greatest: has(&spec, Rule::K_GREATEST),
                        });
                    }
                }
                Rule::expr_single => body = Some(self.expression(part)?),
                _ => {}
            }
        }
        let body = body.ok_or_else(|| syntax_error(&pair, "expected 'return'"))?;
        Ok(Expr::Flwor(Box::new(Flwor {
            clauses,
            condition,
            order,
            body,
        })))
    }

    fn quantified(&mut self, pair: Node<'_>) -> CoreResult<Expr> {
        let every = has(&pair, Rule::K_EVERY);
        let mut bindings = Vec::new();
        for binding in children(&pair, Rule::quant_binding) {
            let var = self.variable(&required(&binding, Rule::var_ref)?)?;
            bindings.push((var, self.expression(required(&binding, Rule::expr_single)?)?));
        }
        let condition = self.expression(required(&pair, Rule::expr_single)?)?;
        Ok(Expr::Quantified {
            every,
            bindings,
            condition: Box::new(condition),
        })
    }

    // ---- paths -------------------------------------------------------------

    fn path_expr(&mut self, pair: Node<'_>) -> CoreResult<Expr> {
        let mut inner = pair.clone().into_inner();
        let first = inner
            .next()
            .ok_or_else(|| syntax_error(&pair, "expected a path"))?;
        match first.as_rule() {
            Rule::OP_DSLASH => {
                let rest = inner
                    .next()
                    .ok_or_else(|| syntax_error(&first, "expected a step after '//'"))?;
                let root = path(Expr::Root, descendant_or_self());
                Ok(path(root, self.relative_path(rest)?))
            }
            Rule::OP_SLASH => match inner.next() {
                Some(rest) => Ok(path(Expr::Root, self.relative_path(rest)?)),
                None => Ok(Expr::Root),
            },
            _ => self.relative_path(first),
        }
    }

    fn relative_path(&mut self, pair: Node<'_>) -> CoreResult<Expr> {
        let mut inner = pair.clone().into_inner();
        let first = inner
            .next()
            .ok_or_else(|| syntax_error(&pair, "expected a step"))?;
        let mut left = self.step(first)?;
        while let Some(separator) = inner.next() {
            let step = inner
                .next()
                .ok_or_else(|| syntax_error(&separator, "expected a step"))?;
            let right = self.step(step)?;
            left = if separator.as_rule() == Rule::OP_DSLASH {
                path(path(left, descendant_or_self()), right)
            } else {
                path(left, right)
            };
        }
        Ok(left)
    }

    fn predicates(&mut self, pair: &Node<'_>) -> CoreResult<Vec<Expr>> {
        children(pair, Rule::predicate)
            .map(|predicate| self.expr(required(&predicate, Rule::expr)?))
            .collect()
    }

    fn axis_step(&mut self, pair: &Node<'_>, axis: Option<Axis>) -> CoreResult<Expr> {
        let node_test = required(pair, Rule::node_test)?;
        // `attribute(...)` as an abbreviated step selects on the attribute axis.
        let axis = axis.unwrap_or_else(|| {
            let attribute_test = child(&node_test, Rule::kind_test)
                .is_some_and(|kind| has(&kind, Rule::attribute_test));
            if attribute_test {
                Axis::Attribute
            } else {
                Axis::Child
            }
        });
        let test = self.node_test(&node_test, axis)?;
        Ok(Expr::Step(Step {
            axis,
            test,
            predicates: self.predicates(pair)?,
        }))
    }

    fn step(&mut self, pair: Node<'_>) -> CoreResult<Expr> {
        let step = pair
            .clone()
            .into_inner()
            .next()
            .ok_or_else(|| syntax_error(&pair, "expected a step"))?;
        match step.as_rule() {
            Rule::abbrev_parent => Ok(Expr::Step(Step {
                axis: Axis::Parent,
                test: NodeTest::Kind(KindTest::AnyNode),
                predicates: self.predicates(&step)?,
            })),
            Rule::full_axis_step => {
                let name = required(&step, Rule::axis_name)?;
                let axis = Axis::from_name(name.as_str()).ok_or_else(|| {
                    syntax_error(&name, format!("unknown axis '{}'", name.as_str()))
                })?;
                self.axis_step(&step, Some(axis))
            }
            Rule::abbrev_attribute_step => self.axis_step(&step, Some(Axis::Attribute)),
            Rule::abbrev_step => self.axis_step(&step, None),
            Rule::filter_expr => {
                let primary = self.primary(required(&step, Rule::primary_expr)?)?;
                let predicates = self.predicates(&step)?;
                Ok(if predicates.is_empty() {
                    primary
                } else {
                    Expr::Filter(Box::new(primary), predicates)
                })
            }
            other => Err(syntax_error(&step, format!("unexpected {other:?}"))),
        }
    }

    fn node_test(&self, pair: &Node<'_>, axis: Axis) -> CoreResult<NodeTest> {
        if let Some(kind) = child(pair, Rule::kind_test) {
            return self.kind_test(&kind).map(NodeTest::Kind);
        }
        let name_test = required(pair, Rule::name_test)?;
        let test = name_test
            .clone()
            .into_inner()
            .next()
            .ok_or_else(|| syntax_error(&name_test, "expected a node test"))?;
        Ok(match test.as_rule() {
            Rule::wildcard => NodeTest::Wildcard,
            Rule::wildcard_local => {
                NodeTest::AnyNamespace(required(&test, Rule::ncname)?.as_str().to_string())
            }
            Rule::wildcard_prefix => {
                let uri = self.namespace_of(required(&test, Rule::ncname)?.as_str())?;
                NodeTest::AnyLocal((!uri.is_empty()).then(|| uri.to_string()))
            }
            _ if axis == Axis::Attribute => NodeTest::Name(self.plain_name(&test)?),
            _ => NodeTest::Name(self.element_name(&test)?),
        })
    }

    fn kind_test(&self, pair: &Node<'_>) -> CoreResult<KindTest> {
        let test = pair
            .clone()
            .into_inner()
            .next()
            .ok_or_else(|| syntax_error(pair, "expected a kind test"))?;
        let named = |is_element: bool| -> CoreResult<Option<QName>> {
            let name = child(&test, Rule::test_name).and_then(|name| child(&name, Rule::qname));
            match name {
                Some(name) if is_element => self.element_name(&name).map(Some),
                Some(name) => self.plain_name(&name).map(Some),
                None => Ok(None),
            }
        };
        Ok(match test.as_rule() {
            Rule::any_kind_test => KindTest::AnyNode,
            Rule::text_test => KindTest::Text,
            Rule::comment_test => KindTest::Comment,
            Rule::document_test => KindTest::Document,
            Rule::element_test => KindTest::Element(named(true)?),
            Rule::attribute_test => KindTest::Attribute(named(false)?),
            Rule::pi_test => {
                let literal = child(&test, Rule::string_literal);
                let target = match (child(&test, Rule::ncname), literal) {
                    (Some(name), _) => Some(name.as_str().to_string()),
                    (None, Some(literal)) => Some(self.string(&literal)?.trim().to_string()),
                    (None, None) => None,
                };
                KindTest::ProcessingInstruction(target)
            }
            other => return Err(syntax_error(&test, format!("unknown kind test {other:?}"))),
        })
    }

    // ---- primary expressions ---------------------------------------------

    fn primary(&mut self, pair: Node<'_>) -> CoreResult<Expr> {
        let primary = pair
            .clone()
            .into_inner()
            .next()
            .ok_or_else(|| syntax_error(&pair, "expected a primary expression"))?;
        match primary.as_rule() {
            Rule::numeric_literal => numeric(&primary),
            Rule::string_literal => Ok(Expr::Literal(Atomic::String(self.string(&primary)?))),
            Rule::var_ref => Ok(Expr::Variable(self.variable(&primary)?)),
            Rule::parenthesized_expr => match child(&primary, Rule::expr) {
                Some(inner) => self.expr(inner),
                None => Ok(Expr::Sequence(Vec::new())),
            },
            Rule::context_item => Ok(Expr::ContextItem),
            Rule::function_call => {
                let name = self.function_name(&required(&primary, Rule::qname)?)?;
                let args = children(&primary, Rule::expr_single)
                    .map(|arg| self.expression(arg))
                    .collect::<CoreResult<Vec<_>>>()?;
                Ok(Expr::Call {
                    name,
                    args,
                    target: CallTarget::Unresolved,
                })
            }
            Rule::comp_doc => Ok(Expr::Document(Box::new(self.enclosed_body(&primary)?))),
            Rule::comp_text => Ok(Expr::Text(Box::new(self.enclosed_body(&primary)?))),
            Rule::comp_comment => {
                Ok(Expr::Comment(vec![Content::Expr(self.enclosed_body(&primary)?)]))
            }
            Rule::comp_element | Rule::comp_attribute | Rule::comp_pi => {
                self.computed_named(primary)
            }
            Rule::dir_comment => {
                let text = required(&primary, Rule::dir_comment_text)?.as_str().to_string();
                Ok(Expr::Comment(vec![Content::Text(text)]))
            }
            Rule::dir_pi => self.direct_pi(&primary),
            Rule::dir_element => self.direct_element(primary),
            other => Err(syntax_error(&primary, format!("unexpected {other:?}"))),
        }
    }

    fn enclosed(&mut self, pair: &Node<'_>) -> CoreResult<Option<Expr>> {
        child(pair, Rule::expr).map(|inner| self.expr(inner)).transpose()
    }

    /// The single enclosed expression of a constructor, `()` when empty.
    fn enclosed_body(&mut self, pair: &Node<'_>) -> CoreResult<Expr> {
        let enclosed = required(pair, Rule::enclosed_expr)?;
        Ok(self
            .enclosed(&enclosed)?
            .unwrap_or_else(|| Expr::Sequence(Vec::new())))
    }

    fn computed_named(&mut self, pair: Node<'_>) -> CoreResult<Expr> {
        let rule = pair.as_rule();
        let mut parts = pair
            .clone()
            .into_inner()
            .filter(|p| matches!(p.as_rule(), Rule::enclosed_expr | Rule::qname | Rule::ncname));
        let (Some(name), Some(body)) = (parts.next(), parts.next()) else {
            return Err(syntax_error(&pair, "expected a name and a body"));
        };
        let name = match name.as_rule() {
            Rule::enclosed_expr => {
                let computed = self
                    .enclosed(&name)?
                    .ok_or_else(|| syntax_error(&name, "empty name expression"))?;
                NameExpr::Computed(Box::new(computed))
            }
            Rule::ncname => NameExpr::Static(QName::local(name.as_str())),
            _ if rule == Rule::comp_element => NameExpr::Static(self.element_name(&name)?),
            _ => NameExpr::Static(self.plain_name(&name)?),
        };
        let content: Vec<Content> = self.enclosed(&body)?.map(Content::Expr).into_iter().collect();
        Ok(match rule {
            Rule::comp_element => Expr::Element {
                name,
                attributes: Vec::new(),
                content,
            },
            Rule::comp_attribute => Expr::Attribute(name, content),
            _ => Expr::ProcessingInstruction(name, content),
        })
    }

    // ---- direct constructors ---------------------------------------------

    fn direct_pi(&self, pair: &Node<'_>) -> CoreResult<Expr> {
        let target = required(pair, Rule::ncname)?.as_str();
        let data = child(pair, Rule::dir_pi_text).map_or("", |data| data.as_str());
        Ok(Expr::ProcessingInstruction(
            NameExpr::Static(QName::local(target)),
            vec![Content::Text(data.trim_start().to_string())],
        ))
    }

    fn direct_element(&mut self, pair: Node<'_>) -> CoreResult<Expr> {
        let scope = self.namespaces.len();
        let result = self.element_in_scope(pair);
        self.namespaces.truncate(scope);
        result
    }

    /// Builds a direct element; namespace declarations it carries are pushed
    /// onto the scope, which the caller unwinds.
    fn element_in_scope(&mut self, pair: Node<'_>) -> CoreResult<Expr> {
        let mut inner = pair.clone().into_inner();
        let open = inner
            .next()
            .ok_or_else(|| syntax_error(&pair, "expected an element name"))?;
        let mut attributes = Vec::new();
        let mut content = Vec::new();
        let mut close = None;
        for part in inner {
            match part.as_rule() {
                Rule::dir_attribute => attributes.push(part),
                Rule::qname => close = Some(part),
                Rule::empty_tag_end => {}
                _ => content.push(part),
            }
        }

        let mut plain = Vec::with_capacity(attributes.len());
        for attribute in attributes {
            let name = required(&attribute, Rule::qname)?;
            let value = required(&attribute, Rule::dir_attr_value)?;
            let declared = match lexical(&name) {
                (None, local) if local == "xmlns" => String::new(),
                (Some(prefix), local) if prefix == "xmlns" => local,
                _ => {
                    plain.push((name, value));
                    continue;
                }
            };
            if has(&value, Rule::enclosed_expr) {
                return Err(CoreError::compilation(
                    "XQST0022",
                    "namespace declaration value must be a literal",
                ));
            }
            let mut uri = String::new();
            for part in self.attribute_value(value)? {
                if let Content::Text(text) = part {
                    uri.push_str(&text);
                }
            }
            self.namespaces.push((declared, uri));
        }

        let name = self.element_name(&open)?;
        let mut resolved: Vec<(QName, Vec<Content>)> = Vec::with_capacity(plain.len());
        for (attribute, value) in plain {
            let attribute = self.plain_name(&attribute)?;
            if resolved.iter().any(|(n, _)| *n == attribute) {
                return Err(CoreError::compilation(
                    "XQST0040",
                    format!("duplicate attribute {} in constructor", attribute.lexical()),
                ));
            }
            resolved.push((attribute, self.attribute_value(value)?));
        }

        if let Some(close) = close {
            if lexical(&close) != lexical(&open) {
                return Err(syntax_error(
                    &close,
                    format!("mismatched closing tag for <{}>", name.lexical()),
                ));
            }
        }
        Ok(Expr::Element {
            name: NameExpr::Static(name),
            attributes: resolved,
            content: self.direct_content(content)?,
        })
    }

    fn attribute_value(&mut self, pair: Node<'_>) -> CoreResult<Vec<Content>> {
        let mut parts = Vec::new();
        let mut text = String::new();
        for part in pair.into_inner() {
            match part.as_rule() {
                Rule::escaped_quot => text.push('"'),
                Rule::escaped_apos => text.push('\''),
                Rule::brace_open => text.push('{'),
                Rule::brace_close => text.push('}'),
                Rule::reference => text.push_str(&self.reference(&part)?),
                Rule::enclosed_expr => {
                    if !text.is_empty() {
                        parts.push(Content::Text(std::mem::take(&mut text)));
                    }
                    if let Some(expr) = self.enclosed(&part)? {
                        parts.push(Content::Expr(expr));
                    }
                }
                _ => text.extend(part.as_str().chars().map(|c| match c {
                    '\t' | '\n' | '\r' => ' ',
                    other => other,
                })),
            }
        }
        if !text.is_empty() {
            parts.push(Content::Text(text));
        }
        Ok(parts)
    }

    fn direct_content(&mut self, pieces: Vec<Node<'_>>) -> CoreResult<Vec<Content>> {
        let mut parts = Vec::new();
        let mut text = String::new();
        // Text from CDATA or references is never boundary whitespace.
        let mut significant = false;
        for piece in pieces {
            match piece.as_rule() {
                Rule::elem_text => text.push_str(piece.as_str()),
                Rule::brace_open => text.push('{'),
                Rule::brace_close => text.push('}'),
                Rule::reference => {
                    text.push_str(&self.reference(&piece)?);
                    significant = true;
                }
                Rule::cdata_section => {
                    text.push_str(required(&piece, Rule::cdata_text)?.as_str());
                    significant = true;
                }
                rule => {
                    self.flush_text(&mut parts, &mut text, &mut significant);
                    let expr = match rule {
                        Rule::enclosed_expr => self.enclosed(&piece)?,
                        Rule::dir_element => Some(self.direct_element(piece)?),
                        Rule::dir_pi => Some(self.direct_pi(&piece)?),
                        Rule::dir_comment => {
                            let comment = required(&piece, Rule::dir_comment_text)?;
                            Some(Expr::Comment(vec![Content::Text(comment.as_str().to_string())]))
                        }
                        other => return Err(syntax_error(&piece, format!("unexpected {other:?}"))),
                    };
                    parts.extend(expr.map(Content::Expr));
                }
            }
        }
        self.flush_text(&mut parts, &mut text, &mut significant);
        Ok(parts)
    }

    /// Emits pending text unless it is boundary whitespace being stripped.
    fn flush_text(&self, parts: &mut Vec<Content>, text: &mut String, significant: &mut bool) {
        let keep = *significant || self.preserve_boundary_space || !text.trim().is_empty();
        if keep && !text.is_empty() {
            parts.push(Content::Text(std::mem::take(text)));
        }
        text.clear();
        *significant = false;
    }
}

fn numeric(pair: &Node<'_>) -> CoreResult<Expr> {
    let text = pair.as_str();
    if !text.contains(['.', 'e', 'E']) {
        if let Ok(value) = text.parse::<i64>() {
            return Ok(Expr::Literal(Atomic::Integer(value)));
        }
    }
    text.parse::<f64>()
        .map(|d| Expr::Literal(Atomic::Double(d)))
        .map_err(|_| syntax_error(pair, format!("invalid numeric literal '{text}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::predeclared_namespaces;

    fn parse(source: &str) -> Module {
        parse_module(source, &predeclared_namespaces()).unwrap()
    }

    fn body(source: &str) -> Expr {
        parse(source).body.unwrap()
    }

    fn code(source: &str) -> String {
        parse_module(source, &predeclared_namespaces())
            .unwrap_err()
            .query_code()
            .unwrap_or_default()
            .to_string()
    }

    #[test]
    fn double_slash_expands_to_descendant_or_self() {
        let Expr::Path(left, right) = body("//a") else {
            panic!("expected a path");
        };
        assert!(matches!(*right, Expr::Step(Step { axis: Axis::Child, .. })));
        let Expr::Path(root, dos) = *left else {
            panic!("expected a path");
        };
        assert!(matches!(*root, Expr::Root));
        assert!(matches!(*dos, Expr::Step(Step { axis: Axis::DescendantOrSelf, .. })));
    }

    #[test]
    fn less_than_and_constructors_are_told_apart() {
        assert!(matches!(body("1 < 2"), Expr::GeneralCompare(Comparison::Lt, ..)));
        assert!(matches!(body("<a/>"), Expr::Element { .. }));
        assert!(matches!(body("1 << 2"), Expr::NodeCompare(NodeComparison::Precedes, ..)));
        assert!(matches!(body("1 <= 2"), Expr::GeneralCompare(Comparison::Le, ..)));
    }

    #[test]
    fn star_is_wildcard_or_multiplication() {
        assert!(matches!(body("2 * 3"), Expr::Arithmetic(ArithOp::Mul, ..)));
        assert!(matches!(
            body("*"),
            Expr::Step(Step { test: NodeTest::Wildcard, .. })
        ));
        assert!(matches!(
            body("a/*:b"),
            Expr::Path(_, right) if matches!(
                &*right,
                Expr::Step(Step { test: NodeTest::AnyNamespace(local), .. }) if local == "b"
            )
        ));
    }

    #[test]
    fn keywords_are_not_reserved() {
        assert!(matches!(body("for"), Expr::Step(..)));
        assert!(matches!(body("for $x in 1 return $x"), Expr::Flwor(..)));
        assert!(matches!(body("order/return"), Expr::Path(..)));
        assert!(matches!(
            body("text()"),
            Expr::Step(Step { test: NodeTest::Kind(KindTest::Text), .. })
        ));
    }

    #[test]
    fn operators_associate_to_the_left() {
        let Expr::Arithmetic(ArithOp::Sub, left, right) = body("5 - 2 - 1") else {
            panic!("expected a subtraction");
        };
        assert!(matches!(*left, Expr::Arithmetic(ArithOp::Sub, ..)));
        assert!(matches!(*right, Expr::Literal(Atomic::Integer(1))));
        assert!(matches!(body("1 to 3"), Expr::Range(..)));
        assert!(matches!(body("--1"), Expr::Literal(Atomic::Integer(1))));
        assert!(matches!(body("-1"), Expr::Negate(..)));
    }

    #[test]
    fn flwor_clauses() {
        let Expr::Flwor(flwor) = body(
            "for $x at $i in (3, 1) let $y := $x where $y > 0
             stable order by $y descending empty greatest return $i",
        ) else {
            panic!("expected a FLWOR");
        };
        assert_eq!(flwor.clauses.len(), 2);
        assert!(matches!(&flwor.clauses[0], Clause::For { position: Some(_), .. }));
        assert!(flwor.condition.is_some());
        assert!(flwor.order[0].descending && flwor.order[0].empty_greatest);
    }

    #[test]
    fn prolog_declarations() {
        let module = parse(
            "declare namespace x = 'urn:x';
             declare variable $v := 1;
             declare variable $e external;
             declare function local:f($a as xs:integer) as xs:integer { $a + 1 };
             x:item",
        );
        assert_eq!(module.variables.len(), 2);
        assert!(module.variables[1].value.is_none());
        assert_eq!(module.functions.len(), 1);
        assert_eq!(module.functions[0].params.len(), 1);
    }

    #[test]
    fn library_modules_have_no_body() {
        let module = parse(
            "module namespace m = 'urn:m';
             declare function m:twice($x) { $x * 2 };",
        );
        assert_eq!(module.library.as_deref(), Some("urn:m"));
        assert!(module.body.is_none());
        assert_eq!(
            code("module namespace m = 'urn:m'; declare function local:f() { 1 };"),
            "XQST0048"
        );
    }

    #[test]
    fn boundary_whitespace_is_stripped() {
        let Expr::Element { content, .. } = body("<a>  <b/>  text {1}  </a>") else {
            panic!("expected an element");
        };
        assert_eq!(content.len(), 3);
        assert!(matches!(&content[1], Content::Text(t) if t == "  text "));
    }

    #[test]
    fn attribute_values_mix_text_and_expressions() {
        let Expr::Element { attributes, .. } = body(r#"<a b="x{{ {1} }}&amp;""y"/>"#) else {
            panic!("expected an element");
        };
        let (_, value) = &attributes[0];
        assert!(matches!(&value[0], Content::Text(t) if t == "x{ "));
        assert!(matches!(&value[1], Content::Expr(Expr::Literal(Atomic::Integer(1)))));
        assert!(matches!(&value[2], Content::Text(t) if t == " }&\"y"));
    }

    #[test]
    fn namespace_declarations_scope_names() {
        let Expr::Element { name, .. } = body("<p:a xmlns:p='urn:p'/>") else {
            panic!("expected an element");
        };
        let NameExpr::Static(name) = name else {
            panic!("expected a static name");
        };
        assert_eq!(name.namespace.as_deref(), Some("urn:p"));
        assert_eq!(code("<p:a/>"), "XPST0081");
        assert_eq!(code("<p:a xmlns:p='urn:p'/>, <p:b/>"), "XPST0081");
        assert_eq!(code("<a xmlns:p='{1}'/>"), "XQST0022");
    }

    #[test]
    fn computed_constructors() {
        assert!(matches!(
            body("element item { 1 }"),
            Expr::Element { name: NameExpr::Static(_), .. }
        ));
        assert!(matches!(
            body("attribute { 'id' } { 2 }"),
            Expr::Attribute(NameExpr::Computed(_), _)
        ));
        assert!(matches!(body("text { 'x' }"), Expr::Text(_)));
        assert!(matches!(body("document { <a/> }"), Expr::Document(_)));
    }

    #[test]
    fn syntax_errors_carry_positions() {
        let err = parse_module("1 +", &[]).unwrap_err();
        assert_eq!(err.query_code(), Some("XPST0003"));
        assert!(err.to_string().contains("line 1"));
        assert_eq!(code("<a></b>"), "XPST0003");
        assert_eq!(code("<a>}</a>"), "XPST0003");
        assert_eq!(code("<a x='1' x='2'/>"), "XQST0040");
        let err = parse_module("1,\n  )", &[]).unwrap_err();
        assert!(err.to_string().contains("line 2, column 3"), "{err}");
    }

    #[test]
    fn comments_nest() {
        assert!(matches!(body("(: a (: b :) c :) 1"), Expr::Literal(Atomic::Integer(1))));
    }
}
