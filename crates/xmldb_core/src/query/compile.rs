//! Name resolution and compilation of a main module into an executable plan.

use super::ast::{
    CallTarget, Clause, Content, Expr, Flwor, FunctionDecl, Module, NameExpr, VariableDecl,
};
use super::cache::Registry;
use super::context::StaticContext;
use super::eval::{Evaluator, ExecutionState, Program};
use super::functions::lookup_builtin;
use super::item::Sequence;
use super::parser::parse_module;
use super::HOST_SCHEME;
use crate::dom::QName;
use crate::error::{CoreError, CoreResult};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// An immutable, resolved query plan.
///
/// Module-level variables were evaluated once at compile time. Executing a
/// plan never modifies it, so one plan may be shared between threads and
/// executed any number of times.
pub struct CompiledQuery {
    source: String,
    program: Program,
    globals: Vec<(QName, Sequence)>,
    fingerprint: u64,
}

impl CompiledQuery {
    /// Returns the source text the plan was compiled from.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Returns the variables declared `external`, which must be bound in
    /// the dynamic context before execution.
    #[must_use]
    pub fn external_variables(&self) -> &[QName] {
        &self.program.externals
    }

    pub(crate) fn program(&self) -> &Program {
        &self.program
    }

    pub(crate) fn globals(&self) -> &[(QName, Sequence)] {
        &self.globals
    }

    pub(crate) fn fingerprint(&self) -> u64 {
        self.fingerprint
    }
}

impl fmt::Debug for CompiledQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledQuery")
            .field("source", &self.source)
            .field("functions", &self.program.functions.len())
            .field("globals", &self.globals.len())
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// Compiles a main module.
pub(crate) fn compile(
    source: &str,
    context: &StaticContext,
    registry: &Registry,
) -> CoreResult<CompiledQuery> {
    let module = parse_module(source, &context.bindings())?;
    if module.library.is_some() {
        return Err(CoreError::compilation(
            "XPST0003",
            "a library module cannot be executed",
        ));
    }
    let Module {
        imports,
        mut variables,
        mut functions,
        body,
        namespaces,
        ..
    } = module;

    let mut imported_functions = Vec::new();
    let mut imported_variables = Vec::new();
    let mut seen = HashSet::new();
    import_modules(
        &imports,
        registry,
        &mut seen,
        &mut imported_functions,
        &mut imported_variables,
    )?;
    imported_functions.append(&mut functions);
    imported_variables.append(&mut variables);
    let mut functions = imported_functions;
    let mut variables = imported_variables;

    check_duplicates(&functions, &variables)?;

    let resolver = Resolver {
        signatures: functions
            .iter()
            .map(|f| (f.name.clone(), f.params.len()))
            .collect(),
        context,
        registry,
    };

    let mut visible = Vec::new();
    for variable in &mut variables {
        if let Some(value) = &mut variable.value {
            resolver.expr(value, &mut visible)?;
        }
        visible.push(variable.name.clone());
    }
    for function in &mut functions {
        let mut scope = visible.clone();
        scope.extend(function.params.iter().cloned());
        resolver.expr(&mut function.body, &mut scope)?;
    }
    let mut body = body.unwrap_or(Expr::Sequence(Vec::new()));
    resolver.expr(&mut body, &mut visible)?;

    let externals = variables
        .iter()
        .filter(|v| v.value.is_none())
        .map(|v| v.name.clone())
        .collect();
    let program = Program {
        functions,
        body,
        externals,
        namespaces,
        max_call_depth: context.call_depth_limit(),
    };

    let mut globals: Vec<(QName, Sequence)> = Vec::new();
    let unbound = HashMap::new();
    let mut state = ExecutionState::new();
    for variable in &variables {
        if let Some(value) = &variable.value {
            let result = Evaluator::new(&program, &globals, &unbound, context.view(), &mut state)
                .eval(value)?;
            globals.push((variable.name.clone(), result));
        }
    }

    Ok(CompiledQuery {
        source: source.to_string(),
        program,
        globals,
        fingerprint: context.fingerprint(registry.generation),
    })
}

/// Collects the declarations of imported library modules, dependencies
/// first. Each module is loaded once.
fn import_modules(
    imports: &[String],
    registry: &Registry,
    seen: &mut HashSet<String>,
    functions: &mut Vec<FunctionDecl>,
    variables: &mut Vec<VariableDecl>,
) -> CoreResult<()> {
    for uri in imports {
        if !seen.insert(uri.clone()) {
            continue;
        }
        let module = registry.modules.get(uri).ok_or_else(|| {
            CoreError::compilation("XQST0059", format!("no module registered for '{uri}'"))
        })?;
        import_modules(&module.imports, registry, seen, functions, variables)?;
        functions.extend(module.functions.iter().cloned());
        variables.extend(module.variables.iter().cloned());
    }
    Ok(())
}

fn check_duplicates(functions: &[FunctionDecl], variables: &[VariableDecl]) -> CoreResult<()> {
    let mut signatures = HashSet::new();
    for function in functions {
        if !signatures.insert((&function.name, function.params.len())) {
            return Err(CoreError::compilation(
                "XQST0034",
                format!(
                    "function {}#{} is declared twice",
                    function.name.lexical(),
                    function.params.len()
                ),
            ));
        }
    }
    let mut names = HashSet::new();
    for variable in variables {
        if !names.insert(&variable.name) {
            return Err(CoreError::compilation(
                "XQST0049",
                format!("variable ${} is declared twice", variable.name.lexical()),
            ));
        }
    }
    Ok(())
}

struct Resolver<'c> {
    signatures: Vec<(QName, usize)>,
    context: &'c StaticContext,
    registry: &'c Registry,
}

impl Resolver<'_> {
    fn exprs(&self, exprs: &mut [Expr], scope: &mut Vec<QName>) -> CoreResult<()> {
        exprs.iter_mut().try_for_each(|e| self.expr(e, scope))
    }

    fn content(&self, content: &mut [Content], scope: &mut Vec<QName>) -> CoreResult<()> {
        for part in content {
            if let Content::Expr(expr) = part {
                self.expr(expr, scope)?;
            }
        }
        Ok(())
    }

    fn name(&self, name: &mut NameExpr, scope: &mut Vec<QName>) -> CoreResult<()> {
        match name {
            NameExpr::Static(_) => Ok(()),
            NameExpr::Computed(expr) => self.expr(expr, scope),
        }
    }

    /// Checks variable references and binds function calls in `expr`.
    /// `scope` holds the variables visible at this point; bindings
    /// introduced inside are popped before returning.
    fn expr(&self, expr: &mut Expr, scope: &mut Vec<QName>) -> CoreResult<()> {
        match expr {
            Expr::Literal(_) | Expr::ContextItem | Expr::Root => Ok(()),
            Expr::Variable(name) => {
                if scope.contains(name) {
                    Ok(())
                } else {
                    Err(CoreError::compilation(
                        "XPST0008",
                        format!("undeclared variable ${}", name.lexical()),
                    ))
                }
            }
            Expr::Sequence(parts) => self.exprs(parts, scope),
            Expr::Range(a, b)
            | Expr::Path(a, b)
            | Expr::Arithmetic(_, a, b)
            | Expr::ValueCompare(_, a, b)
            | Expr::GeneralCompare(_, a, b)
            | Expr::NodeCompare(_, a, b)
            | Expr::And(a, b)
            | Expr::Or(a, b)
            | Expr::SetOp(_, a, b) => {
                self.expr(a, scope)?;
                self.expr(b, scope)
            }
            Expr::Negate(e) | Expr::Text(e) | Expr::Document(e) => self.expr(e, scope),
            Expr::Step(step) => self.exprs(&mut step.predicates, scope),
            Expr::Filter(base, predicates) => {
                self.expr(base, scope)?;
                self.exprs(predicates, scope)
            }
            Expr::If(c, t, e) => {
                self.expr(c, scope)?;
                self.expr(t, scope)?;
                self.expr(e, scope)
            }
            Expr::Call { name, args, target } => {
                self.exprs(args, scope)?;
                *target = self.call_target(name, args.len())?;
                Ok(())
            }
            Expr::Quantified {
                bindings,
                condition,
                ..
            } => {
                let mark = scope.len();
                let result = self.quantified(bindings, condition, scope);
                scope.truncate(mark);
                result
            }
            Expr::Flwor(flwor) => {
                let mark = scope.len();
                let result = self.flwor(flwor, scope);
                scope.truncate(mark);
                result
            }
            Expr::Element {
                name,
                attributes,
                content,
            } => {
                self.name(name, scope)?;
                for (_, value) in attributes {
                    self.content(value, scope)?;
                }
                self.content(content, scope)
            }
            Expr::Attribute(name, value) | Expr::ProcessingInstruction(name, value) => {
                self.name(name, scope)?;
                self.content(value, scope)
            }
            Expr::Comment(value) => self.content(value, scope),
        }
    }

    fn quantified(
        &self,
        bindings: &mut [(QName, Expr)],
        condition: &mut Expr,
        scope: &mut Vec<QName>,
    ) -> CoreResult<()> {
        for (var, source) in bindings {
            self.expr(source, scope)?;
            scope.push(var.clone());
        }
        self.expr(condition, scope)
    }

    fn flwor(&self, flwor: &mut Flwor, scope: &mut Vec<QName>) -> CoreResult<()> {
        for clause in &mut flwor.clauses {
            match clause {
                Clause::For {
                    var,
                    position,
                    source,
                } => {
                    self.expr(source, scope)?;
                    scope.push(var.clone());
                    scope.extend(position.iter().cloned());
                }
                Clause::Let { var, value } => {
                    self.expr(value, scope)?;
                    scope.push(var.clone());
                }
            }
        }
        if let Some(condition) = &mut flwor.condition {
            self.expr(condition, scope)?;
        }
        for spec in &mut flwor.order {
            self.expr(&mut spec.key, scope)?;
        }
        self.expr(&mut flwor.body, scope)
    }

    /// User functions shadow everything else; `host:` namespaces go to
    /// their binding; then the built-in library; then registered native
    /// functions.
    fn call_target(&self, name: &QName, arity: usize) -> CoreResult<CallTarget> {
        if let Some(index) = self
            .signatures
            .iter()
            .position(|(n, a)| n == name && *a == arity)
        {
            return Ok(CallTarget::User(index));
        }

        let namespace = name.namespace_uri();
        if namespace.starts_with(HOST_SCHEME) {
            if !self.context.host_bindings_enabled() {
                return Err(CoreError::BindingDisabled {
                    namespace: namespace.to_string(),
                });
            }
            return match self.registry.host.get(namespace) {
                Some(binding) if binding.provides(&name.local, arity) => {
                    Ok(CallTarget::Host(Arc::clone(binding)))
                }
                _ => Err(unknown_function(name, arity)),
            };
        }

        if let Some(index) = lookup_builtin(name, arity) {
            return Ok(CallTarget::Builtin(index));
        }
        if let Some(function) = self.registry.functions.get(&(name.clone(), arity)) {
            return Ok(CallTarget::Extension(Arc::clone(function)));
        }
        Err(unknown_function(name, arity))
    }
}

fn unknown_function(name: &QName, arity: usize) -> CoreError {
    CoreError::compilation(
        "XPST0017",
        format!("no function {}#{arity}", name.lexical()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::item::{Atomic, Item};
    use crate::store::StoreState;

    fn context() -> StaticContext {
        StaticContext::new(Arc::new(StoreState::new()))
    }

    fn code(result: CoreResult<CompiledQuery>) -> String {
        result
            .unwrap_err()
            .query_code()
            .unwrap_or_default()
            .to_string()
    }

    #[test]
    fn undeclared_names_fail_to_compile() {
        let registry = Registry::default();
        assert_eq!(code(compile("$nope", &context(), &registry)), "XPST0008");
        assert_eq!(code(compile("fn:nope(1)", &context(), &registry)), "XPST0017");
        assert_eq!(code(compile("count(1, 2)", &context(), &registry)), "XPST0017");
    }

    #[test]
    fn flwor_variables_are_scoped_to_the_expression() {
        let registry = Registry::default();
        assert!(compile("for $x in 1 return $x", &context(), &registry).is_ok());
        assert_eq!(
            code(compile("(for $x in 1 return $x, $x)", &context(), &registry)),
            "XPST0008"
        );
    }

    #[test]
    fn duplicate_declarations_are_rejected() {
        let registry = Registry::default();
        let twice = "declare function local:f() { 1 }; declare function local:f() { 2 }; 1";
        assert_eq!(code(compile(twice, &context(), &registry)), "XQST0034");

        let twice = "declare variable $a := 1; declare variable $a := 2; $a";
        assert_eq!(code(compile(twice, &context(), &registry)), "XQST0049");
    }

    #[test]
    fn globals_are_evaluated_at_compile_time() {
        let registry = Registry::default();
        let plan = compile(
            "declare variable $a := 20; declare variable $b := $a + 1; $b",
            &context(),
            &registry,
        )
        .unwrap();
        assert_eq!(plan.globals().len(), 2);
        assert_eq!(plan.globals()[1].1, vec![Item::Atomic(Atomic::Integer(21))]);
    }

    #[test]
    fn host_namespaces_need_bindings_enabled() {
        let registry = Registry::default();
        let source = "declare namespace h = 'host:clock'; h:now()";
        let err = compile(source, &context(), &registry).unwrap_err();
        assert!(matches!(
            err,
            CoreError::BindingDisabled { ref namespace } if namespace == "host:clock"
        ));

        let err = compile(source, &context().host_bindings(true), &registry).unwrap_err();
        assert_eq!(err.query_code(), Some("XPST0017"));
    }

    #[test]
    fn unknown_imports_fail() {
        let registry = Registry::default();
        let source = "import module namespace m = 'urn:missing'; 1";
        assert_eq!(code(compile(source, &context(), &registry)), "XQST0059");
    }
}
