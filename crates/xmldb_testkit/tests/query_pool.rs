//! Compiled query reuse through the pool's query cache.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use xmldb_core::query::{Atomic, HostBinding, Item, NativeFunction, Sequence};
use xmldb_core::{Config, CoreError, CoreResult, MemoryStorage, QName};
use xmldb_testkit::prelude::*;

const COUNTER_NS: &str = "host:counter";

#[derive(Default)]
struct Counter {
    value: AtomicI64,
}

impl HostBinding for Counter {
    fn provides(&self, function: &str, arity: usize) -> bool {
        function == "next" && arity == 0
    }

    fn call(&self, _function: &str, _args: &[Sequence]) -> CoreResult<Sequence> {
        let next = self.value.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(vec![Item::Atomic(Atomic::Integer(next))])
    }
}

fn host_pool() -> TestPool {
    TestPool::with_config(
        Config::new()
            .memory(MemoryStorage::new())
            .host_bindings_enabled(true),
    )
}

#[test]
fn module_variable_is_captured_once_at_compile_time() {
    init_tracing();
    let pool = host_pool();
    let counter = Arc::new(Counter::default());
    pool.register_host_binding(COUNTER_NS, counter.clone()).unwrap();
    let broker = pool.admin();

    let source = r#"
        declare namespace c = "host:counter";
        declare variable $captured := c:next();
        $captured
    "#;
    let service = broker.query_service();
    let plan = service.compile(source).unwrap();
    assert_eq!(counter.value.load(Ordering::SeqCst), 1);

    let mut seen = Vec::new();
    for _ in 0..3 {
        let context = service.dynamic_context(None).unwrap();
        let result = service.execute(&plan, &context).unwrap();
        seen.push(result[0].string_value());
    }
    assert_eq!(seen, ["1", "1", "1"]);
    assert_eq!(counter.value.load(Ordering::SeqCst), 1);

    // Each call in the body hits the binding again.
    let fresh = query_strings(&broker, "declare namespace c = \"host:counter\"; c:next()");
    assert_eq!(fresh, ["2"]);
}

#[test]
fn cached_plan_is_reused_by_source_text() {
    let pool = host_pool();
    let counter = Arc::new(Counter::default());
    pool.register_host_binding(COUNTER_NS, counter.clone()).unwrap();
    let broker = pool.admin();

    let source = r#"
        declare namespace c = "host:counter";
        declare variable $captured := c:next();
        $captured
    "#;
    let values: Vec<String> = (0..3).flat_map(|_| query_strings(&broker, source)).collect();
    assert_eq!(values, ["1", "1", "1"]);
    assert_eq!(counter.value.load(Ordering::SeqCst), 1);

    let stats = pool.stats();
    assert_eq!(stats.queries_compiled(), 1);
    assert_eq!(stats.cache_hits(), 2);
    assert!(stats.queries_executed() >= 3);
}

#[test]
fn per_execution_counters_start_fresh() {
    with_memory_pool(|pool| {
        let broker = pool.admin();
        let source = r#"
            declare variable $at-compile := util:counter-next("c");
            ($at-compile, util:counter-next("c"), util:counter-next("c"))
        "#;
        for _ in 0..3 {
            assert_eq!(query_strings(&broker, source), ["1", "1", "2"]);
        }
    });
}

#[test]
fn host_bindings_are_off_by_default() {
    with_memory_pool(|pool| {
        pool.register_host_binding(COUNTER_NS, Arc::new(Counter::default()))
            .unwrap();
        let broker = pool.admin();
        let err = broker
            .query_service()
            .query("declare namespace c = \"host:counter\"; c:next()")
            .unwrap_err();
        assert!(matches!(err, CoreError::BindingDisabled { .. }), "{err:?}");
    });
}

#[test]
fn unknown_host_function_fails_to_compile() {
    let pool = host_pool();
    pool.register_host_binding(COUNTER_NS, Arc::new(Counter::default()))
        .unwrap();
    let broker = pool.admin();
    let err = broker
        .query_service()
        .query("declare namespace c = \"host:counter\"; c:reset()")
        .unwrap_err();
    assert_eq!(err.query_code(), Some("XPST0017"));
}

#[test]
fn compilation_errors_leave_the_pool_usable() {
    with_memory_pool(|pool| {
        let broker = pool.admin();
        let err = broker.query_service().query("for $x in").unwrap_err();
        assert!(matches!(err, CoreError::QueryCompilation { .. }), "{err:?}");
        let err = broker.query_service().query("1 div 0").unwrap_err();
        assert!(matches!(err, CoreError::Evaluation { .. }), "{err:?}");

        assert_eq!(query_count(&broker, "count(1 to 10)"), 10);
        assert!(broker.begin_transaction().is_ok());
    });
}

#[test]
fn registered_modules_and_functions_are_resolved_at_compile_time() {
    with_memory_pool(|pool| {
        let namespace = pool
            .register_module(
                r#"
                module namespace m = "urn:test:math";
                declare function m:square($x) { $x * $x };
                "#,
            )
            .unwrap();
        assert_eq!(namespace, "urn:test:math");

        pool.register_function(NativeFunction::new("urn:test:native", "answer", 0, |_| {
            Ok(vec![Item::Atomic(Atomic::Integer(42))])
        }))
        .unwrap();

        let broker = pool.admin();
        let source = r#"
            import module namespace m = "urn:test:math";
            declare namespace n = "urn:test:native";
            m:square(n:answer())
        "#;
        assert_eq!(query_strings(&broker, source), ["1764"]);
    });
}

#[test]
fn external_variables_are_bound_per_execution() {
    with_memory_pool(|pool| {
        let broker = pool.admin();
        let service = broker.query_service();
        let plan = service
            .compile("declare variable $n external; $n * 2")
            .unwrap();
        assert_eq!(plan.external_variables().len(), 1);

        for n in [1, 5] {
            let mut context = service.dynamic_context(None).unwrap();
            context.bind(QName::local("n"), vec![Item::Atomic(Atomic::Integer(n))]);
            let result = service.execute(&plan, &context).unwrap();
            assert_eq!(result[0].string_value(), (n * 2).to_string());
        }

        let unbound = service.dynamic_context(None).unwrap();
        let err = service.execute(&plan, &unbound).unwrap_err();
        assert_eq!(err.query_code(), Some("XPDY0002"));
    });
}

#[test]
fn plans_run_concurrently_without_sharing_state() {
    with_memory_pool(|pool| {
        let source = "(util:counter-next('n'), util:counter-next('n'))";
        let plan = pool.admin().query_service().compile(source).unwrap();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                let plan = Arc::clone(&plan);
                scope.spawn(move || {
                    let broker = pool.admin();
                    let service = broker.query_service();
                    for _ in 0..10 {
                        let context = service.dynamic_context(None).unwrap();
                        let values: Vec<String> = service
                            .execute(&plan, &context)
                            .unwrap()
                            .iter()
                            .map(Item::string_value)
                            .collect();
                        assert_eq!(values, ["1", "2"]);
                    }
                });
            }
        });
    });
}
