use cairn_engine::prelude::*;
use cairn_test_utils::{ms, ScriptedProvider};
use proptest::prelude::*;
use proptest::sample::Index;

/// One generated resource: inputs taken from earlier resources, whether its
/// output is secret, whether its creation fails, and its latency.
#[derive(Debug, Clone)]
struct Shape {
    deps: Vec<Index>,
    secret: bool,
    fails: bool,
    latency_ms: u64,
}

fn shapes() -> impl Strategy<Value = Vec<Shape>> {
    proptest::collection::vec(
        (
            proptest::collection::vec(any::<Index>(), 0..3),
            any::<bool>(),
            prop::bool::weighted(0.15),
            0..40u64,
        )
            .prop_map(|(deps, secret, fails, latency_ms)| Shape {
                deps,
                secret,
                fails,
                latency_ms,
            }),
        1..12,
    )
}

struct Built {
    graph: GraphBuilder,
    resources: Vec<Resource>,
    deps: Vec<Vec<usize>>,
    joined: Vec<Option<Output>>,
    provider: ScriptedProvider,
}

fn build(shapes: &[Shape]) -> Built {
    let mut graph = GraphBuilder::new();
    let mut provider = ScriptedProvider::new();
    let mut resources: Vec<Resource> = Vec::new();
    let mut deps = Vec::new();
    let mut joined = Vec::new();

    for (i, shape) in shapes.iter().enumerate() {
        let name = format!("r{i}");
        let my_deps: Vec<usize> = if i == 0 {
            Vec::new()
        } else {
            shape.deps.iter().map(|d| d.index(i)).collect()
        };

        let inputs: Vec<Output> = my_deps
            .iter()
            .map(|&j| resources[j].output("out").unwrap())
            .collect();
        let join = if inputs.is_empty() {
            None
        } else {
            Some(graph.concat(inputs.clone()))
        };

        let mut args = ResourceArgs::new("test:Node");
        for (k, input) in inputs.into_iter().enumerate() {
            args = args.input(format!("in{k}"), input);
        }
        args = if shape.secret {
            args.secret_output("out")
        } else {
            args.output("out")
        };

        resources.push(graph.declare(name.clone(), args).unwrap());
        provider = provider.latency(&name, ms(shape.latency_ms));
        if shape.fails {
            provider = provider.fail(&name, "injected");
        }
        deps.push(my_deps);
        joined.push(join);
    }

    Built {
        graph,
        resources,
        deps,
        joined,
        provider,
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap()
}

proptest! {
    #[test]
    fn prop_every_node_terminates(shapes in shapes()) {
        let built = build(&shapes);
        let (_provider, registry) = built.provider.into_registry();
        let outcome = runtime().block_on(Scheduler::new(registry).deploy(built.graph)).unwrap();

        let graph = outcome.graph();
        for &id in graph.topological_order() {
            prop_assert!(outcome.state(id).is_terminal(), "{} did not terminate", graph.label(id));
        }
        prop_assert_eq!(outcome.resolved_count() + outcome.failed_count(), graph.node_count());
    }

    #[test]
    fn prop_resources_fail_exactly_when_an_ancestor_fails(shapes in shapes()) {
        let built = build(&shapes);
        let resources = built.resources.clone();
        let deps = built.deps.clone();
        let (provider, registry) = built.provider.into_registry();
        let outcome = runtime().block_on(Scheduler::new(registry).deploy(built.graph)).unwrap();

        let mut ok = Vec::with_capacity(shapes.len());
        for (i, shape) in shapes.iter().enumerate() {
            let expected = !shape.fails && deps[i].iter().all(|&j| ok[j]);
            ok.push(expected);

            let state = outcome.state(resources[i].id());
            prop_assert_eq!(state == NodeState::Resolved, expected, "r{}", i);
            let upstream_failed = deps[i].iter().any(|&j| !ok[j]);
            prop_assert_eq!(provider.was_called(resources[i].name()), !upstream_failed);
        }
    }

    #[test]
    fn prop_concat_follows_declaration_order(shapes in shapes()) {
        let built = build(&shapes);
        let joined = built.joined.clone();
        let deps = built.deps.clone();
        let (_provider, registry) = built.provider.into_registry();
        let outcome = runtime().block_on(Scheduler::new(registry).deploy(built.graph)).unwrap();

        for (i, join) in joined.iter().enumerate() {
            let Some(join) = join else { continue };
            if let Some(value) = outcome.value(*join) {
                let expected: String = deps[i].iter().map(|j| format!("r{j}.out")).collect();
                prop_assert_eq!(value, Value::from(expected));
            }
        }
    }

    #[test]
    fn prop_secrecy_is_monotonic(shapes in shapes()) {
        let built = build(&shapes);
        let sealed = built.graph.seal().unwrap();

        for (i, shape) in shapes.iter().enumerate() {
            let out = built.resources[i].output("out").unwrap();
            // Resource outputs carry only their declared flag
            prop_assert_eq!(sealed.is_secret(out.id()), shape.secret);

            if let Some(join) = built.joined[i] {
                let tainted = built.deps[i].iter().any(|&j| shapes[j].secret);
                prop_assert_eq!(sealed.is_secret(join.id()), tainted);
            }
        }
    }
}
