use cairn_engine::prelude::*;
use cairn_test_utils::{ms, CollectingChannel, ScriptedProvider};
use pretty_assertions::assert_eq;

fn account_token_url(graph: &mut GraphBuilder) -> (Resource, Resource, Output) {
    let acct = graph
        .declare("acct", ResourceArgs::new("storage:Account").output("name"))
        .unwrap();
    let token = graph
        .declare(
            "token",
            ResourceArgs::new("storage:Sas")
                .input("account", acct.output("name").unwrap())
                .secret_output("value"),
        )
        .unwrap();
    let url = graph.concat([
        Input::from("https://"),
        acct.output("name").unwrap().into(),
        ".blob/c?".into(),
        token.output("value").unwrap().into(),
    ]);
    (acct, token, url)
}

#[tokio::test]
async fn test_account_token_url_end_to_end() {
    let (provider, registry) = ScriptedProvider::new()
        .outputs("acct", [("name", "acct1")])
        .outputs("token", [("value", "sig=abc")])
        .into_registry();

    let mut graph = GraphBuilder::new();
    let (acct, _token, url) = account_token_url(&mut graph);
    graph.export("account", acct.output("name").unwrap()).unwrap();
    graph.export("url", url).unwrap();

    let outcome = Scheduler::new(registry).deploy(graph).await.unwrap();
    assert!(outcome.is_success());
    assert_eq!(
        outcome.value(url),
        Some(Value::from("https://acct1.blob/c?sig=abc"))
    );

    let rendered = ExportSink::new().render(&outcome).unwrap();
    assert_eq!(
        rendered.get("account"),
        Some(&Rendered::Plain(Value::from("acct1")))
    );
    assert_eq!(rendered.get("url"), Some(&Rendered::Secret));

    let mut channel = CollectingChannel::new();
    ExportSink::new().deliver_secrets(&outcome, &mut channel);
    assert_eq!(
        channel.get("url"),
        Some(&Value::from("https://acct1.blob/c?sig=abc"))
    );

    // The token provider saw the resolved account name
    let call = provider.call("token").unwrap();
    assert_eq!(call.inputs.get("account"), Some(&Value::from("acct1")));
    assert!(call.secret_inputs.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_concat_order_does_not_depend_on_completion_order() {
    let (_provider, registry) = ScriptedProvider::new()
        .outputs("x", [("v", "x")])
        .outputs("y", [("v", "y")])
        .latency("x", ms(80))
        .latency("y", ms(5))
        .into_registry();

    let mut graph = GraphBuilder::new();
    let x = graph
        .declare("x", ResourceArgs::new("test:Value").output("v"))
        .unwrap();
    let y = graph
        .declare("y", ResourceArgs::new("test:Value").output("v"))
        .unwrap();
    let xy = graph.concat([x.output("v").unwrap(), y.output("v").unwrap()]);
    let listed = graph.all([y.output("v").unwrap(), x.output("v").unwrap()]);

    let outcome = Scheduler::new(registry).deploy(graph).await.unwrap();
    assert_eq!(outcome.value(xy), Some(Value::from("xy")));
    assert_eq!(
        outcome.value(listed),
        Some(Value::List(vec![Value::from("y"), Value::from("x")]))
    );
}

#[tokio::test]
async fn test_failure_is_isolated_to_dependents() {
    let (provider, registry) = ScriptedProvider::new()
        .fail("a", "quota exceeded")
        .into_registry();

    let mut graph = GraphBuilder::new();
    let a = graph
        .declare("a", ResourceArgs::new("test:Node").output("id"))
        .unwrap();
    let b = graph
        .declare("b", ResourceArgs::new("test:Node").output("id"))
        .unwrap();
    let after_a = graph
        .declare(
            "after_a",
            ResourceArgs::new("test:Node")
                .input("peer", a.output("id").unwrap())
                .output("id"),
        )
        .unwrap();
    let after_b = graph
        .declare(
            "after_b",
            ResourceArgs::new("test:Node")
                .input("peer", b.output("id").unwrap())
                .output("id"),
        )
        .unwrap();
    let both = graph.concat([a.output("id").unwrap(), b.output("id").unwrap()]);

    let outcome = Scheduler::new(registry).deploy(graph).await.unwrap();

    assert_eq!(outcome.state(a.id()), NodeState::Failed);
    assert_eq!(outcome.state(b.id()), NodeState::Resolved);
    assert_eq!(outcome.state(after_b.id()), NodeState::Resolved);
    assert_eq!(outcome.state(after_a.id()), NodeState::Failed);
    assert_eq!(outcome.state(both.id()), NodeState::Failed);
    assert!(!provider.was_called("after_a"));

    assert_eq!(
        outcome.failure(after_a.id()),
        Some(ResolutionError::DependencyFailure {
            node: "after_a".into(),
            origin: "a".into(),
        })
    );
    assert_eq!(
        outcome.root_cause(both.id()),
        Some(ResolutionError::ExternalResourceFailure {
            resource: "a".into(),
            message: "quota exceeded".into(),
        })
    );
    assert_eq!(outcome.origin_failures().len(), 1);
}

#[tokio::test]
async fn test_cycle_is_rejected_before_any_provider_call() {
    let (provider, registry) = ScriptedProvider::new().into_registry();

    let mut graph = GraphBuilder::new();
    let later = graph.output_of("b", "id");
    let a = graph
        .declare(
            "a",
            ResourceArgs::new("test:Node").input("peer", later).output("id"),
        )
        .unwrap();
    graph
        .declare(
            "b",
            ResourceArgs::new("test:Node")
                .input("peer", a.output("id").unwrap())
                .output("id"),
        )
        .unwrap();
    graph.declare("c", ResourceArgs::new("test:Node")).unwrap();

    match Scheduler::new(registry).deploy(graph).await {
        Err(RunError::Construction(GraphError::CyclicDependency { nodes })) => {
            assert!(nodes.contains(&"a".to_string()));
            assert!(nodes.contains(&"b".to_string()));
            assert!(!nodes.contains(&"c".to_string()));
        }
        other => panic!("expected a cycle, got {other:?}"),
    }
    assert_eq!(provider.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_independent_resources_resolve_concurrently() {
    let (provider, registry) = ScriptedProvider::new()
        .default_latency(ms(100))
        .into_registry();

    let mut graph = GraphBuilder::new();
    for i in 0..5 {
        graph
            .declare(format!("r{i}"), ResourceArgs::new("test:Node").output("id"))
            .unwrap();
    }

    let outcome = Scheduler::new(registry).deploy(graph).await.unwrap();
    assert!(outcome.is_success());
    assert_eq!(provider.peak_concurrency(), 5);
    assert!(outcome.elapsed() >= ms(100));
    assert!(outcome.elapsed() < ms(150), "took {:?}", outcome.elapsed());
}

#[tokio::test(start_paused = true)]
async fn test_parallelism_limit_is_respected() {
    let (provider, registry) = ScriptedProvider::new()
        .default_latency(ms(100))
        .into_registry();

    let mut graph = GraphBuilder::new();
    for i in 0..4 {
        graph
            .declare(format!("r{i}"), ResourceArgs::new("test:Node").output("id"))
            .unwrap();
    }

    let config = SchedulerConfig {
        max_parallelism: 2,
        ..SchedulerConfig::default()
    };
    let outcome = Scheduler::with_config(registry, config)
        .deploy(graph)
        .await
        .unwrap();
    assert!(outcome.is_success());
    assert_eq!(provider.peak_concurrency(), 2);
    assert!(outcome.elapsed() >= ms(200));
}

#[tokio::test(start_paused = true)]
async fn test_dependent_resource_starts_after_its_input() {
    let (provider, registry) = ScriptedProvider::new()
        .default_latency(ms(50))
        .into_registry();

    let mut graph = GraphBuilder::new();
    let (_acct, _token, _url) = account_token_url(&mut graph);

    let outcome = Scheduler::new(registry).deploy(graph).await.unwrap();
    assert!(outcome.is_success());
    let acct = provider.call("acct").unwrap();
    let token = provider.call("token").unwrap();
    assert!(token.started >= acct.finished);
    assert!(outcome.elapsed() >= ms(100));
}

#[tokio::test]
async fn test_secret_inputs_are_flagged_for_providers() {
    let (provider, registry) = ScriptedProvider::new().into_registry();

    let mut graph = GraphBuilder::new();
    let pwd = graph.secret("hunter2");
    let conn = graph.format("user=admin;password={}", [pwd]);
    graph
        .declare(
            "db",
            ResourceArgs::new("sql:Database")
                .input("connection", conn)
                .input("sku", "S0"),
        )
        .unwrap();

    Scheduler::new(registry).deploy(graph).await.unwrap();
    let call = provider.call("db").unwrap();
    assert!(call.secret_inputs.contains("connection"));
    assert!(!call.secret_inputs.contains("sku"));
    assert_eq!(
        call.inputs.get("connection"),
        Some(&Value::from("user=admin;password=hunter2"))
    );
}

#[tokio::test(start_paused = true)]
async fn test_fail_fast_stops_new_work() {
    let (provider, registry) = ScriptedProvider::new()
        .fail("broken", "denied")
        .latency("broken", ms(10))
        .latency("slow", ms(100))
        .into_registry();

    let mut graph = GraphBuilder::new();
    graph
        .declare("broken", ResourceArgs::new("test:Node").output("id"))
        .unwrap();
    let slow = graph
        .declare("slow", ResourceArgs::new("test:Node").output("id"))
        .unwrap();
    let next = graph
        .declare(
            "next",
            ResourceArgs::new("test:Node")
                .input("peer", slow.output("id").unwrap())
                .output("id"),
        )
        .unwrap();

    let config = SchedulerConfig {
        failure_policy: FailurePolicy::FailFast,
        ..SchedulerConfig::default()
    };
    let outcome = Scheduler::with_config(registry, config)
        .deploy(graph)
        .await
        .unwrap();

    assert_eq!(outcome.state(slow.id()), NodeState::Resolved);
    assert!(!provider.was_called("next"));
    assert_eq!(
        outcome.failure(next.id()),
        Some(ResolutionError::Cancelled {
            node: "next".into()
        })
    );
}

#[tokio::test]
async fn test_journal_records_every_transition() {
    let (_provider, registry) = ScriptedProvider::new()
        .outputs("token", [("value", "sig=abc")])
        .into_registry();

    let mut graph = GraphBuilder::new();
    let (_acct, token, _url) = account_token_url(&mut graph);

    let outcome = Scheduler::new(registry).deploy(graph).await.unwrap();
    let journal = outcome.journal();
    assert!(journal.verify_integrity().is_ok());

    let entries = journal.entries();
    assert!(entries.iter().all(|e| !e.detail.contains("sig=abc")));
    let token_states: Vec<NodeState> = entries
        .iter()
        .filter(|e| e.node == token.name())
        .map(|e| e.to)
        .collect();
    assert_eq!(token_states, vec![NodeState::Resolving, NodeState::Resolved]);
}
