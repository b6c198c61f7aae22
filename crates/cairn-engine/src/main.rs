use anyhow::Context;
use cairn_engine::config::{
    ChainConfig, Config, ConfigSource, EngineConfig, EnvConfig, FileConfig, MemoryConfig,
};
use cairn_engine::export::{ExportSink, SecureChannel};
use cairn_engine::graph::GraphBuilder;
use cairn_engine::logging::init_tracing;
use cairn_engine::scheduler::{FailurePolicy, Scheduler};
use cairn_engine::test_harness::app_service::SQL_PASSWORD_KEY;
use cairn_engine::test_harness::{declare_app_service, SimulatedCloud, SimulatorConfig};
use cairn_engine::value::Value;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;
use std::sync::Arc;

/// Prints secret exports to stdout; only used with `--show-secrets`
struct StdoutChannel;

impl SecureChannel for StdoutChannel {
    fn deliver(&mut self, name: &str, value: &Value) {
        println!("{name} = {value}");
    }
}

fn cli() -> Command {
    let config_arg = Arg::new("config")
        .long("config")
        .short('c')
        .value_parser(value_parser!(PathBuf))
        .help("TOML file with [scheduler], [logging], [values] and [secrets] tables");

    Command::new("cairn")
        .version(cairn_engine::VERSION)
        .about("Deploy a declarative resource graph against a simulated cloud")
        .subcommand_required(true)
        .subcommand(
            Command::new("deploy")
                .about("Resolve the app-service stack and print its exports")
                .arg(config_arg.clone())
                .arg(
                    Arg::new("jobs")
                        .long("jobs")
                        .short('j')
                        .value_parser(value_parser!(usize))
                        .help("Maximum concurrent provider calls"),
                )
                .arg(
                    Arg::new("fail-fast")
                        .long("fail-fast")
                        .action(ArgAction::SetTrue)
                        .help("Start no new resources after the first failure"),
                )
                .arg(
                    Arg::new("fail")
                        .long("fail")
                        .action(ArgAction::Append)
                        .value_name("RESOURCE")
                        .help("Make the simulated cloud fail this resource (repeatable)"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Seed for simulated latencies and names"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print exports as JSON"),
                )
                .arg(
                    Arg::new("show-secrets")
                        .long("show-secrets")
                        .action(ArgAction::SetTrue)
                        .help("Also print plaintext secret exports"),
                ),
        )
        .subcommand(
            Command::new("plan")
                .about("Print the order in which resources would be created")
                .arg(config_arg),
        )
}

fn load_engine_config(path: Option<&PathBuf>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading engine settings from {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

fn stack_sources(path: Option<&PathBuf>) -> anyhow::Result<Vec<Arc<dyn ConfigSource>>> {
    let mut sources: Vec<Arc<dyn ConfigSource>> = vec![Arc::new(EnvConfig::new())];
    if let Some(path) = path {
        let file = FileConfig::load(path)
            .with_context(|| format!("loading stack values from {}", path.display()))?;
        sources.push(Arc::new(file));
    }
    Ok(sources)
}

async fn deploy(args: &ArgMatches) -> anyhow::Result<i32> {
    let config_path = args.get_one::<PathBuf>("config");
    let mut engine = load_engine_config(config_path)?;
    if let Some(jobs) = args.get_one::<usize>("jobs") {
        engine.scheduler.max_parallelism = *jobs;
    }
    if args.get_flag("fail-fast") {
        engine.scheduler.failure_policy = FailurePolicy::FailFast;
    }
    engine.validate()?;
    init_tracing(&engine.logging)?;

    let config = Config::from_source(Arc::new(ChainConfig::new(stack_sources(config_path)?)));
    let mut graph = GraphBuilder::new();
    declare_app_service(&mut graph, &config).with_context(|| {
        format!(
            "declaring the stack (set {} or add `{SQL_PASSWORD_KEY}` to [secrets])",
            EnvConfig::new().var_name(SQL_PASSWORD_KEY)
        )
    })?;
    let sealed = graph.seal()?;

    let simulator = SimulatorConfig {
        seed: *args.get_one::<u64>("seed").unwrap_or(&42),
        fail: args
            .get_many::<String>("fail")
            .map(|names| names.cloned().collect())
            .unwrap_or_default(),
        ..SimulatorConfig::default()
    };
    let cloud = Arc::new(SimulatedCloud::new(simulator));
    let scheduler = Scheduler::with_config(cloud.registry(), engine.scheduler);
    let outcome = scheduler.run(sealed).await;

    let sink = ExportSink::new();
    let (exports, code) = match sink.render(&outcome) {
        Ok(exports) => (exports, 0),
        Err(e) => {
            eprintln!("error: {e}");
            (sink.render_resolved(&outcome), 1)
        }
    };

    if args.get_flag("json") {
        println!("{}", exports.to_json()?);
    } else {
        print!("{}", exports.to_text());
    }
    if args.get_flag("show-secrets") {
        eprintln!("warning: printing secret values");
        sink.deliver_secrets(&outcome, &mut StdoutChannel);
    }

    eprintln!(
        "{} resource(s) created, {} node(s) failed in {}ms",
        cloud.calls().iter().filter(|c| !c.failed).count(),
        outcome.failed_count(),
        outcome.elapsed().as_millis()
    );
    Ok(code)
}

fn plan(args: &ArgMatches) -> anyhow::Result<i32> {
    let config_path = args.get_one::<PathBuf>("config");
    let engine = load_engine_config(config_path)?;
    init_tracing(&engine.logging)?;

    // Nothing resolves here, so a missing password only needs a stand-in
    let mut sources = stack_sources(config_path)?;
    sources.push(Arc::new(MemoryConfig::new().with_secret(SQL_PASSWORD_KEY, "")));
    let config = Config::from_source(Arc::new(ChainConfig::new(sources)));

    let mut graph = GraphBuilder::new();
    declare_app_service(&mut graph, &config)?;
    let sealed = graph.seal()?;

    for (index, wave) in sealed.resource_waves().iter().enumerate() {
        println!("wave {}: {}", index + 1, wave.join(", "));
    }
    println!();
    for (name, id) in sealed.exports() {
        let marker = if sealed.is_secret(id) { " (secret)" } else { "" };
        println!("export {name}{marker}");
    }
    Ok(0)
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();

    let result = match matches.subcommand() {
        Some(("deploy", args)) => deploy(args).await,
        Some(("plan", args)) => plan(args),
        _ => Ok(2),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(2);
        }
    }
}
