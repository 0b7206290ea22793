use anyhow::Context;
use autonomic_core::LoopConfig;
use autonomic_model::AgentConfig;
use autonomic_worker::{logging, run, run_simulator, LogFormat, RunOptions, SimulatorConfig};
use clap::{value_parser, Arg, ArgMatches, Command};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::BufReader;

fn cli() -> Command {
    Command::new("autonomic")
        .version(autonomic_worker::VERSION)
        .about("Autonomic control loop: audit, refine, evaluate and deploy agent configurations")
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .global(true)
                .default_value("pretty")
                .value_parser(value_parser!(LogFormat))
                .help("Log output: pretty or json"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("simulate")
                .about("Run the reference scenarios against scripted providers")
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for the load run"),
                )
                .arg(
                    Arg::new("agents")
                        .long("agents")
                        .default_value("8")
                        .value_parser(value_parser!(usize))
                        .help("Number of agents in the load run"),
                )
                .arg(
                    Arg::new("audits")
                        .long("audits")
                        .default_value("3")
                        .value_parser(value_parser!(usize))
                        .help("Maximum audits per agent in the load run"),
                ),
        )
        .subcommand(
            Command::new("run")
                .about("Serve audit requests (JSON lines on stdin) against the HTTP provider")
                .arg(config_arg())
                .arg(
                    Arg::new("agents")
                        .long("agents")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("JSON file with the initial configuration of every agent"),
                )
                .arg(
                    Arg::new("snapshot")
                        .long("snapshot")
                        .value_parser(value_parser!(PathBuf))
                        .help("Episode tracker snapshot, restored on start and written on exit"),
                )
                .arg(
                    Arg::new("drain-timeout")
                        .long("drain-timeout")
                        .default_value("300")
                        .value_parser(value_parser!(u64))
                        .help("Seconds to wait for in-flight episodes after input ends"),
                ),
        )
        .subcommand(
            Command::new("check-config")
                .about("Load, override from the environment and validate a config file")
                .arg(config_arg()),
        )
}

fn config_arg() -> Arg {
    Arg::new("config")
        .long("config")
        .value_parser(value_parser!(PathBuf))
        .help("TOML config file; defaults apply when omitted")
}

fn load_config(args: &ArgMatches) -> anyhow::Result<LoopConfig> {
    let config = match args.get_one::<PathBuf>("config") {
        Some(path) => LoopConfig::load(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => LoopConfig::default(),
    };
    let config = config.apply_env().context("applying AUTONOMIC_* overrides")?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn load_agents(path: &Path) -> anyhow::Result<Vec<AgentConfig>> {
    let bytes = std::fs::read(path).with_context(|| format!("reading agents {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing agents {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    let format = matches
        .get_one::<LogFormat>("log-format")
        .copied()
        .unwrap_or_default();
    logging::init(format)?;

    match matches.subcommand() {
        Some(("simulate", args)) => {
            let config = SimulatorConfig {
                seed: args.get_one::<u64>("seed").copied().unwrap_or(42),
                agents: args.get_one::<usize>("agents").copied().unwrap_or(8),
                audits_per_agent: args.get_one::<usize>("audits").copied().unwrap_or(3),
                ..SimulatorConfig::default()
            };
            let report = run_simulator(config).await;
            println!("{}", report.generate_text());
            std::process::exit(if report.passed() { 0 } else { 1 });
        }
        Some(("run", args)) => {
            let config = load_config(args)?;
            let agents_path = args
                .get_one::<PathBuf>("agents")
                .context("--agents is required")?;
            let options = RunOptions {
                config,
                agents: load_agents(agents_path)?,
                snapshot: args.get_one::<PathBuf>("snapshot").cloned(),
                drain_timeout: Duration::from_secs(
                    args.get_one::<u64>("drain-timeout").copied().unwrap_or(300),
                ),
            };
            let summary = run(options, BufReader::new(tokio::io::stdin())).await?;
            print!("{}", summary.generate_text());
            std::process::exit(if summary.drained { 0 } else { 1 });
        }
        Some(("check-config", args)) => {
            let config = load_config(args)?;
            println!("{}", config_summary(&config));
        }
        _ => {}
    }
    Ok(())
}

fn config_summary(config: &LoopConfig) -> String {
    format!(
        "config ok\n  max_attempts = {}\n  provider_timeout_ms = {}\n  max_deliveries = {}\n  lease_ms = {}\n  workers_per_stage = {}\n  topics = {} / {} / {}\n  provider = {} ({})",
        config.max_attempts,
        config.provider_timeout_ms,
        config.max_deliveries,
        config.lease_ms,
        config.workers_per_stage,
        config.topics.audit,
        config.topics.refine,
        config.topics.evaluate,
        config.provider.endpoint,
        config.provider.model_name,
    )
}
