//! `gauntlet` command line

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use gauntlet_core::{
    Executor, JobConfig, OrchestrationResult, Orchestrator, SimulatedProcedure,
    SimulatedTransportFactory,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("gauntlet")
        .version(gauntlet_core::VERSION)
        .about("Adverse-condition test execution and orchestration")
        .subcommand_required(true)
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON"),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run a job file against the built-in simulator")
                .arg(config_arg())
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .value_parser(value_parser!(u64))
                        .help("Override every seed in the job file"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print the result as JSON"),
                ),
        )
        .subcommand(
            Command::new("validate")
                .about("Parse and validate a job file")
                .arg(config_arg()),
        )
}

fn config_arg() -> Arg {
    Arg::new("config")
        .long("config")
        .short('c')
        .required(true)
        .value_parser(value_parser!(PathBuf))
        .help("Job file (.toml or .json)")
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load(path: &Path) -> Result<JobConfig> {
    let config = JobConfig::load(path)
        .with_context(|| format!("loading job file {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("validating job file {}", path.display()))?;
    Ok(config)
}

async fn simulate(args: &ArgMatches) -> Result<i32> {
    let path = args
        .get_one::<PathBuf>("config")
        .context("--config is required")?;
    let mut config = load(path)?;
    if let Some(seed) = args.get_one::<u64>("seed") {
        config = config.with_seed(*seed);
    }

    let simulation = config.simulation.clone();
    let executor = Executor::new(Arc::new(SimulatedTransportFactory::new(simulation.clone())))
        .with_config(config.executor_config());
    let job = config.into_job(SimulatedProcedure::new(simulation).into_procedure());
    let result = Orchestrator::new(executor).orchestrate(job).await?;

    print_result(&result, args.get_flag("json"))?;
    Ok(result.exit_code())
}

fn print_result(result: &OrchestrationResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else {
        println!("{}", result.generate_text());
    }
    Ok(())
}

fn validate(args: &ArgMatches) -> Result<i32> {
    let path = args
        .get_one::<PathBuf>("config")
        .context("--config is required")?;
    let config = load(path)?;
    println!(
        "{}: ok ({:?}, {} replications, target {})",
        path.display(),
        config.strategy,
        config.replications,
        config.target
    );
    Ok(0)
}

async fn dispatch(matches: &ArgMatches) -> Result<i32> {
    match matches.subcommand() {
        Some(("simulate", args)) => simulate(args).await,
        Some(("validate", args)) => validate(args),
        _ => anyhow::bail!("unknown command"),
    }
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("log-json"));

    let code = match dispatch(&matches).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            2
        }
    };
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    const JOB: &str = r#"
        target = "https://sim.test"
        replications = 4
        strategy = "parallel"
        concurrency = 2

        [behavior]
        preset = "none"

        [simulation]
        steps = 2
        success_probability = 0.0
        expected = false
    "#;

    fn job_file(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.toml");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn command_definition_is_consistent() {
        cli().debug_assert();
    }

    #[tokio::test]
    async fn simulate_blocked_job_passes() {
        let (_dir, path) = job_file(JOB);
        let matches = cli()
            .try_get_matches_from(["gauntlet", "simulate", "--config", path.to_str().unwrap(), "--json"])
            .unwrap();
        assert_eq!(dispatch(&matches).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn validate_rejects_bad_probability() {
        let (_dir, path) = job_file(&JOB.replace("success_probability = 0.0", "success_probability = 2.0"));
        let matches = cli()
            .try_get_matches_from(["gauntlet", "validate", "-c", path.to_str().unwrap()])
            .unwrap();
        let err = dispatch(&matches).await.unwrap_err();
        assert!(format!("{err:#}").contains("success_probability"));
    }
}
