use anyhow::{anyhow, bail, Context};
use hy_controller::{
    ControllerConfig, ControllerRuntime, ExperimentController, Manager, ProcessWorkload,
};
use hy_earlystop::EarlyStoppingService;
use hy_metrics::parse_metrics_log;
use hy_store::{MemoryStore, Store};
use hy_suggest::SuggestionService;
use hy_types::ExperimentSpec;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug)]
enum Command {
    Run { experiment: PathBuf },
    Validate { experiment: PathBuf },
    Suggest { experiment: PathBuf, count: i32 },
    ParseMetrics {
        log: PathBuf,
        objective: String,
        additional: Vec<String>,
    },
    Help,
}

struct CommandSpec {
    name: &'static str,
    usage: &'static str,
    parse: fn(&[String]) -> anyhow::Result<Command>,
}

const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "run",
        usage: "run <experiment.json>            run trials as local processes until done",
        parse: parse_run,
    },
    CommandSpec {
        name: "validate",
        usage: "validate <experiment.json>       check an experiment definition",
        parse: parse_validate,
    },
    CommandSpec {
        name: "suggest",
        usage: "suggest <experiment.json> <n>    print n assignment sets",
        parse: parse_suggest,
    },
    CommandSpec {
        name: "parse-metrics",
        usage: "parse-metrics <log> <objective> [metric...]  parse a metrics log",
        parse: parse_parse_metrics,
    },
    CommandSpec {
        name: "help",
        usage: "help                             show this message",
        parse: parse_help,
    },
];

fn parse_help(_args: &[String]) -> anyhow::Result<Command> {
    Ok(Command::Help)
}

fn parse_run(args: &[String]) -> anyhow::Result<Command> {
    match args {
        [path] => Ok(Command::Run {
            experiment: path.into(),
        }),
        _ => bail!("expected exactly one experiment file"),
    }
}

fn parse_validate(args: &[String]) -> anyhow::Result<Command> {
    match args {
        [path] => Ok(Command::Validate {
            experiment: path.into(),
        }),
        _ => bail!("expected exactly one experiment file"),
    }
}

fn parse_suggest(args: &[String]) -> anyhow::Result<Command> {
    match args {
        [path, count] => Ok(Command::Suggest {
            experiment: path.into(),
            count: count
                .parse()
                .with_context(|| format!("invalid count {count}"))?,
        }),
        _ => bail!("expected an experiment file and a count"),
    }
}

fn parse_parse_metrics(args: &[String]) -> anyhow::Result<Command> {
    match args {
        [log, objective, additional @ ..] => Ok(Command::ParseMetrics {
            log: log.into(),
            objective: objective.clone(),
            additional: additional.to_vec(),
        }),
        _ => bail!("expected a log file and an objective metric"),
    }
}

fn parse_command(args: &[String]) -> anyhow::Result<Command> {
    let Some((name, rest)) = args.split_first() else {
        return Ok(Command::Help);
    };
    let spec = COMMANDS
        .iter()
        .find(|c| c.name == name)
        .ok_or_else(|| anyhow!("unknown command {name}; try `hy-manager help`"))?;
    (spec.parse)(rest).with_context(|| format!("usage: hy-manager {}", spec.usage))
}

fn print_help() {
    println!("hy-manager: drive Halyard experiments on this machine\n");
    for command in COMMANDS {
        println!("  hy-manager {}", command.usage);
    }
}

fn load_spec(path: &Path) -> anyhow::Result<ExperimentSpec> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn in_memory_manager(store: Arc<dyn Store>) -> (Manager, Arc<SuggestionService>, Arc<EarlyStoppingService>) {
    let suggestions = Arc::new(SuggestionService::new());
    let early_stopping = Arc::new(EarlyStoppingService::new());
    let manager = Manager::new(store, suggestions.clone(), early_stopping.clone());
    (manager, suggestions, early_stopping)
}

async fn run(path: &Path) -> anyhow::Result<()> {
    let spec = load_spec(path)?;
    let name = spec.study.name.clone();
    let config = ControllerConfig::from_env()?;

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let workload = Arc::new(ProcessWorkload::new(store.clone()));
    let (manager, suggestions, early_stopping) = in_memory_manager(store.clone());
    let controller = ExperimentController::new(
        store.clone(),
        workload.clone(),
        workload,
        suggestions,
        early_stopping,
    )
    .with_poll_interval(config.poll_interval());
    let runtime = ControllerRuntime::new(Arc::new(controller), config.clone());
    let manager = manager.with_queue(runtime.handle());

    let (shutdown, shutdown_rx) = watch::channel(false);
    let runtime = tokio::spawn(runtime.run(shutdown_rx));

    manager.create_experiment(spec).await?;
    info!(experiment = %name, "waiting for experiment to finish");

    let mut ticker = tokio::time::interval(config.poll_interval());
    let experiment = loop {
        tokio::select! {
            _ = ticker.tick() => {
                let experiment = manager.get_experiment(&name).await?;
                if experiment.is_terminal() {
                    break experiment;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!(experiment = %name, "interrupted; deleting experiment");
                manager.delete_experiment(&name).await?;
                while manager.get_experiment(&name).await.is_ok() {
                    tokio::time::sleep(config.poll_interval()).await;
                }
                let _ = shutdown.send(true);
                runtime.await?;
                bail!("interrupted");
            }
        }
    };

    let trials = manager.list_trials(&name).await?;
    let _ = shutdown.send(true);
    runtime.await?;

    let report = json!({
        "experiment": name,
        "status": experiment.status,
        "total_issued": experiment.total_issued,
        "trials": trials,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn validate(path: &Path) -> anyhow::Result<()> {
    let spec = load_spec(path)?;
    let (manager, _, _) = in_memory_manager(Arc::new(MemoryStore::new()));
    manager.validate_experiment(&spec)?;
    println!("{}: ok", spec.study.name);
    Ok(())
}

async fn suggest(path: &Path, count: i32) -> anyhow::Result<()> {
    let spec = load_spec(path)?;
    let name = spec.study.name.clone();
    let (manager, _, _) = in_memory_manager(Arc::new(MemoryStore::new()));
    manager.create_experiment(spec).await?;
    let suggestions = manager.get_suggestions(&name, count).await?;
    println!("{}", serde_json::to_string_pretty(&suggestions)?);
    Ok(())
}

fn parse_metrics(log: &Path, objective: &str, additional: &[String]) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(log)
        .with_context(|| format!("reading {}", log.display()))?;
    let parsed = parse_metrics_log(&text, objective, additional);
    let report = json!({
        "metrics": parsed.observation.metrics,
        "error": parsed.error.map(|e| e.to_string()),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match parse_command(&args)? {
        Command::Run { experiment } => run(&experiment).await,
        Command::Validate { experiment } => validate(&experiment).await,
        Command::Suggest { experiment, count } => suggest(&experiment, count).await,
        Command::ParseMetrics {
            log,
            objective,
            additional,
        } => parse_metrics(&log, &objective, &additional),
        Command::Help => {
            print_help();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn dispatches_through_the_table() {
        assert!(matches!(
            parse_command(&args(&["run", "exp.json"])).unwrap(),
            Command::Run { .. }
        ));
        assert!(matches!(
            parse_command(&args(&["suggest", "exp.json", "3"])).unwrap(),
            Command::Suggest { count: 3, .. }
        ));
        match parse_command(&args(&["parse-metrics", "out.log", "accuracy", "loss"])).unwrap() {
            Command::ParseMetrics { objective, additional, .. } => {
                assert_eq!(objective, "accuracy");
                assert_eq!(additional, vec!["loss".to_string()]);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(matches!(parse_command(&[]).unwrap(), Command::Help));
    }

    #[test]
    fn rejects_bad_invocations() {
        assert!(parse_command(&args(&["launch"])).is_err());
        assert!(parse_command(&args(&["run"])).is_err());
        assert!(parse_command(&args(&["suggest", "exp.json", "many"])).is_err());
    }

    #[test]
    fn every_command_has_usage() {
        for command in COMMANDS {
            assert!(command.usage.starts_with(command.name));
        }
    }
}
