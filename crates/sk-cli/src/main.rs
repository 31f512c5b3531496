//! Suspension kinematics command-line entry point

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use serde::Serialize;
use sk_core::{Project, ProjectError};
use sk_solver::{EngineContext, EngineError, SweepRequest, SweepSetter};

const USAGE: &str = "usage:
  sk solve <project.ron>
  sk sweep <project.ron> <global> <min> <max> <tolerance> [max_count]";

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error("Failed to load project: {0}")]
    Project(#[from] ProjectError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("Failed to write output: {0}")]
    Output(#[from] serde_json::Error),
}

enum Command {
    Solve {
        project: PathBuf,
    },
    Sweep {
        project: PathBuf,
        global: String,
        min: f64,
        max: f64,
        tolerance: f64,
        max_count: Option<usize>,
    },
}

fn parse_number<T: std::str::FromStr>(arg: Option<String>, what: &str) -> Result<T, CliError> {
    let arg = arg.ok_or_else(|| CliError::Usage(format!("missing {what}")))?;
    arg.parse()
        .map_err(|_| CliError::Usage(format!("invalid {what}: '{arg}'")))
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Command, CliError> {
    let command = args.next().ok_or_else(|| CliError::Usage("missing command".into()))?;
    let project = args
        .next()
        .map(PathBuf::from)
        .ok_or_else(|| CliError::Usage("missing project file".into()))?;

    match command.as_str() {
        "solve" => Ok(Command::Solve { project }),
        "sweep" => {
            let global = args.next().ok_or_else(|| CliError::Usage("missing global".into()))?;
            let min = parse_number(args.next(), "min")?;
            let max = parse_number(args.next(), "max")?;
            let tolerance = parse_number(args.next(), "tolerance")?;
            let max_count = match args.next() {
                Some(arg) => Some(parse_number(Some(arg), "max_count")?),
                None => None,
            };
            Ok(Command::Sweep {
                project,
                global,
                min,
                max,
                tolerance,
                max_count,
            })
        }
        other => Err(CliError::Usage(format!("unknown command '{other}'"))),
    }
}

fn load_context(path: &Path) -> Result<EngineContext, CliError> {
    let project = Project::load(path)?;
    tracing::info!("Loaded project '{}' from {}", project.name, path.display());
    Ok(EngineContext::from_project(project)?)
}

fn print_json(value: &impl Serialize) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run(command: Command) -> Result<(), CliError> {
    match command {
        Command::Solve { project } => {
            let mut context = load_context(&project)?;
            let result = context.solve()?;
            if result.reverted {
                tracing::warn!("No component converged, reverted to the rest pose");
            }
            for error in result.errors() {
                tracing::warn!("{}", error);
            }
            let stale = context.derived().stale().len();
            if stale > 0 {
                tracing::warn!("{} derived objects are stale", stale);
            }
            print_json(&context.snapshot())
        }
        Command::Sweep {
            project,
            global,
            min,
            max,
            tolerance,
            max_count,
        } => {
            let mut context = load_context(&project)?;
            context.solve()?;
            let mut request = SweepRequest::new(
                global.clone(),
                vec![SweepSetter::Global { name: global }],
                min,
                max,
                tolerance,
            );
            if let Some(max_count) = max_count {
                request = request.with_max_count(max_count);
            }
            let response = context.solve_max_v(&request)?;
            tracing::info!(
                "Sweep '{}' finished after {} invocations, max = {:?}",
                response.test_id,
                response.invocations,
                response.max_value
            );
            print_json(&response)
        }
    }
}

fn main() -> ExitCode {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sk_cli=info,sk_solver=info,sk_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let result = parse_args(std::env::args().skip(1)).and_then(run);
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(CliError::Usage(message)) => {
            tracing::error!("{}", message);
            eprintln!("{USAGE}");
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
