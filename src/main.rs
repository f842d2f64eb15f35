//! `agentforge` command line.
//!
//! - `run`: execute the pipeline over a spec file
//! - `steps`: print the step log of a run
//! - `rollback`: delete the artifacts a run wrote
//! - `config`: print the effective configuration
//! - `init-db`: create the run store schema

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use agentforge::stages::{StageEnv, build_agents, standard_tools};
use agentforge::{
    PipelineConfig, PipelineError, RunState, RunStore, Runner, SqliteRunStore, load_config, logging,
};

#[derive(Parser)]
#[command(name = "agentforge")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run the agent pipeline and inspect its run history", long_about = None)]
struct Cli {
    /// Pipeline configuration (TOML). Defaults apply when the file is missing.
    #[arg(short, long, global = true, default_value = "agentforge.toml")]
    config: PathBuf,

    /// Run store location, overriding `database.path`.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline over a spec file
    Run {
        /// Spec document (JSON, or TOML with a .toml extension)
        #[arg(short, long)]
        spec: PathBuf,

        /// Directory generated artifacts are written to
        #[arg(short, long)]
        output: PathBuf,

        /// First agent to run (default: `start_agent` from config)
        #[arg(long)]
        start: Option<String>,

        /// Markdown documents searched by the research tool
        #[arg(long)]
        docs: Option<PathBuf>,

        /// JSON Schema the spec is validated against
        #[arg(long)]
        schema: Option<PathBuf>,

        /// Skip network calls and external commands
        #[arg(long)]
        offline: bool,

        /// Force a handoff, as FROM=TO (repeatable)
        #[arg(long = "override", value_name = "FROM=TO")]
        overrides: Vec<String>,
    },

    /// Print the recorded steps of a run
    Steps {
        run_id: Uuid,
    },

    /// Remove every artifact a run recorded and mark it rolled back
    Rollback {
        run_id: Uuid,
    },

    /// Print the effective configuration as TOML
    Config,

    /// Create the run store schema
    InitDb,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let vars: Vec<(String, String)> = std::env::vars().collect();

    let mut config = load_config(&cli.config)
        .with_context(|| format!("load config {}", cli.config.display()))?
        .with_env_overrides(vars.iter().map(|(key, value)| (key, value.clone())))
        .context("apply environment overrides")?;
    if let Some(db) = cli.db {
        config.database.path = db;
    }
    config.validate().context("validate config")?;
    logging::init(&config.observability);

    match cli.command {
        Commands::Run {
            spec,
            output,
            start,
            docs,
            schema,
            offline,
            overrides,
        } => {
            config.offline |= offline;
            let env = StageEnv {
                docs_root: docs,
                schema_path: schema,
                api_key: None,
            }
            .with_api_key_from(&config.synthesis.api_key_env, vars);
            run(&config, &env, spec, output, start, &overrides)
        }
        Commands::Steps { run_id } => {
            let store = open_store(&config)?;
            let steps = store.steps(run_id)?;
            if steps.is_empty() {
                bail!("no steps recorded for run {run_id}");
            }
            println!("{}", serde_json::to_string_pretty(&steps)?);
            Ok(())
        }
        Commands::Rollback { run_id } => {
            let store = open_store(&config)?;
            let report = store
                .rollback(run_id)
                .with_context(|| format!("rollback run {run_id}"))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::InitDb => {
            open_store(&config)?;
            println!("initialized {}", config.database.path.display());
            Ok(())
        }
    }
}

fn open_store(config: &PipelineConfig) -> Result<SqliteRunStore> {
    SqliteRunStore::open(&config.database.path)
        .with_context(|| format!("open run store {}", config.database.path.display()))
}

fn run(
    config: &PipelineConfig,
    env: &StageEnv,
    spec: PathBuf,
    output: PathBuf,
    start: Option<String>,
    overrides: &[String],
) -> Result<()> {
    let tools = standard_tools(config, env).context("build tools")?;
    let registry = build_agents(config, &tools).context("build agents")?;
    let store = open_store(config)?;

    let mut runner = Runner::from_config(Arc::new(registry), Arc::new(store), config).with_tracing();
    for pair in overrides {
        let Some((from, to)) = pair.split_once('=') else {
            bail!("override must look like FROM=TO, got '{pair}'");
        };
        runner = runner.with_override(from.trim(), to.trim());
    }

    let start = start.unwrap_or_else(|| config.start_agent.clone());
    let mut state = RunState::new(spec, output);
    let result = match runner.run(&start, &mut state) {
        Ok(result) => result,
        Err(PipelineError::StageFailed { result, source, .. }) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            return Err(source).context("pipeline failed");
        }
        Err(err) => return Err(err).context("pipeline aborted"),
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.is_completed() {
        bail!("pipeline finished with status {}", result.status);
    }
    Ok(())
}
