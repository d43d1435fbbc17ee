//! redis-copy - resumable, batched Redis key-space copy
//!
//! Every `copy` invocation moves at most `--limit` keys per database and
//! exits; run it repeatedly (cron, a shell loop) until it reports completion.
#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use redis_copy::config::{parse_databases, Config, Endpoint, ListPolicy, LogFormat};
use redis_copy::migration::{self, BatchOutcome, CycleReport, GuardState, Migration, StatusReport};
use redis_copy::store::{KeyValueStore, RedisStore};
use tracing::info;

/// Default config file looked up in the working directory
const DEFAULT_CONFIG_FILE: &str = "redis-copy.toml";

/// redis-copy - copy Redis databases in resumable batches
#[derive(Parser, Debug)]
#[command(name = "redis-copy")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to configuration file (TOML)
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Source server as host:port (overrides config file)
    #[arg(
        short = 's',
        long = "source",
        value_name = "HOST:PORT",
        env = "REDIS_COPY_SOURCE",
        global = true
    )]
    source: Option<String>,

    /// Target server as host:port (overrides config file)
    #[arg(
        short = 't',
        long = "target",
        value_name = "HOST:PORT",
        env = "REDIS_COPY_TARGET",
        global = true
    )]
    target: Option<String>,

    /// Comma-separated database indices, e.g. 2,5 (overrides config file)
    #[arg(
        short = 'd',
        long = "databases",
        value_name = "LIST",
        env = "REDIS_COPY_DATABASES",
        global = true
    )]
    databases: Option<String>,

    /// Maximum keys copied per database in this run (overrides config file)
    #[arg(
        short = 'l',
        long = "limit",
        value_name = "N",
        env = "REDIS_COPY_LIMIT",
        global = true
    )]
    limit: Option<usize>,

    /// How lists are written to the target (overrides config file)
    #[arg(
        long = "list-policy",
        value_enum,
        env = "REDIS_COPY_LIST_POLICY",
        global = true
    )]
    list_policy: Option<ListPolicyArg>,

    /// Log level: trace, debug, info, warn, error (overrides config file)
    #[arg(
        long = "log-level",
        value_name = "LEVEL",
        env = "REDIS_COPY_LOG_LEVEL",
        global = true
    )]
    log_level: Option<String>,

    /// Print the result as JSON instead of a summary
    #[arg(long = "json", action = ArgAction::SetTrue, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Copy the next batch of keys (default if no command specified)
    Copy,

    /// Show progress recorded on the source without changing anything
    Status,

    /// Clear a stuck run flag on the source
    Unlock {
        /// Also clear a flag whose lease has not expired
        #[arg(long = "force", action = ArgAction::SetTrue)]
        force: bool,
    },
}

/// CLI-friendly list policy enum
#[derive(Clone, Copy, Debug, ValueEnum)]
enum ListPolicyArg {
    /// Delete the target list before pushing
    Replace,
    /// Push onto whatever the target list holds
    Append,
}

impl From<ListPolicyArg> for ListPolicy {
    fn from(arg: ListPolicyArg) -> Self {
        match arg {
            ListPolicyArg::Replace => ListPolicy::Replace,
            ListPolicyArg::Append => ListPolicy::Append,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = load_config(&cli)?;
    apply_overrides(&mut config, &cli)?;
    init_logging(&config);

    match cli.command {
        Some(Commands::Copy) | None => cmd_copy(&config, cli.json).await,
        Some(Commands::Status) => cmd_status(&config, cli.json).await,
        Some(Commands::Unlock { force }) => cmd_unlock(&config, force, cli.json).await,
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    if let Some(path) = &cli.config {
        if !path.exists() {
            anyhow::bail!("config file {} not found", path.display());
        }
        return Config::from_file(path).with_context(|| format!("loading {}", path.display()));
    }

    let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
    if default_path.exists() {
        return Config::from_file(&default_path)
            .with_context(|| format!("loading {}", default_path.display()));
    }

    Ok(Config::default())
}

fn apply_overrides(config: &mut Config, cli: &Cli) -> anyhow::Result<()> {
    if let Some(source) = &cli.source {
        config.source = Some(source.parse::<Endpoint>()?);
    }
    if let Some(target) = &cli.target {
        config.target = Some(target.parse::<Endpoint>()?);
    }
    if let Some(databases) = &cli.databases {
        config.databases = parse_databases(databases)?;
    }
    if let Some(limit) = cli.limit {
        config.limit = limit;
    }
    if let Some(policy) = cli.list_policy {
        config.copy.list_policy = policy.into();
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    Ok(())
}

fn init_logging(config: &Config) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    // Logs go to stderr so `--json` output on stdout stays parseable.
    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().pretty().with_writer(std::io::stderr))
                .init();
        }
    }
}

async fn connect_source(config: &Config) -> anyhow::Result<Arc<dyn KeyValueStore>> {
    let endpoint = config
        .source
        .clone()
        .context("source endpoint is required (--source or `source` in the config file)")?;
    let mut dbs = config.databases.clone();
    dbs.extend(config.control.database);
    let store = RedisStore::connect(endpoint.clone(), &dbs)
        .await
        .with_context(|| format!("connecting to source {}", endpoint))?;
    Ok(Arc::new(store))
}

// ── Copy ─────────────────────────────────────────────────────────────

async fn cmd_copy(config: &Config, json: bool) -> anyhow::Result<ExitCode> {
    config.validate()?;
    let (_, target_endpoint) = config.endpoints()?;

    let source = connect_source(config).await?;
    let target: Arc<dyn KeyValueStore> = Arc::new(
        RedisStore::connect(target_endpoint.clone(), &config.databases)
            .await
            .with_context(|| format!("connecting to target {}", target_endpoint))?,
    );

    let migration = Migration::new(config, source, target)?;
    info!(
        source = %migration.source_endpoint(),
        target_server = %migration.target_endpoint(),
        databases = ?config.databases,
        limit = config.limit,
        "starting copy cycle"
    );
    let report = migration.run_cycle().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_cycle(&report);
    }
    Ok(ExitCode::SUCCESS)
}

fn print_cycle(report: &CycleReport) {
    println!(
        "{} Copy cycle {} → {}",
        "→".cyan().bold(),
        report.source.yellow(),
        report.target.yellow()
    );
    if report.flushed {
        println!("  {} target databases flushed", "!".yellow().bold());
    }
    println!();

    for db in &report.databases {
        let listed = if db.listed_now { " (listed now)".dimmed() } else { "".normal() };
        println!("{}{}", db.servername.bold(), listed);
        match &db.batch {
            BatchOutcome::AlreadyComplete { total } => {
                println!("  {} all {} keys already copied", "✓".green(), total);
            }
            BatchOutcome::Copied {
                from,
                to,
                total,
                copied,
                skipped,
            } => {
                println!("  Range:    {}..{} of {}", from, to, total);
                println!("  Copied:   {}", copied);
                if *skipped > 0 {
                    println!("  Skipped:  {}", skipped.to_string().yellow());
                }
            }
        }
        if db.db_size != db.snapshot_len {
            println!(
                "  {} source holds {} keys, snapshot has {}",
                "⚠".yellow(),
                db.db_size,
                db.snapshot_len
            );
        }
    }
    println!();

    let elapsed = report.finished_at - report.started_at;
    if report.is_complete() {
        println!(
            "{} {} (copied {} keys in {} ms)",
            "✓".green().bold(),
            "Migration complete".green(),
            report.keys_copied(),
            elapsed.num_milliseconds()
        );
    } else {
        println!(
            "{} copied {} keys in {} ms; run again to continue",
            "→".cyan().bold(),
            report.keys_copied(),
            elapsed.num_milliseconds()
        );
    }
}

// ── Status ───────────────────────────────────────────────────────────

async fn cmd_status(config: &Config, json: bool) -> anyhow::Result<ExitCode> {
    config.validate_source()?;
    let source = connect_source(config).await?;
    let report = migration::status(config, source).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_status(&report);
    }
    Ok(ExitCode::SUCCESS)
}

fn print_status(report: &StatusReport) {
    println!("{}", "Migration Status".bold().underline());
    println!("  Source:        {}", report.source);
    println!("  Run guard:     {}", describe_guard(&report.guard));
    println!(
        "  Target flush:  {}",
        if report.target_flushed {
            "done".green()
        } else {
            "pending".yellow()
        }
    );
    println!();

    for db in &report.databases {
        let cp = &db.checkpoint;
        let state = if !db.listed {
            "not listed".dimmed()
        } else if cp.is_complete() {
            "complete".green()
        } else {
            "in progress".yellow()
        };
        println!(
            "  {:24} {:>10}/{:<10} {:>6.1}%  {}",
            db.servername,
            cp.cursor,
            cp.total,
            cp.percent(),
            state
        );
    }
}

// ── Unlock ───────────────────────────────────────────────────────────

async fn cmd_unlock(config: &Config, force: bool, json: bool) -> anyhow::Result<ExitCode> {
    config.validate_source()?;
    let source = connect_source(config).await?;
    let previous = migration::unlock(config, source, force).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&previous)?);
    } else if previous == GuardState::Free {
        println!("{} run guard was not held", "✓".green());
    } else {
        println!(
            "{} cleared run guard ({})",
            "✓".green().bold(),
            describe_guard(&previous)
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn describe_guard(state: &GuardState) -> String {
    match state {
        GuardState::Free => "free".to_string(),
        GuardState::Held { remaining_ms } => {
            format!("held, lease expires in {}s", remaining_ms / 1000)
        }
        GuardState::Stale { value } => format!("stale (value {:?}, no lease)", value),
    }
}
