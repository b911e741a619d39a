//! EDR agent entry point.
//!
//! - `run`: start probes, spool and sender until SIGINT/SIGTERM
//! - `spool`: inspect the local spool
//! - `config`: show or validate the effective configuration
//! - `host`: print the registration identity
//! - `version`

use clap::{Args, Parser, Subcommand, ValueEnum};
use edr_common::{StructuredError, AGENT_VERSION, SCHEMA_VERSION};
use edr_config::{load_config, validate_config, AgentConfig, LoadedConfig, ValidationError};
use edr_core::agent::Agent;
use edr_core::exit_codes::ExitCode;
use edr_core::host::collect_host_identity;
use edr_core::logging::{event_names, init_logging, LogConfig, LogFormat, LogLevel, Stage};
use edr_core::signal::Shutdown;
use edr_spool::Spool;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};

/// Host telemetry agent: process, network and file activity to a collector
#[derive(Parser)]
#[command(name = "edr-agent")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalOpts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Summary,
}

/// Options shared by every command
#[derive(Args, Debug)]
struct GlobalOpts {
    /// Path to agent.json
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format for command results
    #[arg(long, short = 'f', global = true, value_enum, default_value = "json")]
    format: OutputFormat,

    /// Log format on stderr (human, jsonl)
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent until interrupted
    Run(RunArgs),

    /// Inspect the local spool
    Spool(SpoolArgs),

    /// Configuration management
    Config(ConfigArgs),

    /// Print the identity sent on registration
    Host,

    /// Print version information
    Version,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Seconds probes get to flush on shutdown
    #[arg(long, default_value_t = 5)]
    grace_secs: u64,
}

#[derive(Args, Debug)]
struct SpoolArgs {
    #[command(subcommand)]
    command: SpoolCommands,

    /// Spool directory (overrides the configured one)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum SpoolCommands {
    /// Pending and quarantined counts
    Status,
    /// Pending entry ids, oldest first
    List {
        /// Show at most this many ids
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Quarantined entry ids
    Quarantine,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the effective configuration and where it came from
    Show,
    /// Validate a configuration file (defaults to the resolved one)
    Validate {
        /// File to validate
        path: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    let cli_level = if cli.global.quiet {
        Some(LogLevel::Error)
    } else {
        match cli.global.verbose {
            0 => None,
            1 => Some(LogLevel::Debug),
            _ => Some(LogLevel::Trace),
        }
    };
    init_logging(&LogConfig::from_env(cli_level, cli.global.log_format));

    let exit_code = match &cli.command {
        Commands::Run(args) => run_agent(&cli.global, args),
        Commands::Spool(args) => run_spool(&cli.global, args),
        Commands::Config(args) => run_config(&cli.global, args),
        Commands::Host => run_host(&cli.global),
        Commands::Version => {
            print_version(&cli.global);
            ExitCode::Clean
        }
    };

    std::process::exit(exit_code.as_i32());
}

fn emit<T: Serialize>(global: &GlobalOpts, payload: &T, summary: impl FnOnce() -> String) -> ExitCode {
    match global.format {
        OutputFormat::Json => match serde_json::to_string_pretty(payload) {
            Ok(json) => {
                println!("{json}");
                ExitCode::Clean
            }
            Err(e) => {
                eprintln!("failed to render output: {e}");
                ExitCode::InternalError
            }
        },
        OutputFormat::Summary => {
            println!("{}", summary());
            ExitCode::Clean
        }
    }
}

fn emit_error(global: &GlobalOpts, command: &str, err: &edr_common::Error) -> ExitCode {
    let code = ExitCode::for_error(err);
    match global.format {
        OutputFormat::Json => {
            let structured = StructuredError::from(err).with_context("command", command);
            println!("{}", structured.to_json());
        }
        OutputFormat::Summary => eprintln!("{command}: {err}"),
    }
    code
}

fn config_error(err: &ValidationError) -> edr_common::Error {
    edr_common::Error::Config(err.to_string())
}

fn load(global: &GlobalOpts) -> Result<LoadedConfig, edr_common::Error> {
    let loaded = load_config(global.config.as_deref()).map_err(|e| config_error(&e))?;
    match &loaded.origin.path {
        Some(path) => info!(
            event = event_names::CONFIG_LOADED,
            stage = %Stage::Init,
            path = %path.display(),
            source = %loaded.origin.source,
            "configuration loaded"
        ),
        None => info!(
            event = event_names::CONFIG_DEFAULT_USED,
            stage = %Stage::Init,
            "no configuration file found, using defaults"
        ),
    }
    Ok(loaded)
}

fn run_agent(global: &GlobalOpts, args: &RunArgs) -> ExitCode {
    let loaded = match load(global) {
        Ok(loaded) => loaded,
        Err(e) => return emit_error(global, "run", &e),
    };

    // SIGINT and SIGTERM both request an orderly stop.
    let stop = Shutdown::new();
    let on_signal = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || on_signal.trigger()) {
        error!(stage = %Stage::Init, error = %e, "failed to install signal handler");
        return emit_error(global, "run", &std::io::Error::other(e.to_string()).into());
    }

    let agent = match Agent::start(&loaded.config) {
        Ok(agent) => agent,
        Err(e) => {
            error!(stage = %Stage::Init, error = %e, "agent failed to start");
            return emit_error(global, "run", &e.into());
        }
    };

    stop.wait();
    info!(stage = %Stage::Shutdown, "stop requested");

    let report = agent.shutdown(Duration::from_secs(args.grace_secs));
    if report.late.is_empty() {
        ExitCode::Clean
    } else {
        ExitCode::Attention
    }
}

fn spool_dir(global: &GlobalOpts, args: &SpoolArgs) -> Result<PathBuf, edr_common::Error> {
    if let Some(dir) = &args.dir {
        return Ok(dir.clone());
    }
    Ok(load(global)?.config.spool.resolved_dir())
}

fn run_spool(global: &GlobalOpts, args: &SpoolArgs) -> ExitCode {
    let spool = match spool_dir(global, args)
        .and_then(|dir| Spool::inspect(dir).map_err(edr_common::Error::from))
    {
        Ok(spool) => spool,
        Err(e) => return emit_error(global, "spool", &e),
    };

    match &args.command {
        SpoolCommands::Status => match spool.stats() {
            Ok(stats) => {
                let code = emit(global, &stats, || {
                    format!(
                        "spool {}: {} pending ({} bytes), {} quarantined",
                        stats.root.display(),
                        stats.pending,
                        stats.pending_bytes,
                        stats.quarantined
                    )
                });
                if code == ExitCode::Clean && stats.quarantined > 0 {
                    ExitCode::Attention
                } else {
                    code
                }
            }
            Err(e) => emit_error(global, "spool status", &e.into()),
        },
        SpoolCommands::List { limit } => match spool.list_pending() {
            Ok(ids) => {
                let ids: Vec<_> = ids.into_iter().take(limit.unwrap_or(usize::MAX)).collect();
                emit(global, &ids, || {
                    ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join("\n")
                })
            }
            Err(e) => emit_error(global, "spool list", &e.into()),
        },
        SpoolCommands::Quarantine => match spool.list_quarantined() {
            Ok(ids) => {
                let paths: Vec<PathBuf> = ids.iter().map(|id| spool.quarantine_path(id)).collect();
                emit(global, &paths, || {
                    paths
                        .iter()
                        .map(|p| p.display().to_string())
                        .collect::<Vec<_>>()
                        .join("\n")
                })
            }
            Err(e) => emit_error(global, "spool quarantine", &e.into()),
        },
    }
}

#[derive(Serialize)]
struct ConfigReport<'a> {
    schema_version: &'static str,
    status: &'static str,
    path: Option<String>,
    source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<&'a AgentConfig>,
}

fn run_config(global: &GlobalOpts, args: &ConfigArgs) -> ExitCode {
    match &args.command {
        ConfigCommands::Show => match load(global) {
            Ok(loaded) => {
                let report = ConfigReport {
                    schema_version: SCHEMA_VERSION,
                    status: "valid",
                    path: loaded.origin.path.as_ref().map(|p| p.display().to_string()),
                    source: loaded.origin.source.to_string(),
                    config: Some(&loaded.config),
                };
                emit(global, &report, || {
                    format!(
                        "config from {} ({}): collector {}, spool {}",
                        report.path.as_deref().unwrap_or("built-in defaults"),
                        report.source,
                        loaded.config.collector.address(),
                        loaded.config.spool.resolved_dir().display()
                    )
                })
            }
            Err(e) => emit_error(global, "config show", &e),
        },
        ConfigCommands::Validate { path } => match path {
            Some(path) => validate_file(global, path),
            None => match load(global) {
                Ok(loaded) => {
                    let report = ConfigReport {
                        schema_version: SCHEMA_VERSION,
                        status: "valid",
                        path: loaded.origin.path.as_ref().map(|p| p.display().to_string()),
                        source: loaded.origin.source.to_string(),
                        config: None,
                    };
                    emit(global, &report, || "config validate: OK".to_string())
                }
                Err(e) => emit_error(global, "config validate", &e),
            },
        },
    }
}

fn validate_file(global: &GlobalOpts, path: &Path) -> ExitCode {
    let result = AgentConfig::from_file(path).and_then(|config| validate_config(&config));
    match result {
        Ok(()) => {
            let report = ConfigReport {
                schema_version: SCHEMA_VERSION,
                status: "valid",
                path: Some(path.display().to_string()),
                source: "cli".to_string(),
                config: None,
            };
            emit(global, &report, || format!("{}: OK", path.display()))
        }
        Err(e) => {
            let err = config_error(&e);
            match global.format {
                OutputFormat::Json => {
                    let structured = StructuredError::from(&err)
                        .with_context("command", "config validate")
                        .with_context("path", path.display().to_string())
                        .with_context("validation_code", e.code());
                    println!("{}", structured.to_json());
                }
                OutputFormat::Summary => eprintln!("{}: {e}", path.display()),
            }
            ExitCode::ConfigError
        }
    }
}

fn run_host(global: &GlobalOpts) -> ExitCode {
    let collector = match load(global) {
        Ok(loaded) => loaded.config.collector.address(),
        Err(e) => return emit_error(global, "host", &e),
    };
    let host = collect_host_identity(&collector);
    emit(global, &host, || {
        format!(
            "{} ({} {}, kernel {}) ip={} mac={}",
            host.hostname, host.os_type, host.os_version, host.kernel, host.ip, host.mac
        )
    })
}

fn print_version(global: &GlobalOpts) {
    let version_info = serde_json::json!({
        "schema_version": SCHEMA_VERSION,
        "agent_version": AGENT_VERSION,
        "rust_version": env!("CARGO_PKG_RUST_VERSION"),
    });
    emit(global, &version_info, || {
        format!("edr-agent {AGENT_VERSION}\nschema version: {SCHEMA_VERSION}")
    });
}
