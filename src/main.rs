use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use pricing_e2e::classify::{OutcomeClassifier, TestStatus};
use pricing_e2e::config::HarnessConfig;
use pricing_e2e::orchestrator::{FlowReport, Orchestrator, RunReport};
use pricing_e2e::remote::{RemoteCommandRunner, TunnelManager};
use pricing_e2e::storage::{self, HistoryEntry, HistoryStore};

#[derive(Parser)]
#[command(
    name = "pricing-e2e",
    about = "End-to-end test orchestration for the multi-region pricing application",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (default: $PRICING_E2E_CONFIG, then ./pricing-e2e.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the dashboard API
    Serve {
        /// Bind address (overrides [server].bind)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run a project's test suite and record the result
    Run {
        /// Project key, e.g. china
        project: String,

        /// Environment key (defaults to the project's environment)
        #[arg(long)]
        env: Option<String>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Inspect or clear execution history
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },

    /// Classify a project's existing logs without running anything
    Classify {
        /// Project key
        project: String,

        #[arg(long)]
        json: bool,
    },

    /// Hold a database tunnel open until Ctrl-C
    Tunnel {
        /// Environment whose tunnel host is used
        #[arg(long)]
        env: Option<String>,

        /// Tunnel host (overrides the environment's)
        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        local_port: Option<u16>,

        #[arg(long)]
        remote_port: Option<u16>,
    },

    /// Run a configured flow: tunnel, checks, trigger, follow-up tests
    Flow {
        /// Flow name from [[flows]]
        name: String,

        /// Environment key (defaults to the flow's, then its project's)
        #[arg(long)]
        env: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Fire a configured remote workflow trigger over ssh
    Trigger {
        /// Trigger name from [[triggers]]
        name: String,

        /// Environment whose ssh host is used
        #[arg(long)]
        env: Option<String>,
    },
}

#[derive(Subcommand)]
enum HistoryAction {
    /// List recent executions
    List {
        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        json: bool,
    },

    /// Show aggregate counts
    Stats,

    /// Delete all history
    Clear,
}

fn init_tracing(config: &HarnessConfig, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json || config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<HarnessConfig> {
    let config = match path {
        Some(path) => HarnessConfig::load(path)?,
        None => HarnessConfig::load_or_default()?,
    };
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn open_history(config: &HarnessConfig) -> Result<HistoryStore> {
    let pool = storage::open_pool(&config.paths.database())?;
    let store = HistoryStore::new(pool);
    store.initialize()?;
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    init_tracing(&config, cli.json_logs);
    let config = Arc::new(config);

    match cli.command {
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.server.bind.clone());
            tracing::info!(%bind, "Starting pricing-e2e dashboard");
            pricing_e2e::serve(config, &bind).await?;
        }
        Commands::Run { project, env, json } => {
            let orchestrator = Orchestrator::open(Arc::clone(&config))?;
            let report = orchestrator.execute_project(&project, env.as_deref()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
            if report.project_status == TestStatus::Fail {
                std::process::exit(1);
            }
        }
        Commands::History { action } => {
            let store = open_history(&config)?;
            match action {
                HistoryAction::List { limit, json } => {
                    let limit = limit.unwrap_or(config.server.history_limit);
                    let entries: Vec<HistoryEntry> = store
                        .list_recent(limit)?
                        .iter()
                        .map(HistoryEntry::from)
                        .collect();
                    if json {
                        println!("{}", serde_json::to_string_pretty(&entries)?);
                    } else {
                        println!(
                            "{:<10} | {:<20} | {:<10} | {:<5} | {:<12} | {:>5} | {:>5} | {:>5}",
                            "ID", "Project", "Date", "Time", "Platform", "Total", "Pass", "Fail"
                        );
                        println!("{:-<100}", "");
                        for e in &entries {
                            println!(
                                "{:<10} | {:<20} | {:<10} | {:<5} | {:<12} | {:>5} | {:>5} | {:>5}",
                                e.id, e.name, e.date, e.time, e.platform, e.total_tests, e.passed, e.failed
                            );
                        }
                    }
                }
                HistoryAction::Stats => {
                    let stats = store.aggregate_stats()?;
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                }
                HistoryAction::Clear => {
                    let deleted = store.clear()?;
                    println!("Deleted {} execution record(s).", deleted);
                }
            }
        }
        Commands::Classify { project, json } => {
            let name = config.project(&project)?.name.clone();
            let classifier = OutcomeClassifier::standard(config.paths.logs_dir());
            let result = classifier.classify_project(&name)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("\n{} [{}]", name, result.project_status);
                for t in &result.tests {
                    println!("  {:<40} {:<5} {}", t.file, t.status, t.log_file);
                }
            }
        }
        Commands::Tunnel {
            env,
            host,
            local_port,
            remote_port,
        } => {
            let env = config.resolve_environment(env.as_deref().unwrap_or(&config.default_environment))?;
            let host = match host.or(env.settings.tunnel_host) {
                Some(h) => h,
                None => bail!("environment '{}' has no tunnel_host; pass --host", env.key),
            };
            let local_port = local_port.unwrap_or(config.tunnel.local_port);
            let remote_port = remote_port.unwrap_or(config.tunnel.remote_port);

            let manager = TunnelManager::new(&config.tunnel);
            let mut handle = manager.open(local_port, &host, remote_port).await?;
            println!(
                "Tunnel ready: 127.0.0.1:{} -> {}:{} via {}. Press Ctrl-C to close.",
                local_port, config.tunnel.forward_host, remote_port, host
            );

            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = ticker.tick() => {
                        if !handle.is_alive() {
                            tracing::warn!(local_port, "tunnel process exited");
                            break;
                        }
                    }
                }
            }
            handle.close().await;
        }
        Commands::Flow { name, env, json } => {
            let orchestrator = Orchestrator::open(Arc::clone(&config))?;
            let report = orchestrator.execute_flow(&name, env.as_deref()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_flow(&report);
            }
            if report.run.project_status == TestStatus::Fail {
                std::process::exit(1);
            }
        }
        Commands::Trigger { name, env } => {
            let trigger = config.trigger(&name)?.clone();
            let env = config.resolve_environment(env.as_deref().unwrap_or(&config.default_environment))?;
            let Some(host) = env.settings.ssh_host.clone() else {
                bail!("environment '{}' has no ssh_host", env.key);
            };
            let runner = RemoteCommandRunner::new(&config.remote);
            match runner.trigger(&host, &trigger).await {
                Ok(result) => {
                    println!("{}", serde_json::to_string_pretty(&result)?);
                }
                Err(e) => {
                    eprintln!("trigger '{}' failed: {}", name, e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

fn print_flow(report: &FlowReport) {
    match report.tunnel_port {
        Some(port) => println!("Flow {}: tunnel on 127.0.0.1:{}", report.flow, port),
        None => println!("Flow {}: no tunnel", report.flow),
    }
    if let Some(step) = &report.failed_step {
        println!("Stopped at {}", step);
    }
    if report.tests_skipped {
        println!("Follow-up tests were skipped");
    }
    print_report(&report.run);
}

fn print_report(report: &RunReport) {
    println!("\n{} [{}]", report.platform, report.project_status);
    println!("{:<40} | {:<6} | Log", "Test", "Status");
    println!("{:-<40}-|-{:-<6}-|-{:-<40}", "", "", "");
    for t in &report.tests {
        println!("{:<40} | {:<6} | {}", t.file, t.status, t.log_file);
    }
    match report.execution_id {
        Some(id) => println!("\nRecorded as execution {}", id),
        None => println!("\nExecution was not recorded"),
    }
    if let Some(error) = &report.error {
        println!("Error: {}", error);
    }
}
