use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use tablewatch::config::{LogFormat, MonitorConfig};
use tablewatch::control::Service;
use tablewatch::detect::Classifier;
use tablewatch::fix::FixDescriptor;

#[derive(Parser)]
#[command(
    name = "tablewatch",
    about = "Log-driven issue monitor for a multiplayer card-game stack",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (otherwise $TABLEWATCH_CONFIG, then ./tablewatch.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (control loop + log tailer + API server)
    Serve {
        /// Log file to tail, overriding the config
        #[arg(long)]
        log: Option<PathBuf>,

        /// API bind address, overriding the config
        #[arg(long)]
        bind: Option<String>,

        /// Do not start the API server
        #[arg(long)]
        no_api: bool,
    },

    /// Classify a single line, or every line of a file
    Classify {
        /// Log line to classify
        line: Option<String>,

        /// Classify every line of this file instead
        #[arg(long, conflicts_with = "line")]
        file: Option<PathBuf>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Show the latest status snapshot
    Status {
        /// Print the raw JSON snapshot
        #[arg(long)]
        json: bool,
    },

    /// Submit a fix descriptor for a paused focus group
    Fix {
        /// Focus group id
        #[arg(long)]
        group: Uuid,

        /// What was changed
        #[arg(long)]
        description: String,

        /// Service to restart before verification (repeatable)
        #[arg(long = "restart")]
        restarts: Vec<Service>,
    },

    /// List recorded fix attempts
    History {
        /// Number of attempts to show
        #[arg(long, default_value = "20")]
        limit: usize,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn init_tracing(config: &MonitorConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = MonitorConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config);

    match cli.command {
        Commands::Serve { log, bind, no_api } => {
            if let Some(log) = log {
                config.log.path = log;
            }
            if let Some(bind) = bind {
                config.api.bind = bind;
            }
            if no_api {
                config.api.enabled = false;
            }
            config.validate()?;
            tracing::info!(log = %config.log.path.display(), "Starting tablewatch daemon");
            tablewatch::serve(config).await?;
        }
        Commands::Classify { line, file, json } => {
            let lines: Vec<String> = match (line, file) {
                (Some(line), None) => vec![line],
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?
                    .lines()
                    .map(str::to_string)
                    .collect(),
                _ => bail!("pass a log line or --file"),
            };

            let classifier = Classifier::new();
            let issues: Vec<_> = lines.iter().filter_map(|l| classifier.classify(l)).collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&issues)?);
            } else if issues.is_empty() {
                println!("No issues found in {} line(s).", lines.len());
            } else {
                println!("{:<10} | {:<8} | {:<26} | Message", "Severity", "Source", "Type");
                println!("{:-<10}-|-{:-<8}-|-{:-<26}-|-{:-<40}", "", "", "", "");
                for issue in &issues {
                    println!(
                        "{:<10} | {:<8} | {:<26} | {}",
                        issue.severity, issue.source, issue.issue_type, issue.message
                    );
                }
            }
        }
        Commands::Status { json } => {
            let snapshot = tablewatch::status::read_snapshot(&config.paths.status_file)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
                return Ok(());
            }

            println!("\n=== tablewatch status ({}) ===", snapshot.generated_at.to_rfc3339());
            print!("Phase:     {}", snapshot.phase);
            match snapshot.remaining_seconds {
                Some(left) => println!(" ({}s elapsed, {}s left)", snapshot.elapsed_seconds, left),
                None => println!(),
            }
            match &snapshot.focus_group {
                Some(group) => {
                    println!("Focus:     {} [{}] {}", group.id, group.highest_severity, group.root_issue.issue_type);
                    println!("           {}", group.root_issue.message);
                    println!(
                        "           {} related, {} fix attempt(s), {} failed",
                        group.related_count, group.fix_attempts, group.failed_attempts
                    );
                }
                None => println!("Focus:     none"),
            }
            println!("Queued:    {}", snapshot.queued_count);
            println!(
                "Issues:    {} total, {} duplicate, {} line(s) scanned",
                snapshot.counters.total, snapshot.counters.duplicates, snapshot.lines_scanned
            );
            if let Some(players) = snapshot.players_online {
                println!("Players:   {}", players);
            }
            if snapshot.repeated_failures {
                println!("!! repeated fix failures on the active focus group");
            }
            if !snapshot.warnings.is_empty() {
                println!("\nWarnings:");
                for w in &snapshot.warnings {
                    println!(" - {} {}", w.at.format("%H:%M:%S"), w.message);
                }
            }
            println!();
        }
        Commands::Fix {
            group,
            description,
            restarts,
        } => {
            let descriptor = FixDescriptor {
                focus_group_id: group,
                fix_description: description,
                required_restarts: restarts,
            };
            tablewatch::fix::write_descriptor(&config.paths.fix_file, &descriptor).await?;
            println!(
                "Fix for {} written to {}.",
                group,
                config.paths.fix_file.display()
            );
        }
        Commands::History { limit, json } => {
            let pool = tablewatch::storage::open_pool(&config.paths.database)?;
            let attempts = tablewatch::storage::list_fix_attempts(&pool, limit)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&attempts)?);
            } else if attempts.is_empty() {
                println!("No fix attempts recorded.");
            } else {
                println!("{:<25} | {:<8} | {:<36} | Fix", "Submitted", "Result", "Focus group");
                println!("{:-<25}-|-{:-<8}-|-{:-<36}-|-{:-<30}", "", "", "", "");
                for record in attempts {
                    println!(
                        "{:<25} | {:<8} | {:<36} | {}",
                        record.attempt.submitted_at.format("%Y-%m-%d %H:%M:%S"),
                        record.attempt.result.as_str(),
                        record.focus_group_id,
                        record.attempt.fix_description
                    );
                    if let Some(reason) = &record.attempt.failure_reason {
                        println!("{:<25} | {:<8} | {:<36} |   -> {}", "", "", "", reason);
                    }
                }
            }
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
