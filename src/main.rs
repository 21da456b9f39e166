//! # Runloom CLI
//!
//! Usage:
//!   runloom fire-times --cron "0 9 * * MON-FRI" --timezone Europe/Paris
//!   runloom fire-times --interval 3600 --count 5
//!   runloom apply --file runloom.toml        # load work queues + deployments
//!   runloom history --width-minutes 60       # bucket the snapshot's transition log
//!   runloom serve                            # scheduler loop against the snapshot
//!   runloom config --init                    # write ~/.runloom/config.toml
//!   runloom --profile ci serve               # apply a profile from ~/.runloom/profiles.toml

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use runloom_core::{Deployment, RunloomConfig, Schedule, SystemClock, WorkQueue};
use runloom_scheduler::store::{InMemoryRunStore, RunStore, SnapshotStore};
use runloom_scheduler::{Orchestrator, schedule, spawn_scheduler_loop};

#[derive(Parser)]
#[command(name = "runloom", version, about = "🧵 Runloom: run-state orchestration engine")]
struct Cli {
    /// Config file (default: ~/.runloom/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Settings profile from ~/.runloom/profiles.toml (overrides RUNLOOM_PROFILE)
    #[arg(short, long, global = true)]
    profile: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the next fire times of a schedule
    FireTimes {
        #[arg(long, conflicts_with_all = ["interval", "rrule"])]
        cron: Option<String>,
        /// Interval in seconds
        #[arg(long, conflicts_with = "rrule")]
        interval: Option<u64>,
        /// Anchor for --interval (RFC 3339, default: now)
        #[arg(long, requires = "interval")]
        anchor: Option<String>,
        #[arg(long)]
        rrule: Option<String>,
        #[arg(long)]
        timezone: Option<String>,
        /// Start after this instant (RFC 3339, default: now)
        #[arg(long)]
        after: Option<String>,
        #[arg(short = 'n', long, default_value = "10")]
        count: usize,
    },
    /// Load work queues and deployments from a TOML manifest into the snapshot
    Apply {
        #[arg(short, long)]
        file: String,
    },
    /// Bucketed state counts over the snapshot's transition log
    History {
        #[arg(long, default_value = "60")]
        width_minutes: i64,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Run the scheduler loop until Ctrl-C, then save the snapshot
    Serve {
        /// Override scheduler.loop_interval_secs
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Show the effective configuration
    Config {
        /// Write the effective configuration to the config path
        #[arg(long)]
        init: bool,
    },
}

/// Work queues and deployments to register.
#[derive(Debug, Default, Deserialize)]
struct Manifest {
    #[serde(default)]
    work_queues: Vec<WorkQueue>,
    #[serde(default)]
    deployments: Vec<Deployment>,
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn parse_instant(value: Option<&str>) -> Result<DateTime<Utc>> {
    match value {
        Some(v) => Ok(DateTime::parse_from_rfc3339(v)
            .with_context(|| format!("invalid timestamp '{v}'"))?
            .with_timezone(&Utc)),
        None => Ok(Utc::now()),
    }
}

fn load_config(cli: &Cli) -> Result<(RunloomConfig, PathBuf)> {
    let (mut config, path) = match &cli.config {
        Some(path) => {
            let path = expand_path(path);
            let mut config = if path.exists() {
                RunloomConfig::load_from(&path)?
            } else {
                RunloomConfig::default()
            };
            if let Ok(name) = std::env::var("RUNLOOM_PROFILE") {
                config.apply_profile(&RunloomConfig::profiles_path(), &name)?;
            }
            config.apply_env_overrides(std::env::vars())?;
            (config, path)
        }
        None => (RunloomConfig::load()?, RunloomConfig::default_path()),
    };
    if let Some(name) = &cli.profile {
        config.apply_profile(&RunloomConfig::profiles_path(), name)?;
        // Environment variables still win over the profile.
        config.apply_env_overrides(std::env::vars())?;
    }
    Ok((config, path))
}

async fn open_store(config: &RunloomConfig) -> Result<(InMemoryRunStore, SnapshotStore)> {
    let snapshots = SnapshotStore::from_config(config);
    let store = match snapshots.load()? {
        Some(snapshot) => {
            tracing::info!(
                "💾 Loaded {} flow runs from {}",
                snapshot.flow_runs.len(),
                snapshots.path().display()
            );
            InMemoryRunStore::from_snapshot(snapshot, config.api.default_limit)
        }
        None => InMemoryRunStore::new(config.api.default_limit),
    };
    Ok((store, snapshots))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, config_path) = load_config(&cli)?;

    let filter = if cli.verbose {
        "runloom=debug,runloom_scheduler=debug,runloom_core=debug".to_string()
    } else {
        config.logging.filter_directive()
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    match &cli.command {
        Command::FireTimes {
            cron,
            interval,
            anchor,
            rrule,
            timezone,
            after,
            count,
        } => {
            let mut parsed = match (cron, interval, rrule) {
                (Some(expr), None, None) => Schedule::cron(expr.clone()),
                (None, Some(secs), None) => {
                    Schedule::interval(*secs, parse_instant(anchor.as_deref())?)
                }
                (None, None, Some(rule)) => Schedule::rrule(rule.clone()),
                _ => bail!("give exactly one of --cron, --interval or --rrule"),
            };
            if let Some(tz) = timezone {
                parsed = parsed.in_timezone(tz.clone());
            }
            schedule::validate(&parsed)?;
            let after = parse_instant(after.as_deref())?;
            for fire in schedule::next_fire_times(&parsed, after, Some(*count))? {
                println!("{}", fire.to_rfc3339());
            }
        }

        Command::Apply { file } => {
            let path = expand_path(file);
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let manifest: Manifest = toml::from_str(&content)?;

            let (store, snapshots) = open_store(&config).await?;
            for queue in manifest.work_queues {
                println!("   📥 work queue '{}' (priority {})", queue.id, queue.priority);
                store.put_work_queue(queue).await?;
            }
            for deployment in manifest.deployments {
                println!(
                    "   🚀 deployment '{}' → flow '{}'",
                    deployment.id, deployment.flow_id
                );
                store.put_deployment(deployment).await?;
            }
            snapshots.save(&store.snapshot().await)?;
            println!("✅ Saved {}", snapshots.path().display());
        }

        Command::History { width_minutes, json } => {
            let width =
                Duration::try_minutes(*width_minutes).context("bucket width out of range")?;
            let (store, _) = open_store(&config).await?;
            let buckets = runloom_scheduler::aggregate(&store.transition_log().await?, width)?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&buckets)?);
            } else {
                for bucket in &buckets {
                    let counts: Vec<String> = bucket
                        .counts
                        .iter()
                        .map(|(state, n)| format!("{state}={n}"))
                        .collect();
                    println!(
                        "{}  {:>4}  {}",
                        bucket.start.to_rfc3339(),
                        bucket.total(),
                        counts.join(" ")
                    );
                }
            }
        }

        Command::Serve { interval_secs } => {
            let (store, snapshots) = open_store(&config).await?;
            let store = Arc::new(store);
            let orchestrator = Arc::new(Orchestrator::new(
                store.clone(),
                Arc::new(SystemClock),
                config.scheduler.clone(),
            ));
            orchestrator.restore_admissions().await?;

            let every = interval_secs.unwrap_or(config.scheduler.loop_interval_secs);
            println!("🧵 Runloom v{}", env!("CARGO_PKG_VERSION"));
            println!("   ⏰ Tick:      every {every}s");
            println!("   💾 Snapshot:  {}", snapshots.path().display());
            println!("   ⚙️  Config:    {}", config_path.display());
            println!();

            let handle = spawn_scheduler_loop(orchestrator, every);
            tokio::signal::ctrl_c().await?;
            handle.abort();
            snapshots.save(&store.snapshot().await)?;
            println!("👋 Snapshot saved, bye");
        }

        Command::Config { init } => {
            if *init {
                config.save_to(&config_path)?;
                println!("✅ Wrote {}", config_path.display());
            } else {
                println!("# {}", config_path.display());
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}
