use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use cronwarden::config::Config;
use cronwarden::invoke::{build_invoker, Clients, FileTokenProvider, HttpCommandClient, HttpMessageBus};
use cronwarden::model::{
    assign_action_ids, ActionKind, AdminState, DefKind, RunStatus, ScheduleAction, ScheduleDef,
    ScheduleJob,
};
use cronwarden::storage::{self, RecordFilter};

#[derive(Parser)]
#[command(
    name = "cronwarden",
    about = "Appliance-grade job scheduling for edge IoT fleets",
    version,
    long_about = None
)]
struct Cli {
    /// Config file path
    #[arg(long, global = true, default_value = "cronwarden.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + scheduler + retention)
    Serve {
        /// Bind address override
        #[arg(long)]
        bind: Option<String>,
    },

    /// Manage schedule jobs
    Job {
        #[command(subcommand)]
        action: JobAction,
    },

    /// Inspect and prune execution history
    Record {
        #[command(subcommand)]
        action: RecordAction,
    },
}

#[derive(Subcommand)]
enum JobAction {
    /// List all schedule jobs
    List,

    /// Add a new schedule job (picked up by a running daemon at its next
    /// reconciliation)
    Add {
        /// Job name
        #[arg(long)]
        name: String,

        /// Interval duration, e.g. "30s", "15m", "1h"
        #[arg(long, conflicts_with = "cron")]
        interval: Option<String>,

        /// Cron expression (5, 6, or 7 fields)
        #[arg(long)]
        cron: Option<String>,

        /// IANA timezone for cron evaluation
        #[arg(long, requires = "cron")]
        timezone: Option<String>,

        /// Publish to this message bus topic
        #[arg(long, conflicts_with_all = ["address"])]
        topic: Option<String>,

        /// Call this REST address
        #[arg(long)]
        address: Option<String>,

        /// HTTP method for the REST action
        #[arg(long, default_value = "GET", requires = "address")]
        method: String,

        /// Comma-separated labels
        #[arg(long, default_value = "")]
        labels: String,

        /// Trigger once at startup when missed runs were backfilled
        #[arg(long)]
        auto_trigger_missed: bool,
    },

    /// Remove a schedule job
    Remove {
        /// Job name
        #[arg(long)]
        name: String,
    },

    /// Trigger a job immediately on the running daemon
    Trigger {
        /// Job name
        #[arg(long)]
        name: String,
    },
}

#[derive(Subcommand)]
enum RecordAction {
    /// List execution records, newest first
    List {
        /// Only records of this job
        #[arg(long)]
        job: Option<String>,

        /// Only records with this status (SUCCEEDED, FAILED, MISSED)
        #[arg(long)]
        status: Option<String>,

        /// Maximum rows
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Delete records older than the given age, e.g. "30d", "12h"
    Purge {
        #[arg(long)]
        age: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    match cli.command {
        Commands::Serve { bind } => {
            let mut config = config;
            if let Some(bind) = bind {
                config.bind = bind;
            }
            tracing::info!(bind = %config.bind, "Starting cronwarden daemon");
            cronwarden::serve(config).await?;
        }
        Commands::Job { action } => run_job_action(action, &config).await?,
        Commands::Record { action } => run_record_action(action, &config)?,
    }

    Ok(())
}

async fn run_job_action(action: JobAction, config: &Config) -> Result<()> {
    match action {
        JobAction::List => {
            let pool = storage::open_pool(&config.database)?;
            let jobs = storage::all_jobs(&pool, &[], 0, 1000)?;
            if jobs.is_empty() {
                println!("No schedule jobs found.");
            } else {
                println!(
                    "{:<20} | {:<24} | {:<8} | Actions",
                    "Name", "Definition", "State"
                );
                println!("{:-<20}-|-{:-<24}-|-{:-<8}-|-{:-<7}", "", "", "", "");
                for job in jobs {
                    println!(
                        "{:<20} | {:<24} | {:<8} | {}",
                        job.name,
                        describe_definition(&job.definition),
                        job.admin_state,
                        job.actions.len()
                    );
                }
            }
        }
        JobAction::Add {
            name,
            interval,
            cron,
            timezone,
            topic,
            address,
            method,
            labels,
            auto_trigger_missed,
        } => {
            let kind = match (interval, cron) {
                (Some(interval), None) => DefKind::Interval { interval },
                (None, Some(crontab)) => DefKind::Cron { crontab, timezone },
                _ => anyhow::bail!("exactly one of --interval or --cron is required"),
            };
            let action = match (topic, address) {
                (Some(topic), None) => ScheduleAction {
                    id: String::new(),
                    content_type: "application/json".to_string(),
                    payload: Vec::new(),
                    kind: ActionKind::MessageBus { topic },
                },
                (None, Some(address)) => ScheduleAction::rest(&address, &method),
                _ => anyhow::bail!("exactly one of --topic or --address is required"),
            };

            let mut job = ScheduleJob {
                id: uuid::Uuid::new_v4().to_string(),
                name: name.clone(),
                definition: ScheduleDef {
                    start_timestamp: None,
                    end_timestamp: None,
                    kind,
                },
                actions: vec![action],
                admin_state: AdminState::Unlocked,
                auto_trigger_missed_records: auto_trigger_missed,
                labels: labels.split(',').filter(|l| !l.is_empty()).map(str::to_string).collect(),
                created: 0,
                modified: 0,
            };
            assign_action_ids(&mut job.actions);

            // Same constructibility checks the daemon applies on add.
            job.check_identity()?;
            job.definition.parse()?;
            let clients = cli_clients(config)?;
            for action in &job.actions {
                build_invoker(action, &clients)?;
            }

            let pool = storage::open_pool(&config.database)?;
            storage::add_job(&pool, &job)?;
            println!("Schedule job '{}' added.", name);
        }
        JobAction::Remove { name } => {
            let pool = storage::open_pool(&config.database)?;
            storage::delete_job_by_name(&pool, &name)?;
            println!("Schedule job '{}' removed.", name);
        }
        JobAction::Trigger { name } => {
            let url = format!("http://{}/api/v1/trigger/job/name/{name}", config.bind);
            let resp = reqwest::Client::new().post(&url).send().await?;
            if resp.status().is_success() {
                println!("Schedule job '{}' triggered.", name);
            } else {
                anyhow::bail!("daemon at {} answered {}", config.bind, resp.status());
            }
        }
    }
    Ok(())
}

fn run_record_action(action: RecordAction, config: &Config) -> Result<()> {
    let pool = storage::open_pool(&config.database)?;
    match action {
        RecordAction::List { job, status, limit } => {
            let status = status
                .map(|s| s.parse::<RunStatus>().map_err(anyhow::Error::msg))
                .transpose()?;
            let filter = match (&job, status) {
                (Some(job), Some(status)) => RecordFilter::JobAndStatus(job, status),
                (Some(job), None) => RecordFilter::Job(job),
                (None, Some(status)) => RecordFilter::Status(status),
                (None, None) => RecordFilter::All,
            };
            let records = storage::records(&pool, filter, 0, 0, 0, limit)?;
            if records.is_empty() {
                println!("No records found.");
            } else {
                println!(
                    "{:<20} | {:<13} | {:<9} | Scheduled at",
                    "Job", "Action", "Status"
                );
                println!("{:-<20}-|-{:-<13}-|-{:-<9}-|-{:-<24}", "", "", "", "");
                for record in records {
                    let scheduled = cronwarden::model::from_millis(record.scheduled_at)
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| record.scheduled_at.to_string());
                    println!(
                        "{:<20} | {:<13} | {:<9} | {}",
                        record.job_name,
                        record.action.kind.type_name(),
                        record.status,
                        scheduled
                    );
                }
            }
        }
        RecordAction::Purge { age } => {
            let age = humantime::parse_duration(&age)?;
            let deleted = storage::delete_records_by_age(&pool, age.as_millis() as i64)?;
            println!("Deleted {} record(s).", deleted);
        }
    }
    Ok(())
}

fn describe_definition(definition: &ScheduleDef) -> String {
    match &definition.kind {
        DefKind::Interval { interval } => format!("every {interval}"),
        DefKind::Cron { crontab, timezone } => match timezone {
            Some(tz) => format!("cron {crontab} ({tz})"),
            None => format!("cron {crontab}"),
        },
    }
}

fn cli_clients(config: &Config) -> Result<Clients> {
    let http = reqwest::Client::new();
    Ok(Clients {
        http: http.clone(),
        bus: std::sync::Arc::new(HttpMessageBus::new(
            http.clone(),
            &config.clients.message_bus_url,
        )),
        command: std::sync::Arc::new(HttpCommandClient::new(http, &config.clients.command_url)),
        secrets: std::sync::Arc::new(FileTokenProvider::new(
            config.auth.jwt_token_path.as_ref().map(Into::into),
        )),
    })
}
