//! CLI command definitions for crowd-sched.
//!
//! Every command connects to the configured Redis and PostgreSQL instances,
//! runs one scheduler operation and prints the result as JSON.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::clock::SystemClock;
use crate::config::SchedulerConfig;
use crate::error::ConfigError;
use crate::identity::Requester;
use crate::kv::RedisStore;
use crate::locks::LockContext;
use crate::metrics::{export_metrics, init_metrics};
use crate::sched::{NewTaskRequest, SavedTaskPosition, Scheduler};
use crate::store::{PgStore, Task};

/// Task scheduling and distributed locking for crowdsourcing projects.
#[derive(Parser)]
#[command(name = "crowd-sched")]
#[command(about = "Hand out crowdsourcing tasks under distributed locks")]
#[command(version)]
#[command(
    long_about = "crowd-sched picks tasks for contributors, locks them in Redis and tracks\nreservations and active users.\n\nExample usage:\n  crowd-sched next-task --project 1 --user-id 42"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Redis URL, overriding CROWD_SCHED_REDIS_URL.
    #[arg(long, global = true)]
    pub redis_url: Option<String>,

    /// PostgreSQL URL.
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Pick and lock the next task for a contributor.
    #[command(alias = "next")]
    NextTask(NextTaskArgs),

    /// Release a contributor's lock on a task.
    Release(ReleaseArgs),

    /// Release every lock a contributor holds in a project.
    ReleaseUser(ProjectIdentityArgs),

    /// Show the raw lock hash of a task or of a contributor.
    Locks(LocksArgs),

    /// List the active users of a project.
    ActiveUsers(ProjectArgs),

    /// Count the tasks still available to a contributor.
    Available(ProjectIdentityArgs),

    /// Print metrics in Prometheus text format.
    Metrics,
}

/// Contributor identity; the first present identifier is used.
#[derive(clap::Args, Debug, Clone)]
pub struct IdentityArgs {
    /// Registered user id.
    #[arg(long)]
    pub user_id: Option<i64>,

    /// External uid of an embedding partner.
    #[arg(long)]
    pub external_uid: Option<String>,

    /// IP address of an anonymous contributor.
    #[arg(long)]
    pub user_ip: Option<String>,
}

impl IdentityArgs {
    fn requester(&self) -> Requester {
        Requester {
            user_id: self.user_id,
            external_uid: self.external_uid.clone(),
            user_ip: self.user_ip.clone(),
        }
    }
}

/// Arguments for `crowd-sched next-task`.
#[derive(Parser, Debug)]
pub struct NextTaskArgs {
    /// Project id.
    #[arg(short, long)]
    pub project: i64,

    #[command(flatten)]
    pub identity: IdentityArgs,

    /// Scheduler name overriding the project's setting.
    #[arg(long)]
    pub scheduler: Option<String>,

    /// Offset into the candidate list (at most 2).
    #[arg(long, default_value = "0")]
    pub offset: usize,

    /// Order by column (priority_0 or id).
    #[arg(long)]
    pub orderby: Option<String>,

    /// Descending order for --orderby.
    #[arg(long)]
    pub desc: bool,

    /// Shuffle tasks of equal priority.
    #[arg(long)]
    pub rand_within_priority: bool,

    /// Only hand out gold tasks.
    #[arg(long)]
    pub gold_only: bool,

    /// Resume this task directly.
    #[arg(long)]
    pub task_id: Option<i64>,

    /// Rank saved tasks first or last.
    #[arg(long)]
    pub saved_position: Option<String>,
}

/// Arguments for `crowd-sched release`.
#[derive(Parser, Debug)]
pub struct ReleaseArgs {
    /// Task id.
    #[arg(short, long)]
    pub task: i64,

    #[command(flatten)]
    pub identity: IdentityArgs,

    /// Lock timeout in seconds; defaults to the project's timeout.
    #[arg(long)]
    pub timeout: Option<u64>,
}

/// A project and a contributor.
#[derive(Parser, Debug)]
pub struct ProjectIdentityArgs {
    /// Project id.
    #[arg(short, long)]
    pub project: i64,

    #[command(flatten)]
    pub identity: IdentityArgs,
}

/// A project.
#[derive(Parser, Debug)]
pub struct ProjectArgs {
    /// Project id.
    #[arg(short, long)]
    pub project: i64,
}

/// Arguments for `crowd-sched locks`.
#[derive(Parser, Debug)]
pub struct LocksArgs {
    /// Show the holders of this task.
    #[arg(short, long, conflicts_with = "holder")]
    pub task: Option<i64>,

    /// Show the tasks held by this holder id (user id, ext-<uid> or ip-<addr>).
    #[arg(long)]
    pub holder: Option<String>,
}

#[derive(Debug, Serialize)]
struct NextTaskOutput {
    project_id: i64,
    task: Option<Task>,
}

#[derive(Debug, Serialize)]
struct LockEntry {
    holder: String,
    expiration: f64,
    seconds_remaining: f64,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    if let Err(e) = init_metrics() {
        warn!(error = %e, "Failed to initialize metrics");
    }

    if let Commands::Metrics = cli.command {
        print!("{}", export_metrics());
        return Ok(());
    }

    let scheduler = connect(&cli).await?;
    match cli.command {
        Commands::NextTask(args) => run_next_task_command(&scheduler, args).await,
        Commands::Release(args) => run_release_command(&scheduler, args).await,
        Commands::ReleaseUser(args) => run_release_user_command(&scheduler, args).await,
        Commands::Locks(args) => run_locks_command(&scheduler, args).await,
        Commands::ActiveUsers(args) => run_active_users_command(&scheduler, args).await,
        Commands::Available(args) => run_available_command(&scheduler, args).await,
        Commands::Metrics => Ok(()),
    }
}

async fn connect(cli: &Cli) -> anyhow::Result<Scheduler> {
    let mut config = SchedulerConfig::from_env()?;
    if let Some(url) = &cli.redis_url {
        config = config.with_redis_url(url.clone());
    }
    let database_url = resolve_database_url(cli.database_url.clone(), &config)?;

    let redis = RedisStore::connect(&config.redis_url).await?;
    let pg = PgStore::connect(&database_url).await?;
    info!(redis_url = %config.redis_url, prefix = %config.key_prefix, "Connected to stores");

    let ctx = LockContext::new(Arc::new(redis), Arc::new(SystemClock), config);
    Ok(Scheduler::from_store(ctx, Arc::new(pg)))
}

/// `--database-url` wins over the `DATABASE_URL` loaded into the config.
fn resolve_database_url(
    flag: Option<String>,
    config: &SchedulerConfig,
) -> Result<String, ConfigError> {
    flag.or_else(|| config.database_url.clone())
        .ok_or_else(|| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json_output = serde_json::to_string_pretty(value)
        .map_err(|e| anyhow::anyhow!("Failed to serialize output JSON: {}", e))?;
    println!("{}", json_output);
    Ok(())
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn run_next_task_command(scheduler: &Scheduler, args: NextTaskArgs) -> anyhow::Result<()> {
    let mut request = NewTaskRequest::new(args.project, args.identity.requester())
        .with_offset(args.offset)
        .with_rand_within_priority(args.rand_within_priority)
        .with_gold_only(args.gold_only);
    if let Some(sched) = args.scheduler {
        request = request.with_scheduler(sched);
    }
    if let Some(orderby) = args.orderby {
        request = request.with_order(orderby, args.desc);
    }
    if let Some(task_id) = args.task_id {
        request = request.with_task_id(task_id);
    }
    if let Some(position) = args.saved_position {
        let position: SavedTaskPosition = position.parse().map_err(|e: String| anyhow::anyhow!(e))?;
        request = request.with_saved_task_position(position);
    }

    let task = scheduler.new_task(&request).await?.into_iter().next();
    print_json(&NextTaskOutput {
        project_id: args.project,
        task,
    })
}

async fn run_release_command(scheduler: &Scheduler, args: ReleaseArgs) -> anyhow::Result<()> {
    let timeout = match args.timeout {
        Some(secs) => Duration::from_secs(secs),
        None => match scheduler.get_task_id_project_id(args.task).await? {
            Some(project_id) => {
                scheduler
                    .get_project_scheduler_and_timeout(project_id)
                    .await?
                    .1
            }
            None => scheduler.context().config.default_timeout,
        },
    };

    scheduler
        .release_lock(args.task, &args.identity.requester(), timeout)
        .await?;
    print_json(&serde_json::json!({
        "task_id": args.task,
        "released": true,
    }))
}

async fn run_release_user_command(
    scheduler: &Scheduler,
    args: ProjectIdentityArgs,
) -> anyhow::Result<()> {
    let released = scheduler
        .release_user_locks_for_project(&args.identity.requester(), args.project)
        .await?;
    print_json(&serde_json::json!({
        "project_id": args.project,
        "released": released,
    }))
}

async fn run_locks_command(scheduler: &Scheduler, args: LocksArgs) -> anyhow::Result<()> {
    let ctx = scheduler.context();
    let key = match (args.task, args.holder) {
        (Some(task_id), _) => ctx.keys.task_users_key(task_id),
        (None, Some(holder)) => ctx.keys.user_tasks_key(&holder),
        (None, None) => anyhow::bail!("Either --task or --holder is required"),
    };

    let locks = ctx.lock_manager(ctx.config.default_timeout);
    let mut entries: Vec<LockEntry> = locks
        .get_locks(&key)
        .await?
        .into_iter()
        .map(|(holder, expiration)| LockEntry {
            holder,
            expiration,
            seconds_remaining: locks.seconds_remaining(expiration),
        })
        .collect();
    entries.sort_by(|a, b| a.holder.cmp(&b.holder));

    print_json(&serde_json::json!({
        "key": key,
        "locks": entries,
    }))
}

async fn run_active_users_command(scheduler: &Scheduler, args: ProjectArgs) -> anyhow::Result<()> {
    let users = scheduler.registry().get_active_users(args.project).await?;
    print_json(&serde_json::json!({
        "project_id": args.project,
        "count": users.len(),
        "users": users,
    }))
}

async fn run_available_command(
    scheduler: &Scheduler,
    args: ProjectIdentityArgs,
) -> anyhow::Result<()> {
    let available = scheduler
        .n_available_tasks_for_user(args.project, &args.identity.requester())
        .await?;
    print_json(&serde_json::json!({
        "project_id": args.project,
        "available": available,
    }))
}
