use std::sync::Arc;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use migration_scheduler::config::SchedulerConfig;
use migration_scheduler::driver::SimulatedDriver;
use migration_scheduler::inventory::{InMemoryInventory, Instance, InstanceInventory};
use migration_scheduler::scheduler::MigrationJob;
use migration_scheduler::service::{MigrationService, SchedulerStats};
use migration_scheduler::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "migration-scheduler")]
#[command(version)]
#[command(about = "Bounded-concurrency live-migration scheduler")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a batch of live migrations against the simulated hypervisor
    Simulate(SimulateArgs),
}

#[derive(Parser, Debug)]
struct SimulateArgs {
    /// Number of migrations allowed to run at once
    #[arg(long, default_value = "1")]
    max_concurrent: usize,

    /// Number of instances to migrate
    #[arg(long, default_value = "3")]
    migrations: usize,

    /// Monitor polling interval in milliseconds
    #[arg(long, default_value = "200")]
    poll_interval_ms: u64,

    /// Consecutive failed polls before a migration is declared failed
    #[arg(long, default_value = "5")]
    max_poll_failures: u32,

    /// Fail migrations the hypervisor hasn't acknowledged after this many milliseconds
    #[arg(long, default_value = "60000")]
    initiate_timeout_ms: u64,

    /// Abort migrations running longer than this many milliseconds
    #[arg(long)]
    completion_timeout_ms: Option<u64>,

    /// Fewest polls a simulated migration takes to complete
    #[arg(long, default_value = "2")]
    min_polls: u32,

    /// Most polls a simulated migration takes to complete
    #[arg(long, default_value = "6")]
    max_polls: u32,

    /// Migrations to cancel right after submission (0-based, comma-separated)
    #[arg(long, value_delimiter = ',')]
    cancel: Vec<usize>,

    /// Clear the instance task state when a queued migration is cancelled
    #[arg(long)]
    revert_on_queued_cancel: bool,

    /// Source host for every instance
    #[arg(long, default_value = "compute-src")]
    source: String,

    /// Destination host prefix; each migration gets "<prefix>-<n>"
    #[arg(long, default_value = "compute-dest")]
    dest_prefix: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct SimulationOutput {
    stats: SchedulerStats,
    migrations: Vec<MigrationJob>,
    instances: Vec<Instance>,
}

async fn run_simulation(args: SimulateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = SchedulerConfig::new(args.max_concurrent)
        .with_poll_interval_ms(args.poll_interval_ms)
        .with_max_poll_failures(args.max_poll_failures)
        .with_initiate_timeout_ms(args.initiate_timeout_ms)
        .with_revert_on_queued_cancel(args.revert_on_queued_cancel);
    if let Some(ms) = args.completion_timeout_ms {
        config = config.with_completion_timeout_ms(ms);
    }

    let driver = Arc::new(SimulatedDriver::with_completion_polls(
        args.min_polls,
        args.max_polls,
    ));
    let inventory = Arc::new(InMemoryInventory::new());
    let service = MigrationService::new(config, driver, inventory.clone())?;

    let shutdown = install_shutdown_handler()?;
    let monitor = service.spawn_monitor(shutdown.clone());

    let mut job_ids = Vec::with_capacity(args.migrations);
    for n in 0..args.migrations {
        let instance_id = inventory.create(&args.source).await;
        let dest = format!("{}-{}", args.dest_prefix, n);
        let job_id = service
            .submit_migration(instance_id, &args.source, &dest)
            .await?;
        job_ids.push(job_id);
    }

    for index in &args.cancel {
        let Some(job_id) = job_ids.get(*index) else {
            tracing::warn!(index, "No migration at this index, skipping cancel");
            continue;
        };
        match service.cancel_migration(*job_id).await {
            Ok(ack) => tracing::info!(job_id = %job_id, ack = ?ack, "Cancel accepted"),
            Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Cancel rejected"),
        }
    }

    let mut tick = tokio::time::interval(service.config().poll_interval());
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {
                let jobs = service.list_migrations(None).await;
                if jobs.iter().all(|job| job.is_terminal()) {
                    break;
                }
            }
        }
    }
    shutdown.cancel();
    monitor.await?;

    let output = SimulationOutput {
        stats: service.stats().await,
        migrations: service.list_migrations(None).await,
        instances: collect_instances(inventory.as_ref(), &job_ids, &service).await?,
    };

    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => print_table(&output),
    }
    Ok(())
}

async fn collect_instances(
    inventory: &InMemoryInventory,
    job_ids: &[uuid::Uuid],
    service: &MigrationService,
) -> Result<Vec<Instance>, Box<dyn std::error::Error>> {
    let mut instances = Vec::with_capacity(job_ids.len());
    for job_id in job_ids {
        let job = service.get_migration_status(*job_id).await?;
        if let Some(instance) = inventory.get_instance(&job.instance_id).await? {
            instances.push(instance);
        }
    }
    Ok(instances)
}

fn print_table(output: &SimulationOutput) {
    println!(
        "{:<36}  {:<10}  {:<16}  {:>5}  {}",
        "MIGRATION", "STATE", "DEST", "PCT", "ERROR"
    );
    for job in &output.migrations {
        let percent = job.progress.map(|p| p.percent()).unwrap_or(0);
        let mut error = job.error.clone().unwrap_or_default();
        if job.needs_attention {
            error.push_str(" [needs attention]");
        }
        println!(
            "{:<36}  {:<10}  {:<16}  {:>4}%  {}",
            job.id, job.state, job.dest_host, percent, error
        );
    }

    println!();
    println!("{:<36}  {:<16}  {}", "INSTANCE", "HOST", "TASK STATE");
    for instance in &output.instances {
        println!(
            "{:<36}  {:<16}  {}",
            instance.id, instance.host, instance.task_state
        );
    }

    println!();
    println!(
        "slots in use: {}/{}  queued: {}",
        output.stats.slots_in_use, output.stats.capacity, output.stats.queued
    );
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Simulate(simulate_args) => run_simulation(simulate_args).await?,
    }
    Ok(())
}
