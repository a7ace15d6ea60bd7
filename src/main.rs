//! # CouponSnipe CLI
//!
//! Schedules single HTTP requests to fire at a precise reference-clock
//! instant and retries them under a bounded budget.
//!
//! Usage:
//!   couponsnipe add --name "jd 20:00" --url https://... --at 20:00
//!   couponsnipe start <id>             # Arm the timer
//!   couponsnipe daemon                 # Keep timers live, resync the clock
//!   couponsnipe list

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use couponsnipe_core::config::Settings;
use couponsnipe_engine::{BackoffMode, NewTask, Snapshot, SnipeService, Task};

#[derive(Parser)]
#[command(
    name = "couponsnipe",
    version,
    about = "🎯 CouponSnipe — millisecond-precision timed HTTP requests"
)]
struct Cli {
    /// Path to config file (default ~/.couponsnipe/config.toml)
    #[arg(long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new task
    Add {
        /// Human-readable task name
        #[arg(long)]
        name: String,
        /// Target URL
        #[arg(long)]
        url: String,
        /// HTTP method
        #[arg(long, default_value = "POST")]
        method: String,
        /// Execution time: RFC 3339 or HH:MM[:SS[:ms]] (today/tomorrow)
        #[arg(long = "at")]
        execute_at: Option<String>,
        /// Request body, sent as-is
        #[arg(long)]
        body: Option<String>,
        /// Extra header as "Name: value" (repeatable)
        #[arg(long = "header", short = 'H')]
        headers: Vec<String>,
        /// Lead time before the target instant, in milliseconds
        #[arg(long)]
        advance_ms: Option<u64>,
        /// Attempt budget
        #[arg(long)]
        max_attempts: Option<u32>,
        /// Base delay between attempts, in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,
        /// Hedged request paths per attempt (1 disables hedging)
        #[arg(long)]
        concurrency: Option<u32>,
        /// Grow the interval exponentially between attempts
        #[arg(long)]
        exponential_backoff: bool,
        /// Arm the timer immediately after creating
        #[arg(long)]
        start: bool,
    },
    /// List all tasks
    List,
    /// Show one task in full
    Show { id: String },
    /// Delete a task (cancelling it first if running)
    Delete { id: String },
    /// Arm a task's timer
    Start { id: String },
    /// Cancel a task
    Stop { id: String },
    /// Fire a single attempt immediately, ignoring the schedule
    RunNow { id: String },
    /// Sync the clock against the reference source and show the offset
    SyncTime,
    /// Export all tasks and settings as JSON
    Export {
        /// Output file (stdout when omitted)
        #[arg(long)]
        out: Option<String>,
    },
    /// Import tasks from an exported snapshot
    Import { file: String },
    /// Delete all tasks and wipe the store
    Clear {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Run in the foreground: keep timers live and resync periodically
    Daemon,
}

fn parse_header(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("header must be \"Name: value\", got {raw:?}"))?;
    Ok((name.trim().to_string(), value.trim().to_string()))
}

fn print_task_line(task: &Task) {
    println!(
        "  {}  [{:<9}]  {}  @ {}  ({} attempt(s), {} success(es))",
        task.id,
        task.status.to_string(),
        task.name,
        task.schedule.execute_at.to_rfc3339(),
        task.stats.attempts,
        task.stats.successes,
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "couponsnipe=debug,couponsnipe_engine=debug,couponsnipe_clock=debug"
    } else {
        "couponsnipe=info,couponsnipe_engine=info,couponsnipe_clock=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let settings = match &cli.config {
        Some(path) => {
            let expanded = shellexpand::tilde(path).to_string();
            Settings::load_from(Path::new(&expanded))?
        }
        None => Settings::load()?,
    };

    let service = SnipeService::new(settings);
    service.restore().await;

    match cli.command {
        Command::Add {
            name,
            url,
            method,
            execute_at,
            body,
            headers,
            advance_ms,
            max_attempts,
            interval_ms,
            concurrency,
            exponential_backoff,
            start,
        } => {
            let mut header_map = std::collections::BTreeMap::new();
            for raw in &headers {
                let (k, v) = parse_header(raw)?;
                header_map.insert(k, v);
            }
            let task = service
                .create_task(NewTask {
                    name,
                    url,
                    method: Some(method),
                    headers: header_map,
                    body,
                    execute_at,
                    advance_ms,
                    max_attempts,
                    interval_ms,
                    concurrency,
                    backoff: exponential_backoff.then_some(BackoffMode::Exponential),
                    rules: None,
                })
                .await?;
            println!("✅ Task created: {}", task.id);
            println!("   🎯 {} {}", task.request.method, task.request.url);
            println!(
                "   ⏰ {} (−{}ms advance)",
                task.schedule.execute_at.to_rfc3339(),
                task.schedule.advance_ms
            );
            if start {
                service.start(&task.id).await?;
                println!("   🚀 Armed — run `couponsnipe daemon` to keep the timer live");
                wait_for_idle(&service).await;
            }
        }
        Command::List => {
            let tasks = service.list().await;
            if tasks.is_empty() {
                println!("No tasks. Create one with `couponsnipe add`.");
            } else {
                println!("📋 {} task(s):", tasks.len());
                for task in &tasks {
                    print_task_line(task);
                }
            }
        }
        Command::Show { id } => match service.get(&id).await {
            Some(task) => println!("{}", serde_json::to_string_pretty(&task)?),
            None => anyhow::bail!("no task with id {id}"),
        },
        Command::Delete { id } => {
            service.delete(&id).await?;
            println!("🗑️ Task {id} deleted");
        }
        Command::Start { id } => {
            service.start(&id).await?;
            println!("🚀 Task {id} armed — run `couponsnipe daemon` to keep the timer live");
            wait_for_idle(&service).await;
        }
        Command::Stop { id } => {
            service.stop(&id).await;
            println!("🛑 Task {id} stopped");
        }
        Command::RunNow { id } => {
            let (response, verdict) = service.execute_immediate(&id).await?;
            println!(
                "🎯 {} in {:.1}ms → {:?}",
                response.status, response.duration_ms, verdict
            );
            if !response.body.is_empty() {
                println!("{}", response.body);
            }
        }
        Command::SyncTime => {
            let status = service.sync_time().await;
            println!("🕐 Clock offset: {:+.1}ms", status.offset_ms);
            println!(
                "   📡 One-way delay: avg {:.1}ms over {} sample(s)",
                status.delay.avg, status.delay.count
            );
            match status.last_sync_at {
                Some(at) => println!("   ✅ Last sync: {}", at.to_rfc3339()),
                None => println!("   ⚠️ Never synced"),
            }
        }
        Command::Export { out } => {
            let snapshot = service.export().await;
            let json = serde_json::to_string_pretty(&snapshot)?;
            match out {
                Some(path) => {
                    let expanded = shellexpand::tilde(&path).to_string();
                    std::fs::write(&expanded, json)?;
                    println!("📦 Exported {} task(s) to {expanded}", snapshot.tasks.len());
                }
                None => println!("{json}"),
            }
        }
        Command::Import { file } => {
            let expanded = shellexpand::tilde(&file).to_string();
            let content = std::fs::read_to_string(&expanded)?;
            let snapshot: Snapshot = serde_json::from_str(&content)?;
            let count = service.import(snapshot).await?;
            println!("📦 Imported {count} task(s)");
        }
        Command::Clear { yes } => {
            if !yes {
                anyhow::bail!("refusing to wipe all tasks without --yes");
            }
            service.clear_all().await?;
            println!("🗑️ All tasks cleared");
        }
        Command::Daemon => {
            run_daemon(service).await?;
        }
    }

    Ok(())
}

/// Block until every running task reaches a terminal status, so one-shot
/// invocations that armed a timer see it through.
async fn wait_for_idle(service: &Arc<SnipeService>) {
    loop {
        let busy = service
            .list()
            .await
            .iter()
            .any(|t| t.status == couponsnipe_engine::TaskStatus::Running);
        if !busy {
            return;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

/// Foreground loop: timers stay armed, the clock resyncs on its configured
/// cadence, Ctrl-C exits.
async fn run_daemon(service: Arc<SnipeService>) -> Result<()> {
    println!("🎯 CouponSnipe daemon v{}", env!("CARGO_PKG_VERSION"));
    let tasks = service.list().await;
    println!("   📋 {} task(s) loaded", tasks.len());
    for task in &tasks {
        print_task_line(task);
    }

    let sync_enabled = service.settings().clock.enabled;
    let cadence = Duration::from_secs(service.settings().clock.sync_interval_secs.max(1));
    if sync_enabled {
        let status = service.sync_time().await;
        println!("   🕐 Clock offset {:+.1}ms", status.offset_ms);
    }
    println!("   Press Ctrl-C to exit\n");

    let mut resync = tokio::time::interval(cadence);
    resync.tick().await; // first tick is immediate
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\n👋 Shutting down");
                return Ok(());
            }
            _ = resync.tick() => {
                if sync_enabled {
                    service.sync_time().await;
                }
            }
        }
    }
}
