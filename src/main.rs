mod alarm;
mod api;
mod engine;
mod logging;
mod service;
mod storage;
mod task;

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::info;

use crate::alarm::effects::BellEffects;
use crate::api::{ApiServer, ApiServerConfig};
use crate::engine::ReminderEngine;
use crate::service::{ServiceConfig, run_service};
use crate::storage::FileStorage;
use crate::task::model::{
    TaskDraft, TaskId, TimeDisplayMode, deadline_after, format_deadline, parse_deadline,
};
use crate::task::status::classify;

type CliEngine = ReminderEngine<FileStorage, BellEffects>;

#[derive(Parser, Debug)]
#[command(
    name = "studyhub",
    version,
    about = "Study task list with deadline alarms and a missed-task log"
)]
struct Cli {
    #[arg(long, global = true, default_value = "studyhub-data")]
    data_dir: PathBuf,

    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(short = 'q', long = "quiet", action = ArgAction::Count, global = true)]
    quiet: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the alarm loop and the local HTTP API.
    Serve(ServeArgs),
    /// Create a task.
    Add(TaskArgs),
    /// Replace a task's fields. Re-arms its alarm.
    Edit {
        id: TaskId,
        #[command(flatten)]
        task: TaskArgs,
    },
    /// Tasks sorted by deadline with their status.
    List {
        #[arg(long = "12h")]
        hour12: bool,
    },
    /// Dismiss the alarm for a task's current deadline.
    Ack { id: TaskId },
    Delete { id: TaskId },
    /// Run one scheduler pass and print what happened.
    Tick,
    Missed {
        #[arg(long)]
        clear: bool,
    },
    /// Tasks whose deadline has been reached.
    Announcements,
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1")]
    api_bind: String,

    #[arg(long, default_value_t = 8098)]
    api_port: u16,

    #[arg(long, default_value_t = 1_000)]
    poll_ms: u64,

    /// Log notifications without ringing the terminal bell.
    #[arg(long)]
    silent: bool,

    #[arg(long)]
    max_ticks: Option<u64>,
}

#[derive(Args, Debug)]
struct TaskArgs {
    #[arg(long)]
    title: String,

    #[arg(long, default_value = "")]
    content: String,

    /// RFC 3339 or local `YYYY-MM-DDTHH:MM[:SS]`.
    #[arg(long, conflicts_with = "within")]
    deadline: Option<String>,

    /// Deadline relative to now, e.g. `90s`, `15m`, `2h`.
    #[arg(long = "in", value_name = "DURATION")]
    within: Option<String>,

    #[arg(long)]
    alarm: bool,
}

impl TaskArgs {
    fn into_draft(self, now: DateTime<Utc>) -> Result<TaskDraft> {
        let deadline = match (self.deadline, self.within) {
            (Some(raw), _) => Some(parse_deadline(&raw)?),
            (None, Some(token)) => Some(deadline_after(now, &token)?),
            (None, None) => None,
        };
        Ok(TaskDraft {
            title: self.title,
            content: self.content,
            deadline,
            alarm_enabled: self.alarm,
        })
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(cli.verbose, cli.quiet)?;

    match cli.command {
        Command::Serve(args) => serve(&cli.data_dir, args),
        Command::Add(args) => {
            let mut engine = open_engine(&cli.data_dir)?;
            let now = Utc::now();
            let id = engine.create_task(args.into_draft(now)?, now)?;
            println!("created task {id}");
            Ok(())
        }
        Command::Edit { id, task } => {
            let mut engine = open_engine(&cli.data_dir)?;
            let draft = task.into_draft(Utc::now())?;
            report(engine.update_task(id, draft)?, "updated", id);
            Ok(())
        }
        Command::List { hour12 } => {
            let engine = open_engine(&cli.data_dir)?;
            print_list(&engine, display_mode(hour12));
            Ok(())
        }
        Command::Ack { id } => {
            let mut engine = open_engine(&cli.data_dir)?;
            report(engine.acknowledge(id, Utc::now()), "acknowledged", id);
            Ok(())
        }
        Command::Delete { id } => {
            let mut engine = open_engine(&cli.data_dir)?;
            report(engine.delete_task(id), "deleted", id);
            Ok(())
        }
        Command::Tick => {
            let mut engine = open_engine(&cli.data_dir)?;
            let outcome = engine.tick(Utc::now());
            println!(
                "triggered={} expired={} missed_logged={}",
                outcome.triggered, outcome.expired, outcome.missed_logged
            );
            let mut notifications = engine.effects().notifications().collect::<Vec<_>>();
            notifications.sort_by_key(|notification| notification.task_id);
            for notification in notifications {
                println!("{}: {}", notification.title, notification.body);
            }
            Ok(())
        }
        Command::Missed { clear } => {
            let mut engine = open_engine(&cli.data_dir)?;
            if clear {
                let count = engine.missed().len();
                engine.clear_missed();
                println!("cleared {count} missed entries");
                return Ok(());
            }
            print_missed(&engine);
            Ok(())
        }
        Command::Announcements => {
            let engine = open_engine(&cli.data_dir)?;
            print_announcements(&engine);
            Ok(())
        }
    }
}

fn serve(data_dir: &Path, args: ServeArgs) -> Result<()> {
    if args.poll_ms == 0 {
        bail!("--poll-ms must be greater than zero");
    }

    let storage = FileStorage::open(data_dir)?;
    let effects = BellEffects::new(args.silent).with_focus_callback(Box::new(|id: TaskId| {
        println!("focus task {id}");
    }));
    let mut engine = ReminderEngine::load(storage, effects)
        .with_context(|| format!("failed to load tasks from {}", data_dir.display()))?;

    let (commands_tx, commands_rx) = mpsc::channel();
    let api_server = ApiServer::start(
        ApiServerConfig {
            bind_addr: args.api_bind.clone(),
            port: args.api_port,
        },
        commands_tx,
    )
    .with_context(|| {
        format!(
            "failed to start local API at {}:{}",
            args.api_bind, args.api_port
        )
    })?;
    println!("StudyHub API: http://{}:{}/v1", args.api_bind, api_server.port());

    let summary = run_service(
        &mut engine,
        &commands_rx,
        Some(&api_server.state),
        &ServiceConfig {
            poll_interval: Duration::from_millis(args.poll_ms),
            max_ticks: args.max_ticks,
        },
    );
    drop(api_server);
    info!(
        ticks = summary.ticks,
        commands = summary.commands,
        "service stopped"
    );
    Ok(())
}

fn open_engine(data_dir: &Path) -> Result<CliEngine> {
    let storage = FileStorage::open(data_dir)?;
    ReminderEngine::load(storage, BellEffects::new(true))
        .with_context(|| format!("failed to load tasks from {}", data_dir.display()))
}

fn display_mode(hour12: bool) -> TimeDisplayMode {
    if hour12 {
        TimeDisplayMode::Hour12
    } else {
        TimeDisplayMode::Hour24
    }
}

fn report(changed: bool, verb: &str, id: TaskId) {
    if changed {
        println!("{verb} task {id}");
    } else {
        println!("no task with id {id}");
    }
}

fn print_list(engine: &CliEngine, mode: TimeDisplayMode) {
    let tasks = engine.tasks().sorted_by_deadline();
    if tasks.is_empty() {
        println!("no tasks");
        return;
    }
    let now = Utc::now();
    for task in tasks {
        let alarm = if task.alarm_enabled { "  [alarm]" } else { "" };
        println!(
            "{}  {:<9}  {:<22}  {}{}",
            task.id,
            classify(task, now).label(),
            format_deadline(task.deadline, mode),
            task.title,
            alarm
        );
    }
}

fn print_missed(engine: &CliEngine) {
    let entries = engine.missed().entries();
    if entries.is_empty() {
        println!("no missed tasks");
        return;
    }
    for entry in entries {
        println!(
            "{}  {}  (due {})",
            format_deadline(Some(entry.missed_at), TimeDisplayMode::Hour24),
            entry.title,
            format_deadline(entry.deadline, TimeDisplayMode::Hour24)
        );
    }
}

fn print_announcements(engine: &CliEngine) {
    let now = Utc::now();
    let overdue = engine.tasks().overdue(now);
    if overdue.is_empty() {
        println!("no announcements");
        return;
    }
    for task in overdue {
        println!(
            "{:<9}  {}  {}",
            classify(task, now).label(),
            task.title,
            format_deadline(task.deadline, TimeDisplayMode::Hour24)
        );
    }
}
