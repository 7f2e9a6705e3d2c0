//! cogtask CLI entry point.

use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;
use std::fs;
use std::path::Path;
use std::sync::Arc;

mod cli;

use cli::{Cli, Command, SessionCommand};
use cogtask::config::Config;
use cogtask::{
    Admission, Briefing, CheckpointReason, CheckpointSummary, ConsolidationReport, Consolidator, ControllerSettings,
    FileCheckpointStore, FileTaskStore, LifecycleController, RankedTask, SpawnRequest, Task, TaskId, TaskStatus,
};

fn setup_logging(log_dir: &Path) -> Result<()> {
    fs::create_dir_all(log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("cogtask.log");

    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let result = tokio::runtime::Runtime::new()
        .context("Failed to start async runtime")
        .and_then(|rt| rt.block_on(async_main(cli)));

    if let Err(report) = result {
        std::process::exit(report_error(&report));
    }
}

/// Print an error with its next step and pick the exit code.
fn report_error(report: &eyre::Report) -> i32 {
    match report.downcast_ref::<cogtask::Error>() {
        Some(err) => {
            eprintln!("{} {} [{}]", "✗".red(), err, err.kind());
            eprintln!("  {}", err.hint().dimmed());
            err.exit_code()
        }
        None => {
            eprintln!("{} {:#}", "✗".red(), report);
            1
        }
    }
}

async fn open_controller(config: &Config) -> Result<LifecycleController> {
    let store = Arc::new(FileTaskStore::new(config.registry_path()));
    let checkpoints = Arc::new(FileCheckpointStore::new(config.checkpoint_dir()));
    let consolidator = Consolidator::with_files(
        config.decisions_dir(),
        config.summaries_dir(),
        config.reindex_queue_path(),
    );
    let controller = LifecycleController::open(store, checkpoints, ControllerSettings::from(config)).await?;
    Ok(controller.with_consolidator(consolidator))
}

/// Accept a full id or an unambiguous suffix of one.
fn resolve_id(ctl: &LifecycleController, raw: &str) -> TaskId {
    let exact = TaskId::from(raw);
    if ctl.registry().contains(&exact) {
        return exact;
    }
    let matches: Vec<&Task> = ctl.registry().iter().filter(|t| t.id.0.ends_with(raw)).collect();
    match matches.as_slice() {
        [only] => only.id.clone(),
        _ => exact,
    }
}

async fn async_main(cli: Cli) -> Result<()> {
    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    setup_logging(&config.log_dir()).context("Failed to setup logging")?;
    info!("Using data directory {}", config.data_dir.display());

    let mut ctl = open_controller(&config).await?;

    match cli.command.unwrap_or(Command::Status { all: false }) {
        Command::Spawn {
            title,
            activate,
            priority,
            urgency,
            value,
            deadline,
            context_size,
            blocked_by,
        } => {
            let mut request = SpawnRequest::new(title)
                .with_priority_signal(priority.unwrap_or(0.0))
                .with_context_size(context_size)
                .blocked_by(blocked_by.iter().map(|b| resolve_id(&ctl, b)));
            if activate {
                request = request.with_activation();
            }
            if let Some(urgency) = urgency {
                request = request.with_urgency(urgency);
            }
            if let Some(value) = value {
                request = request.with_value(value);
            }
            if let Some(deadline) = deadline {
                request = request.with_deadline(deadline);
            }

            let task = ctl.spawn(request).await?;
            println!("{} Spawned {} {}", "✓".green(), task.id.0.cyan(), task.title);
            println!("  Status: {}", status_label(task.status));
        }

        Command::Switch { id } => {
            let task = ctl.switch(&resolve_id(&ctl, &id)).await?;
            println!("{} Now working on {} {}", "●".green(), task.id.0.cyan(), task.title);
        }

        Command::Pause => {
            let task = ctl.pause().await?;
            println!("{} Paused {} {}", "◑".yellow(), task.id.0.cyan(), task.title);
        }

        Command::Resume { id } => {
            let task = ctl.resume(&resolve_id(&ctl, &id)).await?;
            println!("{} Resumed {} {}", "●".green(), task.id.0.cyan(), task.title);
        }

        Command::Block { id, by } => {
            let deps: Vec<TaskId> = by.iter().map(|b| resolve_id(&ctl, b)).collect();
            let task = ctl.block(&resolve_id(&ctl, &id), &deps).await?;
            println!("{} Blocked {} {}", "◌".red(), task.id.0.cyan(), task.title);
            for dep in &task.blocked_by {
                println!("  waits on {}", dep.0.cyan());
            }
        }

        Command::Unblock { id } => {
            let task = ctl.unblock(&resolve_id(&ctl, &id)).await?;
            println!("{} Unblocked {} {}", "✓".green(), task.id.0.cyan(), task.title);
        }

        Command::Complete { id } => {
            let completion = ctl.complete(&resolve_id(&ctl, &id)).await?;
            println!(
                "{} Completed {} {}",
                "✓".green(),
                completion.task.id.0.cyan(),
                completion.task.title
            );
            for dependent in &completion.unblocked {
                println!("  {} {} is ready (paused)", "→".blue(), dependent.0.cyan());
            }
            if let Some(export) = &completion.export {
                match &export.error {
                    None => println!(
                        "  exported {} decisions{}",
                        export.decisions_exported,
                        if export.summary_exported { " and a summary" } else { "" }
                    ),
                    Some(reason) => println!("  {} export incomplete: {} (retried by `ctm consolidate`)", "!".yellow(), reason),
                }
            }
        }

        Command::Cancel { id } => {
            let task = ctl.cancel(&resolve_id(&ctl, &id)).await?;
            println!("{} Cancelled {} {}", "⊘".white(), task.id.0.cyan(), task.title);
        }

        Command::Priority { id, signal } => {
            let task = ctl.adjust_priority(&resolve_id(&ctl, &id), signal).await?;
            println!("{} {} priority signal {:+.2}", "✓".green(), task.id.0.cyan(), task.priority_signal);
        }

        Command::Error { id } => {
            let task_id = resolve_id(&ctl, &id);
            let count = ctl.record_error(&task_id).await?;
            println!("{} {} has {} recorded errors", "!".yellow(), task_id.0.cyan(), count);
        }

        Command::Touch { id } => {
            let task_id = resolve_id(&ctl, &id);
            match ctl.touch(&task_id).await? {
                Admission::Refreshed => println!("{} {} refreshed in working memory", "✓".green(), task_id.0.cyan()),
                Admission::Admitted { evicted } => {
                    println!("{} {} admitted to working memory", "✓".green(), task_id.0.cyan());
                    for e in evicted {
                        println!("  evicted {}", e.0.dimmed());
                    }
                }
                Admission::Rejected => println!(
                    "{} {} does not fit next to the active task; not admitted",
                    "!".yellow(),
                    task_id.0.cyan()
                ),
            }
        }

        Command::Decide {
            id,
            title,
            rationale,
            supersedes,
        } => {
            let task = ctl.record_decision(&resolve_id(&ctl, &id), &title, &rationale, supersedes).await?;
            println!("{} Decision recorded on {} ({} total)", "✓".green(), task.id.0.cyan(), task.decisions.len());
        }

        Command::Deviate { id, text } => {
            let task = ctl.record_deviation(&resolve_id(&ctl, &id), &text).await?;
            println!("{} Deviation recorded on {}", "✓".green(), task.id.0.cyan());
        }

        Command::Park { id, text } => {
            let task = ctl.park_idea(&resolve_id(&ctl, &id), &text).await?;
            println!("{} Idea parked on {}", "✓".green(), task.id.0.cyan());
        }

        Command::Set {
            id,
            context_size,
            urgency,
            value,
            deadline,
            clear_deadline,
        } => {
            let task_id = resolve_id(&ctl, &id);
            let mut updated = false;
            if let Some(size) = context_size {
                ctl.set_context_size(&task_id, size).await?;
                updated = true;
            }
            if let Some(u) = urgency {
                ctl.set_urgency(&task_id, Some(u)).await?;
                updated = true;
            }
            if let Some(v) = value {
                ctl.set_value(&task_id, v).await?;
                updated = true;
            }
            if deadline.is_some() || clear_deadline {
                ctl.set_deadline(&task_id, deadline).await?;
                updated = true;
            }
            if updated {
                print_task(ctl.get(&task_id)?);
            } else {
                println!("{} Nothing to update", "!".yellow());
            }
        }

        Command::Checkpoint { list: true } => {
            let checkpoints = ctl.list_checkpoints().await?;
            if checkpoints.is_empty() {
                println!("{} No checkpoints", "○".yellow());
            }
            for checkpoint in &checkpoints {
                print_checkpoint(checkpoint);
            }
        }

        Command::Checkpoint { list: false } => {
            let checkpoint = ctl.checkpoint(CheckpointReason::Manual).await?;
            print!("{} Checkpoint written: ", "✓".green());
            print_checkpoint(&checkpoint);
        }

        Command::Consolidate => {
            let report = ctl.consolidate().await?;
            print_consolidation(&report);
        }

        Command::Status { all } => {
            print_status(&ctl, all);
        }

        Command::Show { id } => {
            print_task(ctl.get(&resolve_id(&ctl, &id))?);
        }

        Command::Next => match ctl.next() {
            Some(task) => {
                println!("{} {} {}", "→".blue(), task.id.0.cyan(), task.title);
                println!("  {}", status_label(task.status));
            }
            None => println!("{} Nothing to work on", "○".yellow()),
        },

        Command::Session(SessionCommand::Start) => {
            let briefing = ctl.on_session_start().await?;
            print_briefing(&briefing);
        }

        Command::Session(SessionCommand::End) => {
            let end = ctl.on_session_end().await?;
            print_consolidation(&end.consolidation);
            print!("{} Checkpoint written: ", "✓".green());
            print_checkpoint(&end.checkpoint);
        }

        Command::Session(SessionCommand::Pressure) => {
            let checkpoint = ctl.on_context_pressure().await?;
            print!("{} Checkpoint written: ", "✓".green());
            print_checkpoint(&checkpoint);
        }

        Command::Recover => {
            let checkpoint = ctl.recover().await?;
            print!("{} Recovered from ", "✓".green());
            print_checkpoint(&checkpoint);
        }
    }

    Ok(())
}

fn status_icon(status: TaskStatus) -> ColoredString {
    match status {
        TaskStatus::Active => "●".green(),
        TaskStatus::Paused => "◑".yellow(),
        TaskStatus::Blocked => "◌".red(),
        TaskStatus::Completed => "✓".green(),
        TaskStatus::Cancelled => "⊘".white(),
    }
}

fn status_label(status: TaskStatus) -> ColoredString {
    let label = status.to_string();
    match status {
        TaskStatus::Active => label.green(),
        TaskStatus::Paused => label.yellow(),
        TaskStatus::Blocked => label.red(),
        TaskStatus::Completed => label.green(),
        TaskStatus::Cancelled => label.dimmed(),
    }
}

fn print_ranked(ranked: &[RankedTask]) {
    for entry in ranked {
        let marker = if entry.dependency_blocked { " (waiting)".red().to_string() } else { String::new() };
        println!(
            "{} {:.3} {} {}{}",
            status_icon(entry.task.status),
            entry.score.total,
            entry.task.id.0.cyan(),
            entry.task.title,
            marker
        );
    }
}

fn print_status(ctl: &LifecycleController, all: bool) {
    match ctl.active() {
        Some(task) => println!("{} Active: {} {}", "●".green(), task.id.0.cyan(), task.title.bold()),
        None => println!("{} No active task", "○".yellow()),
    }
    println!();

    let ranked = ctl.ranked();
    if ranked.is_empty() {
        println!("{} No open tasks", "○".yellow());
    } else {
        println!("{}", "Queue:".bold());
        print_ranked(&ranked);
    }

    if all {
        let finished: Vec<&Task> = ctl.registry().iter().filter(|t| t.status.is_terminal()).collect();
        if !finished.is_empty() {
            println!();
            println!("{}", "Finished:".bold());
            for task in finished {
                println!("{} {} {}", status_icon(task.status), task.id.0.cyan(), task.title);
            }
        }
    }

    let pool = ctl.pool();
    println!();
    println!(
        "{} {}/{} entries, weight {}/{}",
        "Working memory:".bold(),
        pool.len(),
        pool.settings().max_entries,
        pool.total_weight(),
        pool.settings().max_weight
    );
    for (entry, score) in pool.ranked(ctl.now()) {
        println!("  {} accesses={} weight={} keep={:.3}", entry.task_id.0.cyan(), entry.access_count, entry.resident_weight, score);
    }

    let pending = ctl.pending_consolidation();
    if pending > 0 {
        println!();
        println!("{} {} completed tasks awaiting consolidation", "!".yellow(), pending);
    }
}

fn print_task(task: &Task) {
    println!("{} {}", task.id.0.cyan(), task.title.bold());
    println!("  Status:     {}", status_label(task.status));
    println!("  Priority:   {:+.2}", task.priority_signal);
    println!("  Value:      {:.2}", task.value);
    if let Some(urgency) = task.urgency {
        println!("  Urgency:    {:.2}", urgency);
    }
    if let Some(deadline) = task.deadline {
        println!("  Deadline:   {}", deadline.to_rfc3339());
    }
    println!("  Created:    {}", task.created_at.to_rfc3339());
    println!("  Touched:    {}", task.last_touched_at.to_rfc3339());
    println!("  Errors:     {}", task.error_count);
    println!("  Context:    {}", task.context_size);
    if !task.blocked_by.is_empty() {
        let deps: Vec<&str> = task.blocked_by.iter().map(|d| d.as_ref()).collect();
        println!("  Blocked by: {}", deps.join(", "));
    }
    if !task.decisions.is_empty() {
        println!("  Decisions:");
        for d in &task.decisions {
            println!("    - {}: {}", d.title.bold(), d.rationale);
        }
    }
    if !task.deviations.is_empty() {
        println!("  Deviations:");
        for note in &task.deviations {
            println!("    - {}", note.text);
        }
    }
    if !task.parked_ideas.is_empty() {
        println!("  Parked ideas:");
        for note in &task.parked_ideas {
            println!("    - {}", note.text);
        }
    }
    println!("  History:    {} events", task.history.len());
}

fn print_checkpoint(checkpoint: &CheckpointSummary) {
    println!(
        "{} {} ({}, revision {}, {} tasks)",
        checkpoint.id.cyan(),
        checkpoint.created_at.to_rfc3339(),
        checkpoint.reason,
        checkpoint.revision,
        checkpoint.task_count
    );
}

fn print_consolidation(report: &ConsolidationReport) {
    if report.is_empty() {
        println!("{} Nothing to consolidate", "○".yellow());
        return;
    }
    println!(
        "{} Exported {} decisions and {} summaries",
        "✓".green(),
        report.decisions_exported(),
        report.summaries_exported()
    );
    for (task_id, reason) in report.failures() {
        println!("  {} {}: {}", "✗".red(), task_id.0.cyan(), reason);
    }
}

fn print_briefing(briefing: &Briefing) {
    println!("{} Session briefing ({})", "📋".blue(), briefing.generated_at.to_rfc3339());
    println!();
    match &briefing.active {
        Some(task) => println!("  Active:  {} {}", task.id.0.cyan(), task.title.bold()),
        None => println!("  Active:  none"),
    }
    if let Some(next) = &briefing.next {
        println!("  Next:    {}", next.0.cyan());
    }
    let counts = &briefing.counts;
    println!(
        "  Tasks:   {} open ({} paused, {} blocked), {} finished",
        counts.live(),
        counts.paused,
        counts.blocked,
        counts.terminal()
    );
    println!("  Pool:    {} entries", briefing.pool.len());
    if briefing.pending_consolidation > 0 {
        println!("  {} {} completed tasks awaiting consolidation", "!".yellow(), briefing.pending_consolidation);
    }
    match &briefing.latest_checkpoint {
        Some(checkpoint) => println!("  Last checkpoint: {} ({})", checkpoint.created_at.to_rfc3339(), checkpoint.reason),
        None => println!("  Last checkpoint: none"),
    }
    if !briefing.repaired.is_empty() {
        println!("  {} demoted {} extra ACTIVE tasks", "!".yellow(), briefing.repaired.len());
    }

    if !briefing.ranked.is_empty() {
        println!();
        print_ranked(&briefing.ranked);
    }
}
