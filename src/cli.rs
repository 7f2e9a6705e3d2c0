//! CLI argument parsing for cogtask.

use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "ctm",
    about = "Cognitive task manager: what to work on now, and where you left off",
    version,
    after_help = "Logs are written to <data_dir>/logs/cogtask.log (filter with RUST_LOG)."
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Data directory (overrides config)
    #[arg(long, global = true, env = "COGTASK_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Session boundary signals.
#[derive(Subcommand, Debug, PartialEq)]
pub enum SessionCommand {
    /// Print a briefing for a new session
    Start,
    /// Consolidate completed work and checkpoint
    End,
    /// Checkpoint immediately before context is lost
    Pressure,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Create a new task
    Spawn {
        /// Task title
        title: String,

        /// Make the new task ACTIVE
        #[arg(short, long)]
        activate: bool,

        /// User priority signal in [-1, 1]
        #[arg(short, long, allow_hyphen_values = true)]
        priority: Option<f64>,

        /// Urgency in [0, 1]
        #[arg(short, long)]
        urgency: Option<f64>,

        /// Importance in [0, 1]
        #[arg(short, long)]
        value: Option<f64>,

        /// Deadline (RFC 3339, or relative like 90m, 4h, 2d)
        #[arg(short, long, value_parser = parse_deadline)]
        deadline: Option<DateTime<Utc>>,

        /// Estimated size of the task's working context
        #[arg(short = 's', long, default_value = "0")]
        context_size: u64,

        /// Start BLOCKED on these tasks
        #[arg(short, long)]
        blocked_by: Vec<String>,
    },

    /// Make a task ACTIVE, pausing the current one
    Switch {
        /// Task ID
        id: String,
    },

    /// Pause the ACTIVE task
    Pause,

    /// Resume a paused or blocked task
    Resume {
        /// Task ID
        id: String,
    },

    /// Block a task on other tasks (no dependencies clears the list)
    Block {
        /// Task to block
        id: String,

        /// Tasks it waits on
        by: Vec<String>,
    },

    /// Move a blocked task back to paused once its dependencies are done
    Unblock {
        /// Task ID
        id: String,
    },

    /// Complete a task and export what it produced
    #[command(alias = "done")]
    Complete {
        /// Task ID
        id: String,
    },

    /// Cancel a task
    Cancel {
        /// Task ID
        id: String,
    },

    /// Set the user priority signal
    Priority {
        /// Task ID
        id: String,

        /// Signal in [-1, 1]
        #[arg(allow_hyphen_values = true)]
        signal: f64,
    },

    /// Record a failed work attempt
    Error {
        /// Task ID
        id: String,
    },

    /// Record an access (refreshes recency and the working memory pool)
    Touch {
        /// Task ID
        id: String,
    },

    /// Record a decision
    Decide {
        /// Task ID
        id: String,

        /// What was decided
        title: String,

        /// Why
        rationale: String,

        /// Identifier of a decision this one replaces
        #[arg(long)]
        supersedes: Option<String>,
    },

    /// Record a deviation from the plan
    Deviate {
        /// Task ID
        id: String,

        /// What changed
        text: String,
    },

    /// Park an idea for later
    Park {
        /// Task ID
        id: String,

        /// The idea
        text: String,
    },

    /// Update scoring inputs of a task
    Set {
        /// Task ID
        id: String,

        /// Estimated size of the task's working context
        #[arg(short = 's', long)]
        context_size: Option<u64>,

        /// Urgency in [0, 1]
        #[arg(short, long)]
        urgency: Option<f64>,

        /// Importance in [0, 1]
        #[arg(short, long)]
        value: Option<f64>,

        /// Deadline (RFC 3339, or relative like 90m, 4h, 2d)
        #[arg(short, long, value_parser = parse_deadline)]
        deadline: Option<DateTime<Utc>>,

        /// Remove the deadline
        #[arg(long, conflicts_with = "deadline")]
        clear_deadline: bool,
    },

    /// Write a checkpoint now
    Checkpoint {
        /// List stored checkpoints instead
        #[arg(short, long)]
        list: bool,
    },

    /// Export completed tasks' decisions and summaries
    Consolidate,

    /// Show the ranked queue and the working memory pool
    #[command(alias = "ls")]
    Status {
        /// Include completed and cancelled tasks
        #[arg(short, long)]
        all: bool,
    },

    /// Show task details
    Show {
        /// Task ID
        id: String,
    },

    /// Show the task that deserves attention next
    Next,

    /// Session boundary signals
    #[command(subcommand)]
    Session(SessionCommand),

    /// Restore the registry from the latest checkpoint
    Recover,
}

/// Parse an absolute (RFC 3339) or relative (`90m`, `4h`, `2d`) deadline.
pub fn parse_deadline(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(at) = DateTime::parse_from_rfc3339(s) {
        return Ok(at.with_timezone(&Utc));
    }

    let s = s.trim().trim_start_matches('+');
    let (digits, unit) = s.split_at(s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len()));
    let amount: i64 = digits
        .parse()
        .map_err(|_| format!("invalid deadline '{s}': expected RFC 3339 or a duration like 4h"))?;
    let offset = match unit {
        "m" => Duration::minutes(amount),
        "h" => Duration::hours(amount),
        "d" => Duration::days(amount),
        "w" => Duration::weeks(amount),
        _ => return Err(format!("invalid deadline unit '{unit}': use m, h, d or w")),
    };
    Ok(Utc::now() + offset)
}
