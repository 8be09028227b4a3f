mod batch_cmd;
mod exit;
mod init_cmd;
mod log_cmd;
mod parallel_cmd;
mod projects_cmd;
mod recover_cmd;
mod run_cmd;
mod status_cmd;
mod task_cmds;
mod wakeup_cmd;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use steroids_db::config::GlobalPaths;

#[derive(Parser)]
#[command(name = "steroids", about = "Autonomous multi-project task-execution daemon")]
struct Cli {
    /// Global state directory (overrides STEROIDS_HOME / ~/.steroids)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a project and create its .steroids store
    Init {
        /// Project directory
        #[arg(default_value = ".")]
        path: PathBuf,
        /// Display name (defaults to the directory name)
        #[arg(long)]
        name: Option<String>,
    },
    /// Sweep registered projects: recover, clean, and spawn runners
    Wakeup {
        /// Report what would be started without spawning anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Run the runner supervisor for one project
    Run {
        /// Project directory
        #[arg(default_value = ".")]
        path: PathBuf,
        /// Process a single task, then exit
        #[arg(long)]
        once: bool,
    },
    /// Show project status: sections, tasks, open incidents
    Status {
        /// Project directory
        #[arg(default_value = ".")]
        path: PathBuf,
    },
    /// List tasks for a project
    Tasks {
        /// Project directory
        #[arg(default_value = ".")]
        path: PathBuf,
    },
    /// Add a task to a section (creating the section if needed)
    Add {
        /// Task title
        title: String,
        /// Section name
        #[arg(long, default_value = "backlog")]
        section: String,
        /// Project directory
        #[arg(long, default_value = ".")]
        path: PathBuf,
        /// Priority 0-100; smaller wins
        #[arg(long, default_value_t = 50)]
        priority: i64,
        /// Section names this task's section depends on (repeatable)
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,
    },
    /// Mark a section skipped (or unskip it) so the scheduler passes it by
    SkipSection {
        /// Section name
        section: String,
        /// Project directory
        #[arg(long, default_value = ".")]
        path: PathBuf,
        /// Clear the skip flag instead of setting it
        #[arg(long)]
        undo: bool,
    },
    /// Force a task to pending, failed, or skipped (operator override)
    Force {
        /// Project directory
        #[arg(long, default_value = ".")]
        path: PathBuf,
        /// Task id
        task_id: String,
        /// Target status: pending | failed | skipped
        status: String,
        /// Audit note
        #[arg(long)]
        note: Option<String>,
    },
    /// Run one stuck-task detection and recovery pass
    Recover {
        /// Project directory
        #[arg(default_value = ".")]
        path: PathBuf,
    },
    /// Execute workstreams in parallel clones and merge the results
    Parallel {
        /// Project directory
        #[arg(default_value = ".")]
        path: PathBuf,
    },
    /// Process a whole section in one coder/reviewer pass
    Batch {
        /// Section name
        section: String,
        /// Project directory
        #[arg(long, default_value = ".")]
        path: PathBuf,
    },
    /// Show audit trail, rejections, and invocations for a task
    Log {
        /// Task id
        task_id: String,
        /// Project directory
        #[arg(long, default_value = ".")]
        path: PathBuf,
    },
    /// Global project registry administration
    Projects {
        #[command(subcommand)]
        command: projects_cmd::ProjectCommands,
    },
}

fn global_paths(cli: &Cli) -> GlobalPaths {
    match &cli.home {
        Some(home) => GlobalPaths::at(home),
        None => GlobalPaths::resolve(),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("steroids=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let globals = global_paths(&cli);

    let result = match cli.command {
        Commands::Init { ref path, ref name } => init_cmd::run(&globals, path, name.as_deref()).await,
        Commands::Wakeup { dry_run } => wakeup_cmd::run(&globals, dry_run).await,
        Commands::Run { ref path, once } => run_cmd::run(&globals, path, once).await,
        Commands::Status { ref path } => status_cmd::run(path).await,
        Commands::Tasks { ref path } => task_cmds::list(path).await,
        Commands::Add {
            ref title,
            ref section,
            ref path,
            priority,
            ref depends_on,
        } => task_cmds::add(path, title, section, priority, depends_on).await,
        Commands::SkipSection {
            ref section,
            ref path,
            undo,
        } => task_cmds::skip_section(path, section, !undo).await,
        Commands::Force {
            ref path,
            ref task_id,
            ref status,
            ref note,
        } => task_cmds::force(path, task_id, status, note.as_deref()).await,
        Commands::Recover { ref path } => recover_cmd::run(&globals, path).await,
        Commands::Parallel { ref path } => parallel_cmd::run(&globals, path).await,
        Commands::Batch {
            ref section,
            ref path,
        } => batch_cmd::run(&globals, path, section).await,
        Commands::Log {
            ref task_id,
            ref path,
        } => log_cmd::run(path, task_id).await,
        Commands::Projects { command } => projects_cmd::run(&globals, command).await,
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(exit::code_for_error(&e));
        }
    }
}
