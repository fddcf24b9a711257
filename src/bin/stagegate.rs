//! Stagegate CLI: manage a local project database and watch readiness.
//!
//! Usage:
//!   stagegate project <subcommand> [--db path]
//!   stagegate status <project> [--db path]
//!   stagegate watch <project> [--json] [--db path] [--config path]

use clap::{Parser, Subcommand};
use stagegate::{
    Collaborators, ExistenceQuery, Observation, PhaseChange, ProjectId, ReconcilerConfig,
    ReconciliationController, SqliteBackend, Stage, StatusQuery, TerminalSignal,
};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "stagegate",
    version,
    about = "Readiness reconciliation for asynchronously processed projects"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to SQLite database file
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Path to YAML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage projects in the local database
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },
    /// Query stage and derived records once and print the readiness verdict
    Status {
        /// Project ID
        id: String,
    },
    /// Reconcile a project until it is ready, printing each phase change
    Watch {
        /// Project ID
        id: String,
        /// Print phase changes as JSON lines
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ProjectAction {
    /// Create a new project at stage 0
    Create {
        /// Project ID
        id: String,
        /// Display name
        #[arg(long)]
        name: Option<String>,
    },
    /// List all projects
    List,
    /// Set a project's pipeline stage
    SetStage {
        /// Project ID
        id: String,
        /// New stage value
        stage: u32,
    },
    /// Insert a derived record for a project
    AddRecord {
        /// Project ID
        id: String,
        /// Record kind
        #[arg(long, default_value = "message")]
        kind: String,
        /// Record body
        #[arg(long)]
        body: Option<String>,
    },
}

fn init_logging() {
    let debug_enabled = env::var("STAGEGATE_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Get the default database path (~/.local/share/stagegate/stagegate.db)
fn default_db_path() -> PathBuf {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join(".local/share"));
    data_dir.join("stagegate").join("stagegate.db")
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("stagegate").join("config.yaml"))
}

fn load_config(path: Option<PathBuf>) -> Result<ReconcilerConfig, String> {
    match path {
        Some(path) => ReconcilerConfig::load(&path)
            .map_err(|e| format!("Failed to load config {}: {}", path.display(), e)),
        None => match default_config_path() {
            Some(path) => ReconcilerConfig::load_or_default(&path)
                .map_err(|e| format!("Failed to load config {}: {}", path.display(), e)),
            None => Ok(ReconcilerConfig::default()),
        },
    }
}

fn open_backend(db: Option<PathBuf>, config: &ReconcilerConfig) -> Result<SqliteBackend, String> {
    let db_path = db.unwrap_or_else(default_db_path);
    SqliteBackend::open(&db_path)
        .map(|backend| backend.with_feed_poll_interval(config.sqlite.feed_poll_interval()))
        .map_err(|e| format!("Failed to open database at {}: {}", db_path.display(), e))
}

fn runtime() -> Result<Runtime, String> {
    Runtime::new().map_err(|e| format!("failed to create tokio runtime: {}", e))
}

fn cmd_project_create(backend: &SqliteBackend, id: &str, name: Option<&str>) -> i32 {
    match backend.create_project(&ProjectId::from(id), name) {
        Ok(()) => {
            println!("Created project '{}'", id);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn cmd_project_list(backend: &SqliteBackend) -> i32 {
    let projects = match backend.list_projects() {
        Ok(projects) => projects,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    if projects.is_empty() {
        println!("No projects defined.");
        return 0;
    }
    println!("{:<24}  {:<24}  {:>7}  {:>7}", "ID", "NAME", "STAGE", "RECORDS");
    println!("{}", "-".repeat(68));
    for project in projects {
        println!(
            "{:<24}  {:<24}  {:>7}  {:>7}",
            project.id.as_str(),
            project.name.as_deref().unwrap_or("-"),
            project
                .stage
                .map(|stage| stage.to_string())
                .unwrap_or_else(|| "invalid".into()),
            project.record_count
        );
    }
    0
}

fn cmd_project_set_stage(backend: &SqliteBackend, id: &str, stage: u32) -> i32 {
    match backend.set_stage(&ProjectId::from(id), Stage::new(stage)) {
        Ok(()) => {
            println!("Project '{}' is now at stage {}", id, stage);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn cmd_project_add_record(backend: &SqliteBackend, id: &str, kind: &str, body: Option<&str>) -> i32 {
    match backend.add_derived_record(&ProjectId::from(id), kind, body) {
        Ok(row) => {
            println!("Added {} record #{} to project '{}'", kind, row, id);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn cmd_status(backend: SqliteBackend, config: &ReconcilerConfig, id: &str) -> i32 {
    let rt = match runtime() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };
    let project = ProjectId::from(id);
    rt.block_on(async {
        let (stage, has_records) = tokio::join!(
            backend.stage(&project),
            backend.has_derived_records(&project)
        );
        let stage = match stage {
            Ok(stage) => stage,
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        };
        let has_records = match has_records {
            Ok(has_records) => has_records,
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        };
        let observation = Observation::new(Some(stage), Some(has_records));
        println!("project:  {}", project);
        println!("stage:    {}", stage);
        println!("records:  {}", if has_records { "present" } else { "none" });
        println!(
            "verdict:  {}",
            if observation.is_ready_at(config.terminal_stage) { "ready" } else { "processing" }
        );
        0
    })
}

fn print_phase_change(change: &PhaseChange, json: bool) {
    if json {
        match serde_json::to_string(change) {
            Ok(line) => println!("{}", line),
            Err(e) => eprintln!("Error: failed to encode phase change: {}", e),
        }
        return;
    }
    match change.observation {
        Some(obs) => println!(
            "{}  {:<10}  stage={} records={}",
            change.at.format("%H:%M:%S"),
            change.phase,
            obs.stage.map(|s| s.to_string()).unwrap_or_else(|| "?".into()),
            obs.has_records.map(|r| r.to_string()).unwrap_or_else(|| "?".into()),
        ),
        None => println!("{}  {}", change.at.format("%H:%M:%S"), change.phase),
    }
}

fn print_terminal(signal: &TerminalSignal, json: bool) {
    if json {
        match serde_json::to_string(signal) {
            Ok(line) => println!("{}", line),
            Err(e) => eprintln!("Error: failed to encode terminal signal: {}", e),
        }
    } else {
        println!("{}  project '{}' is ready; reload the application view", signal.at.format("%H:%M:%S"), signal.project);
    }
}

fn cmd_watch(backend: SqliteBackend, config: ReconcilerConfig, id: &str, json: bool) -> i32 {
    let rt = match runtime() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };

    rt.block_on(async {
        let controller = ReconciliationController::new(
            Collaborators::from_backend(Arc::new(backend)),
            config,
        );
        controller.on_phase_change(move |change| print_phase_change(change, json));

        let (terminal_tx, mut terminal_rx) = tokio::sync::mpsc::unbounded_channel();
        controller.on_terminal(move |signal| {
            let _ = terminal_tx.send(signal.clone());
        });

        if let Err(e) = controller.activate(id) {
            eprintln!("Error: {}", e);
            return 1;
        }

        tokio::select! {
            signal = terminal_rx.recv() => {
                if let Some(signal) = signal {
                    print_terminal(&signal, json);
                }
                controller.deactivate();
                0
            }
            _ = tokio::signal::ctrl_c() => {
                info!(project = %id, "Interrupted; tearing down session");
                controller.deactivate();
                130
            }
        }
    })
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    let config = match load_config(cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    let backend = match open_backend(cli.db, &config) {
        Ok(backend) => backend,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let code = match cli.command {
        Commands::Project { action } => match action {
            ProjectAction::Create { id, name } => cmd_project_create(&backend, &id, name.as_deref()),
            ProjectAction::List => cmd_project_list(&backend),
            ProjectAction::SetStage { id, stage } => cmd_project_set_stage(&backend, &id, stage),
            ProjectAction::AddRecord { id, kind, body } => {
                cmd_project_add_record(&backend, &id, &kind, body.as_deref())
            }
        },
        Commands::Status { id } => cmd_status(backend, &config, &id),
        Commands::Watch { id, json } => cmd_watch(backend, config, &id, json),
    };
    std::process::exit(code);
}
