//! CLI binary for running and validating Sluice task manifests.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Deserialize;

use sluice_exec::{backend_from_config, EngineConfig, Executioner, LocalBackend};
use sluice_task::{
    load_checkpoint, save_checkpoint, Task, TaskDependency, TaskRegistry, TaskSpec, TaskState,
};

#[derive(Parser)]
#[command(name = "sluice", version, about = "Task manifest runner for file-driven workflows")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every stale task in a manifest
    Run {
        /// Path to the task manifest (JSON)
        manifest: PathBuf,

        /// Engine configuration file (default: local backend)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Checkpoint file to write after the run
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Skip tasks already finished in the checkpoint file
        #[arg(long, requires = "checkpoint")]
        resume: bool,

        /// Run every task even when its outputs look up to date
        #[arg(long)]
        force: bool,

        /// Throttle the local backend to this many concurrent cpus
        #[arg(long)]
        max_cpus: Option<u32>,
    },

    /// Validate a manifest without running anything
    Validate {
        /// Path to the task manifest (JSON)
        manifest: PathBuf,
    },

    /// Show the tasks and dependencies in a manifest
    Info {
        /// Path to the task manifest (JSON)
        manifest: PathBuf,
    },
}

/// On-disk manifest format: the task list a front-end would hand over.
#[derive(Debug, Deserialize)]
struct Manifest {
    tasks: Vec<TaskSpec>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run {
            manifest,
            config,
            checkpoint,
            resume,
            force,
            max_cpus,
        } => {
            cmd_run(
                &manifest,
                config.as_deref(),
                checkpoint.as_deref(),
                resume,
                force,
                max_cpus,
            )
            .await?;
        }
        Commands::Validate { manifest } => {
            cmd_validate(&manifest)?;
        }
        Commands::Info { manifest } => {
            cmd_info(&manifest)?;
        }
    }

    Ok(())
}

fn load_manifest(path: &Path) -> anyhow::Result<Manifest> {
    let text = std::fs::read_to_string(path)?;
    let manifest: Manifest = serde_json::from_str(&text)?;
    Ok(manifest)
}

/// Build the registry and wire tasks to the upstream tasks they depend on,
/// both explicitly (`depends_on`) and through the files they consume.
fn build_registry(manifest: Manifest) -> anyhow::Result<TaskRegistry> {
    let registry = TaskRegistry::new();
    for spec in manifest.tasks {
        registry.add(Arc::new(Task::new(spec)))?;
    }

    for task in registry.tasks() {
        for dep_id in task.depends_on() {
            let upstream = registry
                .task(dep_id)
                .ok_or_else(|| anyhow::anyhow!("task {}: unknown dependency {}", task.id(), dep_id))?;
            task.add_dependency(upstream);
        }
        for input in task.inputs() {
            if let Some(producer) = registry.task_by_output(input) {
                if producer.id() != task.id() {
                    task.add_dependency(producer);
                }
            }
        }
    }

    // Surface dependency cycles before anything runs.
    for task in registry.tasks() {
        task.dependency_state()?;
    }
    Ok(registry)
}

/// Ids of tasks that do not need to run: finished in a previous checkpoint,
/// or with outputs newer than every input on disk.
fn up_to_date_tasks(
    registry: &TaskRegistry,
    resume_checkpoint: Option<&Path>,
    force: bool,
) -> anyhow::Result<HashSet<String>> {
    let mut done = HashSet::new();
    if force {
        return Ok(done);
    }

    if let Some(path) = resume_checkpoint {
        let scratch = TaskRegistry::new();
        for restored in load_checkpoint(path, &scratch)? {
            if restored.state() == TaskState::Finished && restored.is_done_ok() {
                done.insert(restored.id().to_string());
            }
        }
    }

    // File-level staleness, judged on mtimes alone.
    let no_producers = TaskRegistry::new();
    for task in registry.tasks() {
        if task.outputs().is_empty() || done.contains(task.id()) {
            continue;
        }
        let mut dep = TaskDependency::new();
        for output in task.outputs() {
            dep.add_output(output.clone());
        }
        for input in task.inputs() {
            dep.add_input(input, &no_producers);
        }
        if !dep.is_stale(&no_producers) {
            done.insert(task.id().to_string());
        }
    }
    Ok(done)
}

async fn cmd_run(
    manifest_path: &Path,
    config_path: Option<&Path>,
    checkpoint: Option<&Path>,
    resume: bool,
    force: bool,
    max_cpus: Option<u32>,
) -> anyhow::Result<()> {
    let manifest = load_manifest(manifest_path)?;
    let registry = build_registry(manifest)?;

    let config = match config_path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let exec = match max_cpus {
        Some(cpus) => Executioner::new(Arc::new(LocalBackend::with_max_cpus(cpus)), &config),
        None => Executioner::new(backend_from_config(&config)?, &config),
    };
    let exec = Arc::new(exec);

    let skip = up_to_date_tasks(&registry, if resume { checkpoint } else { None }, force)?;
    for id in &skip {
        tracing::info!(task = id.as_str(), "up to date, skipping");
    }

    // Skipped upstreams stay in state NONE, so dependents must not wait on
    // them; their file outputs have already been validated as fresh.
    let mut to_run = Vec::new();
    for task in registry.tasks() {
        if skip.contains(task.id()) {
            continue;
        }
        task.retain_dependencies(|dep| !skip.contains(dep.id()));
        to_run.push(task);
    }

    println!(
        "Running {} of {} tasks on the {} backend",
        to_run.len(),
        registry.len(),
        exec.backend_name()
    );

    for task in &to_run {
        exec.submit(task.clone())?;
    }
    exec.close_queue();

    // Ctrl-C kills queued and running tasks, then lets the run wind down.
    {
        let exec = exec.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, killing tasks");
                exec.kill();
            }
        });
    }

    let summary = exec.run().await?;

    if let Some(path) = checkpoint {
        save_checkpoint(&registry, path)?;
        println!("Checkpoint written to {}", path.display());
    }

    println!(
        "Done: {} finished, {} failed, {} skipped",
        summary.finished, summary.failed, summary.skipped
    );
    let mut tolerated = 0usize;
    for task in &to_run {
        if task.is_failed() {
            if task.can_fail() {
                tolerated += 1;
            }
            eprint!("{}", task.report(true, true));
        }
    }

    if summary.failed + summary.skipped > tolerated {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let manifest = load_manifest(path)?;
    let count = manifest.tasks.len();
    match build_registry(manifest) {
        Ok(_) => {
            println!("Manifest is valid ({count} tasks)");
            Ok(())
        }
        Err(e) => {
            println!("[ERROR] {e}");
            std::process::exit(1);
        }
    }
}

fn cmd_info(path: &Path) -> anyhow::Result<()> {
    let manifest = load_manifest(path)?;
    let registry = build_registry(manifest)?;

    println!("Manifest: {}", path.display());
    println!("Tasks: {}", registry.len());
    println!();
    for task in registry.tasks() {
        println!("  {}", task.id());
        if !task.inputs().is_empty() {
            println!("    inputs:  {}", task.inputs().join(", "));
        }
        if !task.outputs().is_empty() {
            println!("    outputs: {}", task.outputs().join(", "));
        }
        let deps = task.dependencies();
        if !deps.is_empty() {
            let ids: Vec<&str> = deps.iter().map(|d| d.id()).collect();
            println!("    after:   {}", ids.join(", "));
        }
        let res = task.resources();
        if res.cpus > 1 || res.mem_bytes > 0 || res.timeout_secs > 0 {
            println!(
                "    needs:   {} cpus, {} bytes, timeout {}s",
                res.cpus, res.mem_bytes, res.timeout_secs
            );
        }
    }
    Ok(())
}
