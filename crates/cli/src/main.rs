//! Prism CLI
//!
//! Thin wrapper over `prism_core`: reads a document, runs one orchestration
//! and prints the answer. Logs go to stderr so stdout carries only results.

mod config;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use prism_core::skills::SkillRegistry;
use prism_core::swarm::{Coordinator, CoordinatorConfig, InterruptToken, StreamTap};

use config::{PersistedConfig, PRISM_DIR};

#[derive(Parser, Debug)]
#[command(author, version, about = "Prism - context-routing task orchestration over large documents")]
struct Args {
    /// Log progress at info level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Run a task over a document
    Run {
        /// Document to analyse
        context_file: PathBuf,
        /// The task to accomplish
        task: String,
        #[arg(long)]
        model: Option<String>,
        /// Output limit for planning and worker calls
        #[arg(long)]
        max_tokens: Option<u32>,
        #[arg(long)]
        synthesis_max_tokens: Option<u32>,
        /// Concurrent workers (1-10)
        #[arg(short, long)]
        workers: Option<usize>,
        /// JSON file with extra skills
        #[arg(long)]
        skills: Option<PathBuf>,
        /// Let skills from the file replace built-ins with the same name
        #[arg(long)]
        override_skills: bool,
        /// Print the plan as JSON after the result
        #[arg(long)]
        show_plan: bool,
        /// Stream subtask output to stderr as it arrives
        #[arg(long)]
        stream: bool,
    },
    /// List available skills
    Skills {
        #[arg(long)]
        skills: Option<PathBuf>,
        #[arg(long)]
        override_skills: bool,
        /// Print the catalog as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "info" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// `.env` in the working directory first, then `.prism/.env`; neither
/// overrides variables already set.
fn load_env() {
    let _ = dotenvy::dotenv();
    let _ = dotenvy::from_path(Path::new(PRISM_DIR).join(".env"));
}

fn load_registry(skills_file: Option<&Path>, allow_override: bool) -> Result<SkillRegistry> {
    let builtin = SkillRegistry::builtin();
    match skills_file {
        Some(path) => builtin.load_custom(path, allow_override),
        None => Ok(builtin),
    }
}

/// Prints deltas to stderr, starting a labelled line whenever the
/// producing subtask changes
fn stderr_tap() -> StreamTap {
    let last = Arc::new(Mutex::new(None::<usize>));
    Arc::new(move |id: usize, delta: &str| {
        let mut last = last.lock().unwrap_or_else(|e| e.into_inner());
        let mut err = std::io::stderr().lock();
        if *last != Some(id) {
            let _ = write!(err, "\n[subtask {}] ", id + 1);
            *last = Some(id);
        }
        let _ = write!(err, "{}", delta);
        let _ = err.flush();
    })
}

async fn run_task(
    context_file: PathBuf,
    task: String,
    flags: PersistedConfig,
    override_skills: bool,
    show_plan: bool,
    stream: bool,
    verbose: bool,
) -> Result<()> {
    let context = tokio::fs::read_to_string(&context_file)
        .await
        .with_context(|| format!("Failed to read context file {}", context_file.display()))?;

    let mut settings = PersistedConfig::load(Path::new(PRISM_DIR));
    settings.merge(flags);

    let mut config = CoordinatorConfig::default();
    settings.apply(&mut config);
    config.verbose = verbose;

    let registry = load_registry(settings.skills_file.as_deref(), override_skills)?;

    let interrupt = InterruptToken::new();
    {
        let token = interrupt.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nInterrupted: pending subtasks will be cancelled");
                token.interrupt();
            }
        });
    }

    let mut coordinator = Coordinator::anthropic(config)?
        .with_skills(registry)
        .with_interrupt(interrupt);
    if stream {
        coordinator = coordinator.with_stream_tap(stderr_tap());
    }

    let outcome = coordinator.run(&context, &task).await?;
    if stream {
        eprintln!();
    }

    tracing::info!(
        subtasks = outcome.subtask_count,
        self_answered = outcome.self_answered,
        delegated = outcome.delegated,
        stage = %outcome.stage,
        "run finished"
    );

    println!("{}", outcome.result);
    if show_plan {
        println!(
            "{}",
            serde_json::to_string_pretty(&outcome.plan).context("Failed to serialize plan")?
        );
    }
    Ok(())
}

fn list_skills(skills_file: Option<PathBuf>, override_skills: bool, json: bool) -> Result<()> {
    let settings = PersistedConfig::load(Path::new(PRISM_DIR));
    let file = skills_file.or(settings.skills_file);
    let registry = load_registry(file.as_deref(), override_skills)?;

    if json {
        println!("{}", serde_json::to_string_pretty(registry.catalog())?);
        return Ok(());
    }
    for skill in registry.catalog() {
        let marker = if skill.name == registry.default_name() {
            " (default)"
        } else {
            ""
        };
        println!("{}{}\n    {}", skill.name, marker, skill.description);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);
    load_env();

    match args.command {
        CliCommand::Run {
            context_file,
            task,
            model,
            max_tokens,
            synthesis_max_tokens,
            workers,
            skills,
            override_skills,
            show_plan,
            stream,
        } => {
            let flags = PersistedConfig {
                model,
                max_tokens,
                synthesis_max_tokens,
                max_workers: workers,
                skills_file: skills,
                ..Default::default()
            };
            run_task(
                context_file,
                task,
                flags,
                override_skills,
                show_plan,
                stream,
                args.verbose,
            )
            .await
        }
        CliCommand::Skills {
            skills,
            override_skills,
            json,
        } => list_skills(skills, override_skills, json),
    }
}
