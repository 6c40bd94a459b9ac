// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use modelhost::model::SessionGate;
use modelhost::{
    AcquisitionState, AppConfig, AssetSource, ChatCompletionsClient, CoreError,
    DirectoryRuntime, FileTranscriptStore, HttpSource, ModelAcquisition, ModelRecord, NoSession,
    Registry, Role, SessionCoordinator, SessionDeps, SessionState,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable holding the log filter.
const LOG_ENV: &str = "MODELHOST_LOG";

#[derive(Parser)]
#[command(name = "modelhost")]
#[command(version = VERSION)]
#[command(about = "Download local models and chat with them.")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Data directory (defaults to $MODELHOST_HOME or ~/.modelhost)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Verbose logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List known models with their download state
    #[command(alias = "ls")]
    Models,

    /// Register a model from its repository URL
    Add {
        /// Repository root, e.g. https://huggingface.co/org/model
        url: String,

        /// Local identifier
        #[arg(long)]
        id: String,

        /// Backend library the model was compiled for
        #[arg(long)]
        lib: String,

        /// Estimated VRAM footprint in bytes
        #[arg(long)]
        vram: Option<u64>,
    },

    /// Download a model's files (Ctrl+C pauses)
    Pull { id: String },

    /// Delete a model's downloaded files but keep it registered
    Clear { id: String },

    /// Delete a model and unregister it
    #[command(alias = "remove")]
    Rm { id: String },

    /// Chat with a downloaded model
    Chat { id: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        match e.downcast_ref::<CoreError>() {
            Some(core) => eprint!("{}", core.user_message().as_str().red()),
            None => eprintln!("{} {:#}", "[✗]".red(), e),
        }
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let home = AppConfig::resolve_home(cli.home);
    let config = AppConfig::load(&home)
        .with_context(|| format!("Failed to load catalog from {:?}", home))?;

    match cli.command {
        Commands::Models => {
            let registry = open_registry(&home, config, Arc::new(NoSession)).await?;
            list_models(&registry);
        }
        Commands::Add { url, id, lib, vram } => {
            let registry = open_registry(&home, config, Arc::new(NoSession)).await?;
            let model = registry
                .add_model(ModelRecord {
                    model_url: url,
                    model_id: id,
                    estimated_vram_bytes: vram,
                    model_lib: lib,
                })
                .await?;
            let (done, total) = model.progress();
            println!(
                "{} Added {} ({}/{} files present)",
                "[✓]".green(),
                model.model_id().bold(),
                done,
                total
            );
        }
        Commands::Pull { id } => {
            let registry = open_registry(&home, config, Arc::new(NoSession)).await?;
            pull(&registry, &id).await?;
        }
        Commands::Clear { id } => {
            let registry = open_registry(&home, config, Arc::new(NoSession)).await?;
            let model = find(&registry, &id)?;
            model.clear().await?;
            println!("{} Cleared {}", "[✓]".green(), id.bold());
        }
        Commands::Rm { id } => {
            let registry = open_registry(&home, config, Arc::new(NoSession)).await?;
            registry.delete_model(&id).await?;
            println!("{} Removed {}", "[✓]".green(), id.bold());
        }
        Commands::Chat { id } => {
            let session = Arc::new(open_session(&home, &config)?);
            let registry = open_registry(&home, config, session.clone()).await?;
            chat(&registry, &session, &id).await?;
        }
    }

    Ok(())
}

async fn open_registry(
    home: &std::path::Path,
    config: AppConfig,
    gate: Arc<dyn SessionGate>,
) -> Result<Registry> {
    let source: Arc<dyn AssetSource> = Arc::new(HttpSource::new()?);
    let registry = Registry::new(home, config, source, gate);
    for (id, e) in registry.restore().await {
        eprintln!("{} Could not load {}: {}", "[!]".yellow(), id, e);
    }
    Ok(registry)
}

fn open_session(home: &std::path::Path, config: &AppConfig) -> Result<SessionCoordinator> {
    let transcript = FileTranscriptStore::open(AppConfig::transcript_dir(home))?;
    let service = ChatCompletionsClient::from_config(&config.completion)?;
    if !service.is_configured() {
        tracing::warn!(
            "No API key in ${}; requests are sent unauthenticated",
            config.completion.api_key_env
        );
    }
    Ok(SessionCoordinator::new(SessionDeps {
        runtime: Arc::new(DirectoryRuntime::new()),
        service: Arc::new(service),
        transcript: Arc::new(transcript),
        greeting_prompt: config.greeting_prompt.clone(),
    })?)
}

fn find(registry: &Registry, id: &str) -> Result<Arc<ModelAcquisition>> {
    registry
        .get(id)
        .ok_or_else(|| anyhow!(CoreError::ModelNotFound(id.to_string())))
}

fn colored_state(state: AcquisitionState) -> colored::ColoredString {
    match state {
        AcquisitionState::Finished => state.as_str().green(),
        AcquisitionState::Downloading | AcquisitionState::Pausing => state.as_str().cyan(),
        AcquisitionState::Paused => state.as_str().yellow(),
        _ => state.as_str().dimmed(),
    }
}

fn list_models(registry: &Registry) {
    if registry.is_empty() {
        println!("No models registered. Add one with: modelhost add <url> --id <id> --lib <lib>");
        return;
    }

    for model in registry.list() {
        let snapshot = model.snapshot();
        let descriptor = model.descriptor();
        println!(
            "  {:<32} {:<24} {:<12} {:>4}/{:<4}",
            descriptor.model_id.bold(),
            descriptor.model_lib,
            colored_state(snapshot.state),
            snapshot.completed,
            snapshot.total
        );
        if let Some(err) = snapshot.last_error {
            println!("      {} {}", "last error:".red(), err);
        }
    }
}

async fn pull(registry: &Registry, id: &str) -> Result<()> {
    let model = find(registry, id)?;
    if model.state() == AcquisitionState::Finished {
        println!("{} {} is already downloaded", "[✓]".green(), id.bold());
        return Ok(());
    }

    let (done, total) = model.progress();
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  {spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} files | {msg}")
            .context("Invalid progress bar template")?
            .progress_chars("█▓░"),
    );
    pb.set_position(done as u64);
    pb.set_message(format!("Downloading {}", id));
    pb.enable_steady_tick(Duration::from_millis(100));

    let (interrupt_tx, mut interrupt_rx) = mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.send(());
    })
    .context("Failed to install Ctrl+C handler")?;

    let mut updates = model.subscribe();
    model.start().await?;

    let final_snapshot = loop {
        let snapshot = updates.borrow_and_update().clone();
        pb.set_position(snapshot.completed as u64);
        match snapshot.state {
            AcquisitionState::Finished | AcquisitionState::Paused => break snapshot,
            AcquisitionState::Pausing => pb.set_message("Pausing, waiting for running transfers"),
            _ => {}
        }

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break updates.borrow().clone();
                }
            }
            Some(()) = interrupt_rx.recv() => {
                model.pause().await?;
            }
        }
    };

    match final_snapshot.state {
        AcquisitionState::Finished => {
            pb.finish_with_message("Complete");
            println!("{} {} is ready", "[✓]".green(), id.bold());
            Ok(())
        }
        _ => {
            pb.abandon_with_message("Paused");
            match final_snapshot.last_error {
                Some(err) => bail!(
                    "Download incomplete ({}/{} files): {}. Run `modelhost pull {}` to resume.",
                    final_snapshot.completed,
                    final_snapshot.total,
                    err,
                    id
                ),
                None => {
                    println!(
                        "{} Paused at {}/{} files. Run `modelhost pull {}` to resume.",
                        "[!]".yellow(),
                        final_snapshot.completed,
                        final_snapshot.total,
                        id
                    );
                    Ok(())
                }
            }
        }
    }
}

async fn chat(registry: &Registry, session: &SessionCoordinator, id: &str) -> Result<()> {
    let model = find(registry, id)?;
    if model.state() != AcquisitionState::Finished {
        bail!("{} is not fully downloaded. Run `modelhost pull {}` first.", id, id);
    }

    session.wait_for(|s| s.is_chatable()).await?;
    for message in session.messages() {
        print_message(message.role, &message.content);
    }

    session.request_reload(model.descriptor().clone(), model.dir().to_path_buf())?;
    if session.wait_for(|s| matches!(s, SessionState::Ready | SessionState::Failed)).await?
        == SessionState::Failed
    {
        bail!(
            "Failed to load {}: {}",
            id,
            session.last_error().unwrap_or_else(|| "unknown error".to_string())
        );
    }

    println!(
        "{} Chatting with {}. Commands: /reset, /history, /exit",
        "[✓]".green(),
        id.bold()
    );

    let mut editor = DefaultEditor::new().context("Failed to create input editor")?;
    loop {
        let line = match editor.readline(&format!("{} ", "you>".bright_cyan())) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => return Err(anyhow!("Input error: {}", e)),
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(input);

        match input {
            "/exit" | "/quit" => break,
            "/history" => {
                for message in session.messages() {
                    print_message(message.role, &message.content);
                }
            }
            "/reset" => {
                session.request_reset()?;
                session.wait_for(|s| s.is_chatable()).await?;
                println!("{}", "Session cleared.".dimmed());
            }
            prompt => match session.generate(prompt).await {
                Ok(reply) => print_message(Role::Assistant, &reply),
                Err(e) => {
                    eprint!("{}", e.user_message().as_str().red());
                    if session.state() == SessionState::Failed {
                        println!("{}", "Use /reset to recover.".yellow());
                    }
                }
            },
        }
    }

    Ok(())
}

fn print_message(role: Role, content: &str) {
    match role {
        Role::User => println!("{} {}", "you>".bright_cyan(), content),
        Role::Assistant => println!("{} {}", "bot>".green(), content),
        Role::System => println!("{}", content.dimmed()),
    }
}
