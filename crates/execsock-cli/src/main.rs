//! execsock CLI
//!
//! Serves compile-and-run sessions over WebSocket, or drives a single
//! session from the local terminal.

use std::io::BufRead;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use execsock::session::detector_for;
use execsock::{
    AppState, ClientMessage, Config, EXAMPLE_CONFIG, Runner, ServerMessage, Session,
    SessionRegistry,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{Level, debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "execsock")]
#[command(about = "Interactive compile-and-run sessions over WebSocket")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the WebSocket server
    Serve {
        /// Address to listen on (overrides the configuration)
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Run a source file in a local session
    Run {
        /// Source file to run
        #[arg(value_name = "FILE")]
        source: PathBuf,

        /// Language ID (default: inferred from the file extension)
        #[arg(short, long)]
        language: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path (default: execsock.toml)
        #[arg(short, long, default_value = "execsock.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(short, long)]
        force: bool,
    },

    /// List available languages
    Languages,

    /// Show effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Init { output, force } => init_config(&output, force).await,
        Commands::Serve { listen } => serve(load_config(config_path)?, listen).await,
        Commands::Run { source, language } => {
            run_local(load_config(config_path)?, &source, language).await
        }
        Commands::Languages => {
            list_languages(&load_config(config_path)?);
            Ok(())
        }
        Commands::ShowConfig => {
            show_config(&load_config(config_path)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => info!(?path, "loading configuration"),
        None => debug!("using default configuration"),
    }
    Config::load(path).context("failed to load configuration")
}

async fn serve(config: Config, listen: Option<String>) -> Result<()> {
    let listen = listen.unwrap_or_else(|| config.listen.clone());
    let state = AppState::new(config);

    let removed = state
        .runner
        .prepare()
        .await
        .context("failed to prepare scratch directory")?;
    if removed > 0 {
        info!(removed, "removed orphaned artifacts");
    }

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;

    execsock::serve(listener, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
        info!("received Ctrl-C, shutting down");
    })
    .await
    .context("server failed")
}

async fn run_local(config: Config, source: &Path, language: Option<String>) -> Result<()> {
    let code = tokio::fs::read_to_string(source)
        .await
        .context("failed to read source file")?;

    let language = match language {
        Some(id) => id,
        None => infer_language(&config, source)
            .context("cannot infer language from file extension, pass --language")?,
    };
    config
        .get_language(&language)
        .context("unknown language")?;

    let detector = detector_for(config.prompt_detection);
    let registry = SessionRegistry::default();
    let guard = registry.open().context("failed to open session")?;

    let (inbound_tx, inbound_rx) = mpsc::channel::<String>(8);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(64);
    let session = Session::new(guard, Runner::new(config), detector, outbound_tx);
    let session_task = tokio::spawn(session.run(inbound_rx));

    let execute = ClientMessage::Execute {
        code,
        language: Some(language),
    };
    inbound_tx
        .send(execute.to_json())
        .await
        .context("session closed before execute")?;

    // Blocking reads on a plain thread, so a pending read never holds up exit
    let input_tx = inbound_tx.clone();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(value) = line else { break };
            if input_tx
                .blocking_send(ClientMessage::Input { value }.to_json())
                .is_err()
            {
                break;
            }
        }
    });

    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    let mut success = false;
    let mut stopping = false;
    loop {
        tokio::select! {
            message = outbound_rx.recv() => match message {
                Some(ServerMessage::Output { data, .. }) => {
                    stdout.write_all(data.as_bytes()).await?;
                    stdout.flush().await?;
                }
                Some(ServerMessage::Error { data }) => {
                    stderr.write_all(data.as_bytes()).await?;
                    stderr.flush().await?;
                }
                Some(ServerMessage::Done { success: done }) => {
                    success = done;
                    break;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !stopping => {
                stopping = true;
                let _ = inbound_tx.send(ClientMessage::Stop.to_json()).await;
            }
        }
    }

    // The stdin thread keeps a sender alive, so end the session explicitly.
    // After `done` nothing is running and the artifacts are already gone.
    registry.shutdown();
    drop(outbound_rx);
    session_task.await.context("session task failed")?;

    if success {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

fn infer_language(config: &Config, source: &Path) -> Option<String> {
    let extension = source.extension()?.to_str()?;
    let mut matches: Vec<_> = config
        .languages
        .iter()
        .filter(|(_, lang)| lang.extension.as_str() == extension)
        .map(|(id, _)| id.as_str())
        .collect();
    matches.sort_unstable();

    // Prefer the default language when several share an extension
    if matches.contains(&config.default_language.as_str()) {
        return Some(config.default_language.clone());
    }
    matches.first().map(|id| (*id).to_owned())
}

fn list_languages(config: &Config) {
    println!("Available languages:\n");

    let mut languages: Vec<_> = config.languages.iter().collect();
    languages.sort_by_key(|(id, _)| *id);

    for (id, lang) in languages {
        let lang_type = if lang.is_compiled() {
            "compiled"
        } else {
            "interpreted"
        };
        let marker = if *id == config.default_language {
            " [default]"
        } else {
            ""
        };
        println!("  {:<15} {} ({}){}", id, lang.name, lang_type, marker);
    }
}

fn show_config(config: &Config) {
    println!("Listen address: {}", config.listen);
    println!("Scratch directory: {}", config.scratch_dir.display());
    println!();
    println!("Run timeout: {}s", config.run_timeout_secs);
    println!("Compile timeout: {}s", config.compile_timeout_secs);
    match config.max_sessions {
        Some(max) => println!("Max sessions: {max}"),
        None => println!("Max sessions: unlimited"),
    }
    println!("Prompt detection: {:?}", config.prompt_detection);
    println!();
    println!("Default language: {}", config.default_language);
    println!("Languages configured: {}", config.languages.len());
}

async fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists at '{}'. Use --force to overwrite.",
            output.display()
        );
    }

    tokio::fs::write(output, EXAMPLE_CONFIG)
        .await
        .context("failed to write configuration file")?;

    println!("Created configuration file at '{}'", output.display());
    Ok(())
}
