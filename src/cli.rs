//! Interactive CLI host.
//!
//! A thin REPL over the agent core: lines go to the client, streamed
//! events print as they arrive, and a stdin prompt backs the confirmation
//! gate. Slash commands cover help, model selection, and connection
//! management.

use std::io::Write;
use std::sync::Arc;

use clap::Parser;
use futures::{FutureExt, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::client::{AgentClient, AgentEvent};
use crate::config::{AgentConfig, ConfigScope};
use crate::connection::ConnectionManager;
use crate::db::{AdapterFactory, DatabaseConfig};
use crate::error::Result;
use crate::llm::create_service;
use crate::persistence::{ConnectionStore, SecretStorage};
use crate::scheduler::{ConfirmationDecision, ConfirmationRequest};
use crate::tools::{register_builtin_tools, ToolRegistry};

/// Exit code for a user interrupt.
pub const EXIT_INTERRUPTED: u8 = 130;

/// Conversational database agent.
#[derive(Debug, Parser)]
#[command(name = "dbrheo", version, about)]
pub struct Cli {
    /// Connection string (postgresql://..., mysql://..., sqlite:///...) or
    /// a saved connection alias to open at startup.
    #[arg(value_name = "DATABASE")]
    pub database: Option<String>,

    /// Model to use for this run.
    #[arg(long, env = "DBRHEO_MODEL")]
    pub model: Option<String>,

    /// Run a single prompt and exit (headless mode).
    #[arg(long)]
    pub prompt: Option<String>,

    /// Enable debug output.
    #[arg(long)]
    pub debug: bool,
}

impl Cli {
    /// True when running without an interactive terminal loop.
    pub fn headless(&self) -> bool {
        self.prompt.is_some()
    }
}

/// Distinguishes connection strings from saved aliases.
fn looks_like_url(target: &str) -> bool {
    target.contains("://") || target.starts_with("sqlite:")
}

/// Builds the client and runs the requested mode. Returns the process
/// exit code.
pub async fn run(cli: Cli) -> Result<u8> {
    let mut config = AgentConfig::load()?;
    if let Some(model) = &cli.model {
        config.set_value(ConfigScope::User, "model", serde_yaml::Value::from(model.as_str()))?;
    }
    if cli.debug {
        config.set_value(ConfigScope::User, "debug", serde_yaml::Value::Bool(true))?;
    }
    let config = Arc::new(config);

    let registry = Arc::new(ToolRegistry::new());
    register_builtin_tools(&registry)?;

    let connections = Arc::new(ConnectionManager::new(Arc::new(AdapterFactory::new())));
    let store = ConnectionStore::new(SecretStorage::new());

    let target = cli
        .database
        .clone()
        .or_else(|| config.default_connection_url());
    if let Some(target) = target {
        open_database(&connections, &store, &target).await?;
    }

    let (service, warning) = create_service(&config)?;
    let client = AgentClient::new(config.clone(), service, registry, connections, warning);
    client
        .scheduler()
        .on_confirmation_required(Arc::new(|request| stdin_confirmation(request).boxed()));

    if let Some(prompt) = cli.prompt {
        stream_exchange(&client, &prompt).await;
        return Ok(0);
    }

    repl(client, store).await
}

async fn open_database(
    connections: &Arc<ConnectionManager>,
    store: &ConnectionStore,
    target: &str,
) -> Result<()> {
    let (alias, config) = if looks_like_url(target) {
        ("main".to_string(), DatabaseConfig::from_url(target)?)
    } else {
        let config = store.load(target)?.ok_or_else(|| {
            crate::error::DbRheoError::connect(format!("No saved connection named '{target}'"))
        })?;
        (target.to_string(), config)
    };
    let connection = connections.open(&alias, config, true).await?;
    println!("Connected: {} ({})", connection.alias, connection.adapter.dialect());
    Ok(())
}

async fn repl(client: Arc<AgentClient>, store: ConnectionStore) -> Result<u8> {
    println!("dbrheo — type a request, /help for commands, /quit to exit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        let _ = std::io::stdout().flush();

        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => {
                println!();
                return Ok(EXIT_INTERRUPTED);
            }
        };

        let Ok(Some(line)) = line else {
            // EOF is a clean exit.
            println!();
            return Ok(0);
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(command) = line.strip_prefix('/') {
            match handle_command(command, &client, &store).await? {
                CommandOutcome::Continue => continue,
                CommandOutcome::Quit => return Ok(0),
            }
        }

        // Ctrl-C during an exchange interrupts it rather than exiting.
        tokio::select! {
            _ = stream_exchange(&client, line) => {}
            _ = tokio::signal::ctrl_c() => {
                client.interrupt();
                println!("\n(interrupted)");
            }
        }
    }
}

enum CommandOutcome {
    Continue,
    Quit,
}

async fn handle_command(
    command: &str,
    client: &Arc<AgentClient>,
    store: &ConnectionStore,
) -> Result<CommandOutcome> {
    let mut words = command.split_whitespace();
    match words.next().unwrap_or("") {
        "help" => {
            println!("Commands:");
            println!("  /help               show this help");
            println!("  /model <name>       persist a new model (applies on restart)");
            println!("  /database           list open and saved connections");
            println!("  /database <target>  open a connection string or saved alias");
            println!("  /quit               exit");
        }
        "model" => match words.next() {
            Some(model) => {
                let mut config = AgentConfig::load()?;
                config.set_value(
                    ConfigScope::User,
                    "model",
                    serde_yaml::Value::from(model),
                )?;
                config.save(ConfigScope::User)?;
                println!("Model set to '{model}'. Restart to apply.");
            }
            None => println!("Usage: /model <name>"),
        },
        "database" => match words.next() {
            Some(target) => {
                if let Err(e) = open_database(client.connections(), store, target).await {
                    eprintln!("{e}");
                }
            }
            None => {
                let open = client.connections().list().await;
                if open.is_empty() {
                    println!("No open connections.");
                } else {
                    for row in open {
                        let marker = if row.current { "*" } else { " " };
                        let mode = if row.read_only { " (read-only)" } else { "" };
                        println!("{marker} {} — {}{mode}", row.alias, row.description);
                    }
                }
                let saved = store.list()?;
                if !saved.is_empty() {
                    println!("Saved: {}", saved.join(", "));
                }
            }
        },
        "quit" | "exit" => return Ok(CommandOutcome::Quit),
        other => println!("Unknown command '/{other}'. Try /help."),
    }
    Ok(CommandOutcome::Continue)
}

/// Streams one exchange to the terminal.
async fn stream_exchange(client: &Arc<AgentClient>, text: &str) {
    let mut stream = client.send_message_stream(text);
    while let Some(event) = stream.next().await {
        match event {
            AgentEvent::Text { delta } => {
                print!("{delta}");
                let _ = std::io::stdout().flush();
            }
            AgentEvent::ToolStart { name, .. } => {
                eprintln!("\n[{name}] starting");
            }
            AgentEvent::ToolRunning { .. } => {}
            AgentEvent::ToolAwaitingConfirmation { .. } => {
                // The confirmation handler renders its own prompt.
            }
            AgentEvent::ToolFinished { ok, summary, .. } => {
                let status = if ok { "done" } else { "failed" };
                eprintln!("[tool] {status}: {summary}");
            }
            AgentEvent::UsageUpdate { .. } => {}
            AgentEvent::Warning { message } => eprintln!("Warning: {message}"),
            AgentEvent::Error { kind, message } => eprintln!("Error ({kind}): {message}"),
            AgentEvent::Finish { .. } => {
                println!();
            }
        }
    }
}

/// Confirmation gate backed by stdin.
async fn stdin_confirmation(request: ConfirmationRequest) -> ConfirmationDecision {
    let answer = tokio::task::spawn_blocking(move || {
        eprintln!(
            "\n[confirm] {} ({} risk): {}",
            request.tool, request.risk.level, request.summary
        );
        for reason in &request.risk.reasons {
            eprintln!("  - {reason}");
        }
        eprint!("Proceed? [y/N/a=always] ");
        let _ = std::io::stderr().flush();
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
        line.trim().to_lowercase()
    })
    .await
    .unwrap_or_default();

    match answer.as_str() {
        "y" | "yes" => ConfirmationDecision {
            approved: true,
            remember: false,
        },
        "a" | "always" => ConfirmationDecision {
            approved: true,
            remember: true,
        },
        _ => ConfirmationDecision {
            approved: false,
            remember: false,
        },
    }
}
