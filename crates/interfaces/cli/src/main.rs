use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use beamline_agent::{AgentEvent, AgentOrchestrator, HistoryMessage, OutcomeKind, Turn};
use beamline_config::AppConfig;
use beamline_elog::{ElogClient, ElogSearch};
use beamline_llm::{ChatBackend, ChatMessage, ChatRequest, LlmClient};
use beamline_rerank::Reranker;
use beamline_tools::builtins::{ElogToolServer, GraphToolServer};
use beamline_tools::{Dispatcher, SseToolServer};

#[derive(Debug, Parser)]
#[command(
    name = "beamline",
    version,
    about = "Retrieval-augmented assistant for the accelerator facility"
)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = "beamline.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Answer one question and exit.
    Ask {
        /// The question (joined with spaces).
        question: Vec<String>,
        /// Answer without consulting any tools.
        #[arg(long)]
        no_tools: bool,
    },
    /// Interactive session keeping conversation history.
    Chat,
    /// Probe the LLM endpoint, the logbook, and every tool server.
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("load config from {}", cli.config.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.telemetry.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Commands::Ask { question, no_tools } => {
            let question = question.join(" ");
            if question.trim().is_empty() {
                anyhow::bail!("empty question");
            }
            let orchestrator = build_orchestrator(&config).await;
            let mut settings = config.session_settings();
            if no_tools {
                settings.tools_enabled = false;
            }
            let turn = Turn::new(question, settings);
            run_turn(&orchestrator, &turn).await?;
        }
        Commands::Chat => {
            let orchestrator = build_orchestrator(&config).await;
            chat_loop(&orchestrator, &config).await?;
        }
        Commands::Doctor => doctor(&config).await,
    }

    Ok(())
}

/// Wire the retrieval cores and tool servers into one dispatcher.
async fn build_orchestrator(config: &AppConfig) -> AgentOrchestrator {
    let llm: Arc<dyn ChatBackend> = Arc::new(LlmClient::new(
        config.llm.base_url.clone(),
        config.llm.api_key_env.clone(),
    ));

    let elog_client = Arc::new(ElogClient::new(
        config.elog.base_url.clone(),
        config.elog.logbook.clone(),
        config.elog.timeout_secs,
    ));
    let elog_search = Arc::new(ElogSearch::new(elog_client, Arc::new(Reranker::new())));

    let mut dispatcher = Dispatcher::new();
    dispatcher.add_server("elog", Box::new(ElogToolServer::new(elog_search)));
    dispatcher.add_server(
        "knowledge-graph",
        Box::new(GraphToolServer::new(config.graph.base_url.clone())),
    );
    for entry in &config.tools.servers {
        dispatcher.add_server(entry.id.clone(), Box::new(SseToolServer::new(entry.url.clone())));
    }
    dispatcher.bootstrap().await;

    AgentOrchestrator::new(llm, Arc::new(dispatcher))
}

/// Drive one turn: tokens to stdout, step events to stderr, Ctrl-C
/// cancels the in-flight call.
async fn run_turn(orchestrator: &AgentOrchestrator, turn: &Turn) -> Result<Option<String>> {
    let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
    let cancel = CancellationToken::new();

    let ctrlc_cancel = cancel.clone();
    let ctrlc = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrlc_cancel.cancel();
        }
    });

    let printer = tokio::spawn(async move {
        let mut stdout = io::stdout();
        while let Some(event) = rx.recv().await {
            match event {
                AgentEvent::Token(token) => {
                    let _ = write!(stdout, "{token}");
                    let _ = stdout.flush();
                }
                AgentEvent::StepStarted { name } => eprintln!("· {name}…"),
                AgentEvent::StepFinished { name, summary } => eprintln!("· {name}: {summary}"),
                AgentEvent::ClarificationPrompt(message) => {
                    let _ = writeln!(stdout, "{message}");
                }
                AgentEvent::Canceled => eprintln!("(canceled)"),
                AgentEvent::Error(message) => eprintln!("error: {message}"),
            }
        }
    });

    let outcome = orchestrator.run_turn(turn, tx, cancel).await?;
    let _ = printer.await;
    ctrlc.abort();
    println!();

    if outcome.kind == OutcomeKind::Answered && !outcome.references.is_empty() {
        eprintln!("({} reference(s) consulted)", outcome.references.len());
    }
    Ok(outcome.answer)
}

async fn chat_loop(orchestrator: &AgentOrchestrator, config: &AppConfig) -> Result<()> {
    let stdin = io::stdin();
    let mut history: Vec<HistoryMessage> = Vec::new();
    println!("beamline chat — empty line or `exit` to quit");

    loop {
        print!("> ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let question = line.trim().to_string();
        if question.is_empty() || question == "exit" || question == "quit" {
            break;
        }

        let mut turn = Turn::new(question.clone(), config.session_settings());
        turn.history = history.clone();
        let answer = run_turn(orchestrator, &turn).await?;

        history.push(HistoryMessage {
            role: "user".to_string(),
            content: question,
        });
        if let Some(answer) = answer {
            history.push(HistoryMessage {
                role: "assistant".to_string(),
                content: answer,
            });
        }
    }
    Ok(())
}

/// Connectivity probes, one line per dependency.
async fn doctor(config: &AppConfig) {
    let llm = LlmClient::new(config.llm.base_url.clone(), config.llm.api_key_env.clone());
    let request = ChatRequest {
        model: config.llm.model.clone(),
        messages: vec![ChatMessage::user("Reply with exactly: OK")],
        temperature: 0.0,
    };
    match llm.chat(&request).await {
        Ok(reply) => println!("llm: ok ({})", reply.trim().chars().take(40).collect::<String>()),
        Err(error) => println!("llm: FAILED ({error})"),
    }

    let elog_client = Arc::new(ElogClient::new(
        config.elog.base_url.clone(),
        config.elog.logbook.clone(),
        config.elog.timeout_secs,
    ));
    let search = ElogSearch::new(elog_client, Arc::new(Reranker::new()));
    match search
        .search(&beamline_elog::SearchParams {
            max_results: 1,
            ..Default::default()
        })
        .await
    {
        Ok(outcome) => println!("elog: ok ({} entries visible)", outcome.total_found),
        Err(error) => println!("elog: FAILED ({error})"),
    }

    let mut dispatcher = Dispatcher::new();
    dispatcher.add_server(
        "knowledge-graph",
        Box::new(GraphToolServer::new(config.graph.base_url.clone())),
    );
    for entry in &config.tools.servers {
        dispatcher.add_server(entry.id.clone(), Box::new(SseToolServer::new(entry.url.clone())));
    }
    dispatcher.bootstrap().await;
    println!(
        "tools: {} descriptor(s) from {} configured server(s)",
        dispatcher.registry().len(),
        1 + config.tools.servers.len(),
    );
}
