//! Run the pruning engine over saved transcripts and request bodies.
//!
//! Transcripts are JSON arrays of host messages. Session state is kept under
//! `--state-dir` between invocations, so decisions made by `prune` apply to a
//! later `redact`.
//!
//! # Examples
//!
//! ```sh
//! # Run the heuristics and print the rewritten transcript
//! cinch-prune prune --session ses_1 --transcript ses_1.json
//!
//! # Redact an outbound request body read from stdin
//! cat request.json | cinch-prune redact --session ses_1 --transcript ses_1.json
//!
//! # Ask the judge model (needs OPENROUTER_KEY)
//! cinch-prune semantic --session ses_1 --transcript ses_1.json
//!
//! # /dcp commands
//! cinch-prune command --session ses_1 --transcript ses_1.json "/dcp stats"
//!
//! # Call a pruning tool the way the model would
//! cinch-prune tool --session ses_1 --transcript ses_1.json prune '{"ids": [0, 2]}'
//! ```

use cinch_prune::prelude::*;
use cinch_prune::semantic::judge::JudgeFuture;
use clap::{Parser, Subcommand};
use std::io::{self, Read};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Context pruning engine for LLM agent sessions.
#[derive(Parser)]
#[command(name = "cinch-prune")]
struct Cli {
    /// Global config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Project config file, merged over the global one
    #[arg(long)]
    project_config: Option<PathBuf>,

    /// Directory for persisted session state
    #[arg(long, default_value = ".cinch/prune")]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct SessionArgs {
    /// Session id
    #[arg(long)]
    session: String,

    /// JSON file with the session's transcript
    #[arg(long)]
    transcript: Option<PathBuf>,

    /// Parent session id; marks the session as a sub-agent
    #[arg(long)]
    parent: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the message-transform pipeline and print the rewritten transcript
    Prune {
        #[command(flatten)]
        session: SessionArgs,

        /// Also prune these references or call ids
        #[arg(long = "ref")]
        refs: Vec<String>,
    },
    /// Redact a request body (from --body or stdin) and print it
    Redact {
        #[command(flatten)]
        session: SessionArgs,

        /// File with the request body
        #[arg(long)]
        body: Option<PathBuf>,

        /// Provider id, e.g. `google` for bodies without call ids
        #[arg(long)]
        provider: Option<String>,
    },
    /// Run one semantic pruning decision
    Semantic {
        #[command(flatten)]
        session: SessionArgs,

        /// Judge model, overriding the config
        #[arg(long)]
        model: Option<String>,
    },
    /// Execute a `/dcp` command
    Command {
        #[command(flatten)]
        session: SessionArgs,

        /// Command text, e.g. "/dcp stats"
        text: String,
    },
    /// Call one of the model-facing pruning tools
    Tool {
        #[command(flatten)]
        session: SessionArgs,

        /// Tool name, e.g. `prune`
        name: String,

        /// JSON arguments
        #[arg(default_value = "{}")]
        arguments: String,
    },
    /// Inspect persisted state
    State {
        #[command(subcommand)]
        action: StateAction,
    },
}

#[derive(Subcommand)]
enum StateAction {
    /// Print a session's persisted state
    Show { session: String },
    /// List sessions with persisted state
    List,
    /// Delete a session's persisted state
    Delete { session: String },
}

/// Stand-in judge when no API key is configured.
struct NoJudge;

impl Judge for NoJudge {
    fn complete<'a>(&'a self, _: &'a str, _: &'a str, _: u32) -> JudgeFuture<'a> {
        Box::pin(async { Err(PruneError::Judge("OPENROUTER_KEY is not set".into())) })
    }
}

fn build_judge() -> Result<Arc<dyn Judge>> {
    match std::env::var("OPENROUTER_KEY") {
        Ok(key) if !key.is_empty() => Ok(Arc::new(OpenRouterJudge::new(key)?)),
        _ => Ok(Arc::new(NoJudge)),
    }
}

fn read_transcript(path: Option<&PathBuf>) -> Result<Vec<Message>> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn read_body(path: Option<&PathBuf>) -> Result<String> {
    match path {
        Some(p) => Ok(std::fs::read_to_string(p)?),
        None => {
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf)?;
            Ok(buf)
        }
    }
}

/// Engine over an in-memory host holding just this session.
fn build_engine(
    cli: &Cli,
    args: &SessionArgs,
    config: PruneConfig,
) -> Result<(Arc<PruningEngine>, Vec<Message>)> {
    let messages = read_transcript(args.transcript.as_ref())?;
    let info = match &args.parent {
        Some(parent) => SessionInfo::child(&args.session, parent),
        None => SessionInfo::top_level(&args.session),
    };
    let host = InMemoryHost::new().with_session(info);
    host.set_messages(&args.session, messages.clone());

    let engine = PruningEngine::new(config, Arc::new(host), build_judge()?)
        .with_persistence(SessionPersistence::new(&cli.state_dir));
    Ok((Arc::new(engine), messages))
}

async fn run(cli: &Cli) -> Result<String> {
    let config = PruneConfig::load(cli.config.as_deref(), cli.project_config.as_deref());

    match &cli.command {
        Command::Prune { session, refs } => {
            let (engine, mut messages) = build_engine(cli, session, config)?;
            if !refs.is_empty() {
                let report = engine.prune_tools(&session.session, refs).await?;
                eprintln!("  Pruned {} call(s) by reference", report.pruned.len());
            }
            let mode = engine
                .on_messages_transform(&session.session, &mut messages, None)
                .await;
            if mode == PipelineMode::FailOpen {
                eprintln!("  Warning: transform failed open, transcript unchanged");
            }
            engine.persist(&session.session).await;
            Ok(serde_json::to_string_pretty(&messages)?)
        }
        Command::Redact {
            session,
            body,
            provider,
        } => {
            let (engine, mut messages) = build_engine(cli, session, config)?;
            let raw = read_body(body.as_ref())?;
            engine
                .on_chat_params(&ChatParams {
                    session_id: session.session.clone(),
                    provider_id: provider.clone(),
                    ..Default::default()
                })
                .await?;
            engine
                .on_messages_transform(&session.session, &mut messages, None)
                .await;
            let outcome = engine
                .redactor()
                .redact_body(Some(&session.session), &raw)
                .await;
            if let RedactOutcome::FailedOpen { reason, .. } = &outcome {
                eprintln!("  Warning: forwarding original body: {reason}");
            }
            eprintln!("  Replaced {} tool output(s)", outcome.replaced());
            engine.persist(&session.session).await;
            Ok(outcome.into_body())
        }
        Command::Semantic { session, model } => {
            let config = match model {
                Some(m) => config.with_semantic_model(m.clone()),
                None => config,
            };
            let (engine, _) = build_engine(cli, session, config)?;
            match engine.run_semantic(&session.session).await? {
                SemanticRun::Applied(outcome) => {
                    let mut out = format!(
                        "Model {} pruned {} call(s), ~{} bytes freed",
                        outcome.model,
                        outcome.pruned.len(),
                        outcome.bytes_freed
                    );
                    if !outcome.pruned.is_empty() {
                        out.push_str(&format!(": {}", outcome.pruned.join(", ")));
                    }
                    if !outcome.reasoning.is_empty() {
                        out.push_str(&format!("\n{}", outcome.reasoning));
                    }
                    Ok(out)
                }
                SemanticRun::NothingEligible => Ok("Nothing eligible for pruning.".into()),
                SemanticRun::Dropped => Ok("A semantic run is already in flight.".into()),
            }
        }
        Command::Command { session, text } => {
            let (engine, _) = build_engine(cli, session, config)?;
            match engine.handle_command(&session.session, text).await {
                Some(output) => Ok(output.text().to_string()),
                None => Err(PruneError::Config(format!("not a /dcp command: {text:?}"))),
            }
        }
        Command::Tool {
            session,
            name,
            arguments,
        } => {
            let (engine, mut messages) = build_engine(cli, session, config)?;
            let tools = engine.tool_set();
            if !tools.contains(name) {
                let available: Vec<String> =
                    tools.definitions().into_iter().map(|d| d.function.name).collect();
                return Err(PruneError::InvalidToolArgs(format!(
                    "unknown tool {name:?}; available: {}",
                    available.join(", ")
                )));
            }
            // References in tool arguments are assigned by the transform.
            engine
                .on_messages_transform(&session.session, &mut messages, None)
                .await;
            Ok(tools.execute(name, &session.session, arguments).await)
        }
        Command::State { action } => {
            let persistence = SessionPersistence::new(&cli.state_dir);
            match action {
                StateAction::Show { session } => match persistence.load(session).await? {
                    Some(state) => Ok(serde_json::to_string_pretty(&state)?),
                    None => Err(PruneError::UnknownSession(session.clone())),
                },
                StateAction::List => Ok(persistence.list_session_ids().await?.join("\n")),
                StateAction::Delete { session } => Ok(if persistence.delete(session).await? {
                    format!("Deleted {session}")
                } else {
                    format!("No state for {session}")
                }),
            }
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cinch_prune=info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match run(&cli).await {
        Ok(output) => println!("{output}"),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}
