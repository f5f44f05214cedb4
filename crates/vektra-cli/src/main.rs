//! vektra - terminal front end for agent conversations with tool confirmation

mod commands;
mod config;
mod script;
mod ui;

use clap::Parser;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::broadcast::{self, error::RecvError};
use vektra_chat::{ChatEvent, ChatSession, ScriptedTransport};
use vektra_protocol::codec;

/// vektra - chat with an agent, approving gated tool calls as they come
#[derive(Parser, Debug)]
#[command(name = "vektra")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSONL event script replayed as the backend's responses
    #[arg(short, long)]
    script: Option<PathBuf>,

    /// Run in non-interactive mode with a single prompt
    #[arg(short = 'c', long)]
    command: Option<String>,

    /// Approve every gated tool call without asking
    #[arg(long, conflicts_with = "auto_deny")]
    auto_approve: bool,

    /// Deny every gated tool call without asking
    #[arg(long)]
    auto_deny: bool,

    /// Pause between replayed events, in milliseconds
    #[arg(long)]
    delay_ms: Option<u64>,

    /// Print raw message and event JSON
    #[arg(short, long)]
    debug: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,
}

/// How gated calls are answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Ask,
    Approve,
    Deny,
}

/// Front-end state shared by both modes
struct Frontend {
    session: ChatSession,
    transport: Arc<ScriptedTransport>,
    events: broadcast::Receiver<ChatEvent>,
    transcript: ui::Transcript,
    decision: Decision,
    debug: bool,
    sent_printed: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Setup tracing
    if args.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("vektra=debug,vektra_chat=debug,vektra_protocol=debug")
            .with_writer(std::io::stderr)
            .init();
    } else if std::env::var_os("RUST_LOG").is_some() {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();
    }

    // Initialize config and exit
    if args.init_config {
        match config::Config::init() {
            Ok(path) => {
                println!("Config file created at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let cfg = config::Config::load();

    // CLI takes precedence over the config file
    let Some(script_path) = args.script.or(cfg.script.as_ref().map(PathBuf::from)) else {
        eprintln!("Error: no event script given");
        eprintln!();
        eprintln!("Pass one with: vektra --script responses.jsonl");
        eprintln!("Or set `script` in the config file: vektra --init-config");
        std::process::exit(1);
    };
    let responses = script::load(&script_path)?;
    tracing::info!(
        "Loaded {} scripted responses from {}",
        responses.len(),
        script_path.display()
    );

    let mut transport = ScriptedTransport::new(responses);
    if let Some(ms) = args.delay_ms {
        transport = transport.with_delay(Duration::from_millis(ms));
    }
    let transport = Arc::new(transport);
    let session = ChatSession::new(cfg.session_config(), transport.clone());

    let decision = if args.auto_approve {
        Decision::Approve
    } else if args.auto_deny {
        Decision::Deny
    } else {
        Decision::Ask
    };

    let mut frontend = Frontend {
        events: session.subscribe(),
        session,
        transport,
        transcript: ui::Transcript::new(),
        decision,
        debug: args.debug || cfg.debug.unwrap_or(false),
        sent_printed: 0,
    };

    if let Some(command) = args.command {
        return run_command(&mut frontend, &command).await;
    }

    run_interactive(&mut frontend).await
}

async fn run_command(frontend: &mut Frontend, command: &str) -> anyhow::Result<()> {
    println!("vektra> {}", command);
    println!();

    frontend.session.submit_user_message(command).await?;
    frontend.finish_turn().await?;

    if !frontend.session.awaiting_confirmation().is_empty() {
        eprintln!("Rerun with --auto-approve or --auto-deny to answer confirmations.");
    }
    Ok(())
}

async fn run_interactive(frontend: &mut Frontend) -> anyhow::Result<()> {
    use std::io::{self, Write};

    // Show minimal startup info (only if TTY)
    if std::io::IsTerminal::is_terminal(&std::io::stderr()) {
        let gated: Vec<String> = frontend
            .session
            .policy()
            .tools()
            .map(String::from)
            .collect();
        eprintln!("vektra (confirming: {})", gated.join(", "));
        eprintln!("Type /help for commands.");
        eprintln!();
    }

    loop {
        let placeholder = frontend.session.snapshot().composer_placeholder();
        print!("{}\n> ", placeholder);
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            // EOF
            break;
        }

        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        // Handle slash commands
        if input.starts_with('/') {
            let awaiting = frontend.session.awaiting_confirmation();
            if let Some(result) = commands::execute_command(input, &awaiting) {
                match result {
                    commands::CommandResult::Approve(call_id) => {
                        match frontend.session.approve(&call_id).await {
                            Ok(_) => frontend.finish_turn().await?,
                            Err(e) => eprintln!("Error: {}", e),
                        }
                    }
                    commands::CommandResult::Deny(call_id) => {
                        match frontend.session.deny(&call_id).await {
                            Ok(_) => frontend.finish_turn().await?,
                            Err(e) => eprintln!("Error: {}", e),
                        }
                    }
                    commands::CommandResult::Stop => {
                        frontend.session.stop().await;
                        frontend.print_updates();
                        println!("Stopped.");
                    }
                    commands::CommandResult::Clear => {
                        frontend.session.clear_history().await;
                        frontend.transcript.reset();
                        println!("Cleared conversation.");
                    }
                    commands::CommandResult::ToggleDebug => {
                        frontend.debug = !frontend.debug;
                        println!("Debug output {}.", if frontend.debug { "on" } else { "off" });
                    }
                    commands::CommandResult::Message(msg) => {
                        println!("{}", msg);
                    }
                    commands::CommandResult::Exit => {
                        break;
                    }
                    commands::CommandResult::Unknown(cmd) => {
                        println!("Unknown command: /{}", cmd);
                        println!("Type /help for available commands.");
                    }
                }
            }
            continue;
        }

        frontend.session.set_draft(input);
        match frontend.session.submit_draft().await {
            Ok(_) => frontend.finish_turn().await?,
            Err(e) => eprintln!("Error: {}", e),
        }
    }

    frontend.session.stop().await;
    Ok(())
}

impl Frontend {
    /// Wait for the turn to settle, print it, and answer gates per `decision`
    async fn finish_turn(&mut self) -> anyhow::Result<()> {
        loop {
            self.settle().await;
            self.print_updates();

            let awaiting = self.session.awaiting_confirmation();
            if awaiting.is_empty() {
                return Ok(());
            }
            match self.decision {
                Decision::Ask => {
                    for waiting in &awaiting {
                        println!("{}", ui::render_confirmation(waiting));
                    }
                    return Ok(());
                }
                Decision::Approve => {
                    for waiting in &awaiting {
                        println!("[auto-approving {}]", waiting.call_id);
                        self.session.approve(&waiting.call_id).await?;
                    }
                }
                Decision::Deny => {
                    for waiting in &awaiting {
                        println!("[auto-denying {}]", waiting.call_id);
                        self.session.deny(&waiting.call_id).await?;
                    }
                }
            }
        }
    }

    /// Wait until the stream ends or a confirmation is needed. Ctrl-C stops it.
    async fn settle(&mut self) {
        loop {
            let state = self.session.snapshot();
            if !state.stream_status.is_active() || state.pending_confirmation {
                return;
            }
            tokio::select! {
                event = self.events.recv() => match event {
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return,
                },
                _ = tokio::signal::ctrl_c() => {
                    self.session.stop().await;
                    println!("[stopped]");
                    return;
                }
            }
        }
    }

    fn print_updates(&mut self) {
        let state = self.session.snapshot();
        let policy = self.session.policy();
        for block in self.transcript.flush(&state, &policy, self.debug) {
            println!("{}\n", block);
        }
        if let Some(status) = ui::render_status(&state) {
            println!("{}", status);
        }

        if self.debug {
            let sent = self.transport.sent();
            for event in &sent[self.sent_printed.min(sent.len())..] {
                match codec::encode_outgoing(event) {
                    Ok(line) => println!("=> {}", line),
                    Err(e) => eprintln!("Failed to encode {:?}: {}", event, e),
                }
            }
            self.sent_printed = sent.len();
        }
    }
}
