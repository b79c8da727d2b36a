use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{ArgAction, Parser, Subcommand};
use reedline::{DefaultPrompt, DefaultPromptSegment, Reedline, Signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use matilda::config::{Config, ProviderConfig};
use matilda::llm::{LLMProvider, Role, TogetherProvider};
use matilda::persona::Style;
use matilda::relay::{Relay, RelayError, RelaySettings};
use matilda::server::{self, AppState};
use matilda::session::{Conversation, ConversationTemplate, SessionStore};

const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

const APOLOGY: &str = "I'm sorry, I encountered an issue generating a response. Please try again.";

#[derive(Parser)]
#[command(name = "matilda", version, about = "Conversational assistant on a hosted LLM")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Chat in the terminal (default)
    Chat {
        /// Wait for complete replies instead of streaming tokens
        #[arg(long)]
        no_stream: bool,
    },
    /// Serve the browser chat API
    Serve {
        /// Server config file
        #[arg(short, long, default_value = "matilda.yaml")]
        config: PathBuf,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let provider_config = ProviderConfig::from_env().context("invalid configuration")?;
    info!(
        model = %provider_config.model,
        base_url = %provider_config.base_url,
        api_key = %provider_config.api_key.masked(),
        style = %provider_config.persona.style,
        "Configuration loaded"
    );

    match cli.command.unwrap_or(Command::Chat { no_stream: false }) {
        Command::Chat { no_stream } => run_chat(provider_config, !no_stream).await,
        Command::Serve { config, host, port } => {
            run_serve(provider_config, config, host, port).await
        }
    }
}

fn init_tracing(verbose: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
        0 => EnvFilter::new("warn"),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn build_provider(config: &ProviderConfig) -> Result<Arc<dyn LLMProvider>> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("failed to build HTTP client")?;

    Ok(Arc::new(TogetherProvider::new(
        client,
        config.base_url.clone(),
        config.api_key.expose().to_string(),
    )))
}

// ============================================================================
// serve
// ============================================================================

async fn run_serve(
    provider_config: ProviderConfig,
    config_path: PathBuf,
    host: Option<String>,
    port: Option<u16>,
) -> Result<()> {
    let mut config = Config::load(&config_path)
        .await
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let provider = build_provider(&provider_config)?;
    let state = AppState {
        sessions: SessionStore::new(ConversationTemplate::from_config(&provider_config)),
        relay: Arc::new(Relay::new(
            provider,
            RelaySettings::from_config(&provider_config),
        )),
    };
    let sweeper = state.sessions.spawn_sweeper(
        SESSION_SWEEP_INTERVAL,
        Duration::from_secs(config.server.session_idle_timeout_seconds),
    );
    let app = server::build_app(state, config.server.request_timeout_seconds);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "Matilda listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    sweeper.abort();
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received");
}

// ============================================================================
// chat
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
enum ReplCommand<'a> {
    Exit,
    Help,
    Clear,
    Retry,
    Style(Option<&'a str>),
    Stream(Option<&'a str>),
    Unknown(&'a str),
    Say(&'a str),
}

fn parse_command(input: &str) -> ReplCommand<'_> {
    let input = input.trim();
    if ["exit", "quit", "bye"]
        .iter()
        .any(|word| input.eq_ignore_ascii_case(word))
    {
        return ReplCommand::Exit;
    }

    let Some(rest) = input.strip_prefix('!') else {
        return ReplCommand::Say(input);
    };

    let mut parts = rest.split_whitespace();
    let name = parts.next().unwrap_or_default().to_ascii_lowercase();
    let arg = parts.next();
    match name.as_str() {
        "exit" | "quit" => ReplCommand::Exit,
        "help" => ReplCommand::Help,
        "clear" => ReplCommand::Clear,
        "retry" => ReplCommand::Retry,
        "style" => ReplCommand::Style(arg),
        "stream" => ReplCommand::Stream(arg),
        _ => ReplCommand::Unknown(input),
    }
}

fn print_help() {
    println!("Commands:");
    println!("  !help            - show this help");
    println!("  !clear           - start over, keeping the persona");
    println!("  !retry           - resend the last unanswered message");
    println!("  !style [name]    - show or change the conversation style");
    println!("  !stream [on|off] - show or toggle token streaming");
    println!("  exit             - leave the chat");
    println!();
}

struct ChatSession {
    config: ProviderConfig,
    provider: Arc<dyn LLMProvider>,
    relay: Relay,
    conversation: Conversation,
    streaming: bool,
}

impl ChatSession {
    fn new(config: ProviderConfig, provider: Arc<dyn LLMProvider>, streaming: bool) -> Self {
        let relay = Relay::new(provider.clone(), RelaySettings::from_config(&config));
        let conversation = ConversationTemplate::from_config(&config).build();
        Self {
            config,
            provider,
            relay,
            conversation,
            streaming,
        }
    }

    fn assistant_name(&self) -> &str {
        &self.config.persona.assistant_name
    }

    fn greet(&mut self) {
        let greeting = self.config.persona.greeting(Local::now().naive_local());
        println!("{}: {greeting}\n", self.assistant_name());
        if let Err(e) = self.conversation.append(Role::Assistant, greeting) {
            warn!(error = %e, "Failed to record greeting");
        }
    }

    fn set_style(&mut self, name: Option<&str>) {
        let Some(name) = name else {
            let names: Vec<&str> = Style::ALL.iter().map(Style::as_str).collect();
            println!(
                "Current style: {} (available: {})\n",
                self.config.persona.style,
                names.join(", ")
            );
            return;
        };

        let style = match name.parse::<Style>() {
            Ok(style) => style,
            Err(e) => {
                println!("{e}\n");
                return;
            }
        };

        self.config = self.config.with_style(style);
        self.relay = Relay::new(
            self.provider.clone(),
            RelaySettings::from_config(&self.config),
        );
        let prompt = self
            .config
            .persona
            .system_prompt(Local::now().naive_local());
        if let Err(e) = self.conversation.reseed(prompt) {
            warn!(error = %e, "Failed to reseed persona");
        }
        info!(%style, "Conversation style changed");
        println!("Style set to {style}.\n");
    }

    fn set_streaming(&mut self, arg: Option<&str>) {
        match arg.map(str::to_ascii_lowercase).as_deref() {
            Some("on") => self.streaming = true,
            Some("off") => self.streaming = false,
            None => {}
            Some(other) => {
                println!("Expected 'on' or 'off', got '{other}'.\n");
                return;
            }
        }
        let state = if self.streaming { "on" } else { "off" };
        println!("Streaming is {state}.\n");
    }

    async fn say(&mut self, text: &str) {
        let result = if self.streaming {
            print!("{}: ", self.assistant_name());
            let _ = io::stdout().flush();
            let mut printed = false;
            let result = self
                .relay
                .complete_stream_or_fallback(&mut self.conversation, text, |token| {
                    printed = true;
                    print!("{token}");
                    let _ = io::stdout().flush();
                })
                .await;
            match &result {
                // Fell back to a single completion, nothing was streamed.
                Ok(reply) if !printed => println!("{}", reply.text),
                _ => println!(),
            }
            result.map(|_| ())
        } else {
            self.relay
                .complete(&mut self.conversation, text)
                .await
                .map(|reply| println!("{}: {}", self.config.persona.assistant_name, reply.text))
        };
        self.report(result);
    }

    async fn retry(&mut self) {
        let result = self.relay.retry(&mut self.conversation).await;
        let result =
            result.map(|reply| println!("{}: {}", self.config.persona.assistant_name, reply.text));
        self.report(result);
    }

    fn report(&self, result: Result<(), RelayError>) {
        match result {
            Ok(()) => println!(),
            Err(RelayError::Validation(e)) => println!("{e}\n"),
            Err(RelayError::Provider(e)) => {
                println!("{APOLOGY}");
                if e.is_transient() {
                    println!("(type !retry to resend your last message)");
                }
                println!();
            }
        }
    }
}

async fn run_chat(config: ProviderConfig, stream: bool) -> Result<()> {
    let provider = build_provider(&config)?;
    let streaming = stream && config.streaming;
    let mut chat = ChatSession::new(config, provider, streaming);

    println!("Type !help for commands, exit to leave.\n");
    chat.greet();

    let prompt = DefaultPrompt::new(
        DefaultPromptSegment::Basic(chat.config.persona.username.clone()),
        DefaultPromptSegment::Empty,
    );
    let mut line_editor = Reedline::create();

    loop {
        let signal = line_editor.read_line(&prompt)?;

        match signal {
            Signal::Success(buffer) => {
                if buffer.trim().is_empty() {
                    continue;
                }

                match parse_command(&buffer) {
                    ReplCommand::Exit => {
                        println!("{}: Goodbye!", chat.assistant_name());
                        break;
                    }
                    ReplCommand::Help => print_help(),
                    ReplCommand::Clear => {
                        chat.conversation.clear();
                        println!("Conversation history cleared.\n");
                    }
                    ReplCommand::Retry => chat.retry().await,
                    ReplCommand::Style(name) => chat.set_style(name),
                    ReplCommand::Stream(arg) => chat.set_streaming(arg),
                    ReplCommand::Unknown(input) => {
                        println!("Unknown command: {input}. Type !help for commands.\n");
                    }
                    ReplCommand::Say(text) => chat.say(text).await,
                }
            }
            Signal::CtrlD => {
                println!("\n{}: Goodbye!", chat.assistant_name());
                break;
            }
            Signal::CtrlC => {
                println!("\nType exit to leave.");
            }
        }
    }

    Ok(())
}
