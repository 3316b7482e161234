//! Main Entrypoint for the Synapse console client
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Spawning a session over the WebSocket connector.
//! 3. Printing session events as they arrive.
//! 4. Turning stdin lines into session calls until `/quit`, EOF or Ctrl+C.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use synapse::{
    config::Config,
    console::{ConsoleCommand, HELP, parse_command},
    playback::FilePlayback,
};
use synapse_core::{
    AudioEngine, ConnectionStatus, Connector, ContextPatch, MessageKind, SessionEvent,
    SessionHandle,
};
use synapse_realtime::WebSocketConnector;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(version, about = "Console client for the Synapse realtime session service")]
struct Args {
    /// Append inbound PCM16 audio to this file.
    #[arg(long, value_name = "PATH")]
    playback_file: Option<PathBuf>,
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::StatusChange { status, previous } => {
            println!("* status: {} -> {}", previous, status)
        }
        SessionEvent::ConnectionEstablished { message, .. } => {
            println!("* {}", message.as_deref().unwrap_or("connection established"))
        }
        SessionEvent::ContextLoaded { message, .. } => {
            println!("* {}", message.as_deref().unwrap_or("context loaded"))
        }
        SessionEvent::Connected => println!("* connected, type /help for commands"),
        SessionEvent::Disconnected { code, reason } => match code {
            Some(code) => println!("* disconnected ({}) {}", code, reason),
            None => println!("* disconnected {}", reason),
        },
        SessionEvent::Reconnecting { attempt, delay } => {
            println!("* reconnecting (attempt {}) in {:?}", attempt, delay)
        }
        SessionEvent::Error(error) => {
            println!("! [{}] {}", error.code, error.message)
        }
        SessionEvent::Warning(warning) => println!("? {}", warning.message),
        SessionEvent::Message(message) => println!("< {}", message.content),
        SessionEvent::ToolCall(call) => println!(
            "# tool call {} ({}): {}",
            call.id,
            call.tool_type,
            serde_json::Value::Object(call.parameters.clone())
        ),
        SessionEvent::ToolCallExpired { id } => println!("# tool call {} expired", id),
        SessionEvent::ContextUpdated(context) => println!(
            "* context: {} ({})",
            context.user_id,
            context.company_name.as_deref().unwrap_or("no company")
        ),
        SessionEvent::ContextRefreshed { message } => {
            println!("* {}", message.as_deref().unwrap_or("context refreshed"))
        }
        SessionEvent::QualityChange(quality) => println!("* connection quality: {:?}", quality),
        SessionEvent::AudioStreamStarted => println!("* microphone on"),
        SessionEvent::AudioStreamStopped => println!("* microphone off"),
        SessionEvent::MessageSent(_)
        | SessionEvent::ToolCallResponse(_)
        | SessionEvent::Pong
        | SessionEvent::Audio(_)
        | SessionEvent::Volume(_)
        | SessionEvent::SpeechState(_) => {}
    }
}

async fn print_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => print_event(&event),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Console fell behind the event stream"),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn run_command(session: &SessionHandle, command: ConsoleCommand) -> anyhow::Result<()> {
    match command {
        ConsoleCommand::Say(text) => {
            session.send_message(text, MessageKind::User).await?;
        }
        ConsoleCommand::Mic => session.start_audio_stream().await?,
        ConsoleCommand::Mute => session.stop_audio_stream().await?,
        ConsoleCommand::Company(name) => {
            session.update_context(ContextPatch::company_name(name)).await?;
        }
        ConsoleCommand::Volume { output, level } => {
            let applied = if output {
                session.set_output_volume(level).await?
            } else {
                session.set_input_volume(level).await?
            };
            println!("* volume {}", applied);
        }
        ConsoleCommand::Tool { id, data } => {
            if !session.respond_to_tool_call(id.as_str(), data).await? {
                println!("! no pending tool call {}", id);
            }
        }
        ConsoleCommand::Reject { id, reason } => {
            if !session.reject_tool_call(id.as_str(), reason).await? {
                println!("! no pending tool call {}", id);
            }
        }
        ConsoleCommand::History => {
            for message in session.history().await? {
                println!("  [{:?}] {}", message.kind, message.content);
            }
        }
        ConsoleCommand::Metrics => {
            let snapshot = session.snapshot().await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        ConsoleCommand::Clear => session.clear_history().await?,
        ConsoleCommand::Help => println!("{}", HELP),
        ConsoleCommand::Quit => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();

    // --- 3. Spawn the Session ---
    let options = config
        .session_options()
        .context("Invalid session configuration")?;
    let playback = Arc::new(match &args.playback_file {
        Some(path) => FilePlayback::to_file(path)
            .await
            .with_context(|| format!("Failed to open playback file {}", path.display()))?,
        None => FilePlayback::discard(),
    });
    let audio: Arc<dyn AudioEngine> = playback.clone();
    let connector: Arc<dyn Connector> = Arc::new(WebSocketConnector::default());
    let session = SessionHandle::spawn(options, connector, audio)?;
    let printer = tokio::spawn(print_events(session.subscribe()));

    info!(
        user_id = %config.user_id,
        role = %config.user_role,
        url = %config.service_url,
        "Session configured. Connecting..."
    );
    session.connect().await?;

    // --- 4. Console Loop ---
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal.");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                match parse_command(&line) {
                    Ok(Some(ConsoleCommand::Quit)) => break,
                    Ok(Some(command)) => {
                        if let Err(e) = run_command(&session, command).await {
                            println!("! {}", e);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => println!("! {}", e),
                }
            }
        }
    }

    // --- 5. Shut Down ---
    if session.status() != ConnectionStatus::Disconnected {
        session.disconnect().await?;
    }
    printer.abort();
    playback.flush().await;
    info!("Session closed.");
    Ok(())
}
