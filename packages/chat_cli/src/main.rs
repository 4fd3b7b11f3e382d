use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};
use tracing_subscriber::prelude::*;

use chat_stream::config::default_config_dir;
use chat_stream::{ChatClient, ChatHandle, ClientConfig, Role, SessionId, ThreadMessage};

/// Longest message the server accepts, in characters.
const MAX_MESSAGE_CHARS: usize = 10_000;

#[derive(Parser)]
#[command(name = "chat")]
#[command(about = "Terminal client for a streaming chat backend")]
struct Cli {
    /// Config directory (defaults to the platform config dir + /chat-stream)
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Session to open (default: most recent)
    #[arg(long)]
    session: Option<i64>,

    /// Title for a new session when none exist
    #[arg(long)]
    title: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

/// One line typed at the prompt.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Send(String),
    Sessions,
    Switch(i64),
    New(Option<String>),
    Rename(String),
    Delete,
    Reconnect,
    Help,
    Quit,
    Empty,
    Invalid(String),
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        if line.chars().count() > MAX_MESSAGE_CHARS {
            return Input::Invalid(format!(
                "message is longer than {MAX_MESSAGE_CHARS} characters"
            ));
        }
        return Input::Send(line.to_string());
    };

    let (name, rest) = match command.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (command, ""),
    };
    match name {
        "sessions" | "ls" => Input::Sessions,
        "switch" => match rest.parse() {
            Ok(id) => Input::Switch(id),
            Err(_) => Input::Invalid("usage: /switch <session id>".to_string()),
        },
        "new" => Input::New((!rest.is_empty()).then(|| rest.to_string())),
        "rename" if !rest.is_empty() => Input::Rename(rest.to_string()),
        "rename" => Input::Invalid("usage: /rename <title>".to_string()),
        "delete" => Input::Delete,
        "reconnect" => Input::Reconnect,
        "help" | "?" => Input::Help,
        "quit" | "exit" | "q" => Input::Quit,
        other => Input::Invalid(format!("unknown command /{other}, try /help")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "chat_stream=debug,chat=debug,warn"
    } else {
        "chat_stream=info,chat=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let config_dir = match cli.config_dir {
        Some(dir) => dir,
        None => default_config_dir().context("Could not determine config directory")?,
    };
    let config = ClientConfig::load(&config_dir)
        .with_context(|| format!("Failed to load config from {}", config_dir.display()))?;
    let token = std::env::var("CHAT_TOKEN").context("CHAT_TOKEN is not set")?;

    info!(api_url = %config.api_url, ws_url = %config.connection.ws_url, "starting");
    let handle = ChatClient::connect_http(config, token).context("Failed to start chat client")?;

    let session_id = open_initial_session(&handle, cli.session, cli.title).await?;
    print_thread(&handle);
    tokio::spawn(report_status(handle.clone()));

    eprintln!("Session {session_id}. Type a message, or /help for commands.");
    let result = repl(&handle).await;
    handle.dispose().await;
    result
}

async fn open_initial_session(
    handle: &ChatHandle,
    requested: Option<i64>,
    title: Option<String>,
) -> Result<SessionId> {
    let sessions = handle
        .load_sessions()
        .await
        .context("Failed to load sessions")?;
    let session_id = match (requested, sessions.first()) {
        (Some(id), _) => SessionId(id),
        (None, Some(latest)) => latest.id,
        (None, None) => {
            handle
                .create_session(title)
                .await
                .context("Failed to create session")?
                .id
        }
    };
    handle
        .select_session(session_id)
        .await
        .with_context(|| format!("Failed to open session {session_id}"))?;
    Ok(session_id)
}

async fn repl(handle: &ChatHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        prompt();
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            return Ok(());
        };

        match parse_input(&line) {
            Input::Empty => {}
            Input::Quit => return Ok(()),
            Input::Help => print_help(),
            Input::Invalid(reason) => eprintln!("{reason}"),
            Input::Send(text) => send(handle, text).await,
            Input::Sessions => match handle.load_sessions().await {
                Ok(sessions) => {
                    let active = active_session(handle);
                    for session in sessions {
                        let marker = if Some(session.id) == active { "*" } else { " " };
                        println!(
                            "{marker} {:>6}  {}  {}",
                            session.id.0,
                            session.updated_at.format("%Y-%m-%d %H:%M"),
                            session.title
                        );
                    }
                }
                Err(e) => eprintln!("error: {e}"),
            },
            Input::Switch(id) => match handle.select_session(SessionId(id)).await {
                Ok(()) => print_thread(handle),
                Err(e) => eprintln!("error: {e}"),
            },
            Input::New(title) => {
                let result = async {
                    let session = handle.create_session(title).await?;
                    handle.select_session(session.id).await?;
                    Ok::<_, chat_stream::ChatError>(session)
                }
                .await;
                match result {
                    Ok(session) => eprintln!("Session {} ({})", session.id, session.title),
                    Err(e) => eprintln!("error: {e}"),
                }
            }
            Input::Rename(title) => match active_session(handle) {
                Some(id) => match handle.rename_session(id, title).await {
                    Ok(session) => eprintln!("Renamed to {}", session.title),
                    Err(e) => eprintln!("error: {e}"),
                },
                None => eprintln!("no active session"),
            },
            Input::Delete => match active_session(handle) {
                Some(id) => match handle.delete_session(id).await {
                    Ok(next) => {
                        eprintln!("Deleted session {id}");
                        if let Some(next) = next {
                            eprintln!("Session {next}");
                            print_thread(handle);
                        }
                    }
                    Err(e) => eprintln!("error: {e}"),
                },
                None => eprintln!("no active session"),
            },
            Input::Reconnect => {
                if let Err(e) = handle.reconnect().await {
                    eprintln!("error: {e}");
                }
            }
        }
    }
}

/// Send one message, echoing the reply as it streams in.
async fn send(handle: &ChatHandle, text: String) {
    let Some(session_id) = active_session(handle) else {
        eprintln!("no active session");
        return;
    };

    let mut streaming = handle.streaming_text();
    let _ = streaming.borrow_and_update();
    let mut shown = String::new();

    let exchange = handle.send_user_message(session_id, text);
    tokio::pin!(exchange);
    let result = loop {
        tokio::select! {
            result = &mut exchange => break result,
            Ok(()) = streaming.changed() => {
                let current = streaming.borrow_and_update().clone();
                if let Some(text) = current {
                    match stream_delta(&shown, &text) {
                        Delta::Append(tail) => print!("{tail}"),
                        Delta::Restart(all) => print!("\n{all}"),
                    }
                    let _ = std::io::stdout().flush();
                    shown = text;
                }
            }
        }
    };

    match result {
        Ok(()) if !shown.is_empty() => println!(),
        Ok(()) => {
            // Replies over HTTP arrive whole.
            let snapshot = handle.snapshot();
            let snapshot = snapshot.borrow();
            if let Some(reply) = snapshot.messages.last().filter(|m| m.role() == Role::Assistant) {
                println!("{}", reply.content());
            }
        }
        Err(e) => {
            if !shown.is_empty() {
                println!();
            }
            eprintln!("error: {e}");
            if let Some(text) = e.restored_text {
                eprintln!("not sent: {text}");
            }
        }
    }
}

/// What to print when the streamed text changes.
#[derive(Debug, PartialEq, Eq)]
enum Delta<'a> {
    /// The new text extends what is on screen.
    Append(&'a str),
    /// The buffer was replaced; print it whole on a fresh line.
    Restart(&'a str),
}

fn stream_delta<'a>(shown: &str, text: &'a str) -> Delta<'a> {
    match text.strip_prefix(shown) {
        Some(tail) => Delta::Append(tail),
        None => Delta::Restart(text),
    }
}

async fn report_status(handle: ChatHandle) {
    let mut status = handle.status();
    let mut errors = handle.last_error();
    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    return;
                }
                let current = *status.borrow_and_update();
                debug!(status = %current, "connection status");
            }
            changed = errors.changed() => {
                if changed.is_err() {
                    return;
                }
                if let Some(error) = errors.borrow_and_update().clone() {
                    eprintln!("[{error}]");
                }
            }
        }
    }
}

fn active_session(handle: &ChatHandle) -> Option<SessionId> {
    handle.snapshot().borrow().active_session
}

fn print_thread(handle: &ChatHandle) {
    let snapshot = handle.snapshot();
    let snapshot = snapshot.borrow();
    for message in &snapshot.messages {
        println!("{}", render(message));
    }
}

fn render(message: &ThreadMessage) -> String {
    let who = match message.role() {
        Role::User => "you",
        Role::Assistant => "assistant",
    };
    let pending = if message.is_provisional() { " (sending)" } else { "" };
    format!("{who}{pending}: {}", message.content())
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

fn print_help() {
    eprintln!("Commands:");
    eprintln!("  /sessions          list sessions");
    eprintln!("  /switch <id>       open a session");
    eprintln!("  /new [title]       create and open a session");
    eprintln!("  /rename <title>    rename the current session");
    eprintln!("  /delete            delete the current session");
    eprintln!("  /reconnect         reconnect the live channel");
    eprintln!("  /quit              exit");
}
