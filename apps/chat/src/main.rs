use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    load_settings, BackendClient, ClientSettings, ConversationRoom, ConversationSession,
    DeliveryState, SessionEvent, SessionManager,
};
use shared::domain::{ConversationId, MessageId, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Terminal client for marketplace conversations")]
struct Args {
    /// Settings file; defaults to ./client.toml.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long)]
    realtime_url: Option<String>,
    #[arg(long)]
    storage_path: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Signs in and stores the session token locally.
    Login {
        #[arg(long)]
        phone_number: String,
        #[arg(long, env = "CHAT_PASSWORD")]
        password: String,
    },
    Logout,
    /// Opens a conversation and sends every stdin line as a message.
    ///
    /// `/image <path>` uploads a picture, `/retry` resends failed messages
    /// and `/quit` leaves.
    Chat {
        /// Existing conversation; a new one is created when omitted.
        #[arg(long)]
        conversation: Option<i64>,
        /// The other participants, at least one.
        #[arg(long = "participant", required = true)]
        participants: Vec<i64>,
    },
}

fn settings_from(args: &Args) -> Result<ClientSettings> {
    let mut settings = load_settings(args.config.as_deref());
    if let Some(url) = &args.api_url {
        settings.api_base_url = url.clone();
    }
    if let Some(url) = &args.realtime_url {
        settings.realtime_url = url.clone();
    }
    if let Some(path) = &args.storage_path {
        settings.storage_path = path.clone();
    }
    settings.validate()?;
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
    let args = Args::parse();
    let settings = settings_from(&args)?;

    let backend = BackendClient::new(settings.api_base_url.clone(), settings.request_timeout)?;
    let sessions = SessionManager::from_settings(&settings, backend.clone());

    match args.command {
        Command::Login {
            phone_number,
            password,
        } => {
            let credential = backend.login(&phone_number, &password).await?;
            sessions.login(&credential).await?;
            println!("Logged in as user_id={}", credential.user_id);
        }
        Command::Logout => {
            sessions.logout().await?;
            println!("Logged out");
        }
        Command::Chat {
            conversation,
            participants,
        } => chat(&sessions, &backend, conversation, participants).await?,
    }
    Ok(())
}

async fn chat(
    sessions: &SessionManager,
    backend: &BackendClient,
    conversation: Option<i64>,
    participants: Vec<i64>,
) -> Result<()> {
    let credential = sessions
        .credentials()
        .get_credential()
        .await
        .context("run `chat login` first")?;
    let mut members: Vec<UserId> = participants.into_iter().map(UserId).collect();
    members.push(credential.user_id);

    let conversation_id = match conversation {
        Some(id) => ConversationId(id),
        None => backend
            .create_conversation(&credential, members.clone())
            .await?,
    };
    let room = ConversationRoom::new(conversation_id, members)?;

    let mut events = BroadcastStream::new(sessions.subscribe());
    let session = sessions.open_conversation(&room).await?;
    println!("Conversation {conversation_id} open; type a message and press enter");

    let mut printed: HashSet<MessageId> = HashSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_line(&session, backend, &credential, line.trim()).await? {
                    break;
                }
            }
            event = events.next() => {
                match event {
                    Some(Ok(event)) => render_event(&session, &mut printed, event),
                    Some(Err(err)) => warn!("chat: missed session events: {err}"),
                    None => break,
                }
            }
        }
    }

    session.close();
    Ok(())
}

/// Returns false when the user asked to quit.
async fn handle_line(
    session: &ConversationSession,
    backend: &BackendClient,
    credential: &client_core::Credential,
    line: &str,
) -> Result<bool> {
    match line {
        "" => {}
        "/quit" => return Ok(false),
        "/retry" => {
            let failed: Vec<_> = session
                .messages()
                .into_iter()
                .filter(|message| message.state == DeliveryState::Failed)
                .filter_map(|message| message.local_id())
                .collect();
            for local_id in failed {
                session.retry(local_id)?;
            }
        }
        _ => {
            if let Some(path) = line.strip_prefix("/image ") {
                let url = upload(backend, credential, Path::new(path.trim())).await?;
                session.send(None, Some(url))?;
            } else {
                session.send(Some(line.to_string()), None)?;
            }
        }
    }
    Ok(true)
}

async fn upload(
    backend: &BackendClient,
    credential: &client_core::Credential,
    path: &Path,
) -> Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let Some(filename) = path.file_name().and_then(|name| name.to_str()) else {
        bail!("{} has no usable file name", path.display());
    };
    let mime_type = match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    };
    let url = backend
        .upload_media(credential, filename, mime_type, bytes)
        .await?;
    info!(%url, "chat: image uploaded");
    Ok(url)
}

fn render_event(session: &ConversationSession, printed: &mut HashSet<MessageId>, event: SessionEvent) {
    match event {
        SessionEvent::ConnectionChanged(state) => println!("-- connection {state:?}"),
        SessionEvent::HistoryLoaded { count, .. } => println!("-- {count} earlier messages"),
        SessionEvent::HistoryFailed { error, .. } => println!("-- history unavailable: {error}"),
        SessionEvent::MessageFailed { local_id, .. } => {
            println!("-- message {local_id} not sent; type /retry to resend")
        }
        SessionEvent::ServerError { code, message, .. } => {
            println!("-- server error ({code:?}): {message}")
        }
        SessionEvent::MessagesChanged { conversation_id } => {
            if conversation_id != session.conversation_id() {
                return;
            }
            for message in session.messages() {
                let Some(id) = message.server_id() else {
                    continue;
                };
                if !printed.insert(id) {
                    continue;
                }
                let body = message
                    .content
                    .as_deref()
                    .or(message.attachment_url.as_deref())
                    .unwrap_or_default();
                println!(
                    "[{}] user {}: {body}",
                    message.created_at.format("%H:%M"),
                    message.sender_id
                );
            }
        }
    }
}
