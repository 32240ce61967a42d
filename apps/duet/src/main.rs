use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use duet_proto::{ControlMessage, WhiteboardAction, WhiteboardEvent};
use duet_session::identity::{
    DEFAULT_IDENTITY_TTL, FileIdentityStore, IdentityStore, MemoryIdentityStore,
};
use duet_session::telemetry::{self, LogConfig, LogLevel};
use duet_session::transfer::{Direction, ReceivedFile};
use duet_session::transport::PlaceholderMedia;
use duet_session::transport::signaling::WebSocketConnector;
use duet_session::transport::webrtc::WebRtcFactory;
use duet_session::{Participant, SessionConfig, SessionContext, SessionDeps, SessionEvent};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "duet", about = "Join a two-person lesson room")]
struct Cli {
    #[arg(long, env = "DUET_ROOM")]
    room: String,

    #[arg(long, env = "DUET_NAME")]
    name: String,

    #[arg(long, env = "DUET_SIGNALING_URL")]
    signaling_url: Option<String>,

    /// Logical participant used for device replacement. Defaults to the
    /// display name.
    #[arg(long)]
    participant: Option<String>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[arg(long, help = "Write logs to a file instead of stderr")]
    log_file: Option<PathBuf>,

    /// Directory received files are written to.
    #[arg(long, default_value = ".")]
    downloads: PathBuf,
}

enum Command {
    Chat(String),
    Send(PathBuf),
    Accept(String),
    Reject(String),
    RetryFile(String),
    Hand,
    Video(bool),
    Audio(bool),
    Draw(String),
    Clear,
    Hide,
    Show,
    Retry,
    Status,
    Quit,
}

fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Chat(line.to_string())));
    };
    let (verb, arg) = match rest.split_once(char::is_whitespace) {
        Some((verb, arg)) => (verb, arg.trim()),
        None => (rest, ""),
    };
    let required = |what: &str| {
        if arg.is_empty() {
            Err(format!("/{verb} needs {what}"))
        } else {
            Ok(arg.to_string())
        }
    };
    let toggle = || match arg {
        "on" => Ok(true),
        "off" => Ok(false),
        _ => Err(format!("/{verb} takes on or off")),
    };
    let command = match verb {
        "send" => Command::Send(PathBuf::from(required("a path")?)),
        "accept" => Command::Accept(required("a transfer id")?),
        "reject" => Command::Reject(required("a transfer id")?),
        "retry-file" => Command::RetryFile(required("a transfer id")?),
        "hand" => Command::Hand,
        "video" => Command::Video(toggle()?),
        "audio" => Command::Audio(toggle()?),
        "draw" => Command::Draw(required("a JSON payload")?),
        "clear" => Command::Clear,
        "hide" => Command::Hide,
        "show" => Command::Show,
        "retry" => Command::Retry,
        "status" => Command::Status,
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("unknown command /{other}")),
    };
    Ok(Some(command))
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    telemetry::init(&LogConfig {
        level: LogLevel::from_verbosity(cli.verbose),
        file: cli.log_file.clone(),
    })?;

    let mut config = SessionConfig::from_env();
    if let Some(url) = cli.signaling_url.clone() {
        config.signaling_url = url;
    }

    let identity: Arc<dyn IdentityStore> = match FileIdentityStore::in_cache_dir(DEFAULT_IDENTITY_TTL)
    {
        Ok(store) => Arc::new(store),
        Err(err) => {
            tracing::warn!(error = %err, "no cache directory, identity will not survive restarts");
            Arc::new(MemoryIdentityStore::new())
        }
    };
    let deps = SessionDeps {
        peers: Arc::new(
            WebRtcFactory::new(&config.ice_servers, config.chunk_bytes)
                .context("failed to set up webrtc")?,
        ),
        signaling: Arc::new(
            WebSocketConnector::new(&config.signaling_url, &cli.room)
                .context("invalid signaling url")?,
        ),
        media: Arc::new(PlaceholderMedia),
        identity,
    };
    let participant = Participant {
        room_id: cli.room.clone(),
        display_name: cli.name.clone(),
        participant_id: cli.participant.clone(),
    };

    let session = SessionContext::new(config, participant, deps);
    let mut events = session
        .events()
        .context("session events already taken")?;
    let peer_id = session.start()?;
    println!("joining room {} as {} ({peer_id})", cli.room, cli.name);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_command(&line) {
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(command)) => {
                        if let Err(err) = run_command(&session, command).await {
                            println!("! {err:#}");
                        }
                    }
                    Ok(None) => {}
                    Err(message) => println!("! {message}"),
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                let done = matches!(event, SessionEvent::Superseded { .. });
                show_event(event, &cli.downloads);
                if done {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.stop().await;
    Ok(())
}

async fn run_command(session: &SessionContext, command: Command) -> Result<()> {
    match command {
        Command::Chat(text) => session.send_chat(text)?,
        Command::Send(path) => {
            let data = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file".to_string());
            let metadata = session
                .send_file(name, guess_mime(&path), Bytes::from(data))
                .await?;
            println!("offered {} ({} bytes) as {}", metadata.name, metadata.size, metadata.id);
        }
        Command::Accept(id) => session.accept_file(id).await?,
        Command::Reject(id) => session.reject_file(id).await?,
        Command::RetryFile(id) => session.retry_transfer(id).await?,
        Command::Hand => session.send_control(ControlMessage::HandRaise { raised: true })?,
        Command::Video(enabled) => session.send_control(ControlMessage::ToggleVideo { enabled })?,
        Command::Audio(enabled) => session.send_control(ControlMessage::ToggleAudio { enabled })?,
        Command::Draw(json) => {
            let payload = serde_json::from_str(&json).context("draw payload must be JSON")?;
            session.send_whiteboard(WhiteboardEvent {
                action: WhiteboardAction::Draw,
                object_id: None,
                payload: Some(payload),
            })?;
        }
        Command::Clear => session.send_whiteboard(WhiteboardEvent {
            action: WhiteboardAction::Clear,
            object_id: None,
            payload: None,
        })?,
        Command::Hide => session.set_visibility(false)?,
        Command::Show => session.set_visibility(true)?,
        Command::Retry => session.retry_connection()?,
        Command::Status => {
            let status = session.status().await?;
            println!(
                "{:?}, relay {}, remote {}, open {:?}",
                status.phase,
                if status.signaling_connected { "up" } else { "down" },
                status
                    .remote
                    .map(|peer| peer.to_string())
                    .unwrap_or_else(|| "none".to_string()),
                status.open_channels,
            );
            for transfer in session.transfers().await? {
                println!(
                    "  {} {} {:?} {}%",
                    transfer.metadata.id, transfer.metadata.name, transfer.status, transfer.progress
                );
            }
        }
        Command::Quit => {}
    }
    Ok(())
}

fn show_event(event: SessionEvent, downloads: &Path) {
    match event {
        SessionEvent::Joined { room_id, .. } => println!("* joined {room_id}"),
        SessionEvent::JoinRejected { reason } => println!("* join rejected: {reason}"),
        SessionEvent::SignalingConnected(up) => {
            if !up {
                println!("* relay connection lost, reconnecting");
            }
        }
        SessionEvent::PeerJoined { display_name, .. } => println!("* {display_name} is here"),
        SessionEvent::PeerLeft { .. } => println!("* the other participant left"),
        SessionEvent::PeerReplaced { .. } => println!("* the other participant switched devices"),
        SessionEvent::Superseded { .. } => println!("* this session continued on another device"),
        SessionEvent::Phase(phase) => println!("* connection {phase:?}"),
        SessionEvent::Chat(message) => println!("<{}> {}", message.user_name, message.message),
        SessionEvent::Control(ControlMessage::HandRaise { raised: true }) => {
            println!("* hand raised")
        }
        SessionEvent::Control(message) => println!("* {message:?}"),
        SessionEvent::Whiteboard(event) => println!("* whiteboard {:?}", event.action),
        SessionEvent::BackgroundSettings(settings) => {
            println!("* background {} ({})", settings.mode, settings.enabled)
        }
        SessionEvent::QueueOverflow { channel, dropped } => {
            println!("* {channel} backlog full, {dropped} message(s) dropped")
        }
        SessionEvent::FileOffered(metadata) => println!(
            "* file offered: {} ({} bytes), /accept {id} or /reject {id}",
            metadata.name,
            metadata.size,
            id = metadata.id
        ),
        SessionEvent::Transfer(snapshot) => {
            if snapshot.direction == Direction::Outgoing || snapshot.status.is_terminal() {
                println!(
                    "* {} {:?} {}%",
                    snapshot.metadata.name, snapshot.status, snapshot.progress
                );
            }
        }
        SessionEvent::FileReceived(file) => match save_file(downloads, &file) {
            Ok(path) => println!("* saved {}", path.display()),
            Err(err) => println!("! could not save {}: {err:#}", file.metadata.name),
        },
        SessionEvent::RemoteBound { .. } | SessionEvent::RoundTrip(_) => {}
    }
}

/// Writes `file` under `dir`, picking `name (n).ext` when `name` exists.
fn save_file(dir: &Path, file: &ReceivedFile) -> Result<PathBuf> {
    let name = Path::new(&file.metadata.name)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    let stem = Path::new(&name)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.clone());
    let ext = Path::new(&name)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()));
    for n in 0..1000 {
        let candidate = if n == 0 {
            dir.join(&name)
        } else {
            dir.join(format!("{stem} ({n}){}", ext.as_deref().unwrap_or("")))
        };
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(mut out) => {
                out.write_all(&file.data)?;
                return Ok(candidate);
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err.into()),
        }
    }
    anyhow::bail!("too many files named {name}")
}

fn guess_mime(path: &Path) -> String {
    let ext = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase());
    match ext.as_deref() {
        Some("txt") => "text/plain",
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("json") => "application/json",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
    .to_string()
}
