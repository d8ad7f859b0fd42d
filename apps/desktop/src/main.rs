use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use client_core::bootstrap::HttpDirectoryApi;
use client_core::transport::WsConnector;
use client_core::{load_settings, ClientEvent, ConversationKey, Session, SyncClient};
use shared::domain::{PresenceStatus, RoomId, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

/// Terminal front end for the sync core: mirrors every update to stdout and
/// takes slash commands on stdin.
#[derive(Parser, Debug)]
#[command(name = "desktop")]
struct Args {
    /// Server base url, e.g. http://localhost:8080
    #[arg(long, default_value = "http://localhost:8080")]
    server_url: String,
    /// REST base url for directory fetches; defaults to the server url
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long)]
    user_id: i64,
    #[arg(long)]
    username: String,
    /// Session token sent with the handshake
    #[arg(long)]
    token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let session = Session {
        user_id: UserId(args.user_id),
        username: args.username.clone(),
        auth_token: args.token.clone(),
    };
    let connector = Arc::new(WsConnector::new(&args.server_url)?);
    let api_url = args.api_url.unwrap_or_else(|| args.server_url.clone());
    let directory = Arc::new(HttpDirectoryApi::new(api_url));
    let client = SyncClient::new_with_directory(
        session,
        Arc::new(load_settings()),
        connector,
        directory,
    );

    let mut events = client.subscribe_events();
    client.start().await?;
    println!("connecting as {} (#{})", args.username, args.user_id);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => match run_command(&client, line.trim()).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(error) => eprintln!("! {error:#}"),
                },
                Ok(None) => break,
                Err(error) => {
                    eprintln!("! stdin error: {error}");
                    break;
                }
            },
            event = events.recv() => match event {
                Ok(event) => print_event(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    eprintln!("! dropped {missed} updates");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    client.stop().await;
    Ok(())
}

async fn run_command(client: &SyncClient, line: &str) -> Result<bool> {
    let mut parts = line.split_whitespace();
    let Some(command) = parts.next() else {
        return Ok(true);
    };
    match command {
        "/quit" => return Ok(false),
        "/retry" => client.retry().await?,
        "/join" => {
            let room_id = RoomId(parts.next().unwrap_or_default().parse()?);
            client.join_room(room_id).await?;
            client
                .activate_conversation(ConversationKey::Room(room_id))
                .await;
            println!("joined room {}", room_id.0);
        }
        "/leave" => {
            let room_id = RoomId(parts.next().unwrap_or_default().parse()?);
            client.leave_room(room_id).await?;
            println!("left room {}", room_id.0);
        }
        "/send" => {
            let room_id = RoomId(parts.next().unwrap_or_default().parse()?);
            let text = parts.collect::<Vec<_>>().join(" ");
            client
                .send_message(ConversationKey::Room(room_id), &text)
                .await?;
        }
        "/dm" => {
            let with = UserId(parts.next().unwrap_or_default().parse()?);
            let text = parts.collect::<Vec<_>>().join(" ");
            client
                .send_message(ConversationKey::Private(with), &text)
                .await?;
        }
        "/open" => {
            let with = UserId(parts.next().unwrap_or_default().parse()?);
            let key = ConversationKey::Private(with);
            client.activate_conversation(key).await;
            for message in client.messages(key).await {
                let sender = message
                    .sender_username
                    .unwrap_or_else(|| format!("#{}", message.sender_id.0));
                println!("[dm {}] {sender}: {}", with.0, message.content);
            }
        }
        "/chats" => {
            for entry in client.chat_list().await {
                let name = entry
                    .username
                    .unwrap_or_else(|| format!("#{}", entry.with.0));
                let marker = match entry.status {
                    PresenceStatus::Online => "+",
                    PresenceStatus::Offline => " ",
                };
                println!("{marker} {name}: {} unread", entry.unread);
            }
            println!("unread total: {}", client.total_unread().await);
        }
        _ => println!(
            "commands: /join N, /leave N, /send N text, /dm N text, /open N, /chats, /retry, /quit"
        ),
    }
    Ok(true)
}

fn print_event(event: ClientEvent) {
    match event {
        ClientEvent::ConnectionChanged(state) => println!("* connection: {state:?}"),
        ClientEvent::SessionResumed { session_id } => println!("* session {session_id} ready"),
        ClientEvent::AuthRejected { message } => eprintln!("! sign-in rejected: {message}"),
        ClientEvent::SessionTerminated { kind, reason } => {
            eprintln!(
                "! session terminated ({kind:?}): {}",
                reason.as_deref().unwrap_or("no reason given")
            );
        }
        ClientEvent::MessageUpserted { key, message } => {
            let sender = message
                .sender_username
                .unwrap_or_else(|| format!("#{}", message.sender_id.0));
            println!("[{}] {sender}: {}", label(key), message.content);
        }
        ClientEvent::ConversationLoaded { key } => {
            println!("* history loaded for {}", label(key));
        }
        ClientEvent::TypingChanged { key, users } => {
            if users.is_empty() {
                println!("* {}: nobody is typing", label(key));
            } else {
                let names: Vec<String> = users.iter().map(|user| format!("#{}", user.0)).collect();
                println!("* {}: typing {}", label(key), names.join(", "));
            }
        }
        ClientEvent::PresenceChanged { user_id, status } => {
            println!("* user #{} is {status:?}", user_id.0);
        }
        ClientEvent::ChatListChanged => {}
        ClientEvent::RoomsUpdated(rooms) => {
            let names: Vec<&str> = rooms.iter().map(|room| room.name.as_str()).collect();
            println!("* rooms: {}", names.join(", "));
        }
        ClientEvent::IncomingCall {
            username,
            call_type,
            ..
        } => {
            println!(
                "* incoming {call_type:?} call from {username} (no media engine, it will ring out)"
            );
        }
        ClientEvent::CallPhaseChanged { peer, phase } => {
            println!("* call with #{}: {phase:?}", peer.0);
        }
        ClientEvent::CallRemoteTrack { track_id, .. } => println!("* remote track {track_id}"),
        ClientEvent::CallFault { message, .. } => eprintln!("! call problem: {message}"),
        ClientEvent::CallLog(record) => {
            println!(
                "* call with #{} ended: {:?} after {}s",
                record.peer.0,
                record.outcome,
                record.duration.num_seconds()
            );
        }
        ClientEvent::Error(message) => eprintln!("! server error: {message}"),
    }
}

fn label(key: ConversationKey) -> String {
    match key {
        ConversationKey::Room(room_id) => format!("room {}", room_id.0),
        ConversationKey::Private(with) => format!("dm {}", with.0),
    }
}
