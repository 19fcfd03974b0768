use dotenv::dotenv;
use fanchat_client::ChatConfig;
use fanchat_client::api::HttpChatApi;
use fanchat_client::chat::{ChatRoom, ConnectionEvent, ConnectionManager};
use fanchat_client::models::RoomId;
use fanchat_client::models::messages::NewMessage;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Terminal chat client: `fanchat-client <room-id>`.
///
/// Prints the room's recent history and live messages; every stdin line is
/// sent as a text message, `/older` loads an older page.
#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = match ChatConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let room_id: Option<RoomId> = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CHAT_ROOM_ID").ok())
        .and_then(|v| v.parse().ok());
    let Some(room_id) = room_id else {
        tracing::error!("Usage: fanchat-client <room-id> (or set CHAT_ROOM_ID)");
        return ExitCode::FAILURE;
    };

    // One connection for the whole session, shared by every room.
    let connection = ConnectionManager::new(config.clone());
    let api = Arc::new(HttpChatApi::from_config(&config));

    let mut room = match ChatRoom::enter(&connection, api, room_id).await {
        Ok(room) => room,
        Err(e) => {
            tracing::error!("Could not open room {room_id}: {e}");
            connection.disconnect().await;
            return ExitCode::FAILURE;
        }
    };
    for message in room.messages() {
        println!("{message}");
    }

    let mut events = connection.events();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            message = room.next_message() => match message {
                Some(message) => println!("{message}"),
                None => {
                    tracing::info!("Room {room_id} feed closed");
                    break;
                }
            },
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    if line == "/older" {
                        match room.load_older().await {
                            Ok(0) => tracing::info!("No older messages"),
                            Ok(n) => {
                                // Live output is already on screen below them.
                                println!("--- {n} earlier messages ---");
                                for message in &room.messages()[..n] {
                                    println!("{message}");
                                }
                                println!("--- end of earlier messages ---");
                            }
                            Err(e) => tracing::warn!("{e}"),
                        }
                    } else if let Err(e) = room.send(&NewMessage::text(line)).await {
                        tracing::warn!("{e}");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Failed to read stdin: {e}");
                    break;
                }
            },
            event = events.recv() => {
                if let Ok(ConnectionEvent::Reconnected) = event {
                    connection.resubscribe_all();
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    room.leave();
    connection.disconnect().await;
    ExitCode::SUCCESS
}
