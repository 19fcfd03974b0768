//! REST collaborators of the chat core: history, send and read status.

pub mod http;

use std::future::Future;
use thiserror::Error;

use crate::models::envelope::DecodeError;
use crate::models::messages::{MessagePage, NewMessage, ReadStatus};
use crate::models::{HistoryQuery, MessageId, RoomId};

pub use http::HttpChatApi;

/// Why a single REST call failed.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
#[error("failed to load history for room {room_id}: {source}")]
pub struct HistoryFetchError {
    pub room_id: RoomId,
    #[source]
    pub source: RequestError,
}

#[derive(Debug, Error)]
#[error("failed to send message to room {room_id}: {source}")]
pub struct SendError {
    pub room_id: RoomId,
    #[source]
    pub source: RequestError,
}

/// Read status is best-effort; callers log this and carry on.
#[derive(Debug, Error)]
#[error("failed to update read status for room {room_id}: {source}")]
pub struct ReadStatusError {
    pub room_id: RoomId,
    #[source]
    pub source: RequestError,
}

/// The backend calls a chat room needs besides the live connection.
pub trait ChatApi: Send + Sync {
    /// One page of history, newest page first when `query.cursor` is `None`.
    fn fetch_history(
        &self,
        room_id: RoomId,
        query: &HistoryQuery,
    ) -> impl Future<Output = Result<MessagePage, HistoryFetchError>> + Send;

    /// Submit a message. The created message comes back over the room's
    /// live subscription, not in the response.
    fn send_message(
        &self,
        room_id: RoomId,
        message: &NewMessage,
    ) -> impl Future<Output = Result<(), SendError>> + Send;

    fn update_read_status(
        &self,
        room_id: RoomId,
        last_read_message_id: MessageId,
    ) -> impl Future<Output = Result<ReadStatus, ReadStatusError>> + Send;
}
