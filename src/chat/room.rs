use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::api::{ChatApi, HistoryFetchError, RequestError, SendError};
use crate::chat::connection::{ConnectionError, ConnectionManager};
use crate::chat::registry::RoomFeed;
use crate::models::messages::{ChatMessage, MessagePage, NewMessage};
use crate::models::{HistoryQuery, MessageId, RoomId};

#[derive(Debug, Error)]
pub enum ChatRoomError {
    #[error(transparent)]
    History(#[from] HistoryFetchError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// What one open room currently shows.
#[derive(Debug, Clone)]
pub struct ChatRoomSession {
    room_id: RoomId,
    /// Arrival order: history (ascending id) followed by live messages.
    messages: Vec<ChatMessage>,
    seen: HashSet<MessageId>,
    /// Cursor of the next older page; `None` once history is exhausted.
    oldest_cursor: Option<String>,
    read_position: Option<MessageId>,
}

impl ChatRoomSession {
    fn new(room_id: RoomId, page: MessagePage) -> Self {
        let mut session = Self {
            room_id,
            messages: Vec::new(),
            seen: HashSet::new(),
            oldest_cursor: None,
            read_position: None,
        };
        session.prepend_page(page);
        session
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn last_message_id(&self) -> Option<MessageId> {
        self.messages.last().map(|m| m.id)
    }

    pub fn oldest_cursor(&self) -> Option<&str> {
        self.oldest_cursor.as_deref()
    }

    pub fn has_more_history(&self) -> bool {
        self.oldest_cursor.is_some()
    }

    /// Id of the last message the server accepted as read.
    pub fn read_position(&self) -> Option<MessageId> {
        self.read_position
    }

    /// Append a live message. Returns false for an id already shown.
    fn append(&mut self, message: ChatMessage) -> bool {
        if !self.seen.insert(message.id) {
            return false;
        }
        self.messages.push(message);
        true
    }

    /// Put an older page in front of what is shown and move the cursor.
    fn prepend_page(&mut self, page: MessagePage) -> usize {
        let mut older: Vec<ChatMessage> = page
            .messages
            .into_iter()
            .filter(|m| self.seen.insert(m.id))
            .collect();
        older.sort_by_key(|m| m.id);

        let added = older.len();
        older.append(&mut self.messages);
        self.messages = older;
        self.oldest_cursor = page.next_cursor;
        added
    }
}

/// One open room: history plus the live feed, merged into one sequence.
///
/// Dropping the room (or calling [`ChatRoom::leave`]) releases its
/// subscription; the shared connection stays open. Every request the room
/// makes is a future borrowed from it, so nothing can land after it is gone.
pub struct ChatRoom<A: ChatApi> {
    connection: ConnectionManager,
    api: Arc<A>,
    session: ChatRoomSession,
    feed: RoomFeed,
    /// Shown but not yet handed to a `next_message` caller.
    undelivered: Option<ChatMessage>,
    page_size: u32,
}

impl<A: ChatApi> ChatRoom<A> {
    /// Enter a room with the configured history page size.
    pub async fn enter(
        connection: &ConnectionManager,
        api: Arc<A>,
        room_id: RoomId,
    ) -> Result<Self, ChatRoomError> {
        let page_size = connection.config().history_page_size;
        Self::enter_with_page_size(connection, api, room_id, page_size).await
    }

    /// Load the latest history page, then subscribe to live messages and
    /// acknowledge the last message shown.
    pub async fn enter_with_page_size(
        connection: &ConnectionManager,
        api: Arc<A>,
        room_id: RoomId,
        page_size: u32,
    ) -> Result<Self, ChatRoomError> {
        let query = HistoryQuery::new(None, page_size);
        let page = api.fetch_history(room_id, &query).await?;
        let session = ChatRoomSession::new(room_id, page);
        let feed = connection.subscribe(room_id).await?;

        let mut room = Self {
            connection: connection.clone(),
            api,
            session,
            feed,
            undelivered: None,
            page_size: query.size,
        };
        info!(
            "Entered room {room_id} with {} messages",
            room.session.messages.len()
        );
        room.acknowledge_read().await;
        Ok(room)
    }

    pub fn room_id(&self) -> RoomId {
        self.session.room_id
    }

    pub fn session(&self) -> &ChatRoomSession {
        &self.session
    }

    pub fn messages(&self) -> &[ChatMessage] {
        self.session.messages()
    }

    /// Wait for the next live message, show it and acknowledge it. `None`
    /// once the feed has closed.
    ///
    /// Cancel safe: a message taken off the feed is held until a call
    /// returns it, so dropping this future (e.g. in `tokio::select!`) while
    /// the read acknowledgement is in flight loses nothing.
    pub async fn next_message(&mut self) -> Option<ChatMessage> {
        while self.undelivered.is_none() {
            let message = self.feed.recv().await?;
            let id = message.id;
            if self.session.append(message.clone()) {
                self.undelivered = Some(message);
            } else {
                debug!("Skipping message {id} already shown in room {}", self.session.room_id);
            }
        }

        self.acknowledge_read().await;
        self.undelivered.take()
    }

    /// Load the page before the oldest shown message. Returns how many
    /// messages were added; 0 once history is exhausted. On error nothing
    /// changes.
    pub async fn load_older(&mut self) -> Result<usize, HistoryFetchError> {
        let Some(cursor) = self.session.oldest_cursor.clone() else {
            return Ok(0);
        };
        let query = HistoryQuery::new(Some(&cursor), self.page_size);
        let page = self.api.fetch_history(self.session.room_id, &query).await?;
        Ok(self.session.prepend_page(page))
    }

    /// Submit a message. It shows up when it comes back over the live feed.
    pub async fn send(&self, message: &NewMessage) -> Result<(), SendError> {
        let room_id = self.session.room_id;
        message.validate().map_err(|reason| SendError {
            room_id,
            source: RequestError::Invalid(reason),
        })?;
        self.api.send_message(room_id, message).await
    }

    /// Leave the room, releasing its subscription.
    pub fn leave(self) {}

    /// Report the last shown message as read, unless it already is.
    async fn acknowledge_read(&mut self) {
        let Some(last) = self.session.last_message_id() else {
            return;
        };
        if self.session.read_position.is_some_and(|read| read >= last) {
            return;
        }

        match self.api.update_read_status(self.session.room_id, last).await {
            Ok(status) => self.session.read_position = Some(status.last_read_message_id),
            Err(e) => debug!("Ignoring read status failure: {e}"),
        }
    }
}

impl<A: ChatApi> Drop for ChatRoom<A> {
    fn drop(&mut self) {
        self.connection
            .release(self.session.room_id, self.feed.subscription_id());
    }
}
