pub mod envelope;
pub mod messages;

use serde::Serialize;

/// Default number of messages per history page.
pub const DEFAULT_PAGE_SIZE: u32 = 30;

const MAX_PAGE_SIZE: u32 = 100;

pub type RoomId = i64;
pub type MessageId = i64;
pub type UserId = i64;

/// Query parameters for one page of room history.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    pub size: u32,
}

impl HistoryQuery {
    pub fn new(cursor: Option<&str>, size: u32) -> Self {
        Self {
            cursor: cursor.map(str::to_owned),
            size: size.clamp(1, MAX_PAGE_SIZE),
        }
    }
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self::new(None, DEFAULT_PAGE_SIZE)
    }
}
