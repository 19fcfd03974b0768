pub mod connection;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod transport;

pub use connection::{ConnectionError, ConnectionEvent, ConnectionManager, ConnectionState};
pub use registry::RoomFeed;
pub use room::{ChatRoom, ChatRoomError, ChatRoomSession};
