mod connection;
mod room;

pub use connection::ClientConnection;
pub(crate) use room::invalid_message;
pub use room::{RoomEvent, SyncRoom, SyncState, SyncStats};
