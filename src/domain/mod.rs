pub mod document;
pub mod room;

pub use document::{CrdtDocument, OpaqueLogDocument};
pub use room::{Participant, Role, Room, Snapshot, User, Visibility};
