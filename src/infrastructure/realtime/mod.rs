pub mod hub;
pub mod registry;

pub use hub::{ConnectResult, Hub, HubConfig};
pub use registry::{CloseReason, CloseSignal, ConnectionRegistry, RoomMember, SessionHandle, SessionRecord};
