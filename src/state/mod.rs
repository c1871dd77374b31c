pub mod session;
pub mod store;

pub use session::{ChatSession, ToolRequest, TurnReport, TurnStatus, TurnUpdate, APOLOGY_MESSAGE};
pub use store::{ChatMessage, MessageId, MessageStore, Role, StoreError};
