pub mod events;
pub mod types;

pub use events::{ChannelEvent, ChannelState};
pub use types::{ChatMessage, DeliveryState, InboundFrame, SenderType};
