//! Channel adapters for Disclaude.
//!
//! Adapters are pure I/O: they decode platform events into `InboundEvent`s and
//! deliver `OutboundMessage`s back to a conversation.

mod discord;
mod feishu;
mod text;
mod traits;
mod types;

pub use discord::DiscordAdapter;
pub use feishu::FeishuAdapter;
pub use text::split_message;
pub use traits::ChannelAdapter;
pub use types::{ConversationId, InboundEvent, InboundMessage, MessageId, OutboundMessage, SenderId};
