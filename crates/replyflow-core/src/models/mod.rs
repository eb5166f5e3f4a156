mod message;
mod wire;

pub use message::{ContentUpdateMode, FlushedUpdate, IdentifierMapping, MessageStatus, MessageUpdate};
pub use wire::{
    Attachment, ConversationSnapshot, HEARTBEAT_FRAME, InboundFrame, MessageSnapshot,
    MessageUpdateFrame, SendMessageRequest, SendMessageResponse, TransportMode,
};
