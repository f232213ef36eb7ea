//! 会话事件协议：流式事件、持久化消息、响应组装 / 历史回放、会话日志存储

pub mod assembler;
pub mod event;
pub mod message;
pub mod store;

pub use assembler::{ReplayAssembler, ResponseBuilder};
pub use event::{encode_error_frame, EventDecoder, EventEncoder, PartContent, PartKind, StreamEvent, ToolOutcome};
pub use message::{
    MessageKind, ModelMessage, ModelRequest, ModelResponse, PartRecord, PersistedMessage, RequestPart,
    ResponsePart,
};
#[cfg(feature = "async-sqlite")]
pub use store::SqliteMessageStore;
pub use store::{
    create_message_store, ConversationAccess, ConversationSummary, MemoryMessageStore, MessageStore, StoredMessage,
};
