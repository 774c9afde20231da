//! ConvoSync SDK - 客户端实时会话同步核心
//!
//! 把三个独立乱序的输入源合并进单一内存缓存，供 UI 直接渲染：
//! 1. 初始批量拉取（基线）
//! 2. 乐观本地命令（临时消息 / 字段预变更，失败补偿回滚）
//! 3. 推送事件（服务端确认与对端变更，幂等合并）
//!
//! 主要组件：
//! - `ConvoSync`: SDK 门面，组装下列组件并暴露读取/动作接口
//! - `ConversationStore`: 会话缓存，唯一事实来源
//! - `ChannelManager`: 推送通道生命周期与指数退避重连
//! - `CommandPipeline`: 乐观命令管线（发送/已读/表情/建会话）
//! - `TypingCoordinator`: 双侧输入状态（本地状态机 + 远端过期表）
//! - `PresenceTracker`: 在线状态集合
//!
//! 传输层（`EventTransport`）与后端命令层（`MessagingApi`）是 trait 接缝，
//! 由平台层注入具体实现（WebSocket / HTTP 等）。

pub mod commands;
pub mod connection;
pub mod error;
pub mod events;
pub mod presence;
pub mod sdk;
pub mod store;
pub mod transport;
pub mod typing;

pub use commands::{CommandPipeline, MessagingApi};
pub use connection::{ChannelManager, ChannelState, ReconnectPolicy};
pub use error::{ConvoSyncError, Result};
pub use events::{
    ChannelStatus, ClientFrame, EventManager, RawFrame, ReactionAction, SdkEvent, ServerFrame,
};
pub use presence::PresenceTracker;
pub use sdk::{ConvoSync, ConvoSyncConfig};
pub use store::entities::{
    Attachment, Conversation, ConversationKind, Message, MessageDraft, MessageKind, Reaction,
    ReadReceipt, TypingStatus,
};
pub use store::{AppendOutcome, ConversationStore};
pub use transport::{EventTransport, TransportEvent};
pub use typing::{TypingConfig, TypingCoordinator};
