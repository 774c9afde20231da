//! 会话与消息实体定义
//!
//! 实体只存活于客户端会话内存中：
//! - Conversation 持有自己的消息序列（所有权归会话）
//! - Message 在服务端确认前使用客户端生成的临时 ID（`local-` 前缀）
//! - Reaction / ReadReceipt 作为消息的子集合，按键幂等合并

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 临时消息 ID 前缀（服务端 ID 永远不会带此前缀）
pub const LOCAL_ID_PREFIX: &str = "local-";

/// 生成一个客户端唯一的临时消息 ID
pub fn new_local_id() -> String {
    format!("{}{}", LOCAL_ID_PREFIX, uuid::Uuid::new_v4())
}

/// 判断 ID 是否为客户端临时 ID
pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

/// 会话类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    /// 单聊
    Direct,
    /// 群聊
    Group,
}

/// 消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    Text,
    Image,
    Audio,
    Video,
    File,
    System,
}

/// 附件信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// 附件 URL（服务端返回的文件访问地址）
    pub url: String,
    /// 文件名
    pub file_name: String,
    /// 文件大小（字节）
    pub file_size: u64,
    /// MIME 类型
    pub mime_type: String,
}

/// 表情反馈
///
/// 以 (message_id, user_id, emoji) 三元组为唯一键，
/// 添加/移除均为幂等集合操作，不使用 last-writer-wins。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub message_id: String,
    pub user_id: String,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

/// 已读回执
///
/// 按 (message_id, user_id) 唯一；同一用户只有更晚的 read_at 才能覆盖旧值。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub message_id: String,
    pub user_id: String,
    pub read_at: DateTime<Utc>,
}

/// 消息实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// 服务端消息 ID，或未确认时的客户端临时 ID（`local-` 前缀）
    pub id: String,
    /// 所属会话 ID
    pub conversation_id: String,
    /// 发送者 ID
    pub sender_id: String,
    /// 消息内容
    pub content: String,
    /// 消息类型
    #[serde(rename = "messageType")]
    pub kind: MessageKind,
    /// 回复的消息 ID（回复是消息属性，不是消息类型）
    #[serde(default)]
    pub reply_to_id: Option<String>,
    /// 附件列表
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// 表情反馈列表
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    /// 已读回执列表
    #[serde(default)]
    pub read_receipts: Vec<ReadReceipt>,
    /// 本端是否已读
    pub is_read: bool,
    /// 是否被编辑过
    pub is_edited: bool,
    /// 是否被删除（软删除，保留占位）
    pub is_deleted: bool,
    /// 创建时间（UTC）
    pub created_at: DateTime<Utc>,
    /// 更新时间（UTC）
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// 是否为尚未被服务端确认的临时消息
    pub fn is_provisional(&self) -> bool {
        is_local_id(&self.id)
    }

    /// 查找指定用户的已读回执
    pub fn read_receipt_of(&self, user_id: &str) -> Option<&ReadReceipt> {
        self.read_receipts.iter().find(|r| r.user_id == user_id)
    }

    /// 是否存在指定 (user_id, emoji) 的表情反馈
    pub fn has_reaction(&self, user_id: &str, emoji: &str) -> bool {
        self.reactions
            .iter()
            .any(|r| r.user_id == user_id && r.emoji == emoji)
    }
}

/// 会话实体
///
/// 由初始拉取或"创建会话"命令产生；本地永不删除，只会被更新的服务端状态整体替换。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub kind: ConversationKind,
    /// 参与者 ID 列表（有序）
    pub participant_ids: Vec<String>,
    /// 最近一条消息的冗余指针（用于会话列表按时间排序）
    #[serde(default)]
    pub last_message: Option<Message>,
}

impl Conversation {
    /// 会话列表排序用的时间戳（无消息的会话排在最后）
    pub fn recency(&self) -> Option<DateTime<Utc>> {
        self.last_message.as_ref().map(|m| m.created_at)
    }
}

/// 待发送消息草稿
#[derive(Debug, Clone, Default)]
pub struct MessageDraft {
    pub content: String,
    pub kind: Option<MessageKind>,
    pub reply_to_id: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl MessageDraft {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_reply(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to_id = Some(message_id.into());
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// 对端输入状态（瞬态，不持久化；无刷新时窗口到期自动消失）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingStatus {
    pub conversation_id: String,
    pub user_id: String,
    pub user_name: String,
    pub is_typing: bool,
}
