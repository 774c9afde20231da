//! 事件系统模块
//!
//! 两类事件：
//! - 线上事件（wire）：推送通道收发的帧，建模为封闭 tagged union，
//!   分发因此是穷举的，新增事件类型是编译期检查的改动
//! - SDK 事件：广播给上层观察者的内部通知（缓存变更、输入状态、在线状态、连接状态）

use crate::error::Result;
use crate::store::entities::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// 表情反馈操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionAction {
    Add,
    Remove,
}

/// 服务端推送帧（封闭事件词表）
///
/// 通道上的每个入站帧按事件类型字符串判别后路由到所属组件：
/// 消息类 → 会话缓存，输入类 → 输入协调器，在线类 → 在线追踪器。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
#[serde(rename_all_fields = "camelCase")]
pub enum ServerFrame {
    NewMessage {
        message: Message,
    },
    MessageUpdated {
        message: Message,
    },
    MessageRead {
        message_id: String,
        user_id: String,
        read_at: DateTime<Utc>,
    },
    MessageReaction {
        message_id: String,
        user_id: String,
        emoji: String,
        action: ReactionAction,
    },
    TypingStart {
        conversation_id: String,
        user_id: String,
        user_name: String,
    },
    TypingStop {
        conversation_id: String,
        user_id: String,
        user_name: String,
    },
    UserOnline {
        user_id: String,
    },
    UserOffline {
        user_id: String,
    },
}

impl ServerFrame {
    /// 从原始帧解析；未知事件类型或负载格式错误返回 None（丢弃，不中断管线）
    pub fn parse(raw: &RawFrame) -> Option<ServerFrame> {
        let tagged = serde_json::json!({
            "event": raw.event,
            "data": raw.data,
        });

        match serde_json::from_value(tagged) {
            Ok(frame) => Some(frame),
            Err(e) => {
                debug!("Dropping unrecognized frame '{}': {}", raw.event, e);
                None
            }
        }
    }

    /// 事件类型字符串（与线上判别标签一致）
    pub fn event_type(&self) -> &'static str {
        match self {
            ServerFrame::NewMessage { .. } => "new_message",
            ServerFrame::MessageUpdated { .. } => "message_updated",
            ServerFrame::MessageRead { .. } => "message_read",
            ServerFrame::MessageReaction { .. } => "message_reaction",
            ServerFrame::TypingStart { .. } => "typing_start",
            ServerFrame::TypingStop { .. } => "typing_stop",
            ServerFrame::UserOnline { .. } => "user_online",
            ServerFrame::UserOffline { .. } => "user_offline",
        }
    }
}

/// 客户端出站帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
#[serde(rename_all_fields = "camelCase")]
pub enum ClientFrame {
    JoinUserRoom {
        user_id: String,
    },
    JoinConversation {
        conversation_id: String,
    },
    LeaveConversation {
        conversation_id: String,
    },
    TypingStart {
        conversation_id: String,
        user_id: String,
        user_name: String,
    },
    TypingStop {
        conversation_id: String,
        user_id: String,
        user_name: String,
    },
}

/// 传输层交付的原始帧（事件名 + 未解析负载）
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub event: String,
    pub data: serde_json::Value,
}

impl RawFrame {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// 连接状态（通道管理器独占所有权；会话缓存只观察，不修改）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelStatus {
    /// 未连接
    Disconnected,
    /// 连接中
    Connecting,
    /// 已连接
    Connected,
    /// 重连中
    Reconnecting,
    /// 重连次数耗尽，等待手动恢复
    Failed,
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelStatus::Disconnected => write!(f, "disconnected"),
            ChannelStatus::Connecting => write!(f, "connecting"),
            ChannelStatus::Connected => write!(f, "connected"),
            ChannelStatus::Reconnecting => write!(f, "reconnecting"),
            ChannelStatus::Failed => write!(f, "failed"),
        }
    }
}

/// SDK 事件（广播给观察者）
#[derive(Debug, Clone)]
pub enum SdkEvent {
    /// 收到新消息（已完成与临时消息的去重合并）
    MessageReceived { message: Message },
    /// 消息被更新（编辑/删除/回执/表情）
    MessageChanged { conversation_id: String, message_id: String },
    /// 某会话的消息列表被整体替换（批量拉取或发送回滚）
    MessagesReloaded { conversation_id: String },
    /// 会话列表发生变化（最近消息指针更新或整体替换）
    ConversationListChanged,
    /// 某会话的输入状态集合变化
    TypingChanged { conversation_id: String },
    /// 用户在线状态变化
    PresenceChanged { user_id: String, is_online: bool },
    /// 连接状态变迁
    ChannelStateChanged {
        old_status: ChannelStatus,
        new_status: ChannelStatus,
    },
    /// 命令失败且乐观效果已回滚（用户可见、可恢复）
    CommandFailed {
        conversation_id: Option<String>,
        detail: String,
    },
}

impl SdkEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SdkEvent::MessageReceived { .. } => "message_received",
            SdkEvent::MessageChanged { .. } => "message_changed",
            SdkEvent::MessagesReloaded { .. } => "messages_reloaded",
            SdkEvent::ConversationListChanged => "conversation_list_changed",
            SdkEvent::TypingChanged { .. } => "typing_changed",
            SdkEvent::PresenceChanged { .. } => "presence_changed",
            SdkEvent::ChannelStateChanged { .. } => "channel_state_changed",
            SdkEvent::CommandFailed { .. } => "command_failed",
        }
    }
}

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
}

/// 事件管理器（广播 + 统计）
pub struct EventManager {
    sender: broadcast::Sender<SdkEvent>,
    stats: Arc<tokio::sync::RwLock<EventStats>>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            stats: Arc::new(tokio::sync::RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub async fn emit(&self, event: SdkEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.write().await;
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
        }

        // 无订阅者时 send 会失败，属正常场景（无 UI 消费方），仅打 debug
        if let Err(e) = self.sender.send(event) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }
    }

    /// 订阅事件
    pub fn subscribe(&self) -> broadcast::Receiver<SdkEvent> {
        self.sender.subscribe()
    }

    /// 获取活跃订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// 获取事件统计
    pub async fn get_stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }
}

/// 序列化出站帧为 (事件名, 负载) 对，供传输层 emit
pub fn encode_client_frame(frame: &ClientFrame) -> Result<RawFrame> {
    let value = serde_json::to_value(frame)?;
    let event = value
        .get("event")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            crate::error::ConvoSyncError::Protocol("outbound frame missing event tag".to_string())
        })?
        .to_string();
    let data = value.get("data").cloned().unwrap_or(serde_json::Value::Null);
    Ok(RawFrame { event, data })
}
