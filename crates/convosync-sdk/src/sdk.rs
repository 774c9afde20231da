//! SDK 入口模块
//!
//! 把会话缓存、推送通道、输入协调、在线追踪与命令管线组装成单一门面：
//! - 初始化：批量拉取建立基线，随后连接推送通道做增量合并
//! - 读取：会话列表、消息序列、输入中用户、在线集合、连接状态
//! - 动作：发送/已读/表情/建会话、输入状态上报（含静默自动停止）
//!
//! 所有读取返回克隆快照，调用方无需关心内部锁。

use crate::commands::{CommandPipeline, MessagingApi};
use crate::connection::{ChannelManager, ChannelState, ReconnectPolicy};
use crate::error::Result;
use crate::events::{ChannelStatus, ClientFrame, EventManager, SdkEvent};
use crate::presence::PresenceTracker;
use crate::store::entities::{
    Conversation, ConversationKind, Message, MessageDraft, TypingStatus,
};
use crate::store::ConversationStore;
use crate::transport::EventTransport;
use crate::typing::{TypingConfig, TypingCoordinator};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// SDK 配置
#[derive(Debug, Clone)]
pub struct ConvoSyncConfig {
    /// 本端用户 ID
    pub user_id: String,
    /// 本端用户显示名（输入状态帧携带）
    pub user_name: String,
    /// 推送通道认证凭据
    pub credential: String,
    /// 重连退避基准延迟
    pub reconnect_base_delay: Duration,
    /// 自动重连次数上限
    pub reconnect_max_attempts: u32,
    /// 输入静默窗口（本地自动停止与远端条目过期共用）
    pub typing_silence_window: Duration,
    /// 事件广播缓冲区大小
    pub event_buffer_size: usize,
}

impl ConvoSyncConfig {
    pub fn new(
        user_id: impl Into<String>,
        user_name: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            credential: credential.into(),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_attempts: 5,
            typing_silence_window: Duration::from_secs(3),
            event_buffer_size: 256,
        }
    }

    pub fn with_reconnect(mut self, base_delay: Duration, max_attempts: u32) -> Self {
        self.reconnect_base_delay = base_delay;
        self.reconnect_max_attempts = max_attempts;
        self
    }

    pub fn with_typing_silence_window(mut self, window: Duration) -> Self {
        self.typing_silence_window = window;
        self
    }
}

/// 会话同步 SDK 门面
pub struct ConvoSync {
    config: ConvoSyncConfig,
    event_manager: Arc<EventManager>,
    store: Arc<ConversationStore>,
    typing: Arc<TypingCoordinator>,
    presence: Arc<PresenceTracker>,
    channel: Arc<ChannelManager>,
    pipeline: Arc<CommandPipeline>,
    /// 会话 ID → 输入自动停止定时器
    typing_timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ConvoSync {
    pub fn new(
        config: ConvoSyncConfig,
        transport: Arc<dyn EventTransport>,
        api: Arc<dyn MessagingApi>,
    ) -> Self {
        let event_manager = Arc::new(EventManager::new(config.event_buffer_size));
        let store = Arc::new(ConversationStore::new(event_manager.clone()));
        let typing = Arc::new(TypingCoordinator::with_config(
            config.user_id.clone(),
            event_manager.clone(),
            TypingConfig {
                silence_window: config.typing_silence_window,
            },
        ));
        let presence = Arc::new(PresenceTracker::new(event_manager.clone()));
        let channel = Arc::new(ChannelManager::new(
            transport,
            store.clone(),
            typing.clone(),
            presence.clone(),
            event_manager.clone(),
            ReconnectPolicy {
                base_delay: config.reconnect_base_delay,
                max_attempts: config.reconnect_max_attempts,
            },
            config.user_id.clone(),
        ));
        let pipeline = Arc::new(CommandPipeline::new(
            api,
            store.clone(),
            event_manager.clone(),
            config.user_id.clone(),
        ));

        Self {
            config,
            event_manager,
            store,
            typing,
            presence,
            channel,
            pipeline,
            typing_timers: Mutex::new(HashMap::new()),
        }
    }

    // ============ 生命周期 ============

    /// 初始化：先批量拉取建立基线，再连接推送通道
    ///
    /// 顺序保证推送增量总是落在已有基线之上合并。
    pub async fn initialize(&self) -> Result<()> {
        info!("Initializing session for user {}", self.config.user_id);
        self.pipeline.refresh_conversations().await?;
        self.connect().await
    }

    /// 连接推送通道；幂等，手动调用会重置重连计数
    pub async fn connect(&self) -> Result<()> {
        self.channel.connect(&self.config.credential).await
    }

    /// 断开推送通道并清空瞬态状态（输入、在线）；会话缓存保留
    pub async fn disconnect(&self) {
        {
            let mut timers = self.typing_timers.lock();
            for (_, task) in timers.drain() {
                task.abort();
            }
        }
        self.channel.disconnect().await;
    }

    /// 从 Failed 态手动恢复（等价于重置计数的 connect）
    pub async fn reconnect(&self) -> Result<()> {
        self.connect().await
    }

    // ============ 读取 ============

    /// 当前连接状态快照
    pub fn channel_state(&self) -> ChannelState {
        self.channel.state()
    }

    pub fn is_connected(&self) -> bool {
        self.channel.status() == ChannelStatus::Connected
    }

    /// 会话列表（按最近消息时间降序）
    pub async fn conversations(&self) -> Vec<Conversation> {
        self.store.conversations().await
    }

    pub async fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.store.conversation(conversation_id).await
    }

    /// 某会话的消息序列
    pub async fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.store.messages(conversation_id).await
    }

    /// 某会话当前正在输入的用户
    pub async fn typing_users(&self, conversation_id: &str) -> Vec<TypingStatus> {
        self.typing.typing_users(conversation_id).await
    }

    /// 当前在线用户集合
    pub async fn online_user_ids(&self) -> HashSet<String> {
        self.presence.online_user_ids().await
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        self.presence.is_online(user_id).await
    }

    /// 订阅 SDK 事件流
    pub fn subscribe(&self) -> broadcast::Receiver<SdkEvent> {
        self.event_manager.subscribe()
    }

    // ============ 会话打开/关闭 ============

    /// 打开会话视图：加入会话房间并拉取完整消息列表
    pub async fn open_conversation(&self, conversation_id: &str) -> Result<()> {
        self.channel.join_conversation(conversation_id).await?;
        self.pipeline.refresh_messages(conversation_id).await
    }

    /// 关闭会话视图：离开房间并停止本地输入状态
    pub async fn close_conversation(&self, conversation_id: &str) -> Result<()> {
        self.set_typing(conversation_id, false).await;
        self.channel.leave_conversation(conversation_id).await
    }

    // ============ 命令 ============

    /// 发送消息；发送动作同时结束本会话的输入状态
    pub async fn send_message(
        &self,
        conversation_id: &str,
        draft: MessageDraft,
    ) -> Result<Message> {
        self.set_typing(conversation_id, false).await;
        self.pipeline.send(conversation_id, draft).await
    }

    pub async fn mark_read(&self, message_id: &str) -> Result<()> {
        self.pipeline.mark_read(message_id).await
    }

    pub async fn add_reaction(&self, message_id: &str, emoji: &str) -> Result<()> {
        self.pipeline.add_reaction(message_id, emoji).await
    }

    pub async fn remove_reaction(&self, message_id: &str, emoji: &str) -> Result<()> {
        self.pipeline.remove_reaction(message_id, emoji).await
    }

    pub async fn create_conversation(
        &self,
        kind: ConversationKind,
        participant_ids: Vec<String>,
    ) -> Result<Conversation> {
        self.pipeline.create_conversation(kind, participant_ids).await
    }

    /// 重新拉取会话列表
    pub async fn refresh_conversations(&self) -> Result<()> {
        self.pipeline.refresh_conversations().await
    }

    /// 重新拉取某会话的消息（重连后闭合事件缺口）
    pub async fn refresh_messages(&self, conversation_id: &str) -> Result<()> {
        self.pipeline.refresh_messages(conversation_id).await
    }

    // ============ 输入状态 ============

    /// 上报输入状态
    ///
    /// `true`：按键信号。首次按键发出 typing_start，每次调用都重置
    /// 静默定时器，静默窗口内无后续按键则自动发出 typing_stop。
    /// `false`：立即结束输入状态。
    /// 输入帧尽力而为，未连接时静默丢弃，不视为错误。
    pub async fn set_typing(&self, conversation_id: &str, is_typing: bool) {
        if is_typing {
            if self.typing.keystroke(conversation_id).await {
                self.emit_typing_frame(conversation_id, true).await;
            }
            self.arm_typing_timer(conversation_id);
        } else {
            self.disarm_typing_timer(conversation_id);
            if self.typing.stop_local(conversation_id).await {
                self.emit_typing_frame(conversation_id, false).await;
            }
        }
    }

    async fn emit_typing_frame(&self, conversation_id: &str, start: bool) {
        let frame = if start {
            ClientFrame::TypingStart {
                conversation_id: conversation_id.to_string(),
                user_id: self.config.user_id.clone(),
                user_name: self.config.user_name.clone(),
            }
        } else {
            ClientFrame::TypingStop {
                conversation_id: conversation_id.to_string(),
                user_id: self.config.user_id.clone(),
                user_name: self.config.user_name.clone(),
            }
        };
        if let Err(e) = self.channel.emit_frame(frame).await {
            debug!("Typing frame dropped (channel not connected): {}", e);
        }
    }

    /// 重置静默自动停止定时器
    fn arm_typing_timer(&self, conversation_id: &str) {
        let mut timers = self.typing_timers.lock();
        if let Some(task) = timers.remove(conversation_id) {
            task.abort();
        }

        let typing = self.typing.clone();
        let channel = self.channel.clone();
        let user_id = self.config.user_id.clone();
        let user_name = self.config.user_name.clone();
        let conversation = conversation_id.to_string();
        let window = self.typing.silence_window();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if typing.stop_local(&conversation).await {
                let frame = ClientFrame::TypingStop {
                    conversation_id: conversation,
                    user_id,
                    user_name,
                };
                if let Err(e) = channel.emit_frame(frame).await {
                    debug!("Auto typing stop dropped: {}", e);
                }
            }
        });
        timers.insert(conversation_id.to_string(), handle);
    }

    fn disarm_typing_timer(&self, conversation_id: &str) {
        if let Some(task) = self.typing_timers.lock().remove(conversation_id) {
            task.abort();
        }
    }
}
