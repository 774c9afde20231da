//! 乐观命令管线模块
//!
//! 每条用户命令走同一条管线：用户意图 → 立即的乐观本地效果 →
//! 后端请求 → 确认（临时态换正式态）或补偿（定向回滚 + 失败通知）。
//! UI 永远不为网络往返等待。
//!
//! 回滚策略分两档：
//! - 发送消息：整段快照恢复（临时消息及最近消息指针一并撤销）
//! - 已读/表情：逆操作定向回滚，只触碰本命令修改的字段，
//!   在途期间到达的其他并发变更（如对端回执）原样保留

use crate::error::{ConvoSyncError, Result};
use crate::events::{EventManager, ReactionAction, SdkEvent};
use crate::store::entities::{
    new_local_id, Conversation, ConversationKind, Message, MessageDraft, MessageKind,
};
use crate::store::ConversationStore;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 后端命令接口（HTTP 客户端由平台层实现）
#[async_trait]
pub trait MessagingApi: Send + Sync {
    /// 拉取当前用户的全部会话
    async fn fetch_conversations(&self) -> Result<Vec<Conversation>>;

    /// 拉取某会话的完整消息列表
    async fn fetch_messages(&self, conversation_id: &str) -> Result<Vec<Message>>;

    /// 发送消息，返回服务端确认的消息（带正式 ID）
    async fn send_message(&self, conversation_id: &str, draft: &MessageDraft) -> Result<Message>;

    /// 标记消息为已读
    async fn mark_read(&self, conversation_id: &str, message_id: &str) -> Result<()>;

    /// 添加表情反馈
    async fn add_reaction(&self, message_id: &str, emoji: &str) -> Result<()>;

    /// 移除表情反馈
    async fn remove_reaction(&self, message_id: &str, emoji: &str) -> Result<()>;

    /// 创建会话
    async fn create_conversation(
        &self,
        kind: ConversationKind,
        participant_ids: &[String],
    ) -> Result<Conversation>;
}

/// 乐观命令管线
pub struct CommandPipeline {
    api: Arc<dyn MessagingApi>,
    store: Arc<ConversationStore>,
    event_manager: Arc<EventManager>,
    local_user_id: String,
}

impl CommandPipeline {
    pub fn new(
        api: Arc<dyn MessagingApi>,
        store: Arc<ConversationStore>,
        event_manager: Arc<EventManager>,
        local_user_id: impl Into<String>,
    ) -> Self {
        Self {
            api,
            store,
            event_manager,
            local_user_id: local_user_id.into(),
        }
    }

    // ============ 批量拉取 ============

    /// 重新拉取会话列表并整体替换缓存切片
    pub async fn refresh_conversations(&self) -> Result<()> {
        let conversations = self.api.fetch_conversations().await?;
        info!("Fetched {} conversations", conversations.len());
        self.store.apply_conversations(conversations).await;
        Ok(())
    }

    /// 重新拉取某会话的消息并整体替换缓存切片
    ///
    /// 重连后的事件缺口也经由本方法闭合。
    pub async fn refresh_messages(&self, conversation_id: &str) -> Result<()> {
        let messages = self.api.fetch_messages(conversation_id).await?;
        debug!(
            "Fetched {} messages for conversation {}",
            messages.len(),
            conversation_id
        );
        self.store.apply_messages(conversation_id, messages).await;
        Ok(())
    }

    // ============ 发送消息 ============

    /// 发送消息：临时消息立即入列，确认后原位替换，失败则快照回滚
    pub async fn send(&self, conversation_id: &str, draft: MessageDraft) -> Result<Message> {
        if draft.content.trim().is_empty() && draft.attachments.is_empty() {
            return Err(ConvoSyncError::InvalidArgument(
                "message content is empty and has no attachments".to_string(),
            ));
        }

        let snapshot = self.store.snapshot(conversation_id).await;

        let now = Utc::now();
        let provisional = Message {
            id: new_local_id(),
            conversation_id: conversation_id.to_string(),
            sender_id: self.local_user_id.clone(),
            content: draft.content.clone(),
            kind: draft.kind.unwrap_or(MessageKind::Text),
            reply_to_id: draft.reply_to_id.clone(),
            attachments: draft.attachments.clone(),
            reactions: vec![],
            read_receipts: vec![],
            is_read: false,
            is_edited: false,
            is_deleted: false,
            created_at: now,
            updated_at: now,
        };
        let local_id = provisional.id.clone();
        self.store.insert_provisional(provisional).await;

        match self.api.send_message(conversation_id, &draft).await {
            Ok(confirmed) => {
                debug!("Message confirmed: {} -> {}", local_id, confirmed.id);
                self.store
                    .confirm_provisional(conversation_id, &local_id, confirmed.clone())
                    .await;
                Ok(confirmed)
            }
            Err(e) => {
                warn!("Send failed for conversation {}: {}", conversation_id, e);
                self.store.restore(conversation_id, snapshot).await;
                self.notify_failure(Some(conversation_id), &e).await;
                Err(e)
            }
        }
    }

    // ============ 已读回执 ============

    /// 标记消息已读：乐观置位，失败时按捕获的前值恢复
    pub async fn mark_read(&self, message_id: &str) -> Result<()> {
        let message = self
            .store
            .get_message(message_id)
            .await
            .ok_or_else(|| ConvoSyncError::NotFound(format!("message {}", message_id)))?;
        let conversation_id = message.conversation_id.clone();

        let Some(undo) = self
            .store
            .mark_read_local(message_id, &self.local_user_id, Utc::now())
            .await
        else {
            // 已处于已读态
            return Ok(());
        };

        match self.api.mark_read(&conversation_id, message_id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Mark read failed for message {}: {}", message_id, e);
                self.store
                    .undo_mark_read(message_id, &self.local_user_id, undo)
                    .await;
                self.notify_failure(Some(&conversation_id), &e).await;
                Err(e)
            }
        }
    }

    // ============ 表情反馈 ============

    /// 添加表情反馈：乐观插入，失败时移除（定向回滚）
    pub async fn add_reaction(&self, message_id: &str, emoji: &str) -> Result<()> {
        let message = self
            .store
            .get_message(message_id)
            .await
            .ok_or_else(|| ConvoSyncError::NotFound(format!("message {}", message_id)))?;
        if message.has_reaction(&self.local_user_id, emoji) {
            return Ok(());
        }
        let conversation_id = message.conversation_id.clone();

        self.store
            .apply_reaction(message_id, &self.local_user_id, emoji, ReactionAction::Add)
            .await;

        match self.api.add_reaction(message_id, emoji).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Add reaction failed for message {}: {}", message_id, e);
                self.store
                    .apply_reaction(message_id, &self.local_user_id, emoji, ReactionAction::Remove)
                    .await;
                self.notify_failure(Some(&conversation_id), &e).await;
                Err(e)
            }
        }
    }

    /// 移除表情反馈：乐观移除，失败时原样放回捕获的原条目（定向回滚）
    pub async fn remove_reaction(&self, message_id: &str, emoji: &str) -> Result<()> {
        let message = self
            .store
            .get_message(message_id)
            .await
            .ok_or_else(|| ConvoSyncError::NotFound(format!("message {}", message_id)))?;
        // 捕获现有条目，回滚时保留原 created_at
        let Some(prior) = message
            .reactions
            .iter()
            .find(|r| r.user_id == self.local_user_id && r.emoji == emoji)
            .cloned()
        else {
            return Ok(());
        };
        let conversation_id = message.conversation_id.clone();

        self.store
            .apply_reaction(message_id, &self.local_user_id, emoji, ReactionAction::Remove)
            .await;

        match self.api.remove_reaction(message_id, emoji).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Remove reaction failed for message {}: {}", message_id, e);
                self.store.reinstate_reaction(prior).await;
                self.notify_failure(Some(&conversation_id), &e).await;
                Err(e)
            }
        }
    }

    // ============ 会话创建 ============

    /// 创建会话；无乐观阶段，成功后并入缓存
    pub async fn create_conversation(
        &self,
        kind: ConversationKind,
        participant_ids: Vec<String>,
    ) -> Result<Conversation> {
        if participant_ids.is_empty() {
            return Err(ConvoSyncError::InvalidArgument(
                "participant list is empty".to_string(),
            ));
        }

        let conversation = self.api.create_conversation(kind, &participant_ids).await?;
        info!("Conversation created: {}", conversation.id);
        self.store.upsert_conversation(conversation.clone()).await;
        Ok(conversation)
    }

    async fn notify_failure(&self, conversation_id: Option<&str>, error: &ConvoSyncError) {
        self.event_manager
            .emit(SdkEvent::CommandFailed {
                conversation_id: conversation_id.map(|id| id.to_string()),
                detail: error.to_string(),
            })
            .await;
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockApi;
    use super::*;
    use crate::store::entities::{is_local_id, ConversationKind};
    use chrono::TimeZone;

    fn conversation(id: &str) -> Conversation {
        Conversation {
            id: id.to_string(),
            kind: ConversationKind::Direct,
            participant_ids: vec!["me".into(), "u2".into()],
            last_message: None,
        }
    }

    fn incoming_message(id: &str, conversation_id: &str) -> Message {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        Message {
            id: id.to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: "u2".to_string(),
            content: "hi".to_string(),
            kind: MessageKind::Text,
            reply_to_id: None,
            attachments: vec![],
            reactions: vec![],
            read_receipts: vec![],
            is_read: false,
            is_edited: false,
            is_deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    async fn pipeline_with_message() -> (Arc<MockApi>, Arc<ConversationStore>, Arc<CommandPipeline>)
    {
        let api = Arc::new(MockApi::new("me"));
        let event_manager = Arc::new(EventManager::new(64));
        let store = Arc::new(ConversationStore::new(event_manager.clone()));
        store.apply_conversations(vec![conversation("c1")]).await;
        store
            .apply_messages("c1", vec![incoming_message("m1", "c1")])
            .await;
        let pipeline = Arc::new(CommandPipeline::new(
            api.clone(),
            store.clone(),
            event_manager,
            "me",
        ));
        (api, store, pipeline)
    }

    #[tokio::test]
    async fn test_send_success_confirms_provisional() {
        let (api, store, pipeline) = pipeline_with_message().await;

        let confirmed = pipeline.send("c1", MessageDraft::text("hello")).await.unwrap();
        assert!(!is_local_id(&confirmed.id));

        let messages = store.messages("c1").await;
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| !m.is_provisional()));

        // 最近消息指针跟随确认后的消息
        let last = store.conversation("c1").await.unwrap().last_message.unwrap();
        assert_eq!(last.id, confirmed.id);
        assert_eq!(api.state.lock().sent.len(), 1);
    }

    #[tokio::test]
    async fn test_send_failure_restores_cache_exactly() {
        let (api, store, pipeline) = pipeline_with_message().await;
        api.fail_next_sends(1);

        let before_messages = store.messages("c1").await;
        let before_conversation = store.conversation("c1").await.unwrap();

        let result = pipeline.send("c1", MessageDraft::text("doomed")).await;
        assert!(matches!(result, Err(ConvoSyncError::Command(_))));

        // 缓存恢复到发送前的逐字段相同状态
        assert_eq!(store.messages("c1").await, before_messages);
        assert_eq!(store.conversation("c1").await.unwrap(), before_conversation);
    }

    #[tokio::test]
    async fn test_send_failure_emits_command_failed() {
        let api = Arc::new(MockApi::new("me"));
        let event_manager = Arc::new(EventManager::new(64));
        let store = Arc::new(ConversationStore::new(event_manager.clone()));
        store.apply_conversations(vec![conversation("c1")]).await;
        let pipeline = CommandPipeline::new(api.clone(), store, event_manager.clone(), "me");
        api.fail_next_sends(1);

        let mut rx = event_manager.subscribe();
        let _ = pipeline.send("c1", MessageDraft::text("doomed")).await;

        let mut saw_failure = false;
        while let Ok(event) = rx.try_recv() {
            if let SdkEvent::CommandFailed { conversation_id, .. } = event {
                assert_eq!(conversation_id.as_deref(), Some("c1"));
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn test_send_rejects_empty_draft() {
        let (_api, store, pipeline) = pipeline_with_message().await;

        let result = pipeline.send("c1", MessageDraft::text("   ")).await;
        assert!(matches!(result, Err(ConvoSyncError::InvalidArgument(_))));
        assert_eq!(store.messages("c1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_mark_read_applies_optimistically() {
        let (_api, store, pipeline) = pipeline_with_message().await;

        pipeline.mark_read("m1").await.unwrap();

        let message = store.get_message("m1").await.unwrap();
        assert!(message.is_read);
        assert_eq!(message.read_receipts.len(), 1);
        assert_eq!(message.read_receipts[0].user_id, "me");

        // 已处于已读态的重复标记为无操作
        pipeline.mark_read("m1").await.unwrap();
        assert_eq!(store.get_message("m1").await.unwrap().read_receipts.len(), 1);
    }

    #[tokio::test]
    async fn test_mark_read_failure_rolls_back() {
        let (api, store, pipeline) = pipeline_with_message().await;
        api.fail_next_mark_read(1);

        let result = pipeline.mark_read("m1").await;
        assert!(result.is_err());

        let message = store.get_message("m1").await.unwrap();
        assert!(!message.is_read);
        assert!(message.read_receipts.is_empty());
    }

    #[tokio::test]
    async fn test_mark_read_rollback_keeps_prior_read_flag() {
        let (api, store, pipeline) = pipeline_with_message().await;
        // 批量拉取可能给出 is_read 已置位但没有本端回执的消息
        let mut seeded = incoming_message("m2", "c1");
        seeded.is_read = true;
        store
            .apply_messages("c1", vec![incoming_message("m1", "c1"), seeded])
            .await;
        api.fail_next_mark_read(1);

        assert!(pipeline.mark_read("m2").await.is_err());

        // 回滚恢复前值，不得把已读退回未读
        let message = store.get_message("m2").await.unwrap();
        assert!(message.is_read);
        assert!(message.read_receipts.is_empty());
    }

    #[tokio::test]
    async fn test_mark_read_rollback_restores_server_receipt() {
        let (api, store, pipeline) = pipeline_with_message().await;
        let server_read_at = Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();
        store.apply_read_receipt("m1", "me", server_read_at).await;
        api.fail_next_mark_read(1);

        assert!(pipeline.mark_read("m1").await.is_err());

        // 服务端下发的回执原样恢复，readAt 不被本地时间覆盖
        let message = store.get_message("m1").await.unwrap();
        assert!(!message.is_read);
        assert_eq!(message.read_receipts.len(), 1);
        assert_eq!(message.read_receipts[0].read_at, server_read_at);
    }

    #[tokio::test]
    async fn test_reaction_roundtrip() {
        let (_api, store, pipeline) = pipeline_with_message().await;

        pipeline.add_reaction("m1", "👍").await.unwrap();
        assert!(store.get_message("m1").await.unwrap().has_reaction("me", "👍"));

        // 重复添加为无操作
        pipeline.add_reaction("m1", "👍").await.unwrap();
        assert_eq!(store.get_message("m1").await.unwrap().reactions.len(), 1);

        pipeline.remove_reaction("m1", "👍").await.unwrap();
        assert!(store.get_message("m1").await.unwrap().reactions.is_empty());
    }

    #[tokio::test]
    async fn test_reaction_rollback_preserves_concurrent_receipt() {
        let (api, store, pipeline) = pipeline_with_message().await;
        let gate = api.gate_next_reaction();
        api.fail_next_reactions(1);

        let task = tokio::spawn({
            let pipeline = pipeline.clone();
            async move { pipeline.add_reaction("m1", "👍").await }
        });
        tokio::task::yield_now().await;

        // 乐观效果已可见
        assert!(store.get_message("m1").await.unwrap().has_reaction("me", "👍"));

        // 命令在途期间对端回执经推送到达
        let read_at = Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap();
        store.apply_read_receipt("m1", "u2", read_at).await;

        gate.send(()).unwrap();
        assert!(task.await.unwrap().is_err());

        // 表情被定向回滚，并发到达的回执保留
        let message = store.get_message("m1").await.unwrap();
        assert!(!message.has_reaction("me", "👍"));
        assert_eq!(message.read_receipts.len(), 1);
        assert_eq!(message.read_receipts[0].user_id, "u2");
    }

    #[tokio::test]
    async fn test_remove_reaction_rollback_keeps_original_timestamp() {
        let (api, store, pipeline) = pipeline_with_message().await;
        pipeline.add_reaction("m1", "👍").await.unwrap();
        let original = store.get_message("m1").await.unwrap().reactions[0].clone();
        api.fail_next_reactions(1);

        assert!(pipeline.remove_reaction("m1", "👍").await.is_err());

        // 回滚放回捕获的原条目，created_at 不变
        let message = store.get_message("m1").await.unwrap();
        assert_eq!(message.reactions.len(), 1);
        assert_eq!(message.reactions[0], original);
    }

    #[tokio::test]
    async fn test_refresh_replaces_cache_slices() {
        let (api, store, pipeline) = pipeline_with_message().await;
        {
            let mut state = api.state.lock();
            state.conversations = vec![conversation("c1"), conversation("c9")];
            state.messages.insert(
                "c1".to_string(),
                vec![incoming_message("m1", "c1"), incoming_message("m2", "c1")],
            );
        }

        pipeline.refresh_conversations().await.unwrap();
        pipeline.refresh_messages("c1").await.unwrap();

        assert_eq!(store.conversations().await.len(), 2);
        assert_eq!(store.messages("c1").await.len(), 2);
    }

    #[tokio::test]
    async fn test_create_conversation_enters_cache() {
        let (_api, store, pipeline) = pipeline_with_message().await;

        let created = pipeline
            .create_conversation(ConversationKind::Group, vec!["me".into(), "u2".into(), "u3".into()])
            .await
            .unwrap();

        assert!(store.conversation(&created.id).await.is_some());
        assert!(pipeline
            .create_conversation(ConversationKind::Group, vec![])
            .await
            .is_err());
    }
}
