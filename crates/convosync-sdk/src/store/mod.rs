//! 会话缓存模块
//!
//! UI 渲染的唯一事实来源。缓存被三个独立乱序的输入源修改：
//! 1. 初始批量拉取（整体替换对应切片）
//! 2. 乐观本地命令（临时消息插入 / 字段预变更）
//! 3. 推送事件（服务端确认与对端产生的变更）
//!
//! 不变量：永不出现重复、孤儿或乱序消息；合并操作全部幂等。
//! 单一持有的 store 对象 + 显式修改方法，消费方持 Arc 引用，无全局单例。

pub mod entities;

use crate::events::{EventManager, ReactionAction, SdkEvent};
use chrono::{DateTime, Utc};
use entities::{Conversation, Message, Reaction, ReadReceipt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// 回滚快照（发送开始前的会话状态）
#[derive(Debug, Clone)]
pub struct ConversationSnapshot {
    messages: Vec<Message>,
    last_message: Option<Message>,
}

/// 已读标记的前值快照，命令失败时按原值恢复
///
/// 批量拉取可能给出 is_read 已置位但没有本端回执的消息；
/// 回滚必须恢复捕获的前值，而不是一律清零。
#[derive(Debug, Clone)]
pub struct ReadMarkUndo {
    was_read: bool,
    prior_receipt: Option<ReadReceipt>,
}

/// `append_server_message` 的合并结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// 直接追加
    Appended,
    /// 与同发送者同内容的待确认临时消息完成和解（原位替换）
    ReconciledProvisional,
    /// 该 ID 已存在，丢弃（发送者自己的回声推送）
    Duplicate,
}

#[derive(Default)]
struct StoreInner {
    conversations: HashMap<String, Conversation>,
    /// 会话 ID → 有序消息列表（会话持有自己的消息序列）
    messages: HashMap<String, Vec<Message>>,
}

impl StoreInner {
    fn find_message_mut(&mut self, message_id: &str) -> Option<&mut Message> {
        self.messages
            .values_mut()
            .flat_map(|list| list.iter_mut())
            .find(|m| m.id == message_id)
    }

    /// O(1) 最近消息指针更新（只触碰受影响的会话，不重建列表）
    fn bump_last_message(&mut self, message: &Message) {
        if let Some(conversation) = self.conversations.get_mut(&message.conversation_id) {
            conversation.last_message = Some(message.clone());
        }
    }

    /// 最近消息指针若指向该消息，同步其新内容
    fn refresh_last_message(&mut self, message: &Message) {
        if let Some(conversation) = self.conversations.get_mut(&message.conversation_id) {
            if conversation
                .last_message
                .as_ref()
                .map(|m| m.id == message.id)
                .unwrap_or(false)
            {
                conversation.last_message = Some(message.clone());
            }
        }
    }
}

/// 会话缓存
pub struct ConversationStore {
    inner: RwLock<StoreInner>,
    event_manager: Arc<EventManager>,
}

impl ConversationStore {
    pub fn new(event_manager: Arc<EventManager>) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            event_manager,
        }
    }

    // ============ 批量拉取（基线） ============

    /// 整体替换会话列表；仅用于初始加载或显式重新拉取
    pub async fn apply_conversations(&self, conversations: Vec<Conversation>) {
        {
            let mut inner = self.inner.write().await;
            inner.conversations = conversations.into_iter().map(|c| (c.id.clone(), c)).collect();
        }
        self.event_manager.emit(SdkEvent::ConversationListChanged).await;
    }

    /// 整体替换某会话的消息列表；仅用于初始加载或显式重新拉取
    ///
    /// 重连造成的事件缺口也由本方法解决（接受的过期窗口）。
    pub async fn apply_messages(&self, conversation_id: &str, messages: Vec<Message>) {
        {
            let mut inner = self.inner.write().await;
            inner
                .messages
                .insert(conversation_id.to_string(), messages);
        }
        self.event_manager
            .emit(SdkEvent::MessagesReloaded {
                conversation_id: conversation_id.to_string(),
            })
            .await;
    }

    /// 插入或更新单个会话（"创建会话"命令的结果）
    pub async fn upsert_conversation(&self, conversation: Conversation) {
        {
            let mut inner = self.inner.write().await;
            inner
                .conversations
                .insert(conversation.id.clone(), conversation);
        }
        self.event_manager.emit(SdkEvent::ConversationListChanged).await;
    }

    // ============ 读取 ============

    /// 会话列表（按最近消息时间降序；无消息的会话排在最后）
    pub async fn conversations(&self) -> Vec<Conversation> {
        let inner = self.inner.read().await;
        let mut list: Vec<Conversation> = inner.conversations.values().cloned().collect();
        list.sort_by(|a, b| b.recency().cmp(&a.recency()));
        list
    }

    pub async fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        let inner = self.inner.read().await;
        inner.conversations.get(conversation_id).cloned()
    }

    /// 某会话的消息序列（到达顺序）
    pub async fn messages(&self, conversation_id: &str) -> Vec<Message> {
        let inner = self.inner.read().await;
        inner
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn get_message(&self, message_id: &str) -> Option<Message> {
        let inner = self.inner.read().await;
        inner
            .messages
            .values()
            .flat_map(|list| list.iter())
            .find(|m| m.id == message_id)
            .cloned()
    }

    // ============ 乐观写入支撑 ============

    /// 发送开始前抓取快照，失败时 `restore` 恢复到字节相同的状态
    pub async fn snapshot(&self, conversation_id: &str) -> ConversationSnapshot {
        let inner = self.inner.read().await;
        ConversationSnapshot {
            messages: inner
                .messages
                .get(conversation_id)
                .cloned()
                .unwrap_or_default(),
            last_message: inner
                .conversations
                .get(conversation_id)
                .and_then(|c| c.last_message.clone()),
        }
    }

    /// 回滚到快照（补偿操作）
    pub async fn restore(&self, conversation_id: &str, snapshot: ConversationSnapshot) {
        {
            let mut inner = self.inner.write().await;
            inner
                .messages
                .insert(conversation_id.to_string(), snapshot.messages);
            if let Some(conversation) = inner.conversations.get_mut(conversation_id) {
                conversation.last_message = snapshot.last_message;
            }
        }
        self.event_manager
            .emit(SdkEvent::MessagesReloaded {
                conversation_id: conversation_id.to_string(),
            })
            .await;
        self.event_manager.emit(SdkEvent::ConversationListChanged).await;
    }

    /// 同步插入临时消息并更新会话最近消息指针
    ///
    /// 不变量：每个 (conversation, local_id) 同一时刻至多一条待确认临时消息。
    pub async fn insert_provisional(&self, message: Message) {
        debug_assert!(message.is_provisional());
        {
            let mut inner = self.inner.write().await;
            inner.bump_last_message(&message);
            inner
                .messages
                .entry(message.conversation_id.clone())
                .or_default()
                .push(message);
        }
        self.event_manager.emit(SdkEvent::ConversationListChanged).await;
    }

    /// 将临时消息替换为服务端确认的消息（命令成功回调路径）
    ///
    /// 推送回声可能先一步完成和解：此时临时条目已不存在、确认 ID 已在场，
    /// 本方法必须容忍并按无操作处理，不是错误。
    pub async fn confirm_provisional(
        &self,
        conversation_id: &str,
        local_id: &str,
        confirmed: Message,
    ) {
        let event = {
            let mut inner = self.inner.write().await;
            let list = inner.messages.entry(conversation_id.to_string()).or_default();

            if let Some(pos) = list.iter().position(|m| m.id == local_id) {
                list[pos] = confirmed.clone();
                inner.bump_last_message(&confirmed);
                Some(SdkEvent::MessageReceived { message: confirmed })
            } else if list.iter().any(|m| m.id == confirmed.id) {
                // 回声先到，已和解
                debug!(
                    "Provisional {} already reconciled by push echo as {}",
                    local_id, confirmed.id
                );
                None
            } else {
                // 临时条目因回滚等原因消失：追加确认消息，不产生重复
                list.push(confirmed.clone());
                inner.bump_last_message(&confirmed);
                Some(SdkEvent::MessageReceived { message: confirmed })
            }
        };

        if let Some(event) = event {
            self.event_manager.emit(event).await;
            self.event_manager.emit(SdkEvent::ConversationListChanged).await;
        }
    }

    /// 乐观已读标记：置位 is_read 并写入本端回执
    ///
    /// 定向操作，只触碰已读相关字段，其他字段上的并发变更不受影响。
    /// 返回前值快照供失败回滚；已处于已读态（标志位与本端回执均在）
    /// 则为无操作，返回 None。
    pub async fn mark_read_local(
        &self,
        message_id: &str,
        user_id: &str,
        read_at: DateTime<Utc>,
    ) -> Option<ReadMarkUndo> {
        let (conversation_id, undo) = {
            let mut inner = self.inner.write().await;
            let message = inner.find_message_mut(message_id)?;

            let prior_receipt = message.read_receipt_of(user_id).cloned();
            if message.is_read && prior_receipt.is_some() {
                return None;
            }
            let undo = ReadMarkUndo {
                was_read: message.is_read,
                prior_receipt,
            };

            message.is_read = true;
            message.read_receipts.retain(|r| r.user_id != user_id);
            message.read_receipts.push(ReadReceipt {
                message_id: message_id.to_string(),
                user_id: user_id.to_string(),
                read_at,
            });
            (message.conversation_id.clone(), undo)
        };

        self.event_manager
            .emit(SdkEvent::MessageChanged {
                conversation_id,
                message_id: message_id.to_string(),
            })
            .await;
        Some(undo)
    }

    /// 按 `mark_read_local` 返回的前值快照精确恢复（命令失败的定向回滚）
    pub async fn undo_mark_read(&self, message_id: &str, user_id: &str, undo: ReadMarkUndo) {
        let conversation_id = {
            let mut inner = self.inner.write().await;
            let Some(message) = inner.find_message_mut(message_id) else {
                return;
            };

            message.is_read = undo.was_read;
            message.read_receipts.retain(|r| r.user_id != user_id);
            if let Some(receipt) = undo.prior_receipt {
                message.read_receipts.push(receipt);
            }
            message.conversation_id.clone()
        };

        self.event_manager
            .emit(SdkEvent::MessageChanged {
                conversation_id,
                message_id: message_id.to_string(),
            })
            .await;
    }

    /// 原样放回一条表情反馈，保留原 created_at（移除命令失败的定向回滚）
    pub async fn reinstate_reaction(&self, reaction: Reaction) {
        let message_id = reaction.message_id.clone();
        let conversation_id = {
            let mut inner = self.inner.write().await;
            let Some(message) = inner.find_message_mut(&message_id) else {
                return;
            };

            message
                .reactions
                .retain(|r| !(r.user_id == reaction.user_id && r.emoji == reaction.emoji));
            message.reactions.push(reaction);
            message.conversation_id.clone()
        };

        self.event_manager
            .emit(SdkEvent::MessageChanged {
                conversation_id,
                message_id,
            })
            .await;
    }

    // ============ 推送事件合并 ============

    /// 合并服务端推送的新消息
    ///
    /// 若目标会话中存在同发送者同内容的待确认临时消息，原位替换（和解），
    /// 防止发送者自己的回声推送在乐观占位旁产生重复；否则按 ID 去重后追加。
    pub async fn append_server_message(&self, message: Message) -> AppendOutcome {
        let outcome = {
            let mut inner = self.inner.write().await;
            let list = inner
                .messages
                .entry(message.conversation_id.clone())
                .or_default();

            if list.iter().any(|m| m.id == message.id) {
                debug!("Message {} already exists, skipping", message.id);
                AppendOutcome::Duplicate
            } else if let Some(pos) = list.iter().position(|m| {
                m.is_provisional()
                    && m.sender_id == message.sender_id
                    && m.content == message.content
            }) {
                list[pos] = message.clone();
                inner.bump_last_message(&message);
                AppendOutcome::ReconciledProvisional
            } else {
                list.push(message.clone());
                inner.bump_last_message(&message);
                AppendOutcome::Appended
            }
        };

        if outcome != AppendOutcome::Duplicate {
            self.event_manager
                .emit(SdkEvent::MessageReceived { message })
                .await;
            self.event_manager.emit(SdkEvent::ConversationListChanged).await;
        }
        outcome
    }

    /// 按 ID 整体替换消息（编辑/删除推送）
    ///
    /// 未知 ID 无操作：消息尚未加载到本地属可接受的过期，下次拉取解决。
    pub async fn apply_update(&self, message: Message) {
        let applied = {
            let mut inner = self.inner.write().await;
            let replaced = inner
                .messages
                .get_mut(&message.conversation_id)
                .and_then(|list| list.iter_mut().find(|m| m.id == message.id))
                .map(|slot| *slot = message.clone())
                .is_some();
            if replaced {
                inner.refresh_last_message(&message);
            }
            replaced
        };

        if applied {
            self.event_manager
                .emit(SdkEvent::MessageChanged {
                    conversation_id: message.conversation_id.clone(),
                    message_id: message.id.clone(),
                })
                .await;
        } else {
            debug!("Update for unknown message {}, ignoring", message.id);
        }
    }

    /// 合并已读回执；同一用户只接受更晚的 read_at（单调性）
    ///
    /// 返回是否实际应用。
    pub async fn apply_read_receipt(
        &self,
        message_id: &str,
        user_id: &str,
        read_at: DateTime<Utc>,
    ) -> bool {
        let result = {
            let mut inner = self.inner.write().await;
            let Some(message) = inner.find_message_mut(message_id) else {
                debug!("Read receipt for unknown message {}, ignoring", message_id);
                return false;
            };

            if let Some(existing) = message.read_receipt_of(user_id) {
                if existing.read_at >= read_at {
                    return false;
                }
            }

            message.read_receipts.retain(|r| r.user_id != user_id);
            message.read_receipts.push(ReadReceipt {
                message_id: message_id.to_string(),
                user_id: user_id.to_string(),
                read_at,
            });
            Some(message.conversation_id.clone())
        };

        if let Some(conversation_id) = result {
            self.event_manager
                .emit(SdkEvent::MessageChanged {
                    conversation_id,
                    message_id: message_id.to_string(),
                })
                .await;
            true
        } else {
            false
        }
    }

    /// 合并表情反馈；按 (message_id, user_id, emoji) 三元组幂等
    ///
    /// add 先移除同三元组旧项再插入，remove 直接过滤；
    /// 同一事件应用两次得到相同状态。返回是否实际改变。
    pub async fn apply_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
        action: ReactionAction,
    ) -> bool {
        let result = {
            let mut inner = self.inner.write().await;
            let Some(message) = inner.find_message_mut(message_id) else {
                debug!("Reaction for unknown message {}, ignoring", message_id);
                return false;
            };

            let had = message.has_reaction(user_id, emoji);
            match action {
                ReactionAction::Add => {
                    message
                        .reactions
                        .retain(|r| !(r.user_id == user_id && r.emoji == emoji));
                    message.reactions.push(Reaction {
                        message_id: message_id.to_string(),
                        user_id: user_id.to_string(),
                        emoji: emoji.to_string(),
                        created_at: Utc::now(),
                    });
                    if had {
                        None
                    } else {
                        Some(message.conversation_id.clone())
                    }
                }
                ReactionAction::Remove => {
                    message
                        .reactions
                        .retain(|r| !(r.user_id == user_id && r.emoji == emoji));
                    if had {
                        Some(message.conversation_id.clone())
                    } else {
                        None
                    }
                }
            }
        };

        if let Some(conversation_id) = result {
            self.event_manager
                .emit(SdkEvent::MessageChanged {
                    conversation_id,
                    message_id: message_id.to_string(),
                })
                .await;
            true
        } else {
            false
        }
    }
}
