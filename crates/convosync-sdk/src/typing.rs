//! 输入状态协调模块
//!
//! 两侧职责：
//! - 本地：每个编辑框一个 `Idle → Typing → Idle` 状态机，
//!   首次按键发出 typing_start，静默超时后由 SDK 层自动发出 typing_stop
//! - 远端：按 user_id 维护带过期时间的输入状态表；typing_stop 或
//!   客户端侧的静默超时移除条目，即使显式停止信号丢失，
//!   "对方正在输入"指示的过期程度也有上界
//!
//! 回声抑制：本端永远不会把自己插入远端表（按身份比较）。

use crate::events::{EventManager, SdkEvent};
use crate::store::entities::TypingStatus;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

/// 输入状态配置
#[derive(Debug, Clone)]
pub struct TypingConfig {
    /// 静默窗口：超过此时长无刷新则视为停止输入（本地自动停止与远端条目过期共用）
    pub silence_window: Duration,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            silence_window: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone)]
struct RemoteEntry {
    user_name: String,
    expires_at: Instant,
}

/// 输入状态协调器
pub struct TypingCoordinator {
    /// 本端用户 ID（用于回声抑制）
    local_user_id: String,
    /// 本地处于 Typing 态的会话集合
    local_typing: Arc<RwLock<HashSet<String>>>,
    /// 会话 ID → (用户 ID → 远端输入条目)
    remote: Arc<RwLock<HashMap<String, HashMap<String, RemoteEntry>>>>,
    event_manager: Arc<EventManager>,
    config: TypingConfig,
}

impl TypingCoordinator {
    pub fn new(local_user_id: impl Into<String>, event_manager: Arc<EventManager>) -> Self {
        Self::with_config(local_user_id, event_manager, TypingConfig::default())
    }

    pub fn with_config(
        local_user_id: impl Into<String>,
        event_manager: Arc<EventManager>,
        config: TypingConfig,
    ) -> Self {
        let coordinator = Self {
            local_user_id: local_user_id.into(),
            local_typing: Arc::new(RwLock::new(HashSet::new())),
            remote: Arc::new(RwLock::new(HashMap::new())),
            event_manager,
            config,
        };
        coordinator.start_cleanup_task();
        coordinator
    }

    pub fn silence_window(&self) -> Duration {
        self.config.silence_window
    }

    // ============ 本地状态机 ============

    /// 记录一次按键；返回 true 表示发生 Idle → Typing 转移，调用方应发出 typing_start
    pub async fn keystroke(&self, conversation_id: &str) -> bool {
        let mut local = self.local_typing.write().await;
        let transitioned = local.insert(conversation_id.to_string());
        if transitioned {
            debug!("Typing started for conversation {}", conversation_id);
        }
        transitioned
    }

    /// 回到 Idle；返回 true 表示此前处于 Typing 态，调用方应发出 typing_stop
    pub async fn stop_local(&self, conversation_id: &str) -> bool {
        let mut local = self.local_typing.write().await;
        let stopped = local.remove(conversation_id);
        if stopped {
            debug!("Typing stopped for conversation {}", conversation_id);
        }
        stopped
    }

    // ============ 远端事件合并 ============

    /// 处理 typing_start 推送
    pub async fn handle_remote_start(
        &self,
        conversation_id: &str,
        user_id: &str,
        user_name: &str,
    ) {
        if user_id == self.local_user_id {
            // 自己的输入状态回声，抑制
            return;
        }

        {
            let mut remote = self.remote.write().await;
            remote
                .entry(conversation_id.to_string())
                .or_default()
                .insert(
                    user_id.to_string(),
                    RemoteEntry {
                        user_name: user_name.to_string(),
                        expires_at: Instant::now() + self.config.silence_window,
                    },
                );
        }

        self.event_manager
            .emit(SdkEvent::TypingChanged {
                conversation_id: conversation_id.to_string(),
            })
            .await;
    }

    /// 处理 typing_stop 推送
    pub async fn handle_remote_stop(&self, conversation_id: &str, user_id: &str) {
        let removed = {
            let mut remote = self.remote.write().await;
            remote
                .get_mut(conversation_id)
                .map(|users| users.remove(user_id).is_some())
                .unwrap_or(false)
        };

        if removed {
            self.event_manager
                .emit(SdkEvent::TypingChanged {
                    conversation_id: conversation_id.to_string(),
                })
                .await;
        }
    }

    /// 某会话当前正在输入的用户（已过滤过期条目）
    pub async fn typing_users(&self, conversation_id: &str) -> Vec<TypingStatus> {
        let now = Instant::now();
        let remote = self.remote.read().await;
        remote
            .get(conversation_id)
            .map(|users| {
                users
                    .iter()
                    .filter(|(_, entry)| entry.expires_at > now)
                    .map(|(user_id, entry)| TypingStatus {
                        conversation_id: conversation_id.to_string(),
                        user_id: user_id.clone(),
                        user_name: entry.user_name.clone(),
                        is_typing: true,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 断开连接时清空；输入状态是瞬态，没有活跃通道时无意义
    pub async fn clear(&self) {
        self.local_typing.write().await.clear();
        self.remote.write().await.clear();
    }

    /// 后台清理任务：周期性移除过期的远端条目
    fn start_cleanup_task(&self) {
        let remote = self.remote.clone();
        let event_manager = self.event_manager.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;

                let mut expired_conversations = Vec::new();
                {
                    let now = Instant::now();
                    let mut remote = remote.write().await;
                    for (conversation_id, users) in remote.iter_mut() {
                        let before = users.len();
                        users.retain(|_, entry| entry.expires_at > now);
                        if users.len() < before {
                            expired_conversations.push(conversation_id.clone());
                        }
                    }
                    remote.retain(|_, users| !users.is_empty());
                }

                for conversation_id in expired_conversations {
                    debug!("Auto-cleared typing entries for conversation {}", conversation_id);
                    event_manager
                        .emit(SdkEvent::TypingChanged { conversation_id })
                        .await;
                }
            }
        });
    }
}
