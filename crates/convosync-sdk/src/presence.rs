//! 在线状态追踪模块
//!
//! 单调集合：`user_online` 插入，`user_offline` 移除。
//! 不设本地定时器——在线状态以服务端断言为准，不做本地推断，
//! 避免通道暂时变慢时误报"离线"闪烁。

use crate::events::{EventManager, SdkEvent};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

pub struct PresenceTracker {
    online: Arc<RwLock<HashSet<String>>>,
    event_manager: Arc<EventManager>,
}

impl PresenceTracker {
    pub fn new(event_manager: Arc<EventManager>) -> Self {
        Self {
            online: Arc::new(RwLock::new(HashSet::new())),
            event_manager,
        }
    }

    /// 处理 user_online 推送
    pub async fn set_online(&self, user_id: &str) {
        let inserted = {
            let mut online = self.online.write().await;
            online.insert(user_id.to_string())
        };
        if inserted {
            debug!("User {} is online", user_id);
            self.event_manager
                .emit(SdkEvent::PresenceChanged {
                    user_id: user_id.to_string(),
                    is_online: true,
                })
                .await;
        }
    }

    /// 处理 user_offline 推送
    pub async fn set_offline(&self, user_id: &str) {
        let removed = {
            let mut online = self.online.write().await;
            online.remove(user_id)
        };
        if removed {
            debug!("User {} is offline", user_id);
            self.event_manager
                .emit(SdkEvent::PresenceChanged {
                    user_id: user_id.to_string(),
                    is_online: false,
                })
                .await;
        }
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        self.online.read().await.contains(user_id)
    }

    /// 当前在线用户 ID 集合
    pub async fn online_user_ids(&self) -> HashSet<String> {
        self.online.read().await.clone()
    }

    /// 断开连接时清空；没有活跃通道时在线集合没有意义
    pub async fn clear(&self) {
        self.online.write().await.clear();
    }
}
