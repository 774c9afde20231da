//! 推送通道管理模块
//!
//! 每个客户端会话恰好持有一条经过认证的推送连接，其生命周期
//! （握手、房间订阅、指数退避重连）全部由本模块独占管理。
//!
//! 重连逻辑建模为显式状态机（Disconnected/Connecting/Connected/
//! Reconnecting/Failed）+ 纯转移函数，与具体异步原语无关。
//! 失败语义：服务端或传输层引发的断开触发重连；客户端主动断开不触发。
//! 连接错误通过 `ChannelState.error` 暴露给观察者渲染，而非抛出。

use crate::error::{ConvoSyncError, Result};
use crate::events::{ChannelStatus, ClientFrame, EventManager, SdkEvent, ServerFrame};
use crate::presence::PresenceTracker;
use crate::store::ConversationStore;
use crate::transport::{conversation_room, user_room, EventTransport, TransportEvent};
use crate::typing::TypingCoordinator;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 重连退避策略
///
/// 第 attempt 次重试的延迟 = base × 2^(attempt−1)；
/// 超过 max_attempts 后不再自动重试，状态进入 Failed，
/// 只有手动 connect 会重置计数并恢复。
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// 第 attempt（从 1 起）次重试前的等待时长；超出上限返回 None
    ///
    /// 饱和运算：极大的 attempt 上限得到封顶延迟而不是溢出
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        Some(self.base_delay.saturating_mul(factor))
    }
}

/// 状态机输入
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelInput {
    ConnectRequested,
    ConnectSucceeded,
    RetryScheduled,
    RetriesExhausted,
    DisconnectRequested,
}

/// 纯转移函数
///
/// 幂等保护内建于转移表：已连接时的 ConnectRequested 保持 Connected；
/// 客户端主动断开（Disconnected）后的 RetryScheduled 不生效。
pub fn transition(status: ChannelStatus, input: ChannelInput) -> ChannelStatus {
    use ChannelInput::*;
    use ChannelStatus::*;

    match (status, input) {
        (Connected, ConnectRequested) => Connected,
        (_, ConnectRequested) => Connecting,
        (_, ConnectSucceeded) => Connected,
        (Disconnected, RetryScheduled) => Disconnected,
        (_, RetryScheduled) => Reconnecting,
        (_, RetriesExhausted) => Failed,
        (_, DisconnectRequested) => Disconnected,
    }
}

/// 连接状态快照（供观察者读取；会话缓存只观察，从不修改）
#[derive(Debug, Clone)]
pub struct ChannelState {
    pub status: ChannelStatus,
    pub last_connected_at: Option<DateTime<Utc>>,
    /// 最近一次传输错误原因（渲染用，不抛出）
    pub error: Option<String>,
    /// 当前重连尝试序号
    pub attempt: u32,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            status: ChannelStatus::Disconnected,
            last_connected_at: None,
            error: None,
            attempt: 0,
        }
    }
}

/// 推送通道管理器
pub struct ChannelManager {
    transport: Arc<dyn EventTransport>,
    store: Arc<ConversationStore>,
    typing: Arc<TypingCoordinator>,
    presence: Arc<PresenceTracker>,
    event_manager: Arc<EventManager>,
    policy: ReconnectPolicy,
    local_user_id: String,

    state: RwLock<ChannelState>,
    credential: RwLock<Option<String>>,
    /// 当前关心的会话房间；重连成功后全部重新加入
    open_conversations: RwLock<HashSet<String>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelManager {
    pub fn new(
        transport: Arc<dyn EventTransport>,
        store: Arc<ConversationStore>,
        typing: Arc<TypingCoordinator>,
        presence: Arc<PresenceTracker>,
        event_manager: Arc<EventManager>,
        policy: ReconnectPolicy,
        local_user_id: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            store,
            typing,
            presence,
            event_manager,
            policy,
            local_user_id: local_user_id.into(),
            state: RwLock::new(ChannelState::default()),
            credential: RwLock::new(None),
            open_conversations: RwLock::new(HashSet::new()),
            reconnect_task: Mutex::new(None),
            dispatch_task: Mutex::new(None),
        }
    }

    /// 当前连接状态快照
    pub fn state(&self) -> ChannelState {
        self.state.read().clone()
    }

    pub fn status(&self) -> ChannelStatus {
        self.state.read().status
    }

    // ============ 生命周期 ============

    /// 建立连接；幂等——已连接时无操作
    ///
    /// 手动调用会重置重试计数。传输错误不抛出，
    /// 而是静默进入重连退避，经由状态供观察者渲染。
    pub async fn connect(self: &Arc<Self>, credential: &str) -> Result<()> {
        *self.credential.write() = Some(credential.to_string());
        self.state.write().attempt = 0;
        self.try_connect().await
    }

    /// 拆除连接并清空瞬态状态（输入状态表、在线集合）
    ///
    /// 会话缓存保留——消息历史跨重连仍然有效。
    /// 随时可安全调用，包括尚未建立连接时；之后不会自动重连。
    pub async fn disconnect(&self) {
        self.cancel_reconnect();
        // 先置 Disconnected，分发任务据此识别这是客户端主动断开
        self.apply(ChannelInput::DisconnectRequested, None).await;
        {
            let mut state = self.state.write();
            state.attempt = 0;
            state.error = None;
        }

        if let Some(task) = self.dispatch_task.lock().take() {
            task.abort();
        }
        self.transport.disconnect().await;

        self.typing.clear().await;
        self.presence.clear().await;
        info!("Event channel disconnected");
    }

    async fn try_connect(self: &Arc<Self>) -> Result<()> {
        if self.status() == ChannelStatus::Connected {
            debug!("Already connected, ignoring connect request");
            return Ok(());
        }
        self.cancel_reconnect();

        let credential = self
            .credential
            .read()
            .clone()
            .ok_or(ConvoSyncError::NotConnected)?;

        self.apply(ChannelInput::ConnectRequested, None).await;

        match self.transport.connect(&credential).await {
            Ok(receiver) => {
                {
                    let mut state = self.state.write();
                    state.attempt = 0;
                    state.error = None;
                    state.last_connected_at = Some(Utc::now());
                }
                self.apply(ChannelInput::ConnectSucceeded, None).await;
                self.rejoin_rooms().await;
                self.spawn_dispatch(receiver);
                info!("✅ Event channel connected");
                Ok(())
            }
            Err(e) => {
                warn!("Event channel connect failed: {}", e);
                self.schedule_reconnect(e.to_string()).await;
                Ok(())
            }
        }
    }

    /// 指数退避重连调度
    async fn schedule_reconnect(self: &Arc<Self>, error: String) {
        let attempt = {
            let mut state = self.state.write();
            state.attempt += 1;
            state.attempt
        };

        match self.policy.delay_for(attempt) {
            Some(delay) => {
                self.apply(ChannelInput::RetryScheduled, Some(error)).await;
                if self.status() != ChannelStatus::Reconnecting {
                    // 客户端在此期间主动断开，放弃重连
                    return;
                }
                info!("Reconnect attempt #{} in {:?}", attempt, delay);

                let manager = self.clone();
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    // 先清空自己的句柄槽：try_connect 内的 cancel_reconnect
                    // 不得中止正在运行的本任务
                    manager.reconnect_task.lock().take();
                    if manager.status() != ChannelStatus::Reconnecting {
                        return;
                    }
                    let _ = manager.try_connect_boxed().await;
                });
                *self.reconnect_task.lock() = Some(handle);
            }
            None => {
                warn!(
                    "Reconnect attempts exhausted after {} tries, giving up (last error: {})",
                    self.policy.max_attempts, error
                );
                let exhausted = ConvoSyncError::ReconnectExhausted(self.policy.max_attempts);
                self.apply(ChannelInput::RetriesExhausted, Some(exhausted.to_string()))
                    .await;
            }
        }
    }

    /// `try_connect` 的装箱形式；重连任务经此调用，打断递归 future 类型
    fn try_connect_boxed(self: Arc<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
        Box::pin(async move { self.try_connect().await })
    }

    /// 取消待触发的重连定时器（手动 connect/disconnect 时调用）
    fn cancel_reconnect(&self) {
        if let Some(task) = self.reconnect_task.lock().take() {
            task.abort();
        }
    }

    async fn apply(&self, input: ChannelInput, error: Option<String>) {
        let (old_status, new_status) = {
            let mut state = self.state.write();
            let old = state.status;
            state.status = transition(old, input);
            if error.is_some() {
                state.error = error;
            }
            (old, state.status)
        };

        if old_status != new_status {
            debug!("Channel state: {} -> {}", old_status, new_status);
            self.event_manager
                .emit(SdkEvent::ChannelStateChanged {
                    old_status,
                    new_status,
                })
                .await;
        }
    }

    // ============ 房间管理 ============

    /// 连接（重连）成功后重新加入全局用户房间与所有打开的会话房间
    async fn rejoin_rooms(&self) {
        if let Err(e) = self.transport.join_room(&user_room(&self.local_user_id)).await {
            warn!("Failed to join user room: {}", e);
        }

        let conversations: Vec<String> =
            self.open_conversations.read().iter().cloned().collect();
        for conversation_id in conversations {
            if let Err(e) = self
                .transport
                .join_room(&conversation_room(&conversation_id))
                .await
            {
                warn!("Failed to rejoin conversation room {}: {}", conversation_id, e);
            }
        }
    }

    /// 加入会话房间；断线期间记录，重连后补加入
    pub async fn join_conversation(&self, conversation_id: &str) -> Result<()> {
        self.open_conversations
            .write()
            .insert(conversation_id.to_string());

        if self.status() == ChannelStatus::Connected {
            self.transport
                .join_room(&conversation_room(conversation_id))
                .await?;
        }
        Ok(())
    }

    pub async fn leave_conversation(&self, conversation_id: &str) -> Result<()> {
        self.open_conversations.write().remove(conversation_id);

        if self.status() == ChannelStatus::Connected {
            self.transport
                .leave_room(&conversation_room(conversation_id))
                .await?;
        }
        Ok(())
    }

    /// 发送出站帧；未连接时返回 NotConnected
    pub async fn emit_frame(&self, frame: ClientFrame) -> Result<()> {
        if self.status() != ChannelStatus::Connected {
            return Err(ConvoSyncError::NotConnected);
        }
        self.transport.emit(frame).await
    }

    // ============ 事件分发 ============

    fn spawn_dispatch(
        self: &Arc<Self>,
        mut receiver: tokio::sync::mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        if let Some(task) = self.dispatch_task.lock().take() {
            task.abort();
        }

        let manager = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                match event {
                    TransportEvent::Frame(raw) => {
                        // 未知/畸形帧在 parse 内部丢弃并记录，不中断管线
                        if let Some(frame) = ServerFrame::parse(&raw) {
                            manager.route(frame).await;
                        }
                    }
                    TransportEvent::Closed { reason } => {
                        if manager.status() == ChannelStatus::Disconnected {
                            // 客户端主动断开，不触发重连
                            break;
                        }
                        warn!("Event channel closed by peer: {}", reason);
                        manager.schedule_reconnect(reason).await;
                        break;
                    }
                }
            }
        });
        *self.dispatch_task.lock() = Some(handle);
    }

    /// 把推送帧路由到所属组件
    async fn route(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::NewMessage { message } => {
                self.store.append_server_message(message).await;
            }
            ServerFrame::MessageUpdated { message } => {
                self.store.apply_update(message).await;
            }
            ServerFrame::MessageRead {
                message_id,
                user_id,
                read_at,
            } => {
                self.store
                    .apply_read_receipt(&message_id, &user_id, read_at)
                    .await;
            }
            ServerFrame::MessageReaction {
                message_id,
                user_id,
                emoji,
                action,
            } => {
                self.store
                    .apply_reaction(&message_id, &user_id, &emoji, action)
                    .await;
            }
            ServerFrame::TypingStart {
                conversation_id,
                user_id,
                user_name,
            } => {
                self.typing
                    .handle_remote_start(&conversation_id, &user_id, &user_name)
                    .await;
            }
            ServerFrame::TypingStop {
                conversation_id,
                user_id,
                ..
            } => {
                self.typing
                    .handle_remote_stop(&conversation_id, &user_id)
                    .await;
            }
            ServerFrame::UserOnline { user_id } => {
                self.presence.set_online(&user_id).await;
            }
            ServerFrame::UserOffline { user_id } => {
                self.presence.set_offline(&user_id).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn build_manager(
        transport: Arc<MockTransport>,
        policy: ReconnectPolicy,
    ) -> Arc<ChannelManager> {
        let event_manager = Arc::new(EventManager::new(64));
        let store = Arc::new(ConversationStore::new(event_manager.clone()));
        let typing = Arc::new(TypingCoordinator::new("me", event_manager.clone()));
        let presence = Arc::new(PresenceTracker::new(event_manager.clone()));
        Arc::new(ChannelManager::new(
            transport,
            store,
            typing,
            presence,
            event_manager,
            policy,
            "me",
        ))
    }

    #[test]
    fn test_backoff_delay_sequence() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_secs(1),
            max_attempts: 5,
        };

        // base, 2·base, 4·base, 8·base, 16·base，随后停止
        let delays: Vec<Option<Duration>> = (1..=6).map(|n| policy.delay_for(n)).collect();
        assert_eq!(
            delays,
            vec![
                Some(Duration::from_secs(1)),
                Some(Duration::from_secs(2)),
                Some(Duration::from_secs(4)),
                Some(Duration::from_secs(8)),
                Some(Duration::from_secs(16)),
                None,
            ]
        );
    }

    #[test]
    fn test_backoff_delay_saturates_on_large_attempts() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_secs(1),
            max_attempts: 64,
        };

        // 2^(n-1) 在 n≥33 时超出 u32，封顶而不是 panic
        let capped = policy.delay_for(33).unwrap();
        assert_eq!(policy.delay_for(64), Some(capped));
        assert!(policy.delay_for(32).unwrap() < capped);
        assert_eq!(policy.delay_for(65), None);
    }

    #[test]
    fn test_transition_table() {
        use ChannelInput::*;
        use ChannelStatus::*;

        assert_eq!(transition(Disconnected, ConnectRequested), Connecting);
        assert_eq!(transition(Connecting, ConnectSucceeded), Connected);
        // 幂等：已连接时的连接请求保持原状
        assert_eq!(transition(Connected, ConnectRequested), Connected);
        assert_eq!(transition(Connected, RetryScheduled), Reconnecting);
        assert_eq!(transition(Reconnecting, RetriesExhausted), Failed);
        assert_eq!(transition(Failed, ConnectRequested), Connecting);
        assert_eq!(transition(Connected, DisconnectRequested), Disconnected);
        // 客户端主动断开后不再进入重连
        assert_eq!(transition(Disconnected, RetryScheduled), Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_backoff_until_failed() {
        let transport = Arc::new(MockTransport::new());
        // 首次连接 + 5 次重试全部失败，之后的 connect 恢复成功
        transport.fail_next_connects(6);
        let manager = build_manager(transport.clone(), ReconnectPolicy::default());

        manager.connect("token").await.unwrap();
        assert_eq!(manager.status(), ChannelStatus::Reconnecting);
        assert_eq!(transport.state.lock().connect_calls, 1);

        // 总退避 1+2+4+8+16 = 31s；逐秒推进覆盖全部重试
        for _ in 0..40 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }

        // 首次连接 + 5 次重试后进入 Failed，不再自动尝试
        assert_eq!(manager.status(), ChannelStatus::Failed);
        assert_eq!(transport.state.lock().connect_calls, 6);
        assert!(manager.state().error.is_some());

        for _ in 0..40 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }
        assert_eq!(transport.state.lock().connect_calls, 6);

        // 手动 connect 重置计数并恢复
        manager.connect("token").await.unwrap();
        assert_eq!(manager.status(), ChannelStatus::Connected);
        assert_eq!(manager.state().attempt, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_completes_with_yielding_transport() {
        // 真实传输的 connect 会在握手中挂起；重试任务在该挂起点
        // 不得被自身的 cancel_reconnect 中止
        let transport = Arc::new(MockTransport::new());
        transport.set_yield_on_connect(true);
        transport.fail_next_connects(1);
        let manager = build_manager(transport.clone(), ReconnectPolicy::default());

        manager.connect("token").await.unwrap();
        assert_eq!(manager.status(), ChannelStatus::Reconnecting);

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
        }

        assert_eq!(manager.status(), ChannelStatus::Connected);
        assert_eq!(transport.state.lock().connect_calls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_with_yielding_transport() {
        let transport = Arc::new(MockTransport::new());
        transport.set_yield_on_connect(true);
        transport.fail_next_connects(6);
        let manager = build_manager(transport.clone(), ReconnectPolicy::default());

        manager.connect("token").await.unwrap();

        for _ in 0..40 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
        }

        assert_eq!(manager.status(), ChannelStatus::Failed);
        assert_eq!(transport.state.lock().connect_calls, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_close_triggers_reconnect_and_rejoin() {
        let transport = Arc::new(MockTransport::new());
        let manager = build_manager(transport.clone(), ReconnectPolicy::default());

        manager.connect("token").await.unwrap();
        manager.join_conversation("c1").await.unwrap();
        assert_eq!(manager.status(), ChannelStatus::Connected);

        transport.push_closed("transport error");
        tokio::task::yield_now().await;
        assert_eq!(manager.status(), ChannelStatus::Reconnecting);

        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(manager.status(), ChannelStatus::Connected);

        // 重连成功后重新加入用户房间与打开的会话房间
        let state = transport.state.lock();
        assert_eq!(
            state.joined_rooms,
            vec![
                "user:me".to_string(),
                "conversation:c1".to_string(),
                "user:me".to_string(),
                "conversation:c1".to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_disconnect_does_not_reconnect() {
        let transport = Arc::new(MockTransport::new());
        let manager = build_manager(transport.clone(), ReconnectPolicy::default());

        manager.connect("token").await.unwrap();
        manager.disconnect().await;
        assert_eq!(manager.status(), ChannelStatus::Disconnected);

        for _ in 0..30 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }
        assert_eq!(transport.state.lock().connect_calls, 1);
        assert_eq!(manager.status(), ChannelStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let transport = Arc::new(MockTransport::new());
        let manager = build_manager(transport.clone(), ReconnectPolicy::default());

        manager.connect("token").await.unwrap();
        manager.connect("token").await.unwrap();
        assert_eq!(transport.state.lock().connect_calls, 1);
    }

    #[tokio::test]
    async fn test_emit_frame_requires_connection() {
        let transport = Arc::new(MockTransport::new());
        let manager = build_manager(transport.clone(), ReconnectPolicy::default());

        let frame = ClientFrame::TypingStart {
            conversation_id: "c1".into(),
            user_id: "me".into(),
            user_name: "Me".into(),
        };
        assert!(matches!(
            manager.emit_frame(frame.clone()).await,
            Err(ConvoSyncError::NotConnected)
        ));

        manager.connect("token").await.unwrap();
        manager.emit_frame(frame).await.unwrap();
        assert_eq!(transport.state.lock().emitted.len(), 1);
    }
}
