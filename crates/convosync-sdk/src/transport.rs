//! 传输层抽象
//!
//! 推送通道连接是每个客户端会话唯一的共享资源，仅由通道管理器开/关；
//! 其余组件只消费分发后的事件，或请求加入/离开房间。
//! 具体实现（WebSocket/QUIC 等）由平台层提供，SDK 只依赖本 trait。

use crate::error::Result;
use crate::events::{ClientFrame, RawFrame};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// 房间命名：全局用户房间
pub fn user_room(user_id: &str) -> String {
    format!("user:{}", user_id)
}

/// 房间命名：会话房间
pub fn conversation_room(conversation_id: &str) -> String {
    format!("conversation:{}", conversation_id)
}

/// 传输层上行事件
#[derive(Debug)]
pub enum TransportEvent {
    /// 入站帧（事件名 + 未解析负载）
    Frame(RawFrame),
    /// 连接关闭；reason 用于日志与状态展示
    Closed { reason: String },
}

/// 推送通道传输接口
///
/// 约定：
/// - `connect` 携带认证凭据握手，成功后返回入站事件流；
///   同一实例重复 connect 由调用方（通道管理器）保证不会发生
/// - `disconnect` 随时可安全调用，包括尚未建立连接时
/// - 通道按连接保序交付帧；重连造成的事件缺口由上层显式重新拉取解决
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// 建立连接并完成认证握手，返回入站事件流
    async fn connect(&self, credential: &str) -> Result<mpsc::UnboundedReceiver<TransportEvent>>;

    /// 拆除连接；幂等
    async fn disconnect(&self);

    /// 加入命名房间
    async fn join_room(&self, room: &str) -> Result<()>;

    /// 离开命名房间
    async fn leave_room(&self, room: &str) -> Result<()>;

    /// 发送出站帧
    async fn emit(&self, frame: ClientFrame) -> Result<()>;
}
