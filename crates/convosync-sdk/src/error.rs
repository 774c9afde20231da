use thiserror::Error;

/// SDK 统一错误类型
///
/// 错误分层：
/// - Transport：传输层错误（连接被拒/超时/断开），通过重连退避恢复，不致命
/// - Command：命令被服务端拒绝（发送/已读/表情），需回滚乐观效果，可恢复
/// - Protocol：协议错误（未知事件类型/负载格式错误），静默丢弃并记录日志
/// - ReconnectExhausted：重连次数耗尽，需要调用方手动触发 reconnect
#[derive(Debug, Error)]
pub enum ConvoSyncError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Command failed: {0}")]
    Command(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Reconnect attempts exhausted after {0} tries")]
    ReconnectExhausted(u32),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConvoSyncError {
    /// 判断错误是否可通过重连/重试自愈
    ///
    /// 本子系统中没有进程级致命错误；最坏结果是视图过期或断开，
    /// 手动 reconnect 或整体重新拉取即可恢复。
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ConvoSyncError::InvalidArgument(_))
    }
}

pub type Result<T> = std::result::Result<T, ConvoSyncError>;
