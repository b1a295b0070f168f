//! 连接状态管理
//!
//! 记录传输类型、socket 地址、收发计数与最近一次断开原因，供日志与排障使用。

use chrono::Duration;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::utils::now_millis;

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// 未连接
    Disconnected,
    /// 连接中
    Connecting,
    /// 已连接
    Connected,
    /// 重连中
    Reconnecting,
    /// 连接失败（鉴权失效或重连次数耗尽）
    Failed,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "未连接"),
            ConnectionStatus::Connecting => write!(f, "连接中"),
            ConnectionStatus::Connected => write!(f, "已连接"),
            ConnectionStatus::Reconnecting => write!(f, "重连中"),
            ConnectionStatus::Failed => write!(f, "连接失败"),
        }
    }
}

/// 收发统计
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceStats {
    /// 已发送帧数
    pub frames_sent: u64,
    /// 已接收帧数
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// 成功重连次数
    pub reconnects: u64,
    /// 最后活动时间（UTC毫秒时间戳）
    pub last_activity_time: Option<i64>,
}

/// 连接状态快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionState {
    /// 传输名称（WebSocket / Memory）
    pub transport: String,
    pub status: ConnectionStatus,
    /// socket 地址（不含 token）
    pub socket_url: String,
    pub stats: PerformanceStats,
    /// 本次链路建立时间（UTC毫秒）
    pub connected_at: Option<i64>,
    /// 最近一次断开原因
    pub last_error: Option<String>,
    pub sdk_version: String,
    pub platform: String,
}

impl ConnectionState {
    fn idle(platform: String) -> Self {
        Self {
            transport: String::new(),
            status: ConnectionStatus::Disconnected,
            socket_url: String::new(),
            stats: PerformanceStats::default(),
            connected_at: None,
            last_error: None,
            sdk_version: crate::version::SDK_VERSION.to_string(),
            platform,
        }
    }

    /// 当前链路已持续的时间
    pub fn uptime(&self) -> Option<Duration> {
        self.connected_at
            .map(|at| Duration::milliseconds((now_millis() - at).max(0)))
    }

    /// 单行摘要（日志用）
    pub fn summary(&self) -> String {
        let uptime = match self.uptime() {
            Some(d) => format!("{}s", d.num_seconds()),
            None => "-".to_string(),
        };
        format!(
            "[{}] {} {} uptime={} tx={} rx={} reconnects={} last_error={} (sdk {} / {})",
            self.transport,
            self.status,
            self.socket_url,
            uptime,
            self.stats.frames_sent,
            self.stats.frames_received,
            self.stats.reconnects,
            self.last_error.as_deref().unwrap_or("-"),
            self.sdk_version,
            self.platform,
        )
    }
}

/// 连接状态管理器
///
/// 同步读写：发送路径需要同步判断 socket 是否可用。
#[derive(Debug, Clone)]
pub struct ConnectionStateManager {
    state: Arc<RwLock<ConnectionState>>,
}

impl ConnectionStateManager {
    pub fn new(platform: String) -> Self {
        Self {
            state: Arc::new(RwLock::new(ConnectionState::idle(platform))),
        }
    }

    /// 更新状态，返回旧状态
    pub fn set_status(&self, status: ConnectionStatus) -> ConnectionStatus {
        std::mem::replace(&mut self.state.write().status, status)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.read().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// 记录本次连接的目标
    pub fn set_target(&self, transport: &str, socket_url: String) {
        let mut state = self.state.write();
        state.transport = transport.to_string();
        state.socket_url = socket_url;
    }

    pub fn mark_connected(&self, reconnected: bool) {
        let mut state = self.state.write();
        state.status = ConnectionStatus::Connected;
        state.connected_at = Some(now_millis());
        state.last_error = None;
        if reconnected {
            state.stats.reconnects += 1;
        }
    }

    /// `reason` 为空表示主动断开，保留上一次的错误
    pub fn mark_disconnected(&self, reason: Option<String>) {
        let mut state = self.state.write();
        state.status = ConnectionStatus::Disconnected;
        state.connected_at = None;
        if reason.is_some() {
            state.last_error = reason;
        }
    }

    pub fn record_outbound(&self, len: u64) {
        let mut state = self.state.write();
        state.stats.frames_sent += 1;
        state.stats.bytes_sent += len;
        state.stats.last_activity_time = Some(now_millis());
    }

    pub fn record_inbound(&self, len: u64) {
        let mut state = self.state.write();
        state.stats.frames_received += 1;
        state.stats.bytes_received += len;
        state.stats.last_activity_time = Some(now_millis());
    }

    pub fn snapshot(&self) -> ConnectionState {
        self.state.read().clone()
    }

    pub fn log_state(&self) {
        tracing::info!("🔎 {}", self.state.read().summary());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_manager() {
        let manager = ConnectionStateManager::new("linux".to_string());
        manager.set_target("WebSocket", "wss://chat.example.com/ws".into());
        assert_eq!(manager.set_status(ConnectionStatus::Connecting), ConnectionStatus::Disconnected);
        manager.mark_connected(false);
        assert!(manager.is_connected());
        assert!(manager.snapshot().uptime().is_some());

        manager.record_outbound(64);
        manager.record_inbound(128);
        let state = manager.snapshot();
        assert_eq!(state.stats.frames_sent, 1);
        assert_eq!(state.stats.bytes_received, 128);
        assert!(state.summary().contains("WebSocket"));

        manager.mark_disconnected(Some("closed".into()));
        assert_eq!(manager.snapshot().last_error.as_deref(), Some("closed"));
        manager.mark_disconnected(None);
        assert_eq!(manager.snapshot().last_error.as_deref(), Some("closed"));
        manager.mark_connected(true);
        let state = manager.snapshot();
        assert_eq!(state.stats.reconnects, 1);
        assert!(state.last_error.is_none());
    }
}
