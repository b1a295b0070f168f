//! 事件系统模块 - SDK 级别的状态变更事件
//!
//! 功能包括：
//! - 连接状态变更
//! - 消息接收 / 确认 / 发送失败
//! - 通知与未读数变更
//! - 事件广播（`tokio::sync::broadcast`）和同步回调订阅

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::connection_state::ConnectionStatus;
use crate::listeners::{ListenerRegistry, Subscription};
use crate::store::ChannelKey;
use crate::utils::now_millis;

/// 发送走的路径
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendPath {
    Socket,
    RestFallback,
}

/// SDK 事件类型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SDKEvent {
    /// 连接状态变更
    ConnectionStateChanged {
        old_state: ConnectionStatus,
        new_state: ConnectionStatus,
        timestamp: i64,
    },
    /// 鉴权失效，交由上层重新登录
    AuthExpired { reason: String, timestamp: i64 },
    /// 新消息进入频道（未匹配到乐观消息）
    MessageReceived {
        channel: ChannelKey,
        message_id: String,
        sender_id: String,
        content: String,
        timestamp: i64,
    },
    /// 乐观消息被确认
    MessageConfirmed {
        channel: ChannelKey,
        temp_id: String,
        message_id: String,
        timestamp: i64,
    },
    /// 消息已发出（等待确认）
    MessageSent {
        channel: ChannelKey,
        temp_id: String,
        path: SendPath,
        timestamp: i64,
    },
    /// 消息发送失败，乐观消息已撤回
    MessageSendFailed {
        channel: ChannelKey,
        temp_id: String,
        content: String,
        error: String,
        timestamp: i64,
    },
    /// 平台通知
    NotificationReceived {
        notification_id: String,
        kind: String,
        timestamp: i64,
    },
    /// 未读数变更；`channel` 为 `None` 时表示通知未读数
    UnreadCountChanged {
        channel: Option<ChannelKey>,
        unread_count: usize,
        timestamp: i64,
    },
    /// 进入 / 离开群房间
    RoomMembershipChanged {
        group_id: String,
        joined: bool,
        timestamp: i64,
    },
    /// 轮询失败（下一轮继续）
    PollFailed {
        channel: ChannelKey,
        error: String,
        timestamp: i64,
    },
}

impl SDKEvent {
    /// 事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            SDKEvent::ConnectionStateChanged { .. } => "connection_state_changed",
            SDKEvent::AuthExpired { .. } => "auth_expired",
            SDKEvent::MessageReceived { .. } => "message_received",
            SDKEvent::MessageConfirmed { .. } => "message_confirmed",
            SDKEvent::MessageSent { .. } => "message_sent",
            SDKEvent::MessageSendFailed { .. } => "message_send_failed",
            SDKEvent::NotificationReceived { .. } => "notification_received",
            SDKEvent::UnreadCountChanged { .. } => "unread_count_changed",
            SDKEvent::RoomMembershipChanged { .. } => "room_membership_changed",
            SDKEvent::PollFailed { .. } => "poll_failed",
        }
    }

    /// 事件关联的频道
    pub fn channel(&self) -> Option<&ChannelKey> {
        match self {
            SDKEvent::MessageReceived { channel, .. }
            | SDKEvent::MessageConfirmed { channel, .. }
            | SDKEvent::MessageSent { channel, .. }
            | SDKEvent::MessageSendFailed { channel, .. }
            | SDKEvent::PollFailed { channel, .. } => Some(channel),
            SDKEvent::UnreadCountChanged { channel, .. } => channel.as_ref(),
            _ => None,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            SDKEvent::ConnectionStateChanged { timestamp, .. }
            | SDKEvent::AuthExpired { timestamp, .. }
            | SDKEvent::MessageReceived { timestamp, .. }
            | SDKEvent::MessageConfirmed { timestamp, .. }
            | SDKEvent::MessageSent { timestamp, .. }
            | SDKEvent::MessageSendFailed { timestamp, .. }
            | SDKEvent::NotificationReceived { timestamp, .. }
            | SDKEvent::UnreadCountChanged { timestamp, .. }
            | SDKEvent::RoomMembershipChanged { timestamp, .. }
            | SDKEvent::PollFailed { timestamp, .. } => *timestamp,
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub event_types: Option<Vec<String>>,
    pub channels: Option<Vec<ChannelKey>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    pub fn with_channels(mut self, channels: Vec<ChannelKey>) -> Self {
        self.channels = Some(channels);
        self
    }

    pub fn matches(&self, event: &SDKEvent) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        if let Some(ref channels) = self.channels {
            match event.channel() {
                Some(channel) if channels.contains(channel) => {}
                // 事件没有频道但过滤器要求有
                _ => return false,
            }
        }

        true
    }
}

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    pub listener_count: usize,
    pub last_event_time: Option<i64>,
}

/// 通配监听 key
const ANY_EVENT: &str = "*";

/// 事件管理器
///
/// 两种订阅方式：异步的 broadcast 接收器，以及按事件类型注册的同步回调。
#[derive(Debug, Clone)]
pub struct EventManager {
    sender: broadcast::Sender<SDKEvent>,
    listeners: ListenerRegistry<String, SDKEvent>,
    stats: Arc<RwLock<EventStats>>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            listeners: ListenerRegistry::new("sdk-events"),
            stats: Arc::new(RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub fn emit(&self, event: SDKEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.write();
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 无订阅者时 send 会失败，属正常场景（无 UI 客户端），仅打 debug
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        self.listeners.emit_key(&event.event_type().to_string(), &event);
        self.listeners.emit_key(&ANY_EVENT.to_string(), &event);
    }

    /// 订阅全部事件
    pub fn subscribe(&self) -> broadcast::Receiver<SDKEvent> {
        self.sender.subscribe()
    }

    /// 订阅匹配过滤器的事件
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    /// 注册同步回调；`event_type` 为 `"*"` 时接收全部事件
    pub fn add_listener<F>(&self, event_type: &str, listener: F) -> Subscription
    where
        F: Fn(&SDKEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe_key(event_type.to_string(), listener)
    }

    /// 移除所有同步回调（登出）
    pub fn clear_listeners(&self) {
        self.listeners.clear();
    }

    pub fn get_stats(&self) -> EventStats {
        let mut stats = self.stats.read().clone();
        stats.listener_count = self.listeners.total();
        stats
    }

    /// 活跃的 broadcast 订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<SDKEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<SDKEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// 接收下一个匹配的事件
    pub async fn recv(&mut self) -> Result<SDKEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// 尝试接收事件（非阻塞）
    pub fn try_recv(&mut self) -> Result<SDKEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

/// 事件生成器 - 辅助函数
pub mod event_builders {
    use super::*;

    pub fn connection_state_changed(old_state: ConnectionStatus, new_state: ConnectionStatus) -> SDKEvent {
        SDKEvent::ConnectionStateChanged {
            old_state,
            new_state,
            timestamp: now_millis(),
        }
    }

    pub fn auth_expired(reason: impl Into<String>) -> SDKEvent {
        SDKEvent::AuthExpired {
            reason: reason.into(),
            timestamp: now_millis(),
        }
    }

    pub fn message_received(channel: ChannelKey, message_id: String, sender_id: String, content: String) -> SDKEvent {
        SDKEvent::MessageReceived {
            channel,
            message_id,
            sender_id,
            content,
            timestamp: now_millis(),
        }
    }

    pub fn message_confirmed(channel: ChannelKey, temp_id: String, message_id: String) -> SDKEvent {
        SDKEvent::MessageConfirmed {
            channel,
            temp_id,
            message_id,
            timestamp: now_millis(),
        }
    }

    pub fn message_sent(channel: ChannelKey, temp_id: String, path: SendPath) -> SDKEvent {
        SDKEvent::MessageSent {
            channel,
            temp_id,
            path,
            timestamp: now_millis(),
        }
    }

    pub fn message_send_failed(channel: ChannelKey, temp_id: String, content: String, error: String) -> SDKEvent {
        SDKEvent::MessageSendFailed {
            channel,
            temp_id,
            content,
            error,
            timestamp: now_millis(),
        }
    }

    pub fn notification_received(notification_id: String, kind: String) -> SDKEvent {
        SDKEvent::NotificationReceived {
            notification_id,
            kind,
            timestamp: now_millis(),
        }
    }

    pub fn unread_count_changed(channel: Option<ChannelKey>, unread_count: usize) -> SDKEvent {
        SDKEvent::UnreadCountChanged {
            channel,
            unread_count,
            timestamp: now_millis(),
        }
    }

    pub fn room_membership_changed(group_id: String, joined: bool) -> SDKEvent {
        SDKEvent::RoomMembershipChanged {
            group_id,
            joined,
            timestamp: now_millis(),
        }
    }

    pub fn poll_failed(channel: ChannelKey, error: String) -> SDKEvent {
        SDKEvent::PollFailed {
            channel,
            error,
            timestamp: now_millis(),
        }
    }
}
