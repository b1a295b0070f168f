use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::{DirectMessagePayload, GroupMessagePayload};

/// 逻辑消息流的键：私聊按对端用户 id，群聊按群 id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ChannelKey {
    Direct(String),
    Group(String),
}

impl ChannelKey {
    pub fn direct(peer_id: impl Into<String>) -> Self {
        ChannelKey::Direct(peer_id.into())
    }

    pub fn group(group_id: impl Into<String>) -> Self {
        ChannelKey::Group(group_id.into())
    }

    pub fn is_group(&self) -> bool {
        matches!(self, ChannelKey::Group(_))
    }

    /// 对端用户 id 或群 id
    pub fn target_id(&self) -> &str {
        match self {
            ChannelKey::Direct(id) | ChannelKey::Group(id) => id,
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKey::Direct(id) => write!(f, "direct:{}", id),
            ChannelKey::Group(id) => write!(f, "group:{}", id),
        }
    }
}

/// 消息状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageState {
    /// 本地已渲染，等待服务端确认
    Optimistic,
    /// 服务端已确认（推送回显或轮询拉取）
    Confirmed,
}

/// 一条消息
///
/// 私聊/群聊由 `channel` 区分。`Confirmed` 之后除已读标记外不再修改。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// 服务端 id；乐观消息为 `temp-*` 临时 id
    pub id: String,
    pub channel: ChannelKey,
    pub sender_id: String,
    pub sender_display: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub state: MessageState,
    pub is_read: bool,
    /// 客户端幂等键
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
}

impl Message {
    /// 由私聊载荷构造已确认消息；`self_id` 用于确定对端
    pub fn from_direct(payload: DirectMessagePayload, self_id: &str) -> Self {
        let peer = if payload.sender_id == self_id {
            payload.receiver_id.clone()
        } else {
            payload.sender_id.clone()
        };
        let sender_display = payload
            .sender_name
            .clone()
            .unwrap_or_else(|| payload.sender_id.clone());
        Self {
            id: payload.id,
            channel: ChannelKey::Direct(peer),
            sender_id: payload.sender_id,
            sender_display,
            content: payload.content,
            created_at: payload.created_at,
            state: MessageState::Confirmed,
            is_read: payload.is_read,
            client_message_id: payload.client_message_id,
        }
    }

    /// 由群消息载荷构造已确认消息
    pub fn from_group(payload: GroupMessagePayload) -> Self {
        let sender_display = payload
            .sender_email
            .clone()
            .unwrap_or_else(|| payload.sender_id.clone());
        Self {
            id: payload.id,
            channel: ChannelKey::Group(payload.group_id),
            sender_id: payload.sender_id,
            sender_display,
            content: payload.content,
            created_at: payload.created_at,
            state: MessageState::Confirmed,
            // 群消息没有逐条已读
            is_read: true,
            client_message_id: payload.client_message_id,
        }
    }

    pub fn is_optimistic(&self) -> bool {
        self.state == MessageState::Optimistic
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == MessageState::Confirmed
    }
}

/// 乐观发送的输入
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticDraft {
    pub sender_id: String,
    pub sender_display: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub client_message_id: Option<String>,
}
