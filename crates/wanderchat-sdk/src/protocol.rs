//! Socket 协议定义
//!
//! 所有帧均为 JSON 文本：`{"event": "<name>", "data": {...}}`，字段使用 camelCase。
//! REST 历史接口返回与推送相同的消息结构，保证推送与轮询走同一条合并路径。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::error::Result;

/// 出站事件名
pub mod outbound {
    pub const SEND_MESSAGE: &str = "send_message";
    pub const SEND_GROUP_MESSAGE: &str = "send_group_message";
    pub const JOIN_GROUP: &str = "join_group";
    pub const LEAVE_GROUP: &str = "leave_group";
    pub const MARK_AS_READ: &str = "mark_as_read";
}

/// 入站事件名
pub mod inbound {
    pub const NEW_MESSAGE: &str = "new_message";
    pub const NEW_GROUP_MESSAGE: &str = "new_group_message";
    pub const NEW_NOTIFICATION: &str = "new_notification";
    pub const MESSAGE_ERROR: &str = "message_error";
}

/// 服务端 id 可能是数字也可能是字符串，统一按字符串持有
pub fn id_from_string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Str(String),
        Int(i64),
        UInt(u64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Str(s) => s,
        RawId::Int(n) => n.to_string(),
        RawId::UInt(n) => n.to_string(),
    })
}

/// 帧外壳
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub event: String,
    pub data: T,
}

// ========== 出站 ==========

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub receiver_id: String,
    pub content: String,
    /// 客户端幂等键，服务端回显时用于精确合并
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendGroupMessageRequest {
    pub group_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRoomRequest {
    pub group_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkAsReadRequest {
    pub other_user_id: String,
}

/// 客户端发往服务端的指令
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    SendMessage(SendMessageRequest),
    SendGroupMessage(SendGroupMessageRequest),
    JoinGroup(GroupRoomRequest),
    LeaveGroup(GroupRoomRequest),
    MarkAsRead(MarkAsReadRequest),
}

impl ClientCommand {
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientCommand::SendMessage(_) => outbound::SEND_MESSAGE,
            ClientCommand::SendGroupMessage(_) => outbound::SEND_GROUP_MESSAGE,
            ClientCommand::JoinGroup(_) => outbound::JOIN_GROUP,
            ClientCommand::LeaveGroup(_) => outbound::LEAVE_GROUP,
            ClientCommand::MarkAsRead(_) => outbound::MARK_AS_READ,
        }
    }

    /// 编码为文本帧
    pub fn encode(&self) -> Result<String> {
        let data = match self {
            ClientCommand::SendMessage(req) => serde_json::to_value(req)?,
            ClientCommand::SendGroupMessage(req) => serde_json::to_value(req)?,
            ClientCommand::JoinGroup(req) | ClientCommand::LeaveGroup(req) => {
                serde_json::to_value(req)?
            }
            ClientCommand::MarkAsRead(req) => serde_json::to_value(req)?,
        };
        let envelope = Envelope {
            event: self.event_name().to_string(),
            data,
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    pub fn join_group(group_id: impl Into<String>) -> Self {
        ClientCommand::JoinGroup(GroupRoomRequest { group_id: group_id.into() })
    }

    pub fn leave_group(group_id: impl Into<String>) -> Self {
        ClientCommand::LeaveGroup(GroupRoomRequest { group_id: group_id.into() })
    }
}

// ========== 入站 ==========

/// 私聊消息（推送 `new_message` 与 REST 会话历史共用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessagePayload {
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: String,
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub sender_id: String,
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub receiver_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
}

/// 群消息（推送 `new_group_message` 与 REST 群历史共用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMessagePayload {
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: String,
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub group_id: String,
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub sender_id: String,
    #[serde(default)]
    pub sender_email: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
}

/// 平台通知
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: String,
    #[serde(default, deserialize_with = "optional_id")]
    pub user_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageErrorPayload {
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<String>,
}

fn optional_id<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapper(#[serde(deserialize_with = "id_from_string_or_number")] String);

    Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|Wrapper(id)| id))
}

/// 服务端推送事件
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    NewMessage(DirectMessagePayload),
    NewGroupMessage(GroupMessagePayload),
    NewNotification(NotificationPayload),
    MessageError(MessageErrorPayload),
}

impl ServerEvent {
    /// 解析文本帧；未知事件返回 `Ok(None)`，由调用方丢弃
    pub fn decode(text: &str) -> Result<Option<ServerEvent>> {
        let envelope: Envelope<serde_json::Value> = serde_json::from_str(text)?;
        let event = match envelope.event.as_str() {
            inbound::NEW_MESSAGE => ServerEvent::NewMessage(serde_json::from_value(envelope.data)?),
            inbound::NEW_GROUP_MESSAGE => {
                ServerEvent::NewGroupMessage(serde_json::from_value(envelope.data)?)
            }
            inbound::NEW_NOTIFICATION => {
                ServerEvent::NewNotification(serde_json::from_value(envelope.data)?)
            }
            inbound::MESSAGE_ERROR => {
                ServerEvent::MessageError(serde_json::from_value(envelope.data)?)
            }
            other => {
                debug!("忽略未知事件: {}", other);
                return Ok(None);
            }
        };
        Ok(Some(event))
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            ServerEvent::NewMessage(_) => inbound::NEW_MESSAGE,
            ServerEvent::NewGroupMessage(_) => inbound::NEW_GROUP_MESSAGE,
            ServerEvent::NewNotification(_) => inbound::NEW_NOTIFICATION,
            ServerEvent::MessageError(_) => inbound::MESSAGE_ERROR,
        }
    }

    /// 编码为文本帧（测试与内存传输的服务端一侧使用）
    pub fn encode(&self) -> Result<String> {
        let data = match self {
            ServerEvent::NewMessage(p) => serde_json::to_value(p)?,
            ServerEvent::NewGroupMessage(p) => serde_json::to_value(p)?,
            ServerEvent::NewNotification(p) => serde_json::to_value(p)?,
            ServerEvent::MessageError(p) => serde_json::to_value(p)?,
        };
        Ok(serde_json::to_string(&Envelope {
            event: self.event_name().to_string(),
            data,
        })?)
    }
}
