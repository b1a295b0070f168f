use serde::{Deserialize, Serialize};

use super::{ChannelLog, Message};

/// 私聊会话摘要（会话列表使用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// 两个参与者 id 排序后以 `_` 拼接，与参与顺序无关
    pub conversation_id: String,
    pub participant_ids: [String; 2],
    pub last_message: Option<Message>,
    pub unread_count: usize,
}

impl Conversation {
    pub fn conversation_id(a: &str, b: &str) -> String {
        if a <= b {
            format!("{}_{}", a, b)
        } else {
            format!("{}_{}", b, a)
        }
    }

    pub(crate) fn derive(self_id: &str, peer_id: &str, log: &ChannelLog) -> Self {
        Self {
            conversation_id: Self::conversation_id(self_id, peer_id),
            participant_ids: [self_id.to_string(), peer_id.to_string()],
            last_message: log.last().cloned(),
            unread_count: log.unread_from_others(self_id),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.participant_ids[1]
    }
}
