//! 未读计数
//!
//! 均为派生视图：私聊未读由存储中对端发来、未读的确认消息计算；
//! 尚未加载到本地的会话用 REST 未读总数补齐；通知未读来自通知中心。

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::http_client::ChatApi;
use crate::notifications::NotificationCenter;
use crate::sdk::CurrentUser;
use crate::store::{ChannelKey, SharedStore};

/// 未读汇总
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadSummary {
    /// 对端用户 id -> 未读数（只含有未读的会话）
    pub by_conversation: BTreeMap<String, usize>,
    pub messages: usize,
    pub notifications: usize,
}

/// 未读计数器
#[derive(Clone)]
pub struct UnreadCounters {
    user: CurrentUser,
    store: SharedStore,
    api: Arc<dyn ChatApi>,
    notifications: NotificationCenter,
    /// 服务端未读中不属于已加载会话的部分
    remote_only: Arc<RwLock<usize>>,
}

impl std::fmt::Debug for UnreadCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnreadCounters")
            .field("remote_only", &*self.remote_only.read())
            .finish()
    }
}

impl UnreadCounters {
    pub fn new(
        user: CurrentUser,
        store: SharedStore,
        api: Arc<dyn ChatApi>,
        notifications: NotificationCenter,
    ) -> Self {
        Self {
            user,
            store,
            api,
            notifications,
            remote_only: Arc::new(RwLock::new(0)),
        }
    }

    /// 与某个用户的会话未读数
    pub fn conversation_unread(&self, peer_id: &str) -> usize {
        let Some(self_id) = self.user.user_id() else {
            return 0;
        };
        self.store
            .lock()
            .channel(&ChannelKey::direct(peer_id))
            .map(|log| log.unread_from_others(&self_id))
            .unwrap_or(0)
    }

    fn local_by_conversation(&self) -> BTreeMap<String, usize> {
        let Some(self_id) = self.user.user_id() else {
            return BTreeMap::new();
        };
        self.store
            .lock()
            .conversations(&self_id)
            .into_iter()
            .filter(|c| c.unread_count > 0)
            .map(|c| (c.peer_id().to_string(), c.unread_count))
            .collect()
    }

    /// 私信未读总数
    pub fn total_unread_messages(&self) -> usize {
        let local: usize = self.local_by_conversation().values().sum();
        local + *self.remote_only.read()
    }

    /// 用 REST 未读总数校准
    pub async fn refresh_from_server(&self) -> Result<usize> {
        let server = self.api.unread_message_count().await? as usize;
        let local: usize = self.local_by_conversation().values().sum();
        let remote_only = server.saturating_sub(local);
        *self.remote_only.write() = remote_only;
        debug!("未读校准: 服务端 {}，本地 {}，未加载 {}", server, local, remote_only);
        Ok(local + remote_only)
    }

    pub fn unread_notifications(&self) -> usize {
        self.notifications.unread_count()
    }

    pub fn summary(&self) -> UnreadSummary {
        let by_conversation = self.local_by_conversation();
        let messages = by_conversation.values().sum::<usize>() + *self.remote_only.read();
        UnreadSummary {
            by_conversation,
            messages,
            notifications: self.unread_notifications(),
        }
    }

    /// 登出时清零
    pub fn clear(&self) {
        *self.remote_only.write() = 0;
    }
}
