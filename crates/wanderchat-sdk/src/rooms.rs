//! 群房间成员关系
//!
//! 与聊天界面的挂载 / 卸载配对。同一个群可能被多个界面同时打开，按引用计数管理：
//! 0→1 时发送 `join_group`，1→0 时发送 `leave_group`。
//! - 重复 join 不会产生重复条目
//! - leave 容忍已断开的连接（界面被强制卸载时很常见），从不报错
//! - 链路（重新）建立后，对所有仍持有的房间重新发送 `join_group`

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::connection::ConnectionManager;
use crate::events::{event_builders, EventManager};
use crate::protocol::ClientCommand;

/// 一个群房间的成员状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRoomMembership {
    pub group_id: String,
    /// 服务端是否已收到 join（断线期间为 false）
    pub joined: bool,
}

#[derive(Debug, Default)]
struct RoomEntry {
    refs: usize,
    joined: bool,
}

/// 房间成员关系跟踪器
#[derive(Debug, Clone)]
pub struct RoomTracker {
    connection: ConnectionManager,
    events: EventManager,
    rooms: Arc<Mutex<HashMap<String, RoomEntry>>>,
}

impl RoomTracker {
    pub fn new(connection: ConnectionManager, events: EventManager) -> Self {
        Self {
            connection,
            events,
            rooms: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 进入群房间（界面挂载时调用）
    pub fn join_group(&self, group_id: &str) {
        let first = {
            let mut rooms = self.rooms.lock();
            let entry = rooms.entry(group_id.to_string()).or_default();
            entry.refs += 1;
            entry.refs == 1
        };
        if !first {
            debug!("房间 {} 已持有，引用计数 +1", group_id);
            return;
        }

        self.send_join(group_id);
        self.events
            .emit(event_builders::room_membership_changed(group_id.to_string(), true));
    }

    /// 离开群房间（界面卸载时调用）；未持有的房间直接忽略
    pub fn leave_group(&self, group_id: &str) {
        let last = {
            let mut rooms = self.rooms.lock();
            match rooms.get_mut(group_id) {
                None => {
                    debug!("房间 {} 未持有，忽略 leave", group_id);
                    return;
                }
                Some(entry) => {
                    entry.refs = entry.refs.saturating_sub(1);
                    if entry.refs == 0 {
                        rooms.remove(group_id);
                        true
                    } else {
                        false
                    }
                }
            }
        };
        if !last {
            return;
        }

        match self.connection.emit(&ClientCommand::leave_group(group_id)) {
            Ok(()) => info!("🚪 已离开房间 {}", group_id),
            Err(e) => debug!("离开房间 {} 时连接不可用，忽略: {}", group_id, e),
        }
        self.events
            .emit(event_builders::room_membership_changed(group_id.to_string(), false));
    }

    /// 链路建立后重新加入全部房间
    pub fn rejoin_all(&self) {
        let groups = self.groups();
        if groups.is_empty() {
            return;
        }
        info!("🔁 重新加入 {} 个房间", groups.len());
        for group_id in groups {
            self.send_join(&group_id);
        }
    }

    /// 链路断开：全部标记为未加入，保留引用计数
    pub fn mark_all_detached(&self) {
        for entry in self.rooms.lock().values_mut() {
            entry.joined = false;
        }
    }

    pub fn groups(&self) -> Vec<String> {
        self.rooms.lock().keys().cloned().collect()
    }

    pub fn membership(&self, group_id: &str) -> Option<GroupRoomMembership> {
        self.rooms.lock().get(group_id).map(|entry| GroupRoomMembership {
            group_id: group_id.to_string(),
            joined: entry.joined,
        })
    }

    pub fn ref_count(&self, group_id: &str) -> usize {
        self.rooms.lock().get(group_id).map(|e| e.refs).unwrap_or(0)
    }

    /// 清空全部房间（断开 / 登出）
    pub fn clear(&self) {
        let count = {
            let mut rooms = self.rooms.lock();
            let count = rooms.len();
            rooms.clear();
            count
        };
        if count > 0 {
            debug!("已清空 {} 个房间", count);
        }
    }

    fn send_join(&self, group_id: &str) {
        let joined = match self.connection.emit(&ClientCommand::join_group(group_id)) {
            Ok(()) => {
                info!("🚪 已加入房间 {}", group_id);
                true
            }
            Err(e) => {
                // 连上后由 rejoin_all 补发
                warn!("⚠️ 加入房间 {} 暂缓: {}", group_id, e);
                false
            }
        };
        if let Some(entry) = self.rooms.lock().get_mut(group_id) {
            entry.joined = joined;
        }
    }
}
