//! 通知中心
//!
//! - 扇出：每条 `new_notification` 恰好送达当前每个订阅者一次，订阅顺序无关
//! - 读穿缓存：REST 列表为准，推送按 id 去重后插入（新的在前）
//! - 已读为乐观翻转，REST 失败时回滚；删除在 REST 成功后才移除本地条目
//! - 断开 / 登出时清空订阅与缓存

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::{event_builders, EventManager};
use crate::http_client::{ChatApi, PageRequest};
use crate::listeners::{ListenerRegistry, Subscription};
use crate::protocol::NotificationPayload;

/// 平台通知
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub kind: String,
    pub title: String,
    pub message: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
    pub payload: Option<serde_json::Value>,
}

impl From<NotificationPayload> for Notification {
    fn from(p: NotificationPayload) -> Self {
        Self {
            id: p.id,
            kind: p.kind,
            title: p.title,
            message: p.message,
            read: p.read,
            created_at: p.created_at,
            payload: p.data,
        }
    }
}

#[derive(Debug, Default)]
struct NotificationCache {
    /// 新的在前
    items: Vec<Notification>,
    /// 不在本地缓存里的未读数（来自 REST 未读计数）
    unread_beyond_cache: usize,
}

impl NotificationCache {
    fn local_unread(&self) -> usize {
        self.items.iter().filter(|n| !n.read).count()
    }

    fn unread(&self) -> usize {
        self.local_unread() + self.unread_beyond_cache
    }

    fn upsert(&mut self, notification: Notification) {
        match self.items.iter_mut().find(|n| n.id == notification.id) {
            Some(existing) => *existing = notification,
            None => {
                self.items.push(notification);
                self.items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            }
        }
    }

    fn set_read(&mut self, id: &str, read: bool) -> Option<bool> {
        let item = self.items.iter_mut().find(|n| n.id == id)?;
        Some(std::mem::replace(&mut item.read, read))
    }
}

/// 通知中心
#[derive(Clone)]
pub struct NotificationCenter {
    api: Arc<dyn ChatApi>,
    events: EventManager,
    registry: ListenerRegistry<(), Notification>,
    cache: Arc<RwLock<NotificationCache>>,
    page_size: usize,
}

impl std::fmt::Debug for NotificationCenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationCenter")
            .field("subscribers", &self.registry.len())
            .field("cached", &self.cache.read().items.len())
            .finish()
    }
}

impl NotificationCenter {
    pub fn new(api: Arc<dyn ChatApi>, events: EventManager, page_size: usize) -> Self {
        Self {
            api,
            events,
            registry: ListenerRegistry::new("notifications"),
            cache: Arc::new(RwLock::new(NotificationCache::default())),
            page_size,
        }
    }

    /// 订阅推送通知；返回的句柄 drop 或 `unsubscribe()` 时注销
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.registry.subscribe(callback)
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    /// 处理一条推送通知
    pub fn deliver(&self, payload: NotificationPayload) {
        let notification = Notification::from(payload);
        let unread = {
            let mut cache = self.cache.write();
            cache.upsert(notification.clone());
            cache.unread()
        };

        let delivered = self.registry.emit(&notification);
        debug!("🔔 通知 {} 已送达 {} 个订阅者", notification.id, delivered);

        self.events.emit(event_builders::notification_received(
            notification.id.clone(),
            notification.kind.clone(),
        ));
        self.events
            .emit(event_builders::unread_count_changed(None, unread));
    }

    /// 从 REST 重新加载第一页与未读数
    pub async fn refresh(&self) -> Result<Vec<Notification>> {
        let page = self.api.list_notifications(PageRequest::first(self.page_size)).await?;
        let server_unread = self.api.notification_unread_count().await? as usize;

        let (items, unread) = {
            let mut cache = self.cache.write();
            cache.items = page.into_iter().map(Notification::from).collect();
            cache.items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            cache.unread_beyond_cache = server_unread.saturating_sub(cache.local_unread());
            (cache.items.clone(), cache.unread())
        };
        info!("🔔 通知已刷新: {} 条，未读 {}", items.len(), unread);
        self.events
            .emit(event_builders::unread_count_changed(None, unread));
        Ok(items)
    }

    /// 追加下一页
    pub async fn load_more(&self) -> Result<usize> {
        let offset = self.cache.read().items.len();
        let page = self
            .api
            .list_notifications(PageRequest {
                limit: self.page_size,
                offset,
            })
            .await?;
        let count = page.len();
        let mut cache = self.cache.write();
        for payload in page {
            let notification = Notification::from(payload);
            if !notification.read {
                cache.unread_beyond_cache = cache.unread_beyond_cache.saturating_sub(1);
            }
            cache.upsert(notification);
        }
        Ok(count)
    }

    /// 缓存快照（新的在前）
    pub fn notifications(&self) -> Vec<Notification> {
        self.cache.read().items.clone()
    }

    pub fn unread_count(&self) -> usize {
        self.cache.read().unread()
    }

    /// 标记单条已读（乐观）
    pub async fn mark_read(&self, notification_id: &str) -> Result<()> {
        let previous = self.cache.write().set_read(notification_id, true);
        if previous == Some(true) {
            return Ok(());
        }
        self.publish_unread();

        if let Err(e) = self.api.mark_notification_read(notification_id).await {
            warn!("⚠️ 标记通知已读失败，回滚: {}", e);
            if previous == Some(false) {
                self.cache.write().set_read(notification_id, false);
                self.publish_unread();
            }
            return Err(e);
        }
        Ok(())
    }

    /// 全部标记已读（乐观）
    pub async fn mark_all_read(&self) -> Result<()> {
        let (flipped, beyond) = {
            let mut cache = self.cache.write();
            let flipped: Vec<String> = cache
                .items
                .iter_mut()
                .filter(|n| !n.read)
                .map(|n| {
                    n.read = true;
                    n.id.clone()
                })
                .collect();
            let beyond = std::mem::take(&mut cache.unread_beyond_cache);
            (flipped, beyond)
        };
        self.publish_unread();

        if let Err(e) = self.api.mark_all_notifications_read().await {
            warn!("⚠️ 全部已读失败，回滚 {} 条: {}", flipped.len(), e);
            {
                let mut cache = self.cache.write();
                for id in &flipped {
                    cache.set_read(id, false);
                }
                cache.unread_beyond_cache = beyond;
            }
            self.publish_unread();
            return Err(e);
        }
        Ok(())
    }

    /// 删除通知：REST 成功后才移除本地条目
    pub async fn delete(&self, notification_id: &str) -> Result<()> {
        self.api.delete_notification(notification_id).await?;
        self.cache.write().items.retain(|n| n.id != notification_id);
        self.publish_unread();
        Ok(())
    }

    /// 清空订阅与缓存（断开 / 登出）
    pub fn clear(&self) {
        self.registry.clear();
        *self.cache.write() = NotificationCache::default();
    }

    fn publish_unread(&self) {
        let unread = self.unread_count();
        self.events
            .emit(event_builders::unread_count_changed(None, unread));
    }
}
