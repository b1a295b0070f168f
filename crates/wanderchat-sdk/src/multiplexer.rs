//! 频道多路复用器
//!
//! 按（事件类型, 频道键）把入站事件分发到私聊 / 群聊 / 通知三条流：
//! - 私聊：频道键为对端用户；先合并进存储，再通知该对端的监听器与全局私聊监听器（会话列表）
//! - 群聊：没有任何监听器的群事件直接丢弃
//! - 通知：交给通知中心扇出
//! - `message_error`：按幂等键找到所属频道，通知该频道的错误监听器；同时通知全局错误监听器

use tracing::{debug, warn};

use crate::events::{event_builders, EventManager};
use crate::listeners::{ListenerRegistry, Subscription};
use crate::notifications::NotificationCenter;
use crate::protocol::{MessageErrorPayload, ServerEvent};
use crate::sdk::CurrentUser;
use crate::store::{ChannelKey, Message, ReconcileOutcome, SharedStore};

/// 频道内一条消息的变化
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelUpdate {
    pub channel: ChannelKey,
    pub message: Message,
    pub outcome: ReconcileOutcome,
}

/// 服务端拒绝发送
#[derive(Debug, Clone, PartialEq)]
pub struct MessageError {
    /// 能关联到乐观消息时为其所在频道
    pub channel: Option<ChannelKey>,
    pub reason: String,
    pub client_message_id: Option<String>,
}

/// 频道多路复用器
#[derive(Debug, Clone)]
pub struct Multiplexer {
    user: CurrentUser,
    store: SharedStore,
    events: EventManager,
    notifications: NotificationCenter,
    direct: ListenerRegistry<String, ChannelUpdate>,
    direct_any: ListenerRegistry<(), ChannelUpdate>,
    group: ListenerRegistry<String, ChannelUpdate>,
    errors: ListenerRegistry<ChannelKey, MessageError>,
    errors_any: ListenerRegistry<(), MessageError>,
}

impl Multiplexer {
    pub fn new(
        user: CurrentUser,
        store: SharedStore,
        events: EventManager,
        notifications: NotificationCenter,
    ) -> Self {
        Self {
            user,
            store,
            events,
            notifications,
            direct: ListenerRegistry::new("direct"),
            direct_any: ListenerRegistry::new("direct-any"),
            group: ListenerRegistry::new("group"),
            errors: ListenerRegistry::new("message-error"),
            errors_any: ListenerRegistry::new("message-error-any"),
        }
    }

    /// 入站事件入口
    pub fn dispatch(&self, event: &ServerEvent) {
        match event {
            ServerEvent::NewMessage(payload) => {
                let Some(self_id) = self.user.user_id() else {
                    warn!("⚠️ 未登录，丢弃私聊消息 {}", payload.id);
                    return;
                };
                let message = Message::from_direct(payload.clone(), &self_id);
                self.merge(message, Some(&self_id));
            }
            ServerEvent::NewGroupMessage(payload) => {
                if !self.group.contains_key(&payload.group_id) {
                    debug!("群 {} 没有监听器，丢弃消息 {}", payload.group_id, payload.id);
                    return;
                }
                let self_id = self.user.user_id();
                self.merge(Message::from_group(payload.clone()), self_id.as_deref());
            }
            ServerEvent::NewNotification(payload) => {
                self.notifications.deliver(payload.clone());
            }
            ServerEvent::MessageError(payload) => self.route_error(payload),
        }
    }

    /// 合并一条确认消息并通知监听器；重复消息不通知
    pub fn merge(&self, message: Message, self_id: Option<&str>) -> ReconcileOutcome {
        let channel = message.channel.clone();
        let (outcome, unread) = {
            let mut store = self.store.lock();
            let outcome = store.reconcile(&channel, message.clone());
            let unread = match (self_id, store.channel(&channel)) {
                (Some(id), Some(log)) if !channel.is_group() => Some(log.unread_from_others(id)),
                _ => None,
            };
            (outcome, unread)
        };

        match &outcome {
            ReconcileOutcome::Duplicate => return outcome,
            ReconcileOutcome::Replaced { temp_id, .. } | ReconcileOutcome::Collapsed { temp_id } => {
                self.events.emit(event_builders::message_confirmed(
                    channel.clone(),
                    temp_id.clone(),
                    message.id.clone(),
                ));
            }
            ReconcileOutcome::Appended => {
                self.events.emit(event_builders::message_received(
                    channel.clone(),
                    message.id.clone(),
                    message.sender_id.clone(),
                    message.content.clone(),
                ));
            }
        }
        if let Some(unread) = unread {
            self.events
                .emit(event_builders::unread_count_changed(Some(channel.clone()), unread));
        }

        self.publish(&ChannelUpdate {
            channel,
            message,
            outcome: outcome.clone(),
        });
        outcome
    }

    /// 把一条本地变化通知给该频道的监听器
    pub fn publish(&self, update: &ChannelUpdate) {
        match &update.channel {
            ChannelKey::Direct(peer) => {
                self.direct.emit_key(peer, update);
                self.direct_any.emit(update);
            }
            ChannelKey::Group(group_id) => {
                self.group.emit_key(group_id, update);
            }
        }
    }

    fn route_error(&self, payload: &MessageErrorPayload) {
        let channel = payload
            .client_message_id
            .as_deref()
            .and_then(|key| self.store.lock().find_by_client_id(key))
            .map(|m| m.channel);
        warn!(
            "⚠️ 服务端拒绝消息: {} (频道: {:?})",
            payload.reason,
            channel.as_ref().map(ToString::to_string)
        );

        let error = MessageError {
            channel,
            reason: payload.reason.clone(),
            client_message_id: payload.client_message_id.clone(),
        };
        if let Some(channel) = &error.channel {
            self.errors.emit_key(channel, &error);
        }
        self.errors_any.emit(&error);
    }

    /// 订阅与某个用户的私聊
    pub fn subscribe_direct<F>(&self, peer_id: &str, callback: F) -> Subscription
    where
        F: Fn(&ChannelUpdate) + Send + Sync + 'static,
    {
        self.direct.subscribe_key(peer_id.to_string(), callback)
    }

    /// 订阅全部私聊（会话列表）
    pub fn subscribe_all_direct<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ChannelUpdate) + Send + Sync + 'static,
    {
        self.direct_any.subscribe(callback)
    }

    /// 订阅群消息；需同时通过房间跟踪器加入房间
    pub fn subscribe_group<F>(&self, group_id: &str, callback: F) -> Subscription
    where
        F: Fn(&ChannelUpdate) + Send + Sync + 'static,
    {
        self.group.subscribe_key(group_id.to_string(), callback)
    }

    /// 订阅某个频道的发送错误
    pub fn subscribe_errors<F>(&self, channel: &ChannelKey, callback: F) -> Subscription
    where
        F: Fn(&MessageError) + Send + Sync + 'static,
    {
        self.errors.subscribe_key(channel.clone(), callback)
    }

    /// 订阅全部发送错误
    pub fn subscribe_all_errors<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&MessageError) + Send + Sync + 'static,
    {
        self.errors_any.subscribe(callback)
    }

    pub fn group_listener_count(&self, group_id: &str) -> usize {
        self.group.len_key(&group_id.to_string())
    }

    pub fn direct_listener_count(&self, peer_id: &str) -> usize {
        self.direct.len_key(&peer_id.to_string())
    }

    /// 清空全部监听器（断开 / 登出）
    pub fn clear(&self) {
        self.direct.clear();
        self.direct_any.clear();
        self.group.clear();
        self.errors.clear();
        self.errors_any.clear();
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::test_helpers::InMemoryChatApi;
    use crate::protocol::{DirectMessagePayload, GroupMessagePayload, NotificationPayload};
    use crate::sdk::SessionUser;
    use crate::store::{MessageStore, OptimisticDraft};
    use crate::utils::from_millis;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn mux() -> Multiplexer {
        let user = CurrentUser::new();
        user.set(SessionUser {
            user_id: "me".into(),
            display_name: "Me".into(),
        });
        let events = EventManager::new(32);
        let notifications =
            NotificationCenter::new(Arc::new(InMemoryChatApi::new("me")), events.clone(), 20);
        Multiplexer::new(
            user,
            Arc::new(Mutex::new(MessageStore::default())),
            events,
            notifications,
        )
    }

    fn direct(id: &str, from: &str, to: &str, content: &str, at: i64) -> ServerEvent {
        ServerEvent::NewMessage(DirectMessagePayload {
            id: id.into(),
            sender_id: from.into(),
            receiver_id: to.into(),
            content: content.into(),
            created_at: from_millis(at),
            is_read: false,
            sender_name: None,
            client_message_id: None,
        })
    }

    fn group(id: &str, group_id: &str, at: i64) -> ServerEvent {
        ServerEvent::NewGroupMessage(GroupMessagePayload {
            id: id.into(),
            group_id: group_id.into(),
            sender_id: "p".into(),
            sender_email: Some("p@example.com".into()),
            content: "hi".into(),
            created_at: from_millis(at),
            client_message_id: None,
        })
    }

    #[test]
    fn test_direct_routed_by_peer_and_duplicates_suppressed() {
        let mux = mux();
        let peer_hits = Arc::new(Mutex::new(Vec::new()));
        let all_hits = Arc::new(Mutex::new(0usize));

        let p = peer_hits.clone();
        let _s1 = mux.subscribe_direct("alice", move |u| p.lock().push(u.message.id.clone()));
        let a = all_hits.clone();
        let _s2 = mux.subscribe_all_direct(move |_| *a.lock() += 1);

        mux.dispatch(&direct("1", "alice", "me", "hola", 10));
        mux.dispatch(&direct("2", "me", "alice", "hey", 20));
        mux.dispatch(&direct("3", "bob", "me", "yo", 30));
        // 同一条消息经另一条路径再到一次
        mux.dispatch(&direct("1", "alice", "me", "hola", 10));

        assert_eq!(*peer_hits.lock(), vec!["1", "2"]);
        assert_eq!(*all_hits.lock(), 3);
        assert_eq!(mux.store().lock().messages(&ChannelKey::direct("alice")).len(), 2);
    }

    #[test]
    fn test_group_listener_isolation_during_dispatch() {
        let mux = mux();
        let received = Arc::new(Mutex::new(Vec::new()));

        let r1 = received.clone();
        let _l1 = mux.subscribe_group("G1", move |_| r1.lock().push(1));

        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let r2 = received.clone();
        let slot_cb = slot.clone();
        let l2 = mux.subscribe_group("G1", move |_| {
            r2.lock().push(2);
            if let Some(sub) = slot_cb.lock().take() {
                sub.unsubscribe();
            }
        });
        *slot.lock() = Some(l2);

        let r3 = received.clone();
        let _l3 = mux.subscribe_group("G1", move |_| r3.lock().push(3));

        mux.dispatch(&group("g1", "G1", 10));
        assert_eq!(*received.lock(), vec![1, 2, 3]);
        assert_eq!(mux.group_listener_count("G1"), 2);
    }

    #[test]
    fn test_group_without_listener_is_dropped() {
        let mux = mux();
        mux.dispatch(&group("g1", "G9", 10));
        assert!(mux.store().lock().messages(&ChannelKey::group("G9")).is_empty());
    }

    #[test]
    fn test_message_error_routed_by_client_id() {
        let mux = mux();
        let channel = ChannelKey::direct("alice");
        mux.store().lock().record_optimistic(
            &channel,
            OptimisticDraft {
                sender_id: "me".into(),
                sender_display: "Me".into(),
                content: "too long".into(),
                created_at: from_millis(10),
                client_message_id: Some("k1".into()),
            },
        );

        let scoped = Arc::new(Mutex::new(Vec::new()));
        let global = Arc::new(Mutex::new(0usize));
        let s = scoped.clone();
        let _e1 = mux.subscribe_errors(&channel, move |e| s.lock().push(e.clone()));
        let g = global.clone();
        let _e2 = mux.subscribe_all_errors(move |_| *g.lock() += 1);

        mux.dispatch(&ServerEvent::MessageError(MessageErrorPayload {
            reason: "rejected".into(),
            client_message_id: Some("k1".into()),
        }));
        mux.dispatch(&ServerEvent::MessageError(MessageErrorPayload {
            reason: "generic".into(),
            client_message_id: None,
        }));

        let scoped = scoped.lock();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].channel, Some(channel));
        assert_eq!(*global.lock(), 2);
    }

    #[test]
    fn test_notifications_forwarded_and_clear_detaches() {
        let mux = mux();
        let hits = Arc::new(Mutex::new(0usize));
        let h = hits.clone();
        let _sub = mux.notifications.subscribe(move |_| *h.lock() += 1);
        let d = Arc::new(Mutex::new(0usize));
        let dc = d.clone();
        let _direct = mux.subscribe_all_direct(move |_| *dc.lock() += 1);

        let notification = ServerEvent::NewNotification(NotificationPayload {
            id: "n1".into(),
            user_id: None,
            kind: "level_up".into(),
            title: "Level 3".into(),
            message: "Nice".into(),
            read: false,
            data: None,
            created_at: from_millis(5),
        });
        mux.dispatch(&notification);
        assert_eq!(*hits.lock(), 1);

        mux.clear();
        mux.dispatch(&direct("9", "alice", "me", "after", 50));
        assert_eq!(*d.lock(), 0);
    }
}
