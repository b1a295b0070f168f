//! 聊天界面生命周期
//!
//! 一个 `ChatSurface` 对应一个打开的会话窗口（私聊或群聊）：
//! - `mount()`：注册频道监听器，群聊加入房间，加载首页历史，启动回退轮询
//! - `unmount()`：注销监听器，离开房间，停止轮询；幂等
//! - `send()`：先写入乐观消息，socket 可用走 socket，否则走 REST 回退；失败时撤回并带回原文
//!
//! 卸载后到达的历史 / 轮询结果直接丢弃（由 `mounted` 标记守护）。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::ConnectionManager;
use crate::error::{Result, SdkError, SendFailureReason};
use crate::events::{event_builders, EventManager, SendPath};
use crate::http_client::{ChatApi, PageRequest};
use crate::listeners::{ListenerRegistry, Subscription};
use crate::multiplexer::{ChannelUpdate, MessageError, Multiplexer};
use crate::poller::{FallbackPoller, PollerStats};
use crate::protocol::{ClientCommand, MarkAsReadRequest, SendGroupMessageRequest, SendMessageRequest};
use crate::rate_limiter::MessageRateLimiter;
use crate::rooms::RoomTracker;
use crate::sdk::{CurrentUser, SessionUser};
use crate::store::{ChannelKey, Message, OptimisticDraft, ReconcileOutcome};

/// 界面共享的会话级组件
#[derive(Clone)]
pub(crate) struct SurfaceContext {
    pub user: CurrentUser,
    pub connection: ConnectionManager,
    pub api: Arc<dyn ChatApi>,
    pub multiplexer: Multiplexer,
    pub rooms: RoomTracker,
    pub events: EventManager,
    pub limiter: Arc<MessageRateLimiter>,
    pub poll_interval: Duration,
    pub page_size: usize,
    pub surfaces: MountedSurfaces,
}

/// 会话内已挂载的界面，断开 / 登出时统一卸载
#[derive(Clone, Default)]
pub(crate) struct MountedSurfaces {
    inner: Arc<Mutex<Vec<Weak<SurfaceInner>>>>,
}

impl MountedSurfaces {
    fn register(&self, surface: &Arc<SurfaceInner>) {
        let weak = Arc::downgrade(surface);
        let mut surfaces = self.inner.lock();
        surfaces.retain(|w| w.strong_count() > 0);
        if !surfaces.iter().any(|w| w.ptr_eq(&weak)) {
            surfaces.push(weak);
        }
    }

    /// 卸载全部仍挂载的界面（注销监听、停止轮询），返回卸载数
    pub fn detach_all(&self) -> usize {
        let surfaces: Vec<Arc<SurfaceInner>> = std::mem::take(&mut *self.inner.lock())
            .into_iter()
            .filter_map(|w| w.upgrade())
            .collect();
        let mut detached = 0;
        for surface in &surfaces {
            if surface.mounted.load(Ordering::Acquire) {
                surface.detach();
                detached += 1;
            }
        }
        detached
    }
}

/// 一次发送失败，供界面把原文恢复到输入框
#[derive(Debug, Clone, PartialEq)]
pub struct SendFailure {
    pub channel: ChannelKey,
    pub temp_id: String,
    pub content: String,
    pub reason: SendFailureReason,
}

struct SurfaceInner {
    channel: ChannelKey,
    ctx: SurfaceContext,
    mounted: AtomicBool,
    subscriptions: Mutex<Vec<Subscription>>,
    poller: FallbackPoller,
    history_offset: Mutex<usize>,
    updates: ListenerRegistry<(), ChannelUpdate>,
    send_failures: ListenerRegistry<(), SendFailure>,
}

/// 聊天界面
#[derive(Clone)]
pub struct ChatSurface {
    inner: Arc<SurfaceInner>,
}

impl std::fmt::Debug for ChatSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSurface")
            .field("channel", &self.inner.channel)
            .field("mounted", &self.is_mounted())
            .finish()
    }
}

impl ChatSurface {
    pub(crate) fn new(channel: ChannelKey, ctx: SurfaceContext) -> Self {
        let poller = FallbackPoller::new(format!("poll:{}", channel));
        Self {
            inner: Arc::new(SurfaceInner {
                channel,
                ctx,
                mounted: AtomicBool::new(false),
                subscriptions: Mutex::new(Vec::new()),
                poller,
                history_offset: Mutex::new(0),
                updates: ListenerRegistry::new("surface-updates"),
                send_failures: ListenerRegistry::new("surface-send-failures"),
            }),
        }
    }

    pub fn channel(&self) -> &ChannelKey {
        &self.inner.channel
    }

    pub fn is_mounted(&self) -> bool {
        self.inner.mounted.load(Ordering::Acquire)
    }

    /// 挂载界面；重复挂载直接返回
    ///
    /// 首页历史加载失败不会阻止挂载，由轮询补齐。
    pub async fn mount(&self) -> Result<()> {
        if self.inner.ctx.user.get().is_none() {
            return Err(SdkError::AuthExpired("未登录，无法打开会话".to_string()));
        }
        if self.inner.mounted.swap(true, Ordering::AcqRel) {
            debug!("界面 {} 已挂载，忽略", self.inner.channel);
            return Ok(());
        }
        info!("🪟 挂载界面 {}", self.inner.channel);
        self.inner.ctx.surfaces.register(&self.inner);

        let subscriptions = self.register_listeners();
        *self.inner.subscriptions.lock() = subscriptions;

        if let ChannelKey::Group(group_id) = &self.inner.channel {
            self.inner.ctx.rooms.join_group(group_id);
        }

        *self.inner.history_offset.lock() = 0;
        match self.inner.fetch_page(PageRequest::first(self.inner.ctx.page_size)).await {
            Ok(fetched) => *self.inner.history_offset.lock() = fetched,
            Err(e) => warn!("⚠️ 界面 {} 首页历史加载失败，等待轮询补齐: {}", self.inner.channel, e),
        }

        if self.is_mounted() {
            self.start_poller()?;
        }
        Ok(())
    }

    /// 卸载界面（幂等）
    pub fn unmount(&self) {
        self.inner.detach();
    }

    fn register_listeners(&self) -> Vec<Subscription> {
        let mux = &self.inner.ctx.multiplexer;
        let weak = Arc::downgrade(&self.inner);

        let on_update = {
            let weak = weak.clone();
            move |update: &ChannelUpdate| {
                if let Some(inner) = weak.upgrade() {
                    inner.updates.emit(update);
                }
            }
        };
        let updates = match &self.inner.channel {
            ChannelKey::Direct(peer) => mux.subscribe_direct(peer, on_update),
            ChannelKey::Group(group_id) => mux.subscribe_group(group_id, on_update),
        };

        let errors = mux.subscribe_errors(&self.inner.channel, move |error: &MessageError| {
            if let Some(inner) = weak.upgrade() {
                inner.on_message_error(error);
            }
        });

        vec![updates, errors]
    }

    fn start_poller(&self) -> Result<()> {
        let weak: Weak<SurfaceInner> = Arc::downgrade(&self.inner);
        self.inner.poller.start(self.inner.ctx.poll_interval, move || {
            let weak = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return Ok(0);
                };
                let page = PageRequest::first(inner.ctx.page_size);
                inner.fetch_page(page).await.map_err(|e| {
                    inner
                        .ctx
                        .events
                        .emit(event_builders::poll_failed(inner.channel.clone(), e.to_string()));
                    e
                })
            }
        })
    }

    /// 发送一条消息
    ///
    /// 返回已写入存储的消息：socket 路径为乐观消息，REST 回退路径为服务端确认后的消息。
    /// 失败时乐观消息被撤回，错误为携带原文的 `SdkError::SendFailed`。
    pub async fn send(&self, content: &str) -> Result<Message> {
        if !self.is_mounted() {
            return Err(SdkError::NotMounted);
        }
        if content.trim().is_empty() {
            return Err(SdkError::InvalidArgument("消息内容不能为空".to_string()));
        }
        let user = self
            .inner
            .ctx
            .user
            .get()
            .ok_or_else(|| SdkError::AuthExpired("未登录，无法发送".to_string()))?;

        let channel = self.inner.channel.clone();
        self.inner
            .ctx
            .limiter
            .check_send(channel.is_group())
            .map_err(SdkError::RateLimited)?;

        let client_message_id = Uuid::new_v4().to_string();
        let optimistic = self.record_optimistic(&user, content, &client_message_id);
        let temp_id = optimistic.id.clone();

        if self.inner.ctx.connection.is_connected() {
            match self.inner.ctx.connection.emit(&self.command(content, &client_message_id)) {
                Ok(()) => {
                    self.inner.ctx.events.emit(event_builders::message_sent(
                        channel,
                        temp_id,
                        SendPath::Socket,
                    ));
                    return Ok(optimistic);
                }
                Err(e) => debug!("socket 发送失败，改走 REST: {}", e),
            }
        }

        match self.send_via_rest(&user, content, &client_message_id).await {
            Ok(confirmed) => {
                self.inner.ctx.events.emit(event_builders::message_sent(
                    channel,
                    temp_id,
                    SendPath::RestFallback,
                ));
                Ok(confirmed)
            }
            Err(e) => {
                let error = e.into_send_failure(content);
                self.inner.fail_send(&temp_id, &error);
                Err(error)
            }
        }
    }

    fn record_optimistic(&self, user: &SessionUser, content: &str, client_message_id: &str) -> Message {
        let channel = &self.inner.channel;
        let draft = OptimisticDraft {
            sender_id: user.user_id.clone(),
            sender_display: user.display_name.clone(),
            content: content.to_string(),
            created_at: chrono::Utc::now(),
            client_message_id: Some(client_message_id.to_string()),
        };
        let message = self
            .inner
            .ctx
            .multiplexer
            .store()
            .lock()
            .record_optimistic(channel, draft);
        self.inner.ctx.multiplexer.publish(&ChannelUpdate {
            channel: channel.clone(),
            message: message.clone(),
            outcome: ReconcileOutcome::Appended,
        });
        message
    }

    fn command(&self, content: &str, client_message_id: &str) -> ClientCommand {
        let client_message_id = Some(client_message_id.to_string());
        match &self.inner.channel {
            ChannelKey::Direct(peer) => ClientCommand::SendMessage(SendMessageRequest {
                receiver_id: peer.clone(),
                content: content.to_string(),
                client_message_id,
            }),
            ChannelKey::Group(group_id) => ClientCommand::SendGroupMessage(SendGroupMessageRequest {
                group_id: group_id.clone(),
                content: content.to_string(),
                client_message_id,
            }),
        }
    }

    async fn send_via_rest(&self, user: &SessionUser, content: &str, client_message_id: &str) -> Result<Message> {
        let api = &self.inner.ctx.api;
        let client_message_id = Some(client_message_id.to_string());
        let confirmed = match &self.inner.channel {
            ChannelKey::Direct(peer) => {
                let request = SendMessageRequest {
                    receiver_id: peer.clone(),
                    content: content.to_string(),
                    client_message_id,
                };
                Message::from_direct(api.send_direct(&request).await?, &user.user_id)
            }
            ChannelKey::Group(group_id) => {
                let request = SendGroupMessageRequest {
                    group_id: group_id.clone(),
                    content: content.to_string(),
                    client_message_id,
                };
                Message::from_group(api.send_group(&request).await?)
            }
        };
        // 自己的消息即使界面已卸载也合并，存储属于会话而不是界面
        self.inner
            .ctx
            .multiplexer
            .merge(confirmed.clone(), Some(&user.user_id));
        Ok(confirmed)
    }

    /// 加载下一页更早的历史，返回本页条数
    ///
    /// 历史接口按时间倒序分页：offset 0 为最新一页，偏移越大越早。
    /// 合并后按时间排序，所以更早的消息落在日志前部。
    pub async fn load_more_history(&self) -> Result<usize> {
        if !self.is_mounted() {
            return Err(SdkError::NotMounted);
        }
        let offset = *self.inner.history_offset.lock();
        let page = PageRequest {
            limit: self.inner.ctx.page_size,
            offset,
        };
        let fetched = self.inner.fetch_page(page).await?;
        *self.inner.history_offset.lock() += fetched;
        Ok(fetched)
    }

    /// 标记会话已读
    ///
    /// 本地立即翻转；socket 可用时发送 `mark_as_read`，否则走 REST。
    /// REST 失败只记日志，本地翻转保留，由后续历史页校正。群聊没有已读状态，返回 0。
    pub async fn mark_read(&self) -> Result<usize> {
        let ChannelKey::Direct(peer) = &self.inner.channel else {
            return Ok(0);
        };
        let self_id = self
            .inner
            .ctx
            .user
            .user_id()
            .ok_or_else(|| SdkError::AuthExpired("未登录".to_string()))?;

        let flipped = self
            .inner
            .ctx
            .multiplexer
            .store()
            .lock()
            .mark_channel_read(&self.inner.channel, &self_id);
        if flipped == 0 {
            return Ok(0);
        }
        self.inner
            .ctx
            .events
            .emit(event_builders::unread_count_changed(Some(self.inner.channel.clone()), 0));

        let command = ClientCommand::MarkAsRead(MarkAsReadRequest {
            other_user_id: peer.clone(),
        });
        let sent = self.inner.ctx.connection.is_connected()
            && self.inner.ctx.connection.emit(&command).is_ok();
        if !sent {
            if let Err(e) = self.inner.ctx.api.mark_conversation_read(peer).await {
                warn!("⚠️ 标记会话 {} 已读失败，保留本地状态: {}", peer, e);
            }
        }
        Ok(flipped)
    }

    /// 清空会话历史：REST 删除成功后才清本地
    pub async fn clear_history(&self) -> Result<usize> {
        let ChannelKey::Direct(peer) = &self.inner.channel else {
            return Err(SdkError::InvalidArgument("群聊历史不支持清空".to_string()));
        };
        self.inner.ctx.api.delete_conversation(peer).await?;
        let removed = self
            .inner
            .ctx
            .multiplexer
            .store()
            .lock()
            .clear_channel(&self.inner.channel);
        *self.inner.history_offset.lock() = 0;
        info!("🧹 已清空会话 {} 的 {} 条消息", peer, removed);
        Ok(removed)
    }

    /// 当前频道的消息快照
    pub fn messages(&self) -> Vec<Message> {
        self.inner.ctx.multiplexer.store().lock().messages(&self.inner.channel)
    }

    /// 频道变化监听（重新渲染）
    pub fn on_update<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ChannelUpdate) + Send + Sync + 'static,
    {
        self.inner.updates.subscribe(callback)
    }

    /// 发送失败监听（含服务端 `message_error`）
    pub fn on_send_failure<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SendFailure) + Send + Sync + 'static,
    {
        self.inner.send_failures.subscribe(callback)
    }

    pub fn poller_stats(&self) -> PollerStats {
        self.inner.poller.stats()
    }

    pub fn is_polling(&self) -> bool {
        self.inner.poller.is_running()
    }
}

impl SurfaceInner {
    /// 拉取一页历史并走合并路径；界面已卸载时丢弃结果
    async fn fetch_page(&self, page: PageRequest) -> Result<usize> {
        let self_id = self.ctx.user.user_id();
        let messages: Vec<Message> = match &self.channel {
            ChannelKey::Direct(peer) => {
                let id = self_id
                    .clone()
                    .ok_or_else(|| SdkError::AuthExpired("未登录".to_string()))?;
                self.ctx
                    .api
                    .conversation_history(peer, page)
                    .await?
                    .into_iter()
                    .map(|payload| Message::from_direct(payload, &id))
                    .collect()
            }
            ChannelKey::Group(group_id) => self
                .ctx
                .api
                .group_history(group_id, page)
                .await?
                .into_iter()
                .map(Message::from_group)
                .collect(),
        };

        if !self.mounted.load(Ordering::Acquire) {
            debug!("界面 {} 已卸载，丢弃 {} 条历史", self.channel, messages.len());
            return Ok(0);
        }

        let fetched = messages.len();
        let mut ordered = messages;
        ordered.sort_by_key(|m| m.created_at);
        for message in ordered {
            self.ctx.multiplexer.merge(message, self_id.as_deref());
        }
        Ok(fetched)
    }

    fn on_message_error(&self, error: &MessageError) {
        let Some(key) = error.client_message_id.as_deref() else {
            return;
        };
        let pending = self.ctx.multiplexer.store().lock().find_by_client_id(key);
        let Some(pending) = pending.filter(|m| m.is_optimistic()) else {
            return;
        };
        let failure = SdkError::SendFailed {
            content: pending.content.clone(),
            reason: SendFailureReason::Rejected(error.reason.clone()),
            message: error.reason.clone(),
        };
        self.fail_send(&pending.id, &failure);
    }

    /// 撤回乐观消息并通知界面
    fn fail_send(&self, temp_id: &str, error: &SdkError) {
        let reverted = self
            .ctx
            .multiplexer
            .store()
            .lock()
            .revert_optimistic(&self.channel, temp_id);
        let Some(reverted) = reverted else {
            debug!("乐观消息 {} 已不存在，跳过撤回", temp_id);
            return;
        };
        warn!("❌ 发送失败，已撤回 {}: {}", temp_id, error);

        let reason = SendFailureReason::classify(error);
        self.ctx.events.emit(event_builders::message_send_failed(
            self.channel.clone(),
            temp_id.to_string(),
            reverted.content.clone(),
            error.to_string(),
        ));
        self.send_failures.emit(&SendFailure {
            channel: self.channel.clone(),
            temp_id: temp_id.to_string(),
            content: reverted.content,
            reason,
        });
    }

    fn detach(&self) {
        if !self.mounted.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("🪟 卸载界面 {}", self.channel);
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        drop(subscriptions);
        self.poller.stop();
        if let ChannelKey::Group(group_id) = &self.channel {
            self.ctx.rooms.leave_group(group_id);
        }
        self.updates.clear();
        self.send_failures.clear();
    }
}

impl Drop for SurfaceInner {
    fn drop(&mut self) {
        // 漏掉 unmount 的界面在释放时补做
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionConfig;
    use crate::http_client::test_helpers::InMemoryChatApi;
    use crate::notifications::NotificationCenter;
    use crate::protocol::{DirectMessagePayload, GroupMessagePayload, MessageErrorPayload, ServerEvent};
    use crate::rate_limiter::MessageRateLimiterConfig;
    use crate::store::{MessageState, MessageStore};
    use crate::transport::memory::{MemoryPeer, MemoryTransport};
    use crate::utils::from_millis;

    struct Harness {
        ctx: SurfaceContext,
        api: Arc<InMemoryChatApi>,
        transport: MemoryTransport,
        _inbound: Subscription,
    }

    fn harness() -> Harness {
        let user = CurrentUser::new();
        user.set(SessionUser {
            user_id: "me".into(),
            display_name: "Me".into(),
        });
        let api = Arc::new(InMemoryChatApi::new("me"));
        let events = EventManager::new(64);
        let transport = MemoryTransport::new();
        let connection = ConnectionManager::new(
            Arc::new(transport.clone()),
            ConnectionConfig {
                socket_url: "ws://chat.test/ws".into(),
                ..Default::default()
            },
            events.clone(),
        );
        let notifications = NotificationCenter::new(api.clone(), events.clone(), 20);
        let multiplexer = Multiplexer::new(
            user.clone(),
            Arc::new(Mutex::new(MessageStore::default())),
            events.clone(),
            notifications,
        );
        let mux = multiplexer.clone();
        let inbound = connection.on_inbound(move |event| mux.dispatch(event));
        let rooms = RoomTracker::new(connection.clone(), events.clone());
        Harness {
            ctx: SurfaceContext {
                user,
                connection,
                api: api.clone(),
                multiplexer,
                rooms,
                events,
                limiter: Arc::new(MessageRateLimiter::new(MessageRateLimiterConfig::default())),
                poll_interval: Duration::from_secs(5),
                page_size: 50,
                surfaces: MountedSurfaces::default(),
            },
            api,
            transport,
            _inbound: inbound,
        }
    }

    async fn connected(h: &Harness) -> MemoryPeer {
        h.ctx.connection.connect("tok").await.unwrap();
        h.transport.accept().await.unwrap()
    }

    fn direct(id: &str, from: &str, to: &str, content: &str, at: i64, key: Option<&str>) -> DirectMessagePayload {
        DirectMessagePayload {
            id: id.into(),
            sender_id: from.into(),
            receiver_id: to.into(),
            content: content.into(),
            created_at: from_millis(at),
            is_read: false,
            sender_name: None,
            client_message_id: key.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_mount_loads_history_and_socket_send_reconciles() {
        let h = harness();
        h.api.seed_direct(direct("1", "alice", "me", "hi", 10, None));
        let mut peer = connected(&h).await;

        let surface = ChatSurface::new(ChannelKey::direct("alice"), h.ctx.clone());
        surface.mount().await.unwrap();
        assert_eq!(surface.messages().len(), 1);
        assert!(surface.is_polling());

        let sent = surface.send("Hola").await.unwrap();
        assert_eq!(sent.state, MessageState::Optimistic);
        let frames = peer.drain();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "send_message");
        let key = frames[0].data["clientMessageId"].as_str().unwrap().to_string();

        // 服务端回显
        let mut echo = direct("42", "me", "alice", "Hola", sent.created_at.timestamp_millis() + 80, Some(&key));
        echo.is_read = true;
        peer.push(&ServerEvent::NewMessage(echo)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let messages = surface.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].id, "42");
        assert_eq!(messages[1].state, MessageState::Confirmed);
        surface.unmount();
    }

    #[tokio::test]
    async fn test_rest_fallback_when_disconnected() {
        let h = harness();
        let surface = ChatSurface::new(ChannelKey::direct("alice"), h.ctx.clone());
        surface.mount().await.unwrap();

        let confirmed = surface.send("Hola").await.unwrap();
        assert_eq!(confirmed.state, MessageState::Confirmed);
        assert_eq!(h.api.call_count("send_direct"), 1);
        let messages = surface.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, confirmed.id);
    }

    #[tokio::test]
    async fn test_failed_send_reverts_and_restores_content() {
        let h = harness();
        let surface = ChatSurface::new(ChannelKey::direct("alice"), h.ctx.clone());
        surface.mount().await.unwrap();

        let failures = Arc::new(Mutex::new(Vec::new()));
        let f = failures.clone();
        let _sub = surface.on_send_failure(move |failure| f.lock().push(failure.content.clone()));

        h.api.fail_next(0);
        let err = surface.send("Hola").await.unwrap_err();
        assert_eq!(err.restored_content(), Some("Hola"));
        assert!(surface.messages().is_empty());
        assert_eq!(*failures.lock(), vec!["Hola".to_string()]);
    }

    #[tokio::test]
    async fn test_message_error_reverts_pending_send() {
        let h = harness();
        let mut peer = connected(&h).await;
        let surface = ChatSurface::new(ChannelKey::direct("alice"), h.ctx.clone());
        surface.mount().await.unwrap();

        let failures = Arc::new(Mutex::new(Vec::new()));
        let f = failures.clone();
        let _sub = surface.on_send_failure(move |failure| f.lock().push(failure.clone()));

        surface.send("blocked words").await.unwrap();
        let frames = peer.drain();
        let key = frames[0].data["clientMessageId"].as_str().unwrap().to_string();
        peer.push(&ServerEvent::MessageError(MessageErrorPayload {
            reason: "content rejected".into(),
            client_message_id: Some(key),
        }))
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(surface.messages().is_empty());
        let failures = failures.lock();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].content, "blocked words");
        assert!(!failures[0].reason.is_retryable());
    }

    #[tokio::test]
    async fn test_group_surface_joins_and_leaves_room() {
        let h = harness();
        let mut peer = connected(&h).await;
        h.api.seed_group(GroupMessagePayload {
            id: "g1".into(),
            group_id: "G1".into(),
            sender_id: "p".into(),
            sender_email: None,
            content: "welcome".into(),
            created_at: from_millis(5),
            client_message_id: None,
        });

        let surface = ChatSurface::new(ChannelKey::group("G1"), h.ctx.clone());
        surface.mount().await.unwrap();
        assert_eq!(h.ctx.rooms.ref_count("G1"), 1);
        assert_eq!(surface.messages().len(), 1);
        assert_eq!(peer.drain()[0].event, "join_group");

        surface.unmount();
        surface.unmount();
        assert_eq!(h.ctx.rooms.ref_count("G1"), 0);
        assert_eq!(h.ctx.multiplexer.group_listener_count("G1"), 0);
        assert!(!surface.is_polling());
        let frames = peer.drain();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "leave_group");
    }

    #[tokio::test]
    async fn test_mark_read_falls_back_to_rest() {
        let h = harness();
        h.api.seed_direct(direct("1", "alice", "me", "hi", 10, None));
        h.api.seed_direct(direct("2", "alice", "me", "there", 20, None));
        let surface = ChatSurface::new(ChannelKey::direct("alice"), h.ctx.clone());
        surface.mount().await.unwrap();

        h.api.fail_next(500);
        assert_eq!(surface.mark_read().await.unwrap(), 2);
        assert!(surface.messages().iter().all(|m| m.is_read));
        assert_eq!(h.api.call_count("mark_conversation_read"), 1);
        assert_eq!(surface.mark_read().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_send_requires_mount_and_respects_rate_limit() {
        let mut h = harness();
        h.ctx.limiter = Arc::new(MessageRateLimiter::new(MessageRateLimiterConfig {
            private_message_per_second: 1.0,
            group_message_per_second: 1.0,
            burst_multiplier: 1.0,
        }));
        let surface = ChatSurface::new(ChannelKey::direct("alice"), h.ctx.clone());
        assert!(matches!(surface.send("x").await, Err(SdkError::NotMounted)));

        surface.mount().await.unwrap();
        surface.send("one").await.unwrap();
        assert!(matches!(surface.send("two").await, Err(SdkError::RateLimited(_))));
        assert_eq!(surface.messages().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_collapses_duplicates_and_stops_on_unmount() {
        let h = harness();
        let surface = ChatSurface::new(ChannelKey::direct("alice"), h.ctx.clone());
        surface.mount().await.unwrap();

        h.api.seed_direct(direct("7", "alice", "me", "ping", 100, None));
        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(surface.messages().len(), 1);

        h.api.fail_next(503);
        tokio::time::sleep(Duration::from_secs(5)).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(surface.messages().len(), 1);
        let stats = surface.poller_stats();
        assert_eq!(stats.ticks, 3);
        assert_eq!(stats.failures, 1);

        surface.unmount();
        let calls = h.api.call_count("conversation_history");
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.api.call_count("conversation_history"), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_pages_walk_backwards_while_poller_sees_newest() {
        let mut h = harness();
        h.ctx.page_size = 2;
        for i in 1..=5 {
            h.api.seed_direct(direct(&i.to_string(), "alice", "me", "m", i * 10, None));
        }
        let ids = |surface: &ChatSurface| -> Vec<String> {
            surface.messages().into_iter().map(|m| m.id).collect()
        };

        let surface = ChatSurface::new(ChannelKey::direct("alice"), h.ctx.clone());
        surface.mount().await.unwrap();
        assert_eq!(ids(&surface), vec!["4", "5"]);

        assert_eq!(surface.load_more_history().await.unwrap(), 2);
        assert_eq!(ids(&surface), vec!["2", "3", "4", "5"]);

        // 轮询拉最新一页：历史已超过一页也能看到新消息
        h.api.seed_direct(direct("6", "alice", "me", "new", 60, None));
        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(ids(&surface), vec!["2", "3", "4", "5", "6"]);

        // 新消息让偏移后移，重叠部分被去重，不会漏掉更早的消息
        surface.load_more_history().await.unwrap();
        surface.load_more_history().await.unwrap();
        assert_eq!(ids(&surface), vec!["1", "2", "3", "4", "5", "6"]);
        assert_eq!(surface.load_more_history().await.unwrap(), 0);
        surface.unmount();
    }

    #[tokio::test(start_paused = true)]
    async fn test_detach_all_stops_mounted_pollers() {
        let h = harness();
        let direct_surface = ChatSurface::new(ChannelKey::direct("alice"), h.ctx.clone());
        let idle = ChatSurface::new(ChannelKey::direct("bob"), h.ctx.clone());
        direct_surface.mount().await.unwrap();
        direct_surface.mount().await.unwrap();
        assert!(direct_surface.is_polling());

        assert_eq!(h.ctx.surfaces.detach_all(), 1);
        assert!(!direct_surface.is_mounted());
        assert!(!direct_surface.is_polling());
        assert!(!idle.is_mounted());

        let calls = h.api.call_count("conversation_history");
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.api.call_count("conversation_history"), calls);
        assert_eq!(h.ctx.surfaces.detach_all(), 0);
    }

    #[tokio::test]
    async fn test_clear_history_after_rest_delete() {
        let h = harness();
        h.api.seed_direct(direct("1", "alice", "me", "hi", 10, None));
        let surface = ChatSurface::new(ChannelKey::direct("alice"), h.ctx.clone());
        surface.mount().await.unwrap();

        h.api.fail_next(500);
        assert!(surface.clear_history().await.is_err());
        assert_eq!(surface.messages().len(), 1);

        assert_eq!(surface.clear_history().await.unwrap(), 1);
        assert!(surface.messages().is_empty());

        let group = ChatSurface::new(ChannelKey::group("G1"), h.ctx.clone());
        assert!(group.clear_history().await.is_err());
    }
}
