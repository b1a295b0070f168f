//! 统一 SDK 接口 - WanderchatSDK 主入口
//!
//! 分层结构：
//! ```text
//! WanderchatSDK (会话级门面)
//!   ├── ConnectionManager (唯一 socket 链路)
//!   ├── Multiplexer + RoomTracker (入站分流 / 群房间)
//!   ├── MessageStore (乐观消息 + 合并)
//!   ├── NotificationCenter / UnreadCounters
//!   ├── ChatSurface (每个打开的会话窗口)
//!   └── EventManager (SDK 事件流)
//! ```
//!
//! 一个实例对应一个登录会话：`connect()` 建立链路，`logout()` 清空全部派生状态，
//! 避免旧会话的事件投递给新会话。

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::connection::{ConnectionConfig, ConnectionManager};
use crate::connection_state::{ConnectionState, ConnectionStatus};
use crate::error::{Result, SdkError};
use crate::events::{EventManager, SDKEvent};
use crate::http_client::{ChatApi, RestClient};
use crate::listeners::Subscription;
use crate::multiplexer::Multiplexer;
use crate::notifications::NotificationCenter;
use crate::rate_limiter::{MessageRateLimiter, MessageRateLimiterConfig, ReconnectConfig};
use crate::rooms::RoomTracker;
use crate::store::{ChannelKey, Conversation, MessageStore, ReconcileConfig, SharedStore};
use crate::surface::{ChatSurface, MountedSurfaces, SurfaceContext};
use crate::transport::{Transport, WebSocketTransport};
use crate::unread::UnreadCounters;

/// HTTP 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpClientConfig {
    /// 连接超时（秒）
    pub connect_timeout_secs: Option<u64>,
    /// 请求超时（秒）
    pub request_timeout_secs: Option<u64>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: Some(30),
            request_timeout_secs: Some(60),
        }
    }
}

/// Wanderchat SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WanderchatConfig {
    /// socket 地址，例如 `wss://api.example.com/ws`
    pub socket_url: String,
    /// REST 基础地址，例如 `https://api.example.com`
    pub api_base_url: String,
    /// HTTP 客户端配置
    pub http_client_config: HttpClientConfig,
    /// 回退轮询间隔（毫秒）
    pub poll_interval_ms: u64,
    /// 历史分页大小
    pub history_page_size: usize,
    /// 乐观消息合并参数
    pub reconcile: ReconcileConfig,
    /// 重连退避
    pub reconnect: ReconnectConfig,
    /// 连接超时（毫秒）
    pub connect_timeout_ms: u64,
    /// 发送限流
    pub message_rate_limit: MessageRateLimiterConfig,
    /// 事件广播缓冲区大小
    pub event_buffer_size: usize,
    /// 调试模式
    pub debug_mode: bool,
}

impl Default for WanderchatConfig {
    fn default() -> Self {
        Self {
            socket_url: String::new(),
            api_base_url: String::new(),
            http_client_config: HttpClientConfig::default(),
            poll_interval_ms: 5_000,
            history_page_size: 50,
            reconcile: ReconcileConfig::default(),
            reconnect: ReconnectConfig::default(),
            connect_timeout_ms: 10_000,
            message_rate_limit: MessageRateLimiterConfig::default(),
            event_buffer_size: 256,
            debug_mode: false,
        }
    }
}

impl WanderchatConfig {
    pub fn builder() -> WanderchatConfigBuilder {
        WanderchatConfigBuilder::new()
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        if self.socket_url.trim().is_empty() {
            return Err(SdkError::Config("socket 地址不能为空".to_string()));
        }
        url::Url::parse(&self.socket_url)?;
        if self.api_base_url.trim().is_empty() {
            return Err(SdkError::Config("REST 基础地址不能为空".to_string()));
        }
        url::Url::parse(&self.api_base_url)?;
        if self.poll_interval_ms == 0 {
            return Err(SdkError::Config("轮询间隔不能为 0".to_string()));
        }
        if self.history_page_size == 0 {
            return Err(SdkError::Config("历史分页大小不能为 0".to_string()));
        }
        self.reconnect.validate().map_err(SdkError::Config)?;
        self.message_rate_limit.validate().map_err(SdkError::Config)?;
        if self.connect_timeout_ms == 0 {
            return Err(SdkError::Config("连接超时不能为 0".to_string()));
        }
        if self.event_buffer_size == 0 {
            return Err(SdkError::Config("事件缓冲区不能为 0".to_string()));
        }
        Ok(())
    }

    fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            socket_url: self.socket_url.clone(),
            connect_timeout_ms: self.connect_timeout_ms,
            reconnect: self.reconnect.clone(),
        }
    }
}

/// Wanderchat SDK 配置构建器
#[derive(Debug, Default)]
pub struct WanderchatConfigBuilder {
    config: WanderchatConfig,
}

impl WanderchatConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn socket_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.socket_url = url.into();
        self
    }

    pub fn api_base_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.api_base_url = url.into();
        self
    }

    pub fn http_client_config(mut self, config: HttpClientConfig) -> Self {
        self.config.http_client_config = config;
        self
    }

    pub fn poll_interval_ms(mut self, interval: u64) -> Self {
        self.config.poll_interval_ms = interval;
        self
    }

    pub fn history_page_size(mut self, size: usize) -> Self {
        self.config.history_page_size = size;
        self
    }

    pub fn reconcile(mut self, config: ReconcileConfig) -> Self {
        self.config.reconcile = config;
        self
    }

    pub fn reconnect(mut self, config: ReconnectConfig) -> Self {
        self.config.reconnect = config;
        self
    }

    pub fn connect_timeout_ms(mut self, timeout: u64) -> Self {
        self.config.connect_timeout_ms = timeout;
        self
    }

    pub fn message_rate_limit(mut self, config: MessageRateLimiterConfig) -> Self {
        self.config.message_rate_limit = config;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    pub fn build(self) -> WanderchatConfig {
        self.config
    }
}

/// 当前登录用户
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    pub user_id: String,
    pub display_name: String,
}

/// 会话用户的共享句柄，登出时清空
#[derive(Debug, Clone, Default)]
pub struct CurrentUser {
    inner: Arc<RwLock<Option<SessionUser>>>,
}

impl CurrentUser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, user: SessionUser) {
        *self.inner.write() = Some(user);
    }

    pub fn clear(&self) {
        *self.inner.write() = None;
    }

    pub fn get(&self) -> Option<SessionUser> {
        self.inner.read().clone()
    }

    pub fn user_id(&self) -> Option<String> {
        self.inner.read().as_ref().map(|u| u.user_id.clone())
    }
}

/// Wanderchat SDK 主类
pub struct WanderchatSDK {
    config: WanderchatConfig,
    user: CurrentUser,
    store: SharedStore,
    events: EventManager,
    connection: ConnectionManager,
    api: Arc<dyn ChatApi>,
    /// 真实 REST 客户端（需要同步 token）；注入假实现时为空
    rest: Option<Arc<RestClient>>,
    multiplexer: Multiplexer,
    rooms: RoomTracker,
    notifications: NotificationCenter,
    unread: UnreadCounters,
    limiter: Arc<MessageRateLimiter>,
    surfaces: MountedSurfaces,
    /// SDK 内部接线（入站分流 / 重连后补 join / 断线标记）
    hooks: Mutex<Vec<Subscription>>,
}

impl std::fmt::Debug for WanderchatSDK {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WanderchatSDK")
            .field("socket_url", &self.config.socket_url)
            .field("user", &self.user.user_id())
            .field("status", &self.connection.status())
            .finish()
    }
}

impl WanderchatSDK {
    /// 使用 WebSocket 传输与 reqwest REST 客户端创建 SDK
    pub fn new(config: WanderchatConfig) -> Result<Self> {
        config.validate()?;
        let rest = Arc::new(RestClient::new(&config.http_client_config, config.api_base_url.clone())?);
        let api: Arc<dyn ChatApi> = rest.clone();
        Self::assemble(config, Arc::new(WebSocketTransport::new()), api, Some(rest))
    }

    /// 注入传输层与 REST 实现（测试 / 离线演示）
    pub fn with_components(
        config: WanderchatConfig,
        transport: Arc<dyn Transport>,
        api: Arc<dyn ChatApi>,
    ) -> Result<Self> {
        config.validate()?;
        Self::assemble(config, transport, api, None)
    }

    fn assemble(
        config: WanderchatConfig,
        transport: Arc<dyn Transport>,
        api: Arc<dyn ChatApi>,
        rest: Option<Arc<RestClient>>,
    ) -> Result<Self> {
        let user = CurrentUser::new();
        let events = EventManager::new(config.event_buffer_size);
        let store: SharedStore = Arc::new(Mutex::new(MessageStore::new(config.reconcile.clone())));
        let connection = ConnectionManager::new(transport, config.connection_config(), events.clone());
        let notifications = NotificationCenter::new(api.clone(), events.clone(), config.history_page_size);
        let multiplexer = Multiplexer::new(user.clone(), store.clone(), events.clone(), notifications.clone());
        let rooms = RoomTracker::new(connection.clone(), events.clone());
        let unread = UnreadCounters::new(user.clone(), store.clone(), api.clone(), notifications.clone());
        let limiter = Arc::new(MessageRateLimiter::new(config.message_rate_limit.clone()));

        info!("✅ WanderchatSDK 已创建 (socket: {})", config.socket_url);
        Ok(Self {
            config,
            user,
            store,
            events,
            connection,
            api,
            rest,
            multiplexer,
            rooms,
            notifications,
            unread,
            limiter,
            surfaces: MountedSurfaces::default(),
            hooks: Mutex::new(Vec::new()),
        })
    }

    /// 登录后建立连接
    ///
    /// 换账号时先清空旧会话的全部状态。鉴权被拒返回 `AuthExpired`，其余传输错误转入后台重连。
    pub async fn connect(&self, user: SessionUser, token: &str) -> Result<()> {
        if user.user_id.trim().is_empty() {
            return Err(SdkError::InvalidArgument("user_id 不能为空".to_string()));
        }
        if let Some(previous) = self.user.user_id() {
            if previous != user.user_id {
                info!("🔄 切换账号 {} -> {}，清空旧会话", previous, user.user_id);
                self.logout();
            }
        }

        info!("🔐 用户 {} 连接中", user.user_id);
        self.user.set(user);
        if let Some(rest) = &self.rest {
            rest.set_token(Some(token.to_string()));
        }
        self.install_hooks();

        if let Err(e) = self.connection.connect(token).await {
            warn!("❌ 连接失败: {}", e);
            return Err(e);
        }
        Ok(())
    }

    fn install_hooks(&self) {
        let mut hooks = self.hooks.lock();
        if !hooks.is_empty() {
            return;
        }

        let mux = self.multiplexer.clone();
        hooks.push(self.connection.on_inbound(move |event| mux.dispatch(event)));

        let rooms = self.rooms.clone();
        hooks.push(self.connection.on_connected(move |_| rooms.rejoin_all()));

        let rooms = self.rooms.clone();
        hooks.push(self.events.add_listener("connection_state_changed", move |event| {
            if let SDKEvent::ConnectionStateChanged { new_state, .. } = event {
                if *new_state != ConnectionStatus::Connected {
                    rooms.mark_all_detached();
                }
            }
        }));
        debug!("SDK 内部接线完成");
    }

    /// 断开连接，卸载界面并清空频道 / 监听器 / 房间 / 通知缓存
    ///
    /// 仍挂载的界面被卸载（轮询随之停止），重新连接后需再次 `mount()`。
    /// 之后再次 `connect()` 时，旧的监听器不会再收到任何事件。
    pub fn disconnect(&self) {
        info!("🔌 断开连接并清空派生状态");
        let detached = self.surfaces.detach_all();
        if detached > 0 {
            debug!("已卸载 {} 个界面", detached);
        }
        self.connection.disconnect();
        self.multiplexer.clear();
        self.notifications.clear();
        self.rooms.clear();
        self.store.lock().clear_all();
    }

    /// 登出：在断开的基础上清空用户 / token / 未读 / 全部事件监听
    pub fn logout(&self) {
        info!("👋 登出");
        self.disconnect();
        self.hooks.lock().clear();
        self.events.clear_listeners();
        self.unread.clear();
        self.user.clear();
        if let Some(rest) = &self.rest {
            rest.set_token(None);
        }
    }

    /// 打开与某个用户的私聊界面（需再调用 `mount()`）
    pub fn open_direct(&self, peer_id: &str) -> Result<ChatSurface> {
        if peer_id.trim().is_empty() {
            return Err(SdkError::InvalidArgument("peer_id 不能为空".to_string()));
        }
        if self.user.user_id().as_deref() == Some(peer_id) {
            return Err(SdkError::InvalidArgument("不能与自己私聊".to_string()));
        }
        Ok(ChatSurface::new(ChannelKey::direct(peer_id), self.surface_context()))
    }

    /// 打开群聊界面（需再调用 `mount()`）
    pub fn open_group(&self, group_id: &str) -> Result<ChatSurface> {
        if group_id.trim().is_empty() {
            return Err(SdkError::InvalidArgument("group_id 不能为空".to_string()));
        }
        Ok(ChatSurface::new(ChannelKey::group(group_id), self.surface_context()))
    }

    fn surface_context(&self) -> SurfaceContext {
        SurfaceContext {
            user: self.user.clone(),
            connection: self.connection.clone(),
            api: self.api.clone(),
            multiplexer: self.multiplexer.clone(),
            rooms: self.rooms.clone(),
            events: self.events.clone(),
            limiter: self.limiter.clone(),
            poll_interval: Duration::from_millis(self.config.poll_interval_ms),
            page_size: self.config.history_page_size,
            surfaces: self.surfaces.clone(),
        }
    }

    /// 会话列表（最新的在前）
    pub fn conversations(&self) -> Vec<Conversation> {
        match self.user.user_id() {
            Some(self_id) => self.store.lock().conversations(&self_id),
            None => Vec::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn current_user(&self) -> Option<SessionUser> {
        self.user.get()
    }

    pub fn notifications(&self) -> &NotificationCenter {
        &self.notifications
    }

    pub fn unread(&self) -> &UnreadCounters {
        &self.unread
    }

    pub fn events(&self) -> &EventManager {
        &self.events
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.multiplexer
    }

    pub fn rooms(&self) -> &RoomTracker {
        &self.rooms
    }

    pub fn config(&self) -> &WanderchatConfig {
        &self.config
    }
}

impl Drop for WanderchatSDK {
    fn drop(&mut self) {
        self.hooks.get_mut().clear();
        self.connection.disconnect();
    }
}
