//! 连接管理器
//!
//! 一个会话一条 socket，由所有打开的聊天界面共享：
//! - `connect(token)` 幂等：同一 token 已连接（或正在重连）时直接返回；
//!   连接锁保证首次握手完成前的重复调用不会建立第二条链路
//! - 传输层错误不抛给调用方，状态转为断开并由重连循环按指数退避恢复
//! - `disconnect()` 同步拆除链路并取消重连
//! - 入站帧解码后交给 `inbound` 监听器（多路复用器），每次连上后触发 `connected` 监听器（房间重新加入）

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection_state::{ConnectionState, ConnectionStateManager, ConnectionStatus};
use crate::error::{Result, SdkError};
use crate::events::{event_builders, EventManager};
use crate::listeners::{ListenerRegistry, Subscription};
use crate::protocol::{ClientCommand, ServerEvent};
use crate::rate_limiter::{ReconnectConfig, ReconnectRateLimiter};
use crate::transport::{Transport, TransportLink, TransportSignal};

/// 连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// socket 地址，token 以查询参数附加
    pub socket_url: String,
    /// 单次握手超时（毫秒）
    pub connect_timeout_ms: u64,
    pub reconnect: ReconnectConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            socket_url: "ws://127.0.0.1:3000/ws".to_string(),
            connect_timeout_ms: 10_000,
            reconnect: ReconnectConfig::default(),
        }
    }
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// 一次 connect 对应的会话
struct Session {
    id: u64,
    token: String,
    /// 链路存活时为 Some
    outbound: Option<mpsc::UnboundedSender<String>>,
    cancel: CancellationToken,
}

struct Inner {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    state: ConnectionStateManager,
    events: EventManager,
    backoff: ReconnectRateLimiter,
    connect_lock: tokio::sync::Mutex<()>,
    session: Mutex<Option<Session>>,
    inbound: ListenerRegistry<(), ServerEvent>,
    connected: ListenerRegistry<(), ()>,
}

/// 连接管理器
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("transport", &self.inner.transport.name())
            .field("status", &self.inner.state.status())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, config: ConnectionConfig, events: EventManager) -> Self {
        let platform = crate::version::platform();
        Self {
            inner: Arc::new(Inner {
                transport,
                backoff: ReconnectRateLimiter::new(config.reconnect.clone()),
                config,
                state: ConnectionStateManager::new(platform),
                events,
                connect_lock: tokio::sync::Mutex::new(()),
                session: Mutex::new(None),
                inbound: ListenerRegistry::new("socket-inbound"),
                connected: ListenerRegistry::new("socket-connected"),
            }),
        }
    }

    /// 建立连接
    ///
    /// 仅在参数非法或鉴权被拒时返回错误；其他传输错误转入后台重连。
    pub async fn connect(&self, token: &str) -> Result<()> {
        if token.trim().is_empty() {
            return Err(SdkError::InvalidArgument("token 不能为空".to_string()));
        }

        let _guard = self.inner.connect_lock.lock().await;

        if let Some(session) = self.inner.session.lock().as_ref() {
            if session.token == token && !session.cancel.is_cancelled() {
                debug!("已连接或正在重连，忽略重复 connect");
                return Ok(());
            }
        }

        // token 变化（换账号）时先拆掉旧会话
        self.inner.teardown("token changed");

        let cancel = CancellationToken::new();
        let session_id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        *self.inner.session.lock() = Some(Session {
            id: session_id,
            token: token.to_string(),
            outbound: None,
            cancel: cancel.clone(),
        });
        self.inner
            .state
            .set_target(self.inner.transport.name(), self.inner.config.socket_url.clone());
        self.inner.transition(ConnectionStatus::Connecting);
        info!("🔌 正在连接 {} ({})", self.inner.config.socket_url, self.inner.transport.name());

        let opened = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("连接过程中被断开");
                return Ok(());
            }
            opened = self.inner.open_link(token) => opened,
        };

        match opened {
            Ok(link) => {
                let Some(inbound) = self.inner.install(session_id, link, false) else {
                    return Ok(());
                };
                tokio::spawn(run_session(
                    self.inner.clone(),
                    session_id,
                    token.to_string(),
                    Some(inbound),
                    cancel,
                ));
                Ok(())
            }
            Err(e) if e.is_auth_expired() => {
                self.inner.fail_auth(session_id, &e);
                Err(e)
            }
            Err(e) => {
                warn!("⚠️ 首次连接失败，转入后台重连: {}", e);
                self.inner.lost(session_id, e.to_string());
                tokio::spawn(run_session(
                    self.inner.clone(),
                    session_id,
                    token.to_string(),
                    None,
                    cancel,
                ));
                Ok(())
            }
        }
    }

    /// 断开连接并取消重连
    pub fn disconnect(&self) {
        self.inner.teardown("disconnect");
    }

    /// 链路当前是否可用（发送路径据此选择 socket 或 REST）
    pub fn is_connected(&self) -> bool {
        self.inner.state.is_connected()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.status()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.snapshot()
    }

    /// 发送一条指令（fire-and-forget）；链路不可用时返回 `NotConnected`
    pub fn emit(&self, command: &ClientCommand) -> Result<()> {
        let frame = command.encode()?;
        let len = frame.len() as u64;
        {
            let session = self.inner.session.lock();
            let outbound = session
                .as_ref()
                .and_then(|s| s.outbound.as_ref())
                .ok_or(SdkError::NotConnected)?;
            outbound.send(frame).map_err(|_| SdkError::NotConnected)?;
        }
        self.inner.state.record_outbound(len);
        debug!("📤 {}", command.event_name());
        Ok(())
    }

    /// 订阅解码后的入站事件
    pub fn on_inbound<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.inner.inbound.subscribe(callback)
    }

    /// 每次链路建立（含重连）后回调
    pub fn on_connected<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&()) + Send + Sync + 'static,
    {
        self.inner.connected.subscribe(callback)
    }

    pub fn log_state(&self) {
        self.inner.state.log_state();
    }
}

impl Inner {
    async fn open_link(&self, token: &str) -> Result<TransportLink> {
        let mut url = url::Url::parse(&self.config.socket_url)?;
        url.query_pairs_mut().append_pair("token", token);

        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        match tokio::time::timeout(timeout, self.transport.open(url.as_str())).await {
            Ok(result) => result,
            Err(_) => Err(SdkError::Connection(format!(
                "connect timeout after {}ms",
                self.config.connect_timeout_ms
            ))),
        }
    }

    /// 把新链路装入会话；会话已被替换或取消时丢弃链路
    fn install(
        &self,
        session_id: u64,
        link: TransportLink,
        reconnected: bool,
    ) -> Option<mpsc::UnboundedReceiver<TransportSignal>> {
        {
            let mut session = self.session.lock();
            match session.as_mut() {
                Some(s) if s.id == session_id && !s.cancel.is_cancelled() => {
                    s.outbound = Some(link.outbound);
                }
                _ => {
                    debug!("会话已失效，丢弃新链路");
                    return None;
                }
            }
        }

        let old = self.state.status();
        self.state.mark_connected(reconnected);
        self.events
            .emit(event_builders::connection_state_changed(old, ConnectionStatus::Connected));
        self.backoff.mark_success();
        if reconnected {
            info!("✅ 重连成功");
        } else {
            info!("✅ 连接成功");
        }

        self.connected.emit(&());
        Some(link.inbound)
    }

    /// 链路断开（非主动）
    fn lost(&self, session_id: u64, reason: String) {
        if let Some(s) = self.session.lock().as_mut() {
            if s.id == session_id {
                s.outbound = None;
            }
        }
        let old = self.state.status();
        self.state.mark_disconnected(Some(reason));
        if old != ConnectionStatus::Disconnected {
            self.events
                .emit(event_builders::connection_state_changed(old, ConnectionStatus::Disconnected));
        }
    }

    /// 鉴权被拒：结束会话，通知上层
    fn fail_auth(&self, session_id: u64, error: &SdkError) {
        error!("❌ 鉴权失效: {}", error);
        {
            let mut session = self.session.lock();
            if session.as_ref().is_some_and(|s| s.id == session_id) {
                if let Some(s) = session.take() {
                    s.cancel.cancel();
                }
            }
        }
        self.state.mark_disconnected(Some(error.to_string()));
        self.transition(ConnectionStatus::Failed);
        self.events.emit(event_builders::auth_expired(error.to_string()));
    }

    fn teardown(&self, reason: &str) {
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.cancel.cancel();
            // 丢弃出站发送端即关闭链路
            drop(session.outbound);
            info!("🔌 连接已拆除: {}", reason);
        }
        self.backoff.mark_success();

        let old = self.state.status();
        self.state.mark_disconnected(None);
        if old != ConnectionStatus::Disconnected {
            self.events
                .emit(event_builders::connection_state_changed(old, ConnectionStatus::Disconnected));
        }
    }

    fn transition(&self, new_state: ConnectionStatus) {
        let old = self.state.set_status(new_state);
        if old != new_state {
            debug!("连接状态: {} -> {}", old, new_state);
            self.events
                .emit(event_builders::connection_state_changed(old, new_state));
        }
    }

    fn handle_frame(&self, text: &str) {
        self.state.record_inbound(text.len() as u64);
        match ServerEvent::decode(text) {
            Ok(Some(event)) => {
                debug!("📥 {}", event.event_name());
                self.inbound.emit(&event);
            }
            Ok(None) => {}
            Err(e) => warn!("⚠️ 无法解析入站帧: {}", e),
        }
    }

    /// 读取链路直到关闭；被取消时返回 `None`
    async fn read_until_closed(
        &self,
        inbound: &mut mpsc::UnboundedReceiver<TransportSignal>,
        cancel: &CancellationToken,
    ) -> Option<String> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                signal = inbound.recv() => match signal {
                    Some(TransportSignal::Frame(text)) => self.handle_frame(&text),
                    Some(TransportSignal::Closed { reason }) => return Some(reason),
                    None => return Some("transport dropped".to_string()),
                },
            }
        }
    }

    /// 按退避重连，成功时返回新链路的入站端
    async fn reconnect(
        &self,
        session_id: u64,
        token: &str,
        cancel: &CancellationToken,
    ) -> Option<mpsc::UnboundedReceiver<TransportSignal>> {
        loop {
            let Some(delay) = self.backoff.next_delay() else {
                error!("❌ 重连次数耗尽，放弃重连");
                self.transition(ConnectionStatus::Failed);
                if let Some(s) = self.session.lock().as_ref() {
                    if s.id == session_id {
                        s.cancel.cancel();
                    }
                }
                return None;
            };

            self.transition(ConnectionStatus::Reconnecting);
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            let opened = tokio::select! {
                _ = cancel.cancelled() => return None,
                opened = self.open_link(token) => opened,
            };
            match opened {
                Ok(link) => return self.install(session_id, link, true),
                Err(e) if e.is_auth_expired() => {
                    self.fail_auth(session_id, &e);
                    return None;
                }
                Err(e) => warn!("⚠️ 重连失败: {}", e),
            }
        }
    }
}

/// 会话后台任务：读链路，断开后重连，直到被取消
async fn run_session(
    inner: Arc<Inner>,
    session_id: u64,
    token: String,
    mut inbound: Option<mpsc::UnboundedReceiver<TransportSignal>>,
    cancel: CancellationToken,
) {
    loop {
        if let Some(mut rx) = inbound.take() {
            match inner.read_until_closed(&mut rx, &cancel).await {
                None => break,
                Some(reason) => {
                    warn!("⚠️ 链路断开: {}", reason);
                    inner.lost(session_id, reason);
                }
            }
        }

        match inner.reconnect(session_id, &token, &cancel).await {
            Some(rx) => inbound = Some(rx),
            None => break,
        }
    }
    debug!("会话任务退出 #{}", session_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SDKEvent;
    use crate::protocol::{MessageErrorPayload, ServerEvent};
    use crate::transport::memory::{MemoryFailure, MemoryTransport};
    use std::sync::atomic::AtomicUsize;

    fn manager(transport: &MemoryTransport) -> (ConnectionManager, EventManager) {
        let events = EventManager::new(64);
        let config = ConnectionConfig {
            socket_url: "ws://chat.test/ws".into(),
            connect_timeout_ms: 1_000,
            reconnect: ReconnectConfig {
                initial_interval_ms: 100,
                max_interval_ms: 400,
                backoff_multiplier: 2.0,
                jitter_factor: 0.0,
                max_attempts: 0,
            },
        };
        (
            ConnectionManager::new(Arc::new(transport.clone()), config, events.clone()),
            events,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connect_opens_single_transport() {
        let transport = MemoryTransport::new().with_open_delay(Duration::from_millis(50));
        let (conn, _) = manager(&transport);

        let (a, b) = tokio::join!(conn.connect("tok"), conn.connect("tok"));
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(transport.open_count(), 1);
        assert!(conn.is_connected());

        // 已连接时再次调用也是空操作
        conn.connect("tok").await.unwrap();
        assert_eq!(transport.open_count(), 1);
        assert!(transport.last_url().unwrap().contains("token=tok"));
    }

    #[tokio::test]
    async fn test_emit_requires_live_link() {
        let transport = MemoryTransport::new();
        let (conn, _) = manager(&transport);
        assert!(matches!(
            conn.emit(&ClientCommand::join_group("G1")),
            Err(SdkError::NotConnected)
        ));

        conn.connect("tok").await.unwrap();
        let mut peer = transport.accept().await.unwrap();
        conn.emit(&ClientCommand::join_group("G1")).unwrap();
        let envelope = peer.recv().await.unwrap();
        assert_eq!(envelope.event, "join_group");
        assert_eq!(conn.state().stats.frames_sent, 1);
    }

    #[tokio::test]
    async fn test_inbound_frames_reach_listeners() {
        let transport = MemoryTransport::new();
        let (conn, _) = manager(&transport);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = conn.on_inbound(move |event| {
            let _ = tx.send(event.clone());
        });

        conn.connect("tok").await.unwrap();
        let peer = transport.accept().await.unwrap();
        peer.push_raw(r#"{"event":"user_typing","data":{}}"#).unwrap();
        peer.push(&ServerEvent::MessageError(MessageErrorPayload {
            reason: "too long".into(),
            client_message_id: None,
        }))
        .unwrap();

        match rx.recv().await.unwrap() {
            ServerEvent::MessageError(p) => assert_eq!(p.reason, "too long"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_close_triggers_reconnect_and_connected_hook() {
        let transport = MemoryTransport::new();
        let (conn, _) = manager(&transport);
        let connected = Arc::new(AtomicUsize::new(0));
        let c = connected.clone();
        let _hook = conn.on_connected(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        conn.connect("tok").await.unwrap();
        let peer = transport.accept().await.unwrap();
        assert_eq!(connected.load(Ordering::SeqCst), 1);

        transport.fail_next(MemoryFailure::Unreachable);
        peer.close("server restart");

        let _second = transport.accept().await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(transport.open_count(), 3);
        assert!(conn.is_connected());
        assert_eq!(connected.load(Ordering::SeqCst), 2);
        assert_eq!(conn.state().stats.reconnects, 1);
    }

    #[tokio::test]
    async fn test_auth_rejection_is_surfaced() {
        let transport = MemoryTransport::new();
        let (conn, events) = manager(&transport);
        let mut rx = events.subscribe();
        transport.fail_next(MemoryFailure::Unauthorized);

        let err = conn.connect("expired").await.unwrap_err();
        assert!(err.is_auth_expired());
        assert_eq!(conn.status(), ConnectionStatus::Failed);

        let mut saw_auth = false;
        while let Ok(event) = rx.try_recv() {
            saw_auth |= matches!(event, SDKEvent::AuthExpired { .. });
        }
        assert!(saw_auth);

        // 新 token 可以重新连接
        conn.connect("fresh").await.unwrap();
        assert!(conn.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_closes_link_and_stops_reconnect() {
        let transport = MemoryTransport::new();
        let (conn, _) = manager(&transport);
        conn.connect("tok").await.unwrap();
        let mut peer = transport.accept().await.unwrap();

        conn.disconnect();
        assert!(!conn.is_connected());
        assert!(peer.recv().await.is_none());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.open_count(), 1);

        // 之后可以重新连接
        conn.connect("tok").await.unwrap();
        assert_eq!(transport.open_count(), 2);
    }
}
