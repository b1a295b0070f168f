//! HTTP 客户端模块 - 历史拉取、回退发送、已读与通知接口
//!
//! [`ChatApi`] 是 REST 层的抽象，聊天界面、轮询器和通知中心只依赖这个 trait；
//! [`RestClient`] 是基于 reqwest 的实现。鉴权 token 以 Bearer 头携带，401 统一映射为
//! `SdkError::AuthExpired`。

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use url::Url;

use crate::error::{Result, SdkError};
use crate::protocol::{
    DirectMessagePayload, GroupMessagePayload, NotificationPayload, SendGroupMessageRequest,
    SendMessageRequest,
};
use crate::sdk::HttpClientConfig;

/// 分页参数；历史接口按时间倒序，offset 0 为最新一页
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub limit: usize,
    pub offset: usize,
}

impl PageRequest {
    pub fn first(limit: usize) -> Self {
        Self { limit, offset: 0 }
    }
}

/// 未读数响应
#[derive(Debug, Clone, Deserialize)]
struct CountResponse {
    count: u64,
}

/// REST 接口
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// 与某个用户的私聊历史
    async fn conversation_history(&self, peer_id: &str, page: PageRequest) -> Result<Vec<DirectMessagePayload>>;

    /// 群消息历史
    async fn group_history(&self, group_id: &str, page: PageRequest) -> Result<Vec<GroupMessagePayload>>;

    /// socket 不可用时的私聊回退发送
    async fn send_direct(&self, request: &SendMessageRequest) -> Result<DirectMessagePayload>;

    /// socket 不可用时的群聊回退发送
    async fn send_group(&self, request: &SendGroupMessageRequest) -> Result<GroupMessagePayload>;

    /// 把与某个用户的会话标记为已读
    async fn mark_conversation_read(&self, peer_id: &str) -> Result<()>;

    /// 私信未读总数
    async fn unread_message_count(&self) -> Result<u64>;

    /// 清空与某个用户的会话历史
    async fn delete_conversation(&self, peer_id: &str) -> Result<()>;

    async fn list_notifications(&self, page: PageRequest) -> Result<Vec<NotificationPayload>>;

    async fn notification_unread_count(&self) -> Result<u64>;

    async fn mark_notification_read(&self, notification_id: &str) -> Result<()>;

    async fn mark_all_notifications_read(&self) -> Result<()>;

    async fn delete_notification(&self, notification_id: &str) -> Result<()>;
}

/// 基于 reqwest 的 REST 客户端
#[derive(Debug)]
pub struct RestClient {
    client: Client,
    base_url: Url,
    token: RwLock<Option<String>>,
}

impl RestClient {
    pub fn new(config: &HttpClientConfig, base_url: impl Into<String>) -> Result<Self> {
        let mut builder = Client::builder();

        if let Some(timeout) = config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(timeout));
        }

        if let Some(timeout) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }

        let client = builder
            .build()
            .map_err(|e| SdkError::Other(format!("创建 HTTP 客户端失败: {}", e)))?;

        let base_url: String = base_url.into();
        let base_url = Url::parse(&base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(SdkError::Config(format!("REST 基础地址无效: {}", base_url)));
        }
        info!("✅ HTTP 客户端已创建 (base_url: {})", base_url);

        Ok(Self {
            client,
            base_url,
            token: RwLock::new(None),
        })
    }

    /// 设置或清除鉴权 token
    pub fn set_token(&self, token: Option<String>) {
        *self.token.write() = token;
    }

    /// 拼接接口地址；每段单独转义，id 中的 `/`、`?` 等不会改变路径
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SdkError::Config(format!("REST 基础地址无效: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder> {
        let builder = self.client.request(method, self.endpoint(segments)?);
        Ok(match self.token.read().as_deref() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        })
    }

    async fn execute(&self, builder: RequestBuilder, what: &str) -> Result<Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| SdkError::Http(format!("{}失败: {}", what, e)))?;

        let status = response.status();
        if status.as_u16() == 401 {
            error!("❌ {}被拒绝：鉴权失效", what);
            return Err(SdkError::AuthExpired(format!("{}: 401", what)));
        }
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "无法读取错误信息".to_string());
            error!("❌ {}失败，HTTP 状态码: {}, 错误: {}", what, status, error_text);
            return Err(SdkError::ServerError {
                status: status.as_u16(),
                message: error_text,
            });
        }
        Ok(response)
    }

    async fn fetch_json<T: DeserializeOwned>(&self, builder: RequestBuilder, what: &str) -> Result<T> {
        let response = self.execute(builder, what).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| SdkError::Serialization(format!("解析{}响应失败: {}", what, e)))
    }
}

fn page_query(page: PageRequest) -> [(&'static str, usize); 2] {
    [("limit", page.limit), ("offset", page.offset)]
}

#[async_trait]
impl ChatApi for RestClient {
    async fn conversation_history(&self, peer_id: &str, page: PageRequest) -> Result<Vec<DirectMessagePayload>> {
        debug!("📥 拉取私聊历史: peer={}, {:?}", peer_id, page);
        let builder = self
            .request(Method::GET, &["api", "messages", "conversation", peer_id])?
            .query(&page_query(page));
        self.fetch_json(builder, "拉取私聊历史").await
    }

    async fn group_history(&self, group_id: &str, page: PageRequest) -> Result<Vec<GroupMessagePayload>> {
        debug!("📥 拉取群历史: group={}, {:?}", group_id, page);
        let builder = self
            .request(Method::GET, &["api", "groups", group_id, "messages"])?
            .query(&page_query(page));
        self.fetch_json(builder, "拉取群历史").await
    }

    async fn send_direct(&self, request: &SendMessageRequest) -> Result<DirectMessagePayload> {
        info!("📤 REST 回退发送私聊: receiver={}", request.receiver_id);
        let builder = self.request(Method::POST, &["api", "messages"])?.json(request);
        self.fetch_json(builder, "发送私聊").await
    }

    async fn send_group(&self, request: &SendGroupMessageRequest) -> Result<GroupMessagePayload> {
        info!("📤 REST 回退发送群消息: group={}", request.group_id);
        let builder = self
            .request(Method::POST, &["api", "groups", request.group_id.as_str(), "messages"])?
            .json(request);
        self.fetch_json(builder, "发送群消息").await
    }

    async fn mark_conversation_read(&self, peer_id: &str) -> Result<()> {
        let builder = self.request(Method::PUT, &["api", "messages", "read", peer_id])?;
        self.execute(builder, "标记已读").await?;
        Ok(())
    }

    async fn unread_message_count(&self) -> Result<u64> {
        let builder = self.request(Method::GET, &["api", "messages", "unread-count"])?;
        let response: CountResponse = self.fetch_json(builder, "查询私信未读数").await?;
        Ok(response.count)
    }

    async fn delete_conversation(&self, peer_id: &str) -> Result<()> {
        info!("🗑️ 删除会话: peer={}", peer_id);
        let builder = self.request(Method::DELETE, &["api", "messages", "conversation", peer_id])?;
        self.execute(builder, "删除会话").await?;
        Ok(())
    }

    async fn list_notifications(&self, page: PageRequest) -> Result<Vec<NotificationPayload>> {
        let builder = self
            .request(Method::GET, &["api", "notifications"])?
            .query(&page_query(page));
        self.fetch_json(builder, "拉取通知").await
    }

    async fn notification_unread_count(&self) -> Result<u64> {
        let builder = self.request(Method::GET, &["api", "notifications", "unread-count"])?;
        let response: CountResponse = self.fetch_json(builder, "查询通知未读数").await?;
        Ok(response.count)
    }

    async fn mark_notification_read(&self, notification_id: &str) -> Result<()> {
        let builder = self.request(Method::PUT, &["api", "notifications", notification_id, "read"])?;
        self.execute(builder, "标记通知已读").await?;
        Ok(())
    }

    async fn mark_all_notifications_read(&self) -> Result<()> {
        let builder = self.request(Method::PUT, &["api", "notifications", "read-all"])?;
        self.execute(builder, "全部通知已读").await?;
        Ok(())
    }

    async fn delete_notification(&self, notification_id: &str) -> Result<()> {
        let builder = self.request(Method::DELETE, &["api", "notifications", notification_id])?;
        self.execute(builder, "删除通知").await?;
        Ok(())
    }
}


/// 测试辅助：进程内的 REST 服务端
pub mod test_helpers {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, Ordering};

    use chrono::Utc;
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    struct ApiState {
        direct: Vec<DirectMessagePayload>,
        groups: Vec<GroupMessagePayload>,
        notifications: Vec<NotificationPayload>,
        /// 预设失败：0 表示网络错误，其余为 HTTP 状态码
        failures: VecDeque<u16>,
        calls: Vec<String>,
    }

    /// 进程内的 [`ChatApi`] 实现，行为与真实服务端一致：发送即落库，历史按时间倒序分页（最新在前）
    #[derive(Debug)]
    pub struct InMemoryChatApi {
        self_id: String,
        next_id: AtomicU64,
        state: Mutex<ApiState>,
    }

    impl InMemoryChatApi {
        pub fn new(self_id: impl Into<String>) -> Self {
            Self {
                self_id: self_id.into(),
                next_id: AtomicU64::new(1000),
                state: Mutex::new(ApiState::default()),
            }
        }

        pub fn seed_direct(&self, payload: DirectMessagePayload) {
            self.state.lock().direct.push(payload);
        }

        pub fn seed_group(&self, payload: GroupMessagePayload) {
            self.state.lock().groups.push(payload);
        }

        pub fn seed_notification(&self, payload: NotificationPayload) {
            self.state.lock().notifications.push(payload);
        }

        /// 让接下来的一次调用失败；`status` 为 0 时模拟网络不可达
        pub fn fail_next(&self, status: u16) {
            self.state.lock().failures.push_back(status);
        }

        /// 已发生的调用（接口名）
        pub fn calls(&self) -> Vec<String> {
            self.state.lock().calls.clone()
        }

        pub fn call_count(&self, name: &str) -> usize {
            self.state.lock().calls.iter().filter(|c| c.as_str() == name).count()
        }

        pub fn direct_messages(&self) -> Vec<DirectMessagePayload> {
            self.state.lock().direct.clone()
        }

        pub fn notifications(&self) -> Vec<NotificationPayload> {
            self.state.lock().notifications.clone()
        }

        fn next_id(&self) -> String {
            self.next_id.fetch_add(1, Ordering::SeqCst).to_string()
        }

        fn enter(&self, name: &str) -> Result<parking_lot::MutexGuard<'_, ApiState>> {
            let mut state = self.state.lock();
            state.calls.push(name.to_string());
            match state.failures.pop_front() {
                None => Ok(state),
                Some(0) => Err(SdkError::Http(format!("{}: network unreachable", name))),
                Some(401) => Err(SdkError::AuthExpired(format!("{}: 401", name))),
                Some(status) => Err(SdkError::ServerError {
                    status,
                    message: format!("{} failed", name),
                }),
            }
        }
    }

    fn paginate<T: Clone>(items: Vec<T>, page: PageRequest) -> Vec<T> {
        items.into_iter().skip(page.offset).take(page.limit).collect()
    }

    #[async_trait]
    impl ChatApi for InMemoryChatApi {
        async fn conversation_history(&self, peer_id: &str, page: PageRequest) -> Result<Vec<DirectMessagePayload>> {
            let state = self.enter("conversation_history")?;
            let mut items: Vec<_> = state
                .direct
                .iter()
                .filter(|m| {
                    (m.sender_id == self.self_id && m.receiver_id == peer_id)
                        || (m.sender_id == peer_id && m.receiver_id == self.self_id)
                })
                .cloned()
                .collect();
            items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(paginate(items, page))
        }

        async fn group_history(&self, group_id: &str, page: PageRequest) -> Result<Vec<GroupMessagePayload>> {
            let state = self.enter("group_history")?;
            let mut items: Vec<_> = state
                .groups
                .iter()
                .filter(|m| m.group_id == group_id)
                .cloned()
                .collect();
            items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(paginate(items, page))
        }

        async fn send_direct(&self, request: &SendMessageRequest) -> Result<DirectMessagePayload> {
            let mut state = self.enter("send_direct")?;
            let payload = DirectMessagePayload {
                id: self.next_id(),
                sender_id: self.self_id.clone(),
                receiver_id: request.receiver_id.clone(),
                content: request.content.clone(),
                created_at: Utc::now(),
                is_read: false,
                sender_name: None,
                client_message_id: request.client_message_id.clone(),
            };
            state.direct.push(payload.clone());
            Ok(payload)
        }

        async fn send_group(&self, request: &SendGroupMessageRequest) -> Result<GroupMessagePayload> {
            let mut state = self.enter("send_group")?;
            let payload = GroupMessagePayload {
                id: self.next_id(),
                group_id: request.group_id.clone(),
                sender_id: self.self_id.clone(),
                sender_email: None,
                content: request.content.clone(),
                created_at: Utc::now(),
                client_message_id: request.client_message_id.clone(),
            };
            state.groups.push(payload.clone());
            Ok(payload)
        }

        async fn mark_conversation_read(&self, peer_id: &str) -> Result<()> {
            let mut state = self.enter("mark_conversation_read")?;
            for message in state
                .direct
                .iter_mut()
                .filter(|m| m.sender_id == peer_id && m.receiver_id == self.self_id)
            {
                message.is_read = true;
            }
            Ok(())
        }

        async fn unread_message_count(&self) -> Result<u64> {
            let state = self.enter("unread_message_count")?;
            Ok(state
                .direct
                .iter()
                .filter(|m| m.receiver_id == self.self_id && !m.is_read)
                .count() as u64)
        }

        async fn delete_conversation(&self, peer_id: &str) -> Result<()> {
            let mut state = self.enter("delete_conversation")?;
            state
                .direct
                .retain(|m| m.sender_id != peer_id && m.receiver_id != peer_id);
            Ok(())
        }

        async fn list_notifications(&self, page: PageRequest) -> Result<Vec<NotificationPayload>> {
            let state = self.enter("list_notifications")?;
            let mut items = state.notifications.clone();
            items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(paginate(items, page))
        }

        async fn notification_unread_count(&self) -> Result<u64> {
            let state = self.enter("notification_unread_count")?;
            Ok(state.notifications.iter().filter(|n| !n.read).count() as u64)
        }

        async fn mark_notification_read(&self, notification_id: &str) -> Result<()> {
            let mut state = self.enter("mark_notification_read")?;
            let notification = state
                .notifications
                .iter_mut()
                .find(|n| n.id == notification_id)
                .ok_or_else(|| SdkError::NotFound(notification_id.to_string()))?;
            notification.read = true;
            Ok(())
        }

        async fn mark_all_notifications_read(&self) -> Result<()> {
            let mut state = self.enter("mark_all_notifications_read")?;
            for notification in state.notifications.iter_mut() {
                notification.read = true;
            }
            Ok(())
        }

        async fn delete_notification(&self, notification_id: &str) -> Result<()> {
            let mut state = self.enter("delete_notification")?;
            state.notifications.retain(|n| n.id != notification_id);
            Ok(())
        }
    }
}
