//! Wanderchat SDK - 旅行社区的实时消息与通知同步层
//!
//! 本 SDK 提供：
//! - 🔗 单一复用的 socket 链路，私聊 / 群聊 / 通知三路分流
//! - 🧠 乐观发送与服务端回显合并，推送与轮询两条路径去重
//! - 🚪 群房间成员关系，与界面挂载 / 卸载配对
//! - 📡 socket 不可用时的 REST 回退发送与定时轮询
//! - 🔔 通知扇出与未读计数
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use wanderchat_sdk::{SessionUser, WanderchatConfig, WanderchatSDK};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = WanderchatConfig::builder()
//!         .socket_url("wss://api.example.com/ws")
//!         .api_base_url("https://api.example.com")
//!         .build();
//!     wanderchat_sdk::init_tracing(config.debug_mode);
//!
//!     let sdk = WanderchatSDK::new(config)?;
//!     let me = SessionUser { user_id: "7".into(), display_name: "Ana".into() };
//!     sdk.connect(me, "jwt-token").await?;
//!
//!     let chat = sdk.open_direct("42")?;
//!     let _sub = chat.on_update(|update| println!("更新: {}", update.message.content));
//!     chat.mount().await?;
//!
//!     if let Err(e) = chat.send("Hola").await {
//!         // 发送失败时取回原文放回输入框
//!         println!("发送失败: {:?}", e.restored_content());
//!     }
//!
//!     chat.unmount();
//!     sdk.logout();
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod connection;
pub mod connection_state;
pub mod error;
pub mod events;
pub mod http_client;
pub mod listeners;
pub mod multiplexer;
pub mod notifications;
pub mod poller;
pub mod protocol;
pub mod rate_limiter;
pub mod rooms;
pub mod sdk;
pub mod store;
pub mod surface;
pub mod transport;
pub mod unread;
pub mod utils;
pub mod version;

// 重新导出核心类型，方便使用
pub use connection::{ConnectionConfig, ConnectionManager};
pub use connection_state::{ConnectionState, ConnectionStatus, PerformanceStats};
pub use error::{Result, SdkError, SendFailureReason};
pub use events::{EventFilter, EventManager, SDKEvent, SendPath};
pub use http_client::{ChatApi, PageRequest, RestClient};
pub use listeners::{ListenerRegistry, Subscription};
pub use multiplexer::{ChannelUpdate, MessageError, Multiplexer};
pub use notifications::{Notification, NotificationCenter};
pub use poller::{FallbackPoller, PollerStats};
pub use rate_limiter::{MessageRateLimiterConfig, ReconnectConfig};
pub use rooms::{GroupRoomMembership, RoomTracker};
pub use sdk::{
    CurrentUser, HttpClientConfig, SessionUser, WanderchatConfig, WanderchatConfigBuilder, WanderchatSDK,
};
pub use store::{
    ChannelKey, Conversation, Message, MessageState, MessageStore, ReconcileConfig, ReconcileOutcome,
    StoreAction,
};
pub use surface::{ChatSurface, SendFailure};
pub use transport::{MemoryPeer, MemoryTransport, Transport, WebSocketTransport};
pub use unread::{UnreadCounters, UnreadSummary};
pub use version::SDK_VERSION;

/// 安装默认的 tracing 订阅者
///
/// `RUST_LOG` 优先；否则调试模式为 `debug`，正常为 `info`。重复调用无副作用。
pub fn init_tracing(debug_mode: bool) {
    use tracing_subscriber::EnvFilter;

    let default_level = if debug_mode { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("wanderchat_sdk={}", default_level)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
