//! 传输层抽象
//!
//! 连接管理器只依赖 [`Transport`]：打开一条链路后得到出站发送端与入站信号接收端。
//! - `websocket`：基于 tokio-tungstenite 的正式实现
//! - `memory`：进程内实现，供测试与离线演示使用

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

pub mod memory;
pub mod websocket;

pub use memory::{MemoryPeer, MemoryTransport};
pub use websocket::WebSocketTransport;

/// 传输层上报的入站信号
#[derive(Debug, Clone, PartialEq)]
pub enum TransportSignal {
    /// 一个完整的文本帧
    Frame(String),
    /// 链路已关闭（对端关闭或读写出错）
    Closed { reason: String },
}

/// 一条已建立的链路
///
/// 丢弃 `outbound` 即请求关闭链路。
#[derive(Debug)]
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<TransportSignal>,
}

/// 传输层实现
#[async_trait]
pub trait Transport: Send + Sync {
    /// 建立链路；鉴权被拒时返回 `SdkError::AuthExpired`
    async fn open(&self, url: &str) -> Result<TransportLink>;

    /// 协议名（日志用）
    fn name(&self) -> &'static str;
}
