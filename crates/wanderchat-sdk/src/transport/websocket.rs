//! WebSocket 传输实现（tokio-tungstenite）

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::{Transport, TransportLink, TransportSignal};
use crate::error::Result;

/// WebSocket 传输
#[derive(Debug, Default, Clone)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &str) -> Result<TransportLink> {
        let (ws_stream, _response) = connect_async(url).await?;
        info!("✅ WebSocket 已连接");

        let (mut write, mut read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<TransportSignal>();

        // 读任务：文本帧原样上报，关闭/出错时上报 Closed
        let inbound_for_read = inbound_tx.clone();
        tokio::spawn(async move {
            let reason = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if inbound_for_read
                            .send(TransportSignal::Frame(text.as_str().to_owned()))
                            .is_err()
                        {
                            break "receiver dropped".to_string();
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| f.reason.as_str().to_owned())
                            .unwrap_or_else(|| "closed by server".to_string());
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        // Pong 由 tungstenite 自动处理
                    }
                    Some(Ok(_)) => {
                        debug!("忽略非文本帧");
                    }
                    Some(Err(e)) => {
                        error!("❌ WebSocket 读取错误: {}", e);
                        break e.to_string();
                    }
                    None => break "stream ended".to_string(),
                }
            };
            let _ = inbound_for_read.send(TransportSignal::Closed { reason });
        });

        // 写任务：发送端全部丢弃时发送 Close 帧并退出
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    warn!("⚠️ WebSocket 发送失败: {}", e);
                    let _ = inbound_tx.send(TransportSignal::Closed { reason: e.to_string() });
                    return;
                }
            }
            debug!("出站通道已关闭，发送 Close 帧");
            let _ = write.send(Message::Close(None)).await;
        });

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }

    fn name(&self) -> &'static str {
        "WebSocket"
    }
}
