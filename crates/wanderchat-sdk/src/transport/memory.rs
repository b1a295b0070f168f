//! 进程内传输
//!
//! 每次 `open` 生成一对通道，服务端一侧以 [`MemoryPeer`] 的形式交给测试代码：
//! 可以读取客户端发出的指令、推送事件、主动断开。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Transport, TransportLink, TransportSignal};
use crate::error::{Result, SdkError};
use crate::protocol::{Envelope, ServerEvent};

/// 预设的打开失败
#[derive(Debug, Clone)]
pub enum MemoryFailure {
    /// 传输错误（会触发重连）
    Unreachable,
    /// 鉴权被拒
    Unauthorized,
}

#[derive(Debug, Default)]
struct Shared {
    failures: VecDeque<MemoryFailure>,
    urls: Vec<String>,
}

/// 进程内传输
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    shared: Arc<Mutex<Shared>>,
    opens: Arc<AtomicUsize>,
    open_delay: Duration,
    peers_tx: mpsc::UnboundedSender<MemoryPeer>,
    peers_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryPeer>>>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
            opens: Arc::new(AtomicUsize::new(0)),
            open_delay: Duration::ZERO,
            peers_tx,
            peers_rx: Arc::new(tokio::sync::Mutex::new(peers_rx)),
        }
    }

    /// 模拟握手耗时
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// 让接下来的一次 `open` 失败
    pub fn fail_next(&self, failure: MemoryFailure) {
        self.shared.lock().failures.push_back(failure);
    }

    /// 成功与失败的 `open` 调用总数
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// 最近一次 `open` 使用的 URL
    pub fn last_url(&self) -> Option<String> {
        self.shared.lock().urls.last().cloned()
    }

    /// 等待下一条建立成功的链路
    pub async fn accept(&self) -> Option<MemoryPeer> {
        self.peers_rx.lock().await.recv().await
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, url: &str) -> Result<TransportLink> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }

        let failure = {
            let mut shared = self.shared.lock();
            shared.urls.push(url.to_string());
            shared.failures.pop_front()
        };
        match failure {
            Some(MemoryFailure::Unreachable) => {
                return Err(SdkError::Connection("memory peer unreachable".to_string()))
            }
            Some(MemoryFailure::Unauthorized) => {
                return Err(SdkError::AuthExpired("memory peer rejected token".to_string()))
            }
            None => {}
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            from_client: outbound_rx,
            to_client: inbound_tx,
        };
        self.peers_tx
            .send(peer)
            .map_err(|_| SdkError::Connection("memory transport dropped".to_string()))?;

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }

    fn name(&self) -> &'static str {
        "Memory"
    }
}

/// 链路的服务端一侧
#[derive(Debug)]
pub struct MemoryPeer {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<TransportSignal>,
}

impl MemoryPeer {
    /// 推送一个服务端事件
    pub fn push(&self, event: &ServerEvent) -> Result<()> {
        let frame = event.encode()?;
        self.push_raw(frame)
    }

    /// 推送原始文本帧
    pub fn push_raw(&self, frame: impl Into<String>) -> Result<()> {
        self.to_client
            .send(TransportSignal::Frame(frame.into()))
            .map_err(|_| SdkError::NotConnected)
    }

    /// 服务端断开链路
    pub fn close(&self, reason: &str) {
        let _ = self.to_client.send(TransportSignal::Closed {
            reason: reason.to_string(),
        });
    }

    /// 读取客户端发来的下一条指令；客户端关闭链路时返回 `None`
    pub async fn recv(&mut self) -> Option<Envelope<serde_json::Value>> {
        let frame = self.from_client.recv().await?;
        serde_json::from_str(&frame).ok()
    }

    /// 取出当前已收到的全部指令（不等待）
    pub fn drain(&mut self) -> Vec<Envelope<serde_json::Value>> {
        let mut out = Vec::new();
        while let Ok(frame) = self.from_client.try_recv() {
            if let Ok(envelope) = serde_json::from_str(&frame) {
                out.push(envelope);
            }
        }
        out
    }
}
