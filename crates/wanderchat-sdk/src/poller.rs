//! 回退轮询器
//!
//! socket 推送的兜底：按固定间隔重新拉取当前界面的历史，结果走与推送相同的合并路径，
//! 重复的消息会被折叠而不是重复渲染。
//! - 单次轮询失败只记日志，下一轮照常进行，从不停止定时器
//! - `stop()` 幂等；drop 时自动停止

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SdkError};

/// 轮询统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollerStats {
    pub ticks: u64,
    pub failures: u64,
    /// 最近一次成功轮询拉到的条数
    pub last_fetched: u64,
}

#[derive(Debug, Default)]
struct Counters {
    ticks: AtomicU64,
    failures: AtomicU64,
    last_fetched: AtomicU64,
}

/// 回退轮询器
#[derive(Debug)]
pub struct FallbackPoller {
    name: String,
    cancel: Mutex<Option<CancellationToken>>,
    counters: Arc<Counters>,
}

impl FallbackPoller {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cancel: Mutex::new(None),
            counters: Arc::new(Counters::default()),
        }
    }

    /// 启动轮询；已在运行时先停止旧任务再以新间隔启动
    ///
    /// `job` 每轮调用一次，返回本轮拉到的条数。
    pub fn start<F, Fut>(&self, interval: Duration, job: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<usize>> + Send + 'static,
    {
        if interval.is_zero() {
            return Err(SdkError::InvalidArgument("轮询间隔必须大于 0".to_string()));
        }

        let cancel = CancellationToken::new();
        if let Some(previous) = self.cancel.lock().replace(cancel.clone()) {
            previous.cancel();
        }

        let name = self.name.clone();
        let counters = self.counters.clone();
        info!("⏱️ [{}] 启动轮询，间隔 {}ms", name, interval.as_millis());

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                counters.ticks.fetch_add(1, Ordering::Relaxed);
                match job().await {
                    Ok(fetched) => {
                        counters.last_fetched.store(fetched as u64, Ordering::Relaxed);
                        debug!("[{}] 轮询完成，拉取 {} 条", name, fetched);
                    }
                    Err(e) => {
                        counters.failures.fetch_add(1, Ordering::Relaxed);
                        warn!("⚠️ [{}] 轮询失败，下一轮重试: {}", name, e);
                    }
                }
            }
            debug!("[{}] 轮询任务退出", name);
        });
        Ok(())
    }

    /// 停止轮询（幂等）
    pub fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
            info!("⏹️ [{}] 轮询已停止", self.name);
        }
    }

    pub fn is_running(&self) -> bool {
        self.cancel.lock().is_some()
    }

    pub fn stats(&self) -> PollerStats {
        PollerStats {
            ticks: self.counters.ticks.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            last_fetched: self.counters.last_fetched.load(Ordering::Relaxed),
        }
    }
}

impl Drop for FallbackPoller {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.get_mut().take() {
            cancel.cancel();
        }
    }
}
