//! 客户端限流模块
//!
//! 1. **重连退避** - 链路断开后按指数退避重连，防止重连风暴
//! 2. **消息发送频率限制** - 私聊/群聊分别限制，防止客户端 bug 导致刷屏
//!
//! | 类型 | 默认限制 | 说明 |
//! |------|------|------|
//! | 消息发送（私聊）| 10 条/秒 | 正常打字速度 |
//! | 消息发送（群聊）| 5 条/秒 | 群聊需考虑 fan-out |
//! | 重连尝试 | 1s 起，翻倍，15s 封顶 | 指数退避 + 抖动 |

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// 秒数转 `Duration`；NaN / 负数归零，溢出封顶
fn saturating_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(if secs > 0.0 { Duration::MAX } else { Duration::ZERO })
}

/// 令牌桶限流器
#[derive(Debug)]
pub struct TokenBucket {
    /// 令牌容量
    capacity: f64,
    /// 当前令牌数
    tokens: f64,
    /// 每秒补充的令牌数
    refill_rate: f64,
    /// 上次补充时间
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    /// 尝试消耗令牌，失败时返回需要等待的时间
    pub fn try_consume(&mut self, tokens_needed: f64) -> Result<(), Duration> {
        self.refill();

        if self.tokens >= tokens_needed {
            self.tokens -= tokens_needed;
            Ok(())
        } else {
            let deficit = tokens_needed - self.tokens;
            Err(saturating_secs(deficit / self.refill_rate))
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
            self.last_refill = now;
        }
    }
}

/// 消息发送限流器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRateLimiterConfig {
    /// 私聊消息限制（条/秒）
    pub private_message_per_second: f64,
    /// 群聊消息限制（条/秒）
    pub group_message_per_second: f64,
    /// 突发容量倍数
    pub burst_multiplier: f64,
}

impl Default for MessageRateLimiterConfig {
    fn default() -> Self {
        Self {
            private_message_per_second: 10.0,
            group_message_per_second: 5.0,
            burst_multiplier: 2.0,
        }
    }
}

impl MessageRateLimiterConfig {
    /// 速率必须为正的有限值，突发倍数不小于 1
    pub fn validate(&self) -> Result<(), String> {
        for (name, rate) in [
            ("私聊发送速率", self.private_message_per_second),
            ("群聊发送速率", self.group_message_per_second),
        ] {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(format!("{} 必须为正数: {}", name, rate));
            }
        }
        if !self.burst_multiplier.is_finite() || self.burst_multiplier < 1.0 {
            return Err(format!("突发倍数不能小于 1: {}", self.burst_multiplier));
        }
        Ok(())
    }
}

/// 消息发送限流器
#[derive(Debug)]
pub struct MessageRateLimiter {
    private_bucket: Mutex<TokenBucket>,
    group_bucket: Mutex<TokenBucket>,
}

impl MessageRateLimiter {
    pub fn new(config: MessageRateLimiterConfig) -> Self {
        Self {
            private_bucket: Mutex::new(TokenBucket::new(
                config.private_message_per_second * config.burst_multiplier,
                config.private_message_per_second,
            )),
            group_bucket: Mutex::new(TokenBucket::new(
                config.group_message_per_second * config.burst_multiplier,
                config.group_message_per_second,
            )),
        }
    }

    /// 检查是否可以发送；`Err` 为需要等待的时间
    pub fn check_send(&self, is_group: bool) -> Result<(), Duration> {
        let bucket = if is_group { &self.group_bucket } else { &self.private_bucket };
        bucket.lock().try_consume(1.0).map_err(|wait| {
            warn!(
                "消息发送超限（{}），需要等待 {}ms",
                if is_group { "群聊" } else { "私聊" },
                wait.as_millis()
            );
            wait
        })
    }
}

/// 重连退避配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// 初始重连间隔（毫秒）
    pub initial_interval_ms: u64,
    /// 最大重连间隔（毫秒）
    pub max_interval_ms: u64,
    /// 退避倍数
    pub backoff_multiplier: f64,
    /// 随机抖动因子 (0.0-1.0)
    pub jitter_factor: f64,
    /// 最大连续重连次数，0 表示不限
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 1_000,
            max_interval_ms: 15_000, // 1s → 2s → 4s → 8s → 15s 封顶
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 0,
        }
    }
}

impl ReconnectConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_interval_ms == 0 {
            return Err("重连间隔不能为 0".to_string());
        }
        if self.max_interval_ms < self.initial_interval_ms {
            return Err(format!(
                "最大重连间隔 {}ms 小于初始间隔 {}ms",
                self.max_interval_ms, self.initial_interval_ms
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(format!("退避倍数不能小于 1: {}", self.backoff_multiplier));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(format!("抖动因子必须在 0.0-1.0 之间: {}", self.jitter_factor));
        }
        Ok(())
    }
}

/// 重连限流器
///
/// 每次调用 [`ReconnectRateLimiter::next_delay`] 得到下一次尝试前需要等待的时间，
/// 连接成功后调用 [`ReconnectRateLimiter::mark_success`] 重置。
#[derive(Debug)]
pub struct ReconnectRateLimiter {
    config: ReconnectConfig,
    /// 当前重连间隔
    current_interval: RwLock<Duration>,
    /// 连续重连次数
    attempts: RwLock<u32>,
}

impl ReconnectRateLimiter {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_interval: RwLock::new(Duration::from_millis(config.initial_interval_ms)),
            attempts: RwLock::new(0),
            config,
        }
    }

    /// 下一次重连前的等待时间；超过最大次数返回 `None`
    pub fn next_delay(&self) -> Option<Duration> {
        let mut attempts = self.attempts.write();
        if self.config.max_attempts > 0 && *attempts >= self.config.max_attempts {
            warn!("重连次数已达上限: {}", self.config.max_attempts);
            return None;
        }
        *attempts += 1;

        let mut current = self.current_interval.write();
        let base = *current;

        let next = saturating_secs(base.as_secs_f64() * self.config.backoff_multiplier)
            .min(Duration::from_millis(self.config.max_interval_ms));
        *current = next;

        let delay = if self.config.jitter_factor > 0.0 {
            let jitter =
                base.as_secs_f64() * self.config.jitter_factor * (rand::random::<f64>() - 0.5);
            saturating_secs(base.as_secs_f64() + jitter)
        } else {
            base
        };

        debug!(
            "重连尝试 #{}, 等待 {}ms（下次基准间隔 {}ms）",
            *attempts,
            delay.as_millis(),
            next.as_millis()
        );
        Some(delay)
    }

    /// 标记连接成功，重置退避
    pub fn mark_success(&self) {
        let attempts = std::mem::take(&mut *self.attempts.write());
        if attempts > 0 {
            info!("连接成功！重置重连计数器（之前尝试了 {} 次）", attempts);
        }
        *self.current_interval.write() = Duration::from_millis(self.config.initial_interval_ms);
    }

    pub fn stats(&self) -> ReconnectRateLimiterStats {
        ReconnectRateLimiterStats {
            attempts: *self.attempts.read(),
            current_interval_ms: self.current_interval.read().as_millis() as u64,
        }
    }
}

/// 重连限流器统计信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectRateLimiterStats {
    pub attempts: u32,
    pub current_interval_ms: u64,
}
