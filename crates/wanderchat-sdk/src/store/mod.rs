//! 乐观消息存储与合并引擎
//!
//! 每个频道一条按时间排序的消息日志。所有修改都经由 [`MessageStore::apply`]：
//! 输入 `(state, action)`，无 IO、无副作用，推送与轮询两条写入路径串行调用同一个状态机。
//!
//! 合并规则（[`StoreAction::Reconcile`]）：
//! 1. 已存在同 id 的确认消息 → 忽略（同一条消息可能经推送和轮询各到一次）；
//!    若来者带幂等键且仍有对应的乐观消息，该乐观消息并入已有的确认消息
//! 2. 在频道尾部的乐观消息中查找匹配项：带幂等键时按键匹配，否则按
//!    （发送者、内容、时间窗口）匹配最早的一条；找到则**原位替换**，不改变位置
//! 3. 未匹配（对端发来的消息，或轮询先于回显看到）→ 追加，按 `created_at` 稳定排序，按 id 去重

mod conversation;
mod message;

pub use conversation::Conversation;
pub use message::{ChannelKey, Message, MessageState, OptimisticDraft};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::utils::time::abs_diff_millis;

/// 会话内共享的消息存储；锁只在单次 `apply` 期间持有，回调前必须释放
pub type SharedStore = Arc<Mutex<MessageStore>>;

/// 合并参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// 乐观消息与确认消息的最大时间差（毫秒），0 表示不限制
    pub window_ms: i64,
    /// 只在最近的多少条乐观消息中查找匹配
    pub tail_scan: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            tail_scan: 50,
        }
    }
}

/// 对存储的一次修改
#[derive(Debug, Clone, PartialEq)]
pub enum StoreAction {
    /// 本地发送：立即以乐观状态追加
    RecordOptimistic {
        channel: ChannelKey,
        draft: OptimisticDraft,
    },
    /// 合并一条确认消息（推送或轮询）
    Reconcile { channel: ChannelKey, incoming: Message },
    /// 合并一页确认消息（轮询/历史）
    ReconcileBatch {
        channel: ChannelKey,
        incoming: Vec<Message>,
    },
    /// 撤回一条从未确认的乐观消息（发送失败）
    RevertOptimistic { channel: ChannelKey, temp_id: String },
    /// 已读回执：把对端发来的确认消息标记为已读
    MarkRead { channel: ChannelKey, reader_id: String },
    /// 清空单个频道（REST 删除成功之后）
    ClearChannel { channel: ChannelKey },
    /// 清空全部（登出）
    ClearAll,
}

/// 单条确认消息的合并结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// 替换了乐观消息（位置不变）
    Replaced { temp_id: String, index: usize },
    /// 未匹配，作为新消息追加
    Appended,
    /// 确认消息已先经无键路径到达，对应的乐观消息被并入并移除
    Collapsed { temp_id: String },
    /// 已存在同 id 的消息
    Duplicate,
}

impl ReconcileOutcome {
    pub fn changed(&self) -> bool {
        !matches!(self, ReconcileOutcome::Duplicate)
    }
}

/// `apply` 的结果
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Recorded(Message),
    Reconciled(ReconcileOutcome),
    Batch(Vec<ReconcileOutcome>),
    Reverted(Option<Message>),
    MarkedRead(usize),
    Cleared(usize),
}

impl ApplyOutcome {
    /// 本次修改是否改变了可见状态
    pub fn changed(&self) -> bool {
        match self {
            ApplyOutcome::Recorded(_) => true,
            ApplyOutcome::Reconciled(outcome) => outcome.changed(),
            ApplyOutcome::Batch(outcomes) => outcomes.iter().any(ReconcileOutcome::changed),
            ApplyOutcome::Reverted(removed) => removed.is_some(),
            ApplyOutcome::MarkedRead(count) | ApplyOutcome::Cleared(count) => *count > 0,
        }
    }
}

/// 单个频道的消息日志
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelLog {
    messages: Vec<Message>,
}

impl ChannelLog {
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// 尚未确认的乐观消息
    pub fn pending(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| m.is_optimistic())
    }

    fn record_optimistic(&mut self, channel: ChannelKey, draft: OptimisticDraft) -> Message {
        let base = format!("temp-{}", draft.created_at.timestamp_millis());
        let mut temp_id = base.clone();
        let mut suffix = 1;
        while self.messages.iter().any(|m| m.id == temp_id) {
            temp_id = format!("{}-{}", base, suffix);
            suffix += 1;
        }

        let message = Message {
            id: temp_id,
            channel,
            sender_id: draft.sender_id,
            sender_display: draft.sender_display,
            content: draft.content,
            created_at: draft.created_at,
            state: MessageState::Optimistic,
            is_read: true,
            client_message_id: draft.client_message_id,
        };
        self.messages.push(message.clone());
        message
    }

    fn reconcile(&mut self, mut incoming: Message, config: &ReconcileConfig) -> ReconcileOutcome {
        incoming.state = MessageState::Confirmed;

        if let Some(existing) = self
            .messages
            .iter()
            .position(|m| m.is_confirmed() && m.id == incoming.id)
        {
            if let Some(key) = incoming.client_message_id.as_deref() {
                if let Some(index) = self
                    .messages
                    .iter()
                    .position(|m| m.is_optimistic() && m.client_message_id.as_deref() == Some(key))
                {
                    let orphan = self.messages.remove(index);
                    let target = if index < existing { existing - 1 } else { existing };
                    self.messages[target].client_message_id = Some(key.to_string());
                    debug!("乐观消息并入已有确认消息: {} -> {}", orphan.id, incoming.id);
                    return ReconcileOutcome::Collapsed { temp_id: orphan.id };
                }
            }
            debug!("重复的确认消息，忽略: id={}", incoming.id);
            return ReconcileOutcome::Duplicate;
        }

        if let Some(index) = self.find_optimistic_match(&incoming, config) {
            let replaced = std::mem::replace(&mut self.messages[index], incoming);
            debug!(
                "乐观消息已确认: {} -> {} (index={})",
                replaced.id, self.messages[index].id, index
            );
            return ReconcileOutcome::Replaced {
                temp_id: replaced.id,
                index,
            };
        }

        debug!("未匹配到乐观消息，追加: id={}", incoming.id);
        self.messages.push(incoming);
        self.sort_and_dedup();
        ReconcileOutcome::Appended
    }

    /// 在最近 `tail_scan` 条乐观消息中找最早的匹配项
    fn find_optimistic_match(&self, incoming: &Message, config: &ReconcileConfig) -> Option<usize> {
        let tail: Vec<usize> = self
            .messages
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, m)| m.is_optimistic())
            .take(config.tail_scan)
            .map(|(index, _)| index)
            .collect();

        // tail 为倒序，从最早的一条开始匹配
        tail.into_iter().rev().find(|&index| {
            let candidate = &self.messages[index];
            match &incoming.client_message_id {
                Some(key) => candidate.client_message_id.as_deref() == Some(key.as_str()),
                None => {
                    candidate.sender_id == incoming.sender_id
                        && candidate.content == incoming.content
                        && (config.window_ms == 0
                            || abs_diff_millis(&candidate.created_at, &incoming.created_at)
                                <= config.window_ms)
                }
            }
        })
    }

    fn sort_and_dedup(&mut self) {
        // sort_by 为稳定排序，时间相同时保持到达顺序
        self.messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let mut seen = HashSet::with_capacity(self.messages.len());
        self.messages.retain(|m| seen.insert(m.id.clone()));
    }

    fn revert(&mut self, temp_id: &str) -> Option<Message> {
        let index = self
            .messages
            .iter()
            .position(|m| m.is_optimistic() && m.id == temp_id)?;
        Some(self.messages.remove(index))
    }

    fn mark_read(&mut self, reader_id: &str) -> usize {
        let mut count = 0;
        for message in self
            .messages
            .iter_mut()
            .filter(|m| m.is_confirmed() && !m.is_read && m.sender_id != reader_id)
        {
            message.is_read = true;
            count += 1;
        }
        count
    }

    /// 对端发来且未读的确认消息数
    pub fn unread_from_others(&self, self_id: &str) -> usize {
        self.messages
            .iter()
            .filter(|m| m.is_confirmed() && !m.is_read && m.sender_id != self_id)
            .count()
    }
}

/// 全部频道的消息存储
#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    channels: HashMap<ChannelKey, ChannelLog>,
    config: ReconcileConfig,
}

impl MessageStore {
    pub fn new(config: ReconcileConfig) -> Self {
        Self {
            channels: HashMap::new(),
            config,
        }
    }

    /// 状态机入口：所有修改都从这里进入
    pub fn apply(&mut self, action: StoreAction) -> ApplyOutcome {
        match action {
            StoreAction::RecordOptimistic { channel, draft } => {
                let log = self.channels.entry(channel.clone()).or_default();
                ApplyOutcome::Recorded(log.record_optimistic(channel, draft))
            }
            StoreAction::Reconcile { channel, incoming } => {
                let log = self.channels.entry(channel).or_default();
                ApplyOutcome::Reconciled(log.reconcile(incoming, &self.config))
            }
            StoreAction::ReconcileBatch {
                channel,
                mut incoming,
            } => {
                incoming.sort_by(|a, b| a.created_at.cmp(&b.created_at));
                let log = self.channels.entry(channel).or_default();
                let config = &self.config;
                ApplyOutcome::Batch(
                    incoming
                        .into_iter()
                        .map(|message| log.reconcile(message, config))
                        .collect(),
                )
            }
            StoreAction::RevertOptimistic { channel, temp_id } => ApplyOutcome::Reverted(
                self.channels
                    .get_mut(&channel)
                    .and_then(|log| log.revert(&temp_id)),
            ),
            StoreAction::MarkRead { channel, reader_id } => ApplyOutcome::MarkedRead(
                self.channels
                    .get_mut(&channel)
                    .map(|log| log.mark_read(&reader_id))
                    .unwrap_or(0),
            ),
            StoreAction::ClearChannel { channel } => ApplyOutcome::Cleared(
                self.channels.remove(&channel).map(|log| log.len()).unwrap_or(0),
            ),
            StoreAction::ClearAll => {
                let count = self.channels.values().map(ChannelLog::len).sum();
                self.channels.clear();
                ApplyOutcome::Cleared(count)
            }
        }
    }

    /// 本地发送，返回乐观消息供界面立即渲染
    pub fn record_optimistic(&mut self, channel: &ChannelKey, draft: OptimisticDraft) -> Message {
        self.channels
            .entry(channel.clone())
            .or_default()
            .record_optimistic(channel.clone(), draft)
    }

    /// 合并一条确认消息
    pub fn reconcile(&mut self, channel: &ChannelKey, incoming: Message) -> ReconcileOutcome {
        self.channels
            .entry(channel.clone())
            .or_default()
            .reconcile(incoming, &self.config)
    }

    /// 撤回乐观消息，返回被移除的条目
    pub fn revert_optimistic(&mut self, channel: &ChannelKey, temp_id: &str) -> Option<Message> {
        self.channels.get_mut(channel)?.revert(temp_id)
    }

    /// 合并一页 REST 历史
    pub fn load_history(&mut self, channel: &ChannelKey, page: Vec<Message>) -> Vec<ReconcileOutcome> {
        match self.apply(StoreAction::ReconcileBatch {
            channel: channel.clone(),
            incoming: page,
        }) {
            ApplyOutcome::Batch(outcomes) => outcomes,
            _ => Vec::new(),
        }
    }

    /// 已读回执，返回被标记的条数
    pub fn mark_channel_read(&mut self, channel: &ChannelKey, self_id: &str) -> usize {
        self.channels
            .get_mut(channel)
            .map(|log| log.mark_read(self_id))
            .unwrap_or(0)
    }

    pub fn clear_channel(&mut self, channel: &ChannelKey) -> usize {
        self.channels.remove(channel).map(|log| log.len()).unwrap_or(0)
    }

    pub fn clear_all(&mut self) {
        self.apply(StoreAction::ClearAll);
    }

    pub fn channel(&self, channel: &ChannelKey) -> Option<&ChannelLog> {
        self.channels.get(channel)
    }

    /// 频道消息快照
    pub fn messages(&self, channel: &ChannelKey) -> Vec<Message> {
        self.channels
            .get(channel)
            .map(|log| log.messages.clone())
            .unwrap_or_default()
    }

    /// 按幂等键查找乐观消息（`message_error` 关联撤回用）
    pub fn find_by_client_id(&self, client_message_id: &str) -> Option<Message> {
        self.channels.values().find_map(|log| {
            log.pending()
                .find(|m| m.client_message_id.as_deref() == Some(client_message_id))
                .cloned()
        })
    }

    /// 由私聊日志派生会话列表，按最后一条消息时间倒序
    pub fn conversations(&self, self_id: &str) -> Vec<Conversation> {
        let mut conversations: Vec<Conversation> = self
            .channels
            .iter()
            .filter_map(|(key, log)| match key {
                ChannelKey::Direct(peer) => Some(Conversation::derive(self_id, peer, log)),
                ChannelKey::Group(_) => None,
            })
            .collect();
        conversations.sort_by(|a, b| {
            let a_ts = a.last_message.as_ref().map(|m| m.created_at);
            let b_ts = b.last_message.as_ref().map(|m| m.created_at);
            b_ts.cmp(&a_ts)
        });
        conversations
    }
}
