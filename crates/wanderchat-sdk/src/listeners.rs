//! 监听器注册表
//!
//! 多个独立挂载的 UI 界面订阅同一类事件时使用：
//! - `subscribe` 返回 [`Subscription`]，显式 `unsubscribe()` 或 drop 时注销，且只注销一次
//! - 分发时先复制一份快照再逐个回调，回调内注销自己或他人都不会影响本轮其余回调
//! - 按 key 分组，某个 key 的最后一个订阅者注销后该 key 被回收
//! - `clear()` 之后旧的 `Subscription` 再注销是空操作，不会误删新会话注册的监听器

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::debug;

/// 监听回调
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// 全局递增的监听器 id，跨注册表、跨会话唯一
static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

struct Entry<T> {
    id: u64,
    callback: Callback<T>,
}

type Slots<K, T> = RwLock<HashMap<K, Vec<Entry<T>>>>;

/// 按 key 分组的监听器注册表
pub struct ListenerRegistry<K, T> {
    name: &'static str,
    slots: Arc<Slots<K, T>>,
}

impl<K, T> Clone for ListenerRegistry<K, T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            slots: self.slots.clone(),
        }
    }
}

impl<K, T> std::fmt::Debug for ListenerRegistry<K, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("name", &self.name)
            .field("keys", &self.slots.read().len())
            .finish()
    }
}

impl<K, T> ListenerRegistry<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
    T: 'static,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slots: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 为某个 key 注册回调
    pub fn subscribe_key<F>(&self, key: K, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed);
        self.slots
            .write()
            .entry(key.clone())
            .or_default()
            .push(Entry {
                id,
                callback: Arc::new(callback),
            });
        debug!("[{}] 注册监听器 #{} key={:?}", self.name, id, key);

        let weak: Weak<Slots<K, T>> = Arc::downgrade(&self.slots);
        let name = self.name;
        Subscription::new(id, move || {
            if let Some(slots) = weak.upgrade() {
                remove_entry(name, &slots, &key, id);
            }
        })
    }

    /// 向某个 key 的全部监听器分发；返回送达数量，无监听器时为 0（事件被丢弃）
    pub fn emit_key(&self, key: &K, event: &T) -> usize {
        let snapshot: Vec<Callback<T>> = match self.slots.read().get(key) {
            Some(entries) => entries.iter().map(|e| e.callback.clone()).collect(),
            None => return 0,
        };
        for callback in &snapshot {
            callback(event);
        }
        snapshot.len()
    }

    /// 某个 key 当前的监听器数量
    pub fn len_key(&self, key: &K) -> usize {
        self.slots.read().get(key).map(Vec::len).unwrap_or(0)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.slots.read().contains_key(key)
    }

    /// 当前有监听器的 key
    pub fn keys(&self) -> Vec<K> {
        self.slots.read().keys().cloned().collect()
    }

    /// 全部监听器数量
    pub fn total(&self) -> usize {
        self.slots.read().values().map(Vec::len).sum()
    }

    /// 清空全部监听器（断开/登出时调用）
    pub fn clear(&self) {
        let removed = {
            let mut slots = self.slots.write();
            let count = slots.values().map(Vec::len).sum::<usize>();
            slots.clear();
            count
        };
        if removed > 0 {
            debug!("[{}] 已清空 {} 个监听器", self.name, removed);
        }
    }
}

impl<T: 'static> ListenerRegistry<(), T> {
    /// 注册全局回调
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.subscribe_key((), callback)
    }

    /// 向全部全局回调分发
    pub fn emit(&self, event: &T) -> usize {
        self.emit_key(&(), event)
    }

    pub fn len(&self) -> usize {
        self.len_key(&())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn remove_entry<K, T>(name: &str, slots: &Slots<K, T>, key: &K, id: u64)
where
    K: Eq + Hash + std::fmt::Debug,
{
    let mut slots = slots.write();
    let Some(entries) = slots.get_mut(key) else {
        return;
    };
    let before = entries.len();
    entries.retain(|e| e.id != id);
    if entries.len() != before {
        debug!("[{}] 注销监听器 #{} key={:?}", name, id, key);
    }
    if entries.is_empty() {
        slots.remove(key);
    }
}

/// 订阅句柄
///
/// 由挂载监听器的 UI 组件持有；`unsubscribe()` 或 drop 时注销，注销动作最多执行一次。
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    remover: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn new(id: u64, remover: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            remover: Some(Box::new(remover)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// 主动注销
    pub fn unsubscribe(mut self) {
        self.run_remover();
    }

    fn run_remover(&mut self) {
        if let Some(remover) = self.remover.take() {
            remover();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_remover();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.remover.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_emit_reaches_every_listener_once() {
        let registry: ListenerRegistry<(), u32> = ListenerRegistry::new("test");
        let hits = Arc::new(AtomicUsize::new(0));

        let subs: Vec<_> = (0..3)
            .map(|_| {
                let hits = hits.clone();
                registry.subscribe(move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        assert_eq!(registry.emit(&1), 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        drop(subs);
        assert!(registry.is_empty());
        assert_eq!(registry.emit(&2), 0);
    }

    #[test]
    fn test_unsubscribe_during_dispatch_keeps_others() {
        let registry: ListenerRegistry<String, &'static str> = ListenerRegistry::new("group");
        let received = Arc::new(Mutex::new(Vec::new()));
        let g1 = "G1".to_string();

        let r1 = received.clone();
        let _s1 = registry.subscribe_key(g1.clone(), move |_| r1.lock().push(1));

        // 监听器 2 在回调中注销自己
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let r2 = received.clone();
        let slot_in_cb = slot.clone();
        let s2 = registry.subscribe_key(g1.clone(), move |_| {
            r2.lock().push(2);
            if let Some(sub) = slot_in_cb.lock().take() {
                sub.unsubscribe();
            }
        });
        *slot.lock() = Some(s2);

        let r3 = received.clone();
        let _s3 = registry.subscribe_key(g1.clone(), move |_| r3.lock().push(3));

        assert_eq!(registry.emit_key(&g1, &"hello"), 3);
        assert_eq!(*received.lock(), vec![1, 2, 3]);
        assert_eq!(registry.len_key(&g1), 2);

        received.lock().clear();
        registry.emit_key(&g1, &"again");
        assert_eq!(*received.lock(), vec![1, 3]);
    }

    #[test]
    fn test_key_is_collected_after_last_unsubscribe() {
        let registry: ListenerRegistry<String, ()> = ListenerRegistry::new("group");
        let a = registry.subscribe_key("G1".to_string(), |_| {});
        let b = registry.subscribe_key("G1".to_string(), |_| {});
        assert_eq!(registry.keys(), vec!["G1".to_string()]);

        a.unsubscribe();
        assert!(registry.contains_key(&"G1".to_string()));
        drop(b);
        assert!(!registry.contains_key(&"G1".to_string()));
        // 无监听器的 key 直接丢弃
        assert_eq!(registry.emit_key(&"G1".to_string(), &()), 0);
    }

    #[test]
    fn test_stale_subscription_after_clear_is_noop() {
        let registry: ListenerRegistry<(), u8> = ListenerRegistry::new("notify");
        let old_hits = Arc::new(AtomicUsize::new(0));
        let h = old_hits.clone();
        let old = registry.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        registry.clear();
        let new_hits = Arc::new(AtomicUsize::new(0));
        let h = new_hits.clone();
        let _new = registry.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        // 旧句柄注销不影响新注册
        drop(old);
        registry.emit(&1);
        assert_eq!(old_hits.load(Ordering::SeqCst), 0);
        assert_eq!(new_hits.load(Ordering::SeqCst), 1);
    }
}
