//! 进程内协调存储后端
//!
//! 语义对齐 etcd：带 TTL 的租约、按前缀列举、前缀 watch。
//! 可切换为 ZooKeeper 式的一次性“子节点变化”通知，并支持故障注入，
//! 主要用于测试和单进程部署。
//!
//! 第一次创建租约时启动后台回收任务，过期租约下的 key 会被删除并通知 watch；
//! 存储操作和续期时也会顺带回收。所有变更事件都在持有状态锁时发出，
//! 因此在锁内完成的“订阅 + 列举”不会重复收到列举之前的事件。

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    child_prefix, CoordinationBackend, KeyEvent, Members, Notification, Presence, WatchStream,
};
use crate::config::BackendKind;
use crate::error::{BackendError, BackendResult};

const DEFAULT_TTL: Duration = Duration::from_secs(10);
const EVENT_BUFFER: usize = 1024;
const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(5);

/// watch 通知方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatchMode {
    /// 逐个 key 的 put/delete 事件（etcd 风格）
    #[default]
    Incremental,
    /// 一次性的“子节点变化”通知（ZooKeeper 风格）
    ChildrenChanged,
}

#[derive(Debug, Clone, Copy)]
enum Fault {
    Publish,
    Renew,
    List,
    Watch,
}

#[derive(Debug, Default)]
struct Faults {
    publish: usize,
    renew: usize,
    list: usize,
    watch: usize,
    reauth: usize,
}

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    lease: Option<i64>,
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    leases: HashMap<i64, Instant>,
    next_lease: i64,
    faults: Faults,
    reauth_required: bool,
    reauth_count: usize,
}

impl State {
    fn guard(&mut self, fault: Option<Fault>) -> BackendResult<()> {
        if self.reauth_required {
            return Err(BackendError::unauthorized("credentials rejected"));
        }
        let Some(fault) = fault else {
            return Ok(());
        };
        let counter = match fault {
            Fault::Publish => &mut self.faults.publish,
            Fault::Renew => &mut self.faults.renew,
            Fault::List => &mut self.faults.list,
            Fault::Watch => &mut self.faults.watch,
        };
        if *counter > 0 {
            *counter -= 1;
            return Err(BackendError::unavailable(format!(
                "injected {fault:?} failure"
            )));
        }
        Ok(())
    }

    fn sweep(&mut self, now: Instant) -> Vec<KeyEvent> {
        let expired: Vec<i64> = self
            .leases
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired.into_iter().flat_map(|id| self.revoke(id)).collect()
    }

    fn revoke(&mut self, lease: i64) -> Vec<KeyEvent> {
        self.leases.remove(&lease);
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.lease == Some(lease))
            .map(|(key, _)| key.clone())
            .collect();
        keys.into_iter()
            .map(|key| {
                self.entries.remove(&key);
                KeyEvent::Delete { key }
            })
            .collect()
    }

    fn holds(&self, presence: &Presence) -> bool {
        let lease_alive = presence
            .lease_id
            .is_none_or(|id| self.leases.contains_key(&id));
        lease_alive
            && self
                .entries
                .get(&presence.path)
                .is_some_and(|entry| entry.lease == presence.lease_id)
    }

    fn members(&self, prefix: &str) -> Members {
        self.entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }
}

struct Inner {
    state: Mutex<State>,
    events: broadcast::Sender<KeyEvent>,
    closed: CancellationToken,
    sweeper_started: AtomicBool,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 发出事件；调用方必须持有状态锁
    fn notify(&self, _state: &State, events: Vec<KeyEvent>) {
        for event in events {
            // 没有订阅者时发送失败，忽略即可
            let _ = self.events.send(event);
        }
    }

    fn sweep_now(&self) {
        let state = &mut *self.state();
        let expired = state.sweep(Instant::now());
        if !expired.is_empty() {
            debug!(count = expired.len(), "memory leases expired");
        }
        self.notify(state, expired);
    }
}

/// 进程内协调存储
///
/// `Clone` 得到的是同一个存储的另一个句柄
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
    ttl: Duration,
    mode: WatchMode,
}

impl MemoryBackend {
    /// 创建空存储（租约 TTL 10 秒，增量 watch）
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                events,
                closed: CancellationToken::new(),
                sweeper_started: AtomicBool::new(false),
            }),
            ttl: DEFAULT_TTL,
            mode: WatchMode::default(),
        }
    }

    /// 设置租约 TTL
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// 设置 watch 通知方式
    pub fn with_watch_mode(mut self, mode: WatchMode) -> Self {
        self.mode = mode;
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state()
    }

    fn ensure_open(&self) -> BackendResult<()> {
        if self.inner.closed.is_cancelled() {
            Err(BackendError::Closed)
        } else {
            Ok(())
        }
    }

    /// 启动后台租约回收任务（只启动一次）
    fn ensure_sweeper(&self) {
        if self.inner.sweeper_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let closed = self.inner.closed.clone();
        let period = (self.ttl / 4).max(MIN_SWEEP_PERIOD);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = closed.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                inner.sweep_now();
            }
        });
    }

    /// 续期租约；返回存活标记是否仍然存在
    fn renew(&self, presence: &Presence) -> BackendResult<bool> {
        self.ensure_open()?;
        let state = &mut *self.state();
        state.guard(Some(Fault::Renew))?;
        let now = Instant::now();
        let expired = state.sweep(now);
        let held = state.holds(presence);
        if let (true, Some(id)) = (held, presence.lease_id) {
            state.leases.insert(id, now + self.ttl);
        }
        self.inner.notify(state, expired);
        Ok(held)
    }

    fn still_held(&self, presence: &Presence) -> bool {
        let state = &mut *self.state();
        let expired = state.sweep(Instant::now());
        let held = state.holds(presence);
        self.inner.notify(state, expired);
        held
    }

    // ============================================================
    // 故障注入与检查（测试用）
    // ============================================================

    /// 接下来 `n` 次 publish 失败
    pub fn fail_next_publishes(&self, n: usize) {
        self.state().faults.publish += n;
    }

    /// 接下来 `n` 次续期失败
    pub fn fail_next_renewals(&self, n: usize) {
        self.state().faults.renew += n;
    }

    /// 接下来 `n` 次 list 失败
    pub fn fail_next_lists(&self, n: usize) {
        self.state().faults.list += n;
    }

    /// 接下来 `n` 次 watch 安装失败
    pub fn fail_next_watches(&self, n: usize) {
        self.state().faults.watch += n;
    }

    /// 接下来 `n` 次重新认证失败
    pub fn fail_next_reauths(&self, n: usize) {
        self.state().faults.reauth += n;
    }

    /// 拒绝所有操作，直到调用方重新认证
    pub fn require_reauth(&self) {
        self.state().reauth_required = true;
    }

    /// 成功的重新认证次数
    pub fn reauth_count(&self) -> usize {
        self.state().reauth_count
    }

    /// 让 `path` 所在的租约立即过期；返回 key 是否存在
    pub fn expire(&self, path: &str) -> bool {
        let state = &mut *self.state();
        let events = match state.entries.get(path).map(|entry| entry.lease) {
            Some(Some(lease)) => state.revoke(lease),
            Some(None) => {
                state.entries.remove(path);
                vec![KeyEvent::Delete {
                    key: path.to_string(),
                }]
            }
            None => Vec::new(),
        };
        let existed = !events.is_empty();
        self.inner.notify(state, events);
        existed
    }

    /// 直接删除 key（模拟人工删除）；返回 key 是否存在
    pub fn delete(&self, path: &str) -> bool {
        let state = &mut *self.state();
        let existed = state.entries.remove(path).is_some();
        if existed {
            self.inner.notify(
                state,
                vec![KeyEvent::Delete {
                    key: path.to_string(),
                }],
            );
        }
        existed
    }

    /// 写入不带租约的原始数据
    pub fn put_raw(&self, path: &str, value: impl Into<Vec<u8>>) {
        let value = value.into();
        let state = &mut *self.state();
        state.entries.insert(
            path.to_string(),
            Entry {
                value: value.clone(),
                lease: None,
            },
        );
        self.inner.notify(
            state,
            vec![KeyEvent::Put {
                key: path.to_string(),
                value,
            }],
        );
    }

    /// key 是否存在
    pub fn contains(&self, path: &str) -> bool {
        self.state().entries.contains_key(path)
    }

    /// key 的当前值
    pub fn value(&self, path: &str) -> Option<Vec<u8>> {
        self.state().entries.get(path).map(|entry| entry.value.clone())
    }

    /// 以 `prefix` 开头的全部 key
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        self.state()
            .entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// 当前有效租约数量
    pub fn lease_count(&self) -> usize {
        self.state().leases.len()
    }

    /// 当前事件订阅者数量（watch 和 sustain）
    pub fn subscriber_count(&self) -> usize {
        self.inner.events.receiver_count()
    }

    /// 是否已关闭
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    fn open_watch(&self, prefix: &str) -> MemoryWatch {
        MemoryWatch {
            rx: self.inner.events.subscribe(),
            prefix: child_prefix(prefix),
            mode: self.mode,
            fired: false,
            closed: self.inner.closed.clone(),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn publish(&self, path: &str, payload: &[u8]) -> BackendResult<Presence> {
        self.ensure_open()?;
        let presence = {
            let state = &mut *self.state();
            state.guard(Some(Fault::Publish))?;
            let now = Instant::now();
            let mut events = state.sweep(now);
            state.next_lease += 1;
            let lease = state.next_lease;
            state.leases.insert(lease, now + self.ttl);
            state.entries.insert(
                path.to_string(),
                Entry {
                    value: payload.to_vec(),
                    lease: Some(lease),
                },
            );
            events.push(KeyEvent::Put {
                key: path.to_string(),
                value: payload.to_vec(),
            });
            self.inner.notify(state, events);
            Presence::leased(path, lease)
        };
        self.ensure_sweeper();
        debug!(path = %path, lease_id = ?presence.lease_id, "memory presence published");
        Ok(presence)
    }

    async fn sustain(&self, presence: &Presence) -> BackendResult<()> {
        let mut rx = self.inner.events.subscribe();
        if !self.still_held(presence) {
            return Ok(());
        }

        let period = (self.ttl / 3).max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = self.inner.closed.cancelled() => return Err(BackendError::Closed),
                _ = ticker.tick() => {
                    if !self.renew(presence)? {
                        return Ok(());
                    }
                }
                event = rx.recv() => match event {
                    Ok(event) if event.key() == presence.path => {
                        if !self.still_held(presence) {
                            return Ok(());
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => {
                        if !self.still_held(presence) {
                            return Ok(());
                        }
                    }
                    Err(RecvError::Closed) => return Err(BackendError::Closed),
                },
            }
        }
    }

    async fn withdraw(&self, presence: &Presence) -> BackendResult<()> {
        self.ensure_open()?;
        let state = &mut *self.state();
        state.guard(None)?;
        let owned = state
            .entries
            .get(&presence.path)
            .is_some_and(|entry| entry.lease == presence.lease_id);
        let mut events = Vec::new();
        if owned {
            state.entries.remove(&presence.path);
            events.push(KeyEvent::Delete {
                key: presence.path.clone(),
            });
        }
        if let Some(lease) = presence.lease_id {
            events.extend(state.revoke(lease));
        }
        self.inner.notify(state, events);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> BackendResult<Members> {
        self.ensure_open()?;
        let state = &mut *self.state();
        state.guard(Some(Fault::List))?;
        let expired = state.sweep(Instant::now());
        self.inner.notify(state, expired);
        Ok(state.members(&child_prefix(prefix)))
    }

    async fn watch(&self, prefix: &str) -> BackendResult<Box<dyn WatchStream>> {
        self.ensure_open()?;
        self.state().guard(Some(Fault::Watch))?;
        Ok(Box::new(self.open_watch(prefix)))
    }

    async fn list_and_watch(
        &self,
        prefix: &str,
    ) -> BackendResult<(Members, Box<dyn WatchStream>)> {
        self.ensure_open()?;
        let state = &mut *self.state();
        state.guard(Some(Fault::Watch))?;
        state.guard(Some(Fault::List))?;
        let expired = state.sweep(Instant::now());
        self.inner.notify(state, expired);
        // 持锁订阅：列举之前的事件不会再出现在 watch 中
        let watch = self.open_watch(prefix);
        let members = state.members(&child_prefix(prefix));
        Ok((members, Box::new(watch)))
    }

    async fn reauthenticate(&self) -> BackendResult<()> {
        self.ensure_open()?;
        let mut state = self.state();
        if state.faults.reauth > 0 {
            state.faults.reauth -= 1;
            return Err(BackendError::unauthorized("injected reauth failure"));
        }
        state.reauth_required = false;
        state.reauth_count += 1;
        Ok(())
    }

    async fn close(&self) {
        self.inner.closed.cancel();
    }
}

struct MemoryWatch {
    rx: broadcast::Receiver<KeyEvent>,
    prefix: String,
    mode: WatchMode,
    fired: bool,
    closed: CancellationToken,
}

#[async_trait]
impl WatchStream for MemoryWatch {
    async fn next(&mut self) -> BackendResult<Option<Notification>> {
        if self.fired {
            return Ok(None);
        }
        loop {
            let event = tokio::select! {
                _ = self.closed.cancelled() => return Ok(None),
                event = self.rx.recv() => event,
            };
            match event {
                Ok(event) if event.key().starts_with(&self.prefix) => {
                    return Ok(Some(match self.mode {
                        WatchMode::Incremental => Notification::Events(vec![event]),
                        WatchMode::ChildrenChanged => {
                            self.fired = true;
                            Notification::ChildrenChanged
                        }
                    }));
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    return Err(BackendError::unavailable(format!(
                        "watch lagged behind by {skipped} events"
                    )));
                }
                Err(RecvError::Closed) => return Ok(None),
            }
        }
    }
}
