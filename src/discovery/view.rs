//! 服务视图：消费端的实例缓存和轮询选择器
//!
//! 后台任务按顺序消费快照，在锁外完成解码和排序，锁内只做列表指针替换和游标修正；
//! `next_address` 在锁内只读取列表并推进游标，不做任何 I/O。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::discovery::instance::ServiceRecord;
use crate::discovery::snapshot::MembershipSnapshot;
use crate::discovery::watcher::Subscription;

#[derive(Debug, Default)]
struct Selection {
    records: Arc<Vec<ServiceRecord>>,
    index: usize,
}

#[derive(Debug)]
struct ViewInner {
    path: String,
    selection: Mutex<Selection>,
    generation: watch::Sender<u64>,
    closed: AtomicBool,
    /// 所有句柄都被 drop 时取消
    dropped: CancellationToken,
}

impl Drop for ViewInner {
    fn drop(&mut self) {
        self.dropped.cancel();
    }
}

/// 服务视图
///
/// `Clone` 得到同一视图的另一个句柄。所有句柄都被 drop 后，后台任务随之停止并取消订阅。
#[derive(Debug, Clone)]
pub struct ServiceView {
    inner: Arc<ViewInner>,
}

impl ServiceView {
    /// 创建空视图，由调用方通过 [`ServiceView::apply`] 喂入快照
    pub fn new(path: impl Into<String>) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            inner: Arc::new(ViewInner {
                path: path.into(),
                selection: Mutex::new(Selection::default()),
                generation,
                closed: AtomicBool::new(false),
                dropped: CancellationToken::new(),
            }),
        }
    }

    /// 创建没有任何成员的视图
    pub fn empty() -> Self {
        Self::new(String::new())
    }

    /// 启动后台任务消费订阅
    pub fn spawn(subscription: Subscription) -> Self {
        let view = Self::new(subscription.path());
        let weak = Arc::downgrade(&view.inner);
        let dropped = view.inner.dropped.clone();
        tokio::spawn(consume(subscription, weak, dropped));
        view
    }

    fn selection(&self) -> MutexGuard<'_, Selection> {
        self.inner
            .selection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// 应用一个快照，整体替换当前成员
    pub fn apply(&self, snapshot: &MembershipSnapshot) {
        self.update(snapshot.decode_records());
    }

    /// 整体替换当前成员
    pub fn update(&self, mut records: Vec<ServiceRecord>) {
        records.sort_by(|a, b| {
            a.address()
                .cmp(&b.address())
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        let records = Arc::new(records);
        let len = records.len();
        {
            let mut selection = self.selection();
            selection.records = records;
            if selection.index >= len {
                selection.index = 0;
            }
        }
        self.inner.generation.send_modify(|g| *g += 1);
        debug!(path = %self.inner.path, members = len, "Service view updated");
    }

    /// 按轮询顺序返回下一个实例
    pub fn next_record(&self) -> Option<ServiceRecord> {
        let (records, index) = {
            let mut selection = self.selection();
            let len = selection.records.len();
            if len == 0 {
                return None;
            }
            if selection.index >= len {
                selection.index = 0;
            }
            let index = selection.index;
            selection.index = (index + 1) % len;
            (Arc::clone(&selection.records), index)
        };
        records.get(index).cloned()
    }

    /// 按轮询顺序返回下一个实例地址（`scheme://ip:port`），没有实例时返回 `None`
    pub fn next_address(&self) -> Option<String> {
        self.next_record().map(|record| record.address())
    }

    /// 当前全部实例
    pub fn records(&self) -> Vec<ServiceRecord> {
        let records = Arc::clone(&self.selection().records);
        records.as_ref().clone()
    }

    /// 当前全部实例地址（已排序）
    pub fn addresses(&self) -> Vec<String> {
        let records = Arc::clone(&self.selection().records);
        records.iter().map(ServiceRecord::address).collect()
    }

    pub fn len(&self) -> usize {
        self.selection().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 监听的服务路径
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// 订阅是否已结束（之后成员不再变化）
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// 订阅成员变化；每应用一个快照版本号加一
    pub fn changed(&self) -> watch::Receiver<u64> {
        self.inner.generation.subscribe()
    }

    /// 等待成员满足条件
    ///
    /// 订阅结束时条件仍不满足则返回 `false`
    pub async fn wait_until<F>(&self, mut predicate: F) -> bool
    where
        F: FnMut(&ServiceView) -> bool,
    {
        let mut changes = self.changed();
        loop {
            if predicate(self) {
                return true;
            }
            if self.is_closed() {
                return false;
            }
            if changes.changed().await.is_err() {
                return predicate(self);
            }
        }
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.generation.send_modify(|g| *g += 1);
    }
}

async fn consume(
    mut subscription: Subscription,
    view: Weak<ViewInner>,
    dropped: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = dropped.cancelled() => None,
            next = subscription.recv() => Some(next),
        };
        match next {
            Some(Some(snapshot)) => {
                let Some(inner) = view.upgrade() else {
                    break;
                };
                ServiceView { inner }.apply(&snapshot);
            }
            Some(None) => {
                if let Some(inner) = view.upgrade() {
                    info!(path = %inner.path, "Service view closed");
                    ServiceView { inner }.close();
                }
                return;
            }
            None => break,
        }
    }
    debug!(path = %subscription.path(), "Service view dropped, cancelling subscription");
}
