//! 发现监听器
//!
//! 把后端的前缀 watch 转换成完整的成员快照流：
//! 通过 `list_and_watch` 取得成员列表和只包含其后变化的 watch，随后
//! - 增量事件直接应用到本任务独占的成员表，整体发出；
//! - “子节点变化”或一次性 watch 失效时重新安装并重新拉取。
//!
//! 出错时记录日志、退避后从头开始，订阅不会因为后端故障而结束。

use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::discovery::backend::{
    CoordinationBackend, KeyEvent, Members, Notification, WatchStream,
};
use crate::discovery::snapshot::MembershipSnapshot;
use crate::error::{BackendError, BackendResult};
use crate::retry::{BackoffPolicy, RetryState};

/// 快照通道容量
const SNAPSHOT_BUFFER: usize = 1;

type Armed = (Box<dyn WatchStream>, Members);

/// 成员快照订阅
///
/// 后台监听器停止后（token 取消或后端关闭）`recv` 返回 `None`。
/// drop 订阅会停止对应的监听器。
pub struct Subscription {
    path: String,
    rx: mpsc::Receiver<MembershipSnapshot>,
    token: CancellationToken,
}

impl Subscription {
    /// 监听的前缀
    pub fn path(&self) -> &str {
        &self.path
    }

    /// 接收下一个快照
    pub async fn recv(&mut self) -> Option<MembershipSnapshot> {
        self.rx.recv().await
    }

    /// 停止监听，可重复调用
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Stream for Subscription {
    type Item = MembershipSnapshot;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("path", &self.path)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

/// 单个订阅的监听任务
pub(crate) struct Watcher {
    backend: Arc<dyn CoordinationBackend>,
    prefix: String,
    tx: mpsc::Sender<MembershipSnapshot>,
    retry: RetryState,
    /// 本轮失败中已经重新认证成功过一次
    reauthed: bool,
    token: CancellationToken,
}

impl Watcher {
    /// 启动监听器
    ///
    /// 第一次安装 watch 和拉取列表在调用方中同步完成：不可重试的错误直接返回，
    /// 暂时性错误交给后台重试循环
    pub(crate) async fn start(
        backend: Arc<dyn CoordinationBackend>,
        prefix: String,
        backoff: BackoffPolicy,
        parent: &CancellationToken,
    ) -> BackendResult<Subscription> {
        let token = parent.child_token();
        let (tx, rx) = mpsc::channel(SNAPSHOT_BUFFER);

        let watcher = Watcher {
            backend,
            prefix: prefix.clone(),
            tx,
            retry: RetryState::new(backoff),
            reauthed: false,
            token: token.clone(),
        };

        let initial = match watcher.arm().await {
            Ok(armed) => Some(armed),
            Err(e) if e.is_transient() => {
                warn!(
                    prefix = %prefix,
                    error = %e,
                    "⚠️ Initial discovery fetch failed, retrying in background"
                );
                None
            }
            Err(e) => return Err(e),
        };
        tokio::spawn(watcher.run(initial));

        Ok(Subscription {
            path: prefix,
            rx,
            token,
        })
    }

    /// 安装 watch 并拉取当前成员
    async fn arm(&self) -> BackendResult<Armed> {
        let (members, stream) = self.backend.list_and_watch(&self.prefix).await?;
        Ok((stream, members))
    }

    async fn run(mut self, mut armed: Option<Armed>) {
        info!(prefix = %self.prefix, "🔍 Discovery subscription started");

        'subscription: loop {
            let (mut stream, mut members) = match armed.take() {
                Some(armed) => armed,
                None => match self.arm().await {
                    Ok(armed) => armed,
                    Err(e) => {
                        if self.recover(e).await {
                            continue;
                        }
                        break;
                    }
                },
            };
            self.retry.reset();
            self.reauthed = false;

            if !self.emit(&members).await {
                break;
            }

            loop {
                let next = tokio::select! {
                    _ = self.token.cancelled() => None,
                    next = stream.next() => Some(next),
                };
                match next {
                    None => break 'subscription,
                    Some(Ok(Some(Notification::Events(events)))) => {
                        apply_events(&mut members, events);
                        if !self.emit(&members).await {
                            break 'subscription;
                        }
                    }
                    // 一次性 watch 已触发或流已结束，重新安装并重新拉取
                    Some(Ok(Some(Notification::ChildrenChanged))) | Some(Ok(None)) => {
                        continue 'subscription;
                    }
                    Some(Err(e)) => {
                        if self.recover(e).await {
                            continue 'subscription;
                        }
                        break 'subscription;
                    }
                }
            }
        }

        info!(prefix = %self.prefix, "🛑 Discovery subscription stopped");
    }

    /// 处理后端错误；返回 `false` 表示监听应当结束
    async fn recover(&mut self, error: BackendError) -> bool {
        if error.is_terminal() {
            warn!(prefix = %self.prefix, error = %error, "Backend closed, discovery stopped");
            return false;
        }
        warn!(
            prefix = %self.prefix,
            error = %error,
            attempt = self.retry.attempts() + 1,
            "⚠️ Discovery watch failed, retrying"
        );
        if error.needs_reauth() {
            match self.backend.reauthenticate().await {
                // 重新认证成功后立即重试一次
                Ok(()) if !self.reauthed => {
                    self.reauthed = true;
                    return !self.token.is_cancelled();
                }
                Ok(()) => {}
                Err(e) => {
                    warn!(prefix = %self.prefix, error = %e, "⚠️ Re-authentication failed");
                }
            }
        }
        self.retry.backoff(&self.token).await
    }

    /// 发出完整快照；订阅已取消或接收方已关闭时返回 `false`
    async fn emit(&self, members: &Members) -> bool {
        let snapshot = MembershipSnapshot::new(members.values().cloned().collect());
        debug!(prefix = %self.prefix, members = snapshot.len(), "Emitting membership snapshot");
        tokio::select! {
            _ = self.token.cancelled() => false,
            sent = self.tx.send(snapshot) => sent.is_ok(),
        }
    }
}

fn apply_events(members: &mut Members, events: Vec<KeyEvent>) {
    for event in events {
        match event {
            KeyEvent::Put { key, value } => {
                members.insert(key, value);
            }
            KeyEvent::Delete { key } => {
                members.remove(&key);
            }
        }
    }
}
