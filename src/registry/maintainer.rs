//! 注册维护器
//!
//! 每次 `register` 启动一个维护任务，负责创建存活标记、保持续期，
//! 并在标记丢失后重新创建。任务独占自己的租约/会话句柄，直到取消时主动删除。

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::discovery::backend::{CoordinationBackend, Presence};
use crate::error::{BackendError, BackendResult};
use crate::retry::{BackoffPolicy, RetryState};

/// 注册状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// 后端中没有存活标记
    Unregistered,
    /// 正在创建存活标记
    Publishing,
    /// 存活标记存在并在续期
    Registered,
    /// 存活标记丢失或续期失败，即将重新创建
    Lost,
    /// 已取消，正在删除存活标记
    ShuttingDown,
    /// 维护任务已结束
    Deregistered,
}

impl RegistrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationState::Unregistered => "unregistered",
            RegistrationState::Publishing => "publishing",
            RegistrationState::Registered => "registered",
            RegistrationState::Lost => "lost",
            RegistrationState::ShuttingDown => "shutting_down",
            RegistrationState::Deregistered => "deregistered",
        }
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 注册句柄
///
/// 句柄只用于观察和取消，drop 句柄不会注销服务，注册的生命周期由传入 `register`
/// 的 token 决定。
#[derive(Debug, Clone)]
pub struct Registration {
    path: String,
    token: CancellationToken,
    state: watch::Receiver<RegistrationState>,
}

impl Registration {
    /// 注册路径
    pub fn path(&self) -> &str {
        &self.path
    }

    /// 当前状态
    pub fn state(&self) -> RegistrationState {
        *self.state.borrow()
    }

    /// 订阅状态变化
    pub fn subscribe_state(&self) -> watch::Receiver<RegistrationState> {
        self.state.clone()
    }

    /// 等待进入指定状态
    ///
    /// 维护任务在进入该状态之前就已结束时返回 `false`
    pub async fn wait_for(&self, target: RegistrationState) -> bool {
        let mut rx = self.state.clone();
        rx.wait_for(|state| *state == target).await.is_ok()
    }

    /// 取消注册，可重复调用
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// 是否已取消
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 等待维护任务结束（存活标记已删除）
    pub async fn stopped(&self) {
        self.wait_for(RegistrationState::Deregistered).await;
    }

    /// 取消并等待注销完成
    pub async fn shutdown(&self) {
        self.cancel();
        self.stopped().await;
    }
}

/// 单个注册的维护任务
pub(crate) struct Maintainer {
    backend: Arc<dyn CoordinationBackend>,
    path: String,
    payload: Vec<u8>,
    retry: RetryState,
    state: watch::Sender<RegistrationState>,
    token: CancellationToken,
}

impl Maintainer {
    /// 启动维护任务
    ///
    /// `parent` 取消或句柄 `cancel` 都会结束该注册
    pub(crate) fn spawn(
        backend: Arc<dyn CoordinationBackend>,
        path: String,
        payload: Vec<u8>,
        backoff: BackoffPolicy,
        parent: &CancellationToken,
    ) -> Registration {
        let token = parent.child_token();
        let (state, state_rx) = watch::channel(RegistrationState::Unregistered);

        let maintainer = Maintainer {
            backend,
            path: path.clone(),
            payload,
            retry: RetryState::new(backoff),
            state,
            token: token.clone(),
        };
        tokio::spawn(maintainer.run());

        Registration {
            path,
            token,
            state: state_rx,
        }
    }

    fn set_state(&self, state: RegistrationState) {
        self.state.send_replace(state);
    }

    async fn run(mut self) {
        let presence = self.maintain().await;
        self.shutdown(presence).await;
    }

    /// 维护循环；返回取消时仍然存在的存活标记
    ///
    /// 标记在一个退避间隔内就丢失时（例如另一个实例写入了同一路径）先退避再重新发布，
    /// 只有稳定持有之后才清零失败计数
    async fn maintain(&mut self) -> Option<Presence> {
        let mut reauthed = false;
        loop {
            if self.token.is_cancelled() {
                return None;
            }

            self.set_state(RegistrationState::Publishing);
            // 发布不与取消竞争：发布完成后再检查取消，刚创建的标记会在退出时删除
            let presence = match self.publish().await {
                Ok(presence) => presence,
                Err(BackendError::Closed) => {
                    warn!(path = %self.path, "Backend closed, registration stopped");
                    return None;
                }
                Err(e) => {
                    warn!(
                        path = %self.path,
                        error = %e,
                        attempt = self.retry.attempts() + 1,
                        "⚠️ Failed to publish registration, retrying"
                    );
                    if !self.retry.backoff(&self.token).await {
                        return None;
                    }
                    continue;
                }
            };

            if self.token.is_cancelled() {
                return Some(presence);
            }

            self.set_state(RegistrationState::Registered);
            info!(
                path = %self.path,
                lease_id = ?presence.lease_id,
                "✅ Service registered"
            );
            let published_at = Instant::now();

            let outcome = tokio::select! {
                _ = self.token.cancelled() => None,
                result = self.backend.sustain(&presence) => Some(result),
            };

            let stable = published_at.elapsed() >= self.retry.next_delay();
            if stable {
                self.retry.reset();
                reauthed = false;
            }

            match outcome {
                None => return Some(presence),
                Some(Ok(())) => {
                    self.set_state(RegistrationState::Lost);
                    if stable {
                        warn!(path = %self.path, "⚠️ Registration lost, republishing");
                        continue;
                    }
                    warn!(
                        path = %self.path,
                        attempt = self.retry.attempts() + 1,
                        "⚠️ Registration lost shortly after publish, backing off"
                    );
                }
                Some(Err(BackendError::Closed)) => {
                    warn!(path = %self.path, "Backend closed, registration stopped");
                    return None;
                }
                Some(Err(e)) => {
                    self.set_state(RegistrationState::Lost);
                    warn!(
                        path = %self.path,
                        error = %e,
                        "⚠️ Failed to renew registration, republishing"
                    );
                    // 旧标记可能仍然存在，先尽力删除，避免与新标记重复
                    if let Err(err) = self.backend.withdraw(&presence).await {
                        debug!(path = %self.path, error = %err, "Stale registration not withdrawn");
                    }
                    // 重新认证成功后立即重新发布一次
                    if e.needs_reauth() && self.reauthenticate().await && !reauthed {
                        reauthed = true;
                        continue;
                    }
                }
            }

            if !self.retry.backoff(&self.token).await {
                return None;
            }
        }
    }

    /// 创建存活标记；认证失败时重新认证后重试一次
    async fn publish(&self) -> BackendResult<Presence> {
        match self.backend.publish(&self.path, &self.payload).await {
            Err(e) if e.needs_reauth() => {
                warn!(path = %self.path, error = %e, "Backend rejected session, re-authenticating");
                self.backend.reauthenticate().await?;
                self.backend.publish(&self.path, &self.payload).await
            }
            other => other,
        }
    }

    async fn reauthenticate(&self) -> bool {
        match self.backend.reauthenticate().await {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %self.path, error = %e, "⚠️ Re-authentication failed");
                false
            }
        }
    }

    /// 删除存活标记（只尝试一次）并结束
    async fn shutdown(&self, presence: Option<Presence>) {
        self.set_state(RegistrationState::ShuttingDown);
        if let Some(presence) = presence {
            match self.backend.withdraw(&presence).await {
                Ok(()) => info!(path = %self.path, "✅ Service unregistered"),
                Err(e) => warn!(
                    path = %self.path,
                    error = %e,
                    "⚠️ Failed to unregister service"
                ),
            }
        }
        self.set_state(RegistrationState::Deregistered);
        info!(path = %self.path, "🛑 Registration maintainer stopped");
    }
}
