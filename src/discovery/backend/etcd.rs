//! etcd 协调存储后端
//!
//! 注册路径作为 key，带租约写入；续期租约相当于心跳，实例失效后租约过期，
//! key 随之被删除。发现时按前缀 watch，etcd 上报逐个 key 的 put/delete 事件。

use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, PutOptions, WatchOptions, WatchStream as EtcdStream,
    Watcher,
};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{
    child_prefix, CoordinationBackend, KeyEvent, Members, Notification, Presence, WatchStream,
};
use crate::config::{BackendKind, RegistryConfig};
use crate::error::{BackendError, BackendResult};

/// etcd 协调存储后端
pub struct EtcdBackend {
    client: RwLock<Client>,
    endpoints: Vec<String>,
    credentials: Option<(String, String)>,
    /// 租约 TTL（秒）
    ttl: i64,
    operation_timeout: Duration,
    closed: AtomicBool,
}

impl EtcdBackend {
    /// 根据配置连接 etcd
    pub async fn connect(config: &RegistryConfig) -> BackendResult<Self> {
        let credentials = config
            .credentials()
            .map(|(user, pass)| (user.to_string(), pass.to_string()));
        let operation_timeout = config.operation_timeout();
        let ttl = i64::try_from(config.ttl)
            .map_err(|_| BackendError::other(format!("ttl {} out of range", config.ttl)))?;
        let options = connect_options(credentials.as_ref(), operation_timeout);
        let client = tokio::time::timeout(
            operation_timeout,
            Client::connect(config.endpoints.clone(), Some(options)),
        )
        .await??;

        info!(endpoints = ?config.endpoints, "Connected to etcd");

        Ok(Self {
            client: RwLock::new(client),
            endpoints: config.endpoints.clone(),
            credentials,
            ttl,
            operation_timeout,
            closed: AtomicBool::new(false),
        })
    }

    async fn client(&self) -> BackendResult<Client> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BackendError::Closed);
        }
        Ok(self.client.read().await.clone())
    }

    /// 单次操作加超时
    async fn timed<T, F>(&self, fut: F) -> BackendResult<T>
    where
        F: Future<Output = Result<T, etcd_client::Error>>,
    {
        Ok(tokio::time::timeout(self.operation_timeout, fut).await??)
    }

    /// 前缀查询；同时返回查询时的存储版本
    async fn fetch(&self, prefix: &str) -> BackendResult<(Members, Option<i64>)> {
        let mut client = self.client().await?;
        let options = GetOptions::new().with_prefix();
        let resp = self
            .timed(client.get(child_prefix(prefix), Some(options)))
            .await?;

        let members = resp
            .kvs()
            .iter()
            .map(|kv| {
                (
                    String::from_utf8_lossy(kv.key()).into_owned(),
                    kv.value().to_vec(),
                )
            })
            .collect();
        Ok((members, resp.header().map(|header| header.revision())))
    }

    async fn watch_from(
        &self,
        prefix: &str,
        start_revision: Option<i64>,
    ) -> BackendResult<Box<dyn WatchStream>> {
        let mut client = self.client().await?;
        let mut options = WatchOptions::new().with_prefix();
        if let Some(revision) = start_revision {
            options = options.with_start_revision(revision);
        }
        let (watcher, stream) = self
            .timed(client.watch(child_prefix(prefix), Some(options)))
            .await?;
        Ok(Box::new(EtcdWatch {
            _watcher: watcher,
            stream,
        }))
    }

    /// 续期间隔：TTL 的 1/3，确保过期前至少续期两次
    fn renew_interval(&self) -> Duration {
        Duration::from_secs(self.ttl.max(1).unsigned_abs()) / 3
    }
}

fn connect_options(credentials: Option<&(String, String)>, timeout: Duration) -> ConnectOptions {
    let options = ConnectOptions::new()
        .with_timeout(timeout)
        .with_connect_timeout(timeout);
    match credentials {
        Some((user, pass)) => options.with_user(user.clone(), pass.clone()),
        None => options,
    }
}

#[async_trait]
impl CoordinationBackend for EtcdBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Etcd
    }

    async fn publish(&self, path: &str, payload: &[u8]) -> BackendResult<Presence> {
        let mut client = self.client().await?;
        let lease_id = self.timed(client.lease_grant(self.ttl, None)).await?.id();

        let options = PutOptions::new().with_lease(lease_id);
        if let Err(e) = self
            .timed(client.put(path, payload.to_vec(), Some(options)))
            .await
        {
            // 写入失败时回收刚申请的租约
            if let Err(err) = self.timed(client.lease_revoke(lease_id)).await {
                debug!(lease_id, error = %err, "etcd lease not revoked after failed put");
            }
            return Err(e);
        }

        debug!(path = %path, lease_id, ttl = self.ttl, "etcd key put with lease");
        Ok(Presence::leased(path, lease_id))
    }

    async fn sustain(&self, presence: &Presence) -> BackendResult<()> {
        let lease_id = presence
            .lease_id
            .ok_or_else(|| BackendError::other("etcd presence without lease"))?;
        let mut client = self.client().await?;

        let (mut keeper, mut keep_alive) = self.timed(client.lease_keep_alive(lease_id)).await?;
        // 同时监视自己的 key，人工删除等外部原因导致的丢失无需等到续期失败
        let (mut watcher, mut own_key) = self
            .timed(client.watch(presence.path.as_str(), None))
            .await?;

        let mut ticker = tokio::time::interval(self.renew_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = keeper.keep_alive().await {
                        break Err(e.into());
                    }
                }
                message = keep_alive.message() => match message {
                    Ok(Some(resp)) if resp.ttl() <= 0 => {
                        info!(path = %presence.path, lease_id, "etcd lease expired");
                        break Ok(());
                    }
                    Ok(Some(resp)) => {
                        debug!(lease_id, ttl = resp.ttl(), "etcd lease renewed");
                    }
                    Ok(None) => break Err(BackendError::unavailable("lease keep-alive stream closed")),
                    Err(e) => break Err(e.into()),
                },
                message = own_key.message() => match message {
                    Ok(Some(resp)) => {
                        if resp.canceled() {
                            break Err(BackendError::unavailable("self watch canceled by server"));
                        }
                        if resp
                            .events()
                            .iter()
                            .any(|event| event.event_type() == EventType::Delete)
                        {
                            info!(path = %presence.path, "etcd registration key deleted");
                            break Ok(());
                        }
                    }
                    Ok(None) => break Err(BackendError::unavailable("self watch stream closed")),
                    Err(e) => break Err(e.into()),
                },
            }
        };

        if let Err(e) = watcher.cancel().await {
            debug!(error = %e, "failed to cancel etcd self watch");
        }
        outcome
    }

    async fn withdraw(&self, presence: &Presence) -> BackendResult<()> {
        let mut client = self.client().await?;
        let deleted = self
            .timed(client.delete(presence.path.as_str(), None))
            .await
            .map(|_| ());

        if let Some(lease_id) = presence.lease_id {
            match self.timed(client.lease_revoke(lease_id)).await {
                Ok(_) | Err(BackendError::SessionExpired(_)) => {}
                Err(e) => warn!(lease_id, error = %e, "failed to revoke etcd lease"),
            }
        }
        deleted
    }

    async fn list(&self, prefix: &str) -> BackendResult<Members> {
        Ok(self.fetch(prefix).await?.0)
    }

    async fn watch(&self, prefix: &str) -> BackendResult<Box<dyn WatchStream>> {
        self.watch_from(prefix, None).await
    }

    async fn list_and_watch(
        &self,
        prefix: &str,
    ) -> BackendResult<(Members, Box<dyn WatchStream>)> {
        let (members, revision) = self.fetch(prefix).await?;
        // 从列表版本之后开始 watch，既不漏事件也不重放列表之前的事件
        let stream = self.watch_from(prefix, revision.map(|rev| rev + 1)).await?;
        Ok((members, stream))
    }

    async fn reauthenticate(&self) -> BackendResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BackendError::Closed);
        }
        // etcd-client 在连接时完成认证，重新认证即重建客户端
        let options = connect_options(self.credentials.as_ref(), self.operation_timeout);
        let client = tokio::time::timeout(
            self.operation_timeout,
            Client::connect(self.endpoints.clone(), Some(options)),
        )
        .await??;
        *self.client.write().await = client;
        info!(endpoints = ?self.endpoints, "Reconnected to etcd");
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// etcd 前缀 watch，持续上报增量事件
struct EtcdWatch {
    // 持有 watcher，drop 后服务端 watch 随之结束
    _watcher: Watcher,
    stream: EtcdStream,
}

#[async_trait]
impl WatchStream for EtcdWatch {
    async fn next(&mut self) -> BackendResult<Option<Notification>> {
        loop {
            let Some(resp) = self.stream.message().await? else {
                return Ok(None);
            };
            if resp.canceled() {
                return Err(BackendError::unavailable("etcd watch canceled by server"));
            }

            let events: Vec<KeyEvent> = resp
                .events()
                .iter()
                .filter_map(|event| {
                    let kv = event.kv()?;
                    let key = String::from_utf8_lossy(kv.key()).into_owned();
                    Some(match event.event_type() {
                        EventType::Put => KeyEvent::Put {
                            key,
                            value: kv.value().to_vec(),
                        },
                        EventType::Delete => KeyEvent::Delete { key },
                    })
                })
                .collect();

            // 创建确认等不带事件的响应直接跳过
            if !events.is_empty() {
                return Ok(Some(Notification::Events(events)));
            }
        }
    }
}
