//! ZooKeeper 协调存储后端
//!
//! 注册路径 `/ns/service/endpoint/user/192.168.2.1`：先补齐持久化父节点，
//! 再创建临时节点。服务不可用时会话超时，临时节点随会话销毁，起到存活检测的作用。
//! ZooKeeper 的 watch 是一次性的，且只通知“子节点变化”，发现时需要重新拉取。

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use zookeeper_client as zk;

use super::{CoordinationBackend, Members, Notification, Presence, WatchStream};
use crate::config::{BackendKind, RegistryConfig};
use crate::error::{BackendError, BackendResult};

/// ZooKeeper 协调存储后端
pub struct ZookeeperBackend {
    client: RwLock<zk::Client>,
    /// `host1:2181,host2:2181`
    cluster: String,
    credentials: Option<(String, String)>,
    operation_timeout: Duration,
    closed: AtomicBool,
}

impl ZookeeperBackend {
    /// 根据配置连接 ZooKeeper
    pub async fn connect(config: &RegistryConfig) -> BackendResult<Self> {
        let cluster = config.endpoints.join(",");
        let credentials = config
            .credentials()
            .map(|(user, pass)| (user.to_string(), pass.to_string()));
        let operation_timeout = config.operation_timeout();

        let client = open_session(&cluster, credentials.as_ref(), operation_timeout).await?;
        info!(cluster = %cluster, "Connected to ZooKeeper");

        Ok(Self {
            client: RwLock::new(client),
            cluster,
            credentials,
            operation_timeout,
            closed: AtomicBool::new(false),
        })
    }

    async fn client(&self) -> BackendResult<zk::Client> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BackendError::Closed);
        }
        Ok(self.client.read().await.clone())
    }

    async fn timed<T, F>(&self, fut: F) -> BackendResult<T>
    where
        F: Future<Output = Result<T, zk::Error>>,
    {
        Ok(tokio::time::timeout(self.operation_timeout, fut).await??)
    }

    /// 配置了用户时只允许创建者访问，否则对所有人开放
    fn acls(&self) -> zk::Acls<'static> {
        if self.credentials.is_some() {
            zk::Acls::creator_all()
        } else {
            zk::Acls::anyone_all()
        }
    }

    /// 逐级创建持久化父节点
    async fn ensure_parents(&self, client: &zk::Client, path: &str) -> BackendResult<()> {
        let Some((parent, _)) = path.rsplit_once('/') else {
            return Err(BackendError::InvalidPath(path.to_string()));
        };
        let options = zk::CreateMode::Persistent.with_acls(self.acls());

        let mut current = String::new();
        for part in parent.split('/').filter(|part| !part.is_empty()) {
            current.push('/');
            current.push_str(part);
            match self.timed(client.create(&current, &[], &options)).await {
                Ok(_) | Err(BackendError::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

async fn open_session(
    cluster: &str,
    credentials: Option<&(String, String)>,
    timeout: Duration,
) -> BackendResult<zk::Client> {
    let client = tokio::time::timeout(timeout, zk::Client::connect(cluster)).await??;
    if let Some((user, pass)) = credentials {
        add_auth(&client, user, pass, timeout).await?;
    }
    Ok(client)
}

/// 添加 digest 用户验证
async fn add_auth(client: &zk::Client, user: &str, pass: &str, timeout: Duration) -> BackendResult<()> {
    let auth = format!("{user}:{pass}").into_bytes();
    tokio::time::timeout(timeout, client.auth("digest".to_string(), auth)).await??;
    Ok(())
}

#[async_trait]
impl CoordinationBackend for ZookeeperBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Zookeeper
    }

    async fn publish(&self, path: &str, payload: &[u8]) -> BackendResult<Presence> {
        let client = self.client().await?;
        self.ensure_parents(&client, path).await?;

        let options = zk::CreateMode::Ephemeral.with_acls(self.acls());
        match self.timed(client.create(path, payload, &options)).await {
            Ok(_) => {}
            Err(BackendError::NodeExists(_)) => {
                // 只替换本会话残留的节点；其他会话持有的节点原样返回冲突，由调用方退避
                let stat = match self.timed(client.check_stat(path)).await? {
                    Some(stat) => stat,
                    None => {
                        self.timed(client.create(path, payload, &options)).await?;
                        debug!(path = %path, "zookeeper ephemeral node created");
                        return Ok(Presence::ephemeral(path));
                    }
                };
                if stat.ephemeral_owner != client.session_id().0 {
                    return Err(BackendError::NodeExists(format!(
                        "{path} is owned by session {:#x}",
                        stat.ephemeral_owner
                    )));
                }
                debug!(path = %path, "replacing stale ephemeral node");
                match self.timed(client.delete(path, Some(stat.version))).await {
                    Ok(()) | Err(BackendError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
                self.timed(client.create(path, payload, &options)).await?;
            }
            Err(e) => return Err(e),
        }

        debug!(path = %path, "zookeeper ephemeral node created");
        Ok(Presence::ephemeral(path))
    }

    async fn sustain(&self, presence: &Presence) -> BackendResult<()> {
        // 临时节点依靠会话保活，这里只需监视节点是否还存在
        loop {
            let client = self.client().await?;
            let (stat, watcher) = self
                .timed(client.check_and_watch_stat(&presence.path))
                .await?;
            if stat.is_none() {
                return Ok(());
            }

            let event = watcher.changed().await;
            debug!(path = %presence.path, event = ?event.event_type, "registration node watch fired");
            match event.event_type {
                zk::EventType::NodeDeleted => return Ok(()),
                zk::EventType::Session => match event.session_state {
                    zk::SessionState::Expired | zk::SessionState::Closed => return Ok(()),
                    zk::SessionState::AuthFailed => {
                        return Err(BackendError::unauthorized("zookeeper auth failed"));
                    }
                    _ => continue,
                },
                _ => continue,
            }
        }
    }

    async fn withdraw(&self, presence: &Presence) -> BackendResult<()> {
        let client = self.client().await?;
        match self.timed(client.delete(&presence.path, None)).await {
            Ok(()) | Err(BackendError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, prefix: &str) -> BackendResult<Members> {
        let client = self.client().await?;
        let prefix = prefix.trim_end_matches('/');
        let children = match self.timed(client.get_children(prefix)).await {
            Ok((children, _)) => children,
            Err(BackendError::NotFound(_)) => return Ok(Members::new()),
            Err(e) => return Err(e),
        };

        let mut members = Members::new();
        for child in children {
            let path = format!("{prefix}/{child}");
            match self.timed(client.get_data(&path)).await {
                Ok((data, _)) => {
                    members.insert(path, data);
                }
                // 列举之后被删除的节点直接跳过
                Err(BackendError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(members)
    }

    async fn watch(&self, prefix: &str) -> BackendResult<Box<dyn WatchStream>> {
        let client = self.client().await?;
        let prefix = prefix.trim_end_matches('/');
        match self.timed(client.get_and_watch_children(prefix)).await {
            Ok((_, _, watcher)) => Ok(Box::new(ZookeeperWatch::armed(watcher))),
            Err(BackendError::NotFound(_)) => {
                // 服务节点还不存在：监视其创建
                let (stat, watcher) = self.timed(client.check_and_watch_stat(prefix)).await?;
                if stat.is_some() {
                    // 两次调用之间刚被创建，直接通知重新拉取
                    Ok(Box::new(ZookeeperWatch::fired()))
                } else {
                    debug!(path = %prefix, "service node missing, watching for creation");
                    Ok(Box::new(ZookeeperWatch::armed(watcher)))
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn reauthenticate(&self) -> BackendResult<()> {
        let client = self.client().await?;
        // 会话仍有效时只需重新添加认证信息
        if let Some((user, pass)) = &self.credentials {
            match add_auth(&client, user, pass, self.operation_timeout).await {
                Ok(()) => return Ok(()),
                Err(e) => warn!(error = %e, "zookeeper re-auth failed, opening new session"),
            }
        }

        let fresh = open_session(&self.cluster, self.credentials.as_ref(), self.operation_timeout).await?;
        *self.client.write().await = fresh;
        info!(cluster = %self.cluster, "Opened new ZooKeeper session");
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// 一次性 watch：触发一次后失效
struct ZookeeperWatch {
    watcher: Option<zk::OneshotWatcher>,
    pending: bool,
}

impl ZookeeperWatch {
    fn armed(watcher: zk::OneshotWatcher) -> Self {
        Self {
            watcher: Some(watcher),
            pending: false,
        }
    }

    fn fired() -> Self {
        Self {
            watcher: None,
            pending: true,
        }
    }
}

#[async_trait]
impl WatchStream for ZookeeperWatch {
    async fn next(&mut self) -> BackendResult<Option<Notification>> {
        let Some(watcher) = self.watcher.take() else {
            if std::mem::take(&mut self.pending) {
                return Ok(Some(Notification::ChildrenChanged));
            }
            return Ok(None);
        };

        let event = watcher.changed().await;
        match (event.event_type, event.session_state) {
            (zk::EventType::Session, zk::SessionState::Expired | zk::SessionState::Closed) => {
                Err(BackendError::session_expired("zookeeper session ended"))
            }
            (zk::EventType::Session, zk::SessionState::AuthFailed) => {
                Err(BackendError::unauthorized("zookeeper auth failed"))
            }
            _ => Ok(Some(Notification::ChildrenChanged)),
        }
    }
}
