//! etcd lock backend
//!
//! A session is an etcd lease kept alive by a background task; the lock
//! itself is etcd's lock service with ownership tied to that lease.

use super::{DistributedLock, LockBackend, LockGrant, LockSession};
use crate::common::{join_root, Error, MetastoreConfig, Result};
use crate::metastore::etcd::{connect, endpoints_from_uri, request};
use crate::metastore::SchemeType;
use async_trait::async_trait;
use etcd_client::{Client, LockOptions};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lease-backed session
pub struct EtcdSession {
    lease_id: i64,
    valid: Arc<AtomicBool>,
    cancel: CancellationToken,
    keep_alive: JoinHandle<()>,
}

impl EtcdSession {
    pub fn lease_id(&self) -> i64 {
        self.lease_id
    }
}

impl LockSession for EtcdSession {
    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst) && !self.keep_alive.is_finished()
    }
}

pub struct EtcdLockBackend {
    client: Client,
    session_ttl: i64,
    request_timeout: Duration,
}

impl EtcdLockBackend {
    pub fn new(client: Client, config: &MetastoreConfig) -> Self {
        Self {
            client,
            session_ttl: config.session_ttl_secs,
            request_timeout: config.request_timeout(),
        }
    }
}

#[async_trait]
impl LockBackend for EtcdLockBackend {
    type Session = EtcdSession;

    async fn open_session(&self) -> Result<EtcdSession> {
        let mut client = self.client.clone();
        let resp = request(
            "lease_grant",
            "",
            self.request_timeout,
            client.lease_grant(self.session_ttl, None),
        )
        .await?;

        let lease_id = resp.id();
        let valid = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();

        let keep_alive = tokio::spawn(keep_alive(
            self.client.clone(),
            lease_id,
            Duration::from_secs(self.session_ttl as u64),
            valid.clone(),
            cancel.clone(),
        ));

        tracing::debug!(target: "lock::etcd", lease_id, ttl = self.session_ttl, "session created");

        Ok(EtcdSession {
            lease_id,
            valid,
            cancel,
            keep_alive,
        })
    }

    async fn acquire(&self, session: &EtcdSession, name: &str) -> Result<LockGrant> {
        let mut client = self.client.clone();
        let resp = client
            .lock(name, Some(LockOptions::new().with_lease(session.lease_id)))
            .await?;

        let revision = resp
            .header()
            .map(|h| h.revision())
            .ok_or_else(|| Error::Other(format!("lock response without header: {}", name)))?;

        Ok(LockGrant {
            key: resp.key().to_vec(),
            revision,
        })
    }

    async fn release(&self, grant: &LockGrant) -> Result<()> {
        let mut client = self.client.clone();
        client.unlock(grant.key.clone()).await?;
        Ok(())
    }

    async fn close_session(&self, session: EtcdSession) {
        session.cancel.cancel();
        let _ = session.keep_alive.await;

        let mut client = self.client.clone();
        match request(
            "lease_revoke",
            "",
            self.request_timeout,
            client.lease_revoke(session.lease_id),
        )
        .await
        {
            Ok(_) => {
                tracing::debug!(target: "lock::etcd", lease_id = session.lease_id, "session revoked")
            }
            Err(e) => {
                tracing::warn!(target: "lock::etcd", lease_id = session.lease_id, error = %e, "failed to revoke session")
            }
        }
    }
}

/// Outcome of waiting for one keep-alive acknowledgement
#[derive(Debug, PartialEq, Eq)]
enum Ack {
    /// The lease was refreshed
    Alive,
    /// The server no longer knows the lease
    Expired,
    /// No usable answer within the period; the stream is reopened
    Lost,
    Cancelled,
}

/// Wait at most `period` for the reply carrying the refreshed TTL
async fn wait_ack<F, E>(
    reply: F,
    period: Duration,
    lease_id: i64,
    cancel: &CancellationToken,
) -> Ack
where
    F: Future<Output = std::result::Result<Option<i64>, E>>,
    E: fmt::Display,
{
    let reply = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ack::Cancelled,
        reply = tokio::time::timeout(period, reply) => reply,
    };

    match reply {
        Ok(Ok(Some(ttl))) if ttl > 0 => Ack::Alive,
        Ok(Ok(Some(_))) => Ack::Expired,
        Ok(Ok(None)) => {
            tracing::warn!(target: "lock::etcd", lease_id, "keep-alive stream closed");
            Ack::Lost
        }
        Ok(Err(e)) => {
            tracing::warn!(target: "lock::etcd", lease_id, error = %e, "keep-alive failed");
            Ack::Lost
        }
        Err(_) => {
            tracing::warn!(target: "lock::etcd", lease_id, timeout_ms = period.as_millis() as u64, "keep-alive not acknowledged");
            Ack::Lost
        }
    }
}

/// Refresh the lease every third of its TTL.
///
/// Transient failures are retried; the session only turns invalid once a
/// full TTL has passed without an acknowledged refresh, or the server reports
/// the lease gone. No step waits longer than one period, so the TTL check
/// runs even when the connection hangs silently.
async fn keep_alive(
    mut client: Client,
    lease_id: i64,
    ttl: Duration,
    valid: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let period = (ttl / 3).max(Duration::from_millis(500));
    let mut interval = tokio::time::interval(period);
    let mut last_ack = Instant::now();
    let mut channel = None;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }

        if last_ack.elapsed() >= ttl {
            tracing::error!(target: "lock::etcd", lease_id, "session lease expired");
            valid.store(false, Ordering::SeqCst);
            return;
        }

        if channel.is_none() {
            match tokio::time::timeout(period, client.lease_keep_alive(lease_id)).await {
                Ok(Ok(pair)) => channel = Some(pair),
                Ok(Err(e)) => {
                    tracing::warn!(target: "lock::etcd", lease_id, error = %e, "failed to open keep-alive stream");
                    continue;
                }
                Err(_) => {
                    tracing::warn!(target: "lock::etcd", lease_id, "timed out opening keep-alive stream");
                    continue;
                }
            }
        }
        let Some((keeper, stream)) = channel.as_mut() else {
            continue;
        };

        match tokio::time::timeout(period, keeper.keep_alive()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(target: "lock::etcd", lease_id, error = %e, "failed to send keep-alive");
                channel = None;
                continue;
            }
            Err(_) => {
                tracing::warn!(target: "lock::etcd", lease_id, "timed out sending keep-alive");
                channel = None;
                continue;
            }
        }

        let reply = async { stream.message().await.map(|msg| msg.map(|resp| resp.ttl())) };
        match wait_ack(reply, period, lease_id, &cancel).await {
            Ack::Alive => last_ack = Instant::now(),
            Ack::Expired => {
                tracing::error!(target: "lock::etcd", lease_id, "session lease not found");
                valid.store(false, Ordering::SeqCst);
                return;
            }
            Ack::Lost => channel = None,
            Ack::Cancelled => return,
        }
    }
}

/// Distributed lock on etcd
pub type EtcdLock = DistributedLock<EtcdLockBackend>;

impl DistributedLock<EtcdLockBackend> {
    /// Bind a lock to `etcd://host/path[?endpoints=...]`; the lock name is
    /// `/host/path`.
    pub async fn connect_with_uri(uri: &str, config: &MetastoreConfig) -> Result<Self> {
        let url = SchemeType::Etcd.expect_uri(uri).inspect_err(|e| {
            tracing::error!(target: "lock::etcd", uri, error = %e, "invalid lock uri");
        })?;
        config.validate()?;

        let host = url.host_str().unwrap_or("");
        let path = join_root(&format!("/{}", host), url.path());

        let client = connect(&endpoints_from_uri(&url, config), config.request_timeout()).await?;

        Ok(Self::new(
            EtcdLockBackend::new(client, config),
            path,
            config.request_timeout(),
        ))
    }
}
