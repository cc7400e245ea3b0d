//! Distributed mutual exclusion over one coordination path
//!
//! A [`DistributedLock`] is bound to a single path for its lifetime and moves
//! through three states:
//!
//! ```text
//!   Unbound ──lock()──▶ Bound(session) ──session lost──▶ Faulted
//!      ▲                                                    │
//!      └──────────────────────── rebind() ◀─────────────────┘
//! ```
//!
//! The session is created on the first `lock()` and kept across `unlock()`,
//! so one handle serves repeated lock/unlock cycles. A lost session is not
//! repaired behind the caller's back: `lock()` fails until `rebind()`.
//!
//! Every successful `lock()` returns a fencing token (the backend revision at
//! acquisition) which increases strictly across acquisitions of the same path.

pub mod etcd;

pub use etcd::{EtcdLockBackend, EtcdSession};

use crate::common::{Error, Result};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Liveness handle a lock is attached to
pub trait LockSession: Send + Sync {
    /// Has the backend stopped honouring this session?
    fn is_valid(&self) -> bool;
}

/// Ownership of an acquired lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGrant {
    /// Backend key representing ownership, needed to release it
    pub key: Vec<u8>,
    /// Fencing token
    pub revision: i64,
}

/// Coordination primitives a [`DistributedLock`] is built on
#[async_trait]
pub trait LockBackend: Send + Sync {
    type Session: LockSession;

    async fn open_session(&self) -> Result<Self::Session>;

    /// Block until `name` is owned through `session`
    async fn acquire(&self, session: &Self::Session, name: &str) -> Result<LockGrant>;

    async fn release(&self, grant: &LockGrant) -> Result<()>;

    /// Best effort; errors are logged by the backend
    async fn close_session(&self, session: Self::Session);
}

/// Observable lock handle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unbound,
    Bound,
    Faulted,
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockState::Unbound => write!(f, "unbound"),
            LockState::Bound => write!(f, "bound"),
            LockState::Faulted => write!(f, "faulted"),
        }
    }
}

enum Binding<S> {
    Unbound,
    Bound(S),
    Faulted,
}

/// Lock handle for one path.
///
/// Methods take `&mut self`: a handle models a single logical owner. Mutual
/// exclusion between processes comes from the backend.
pub struct DistributedLock<B: LockBackend> {
    backend: B,
    path: String,
    timeout: Duration,
    binding: Binding<B::Session>,
    held: Option<LockGrant>,
}

impl<B: LockBackend> DistributedLock<B> {
    pub fn new(backend: B, path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            backend,
            path: path.into(),
            timeout,
            binding: Binding::Unbound,
            held: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn state(&self) -> LockState {
        match self.binding {
            Binding::Unbound => LockState::Unbound,
            Binding::Bound(_) => LockState::Bound,
            Binding::Faulted => LockState::Faulted,
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    async fn until<T>(
        &self,
        op: &str,
        deadline: Instant,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout_at(deadline, fut).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout(format!("{} {}", op, self.path))),
        }
    }

    /// Acquire the lock, waiting at most the configured deadline.
    ///
    /// Returns the fencing token. Locking an already held handle returns the
    /// token of the current grant. Creating the session counts against the
    /// same deadline.
    pub async fn lock(&mut self) -> Result<i64> {
        if let Some(grant) = &self.held {
            return Ok(grant.revision);
        }
        let deadline = Instant::now() + self.timeout;

        if matches!(self.binding, Binding::Unbound) {
            match self.until("open session", deadline, self.backend.open_session()).await {
                Ok(session) => self.binding = Binding::Bound(session),
                Err(e) => {
                    tracing::error!(target: "lock", path = %self.path, error = %e, "failed to create session");
                    return Err(e);
                }
            }
        }

        let valid = match &self.binding {
            Binding::Bound(session) => session.is_valid(),
            _ => false,
        };
        if !valid {
            if matches!(self.binding, Binding::Bound(_)) {
                self.fault().await;
            }
            let err = Error::SessionInvalid(self.path.clone());
            tracing::error!(target: "lock", path = %self.path, error = %err, "failed to lock, rebind required");
            return Err(err);
        }

        let acquired = match &self.binding {
            Binding::Bound(session) => {
                self.until("lock", deadline, self.backend.acquire(session, &self.path))
                    .await
            }
            _ => Err(Error::SessionInvalid(self.path.clone())),
        };

        match acquired {
            Ok(grant) => {
                tracing::info!(target: "lock", path = %self.path, revision = grant.revision, "locked");
                let revision = grant.revision;
                self.held = Some(grant);
                Ok(revision)
            }
            Err(e) => {
                tracing::error!(target: "lock", path = %self.path, error = %e, "failed to lock");
                if matches!(&self.binding, Binding::Bound(session) if !session.is_valid()) {
                    self.fault().await;
                }
                Err(e)
            }
        }
    }

    /// Release a lock taken by this handle. The session is kept.
    pub async fn unlock(&mut self) -> Result<()> {
        let Some(grant) = self.held.take() else {
            let err = Error::LockNotHeld(self.path.clone());
            tracing::error!(target: "lock", path = %self.path, error = %err, "lock not held");
            return Err(err);
        };

        let deadline = Instant::now() + self.timeout;
        match self.until("unlock", deadline, self.backend.release(&grant)).await {
            Ok(()) => {
                tracing::info!(target: "lock", path = %self.path, "unlocked");
                Ok(())
            }
            Err(e) => {
                tracing::error!(target: "lock", path = %self.path, error = %e, "failed to unlock");
                // Still ours until the release goes through.
                self.held = Some(grant);
                Err(e)
            }
        }
    }

    /// Drop the current session (if any) and return to `Unbound`.
    ///
    /// Any held lock is lost with the session.
    pub async fn rebind(&mut self) {
        self.held = None;
        if let Binding::Bound(session) = std::mem::replace(&mut self.binding, Binding::Unbound) {
            self.backend.close_session(session).await;
        }
        tracing::info!(target: "lock", path = %self.path, "rebound");
    }

    /// Release the session. A held lock goes with it.
    pub async fn close(mut self) {
        self.held = None;
        if let Binding::Bound(session) = std::mem::replace(&mut self.binding, Binding::Faulted) {
            self.backend.close_session(session).await;
        }
    }

    async fn fault(&mut self) {
        self.held = None;
        if let Binding::Bound(session) = std::mem::replace(&mut self.binding, Binding::Faulted) {
            self.backend.close_session(session).await;
        }
        tracing::warn!(target: "lock", path = %self.path, "session lost, lock handle faulted");
    }
}
