//! Transaction bridge.
//!
//! Components never write to the store directly while a caller-owned
//! transaction is open. They wrap the write in an [`ActionParticipant`] and
//! hand it to the caller's coordinator through [`Enlist`]. The coordinator
//! decides the outcome and drives each participant exactly once:
//!
//! | Outcome | Participant hook | Action run |
//! |---|---|---|
//! | commit | `prepare` then `commit` | commit action |
//! | rollback | `rollback` | rollback action |
//! | in doubt | `in_doubt` | rollback action |
//!
//! [`Transaction`] is a minimal in-process coordinator. Hosts with their own
//! coordinator implement [`Enlist`] on it instead.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::storage::{KvStore, StoreOp};

/// Deferred store write, run at most once.
pub type Action = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Two-phase participant.
///
/// Resolution hooks consume the participant, so a coordinator cannot run
/// more than one of them.
#[async_trait]
pub trait Participant: Send {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Vote on the outcome. `Ok` votes to commit.
    async fn prepare(&mut self) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;

    /// The coordinator lost track of the outcome.
    async fn in_doubt(self: Box<Self>) -> Result<()>;
}

/// Accepts participants on behalf of an open transaction.
#[async_trait]
pub trait Enlist: Send + Sync {
    async fn enlist(&self, participant: Box<dyn Participant>);
}

/// Participant carrying a commit action and a compensating action.
///
/// Both are optional; a missing action is a no-op. In-doubt runs the
/// compensating action.
pub struct ActionParticipant {
    name: String,
    commit: Option<Action>,
    rollback: Option<Action>,
}

impl ActionParticipant {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            commit: None,
            rollback: None,
        }
    }

    pub fn on_commit<F, Fut>(mut self, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.commit = Some(Box::new(move || action().boxed()));
        self
    }

    pub fn on_rollback<F, Fut>(mut self, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.rollback = Some(Box::new(move || action().boxed()));
        self
    }

    /// Participant whose actions are atomic store batches. An empty batch
    /// means no action for that outcome.
    pub fn batches(
        name: impl Into<String>,
        store: Arc<dyn KvStore>,
        commit: Vec<StoreOp>,
        rollback: Vec<StoreOp>,
    ) -> Self {
        let mut participant = Self::new(name);
        if !commit.is_empty() {
            let store = store.clone();
            participant = participant.on_commit(move || async move {
                store.exec(commit).await?;
                Ok(())
            });
        }
        if !rollback.is_empty() {
            participant = participant.on_rollback(move || async move {
                store.exec(rollback).await?;
                Ok(())
            });
        }
        participant
    }

    async fn run(action: Option<Action>) -> Result<()> {
        match action {
            Some(action) => action().await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for ActionParticipant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionParticipant")
            .field("name", &self.name)
            .field("commit", &self.commit.is_some())
            .field("rollback", &self.rollback.is_some())
            .finish()
    }
}

#[async_trait]
impl Participant for ActionParticipant {
    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        debug!(participant = %self.name, "Commit");
        Self::run(self.commit).await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        debug!(participant = %self.name, "Rollback");
        Self::run(self.rollback).await
    }

    async fn in_doubt(self: Box<Self>) -> Result<()> {
        debug!(participant = %self.name, "In doubt, compensating");
        Self::run(self.rollback).await
    }
}

/// In-process coordinator.
///
/// Dropping a transaction without resolving it discards every participant
/// without running any action. Claimed messages then come back through the
/// lease sweep.
#[derive(Default)]
pub struct Transaction {
    participants: Mutex<Vec<Box<dyn Participant>>>,
}

#[derive(Clone, Copy)]
enum Outcome {
    Commit,
    Rollback,
    InDoubt,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.participants.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.participants.lock().await.is_empty()
    }

    /// Prepare every participant, then commit them all. A failed prepare
    /// rolls everything back and returns the prepare error.
    pub async fn commit(self) -> Result<()> {
        let mut participants = self.participants.into_inner();

        for participant in participants.iter_mut() {
            if let Err(e) = participant.prepare().await {
                error!(participant = %participant.name(), error = %e, "Prepare failed, rolling back");
                // The prepare error is what the caller needs to see
                let _ = resolve(participants, Outcome::Rollback).await;
                return Err(e);
            }
        }

        resolve(participants, Outcome::Commit).await
    }

    pub async fn rollback(self) -> Result<()> {
        resolve(self.participants.into_inner(), Outcome::Rollback).await
    }

    pub async fn resolve_in_doubt(self) -> Result<()> {
        resolve(self.participants.into_inner(), Outcome::InDoubt).await
    }
}

#[async_trait]
impl Enlist for Transaction {
    async fn enlist(&self, participant: Box<dyn Participant>) {
        debug!(participant = %participant.name(), "Enlisted");
        self.participants.lock().await.push(participant);
    }
}

/// Drive every participant even when earlier ones fail; report the failures
/// together.
async fn resolve(participants: Vec<Box<dyn Participant>>, outcome: Outcome) -> Result<()> {
    let mut failures = Vec::new();

    for participant in participants {
        let name = participant.name().to_string();
        let result = match outcome {
            Outcome::Commit => participant.commit().await,
            Outcome::Rollback => participant.rollback().await,
            Outcome::InDoubt => participant.in_doubt().await,
        };
        if let Err(e) = result {
            error!(participant = %name, error = %e, "Participant failed to resolve");
            failures.push(e);
        }
    }

    let failed = failures.len();
    match failures.into_iter().next() {
        None => Ok(()),
        Some(first) => Err(Error::Participant {
            failed,
            first: Box::new(first),
        }),
    }
}
