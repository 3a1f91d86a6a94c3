//! Single-worker mailbox around a [`ControlListManager`].
//!
//! Commands are processed strictly one at a time by a spawned task. The
//! mailbox is bounded; a full mailbox rejects new commands with
//! [`SessionError::Busy`] instead of letting them pile up.

use serde::Serialize;
use shared::{
    domain::{
        ControlId, ControlPatch, ControlTemplate, FormId, MoveDirection, PlacedControl, Section,
        SectionId, SectionPatch,
    },
    protocol::{CommitReport, ConsistencyReport, ImportRecord, ImportReport},
};
use thiserror::Error;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot, watch,
    },
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{Activity, ControlListManager, ManagerError, MoveOutcome};

type Reply<T> = oneshot::Sender<Result<T, ManagerError>>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("form session is busy; retry once the pending operation finishes")]
    Busy,
    #[error("form session worker has stopped")]
    Closed,
    #[error(transparent)]
    Manager(#[from] ManagerError),
}

/// Read-only view handed to presentation code.
///
/// Built between commands, so it never shows an operation in flight; use
/// [`FormSession::activity`] for that.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub form_id: FormId,
    pub controls: Vec<PlacedControl>,
    pub sections: Vec<Section>,
    pub selected: Option<PlacedControl>,
    pub direct_mode: bool,
}

impl SessionSnapshot {
    fn of(manager: &ControlListManager) -> Self {
        Self {
            form_id: manager.form_id().clone(),
            controls: manager.controls().to_vec(),
            sections: manager.sections().to_vec(),
            selected: manager.selected().cloned(),
            direct_mode: manager.is_direct_mode(),
        }
    }
}

enum SessionCommand {
    Load {
        form_id: FormId,
        reply: oneshot::Sender<usize>,
    },
    Add {
        template: ControlTemplate,
        section_id: SectionId,
        reply: Reply<ControlId>,
    },
    Update {
        id: ControlId,
        patch: ControlPatch,
        reply: Reply<()>,
    },
    Remove {
        id: ControlId,
        reply: Reply<()>,
    },
    Move {
        id: ControlId,
        direction: MoveDirection,
        reply: Reply<MoveOutcome>,
    },
    Reorder {
        from: usize,
        to: usize,
        reply: Reply<()>,
    },
    Select {
        id: Option<ControlId>,
        reply: Reply<()>,
    },
    AddSection {
        name: String,
        required: bool,
        reply: Reply<SectionId>,
    },
    UpdateSection {
        id: SectionId,
        patch: SectionPatch,
        reply: Reply<()>,
    },
    RemoveSection {
        id: SectionId,
        reply: Reply<()>,
    },
    BulkImport {
        records: Vec<ImportRecord>,
        reply: oneshot::Sender<ImportReport>,
    },
    CommitToStore {
        reply: oneshot::Sender<CommitReport>,
    },
    CheckConsistency {
        reply: Reply<ConsistencyReport>,
    },
    NuclearReset {
        reply: oneshot::Sender<usize>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
}

impl SessionCommand {
    fn name(&self) -> &'static str {
        match self {
            SessionCommand::Load { .. } => "load",
            SessionCommand::Add { .. } => "add",
            SessionCommand::Update { .. } => "update",
            SessionCommand::Remove { .. } => "remove",
            SessionCommand::Move { .. } => "move",
            SessionCommand::Reorder { .. } => "reorder",
            SessionCommand::Select { .. } => "select",
            SessionCommand::AddSection { .. } => "add_section",
            SessionCommand::UpdateSection { .. } => "update_section",
            SessionCommand::RemoveSection { .. } => "remove_section",
            SessionCommand::BulkImport { .. } => "bulk_import",
            SessionCommand::CommitToStore { .. } => "commit_to_store",
            SessionCommand::CheckConsistency { .. } => "check_consistency",
            SessionCommand::NuclearReset { .. } => "nuclear_reset",
            SessionCommand::Snapshot { .. } => "snapshot",
        }
    }
}

/// Cloneable handle to a running form session.
#[derive(Clone)]
pub struct FormSession {
    tx: mpsc::Sender<SessionCommand>,
    activity: watch::Receiver<Activity>,
}

impl FormSession {
    /// Starts the worker on the current tokio runtime.
    ///
    /// The worker stops once every handle is dropped and hands the manager
    /// back through the returned join handle.
    pub fn spawn(
        manager: ControlListManager,
        capacity: usize,
    ) -> (Self, JoinHandle<ControlListManager>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let activity = manager.subscribe_activity();
        let worker = tokio::spawn(run_worker(manager, rx));
        (Self { tx, activity }, worker)
    }

    /// Current loading/resetting state, readable while a command runs.
    pub fn activity(&self) -> Activity {
        *self.activity.borrow()
    }

    /// Receiver that wakes on every loading/resetting transition.
    pub fn watch_activity(&self) -> watch::Receiver<Activity> {
        self.activity.clone()
    }

    pub async fn load(&self, form_id: FormId) -> Result<usize, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(SessionCommand::Load { form_id, reply })?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn add(
        &self,
        template: ControlTemplate,
        section_id: SectionId,
    ) -> Result<ControlId, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(SessionCommand::Add {
            template,
            section_id,
            reply,
        })?;
        Self::settle(rx).await
    }

    pub async fn update(&self, id: ControlId, patch: ControlPatch) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(SessionCommand::Update { id, patch, reply })?;
        Self::settle(rx).await
    }

    pub async fn remove(&self, id: ControlId) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(SessionCommand::Remove { id, reply })?;
        Self::settle(rx).await
    }

    pub async fn move_control(
        &self,
        id: ControlId,
        direction: MoveDirection,
    ) -> Result<MoveOutcome, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(SessionCommand::Move {
            id,
            direction,
            reply,
        })?;
        Self::settle(rx).await
    }

    pub async fn reorder(&self, from: usize, to: usize) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(SessionCommand::Reorder { from, to, reply })?;
        Self::settle(rx).await
    }

    /// `None` clears the selection.
    pub async fn select(&self, id: Option<ControlId>) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(SessionCommand::Select { id, reply })?;
        Self::settle(rx).await
    }

    pub async fn add_section(
        &self,
        name: impl Into<String>,
        required: bool,
    ) -> Result<SectionId, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(SessionCommand::AddSection {
            name: name.into(),
            required,
            reply,
        })?;
        Self::settle(rx).await
    }

    pub async fn update_section(
        &self,
        id: SectionId,
        patch: SectionPatch,
    ) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(SessionCommand::UpdateSection { id, patch, reply })?;
        Self::settle(rx).await
    }

    pub async fn remove_section(&self, id: SectionId) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(SessionCommand::RemoveSection { id, reply })?;
        Self::settle(rx).await
    }

    pub async fn bulk_import(
        &self,
        records: Vec<ImportRecord>,
    ) -> Result<ImportReport, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(SessionCommand::BulkImport { records, reply })?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn commit_to_store(&self) -> Result<CommitReport, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(SessionCommand::CommitToStore { reply })?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn check_consistency(&self) -> Result<ConsistencyReport, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(SessionCommand::CheckConsistency { reply })?;
        Self::settle(rx).await
    }

    pub async fn nuclear_reset(&self) -> Result<usize, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(SessionCommand::NuclearReset { reply })?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(SessionCommand::Snapshot { reply })?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    fn dispatch(&self, command: SessionCommand) -> Result<(), SessionError> {
        let name = command.name();
        match self.tx.try_send(command) {
            Ok(()) => {
                debug!(command = name, "queued form session command");
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                warn!(command = name, "form session mailbox is full");
                Err(SessionError::Busy)
            }
            Err(TrySendError::Closed(_)) => Err(SessionError::Closed),
        }
    }

    async fn settle<T>(
        rx: oneshot::Receiver<Result<T, ManagerError>>,
    ) -> Result<T, SessionError> {
        rx.await
            .map_err(|_| SessionError::Closed)?
            .map_err(SessionError::from)
    }
}

async fn run_worker(
    mut manager: ControlListManager,
    mut rx: mpsc::Receiver<SessionCommand>,
) -> ControlListManager {
    while let Some(command) = rx.recv().await {
        let name = command.name();
        apply(&mut manager, command).await;
        debug!(command = name, form_id = %manager.form_id(), "form session command finished");
    }
    manager
}

// Reply send errors mean the caller stopped waiting; the work is done either way.
async fn apply(manager: &mut ControlListManager, command: SessionCommand) {
    match command {
        SessionCommand::Load { form_id, reply } => {
            let _ = reply.send(manager.load(form_id).await);
        }
        SessionCommand::Add {
            template,
            section_id,
            reply,
        } => {
            let _ = reply.send(manager.add(&template, &section_id).await);
        }
        SessionCommand::Update { id, patch, reply } => {
            let _ = reply.send(manager.update(&id, patch).await);
        }
        SessionCommand::Remove { id, reply } => {
            let _ = reply.send(manager.remove(&id).await);
        }
        SessionCommand::Move {
            id,
            direction,
            reply,
        } => {
            let _ = reply.send(manager.move_control(&id, direction).await);
        }
        SessionCommand::Reorder { from, to, reply } => {
            let _ = reply.send(manager.reorder(from, to).await);
        }
        SessionCommand::Select { id, reply } => {
            let result = match id {
                Some(id) => manager.select(&id),
                None => {
                    manager.clear_selection();
                    Ok(())
                }
            };
            let _ = reply.send(result);
        }
        SessionCommand::AddSection {
            name,
            required,
            reply,
        } => {
            let _ = reply.send(manager.add_section(name, required).await);
        }
        SessionCommand::UpdateSection { id, patch, reply } => {
            let _ = reply.send(manager.update_section(&id, patch).await);
        }
        SessionCommand::RemoveSection { id, reply } => {
            let _ = reply.send(manager.remove_section(&id).await);
        }
        SessionCommand::BulkImport { records, reply } => {
            let _ = reply.send(manager.bulk_import(&records));
        }
        SessionCommand::CommitToStore { reply } => {
            let _ = reply.send(manager.commit_to_store().await);
        }
        SessionCommand::CheckConsistency { reply } => {
            let _ = reply.send(manager.check_consistency().await);
        }
        SessionCommand::NuclearReset { reply } => {
            let _ = reply.send(manager.nuclear_reset().await);
        }
        SessionCommand::Snapshot { reply } => {
            let _ = reply.send(SessionSnapshot::of(manager));
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
