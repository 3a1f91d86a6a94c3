use std::{collections::HashSet, sync::Arc};

use shared::{
    domain::{
        ControlId, ControlPatch, ControlTemplate, FormId, MoveDirection, OrderChange,
        PersistenceMode, PlacedControl, Section, SectionId,
    },
    error::StoreError,
};
use serde::Serialize;
use storage::PersistenceGateway;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub mod export;
mod ids;
mod import;
pub mod ordering;
mod sections;
pub mod session;

pub use ids::{IdBatch, IdGenerator};
pub use session::{FormSession, SessionError, SessionSnapshot};

/// Store count may exceed memory by this much before a reset is forced.
pub const DEFAULT_DRIFT_TOLERANCE: usize = 2;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("store rejected the change: {0}")]
    Store(#[from] StoreError),
    #[error("control '{0}' is not on this form")]
    UnknownControl(ControlId),
    #[error("section '{0}' is not on this form")]
    UnknownSection(SectionId),
    #[error("section '{0}' is permanent and cannot be removed")]
    PermanentSection(SectionId),
    #[error("position {index} is outside a list of {len} controls")]
    InvalidIndex { index: usize, len: usize },
    #[error("operation needs store-backed state but the form is in direct mode")]
    DirectMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    Moved,
    /// Already first (up) or last (down) in its section.
    AtBoundary,
}

/// Long-running states a caller may want to show while an operation is in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Activity {
    pub loading: bool,
    pub resetting: bool,
}

/// Owns the ordered controls of one form and decides where each mutation goes.
///
/// In [`PersistenceMode::Persisted`] every mutation is sent to the gateway
/// first and shows up in memory only after the gateway accepted it; a
/// rejected call leaves memory untouched. [`PersistenceMode::Direct`] is the
/// bulk-import workflow: mutations apply in memory only until
/// [`ControlListManager::commit_to_store`] is called.
pub struct ControlListManager {
    gateway: Arc<dyn PersistenceGateway>,
    form_id: FormId,
    controls: Vec<PlacedControl>,
    sections: Vec<Section>,
    selected: Option<ControlId>,
    mode: PersistenceMode,
    activity: watch::Sender<Activity>,
    ids: IdGenerator,
    drift_tolerance: usize,
}

impl ControlListManager {
    pub fn new(gateway: Arc<dyn PersistenceGateway>, form_id: FormId) -> Self {
        Self {
            gateway,
            form_id,
            controls: Vec::new(),
            sections: vec![Section::default_section()],
            selected: None,
            mode: PersistenceMode::Persisted,
            activity: watch::channel(Activity::default()).0,
            ids: IdGenerator::new(),
            drift_tolerance: DEFAULT_DRIFT_TOLERANCE,
        }
    }

    pub fn with_drift_tolerance(mut self, drift_tolerance: usize) -> Self {
        self.drift_tolerance = drift_tolerance;
        self
    }

    pub fn form_id(&self) -> &FormId {
        &self.form_id
    }

    /// Controls sorted by section display order, then position.
    pub fn controls(&self) -> &[PlacedControl] {
        &self.controls
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn selected(&self) -> Option<&PlacedControl> {
        let selected = self.selected.as_ref()?;
        self.controls.iter().find(|control| &control.id == selected)
    }

    pub fn mode(&self) -> PersistenceMode {
        self.mode
    }

    pub fn is_direct_mode(&self) -> bool {
        self.mode == PersistenceMode::Direct
    }

    pub fn is_loading(&self) -> bool {
        self.activity.borrow().loading
    }

    pub fn is_resetting(&self) -> bool {
        self.activity.borrow().resetting
    }

    /// Follows [`Activity`] from outside the task that drives the manager.
    pub fn subscribe_activity(&self) -> watch::Receiver<Activity> {
        self.activity.subscribe()
    }

    pub fn drift_tolerance(&self) -> usize {
        self.drift_tolerance
    }

    /// Replaces memory with the store's view of `form_id`.
    ///
    /// Never fails: a gateway error leaves an empty list behind and is
    /// logged. Skipped while direct mode is active. Returns the number of
    /// controls now in memory.
    pub async fn load(&mut self, form_id: FormId) -> usize {
        if self.is_direct_mode() {
            debug!(form_id = %form_id, "load suspended while direct mode is active");
            return self.controls.len();
        }
        if form_id != self.form_id {
            self.selected = None;
        }
        self.form_id = form_id;
        self.activity.send_modify(|activity| activity.loading = true);

        let fetched = match self.gateway.list(&self.form_id).await {
            Ok(controls) => match self.gateway.list_sections(&self.form_id).await {
                Ok(sections) => Ok((controls, sections)),
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        };

        match fetched {
            Ok((controls, sections)) => {
                self.sections = with_default_section(sections);
                self.controls = controls;
                self.adopt_missing_sections();
                self.sort();
                info!(
                    form_id = %self.form_id,
                    controls = self.controls.len(),
                    sections = self.sections.len(),
                    "loaded form"
                );
            }
            Err(err) => {
                warn!(form_id = %self.form_id, error = %err, "failed to load form; showing empty list");
                self.controls.clear();
                self.sections = vec![Section::default_section()];
                self.selected = None;
            }
        }
        if self
            .selected
            .as_ref()
            .is_some_and(|id| self.position(id).is_none())
        {
            self.selected = None;
        }
        self.activity.send_modify(|activity| activity.loading = false);
        self.controls.len()
    }

    /// Reloads the active form.
    pub async fn reload(&mut self) -> usize {
        let form_id = self.form_id.clone();
        self.load(form_id).await
    }

    /// Discards memory and reloads from the store, leaving direct mode.
    pub async fn nuclear_reset(&mut self) -> usize {
        warn!(form_id = %self.form_id, "resetting in-memory form state from store");
        self.activity.send_modify(|activity| activity.resetting = true);
        self.controls.clear();
        self.sections = vec![Section::default_section()];
        self.selected = None;
        self.mode = PersistenceMode::Persisted;
        let loaded = self.reload().await;
        self.activity.send_modify(|activity| activity.resetting = false);
        loaded
    }

    /// Appends a control built from `template` to the end of `section_id`
    /// and selects it.
    pub async fn add(
        &mut self,
        template: &ControlTemplate,
        section_id: &SectionId,
    ) -> Result<ControlId, ManagerError> {
        self.require_section(section_id)?;
        let order_index = ordering::section_len(&self.controls, section_id);
        let id = {
            let taken: HashSet<&ControlId> = self.controls.iter().map(|c| &c.id).collect();
            self.ids.fresh(&taken)
        };
        let control = template.instantiate(id.clone(), section_id.clone(), order_index);

        if self.is_persisted() {
            if let Err(err) = self.gateway.insert(&control, &self.form_id).await {
                warn!(form_id = %self.form_id, control_id = %id, error = %err, "insert rejected; list unchanged");
                return Err(err.into());
            }
        }

        debug!(form_id = %self.form_id, control_id = %id, section_id = %section_id, order_index, "added control");
        self.controls.push(control);
        self.sort();
        self.selected = Some(id.clone());
        Ok(id)
    }

    /// Merges `patch` into a control.
    ///
    /// Changing `section_id` appends the control to the end of the target
    /// section and closes the gap it leaves behind. Caller-supplied
    /// `order_index` values are ignored; positions are owned by the list.
    pub async fn update(&mut self, id: &ControlId, patch: ControlPatch) -> Result<(), ManagerError> {
        let position = self.require_control(id)?;
        let mut patch = patch;
        patch.order_index = None;

        let current = &self.controls[position];
        let relocation = match &patch.section_id {
            Some(target) if target != &current.section_id => {
                self.require_section(target)?;
                Some((current.section_id.clone(), current.order_index, target.clone()))
            }
            _ => None,
        };
        if relocation.is_none() {
            patch.section_id = None;
        }

        let mut next = self.controls.clone();
        let mut compaction = Vec::new();
        if let Some((old_section, old_index, target)) = &relocation {
            patch.order_index = Some(ordering::section_len(&next, target));
            patch.apply_to(&mut next[position]);
            compaction = ordering::compact_after_removal(&mut next, old_section, *old_index);
        } else {
            patch.apply_to(&mut next[position]);
        }

        if self.is_persisted() {
            if let Err(err) = self.gateway.update(id, &patch).await {
                warn!(form_id = %self.form_id, control_id = %id, error = %err, "update rejected; list unchanged");
                return Err(err.into());
            }
            if !compaction.is_empty() {
                if let Err(err) = self.gateway.bulk_reorder(&compaction).await {
                    return Err(self.resync_after_partial_failure("update", err).await);
                }
            }
        }

        self.controls = next;
        self.sort();
        Ok(())
    }

    /// Deletes a control and closes the gap in its section.
    pub async fn remove(&mut self, id: &ControlId) -> Result<(), ManagerError> {
        let position = self.require_control(id)?;
        let mut next = self.controls.clone();
        let removed = next.remove(position);
        let compaction =
            ordering::compact_after_removal(&mut next, &removed.section_id, removed.order_index);

        if self.is_persisted() {
            if let Err(err) = self.gateway.delete(id).await {
                warn!(form_id = %self.form_id, control_id = %id, error = %err, "delete rejected; list unchanged");
                return Err(err.into());
            }
            if !compaction.is_empty() {
                if let Err(err) = self.gateway.bulk_reorder(&compaction).await {
                    return Err(self.resync_after_partial_failure("remove", err).await);
                }
            }
        }

        debug!(form_id = %self.form_id, control_id = %id, shifted = compaction.len(), "removed control");
        self.controls = next;
        if self.selected.as_ref() == Some(id) {
            self.selected = None;
        }
        Ok(())
    }

    /// Swaps a control with its neighbour inside the same section.
    ///
    /// At the section boundary this is a no-op, not an error. In persisted
    /// mode both halves of the swap must be stored before memory changes.
    pub async fn move_control(
        &mut self,
        id: &ControlId,
        direction: MoveDirection,
    ) -> Result<MoveOutcome, ManagerError> {
        let position = self.require_control(id)?;
        let Some((position, neighbour)) =
            ordering::adjacent_sibling(&self.controls, position, direction)
        else {
            return Ok(MoveOutcome::AtBoundary);
        };
        let own_index = self.controls[position].order_index;
        let neighbour_index = self.controls[neighbour].order_index;
        let neighbour_id = self.controls[neighbour].id.clone();

        if self.is_persisted() {
            if let Err(err) = self
                .gateway
                .update(id, &ControlPatch::order_index(neighbour_index))
                .await
            {
                warn!(form_id = %self.form_id, control_id = %id, error = %err, "move rejected; list unchanged");
                return Err(err.into());
            }
            if let Err(err) = self
                .gateway
                .update(&neighbour_id, &ControlPatch::order_index(own_index))
                .await
            {
                warn!(
                    form_id = %self.form_id,
                    control_id = %neighbour_id,
                    error = %err,
                    "second half of move rejected; reverting first half"
                );
                if let Err(revert_err) = self
                    .gateway
                    .update(id, &ControlPatch::order_index(own_index))
                    .await
                {
                    warn!(form_id = %self.form_id, control_id = %id, error = %revert_err, "failed to revert move");
                }
                return Err(err.into());
            }
        }

        self.controls[position].order_index = neighbour_index;
        self.controls[neighbour].order_index = own_index;
        self.sort();
        Ok(MoveOutcome::Moved)
    }

    /// Drag-and-drop move over the whole visible list.
    ///
    /// `from` and `to` index [`ControlListManager::controls`]. A drop onto a
    /// control of another section moves the dragged control into that
    /// section; every section is renumbered afterwards.
    pub async fn reorder(&mut self, from: usize, to: usize) -> Result<(), ManagerError> {
        let len = self.controls.len();
        for index in [from, to] {
            if index >= len {
                return Err(ManagerError::InvalidIndex { index, len });
            }
        }
        if from == to {
            return Ok(());
        }

        let mut next = self.controls.clone();
        ordering::move_in_list(&mut next, from, to);

        if self.is_persisted() {
            let changes: Vec<OrderChange> = next.iter().map(OrderChange::from).collect();
            if let Err(err) = self.gateway.bulk_reorder(&changes).await {
                warn!(form_id = %self.form_id, from, to, error = %err, "reorder rejected; list unchanged");
                return Err(err.into());
            }
        }

        self.controls = next;
        self.sort();
        Ok(())
    }

    pub fn select(&mut self, id: &ControlId) -> Result<(), ManagerError> {
        self.require_control(id)?;
        self.selected = Some(id.clone());
        Ok(())
    }

    pub fn clear_selection(&mut self) {
        self.selected = None;
    }

    fn is_persisted(&self) -> bool {
        self.mode == PersistenceMode::Persisted
    }

    fn position(&self, id: &ControlId) -> Option<usize> {
        self.controls.iter().position(|control| &control.id == id)
    }

    fn require_control(&self, id: &ControlId) -> Result<usize, ManagerError> {
        self.position(id).ok_or_else(|| {
            warn!(form_id = %self.form_id, control_id = %id, "unknown control");
            ManagerError::UnknownControl(id.clone())
        })
    }

    fn require_section(&self, id: &SectionId) -> Result<(), ManagerError> {
        if self.sections.iter().any(|section| &section.id == id) {
            Ok(())
        } else {
            warn!(form_id = %self.form_id, section_id = %id, "unknown section");
            Err(ManagerError::UnknownSection(id.clone()))
        }
    }

    /// Creates a section for every control `section_id` memory does not know,
    /// keeping known sections and appending the rest in first-seen order.
    fn adopt_missing_sections(&mut self) {
        let mut next_order = self
            .sections
            .iter()
            .map(|section| section.order + 1)
            .max()
            .unwrap_or(1);
        for control in &self.controls {
            if self
                .sections
                .iter()
                .any(|section| section.id == control.section_id)
            {
                continue;
            }
            debug!(form_id = %self.form_id, section_id = %control.section_id, "adopting section without a stored row");
            self.sections.push(Section {
                id: control.section_id.clone(),
                name: control.section_id.to_string(),
                order: next_order,
                required: false,
            });
            next_order += 1;
        }
    }

    fn sort(&mut self) {
        ordering::sort_controls(&mut self.controls, &self.sections);
    }

    /// The first store call went through but a follow-up failed, so memory
    /// and store disagree. Reloading is the only way back to one truth.
    async fn resync_after_partial_failure(
        &mut self,
        operation: &'static str,
        err: StoreError,
    ) -> ManagerError {
        warn!(
            form_id = %self.form_id,
            operation,
            error = %err,
            "store applied only part of the change; reloading"
        );
        self.reload().await;
        err.into()
    }
}

fn with_default_section(mut sections: Vec<Section>) -> Vec<Section> {
    if !sections.iter().any(|section| section.id.is_default()) {
        sections.insert(0, Section::default_section());
    }
    sections
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
