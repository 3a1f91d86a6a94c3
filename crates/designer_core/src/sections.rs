use shared::domain::{OrderChange, Section, SectionId, SectionPatch};
use tracing::{debug, warn};

use crate::{ordering, ControlListManager, ManagerError};

impl ControlListManager {
    pub async fn add_section(
        &mut self,
        name: impl Into<String>,
        required: bool,
    ) -> Result<SectionId, ManagerError> {
        let section = Section {
            id: self.ids.section_id(),
            name: name.into(),
            order: self
                .sections
                .iter()
                .map(|section| section.order + 1)
                .max()
                .unwrap_or(0),
            required,
        };

        if self.is_persisted() {
            if let Err(err) = self.gateway.insert_section(&section, &self.form_id).await {
                warn!(form_id = %self.form_id, section_id = %section.id, error = %err, "section insert rejected");
                return Err(err.into());
            }
        }

        debug!(form_id = %self.form_id, section_id = %section.id, "added section");
        let id = section.id.clone();
        self.sections.push(section);
        self.sort_sections();
        Ok(id)
    }

    pub async fn update_section(
        &mut self,
        id: &SectionId,
        patch: SectionPatch,
    ) -> Result<(), ManagerError> {
        let position = self.require_section_position(id)?;

        if self.is_persisted() {
            if let Err(err) = self.gateway.update_section(&self.form_id, id, &patch).await {
                warn!(form_id = %self.form_id, section_id = %id, error = %err, "section update rejected");
                return Err(err.into());
            }
        }

        patch.apply_to(&mut self.sections[position]);
        self.sort_sections();
        Ok(())
    }

    /// Deletes a section; its controls move to the end of the default section.
    pub async fn remove_section(&mut self, id: &SectionId) -> Result<(), ManagerError> {
        if id.is_default() {
            return Err(ManagerError::PermanentSection(id.clone()));
        }
        let position = self.require_section_position(id)?;

        let default_section = SectionId::default_section();
        let mut next = self.controls.clone();
        let mut next_index = ordering::section_len(&next, &default_section);
        let mut orphans: Vec<usize> = next
            .iter()
            .enumerate()
            .filter(|(_, control)| &control.section_id == id)
            .map(|(index, _)| index)
            .collect();
        orphans.sort_by_key(|&index| next[index].order_index);

        let mut changes = Vec::with_capacity(orphans.len());
        for index in orphans {
            let control = &mut next[index];
            control.section_id = default_section.clone();
            control.order_index = next_index;
            next_index += 1;
            changes.push(OrderChange::from(&*control));
        }

        if self.is_persisted() {
            if !changes.is_empty() {
                if let Err(err) = self.gateway.bulk_reorder(&changes).await {
                    warn!(form_id = %self.form_id, section_id = %id, error = %err, "moving section controls rejected");
                    return Err(err.into());
                }
            }
            if let Err(err) = self.gateway.delete_section(&self.form_id, id).await {
                if changes.is_empty() {
                    warn!(form_id = %self.form_id, section_id = %id, error = %err, "section delete rejected");
                    return Err(err.into());
                }
                return Err(self.resync_after_partial_failure("remove_section", err).await);
            }
        }

        debug!(form_id = %self.form_id, section_id = %id, moved = changes.len(), "removed section");
        self.sections.remove(position);
        self.controls = next;
        self.sort();
        Ok(())
    }

    fn require_section_position(&self, id: &SectionId) -> Result<usize, ManagerError> {
        self.sections
            .iter()
            .position(|section| &section.id == id)
            .ok_or_else(|| {
                warn!(form_id = %self.form_id, section_id = %id, "unknown section");
                ManagerError::UnknownSection(id.clone())
            })
    }

    fn sort_sections(&mut self) {
        self.sections
            .sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
        self.sort();
    }
}
