use std::collections::HashMap;

use shared::{
    domain::{PersistenceMode, PlacedControl, SectionId},
    error::ConsistencyDrift,
    protocol::{CommitReport, ConsistencyReport, ImportRecord, ImportReport},
};
use tracing::{info, warn};

use crate::{ControlListManager, ManagerError};

impl ControlListManager {
    /// Replaces memory with an imported batch and switches to direct mode.
    ///
    /// Records without a type, a name or an id are left out and reported.
    /// Every accepted record gets a new id; positions are assigned per
    /// section in listed order. The store is not touched until
    /// [`ControlListManager::commit_to_store`].
    pub fn bulk_import(&mut self, records: &[ImportRecord]) -> ImportReport {
        self.mode = PersistenceMode::Direct;

        let mut errors = Vec::new();
        let mut batch = self.ids.batch();
        let mut next_index: HashMap<SectionId, u32> = HashMap::new();
        let mut imported = Vec::with_capacity(records.len());

        for (position, record) in records.iter().enumerate() {
            let valid = match record.validate(position) {
                Ok(valid) => valid,
                Err(err) => {
                    errors.push(err.to_string());
                    continue;
                }
            };
            let slot = next_index.entry(valid.section_id.clone()).or_insert(0);
            imported.push(PlacedControl {
                id: batch.next_id(),
                control_kind: valid.control_kind.to_string(),
                display_name: valid.name.to_string(),
                section_id: valid.section_id,
                order_index: *slot,
                properties: record.properties.clone(),
                width: record.width,
                height: record.height,
            });
            *slot += 1;
        }

        self.controls = imported;
        self.adopt_missing_sections();
        self.selected = None;
        self.sort();

        let report = ImportReport {
            success: self.controls.len(),
            total: records.len(),
            errors,
        };
        info!(
            form_id = %self.form_id,
            success = report.success,
            total = report.total,
            rejected = report.errors.len(),
            "bulk import staged in direct mode"
        );
        report
    }

    /// Writes the staged batch to the store one control at a time.
    ///
    /// Individual failures are collected and do not stop the batch. If at
    /// least one control was stored the manager returns to persisted mode,
    /// runs a reconciliation check and reloads from the store. Outside direct
    /// mode there is nothing staged and an empty report comes back.
    pub async fn commit_to_store(&mut self) -> CommitReport {
        if !self.is_direct_mode() {
            warn!(form_id = %self.form_id, "commit requested with nothing staged");
            return CommitReport::default();
        }
        let mut report = CommitReport {
            attempted: self.controls.len(),
            ..CommitReport::default()
        };

        let stored_sections = match self.gateway.list_sections(&self.form_id).await {
            Ok(sections) => sections,
            Err(err) => {
                warn!(form_id = %self.form_id, error = %err, "could not list stored sections before commit");
                Vec::new()
            }
        };
        for section in self.sections.iter().filter(|section| {
            !section.id.is_default() && !stored_sections.iter().any(|s| s.id == section.id)
        }) {
            if let Err(err) = self.gateway.insert_section(section, &self.form_id).await {
                report
                    .errors
                    .push(format!("section '{}': {err}", section.name));
            }
        }

        for control in &self.controls {
            match self.gateway.insert(control, &self.form_id).await {
                Ok(()) => report.inserted += 1,
                Err(err) => {
                    warn!(form_id = %self.form_id, control_id = %control.id, error = %err, "commit insert failed");
                    report
                        .errors
                        .push(format!("control '{}' ({}): {err}", control.display_name, control.id));
                }
            }
        }

        info!(
            form_id = %self.form_id,
            inserted = report.inserted,
            attempted = report.attempted,
            "committed staged controls"
        );
        if report.inserted == 0 {
            return report;
        }

        self.mode = PersistenceMode::Persisted;
        match self.gateway.list(&self.form_id).await {
            Ok(stored) => {
                report.drift =
                    ConsistencyDrift::detect(stored.len(), report.attempted, self.drift_tolerance);
            }
            Err(err) => {
                warn!(form_id = %self.form_id, error = %err, "reconciliation listing failed");
            }
        }
        if let Some(drift) = report.drift {
            warn!(form_id = %self.form_id, %drift, "store drifted from committed batch");
            self.nuclear_reset().await;
        } else {
            self.reload().await;
        }
        report
    }

    /// Compares the store's control count with memory and resets on drift.
    pub async fn check_consistency(&mut self) -> Result<ConsistencyReport, ManagerError> {
        if self.is_direct_mode() {
            return Err(ManagerError::DirectMode);
        }
        let stored = self.gateway.list(&self.form_id).await.map_err(|err| {
            warn!(form_id = %self.form_id, error = %err, "consistency check could not list store");
            ManagerError::from(err)
        })?;
        let report = ConsistencyReport {
            store_count: stored.len(),
            memory_count: self.controls.len(),
            drift: ConsistencyDrift::detect(
                stored.len(),
                self.controls.len(),
                self.drift_tolerance,
            ),
        };
        if let Some(drift) = report.drift {
            warn!(form_id = %self.form_id, %drift, "consistency drift detected");
            self.nuclear_reset().await;
        }
        Ok(report)
    }
}
