use std::collections::HashSet;

use chrono::Utc;
use shared::domain::{ControlId, SectionId};
use uuid::Uuid;

const RANDOM_LEN: usize = 10;

/// Issues control ids of the form `ctl_<millis>_<random>_<batch>_<seq>`.
///
/// The batch counter increases on every [`IdGenerator::batch`] call and the
/// sequence counts ids handed out inside one batch, so a bulk import that
/// lands in a single millisecond still produces distinct ids.
#[derive(Debug, Default)]
pub struct IdGenerator {
    batches: u64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch(&mut self) -> IdBatch {
        self.batches += 1;
        IdBatch {
            batch: self.batches,
            millis: Utc::now().timestamp_millis(),
            next: 0,
        }
    }

    /// Single id that does not collide with `taken`.
    pub fn fresh(&mut self, taken: &HashSet<&ControlId>) -> ControlId {
        let mut batch = self.batch();
        loop {
            let id = batch.next_id();
            if !taken.contains(&id) {
                return id;
            }
        }
    }

    pub fn section_id(&mut self) -> SectionId {
        self.batches += 1;
        SectionId(format!(
            "section_{:x}_{}_{}",
            Utc::now().timestamp_millis(),
            random_component(),
            self.batches
        ))
    }
}

pub struct IdBatch {
    batch: u64,
    millis: i64,
    next: u64,
}

impl IdBatch {
    pub fn next_id(&mut self) -> ControlId {
        let sequence = self.next;
        self.next += 1;
        ControlId(format!(
            "ctl_{:x}_{}_{}_{}",
            self.millis,
            random_component(),
            self.batch,
            sequence
        ))
    }
}

fn random_component() -> String {
    let mut random = Uuid::new_v4().simple().to_string();
    random.truncate(RANDOM_LEN);
    random
}
