use serde::{Deserialize, Serialize};

use crate::{
    domain::{Properties, SectionId},
    error::{ConsistencyDrift, ValidationError},
};

/// One row handed over by the spreadsheet/JSON import collaborator.
///
/// Every field is optional on the wire; validation decides what is usable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub control_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_id: Option<SectionId>,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

impl ImportRecord {
    pub fn new(id: &str, control_kind: &str, name: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            control_kind: Some(control_kind.to_string()),
            name: Some(name.to_string()),
            ..Self::default()
        }
    }

    pub fn in_section(mut self, section_id: impl Into<SectionId>) -> Self {
        self.section_id = Some(section_id.into());
        self
    }

    fn label(&self, position: usize) -> String {
        match (non_blank(&self.name), non_blank(&self.id)) {
            (Some(name), _) => format!("'{name}'"),
            (None, Some(id)) => format!("with id '{id}'"),
            (None, None) => format!("#{}", position + 1),
        }
    }

    /// Checks the fields the import needs: non-empty type and name, and an id.
    ///
    /// The id is required on input even though the importer replaces it.
    pub fn validate(&self, position: usize) -> Result<ValidRecord<'_>, ValidationError> {
        let (Some(control_kind), Some(name)) =
            (non_blank(&self.control_kind), non_blank(&self.name))
        else {
            return Err(ValidationError::MissingTypeOrName {
                label: self.label(position),
            });
        };
        if non_blank(&self.id).is_none() {
            return Err(ValidationError::MissingId {
                label: self.label(position),
            });
        }
        Ok(ValidRecord {
            control_kind,
            name,
            section_id: self
                .section_id
                .clone()
                .filter(|section| !section.as_str().trim().is_empty())
                .unwrap_or_default(),
            record: self,
        })
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Import record that passed validation.
#[derive(Debug, Clone)]
pub struct ValidRecord<'a> {
    pub control_kind: &'a str,
    pub name: &'a str,
    pub section_id: SectionId,
    pub record: &'a ImportRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    pub success: usize,
    pub total: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReport {
    pub inserted: usize,
    pub attempted: usize,
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drift: Option<ConsistencyDrift>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub store_count: usize,
    pub memory_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drift: Option<ConsistencyDrift>,
}
