use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

/// Section every form starts with. It is never deleted.
pub const DEFAULT_SECTION_ID: &str = "default";
pub const DEFAULT_SECTION_NAME: &str = "General";

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(FormId);
id_newtype!(ControlId);
id_newtype!(SectionId);

impl SectionId {
    pub fn default_section() -> Self {
        Self(DEFAULT_SECTION_ID.to_string())
    }

    pub fn is_default(&self) -> bool {
        self.0 == DEFAULT_SECTION_ID
    }
}

impl Default for SectionId {
    fn default() -> Self {
        Self::default_section()
    }
}

/// A single entry of a control's property bag.
///
/// The bag belongs to the renderer; the list core never looks inside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<String>),
}

impl PropertyValue {
    /// Parses a loosely typed literal the way spreadsheet cells and CLI
    /// flags arrive: booleans, numbers, comma-joined option lists, text.
    pub fn parse_literal(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("true") {
            return Self::Bool(true);
        }
        if trimmed.eq_ignore_ascii_case("false") {
            return Self::Bool(false);
        }
        if let Ok(number) = trimmed.parse::<f64>() {
            if number.is_finite() {
                return Self::Number(number);
            }
        }
        if trimmed.contains(',') {
            return Self::List(
                trimmed
                    .split(',')
                    .map(|item| item.trim().to_string())
                    .filter(|item| !item.is_empty())
                    .collect(),
            );
        }
        Self::Text(raw.to_string())
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }
}

pub type Properties = BTreeMap<String, PropertyValue>;

/// A control instance placed on the form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacedControl {
    pub id: ControlId,
    pub control_kind: String,
    pub display_name: String,
    #[serde(default)]
    pub section_id: SectionId,
    pub order_index: u32,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// Palette entry a control is instantiated from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlTemplate {
    pub control_kind: String,
    pub display_name: String,
    #[serde(default)]
    pub default_properties: Properties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

impl ControlTemplate {
    pub fn new(control_kind: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            control_kind: control_kind.into(),
            display_name: display_name.into(),
            default_properties: Properties::new(),
            width: None,
            height: None,
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: PropertyValue) -> Self {
        self.default_properties.insert(key.into(), value);
        self
    }

    pub fn instantiate(
        &self,
        id: ControlId,
        section_id: SectionId,
        order_index: u32,
    ) -> PlacedControl {
        PlacedControl {
            id,
            control_kind: self.control_kind.clone(),
            display_name: self.display_name.clone(),
            section_id,
            order_index,
            properties: self.default_properties.clone(),
            width: self.width,
            height: self.height,
        }
    }
}

/// Partial update for a placed control.
///
/// `properties` is merged key by key; sibling keys survive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_id: Option<SectionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Properties>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

impl ControlPatch {
    pub fn order_index(order_index: u32) -> Self {
        Self {
            order_index: Some(order_index),
            ..Self::default()
        }
    }

    pub fn property(key: impl Into<String>, value: PropertyValue) -> Self {
        let mut properties = Properties::new();
        properties.insert(key.into(), value);
        Self {
            properties: Some(properties),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn apply_to(&self, control: &mut PlacedControl) {
        if let Some(display_name) = &self.display_name {
            control.display_name = display_name.clone();
        }
        if let Some(section_id) = &self.section_id {
            control.section_id = section_id.clone();
        }
        if let Some(order_index) = self.order_index {
            control.order_index = order_index;
        }
        if let Some(properties) = &self.properties {
            for (key, value) in properties {
                control.properties.insert(key.clone(), value.clone());
            }
        }
        if let Some(width) = self.width {
            control.width = Some(width);
        }
        if let Some(height) = self.height {
            control.height = Some(height);
        }
    }
}

/// New position of one control, as carried by a batched reorder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderChange {
    pub id: ControlId,
    pub section_id: SectionId,
    pub order_index: u32,
}

impl From<&PlacedControl> for OrderChange {
    fn from(control: &PlacedControl) -> Self {
        Self {
            id: control.id.clone(),
            section_id: control.section_id.clone(),
            order_index: control.order_index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub id: SectionId,
    pub name: String,
    pub order: u32,
    #[serde(default)]
    pub required: bool,
}

impl Section {
    pub fn default_section() -> Self {
        Self {
            id: SectionId::default_section(),
            name: DEFAULT_SECTION_NAME.to_string(),
            order: 0,
            required: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

impl SectionPatch {
    pub fn apply_to(&self, section: &mut Section) {
        if let Some(name) = &self.name {
            section.name = name.clone();
        }
        if let Some(order) = self.order {
            section.order = order;
        }
        if let Some(required) = self.required {
            section.required = required;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceMode {
    /// Mutations stay in memory until an explicit commit.
    Direct,
    /// Every mutation is acknowledged by the store before it shows in memory.
    Persisted,
}
