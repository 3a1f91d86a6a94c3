//! JSON export of the designed form.
//!
//! Read-only: consumes the ordered controls and sections, never feeds back.

use serde_json::{json, Map, Value};
use shared::domain::{FormId, PlacedControl, PropertyValue, Section};

/// Builds the exported form document.
///
/// `sections` lists each section with its controls in position order;
/// `answers_schema` is a JSON Schema with one property per control.
pub fn form_document(form_id: &FormId, sections: &[Section], controls: &[PlacedControl]) -> Value {
    let mut ordered_sections: Vec<&Section> = sections.iter().collect();
    ordered_sections.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));

    let section_values: Vec<Value> = ordered_sections
        .iter()
        .map(|section| {
            let mut members: Vec<&PlacedControl> = controls
                .iter()
                .filter(|control| control.section_id == section.id)
                .collect();
            members.sort_by_key(|control| control.order_index);
            json!({
                "id": section.id,
                "name": section.name,
                "required": section.required,
                "controls": members.iter().map(|control| control_value(control)).collect::<Vec<_>>(),
            })
        })
        .collect();

    json!({
        "formId": form_id,
        "sections": section_values,
        "answers_schema": answers_schema(controls),
    })
}

pub fn answers_schema(controls: &[PlacedControl]) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for control in controls {
        properties.insert(
            control.id.to_string(),
            json!({
                "title": control.display_name,
                "type": json_type_for(&control.control_kind),
            }),
        );
        let is_required = control
            .properties
            .get("required")
            .and_then(PropertyValue::as_bool)
            .unwrap_or(false);
        if is_required {
            required.push(Value::String(control.id.to_string()));
        }
    }

    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

fn control_value(control: &PlacedControl) -> Value {
    json!({
        "id": control.id,
        "type": control.control_kind,
        "label": control.display_name,
        "order": control.order_index,
        "properties": control.properties,
    })
}

fn json_type_for(control_kind: &str) -> &'static str {
    match control_kind {
        "number" | "slider" | "rating" | "currency" => "number",
        "checkbox" | "toggle" | "switch" => "boolean",
        "multiselect" | "checkbox-group" | "tags" | "file" => "array",
        _ => "string",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::domain::{ControlId, ControlTemplate, SectionId};

    #[test]
    fn document_groups_controls_under_their_sections() {
        let sections = vec![
            Section {
                id: SectionId::from("extra"),
                name: "Extra".into(),
                order: 1,
                required: false,
            },
            Section::default_section(),
        ];
        let controls = vec![
            ControlTemplate::new("number", "Age")
                .with_property("required", PropertyValue::Bool(true))
                .instantiate(ControlId::from("age"), SectionId::default_section(), 1),
            ControlTemplate::new("text", "Name").instantiate(
                ControlId::from("name"),
                SectionId::default_section(),
                0,
            ),
            ControlTemplate::new("toggle", "Newsletter").instantiate(
                ControlId::from("news"),
                SectionId::from("extra"),
                0,
            ),
        ];

        let document = form_document(&FormId::from("signup"), &sections, &controls);

        assert_eq!(document["formId"], "signup");
        assert_eq!(document["sections"][0]["id"], "default");
        assert_eq!(document["sections"][0]["controls"][0]["id"], "name");
        assert_eq!(document["sections"][0]["controls"][1]["id"], "age");
        assert_eq!(document["sections"][1]["controls"][0]["type"], "toggle");
        assert_eq!(document["answers_schema"]["properties"]["age"]["type"], "number");
        assert_eq!(document["answers_schema"]["required"], json!(["age"]));
    }
}
