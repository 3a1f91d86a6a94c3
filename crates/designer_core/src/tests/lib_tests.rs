use super::*;
use async_trait::async_trait;
use shared::{
    domain::{PropertyValue, SectionPatch},
    protocol::ImportRecord,
};
use std::sync::Mutex;
use tokio::sync::Notify;

#[derive(Default)]
struct FakeStore {
    controls: Vec<(FormId, PlacedControl)>,
    sections: Vec<(FormId, Section)>,
    calls: Vec<String>,
    update_calls: usize,
}

/// In-memory gateway that records every call and can be told to fail.
#[derive(Default)]
pub(crate) struct RecordingGateway {
    store: Mutex<FakeStore>,
    fail_insert: Mutex<bool>,
    fail_update_from: Mutex<Option<usize>>,
    fail_delete: Mutex<bool>,
    fail_bulk_reorder: Mutex<bool>,
    fail_list: Mutex<bool>,
    list_gate: Option<(Arc<Notify>, Arc<Notify>)>,
}

impl RecordingGateway {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `list` signals `started` and then waits for `release`.
    pub(crate) fn gated(started: Arc<Notify>, release: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            list_gate: Some((started, release)),
            ..Self::default()
        })
    }

    pub(crate) fn seed(&self, form_id: &str, control: PlacedControl) {
        self.store
            .lock()
            .expect("store lock")
            .controls
            .push((FormId::from(form_id), control));
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.store.lock().expect("store lock").calls.clone()
    }

    fn clear_calls(&self) {
        self.store.lock().expect("store lock").calls.clear();
    }

    fn stored(&self, form_id: &str) -> Vec<PlacedControl> {
        let form_id = FormId::from(form_id);
        self.store
            .lock()
            .expect("store lock")
            .controls
            .iter()
            .filter(|(form, _)| form == &form_id)
            .map(|(_, control)| control.clone())
            .collect()
    }

    fn fail_inserts(&self) {
        *self.fail_insert.lock().expect("flag lock") = true;
    }

    /// Zero-based: `0` fails every update, `1` lets the first one through.
    fn fail_updates_from(&self, call: usize) {
        *self.fail_update_from.lock().expect("flag lock") = Some(call);
    }

    fn fail_deletes(&self) {
        *self.fail_delete.lock().expect("flag lock") = true;
    }

    fn fail_bulk_reorders(&self) {
        *self.fail_bulk_reorder.lock().expect("flag lock") = true;
    }

    fn fail_lists(&self) {
        *self.fail_list.lock().expect("flag lock") = true;
    }

    fn record(&self, call: String) {
        self.store.lock().expect("store lock").calls.push(call);
    }
}

#[async_trait]
impl PersistenceGateway for RecordingGateway {
    async fn list(&self, form_id: &FormId) -> Result<Vec<PlacedControl>, StoreError> {
        self.record(format!("list:{form_id}"));
        if let Some((started, release)) = &self.list_gate {
            started.notify_one();
            release.notified().await;
        }
        if *self.fail_list.lock().expect("flag lock") {
            return Err(StoreError::backend("list unavailable"));
        }
        Ok(self.stored(form_id.as_str()))
    }

    async fn insert(&self, control: &PlacedControl, form_id: &FormId) -> Result<(), StoreError> {
        self.record(format!("insert:{}", control.id));
        if *self.fail_insert.lock().expect("flag lock") {
            return Err(StoreError::backend("insert unavailable"));
        }
        let mut store = self.store.lock().expect("store lock");
        if store.controls.iter().any(|(_, c)| c.id == control.id) {
            return Err(StoreError::constraint("duplicate control id"));
        }
        store.controls.push((form_id.clone(), control.clone()));
        Ok(())
    }

    async fn update(&self, id: &ControlId, patch: &ControlPatch) -> Result<(), StoreError> {
        self.record(format!("update:{id}"));
        let mut store = self.store.lock().expect("store lock");
        let call = store.update_calls;
        store.update_calls += 1;
        if self
            .fail_update_from
            .lock()
            .expect("flag lock")
            .is_some_and(|from| call >= from)
        {
            return Err(StoreError::backend("update unavailable"));
        }
        let (_, control) = store
            .controls
            .iter_mut()
            .find(|(_, c)| &c.id == id)
            .ok_or_else(|| StoreError::not_found("control", id.as_str()))?;
        patch.apply_to(control);
        Ok(())
    }

    async fn delete(&self, id: &ControlId) -> Result<(), StoreError> {
        self.record(format!("delete:{id}"));
        if *self.fail_delete.lock().expect("flag lock") {
            return Err(StoreError::backend("delete unavailable"));
        }
        let mut store = self.store.lock().expect("store lock");
        let before = store.controls.len();
        store.controls.retain(|(_, c)| &c.id != id);
        if store.controls.len() == before {
            return Err(StoreError::not_found("control", id.as_str()));
        }
        Ok(())
    }

    async fn bulk_reorder(&self, changes: &[OrderChange]) -> Result<(), StoreError> {
        self.record(format!("bulk_reorder:{}", changes.len()));
        if *self.fail_bulk_reorder.lock().expect("flag lock") {
            return Err(StoreError::backend("reorder unavailable"));
        }
        let mut store = self.store.lock().expect("store lock");
        if let Some(missing) = changes
            .iter()
            .find(|change| !store.controls.iter().any(|(_, c)| c.id == change.id))
        {
            return Err(StoreError::not_found("control", missing.id.as_str()));
        }
        for change in changes {
            if let Some((_, control)) = store.controls.iter_mut().find(|(_, c)| c.id == change.id)
            {
                control.section_id = change.section_id.clone();
                control.order_index = change.order_index;
            }
        }
        Ok(())
    }

    async fn list_sections(&self, form_id: &FormId) -> Result<Vec<Section>, StoreError> {
        self.record(format!("list_sections:{form_id}"));
        Ok(self
            .store
            .lock()
            .expect("store lock")
            .sections
            .iter()
            .filter(|(form, _)| form == form_id)
            .map(|(_, section)| section.clone())
            .collect())
    }

    async fn insert_section(&self, section: &Section, form_id: &FormId) -> Result<(), StoreError> {
        self.record(format!("insert_section:{}", section.id));
        let mut store = self.store.lock().expect("store lock");
        if store
            .sections
            .iter()
            .any(|(form, s)| form == form_id && s.id == section.id)
        {
            return Err(StoreError::constraint("duplicate section id"));
        }
        store.sections.push((form_id.clone(), section.clone()));
        Ok(())
    }

    async fn update_section(
        &self,
        form_id: &FormId,
        id: &SectionId,
        patch: &SectionPatch,
    ) -> Result<(), StoreError> {
        self.record(format!("update_section:{id}"));
        let mut store = self.store.lock().expect("store lock");
        let (_, section) = store
            .sections
            .iter_mut()
            .find(|(form, s)| form == form_id && &s.id == id)
            .ok_or_else(|| StoreError::not_found("section", id.as_str()))?;
        patch.apply_to(section);
        Ok(())
    }

    async fn delete_section(&self, form_id: &FormId, id: &SectionId) -> Result<(), StoreError> {
        self.record(format!("delete_section:{id}"));
        self.store
            .lock()
            .expect("store lock")
            .sections
            .retain(|(form, s)| !(form == form_id && &s.id == id));
        Ok(())
    }
}

const FORM: &str = "form-1";

async fn loaded_manager(gateway: &Arc<RecordingGateway>) -> ControlListManager {
    let dyn_gateway: Arc<dyn PersistenceGateway> = gateway.clone();
    let mut manager = ControlListManager::new(dyn_gateway, FormId::from(FORM));
    manager.load(FormId::from(FORM)).await;
    gateway.clear_calls();
    manager
}

fn text(name: &str) -> ControlTemplate {
    ControlTemplate::new("text", name)
}

fn names(manager: &ControlListManager) -> Vec<&str> {
    manager
        .controls()
        .iter()
        .map(|control| control.display_name.as_str())
        .collect()
}

fn indexes(manager: &ControlListManager) -> Vec<u32> {
    manager
        .controls()
        .iter()
        .map(|control| control.order_index)
        .collect()
}

fn id_of(manager: &ControlListManager, name: &str) -> ControlId {
    manager
        .controls()
        .iter()
        .find(|control| control.display_name == name)
        .map(|control| control.id.clone())
        .expect("control by name")
}

async fn with_controls(gateway: &Arc<RecordingGateway>, count: usize) -> ControlListManager {
    let mut manager = loaded_manager(gateway).await;
    for n in 0..count {
        manager
            .add(&text(&format!("c{n}")), &SectionId::default_section())
            .await
            .expect("add");
    }
    gateway.clear_calls();
    manager
}

#[tokio::test]
async fn add_add_move_up_swaps_through_two_store_updates() {
    let gateway = RecordingGateway::new();
    let mut manager = loaded_manager(&gateway).await;
    assert!(manager.controls().is_empty());

    let a = manager
        .add(&text("A"), &SectionId::default_section())
        .await
        .expect("add A");
    let b = manager
        .add(&text("B"), &SectionId::default_section())
        .await
        .expect("add B");
    let outcome = manager
        .move_control(&b, MoveDirection::Up)
        .await
        .expect("move");

    assert_eq!(outcome, MoveOutcome::Moved);
    assert_eq!(names(&manager), vec!["B", "A"]);
    assert_eq!(indexes(&manager), vec![0, 1]);
    let updates: Vec<String> = gateway
        .calls()
        .into_iter()
        .filter(|call| call.starts_with("update:"))
        .collect();
    assert_eq!(updates, vec![format!("update:{b}"), format!("update:{a}")]);

    let mut stored = gateway.stored(FORM);
    stored.sort_by_key(|control| control.order_index);
    assert_eq!(stored[0].id, b);
    assert_eq!(stored[1].id, a);
}

#[tokio::test]
async fn add_selects_new_control_at_end_of_section() {
    let gateway = RecordingGateway::new();
    let mut manager = with_controls(&gateway, 2).await;

    let id = manager
        .add(
            &text("third").with_property("required", PropertyValue::Bool(true)),
            &SectionId::default_section(),
        )
        .await
        .expect("add");

    let selected = manager.selected().expect("selected");
    assert_eq!(selected.id, id);
    assert_eq!(selected.order_index, 2);
    assert_eq!(
        selected.properties.get("required"),
        Some(&PropertyValue::Bool(true))
    );
}

#[tokio::test]
async fn add_into_unknown_section_is_rejected_before_the_store() {
    let gateway = RecordingGateway::new();
    let mut manager = loaded_manager(&gateway).await;

    let err = manager
        .add(&text("A"), &SectionId::from("nowhere"))
        .await
        .expect_err("unknown section");

    assert!(matches!(err, ManagerError::UnknownSection(_)));
    assert!(gateway.calls().is_empty());
}

#[tokio::test]
async fn failed_insert_leaves_list_untouched() {
    let gateway = RecordingGateway::new();
    let mut manager = with_controls(&gateway, 2).await;
    let before = manager.controls().to_vec();
    gateway.fail_inserts();

    let err = manager
        .add(&text("lost"), &SectionId::default_section())
        .await
        .expect_err("insert fails");

    assert!(matches!(err, ManagerError::Store(StoreError::Backend { .. })));
    assert_eq!(manager.controls(), before.as_slice());
}

#[tokio::test]
async fn failed_update_leaves_list_untouched() {
    let gateway = RecordingGateway::new();
    let mut manager = with_controls(&gateway, 2).await;
    let before = manager.controls().to_vec();
    let id = before[0].id.clone();
    gateway.fail_updates_from(0);

    let patch = ControlPatch {
        display_name: Some("renamed".into()),
        ..ControlPatch::default()
    };
    manager.update(&id, patch).await.expect_err("update fails");

    assert_eq!(manager.controls(), before.as_slice());
}

#[tokio::test]
async fn failed_delete_leaves_list_untouched() {
    let gateway = RecordingGateway::new();
    let mut manager = with_controls(&gateway, 3).await;
    let before = manager.controls().to_vec();
    gateway.fail_deletes();

    manager
        .remove(&before[1].id)
        .await
        .expect_err("delete fails");

    assert_eq!(manager.controls(), before.as_slice());
    assert!(!gateway.calls().iter().any(|c| c.starts_with("bulk_reorder")));
}

#[tokio::test]
async fn update_merges_properties_and_ignores_caller_positions() {
    let gateway = RecordingGateway::new();
    let mut manager = with_controls(&gateway, 2).await;
    let id = manager.controls()[0].id.clone();

    let mut patch = ControlPatch::property("placeholder", PropertyValue::Text("Your name".into()));
    patch.order_index = Some(7);
    manager.update(&id, patch).await.expect("update");

    let control = &manager.controls()[0];
    assert_eq!(control.id, id);
    assert_eq!(control.order_index, 0);
    assert_eq!(
        control.properties.get("placeholder"),
        Some(&PropertyValue::Text("Your name".into()))
    );
    assert!(ordering::is_contiguous(manager.controls()));
}

#[tokio::test]
async fn update_into_other_section_appends_and_compacts() {
    let gateway = RecordingGateway::new();
    let mut manager = with_controls(&gateway, 3).await;
    let extra = manager.add_section("Extra", false).await.expect("section");
    manager.add(&text("x0"), &extra).await.expect("add");
    let moving = id_of(&manager, "c0");

    manager
        .update(
            &moving,
            ControlPatch {
                section_id: Some(extra.clone()),
                ..ControlPatch::default()
            },
        )
        .await
        .expect("relocate");

    let moved = manager
        .controls()
        .iter()
        .find(|control| control.id == moving)
        .expect("moved control");
    assert_eq!(moved.section_id, extra);
    assert_eq!(moved.order_index, 1);
    assert_eq!(names(&manager), vec!["c1", "c2", "x0", "c0"]);
    assert!(ordering::is_contiguous(manager.controls()));
    assert!(gateway.calls().iter().any(|c| c == "bulk_reorder:2"));
}

#[tokio::test]
async fn remove_compacts_remaining_positions_in_order() {
    let gateway = RecordingGateway::new();
    let mut manager = with_controls(&gateway, 4).await;
    assert_eq!(indexes(&manager), vec![0, 1, 2, 3]);
    let target = manager.controls()[1].id.clone();
    manager.select(&target).expect("select");

    manager.remove(&target).await.expect("remove");

    assert_eq!(names(&manager), vec!["c0", "c2", "c3"]);
    assert_eq!(indexes(&manager), vec![0, 1, 2]);
    assert!(manager.selected().is_none());
    let mut stored: Vec<(String, u32)> = gateway
        .stored(FORM)
        .into_iter()
        .map(|control| (control.display_name, control.order_index))
        .collect();
    stored.sort_by_key(|(_, index)| *index);
    assert_eq!(
        stored,
        vec![("c0".into(), 0), ("c2".into(), 1), ("c3".into(), 2)]
    );
}

#[tokio::test]
async fn remove_reloads_when_compaction_is_rejected() {
    let gateway = RecordingGateway::new();
    let mut manager = with_controls(&gateway, 3).await;
    let target = manager.controls()[0].id.clone();
    gateway.fail_bulk_reorders();

    manager.remove(&target).await.expect_err("partial failure");

    assert_eq!(names(&manager), vec!["c1", "c2"]);
    assert!(gateway.calls().iter().any(|c| c.starts_with("list:")));
}

#[tokio::test]
async fn move_at_section_boundary_is_a_no_op() {
    let gateway = RecordingGateway::new();
    let mut manager = with_controls(&gateway, 3).await;
    let first = manager.controls()[0].id.clone();
    let last = manager.controls()[2].id.clone();

    let up = manager
        .move_control(&first, MoveDirection::Up)
        .await
        .expect("move up");
    let down = manager
        .move_control(&last, MoveDirection::Down)
        .await
        .expect("move down");

    assert_eq!(up, MoveOutcome::AtBoundary);
    assert_eq!(down, MoveOutcome::AtBoundary);
    assert_eq!(indexes(&manager), vec![0, 1, 2]);
    assert!(gateway.calls().is_empty());
}

#[tokio::test]
async fn move_does_not_cross_into_neighbouring_section() {
    let gateway = RecordingGateway::new();
    let mut manager = with_controls(&gateway, 1).await;
    let extra = manager.add_section("Extra", false).await.expect("section");
    let x0 = manager.add(&text("x0"), &extra).await.expect("add");

    let outcome = manager
        .move_control(&x0, MoveDirection::Up)
        .await
        .expect("move");

    assert_eq!(outcome, MoveOutcome::AtBoundary);
    assert_eq!(names(&manager), vec!["c0", "x0"]);
}

#[tokio::test]
async fn move_reverts_first_update_when_second_fails() {
    let gateway = RecordingGateway::new();
    let mut manager = with_controls(&gateway, 2).await;
    let before = manager.controls().to_vec();
    gateway.fail_updates_from(1);

    manager
        .move_control(&before[1].id, MoveDirection::Up)
        .await
        .expect_err("second half fails");

    assert_eq!(manager.controls(), before.as_slice());
    assert_eq!(
        gateway
            .calls()
            .iter()
            .filter(|c| c.starts_with("update:"))
            .count(),
        3
    );
}

#[tokio::test]
async fn reorder_onto_itself_changes_nothing() {
    let gateway = RecordingGateway::new();
    let mut manager = with_controls(&gateway, 3).await;
    let before = manager.controls().to_vec();

    manager.reorder(1, 1).await.expect("no-op reorder");

    assert_eq!(manager.controls(), before.as_slice());
    assert!(gateway.calls().is_empty());
}

#[tokio::test]
async fn reorder_rejects_out_of_range_positions() {
    let gateway = RecordingGateway::new();
    let mut manager = with_controls(&gateway, 2).await;

    let err = manager.reorder(0, 5).await.expect_err("out of range");

    assert!(matches!(err, ManagerError::InvalidIndex { index: 5, len: 2 }));
}

#[tokio::test]
async fn reorder_within_section_renumbers_in_one_bulk_call() {
    let gateway = RecordingGateway::new();
    let mut manager = with_controls(&gateway, 4).await;

    manager.reorder(0, 2).await.expect("reorder");

    assert_eq!(names(&manager), vec!["c1", "c2", "c0", "c3"]);
    assert_eq!(indexes(&manager), vec![0, 1, 2, 3]);
    assert_eq!(gateway.calls(), vec!["bulk_reorder:4".to_string()]);
}

#[tokio::test]
async fn reorder_onto_another_section_adopts_that_section() {
    let gateway = RecordingGateway::new();
    let mut manager = with_controls(&gateway, 2).await;
    let extra = manager.add_section("Extra", false).await.expect("section");
    manager.add(&text("x0"), &extra).await.expect("add x0");
    manager.add(&text("x1"), &extra).await.expect("add x1");
    assert_eq!(names(&manager), vec!["c0", "c1", "x0", "x1"]);

    manager.reorder(0, 2).await.expect("cross-section drop");

    let c0 = manager
        .controls()
        .iter()
        .find(|control| control.display_name == "c0")
        .expect("c0");
    assert_eq!(c0.section_id, extra);
    assert!(ordering::is_contiguous(manager.controls()));
    assert_eq!(ordering::section_len(manager.controls(), &extra), 3);
}

#[tokio::test]
async fn failed_reorder_leaves_list_untouched() {
    let gateway = RecordingGateway::new();
    let mut manager = with_controls(&gateway, 3).await;
    let before = manager.controls().to_vec();
    gateway.fail_bulk_reorders();

    manager.reorder(2, 0).await.expect_err("reorder fails");

    assert_eq!(manager.controls(), before.as_slice());
}

#[tokio::test]
async fn positions_stay_contiguous_through_mixed_operations() {
    let gateway = RecordingGateway::new();
    let mut manager = with_controls(&gateway, 3).await;
    let extra = manager.add_section("Extra", false).await.expect("section");
    for n in 0..3 {
        manager
            .add(&text(&format!("x{n}")), &extra)
            .await
            .expect("add");
    }
    assert!(ordering::is_contiguous(manager.controls()));

    let c1 = id_of(&manager, "c1");
    manager
        .move_control(&c1, MoveDirection::Down)
        .await
        .expect("move");
    assert!(ordering::is_contiguous(manager.controls()));

    manager.reorder(4, 0).await.expect("reorder");
    assert!(ordering::is_contiguous(manager.controls()));

    manager.reorder(1, 5).await.expect("reorder");
    assert!(ordering::is_contiguous(manager.controls()));

    let x2 = id_of(&manager, "x2");
    manager.remove(&x2).await.expect("remove");
    assert!(ordering::is_contiguous(manager.controls()));

    let c0 = id_of(&manager, "c0");
    manager
        .update(
            &c0,
            ControlPatch {
                section_id: Some(extra.clone()),
                ..ControlPatch::default()
            },
        )
        .await
        .expect("relocate");
    assert!(ordering::is_contiguous(manager.controls()));

    manager.reload().await;
    assert!(ordering::is_contiguous(manager.controls()));
    assert_eq!(manager.controls().len(), 5);
}

#[test]
fn bulk_import_reports_invalid_records_and_renames_the_rest() {
    let gateway = RecordingGateway::new();
    let mut manager = ControlListManager::new(gateway.clone(), FormId::from(FORM));
    let records = vec![
        ImportRecord::new("x", "text", "A"),
        ImportRecord::new("y", "", "B"),
        ImportRecord {
            id: Some("z".into()),
            name: Some("C".into()),
            ..ImportRecord::default()
        },
    ];

    let report = manager.bulk_import(&records);

    assert_eq!(report.success, 1);
    assert_eq!(report.total, 3);
    assert_eq!(report.errors.len(), 2);
    assert!(report.errors[0].contains("'B'"), "{:?}", report.errors);
    assert!(report.errors[1].contains("'C'"), "{:?}", report.errors);
    assert_eq!(manager.controls().len(), 1);
    assert_eq!(manager.controls()[0].display_name, "A");
    assert_ne!(manager.controls()[0].id.as_str(), "x");
    assert!(manager.is_direct_mode());
    assert!(gateway.calls().is_empty());
}

#[test]
fn bulk_import_numbers_each_section_from_zero() {
    let gateway = RecordingGateway::new();
    let mut manager = ControlListManager::new(gateway, FormId::from(FORM));
    let records = vec![
        ImportRecord::new("a", "text", "A").in_section("s1"),
        ImportRecord::new("b", "text", "B").in_section("s1"),
        ImportRecord::new("c", "text", "C").in_section("s2"),
    ];

    manager.bulk_import(&records);

    let in_section = |section: &str| -> Vec<u32> {
        manager
            .controls()
            .iter()
            .filter(|control| control.section_id.as_str() == section)
            .map(|control| control.order_index)
            .collect()
    };
    assert_eq!(in_section("s1"), vec![0, 1]);
    assert_eq!(in_section("s2"), vec![0]);
    assert!(manager
        .sections()
        .iter()
        .any(|section| section.id.as_str() == "s2"));
}

#[tokio::test]
async fn ids_stay_unique_across_adds_and_repeated_imports() {
    let gateway = RecordingGateway::new();
    let mut manager = with_controls(&gateway, 3).await;
    let records: Vec<ImportRecord> = (0..20)
        .map(|n| ImportRecord::new("dup", "text", &format!("i{n}")))
        .collect();

    manager.bulk_import(&records);
    let first: Vec<ControlId> = manager.controls().iter().map(|c| c.id.clone()).collect();
    manager.bulk_import(&records);
    manager
        .add(&text("direct"), &SectionId::default_section())
        .await
        .expect("direct add");

    let mut ids: Vec<&ControlId> = manager.controls().iter().map(|c| &c.id).collect();
    let total = ids.len();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), total);
    assert!(manager.controls().iter().all(|c| !first.contains(&c.id)));
}

#[tokio::test]
async fn direct_mode_mutations_stay_in_memory() {
    let gateway = RecordingGateway::new();
    let mut manager = loaded_manager(&gateway).await;
    manager.bulk_import(&[
        ImportRecord::new("a", "text", "A"),
        ImportRecord::new("b", "text", "B"),
    ]);

    let b = id_of(&manager, "B");
    manager
        .move_control(&b, MoveDirection::Up)
        .await
        .expect("move");
    manager
        .add(&text("C"), &SectionId::default_section())
        .await
        .expect("add");
    let a = id_of(&manager, "A");
    manager.remove(&a).await.expect("remove");
    let loaded = manager.load(FormId::from(FORM)).await;

    assert_eq!(loaded, 2);
    assert_eq!(names(&manager), vec!["B", "C"]);
    assert!(gateway.calls().is_empty());
}

#[tokio::test]
async fn commit_inserts_batch_and_returns_to_persisted_mode() {
    let gateway = RecordingGateway::new();
    let mut manager = loaded_manager(&gateway).await;
    manager.bulk_import(&[
        ImportRecord::new("a", "text", "A").in_section("s1"),
        ImportRecord::new("b", "email", "B"),
        ImportRecord::new("c", "number", "C").in_section("s1"),
    ]);

    let report = manager.commit_to_store().await;

    assert_eq!(report.inserted, 3);
    assert_eq!(report.attempted, 3);
    assert!(report.errors.is_empty());
    assert!(report.drift.is_none());
    assert!(!manager.is_direct_mode());
    assert_eq!(gateway.stored(FORM).len(), 3);
    assert_eq!(manager.controls().len(), 3);
    assert!(manager
        .sections()
        .iter()
        .any(|section| section.id.as_str() == "s1"));
    assert!(gateway.calls().iter().any(|c| c == "insert_section:s1"));
}

#[tokio::test]
async fn commit_with_no_successful_insert_stays_in_direct_mode() {
    let gateway = RecordingGateway::new();
    let mut manager = loaded_manager(&gateway).await;
    manager.bulk_import(&[
        ImportRecord::new("a", "text", "A"),
        ImportRecord::new("b", "text", "B"),
    ]);
    gateway.fail_inserts();

    let report = manager.commit_to_store().await;

    assert_eq!(report.inserted, 0);
    assert_eq!(report.errors.len(), 2);
    assert!(manager.is_direct_mode());
    assert_eq!(manager.controls().len(), 2);
}

#[tokio::test]
async fn commit_resets_from_store_when_store_holds_extra_rows() {
    let gateway = RecordingGateway::new();
    for n in 0..3 {
        gateway.seed(
            FORM,
            text(&format!("old{n}")).instantiate(
                ControlId::new(format!("old{n}")),
                SectionId::default_section(),
                n,
            ),
        );
    }
    let dyn_gateway: Arc<dyn PersistenceGateway> = gateway.clone();
    let mut manager = ControlListManager::new(dyn_gateway, FormId::from(FORM));
    manager.bulk_import(&[
        ImportRecord::new("a", "text", "A"),
        ImportRecord::new("b", "text", "B"),
    ]);

    let report = manager.commit_to_store().await;

    let drift = report.drift.expect("drift detected");
    assert_eq!(drift.store_count, 5);
    assert_eq!(drift.memory_count, 2);
    assert_eq!(manager.controls().len(), 5);
    assert!(!manager.is_resetting());
    assert!(!manager.is_direct_mode());
}

#[tokio::test]
async fn consistency_check_needs_persisted_mode() {
    let gateway = RecordingGateway::new();
    let mut manager = loaded_manager(&gateway).await;
    manager.bulk_import(&[ImportRecord::new("a", "text", "A")]);

    let err = manager.check_consistency().await.expect_err("direct mode");

    assert!(matches!(err, ManagerError::DirectMode));
}

#[tokio::test]
async fn consistency_check_tolerates_small_drift_and_resets_on_large() {
    let gateway = RecordingGateway::new();
    let mut manager = loaded_manager(&gateway).await;
    for n in 0..2 {
        gateway.seed(
            FORM,
            text(&format!("ghost{n}")).instantiate(
                ControlId::new(format!("ghost{n}")),
                SectionId::default_section(),
                n,
            ),
        );
    }

    let within = manager.check_consistency().await.expect("check");
    assert!(within.drift.is_none());
    assert!(manager.controls().is_empty());

    gateway.seed(
        FORM,
        text("ghost2").instantiate(ControlId::from("ghost2"), SectionId::default_section(), 2),
    );
    let beyond = manager.check_consistency().await.expect("check");

    assert_eq!(beyond.store_count, 3);
    assert_eq!(beyond.memory_count, 0);
    assert!(beyond.drift.is_some());
    assert_eq!(manager.controls().len(), 3);
}

#[tokio::test]
async fn load_failure_shows_an_empty_form() {
    let gateway = RecordingGateway::new();
    let mut manager = with_controls(&gateway, 2).await;
    gateway.fail_lists();

    let loaded = manager.reload().await;

    assert_eq!(loaded, 0);
    assert!(manager.controls().is_empty());
    assert!(!manager.is_loading());
    assert_eq!(manager.sections(), &[Section::default_section()]);
}

#[tokio::test]
async fn load_switches_forms_and_drops_stale_selection() {
    let gateway = RecordingGateway::new();
    gateway.seed(
        "other",
        text("elsewhere").instantiate(ControlId::from("e1"), SectionId::default_section(), 0),
    );
    let mut manager = with_controls(&gateway, 1).await;
    let id = manager.controls()[0].id.clone();
    manager.select(&id).expect("select");

    manager.load(FormId::from("other")).await;

    assert_eq!(manager.form_id().as_str(), "other");
    assert_eq!(names(&manager), vec!["elsewhere"]);
    assert!(manager.selected().is_none());
}

#[tokio::test]
async fn selection_follows_updates() {
    let gateway = RecordingGateway::new();
    let mut manager = with_controls(&gateway, 2).await;
    let id = manager.controls()[1].id.clone();
    manager.select(&id).expect("select");

    manager
        .update(
            &id,
            ControlPatch {
                display_name: Some("renamed".into()),
                ..ControlPatch::default()
            },
        )
        .await
        .expect("update");

    assert_eq!(manager.selected().expect("selected").display_name, "renamed");
    assert!(matches!(
        manager.select(&ControlId::from("missing")),
        Err(ManagerError::UnknownControl(_))
    ));
    manager.clear_selection();
    assert!(manager.selected().is_none());
}

#[tokio::test]
async fn removing_a_section_moves_its_controls_to_the_default_section() {
    let gateway = RecordingGateway::new();
    let mut manager = with_controls(&gateway, 2).await;
    let extra = manager.add_section("Extra", true).await.expect("section");
    manager.add(&text("x0"), &extra).await.expect("add");
    manager.add(&text("x1"), &extra).await.expect("add");

    manager.remove_section(&extra).await.expect("remove section");

    assert_eq!(names(&manager), vec!["c0", "c1", "x0", "x1"]);
    assert_eq!(indexes(&manager), vec![0, 1, 2, 3]);
    assert!(manager
        .controls()
        .iter()
        .all(|control| control.section_id.is_default()));
    assert_eq!(manager.sections().len(), 1);
    assert!(gateway
        .calls()
        .iter()
        .any(|c| c == &format!("delete_section:{extra}")));
}

#[tokio::test]
async fn default_section_cannot_be_removed() {
    let gateway = RecordingGateway::new();
    let mut manager = loaded_manager(&gateway).await;

    let err = manager
        .remove_section(&SectionId::default_section())
        .await
        .expect_err("permanent");

    assert!(matches!(err, ManagerError::PermanentSection(_)));
}

#[tokio::test]
async fn renamed_section_survives_reload() {
    let gateway = RecordingGateway::new();
    let mut manager = loaded_manager(&gateway).await;
    let extra = manager.add_section("Extra", false).await.expect("section");

    manager
        .update_section(
            &extra,
            SectionPatch {
                name: Some("Contact".into()),
                ..SectionPatch::default()
            },
        )
        .await
        .expect("rename");
    manager.reload().await;

    let section = manager
        .sections()
        .iter()
        .find(|section| section.id == extra)
        .expect("section");
    assert_eq!(section.name, "Contact");
    assert!(manager.sections()[0].id.is_default());
}

#[tokio::test]
async fn load_adopts_sections_used_by_stored_controls() {
    let gateway = RecordingGateway::new();
    gateway.seed(
        FORM,
        text("Orphan").instantiate(ControlId::from("o1"), SectionId::from("s9"), 0),
    );
    let mut manager = loaded_manager(&gateway).await;

    assert!(manager
        .sections()
        .iter()
        .any(|section| section.id.as_str() == "s9"));
    let document = export::form_document(manager.form_id(), manager.sections(), manager.controls());
    assert_eq!(document["sections"][1]["id"], "s9");
    assert_eq!(document["sections"][1]["controls"][0]["id"], "o1");

    manager
        .add(&text("Sibling"), &SectionId::from("s9"))
        .await
        .expect("add into adopted section");
    assert_eq!(ordering::section_len(manager.controls(), &SectionId::from("s9")), 2);
}

#[tokio::test]
async fn commit_without_staged_import_is_a_no_op() {
    let gateway = RecordingGateway::new();
    let mut manager = with_controls(&gateway, 2).await;

    let report = manager.commit_to_store().await;

    assert_eq!(report, shared::protocol::CommitReport::default());
    assert!(gateway.calls().is_empty());
    assert_eq!(gateway.stored(FORM).len(), 2);
}

#[tokio::test]
async fn manager_publishes_activity_transitions() {
    let gateway = RecordingGateway::new();
    let mut manager = loaded_manager(&gateway).await;
    let mut activity = manager.subscribe_activity();
    activity.borrow_and_update();

    manager.nuclear_reset().await;

    assert!(activity.has_changed().expect("manager alive"));
    assert_eq!(*activity.borrow_and_update(), Activity::default());
}
