//! Pure list algorithms behind add/remove/move/reorder.
//!
//! Nothing here talks to a store; the manager computes the next state with
//! these helpers on a copy and only swaps it in once the store agrees.

use std::collections::HashMap;

use shared::domain::{MoveDirection, OrderChange, PlacedControl, Section, SectionId};

/// Sorts by section display order, then `order_index`.
///
/// Controls whose section is unknown sort after every known section.
pub fn sort_controls(controls: &mut [PlacedControl], sections: &[Section]) {
    let rank: HashMap<&SectionId, u32> = sections
        .iter()
        .map(|section| (&section.id, section.order))
        .collect();
    controls.sort_by(|a, b| {
        let rank_a = rank.get(&a.section_id).copied().unwrap_or(u32::MAX);
        let rank_b = rank.get(&b.section_id).copied().unwrap_or(u32::MAX);
        rank_a
            .cmp(&rank_b)
            .then_with(|| a.section_id.cmp(&b.section_id))
            .then_with(|| a.order_index.cmp(&b.order_index))
            .then_with(|| a.id.cmp(&b.id))
    });
}

pub fn section_len(controls: &[PlacedControl], section_id: &SectionId) -> u32 {
    let count = controls
        .iter()
        .filter(|control| &control.section_id == section_id)
        .count();
    u32::try_from(count).unwrap_or(u32::MAX)
}

/// Closes the gap left at `removed_index` in `section_id`.
///
/// Returns the new positions of every control that shifted.
pub fn compact_after_removal(
    controls: &mut [PlacedControl],
    section_id: &SectionId,
    removed_index: u32,
) -> Vec<OrderChange> {
    controls
        .iter_mut()
        .filter(|control| &control.section_id == section_id && control.order_index > removed_index)
        .map(|control| {
            control.order_index -= 1;
            OrderChange::from(&*control)
        })
        .collect()
}

/// Finds the same-section neighbour a control swaps with.
///
/// Returns `(control_position, neighbour_position)` as indexes into
/// `controls`, or `None` when the control already sits at the boundary.
pub fn adjacent_sibling(
    controls: &[PlacedControl],
    position: usize,
    direction: MoveDirection,
) -> Option<(usize, usize)> {
    let control = controls.get(position)?;
    let target_index = match direction {
        MoveDirection::Up => control.order_index.checked_sub(1)?,
        MoveDirection::Down => control.order_index.checked_add(1)?,
    };
    controls
        .iter()
        .position(|other| {
            other.section_id == control.section_id && other.order_index == target_index
        })
        .map(|neighbour| (position, neighbour))
}

/// Moves the element at `from` to `to` within the flattened list.
///
/// The moved control takes the section of the control it was dropped onto,
/// so a drag across a section boundary reassigns it. Positions are then
/// renumbered per section in flattened order.
pub fn move_in_list(controls: &mut Vec<PlacedControl>, from: usize, to: usize) {
    if from == to || from >= controls.len() || to >= controls.len() {
        return;
    }
    let moved = controls.remove(from);
    controls.insert(to, moved);

    let displaced = if from < to { to - 1 } else { to + 1 };
    let target_section = controls[displaced].section_id.clone();
    controls[to].section_id = target_section;

    renumber_per_section(controls);
}

/// Assigns `0..N-1` per section following the current list order.
pub fn renumber_per_section(controls: &mut [PlacedControl]) {
    let mut next: HashMap<SectionId, u32> = HashMap::new();
    for control in controls.iter_mut() {
        let slot = next.entry(control.section_id.clone()).or_insert(0);
        control.order_index = *slot;
        *slot += 1;
    }
}

/// True when every section's indexes are exactly `0..N-1`.
pub fn is_contiguous(controls: &[PlacedControl]) -> bool {
    let mut by_section: HashMap<&SectionId, Vec<u32>> = HashMap::new();
    for control in controls {
        by_section
            .entry(&control.section_id)
            .or_default()
            .push(control.order_index);
    }
    by_section.into_values().all(|mut indexes| {
        indexes.sort_unstable();
        indexes
            .iter()
            .enumerate()
            .all(|(expected, actual)| u32::try_from(expected).ok() == Some(*actual))
    })
}
