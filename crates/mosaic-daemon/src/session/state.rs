//! The placement table.
//!
//! Guarded by a std mutex: every operation is a short synchronous
//! check-and-update, so handles can release from `Drop`.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use super::types::{Placement, PlacementError};

#[allow(clippy::cast_possible_truncation)]
fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Default)]
pub(crate) struct PlacementTable {
    entries: HashMap<String, Placement>,
    next_sequence: u64,
}

impl PlacementTable {
    const fn bump(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    /// Take another reference on an existing placement.
    pub(crate) fn retain(&mut self, model_id: &str) -> Option<Placement> {
        let sequence = self.bump();
        let entry = self.entries.get_mut(model_id)?;
        entry.ref_count += 1;
        entry.acquired_at_ms = unix_millis();
        entry.sequence = sequence;
        Some(entry.clone())
    }

    /// Record a freshly committed placement holding one reference.
    pub(crate) fn insert(&mut self, model_id: &str, device_id: &str, capacity: u64) -> Placement {
        let placement = Placement {
            model_id: model_id.to_string(),
            device_id: device_id.to_string(),
            capacity_reserved: capacity,
            acquired_at_ms: unix_millis(),
            sequence: self.bump(),
            ref_count: 1,
        };
        self.entries
            .insert(model_id.to_string(), placement.clone());
        placement
    }

    /// Drop one reference. The placement stays resident at zero.
    pub(crate) fn release(&mut self, model_id: &str) -> Result<usize, PlacementError> {
        match self.entries.get_mut(model_id) {
            Some(entry) if entry.ref_count > 0 => {
                entry.ref_count -= 1;
                Ok(entry.ref_count)
            }
            _ => Err(PlacementError::NotHeld {
                model_id: model_id.to_string(),
            }),
        }
    }

    /// Idle placements, oldest acquisition first.
    pub(crate) fn idle_oldest_first(&self) -> Vec<Placement> {
        let mut idle: Vec<Placement> = self
            .entries
            .values()
            .filter(|p| p.ref_count == 0)
            .cloned()
            .collect();
        idle.sort_by_key(|p| p.sequence);
        idle
    }

    /// Remove a placement only if it is still idle.
    pub(crate) fn take_if_idle(&mut self, model_id: &str) -> Option<Placement> {
        if self.entries.get(model_id)?.ref_count != 0 {
            return None;
        }
        self.entries.remove(model_id)
    }

    pub(crate) fn get(&self, model_id: &str) -> Option<&Placement> {
        self.entries.get(model_id)
    }

    pub(crate) fn list(&self) -> Vec<Placement> {
        let mut all: Vec<Placement> = self.entries.values().cloned().collect();
        all.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        all
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn retain_refreshes_order() {
        let mut table = PlacementTable::default();
        table.insert("a", "gpu0", 4);
        table.insert("b", "gpu0", 4);
        table.release("a").unwrap();
        table.release("b").unwrap();

        let order: Vec<String> = table
            .idle_oldest_first()
            .into_iter()
            .map(|p| p.model_id)
            .collect();
        assert_eq!(order, ["a", "b"]);

        table.retain("a").unwrap();
        table.release("a").unwrap();
        let order: Vec<String> = table
            .idle_oldest_first()
            .into_iter()
            .map(|p| p.model_id)
            .collect();
        assert_eq!(order, ["b", "a"]);
    }

    #[test]
    fn release_never_goes_negative() {
        let mut table = PlacementTable::default();
        table.insert("a", "gpu0", 4);
        assert_eq!(table.release("a").unwrap(), 0);
        assert!(matches!(
            table.release("a"),
            Err(PlacementError::NotHeld { .. })
        ));
        assert!(table.release("missing").is_err());
        assert_eq!(table.get("a").unwrap().ref_count, 0);
    }

    #[test]
    fn busy_placement_is_not_taken() {
        let mut table = PlacementTable::default();
        table.insert("a", "gpu0", 4);
        assert!(table.take_if_idle("a").is_none());
        table.release("a").unwrap();
        assert!(table.take_if_idle("a").is_some());
        assert!(table.get("a").is_none());
    }
}
