use rand::Rng;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::slot::Slot;

/// Upper bound (exclusive) of the partner bucketing tag.
pub const TEST_GROUP_RANGE: u8 = 100;

/// Registry handle shared by the components of one page.
pub type SharedRegistry = Rc<RefCell<SlotRegistry>>;

/// Live slots of a page, keyed by DOM id.
#[derive(Debug, Default)]
pub struct SlotRegistry {
    slots: HashMap<String, Slot>,
}

impl SlotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRegistry {
        Rc::new(RefCell::new(Self::new()))
    }

    /// Register a slot, returning whatever previously held its id.
    pub fn insert(&mut self, slot: Slot) -> Option<Slot> {
        self.slots.insert(slot.id.clone(), slot)
    }

    pub fn remove(&mut self, id: &str) -> Option<Slot> {
        self.slots.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&Slot> {
        self.slots.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut Slot> {
        self.slots.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slots.contains_key(id)
    }

    pub fn is_loaded(&self, id: &str) -> bool {
        self.slots.get(id).is_some_and(|s| s.is_rendered)
    }

    pub fn is_empty_slot(&self, id: &str) -> Option<bool> {
        self.slots.get(id).and_then(|s| s.is_empty)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Registered ids in sorted order.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.slots.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Pick a test group for `id`: the one it already holds when re-defined,
    /// otherwise a random value in `[0, 100)` not held by another live slot.
    pub fn allocate_test_group(&self, id: &str) -> u8 {
        if let Some(existing) = self.slots.get(id) {
            return existing.test_group;
        }
        let taken: Vec<u8> = self.slots.values().map(|s| s.test_group).collect();
        let free: Vec<u8> = (0..TEST_GROUP_RANGE)
            .filter(|g| !taken.contains(g))
            .collect();
        let mut rng = rand::thread_rng();
        if free.is_empty() {
            rng.gen_range(0..TEST_GROUP_RANGE)
        } else {
            free[rng.gen_range(0..free.len())]
        }
    }
}
