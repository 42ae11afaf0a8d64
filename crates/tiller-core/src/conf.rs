//! Typed per-module configuration table
//!
//! Each cycle owns one table with a slot per registered module. Slots hold
//! heterogeneous values behind [`ConfValue`] and are read back through
//! typed downcast accessors, preserving the once-per-slot invariant
//! without untyped pointers.

use crate::ids::CtxSlot;
use std::any::Any;

/// One module's per-cycle configuration object.
pub type ConfValue = Box<dyn Any + Send + Sync>;

/// The per-cycle configuration table, indexed by context slot.
///
/// Sized once at build start (one slot per registered module) and never
/// resized. Mutation is only possible while the owning cycle is still
/// under construction; committed cycles hand out shared references.
#[derive(Default)]
pub struct ConfTable {
    slots: Vec<Option<ConfValue>>,
}

impl std::fmt::Debug for ConfTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfTable")
            .field("slots", &self.slots.len())
            .field(
                "occupied",
                &self.slots.iter().filter(|s| s.is_some()).count(),
            )
            .finish()
    }
}

impl ConfTable {
    /// Create a table with `slots` empty slots.
    pub fn with_slots(slots: usize) -> Self {
        let mut table = Vec::with_capacity(slots);
        table.resize_with(slots, || None);
        Self { slots: table }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the table has no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Store a value in `slot`, replacing any previous occupant.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is out of range; slot indices come from the
    /// registry and are valid by construction.
    pub fn set(&mut self, slot: CtxSlot, value: ConfValue) {
        self.slots[slot.0] = Some(value);
    }

    /// Whether `slot` holds a value.
    pub fn is_set(&self, slot: CtxSlot) -> bool {
        self.slots.get(slot.0).map_or(false, Option::is_some)
    }

    /// Typed read access to `slot`.
    ///
    /// Returns `None` if the slot is empty or holds a different type.
    pub fn get<T: Any>(&self, slot: CtxSlot) -> Option<&T> {
        self.slots
            .get(slot.0)
            .and_then(Option::as_ref)
            .and_then(|v| v.downcast_ref::<T>())
    }

    /// Typed mutable access to `slot`, for use during the build only.
    pub fn get_mut<T: Any>(&mut self, slot: CtxSlot) -> Option<&mut T> {
        self.slots
            .get_mut(slot.0)
            .and_then(Option::as_mut)
            .and_then(|v| v.downcast_mut::<T>())
    }
}
