//! Fixed-capacity handle arenas for sessions and find lists.
//!
//! Handles are drawn from a monotone counter the caller shares across
//! arenas, so a session handle can never collide with a find-list handle
//! and a freed handle is never reissued — a stale handle deterministically
//! fails lookup instead of aliasing a newer object.

use crate::error::Result;
use crate::InstrumentError;

struct Slot<T> {
    handle: u32,
    value: T,
}

pub(crate) struct Arena<T> {
    slots: Vec<Option<Slot<T>>>,
}

impl<T> Arena<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots }
    }

    /// Place `value` in a free slot, assigning it the next handle from
    /// `counter`.
    ///
    /// # Errors
    /// [`InstrumentError::AllocationFailure`] when every slot is in use.
    pub(crate) fn insert(&mut self, counter: &mut u32, value: T) -> Result<u32> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or(InstrumentError::AllocationFailure)?;
        let handle = *counter;
        *counter = counter.wrapping_add(1);
        *slot = Some(Slot { handle, value });
        Ok(handle)
    }

    pub(crate) fn get(&self, handle: u32) -> Option<&T> {
        self.slots
            .iter()
            .flatten()
            .find(|s| s.handle == handle)
            .map(|s| &s.value)
    }

    pub(crate) fn get_mut(&mut self, handle: u32) -> Option<&mut T> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|s| s.handle == handle)
            .map(|s| &mut s.value)
    }

    /// Free the slot owning `handle`, returning its value. The handle
    /// integer is retired permanently.
    pub(crate) fn remove(&mut self, handle: u32) -> Option<T> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.as_ref().is_some_and(|s| s.handle == handle))?;
        slot.take().map(|s| s.value)
    }
}

#[cfg(test)]
mod unit {
    use super::Arena;
    use crate::InstrumentError;

    #[test]
    fn handles_increase_and_are_never_reissued() {
        let mut arena: Arena<&str> = Arena::new(4);
        let mut counter = 1u32;

        let a = arena.insert(&mut counter, "a").unwrap();
        let b = arena.insert(&mut counter, "b").unwrap();
        assert_eq!((a, b), (1, 2));

        arena.remove(a).unwrap();
        let c = arena.insert(&mut counter, "c").unwrap();
        assert_eq!(c, 3, "freed slots must get fresh handles");
        assert!(arena.get(a).is_none(), "stale handles must fail lookup");
        assert_eq!(arena.get(c), Some(&"c"));
    }

    #[test]
    fn two_arenas_share_one_handle_space() {
        let mut sessions: Arena<&str> = Arena::new(2);
        let mut lists: Arena<u32> = Arena::new(2);
        let mut counter = 1u32;

        let s = sessions.insert(&mut counter, "session").unwrap();
        let l = lists.insert(&mut counter, 42).unwrap();
        assert_ne!(s, l);
        assert!(sessions.get(l).is_none());
        assert!(lists.get(s).is_none());
    }

    #[test]
    fn exhaustion_is_an_allocation_failure() {
        let mut arena: Arena<u8> = Arena::new(2);
        let mut counter = 1u32;
        arena.insert(&mut counter, 0).unwrap();
        arena.insert(&mut counter, 1).unwrap();
        assert!(matches!(
            arena.insert(&mut counter, 2),
            Err(InstrumentError::AllocationFailure)
        ));
    }

    #[test]
    fn remove_returns_the_value_once() {
        let mut arena: Arena<String> = Arena::new(2);
        let mut counter = 1u32;
        let h = arena.insert(&mut counter, "x".to_string()).unwrap();
        assert_eq!(arena.remove(h), Some("x".to_string()));
        assert_eq!(arena.remove(h), None);
    }
}
