//! Bounded, self-deregistering observer registries.
//!
//! A registry holds a fixed number of closures per event source; each
//! delivery lets an observer ask for its own removal, and running out
//! of slots is a checked error rather than a panic. Used for the
//! bounded console logging taps on the sensor streams.

use core::fmt;

/// What an observer wants done with its registration after a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    Remove,
}

/// Slots available per registry.
pub const REGISTRY_CAPACITY: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryFull;

impl fmt::Display for RegistryFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer registry full ({} slots)", REGISTRY_CAPACITY)
    }
}

impl std::error::Error for RegistryFull {}

/// A fixed-capacity list of observers for events of type `E`.
pub struct Registry<E> {
    slots: heapless::Vec<Box<dyn FnMut(&E) -> Outcome + Send>, REGISTRY_CAPACITY>,
}

impl<E> Registry<E> {
    pub fn new() -> Self {
        Self {
            slots: heapless::Vec::new(),
        }
    }

    /// Register an observer. Fails when all slots are taken.
    pub fn add<F>(&mut self, observer: F) -> Result<(), RegistryFull>
    where
        F: FnMut(&E) -> Outcome + Send + 'static,
    {
        self.slots.push(Box::new(observer)).map_err(|_| RegistryFull)
    }

    /// Deliver an event to every observer, dropping those that ask to be
    /// removed.
    pub fn run(&mut self, event: &E) {
        let mut i = 0;

        while i < self.slots.len() {
            match (self.slots[i])(event) {
                Outcome::Continue => i += 1,
                Outcome::Remove => {
                    self.slots.remove(i);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl<E> Default for Registry<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_observers_run_until_removed() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut registry: Registry<u32> = Registry::new();

        let c = Arc::clone(&count);
        registry
            .add(move |_| {
                // One-shot observer.
                c.fetch_add(1, Ordering::Relaxed);
                Outcome::Remove
            })
            .unwrap();

        let c = Arc::clone(&count);
        registry
            .add(move |_| {
                c.fetch_add(1, Ordering::Relaxed);
                Outcome::Continue
            })
            .unwrap();

        registry.run(&0);
        registry.run(&0);
        assert_eq!(count.load(Ordering::Relaxed), 3);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_capacity_overflow_is_checked() {
        let mut registry: Registry<()> = Registry::new();

        for _ in 0..REGISTRY_CAPACITY {
            registry.add(|_| Outcome::Continue).unwrap();
        }

        assert_eq!(registry.add(|_| Outcome::Continue), Err(RegistryFull));
    }
}
