//! Observable values with explicit change notification.
//!
//! A [`Bindable`] holds one value and a list of typed observers. Setting a
//! different value runs every observer synchronously, in registration order,
//! and hands the change back to the caller so the owner can react without
//! re-entering itself from a callback.

use std::fmt;

/// Old and new value of a [`Bindable`] after a change.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueChanged<T> {
    pub old: T,
    pub new: T,
}

/// Handle returned by [`Bindable::observe`], used to remove the observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer<T> = Box<dyn FnMut(&ValueChanged<T>) + Send>;

/// A value with an on-change observer list.
pub struct Bindable<T> {
    value: T,
    observers: Vec<(ObserverId, Observer<T>)>,
    next_id: u64,
}

impl<T: Clone + PartialEq> Bindable<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            observers: Vec::new(),
            next_id: 0,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    /// Replace the value.
    ///
    /// Returns `None` without notifying anyone when `value` equals the
    /// current value.
    pub fn set(&mut self, value: T) -> Option<ValueChanged<T>> {
        if self.value == value {
            return None;
        }

        let old = std::mem::replace(&mut self.value, value);
        let change = ValueChanged {
            old,
            new: self.value.clone(),
        };
        for (_, observer) in &mut self.observers {
            observer(&change);
        }
        Some(change)
    }

    /// Mutate the value without notifying observers.
    pub fn edit_in_place<R>(&mut self, edit: impl FnOnce(&mut T) -> R) -> R {
        edit(&mut self.value)
    }

    /// Register an observer that runs after every change.
    pub fn observe(&mut self, observer: impl FnMut(&ValueChanged<T>) + Send + 'static) -> ObserverId {
        let id = ObserverId(self.next_id);
        self.next_id += 1;
        self.observers.push((id, Box::new(observer)));
        id
    }

    /// Remove an observer. Returns `false` if it was already removed.
    pub fn unobserve(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(observer_id, _)| *observer_id != id);
        self.observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Drop every observer.
    pub fn clear_observers(&mut self) {
        self.observers.clear();
    }
}

impl<T: fmt::Debug> fmt::Debug for Bindable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bindable")
            .field("value", &self.value)
            .field("observers", &self.observers.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn set_notifies_observers_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bindable = Bindable::new(1);

        let first = Arc::clone(&seen);
        bindable.observe(move |c: &ValueChanged<i32>| first.lock().unwrap().push(("a", c.old, c.new)));
        let second = Arc::clone(&seen);
        bindable.observe(move |c: &ValueChanged<i32>| second.lock().unwrap().push(("b", c.old, c.new)));

        let change = bindable.set(2).unwrap();
        assert_eq!(change, ValueChanged { old: 1, new: 2 });
        assert_eq!(*seen.lock().unwrap(), [("a", 1, 2), ("b", 1, 2)]);
    }

    #[test]
    fn equal_value_is_not_a_change() {
        let calls = Arc::new(Mutex::new(0));
        let mut bindable = Bindable::new("x".to_string());
        let counter = Arc::clone(&calls);
        bindable.observe(move |_| *counter.lock().unwrap() += 1);

        assert!(bindable.set("x".to_string()).is_none());
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[test]
    fn unobserve_is_idempotent() {
        let mut bindable = Bindable::new(0u8);
        let id = bindable.observe(|_| {});
        assert!(bindable.unobserve(id));
        assert!(!bindable.unobserve(id));
        assert_eq!(bindable.observer_count(), 0);
    }

    #[test]
    fn edit_in_place_is_silent() {
        let calls = Arc::new(Mutex::new(0));
        let mut bindable = Bindable::new(vec![1, 2]);
        let counter = Arc::clone(&calls);
        bindable.observe(move |_| *counter.lock().unwrap() += 1);

        bindable.edit_in_place(|v| v.push(3));
        assert_eq!(bindable.value(), &vec![1, 2, 3]);
        assert_eq!(*calls.lock().unwrap(), 0);
    }
}
